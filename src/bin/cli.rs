//! QuorumKV CLI Client
//!
//! Command-line interface for interacting with a QuorumKV node.

use clap::{Parser, Subcommand};
use quorumkv::network::Client;

/// QuorumKV CLI
#[derive(Parser, Debug)]
#[command(name = "quorumkv-cli")]
#[command(about = "CLI for the QuorumKV replicated key-value store")]
struct Args {
    /// Server address
    #[arg(short, long, default_value = "127.0.0.1:6379")]
    server: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Get a value by key
    Get {
        /// The key to get
        key: String,
    },

    /// Set a key-value pair
    Set {
        /// The key to set
        key: String,

        /// The value to set
        value: String,
    },

    /// Add a member to the cluster
    AddNode {
        /// Id of the new member
        id: u64,

        /// Raft address of the new member
        addr: String,
    },

    /// Remove a member from the cluster
    RemoveNode {
        /// Id of the member to remove
        id: u64,
    },

    /// Check whether the node is serving
    Health,
}

fn main() {
    let args = Args::parse();

    let mut client = match Client::connect(&args.server) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to connect to {}: {}", args.server, e);
            std::process::exit(1);
        }
    };

    let result = match args.command {
        Commands::Get { key } => client.get(&key).map(|value| match value {
            Some(v) => println!("{}", v),
            None => println!("(nil)"),
        }),
        Commands::Set { key, value } => client.set(&key, &value).map(|_| println!("OK")),
        Commands::AddNode { id, addr } => client.add_node(id, &addr).map(|_| println!("OK")),
        Commands::RemoveNode { id } => client.remove_node(id).map(|_| println!("OK")),
        Commands::Health => client.health().map(|serving| {
            println!("{}", if serving { "SERVING" } else { "NOT_SERVING" })
        }),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
