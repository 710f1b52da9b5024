//! Command definitions
//!
//! Requests a client can send to a replica.

/// Command types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CommandType {
    Get = 0x01,
    Set = 0x02,
    AddNode = 0x03,
    RemoveNode = 0x04,
    Health = 0x05,
}

impl CommandType {
    /// Parse a command byte
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(CommandType::Get),
            0x02 => Some(CommandType::Set),
            0x03 => Some(CommandType::AddNode),
            0x04 => Some(CommandType::RemoveNode),
            0x05 => Some(CommandType::Health),
            _ => None,
        }
    }
}

/// A parsed command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Read the applied value of a key
    Get { key: String },

    /// Propose a write (returns before it commits)
    Set { key: String, value: String },

    /// Propose adding a node reachable at `addr`
    AddNode { id: u64, addr: String },

    /// Propose removing a node
    RemoveNode { id: u64 },

    /// Liveness check
    Health,
}

impl Command {
    /// Get the command type
    pub fn command_type(&self) -> CommandType {
        match self {
            Command::Get { .. } => CommandType::Get,
            Command::Set { .. } => CommandType::Set,
            Command::AddNode { .. } => CommandType::AddNode,
            Command::RemoveNode { .. } => CommandType::RemoveNode,
            Command::Health => CommandType::Health,
        }
    }
}
