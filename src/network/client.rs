//! Blocking client for the service protocol

use std::io::{BufReader, BufWriter};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use crate::error::{QuorumError, Result};
use crate::protocol::{read_response, write_command, Command, Response, Status};

/// One connection to a replica's service port
pub struct Client {
    reader: BufReader<TcpStream>,
    writer: BufWriter<TcpStream>,
}

impl Client {
    /// Connect with a default 5 second I/O timeout
    pub fn connect(addr: impl ToSocketAddrs) -> Result<Self> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(Duration::from_secs(5)))?;
        stream.set_write_timeout(Some(Duration::from_secs(5)))?;
        Ok(Self {
            reader: BufReader::new(stream.try_clone()?),
            writer: BufWriter::new(stream),
        })
    }

    /// Send one command and wait for its response
    pub fn call(&mut self, command: &Command) -> Result<Response> {
        write_command(&mut self.writer, command)?;
        read_response(&mut self.reader)
    }

    /// Applied value of `key`, `None` if absent
    pub fn get(&mut self, key: &str) -> Result<Option<String>> {
        let response = self.call(&Command::Get {
            key: key.to_string(),
        })?;
        match response.status {
            Status::Ok => Ok(Some(response.text().unwrap_or_default())),
            Status::NotFound => Ok(None),
            _ => Err(Self::failure(response)),
        }
    }

    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let response = self.call(&Command::Set {
            key: key.to_string(),
            value: value.to_string(),
        })?;
        Self::expect_ok(response)
    }

    pub fn add_node(&mut self, id: u64, addr: &str) -> Result<()> {
        let response = self.call(&Command::AddNode {
            id,
            addr: addr.to_string(),
        })?;
        Self::expect_ok(response)
    }

    pub fn remove_node(&mut self, id: u64) -> Result<()> {
        let response = self.call(&Command::RemoveNode { id })?;
        Self::expect_ok(response)
    }

    /// True when the replica reports SERVING
    pub fn health(&mut self) -> Result<bool> {
        let response = self.call(&Command::Health)?;
        match response.status {
            Status::Serving => Ok(true),
            Status::NotServing => Ok(false),
            _ => Err(Self::failure(response)),
        }
    }

    fn expect_ok(response: Response) -> Result<()> {
        match response.status {
            Status::Ok => Ok(()),
            _ => Err(Self::failure(response)),
        }
    }

    fn failure(response: Response) -> QuorumError {
        QuorumError::Network(
            response
                .text()
                .unwrap_or_else(|| format!("unexpected status {:?}", response.status)),
        )
    }
}
