//! Protocol codec
//!
//! Encoding and decoding functions for the wire protocol.
//!
//! ### Payload by Command Type
//! - GET:         key_len (4 bytes) + key
//! - SET:         key_len (4 bytes) + key + value
//! - ADD_NODE:    node_id (8 bytes) + addr
//! - REMOVE_NODE: node_id (8 bytes)
//! - HEALTH:      empty

use std::io::{Read, Write};

use super::{Command, CommandType, Response, Status};
use crate::error::{QuorumError, Result};

/// Header size: 1 byte command/status + 4 bytes length
pub const HEADER_SIZE: usize = 5;

/// Maximum payload size (16 MB)
pub const MAX_PAYLOAD_SIZE: u32 = 16 * 1024 * 1024;

// =============================================================================
// Command Encoding/Decoding
// =============================================================================

/// Encode a command to bytes
///
/// Format: cmd_type (1) + payload_len (4) + payload
pub fn encode_command(command: &Command) -> Vec<u8> {
    let payload = match command {
        Command::Get { key } => {
            let mut payload = Vec::with_capacity(4 + key.len());
            put_prefixed(&mut payload, key.as_bytes());
            payload
        }
        Command::Set { key, value } => {
            let mut payload = Vec::with_capacity(4 + key.len() + value.len());
            put_prefixed(&mut payload, key.as_bytes());
            payload.extend_from_slice(value.as_bytes());
            payload
        }
        Command::AddNode { id, addr } => {
            let mut payload = Vec::with_capacity(8 + addr.len());
            payload.extend_from_slice(&id.to_be_bytes());
            payload.extend_from_slice(addr.as_bytes());
            payload
        }
        Command::RemoveNode { id } => id.to_be_bytes().to_vec(),
        Command::Health => Vec::new(),
    };

    frame(command.command_type() as u8, &payload)
}

/// Decode a command from a complete frame
pub fn decode_command(bytes: &[u8]) -> Result<Command> {
    let (cmd_byte, payload) = split_frame(bytes, "command")?;

    let cmd_type = CommandType::from_byte(cmd_byte).ok_or_else(|| {
        QuorumError::Protocol(format!("Unknown command type: 0x{:02x}", cmd_byte))
    })?;

    match cmd_type {
        CommandType::Get => {
            let (key, rest) = take_prefixed(payload, "GET")?;
            if !rest.is_empty() {
                return Err(QuorumError::Protocol(format!(
                    "GET command: {} trailing bytes",
                    rest.len()
                )));
            }
            Ok(Command::Get {
                key: utf8(key, "GET key")?,
            })
        }
        CommandType::Set => {
            let (key, value) = take_prefixed(payload, "SET")?;
            Ok(Command::Set {
                key: utf8(key, "SET key")?,
                value: utf8(value, "SET value")?,
            })
        }
        CommandType::AddNode => {
            let (id, addr) = take_id(payload, "ADD_NODE")?;
            Ok(Command::AddNode {
                id,
                addr: utf8(addr, "ADD_NODE address")?,
            })
        }
        CommandType::RemoveNode => {
            let (id, rest) = take_id(payload, "REMOVE_NODE")?;
            if !rest.is_empty() {
                return Err(QuorumError::Protocol(format!(
                    "REMOVE_NODE command: {} trailing bytes",
                    rest.len()
                )));
            }
            Ok(Command::RemoveNode { id })
        }
        CommandType::Health => {
            if !payload.is_empty() {
                return Err(QuorumError::Protocol(format!(
                    "HEALTH command: unexpected payload of {} bytes",
                    payload.len()
                )));
            }
            Ok(Command::Health)
        }
    }
}

// =============================================================================
// Response Encoding/Decoding
// =============================================================================

/// Encode a response to bytes
///
/// Format: status (1) + payload_len (4) + payload
pub fn encode_response(response: &Response) -> Vec<u8> {
    let payload = response.payload.as_deref().unwrap_or(&[]);
    frame(response.status as u8, payload)
}

/// Decode a response from a complete frame
pub fn decode_response(bytes: &[u8]) -> Result<Response> {
    let (status_byte, payload) = split_frame(bytes, "response")?;

    let status = Status::from_byte(status_byte).ok_or_else(|| {
        QuorumError::Protocol(format!("Unknown response status: 0x{:02x}", status_byte))
    })?;

    let payload = if payload.is_empty() {
        None
    } else {
        Some(payload.to_vec())
    };

    Ok(Response { status, payload })
}

// =============================================================================
// Stream-based I/O helpers
// =============================================================================

/// Read a complete command from a stream
///
/// Blocks until a complete command is received or an error occurs
pub fn read_command<R: Read>(reader: &mut R) -> Result<Command> {
    decode_command(&read_frame(reader)?)
}

/// Write a command to a stream
pub fn write_command<W: Write>(writer: &mut W, command: &Command) -> Result<()> {
    writer.write_all(&encode_command(command))?;
    writer.flush()?;
    Ok(())
}

/// Read a complete response from a stream
pub fn read_response<R: Read>(reader: &mut R) -> Result<Response> {
    decode_response(&read_frame(reader)?)
}

/// Write a response to a stream
pub fn write_response<W: Write>(writer: &mut W, response: &Response) -> Result<()> {
    writer.write_all(&encode_response(response))?;
    writer.flush()?;
    Ok(())
}

// =============================================================================
// Helpers
// =============================================================================

fn frame(kind: u8, payload: &[u8]) -> Vec<u8> {
    let mut message = Vec::with_capacity(HEADER_SIZE + payload.len());
    message.push(kind);
    message.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    message.extend_from_slice(payload);
    message
}

/// Validate the header and return (kind, payload)
fn split_frame<'a>(bytes: &'a [u8], what: &str) -> Result<(u8, &'a [u8])> {
    if bytes.len() < HEADER_SIZE {
        return Err(QuorumError::Protocol(format!(
            "Incomplete {} header: expected {} bytes, got {}",
            what,
            HEADER_SIZE,
            bytes.len()
        )));
    }

    let payload_len = u32::from_be_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]);
    if payload_len > MAX_PAYLOAD_SIZE {
        return Err(QuorumError::Protocol(format!(
            "Payload too large: {} bytes (max {})",
            payload_len, MAX_PAYLOAD_SIZE
        )));
    }

    let total_len = HEADER_SIZE + payload_len as usize;
    if bytes.len() < total_len {
        return Err(QuorumError::Protocol(format!(
            "Incomplete {} payload: expected {} bytes, got {}",
            what,
            total_len,
            bytes.len()
        )));
    }

    Ok((bytes[0], &bytes[HEADER_SIZE..total_len]))
}

/// Read header + payload without interpreting the kind byte
fn read_frame<R: Read>(reader: &mut R) -> Result<Vec<u8>> {
    let mut header = [0u8; HEADER_SIZE];
    reader.read_exact(&mut header)?;

    let payload_len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]);
    if payload_len > MAX_PAYLOAD_SIZE {
        return Err(QuorumError::Protocol(format!(
            "Payload too large: {} bytes (max {})",
            payload_len, MAX_PAYLOAD_SIZE
        )));
    }

    let mut message = vec![0u8; HEADER_SIZE + payload_len as usize];
    message[..HEADER_SIZE].copy_from_slice(&header);
    if payload_len > 0 {
        reader.read_exact(&mut message[HEADER_SIZE..])?;
    }
    Ok(message)
}

fn put_prefixed(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    buf.extend_from_slice(bytes);
}

/// Split `len (4) + bytes` off the front of a payload
fn take_prefixed<'a>(payload: &'a [u8], cmd: &str) -> Result<(&'a [u8], &'a [u8])> {
    if payload.len() < 4 {
        return Err(QuorumError::Protocol(format!(
            "{} command: missing key length",
            cmd
        )));
    }
    let len = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]) as usize;
    if payload.len() - 4 < len {
        return Err(QuorumError::Protocol(format!(
            "{} command: incomplete key (expected {}, got {})",
            cmd,
            len,
            payload.len() - 4
        )));
    }
    Ok((&payload[4..4 + len], &payload[4 + len..]))
}

fn take_id<'a>(payload: &'a [u8], cmd: &str) -> Result<(u64, &'a [u8])> {
    if payload.len() < 8 {
        return Err(QuorumError::Protocol(format!(
            "{} command: missing node id",
            cmd
        )));
    }
    let mut id = [0u8; 8];
    id.copy_from_slice(&payload[..8]);
    Ok((u64::from_be_bytes(id), &payload[8..]))
}

fn utf8(bytes: &[u8], what: &str) -> Result<String> {
    String::from_utf8(bytes.to_vec())
        .map_err(|_| QuorumError::Protocol(format!("{} is not valid UTF-8", what)))
}
