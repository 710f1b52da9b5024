//! Protocol Module
//!
//! Wire protocol between clients and a replica's service port.
//!
//! ### Request Format
//! ```text
//! ┌──────────┬──────────┬─────────────────────────────┐
//! │ Cmd (1)  │ Len (4)  │         Payload             │
//! └──────────┴──────────┴─────────────────────────────┘
//! ```
//!
//! ### Commands
//! - 0x01: GET         - Payload: key_len (4) + key
//! - 0x02: SET         - Payload: key_len (4) + key + value
//! - 0x03: ADD_NODE    - Payload: node_id (8) + raft address
//! - 0x04: REMOVE_NODE - Payload: node_id (8)
//! - 0x05: HEALTH      - Payload: empty
//!
//! ### Response Format
//! ```text
//! ┌──────────┬──────────┬─────────────────────────────┐
//! │Status(1) │ Len (4)  │         Payload             │
//! └──────────┴──────────┴─────────────────────────────┘
//! ```
//!
//! ### Status Codes
//! - 0x00: OK
//! - 0x01: NOT_FOUND
//! - 0x02: ERROR
//! - 0x03: SERVING
//! - 0x04: NOT_SERVING
//!
//! All integers are big-endian.

mod codec;
mod command;
mod response;

pub use codec::{
    decode_command, decode_response, encode_command, encode_response, read_command,
    read_response, write_command, write_response, HEADER_SIZE, MAX_PAYLOAD_SIZE,
};
pub use command::{Command, CommandType};
pub use response::{Response, Status};
