//! Codec Tests
//!
//! Tests for command and response encoding/decoding.

use std::io::Cursor;

use quorumkv::error::QuorumError;
use quorumkv::protocol::{
    decode_command, decode_response, encode_command, encode_response, read_command,
    read_response, write_command, write_response, Command, Response, Status, HEADER_SIZE,
    MAX_PAYLOAD_SIZE,
};

// =============================================================================
// Command Encoding/Decoding Tests
// =============================================================================

#[test]
fn test_encode_decode_get() {
    let cmd = Command::Get {
        key: "hello".to_string(),
    };
    let decoded = decode_command(&encode_command(&cmd)).unwrap();
    assert_eq!(decoded, cmd);
}

#[test]
fn test_encode_decode_set_with_empty_value() {
    let cmd = Command::Set {
        key: "k".to_string(),
        value: String::new(),
    };
    let decoded = decode_command(&encode_command(&cmd)).unwrap();
    assert_eq!(decoded, cmd);
}

#[test]
fn test_encode_decode_membership_commands() {
    let add = Command::AddNode {
        id: 4,
        addr: "127.0.0.1:12379".to_string(),
    };
    assert_eq!(decode_command(&encode_command(&add)).unwrap(), add);

    let remove = Command::RemoveNode { id: 2 };
    assert_eq!(decode_command(&encode_command(&remove)).unwrap(), remove);
}

#[test]
fn test_encode_decode_health() {
    let encoded = encode_command(&Command::Health);
    assert_eq!(encoded.len(), HEADER_SIZE);
    assert_eq!(decode_command(&encoded).unwrap(), Command::Health);
}

// =============================================================================
// Response Encoding/Decoding Tests
// =============================================================================

#[test]
fn test_encode_decode_response_value() {
    let decoded = decode_response(&encode_response(&Response::value("v1"))).unwrap();
    assert_eq!(decoded.status, Status::Ok);
    assert_eq!(decoded.text().as_deref(), Some("v1"));
}

#[test]
fn test_encode_decode_response_error() {
    let decoded = decode_response(&encode_response(&Response::error("boom"))).unwrap();
    assert_eq!(decoded.status, Status::Error);
    assert_eq!(decoded.text().as_deref(), Some("boom"));
}

#[test]
fn test_health_statuses() {
    assert_eq!(Response::health(true).status, Status::Serving);
    assert_eq!(Response::health(false).status, Status::NotServing);

    let decoded = decode_response(&encode_response(&Response::health(false))).unwrap();
    assert_eq!(decoded.status, Status::NotServing);
    assert!(decoded.payload.is_none());
}

// =============================================================================
// Error Handling Tests
// =============================================================================

#[test]
fn test_incomplete_header() {
    assert!(matches!(
        decode_command(&[0x01, 0x00]),
        Err(QuorumError::Protocol(_))
    ));
}

#[test]
fn test_incomplete_payload() {
    let mut encoded = encode_command(&Command::Get {
        key: "abcdef".to_string(),
    });
    encoded.truncate(encoded.len() - 2);
    assert!(matches!(decode_command(&encoded), Err(QuorumError::Protocol(_))));
}

#[test]
fn test_unknown_command_type() {
    assert!(matches!(
        decode_command(&[0x7F, 0, 0, 0, 0]),
        Err(QuorumError::Protocol(_))
    ));
}

#[test]
fn test_unknown_response_status() {
    assert!(matches!(
        decode_response(&[0x7F, 0, 0, 0, 0]),
        Err(QuorumError::Protocol(_))
    ));
}

#[test]
fn test_oversized_payload_rejected() {
    let len = (MAX_PAYLOAD_SIZE + 1).to_be_bytes();
    let frame = [0x02, len[0], len[1], len[2], len[3]];
    assert!(matches!(decode_command(&frame), Err(QuorumError::Protocol(_))));
    assert!(read_command(&mut Cursor::new(frame.to_vec())).is_err());
}

#[test]
fn test_remove_node_with_short_id() {
    let frame = [0x04, 0, 0, 0, 3, 0, 0, 1];
    assert!(matches!(decode_command(&frame), Err(QuorumError::Protocol(_))));
}

#[test]
fn test_health_with_unexpected_payload() {
    let frame = [0x05, 0, 0, 0, 1, 0xAA];
    assert!(matches!(decode_command(&frame), Err(QuorumError::Protocol(_))));
}

#[test]
fn test_set_with_invalid_utf8_value() {
    let frame = [0x02, 0, 0, 0, 6, 0, 0, 0, 1, b'k', 0xFF];
    assert!(matches!(decode_command(&frame), Err(QuorumError::Protocol(_))));
}

// =============================================================================
// Stream Tests
// =============================================================================

#[test]
fn test_stream_multiple_commands() {
    let commands = vec![
        Command::Set {
            key: "a".to_string(),
            value: "1".to_string(),
        },
        Command::Get {
            key: "a".to_string(),
        },
        Command::Health,
    ];

    let mut buf = Vec::new();
    for cmd in &commands {
        write_command(&mut buf, cmd).unwrap();
    }

    let mut cursor = Cursor::new(buf);
    for expected in &commands {
        assert_eq!(&read_command(&mut cursor).unwrap(), expected);
    }
    assert!(matches!(read_command(&mut cursor), Err(QuorumError::Io(_))));
}

#[test]
fn test_stream_write_read_response() {
    let mut buf = Vec::new();
    write_response(&mut buf, &Response::not_found()).unwrap();
    write_response(&mut buf, &Response::ok(None)).unwrap();

    let mut cursor = Cursor::new(buf);
    assert_eq!(read_response(&mut cursor).unwrap(), Response::not_found());
    assert_eq!(read_response(&mut cursor).unwrap(), Response::ok(None));
}

// =============================================================================
// Wire Format Tests
// =============================================================================

#[test]
fn test_wire_format_get() {
    let encoded = encode_command(&Command::Get {
        key: "ab".to_string(),
    });
    assert_eq!(encoded, vec![0x01, 0, 0, 0, 6, 0, 0, 0, 2, b'a', b'b']);
}

#[test]
fn test_wire_format_add_node() {
    let encoded = encode_command(&Command::AddNode {
        id: 258,
        addr: "h:1".to_string(),
    });
    assert_eq!(
        encoded,
        vec![0x03, 0, 0, 0, 11, 0, 0, 0, 0, 0, 0, 1, 2, b'h', b':', b'1']
    );
}
