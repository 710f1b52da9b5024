//! Error types for QuorumKV
//!
//! Provides a unified error type for all operations.

use thiserror::Error;

/// Result type alias using QuorumError
pub type Result<T> = std::result::Result<T, QuorumError>;

/// Unified error type for QuorumKV operations
#[derive(Debug, Error)]
pub enum QuorumError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // -------------------------------------------------------------------------
    // WAL Errors
    // -------------------------------------------------------------------------
    #[error("WAL corruption detected: {0}")]
    WalCorruption(String),

    #[error("WAL write failed: {0}")]
    WalWrite(String),

    // -------------------------------------------------------------------------
    // Storage Errors
    // -------------------------------------------------------------------------
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Snapshot error: {0}")]
    Snapshot(String),

    // -------------------------------------------------------------------------
    // Consensus Errors
    // -------------------------------------------------------------------------
    #[error("Raft error: {0}")]
    Raft(#[from] raft::Error),

    // -------------------------------------------------------------------------
    // Serialization Errors
    // -------------------------------------------------------------------------
    #[error("Serialization error: {0}")]
    Serialization(String),

    // -------------------------------------------------------------------------
    // Network Errors
    // -------------------------------------------------------------------------
    #[error("Network error: {0}")]
    Network(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    // -------------------------------------------------------------------------
    // Configuration Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),

    // -------------------------------------------------------------------------
    // Lifecycle Errors
    // -------------------------------------------------------------------------
    #[error("Proposal channel closed")]
    ProposalClosed,

    #[error("Node {0} is stopped")]
    NodeStopped(u64),

    #[error("Invalid node state: {0}")]
    InvalidState(String),
}

impl From<bincode::Error> for QuorumError {
    fn from(err: bincode::Error) -> Self {
        QuorumError::Serialization(err.to_string())
    }
}

impl From<prost::DecodeError> for QuorumError {
    fn from(err: prost::DecodeError) -> Self {
        QuorumError::Serialization(err.to_string())
    }
}
