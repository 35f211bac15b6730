//! Error types for the replication subsystem.

use stripeline_transport::{StatusCode, TransportError};
use thiserror::Error;

/// Errors that end a replication session.
///
/// Failures that only affect one file are not errors at this level; they are
/// carried as a [`StatusCode`] in that file's result.
#[derive(Debug, Error)]
pub enum ReplError {
    /// Transport or wire protocol failure.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Local I/O failure outside any single file transfer.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Striping algorithm version this build does not implement.
    #[error("unknown striping algorithm version {version}")]
    UnknownAlgorithm {
        /// Version requested.
        version: i32,
    },

    /// A peer assigned a division index outside the negotiated range.
    #[error("division index {index} out of range (0..{divisions})")]
    InvalidDivision {
        /// Index received.
        index: i32,
        /// Negotiated division count.
        divisions: usize,
    },

    /// A peer assigned the same division index to two connections.
    #[error("division index {index} assigned twice")]
    DuplicateDivision {
        /// Index received twice.
        index: usize,
    },

    /// A transfer plan that cannot be executed.
    #[error("invalid transfer plan: {msg}")]
    InvalidPlan {
        /// What is wrong with it.
        msg: String,
    },

    /// Invalid configuration.
    #[error("invalid configuration: {msg}")]
    InvalidConfig {
        /// What is wrong with it.
        msg: String,
    },

    /// The peer refused the batch.
    #[error("batch rejected: {status}")]
    Rejected {
        /// Status returned by the peer.
        status: StatusCode,
    },

    /// The data connection ended before a division delivered all its bytes.
    #[error("division {division} ended early at offset {offset}")]
    UnexpectedEof {
        /// Division that ran dry.
        division: usize,
        /// File offset it had reached.
        offset: u64,
    },

    /// A background division task failed to run to completion.
    #[error("division task failed: {msg}")]
    Task {
        /// Join failure description.
        msg: String,
    },
}

/// Result type for replication operations.
pub type Result<T> = std::result::Result<T, ReplError>;
