#![warn(missing_docs)]

//! Stripeline replication subsystem: striped parallel whole-file replication between storage nodes

pub mod config;
pub mod disksync;
pub mod engine;
pub mod error;
pub mod metadata;
pub mod session;
pub mod sink;
pub mod stripe;

pub use config::ReplConfig;
pub use engine::{DataChannel, TransferOutcome, TransferVariant};
pub use error::{ReplError, Result};
pub use session::{BatchSummary, FileEntry, FileResult, ReplicationClient, ReplicationServer};
pub use stripe::{limit_divisions, StripeLayout, ALGORITHM_LATEST};
