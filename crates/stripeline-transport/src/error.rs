//! Transport error type.

use thiserror::Error;

/// Errors raised by the transport layer.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The peer refused the connection.
    #[error("connection refused to {addr}")]
    ConnectionRefused {
        /// Address that was dialled.
        addr: String,
    },

    /// A connect or accept did not complete in time.
    #[error("connection timeout after {timeout_ms}ms to {addr}")]
    ConnectionTimeout {
        /// Remote address, or a description of the listener.
        addr: String,
        /// Timeout that expired.
        timeout_ms: u64,
    },

    /// The connection has no stream bound to it.
    #[error("not connected")]
    NotConnected,

    /// The stream ended in the middle of a value.
    #[error("unexpected EOF while receiving '{tag}' value")]
    UnexpectedEof {
        /// Wire tag of the value being read.
        tag: char,
    },

    /// The peer sent something the codec or RPC layer cannot accept.
    #[error("protocol error: {reason}")]
    Protocol {
        /// What was wrong.
        reason: String,
    },

    /// Every port of a range was already taken.
    #[error("no free port in range {min}..={max}")]
    PortRangeExhausted {
        /// First port tried.
        min: u16,
        /// Last port tried.
        max: u16,
    },

    /// The peer failed or refused the handshake.
    #[error("authentication failed: {reason}")]
    AuthFailed {
        /// What failed.
        reason: String,
    },

    /// A buffer cannot shrink below the bytes it holds.
    #[error("cannot resize buffer to {requested} bytes while {buffered} bytes are buffered")]
    BufferResize {
        /// Requested capacity.
        requested: usize,
        /// Bytes currently buffered.
        buffered: usize,
    },

    /// Underlying I/O failure.
    #[error(transparent)]
    IoError(#[from] std::io::Error),
}

impl TransportError {
    /// Builds a [`TransportError::Protocol`] from anything printable.
    pub fn protocol(reason: impl Into<String>) -> Self {
        TransportError::Protocol {
            reason: reason.into(),
        }
    }
}

/// Result alias for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_name_the_failure() {
        let err = TransportError::ConnectionTimeout {
            addr: "data listener".into(),
            timeout_ms: 300,
        };
        assert_eq!(err.to_string(), "connection timeout after 300ms to data listener");
        assert_eq!(TransportError::protocol("bad tag").to_string(), "protocol error: bad tag");
        let io: TransportError = std::io::Error::from(std::io::ErrorKind::BrokenPipe).into();
        assert!(matches!(io, TransportError::IoError(_)));
    }
}
