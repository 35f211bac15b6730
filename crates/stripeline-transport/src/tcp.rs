//! TCP transport implementation

use std::net::{IpAddr, SocketAddr};
#[cfg(unix)]
use std::os::unix::io::AsRawFd;

use tokio::net::{TcpListener, TcpStream};

use crate::connection::{Connection, DEFAULT_BUFFER_SIZE};
use crate::error::{Result, TransportError};
use crate::ops::StreamBinding;

/// TCP transport configuration
#[derive(Debug, Clone)]
pub struct TcpTransportConfig {
    /// Connection timeout in milliseconds.
    pub connect_timeout_ms: u64,
    /// Whether to enable TCP_NODELAY (disable Nagle's algorithm).
    pub nodelay: bool,
    /// Size of each connection buffer in bytes (default: 16384).
    pub buffer_size: usize,
}

impl Default for TcpTransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5000,
            nodelay: true,
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

/// Inclusive range of ports a listener may bind to. `0..=0` asks the OS for
/// an ephemeral port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    /// First port tried.
    pub min: u16,
    /// Last port tried.
    pub max: u16,
}

impl PortRange {
    /// Creates a range.
    pub fn new(min: u16, max: u16) -> Self {
        Self { min, max }
    }

    /// Lets the OS pick the port.
    pub fn ephemeral() -> Self {
        Self { min: 0, max: 0 }
    }

    /// Whether the range asks for an ephemeral port.
    pub fn is_ephemeral(&self) -> bool {
        self.min == 0 && self.max == 0
    }
}

impl Default for PortRange {
    fn default() -> Self {
        Self {
            min: 11000,
            max: 12000,
        }
    }
}

/// TCP transport that creates connections.
#[derive(Debug, Clone, Default)]
pub struct TcpTransport {
    config: TcpTransportConfig,
}

impl TcpTransport {
    /// Creates a new TCP transport with the given configuration.
    pub fn new(config: TcpTransportConfig) -> Self {
        Self { config }
    }

    /// Configuration in use.
    pub fn config(&self) -> &TcpTransportConfig {
        &self.config
    }

    /// Establishes a TCP connection to the specified address.
    pub async fn connect(&self, addr: &str) -> Result<Connection> {
        let timeout = std::time::Duration::from_millis(self.config.connect_timeout_ms);
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::ConnectionTimeout {
                addr: addr.to_string(),
                timeout_ms: self.config.connect_timeout_ms,
            })?
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::ConnectionRefused => TransportError::ConnectionRefused {
                    addr: addr.to_string(),
                },
                _ => TransportError::IoError(e),
            })?;
        tracing::debug!(addr = addr, "TCP connected");
        self.wrap(stream)
    }

    /// Binds to the specified address and returns a listener for incoming connections.
    pub async fn listen(&self, addr: &str) -> Result<TcpListener> {
        TcpListener::bind(addr).await.map_err(TransportError::IoError)
    }

    /// Binds to the first free port of `range` on `host`, skipping ports that
    /// are already in use.
    pub async fn listen_in_range(&self, host: IpAddr, range: PortRange) -> Result<TcpListener> {
        if range.is_ephemeral() {
            return Ok(TcpListener::bind(SocketAddr::new(host, 0)).await?);
        }
        for port in range.min..=range.max {
            match TcpListener::bind(SocketAddr::new(host, port)).await {
                Ok(listener) => {
                    tracing::debug!(port, "data listener bound");
                    return Ok(listener);
                }
                Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => continue,
                Err(e) => return Err(TransportError::IoError(e)),
            }
        }
        Err(TransportError::PortRangeExhausted {
            min: range.min,
            max: range.max,
        })
    }

    /// Accepts an incoming TCP connection from the listener.
    pub async fn accept(&self, listener: &TcpListener) -> Result<Connection> {
        let (stream, _) = listener.accept().await.map_err(TransportError::IoError)?;
        self.wrap(stream)
    }

    fn wrap(&self, stream: TcpStream) -> Result<Connection> {
        if self.config.nodelay {
            stream.set_nodelay(true).map_err(TransportError::IoError)?;
        }
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_default();
        #[cfg(unix)]
        let fd = stream.as_raw_fd();
        let binding = StreamBinding::new(stream, peer.clone()).with_credential(peer);
        #[cfg(unix)]
        let binding = binding.with_handle(fd);
        Ok(Connection::with_buffer_size(
            Box::new(binding),
            self.config.buffer_size,
        ))
    }
}
