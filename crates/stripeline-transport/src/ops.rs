//! Transport-operation bindings a [`crate::connection::Connection`] drives.
//!
//! The connection never talks to a socket directly. It goes through a boxed
//! [`StreamOps`], which can be swapped at runtime to layer another channel
//! under the same buffered connection.

use async_trait::async_trait;
use futures::FutureExt;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::iobuffer::{ByteSink, ByteSource};

/// Opaque OS-level handle of a binding (a file descriptor on unix).
pub type RawHandle = i32;

/// Operations table behind a connection.
#[async_trait]
pub trait StreamOps: Send {
    /// Waits for and reads some bytes; `Ok(0)` is end of stream.
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Reads only what is ready now, failing with `WouldBlock` otherwise.
    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Waits until some bytes are written.
    async fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Writes only what fits now, failing with `WouldBlock` otherwise.
    fn try_write(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Shuts the stream down.
    async fn close(&mut self) -> io::Result<()>;

    /// Transport-level credential of the peer, if the binding has one.
    fn export_credential(&self) -> Option<String>;

    /// OS handle, if the binding is backed by one.
    fn handle(&self) -> Option<RawHandle>;

    /// Human-readable peer description used in logs and diagnostics.
    fn peer(&self) -> &str;
}

/// [`StreamOps`] over any tokio byte stream.
pub struct StreamBinding<S> {
    stream: S,
    peer: String,
    handle: Option<RawHandle>,
    credential: Option<String>,
}

impl<S> StreamBinding<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Wraps `stream`, describing the other end as `peer`.
    pub fn new(stream: S, peer: impl Into<String>) -> Self {
        Self {
            stream,
            peer: peer.into(),
            handle: None,
            credential: None,
        }
    }

    /// Records the OS handle backing the stream.
    pub fn with_handle(mut self, handle: RawHandle) -> Self {
        self.handle = Some(handle);
        self
    }

    /// Records the credential reported by [`StreamOps::export_credential`].
    pub fn with_credential(mut self, credential: impl Into<String>) -> Self {
        self.credential = Some(credential.into());
        self
    }
}

#[async_trait]
impl<S> StreamOps for StreamBinding<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf).await
    }

    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.stream.read(buf).now_or_never() {
            Some(result) => result,
            None => Err(io::ErrorKind::WouldBlock.into()),
        }
    }

    async fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.stream.write(buf).await?;
        self.stream.flush().await?;
        Ok(n)
    }

    fn try_write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.stream.write(buf).now_or_never() {
            Some(result) => result,
            None => Err(io::ErrorKind::WouldBlock.into()),
        }
    }

    async fn close(&mut self) -> io::Result<()> {
        self.stream.shutdown().await
    }

    fn export_credential(&self) -> Option<String> {
        self.credential.clone()
    }

    fn handle(&self) -> Option<RawHandle> {
        self.handle
    }

    fn peer(&self) -> &str {
        &self.peer
    }
}

/// Placeholder binding installed while a connection is being rebound.
pub(crate) struct Detached;

#[async_trait]
impl StreamOps for Detached {
    async fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
        Err(io::ErrorKind::NotConnected.into())
    }

    fn try_read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
        Err(io::ErrorKind::NotConnected.into())
    }

    async fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
        Err(io::ErrorKind::NotConnected.into())
    }

    fn try_write(&mut self, _buf: &[u8]) -> io::Result<usize> {
        Err(io::ErrorKind::NotConnected.into())
    }

    async fn close(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn export_credential(&self) -> Option<String> {
        None
    }

    fn handle(&self) -> Option<RawHandle> {
        None
    }

    fn peer(&self) -> &str {
        "detached"
    }
}

/// Adapts a binding's read side to an IoBuffer source.
pub(crate) struct OpsReader<'a> {
    pub(crate) ops: &'a mut dyn StreamOps,
    pub(crate) nonblocking: bool,
}

#[async_trait]
impl ByteSource for OpsReader<'_> {
    async fn fill(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.nonblocking {
            self.ops.try_read(buf)
        } else {
            self.ops.read(buf).await
        }
    }
}

/// Adapts a binding's write side to an IoBuffer sink.
pub(crate) struct OpsWriter<'a> {
    pub(crate) ops: &'a mut dyn StreamOps,
    pub(crate) nonblocking: bool,
}

#[async_trait]
impl ByteSink for OpsWriter<'_> {
    async fn drain(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.nonblocking {
            self.ops.try_write(buf)
        } else {
            self.ops.write(buf).await
        }
    }
}
