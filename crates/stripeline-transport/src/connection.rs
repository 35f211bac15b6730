//! Buffered, rebindable connection: one inbound and one outbound [`IoBuffer`]
//! in front of a [`StreamOps`] binding.

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

use crate::error::{Result, TransportError};
use crate::iobuffer::IoBuffer;
use crate::ops::{Detached, OpsReader, OpsWriter, RawHandle, StreamBinding, StreamOps};

/// Default size of each direction's buffer.
pub const DEFAULT_BUFFER_SIZE: usize = 16384;

/// How far a receive may read ahead of the bytes it was asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvMode {
    /// Fill the inbound buffer as far as the transport allows.
    Buffered,
    /// Never pull more bytes off the transport than the current value needs.
    /// Required before handing the stream to direct reads.
    Just,
}

/// A logical connection.
pub struct Connection {
    ops: Box<dyn StreamOps>,
    recv: IoBuffer,
    send: IoBuffer,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.ops.peer())
            .field("recv", &self.recv)
            .field("send", &self.send)
            .finish()
    }
}

impl Connection {
    /// Creates a connection over `ops` with default-sized buffers.
    pub fn new(ops: Box<dyn StreamOps>) -> Self {
        Self::with_buffer_size(ops, DEFAULT_BUFFER_SIZE)
    }

    /// Creates a connection whose buffers each hold `size` bytes.
    pub fn with_buffer_size(ops: Box<dyn StreamOps>, size: usize) -> Self {
        Self {
            ops,
            recv: IoBuffer::new(size),
            send: IoBuffer::new(size),
        }
    }

    /// Convenience constructor over any tokio byte stream.
    pub fn from_stream<S>(stream: S, peer: impl Into<String>) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        Self::new(Box::new(StreamBinding::new(stream, peer)))
    }

    /// Swaps in a new binding, keeping every buffered byte, and returns the
    /// previous one.
    pub fn rebind(&mut self, ops: Box<dyn StreamOps>) -> Box<dyn StreamOps> {
        debug!(from = self.ops.peer(), to = ops.peer(), "connection rebound");
        std::mem::replace(&mut self.ops, ops)
    }

    /// Rebinds to a binding built from the current one, e.g. wrapping a
    /// plaintext stream in a secured one.
    pub fn map_ops<F>(&mut self, f: F)
    where
        F: FnOnce(Box<dyn StreamOps>) -> Box<dyn StreamOps>,
    {
        let old = std::mem::replace(&mut self.ops, Box::new(Detached));
        self.ops = f(old);
    }

    /// Peer description of the current binding.
    pub fn peer(&self) -> &str {
        self.ops.peer()
    }

    /// OS handle of the current binding.
    pub fn handle(&self) -> Option<RawHandle> {
        self.ops.handle()
    }

    /// Peer credential of the current binding.
    pub fn export_credential(&self) -> Option<String> {
        self.ops.export_credential()
    }

    /// Inbound buffer.
    pub fn recv_buffer(&self) -> &IoBuffer {
        &self.recv
    }

    /// Inbound buffer, mutably.
    pub fn recv_buffer_mut(&mut self) -> &mut IoBuffer {
        &mut self.recv
    }

    /// Outbound buffer.
    pub fn send_buffer(&self) -> &IoBuffer {
        &self.send
    }

    /// Outbound buffer, mutably.
    pub fn send_buffer_mut(&mut self) -> &mut IoBuffer {
        &mut self.send
    }

    /// True if received bytes are waiting in the inbound buffer.
    pub fn is_recv_ready(&self) -> bool {
        !self.recv.is_empty()
    }

    /// Clears latched errors on both buffers.
    pub fn clear_errors(&mut self) {
        self.recv.clear_error();
        self.send.clear_error();
    }

    fn check_recv(&self) -> Result<()> {
        match self.recv.error() {
            Some(err) => Err(TransportError::IoError(err.to_io())),
            None => Ok(()),
        }
    }

    fn check_send(&self) -> Result<()> {
        match self.send.error() {
            Some(err) => Err(TransportError::IoError(err.to_io())),
            None => Ok(()),
        }
    }

    /// Pulls at most `limit` bytes into the inbound buffer, waiting for the
    /// transport. Returns `Ok(0)` at end of stream.
    pub async fn fill_recv(&mut self, limit: usize) -> Result<usize> {
        self.check_recv()?;
        let mut reader = OpsReader {
            ops: self.ops.as_mut(),
            nonblocking: false,
        };
        let n = self.recv.enqueue(&mut reader, limit).await;
        self.check_recv()?;
        Ok(n)
    }

    /// Pulls only what the transport has ready right now.
    pub async fn try_fill_recv(&mut self, limit: usize) -> Result<usize> {
        self.check_recv()?;
        let mut reader = OpsReader {
            ops: self.ops.as_mut(),
            nonblocking: true,
        };
        let n = self.recv.enqueue(&mut reader, limit).await;
        self.check_recv()?;
        Ok(n)
    }

    /// Writes every pending outbound byte to the transport.
    pub async fn flush(&mut self) -> Result<()> {
        self.check_send()?;
        while !self.send.is_empty() {
            let mut writer = OpsWriter {
                ops: self.ops.as_mut(),
                nonblocking: false,
            };
            self.send.dequeue(&mut writer, usize::MAX).await;
            self.check_send()?;
        }
        Ok(())
    }

    /// Writes whatever pending output the transport takes right now. Returns
    /// true once nothing is left.
    pub async fn try_flush(&mut self) -> Result<bool> {
        self.check_send()?;
        while !self.send.is_empty() {
            let mut writer = OpsWriter {
                ops: self.ops.as_mut(),
                nonblocking: true,
            };
            if self.send.dequeue(&mut writer, usize::MAX).await == 0 {
                break;
            }
        }
        self.check_send()?;
        Ok(self.send.is_empty())
    }

    /// Appends encoded bytes to the outbound buffer, flushing whenever it
    /// fills up.
    pub async fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.check_send()?;
        let mut writer = OpsWriter {
            ops: self.ops.as_mut(),
            nonblocking: false,
        };
        self.send.put_flushing(bytes, &mut writer).await;
        self.check_send()
    }

    /// Flushes pending writes, then closes the binding. Both steps always
    /// run; the first failure is reported.
    pub async fn flush_and_close(mut self) -> Result<()> {
        let flushed = self.flush().await;
        let closed = self.ops.close().await.map_err(TransportError::from);
        debug!(peer = self.ops.peer(), "connection closed");
        flushed.and(closed)
    }

    /// Reads file payload straight from the transport, bypassing the inbound
    /// buffer. Any bytes still buffered are handed out first.
    pub async fn read_direct(&mut self, buf: &mut [u8]) -> Result<usize> {
        if !self.recv.is_empty() {
            return Ok(self.recv.get(buf));
        }
        self.check_recv()?;
        Ok(self.ops.read(buf).await?)
    }

    /// Writes payload straight to the transport. Pending buffered bytes are
    /// flushed first so ordering is preserved.
    pub async fn write_direct(&mut self, buf: &[u8]) -> Result<usize> {
        self.flush().await?;
        Ok(self.ops.write(buf).await?)
    }

    /// [`Connection::write_direct`] until all of `buf` is written.
    pub async fn write_all_direct(&mut self, mut buf: &[u8]) -> Result<()> {
        while !buf.is_empty() {
            let n = self.write_direct(buf).await?;
            if n == 0 {
                return Err(TransportError::IoError(std::io::ErrorKind::WriteZero.into()));
            }
            buf = &buf[n..];
        }
        Ok(())
    }

    /// Fills `buf` from the inbound side. Returns fewer bytes only at end of
    /// stream.
    pub async fn recv_exact(&mut self, mode: RecvMode, buf: &mut [u8]) -> Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            if self.recv.is_empty() {
                if self.recv.is_read_eof() {
                    break;
                }
                let limit = match mode {
                    RecvMode::Just => buf.len() - filled,
                    RecvMode::Buffered => usize::MAX,
                };
                self.fill_recv(limit).await?;
                continue;
            }
            filled += self.recv.get(&mut buf[filled..]);
        }
        Ok(filled)
    }

    /// Delivers what is available with at most one transport read.
    pub async fn recv_partial(&mut self, mode: RecvMode, buf: &mut [u8]) -> Result<usize> {
        self.flush().await?;
        if self.recv.is_empty() && !self.recv.is_read_eof() {
            let limit = match mode {
                RecvMode::Just => buf.len(),
                RecvMode::Buffered => usize::MAX,
            };
            self.fill_recv(limit).await?;
        }
        Ok(self.recv.get(buf))
    }

    /// Discards `n` inbound bytes. Returns fewer only at end of stream.
    pub async fn purge(&mut self, mode: RecvMode, n: usize) -> Result<usize> {
        let mut purged = 0;
        while purged < n {
            if self.recv.is_empty() {
                if self.recv.is_read_eof() {
                    break;
                }
                let limit = match mode {
                    RecvMode::Just => n - purged,
                    RecvMode::Buffered => usize::MAX,
                };
                self.fill_recv(limit).await?;
                continue;
            }
            purged += self.recv.purge(n - purged);
        }
        Ok(purged)
    }

    /// Ensures `n` bytes sit contiguously in the inbound buffer, growing it if
    /// needed. Returns the number buffered, short only at end of stream.
    pub async fn recv_ahead(&mut self, n: usize) -> Result<usize> {
        if n > self.recv.capacity() {
            self.recv.resize(n)?;
        }
        while self.recv.len() < n && !self.recv.is_read_eof() {
            if self.recv.capacity() - self.recv.len() < n - self.recv.len() {
                self.recv.squeeze();
            }
            self.fill_recv(usize::MAX).await?;
        }
        Ok(self.recv.len().min(n))
    }

    /// Enters a pindown scope on the outbound buffer.
    pub fn begin_send_pindown(&mut self) -> usize {
        self.send.begin_pindown()
    }

    /// Leaves a pindown scope on the outbound buffer.
    pub fn end_send_pindown(&mut self) {
        self.send.end_pindown();
    }
}
