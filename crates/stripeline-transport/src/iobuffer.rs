//! Bounded FIFO byte queue sitting between a connection and its callers.
//!
//! An [`IoBuffer`] is filled from a [`ByteSource`] (enqueue) and drained into
//! a [`ByteSink`] (dequeue). Callers that are themselves the source or sink
//! use [`IoBuffer::put`] and [`IoBuffer::get`] instead. End-of-stream and
//! failures are latched as flags so that a reader can keep consuming bytes
//! that were already buffered before the condition was observed.

use async_trait::async_trait;
use std::fmt;
use std::io;

use crate::error::{Result, TransportError};

/// Pull side of an [`IoBuffer`]: something bytes can be read from.
#[async_trait]
pub trait ByteSource: Send {
    /// Reads into `buf`; `Ok(0)` signals end of stream.
    async fn fill(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

/// Push side of an [`IoBuffer`]: something bytes can be written to.
#[async_trait]
pub trait ByteSink: Send {
    /// Writes a prefix of `buf`, returning how many bytes were taken.
    async fn drain(&mut self, buf: &[u8]) -> io::Result<usize>;
}

#[async_trait]
impl ByteSource for &[u8] {
    async fn fill(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = buf.len().min(self.len());
        buf[..n].copy_from_slice(&self[..n]);
        *self = &self[n..];
        Ok(n)
    }
}

#[async_trait]
impl ByteSink for Vec<u8> {
    async fn drain(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.extend_from_slice(buf);
        Ok(buf.len())
    }
}

/// Latched callback failure. Kept as kind plus message so it can be reported
/// repeatedly until cleared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferError {
    /// Kind of the original I/O error.
    pub kind: io::ErrorKind,
    /// Rendered message of the original I/O error.
    pub message: String,
}

impl BufferError {
    fn from_io(err: &io::Error) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }

    /// Rebuilds an [`io::Error`] carrying the latched kind and message.
    pub fn to_io(&self) -> io::Error {
        io::Error::new(self.kind, self.message.clone())
    }
}

type CloseHook = Box<dyn FnMut() + Send>;

/// Bounded byte queue with latched EOF and error state.
///
/// Bytes live in `data[head..tail]`. `head <= tail <= capacity` always holds;
/// compaction moves the live range back to offset zero unless the buffer is
/// pinned down.
pub struct IoBuffer {
    data: Vec<u8>,
    head: usize,
    tail: usize,
    read_eof: bool,
    write_eof: bool,
    error: Option<BufferError>,
    pindown: u32,
    auto_expand: bool,
    write_close: Option<CloseHook>,
}

impl fmt::Debug for IoBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoBuffer")
            .field("capacity", &self.data.len())
            .field("head", &self.head)
            .field("tail", &self.tail)
            .field("read_eof", &self.read_eof)
            .field("write_eof", &self.write_eof)
            .field("error", &self.error)
            .field("pindown", &self.pindown)
            .field("auto_expand", &self.auto_expand)
            .finish()
    }
}

impl IoBuffer {
    /// Creates an empty buffer holding at most `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            data: vec![0; capacity],
            head: 0,
            tail: 0,
            read_eof: false,
            write_eof: false,
            error: None,
            pindown: 0,
            auto_expand: false,
            write_close: None,
        }
    }

    /// Current capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Number of buffered, not yet consumed bytes.
    pub fn len(&self) -> usize {
        self.tail - self.head
    }

    /// True when nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    /// True when no further byte fits without growing.
    pub fn is_full(&self) -> bool {
        self.len() == self.capacity()
    }

    /// Lets enqueue and put grow the buffer instead of stopping when full.
    pub fn set_auto_expand(&mut self, enabled: bool) {
        self.auto_expand = enabled;
    }

    /// Whether the buffer grows on demand.
    pub fn is_auto_expand(&self) -> bool {
        self.auto_expand
    }

    /// Whether an enqueue can make progress.
    pub fn is_readable(&self) -> bool {
        (!self.is_full() || self.auto_expand) && !self.read_eof
    }

    /// Whether a dequeue can make progress, including the final close step.
    pub fn is_writable(&self) -> bool {
        !self.is_empty() || (self.read_eof && !self.write_eof)
    }

    /// Drained and the source has ended.
    pub fn is_eof(&self) -> bool {
        self.is_empty() && self.read_eof
    }

    /// Whether the source has signalled end of stream.
    pub fn is_read_eof(&self) -> bool {
        self.read_eof
    }

    /// Whether the write-close transition has happened.
    pub fn is_write_eof(&self) -> bool {
        self.write_eof
    }

    /// Marks the source as ended. The close hook fires once the buffer drains.
    pub fn set_read_eof(&mut self) {
        self.read_eof = true;
    }

    /// Forgets an end-of-stream seen on the source so reading can resume.
    pub fn clear_read_eof(&mut self) {
        self.read_eof = false;
    }

    /// Latched callback failure, if any.
    pub fn error(&self) -> Option<&BufferError> {
        self.error.as_ref()
    }

    /// Clears the latched failure.
    pub fn clear_error(&mut self) {
        self.error = None;
    }

    /// Registers the hook run on the empty-and-ended transition.
    pub fn set_write_close(&mut self, hook: impl FnMut() + Send + 'static) {
        self.write_close = Some(Box::new(hook));
    }

    /// Buffered bytes, oldest first.
    pub fn as_slice(&self) -> &[u8] {
        &self.data[self.head..self.tail]
    }

    /// Enters a pindown scope and returns the absolute offset at which the
    /// next put lands. Compaction is suspended until the matching
    /// [`IoBuffer::end_pindown`].
    pub fn begin_pindown(&mut self) -> usize {
        self.pindown += 1;
        self.tail
    }

    /// Leaves a pindown scope.
    pub fn end_pindown(&mut self) {
        self.pindown = self.pindown.saturating_sub(1);
        self.reset_if_empty();
    }

    /// Whether a pindown scope is active.
    pub fn is_pinned(&self) -> bool {
        self.pindown > 0
    }

    /// Bytes put since `start`, an offset returned by
    /// [`IoBuffer::begin_pindown`]. Includes bytes already dequeued.
    pub fn pinned_region(&self, start: usize) -> &[u8] {
        &self.data[start.min(self.tail)..self.tail]
    }

    /// Shifts the unread bytes to offset zero.
    pub fn squeeze(&mut self) {
        if self.pindown > 0 || self.head == 0 {
            return;
        }
        self.data.copy_within(self.head..self.tail, 0);
        self.tail -= self.head;
        self.head = 0;
    }

    /// Changes the capacity, keeping all buffered bytes.
    pub fn resize(&mut self, capacity: usize) -> Result<()> {
        let floor = if self.pindown > 0 { self.tail } else { self.len() };
        if capacity < floor {
            return Err(TransportError::BufferResize {
                requested: capacity,
                buffered: self.len(),
            });
        }
        self.squeeze();
        self.data.resize(capacity, 0);
        Ok(())
    }

    fn tail_room(&self) -> usize {
        self.data.len() - self.tail
    }

    fn reset_if_empty(&mut self) {
        if self.head == self.tail && self.pindown == 0 {
            self.head = 0;
            self.tail = 0;
        }
    }

    /// Makes up to `want` bytes of contiguous tail room, compacting first and
    /// growing only in auto-expand mode.
    fn make_room(&mut self, want: usize) {
        if self.tail_room() >= want {
            return;
        }
        self.squeeze();
        if self.tail_room() < want && self.auto_expand {
            let needed = self.tail + want;
            let grown = needed.max(self.data.len() * 2);
            self.data.resize(grown, 0);
        }
    }

    fn close_if_drained(&mut self) {
        if self.head == self.tail && self.read_eof && !self.write_eof {
            self.write_eof = true;
            if let Some(hook) = self.write_close.as_mut() {
                hook();
            }
        }
    }

    /// Pulls at most `limit` bytes from `source` into free tail space.
    ///
    /// Returns the number of bytes added. A zero-length read latches read-EOF;
    /// a failure latches the error. `WouldBlock` and `Interrupted` are not
    /// failures and just yield zero.
    pub async fn enqueue(&mut self, source: &mut (dyn ByteSource + '_), limit: usize) -> usize {
        if self.read_eof || self.error.is_some() || limit == 0 {
            return 0;
        }
        let free = self.capacity() - self.len();
        let want = if free == 0 && self.auto_expand {
            limit.min(self.capacity().max(1))
        } else {
            limit.min(free)
        };
        if want == 0 {
            return 0;
        }
        self.make_room(want);
        let n = want.min(self.tail_room());
        if n == 0 {
            return 0;
        }
        let range = self.tail..self.tail + n;
        match source.fill(&mut self.data[range]).await {
            Ok(0) => {
                self.read_eof = true;
                self.close_if_drained();
                0
            }
            Ok(read) => {
                self.tail += read;
                read
            }
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) =>
            {
                0
            }
            Err(e) => {
                self.error = Some(BufferError::from_io(&e));
                0
            }
        }
    }

    /// Pushes at most `limit` buffered bytes into `sink`.
    ///
    /// When the buffer is empty and the source has ended this performs the
    /// one-time write-close transition instead.
    pub async fn dequeue(&mut self, sink: &mut (dyn ByteSink + '_), limit: usize) -> usize {
        if self.is_empty() {
            self.close_if_drained();
            return 0;
        }
        if self.error.is_some() || limit == 0 {
            return 0;
        }
        let n = limit.min(self.len());
        let range = self.head..self.head + n;
        match sink.drain(&self.data[range]).await {
            Ok(written) => {
                self.head += written.min(n);
                self.reset_if_empty();
                self.close_if_drained();
                written.min(n)
            }
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) =>
            {
                0
            }
            Err(e) => {
                self.error = Some(BufferError::from_io(&e));
                0
            }
        }
    }

    /// Copies as much of `src` as fits, returning the count.
    pub fn put(&mut self, src: &[u8]) -> usize {
        self.make_room(src.len());
        let n = src.len().min(self.tail_room());
        self.data[self.tail..self.tail + n].copy_from_slice(&src[..n]);
        self.tail += n;
        n
    }

    /// Copies all of `src` as one contiguous run, growing the buffer if the
    /// free space is too small. Never delivers a torn value.
    pub fn put_atomic(&mut self, src: &[u8]) -> Result<()> {
        if self.tail_room() < src.len() {
            self.squeeze();
        }
        if self.tail_room() < src.len() {
            let capacity = self.tail + src.len();
            self.resize(capacity)?;
        }
        let n = self.put(src);
        debug_assert_eq!(n, src.len());
        Ok(())
    }

    /// Copies `src` in, draining into `sink` whenever the buffer fills up.
    ///
    /// Stops early if the sink fails; the failure is latched.
    pub async fn put_flushing(
        &mut self,
        src: &[u8],
        sink: &mut (dyn ByteSink + '_),
    ) -> usize {
        let mut done = 0;
        while done < src.len() {
            done += self.put(&src[done..]);
            if done == src.len() {
                break;
            }
            let drained = self.dequeue(sink, usize::MAX).await;
            if drained == 0 && self.error.is_some() {
                break;
            }
        }
        done
    }

    /// Copies buffered bytes out to `dst`, returning the count.
    pub fn get(&mut self, dst: &mut [u8]) -> usize {
        let n = dst.len().min(self.len());
        dst[..n].copy_from_slice(&self.data[self.head..self.head + n]);
        self.head += n;
        self.reset_if_empty();
        self.close_if_drained();
        n
    }

    /// Discards up to `n` buffered bytes, returning the count.
    pub fn purge(&mut self, n: usize) -> usize {
        let n = n.min(self.len());
        self.head += n;
        self.reset_if_empty();
        self.close_if_drained();
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct FailingSource;

    #[async_trait]
    impl ByteSource for FailingSource {
        async fn fill(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
        }
    }

    struct ShortSink {
        taken: Vec<u8>,
        per_call: usize,
    }

    #[async_trait]
    impl ByteSink for ShortSink {
        async fn drain(&mut self, buf: &[u8]) -> io::Result<usize> {
            let n = buf.len().min(self.per_call);
            self.taken.extend_from_slice(&buf[..n]);
            Ok(n)
        }
    }

    #[tokio::test]
    async fn test_enqueue_dequeue_fifo() {
        let mut buf = IoBuffer::new(8);
        let mut src: &[u8] = b"hello world";
        assert_eq!(buf.enqueue(&mut src, usize::MAX).await, 8);
        assert!(buf.is_full());
        assert!(!buf.is_readable());

        let mut sink = ShortSink {
            taken: Vec::new(),
            per_call: 3,
        };
        assert_eq!(buf.dequeue(&mut sink, usize::MAX).await, 3);
        assert_eq!(buf.enqueue(&mut src, usize::MAX).await, 3);
        while !buf.is_empty() {
            buf.dequeue(&mut sink, usize::MAX).await;
        }
        assert_eq!(sink.taken, b"hello world");
    }

    #[tokio::test]
    async fn test_enqueue_respects_limit() {
        let mut buf = IoBuffer::new(64);
        let mut src: &[u8] = b"abcdefgh";
        assert_eq!(buf.enqueue(&mut src, 3).await, 3);
        assert_eq!(buf.as_slice(), b"abc");
    }

    #[tokio::test]
    async fn test_read_eof_and_single_close() {
        let closes = Arc::new(AtomicUsize::new(0));
        let counter = closes.clone();
        let mut buf = IoBuffer::new(16);
        buf.set_write_close(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let mut src: &[u8] = b"abc";
        assert_eq!(buf.enqueue(&mut src, usize::MAX).await, 3);
        assert_eq!(buf.enqueue(&mut src, usize::MAX).await, 0);
        assert!(buf.is_read_eof());
        assert!(!buf.is_eof());
        assert!(buf.is_writable());

        let mut out = Vec::new();
        assert_eq!(buf.dequeue(&mut out, usize::MAX).await, 3);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert!(buf.is_write_eof());
        assert!(!buf.is_writable());

        buf.dequeue(&mut out, usize::MAX).await;
        let mut scratch = [0u8; 4];
        buf.get(&mut scratch);
        buf.purge(1);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_error_is_sticky() {
        let mut buf = IoBuffer::new(16);
        assert_eq!(buf.enqueue(&mut FailingSource, usize::MAX).await, 0);
        let err = buf.error().cloned().unwrap();
        assert_eq!(err.kind, io::ErrorKind::ConnectionReset);

        let mut src: &[u8] = b"xyz";
        assert_eq!(buf.enqueue(&mut src, usize::MAX).await, 0);
        assert!(buf.error().is_some());

        buf.clear_error();
        assert_eq!(buf.enqueue(&mut src, usize::MAX).await, 3);
    }

    #[test]
    fn test_put_get_purge() {
        let mut buf = IoBuffer::new(6);
        assert_eq!(buf.put(b"abcdefgh"), 6);
        let mut out = [0u8; 2];
        assert_eq!(buf.get(&mut out), 2);
        assert_eq!(&out, b"ab");
        assert_eq!(buf.purge(2), 2);
        assert_eq!(buf.as_slice(), b"ef");
        // compaction makes room at the tail
        assert_eq!(buf.put(b"wxyz"), 4);
        assert_eq!(buf.as_slice(), b"efwxyz");
    }

    #[test]
    fn test_auto_expand_grows() {
        let mut buf = IoBuffer::new(4);
        buf.set_auto_expand(true);
        assert!(buf.is_auto_expand());
        assert!(buf.is_readable());
        assert_eq!(buf.put(b"0123456789"), 10);
        assert!(buf.capacity() >= 10);
        assert_eq!(buf.as_slice(), b"0123456789");
    }

    #[test]
    fn test_put_atomic_resizes() {
        let mut buf = IoBuffer::new(4);
        buf.put(b"ab");
        buf.put_atomic(b"cdefgh").unwrap();
        assert_eq!(buf.as_slice(), b"abcdefgh");
        assert_eq!(buf.capacity(), 8);
    }

    #[test]
    fn test_resize_refuses_to_drop_bytes() {
        let mut buf = IoBuffer::new(8);
        buf.put(b"abcdef");
        assert!(matches!(
            buf.resize(4),
            Err(TransportError::BufferResize { requested: 4, buffered: 6 })
        ));
        buf.resize(32).unwrap();
        assert_eq!(buf.as_slice(), b"abcdef");
    }

    #[test]
    fn test_pindown_suspends_compaction() {
        let mut buf = IoBuffer::new(8);
        buf.put(b"xx");
        buf.purge(1);
        let start = buf.begin_pindown();
        assert_eq!(start, 2);
        buf.put(b"abc");
        buf.squeeze();
        assert_eq!(buf.pinned_region(start), b"abc");
        assert_eq!(buf.as_slice(), b"xabc");
        buf.purge(4);
        // pinned: cursors are not reset even though the buffer is empty
        assert_eq!(buf.pinned_region(start), b"abc");
        buf.end_pindown();
        assert!(!buf.is_pinned());
        assert_eq!(buf.put(b"12345678"), 8);
    }

    #[tokio::test]
    async fn test_put_flushing_drains_when_full() {
        let mut buf = IoBuffer::new(4);
        let mut sink = Vec::new();
        let n = buf.put_flushing(b"0123456789", &mut sink).await;
        assert_eq!(n, 10);
        let mut rest = [0u8; 8];
        let k = buf.get(&mut rest);
        sink.extend_from_slice(&rest[..k]);
        assert_eq!(sink, b"0123456789");
    }
}
