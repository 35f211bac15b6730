//! Typed wire codec.
//!
//! Every value carries an implicit one-letter tag that fixes its wire form:
//!
//! | tag | Rust type | wire form |
//! |-----|-----------|-----------|
//! | `c` | `i8`, `u8` | 1 byte |
//! | `h` | `i16`, `u16` | 2 bytes, big-endian |
//! | `i` | `i32`, `u32`, [`StatusCode`] | 4 bytes, big-endian |
//! | `o` | `i64` | high then low 32-bit half, big-endian |
//! | `s` | `String`, `&str` | 4-byte length, raw bytes |
//! | `b` | [`Blob`] / [`FixedBuf`] | 4-byte actual length, raw bytes |
//!
//! Tuples encode their members in order, so a message signature such as
//! `"isi"` is simply `(i32, String, i32)`.
//!
//! An `s` value is a byte string. Decoding into `String` insists on UTF-8;
//! decoding into [`OsString`] accepts any bytes and suits path names.

use async_trait::async_trait;
use std::borrow::Cow;
use std::ffi::{OsStr, OsString};

use crate::connection::{Connection, RecvMode};
use crate::error::{Result, TransportError};
use crate::status::StatusCode;

/// Longest string that is staged whole in the inbound buffer before it is
/// copied out.
const MAX_ATOMIC_STRING: usize = 65536;

/// Largest string or buffer length accepted from a peer.
pub const MAX_VALUE_LEN: usize = 64 << 20;

/// Wire tag of a scalar or variable-length value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tag {
    /// 8-bit integer.
    Char,
    /// 16-bit integer.
    Short,
    /// 32-bit integer.
    Int,
    /// 64-bit file offset.
    Offset,
    /// Length-prefixed string.
    Str,
    /// Length-prefixed fixed-capacity buffer.
    Buf,
}

impl Tag {
    /// The one-letter form used in message signatures.
    pub fn as_char(self) -> char {
        match self {
            Tag::Char => 'c',
            Tag::Short => 'h',
            Tag::Int => 'i',
            Tag::Offset => 'o',
            Tag::Str => 's',
            Tag::Buf => 'b',
        }
    }
}

/// Values that can be marshalled onto the wire.
pub trait WireEncode {
    /// Appends the wire form of `self` to `out`.
    fn encode(&self, out: &mut Vec<u8>);
}

/// Values that can be unmarshalled from a [`WireReader`].
#[async_trait]
pub trait WireDecode: Sized + Send + 'static {
    /// Reads one value.
    async fn decode(rx: &mut WireReader<'_>) -> Result<Self>;
}

/// Outgoing `b` value.
#[derive(Debug, Clone, Copy)]
pub struct Blob<'a>(pub &'a [u8]);

/// Incoming `b` value read into a buffer of capacity `CAP`.
///
/// `data` holds at most `CAP` bytes; `actual` is the length the sender
/// declared, which may be larger. The excess never stays on the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixedBuf<const CAP: usize> {
    /// Received bytes, truncated to `CAP`.
    pub data: Vec<u8>,
    /// Length declared by the sender.
    pub actual: usize,
}

impl<const CAP: usize> FixedBuf<CAP> {
    /// True if the sender's value did not fit.
    pub fn is_truncated(&self) -> bool {
        self.actual > CAP
    }
}

/// Cursor over one inbound message.
///
/// Tracks whether any byte of the message has been consumed so that end of
/// stream can be told apart: before the first byte it is a clean close, at a
/// value boundary inside the message it is unexpected, and inside a value it
/// is a protocol violation.
pub struct WireReader<'a> {
    conn: &'a mut Connection,
    mode: RecvMode,
    started: bool,
    clean_eof: bool,
    last_tag: Option<Tag>,
}

impl<'a> WireReader<'a> {
    /// Starts reading a message from `conn`.
    pub fn new(conn: &'a mut Connection, mode: RecvMode) -> Self {
        Self {
            conn,
            mode,
            started: false,
            clean_eof: false,
            last_tag: None,
        }
    }

    /// Reads exactly `buf.len()` bytes belonging to a value tagged `tag`.
    pub async fn read_exact(&mut self, tag: Tag, buf: &mut [u8]) -> Result<()> {
        self.last_tag = Some(tag);
        if buf.is_empty() {
            return Ok(());
        }
        let n = self.conn.recv_exact(self.mode, buf).await?;
        if n == buf.len() {
            self.started = true;
            return Ok(());
        }
        if n == 0 && !self.started {
            self.clean_eof = true;
            return Err(TransportError::UnexpectedEof { tag: tag.as_char() });
        }
        if n == 0 {
            return Err(TransportError::UnexpectedEof { tag: tag.as_char() });
        }
        Err(TransportError::protocol(format!(
            "'{}' value truncated after {} of {} bytes",
            tag.as_char(),
            n,
            buf.len()
        )))
    }

    async fn read_array<const N: usize>(&mut self, tag: Tag) -> Result<[u8; N]> {
        let mut raw = [0u8; N];
        self.read_exact(tag, &mut raw).await?;
        Ok(raw)
    }

    /// Reads a value length prefix for `tag`, rejecting negative or huge ones.
    async fn read_len(&mut self, tag: Tag) -> Result<usize> {
        let raw = i32::from_be_bytes(self.read_array::<4>(tag).await?);
        if raw < 0 || raw as usize > MAX_VALUE_LEN {
            return Err(TransportError::protocol(format!(
                "'{}' length {} out of range",
                tag.as_char(),
                raw
            )));
        }
        Ok(raw as usize)
    }

    async fn discard(&mut self, tag: Tag, n: usize) -> Result<()> {
        let purged = self.conn.purge(self.mode, n).await?;
        if purged < n {
            return Err(TransportError::protocol(format!(
                "'{}' value truncated while discarding {} bytes",
                tag.as_char(),
                n
            )));
        }
        Ok(())
    }

    /// Reads a `b` value into `dst`, returning the sender's declared length.
    ///
    /// At most `dst.len()` bytes are copied; any excess is discarded from the
    /// stream.
    pub async fn read_fixed(&mut self, dst: &mut [u8]) -> Result<usize> {
        let actual = self.read_len(Tag::Buf).await?;
        let kept = actual.min(dst.len());
        self.read_exact(Tag::Buf, &mut dst[..kept]).await?;
        if actual > kept {
            self.discard(Tag::Buf, actual - kept).await?;
        }
        Ok(actual)
    }

    /// Reads an `s` value as raw bytes.
    pub async fn read_string_bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.read_len(Tag::Str).await?;
        if self.mode == RecvMode::Buffered && len <= MAX_ATOMIC_STRING {
            self.conn.recv_ahead(len).await?;
        }
        let mut bytes = vec![0u8; len];
        self.read_exact(Tag::Str, &mut bytes).await?;
        Ok(bytes)
    }

    fn hit_clean_eof(&self) -> bool {
        self.clean_eof
    }

    fn last_tag_char(&self) -> char {
        self.last_tag.map(Tag::as_char).unwrap_or('?')
    }
}

macro_rules! wire_int {
    ($ty:ty, $tag:expr) => {
        impl WireEncode for $ty {
            fn encode(&self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_be_bytes());
            }
        }

        #[async_trait]
        impl WireDecode for $ty {
            async fn decode(rx: &mut WireReader<'_>) -> Result<Self> {
                Ok(<$ty>::from_be_bytes(
                    rx.read_array::<{ std::mem::size_of::<$ty>() }>($tag).await?,
                ))
            }
        }
    };
}

wire_int!(i8, Tag::Char);
wire_int!(u8, Tag::Char);
wire_int!(i16, Tag::Short);
wire_int!(u16, Tag::Short);
wire_int!(i32, Tag::Int);
wire_int!(u32, Tag::Int);

impl WireEncode for i64 {
    fn encode(&self, out: &mut Vec<u8>) {
        let bits = *self as u64;
        out.extend_from_slice(&((bits >> 32) as u32).to_be_bytes());
        out.extend_from_slice(&(bits as u32).to_be_bytes());
    }
}

#[async_trait]
impl WireDecode for i64 {
    async fn decode(rx: &mut WireReader<'_>) -> Result<Self> {
        let raw = rx.read_array::<8>(Tag::Offset).await?;
        let hi = u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]) as u64;
        let lo = u32::from_be_bytes([raw[4], raw[5], raw[6], raw[7]]) as u64;
        Ok(((hi << 32) | lo) as i64)
    }
}

impl WireEncode for StatusCode {
    fn encode(&self, out: &mut Vec<u8>) {
        self.code().encode(out);
    }
}

#[async_trait]
impl WireDecode for StatusCode {
    async fn decode(rx: &mut WireReader<'_>) -> Result<Self> {
        Ok(StatusCode::from_code(i32::decode(rx).await?))
    }
}

impl WireEncode for str {
    fn encode(&self, out: &mut Vec<u8>) {
        (self.len() as i32).encode(out);
        out.extend_from_slice(self.as_bytes());
    }
}

impl WireEncode for String {
    fn encode(&self, out: &mut Vec<u8>) {
        self.as_str().encode(out);
    }
}

#[async_trait]
impl WireDecode for String {
    async fn decode(rx: &mut WireReader<'_>) -> Result<Self> {
        let bytes = rx.read_string_bytes().await?;
        String::from_utf8(bytes)
            .map_err(|_| TransportError::protocol("'s' value is not valid UTF-8"))
    }
}

/// Raw bytes of an OS string as they go on the wire.
pub fn os_str_bytes(s: &OsStr) -> Cow<'_, [u8]> {
    #[cfg(unix)]
    {
        use std::os::unix::ffi::OsStrExt;
        Cow::Borrowed(s.as_bytes())
    }
    #[cfg(not(unix))]
    {
        match s.to_string_lossy() {
            Cow::Borrowed(text) => Cow::Borrowed(text.as_bytes()),
            Cow::Owned(text) => Cow::Owned(text.into_bytes()),
        }
    }
}

/// OS string holding exactly `bytes` where the platform allows it.
pub fn os_string_from_bytes(bytes: Vec<u8>) -> OsString {
    #[cfg(unix)]
    {
        use std::os::unix::ffi::OsStringExt;
        OsString::from_vec(bytes)
    }
    #[cfg(not(unix))]
    {
        OsString::from(String::from_utf8_lossy(&bytes).into_owned())
    }
}

impl WireEncode for OsStr {
    fn encode(&self, out: &mut Vec<u8>) {
        let bytes = os_str_bytes(self);
        (bytes.len() as i32).encode(out);
        out.extend_from_slice(&bytes);
    }
}

impl WireEncode for OsString {
    fn encode(&self, out: &mut Vec<u8>) {
        self.as_os_str().encode(out);
    }
}

#[async_trait]
impl WireDecode for OsString {
    async fn decode(rx: &mut WireReader<'_>) -> Result<Self> {
        Ok(os_string_from_bytes(rx.read_string_bytes().await?))
    }
}

impl WireEncode for Blob<'_> {
    fn encode(&self, out: &mut Vec<u8>) {
        (self.0.len() as i32).encode(out);
        out.extend_from_slice(self.0);
    }
}

#[async_trait]
impl<const CAP: usize> WireDecode for FixedBuf<CAP> {
    async fn decode(rx: &mut WireReader<'_>) -> Result<Self> {
        let mut data = vec![0u8; CAP];
        let actual = rx.read_fixed(&mut data).await?;
        data.truncate(actual.min(CAP));
        Ok(Self { data, actual })
    }
}

impl<T: WireEncode + ?Sized> WireEncode for &T {
    fn encode(&self, out: &mut Vec<u8>) {
        (**self).encode(out);
    }
}

impl WireEncode for () {
    fn encode(&self, _out: &mut Vec<u8>) {}
}

#[async_trait]
impl WireDecode for () {
    async fn decode(_rx: &mut WireReader<'_>) -> Result<Self> {
        Ok(())
    }
}

macro_rules! wire_tuple {
    ($($name:ident),+) => {
        impl<$($name: WireEncode),+> WireEncode for ($($name,)+) {
            #[allow(non_snake_case)]
            fn encode(&self, out: &mut Vec<u8>) {
                let ($($name,)+) = self;
                $($name.encode(out);)+
            }
        }

        #[async_trait]
        impl<$($name: WireDecode),+> WireDecode for ($($name,)+) {
            async fn decode(rx: &mut WireReader<'_>) -> Result<Self> {
                Ok(($($name::decode(rx).await?,)+))
            }
        }
    };
}

wire_tuple!(A);
wire_tuple!(A, B);
wire_tuple!(A, B, C);
wire_tuple!(A, B, C, D);
wire_tuple!(A, B, C, D, E);
wire_tuple!(A, B, C, D, E, F);

impl Connection {
    /// Encodes `value` into the outbound buffer. Nothing reaches the
    /// transport until the buffer fills or is flushed.
    pub async fn send<T: WireEncode + ?Sized>(&mut self, value: &T) -> Result<()> {
        let mut out = Vec::new();
        value.encode(&mut out);
        self.write_bytes(&out).await
    }

    /// Receives one message. Pending output is flushed first.
    ///
    /// Returns `Ok(None)` if the stream ended cleanly before the first byte.
    pub async fn recv<T: WireDecode>(&mut self, mode: RecvMode) -> Result<Option<T>> {
        self.flush().await?;
        let mut rx = WireReader::new(self, mode);
        let decoded = T::decode(&mut rx).await;
        match decoded {
            Ok(value) => Ok(Some(value)),
            Err(TransportError::UnexpectedEof { .. }) if rx.hit_clean_eof() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Like [`Connection::recv`], treating end of stream as an error.
    pub async fn recv_value<T: WireDecode>(&mut self, mode: RecvMode) -> Result<T> {
        self.flush().await?;
        let mut rx = WireReader::new(self, mode);
        let decoded = T::decode(&mut rx).await;
        match decoded {
            Ok(value) => Ok(value),
            Err(TransportError::UnexpectedEof { .. }) if rx.hit_clean_eof() => {
                Err(TransportError::UnexpectedEof {
                    tag: rx.last_tag_char(),
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Receives a `b` value into `dst`, returning the sender's declared
    /// length, or `None` at a clean end of stream.
    pub async fn recv_fixed(&mut self, mode: RecvMode, dst: &mut [u8]) -> Result<Option<usize>> {
        self.flush().await?;
        let mut rx = WireReader::new(self, mode);
        let decoded = rx.read_fixed(dst).await;
        match decoded {
            Ok(actual) => Ok(Some(actual)),
            Err(TransportError::UnexpectedEof { .. }) if rx.hit_clean_eof() => Ok(None),
            Err(e) => Err(e),
        }
    }
}
