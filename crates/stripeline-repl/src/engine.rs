//! File content transfer across the division connections.
//!
//! The source pushes each division's bytes in ascending offset order; the
//! destination pulls them and writes them at their absolute offsets. Once a
//! transfer starts it always moves exactly the promised byte count per
//! division. Local failures on either side are folded into the outcome's
//! [`StatusCode`] (first error wins) and never stop the stream; only
//! transport failures end a transfer early.

use futures::stream::{FuturesUnordered, StreamExt};
use std::io;
use std::sync::Arc;
use stripeline_transport::ratelimit::{pace, RateLimitConfig, RateLimiter};
use stripeline_transport::{Connection, StatusCode};
use tracing::{debug, trace};

use crate::disksync::{ByteSyncCycle, DiskSyncPolicy};
use crate::error::{ReplError, Result};
use crate::sink::ReplicaSink;
use crate::stripe::{DivisionCursor, StripeLayout, MAX_INTERLEAVE, MAX_SYNC_STRIPE_SIZE};

/// Largest single network read on the destination side.
pub const MAX_CHUNK: usize = 64 << 10;

/// Bytes the source stages per blocking read call.
const STAGE_SPAN: usize = 256 << 10;

/// One data connection and the pacing state of its division.
#[derive(Debug)]
pub struct DataChannel {
    index: usize,
    conn: Connection,
    limiter: Option<RateLimiter>,
}

impl DataChannel {
    /// Wraps the connection carrying division `index`.
    pub fn new(index: usize, conn: Connection, rate: &RateLimitConfig) -> Self {
        Self {
            index,
            conn,
            limiter: RateLimiter::new(rate),
        }
    }

    /// Division index.
    pub fn index(&self) -> usize {
        self.index
    }

    /// The underlying connection.
    pub fn conn_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    /// Gives the connection back.
    pub fn into_connection(self) -> Connection {
        self.conn
    }
}

/// How a file moves across the divisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferVariant {
    /// One division, one stream.
    Sequential,
    /// Divisions race independently.
    ParallelAsync,
    /// Divisions meet at a barrier after every stripe.
    ParallelSync,
}

impl TransferVariant {
    /// Picks the variant for `divisions` streams.
    pub fn select(divisions: usize, stripe_sync: bool) -> Self {
        if divisions <= 1 {
            TransferVariant::Sequential
        } else if stripe_sync {
            TransferVariant::ParallelSync
        } else {
            TransferVariant::ParallelAsync
        }
    }
}

/// What one file transfer did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferOutcome {
    /// Variant that ran.
    pub variant: TransferVariant,
    /// First local failure, or `Ok`.
    pub status: StatusCode,
    /// Payload bytes moved across the wire.
    pub bytes: u64,
    /// Stripes completed at a barrier.
    pub stripes: u64,
    /// Replica syncs issued.
    pub syncs: u64,
}

impl TransferOutcome {
    fn new(variant: TransferVariant) -> Self {
        Self {
            variant,
            status: StatusCode::Ok,
            bytes: 0,
            stripes: 0,
            syncs: 0,
        }
    }
}

fn check_plan(channels: usize, layout: &StripeLayout, variant: TransferVariant) -> Result<()> {
    if channels < layout.divisions() {
        return Err(ReplError::InvalidPlan {
            msg: format!(
                "{} divisions planned but only {} connections",
                layout.divisions(),
                channels
            ),
        });
    }
    if layout.interleave() > MAX_INTERLEAVE {
        return Err(ReplError::InvalidPlan {
            msg: format!("interleave {} exceeds {}", layout.interleave(), MAX_INTERLEAVE),
        });
    }
    if variant == TransferVariant::ParallelSync {
        if !layout.is_striped() {
            return Err(ReplError::InvalidPlan {
                msg: "stripe synchronization needs a non-zero interleave factor".into(),
            });
        }
        if layout.full_stripe_size() > MAX_SYNC_STRIPE_SIZE {
            return Err(ReplError::InvalidPlan {
                msg: format!(
                    "stripe of {} bytes exceeds {} with stripe synchronization",
                    layout.full_stripe_size(),
                    MAX_SYNC_STRIPE_SIZE
                ),
            });
        }
    }
    Ok(())
}

/// Destination-side transfer settings.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReceiveOptions {
    /// Wait for every division at each stripe boundary.
    pub stripe_sync: bool,
    /// Replica sync cadence.
    pub policy: DiskSyncPolicy,
}

/// Receives one file's content into `sink`.
///
/// `cycle` is the session's byte-count sync state and applies to every
/// variant; the stripe cadence of `opts.policy` restarts with every file.
pub async fn receive_file(
    channels: &mut [DataChannel],
    layout: &StripeLayout,
    sink: &dyn ReplicaSink,
    opts: &ReceiveOptions,
    cycle: &mut ByteSyncCycle,
) -> Result<TransferOutcome> {
    let variant = TransferVariant::select(layout.divisions(), opts.stripe_sync);
    check_plan(channels.len(), layout, variant)?;
    debug!(size = layout.size(), divisions = layout.divisions(), ?variant, "receiving file");

    let channels = &mut channels[..layout.divisions()];
    let outcome = match variant {
        TransferVariant::Sequential => {
            receive_sequential(&mut channels[0], layout, sink, cycle).await?
        }
        TransferVariant::ParallelAsync => receive_async(channels, layout, sink, cycle).await?,
        TransferVariant::ParallelSync => {
            receive_striped(channels, layout, sink, &opts.policy, cycle).await?
        }
    };
    debug!(
        bytes = outcome.bytes,
        stripes = outcome.stripes,
        syncs = outcome.syncs,
        status = %outcome.status,
        "file received"
    );
    Ok(outcome)
}

async fn sync_replica(sink: &dyn ReplicaSink, outcome: &mut TransferOutcome) {
    let synced = sink.sync_data().await;
    outcome.status.merge_io(&synced);
    outcome.syncs += 1;
}

async fn receive_sequential(
    ch: &mut DataChannel,
    layout: &StripeLayout,
    sink: &dyn ReplicaSink,
    cycle: &mut ByteSyncCycle,
) -> Result<TransferOutcome> {
    let mut outcome = TransferOutcome::new(TransferVariant::Sequential);
    let size = layout.size();
    let mut buf = vec![0u8; (size.min(MAX_CHUNK as u64)) as usize];
    let mut offset = 0u64;

    while offset < size {
        let want = (size - offset).min(MAX_CHUNK as u64) as usize;
        let n = ch.conn.read_direct(&mut buf[..want]).await?;
        if n == 0 {
            return Err(ReplError::UnexpectedEof {
                division: ch.index,
                offset,
            });
        }
        let written = sink.write_at(offset, &buf[..n]).await;
        outcome.status.merge_io(&written);
        offset += n as u64;
        outcome.bytes += n as u64;
        if cycle.record(n as u64) {
            sync_replica(sink, &mut outcome).await;
        }
    }
    Ok(outcome)
}

/// A finished chunk read: the division slot, its channel, its cursor (not
/// yet advanced), its buffer, and the byte count plus write result.
type ChunkDone<'a> = (
    usize,
    &'a mut DataChannel,
    DivisionCursor,
    Vec<u8>,
    Result<(usize, io::Result<()>)>,
);

/// Reads the next bounded chunk of one division and writes it at the
/// division's current offset.
async fn receive_chunk<'a>(
    slot: usize,
    ch: &'a mut DataChannel,
    cursor: DivisionCursor,
    mut buf: Vec<u8>,
    sink: &'a dyn ReplicaSink,
) -> ChunkDone<'a> {
    let len = cursor.next_len(MAX_CHUNK);
    let offset = cursor.offset();
    if buf.len() < len {
        buf.resize(len, 0);
    }
    let result = match ch.conn.read_direct(&mut buf[..len]).await {
        Ok(0) => Err(ReplError::UnexpectedEof {
            division: ch.index,
            offset,
        }),
        Ok(n) => {
            let written = sink.write_at(offset, &buf[..n]).await;
            trace!(division = ch.index, offset, n, "chunk written");
            Ok((n, written))
        }
        Err(e) => Err(e.into()),
    };
    (slot, ch, cursor, buf, result)
}

async fn receive_async(
    channels: &mut [DataChannel],
    layout: &StripeLayout,
    sink: &dyn ReplicaSink,
    cycle: &mut ByteSyncCycle,
) -> Result<TransferOutcome> {
    let mut outcome = TransferOutcome::new(TransferVariant::ParallelAsync);
    let mut pending = FuturesUnordered::new();
    for (slot, (ch, cursor)) in channels.iter_mut().zip(layout.cursors()).enumerate() {
        if !cursor.is_finished() {
            pending.push(receive_chunk(slot, ch, cursor, Vec::new(), sink));
        }
    }

    while let Some((slot, ch, mut cursor, buf, result)) = pending.next().await {
        let (n, written) = result?;
        outcome.status.merge_io(&written);
        outcome.bytes += n as u64;
        if cycle.record(n as u64) {
            sync_replica(sink, &mut outcome).await;
        }
        cursor.progress(n as u64);
        if !cursor.is_finished() {
            pending.push(receive_chunk(slot, ch, cursor, buf, sink));
        }
    }
    Ok(outcome)
}

async fn receive_striped(
    channels: &mut [DataChannel],
    layout: &StripeLayout,
    sink: &dyn ReplicaSink,
    policy: &DiskSyncPolicy,
    cycle: &mut ByteSyncCycle,
) -> Result<TransferOutcome> {
    let mut outcome = TransferOutcome::new(TransferVariant::ParallelSync);
    let mut stripe_counter = policy.stripe_counter();
    let mut cursors = layout.cursors();
    let mut buffers: Vec<Vec<u8>> = vec![Vec::new(); cursors.len()];

    for stripe in 0..layout.stripe_count() {
        {
            let mut pending = FuturesUnordered::new();
            for (slot, ch) in channels.iter_mut().enumerate() {
                let cursor = cursors[slot];
                if !cursor.is_stripe_finished() {
                    let buf = std::mem::take(&mut buffers[slot]);
                    pending.push(receive_chunk(slot, ch, cursor, buf, sink));
                }
            }
            while let Some((slot, ch, mut cursor, buf, result)) = pending.next().await {
                let (n, written) = result?;
                outcome.status.merge_io(&written);
                outcome.bytes += n as u64;
                if cycle.record(n as u64) {
                    sync_replica(sink, &mut outcome).await;
                }
                cursor.advance(n as u64);
                if cursor.is_stripe_finished() {
                    cursors[slot] = cursor;
                    buffers[slot] = buf;
                } else {
                    pending.push(receive_chunk(slot, ch, cursor, buf, sink));
                }
            }
        }

        for cursor in cursors.iter_mut() {
            cursor.next_stripe();
        }
        outcome.stripes += 1;
        trace!(stripe, "stripe complete");
        if stripe_counter.stripe_done() {
            sync_replica(sink, &mut outcome).await;
        }
    }
    Ok(outcome)
}

/// Source-side transfer settings.
#[derive(Debug, Clone, Copy)]
pub struct SendOptions {
    /// Bytes per local read.
    pub file_read_size: usize,
    /// Wait for every division at each stripe boundary.
    pub stripe_sync: bool,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self {
            file_read_size: 4096,
            stripe_sync: false,
        }
    }
}

fn read_at(file: &std::fs::File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::FileExt;
        file.read_at(buf, offset)
    }
    #[cfg(windows)]
    {
        use std::os::windows::fs::FileExt;
        file.seek_read(buf, offset)
    }
}

/// Fills `buf` from `file` at `offset` in `read_size` pieces. After the
/// first failure, or when `status` already holds one, the rest is zeroed so
/// the wire byte count stays exact. A file shorter than promised reports
/// `Expired`.
fn fill_span(
    file: &std::fs::File,
    buf: &mut [u8],
    offset: u64,
    read_size: usize,
    status: &mut StatusCode,
) {
    let mut filled = 0;
    while filled < buf.len() && status.is_ok() {
        let end = (filled + read_size.max(1)).min(buf.len());
        match read_at(file, &mut buf[filled..end], offset + filled as u64) {
            Ok(0) => status.merge(StatusCode::Expired),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => status.merge(StatusCode::from_io(&e)),
        }
    }
    buf[filled..].fill(0);
}

/// Stages `len` bytes at `offset` into `buf` off the async runtime.
async fn stage(
    file: Arc<std::fs::File>,
    mut buf: Vec<u8>,
    len: usize,
    offset: u64,
    read_size: usize,
    status: StatusCode,
) -> (Vec<u8>, StatusCode) {
    buf.resize(len, 0);
    let staged = tokio::task::spawn_blocking(move || {
        let mut status = status;
        fill_span(&file, &mut buf, offset, read_size, &mut status);
        (buf, status)
    })
    .await;
    match staged {
        Ok(staged) => staged,
        Err(_) => {
            let mut status = status;
            status.merge(StatusCode::Io);
            (vec![0u8; len], status)
        }
    }
}

/// Sends one file's content from `file`.
///
/// Channels beyond `layout.divisions()` stay idle. In the asynchronous
/// variant each division runs as its own task; the channels are handed back
/// in their original order when all of them finish.
pub async fn send_file(
    channels: &mut Vec<DataChannel>,
    file: Arc<std::fs::File>,
    layout: &StripeLayout,
    opts: &SendOptions,
) -> Result<TransferOutcome> {
    let variant = TransferVariant::select(layout.divisions(), opts.stripe_sync);
    check_plan(channels.len(), layout, variant)?;
    debug!(size = layout.size(), divisions = layout.divisions(), ?variant, "sending file");

    let outcome = match variant {
        TransferVariant::Sequential => send_sequential(&mut channels[0], file, layout, opts).await?,
        TransferVariant::ParallelAsync => send_async(channels, file, layout, opts).await?,
        TransferVariant::ParallelSync => {
            send_striped(&mut channels[..layout.divisions()], file, layout, opts).await?
        }
    };
    debug!(bytes = outcome.bytes, status = %outcome.status, "file sent");
    Ok(outcome)
}

async fn send_sequential(
    ch: &mut DataChannel,
    file: Arc<std::fs::File>,
    layout: &StripeLayout,
    opts: &SendOptions,
) -> Result<TransferOutcome> {
    let mut outcome = TransferOutcome::new(TransferVariant::Sequential);
    let read_size = opts.file_read_size.max(1);
    let span = STAGE_SPAN.max(read_size) as u64;
    let mut buf = Vec::new();
    let mut offset = 0u64;

    while offset < layout.size() {
        let len = (layout.size() - offset).min(span) as usize;
        let (staged, status) =
            stage(file.clone(), buf, len, offset, read_size, outcome.status).await;
        buf = staged;
        outcome.status = status;
        write_paced(ch, &buf, read_size).await?;
        offset += len as u64;
        outcome.bytes += len as u64;
    }
    ch.conn.flush().await?;
    Ok(outcome)
}

/// Writes a staged span in `read_size` pieces, pacing each one.
async fn write_paced(ch: &mut DataChannel, span: &[u8], read_size: usize) -> Result<()> {
    for piece in span.chunks(read_size) {
        ch.conn.write_all_direct(piece).await?;
        pace(&mut ch.limiter, piece.len()).await;
    }
    Ok(())
}

/// Runs one division to completion on its own file handle.
async fn send_division(
    mut ch: DataChannel,
    mut cursor: DivisionCursor,
    file: Arc<std::fs::File>,
    read_size: usize,
) -> (DataChannel, Result<StatusCode>) {
    let mut status = StatusCode::Ok;
    let span = STAGE_SPAN.max(read_size);
    let mut buf = Vec::new();
    while !cursor.is_finished() {
        let len = cursor.next_len(span);
        let (staged, st) = stage(file.clone(), buf, len, cursor.offset(), read_size, status).await;
        buf = staged;
        status = st;
        if let Err(e) = write_paced(&mut ch, &buf, read_size).await {
            return (ch, Err(e));
        }
        cursor.progress(len as u64);
    }
    let flushed = ch.conn.flush().await;
    match flushed {
        Ok(()) => (ch, Ok(status)),
        Err(e) => (ch, Err(e.into())),
    }
}

async fn send_async(
    channels: &mut Vec<DataChannel>,
    file: Arc<std::fs::File>,
    layout: &StripeLayout,
    opts: &SendOptions,
) -> Result<TransferOutcome> {
    let mut outcome = TransferOutcome::new(TransferVariant::ParallelAsync);
    let read_size = opts.file_read_size.max(1);
    let idle = channels.split_off(layout.divisions());
    let active = std::mem::take(channels);

    let mut handles = Vec::with_capacity(active.len());
    for (ch, cursor) in active.into_iter().zip(layout.cursors()) {
        outcome.bytes += cursor.size();
        let own = Arc::new(file.try_clone()?);
        handles.push(tokio::spawn(send_division(ch, cursor, own, read_size)));
    }

    let mut failure = None;
    for handle in handles {
        match handle.await {
            Ok((ch, result)) => {
                channels.push(ch);
                match result {
                    Ok(status) => outcome.status.merge(status),
                    Err(e) => {
                        failure.get_or_insert(e);
                    }
                }
            }
            Err(e) => {
                failure.get_or_insert(ReplError::Task { msg: e.to_string() });
            }
        }
    }
    channels.extend(idle);
    match failure {
        Some(e) => Err(e),
        None => Ok(outcome),
    }
}

/// Sends one stripe: every division pushes its chunk of `stripe` at once.
async fn send_stripe(
    channels: &mut [DataChannel],
    cursors: &mut [DivisionCursor],
    stripe: &[u8],
) -> Result<()> {
    let sends = channels
        .iter_mut()
        .zip(cursors.iter_mut())
        .map(|(ch, cursor)| async move {
            while !cursor.is_stripe_finished() {
                let start = cursor.stripe_offset() as usize;
                let len = cursor.next_len(MAX_CHUNK);
                ch.conn.write_all_direct(&stripe[start..start + len]).await?;
                pace(&mut ch.limiter, len).await;
                cursor.advance(len as u64);
            }
            Ok::<(), ReplError>(())
        });
    for sent in futures::future::join_all(sends).await {
        sent?;
    }
    Ok(())
}

async fn send_striped(
    channels: &mut [DataChannel],
    file: Arc<std::fs::File>,
    layout: &StripeLayout,
    opts: &SendOptions,
) -> Result<TransferOutcome> {
    let mut outcome = TransferOutcome::new(TransferVariant::ParallelSync);
    let read_size = opts.file_read_size.max(1);
    let fs = layout.full_stripe_size();
    let count = layout.stripe_count();
    let stripe_len = |s: u64| (layout.size() - s * fs).min(fs) as usize;
    let mut cursors = layout.cursors();

    let (mut current, status) =
        stage(file.clone(), Vec::new(), stripe_len(0), 0, read_size, StatusCode::Ok).await;
    outcome.status = status;
    let mut spare = Vec::new();

    for stripe in 0..count {
        let next = stripe + 1;
        let staging = (next < count).then(|| {
            let buf = std::mem::take(&mut spare);
            stage(file.clone(), buf, stripe_len(next), next * fs, read_size, outcome.status)
        });
        let staging = async move {
            match staging {
                Some(staged) => Some(staged.await),
                None => None,
            }
        };
        let (sent, staged) = tokio::join!(send_stripe(channels, &mut cursors, &current), staging);
        sent?;
        for cursor in cursors.iter_mut() {
            cursor.next_stripe();
        }
        outcome.bytes += current.len() as u64;
        outcome.stripes += 1;
        trace!(stripe, "stripe sent");

        if let Some((buf, status)) = staged {
            outcome.status = status;
            spare = std::mem::replace(&mut current, buf);
        }
    }
    for ch in channels.iter_mut() {
        ch.conn.flush().await?;
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Mutex;
    use tokio::io::duplex;

    /// In-memory replica that can be told to fail writes past an offset.
    #[derive(Default)]
    struct MemorySink {
        data: Mutex<Vec<u8>>,
        syncs: Mutex<u64>,
        fail_from: Option<u64>,
    }

    #[async_trait::async_trait]
    impl ReplicaSink for MemorySink {
        async fn write_at(&self, offset: u64, data: &[u8]) -> io::Result<()> {
            if self.fail_from.is_some_and(|f| offset + data.len() as u64 > f) {
                return Err(io::Error::from_raw_os_error(libc::ENOSPC));
            }
            let mut buf = self.data.lock().unwrap();
            let end = offset as usize + data.len();
            if buf.len() < end {
                buf.resize(end, 0);
            }
            buf[offset as usize..end].copy_from_slice(data);
            Ok(())
        }

        async fn sync_data(&self) -> io::Result<()> {
            *self.syncs.lock().unwrap() += 1;
            Ok(())
        }
    }

    fn pattern(size: usize) -> Vec<u8> {
        (0..size).map(|i| (i * 7 + i / 251) as u8).collect()
    }

    fn source_file(content: &[u8]) -> (tempfile::NamedTempFile, Arc<std::fs::File>) {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(content).unwrap();
        tmp.flush().unwrap();
        let file = Arc::new(std::fs::File::open(tmp.path()).unwrap());
        (tmp, file)
    }

    fn channel_pairs(n: usize) -> (Vec<DataChannel>, Vec<DataChannel>) {
        let rate = RateLimitConfig::default();
        (0..n)
            .map(|i| {
                let (a, b) = duplex(64 << 10);
                (
                    DataChannel::new(i, Connection::from_stream(a, "source"), &rate),
                    DataChannel::new(i, Connection::from_stream(b, "dest"), &rate),
                )
            })
            .unzip()
    }

    async fn replicate(
        content: &[u8],
        layout: StripeLayout,
        send: SendOptions,
        recv: ReceiveOptions,
        sink: &MemorySink,
    ) -> (TransferOutcome, TransferOutcome) {
        let (_tmp, file) = source_file(content);
        let (mut tx, mut rx) = channel_pairs(layout.divisions());
        let sender = tokio::spawn(async move {
            let outcome = send_file(&mut tx, file, &layout, &send).await.unwrap();
            (tx, outcome)
        });
        let mut cycle = recv.policy.byte_cycle();
        let received = receive_file(&mut rx, &layout, sink, &recv, &mut cycle).await.unwrap();
        let (tx, sent) = sender.await.unwrap();
        let order: Vec<usize> = tx.iter().map(|c| c.index()).collect();
        assert_eq!(order, (0..layout.divisions()).collect::<Vec<_>>());
        (sent, received)
    }

    #[test]
    fn test_variant_selection() {
        assert_eq!(TransferVariant::select(1, true), TransferVariant::Sequential);
        assert_eq!(TransferVariant::select(4, false), TransferVariant::ParallelAsync);
        assert_eq!(TransferVariant::select(4, true), TransferVariant::ParallelSync);
    }

    #[tokio::test]
    async fn test_sequential_round_trip_with_byte_syncs() {
        let content = pattern(300_000);
        let sink = MemorySink::default();
        let recv = ReceiveOptions {
            stripe_sync: false,
            policy: DiskSyncPolicy {
                sync_rate: 100_000,
                stripe_interval: 0,
            },
        };
        let layout = StripeLayout::new(300_000, 1, 0);
        let (sent, received) =
            replicate(&content, layout, SendOptions::default(), recv, &sink).await;
        assert_eq!(sent.variant, TransferVariant::Sequential);
        assert_eq!(received.bytes, 300_000);
        assert_eq!(received.syncs, 3);
        assert_eq!(*sink.data.lock().unwrap(), content);
    }

    #[tokio::test]
    async fn test_async_round_trip() {
        let content = pattern(1_000_003);
        let sink = MemorySink::default();
        let layout = StripeLayout::new(content.len() as u64, 4, 8192);
        let recv = ReceiveOptions::default();
        let (sent, received) =
            replicate(&content, layout, SendOptions::default(), recv, &sink).await;
        assert_eq!(sent.variant, TransferVariant::ParallelAsync);
        assert_eq!(received.variant, TransferVariant::ParallelAsync);
        assert!(received.status.is_ok());
        assert_eq!(*sink.data.lock().unwrap(), content);
    }

    #[tokio::test]
    async fn test_contiguous_async_round_trip() {
        let content = pattern(200_000);
        let sink = MemorySink::default();
        let layout = StripeLayout::new(content.len() as u64, 3, 0);
        replicate(&content, layout, SendOptions::default(), ReceiveOptions::default(), &sink).await;
        assert_eq!(*sink.data.lock().unwrap(), content);
    }

    #[tokio::test]
    async fn test_striped_both_sides() {
        let content = pattern(700_000);
        let sink = MemorySink::default();
        let layout = StripeLayout::new(content.len() as u64, 3, 16 << 10);
        let send = SendOptions {
            file_read_size: 5000,
            stripe_sync: true,
        };
        let recv = ReceiveOptions {
            stripe_sync: true,
            policy: DiskSyncPolicy {
                sync_rate: 0,
                stripe_interval: 4,
            },
        };
        let (sent, received) = replicate(&content, layout, send, recv, &sink).await;
        assert_eq!(sent.stripes, layout.stripe_count());
        assert_eq!(received.stripes, layout.stripe_count());
        assert_eq!(received.syncs, layout.stripe_count() / 4);
        assert_eq!(*sink.data.lock().unwrap(), content);
    }

    #[tokio::test]
    async fn test_write_failure_still_drains() {
        let content = pattern(500_000);
        let sink = MemorySink {
            fail_from: Some(100_000),
            ..MemorySink::default()
        };
        let layout = StripeLayout::new(content.len() as u64, 2, 32 << 10);
        let recv = ReceiveOptions::default();
        let (_, received) = replicate(&content, layout, SendOptions::default(), recv, &sink).await;
        assert_eq!(received.status, StatusCode::NoSpace);
        assert_eq!(received.bytes, 500_000);
    }

    #[tokio::test]
    async fn test_short_source_is_zero_filled() {
        let content = pattern(10_000);
        let (_tmp, file) = source_file(&content);
        let layout = StripeLayout::new(12_000, 1, 0);
        let (mut tx, mut rx) = channel_pairs(1);
        let sender = tokio::spawn(async move {
            send_file(&mut tx, file, &layout, &SendOptions::default())
                .await
                .unwrap()
        });

        let sink = MemorySink::default();
        let mut cycle = ByteSyncCycle::default();
        let received = receive_file(&mut rx, &layout, &sink, &ReceiveOptions::default(), &mut cycle)
            .await
            .unwrap();
        let sent = sender.await.unwrap();
        assert_eq!(sent.status, StatusCode::Expired);
        assert_eq!(sent.bytes, 12_000);
        assert!(received.status.is_ok());
        let data = sink.data.lock().unwrap();
        assert_eq!(&data[..10_000], &content[..]);
        assert!(data[10_000..].iter().all(|b| *b == 0));
    }

    #[tokio::test]
    async fn test_peer_vanishing_is_fatal() {
        let (tx, mut rx) = channel_pairs(1);
        drop(tx);
        let layout = StripeLayout::new(1000, 1, 0);
        let mut cycle = ByteSyncCycle::default();
        let sink = MemorySink::default();
        let err = receive_file(&mut rx, &layout, &sink, &ReceiveOptions::default(), &mut cycle)
            .await
            .unwrap_err();
        assert!(matches!(err, ReplError::UnexpectedEof { division: 0, offset: 0 }));
    }

    #[tokio::test]
    async fn test_stripe_sync_needs_interleave() {
        let (_, mut rx) = channel_pairs(2);
        let layout = StripeLayout::new(1 << 20, 2, 0);
        let opts = ReceiveOptions {
            stripe_sync: true,
            ..ReceiveOptions::default()
        };
        let mut cycle = ByteSyncCycle::default();
        let err = receive_file(&mut rx, &layout, &MemorySink::default(), &opts, &mut cycle)
            .await
            .unwrap_err();
        assert!(matches!(err, ReplError::InvalidPlan { .. }));
    }
    #[tokio::test]
    async fn test_tiny_file_with_huge_interleave() {
        let content = pattern(1000);
        let sink = MemorySink::default();
        let layout = StripeLayout::new(content.len() as u64, 4, MAX_INTERLEAVE / 4);
        let send = SendOptions {
            file_read_size: 64 << 10,
            stripe_sync: true,
        };
        let recv = ReceiveOptions {
            stripe_sync: true,
            ..ReceiveOptions::default()
        };
        let (sent, received) = replicate(&content, layout, send, recv, &sink).await;
        assert_eq!(sent.stripes, 1);
        assert_eq!(received.bytes, 1000);
        assert_eq!(*sink.data.lock().unwrap(), content);
    }

    #[tokio::test]
    async fn test_oversized_interleave_is_rejected() {
        let (_, mut rx) = channel_pairs(2);
        let mut cycle = ByteSyncCycle::default();
        let layout = StripeLayout::new(1000, 2, MAX_INTERLEAVE + 1);
        let sink = MemorySink::default();
        let err = receive_file(&mut rx, &layout, &sink, &ReceiveOptions::default(), &mut cycle)
            .await
            .unwrap_err();
        assert!(matches!(err, ReplError::InvalidPlan { .. }));

        let layout = StripeLayout::new(1000, 8, MAX_INTERLEAVE);
        let (_, mut rx) = channel_pairs(8);
        let opts = ReceiveOptions {
            stripe_sync: true,
            ..ReceiveOptions::default()
        };
        let err = receive_file(&mut rx, &layout, &MemorySink::default(), &opts, &mut cycle)
            .await
            .unwrap_err();
        assert!(matches!(err, ReplError::InvalidPlan { .. }));
    }

    #[tokio::test]
    async fn test_striped_receive_honours_byte_syncs() {
        let content = pattern(600_000);
        let sink = MemorySink::default();
        let layout = StripeLayout::new(content.len() as u64, 3, 10_000);
        let send = SendOptions {
            file_read_size: 7000,
            stripe_sync: true,
        };
        let recv = ReceiveOptions {
            stripe_sync: true,
            policy: DiskSyncPolicy {
                sync_rate: 100_000,
                stripe_interval: 0,
            },
        };
        let (_, received) = replicate(&content, layout, send, recv, &sink).await;
        assert_eq!(received.variant, TransferVariant::ParallelSync);
        assert_eq!(received.syncs, 6);
        assert_eq!(*sink.syncs.lock().unwrap(), 6);
        assert_eq!(*sink.data.lock().unwrap(), content);
    }

    #[tokio::test]
    async fn test_spans_larger_than_read_size() {
        let content = pattern(STAGE_SPAN * 2 + 12_345);
        let sink = MemorySink::default();
        let send = SendOptions {
            file_read_size: 3000,
            stripe_sync: false,
        };
        let layout = StripeLayout::new(content.len() as u64, 1, 0);
        let (sent, _) = replicate(&content, layout, send, ReceiveOptions::default(), &sink).await;
        assert_eq!(sent.bytes, content.len() as u64);
        assert_eq!(*sink.data.lock().unwrap(), content);

        let sink = MemorySink::default();
        let layout = StripeLayout::new(content.len() as u64, 2, 0);
        replicate(&content, layout, send, ReceiveOptions::default(), &sink).await;
        assert_eq!(*sink.data.lock().unwrap(), content);
    }
}
