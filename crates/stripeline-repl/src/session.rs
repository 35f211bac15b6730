//! Replication batches between a source and a destination.
//!
//! The destination drives a batch: it authenticates a control connection,
//! binds a data listener and sends [`REPLICATE_BATCH`] with the transfer
//! parameters, the listener port and the file list. The source validates the
//! request, opens one data connection per division to that port and learns
//! each connection's division index from the destination. Files then flow
//! one after the other; per file, data connection 0 carries the source
//! status and size, the content is spread over all divisions, and both sides
//! exchange their final status. The source closes the batch with a summary
//! on the control connection, which stays open for further batches.

use async_trait::async_trait;
use std::ffi::{OsStr, OsString};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use stripeline_transport::auth::Authenticator;
use stripeline_transport::pool::{ConnectionPool, PoolConfig, PoolKey};
use stripeline_transport::ratelimit::RateLimitConfig;
use stripeline_transport::rpc::{serve_rpc, Dispatch, RpcHandler, RpcReply};
use stripeline_transport::tcp::{PortRange, TcpTransport};
use stripeline_transport::wire::{os_str_bytes, os_string_from_bytes};
use stripeline_transport::{Connection, RecvMode, StatusCode, TransportError};
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use crate::config::{ReplConfig, TransferConfig};
use crate::disksync::{ByteSyncCycle, DiskSyncPolicy};
use crate::engine::{
    receive_file, send_file, DataChannel, ReceiveOptions, SendOptions, TransferOutcome,
    TransferVariant,
};
use crate::error::{ReplError, Result};
use crate::metadata::{replica_mode, MetadataLookup};
use crate::sink::{file_sink, DiscardSink, ReplicaSink};
use crate::stripe::{
    limit_divisions, StripeLayout, ALGORITHM_LATEST, MAX_INTERLEAVE, MAX_SYNC_STRIPE_SIZE,
};

/// RPC command that starts a replication batch.
pub const REPLICATE_BATCH: i32 = 1;

/// Parameters of one batch as negotiated on the control connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchRequest {
    /// Striping algorithm version.
    pub algorithm_version: i32,
    /// Requested division count.
    pub divisions: usize,
    /// Interleave factor; 0 for contiguous division.
    pub interleave: u64,
    /// The source waits for every division at each stripe boundary.
    pub send_stripe_sync: bool,
    /// Port of the destination's data listener.
    pub port: u16,
}

type BatchArgs = (i32, i32, i32, i32, i32);

impl BatchRequest {
    fn to_wire(self) -> BatchArgs {
        (
            self.algorithm_version,
            self.divisions as i32,
            self.interleave as i32,
            self.send_stripe_sync as i32,
            self.port as i32,
        )
    }

    fn from_wire(args: BatchArgs) -> Option<Self> {
        let (algorithm_version, divisions, interleave, send_stripe_sync, port) = args;
        Some(Self {
            algorithm_version,
            divisions: usize::try_from(divisions).ok()?,
            interleave: u64::try_from(interleave).ok()?,
            send_stripe_sync: send_stripe_sync != 0,
            port: u16::try_from(port).ok().filter(|p| *p != 0)?,
        })
    }
}

/// A file to replicate, optionally narrowed to a named section.
///
/// Names are kept as raw OS strings; they cross the wire byte for byte and
/// need not be UTF-8.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FileEntry {
    /// Path relative to the spool root.
    pub file: OsString,
    /// Section name; empty for the whole file.
    pub section: OsString,
}

impl FileEntry {
    /// Entry for a whole file.
    pub fn new(file: impl Into<OsString>) -> Self {
        Self {
            file: file.into(),
            section: OsString::new(),
        }
    }

    /// Entry for a section of a file.
    pub fn with_section(file: impl Into<OsString>, section: impl Into<OsString>) -> Self {
        Self {
            file: file.into(),
            section: section.into(),
        }
    }

    /// Parses `PATH[:SECTION]`, splitting at the last colon.
    pub fn parse(arg: impl AsRef<OsStr>) -> Self {
        let arg = arg.as_ref();
        let bytes = os_str_bytes(arg);
        match bytes.iter().rposition(|b| *b == b':') {
            Some(colon) if colon > 0 => Self::with_section(
                os_string_from_bytes(bytes[..colon].to_vec()),
                os_string_from_bytes(bytes[colon + 1..].to_vec()),
            ),
            _ => Self::new(arg),
        }
    }

    /// Location of this entry under `root`; sections live in their own file
    /// named `file:section`.
    pub fn spool_path(&self, root: &Path) -> PathBuf {
        let bytes = os_str_bytes(&self.file);
        let start = bytes.iter().position(|b| *b != b'/').unwrap_or(bytes.len());
        let mut name = os_string_from_bytes(bytes[start..].to_vec());
        if !self.section.is_empty() {
            name.push(":");
            name.push(&self.section);
        }
        root.join(name)
    }
}

impl std::fmt::Display for FileEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.section.is_empty() {
            write!(f, "{}", self.file.to_string_lossy())
        } else {
            write!(f, "{}:{}", self.file.to_string_lossy(), self.section.to_string_lossy())
        }
    }
}

/// Writes a file list and its `("", "")` terminator.
pub async fn send_file_list(conn: &mut Connection, files: &[FileEntry]) -> Result<()> {
    for entry in files {
        conn.send(&(entry.file.as_os_str(), entry.section.as_os_str())).await?;
    }
    conn.send(&("", "")).await?;
    Ok(())
}

/// Reads a file list up to its terminator.
pub async fn recv_file_list(conn: &mut Connection, mode: RecvMode) -> Result<Vec<FileEntry>> {
    let mut files = Vec::new();
    loop {
        let (file, section): (OsString, OsString) = conn.recv_value(mode).await?;
        if file.is_empty() {
            if !section.is_empty() {
                return Err(TransportError::protocol(format!(
                    "file list terminator carries section {:?}",
                    section
                ))
                .into());
            }
            return Ok(files);
        }
        files.push(FileEntry { file, section });
    }
}

/// Places a data connection at the division index its peer named.
///
/// Indices outside the slot range and indices seen before are both fatal.
pub fn assign_division<T>(slots: &mut [Option<T>], index: i32, item: T) -> Result<()> {
    let slot = usize::try_from(index)
        .ok()
        .filter(|i| *i < slots.len())
        .ok_or(ReplError::InvalidDivision {
            index,
            divisions: slots.len(),
        })?;
    if slots[slot].is_some() {
        return Err(ReplError::DuplicateDivision { index: slot });
    }
    slots[slot] = Some(item);
    Ok(())
}

/// Progress of one file through a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileState {
    /// Nothing exchanged yet.
    Idle,
    /// Source status and size are known.
    SizeExchanged {
        /// Bytes promised by the source.
        size: u64,
    },
    /// Content is moving.
    Transferring(TransferVariant),
    /// Both sides have reported.
    ResultReported(StatusCode),
}

fn enter(entry: &FileEntry, state: FileState) {
    debug!(file = %entry, ?state, "file state");
}

/// Outcome of one file at the destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileResult {
    /// File replicated.
    pub entry: FileEntry,
    /// Size the source promised; 0 when it reported a failure up front.
    pub size: u64,
    /// First failure on either side, or `Ok`.
    pub status: StatusCode,
    /// What the content transfer did, when one ran.
    pub transfer: Option<TransferOutcome>,
}

/// Outcome of a whole batch at the destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchSummary {
    /// Per-file results in request order.
    pub files: Vec<FileResult>,
    /// Session status reported by the source.
    pub source_status: StatusCode,
    /// Files the source reports having handled.
    pub source_files: usize,
}

impl BatchSummary {
    /// Files that failed.
    pub fn failures(&self) -> impl Iterator<Item = &FileResult> {
        self.files.iter().filter(|f| !f.status.is_ok())
    }
}

fn peer_ip(conn: &Connection) -> Result<IpAddr> {
    conn.peer()
        .parse::<SocketAddr>()
        .map(|addr| addr.ip())
        .map_err(|_| {
            let reason = format!("peer {:?} has no IP address", conn.peer());
            ReplError::Transport(TransportError::protocol(reason))
        })
}

/// Source-side settings.
#[derive(Debug, Clone)]
pub struct SourceOptions {
    /// Directory files are read from.
    pub spool_root: PathBuf,
    /// Striping algorithm version served.
    pub algorithm_version: i32,
    /// Largest division count accepted.
    pub max_divisions: usize,
    /// Bytes per local read.
    pub file_read_size: usize,
    /// Per-division pacing.
    pub rate: RateLimitConfig,
}

impl SourceOptions {
    /// Source settings from a loaded configuration.
    pub fn from_config(config: &ReplConfig) -> Self {
        Self {
            spool_root: config.server.spool_root.clone(),
            algorithm_version: config.server.algorithm_version,
            max_divisions: config.server.max_divisions,
            file_read_size: config.transfer.file_read_size,
            rate: RateLimitConfig::with_rate(config.transfer.rate_limit_bps),
        }
    }

    fn check(&self, request: &BatchRequest) -> StatusCode {
        if request.algorithm_version != self.algorithm_version
            || request.algorithm_version != ALGORITHM_LATEST
        {
            return StatusCode::InvalidArgument;
        }
        if request.divisions == 0 || request.divisions > self.max_divisions {
            return StatusCode::InvalidArgument;
        }
        if request.interleave > MAX_INTERLEAVE {
            return StatusCode::InvalidArgument;
        }
        let stripe = request.interleave * request.divisions as u64;
        if request.send_stripe_sync && (request.interleave == 0 || stripe > MAX_SYNC_STRIPE_SIZE) {
            return StatusCode::InvalidArgument;
        }
        StatusCode::Ok
    }
}

struct ServerShared {
    options: SourceOptions,
    transport: TcpTransport,
    auth: Arc<dyn Authenticator>,
}

/// Source side of replication: serves batches requested by destinations.
#[derive(Clone)]
pub struct ReplicationServer {
    shared: Arc<ServerShared>,
}

impl ReplicationServer {
    /// Creates a server.
    pub fn new(
        options: SourceOptions,
        transport: TcpTransport,
        auth: Arc<dyn Authenticator>,
    ) -> Self {
        Self {
            shared: Arc::new(ServerShared {
                options,
                transport,
                auth,
            }),
        }
    }

    /// Accepts control connections forever, one task each.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        info!(addr = ?listener.local_addr().ok(), "replication server listening");
        loop {
            let conn = self.shared.transport.accept(&listener).await?;
            let server = self.clone();
            tokio::spawn(async move {
                let peer = conn.peer().to_string();
                if let Err(e) = server.handle_control(conn).await {
                    warn!(peer = %peer, error = %e, "control connection failed");
                }
            });
        }
    }

    /// Authenticates a control connection and serves its batches until the
    /// destination hangs up.
    pub async fn handle_control(&self, mut conn: Connection) -> Result<()> {
        let identity = self.shared.auth.authorize(&mut conn).await?;
        let handler = BatchHandler {
            shared: self.shared.clone(),
            peer_ip: peer_ip(&conn)?,
        };
        debug!(peer = conn.peer(), identity = %identity, "control connection ready");
        serve_rpc(&mut conn, &handler).await?;
        Ok(())
    }
}

struct BatchHandler {
    shared: Arc<ServerShared>,
    peer_ip: IpAddr,
}

#[async_trait]
impl RpcHandler for BatchHandler {
    async fn handle(
        &self,
        command: i32,
        conn: &mut Connection,
    ) -> stripeline_transport::Result<Dispatch> {
        if command != REPLICATE_BATCH {
            return Ok(Dispatch::Unknown);
        }
        match self.shared.run_batch(conn, self.peer_ip).await {
            Ok(()) => Ok(Dispatch::Handled),
            Err(ReplError::Transport(e)) => Err(e),
            Err(e) => {
                error!(peer = conn.peer(), error = %e, "batch aborted");
                Err(TransportError::protocol(e.to_string()))
            }
        }
    }
}

impl ServerShared {
    async fn run_batch(&self, conn: &mut Connection, peer_ip: IpAddr) -> Result<()> {
        let args: BatchArgs = conn.recv_value(RecvMode::Buffered).await?;
        let files = recv_file_list(conn, RecvMode::Buffered).await?;
        let (request, status) = match BatchRequest::from_wire(args) {
            Some(request) => (Some(request), self.options.check(&request)),
            None => (None, StatusCode::InvalidArgument),
        };
        conn.rpc_reply(status, &()).await?;
        let request = match request {
            Some(request) if status.is_ok() => request,
            _ => {
                warn!(peer = conn.peer(), ?args, %status, "batch refused");
                return Ok(());
            }
        };
        info!(
            peer = conn.peer(),
            files = files.len(),
            divisions = request.divisions,
            interleave = request.interleave,
            "batch started"
        );

        let mut channels = self.connect_divisions(peer_ip, &request).await?;
        for entry in &files {
            self.send_one(&mut channels, entry, &request).await?;
        }

        conn.send(&(StatusCode::Ok, files.len() as i32)).await?;
        conn.flush().await?;
        for ch in channels {
            if let Err(e) = ch.into_connection().flush_and_close().await {
                debug!(error = %e, "closing data connection");
            }
        }
        info!(peer = conn.peer(), files = files.len(), "batch finished");
        Ok(())
    }

    async fn connect_divisions(
        &self,
        peer_ip: IpAddr,
        request: &BatchRequest,
    ) -> Result<Vec<DataChannel>> {
        let addr = SocketAddr::new(peer_ip, request.port).to_string();
        let mut slots: Vec<Option<DataChannel>> = (0..request.divisions).map(|_| None).collect();
        for _ in 0..request.divisions {
            let mut conn = self.transport.connect(&addr).await?;
            self.auth.request(&mut conn).await?;
            let index: i32 = conn.recv_value(RecvMode::Just).await?;
            debug!(addr = %addr, index, "data connection assigned");
            let channel = usize::try_from(index)
                .map(|i| DataChannel::new(i, conn, &self.options.rate))
                .map_err(|_| ReplError::InvalidDivision {
                    index,
                    divisions: request.divisions,
                })?;
            assign_division(&mut slots, index, channel)?;
        }
        Ok(slots.into_iter().flatten().collect())
    }

    async fn open_source(
        &self,
        entry: &FileEntry,
    ) -> std::result::Result<(std::fs::File, u64), StatusCode> {
        let path = entry.spool_path(&self.options.spool_root);
        let file = tokio::fs::File::open(&path).await.map_err(|e| StatusCode::from_io(&e))?;
        let meta = file.metadata().await.map_err(|e| StatusCode::from_io(&e))?;
        if meta.is_dir() {
            return Err(StatusCode::IsDirectory);
        }
        Ok((file.into_std().await, meta.len()))
    }

    async fn send_one(
        &self,
        channels: &mut Vec<DataChannel>,
        entry: &FileEntry,
        request: &BatchRequest,
    ) -> Result<()> {
        enter(entry, FileState::Idle);
        let opened = self.open_source(entry).await;
        let mut status = match &opened {
            Ok(_) => StatusCode::Ok,
            Err(status) => *status,
        };

        let control = channels[0].conn_mut();
        control.send(&status).await?;
        if let Ok((_, size)) = &opened {
            control.send(&(*size as i64)).await?;
        }
        control.flush().await?;

        if let Ok((file, size)) = opened {
            enter(entry, FileState::SizeExchanged { size });
            let divisions = limit_divisions(request.algorithm_version, request.divisions, size)?;
            let layout = StripeLayout::new(size, divisions, request.interleave);
            let opts = SendOptions {
                file_read_size: self.options.file_read_size,
                stripe_sync: request.send_stripe_sync,
            };
            let variant = TransferVariant::select(divisions, opts.stripe_sync);
            enter(entry, FileState::Transferring(variant));
            let outcome = send_file(channels, Arc::new(file), &layout, &opts).await?;
            status.merge(outcome.status);
        }

        let control = channels[0].conn_mut();
        control.send(&status).await?;
        control.flush().await?;
        let remote: StatusCode = control.recv_value(RecvMode::Just).await?;
        if !status.is_ok() || !remote.is_ok() {
            warn!(file = %entry, local = %status, remote = %remote, "file not replicated");
        }
        enter(entry, FileState::ResultReported(remote));
        Ok(())
    }
}

/// Destination-side settings.
#[derive(Debug, Clone)]
pub struct DestinationOptions {
    /// Directory replicas are written to.
    pub spool_root: PathBuf,
    /// Local identity, compared with each file's owner.
    pub identity: String,
    /// Address the data listener binds to.
    pub data_host: IpAddr,
    /// Ports tried for the data listener.
    pub port_range: PortRange,
    /// How long to wait for the source's data connections.
    pub accept_timeout: Duration,
    /// Striping algorithm version requested.
    pub algorithm_version: i32,
    /// Transfer tuning.
    pub transfer: TransferConfig,
}

impl DestinationOptions {
    /// Destination settings from a loaded configuration.
    pub fn from_config(config: &ReplConfig) -> Self {
        Self {
            spool_root: config.client.spool_root.clone(),
            identity: config.client.identity.clone(),
            data_host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port_range: config.client.port_range(),
            accept_timeout: Duration::from_millis(config.client.connect_timeout_ms),
            algorithm_version: ALGORITHM_LATEST,
            transfer: config.transfer.clone(),
        }
    }

    fn request(&self, port: u16) -> BatchRequest {
        BatchRequest {
            algorithm_version: self.algorithm_version,
            divisions: self.transfer.divisions,
            interleave: self.transfer.interleave,
            send_stripe_sync: self.transfer.send_stripe_sync,
            port,
        }
    }

    fn receive_options(&self) -> ReceiveOptions {
        ReceiveOptions {
            stripe_sync: self.transfer.recv_stripe_sync,
            policy: self.sync_policy(),
        }
    }

    fn sync_policy(&self) -> DiskSyncPolicy {
        DiskSyncPolicy {
            sync_rate: self.transfer.sync_rate_bytes,
            stripe_interval: self.transfer.file_sync_stripe,
        }
    }
}

/// Creates (or truncates) a replica with `mode`, creating missing parent
/// directories.
pub async fn open_replica(path: &Path, mode: u32) -> io::Result<std::fs::File> {
    let mut options = tokio::fs::OpenOptions::new();
    options.create(true).write(true).truncate(true);
    #[cfg(unix)]
    options.mode(mode);

    let file = match options.open(path).await {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            options.open(path).await?
        }
        Err(e) => return Err(e),
    };
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await?;
    }
    #[cfg(not(unix))]
    let _ = mode;
    Ok(file.into_std().await)
}

/// Destination side of replication: requests batches from a source.
pub struct ReplicationClient {
    options: DestinationOptions,
    transport: TcpTransport,
    auth: Arc<dyn Authenticator>,
    metadata: Arc<dyn MetadataLookup>,
    pool: ConnectionPool,
}

impl ReplicationClient {
    /// Creates a client.
    pub fn new(
        options: DestinationOptions,
        transport: TcpTransport,
        auth: Arc<dyn Authenticator>,
        metadata: Arc<dyn MetadataLookup>,
    ) -> Self {
        Self {
            options,
            transport,
            auth,
            metadata,
            pool: ConnectionPool::new(PoolConfig::default()),
        }
    }

    /// Pool of idle control connections.
    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    fn pool_key(&self, addr: &str) -> Result<PoolKey> {
        let (host, port) = addr
            .rsplit_once(':')
            .and_then(|(host, port)| Some((host, port.parse::<u16>().ok()?)))
            .ok_or_else(|| ReplError::InvalidConfig {
                msg: format!("source address {:?} is not host:port", addr),
            })?;
        Ok(PoolKey::new(host, port, self.options.identity.clone()))
    }

    /// Replicates `files` from the source at `addr` into the spool.
    ///
    /// Per-file failures are reported in the summary; an `Err` means the
    /// session itself failed.
    pub async fn replicate(&self, addr: &str, files: &[FileEntry]) -> Result<BatchSummary> {
        let key = self.pool_key(addr)?;
        let mut conn = match self.pool.acquire(&key).await {
            Some(conn) => conn,
            None => {
                let mut conn = self.transport.connect(&key.addr()).await?;
                self.auth.request(&mut conn).await?;
                conn
            }
        };
        match self.run_batch(&mut conn, files).await {
            Ok(summary) => {
                self.pool.release(key, conn).await;
                Ok(summary)
            }
            Err(e) => {
                self.pool.purge_key(&key).await;
                Err(e)
            }
        }
    }

    /// Reads a file list from `io`, replicates it and writes one status per
    /// file back to `io`.
    pub async fn run_frontend(&self, addr: &str, io: &mut Connection) -> Result<BatchSummary> {
        let files = recv_file_list(io, RecvMode::Buffered).await?;
        let summary = self.replicate(addr, &files).await?;
        for result in &summary.files {
            io.send(&result.status).await?;
        }
        io.flush().await?;
        Ok(summary)
    }

    async fn run_batch(&self, conn: &mut Connection, files: &[FileEntry]) -> Result<BatchSummary> {
        let listener = self
            .transport
            .listen_in_range(self.options.data_host, self.options.port_range)
            .await?;
        let port = listener.local_addr()?.port();
        let request = self.options.request(port);

        conn.rpc_request(REPLICATE_BATCH, &request.to_wire()).await?;
        send_file_list(conn, files).await?;
        if let RpcReply::Failed(status) = conn.rpc_result::<()>(RecvMode::Buffered).await? {
            return Err(ReplError::Rejected { status });
        }
        info!(source = conn.peer(), files = files.len(), port, "batch accepted");

        let mut channels = self.accept_divisions(&listener, request.divisions).await?;
        drop(listener);

        let mut cycle = self.options.sync_policy().byte_cycle();
        let mut results = Vec::with_capacity(files.len());
        for entry in files {
            results.push(self.receive_one(&mut channels, entry, &mut cycle).await?);
        }

        let (source_status, source_files): (StatusCode, i32) =
            conn.recv_value(RecvMode::Buffered).await?;
        for ch in channels {
            if let Err(e) = ch.into_connection().flush_and_close().await {
                debug!(error = %e, "closing data connection");
            }
        }
        let summary = BatchSummary {
            files: results,
            source_status,
            source_files: source_files.max(0) as usize,
        };
        info!(
            files = summary.files.len(),
            failed = summary.failures().count(),
            "batch finished"
        );
        Ok(summary)
    }

    async fn accept_divisions(
        &self,
        listener: &TcpListener,
        divisions: usize,
    ) -> Result<Vec<DataChannel>> {
        let rate = RateLimitConfig::default();
        let mut channels = Vec::with_capacity(divisions);
        for index in 0..divisions {
            let handshake = async {
                let mut conn = self.transport.accept(listener).await?;
                let identity = self.auth.authorize(&mut conn).await?;
                Ok::<_, TransportError>((conn, identity))
            };
            let accepted = tokio::time::timeout(self.options.accept_timeout, handshake).await;
            let (mut conn, identity) = accepted.map_err(|_| TransportError::ConnectionTimeout {
                addr: format!("data listener {:?}", listener.local_addr().ok()),
                timeout_ms: self.options.accept_timeout.as_millis() as u64,
            })??;
            conn.send(&(index as i32)).await?;
            conn.flush().await?;
            debug!(peer = conn.peer(), identity = %identity, index, "data connection accepted");
            channels.push(DataChannel::new(index, conn, &rate));
        }
        Ok(channels)
    }

    async fn receive_one(
        &self,
        channels: &mut [DataChannel],
        entry: &FileEntry,
        cycle: &mut ByteSyncCycle,
    ) -> Result<FileResult> {
        enter(entry, FileState::Idle);
        let control = channels[0].conn_mut();
        let mut status: StatusCode = control.recv_value(RecvMode::Just).await?;
        let size = if status.is_ok() {
            let size: i64 = control.recv_value(RecvMode::Just).await?;
            u64::try_from(size)
                .map_err(|_| TransportError::protocol(format!("negative file size {}", size)))?
        } else {
            0
        };
        let source_ok = status.is_ok();
        enter(entry, FileState::SizeExchanged { size });

        let path = entry.spool_path(&self.options.spool_root);
        let mut created = false;
        let replica = self.prepare_replica(&path, entry, &mut status).await;
        let sink: Box<dyn ReplicaSink> = match replica {
            Some(file) => {
                created = true;
                file_sink(file)
            }
            None => Box::new(DiscardSink),
        };

        let mut transfer = None;
        if source_ok {
            let divisions = limit_divisions(self.options.algorithm_version, channels.len(), size)?;
            let layout = StripeLayout::new(size, divisions, self.options.transfer.interleave);
            let opts = self.options.receive_options();
            let variant = TransferVariant::select(divisions, opts.stripe_sync);
            enter(entry, FileState::Transferring(variant));
            let outcome = receive_file(channels, &layout, sink.as_ref(), &opts, cycle).await?;
            status.merge(outcome.status);
            transfer = Some(outcome);
        }
        drop(sink);

        let control = channels[0].conn_mut();
        let source_final: StatusCode = control.recv_value(RecvMode::Just).await?;
        status.merge(source_final);
        control.send(&status).await?;
        control.flush().await?;

        if !status.is_ok() {
            if created {
                if let Err(e) = tokio::fs::remove_file(&path).await {
                    debug!(path = %path.display(), error = %e, "removing failed replica");
                }
            }
            warn!(file = %entry, %status, "replication failed");
        }
        enter(entry, FileState::ResultReported(status));
        Ok(FileResult {
            entry: entry.clone(),
            size,
            status,
            transfer,
        })
    }

    /// Opens the replica unless the file has already failed. Failures are
    /// merged into `status`.
    async fn prepare_replica(
        &self,
        path: &Path,
        entry: &FileEntry,
        status: &mut StatusCode,
    ) -> Option<std::fs::File> {
        if !status.is_ok() {
            return None;
        }
        let meta = match self.metadata.lookup(&entry.file) {
            Ok(meta) => meta,
            Err(st) => {
                status.merge(st);
                return None;
            }
        };
        let mode = replica_mode(&meta, &self.options.identity);
        match open_replica(path, mode).await {
            Ok(file) => Some(file),
            Err(e) => {
                status.merge(StatusCode::from_io(&e));
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_file_entry() {
        assert_eq!(FileEntry::parse("a/b"), FileEntry::new("a/b"));
        assert_eq!(FileEntry::parse("a/b:idx"), FileEntry::with_section("a/b", "idx"));
        assert_eq!(FileEntry::parse(":x"), FileEntry::new(":x"));
    }

    #[cfg(unix)]
    #[test]
    fn test_non_utf8_entry_keeps_its_bytes() {
        let raw = os_string_from_bytes(b"dir/bin\xffary:sec".to_vec());
        let entry = FileEntry::parse(&raw);
        assert_eq!(os_str_bytes(&entry.file).as_ref(), &b"dir/bin\xffary"[..]);
        assert_eq!(entry.section, "sec");
        let path = entry.spool_path(Path::new("/spool"));
        assert_eq!(os_str_bytes(path.as_os_str()).as_ref(), &b"/spool/dir/bin\xffary:sec"[..]);
        assert_eq!(entry.to_string(), "dir/bin\u{fffd}ary:sec");
    }

    #[test]
    fn test_spool_path() {
        let root = Path::new("/spool");
        assert_eq!(FileEntry::new("/a/b").spool_path(root), PathBuf::from("/spool/a/b"));
        assert_eq!(
            FileEntry::with_section("a/b", "idx").spool_path(root),
            PathBuf::from("/spool/a/b:idx")
        );
    }

    #[test]
    fn test_assign_division() {
        let mut slots: Vec<Option<&str>> = vec![None; 3];
        assign_division(&mut slots, 2, "c").unwrap();
        assign_division(&mut slots, 0, "a").unwrap();
        assert!(matches!(
            assign_division(&mut slots, 2, "again"),
            Err(ReplError::DuplicateDivision { index: 2 })
        ));
        assert!(matches!(
            assign_division(&mut slots, 3, "d"),
            Err(ReplError::InvalidDivision { index: 3, divisions: 3 })
        ));
        assert!(matches!(
            assign_division(&mut slots, -1, "d"),
            Err(ReplError::InvalidDivision { index: -1, .. })
        ));
        assert_eq!(slots, vec![Some("a"), None, Some("c")]);
    }

    #[test]
    fn test_batch_request_wire_form() {
        let request = BatchRequest {
            algorithm_version: 0,
            divisions: 4,
            interleave: 65536,
            send_stripe_sync: true,
            port: 11003,
        };
        assert_eq!(request.to_wire(), (0, 4, 65536, 1, 11003));
        assert_eq!(BatchRequest::from_wire(request.to_wire()), Some(request));
        assert_eq!(BatchRequest::from_wire((0, -1, 0, 0, 11000)), None);
        assert_eq!(BatchRequest::from_wire((0, 1, 0, 0, 70000)), None);
    }

    #[test]
    fn test_source_checks_request() {
        let options = SourceOptions::from_config(&ReplConfig::default());
        let mut request = BatchRequest {
            algorithm_version: 0,
            divisions: 4,
            interleave: 0,
            send_stripe_sync: false,
            port: 11000,
        };
        assert_eq!(options.check(&request), StatusCode::Ok);
        request.send_stripe_sync = true;
        assert_eq!(options.check(&request), StatusCode::InvalidArgument);
        request.interleave = 4096;
        assert_eq!(options.check(&request), StatusCode::Ok);
        request.algorithm_version = 3;
        assert_eq!(options.check(&request), StatusCode::InvalidArgument);
        request.algorithm_version = 0;
        request.divisions = 5000;
        assert_eq!(options.check(&request), StatusCode::InvalidArgument);
    }

    #[test]
    fn test_source_caps_interleave() {
        let options = SourceOptions::from_config(&ReplConfig::default());
        let mut request = BatchRequest {
            algorithm_version: 0,
            divisions: 4,
            interleave: MAX_INTERLEAVE,
            send_stripe_sync: false,
            port: 11000,
        };
        assert_eq!(options.check(&request), StatusCode::Ok);
        request.send_stripe_sync = true;
        assert_eq!(options.check(&request), StatusCode::Ok);
        request.divisions = 5;
        assert_eq!(options.check(&request), StatusCode::InvalidArgument);
        request.send_stripe_sync = false;
        assert_eq!(options.check(&request), StatusCode::Ok);
        request.interleave = i32::MAX as u64;
        assert_eq!(options.check(&request), StatusCode::InvalidArgument);
    }

    #[tokio::test]
    async fn test_file_list_round_trip() {
        let (a, b) = tokio::io::duplex(4096);
        let mut tx = Connection::from_stream(a, "tx");
        let mut rx = Connection::from_stream(b, "rx");
        let mut files = vec![FileEntry::new("x"), FileEntry::with_section("y", "s")];
        #[cfg(unix)]
        files.push(FileEntry::new(os_string_from_bytes(vec![b'z', 0xff])));
        send_file_list(&mut tx, &files).await.unwrap();
        tx.flush().await.unwrap();
        assert_eq!(recv_file_list(&mut rx, RecvMode::Buffered).await.unwrap(), files);
    }

    #[tokio::test]
    async fn test_bad_terminator_is_protocol_error() {
        let (a, b) = tokio::io::duplex(4096);
        let mut tx = Connection::from_stream(a, "tx");
        let mut rx = Connection::from_stream(b, "rx");
        tx.send(&("", "oops")).await.unwrap();
        tx.flush().await.unwrap();
        let err = recv_file_list(&mut rx, RecvMode::Buffered).await.unwrap_err();
        assert!(matches!(err, ReplError::Transport(TransportError::Protocol { .. })));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_open_replica_creates_parents_and_sets_mode() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("deep/er/replica");
        open_replica(&path, 0o640).await.unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o7777, 0o640);
    }
}
