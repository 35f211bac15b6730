#![warn(missing_docs)]

//! Replication destination: pulls files from a source into the local spool.

use anyhow::{Context, Result};
use clap::Parser;
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use stripeline_repl::metadata::{MapMetadata, MetadataLookup, UniformMetadata};
use stripeline_repl::session::DestinationOptions;
use stripeline_repl::{FileEntry, ReplConfig, ReplicationClient};
use stripeline_transport::auth::{Authenticator, SharedSecret, TrustedPeer};
use stripeline_transport::tcp::{PortRange, TcpTransport, TcpTransportConfig};
use stripeline_transport::Connection;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "slr-client")]
#[command(about = "Stripeline replication destination", long_about = None)]
struct Args {
    /// Source address (host:port)
    #[arg(long)]
    connect: String,

    /// Number of parallel data connections
    #[arg(short = 'n', long)]
    divisions: Option<usize>,

    /// Bytes per division per stripe (0 = contiguous division)
    #[arg(short = 'i', long)]
    interleave: Option<u64>,

    /// Receiver waits for every division at each stripe boundary
    #[arg(short = 'r', long)]
    recv_stripe_sync: bool,

    /// Sender waits for every division at each stripe boundary
    #[arg(short = 's', long)]
    send_stripe_sync: bool,

    /// Sync replicas every this many stripes (0 = never)
    #[arg(short = 'S', long)]
    sync_stripes: Option<u64>,

    /// Sync replicas every this many written bytes (0 = never)
    #[arg(long)]
    sync_rate: Option<u64>,

    /// Directory replicas are written to
    #[arg(long)]
    spool: Option<PathBuf>,

    /// Local identity
    #[arg(long)]
    identity: Option<String>,

    /// Mode recorded for every file (octal)
    #[arg(long, value_parser = parse_mode)]
    mode: Option<u32>,

    /// Owner recorded for every file
    #[arg(long)]
    owner: Option<String>,

    /// JSON manifest of per-file mode and owner
    #[arg(long, conflicts_with_all = ["mode", "owner"])]
    manifest: Option<PathBuf>,

    /// Data listener port range, MIN-MAX (0-0 for an ephemeral port)
    #[arg(long, value_parser = parse_port_range)]
    port_range: Option<PortRange>,

    /// Configuration file (.toml or .json)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// File holding the shared authentication secret
    #[arg(long, env = "SLR_SECRET_FILE")]
    secret_file: Option<PathBuf>,

    /// Read the file list from stdin and write statuses to stdout in wire form
    #[arg(long)]
    frontend: bool,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,

    /// Files to replicate, as PATH[:SECTION]
    #[arg(required_unless_present = "frontend")]
    files: Vec<OsString>,
}

fn parse_mode(s: &str) -> std::result::Result<u32, String> {
    u32::from_str_radix(s.trim_start_matches("0o"), 8)
        .map_err(|e| format!("invalid octal mode {:?}: {}", s, e))
}

fn parse_port_range(s: &str) -> std::result::Result<PortRange, String> {
    let (min, max) = s.split_once('-').ok_or_else(|| format!("expected MIN-MAX, got {:?}", s))?;
    let min = min.parse::<u16>().map_err(|e| e.to_string())?;
    let max = max.parse::<u16>().map_err(|e| e.to_string())?;
    Ok(PortRange::new(min, max))
}

fn init_tracing(json: bool) {
    let registry = tracing_subscriber::registry();
    if json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .with(EnvFilter::from_default_env())
            .init();
    } else {
        registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .with(EnvFilter::from_default_env())
            .init();
    }
}

fn load_config(args: &Args) -> Result<ReplConfig> {
    let mut config = match &args.config {
        Some(path) => ReplConfig::from_file(path)
            .with_context(|| format!("{}: load config", path.display()))?,
        None => ReplConfig::default(),
    };
    let transfer = &mut config.transfer;
    if let Some(n) = args.divisions {
        transfer.divisions = n;
    }
    if let Some(i) = args.interleave {
        transfer.interleave = i;
    }
    transfer.recv_stripe_sync |= args.recv_stripe_sync;
    transfer.send_stripe_sync |= args.send_stripe_sync;
    if let Some(k) = args.sync_stripes {
        transfer.file_sync_stripe = k;
    }
    if let Some(rate) = args.sync_rate {
        transfer.sync_rate_bytes = rate;
    }
    if let Some(spool) = &args.spool {
        config.client.spool_root = spool.clone();
    }
    if let Some(identity) = &args.identity {
        config.client.identity = identity.clone();
    }
    if let Some(range) = args.port_range {
        config.client.port_min = range.min;
        config.client.port_max = range.max;
    }
    if let Some(secret) = &args.secret_file {
        config.auth.shared_secret_file = Some(secret.clone());
    }
    config.validate().context("configuration")?;
    Ok(config)
}

fn metadata(args: &Args, config: &ReplConfig) -> Result<Arc<dyn MetadataLookup>> {
    if let Some(path) = &args.manifest {
        let manifest = MapMetadata::from_file(path)
            .with_context(|| format!("{}: load manifest", path.display()))?;
        return Ok(Arc::new(manifest));
    }
    let owner = args.owner.clone().unwrap_or_else(|| config.client.identity.clone());
    Ok(Arc::new(UniformMetadata::new(args.mode.unwrap_or(0o644), owner)))
}

async fn run(args: Args) -> Result<()> {
    let config = load_config(&args)?;
    let secret = config.auth.load_secret().context("read shared secret")?;
    let auth: Arc<dyn Authenticator> = match secret {
        Some(secret) => {
            Arc::new(SharedSecret::new(secret, "stripeline", config.client.identity.clone()))
        }
        None => Arc::new(TrustedPeer::new(config.client.identity.clone())),
    };
    let transport = TcpTransport::new(TcpTransportConfig {
        connect_timeout_ms: config.client.connect_timeout_ms,
        ..TcpTransportConfig::default()
    });
    let client = ReplicationClient::new(
        DestinationOptions::from_config(&config),
        transport,
        auth,
        metadata(&args, &config)?,
    );
    let source = args.connect.as_str();

    if args.frontend {
        let stdio = tokio::io::join(tokio::io::stdin(), tokio::io::stdout());
        let mut io = Connection::from_stream(stdio, "frontend");
        client
            .run_frontend(source, &mut io)
            .await
            .with_context(|| format!("{}: replicate", source))?;
        return Ok(());
    }

    let files: Vec<FileEntry> = args.files.iter().map(FileEntry::parse).collect();
    let summary = client
        .replicate(source, &files)
        .await
        .with_context(|| format!("{}: replicate", source))?;
    for result in &summary.files {
        println!("{}\t{}", result.entry, result.status);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.log_json);
    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("slr-client: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
