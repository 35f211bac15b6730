#![warn(missing_docs)]

//! Replication source daemon: serves replication batches to destinations.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use stripeline_repl::session::SourceOptions;
use stripeline_repl::{ReplConfig, ReplicationServer};
use stripeline_transport::auth::{Authenticator, SharedSecret, TrustedPeer};
use stripeline_transport::tcp::TcpTransport;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "slr-server")]
#[command(about = "Stripeline replication source daemon", long_about = None)]
struct Args {
    /// Striping algorithm version to serve
    #[arg(short = 'a', long = "algorithm")]
    algorithm: i32,

    /// Control listener address
    #[arg(long)]
    listen: Option<String>,

    /// Directory files are served from
    #[arg(long)]
    spool: Option<PathBuf>,

    /// Configuration file (.toml or .json)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Per-division send rate in bits per second (0 = unlimited)
    #[arg(long)]
    rate_limit: Option<u64>,

    /// Bytes per local read
    #[arg(long)]
    file_read_size: Option<usize>,

    /// File holding the shared authentication secret
    #[arg(long, env = "SLR_SECRET_FILE")]
    secret_file: Option<PathBuf>,

    /// Largest division count a destination may request
    #[arg(long)]
    max_divisions: Option<usize>,

    /// Identity presented on data connections
    #[arg(long)]
    identity: Option<String>,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
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
    config.server.algorithm_version = args.algorithm;
    if let Some(listen) = &args.listen {
        config.server.listen = listen.clone();
    }
    if let Some(spool) = &args.spool {
        config.server.spool_root = spool.clone();
    }
    if let Some(rate) = args.rate_limit {
        config.transfer.rate_limit_bps = rate;
    }
    if let Some(size) = args.file_read_size {
        config.transfer.file_read_size = size;
    }
    if let Some(max) = args.max_divisions {
        config.server.max_divisions = max;
    }
    if let Some(secret) = &args.secret_file {
        config.auth.shared_secret_file = Some(secret.clone());
    }
    if let Some(identity) = &args.identity {
        config.server.identity = identity.clone();
    }
    config.validate().context("configuration")?;
    Ok(config)
}

async fn run(args: Args) -> Result<()> {
    let config = load_config(&args)?;
    let listen = config.server.listen.clone();

    let secret = config.auth.load_secret().context("read shared secret")?;
    let auth: Arc<dyn Authenticator> = match secret {
        Some(secret) => {
            Arc::new(SharedSecret::new(secret, "stripeline", config.server.identity.clone()))
        }
        None => Arc::new(TrustedPeer::new(config.server.identity.clone())),
    };
    let transport = TcpTransport::default();
    let listener = transport.listen(&listen).await.with_context(|| format!("{}: listen", listen))?;

    tracing::info!(
        listen = %listen,
        spool = %config.server.spool_root.display(),
        algorithm = config.server.algorithm_version,
        "slr-server starting"
    );
    let server = ReplicationServer::new(SourceOptions::from_config(&config), transport, auth);
    server.serve(listener).await.with_context(|| format!("{}: accept", listen))?;
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.log_json);
    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("slr-server: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
