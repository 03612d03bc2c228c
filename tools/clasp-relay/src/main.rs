//! CLASP relay server
//!
//! A standalone router binary: WebSocket (and optionally TCP/UDP/QUIC)
//! listeners around the router core, a TOML config file, a token table for
//! scoped authorization, and an append-only JSON-lines journal as the
//! persistence hook.
//!
//! Exit codes: 0 clean, 64 config error, 65 port in use, 66 persistence
//! init failure, 130 SIGINT drain.

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use clasp_router::{
    AuthMode, ParamRecord, Persistence, Router, RouterConfig, StaticTokenAuthorizer,
};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing_subscriber::EnvFilter;

const EXIT_CONFIG: i32 = 64;
const EXIT_PORT: i32 = 65;
const EXIT_PERSIST: i32 = 66;
const EXIT_SIGINT: i32 = 130;

#[derive(Parser)]
#[command(name = "clasp-relay")]
#[command(about = "CLASP relay server")]
#[command(version)]
struct Cli {
    /// WebSocket listen address, host:port
    #[arg(short, long)]
    listen: Option<String>,

    /// Raw TCP listen address, host:port
    #[arg(long)]
    tcp: Option<String>,

    /// UDP listen address, host:port
    #[arg(long)]
    udp: Option<String>,

    /// QUIC listen address, host:port (self-signed dev certificate)
    #[cfg(feature = "quic")]
    #[arg(long)]
    quic: Option<String>,

    /// Server name
    #[arg(short, long)]
    name: Option<String>,

    /// TOML config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// JSON token table: { "token": ["write:/pat", ...], ... }
    #[arg(long)]
    token_file: Option<PathBuf>,

    /// Append-only JSON-lines journal for accepted param writes
    #[arg(long)]
    persist: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

/// JSON-lines journal behind the persistence hook
struct JsonlJournal {
    file: tokio::sync::Mutex<tokio::fs::File>,
}

impl JsonlJournal {
    async fn open(path: &PathBuf) -> std::io::Result<Self> {
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        Ok(Self {
            file: tokio::sync::Mutex::new(file),
        })
    }
}

#[async_trait]
impl Persistence for JsonlJournal {
    async fn record(
        &self,
        record: ParamRecord,
    ) -> std::result::Result<(), clasp_router::hooks::PersistError> {
        let line = serde_json::json!({
            "address": record.address,
            "value": record.value,
            "revision": record.revision,
            "writer": record.writer,
            "timestamp": record.timestamp,
        });
        let mut file = self.file.lock().await;
        file.write_all(line.to_string().as_bytes()).await?;
        file.write_all(b"\n").await?;
        Ok(())
    }

    async fn flush(&self) -> std::result::Result<(), clasp_router::hooks::PersistError> {
        let mut file = self.file.lock().await;
        file.flush().await?;
        Ok(())
    }
}

fn load_config(cli: &Cli) -> Result<RouterConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading config {}", path.display()))?;
            toml::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))?
        }
        None => RouterConfig::default(),
    };

    if let Some(name) = &cli.name {
        config.name = name.clone();
    }
    if let Some(listen) = &cli.listen {
        let (host, port) = listen
            .rsplit_once(':')
            .context("listen address must be host:port")?;
        config.host = host.to_string();
        config.ws_port = port.parse().context("invalid listen port")?;
    }
    if cli.token_file.is_some() {
        config.auth = AuthMode::TokenRequired;
    }
    Ok(config)
}

fn load_tokens(path: &PathBuf) -> Result<StaticTokenAuthorizer> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading token file {}", path.display()))?;
    let table: HashMap<String, Vec<String>> =
        serde_json::from_str(&raw).with_context(|| format!("parsing token file {}", path.display()))?;
    StaticTokenAuthorizer::new(table).context("invalid scope in token file")
}

fn is_port_in_use(e: &clasp_router::RouterError) -> bool {
    match e {
        clasp_router::RouterError::Transport(t) => t.to_string().contains("in use"),
        clasp_router::RouterError::Io(io) => io.kind() == std::io::ErrorKind::AddrInUse,
        _ => false,
    }
}

#[tokio::main]
async fn main() {
    let code = run().await;
    std::process::exit(code);
}

async fn run() -> i32 {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = match load_config(&cli) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("configuration error: {e:#}");
            return EXIT_CONFIG;
        }
    };

    let authorizer: Arc<dyn clasp_router::Authorizer> = match &cli.token_file {
        Some(path) => match load_tokens(path) {
            Ok(auth) => Arc::new(auth),
            Err(e) => {
                tracing::error!("configuration error: {e:#}");
                return EXIT_CONFIG;
            }
        },
        None => Arc::new(clasp_router::OpenAuthorizer),
    };

    // CLI wins over config; journal_path falls back to persist_path
    let journal_path: Option<PathBuf> = cli
        .persist
        .clone()
        .or_else(|| config.journal_path.as_ref().map(PathBuf::from))
        .or_else(|| config.persist_path.as_ref().map(PathBuf::from));
    let persistence: Option<Arc<dyn Persistence>> = match &journal_path {
        Some(path) => match JsonlJournal::open(path).await {
            Ok(journal) => Some(Arc::new(journal)),
            Err(e) => {
                tracing::error!("persistence init failed for {}: {e}", path.display());
                return EXIT_PERSIST;
            }
        },
        None => None,
    };

    let router = match Router::with_hooks(config, authorizer, persistence) {
        Ok(r) => r,
        Err(e) => {
            tracing::error!("configuration error: {e}");
            return EXIT_CONFIG;
        }
    };

    tracing::info!(
        name = %router.config().name,
        ws = %router.config().ws_addr(),
        "starting clasp relay"
    );

    let mut servers = tokio::task::JoinSet::new();

    {
        let router = router.clone();
        servers.spawn(async move { router.serve_ws().await });
    }
    if let Some(addr) = cli.tcp.clone() {
        let router = router.clone();
        servers.spawn(async move { router.serve_tcp(&addr).await });
    }
    if let Some(addr) = cli.udp.clone() {
        let router = router.clone();
        servers.spawn(async move { router.serve_udp(&addr).await });
    }
    #[cfg(feature = "quic")]
    if let Some(addr) = cli.quic.clone() {
        let router = router.clone();
        servers.spawn(async move {
            let addr: std::net::SocketAddr =
                addr.parse().map_err(|e| {
                    clasp_router::RouterError::Config(format!("invalid quic address: {e}"))
                })?;
            let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
                .map_err(|e| clasp_router::RouterError::Config(e.to_string()))?;
            let cert_der = cert.cert.der().to_vec();
            let key_der = cert.key_pair.serialize_der();
            router.serve_quic(addr, cert_der, key_der).await
        });
    }

    tracing::info!("relay ready, accepting connections");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("SIGINT received, draining");
            router.shutdown().await;
            EXIT_SIGINT
        }
        result = servers.join_next() => {
            match result {
                Some(Ok(Err(e))) if is_port_in_use(&e) => {
                    tracing::error!("port in use: {e}");
                    EXIT_PORT
                }
                Some(Ok(Err(e))) => {
                    tracing::error!("server error: {e}");
                    EXIT_CONFIG
                }
                _ => {
                    router.shutdown().await;
                    0
                }
            }
        }
    }
}
