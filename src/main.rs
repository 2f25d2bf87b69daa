use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use log::{info, warn};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use wormhole::config::{Config, LogFormat, LogLevel};
use wormhole::logging::{self, CustomLogger};
use wormhole::stats::ProxyStats;
use wormhole::{ProxyEngine, ProxyServer};

#[derive(Parser)]
#[clap(
    version,
    about = "Forward HTTP proxy with CONNECT tunnelling, Basic auth and destination safeguards"
)]
struct Args {
    #[clap(short, long, value_name = "FILE", help = "Configuration file path (JSON)")]
    config: Option<PathBuf>,

    #[clap(short, long, value_name = "ADDR", help = "Listen address (default: 127.0.0.1:8800)")]
    listen: Option<SocketAddr>,

    #[clap(long, value_name = "FILE", help = "Credentials file with one user:secret per line")]
    auth_file: Option<PathBuf>,

    #[clap(long, value_name = "REALM", help = "Realm sent in the Proxy-Authenticate challenge")]
    auth_realm: Option<String>,

    #[clap(long, value_name = "FILE", help = "File of blocked domains, one per line")]
    block_list: Option<PathBuf>,

    #[clap(long, value_name = "FILE", help = "File of allowed domains, overriding the block list")]
    allow_list: Option<PathBuf>,

    #[clap(long, help = "Allow literal private, loopback and link-local targets")]
    allow_private: bool,

    #[clap(long, value_name = "SECONDS", help = "Upstream connect timeout in seconds")]
    connect_timeout: Option<u64>,

    #[clap(long, value_name = "SECONDS", help = "Relay idle timeout in seconds")]
    idle_timeout: Option<u64>,

    #[clap(long, value_name = "SECONDS", help = "Time allowed for the client to send request headers")]
    header_timeout: Option<u64>,

    #[clap(long, value_name = "BYTES", help = "Maximum request header size in bytes")]
    max_header_size: Option<usize>,

    #[clap(long, value_name = "NUM", help = "Maximum concurrent client connections")]
    max_connections: Option<usize>,

    #[clap(long, value_name = "FORMAT", value_parser = logging::parse_log_format, help = "Log format when no logging block is configured: text or json")]
    log_format: Option<LogFormat>,

    #[clap(long, value_name = "LEVEL", value_parser = logging::parse_log_level, help = "Log level when no logging block is configured: trace, debug, info, warn or error")]
    log_level: Option<LogLevel>,

    #[clap(short, long, action = ArgAction::Count, help = "Increase log verbosity (-v debug, -vv trace)")]
    verbose: u8,

    #[clap(long, value_name = "FILE", help = "Generate a sample configuration file")]
    generate_config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if let Some(path) = &args.generate_config {
        Config::sample()
            .to_file(path)
            .with_context(|| format!("writing sample config to {}", path.display()))?;
        println!("Sample configuration file generated: {}", path.display());
        return Ok(());
    }

    let mut config = match &args.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => Config::default(),
    };
    apply_args(&mut config, &args);

    let log_format = config.log_format(args.log_format);
    match config.logging.clone() {
        Some(logging) => CustomLogger::init(logging).context("initializing logger")?,
        None => logging::init_fallback(logging::fallback_level(args.log_level, args.verbose), log_format)
            .context("initializing logger")?,
    }

    config.validate().context("invalid configuration")?;

    let stats = Arc::new(ProxyStats::new());
    let engine = ProxyEngine::from_config(&config, log_format, Arc::clone(&stats))
        .context("loading safeguards")?;
    if config.auth_file.is_none() {
        warn!("⚠️  No auth_file configured, the proxy accepts unauthenticated clients");
    }

    let server = ProxyServer::bind(config.listen_addr(), Arc::new(engine), config.max_connections())
        .await
        .context("starting listener")?;

    server
        .run_until(async {
            match signal::ctrl_c().await {
                Ok(()) => info!("🛑 Received Ctrl+C, shutting down gracefully..."),
                Err(e) => warn!("Cannot listen for Ctrl+C ({e}), shutting down"),
            }
        })
        .await?;

    info!("👋 Proxy stopped. Goodbye!");
    log::logger().flush();
    Ok(())
}

/// Command-line values win over the configuration file.
fn apply_args(config: &mut Config, args: &Args) {
    if let Some(listen) = args.listen {
        config.listen_addr = Some(listen);
    }
    if let Some(path) = &args.auth_file {
        config.auth_file = Some(path.clone());
    }
    if let Some(realm) = &args.auth_realm {
        config.auth_realm = Some(realm.clone());
    }
    if let Some(path) = &args.block_list {
        config.block_list = Some(path.clone());
    }
    if let Some(path) = &args.allow_list {
        config.allow_list = Some(path.clone());
    }
    if args.allow_private {
        config.allow_private = Some(true);
    }
    if let Some(secs) = args.connect_timeout {
        config.connect_timeout_secs = Some(secs);
    }
    if let Some(secs) = args.idle_timeout {
        config.idle_timeout_secs = Some(secs);
    }
    if let Some(secs) = args.header_timeout {
        config.header_timeout_secs = Some(secs);
    }
    if let Some(size) = args.max_header_size {
        config.max_header_size = Some(size);
    }
    if let Some(max) = args.max_connections {
        config.max_connections = Some(max);
    }
}
