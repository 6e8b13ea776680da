//! wg-forwarder: intercept one TCP port inside a WireGuard tunnel
//!
//! # Usage
//!
//! ```bash
//! # Relay 10.0.0.2:8080 (inside the tunnel) to a local service
//! wg-forwarder 127.0.0.1:9000 /etc/wg-forwarder.conf
//!
//! # Validate the configuration and print it
//! wg-forwarder --check 127.0.0.1:9000 /etc/wg-forwarder.conf
//!
//! # Run with environment overrides
//! WG_FORWARDER_LOG_LEVEL=debug wg-forwarder 127.0.0.1:9000 /etc/wg-forwarder.conf
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tokio::signal;
use tracing::{info, Level};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

use wg_forwarder::config::{load_config_with_env, Config, UpstreamTarget};
use wg_forwarder::interceptor::{run_accept_loop, Interceptor};
use wg_forwarder::tunnel::TunnelHandle;

/// Command-line arguments
struct Args {
    /// Upstream every intercepted connection is relayed to
    upstream: String,
    /// Configuration file path
    config_path: PathBuf,
    /// Check configuration only
    check_config: bool,
}

impl Args {
    fn parse() -> Self {
        let mut positional = Vec::new();
        let mut check_config = false;

        for arg in std::env::args().skip(1) {
            match arg.as_str() {
                "--check" => {
                    check_config = true;
                }
                "-h" | "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                "-V" | "--version" => {
                    println!("wg-forwarder v{}", wg_forwarder::VERSION);
                    std::process::exit(0);
                }
                _ => positional.push(arg),
            }
        }

        if positional.len() != 2 {
            print_help();
            std::process::exit(0);
        }

        let config_path = PathBuf::from(positional.pop().unwrap_or_default());
        let upstream = positional.pop().unwrap_or_default();

        Self {
            upstream,
            config_path,
            check_config,
        }
    }
}

fn print_help() {
    println!(
        r#"wg-forwarder v{}

Userspace WireGuard endpoint that intercepts one TCP port and relays it
to a fixed upstream.

USAGE:
    wg-forwarder [OPTIONS] <UPSTREAM host:port> <CONFIG FILE>

OPTIONS:
    --check                 Validate configuration, print it and exit
    -h, --help              Print help information
    -V, --version           Print version information

CONFIG FILE (key=value per line, // or # comments):
    ipToIntercept           Address owned inside the tunnel
    portToIntercept         TCP port to intercept
    wgListenPort            WireGuard UDP listen port
    wgPrivateKey            Local private key (Base64 or hex)
    wgPublicKey             Peer public key (Base64 or hex)
    wgAllowedIp             Peer's allowed source range (CIDR or address)
    mtu, persistentKeepalive, connectTimeoutSecs, idleTimeoutSecs,
    maxConnectionSecs, bufferSize, logLevel, logFormat (optional)

ENVIRONMENT:
    WG_FORWARDER_LOG_LEVEL  Override log level (trace, debug, info, warn, error)
    WG_FORWARDER_LOG_FORMAT Override log format (text, json)
    WG_FORWARDER_MTU        Override interface MTU
    RUST_LOG                Additional log filter directives
"#,
        wg_forwarder::VERSION
    );
}

/// Initialize logging
fn init_logging(config: &Config) -> Result<()> {
    let level = match config.log.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive("tokio=warn".parse()?);

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_span_events(FmtSpan::CLOSE);

    if config.log.format == "json" {
        subscriber
            .json()
            .try_init()
            .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {e}"))
    } else {
        subscriber
            .try_init()
            .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {e}"))
    }
}

/// Main application entry point
#[tokio::main]
async fn main() -> Result<()> {
    let start_time = Instant::now();

    let args = Args::parse();

    let upstream: UpstreamTarget = args
        .upstream
        .parse()
        .context("Invalid upstream argument")?;

    let config = load_config_with_env(&args.config_path).with_context(|| {
        format!(
            "Failed to load configuration from {:?}",
            args.config_path
        )
    })?;

    if args.check_config {
        println!("Configuration is valid");
        println!("upstream: {upstream}");
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    init_logging(&config)?;

    info!("wg-forwarder v{}", wg_forwarder::VERSION);
    info!("Configuration loaded from {:?}", args.config_path);

    let intercept_port = config.tunnel.intercept_port;
    let tunnel = TunnelHandle::establish(config.tunnel, &config.options)
        .await
        .context("Failed to create tunnel endpoint")?;

    let listener = tunnel
        .listen_tcp(intercept_port)
        .await
        .context("Failed to open intercept listener")?;

    let interceptor = Arc::new(Interceptor::new(upstream, config.relay));

    info!(
        "Startup complete in {:.2}ms",
        start_time.elapsed().as_secs_f64() * 1000.0
    );

    let accept_result = tokio::select! {
        result = run_accept_loop(listener, Arc::clone(&interceptor)) => result,
        _ = signal::ctrl_c() => {
            info!("Received SIGINT, initiating shutdown...");
            Ok(())
        }
        () = wait_for_sigterm() => {
            info!("Received SIGTERM, initiating shutdown...");
            Ok(())
        }
    };

    info!("Shutting down...");

    interceptor.shutdown().await;
    tunnel.shutdown().await;

    let stats = interceptor.stats();
    info!(
        "Final stats: {} connections, {} completed, {} failed",
        stats.accepted(),
        stats.completed(),
        stats.failed()
    );
    info!(
        "Transferred: {} bytes to upstream, {} bytes from upstream",
        stats.bytes_to_upstream(),
        stats.bytes_from_upstream()
    );

    info!("Shutdown complete");

    accept_result.context("Accept loop error")
}

/// Wait for SIGTERM signal
#[cfg(unix)]
async fn wait_for_sigterm() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            tracing::warn!("Failed to register SIGTERM handler: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_sigterm() {
    std::future::pending::<()>().await;
}
