//! tproxy-relay: transparent TCP relay for Linux TPROXY
//!
//! This is the main entry point for the relay.
//!
//! # Usage
//!
//! ```bash
//! # Run with default configuration on port 9000
//! sudo ./tproxy-relay
//!
//! # Run with custom configuration
//! sudo ./tproxy-relay -c /path/to/config.json
//!
//! # Plain outbound source address, non-blocking dial
//! sudo ./tproxy-relay -p 7893 --dont-assume-remote --none-block
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tokio::signal;
use tracing::{error, info, warn, Level};
use tracing_subscriber::EnvFilter;

use tproxy_relay::config::{apply_env_overrides, load_config_with_env, Config};
use tproxy_relay::connection::ProxyServer;
use tproxy_relay::tproxy::{has_net_admin_capability, is_root};

/// Configuration file used when `--config` is not given
const DEFAULT_CONFIG_PATH: &str = "/etc/tproxy-relay/config.json";

/// Command-line arguments
struct Args {
    /// Configuration file path
    config_path: Option<PathBuf>,
    /// Listen port override
    port: Option<u16>,
    /// Dial from the relay's own address instead of the client's
    dont_assume_remote: bool,
    /// Non-blocking outbound sockets
    none_block: bool,
    /// Generate default configuration
    generate_config: bool,
    /// Check configuration only
    check_config: bool,
}

impl Args {
    fn parse() -> Self {
        let mut args = std::env::args().skip(1);
        let mut parsed = Self {
            config_path: None,
            port: None,
            dont_assume_remote: false,
            none_block: false,
            generate_config: false,
            check_config: false,
        };

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "-c" | "--config" => {
                    if let Some(path) = args.next() {
                        parsed.config_path = Some(PathBuf::from(path));
                    }
                }
                "-p" | "--port" => match args.next().map(|p| p.parse::<u16>()) {
                    Some(Ok(port)) if port > 0 => parsed.port = Some(port),
                    _ => {
                        eprintln!("--port requires a port number between 1 and 65535");
                        std::process::exit(1);
                    }
                },
                "--dont-assume-remote" => {
                    parsed.dont_assume_remote = true;
                }
                "--none-block" => {
                    parsed.none_block = true;
                }
                "-g" | "--generate-config" => {
                    parsed.generate_config = true;
                }
                "--check" => {
                    parsed.check_config = true;
                }
                "-h" | "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                "-v" | "--version" => {
                    println!("tproxy-relay v{}", tproxy_relay::VERSION);
                    std::process::exit(0);
                }
                _ => {
                    eprintln!("Unknown argument: {arg}");
                    print_help();
                    std::process::exit(1);
                }
            }
        }

        parsed
    }

    /// Apply command-line overrides on top of file and environment values
    fn apply(&self, config: &mut Config) {
        if let Some(port) = self.port {
            config.listen.port = port;
        }
        if self.dont_assume_remote {
            config.dial.preserve_client_address = false;
        }
        if self.none_block {
            config.dial.nonblocking = true;
        }
    }
}

fn print_help() {
    println!(
        r#"tproxy-relay v{}

Transparent TCP relay for Linux TPROXY. Each intercepted connection is
redialed to its original destination from the client's own address.

USAGE:
    tproxy-relay [OPTIONS]

OPTIONS:
    -c, --config <PATH>     Configuration file path [default: {}]
    -p, --port <PORT>       Listen port [default: 9000]
    --dont-assume-remote    Do not bind outbound sockets to the client's address
    --none-block            Use non-blocking outbound sockets
    -g, --generate-config   Generate default configuration and exit
    --check                 Check configuration and exit
    -h, --help              Print help information
    -v, --version           Print version information

ENVIRONMENT:
    TPROXY_RELAY_PORT               Override listen port
    TPROXY_RELAY_LOG_LEVEL          Override log level (trace, debug, info, warn, error)
    TPROXY_RELAY_ROUTING_MARK       Override SO_MARK of relay sockets
    TPROXY_RELAY_IDLE_TIMEOUT_SECS  Override relay idle timeout

REQUIREMENTS:
    - Linux kernel with TPROXY support
    - CAP_NET_ADMIN capability (or root)
    - iptables TPROXY rules and policy routing configured

EXAMPLE:
    ip rule add fwmark 0x1 lookup 100
    ip route add local 0.0.0.0/0 dev lo table 100
    iptables -t mangle -A PREROUTING -m mark --mark 123 -j RETURN
    iptables -t mangle -A PREROUTING -p tcp --dport 80 -j TPROXY \
        --on-port 9000 --tproxy-mark 0x1

    sudo tproxy-relay -p 9000
"#,
        tproxy_relay::VERSION,
        DEFAULT_CONFIG_PATH
    );
}

/// Load the configuration file, or defaults when no file is given and the
/// default path does not exist
fn load(args: &Args) -> Result<(Config, Option<PathBuf>)> {
    let path = match &args.config_path {
        Some(path) => Some(path.clone()),
        None if Path::new(DEFAULT_CONFIG_PATH).exists() => Some(PathBuf::from(DEFAULT_CONFIG_PATH)),
        None => None,
    };

    let mut config = match &path {
        Some(path) => load_config_with_env(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => {
            let mut config = Config::default();
            apply_env_overrides(&mut config).context("Invalid environment override")?;
            config
        }
    };

    args.apply(&mut config);
    config.validate().context("Invalid configuration")?;

    Ok((config, path))
}

/// Initialize logging
fn init_logging(config: &Config) {
    let level = match config.log.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.log.target);

    if config.log.format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

/// Check system prerequisites
fn check_prerequisites() {
    if !is_root() && !has_net_admin_capability() {
        warn!("Not running as root and CAP_NET_ADMIN not detected");
        warn!("TPROXY requires CAP_NET_ADMIN capability");
        // Don't fail - let the socket setup fail with a clearer error
    }
}

/// Main application entry point
#[tokio::main]
async fn main() -> Result<()> {
    let start_time = Instant::now();

    let args = Args::parse();

    if args.generate_config {
        let path = args
            .config_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
        tproxy_relay::config::create_default_config(&path)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        println!("Generated default configuration at {}", path.display());
        return Ok(());
    }

    let (config, path) = load(&args)?;

    if args.check_config {
        println!("Configuration is valid");
        return Ok(());
    }

    init_logging(&config);

    info!("tproxy-relay v{}", tproxy_relay::VERSION);
    match &path {
        Some(path) => info!("Configuration loaded from {}", path.display()),
        None => info!("No configuration file, using defaults"),
    }
    info!("Settings: {}", config.summary());

    check_prerequisites();

    let drain_timeout = config.listen.drain_timeout();
    let server = Arc::new(
        ProxyServer::bind(config).context("Failed to create TPROXY listener")?,
    );

    info!(
        "Startup complete in {:.2}ms",
        start_time.elapsed().as_secs_f64() * 1000.0
    );

    let mut accept_loop = tokio::spawn({
        let server = Arc::clone(&server);
        async move { server.run().await }
    });

    // Run accept loop with signal handling
    let finished_early = tokio::select! {
        result = &mut accept_loop => Some(result),
        () = shutdown_signal() => None,
    };

    let accept_result = match finished_early {
        Some(result) => result,
        None => {
            info!("Initiating graceful shutdown (send the signal again to force exit)");

            tokio::spawn(async {
                shutdown_signal().await;
                warn!("Second signal received, exiting immediately");
                std::process::exit(1);
            });

            if let Err(e) = server.stop() {
                warn!("Stop: {}", e);
            }
            let remaining = server.drain(drain_timeout).await;
            if remaining > 0 {
                warn!("Abandoning {} active sessions", remaining);
            }
            accept_loop.await
        }
    };

    let stats = server.stats_snapshot();
    info!(
        "Final TCP stats: {} total connections, {} completed, {} errored, {} dial failed, {} rejected",
        stats.total_accepted, stats.completed, stats.errored, stats.dial_failed, stats.rejected
    );
    info!(
        "Transferred: {} bytes client->upstream, {} bytes upstream->client",
        stats.bytes_up, stats.bytes_down
    );

    info!("Shutdown complete");

    match accept_result {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            error!("Accept loop failed: {}", e);
            Err(e).context("Accept loop error")
        }
        Err(e) => Err(e).context("Accept loop task failed"),
    }
}

/// Wait for SIGINT or SIGTERM
async fn shutdown_signal() {
    tokio::select! {
        result = signal::ctrl_c() => {
            if let Err(e) = result {
                warn!("Failed to listen for SIGINT: {}", e);
                std::future::pending::<()>().await;
            }
            info!("Received SIGINT");
        }
        () = wait_for_sigterm() => {
            info!("Received SIGTERM");
        }
    }
}

/// Wait for SIGTERM signal
async fn wait_for_sigterm() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            warn!("Failed to register SIGTERM handler: {}", e);
            std::future::pending::<()>().await;
        }
    }
}
