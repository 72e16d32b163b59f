use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use detour_cache::proxy::{self, ProxyConfig};
use tracing::info;

#[derive(Parser)]
#[command(name = "detour-cache")]
#[command(about = "Caching DNS forwarding proxy", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the caching DNS server
    Start(StartArgs),
}

#[derive(Args)]
struct StartArgs {
    /// Local port to listen on
    #[arg(short, long, default_value = "53")]
    port: u16,

    /// Bind address
    #[arg(short, long, default_value = "127.0.0.1")]
    bind: IpAddr,

    /// Upstream DNS server (host:port)
    #[arg(short, long, default_value = "8.8.8.8:53")]
    upstream: SocketAddr,

    /// Cache snapshot file
    #[arg(short, long, default_value = "dns_cache.json")]
    cache_file: PathBuf,

    /// Milliseconds between sweeps of expired entries
    #[arg(long, default_value = "1000", value_parser = clap::value_parser!(u64).range(1..))]
    sweep_interval_ms: u64,

    /// Listener receive timeout in milliseconds
    #[arg(long, default_value = "2000", value_parser = clap::value_parser!(u64).range(1..))]
    recv_timeout_ms: u64,

    /// Upstream reply timeout in milliseconds
    #[arg(long, default_value = "5000", value_parser = clap::value_parser!(u64).range(1..))]
    upstream_timeout_ms: u64,

    /// Seconds between stats log lines
    #[arg(long, default_value = "60", value_parser = clap::value_parser!(u64).range(1..))]
    stats_interval_secs: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl StartArgs {
    fn to_config(&self) -> ProxyConfig {
        let recv_timeout = Duration::from_millis(self.recv_timeout_ms);
        let upstream_timeout = Duration::from_millis(self.upstream_timeout_ms);

        ProxyConfig {
            bind_addr: SocketAddr::new(self.bind, self.port),
            upstream_addr: self.upstream,
            cache_path: self.cache_file.clone(),
            sweep_interval: Duration::from_millis(self.sweep_interval_ms),
            recv_timeout,
            upstream_timeout,
            stats_interval: Duration::from_secs(self.stats_interval_secs),
            // One receive cycle plus one in-flight forward, with headroom.
            shutdown_grace: recv_timeout + upstream_timeout + Duration::from_secs(1),
        }
    }
}

fn init_logging(level: &str) {
    let log_level = level.parse().unwrap_or(tracing::Level::INFO);

    tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(false)
        .with_level(true)
        .with_max_level(log_level)
        .init();

    info!("Logging initialized at level: {}", log_level);
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Start(args) => {
            init_logging(&args.log_level);
            let config = args.to_config();

            let rt = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("failed to build tokio runtime")?;

            let result = rt.block_on(proxy::run(config));
            // Stdin is read on a blocking thread that cannot be cancelled.
            rt.shutdown_timeout(Duration::from_millis(100));

            result.context("caching DNS proxy failed")?;
        }
    }

    Ok(())
}
