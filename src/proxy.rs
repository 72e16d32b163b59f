//! Caching proxy orchestration.
//!
//! Loads the cache snapshot, binds the listener and upstream sockets, runs
//! the listener and sweeper, and on stop drains both and saves the snapshot.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::cache::DnsCache;
use crate::error::Result;
use crate::persistence;
use crate::resolver::{Forwarder, Resolver};
use crate::stats::Stats;
use crate::sweeper::Sweeper;
use crate::transport::udp::UdpTransport;

/// Configuration for the caching proxy.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Local address to bind (e.g., 127.0.0.1:53)
    pub bind_addr: SocketAddr,
    /// Upstream DNS server address
    pub upstream_addr: SocketAddr,
    /// Cache snapshot file, loaded at start and written at shutdown
    pub cache_path: PathBuf,
    /// Time between sweep passes
    pub sweep_interval: Duration,
    /// Listener receive timeout, bounds how long a stop goes unnoticed
    pub recv_timeout: Duration,
    /// Maximum wait for an upstream reply
    pub upstream_timeout: Duration,
    /// Time between stats log lines
    pub stats_interval: Duration,
    /// Maximum wait for the listener and sweeper to exit on shutdown
    pub shutdown_grace: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 53)),
            upstream_addr: SocketAddr::from(([8, 8, 8, 8], 53)),
            cache_path: PathBuf::from("dns_cache.json"),
            sweep_interval: Duration::from_secs(1),
            recv_timeout: Duration::from_secs(2),
            upstream_timeout: Duration::from_secs(5),
            stats_interval: Duration::from_secs(60),
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

/// A running proxy.
pub struct Proxy {
    config: ProxyConfig,
    cache: Arc<DnsCache>,
    stats: Arc<Stats>,
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    stopped: AtomicBool,
    tasks: Vec<JoinHandle<()>>,
}

impl Proxy {
    /// Restore the cache and start serving.
    ///
    /// Fails only when a socket cannot be bound; snapshot problems are
    /// logged and the proxy starts with an empty cache.
    pub async fn start(config: ProxyConfig) -> Result<Self> {
        let cache = Arc::new(DnsCache::new());
        let stats = Arc::new(Stats::new());

        match persistence::load(&config.cache_path).await {
            Ok(snapshot) => {
                let restored = cache.restore(snapshot);
                info!(
                    path = %config.cache_path.display(),
                    entries = restored,
                    "Cache snapshot loaded"
                );
            }
            Err(e) => warn!(
                path = %config.cache_path.display(),
                error = %e,
                "Could not load cache snapshot, starting with an empty cache"
            ),
        }

        let transport = UdpTransport::bind(config.bind_addr).await?;
        let local_addr = transport.local_addr();
        let forwarder = Forwarder::bind(config.upstream_addr, config.upstream_timeout).await?;
        let resolver = Resolver::new(Arc::clone(&cache), forwarder);

        info!("DNS cache listening on {}", local_addr);
        info!("Forwarding misses to upstream: {}", config.upstream_addr);

        let shutdown = CancellationToken::new();

        let sweeper = Sweeper::new(Arc::clone(&cache), Arc::clone(&stats), config.sweep_interval)
            .with_cancellation(shutdown.clone())
            .start();
        let listener = transport.start(
            resolver,
            Arc::clone(&stats),
            config.recv_timeout,
            shutdown.clone(),
        );
        let reporter = spawn_stats_reporter(
            Arc::clone(&cache),
            Arc::clone(&stats),
            config.stats_interval,
            shutdown.clone(),
        );

        Ok(Self {
            config,
            cache,
            stats,
            local_addr,
            shutdown,
            stopped: AtomicBool::new(false),
            tasks: vec![listener, sweeper, reporter],
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn cache(&self) -> &Arc<DnsCache> {
        &self.cache
    }

    pub fn stats(&self) -> &Arc<Stats> {
        &self.stats
    }

    /// Signal the listener and sweeper to stop.
    ///
    /// Only the first call has any effect; it returns `true`.
    pub fn stop(&self) -> bool {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return false;
        }
        info!("Stop requested, draining");
        self.shutdown.cancel();
        true
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Stop, wait for the background tasks, then save the cache snapshot.
    pub async fn shutdown(mut self) {
        self.stop();

        let tasks = std::mem::take(&mut self.tasks);
        match tokio::time::timeout(self.config.shutdown_grace, futures::future::join_all(tasks))
            .await
        {
            Ok(results) => {
                for result in results {
                    if let Err(e) = result {
                        error!(error = %e, "Background task ended abnormally");
                    }
                }
            }
            Err(_) => warn!(
                grace_ms = self.config.shutdown_grace.as_millis() as u64,
                "Background tasks did not stop in time"
            ),
        }

        let snapshot = self.cache.snapshot();
        let entries = snapshot.len();
        match persistence::save(&self.config.cache_path, snapshot).await {
            Ok(()) => info!(
                path = %self.config.cache_path.display(),
                entries,
                "Cache snapshot saved"
            ),
            Err(e) => error!(
                path = %self.config.cache_path.display(),
                error = %e,
                "Failed to save cache snapshot"
            ),
        }

        log_stats(&self.cache, &self.stats);
        info!("Shutdown complete");
    }
}

impl Drop for Proxy {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn spawn_stats_reporter(
    cache: Arc<DnsCache>,
    stats: Arc<Stats>,
    period: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.tick().await; // Skip first immediate tick
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => log_stats(&cache, &stats),
            }
        }
    })
}

fn log_stats(cache: &DnsCache, stats: &Stats) {
    let snapshot = stats.snapshot_and_reset();
    info!(
        cache = cache.len(),
        requests = snapshot.requests,
        cached = snapshot.cached,
        forwarded = snapshot.forwarded,
        failed = snapshot.failed,
        dropped = snapshot.dropped,
        evicted = snapshot.evicted,
        avg_response_ms = %format!("{:.2}", snapshot.avg_response_ms),
        "stats"
    );
}

/// Run the proxy until a stop is requested, then shut down gracefully.
///
/// A stop is Ctrl-C, SIGTERM, or an `exit` line on stdin.
pub async fn run(config: ProxyConfig) -> Result<()> {
    let proxy = Proxy::start(config).await?;
    info!("Type `exit` or press Ctrl-C to stop");

    wait_for_stop_request().await;
    proxy.shutdown().await;

    Ok(())
}

async fn wait_for_stop_request() {
    tokio::select! {
        _ = ctrl_c() => info!("Received Ctrl-C"),
        _ = terminate() => info!("Received SIGTERM"),
        _ = exit_command() => info!("Received exit command"),
    }
}

async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Cannot listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
}

#[cfg(unix)]
async fn terminate() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            warn!(error = %e, "Cannot listen for SIGTERM");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    std::future::pending::<()>().await;
}

/// Resolves on an `exit` line. Stdin closing is not a stop request.
async fn exit_command() {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if line.trim() == "exit" => return,
            Ok(Some(_)) => continue,
            Ok(None) | Err(_) => std::future::pending::<()>().await,
        }
    }
}
