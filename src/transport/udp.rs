//! UDP transport for DNS queries.
//!
//! One task owns the listening socket. Each datagram is decoded, answered
//! from the cache when fresh, otherwise forwarded upstream and awaited
//! inline, so at most one upstream exchange is in flight.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dns::{DnsQuery, qtype_name};
use crate::error::{Error, Result};
use crate::resolver::{QueryAction, Resolver};
use crate::stats::Stats;

use super::MAX_DNS_PACKET_SIZE;

/// UDP transport for the caching proxy.
pub struct UdpTransport {
    socket: UdpSocket,
    local_addr: SocketAddr,
}

impl UdpTransport {
    /// Bind the listening socket. Failure here is fatal for the proxy.
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|source| Error::Bind { addr, source })?;
        let local_addr = socket.local_addr()?;

        Ok(Self { socket, local_addr })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Start serving.
    ///
    /// The receive timeout only bounds how long a cancelled `shutdown` goes
    /// unnoticed.
    pub fn start(
        self,
        resolver: Resolver,
        stats: Arc<Stats>,
        recv_timeout: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(run(self.socket, resolver, stats, recv_timeout, shutdown))
    }
}

/// Main receive loop.
async fn run(
    socket: UdpSocket,
    resolver: Resolver,
    stats: Arc<Stats>,
    recv_timeout: Duration,
    shutdown: CancellationToken,
) {
    info!(upstream = %resolver.upstream_addr(), "UDP listener serving");
    let mut buf = [0u8; MAX_DNS_PACKET_SIZE];

    while !shutdown.is_cancelled() {
        let (len, src) = match tokio::time::timeout(recv_timeout, socket.recv_from(&mut buf)).await
        {
            Err(_) => continue,
            Ok(Ok(r)) => r,
            Ok(Err(e)) => {
                // ICMP errors from earlier sends surface here on some platforms.
                debug!(error = %e, "UDP recv error");
                continue;
            }
        };

        handle_datagram(&socket, &resolver, &stats, &buf[..len], src).await;
    }

    info!("UDP listener: draining complete, stopped");
}

async fn handle_datagram(
    socket: &UdpSocket,
    resolver: &Resolver,
    stats: &Stats,
    data: &[u8],
    src: SocketAddr,
) {
    let start_time = Instant::now();

    let query = match DnsQuery::parse(data) {
        Ok(query) => query,
        Err(e) => {
            stats.record_dropped();
            debug!(%src, error = %e, "Dropping malformed datagram");
            return;
        }
    };

    match resolver.process_query(&query) {
        QueryAction::Cached { response } => {
            if let Err(e) = socket.send_to(&response, src).await {
                warn!(%src, error = %e, "UDP response error");
                return;
            }
            let elapsed_ms = start_time.elapsed().as_secs_f64() * 1000.0;
            stats.record_cached(elapsed_ms);
            debug!(
                domain = %query.domain,
                qtype = %qtype_name(query.qtype),
                total_ms = elapsed_ms,
                "CACHED"
            );
        }
        QueryAction::Forward { stale } => match resolver.forward(&query, data).await {
            Ok(response) => {
                if let Err(e) = socket.send_to(&response, src).await {
                    warn!(%src, error = %e, "UDP response error");
                    return;
                }
                let elapsed_ms = start_time.elapsed().as_secs_f64() * 1000.0;
                stats.record_forwarded(elapsed_ms);
                debug!(
                    domain = %query.domain,
                    qtype = %qtype_name(query.qtype),
                    stale,
                    total_ms = elapsed_ms,
                    "FORWARDED"
                );
            }
            Err(e) => {
                stats.record_failed();
                warn!(
                    domain = %query.domain,
                    qtype = %qtype_name(query.qtype),
                    error = %e,
                    "Forwarding failed, no response sent"
                );
            }
        },
    }
}
