//! DNS query resolution logic.
//!
//! Handles the core query processing pipeline:
//! 1. Cache lookup (fresh hit is answered from the cache)
//! 2. Forward misses and stale hits to the upstream resolver
//! 3. Cache the upstream answer under its TTL
//!
//! Transports handle the client-facing I/O, the resolver handles decisions and
//! the upstream exchange.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::net::UdpSocket;
use tracing::debug;

use crate::cache::{CacheEntry, CacheKey, DnsCache};
use crate::dns::{DnsQuery, parse_answer, qtype_name};
use crate::error::{Error, Result};
use crate::transport::MAX_DNS_PACKET_SIZE;

/// Action to take for a DNS query.
#[derive(Debug)]
pub enum QueryAction {
    /// Fresh cache hit, send this response immediately.
    Cached { response: Vec<u8> },
    /// Query should be forwarded to upstream. `stale` is set when an expired
    /// entry was found.
    Forward { stale: bool },
}

/// Outbound socket to the upstream resolver.
pub struct Forwarder {
    socket: UdpSocket,
    upstream_addr: SocketAddr,
    timeout: Duration,
}

impl Forwarder {
    /// Bind an ephemeral socket of the upstream's address family.
    pub async fn bind(upstream_addr: SocketAddr, timeout: Duration) -> Result<Self> {
        let local: SocketAddr = if upstream_addr.is_ipv4() {
            (std::net::Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(local).await?;

        Ok(Self {
            socket,
            upstream_addr,
            timeout,
        })
    }

    /// Send `raw_query` upstream and wait for the reply to `query`.
    ///
    /// Datagrams from other sources, or whose id or question differ from the
    /// query (late replies to earlier, timed out queries), are discarded
    /// while waiting.
    pub async fn exchange(&self, query: &DnsQuery, raw_query: &[u8]) -> Result<Vec<u8>> {
        self.socket.send_to(raw_query, self.upstream_addr).await?;

        let deadline = tokio::time::Instant::now() + self.timeout;
        let mut buf = vec![0u8; MAX_DNS_PACKET_SIZE];

        loop {
            let (len, from) =
                match tokio::time::timeout_at(deadline, self.socket.recv_from(&mut buf)).await {
                    Ok(result) => result?,
                    Err(_) => return Err(Error::UpstreamTimeout(self.timeout)),
                };

            if from != self.upstream_addr || !query.matches_reply(&buf[..len]) {
                debug!(%from, len, "Discarding unexpected upstream datagram");
                continue;
            }

            buf.truncate(len);
            return Ok(buf);
        }
    }

    pub fn upstream_addr(&self) -> SocketAddr {
        self.upstream_addr
    }
}

/// Resolver handles DNS query processing decisions.
///
/// Owns the upstream socket; the cache is shared with the sweeper.
pub struct Resolver {
    cache: Arc<DnsCache>,
    upstream: Forwarder,
}

impl Resolver {
    pub fn new(cache: Arc<DnsCache>, upstream: Forwarder) -> Self {
        Self { cache, upstream }
    }

    /// Decide what to do with a query.
    pub fn process_query(&self, query: &DnsQuery) -> QueryAction {
        self.process_query_at(query, SystemTime::now())
    }

    pub fn process_query_at(&self, query: &DnsQuery, now: SystemTime) -> QueryAction {
        match self.cache.get(&CacheKey::from(query)) {
            Some(entry) if entry.is_fresh_at(now) => QueryAction::Cached {
                response: query.response_from_records(entry.ttl(), entry.records()),
            },
            Some(_) => QueryAction::Forward { stale: true },
            None => QueryAction::Forward { stale: false },
        }
    }

    /// Forward the raw query upstream, cache the answer and return the raw
    /// upstream response for relaying.
    ///
    /// An error means there is nothing to relay.
    pub async fn forward(&self, query: &DnsQuery, raw_query: &[u8]) -> Result<Vec<u8>> {
        let response = self.upstream.exchange(query, raw_query).await?;
        self.process_response_at(query, &response, SystemTime::now())?;
        Ok(response)
    }

    /// Cache an upstream response received at `now`.
    ///
    /// Returns `Ok(false)` when the answer was truncated or had no records,
    /// and was not cached.
    pub fn process_response_at(
        &self,
        query: &DnsQuery,
        response: &[u8],
        now: SystemTime,
    ) -> Result<bool> {
        let answer = parse_answer(response)?;

        if answer.truncated {
            debug!(domain = %query.domain, qtype = %qtype_name(query.qtype), "Truncated answer, not caching");
            return Ok(false);
        }

        let Some(entry) = CacheEntry::new(answer.records, answer.ttl, now) else {
            debug!(domain = %query.domain, qtype = %qtype_name(query.qtype), "Empty answer, not caching");
            return Ok(false);
        };

        debug!(
            domain = %query.domain,
            qtype = %qtype_name(query.qtype),
            ttl = entry.ttl(),
            records = entry.records().len(),
            "Caching upstream answer"
        );
        self.cache.put(CacheKey::from(query), entry);
        Ok(true)
    }

    pub fn upstream_addr(&self) -> SocketAddr {
        self.upstream.upstream_addr()
    }
}
