//! Background eviction of expired cache entries.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::cache::DnsCache;
use crate::dns::qtype_name;
use crate::stats::Stats;

/// Periodically removes stale entries from the cache.
pub struct Sweeper {
    cache: Arc<DnsCache>,
    stats: Arc<Stats>,
    interval: Duration,
    shutdown: CancellationToken,
}

impl Sweeper {
    pub fn new(cache: Arc<DnsCache>, stats: Arc<Stats>, interval: Duration) -> Self {
        Self {
            cache,
            stats,
            interval,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    /// Run one sweep pass treating `now` as the current time.
    ///
    /// Keys are collected under the read lock and removed one at a time, so
    /// inserts may interleave with the pass. Returns the number removed.
    pub fn sweep_at(&self, now: SystemTime) -> usize {
        let mut removed = 0;
        for key in self.cache.expired_keys(now) {
            if self.cache.remove_if_stale(&key, now) {
                debug!(domain = %key.domain, qtype = %qtype_name(key.qtype), "Evicted expired entry");
                removed += 1;
            }
        }
        self.stats.record_evicted(removed as u64);
        removed
    }

    pub fn sweep(&self) -> usize {
        self.sweep_at(SystemTime::now())
    }

    /// Spawn the sweep loop. The first pass runs immediately.
    pub fn start(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(self) {
        info!(interval_ms = self.interval.as_millis() as u64, "Starting cache sweeper");

        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("Cache sweeper: shutting down");
                    break;
                }
                _ = interval.tick() => {
                    let removed = self.sweep();
                    if removed > 0 {
                        debug!(removed, cache_size = self.cache.len(), "Sweep pass completed");
                    }
                }
            }
        }
    }
}
