//! Detour cache - a caching DNS forwarding proxy.
//!
//! Queries arriving over UDP are answered from a TTL-bounded cache when the
//! cached answer is fresh and forwarded to a single upstream resolver
//! otherwise. A background sweeper evicts expired entries, and the cache is
//! saved to a snapshot file at shutdown and restored at startup.

pub mod cache;
pub mod dns;
pub mod error;
pub mod persistence;
pub mod proxy;
pub mod resolver;
pub mod stats;
pub mod sweeper;
pub mod transport;

pub use cache::{CacheEntry, CacheKey, CacheSnapshot, DnsCache};
pub use error::{Error, Result};
pub use proxy::{Proxy, ProxyConfig};
