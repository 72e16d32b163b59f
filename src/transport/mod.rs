//! Client-facing transport for the caching proxy.
//!
//! Only UDP is served; the listener answers cache hits itself and hands
//! misses to the resolver.

pub mod udp;

/// Maximum size of a DNS packet (with some headroom).
pub const MAX_DNS_PACKET_SIZE: usize = 4096;
