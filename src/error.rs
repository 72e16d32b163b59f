//! Error types for the caching proxy.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

/// Result type alias for proxy operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while serving, forwarding or persisting.
#[derive(Debug, Error)]
pub enum Error {
    /// The service socket could not be bound. Fatal at startup.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// Socket or file I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A DNS message could not be decoded.
    #[error("malformed DNS message: {0}")]
    Malformed(&'static str),

    /// The upstream resolver did not answer in time.
    #[error("no reply from upstream within {0:?}")]
    UpstreamTimeout(Duration),

    /// A snapshot could not be encoded or decoded.
    #[error("snapshot error: {0}")]
    Snapshot(#[from] serde_json::Error),
}
