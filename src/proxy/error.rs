//! Error types for proxy operations.

use thiserror::Error;

/// Unified error type for the egress proxy.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// I/O error on a socket or the scratch directory.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Hyper HTTP error.
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    /// A filter pattern could not be parsed.
    #[error("invalid filter pattern: {0}")]
    InvalidPattern(String),

    /// Failed to bind a listener during construction.
    #[error("failed to listen on {addr}: {source}")]
    Listen {
        /// The address that could not be bound.
        addr: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Failed to create the scratch directory for Unix sockets.
    #[error("failed to create proxy scratch directory: {0}")]
    TempSetup(#[source] std::io::Error),

    /// Protocol violation from a client (SOCKS5 framing, missing host).
    /// Translated to a protocol-level reply and never surfaced to the
    /// library caller.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Failure dialing or talking to the upstream target.
    #[error("upstream {addr} failed: {source}")]
    Upstream {
        /// Destination that failed.
        addr: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The filter rejected a destination.
    #[error("destination {host}:{port} not allowed")]
    Denied {
        /// Destination host.
        host: String,
        /// Destination port.
        port: u16,
    },

    /// Orderly accept-loop exit. Absorbed inside the proxy; never
    /// user-visible.
    #[error("proxy shutdown")]
    Shutdown,
}
