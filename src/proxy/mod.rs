//! Egress-filtering proxy for sandboxed children.
//!
//! A [`NetworkProxy`] runs an HTTP proxy (plain requests and CONNECT
//! tunnels) and a SOCKS5 proxy in-process, both enforcing one
//! [`NetworkFilter`] over `(host, port)` destinations. Listener transport is
//! platform-specific: Unix-domain sockets in a private scratch directory on
//! Linux (where the sandbox can bind-mount them), loopback TCP on macOS.
//!
//! The proxy must be closed with [`NetworkProxy::close`] to reclaim
//! listeners and the scratch directory; otherwise the accept tasks live
//! until the proxy is dropped.
//!
//! Protocol-level failures (bad SOCKS framing, denied destinations,
//! unreachable upstreams) are answered on the wire — HTTP 400/403/502,
//! SOCKS5 reply codes — and never surface to the embedding application.

mod error;
mod filter;
mod http;
mod server;
mod socks;

pub use error::ProxyError;
pub use filter::{HostPattern, NetworkFilter};
pub use server::NetworkProxy;
