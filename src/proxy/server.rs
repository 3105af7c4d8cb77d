//! Proxy lifecycle: listener creation, accept loops, shutdown, env export.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use tempfile::TempDir;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tokio::sync::watch;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::error::ProxyError;
use super::filter::NetworkFilter;
use super::http::serve_http_connection;
use super::socks::serve_socks;

/// How long `close` waits for in-flight connection handlers to drain.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(5);

/// Listener transport. Chosen per platform: Unix-domain sockets where the
/// sandbox can see host filesystem paths (Linux bind mounts), loopback TCP
/// where it cannot (macOS Seatbelt).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Transport {
    Tcp,
    Unix,
}

fn platform_transport() -> Transport {
    if cfg!(target_os = "macos") {
        Transport::Tcp
    } else {
        Transport::Unix
    }
}

enum Listener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

impl Listener {
    async fn accept(&self) -> std::io::Result<ProxyStream> {
        match self {
            Listener::Tcp(listener) => listener.accept().await.map(|(s, _)| ProxyStream::Tcp(s)),
            Listener::Unix(listener) => listener.accept().await.map(|(s, _)| ProxyStream::Unix(s)),
        }
    }
}

/// An accepted client connection on either transport.
enum ProxyStream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl AsyncRead for ProxyStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            ProxyStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            ProxyStream::Unix(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ProxyStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            ProxyStream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            ProxyStream::Unix(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            ProxyStream::Tcp(s) => Pin::new(s).poll_flush(cx),
            ProxyStream::Unix(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            ProxyStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            ProxyStream::Unix(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// In-process HTTP and SOCKS5 proxy servers with destination filtering.
///
/// On Linux the listeners are Unix-domain sockets inside a private scratch
/// directory (bind-mountable into a sandbox); on macOS they are loopback TCP
/// sockets on OS-assigned ports. Construction starts both accept loops;
/// [`NetworkProxy::close`] must be called to reclaim resources, and is
/// idempotent.
///
/// # Example
///
/// ```no_run
/// use nestbox::proxy::{NetworkFilter, NetworkProxy};
///
/// # async fn run() -> Result<(), nestbox::proxy::ProxyError> {
/// let filter = NetworkFilter::new(&["github.com", "*.npmjs.org"], &[])?;
/// let proxy = NetworkProxy::new(filter).await?;
/// // Append proxy.env() to a sandboxed child's environment.
/// proxy.close().await?;
/// # Ok(())
/// # }
/// ```
pub struct NetworkProxy {
    http_addr: String,
    socks_addr: String,
    shutdown_tx: watch::Sender<bool>,
    tracker: TaskTracker,
    closed: AtomicBool,
    scratch_dir: Mutex<Option<TempDir>>,
}

impl NetworkProxy {
    /// Create and start proxy servers enforcing `filter`.
    ///
    /// Both listeners are created atomically: if the second bind fails, the
    /// first listener and the scratch directory are rolled back.
    pub async fn new(filter: NetworkFilter) -> Result<Self, ProxyError> {
        Self::with_transport(filter, platform_transport()).await
    }

    pub(crate) async fn with_transport(
        filter: NetworkFilter,
        transport: Transport,
    ) -> Result<Self, ProxyError> {
        let (http_listener, socks_listener, http_addr, socks_addr, scratch_dir) =
            create_listeners(transport).await?;

        info!(http = %http_addr, socks = %socks_addr, "proxy listening");

        let filter = Arc::new(filter);
        let tracker = TaskTracker::new();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        spawn_accept_loop(
            &tracker,
            http_listener,
            Service::Http,
            filter.clone(),
            shutdown_rx.clone(),
        );
        spawn_accept_loop(&tracker, socks_listener, Service::Socks, filter, shutdown_rx);

        Ok(Self {
            http_addr,
            socks_addr,
            shutdown_tx,
            tracker,
            closed: AtomicBool::new(false),
            scratch_dir: Mutex::new(scratch_dir),
        })
    }

    /// HTTP proxy address, suitable for `HTTP_PROXY`:
    /// `http://127.0.0.1:PORT` on TCP hosts, `unix:///path/http.sock` on
    /// Unix-socket hosts.
    pub fn http_addr(&self) -> &str {
        &self.http_addr
    }

    /// SOCKS5 proxy address: `127.0.0.1:PORT` on TCP hosts,
    /// `unix:///path/socks.sock` on Unix-socket hosts.
    pub fn socks_addr(&self) -> &str {
        &self.socks_addr
    }

    /// Proxy environment variables in upper- and lowercase forms, for
    /// appending to a sandboxed child's environment. A snapshot: the values
    /// never change after construction.
    pub fn env(&self) -> Vec<String> {
        let all_proxy = if self.socks_addr.starts_with("unix://") {
            self.socks_addr.clone()
        } else {
            format!("socks5://{}", self.socks_addr)
        };

        vec![
            format!("HTTP_PROXY={}", self.http_addr),
            format!("HTTPS_PROXY={}", self.http_addr),
            format!("http_proxy={}", self.http_addr),
            format!("https_proxy={}", self.http_addr),
            format!("ALL_PROXY={}", all_proxy),
            format!("all_proxy={}", all_proxy),
        ]
    }

    /// Shut down both servers and reclaim resources.
    ///
    /// Executes exactly once: the shutdown channel is signalled, the accept
    /// loops exit (dropping their listeners), in-flight handlers are awaited
    /// under a bounded deadline, and the scratch directory is removed.
    /// Repeat calls are no-ops returning success.
    pub async fn close(&self) -> Result<(), ProxyError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let _ = self.shutdown_tx.send(true);
        self.tracker.close();

        if tokio::time::timeout(SHUTDOWN_DEADLINE, self.tracker.wait())
            .await
            .is_err()
        {
            warn!("proxy shutdown deadline expired with handlers still running");
        }

        let scratch = self.scratch_dir.lock().expect("scratch lock").take();
        if let Some(dir) = scratch {
            dir.close()?;
        }

        Ok(())
    }
}

async fn create_listeners(
    transport: Transport,
) -> Result<(Listener, Listener, String, String, Option<TempDir>), ProxyError> {
    match transport {
        Transport::Unix => {
            let dir = tempfile::Builder::new()
                .prefix("nestbox-proxy-")
                .tempdir()
                .map_err(ProxyError::TempSetup)?;
            let http_path = dir.path().join("http.sock");
            let socks_path = dir.path().join("socks.sock");

            let http_listener =
                UnixListener::bind(&http_path).map_err(|source| ProxyError::Listen {
                    addr: http_path.display().to_string(),
                    source,
                })?;
            // Rollback is automatic: on failure `dir` drops and removes the
            // first socket with the directory.
            let socks_listener =
                UnixListener::bind(&socks_path).map_err(|source| ProxyError::Listen {
                    addr: socks_path.display().to_string(),
                    source,
                })?;

            let http_addr = format!("unix://{}", http_path.display());
            let socks_addr = format!("unix://{}", socks_path.display());
            Ok((
                Listener::Unix(http_listener),
                Listener::Unix(socks_listener),
                http_addr,
                socks_addr,
                Some(dir),
            ))
        }
        Transport::Tcp => {
            let http_listener =
                TcpListener::bind("127.0.0.1:0")
                    .await
                    .map_err(|source| ProxyError::Listen {
                        addr: "127.0.0.1:0".to_string(),
                        source,
                    })?;
            let socks_listener =
                TcpListener::bind("127.0.0.1:0")
                    .await
                    .map_err(|source| ProxyError::Listen {
                        addr: "127.0.0.1:0".to_string(),
                        source,
                    })?;

            let http_addr = format!("http://{}", http_listener.local_addr()?);
            let socks_addr = socks_listener.local_addr()?.to_string();
            Ok((
                Listener::Tcp(http_listener),
                Listener::Tcp(socks_listener),
                http_addr,
                socks_addr,
                None,
            ))
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Service {
    Http,
    Socks,
}

fn spawn_accept_loop(
    tracker: &TaskTracker,
    listener: Listener,
    service: Service,
    filter: Arc<NetworkFilter>,
    shutdown_rx: watch::Receiver<bool>,
) {
    let handlers = tracker.clone();
    tracker.spawn(async move {
        match accept_loop(listener, service, filter, shutdown_rx, handlers).await {
            // Orderly exit; not an error worth logging.
            Err(ProxyError::Shutdown) => debug!(?service, "accept loop stopped"),
            Err(err) => warn!(?service, error = %err, "accept loop failed"),
            Ok(()) => {}
        }
    });
}

async fn accept_loop(
    listener: Listener,
    service: Service,
    filter: Arc<NetworkFilter>,
    mut shutdown_rx: watch::Receiver<bool>,
    handlers: TaskTracker,
) -> Result<(), ProxyError> {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok(stream) => {
                        let filter = filter.clone();
                        handlers.spawn(async move {
                            let result = match service {
                                Service::Http => serve_http_connection(stream, filter).await,
                                Service::Socks => serve_socks(stream, &filter).await,
                            };
                            if let Err(err) = result {
                                log_connection_end(service, err);
                            }
                        });
                    }
                    Err(err) => {
                        warn!(?service, error = %err, "failed to accept connection");
                    }
                }
            }
            changed = shutdown_rx.changed() => {
                // A closed channel means the proxy was dropped; either way
                // the loop is done.
                if changed.is_err() || *shutdown_rx.borrow() {
                    return Err(ProxyError::Shutdown);
                }
            }
        }
    }
}

/// Connection teardown noise (resets, denials) is expected traffic for an
/// egress filter and logs at debug; everything else logs at warn.
fn log_connection_end(service: Service, err: ProxyError) {
    match &err {
        ProxyError::Denied { .. } | ProxyError::Protocol(_) | ProxyError::Shutdown => {
            debug!(?service, error = %err, "connection ended");
        }
        ProxyError::Io(io) if matches!(
            io.kind(),
            std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::BrokenPipe
                | std::io::ErrorKind::UnexpectedEof
        ) => {
            debug!(?service, error = %err, "connection ended");
        }
        _ => warn!(?service, error = %err, "connection error"),
    }
}
