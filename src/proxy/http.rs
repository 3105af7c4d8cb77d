//! HTTP proxy core: plain proxied requests and CONNECT tunnels.

use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use super::error::ProxyError;
use super::filter::NetworkFilter;

type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Serve one client connection on the HTTP listener.
///
/// HTTP/1.1 with upgrade support; CONNECT requests become raw tunnels after
/// the `200` response.
pub(crate) async fn serve_http_connection<S>(
    stream: S,
    filter: Arc<NetworkFilter>,
) -> Result<(), ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let filter = filter.clone();
        async move { handle_request(req, filter).await }
    });

    http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(true)
        .serve_connection(io, service)
        .with_upgrades()
        .await
        .map_err(ProxyError::from)
}

async fn handle_request(
    req: Request<Incoming>,
    filter: Arc<NetworkFilter>,
) -> Result<Response<ProxyBody>, ProxyError> {
    if req.method() == Method::CONNECT {
        handle_connect(req, filter).await
    } else {
        handle_forward(req, filter).await
    }
}

/// CONNECT tunneling. The authority must carry an explicit port; the filter
/// is consulted and the upstream dialed before the `200` goes out, so a
/// denied or unreachable destination never sees a tunnel.
async fn handle_connect(
    req: Request<Incoming>,
    filter: Arc<NetworkFilter>,
) -> Result<Response<ProxyBody>, ProxyError> {
    let authority = match req.uri().authority() {
        Some(authority) => authority.clone(),
        None => return Ok(bad_request("CONNECT request missing host:port")),
    };

    let host = authority
        .host()
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_string();
    let port = match authority.port_u16() {
        Some(port) => port,
        None => return Ok(bad_request("CONNECT request missing port")),
    };

    debug!("CONNECT request to {}:{}", host, port);

    if !filter.is_allowed(&host, port) {
        debug!("CONNECT to {}:{} denied by filter", host, port);
        return Ok(forbidden(&host, port));
    }

    let addr = dial_addr(&host, port);
    let mut upstream = match TcpStream::connect(&addr).await {
        Ok(conn) => conn,
        Err(err) => {
            debug!(dest = %addr, error = %err, "CONNECT upstream dial failed");
            return Ok(bad_gateway(&addr));
        }
    };

    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                let mut client = TokioIo::new(upgraded);
                // Half-close splice: EOF on one direction closes the peer's
                // write half; the sockets fully close only when both
                // directions finish.
                if let Err(err) = tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
                    debug!(dest = %addr, error = %err, "tunnel ended");
                }
            }
            Err(err) => {
                warn!(dest = %addr, error = %err, "HTTP upgrade failed");
            }
        }
    });

    Ok(Response::builder()
        .status(StatusCode::OK)
        .body(empty_body())
        .expect("static response"))
}

/// Plain (non-CONNECT) proxying: enforce the filter, then replay the
/// request upstream and stream the response back verbatim.
async fn handle_forward(
    req: Request<Incoming>,
    filter: Arc<NetworkFilter>,
) -> Result<Response<ProxyBody>, ProxyError> {
    let scheme_default = if req.uri().scheme_str() == Some("https") {
        443
    } else {
        80
    };

    let (host, port) = match req.uri().host() {
        Some(host) => {
            let host = host
                .trim_start_matches('[')
                .trim_end_matches(']')
                .to_string();
            (host, req.uri().port_u16().unwrap_or(scheme_default))
        }
        None => {
            // Origin-form request: fall back to the Host header.
            let header = req
                .headers()
                .get(hyper::header::HOST)
                .and_then(|v| v.to_str().ok());
            match header {
                Some(value) => match parse_host_port(value, scheme_default) {
                    Ok(dest) => dest,
                    Err(_) => return Ok(bad_request("invalid Host header")),
                },
                None => return Ok(bad_request("missing host")),
            }
        }
    };

    debug!("HTTP proxy request to {}:{}", host, port);

    if !filter.is_allowed(&host, port) {
        debug!("HTTP request to {}:{} denied by filter", host, port);
        return Ok(forbidden(&host, port));
    }

    let req = match into_absolute(req, &host, port) {
        Ok(req) => req,
        Err(response) => return Ok(response),
    };

    forward_upstream(req).await
}

/// Rewrite an origin-form request into absolute form so the upstream client
/// can route it. Requests already carrying an authority pass through.
fn into_absolute(
    req: Request<Incoming>,
    host: &str,
    port: u16,
) -> Result<Request<Incoming>, Response<ProxyBody>> {
    if req.uri().authority().is_some() {
        return Ok(req);
    }

    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let authority = dial_addr(host, port);
    let uri = format!("http://{}{}", authority, path)
        .parse::<hyper::Uri>()
        .map_err(|_| bad_request("unparseable request target"))?;

    let (mut parts, body) = req.into_parts();
    parts.uri = uri;
    Ok(Request::from_parts(parts, body))
}

async fn forward_upstream(req: Request<Incoming>) -> Result<Response<ProxyBody>, ProxyError> {
    use hyper_util::client::legacy::Client;
    use hyper_util::rt::TokioExecutor;

    let addr = req
        .uri()
        .authority()
        .map(|a| a.to_string())
        .unwrap_or_else(|| "upstream".to_string());

    let client: Client<_, Incoming> = Client::builder(TokioExecutor::new()).build_http();
    match client.request(req).await {
        Ok(response) => Ok(response.map(|body| body.boxed())),
        Err(err) => {
            debug!(dest = %addr, error = %err, "upstream request failed");
            Ok(bad_gateway(&addr))
        }
    }
}

/// Split a `host[:port]` string, handling bracketed IPv6 literals.
fn parse_host_port(value: &str, default_port: u16) -> Result<(String, u16), ProxyError> {
    if let Some(rest) = value.strip_prefix('[') {
        // [::1] or [::1]:8080
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| ProxyError::Protocol(format!("invalid host: {value}")))?;
        let port = match tail.strip_prefix(':') {
            Some(port) => port
                .parse::<u16>()
                .map_err(|_| ProxyError::Protocol(format!("invalid port: {port}")))?,
            None => default_port,
        };
        return Ok((host.to_string(), port));
    }

    match value.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => {
            let port = port
                .parse::<u16>()
                .map_err(|_| ProxyError::Protocol(format!("invalid port: {port}")))?;
            Ok((host.to_string(), port))
        }
        // Bare IPv6 literal or plain host with no port.
        _ => Ok((value.to_string(), default_port)),
    }
}

/// Target address for a TCP dial, re-bracketing IPv6 literals.
fn dial_addr(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

fn full_body(content: String) -> ProxyBody {
    Full::new(Bytes::from(content))
        .map_err(|never| match never {})
        .boxed()
}

fn forbidden(host: &str, port: u16) -> Response<ProxyBody> {
    Response::builder()
        .status(StatusCode::FORBIDDEN)
        .header("Content-Type", "text/plain")
        .body(full_body(format!(
            "Forbidden: destination {host}:{port} not allowed"
        )))
        .expect("static response")
}

fn bad_request(message: &str) -> Response<ProxyBody> {
    Response::builder()
        .status(StatusCode::BAD_REQUEST)
        .header("Content-Type", "text/plain")
        .body(full_body(format!("Bad Request: {message}")))
        .expect("static response")
}

fn bad_gateway(addr: &str) -> Response<ProxyBody> {
    Response::builder()
        .status(StatusCode::BAD_GATEWAY)
        .header("Content-Type", "text/plain")
        .body(full_body(format!("Bad Gateway: {addr} unreachable")))
        .expect("static response")
}
