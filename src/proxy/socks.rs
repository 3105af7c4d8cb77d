//! SOCKS5 proxy core: RFC 1928 CONNECT with no-auth negotiation.

use std::net::{Ipv4Addr, Ipv6Addr};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use super::error::ProxyError;
use super::filter::NetworkFilter;

const SOCKS_VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_NONE_ACCEPTABLE: u8 = 0xFF;
const CMD_CONNECT: u8 = 0x01;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// Reply codes (RFC 1928 §6).
const REP_SUCCESS: u8 = 0x00;
const REP_GENERAL_FAILURE: u8 = 0x01;
const REP_NOT_ALLOWED: u8 = 0x02;
const REP_CONNECTION_REFUSED: u8 = 0x05;

/// Serve one SOCKS5 client connection end to end.
///
/// Generic over the stream so the same implementation backs Unix-domain and
/// TCP listeners.
pub(crate) async fn serve_socks<S>(mut stream: S, filter: &NetworkFilter) -> Result<(), ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    negotiate(&mut stream).await?;

    let (host, port) = match read_request(&mut stream).await {
        Ok(dest) => dest,
        Err(err) => {
            send_reply(&mut stream, REP_GENERAL_FAILURE).await?;
            return Err(err);
        }
    };

    if !filter.is_allowed(&host, port) {
        send_reply(&mut stream, REP_NOT_ALLOWED).await?;
        return Err(ProxyError::Denied { host, port });
    }

    let addr = format!("{}:{}", host, port);
    let mut upstream = match TcpStream::connect(&addr).await {
        Ok(conn) => conn,
        Err(source) => {
            send_reply(&mut stream, REP_CONNECTION_REFUSED).await?;
            return Err(ProxyError::Upstream { addr, source });
        }
    };

    send_reply(&mut stream, REP_SUCCESS).await?;
    debug!(dest = %addr, "socks5 tunnel established");

    // Half-close splice: EOF on one direction shuts down the peer's write
    // half, so request/response protocols terminate cleanly.
    let _ = tokio::io::copy_bidirectional(&mut stream, &mut upstream).await;
    Ok(())
}

/// Method negotiation: require version 5 and the no-auth method.
async fn negotiate<S>(stream: &mut S) -> Result<(), ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await?;
    let [version, nmethods] = header;

    if version != SOCKS_VERSION {
        return Err(ProxyError::Protocol(format!(
            "unsupported SOCKS version: {version}"
        )));
    }

    let mut methods = vec![0u8; nmethods as usize];
    stream.read_exact(&mut methods).await?;

    if !methods.contains(&METHOD_NO_AUTH) {
        stream
            .write_all(&[SOCKS_VERSION, METHOD_NONE_ACCEPTABLE])
            .await?;
        return Err(ProxyError::Protocol(
            "no acceptable authentication methods".to_string(),
        ));
    }

    stream.write_all(&[SOCKS_VERSION, METHOD_NO_AUTH]).await?;
    Ok(())
}

/// Read the CONNECT request and extract the destination.
async fn read_request<S>(stream: &mut S) -> Result<(String, u16), ProxyError>
where
    S: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    let [version, cmd, _reserved, atyp] = header;

    if version != SOCKS_VERSION {
        return Err(ProxyError::Protocol(format!(
            "unsupported SOCKS version: {version}"
        )));
    }
    if cmd != CMD_CONNECT {
        return Err(ProxyError::Protocol(format!("unsupported command: {cmd}")));
    }

    let host = match atyp {
        ATYP_IPV4 => {
            let mut octets = [0u8; 4];
            stream.read_exact(&mut octets).await?;
            Ipv4Addr::from(octets).to_string()
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let mut domain = vec![0u8; len[0] as usize];
            stream.read_exact(&mut domain).await?;
            String::from_utf8(domain)
                .map_err(|_| ProxyError::Protocol("domain is not valid UTF-8".to_string()))?
        }
        ATYP_IPV6 => {
            let mut octets = [0u8; 16];
            stream.read_exact(&mut octets).await?;
            Ipv6Addr::from(octets).to_string()
        }
        other => {
            return Err(ProxyError::Protocol(format!(
                "unsupported address type: {other}"
            )));
        }
    };

    let mut port = [0u8; 2];
    stream.read_exact(&mut port).await?;
    Ok((host, u16::from_be_bytes(port)))
}

/// Send a reply with a dummy bind address of `0.0.0.0:0`.
async fn send_reply<S>(stream: &mut S, code: u8) -> Result<(), ProxyError>
where
    S: AsyncWrite + Unpin,
{
    let reply = [
        SOCKS_VERSION,
        code,
        0x00,      // reserved
        ATYP_IPV4, // bind address type
        0, 0, 0, 0, // bind address 0.0.0.0
        0, 0, // bind port 0
    ];
    stream.write_all(&reply).await?;
    Ok(())
}
