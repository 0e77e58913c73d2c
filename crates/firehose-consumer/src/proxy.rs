//! Direct and proxied TCP dialing for the stream upgrade.
//!
//! When a proxy applies to the target, the connection is tunneled with an
//! HTTP `CONNECT` before the WebSocket handshake runs over it, so TLS and the
//! upgrade are negotiated end to end with the traffic controller.

use std::net::IpAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;
use url::Url;

/// Picks the proxy for a target URL; `Ok(None)` means dial directly.
pub type ProxyResolver = Arc<dyn Fn(&Url) -> Result<Option<Url>, ProxyError> + Send + Sync>;

const MAX_RESPONSE_HEAD: usize = 8 * 1024;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("proxy refused tunnel: {status}")]
    Tunnel { status: String },
    #[error("malformed proxy response: {0}")]
    MalformedResponse(String),
    #[error("invalid proxy url {url}: {reason}")]
    InvalidProxyUrl { url: String, reason: String },
    #[error("target url has no host: {0}")]
    MissingHost(String),
    #[error("proxy io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Resolves the proxy for `target` from `HTTP(S)_PROXY` and `NO_PROXY`.
pub fn proxy_from_environment(target: &Url) -> Result<Option<Url>, ProxyError> {
    let lookup = |name: &str| {
        std::env::var(name)
            .or_else(|_| std::env::var(name.to_ascii_lowercase()))
            .ok()
    };
    resolve_proxy(target, lookup)
}

pub fn environment_resolver() -> ProxyResolver {
    Arc::new(|target: &Url| proxy_from_environment(target))
}

fn resolve_proxy<F>(target: &Url, lookup: F) -> Result<Option<Url>, ProxyError>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(host) = target.host_str() else {
        return Err(ProxyError::MissingHost(target.to_string()));
    };
    if is_loopback(host) {
        return Ok(None);
    }

    let variable = match target.scheme() {
        "wss" | "https" => "HTTPS_PROXY",
        _ => "HTTP_PROXY",
    };
    let Some(raw) = lookup(variable).and_then(normalize) else {
        return Ok(None);
    };

    let port = target.port_or_known_default();
    if let Some(no_proxy) = lookup("NO_PROXY").and_then(normalize) {
        if bypasses_proxy(&no_proxy, host, port) {
            return Ok(None);
        }
    }

    parse_proxy_url(&raw).map(Some)
}

fn normalize(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn parse_proxy_url(raw: &str) -> Result<Url, ProxyError> {
    let candidate = if raw.contains("://") {
        raw.to_string()
    } else {
        format!("http://{raw}")
    };
    let url = Url::parse(&candidate).map_err(|err| ProxyError::InvalidProxyUrl {
        url: raw.to_string(),
        reason: err.to_string(),
    })?;
    if url.host_str().is_none() {
        return Err(ProxyError::InvalidProxyUrl {
            url: raw.to_string(),
            reason: "missing host".into(),
        });
    }
    Ok(url)
}

fn is_loopback(host: &str) -> bool {
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }
    host.trim_start_matches('[')
        .trim_end_matches(']')
        .parse::<IpAddr>()
        .map(|ip| ip.is_loopback())
        .unwrap_or(false)
}

fn bypasses_proxy(no_proxy: &str, host: &str, port: Option<u16>) -> bool {
    let host = host.to_ascii_lowercase();
    no_proxy
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .any(|entry| {
            if entry == "*" {
                return true;
            }
            let entry = entry.to_ascii_lowercase();
            let (pattern, entry_port) = match entry.rsplit_once(':') {
                Some((name, port_text)) if !name.contains(':') || name.ends_with(']') => {
                    match port_text.parse::<u16>() {
                        Ok(p) => (name.to_string(), Some(p)),
                        Err(_) => (entry.clone(), None),
                    }
                }
                _ => (entry.clone(), None),
            };
            if entry_port.is_some() && entry_port != port {
                return false;
            }
            let pattern = pattern.trim_start_matches('.');
            host == pattern || host.ends_with(&format!(".{pattern}"))
        })
}

/// Opens a TCP stream to `target`, tunneling through a proxy when one applies.
pub async fn dial(target: &Url, resolver: Option<&ProxyResolver>) -> Result<TcpStream, ProxyError> {
    let host = target
        .host_str()
        .ok_or_else(|| ProxyError::MissingHost(target.to_string()))?;
    let port = target.port_or_known_default().unwrap_or(80);
    let authority = host_port(host, port);

    let proxy = match resolver {
        Some(resolve) => resolve(target)?,
        None => proxy_from_environment(target)?,
    };

    let Some(proxy) = proxy else {
        debug!(target = "firehose.proxy", addr = %authority, "dialing directly");
        return Ok(TcpStream::connect(&authority).await?);
    };

    let proxy_host = proxy
        .host_str()
        .ok_or_else(|| ProxyError::MissingHost(proxy.to_string()))?;
    let proxy_addr = host_port(proxy_host, proxy.port_or_known_default().unwrap_or(80));
    debug!(
        target = "firehose.proxy",
        proxy = %proxy_addr,
        addr = %authority,
        "tunneling through proxy"
    );
    let stream = TcpStream::connect(&proxy_addr).await?;
    connect_tunnel(stream, &authority).await
}

/// Issues `CONNECT authority` on `stream` and waits for a 200 response.
///
/// The response head is read a byte at a time so no tunneled bytes are
/// consumed before the caller takes over the stream.
pub async fn connect_tunnel(mut stream: TcpStream, authority: &str) -> Result<TcpStream, ProxyError> {
    let request = format!("CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\n\r\n");
    stream.write_all(request.as_bytes()).await?;
    stream.flush().await?;

    let head = read_response_head(&mut stream).await?;
    let status_line = head.lines().next().unwrap_or_default();
    let (code, reason) = parse_status_line(status_line)?;
    if code != 200 {
        let status = if reason.is_empty() {
            code.to_string()
        } else {
            reason
        };
        // Dropping the stream closes the proxy connection.
        return Err(ProxyError::Tunnel { status });
    }
    Ok(stream)
}

async fn read_response_head(stream: &mut TcpStream) -> Result<String, ProxyError> {
    let mut head = Vec::with_capacity(128);
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= MAX_RESPONSE_HEAD {
            return Err(ProxyError::MalformedResponse(
                "response head too large".into(),
            ));
        }
        let read = stream.read(&mut byte).await?;
        if read == 0 {
            return Err(ProxyError::MalformedResponse(
                "connection closed before response head".into(),
            ));
        }
        head.push(byte[0]);
    }
    String::from_utf8(head).map_err(|_| ProxyError::MalformedResponse("non-utf8 response head".into()))
}

fn parse_status_line(line: &str) -> Result<(u16, String), ProxyError> {
    let mut parts = line.splitn(3, ' ');
    let version = parts.next().unwrap_or_default();
    if !version.starts_with("HTTP/") {
        return Err(ProxyError::MalformedResponse(format!(
            "unexpected status line {line:?}"
        )));
    }
    let code = parts
        .next()
        .and_then(|code| code.parse::<u16>().ok())
        .ok_or_else(|| ProxyError::MalformedResponse(format!("missing status code in {line:?}")))?;
    let reason = parts.next().unwrap_or_default().trim().to_string();
    Ok((code, reason))
}

fn host_port(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}
