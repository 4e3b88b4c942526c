//! Connection establishment through upstream proxies
//!
//! Opens the TCP connection to the proxy (or straight to the destination when
//! no proxy is used) and runs the protocol handshake over it.

use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper::header::{CONNECTION, HOST, USER_AGENT};
use hyper::{Method, Request};
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};
use url::{Position, Url};

use super::clients::{create_client, tunnel};
use crate::error::{Result, RunnerError};
use crate::models::Proxy;

const USER_AGENT_VALUE: &str = concat!("rota-runner/", env!("CARGO_PKG_VERSION"));

/// Timeouts applied to every proxied connection
#[derive(Debug, Clone, Copy)]
pub struct ConnectionSettings {
    pub connect_timeout: Duration,
    /// Bound on every handshake read
    pub read_timeout: Duration,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(10),
        }
    }
}

fn socket_address(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// Open a stream to `host:port`, tunneled through `proxy` when given
#[instrument(skip(proxy, settings, cancel), fields(proxy = %proxy.map(|p| p.to_string()).unwrap_or_default()))]
pub async fn connect(
    proxy: Option<&Proxy>,
    host: &str,
    port: u16,
    settings: &ConnectionSettings,
    cancel: &CancellationToken,
) -> Result<TcpStream> {
    let address = match proxy {
        Some(proxy) => proxy.address(),
        None => socket_address(host, port),
    };

    let connecting = tokio::time::timeout(settings.connect_timeout, TcpStream::connect(&address));
    let mut stream = tokio::select! {
        result = connecting => result
            .map_err(|_| RunnerError::Timeout)?
            .map_err(|e| RunnerError::ProxyConnectionFailed(format!("TCP connect to {} failed: {}", address, e)))?,
        _ = cancel.cancelled() => return Err(RunnerError::Cancelled),
    };

    if let Err(e) = stream.peer_addr() {
        return Err(RunnerError::ProxyConnectionFailed(format!(
            "Socket to {} is not connected: {}",
            address, e
        )));
    }

    let client = create_client(proxy, settings.read_timeout);
    tunnel(client.as_ref(), &mut stream, host, port, cancel).await?;

    debug!(protocol = client.protocol(), "Connected to {}:{}", host, port);
    Ok(stream)
}

/// Status and body of a fetched page
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

/// GET an `http://` URL, optionally through a proxy, bounded by `timeout`
pub async fn http_get(
    url: &Url,
    proxy: Option<&Proxy>,
    settings: &ConnectionSettings,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<HttpResponse> {
    if url.scheme() != "http" {
        return Err(RunnerError::UnsupportedProtocol(format!(
            "{} (only http:// URLs can be fetched)",
            url.scheme()
        )));
    }

    let fetching = fetch(url, proxy, settings, cancel);
    tokio::select! {
        result = tokio::time::timeout(timeout, fetching) => result.map_err(|_| RunnerError::Timeout)?,
        _ = cancel.cancelled() => Err(RunnerError::Cancelled),
    }
}

async fn fetch(
    url: &Url,
    proxy: Option<&Proxy>,
    settings: &ConnectionSettings,
    cancel: &CancellationToken,
) -> Result<HttpResponse> {
    let host = url
        .host_str()
        .ok_or_else(|| RunnerError::InvalidArgument(format!("URL has no host: {}", url)))?;
    let port = url.port_or_known_default().unwrap_or(80);

    let stream = connect(proxy, host, port, settings, cancel).await?;

    let io = TokioIo::new(stream);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
        .await
        .map_err(|e| RunnerError::ProxyConnectionFailed(format!("Handshake failed: {}", e)))?;

    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!("Connection ended: {}", e);
        }
    });

    let host_header = match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    };
    let request = Request::builder()
        .method(Method::GET)
        .uri(&url[Position::BeforePath..])
        .header(HOST, host_header)
        .header(USER_AGENT, USER_AGENT_VALUE)
        .header(CONNECTION, "close")
        .body(Empty::<Bytes>::new())
        .map_err(|e| RunnerError::Http(format!("Failed to build request: {}", e)))?;

    let response = sender.send_request(request).await?;
    let status = response.status().as_u16();
    let body = response.into_body().collect().await?.to_bytes();

    Ok(HttpResponse {
        status,
        body: String::from_utf8_lossy(&body).into_owned(),
    })
}
