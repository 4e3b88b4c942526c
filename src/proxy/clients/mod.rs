//! Proxy protocol clients
//!
//! Each client performs the TCP-level handshake that turns a connection to a
//! proxy into a tunnel to the destination. After a successful handshake the
//! stream carries destination traffic unchanged.

mod http;
mod plain;
mod socks4;
mod socks4a;
mod socks5;

pub use self::http::HttpProxyClient;
pub use plain::PlainClient;
pub use socks4::Socks4ProxyClient;
pub use socks4a::Socks4aProxyClient;
pub use socks5::Socks5ProxyClient;

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Result, RunnerError};
use crate::models::{Proxy, ProxyType};

/// Byte stream a handshake can run over
pub trait ProxyStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ProxyStream for T {}

/// Username/password pair sent to the proxy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn from_proxy(proxy: &Proxy) -> Option<Self> {
        match (&proxy.username, &proxy.password) {
            (Some(username), Some(password)) => Some(Self {
                username: username.clone(),
                password: password.clone(),
            }),
            _ => None,
        }
    }
}

#[async_trait]
pub trait ProxyClient: Send + Sync {
    fn protocol(&self) -> &'static str;

    /// Negotiate a tunnel to `host:port` over a stream already connected to
    /// the proxy.
    async fn handshake(&self, stream: &mut dyn ProxyStream, host: &str, port: u16) -> Result<()>;
}

/// Client for `proxy`; plain proxies and no proxy at all skip the handshake
pub fn create_client(proxy: Option<&Proxy>, read_timeout: Duration) -> Box<dyn ProxyClient> {
    let Some(proxy) = proxy else {
        return Box::new(PlainClient);
    };

    let credentials = Credentials::from_proxy(proxy);
    match proxy.proxy_type {
        ProxyType::Http => Box::new(HttpProxyClient::new(credentials, read_timeout)),
        ProxyType::Plain => Box::new(PlainClient),
        ProxyType::Socks4 => Box::new(Socks4ProxyClient::new(
            credentials.map(|c| c.username),
            read_timeout,
        )),
        ProxyType::Socks4a => Box::new(Socks4aProxyClient::new(
            credentials.map(|c| c.username),
            read_timeout,
        )),
        ProxyType::Socks5 => Box::new(Socks5ProxyClient::new(credentials, read_timeout)),
    }
}

/// Run `client`'s handshake for `host:port` over `stream`.
///
/// The stream is shut down before any error is returned, cancellation
/// included.
pub async fn tunnel<S: ProxyStream>(
    client: &dyn ProxyClient,
    stream: &mut S,
    host: &str,
    port: u16,
    cancel: &CancellationToken,
) -> Result<()> {
    if port == 0 {
        return Err(RunnerError::InvalidArgument(
            "destination port must be between 1 and 65535".into(),
        ));
    }

    let result = tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(RunnerError::Cancelled),
        result = client.handshake(&mut *stream, host, port) => result,
    };

    if let Err(e) = result {
        debug!(protocol = client.protocol(), "Handshake with {}:{} failed: {}", host, port, e);
        let _ = stream.shutdown().await;
        return Err(e);
    }

    Ok(())
}

/// Fill `buf` from the proxy, bounded by the read timeout
pub(crate) async fn read_exact_timeout(
    stream: &mut dyn ProxyStream,
    buf: &mut [u8],
    read_timeout: Duration,
) -> Result<()> {
    tokio::time::timeout(read_timeout, stream.read_exact(buf))
        .await
        .map_err(|_| RunnerError::Timeout)?
        .map_err(|e| {
            RunnerError::ProxyConnectionFailed(format!("Failed to read proxy reply: {}", e))
        })?;
    Ok(())
}

pub(crate) async fn write_request(stream: &mut dyn ProxyStream, request: &[u8]) -> Result<()> {
    stream.write_all(request).await.map_err(|e| {
        RunnerError::ProxyConnectionFailed(format!("Failed to send proxy request: {}", e))
    })?;
    stream.flush().await.map_err(|e| {
        RunnerError::ProxyConnectionFailed(format!("Failed to send proxy request: {}", e))
    })
}
