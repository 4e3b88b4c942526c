//! HTTP CONNECT tunneling

use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use tokio::io::AsyncReadExt;
use tracing::{debug, instrument};

use super::{write_request, Credentials, ProxyClient, ProxyStream};
use crate::error::{Result, RunnerError};

const MAX_RESPONSE_HEADER: usize = 8 * 1024;

pub struct HttpProxyClient {
    credentials: Option<Credentials>,
    version: String,
    read_timeout: Duration,
}

impl HttpProxyClient {
    pub fn new(credentials: Option<Credentials>, read_timeout: Duration) -> Self {
        Self {
            credentials,
            version: "1.1".to_string(),
            read_timeout,
        }
    }

    /// HTTP version written in the request line
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    fn build_connect_request(&self, host: &str, port: u16) -> String {
        let mut request = format!("CONNECT {}:{} HTTP/{}\r\n", host, port, self.version);

        if let Some(credentials) = &self.credentials {
            let encoded = BASE64.encode(format!("{}:{}", credentials.username, credentials.password));
            request.push_str(&format!("Proxy-Authorization: Basic {}\r\n", encoded));
        }

        request.push_str("\r\n");
        request
    }

    /// Read until the end of the response header or the proxy closes
    async fn read_response(&self, stream: &mut dyn ProxyStream) -> Result<String> {
        let mut response = Vec::with_capacity(256);
        let mut chunk = [0u8; 1024];

        loop {
            let n = tokio::time::timeout(self.read_timeout, stream.read(&mut chunk))
                .await
                .map_err(|_| RunnerError::Timeout)?
                .map_err(|e| {
                    RunnerError::ProxyConnectionFailed(format!(
                        "Failed to read CONNECT response: {}",
                        e
                    ))
                })?;

            if n == 0 {
                break;
            }
            response.extend_from_slice(&chunk[..n]);

            if response.windows(4).any(|w| w == b"\r\n\r\n") {
                break;
            }
            if response.len() > MAX_RESPONSE_HEADER {
                return Err(RunnerError::ProxyProtocol(
                    "CONNECT response header is too large".into(),
                ));
            }
        }

        Ok(String::from_utf8_lossy(&response).into_owned())
    }
}

/// Status code of an `HTTP/x.y NNN reason` line
fn parse_status_code(response: &str) -> Option<u16> {
    let status_line = response.lines().next()?;
    let mut parts = status_line.split_whitespace();

    let version = parts.next()?;
    if !version.starts_with("HTTP/") {
        return None;
    }
    let code = parts.next()?;
    if code.len() != 3 {
        return None;
    }
    code.parse().ok()
}

#[async_trait]
impl ProxyClient for HttpProxyClient {
    fn protocol(&self) -> &'static str {
        "http"
    }

    #[instrument(skip(self, stream))]
    async fn handshake(&self, stream: &mut dyn ProxyStream, host: &str, port: u16) -> Result<()> {
        let request = self.build_connect_request(host, port);
        write_request(stream, request.as_bytes()).await?;

        let response = self.read_response(stream).await?;
        match parse_status_code(&response) {
            Some(200) => {
                debug!("HTTP CONNECT tunnel established");
                Ok(())
            }
            Some(_) => Err(RunnerError::ProxyProtocol(format!(
                "CONNECT failed: {}",
                response.lines().next().unwrap_or_default()
            ))),
            None => Err(RunnerError::ProxyProtocol(
                "Invalid response to CONNECT request".into(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::io::Builder;

    fn credentials() -> Option<Credentials> {
        Some(Credentials {
            username: "user".into(),
            password: "pass".into(),
        })
    }

    #[test]
    fn test_parse_status_code() {
        assert_eq!(parse_status_code("HTTP/1.1 200 Connection established\r\n\r\n"), Some(200));
        assert_eq!(parse_status_code("HTTP/1.0 407 Proxy Authentication Required"), Some(407));
        assert_eq!(parse_status_code("SSH-2.0-OpenSSH"), None);
        assert_eq!(parse_status_code("HTTP/1.1 2000 OK"), None);
        assert_eq!(parse_status_code(""), None);
    }

    #[tokio::test]
    async fn test_connect_without_credentials() {
        let mut stream = Builder::new()
            .write(b"CONNECT example.com:443 HTTP/1.1\r\n\r\n")
            .read(b"HTTP/1.1 200 Connection established\r\n\r\n")
            .build();

        let client = HttpProxyClient::new(None, Duration::from_secs(5));
        client.handshake(&mut stream, "example.com", 443).await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_with_basic_auth() {
        let mut stream = Builder::new()
            .write(b"CONNECT 10.0.0.1:80 HTTP/1.0\r\nProxy-Authorization: Basic dXNlcjpwYXNz\r\n\r\n")
            .read(b"HTTP/1.0 200 OK\r\n")
            .read(b"Via: test\r\n\r\n")
            .build();

        let client = HttpProxyClient::new(credentials(), Duration::from_secs(5)).with_version("1.0");
        client.handshake(&mut stream, "10.0.0.1", 80).await.unwrap();
    }

    #[tokio::test]
    async fn test_non_200_status_fails() {
        let mut stream = Builder::new()
            .write(b"CONNECT example.com:443 HTTP/1.1\r\n\r\n")
            .read(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n")
            .build();

        let client = HttpProxyClient::new(None, Duration::from_secs(5));
        let err = client.handshake(&mut stream, "example.com", 443).await.unwrap_err();
        assert!(matches!(err, RunnerError::ProxyProtocol(_)));
        assert!(err.to_string().contains("407"));
    }

    #[tokio::test]
    async fn test_unparsable_response_fails() {
        let mut stream = Builder::new()
            .write(b"CONNECT example.com:443 HTTP/1.1\r\n\r\n")
            .read(b"garbage")
            .build();

        let client = HttpProxyClient::new(None, Duration::from_secs(5));
        let err = client.handshake(&mut stream, "example.com", 443).await.unwrap_err();
        assert!(matches!(err, RunnerError::ProxyProtocol(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_proxy_times_out() {
        let mut stream = Builder::new()
            .write(b"CONNECT example.com:443 HTTP/1.1\r\n\r\n")
            .wait(Duration::from_secs(60))
            .build();

        let client = HttpProxyClient::new(None, Duration::from_secs(2));
        let err = client.handshake(&mut stream, "example.com", 443).await.unwrap_err();
        assert!(matches!(err, RunnerError::Timeout));
    }
}
