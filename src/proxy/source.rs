//! Proxy providers feeding a pool

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use super::transport::{http_get, ConnectionSettings};
use crate::error::{Result, RunnerError};
use crate::models::{Proxy, ProxyType};

#[async_trait]
pub trait ProxySource: Send + Sync {
    /// Every proxy the source currently offers
    async fn get_all(&self, cancel: &CancellationToken) -> Result<Vec<Proxy>>;
}

/// Parse one proxy per line, skipping blanks, `#` comments and invalid lines
pub fn parse_proxy_list(text: &str, default_type: ProxyType, origin: &str) -> Vec<Proxy> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| match Proxy::parse(line, default_type) {
            Ok(proxy) => Some(proxy),
            Err(e) => {
                warn!(origin, line, "Skipping invalid proxy: {}", e);
                None
            }
        })
        .collect()
}

/// Fixed in-memory list
pub struct StaticProxySource {
    proxies: Vec<Proxy>,
}

impl StaticProxySource {
    pub fn new(proxies: Vec<Proxy>) -> Self {
        Self { proxies }
    }
}

#[async_trait]
impl ProxySource for StaticProxySource {
    async fn get_all(&self, _cancel: &CancellationToken) -> Result<Vec<Proxy>> {
        Ok(self.proxies.clone())
    }
}

/// Text file with one proxy per line
pub struct FileProxySource {
    path: PathBuf,
    default_type: ProxyType,
}

impl FileProxySource {
    pub fn new(path: impl Into<PathBuf>, default_type: ProxyType) -> Self {
        Self {
            path: path.into(),
            default_type,
        }
    }
}

#[async_trait]
impl ProxySource for FileProxySource {
    async fn get_all(&self, _cancel: &CancellationToken) -> Result<Vec<Proxy>> {
        let text = tokio::fs::read_to_string(&self.path).await?;
        let origin = self.path.display().to_string();
        let proxies = parse_proxy_list(&text, self.default_type, &origin);
        debug!(path = %origin, count = proxies.len(), "Loaded proxies from file");
        Ok(proxies)
    }
}

/// Plain-text proxy list served over `http://`
pub struct RemoteProxySource {
    url: Url,
    default_type: ProxyType,
    settings: ConnectionSettings,
    timeout: Duration,
}

impl RemoteProxySource {
    pub fn new(url: &str, default_type: ProxyType) -> Result<Self> {
        let url = Url::parse(url)?;
        if url.scheme() != "http" {
            return Err(RunnerError::UnsupportedProtocol(url.scheme().to_string()));
        }
        Ok(Self {
            url,
            default_type,
            settings: ConnectionSettings::default(),
            timeout: Duration::from_secs(30),
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl ProxySource for RemoteProxySource {
    async fn get_all(&self, cancel: &CancellationToken) -> Result<Vec<Proxy>> {
        let response = http_get(&self.url, None, &self.settings, self.timeout, cancel).await?;
        if response.status != 200 {
            return Err(RunnerError::Http(format!(
                "{} answered with status {}",
                self.url, response.status
            )));
        }

        let proxies = parse_proxy_list(&response.body, self.default_type, self.url.as_str());
        debug!(url = %self.url, count = proxies.len(), "Loaded remote proxies");
        Ok(proxies)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_proxy_list_skips_noise() {
        let text = "\
# upstream list
127.0.0.1:8080

(socks5)10.0.0.2:1080:user:pass
not a proxy
10.0.0.3:99999
";
        let proxies = parse_proxy_list(text, ProxyType::Http, "test");
        assert_eq!(proxies.len(), 2);
        assert_eq!(proxies[0].proxy_type, ProxyType::Http);
        assert_eq!(proxies[1].proxy_type, ProxyType::Socks5);
        assert_eq!(proxies[1].username.as_deref(), Some("user"));
    }

    #[tokio::test]
    async fn test_file_source() {
        let path = std::env::temp_dir().join(format!("rota-runner-proxies-{}.txt", uuid::Uuid::new_v4()));
        tokio::fs::write(&path, "1.1.1.1:80\n(socks4)2.2.2.2:1080\n")
            .await
            .unwrap();

        let source = FileProxySource::new(&path, ProxyType::Http);
        let proxies = source.get_all(&CancellationToken::new()).await.unwrap();
        assert_eq!(proxies.len(), 2);
        assert_eq!(proxies[1].proxy_type, ProxyType::Socks4);

        tokio::fs::remove_file(&path).await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_file_is_an_error() {
        let source = FileProxySource::new("/nonexistent/rota-runner/proxies.txt", ProxyType::Http);
        let result = source.get_all(&CancellationToken::new()).await;
        assert!(matches!(result, Err(RunnerError::Io(_))));
    }

    #[test]
    fn test_remote_source_requires_http() {
        assert!(RemoteProxySource::new("http://lists.example.com/proxies.txt", ProxyType::Http).is_ok());
        assert!(matches!(
            RemoteProxySource::new("ftp://lists.example.com/proxies.txt", ProxyType::Http),
            Err(RunnerError::UnsupportedProtocol(_))
        ));
        assert!(matches!(
            RemoteProxySource::new("not a url", ProxyType::Http),
            Err(RunnerError::InvalidConfig(_))
        ));
    }
}
