use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::RunnerError;

/// Proxy protocol type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProxyType {
    #[default]
    Http,
    /// Transparent forwarder, no handshake
    Plain,
    Socks4,
    Socks4a,
    Socks5,
}

impl ProxyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyType::Http => "http",
            ProxyType::Plain => "plain",
            ProxyType::Socks4 => "socks4",
            ProxyType::Socks4a => "socks4a",
            ProxyType::Socks5 => "socks5",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "http" | "https" => Some(ProxyType::Http),
            "plain" => Some(ProxyType::Plain),
            "socks4" => Some(ProxyType::Socks4),
            "socks4a" => Some(ProxyType::Socks4a),
            "socks5" => Some(ProxyType::Socks5),
            _ => None,
        }
    }

    pub fn is_socks(&self) -> bool {
        matches!(
            self,
            ProxyType::Socks4 | ProxyType::Socks4a | ProxyType::Socks5
        )
    }
}

impl fmt::Display for ProxyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Result of the last proxy check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProxyWorkingStatus {
    #[default]
    Untested,
    Working,
    NotWorking,
}

/// Allocation status inside a proxy pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProxyStatus {
    #[default]
    Available,
    Busy,
    Banned,
    Bad,
}

impl ProxyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyStatus::Available => "available",
            ProxyStatus::Busy => "busy",
            ProxyStatus::Banned => "banned",
            ProxyStatus::Bad => "bad",
        }
    }
}

impl fmt::Display for ProxyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Proxy entity
///
/// Two proxies are the same proxy when type, host, port and credentials
/// match; usage bookkeeping is ignored by `PartialEq` and `Hash`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Proxy {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(rename = "type")]
    pub proxy_type: ProxyType,
    #[serde(default)]
    pub working_status: ProxyWorkingStatus,
    #[serde(default)]
    pub status: ProxyStatus,
    #[serde(default)]
    pub total_uses: u32,
    #[serde(default)]
    pub being_used_by: u32,
    pub last_used: Option<DateTime<Utc>>,
    pub last_checked: Option<DateTime<Utc>>,
    pub last_banned: Option<DateTime<Utc>>,
    /// Round trip time of the last check in milliseconds
    #[serde(default)]
    pub ping: u32,
    #[serde(default)]
    pub country: String,
}

impl Proxy {
    pub fn new(host: impl Into<String>, port: u16, proxy_type: ProxyType) -> Self {
        Self {
            host: host.into(),
            port,
            username: None,
            password: None,
            proxy_type,
            working_status: ProxyWorkingStatus::Untested,
            status: ProxyStatus::Available,
            total_uses: 0,
            being_used_by: 0,
            last_used: None,
            last_checked: None,
            last_banned: None,
            ping: 0,
            country: String::new(),
        }
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Parse `[(type)]host:port[:username:password]`, falling back to
    /// `default_type` when no type prefix is present. IPv6 hosts are
    /// bracketed, and the password keeps any further colons.
    pub fn parse(input: &str, default_type: ProxyType) -> crate::Result<Self> {
        let input = input.trim();
        if input.is_empty() {
            return Err(RunnerError::InvalidProxyAddress("empty proxy string".into()));
        }

        let (proxy_type, rest) = match input.strip_prefix('(') {
            Some(stripped) => {
                let (kind, rest) = stripped.split_once(')').ok_or_else(|| {
                    RunnerError::InvalidProxyAddress(format!("unterminated type in {}", input))
                })?;
                let proxy_type = ProxyType::from_str(kind)
                    .ok_or_else(|| RunnerError::UnsupportedProtocol(kind.to_string()))?;
                (proxy_type, rest)
            }
            None => (default_type, input),
        };

        let (host, rest) = match rest.strip_prefix('[') {
            Some(bracketed) => {
                let (host, rest) = bracketed.split_once(']').ok_or_else(|| {
                    RunnerError::InvalidProxyAddress(format!("unterminated host in {}", input))
                })?;
                let rest = rest
                    .strip_prefix(':')
                    .ok_or_else(|| RunnerError::InvalidProxyAddress(input.to_string()))?;
                (host, rest)
            }
            None => rest
                .split_once(':')
                .ok_or_else(|| RunnerError::InvalidProxyAddress(input.to_string()))?,
        };

        let host = host.trim();
        if host.is_empty() {
            return Err(RunnerError::InvalidProxyAddress(format!("missing host in {}", input)));
        }

        let fields: Vec<&str> = rest.splitn(3, ':').collect();
        if fields.len() != 1 && fields.len() != 3 {
            return Err(RunnerError::InvalidProxyAddress(input.to_string()));
        }

        let port: u16 = fields[0]
            .trim()
            .parse()
            .map_err(|_| RunnerError::InvalidProxyAddress(format!("invalid port in {}", input)))?;
        if port == 0 {
            return Err(RunnerError::InvalidProxyAddress(format!("invalid port in {}", input)));
        }

        let mut proxy = Proxy::new(host, port, proxy_type);
        if fields.len() == 3 {
            proxy = proxy.with_credentials(fields[1], fields[2]);
        }

        Ok(proxy)
    }

    pub fn has_credentials(&self) -> bool {
        self.username.as_deref().is_some_and(|u| !u.is_empty())
    }

    /// `host:port` suitable for a TCP connect call
    pub fn address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Reset usage bookkeeping and mark the proxy available
    pub fn reset_usage(&mut self) {
        self.status = ProxyStatus::Available;
        self.total_uses = 0;
        self.being_used_by = 0;
    }
}

impl PartialEq for Proxy {
    fn eq(&self, other: &Self) -> bool {
        self.proxy_type == other.proxy_type
            && self.host == other.host
            && self.port == other.port
            && self.username == other.username
            && self.password == other.password
    }
}

impl Eq for Proxy {}

impl Hash for Proxy {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.proxy_type.hash(state);
        self.host.hash(state);
        self.port.hash(state);
        self.username.hash(state);
        self.password.hash(state);
    }
}

impl fmt::Display for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.proxy_type != ProxyType::Http {
            write!(f, "({})", self.proxy_type)?;
        }
        f.write_str(&self.address())?;
        if let Some(username) = &self.username {
            write!(
                f,
                ":{}:{}",
                username,
                self.password.as_deref().unwrap_or_default()
            )?;
        }
        Ok(())
    }
}

impl FromStr for Proxy {
    type Err = RunnerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Proxy::parse(s, ProxyType::Http)
    }
}
