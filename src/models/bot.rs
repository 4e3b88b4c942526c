use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::{DataLine, DataRule, Proxy, ProxyType, WordlistType};

/// Terminal status reported by a bot operation
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum BotStatus {
    Success,
    /// Needs to be checked again ("to check")
    None,
    Fail,
    Retry,
    Ban,
    Error,
    Invalid,
    Custom(String),
}

impl BotStatus {
    pub fn as_str(&self) -> &str {
        match self {
            BotStatus::Success => "SUCCESS",
            BotStatus::None => "NONE",
            BotStatus::Fail => "FAIL",
            BotStatus::Retry => "RETRY",
            BotStatus::Ban => "BAN",
            BotStatus::Error => "ERROR",
            BotStatus::Invalid => "INVALID",
            BotStatus::Custom(s) => s.as_str(),
        }
    }

    pub fn parse(s: &str) -> Self {
        match s.trim().to_uppercase().as_str() {
            "SUCCESS" => BotStatus::Success,
            "NONE" => BotStatus::None,
            "FAIL" => BotStatus::Fail,
            "RETRY" => BotStatus::Retry,
            "BAN" => BotStatus::Ban,
            "ERROR" => BotStatus::Error,
            "INVALID" => BotStatus::Invalid,
            _ => BotStatus::Custom(s.trim().to_string()),
        }
    }

    /// Bad statuses never produce a hit
    pub fn is_bad(&self) -> bool {
        matches!(
            self,
            BotStatus::Fail
                | BotStatus::Retry
                | BotStatus::Ban
                | BotStatus::Error
                | BotStatus::Invalid
        )
    }
}

impl fmt::Display for BotStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for BotStatus {
    fn from(s: String) -> Self {
        BotStatus::parse(&s)
    }
}

impl From<BotStatus> for String {
    fn from(status: BotStatus) -> Self {
        status.as_str().to_string()
    }
}

/// A named value produced while processing a line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Variable {
    pub name: String,
    pub value: String,
    /// Marked for capture into the hit
    #[serde(default)]
    pub capture: bool,
}

impl Variable {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            capture: false,
        }
    }

    pub fn captured(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            capture: true,
            ..Self::new(name, value)
        }
    }
}

/// Mutable state handed to a bot operation for one attempt on one line
#[derive(Debug, Clone)]
pub struct BotData {
    pub line: DataLine,
    pub proxy: Option<Proxy>,
    pub status: BotStatus,
    pub variables: Vec<Variable>,
    /// Id of the last captcha solved during this attempt
    pub last_captcha_id: Option<String>,
}

impl BotData {
    pub fn new(line: DataLine, wordlist_type: &WordlistType, proxy: Option<Proxy>) -> Self {
        let variables = line
            .slices(wordlist_type)
            .into_iter()
            .map(|(name, value)| Variable::new(name, value))
            .collect();

        Self {
            line,
            proxy,
            status: BotStatus::None,
            variables,
            last_captcha_id: None,
        }
    }

    pub fn variable(&self, name: &str) -> Option<&str> {
        self.variables
            .iter()
            .find(|v| v.name == name)
            .map(|v| v.value.as_str())
    }

    pub fn set_variable(&mut self, variable: Variable) {
        match self.variables.iter_mut().find(|v| v.name == variable.name) {
            Some(existing) => *existing = variable,
            None => self.variables.push(variable),
        }
    }

    pub fn captured(&self) -> Vec<Variable> {
        self.variables.iter().filter(|v| v.capture).cloned().collect()
    }
}

/// The opaque per-line operation body of a config
#[async_trait]
pub trait BotOperation: Send + Sync {
    /// Process one attempt, leaving the terminal status in `data.status`.
    /// Implementations observe `cancel` and return early when it fires.
    async fn execute(&self, data: &mut BotData, cancel: CancellationToken) -> anyhow::Result<()>;
}

/// Reports captcha solutions that turned out to be wrong
#[async_trait]
pub trait CaptchaReporter: Send + Sync {
    async fn report_bad(&self, captcha_id: &str) -> anyhow::Result<()>;
}

/// Config level settings that drive the retry/proxy state machine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigSettings {
    pub needs_proxies: bool,
    /// Maximum uses of a single proxy (0 = unlimited)
    pub max_uses_per_proxy: u32,
    /// Ban/error retries on one line before it is marked to check (0 = unlimited)
    pub ban_loop_evasion: u32,
    /// Statuses that ban the proxy used for the attempt
    pub ban_proxy_statuses: Vec<BotStatus>,
    pub allowed_proxy_types: Vec<ProxyType>,
    pub wordlist_type: WordlistType,
    pub data_rules: Vec<DataRule>,
}

impl Default for ConfigSettings {
    fn default() -> Self {
        Self {
            needs_proxies: false,
            max_uses_per_proxy: 0,
            ban_loop_evasion: 100,
            ban_proxy_statuses: vec![BotStatus::Ban, BotStatus::Error],
            allowed_proxy_types: vec![
                ProxyType::Http,
                ProxyType::Socks4,
                ProxyType::Socks4a,
                ProxyType::Socks5,
            ],
            wordlist_type: WordlistType::default(),
            data_rules: Vec::new(),
        }
    }
}

/// A config: identity, settings and the operation body
#[derive(Clone)]
pub struct BotConfig {
    pub id: String,
    pub name: String,
    pub settings: ConfigSettings,
    pub operation: Arc<dyn BotOperation>,
}

impl BotConfig {
    pub fn new(id: impl Into<String>, name: impl Into<String>, operation: Arc<dyn BotOperation>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            settings: ConfigSettings::default(),
            operation,
        }
    }

    pub fn with_settings(mut self, settings: ConfigSettings) -> Self {
        self.settings = settings;
        self
    }
}

impl fmt::Debug for BotConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BotConfig")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_parsing() {
        assert_eq!(BotStatus::parse("success"), BotStatus::Success);
        assert_eq!(BotStatus::parse("BAN"), BotStatus::Ban);
        assert_eq!(
            BotStatus::parse("2FA"),
            BotStatus::Custom("2FA".to_string())
        );
        assert_eq!(BotStatus::Custom("2FA".to_string()).to_string(), "2FA");
    }

    #[test]
    fn test_bad_statuses() {
        assert!(BotStatus::Fail.is_bad());
        assert!(BotStatus::Retry.is_bad());
        assert!(BotStatus::Invalid.is_bad());
        assert!(!BotStatus::Success.is_bad());
        assert!(!BotStatus::None.is_bad());
        assert!(!BotStatus::Custom("FREE".to_string()).is_bad());
    }

    #[test]
    fn test_status_serde_as_string() {
        let json = serde_json::to_string(&BotStatus::Ban).unwrap();
        assert_eq!(json, "\"BAN\"");
        let status: BotStatus = serde_json::from_str("\"EXPIRED\"").unwrap();
        assert_eq!(status, BotStatus::Custom("EXPIRED".to_string()));
    }

    #[test]
    fn test_bot_data_slices_and_capture() {
        let line = DataLine::new("user:pass", 0);
        let mut data = BotData::new(line, &WordlistType::credentials(), None);
        assert_eq!(data.variable("USER"), Some("user"));
        assert_eq!(data.variable("PASS"), Some("pass"));
        assert!(data.captured().is_empty());

        data.set_variable(Variable::captured("PLAN", "premium"));
        data.set_variable(Variable::captured("PLAN", "free"));
        assert_eq!(data.captured(), vec![Variable::captured("PLAN", "free")]);
    }
}
