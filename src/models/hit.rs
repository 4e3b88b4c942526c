use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{BotStatus, Proxy, Variable};

/// A terminal, non-bad outcome of one line
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hit {
    pub id: Uuid,
    pub data: String,
    pub captured: Vec<Variable>,
    pub proxy: Option<Proxy>,
    pub date: DateTime<Utc>,
    #[serde(rename = "type")]
    pub hit_type: BotStatus,
    pub config_id: String,
    pub config_name: String,
    pub job_id: Uuid,
    pub owner_id: u64,
}

impl Hit {
    /// Captured variables rendered as `NAME = value | NAME = value`
    pub fn captured_to_string(&self) -> String {
        self.captured
            .iter()
            .map(|v| format!("{} = {}", v.name, v.value))
            .collect::<Vec<_>>()
            .join(" | ")
    }
}

/// Destination for hits
#[async_trait]
pub trait HitOutput: Send + Sync {
    async fn store(&self, hit: &Hit) -> anyhow::Result<()>;
}
