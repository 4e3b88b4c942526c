//! File sinks for hits and checked proxies

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::models::{Hit, HitOutput, Proxy, ProxyWorkingStatus};

/// Destination for proxies processed by a check job
#[async_trait]
pub trait ProxyCheckOutput: Send + Sync {
    async fn store(&self, proxy: &Proxy) -> anyhow::Result<()>;
}

/// Resolves the country of a proxy host
#[async_trait]
pub trait ProxyGeolocator: Send + Sync {
    async fn geolocate(&self, host: &str) -> anyhow::Result<String>;
}

async fn append_line(path: &PathBuf, lock: &Mutex<()>, line: &str) -> anyhow::Result<()> {
    let _guard = lock.lock().await;
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(line.as_bytes()).await?;
    file.write_all(b"\n").await?;
    file.flush().await?;
    Ok(())
}

/// Appends every hit to a file as one JSON document per line
pub struct FileHitOutput {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileHitOutput {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }
}

#[async_trait]
impl HitOutput for FileHitOutput {
    async fn store(&self, hit: &Hit) -> anyhow::Result<()> {
        let line = serde_json::to_string(hit)?;
        append_line(&self.path, &self.lock, &line).await
    }
}

/// Appends working proxies to a file in the `[(type)]host:port[:user:pass]` format
pub struct FileProxyCheckOutput {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileProxyCheckOutput {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }
}

#[async_trait]
impl ProxyCheckOutput for FileProxyCheckOutput {
    async fn store(&self, proxy: &Proxy) -> anyhow::Result<()> {
        if proxy.working_status != ProxyWorkingStatus::Working {
            return Ok(());
        }
        append_line(&self.path, &self.lock, &proxy.to_string()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BotStatus, ProxyType, Variable};
    use chrono::Utc;
    use uuid::Uuid;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("rota-runner-{}-{}", name, Uuid::new_v4()))
    }

    #[tokio::test]
    async fn test_hits_are_json_lines() {
        let path = temp_path("hits.jsonl");
        let output = FileHitOutput::new(&path);

        for data in ["a:1", "b:2"] {
            let hit = Hit {
                id: Uuid::new_v4(),
                data: data.to_string(),
                captured: vec![Variable::captured("PLAN", "pro")],
                proxy: None,
                date: Utc::now(),
                hit_type: BotStatus::Success,
                config_id: "cfg".into(),
                config_name: "Config".into(),
                job_id: Uuid::new_v4(),
                owner_id: 0,
            };
            output.store(&hit).await.unwrap();
        }

        let content = tokio::fs::read_to_string(&path).await.unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["data"], "a:1");
        assert_eq!(first["type"], "SUCCESS");

        tokio::fs::remove_file(&path).await.unwrap();
    }

    #[tokio::test]
    async fn test_only_working_proxies_are_written() {
        let path = temp_path("working.txt");
        let output = FileProxyCheckOutput::new(&path);

        let mut working = Proxy::new("1.1.1.1", 1080, ProxyType::Socks5);
        working.working_status = ProxyWorkingStatus::Working;
        let mut dead = Proxy::new("2.2.2.2", 8080, ProxyType::Http);
        dead.working_status = ProxyWorkingStatus::NotWorking;

        output.store(&working).await.unwrap();
        output.store(&dead).await.unwrap();

        let content = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(content, "(socks5)1.1.1.1:1080\n");

        tokio::fs::remove_file(&path).await.unwrap();
    }
}
