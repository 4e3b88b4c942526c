use async_trait::async_trait;

use super::{ProxyClient, ProxyStream};
use crate::error::Result;

/// Direct connection, the stream already reaches the destination
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainClient;

#[async_trait]
impl ProxyClient for PlainClient {
    fn protocol(&self) -> &'static str {
        "plain"
    }

    async fn handshake(&self, _stream: &mut dyn ProxyStream, _host: &str, _port: u16) -> Result<()> {
        Ok(())
    }
}
