//! SOCKS4a tunneling, SOCKS4 with remote name resolution

use std::net::Ipv4Addr;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, instrument};

use super::socks4::{build_request, read_reply};
use super::{write_request, ProxyClient, ProxyStream};
use crate::error::Result;

/// Invalid destination IP telling the proxy a hostname follows
const REMOTE_DNS_SENTINEL: Ipv4Addr = Ipv4Addr::new(0, 0, 0, 1);

pub struct Socks4aProxyClient {
    user_id: Option<String>,
    read_timeout: Duration,
}

impl Socks4aProxyClient {
    pub fn new(user_id: Option<String>, read_timeout: Duration) -> Self {
        Self {
            user_id,
            read_timeout,
        }
    }

    fn build_request(&self, host: &str, port: u16) -> Vec<u8> {
        let user_id = self.user_id.as_deref();
        match host.parse::<Ipv4Addr>() {
            Ok(ip) => build_request(ip, port, user_id),
            Err(_) => {
                let mut request = build_request(REMOTE_DNS_SENTINEL, port, user_id);
                request.extend_from_slice(host.as_bytes());
                request.push(0x00);
                request
            }
        }
    }
}

#[async_trait]
impl ProxyClient for Socks4aProxyClient {
    fn protocol(&self) -> &'static str {
        "socks4a"
    }

    #[instrument(skip(self, stream))]
    async fn handshake(&self, stream: &mut dyn ProxyStream, host: &str, port: u16) -> Result<()> {
        let request = self.build_request(host, port);
        write_request(stream, &request).await?;

        read_reply(stream, self.read_timeout).await?;
        debug!("SOCKS4a connection established");
        Ok(())
    }
}
