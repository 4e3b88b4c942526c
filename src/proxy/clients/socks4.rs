//! SOCKS4 tunneling

use std::net::Ipv4Addr;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, instrument};

use super::{read_exact_timeout, write_request, ProxyClient, ProxyStream};
use crate::error::{Result, RunnerError};

const VERSION: u8 = 0x04;
const CMD_CONNECT: u8 = 0x01;

const REQUEST_GRANTED: u8 = 0x5a;
const REQUEST_REJECTED: u8 = 0x5b;
const IDENTD_UNREACHABLE: u8 = 0x5c;
const IDENTD_MISMATCH: u8 = 0x5d;

pub struct Socks4ProxyClient {
    user_id: Option<String>,
    read_timeout: Duration,
}

impl Socks4ProxyClient {
    pub fn new(user_id: Option<String>, read_timeout: Duration) -> Self {
        Self {
            user_id,
            read_timeout,
        }
    }
}

/// `[4, 1, port, ip, userid..., 0]`
pub(super) fn build_request(ip: Ipv4Addr, port: u16, user_id: Option<&str>) -> Vec<u8> {
    let user_id = user_id.unwrap_or_default().as_bytes();
    let mut request = Vec::with_capacity(9 + user_id.len());
    request.push(VERSION);
    request.push(CMD_CONNECT);
    request.extend_from_slice(&port.to_be_bytes());
    request.extend_from_slice(&ip.octets());
    request.extend_from_slice(user_id);
    request.push(0x00);
    request
}

/// Read the 8-byte reply and map its status byte
pub(super) async fn read_reply(stream: &mut dyn ProxyStream, read_timeout: Duration) -> Result<()> {
    let mut reply = [0u8; 8];
    read_exact_timeout(stream, &mut reply, read_timeout).await?;

    match reply[1] {
        REQUEST_GRANTED => Ok(()),
        code => Err(RunnerError::ProxyProtocol(reply_message(code).to_string())),
    }
}

fn reply_message(code: u8) -> &'static str {
    match code {
        REQUEST_REJECTED => "Request rejected or failed.",
        IDENTD_UNREACHABLE => {
            "Request failed because client is not running identd (or not reachable from the server)."
        }
        IDENTD_MISMATCH => {
            "Request failed because client's identd could not confirm the user ID string in the request."
        }
        _ => "Unknown SOCKS error.",
    }
}

/// SOCKS4 only carries IPv4 destinations, names are resolved locally
async fn resolve_ipv4(host: &str, port: u16) -> Result<Ipv4Addr> {
    if let Ok(ip) = host.parse::<Ipv4Addr>() {
        return Ok(ip);
    }

    let addrs = tokio::net::lookup_host((host, port)).await.map_err(|e| {
        RunnerError::ProxyConnectionFailed(format!("Failed to resolve {}: {}", host, e))
    })?;

    addrs
        .filter_map(|addr| match addr.ip() {
            std::net::IpAddr::V4(ip) => Some(ip),
            std::net::IpAddr::V6(_) => None,
        })
        .next()
        .ok_or_else(|| {
            RunnerError::InvalidArgument(format!(
                "SOCKS4 requires an IPv4 destination, {} has none. Use SOCKS4a or SOCKS5",
                host
            ))
        })
}

#[async_trait]
impl ProxyClient for Socks4ProxyClient {
    fn protocol(&self) -> &'static str {
        "socks4"
    }

    #[instrument(skip(self, stream))]
    async fn handshake(&self, stream: &mut dyn ProxyStream, host: &str, port: u16) -> Result<()> {
        let ip = resolve_ipv4(host, port).await?;
        let request = build_request(ip, port, self.user_id.as_deref());
        write_request(stream, &request).await?;

        read_reply(stream, self.read_timeout).await?;
        debug!("SOCKS4 connection established");
        Ok(())
    }
}
