//! SOCKS5 tunneling with optional username/password authentication (RFC 1929)

use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, instrument};

use super::{read_exact_timeout, write_request, Credentials, ProxyClient, ProxyStream};
use crate::error::{Result, RunnerError};

const VERSION: u8 = 0x05;
const AUTH_VERSION: u8 = 0x01;
const CMD_CONNECT: u8 = 0x01;

const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_USER_PASS: u8 = 0x02;
const METHOD_NONE_ACCEPTABLE: u8 = 0xff;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

const SUCCEEDED: u8 = 0x00;

pub struct Socks5ProxyClient {
    credentials: Option<Credentials>,
    read_timeout: Duration,
}

impl Socks5ProxyClient {
    pub fn new(credentials: Option<Credentials>, read_timeout: Duration) -> Self {
        Self {
            credentials,
            read_timeout,
        }
    }

    async fn negotiate(&self, stream: &mut dyn ProxyStream) -> Result<()> {
        let method = if self.credentials.is_some() {
            METHOD_USER_PASS
        } else {
            METHOD_NO_AUTH
        };
        write_request(stream, &[VERSION, 0x01, method]).await?;

        let mut reply = [0u8; 2];
        read_exact_timeout(stream, &mut reply, self.read_timeout).await?;
        if reply[0] != VERSION {
            return Err(RunnerError::ProxyProtocol(format!(
                "Invalid SOCKS version in reply: {}",
                reply[0]
            )));
        }

        match (reply[1], &self.credentials) {
            (METHOD_USER_PASS, Some(credentials)) => self.authenticate(stream, credentials).await,
            (METHOD_NO_AUTH, _) => Ok(()),
            (METHOD_NONE_ACCEPTABLE, _) => Err(RunnerError::ProxyProtocol(
                "No acceptable SOCKS authentication method.".into(),
            )),
            (other, _) => Err(RunnerError::ProxyProtocol(format!(
                "Unsupported SOCKS authentication method: {}",
                other
            ))),
        }
    }

    async fn authenticate(&self, stream: &mut dyn ProxyStream, credentials: &Credentials) -> Result<()> {
        let username = credentials.username.as_bytes();
        let password = credentials.password.as_bytes();
        if username.len() > 255 || password.len() > 255 {
            return Err(RunnerError::InvalidArgument(
                "SOCKS5 username and password must be at most 255 bytes".into(),
            ));
        }

        let mut request = Vec::with_capacity(3 + username.len() + password.len());
        request.push(AUTH_VERSION);
        request.push(username.len() as u8);
        request.extend_from_slice(username);
        request.push(password.len() as u8);
        request.extend_from_slice(password);
        write_request(stream, &request).await?;

        let mut reply = [0u8; 2];
        read_exact_timeout(stream, &mut reply, self.read_timeout).await?;
        if reply[1] != SUCCEEDED {
            return Err(RunnerError::ProxyProtocol(
                "SOCKS authentication failed.".into(),
            ));
        }
        Ok(())
    }

    async fn connect(&self, stream: &mut dyn ProxyStream, host: &str, port: u16) -> Result<()> {
        let request = build_connect_request(host, port)?;
        write_request(stream, &request).await?;

        // VER REP RSV ATYP, then the bound address and port
        let mut header = [0u8; 4];
        read_exact_timeout(stream, &mut header, self.read_timeout).await?;
        if header[1] != SUCCEEDED {
            return Err(RunnerError::ProxyProtocol(reply_message(header[1]).to_string()));
        }

        let address_len = match header[3] {
            ATYP_IPV4 => 4,
            ATYP_IPV6 => 16,
            ATYP_DOMAIN => {
                let mut len = [0u8; 1];
                read_exact_timeout(stream, &mut len, self.read_timeout).await?;
                len[0] as usize
            }
            other => {
                return Err(RunnerError::ProxyProtocol(format!(
                    "Unknown address type in SOCKS reply: {}",
                    other
                )))
            }
        };

        let mut bound = vec![0u8; address_len + 2];
        read_exact_timeout(stream, &mut bound, self.read_timeout).await?;
        Ok(())
    }
}

fn build_connect_request(host: &str, port: u16) -> Result<Vec<u8>> {
    let mut request = vec![VERSION, CMD_CONNECT, 0x00];

    match host.trim_start_matches('[').trim_end_matches(']').parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => {
            request.push(ATYP_IPV4);
            request.extend_from_slice(&ip.octets());
        }
        Ok(IpAddr::V6(ip)) => {
            request.push(ATYP_IPV6);
            request.extend_from_slice(&ip.octets());
        }
        Err(_) => {
            let name = host.as_bytes();
            if name.is_empty() || name.len() > 255 {
                return Err(RunnerError::InvalidArgument(format!(
                    "SOCKS5 destination host must be 1 to 255 bytes: {}",
                    host
                )));
            }
            request.push(ATYP_DOMAIN);
            request.push(name.len() as u8);
            request.extend_from_slice(name);
        }
    }

    request.extend_from_slice(&port.to_be_bytes());
    Ok(request)
}

fn reply_message(code: u8) -> &'static str {
    match code {
        0x01 => "General SOCKS server failure.",
        0x02 => "Connection not allowed by ruleset.",
        0x03 => "Network unreachable.",
        0x04 => "Host unreachable.",
        0x05 => "Connection refused.",
        0x06 => "TTL expired.",
        0x07 => "Command not supported.",
        0x08 => "Address type not supported.",
        _ => "Unknown SOCKS error.",
    }
}

#[async_trait]
impl ProxyClient for Socks5ProxyClient {
    fn protocol(&self) -> &'static str {
        "socks5"
    }

    #[instrument(skip(self, stream))]
    async fn handshake(&self, stream: &mut dyn ProxyStream, host: &str, port: u16) -> Result<()> {
        self.negotiate(stream).await?;
        self.connect(stream, host, port).await?;
        debug!("SOCKS5 connection established");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::io::Builder;

    const IPV4_SUCCESS: [u8; 10] = [0x05, 0x00, 0x00, 0x01, 127, 0, 0, 1, 0x1f, 0x90];

    #[test]
    fn test_connect_request_address_types() {
        assert_eq!(
            build_connect_request("1.2.3.4", 80).unwrap(),
            vec![0x05, 0x01, 0x00, 0x01, 1, 2, 3, 4, 0x00, 0x50]
        );

        let domain = build_connect_request("ab.c", 443).unwrap();
        assert_eq!(domain, vec![0x05, 0x01, 0x00, 0x03, 4, b'a', b'b', b'.', b'c', 0x01, 0xbb]);

        let ipv6 = build_connect_request("[::1]", 80).unwrap();
        assert_eq!(ipv6[3], 0x04);
        assert_eq!(ipv6.len(), 4 + 16 + 2);
        assert_eq!(ipv6[19], 1);

        assert!(build_connect_request(&"a".repeat(256), 80).is_err());
    }

    #[tokio::test]
    async fn test_no_auth_handshake() {
        let mut stream = Builder::new()
            .write(&[0x05, 0x01, 0x00])
            .read(&[0x05, 0x00])
            .write(&[0x05, 0x01, 0x00, 0x01, 1, 2, 3, 4, 0x00, 0x50])
            .read(&IPV4_SUCCESS)
            .build();

        let client = Socks5ProxyClient::new(None, Duration::from_secs(5));
        client.handshake(&mut stream, "1.2.3.4", 80).await.unwrap();
    }

    #[tokio::test]
    async fn test_user_pass_handshake_with_domain_reply() {
        let mut stream = Builder::new()
            .write(&[0x05, 0x01, 0x02])
            .read(&[0x05, 0x02])
            .write(&[0x01, 0x04, b'u', b's', b'e', b'r', 0x04, b'p', b'a', b's', b's'])
            .read(&[0x01, 0x00])
            .write(&[0x05, 0x01, 0x00, 0x03, 0x04, b'a', b'b', b'.', b'c', 0x00, 0x50])
            .read(&[0x05, 0x00, 0x00, 0x03, 0x02, b'h', b'i', 0x00, 0x50])
            .build();

        let credentials = Credentials {
            username: "user".into(),
            password: "pass".into(),
        };
        let client = Socks5ProxyClient::new(Some(credentials), Duration::from_secs(5));
        client.handshake(&mut stream, "ab.c", 80).await.unwrap();
    }

    #[tokio::test]
    async fn test_auth_rejected() {
        let mut stream = Builder::new()
            .write(&[0x05, 0x01, 0x02])
            .read(&[0x05, 0x02])
            .write(&[0x01, 0x01, b'u', 0x01, b'p'])
            .read(&[0x01, 0x01])
            .build();

        let credentials = Credentials {
            username: "u".into(),
            password: "p".into(),
        };
        let client = Socks5ProxyClient::new(Some(credentials), Duration::from_secs(5));
        let err = client.handshake(&mut stream, "ab.c", 80).await.unwrap_err();
        assert_eq!(err.to_string(), "SOCKS authentication failed.");
    }

    #[tokio::test]
    async fn test_no_acceptable_method() {
        let mut stream = Builder::new()
            .write(&[0x05, 0x01, 0x00])
            .read(&[0x05, 0xff])
            .build();

        let client = Socks5ProxyClient::new(None, Duration::from_secs(5));
        let err = client.handshake(&mut stream, "1.2.3.4", 80).await.unwrap_err();
        assert!(matches!(err, RunnerError::ProxyProtocol(_)));
    }

    #[tokio::test]
    async fn test_connection_refused() {
        let mut stream = Builder::new()
            .write(&[0x05, 0x01, 0x00])
            .read(&[0x05, 0x00])
            .write(&[0x05, 0x01, 0x00, 0x01, 1, 2, 3, 4, 0x00, 0x50])
            .read(&[0x05, 0x05, 0x00, 0x01])
            .build();

        let client = Socks5ProxyClient::new(None, Duration::from_secs(5));
        let err = client.handshake(&mut stream, "1.2.3.4", 80).await.unwrap_err();
        assert_eq!(err.to_string(), "Connection refused.");
    }

    #[test]
    fn test_reply_messages() {
        assert_eq!(reply_message(0x01), "General SOCKS server failure.");
        assert_eq!(reply_message(0x06), "TTL expired.");
        assert_eq!(reply_message(0x08), "Address type not supported.");
        assert_eq!(reply_message(0x09), "Unknown SOCKS error.");
    }
}
