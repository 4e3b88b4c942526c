//! Proxy plumbing
//!
//! This module provides:
//! - Wire clients tunneling a connection through HTTP/SOCKS proxies
//! - A shared pool handing proxies out to workers
//! - Sources loading proxies from memory, files or remote lists

pub mod clients;
pub mod pool;
pub mod source;
pub mod transport;

pub use clients::{create_client, tunnel, ProxyClient, ProxyStream};
pub use pool::ProxyPool;
pub use source::{FileProxySource, ProxySource, RemoteProxySource, StaticProxySource};
pub use transport::{connect, http_get, ConnectionSettings, HttpResponse};
