//! Secure transport to the remote proxy server.
//!
//! One TLS connection per session, with socket tuning (keepalive, nodelay,
//! congestion control) applied before the handshake. Key-exchange policy:
//! when post-quantum key agreement is enabled the hybrid group leads the
//! preference list and classical groups remain available; a server that
//! picks a classical group is a negotiation outcome, not an error.

use crate::config::Config;
use crate::error::{Error, Result};
use async_trait::async_trait;
use rustls::pki_types::ServerName;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

/// Byte stream trait object used across the relay.
pub trait AsyncReadWrite: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncReadWrite for T {}

/// Connection factory for tunnel sessions.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, addr: SocketAddr) -> Result<Box<dyn AsyncReadWrite>>;
}

/// Socket options applied to every tunnel connection.
#[derive(Debug, Clone)]
struct SocketOptions {
    nodelay: bool,
    keep_alive: bool,
    keep_alive_cnt: u32,
    keep_alive_idle: Duration,
    keep_alive_interval: Duration,
    congestion_algorithm: String,
}

impl SocketOptions {
    fn from_config(config: &Config) -> Self {
        Self {
            nodelay: config.tcp_nodelay,
            keep_alive: config.tcp_keep_alive,
            keep_alive_cnt: config.tcp_keep_alive_cnt,
            keep_alive_idle: Duration::from_secs(config.tcp_keep_alive_idle_timeout as u64),
            keep_alive_interval: Duration::from_secs(config.tcp_keep_alive_interval as u64),
            congestion_algorithm: config.congestion_algorithm.clone(),
        }
    }

    fn apply(&self, stream: &TcpStream) {
        let sock_ref = socket2::SockRef::from(stream);

        if self.keep_alive {
            #[allow(unused_mut)]
            let mut keepalive = socket2::TcpKeepalive::new()
                .with_time(self.keep_alive_idle)
                .with_interval(self.keep_alive_interval);
            #[cfg(any(target_os = "linux", target_os = "android", target_os = "macos"))]
            {
                keepalive = keepalive.with_retries(self.keep_alive_cnt);
            }
            if let Err(e) = sock_ref.set_tcp_keepalive(&keepalive) {
                warn!("failed to set TCP keepalive: {}", e);
            }
        }

        #[cfg(any(target_os = "linux", target_os = "freebsd"))]
        if !self.congestion_algorithm.is_empty() {
            if let Err(e) = sock_ref.set_tcp_congestion(self.congestion_algorithm.as_bytes()) {
                // the named algorithm may not be loaded on this kernel
                debug!(
                    "congestion algorithm '{}' not applied: {}",
                    self.congestion_algorithm, e
                );
            }
        }
    }
}

/// Production transport: TCP with tuned socket options, then TLS.
pub struct TlsTransport {
    connector: TlsConnector,
    server_name: ServerName<'static>,
    options: SocketOptions,
    timeout: Duration,
}

impl TlsTransport {
    pub fn from_config(config: &Config) -> Result<Self> {
        let tls_config = build_tls_client_config(config.enable_post_quantum_kyber)?;
        let server_name = ServerName::try_from(config.effective_sni().to_string())
            .map_err(|e| Error::config(format!("Invalid SNI '{}': {}", config.effective_sni(), e)))?;

        Ok(Self {
            connector: TlsConnector::from(Arc::new(tls_config)),
            server_name,
            options: SocketOptions::from_config(config),
            timeout: config.connect_timeout(),
        })
    }

    async fn connect_tcp(&self, addr: SocketAddr) -> Result<TcpStream> {
        let stream = tokio::time::timeout(self.timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::timeout_in(format!("Connect to {} timed out", addr), "connect"))?
            .map_err(|e| Error::connect_with_source(format!("Failed to connect to {}", addr), e))?;

        // socket tuning happens before any byte crosses the tunnel
        self.options.apply(&stream);
        stream
            .set_nodelay(self.options.nodelay)
            .map_err(|e| Error::connect_with_source("Failed to set TCP_NODELAY", e))?;

        Ok(stream)
    }
}

#[async_trait]
impl Transport for TlsTransport {
    async fn connect(&self, addr: SocketAddr) -> Result<Box<dyn AsyncReadWrite>> {
        let tcp_stream = self.connect_tcp(addr).await?;

        let tls_stream = tokio::time::timeout(
            self.timeout,
            self.connector.connect(self.server_name.clone(), tcp_stream),
        )
        .await
        .map_err(|_| Error::timeout_in("TLS handshake timed out", "handshake"))?
        .map_err(|e| Error::handshake(format!("TLS handshake failed: {}", e)))?;

        debug!("tunnel connected to {}", addr);
        Ok(Box::new(tls_stream))
    }
}

/// Build the rustls client config with the configured key-exchange policy.
fn build_tls_client_config(enable_post_quantum: bool) -> Result<rustls::ClientConfig> {
    let mut root_store = rustls::RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let mut provider = rustls::crypto::aws_lc_rs::default_provider();
    provider.kx_groups = if enable_post_quantum {
        vec![
            rustls::crypto::aws_lc_rs::kx_group::X25519MLKEM768,
            rustls::crypto::aws_lc_rs::kx_group::X25519,
            rustls::crypto::aws_lc_rs::kx_group::SECP256R1,
            rustls::crypto::aws_lc_rs::kx_group::SECP384R1,
        ]
    } else {
        vec![
            rustls::crypto::aws_lc_rs::kx_group::X25519,
            rustls::crypto::aws_lc_rs::kx_group::SECP256R1,
            rustls::crypto::aws_lc_rs::kx_group::SECP384R1,
        ]
    };

    let config = rustls::ClientConfig::builder_with_provider(Arc::new(provider))
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::handshake(format!("TLS provider setup failed: {}", e)))?
        .with_root_certificates(root_store)
        .with_no_client_auth();

    Ok(config)
}

/// Plain TCP reachability probe with timeout; used for the first connect
/// attempt at worker start.
pub async fn probe_tcp(addr: SocketAddr, timeout: Duration) -> Result<()> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| Error::timeout_in(format!("Connect to {} timed out", addr), "probe"))?
        .map_err(|e| Error::connect_with_source(format!("Failed to connect to {}", addr), e))?;
    drop(stream);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        Config {
            server_host: "proxy.example.com".to_string(),
            username: "user".to_string(),
            password: "secret".to_string(),
            connect_timeout: 2,
            ..Config::default()
        }
    }

    #[test]
    fn test_transport_from_config() {
        assert!(TlsTransport::from_config(&test_config()).is_ok());
    }

    #[test]
    fn test_transport_with_post_quantum() {
        let config = Config {
            enable_post_quantum_kyber: true,
            ..test_config()
        };
        assert!(TlsTransport::from_config(&config).is_ok());
    }

    #[test]
    fn test_sni_override() {
        let config = Config {
            server_sni: "cdn.example.net".to_string(),
            ..test_config()
        };
        let transport = TlsTransport::from_config(&config).unwrap();
        match &transport.server_name {
            ServerName::DnsName(name) => assert_eq!(name.as_ref(), "cdn.example.net"),
            other => panic!("unexpected server name: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_probe_reachable() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        probe_tcp(addr, Duration::from_secs(2)).await.unwrap();
    }

    #[tokio::test]
    async fn test_probe_refused_is_connect_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = probe_tcp(addr, Duration::from_secs(2)).await.unwrap_err();
        assert_eq!(err.code(), "CONNECT");
        assert!(err.is_recoverable());
    }
}
