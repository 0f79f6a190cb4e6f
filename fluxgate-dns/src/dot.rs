//! DNS over TLS (DoT) client
//!
//! RFC 7858 compliant: 2-byte length-prefixed DNS messages over a TLS
//! connection to port 853.

use crate::error::{DnsError, Result};
use crate::wire;
use crate::RecordType;
use bytes::{BufMut, BytesMut};
use rustls::pki_types::ServerName;
use std::net::IpAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::trace;

/// Default DoT port per RFC 7858
pub const DOT_PORT: u16 = 853;

/// DoT client bound to one upstream server
pub struct DotClient {
    server: String,
    port: u16,
    tls_name: String,
    tls_connector: TlsConnector,
    timeout: Duration,
}

impl DotClient {
    /// Create a new DoT client. `tls_name` defaults to the server host when
    /// not given.
    pub fn new(server: &str, port: u16, tls_name: Option<&str>, timeout: Duration) -> Result<Self> {
        if server.is_empty() {
            return Err(DnsError::Config("DoT server cannot be empty".to_string()));
        }

        Ok(Self {
            server: server.to_string(),
            port,
            tls_name: tls_name.unwrap_or(server).to_string(),
            tls_connector: wire::tls_connector(),
            timeout,
        })
    }

    /// Resolve a domain name to IP addresses (A then AAAA).
    pub async fn resolve(&self, domain: &str) -> Result<Vec<IpAddr>> {
        let mut ips = self.query(domain, RecordType::A).await.unwrap_or_default();

        if let Ok(ipv6) = self.query(domain, RecordType::AAAA).await {
            ips.extend(ipv6);
        }

        if ips.is_empty() {
            return Err(DnsError::QueryFailed(format!(
                "No addresses found for {}",
                domain
            )));
        }

        Ok(ips)
    }

    /// Query one record type.
    pub async fn query(&self, domain: &str, record_type: RecordType) -> Result<Vec<IpAddr>> {
        let query_bytes = wire::build_query(domain, record_type)?;
        let response_bytes = self.exchange(&query_bytes).await?;
        wire::parse_answers(&response_bytes)
    }

    async fn exchange(&self, query: &[u8]) -> Result<Vec<u8>> {
        let addr = format!("{}:{}", self.server, self.port);

        let tcp_stream = tokio::time::timeout(self.timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| DnsError::Timeout)?
            .map_err(DnsError::Io)?;

        let server_name = ServerName::try_from(self.tls_name.clone())
            .map_err(|e| DnsError::Tls(format!("Invalid server name: {}", e)))?;

        let mut tls_stream = tokio::time::timeout(
            self.timeout,
            self.tls_connector.connect(server_name, tcp_stream),
        )
        .await
        .map_err(|_| DnsError::Timeout)?
        .map_err(|e| DnsError::Tls(format!("TLS handshake failed: {}", e)))?;

        // 2-byte length prefix (RFC 7858)
        let mut request = BytesMut::with_capacity(2 + query.len());
        request.put_u16(query.len() as u16);
        request.put_slice(query);

        tls_stream.write_all(&request).await.map_err(DnsError::Io)?;

        let mut len_buf = [0u8; 2];
        tokio::time::timeout(self.timeout, tls_stream.read_exact(&mut len_buf))
            .await
            .map_err(|_| DnsError::Timeout)?
            .map_err(DnsError::Io)?;

        let response_len = u16::from_be_bytes(len_buf) as usize;

        let mut response = vec![0u8; response_len];
        tokio::time::timeout(self.timeout, tls_stream.read_exact(&mut response))
            .await
            .map_err(|_| DnsError::Timeout)?
            .map_err(DnsError::Io)?;

        trace!("DoT received {} bytes response", response.len());
        Ok(response)
    }

    /// Upstream server host
    pub fn server(&self) -> &str {
        &self.server
    }

    /// Upstream server port
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl std::fmt::Debug for DotClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DotClient")
            .field("server", &self.server)
            .field("port", &self.port)
            .field("tls_name", &self.tls_name)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dot_client_creation() {
        let client = DotClient::new("dns.google", DOT_PORT, None, Duration::from_secs(5));
        assert!(client.is_ok());
        assert_eq!(client.unwrap().port(), 853);
    }

    #[test]
    fn test_dot_rejects_empty_server() {
        assert!(DotClient::new("", DOT_PORT, None, Duration::from_secs(5)).is_err());
    }

    #[tokio::test]
    #[ignore] // requires network
    async fn test_dot_resolve() {
        let client =
            DotClient::new("dns.google", DOT_PORT, Some("dns.google"), Duration::from_secs(5))
                .unwrap();
        let result = client.resolve("google.com").await;
        assert!(result.is_ok());
        assert!(!result.unwrap().is_empty());
    }
}
