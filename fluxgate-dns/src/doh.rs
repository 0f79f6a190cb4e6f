//! DNS over HTTPS (DoH) client
//!
//! RFC 8484 compliant; queries are POSTed as binary DNS messages over a
//! plain HTTP/1.1 exchange on a fresh TLS connection per query.

use crate::error::{DnsError, Result};
use crate::wire;
use crate::RecordType;
use rustls::pki_types::ServerName;
use std::net::IpAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::trace;
use url::Url;

/// DoH client bound to one upstream URL
pub struct DohClient {
    url: Url,
    tls_connector: TlsConnector,
    timeout: Duration,
}

impl DohClient {
    /// Create a new DoH client for `url`, e.g. `https://dns.google/dns-query`.
    pub fn new(url: &str, timeout: Duration) -> Result<Self> {
        let url =
            Url::parse(url).map_err(|e| DnsError::Config(format!("Invalid DoH URL: {}", e)))?;

        if url.scheme() != "https" {
            return Err(DnsError::Config("DoH URL must use HTTPS".to_string()));
        }
        if url.host_str().is_none() {
            return Err(DnsError::Config("DoH URL has no host".to_string()));
        }

        Ok(Self {
            url,
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

    /// POST the query to the upstream and return the response body.
    async fn exchange(&self, query: &[u8]) -> Result<Vec<u8>> {
        let host = self
            .url
            .host_str()
            .ok_or_else(|| DnsError::Config("No host in URL".to_string()))?;
        let port = self.url.port().unwrap_or(443);
        let path = self.url.path();

        let addr = format!("{}:{}", host, port);
        let tcp_stream = tokio::time::timeout(self.timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| DnsError::Timeout)?
            .map_err(DnsError::Io)?;

        let server_name = ServerName::try_from(host.to_string())
            .map_err(|e| DnsError::Tls(format!("Invalid server name: {}", e)))?;

        let mut tls_stream = tokio::time::timeout(
            self.timeout,
            self.tls_connector.connect(server_name, tcp_stream),
        )
        .await
        .map_err(|_| DnsError::Timeout)?
        .map_err(|e| DnsError::Tls(format!("TLS handshake failed: {}", e)))?;

        let request = format!(
            "POST {} HTTP/1.1\r\n\
             Host: {}\r\n\
             Accept: application/dns-message\r\n\
             Content-Type: application/dns-message\r\n\
             Content-Length: {}\r\n\
             Connection: close\r\n\r\n",
            path,
            host,
            query.len()
        );

        tls_stream.write_all(request.as_bytes()).await?;
        tls_stream.write_all(query).await?;

        let mut response_buf = Vec::new();
        tokio::time::timeout(self.timeout, tls_stream.read_to_end(&mut response_buf))
            .await
            .map_err(|_| DnsError::Timeout)?
            .map_err(DnsError::Io)?;

        // Split headers from body; the body is the binary DNS message.
        let header_end = response_buf
            .windows(4)
            .position(|w| w == b"\r\n\r\n")
            .ok_or_else(|| DnsError::Http("Invalid HTTP response".to_string()))?;

        let head = String::from_utf8_lossy(&response_buf[..header_end]);
        let status_line = head.lines().next().unwrap_or("");
        if !status_line.starts_with("HTTP/1.1 200") && !status_line.starts_with("HTTP/1.0 200") {
            return Err(DnsError::Http(format!(
                "DoH server returned: {}",
                status_line
            )));
        }

        trace!("DoH response: {} bytes", response_buf.len() - header_end - 4);
        Ok(response_buf[header_end + 4..].to_vec())
    }

    /// Upstream URL
    pub fn url(&self) -> &str {
        self.url.as_str()
    }
}

impl std::fmt::Debug for DohClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DohClient")
            .field("url", &self.url.as_str())
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_doh_client_creation() {
        let client = DohClient::new("https://dns.google/dns-query", Duration::from_secs(5));
        assert!(client.is_ok());
    }

    #[test]
    fn test_doh_rejects_plain_http() {
        let client = DohClient::new("http://dns.google/dns-query", Duration::from_secs(5));
        assert!(client.is_err());
    }

    #[tokio::test]
    async fn test_doh_unreachable_fails_within_timeout() {
        // nothing listens on port 1; the query must fail, not hang
        let client = DohClient::new("https://127.0.0.1:1/dns-query", Duration::from_secs(2))
            .unwrap();
        let started = std::time::Instant::now();
        let result = client.resolve("example.com").await;
        assert!(result.is_err());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    #[ignore] // requires network
    async fn test_doh_resolve() {
        let client =
            DohClient::new("https://dns.google/dns-query", Duration::from_secs(5)).unwrap();
        let result = client.resolve("google.com").await;
        assert!(result.is_ok());
        assert!(!result.unwrap().is_empty());
    }
}
