//! Resolver facade over the encrypted DNS backends.
//!
//! Exactly one backend is active per configuration. Precedence is a
//! documented policy, not an accident: a configured DoH URL wins over a
//! configured DoT host, and the system resolver is used only when neither
//! is set.

use crate::doh::DohClient;
use crate::dot::{DotClient, DOT_PORT};
use crate::error::{DnsError, Result};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tracing::debug;

/// The active resolution backend
pub enum ResolverBackend {
    DoH(DohClient),
    DoT(DotClient),
    System,
}

impl ResolverBackend {
    fn name(&self) -> &'static str {
        match self {
            Self::DoH(_) => "doh",
            Self::DoT(_) => "dot",
            Self::System => "system",
        }
    }
}

/// Hostname resolver with a single upstream backend
pub struct Resolver {
    backend: ResolverBackend,
    prefer_ipv6: bool,
}

impl Resolver {
    /// Pick the backend from the worker configuration. DoH takes precedence
    /// over DoT when both are set.
    pub fn from_config(
        doh_url: &str,
        dot_host: &str,
        timeout: Duration,
        prefer_ipv6: bool,
    ) -> Result<Self> {
        let backend = if !doh_url.is_empty() {
            ResolverBackend::DoH(DohClient::new(doh_url, timeout)?)
        } else if !dot_host.is_empty() {
            ResolverBackend::DoT(DotClient::new(dot_host, DOT_PORT, None, timeout)?)
        } else {
            ResolverBackend::System
        };

        debug!("resolver backend: {}", backend.name());
        Ok(Self {
            backend,
            prefer_ipv6,
        })
    }

    /// Resolve `host` to addresses, sorted by address-family preference.
    /// Literal IP addresses short-circuit without a query.
    pub async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(vec![ip]);
        }

        let mut ips = match &self.backend {
            ResolverBackend::DoH(client) => client.resolve(host).await?,
            ResolverBackend::DoT(client) => client.resolve(host).await?,
            ResolverBackend::System => {
                // port is irrelevant; lookup_host requires one
                tokio::net::lookup_host((host, 0))
                    .await
                    .map_err(|e| {
                        DnsError::QueryFailed(format!("System resolver failed for {}: {}", host, e))
                    })?
                    .map(|addr| addr.ip())
                    .collect()
            }
        };

        if ips.is_empty() {
            return Err(DnsError::QueryFailed(format!(
                "No addresses found for {}",
                host
            )));
        }

        let v4_first = !self.prefer_ipv6;
        ips.sort_by_key(|ip| match ip {
            IpAddr::V4(_) => !v4_first as u8,
            IpAddr::V6(_) => v4_first as u8,
        });

        debug!("resolved {} to {:?} via {}", host, ips, self.backend.name());
        Ok(ips)
    }

    /// Resolve `host` and pair the preferred address with `port`.
    pub async fn resolve_addr(&self, host: &str, port: u16) -> Result<SocketAddr> {
        let ips = self.resolve(host).await?;
        Ok(SocketAddr::new(ips[0], port))
    }

    /// Which backend is active
    pub fn backend(&self) -> &ResolverBackend {
        &self.backend
    }
}
