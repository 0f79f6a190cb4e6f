//! Encrypted DNS resolution for the Fluxgate proxy worker.
//!
//! Provides DNS-over-HTTPS (RFC 8484) and DNS-over-TLS (RFC 7858) clients
//! and a [`Resolver`] facade that picks exactly one backend from the worker
//! configuration. When both DoH and DoT are configured, DoH takes
//! precedence; when neither is configured, the system resolver is used.

pub mod doh;
pub mod dot;
pub mod error;
pub mod resolver;
mod wire;

pub use doh::DohClient;
pub use dot::DotClient;
pub use error::{DnsError, Result};
pub use resolver::{Resolver, ResolverBackend};

/// DNS record types the resolver queries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    A,
    AAAA,
}

impl From<RecordType> for hickory_proto::rr::RecordType {
    fn from(rt: RecordType) -> Self {
        match rt {
            RecordType::A => hickory_proto::rr::RecordType::A,
            RecordType::AAAA => hickory_proto::rr::RecordType::AAAA,
        }
    }
}
