//! DNS error types

use std::io;
use thiserror::Error;

/// DNS operation result type
pub type Result<T> = std::result::Result<T, DnsError>;

/// DNS error types
#[derive(Error, Debug)]
pub enum DnsError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("DNS protocol error: {0}")]
    Protocol(String),

    #[error("DNS query timeout")]
    Timeout,

    #[error("DNS query failed: {0}")]
    QueryFailed(String),

    #[error("DNS name error: {0}")]
    NameError(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("HTTP error: {0}")]
    Http(String),
}

impl From<hickory_proto::error::ProtoError> for DnsError {
    fn from(e: hickory_proto::error::ProtoError) -> Self {
        DnsError::Protocol(e.to_string())
    }
}

impl From<rustls::Error> for DnsError {
    fn from(e: rustls::Error) -> Self {
        DnsError::Tls(e.to_string())
    }
}
