//! Fluxgate worker core.
//!
//! A client that terminates an encrypted tunnel to a remote proxy server,
//! multiplexes local SOCKS5 connections through it, and resolves names
//! over encrypted DNS. UI shells drive it through `fluxgate-lib`; the CLI
//! through `fluxgate-bin`.

pub mod addr;
pub mod cipher;
pub mod config;
pub mod error;
pub mod limiter;
pub mod logging;
pub mod relay;
pub mod stats;
pub mod transport;
pub mod worker;

pub use addr::TargetAddr;
pub use cipher::{CipherKind, SUPPORTED_CIPHERS};
pub use config::Config;
pub use error::{Error, Result};
pub use stats::{RateSample, TransferStats};
pub use transport::{TlsTransport, Transport};
pub use worker::{Worker, WorkerState};

/// User-Agent string, generated from the crate version.
pub const USER_AGENT: &str = concat!("Fluxgate/v", env!("CARGO_PKG_VERSION"));
