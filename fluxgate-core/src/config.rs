pub mod validator;

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Worker configuration.
///
/// One snapshot drives one worker run; it is validated atomically before a
/// start attempt and replaced only between stop and the next start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Remote server host (name or literal IP)
    pub server_host: String,
    /// TLS SNI override; the server host is used when empty
    #[serde(default)]
    pub server_sni: String,
    #[serde(default = "default_server_port")]
    pub server_port: u16,
    /// Local listener host
    #[serde(default = "default_local_host")]
    pub local_host: String,
    /// Local listener port; 0 picks an ephemeral port
    #[serde(default = "default_local_port")]
    pub local_port: u16,
    pub username: String,
    pub password: String,
    /// Cipher method name, one of [`crate::cipher::SUPPORTED_CIPHERS`]
    #[serde(default = "default_method")]
    pub method: String,
    /// Resolve names over DoH when set; takes precedence over DoT
    #[serde(default)]
    pub doh_url: String,
    /// Resolve names over DoT when set
    #[serde(default)]
    pub dot_host: String,
    /// Aggregate transmit limit in bytes/sec; 0 disables throttling
    #[serde(default)]
    pub limit_rate: u64,
    /// Connect timeout in seconds; 0 uses the built-in default
    #[serde(default)]
    pub connect_timeout: u32,
    #[serde(default = "default_true")]
    pub tcp_nodelay: bool,
    #[serde(default = "default_true")]
    pub tcp_keep_alive: bool,
    /// Keep-alive probes before the connection is dropped
    #[serde(default = "default_keep_alive_cnt")]
    pub tcp_keep_alive_cnt: u32,
    /// Idle seconds before keep-alive probing starts
    #[serde(default = "default_keep_alive_idle")]
    pub tcp_keep_alive_idle_timeout: u32,
    /// Seconds between keep-alive probes
    #[serde(default = "default_keep_alive_interval")]
    pub tcp_keep_alive_interval: u32,
    /// Congestion-control algorithm applied to tunnel sockets (Linux)
    #[serde(default = "default_congestion")]
    pub congestion_algorithm: String,
    /// Prefer a hybrid post-quantum TLS key-exchange group
    #[serde(default)]
    pub enable_post_quantum_kyber: bool,
    /// Resolve names to IPv6 addresses first
    #[serde(default)]
    pub ipv6_mode: bool,
    /// Maximum concurrent sessions
    #[serde(default = "default_parallel_max")]
    pub parallel_max: u32,
}

fn default_server_port() -> u16 {
    443
}

fn default_local_host() -> String {
    "127.0.0.1".to_string()
}

fn default_local_port() -> u16 {
    1080
}

fn default_method() -> String {
    "aes-256-gcm".to_string()
}

fn default_true() -> bool {
    true
}

fn default_keep_alive_cnt() -> u32 {
    9
}

fn default_keep_alive_idle() -> u32 {
    7200
}

fn default_keep_alive_interval() -> u32 {
    75
}

fn default_congestion() -> String {
    "bbr".to_string()
}

fn default_parallel_max() -> u32 {
    512
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_host: String::new(),
            server_sni: String::new(),
            server_port: default_server_port(),
            local_host: default_local_host(),
            local_port: default_local_port(),
            username: String::new(),
            password: String::new(),
            method: default_method(),
            doh_url: String::new(),
            dot_host: String::new(),
            limit_rate: 0,
            connect_timeout: 0,
            tcp_nodelay: true,
            tcp_keep_alive: true,
            tcp_keep_alive_cnt: default_keep_alive_cnt(),
            tcp_keep_alive_idle_timeout: default_keep_alive_idle(),
            tcp_keep_alive_interval: default_keep_alive_interval(),
            congestion_algorithm: default_congestion(),
            enable_post_quantum_kyber: false,
            ipv6_mode: false,
            parallel_max: default_parallel_max(),
        }
    }
}

impl Config {
    /// Validate every field; returns the first failure.
    pub fn validate(&self) -> Result<()> {
        validator::ConfigValidator::validate(self)
    }

    /// Effective connect timeout; the 0 sentinel maps to the default.
    pub fn connect_timeout(&self) -> Duration {
        if self.connect_timeout == 0 {
            Duration::from_secs(10)
        } else {
            Duration::from_secs(self.connect_timeout as u64)
        }
    }

    /// SNI actually sent on the wire.
    pub fn effective_sni(&self) -> &str {
        if self.server_sni.is_empty() {
            &self.server_host
        } else {
            &self.server_sni
        }
    }

    /// Load a persisted snapshot; missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(contents) => serde_json::from_str(&contents).map_err(|e| {
                crate::error::Error::config(format!("Malformed config file: {}", e))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Persist the snapshot as pretty JSON.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)
            .map_err(|e| crate::error::Error::internal(format!("Config serialize: {}", e)))?;
        std::fs::write(path, contents)?;
        Ok(())
    }
}
