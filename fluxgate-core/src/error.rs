use thiserror::Error;

/// Fluxgate worker error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Resolve error: {message}")]
    Resolve {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Connect error: {message}")]
    Connect {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Handshake error: {message}")]
    Handshake {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Authentication failure: {message}")]
    Auth { message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Timeout: {message}")]
    Timeout {
        message: String,
        operation: Option<String>,
    },

    #[error("Drain timeout: {active} sessions force-closed")]
    DrainTimeout { active: usize },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a new configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a new resolve error
    pub fn resolve<S: Into<String>>(message: S) -> Self {
        Self::Resolve {
            message: message.into(),
            source: None,
        }
    }

    /// Create a new connect error
    pub fn connect<S: Into<String>>(message: S) -> Self {
        Self::Connect {
            message: message.into(),
            source: None,
        }
    }

    /// Create a new connect error with source
    pub fn connect_with_source<S: Into<String>, E: std::error::Error + Send + Sync + 'static>(
        message: S,
        source: E,
    ) -> Self {
        Self::Connect {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a new handshake error
    pub fn handshake<S: Into<String>>(message: S) -> Self {
        Self::Handshake {
            message: message.into(),
            source: None,
        }
    }

    /// Create a new authentication failure
    pub fn auth<S: Into<String>>(message: S) -> Self {
        Self::Auth {
            message: message.into(),
        }
    }

    /// Create a new timeout error
    pub fn timeout<S: Into<String>>(message: S) -> Self {
        Self::Timeout {
            message: message.into(),
            operation: None,
        }
    }

    /// Create a new timeout error naming the operation
    pub fn timeout_in<S: Into<String>, O: Into<String>>(message: S, operation: O) -> Self {
        Self::Timeout {
            message: message.into(),
            operation: Some(operation.into()),
        }
    }

    /// Create a new internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Get error code/category for external use
    pub fn code(&self) -> &'static str {
        match self {
            Self::Config { .. } => "CONFIG",
            Self::Resolve { .. } => "RESOLVE",
            Self::Connect { .. } => "CONNECT",
            Self::Handshake { .. } => "HANDSHAKE",
            Self::Auth { .. } => "AUTH",
            Self::Io(_) => "IO",
            Self::Timeout { .. } => "TIMEOUT",
            Self::DrainTimeout { .. } => "DRAIN_TIMEOUT",
            Self::Internal { .. } => "INTERNAL",
        }
    }

    /// Check if this error may be retried with backoff.
    ///
    /// Authentication failures indicate wrong credentials or tampering and
    /// must never be retried; configuration errors cannot heal on their own.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Connect { .. } | Self::Io(_) | Self::Timeout { .. } | Self::Resolve { .. } => {
                true
            }
            Self::Config { .. }
            | Self::Auth { .. }
            | Self::Handshake { .. }
            | Self::DrainTimeout { .. }
            | Self::Internal { .. } => false,
        }
    }
}

impl From<fluxgate_dns::DnsError> for Error {
    fn from(e: fluxgate_dns::DnsError) -> Self {
        Self::Resolve {
            message: e.to_string(),
            source: Some(Box::new(e)),
        }
    }
}
