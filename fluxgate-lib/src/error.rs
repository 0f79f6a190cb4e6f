use std::fmt;

/// Binding-surface error type, a flat mirror of the core taxonomy.
#[derive(Debug, Clone)]
pub enum FfiError {
    NotInitialized,
    Config(String),
    Resolve(String),
    Connect(String),
    Handshake(String),
    Auth(String),
    Io(String),
    Timeout(String),
    DrainTimeout(String),
    Internal(String),
}

impl fmt::Display for FfiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FfiError::NotInitialized => write!(f, "Fluxgate is not initialized"),
            FfiError::Config(msg) => write!(f, "Configuration error: {}", msg),
            FfiError::Resolve(msg) => write!(f, "Resolve error: {}", msg),
            FfiError::Connect(msg) => write!(f, "Connect error: {}", msg),
            FfiError::Handshake(msg) => write!(f, "Handshake error: {}", msg),
            FfiError::Auth(msg) => write!(f, "Authentication failure: {}", msg),
            FfiError::Io(msg) => write!(f, "IO error: {}", msg),
            FfiError::Timeout(msg) => write!(f, "Timeout: {}", msg),
            FfiError::DrainTimeout(msg) => write!(f, "Drain timeout: {}", msg),
            FfiError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for FfiError {}

impl From<fluxgate_core::Error> for FfiError {
    fn from(err: fluxgate_core::Error) -> Self {
        use fluxgate_core::Error;
        match &err {
            Error::Config { message } => FfiError::Config(message.clone()),
            Error::Resolve { message, .. } => FfiError::Resolve(message.clone()),
            Error::Connect { message, .. } => FfiError::Connect(message.clone()),
            Error::Handshake { message, .. } => FfiError::Handshake(message.clone()),
            Error::Auth { message } => FfiError::Auth(message.clone()),
            Error::Io(e) => FfiError::Io(e.to_string()),
            Error::Timeout { message, .. } => FfiError::Timeout(message.clone()),
            Error::DrainTimeout { .. } => FfiError::DrainTimeout(err.to_string()),
            Error::Internal { message } => FfiError::Internal(message.clone()),
        }
    }
}

/// Binding-surface result type
pub type Result<T> = std::result::Result<T, FfiError>;
