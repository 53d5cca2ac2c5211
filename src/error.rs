use thiserror::Error;

/// Classifies outbound connection errors for programmatic matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboundErrorKind {
    /// Connection to the remote host failed
    ConnectionFailed,
    /// DNS resolution failed
    DnsFailed,
    /// Rejected by a block outbound
    Rejected,
    /// No outbound registered for the requested mode/tag
    NotFound,
    /// I/O error during data transfer
    Io,
    /// Input validation failed (bad host, unparsable address, etc.)
    InvalidInput,
}

/// Route engine error types
#[derive(Error, Debug)]
pub enum RouteError {
    #[error("Parse error at line {line}: {message}")]
    ParseErrorAtLine { line: usize, message: String },

    #[error("Invalid rule: {0}")]
    InvalidRule(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Invalid CIDR: {0}")]
    InvalidCidr(String),

    #[error("Resolve error: {0}")]
    ResolveError(String),

    #[error("Outbound error: {message}")]
    OutboundError {
        kind: OutboundErrorKind,
        message: String,
    },

    #[error("Config error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Regex error: {0}")]
    RegexError(#[from] regex::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[cfg(feature = "async")]
    #[error("Task error: {0}")]
    JoinError(#[from] tokio::task::JoinError),
}

impl RouteError {
    pub(crate) fn outbound(kind: OutboundErrorKind, message: impl Into<String>) -> Self {
        RouteError::OutboundError {
            kind,
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, RouteError>;
