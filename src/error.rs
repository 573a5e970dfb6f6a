use serde::Serialize;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, EscrowError>;

#[derive(Error, Debug)]
pub enum EscrowError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("No free room available")]
    NoCapacity,

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Invariant violated: {0}")]
    Invariant(String),
}

/// Coarse classification used by transports to pick a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    Forbidden,
    Conflict,
    NoCapacity,
    InvalidInput,
    Unauthorized,
    Internal,
}

impl EscrowError {
    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn forbidden<S: Into<String>>(msg: S) -> Self {
        Self::Forbidden(msg.into())
    }

    pub fn conflict<S: Into<String>>(msg: S) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn invalid_input<S: Into<String>>(msg: S) -> Self {
        Self::InvalidInput(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Forbidden(_) => ErrorKind::Forbidden,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::NoCapacity => ErrorKind::NoCapacity,
            Self::InvalidInput(_) => ErrorKind::InvalidInput,
            Self::Auth(_) => ErrorKind::Unauthorized,
            Self::Config(_)
            | Self::Database(_)
            | Self::Network(_)
            | Self::Serialization(_)
            | Self::Io(_)
            | Self::Invariant(_) => ErrorKind::Internal,
        }
    }

    /// Guard failures raised by the domain itself, as opposed to infrastructure trouble.
    pub fn is_domain(&self) -> bool {
        !matches!(self.kind(), ErrorKind::Internal | ErrorKind::Unauthorized)
    }
}

impl From<serde_json::Error> for EscrowError {
    fn from(err: serde_json::Error) -> Self {
        EscrowError::Serialization(err.to_string())
    }
}

impl From<jsonwebtoken::errors::Error> for EscrowError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        EscrowError::Auth(err.to_string())
    }
}

impl From<rust_decimal::Error> for EscrowError {
    fn from(err: rust_decimal::Error) -> Self {
        EscrowError::InvalidInput(err.to_string())
    }
}

impl From<std::io::Error> for EscrowError {
    fn from(err: std::io::Error) -> Self {
        EscrowError::Io(err.to_string())
    }
}
