//! Unified error handling for ExtIoT.
//!
//! Every per-message failure in the protocol maps onto one of these variants so
//! that the router and scheduler loops can log it with context and move on.

/// Unified error type for ExtIoT.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The bytes are not a valid envelope encoding.
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    /// A message arrived that must never travel in this direction.
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// The identity generator observed its clock moving backward.
    #[error("Clock moved backwards by {behind_ms}ms, refusing to issue identity")]
    ClockRegression { behind_ms: u64 },

    /// The device store could not complete a round-trip.
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// The device key has never been registered.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The product catalog rejected a registration.
    #[error("Unknown product: {product_id} ({product_type})")]
    UnknownProduct {
        product_id: String,
        product_type: String,
    },

    /// A reporting interval that the scheduler cannot run.
    #[error("Invalid interval: {0}")]
    InvalidInterval(String),

    /// Publish/subscribe transport errors.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Configuration-related errors.
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO errors.
    #[error("IO error: {0}")]
    Io(String),
}

impl Error {
    /// Short, stable name used as a structured log field.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::MalformedPayload(_) => "malformed_payload",
            Error::ProtocolViolation(_) => "protocol_violation",
            Error::ClockRegression { .. } => "clock_regression",
            Error::StoreUnavailable(_) => "store_unavailable",
            Error::NotFound(_) => "not_found",
            Error::UnknownProduct { .. } => "unknown_product",
            Error::InvalidInterval(_) => "invalid_interval",
            Error::Transport(_) => "transport",
            Error::Config(_) => "config",
            Error::Io(_) => "io",
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::MalformedPayload(e.to_string())
    }
}

/// Result type alias using ExtIoT's Error.
pub type Result<T> = std::result::Result<T, Error>;
