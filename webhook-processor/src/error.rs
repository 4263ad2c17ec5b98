//! Error types for webhook processing

use balance_ledger::TxnError;
use thiserror::Error;

/// Result type for webhook operations
pub type Result<T> = std::result::Result<T, Error>;

/// Webhook processing errors
#[derive(Error, Debug)]
pub enum Error {
    /// Ledger error (storage, conflicts, payment lifecycle)
    #[error("Ledger error: {0}")]
    Ledger(#[from] balance_ledger::Error),

    /// Payload is not the shape the handler expects
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    /// Payload exceeds the configured limit
    #[error("Payload too large: {size} bytes (max {max})")]
    PayloadTooLarge {
        /// Delivered size
        size: usize,
        /// Configured limit
        max: usize,
    },

    /// Event references a payment that does not exist and cannot be created
    #[error("Unknown payment: {0}")]
    UnknownPayment(String),

    /// Event not found in the log
    #[error("Webhook event not found: {0}")]
    EventNotFound(String),

    /// Replay requested for an event that is not `failed`
    #[error("Event {event_id} is {status}, only failed events can be replayed")]
    NotReplayable {
        /// Event ID
        event_id: String,
        /// Current status
        status: String,
    },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TxnError for Error {
    fn ledger_error(&self) -> Option<&balance_ledger::Error> {
        match self {
            Error::Ledger(e) => Some(e),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::MalformedPayload(err.to_string())
    }
}
