//! Error types for reconciliation

use balance_ledger::TxnError;
use thiserror::Error;

/// Result type for reconciliation operations
pub type Result<T> = std::result::Result<T, Error>;

/// Reconciliation errors
#[derive(Error, Debug)]
pub enum Error {
    /// Ledger error
    #[error("Ledger error: {0}")]
    Ledger(#[from] balance_ledger::Error),

    /// Gateway unreachable after retries (transient)
    #[error("Gateway unavailable: {0}")]
    GatewayUnavailable(String),

    /// Gateway answered with a non-retryable error
    #[error("Gateway error: {0}")]
    Gateway(String),

    /// `from` is not before `to`
    #[error("Invalid window: {0}")]
    InvalidWindow(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether a gateway call may be retried
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::GatewayUnavailable(_))
    }
}

impl TxnError for Error {
    fn ledger_error(&self) -> Option<&balance_ledger::Error> {
        match self {
            Error::Ledger(e) => Some(e),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() {
            Error::GatewayUnavailable(err.to_string())
        } else {
            Error::Gateway(err.to_string())
        }
    }
}
