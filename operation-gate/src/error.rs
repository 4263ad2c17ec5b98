//! Error types for the operation gate

use crate::gate::DenialReason;
use balance_ledger::TxnError;
use thiserror::Error;

/// Result type for gate operations
pub type Result<T> = std::result::Result<T, Error>;

/// Gate errors
#[derive(Error, Debug)]
pub enum Error {
    /// Ledger error (including `InvalidAmount` and `InsufficientBalance`)
    #[error("Ledger error: {0}")]
    Ledger(#[from] balance_ledger::Error),

    /// Operation refused; the reason carries a stable code
    #[error("Operation denied: {0}")]
    Denied(DenialReason),

    /// The reference already holds an open operation
    #[error("Operation already open: {0}")]
    OperationAlreadyOpen(String),

    /// The reference has no open operation to close
    #[error("Operation not open: {0}")]
    OperationNotOpen(String),

    /// Operator settings could not be read or updated
    #[error("Settings error: {0}")]
    Settings(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Denial reason, if the operation was refused by a gate check
    pub fn denial(&self) -> Option<&DenialReason> {
        match self {
            Error::Denied(reason) => Some(reason),
            _ => None,
        }
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
