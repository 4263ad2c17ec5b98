//! Error types for the balance ledger

use rust_decimal::Decimal;
use thiserror::Error;

/// Result type for ledger operations
pub type Result<T> = std::result::Result<T, Error>;

/// Ledger errors
#[derive(Error, Debug)]
pub enum Error {
    /// Non-positive amount (local validation, never retried)
    #[error("Invalid amount: {0}")]
    InvalidAmount(Decimal),

    /// Debit larger than the available balance (business rejection)
    #[error("Insufficient balance: available {available}, requested {requested}")]
    InsufficientBalance {
        /// Balance at the time of the check
        available: Decimal,
        /// Amount the caller tried to debit
        requested: Decimal,
    },

    /// Row lock or commit conflict with a concurrent transaction
    #[error("Concurrency conflict: {0}")]
    ConcurrencyConflict(String),

    /// Transaction exceeded its deadline and was rolled back
    #[error("Transaction timed out: {0}")]
    Timeout(String),

    /// Payment with the same external reference already exists
    #[error("Duplicate payment: {0}")]
    DuplicatePayment(String),

    /// Payment not found
    #[error("Payment not found: {0}")]
    PaymentNotFound(String),

    /// Payment status change that the lifecycle forbids
    #[error("Invalid payment transition: {0}")]
    InvalidTransition(String),

    /// Invariant violation (broken hash chain, balance mismatch, etc.)
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// Storage error (RocksDB)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether the ledger retries the whole transaction on this error
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::ConcurrencyConflict(_))
    }
}

/// Error type a [`crate::BalanceLedger::transact`] closure may return
///
/// Lets callers use their own error enum while the ledger still recognizes
/// (and retries) the storage conflicts wrapped inside it.
pub trait TxnError: From<Error> + Send {
    /// The wrapped ledger error, if this is one
    fn ledger_error(&self) -> Option<&Error>;
}

impl TxnError for Error {
    fn ledger_error(&self) -> Option<&Error> {
        Some(self)
    }
}

impl From<rocksdb::Error> for Error {
    fn from(err: rocksdb::Error) -> Self {
        use rocksdb::ErrorKind;

        match err.kind() {
            ErrorKind::Busy | ErrorKind::TimedOut | ErrorKind::TryAgain => {
                Error::ConcurrencyConflict(err.to_string())
            }
            ErrorKind::Expired => Error::Timeout(err.to_string()),
            _ => Error::Storage(err.to_string()),
        }
    }
}

impl From<String> for Error {
    fn from(msg: String) -> Self {
        Error::Other(msg)
    }
}

impl From<&str> for Error {
    fn from(msg: &str) -> Self {
        Error::Other(msg.to_string())
    }
}
