//! Prepaid Balance Ledger
//!
//! Per-user, per-currency prepaid balances backed by an append-only entry log.
//!
//! # Architecture
//!
//! - **Ledger Store**: RocksDB `TransactionDB`, one column family per table
//! - **Row locks**: every read-modify-write of a Balance holds `get_for_update`
//! - **Composable transactions**: callers batch ledger mutations with payment,
//!   webhook and reconciliation writes into one atomic commit
//! - **Hash chain**: every entry commits to its predecessor for audit replay
//!
//! # Invariants
//!
//! - `balance_after = balance_before ± amount` for every entry
//! - `balance_before` equals the Balance amount immediately prior to the write
//! - Balance and Ledger Entry are written in the same commit or not at all
//! - Entries are never modified; corrections are new entries
//! - Amounts never go negative unless the debit is explicitly flagged

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod types;
pub mod storage;
pub mod ledger;
pub mod crypto;
pub mod error;
pub mod hooks;
pub mod config;
pub mod metrics;

// Re-exports
pub use error::{Error, Result, TxnError};
pub use types::{
    Balance, Classification, Currency, DebitOptions, Direction, EntryReference,
    GatewayTransaction, LedgerEntry, LedgerRequest, NewPayment, Payment, PaymentStatus,
    PaymentType, ReconciliationRecord, ReconciliationStatus, UserId, WebhookEvent,
    WebhookStatus,
};
pub use ledger::{AuditReport, BalanceLedger};
pub use storage::{LedgerTxn, Storage};
pub use hooks::{AffiliateHook, NoopAffiliateHook, PostCommit};
pub use config::Config;
pub use metrics::Metrics;
