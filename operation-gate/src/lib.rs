//! Operation Gate
//!
//! Decides whether a user may start a balance-consuming operation and, when
//! allowed, spends the amount through the Balance Ledger. The advisory
//! [`OperationGate::can_operate`] never writes; [`OperationGate::execute`]
//! re-runs the same checks against the locked balance in the debit's own
//! transaction.

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod config;
pub mod error;
pub mod gate;
pub mod metrics;
pub mod settings;

// Re-exports
pub use config::GateConfig;
pub use error::{Error, Result};
pub use gate::{
    evaluate, minimum_required, CloseOutcome, DenialReason, OperationAuthorization,
    OperationGate, OperationRequest,
};
pub use metrics::GateMetrics;
pub use settings::{InMemorySettings, OperatorSettingsSource, UserSettings};
