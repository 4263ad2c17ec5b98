//! Webhook Event Processor
//!
//! Turns at-least-once gateway deliveries into at-most-once ledger effects.
//!
//! # Architecture
//!
//! - **Event log**: every delivery is recorded by `(provider, external_event_id)`
//! - **Dispatch table**: event type string → handler with a uniform signature;
//!   anything unregistered is recorded as `ignored` ("unhandled event type")
//! - **One commit per event**: handler effects (ledger entry, Payment status)
//!   and the event's terminal status are written in the same transaction
//! - **Post-commit hooks**: affiliate commission runs after commit; its
//!   failure never touches the ledger
//!
//! Failed events and events stuck in `processing` are surfaced for operators
//! and never retried automatically.

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod config;
pub mod delivery;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod processor;

// Re-exports
pub use config::WebhookConfig;
pub use delivery::{GatewayObject, WebhookDelivery};
pub use error::{Error, Result};
pub use handlers::{DispatchTable, Handler, HandlerContext, HandlerOutcome, UNHANDLED_NOTE};
pub use metrics::WebhookMetrics;
pub use processor::{ProcessOutcome, WebhookProcessor};
