//! Webhook Event Processor
//!
//! Per-event state machine: `received → processing → {processed | ignored | failed}`.
//!
//! 1. First sighting inserts the event row as `received`.
//! 2. The event is claimed by moving it to `processing`. Redeliveries of an
//!    event that is terminal, in flight or failed stop here without effects.
//! 3. The handler, its ledger and Payment writes, and the terminal status
//!    commit in one transaction.
//! 4. If that transaction fails, nothing it wrote survives; a separate
//!    transaction marks the event `failed`. Failed events are only ever
//!    re-run through [`WebhookProcessor::replay`].

use crate::{
    delivery::{GatewayObject, WebhookDelivery},
    handlers::{DispatchTable, HandlerContext, HandlerOutcome},
    metrics::WebhookMetrics,
    Error, Result, WebhookConfig,
};
use balance_ledger::{
    hooks, AffiliateHook, BalanceLedger, NoopAffiliateHook, WebhookEvent, WebhookStatus,
};
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

/// What happened to a delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Handler committed effects
    Processed {
        /// Handler note
        note: String,
    },
    /// Nothing to do for this event
    Ignored {
        /// Handler note
        note: String,
    },
    /// Already terminal; no side effects
    Duplicate {
        /// Terminal status on record
        status: WebhookStatus,
    },
    /// Another worker holds this event in `processing`
    InFlight,
    /// Failed earlier; waiting for manual replay
    PreviouslyFailed {
        /// Error detail on record
        notes: Option<String>,
    },
    /// Handler failed just now; nothing it did was committed
    Failed {
        /// Error detail
        error: String,
    },
}

impl ProcessOutcome {
    /// Stable label (metrics, logs)
    pub fn label(&self) -> &'static str {
        match self {
            ProcessOutcome::Processed { .. } => "processed",
            ProcessOutcome::Ignored { .. } => "ignored",
            ProcessOutcome::Duplicate { .. } => "duplicate",
            ProcessOutcome::InFlight => "in_flight",
            ProcessOutcome::PreviouslyFailed { .. } => "previously_failed",
            ProcessOutcome::Failed { .. } => "failed",
        }
    }

    fn from_handler(outcome: &HandlerOutcome) -> Self {
        match outcome.status {
            WebhookStatus::Ignored => ProcessOutcome::Ignored {
                note: outcome.note.clone(),
            },
            _ => ProcessOutcome::Processed {
                note: outcome.note.clone(),
            },
        }
    }
}

/// Result of trying to move an event into `processing`
enum Claim {
    Claimed { attempts: u32 },
    Lost(WebhookEvent),
}

/// Turns gateway deliveries into ledger mutations exactly once
pub struct WebhookProcessor {
    ledger: Arc<BalanceLedger>,
    dispatch: DispatchTable,
    affiliate: Arc<dyn AffiliateHook>,
    config: WebhookConfig,
    metrics: WebhookMetrics,
}

impl fmt::Debug for WebhookProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebhookProcessor")
            .field("dispatch", &self.dispatch)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl WebhookProcessor {
    /// Create a processor with the standard dispatch table and no affiliate hook
    pub fn new(ledger: Arc<BalanceLedger>, config: WebhookConfig) -> Result<Self> {
        let metrics = WebhookMetrics::new().map_err(|e| Error::Config(e.to_string()))?;

        Ok(Self {
            ledger,
            dispatch: DispatchTable::standard(),
            affiliate: Arc::new(NoopAffiliateHook),
            config,
            metrics,
        })
    }

    /// Set the affiliate-commission collaborator
    pub fn with_affiliate_hook(mut self, affiliate: Arc<dyn AffiliateHook>) -> Self {
        self.affiliate = affiliate;
        self
    }

    /// Replace the dispatch table
    pub fn with_dispatch_table(mut self, dispatch: DispatchTable) -> Self {
        self.dispatch = dispatch;
        self
    }

    /// Metrics collector
    pub fn metrics(&self) -> &WebhookMetrics {
        &self.metrics
    }

    /// Process one delivery
    pub async fn process(&self, delivery: WebhookDelivery) -> Result<ProcessOutcome> {
        let size = delivery.payload.len();
        if size > self.config.max_payload_bytes {
            warn!(
                provider = %delivery.provider,
                event_id = %delivery.external_event_id,
                size,
                "Rejected oversized webhook payload"
            );
            return Err(Error::PayloadTooLarge {
                size,
                max: self.config.max_payload_bytes,
            });
        }

        let provider = delivery.provider.as_str();
        let event_id = delivery.external_event_id.as_str();

        // received
        let existing = self
            .ledger
            .transact(|tx| -> Result<Option<WebhookEvent>> {
                if let Some(event) = tx.webhook_event(provider, event_id)? {
                    return Ok(Some(event));
                }

                let now = Utc::now();
                tx.put_webhook_event(&WebhookEvent {
                    provider: delivery.provider.clone(),
                    external_event_id: delivery.external_event_id.clone(),
                    event_type: delivery.event_type.clone(),
                    payload: delivery.payload.clone(),
                    status: WebhookStatus::Received,
                    processing_notes: None,
                    attempts: 0,
                    received_at: now,
                    updated_at: now,
                    processed_at: None,
                })?;
                Ok(None)
            })
            .await?;

        if let Some(event) = existing {
            if let Some(outcome) = Self::redelivery_outcome(&event) {
                return Ok(self.finish(&event.event_type, provider, event_id, outcome));
            }
        }

        // processing
        match self.claim(provider, event_id, WebhookStatus::Received).await? {
            Claim::Claimed { .. } => {}
            Claim::Lost(event) => {
                let outcome = Self::redelivery_outcome(&event).unwrap_or(ProcessOutcome::InFlight);
                return Ok(self.finish(&event.event_type, provider, event_id, outcome));
            }
        }

        let outcome = self
            .run_handler(provider, event_id, &delivery.event_type, &delivery.payload)
            .await?;
        Ok(self.finish(&delivery.event_type, provider, event_id, outcome))
    }

    /// Manually re-run a `failed` event (operator action)
    pub async fn replay(&self, provider: &str, event_id: &str) -> Result<ProcessOutcome> {
        let event = self
            .ledger
            .webhook_event(provider, event_id)?
            .ok_or_else(|| Error::EventNotFound(format!("{}:{}", provider, event_id)))?;

        match self.claim(provider, event_id, WebhookStatus::Failed).await? {
            Claim::Claimed { attempts } => {
                info!(
                    provider = provider,
                    event_id = event_id,
                    attempts,
                    "Replaying failed webhook event"
                );
            }
            Claim::Lost(current) => {
                return Err(Error::NotReplayable {
                    event_id: event_id.to_string(),
                    status: current.status.to_string(),
                });
            }
        }

        let outcome = self
            .run_handler(provider, event_id, &event.event_type, &event.payload)
            .await?;
        Ok(self.finish(&event.event_type, provider, event_id, outcome))
    }

    /// Events stuck in `processing` longer than the configured timeout.
    ///
    /// These are reported for manual inspection only. The original attempt
    /// may have committed, so they are never retried automatically.
    pub fn stale_processing(&self, now: DateTime<Utc>) -> Result<Vec<WebhookEvent>> {
        let timeout = chrono::Duration::seconds(self.config.processing_timeout_secs as i64);
        let stale: Vec<_> = self
            .ledger
            .webhook_events_with_status(WebhookStatus::Processing)?
            .into_iter()
            .filter(|event| now - event.updated_at > timeout)
            .collect();

        for event in &stale {
            warn!(
                provider = %event.provider,
                event_id = %event.external_event_id,
                event_type = %event.event_type,
                since = %event.updated_at,
                "Webhook event stuck in processing"
            );
        }

        Ok(stale)
    }

    /// Events waiting for manual replay
    pub fn failed_events(&self) -> Result<Vec<WebhookEvent>> {
        Ok(self
            .ledger
            .webhook_events_with_status(WebhookStatus::Failed)?)
    }

    /// Logged event, if any
    pub fn event(&self, provider: &str, event_id: &str) -> Result<Option<WebhookEvent>> {
        Ok(self.ledger.webhook_event(provider, event_id)?)
    }

    /// Outcome for an event that was already logged, `None` if it may be claimed
    fn redelivery_outcome(event: &WebhookEvent) -> Option<ProcessOutcome> {
        match event.status {
            WebhookStatus::Received => None,
            WebhookStatus::Processing => Some(ProcessOutcome::InFlight),
            WebhookStatus::Processed | WebhookStatus::Ignored => Some(ProcessOutcome::Duplicate {
                status: event.status,
            }),
            WebhookStatus::Failed => Some(ProcessOutcome::PreviouslyFailed {
                notes: event.processing_notes.clone(),
            }),
        }
    }

    /// Move the event from `expected` to `processing` under its row lock
    async fn claim(&self, provider: &str, event_id: &str, expected: WebhookStatus) -> Result<Claim> {
        self.ledger
            .transact(|tx| -> Result<Claim> {
                let mut event = tx
                    .webhook_event(provider, event_id)?
                    .ok_or_else(|| Error::EventNotFound(format!("{}:{}", provider, event_id)))?;

                if event.status != expected {
                    return Ok(Claim::Lost(event));
                }

                event.status = WebhookStatus::Processing;
                event.attempts += 1;
                event.updated_at = Utc::now();
                tx.put_webhook_event(&event)?;

                Ok(Claim::Claimed {
                    attempts: event.attempts,
                })
            })
            .await
    }

    /// Run the handler and commit its effects with the terminal status
    async fn run_handler(
        &self,
        provider: &str,
        event_id: &str,
        event_type: &str,
        payload: &str,
    ) -> Result<ProcessOutcome> {
        let object = if self.dispatch.handles(event_type) {
            match GatewayObject::from_payload(payload) {
                Ok(object) => object,
                Err(e) => return self.mark_failed(provider, event_id, e).await,
            }
        } else {
            GatewayObject::default()
        };

        let ctx = HandlerContext {
            provider,
            event_type,
            event_id,
            object: &object,
        };

        let start = Instant::now();
        let result = self
            .ledger
            .transact(|tx| -> Result<HandlerOutcome> {
                // Event row first: event → payment → balance is the lock order
                let mut event = tx
                    .webhook_event(provider, event_id)?
                    .ok_or_else(|| Error::EventNotFound(format!("{}:{}", provider, event_id)))?;
                if event.status != WebhookStatus::Processing {
                    return Err(Error::Ledger(balance_ledger::Error::InvariantViolation(
                        format!("event {} is {} while its handler runs", event_id, event.status),
                    )));
                }

                let outcome = self.dispatch.dispatch(tx, &ctx)?;

                let now = Utc::now();
                event.status = outcome.status;
                event.processing_notes = Some(outcome.note.clone());
                event.updated_at = now;
                event.processed_at = Some(now);
                tx.put_webhook_event(&event)?;

                Ok(outcome)
            })
            .await;
        self.metrics
            .handler_duration
            .observe(start.elapsed().as_secs_f64());

        match result {
            Ok(outcome) => {
                hooks::run_all(&outcome.post_commit, self.affiliate.as_ref()).await;
                Ok(ProcessOutcome::from_handler(&outcome))
            }
            Err(e) => self.mark_failed(provider, event_id, e).await,
        }
    }

    /// Record the failure in its own transaction
    async fn mark_failed(&self, provider: &str, event_id: &str, cause: Error) -> Result<ProcessOutcome> {
        let detail = cause.to_string();

        self.ledger
            .transact(|tx| -> Result<()> {
                if let Some(mut event) = tx.webhook_event(provider, event_id)? {
                    event.status = WebhookStatus::Failed;
                    event.processing_notes = Some(detail.clone());
                    event.updated_at = Utc::now();
                    tx.put_webhook_event(&event)?;
                }
                Ok(())
            })
            .await?;

        Ok(ProcessOutcome::Failed { error: detail })
    }

    fn finish(
        &self,
        event_type: &str,
        provider: &str,
        event_id: &str,
        outcome: ProcessOutcome,
    ) -> ProcessOutcome {
        self.metrics.record_outcome(outcome.label());

        match &outcome {
            ProcessOutcome::Processed { note } | ProcessOutcome::Ignored { note } => info!(
                provider = provider,
                event_id = event_id,
                event_type = event_type,
                outcome = outcome.label(),
                note = %note,
                "Webhook event handled"
            ),
            ProcessOutcome::Failed { error } => error!(
                provider = provider,
                event_id = event_id,
                event_type = event_type,
                error = %error,
                "Webhook handler failed, event left for manual replay"
            ),
            _ => info!(
                provider = provider,
                event_id = event_id,
                event_type = event_type,
                outcome = outcome.label(),
                "Webhook redelivery skipped"
            ),
        }

        outcome
    }
}
