//! Inbound webhook deliveries and the gateway objects they carry

use crate::{Error, Result};
use balance_ledger::Currency;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;

/// One at-least-once delivery from a payment gateway
#[derive(Debug, Clone)]
pub struct WebhookDelivery {
    /// Gateway name
    pub provider: String,

    /// Event type string ("payment_intent.succeeded", ...)
    pub event_type: String,

    /// Idempotency key
    pub external_event_id: String,

    /// Raw JSON payload
    pub payload: String,
}

impl WebhookDelivery {
    /// Build a delivery from already-extracted parts
    pub fn new(
        provider: impl Into<String>,
        event_type: impl Into<String>,
        external_event_id: impl Into<String>,
        payload: impl Into<String>,
    ) -> Self {
        Self {
            provider: provider.into(),
            event_type: event_type.into(),
            external_event_id: external_event_id.into(),
            payload: payload.into(),
        }
    }

    /// Parse a Stripe-style event body (`{"id", "type", "data": {"object": ...}}`)
    pub fn from_event_body(provider: impl Into<String>, body: &str) -> Result<Self> {
        #[derive(Deserialize)]
        struct Envelope {
            id: String,
            #[serde(rename = "type")]
            event_type: String,
        }

        let envelope: Envelope = serde_json::from_str(body)?;
        Ok(Self::new(provider, envelope.event_type, envelope.id, body))
    }
}

/// The object an event is about (payment intent, checkout session, invoice, charge)
///
/// Amounts are in minor units, exactly as the gateway reports them.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GatewayObject {
    /// Gateway object ID
    pub id: String,

    /// Payment intent / charge amount
    #[serde(default)]
    pub amount: Option<i64>,

    /// Checkout session total
    #[serde(default)]
    pub amount_total: Option<i64>,

    /// Invoice amount paid
    #[serde(default)]
    pub amount_paid: Option<i64>,

    /// Invoice amount due
    #[serde(default)]
    pub amount_due: Option<i64>,

    /// Charge amount refunded (cumulative)
    #[serde(default)]
    pub amount_refunded: Option<i64>,

    /// Currency code
    #[serde(default)]
    pub currency: Option<String>,

    /// Gateway status string
    #[serde(default)]
    pub status: Option<String>,

    /// Linked payment intent (checkout sessions, charges)
    #[serde(default)]
    pub payment_intent: Option<String>,

    /// Creation time (unix seconds)
    #[serde(default)]
    pub created: Option<i64>,

    /// Caller-supplied metadata (`user_id`, `payment_type`, ...)
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl GatewayObject {
    /// Extract the object from a payload, accepting both the full event
    /// envelope (`data.object`) and a bare object
    pub fn from_payload(payload: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(payload)?;
        let object = match value.pointer("/data/object") {
            Some(object) => object.clone(),
            None => value,
        };
        Ok(serde_json::from_value(object)?)
    }

    /// Parsed currency
    pub fn currency(&self) -> Result<Currency> {
        let code = self
            .currency
            .as_deref()
            .ok_or_else(|| Error::MalformedPayload(format!("{}: missing currency", self.id)))?;
        Currency::parse(code)
            .ok_or_else(|| Error::MalformedPayload(format!("{}: unknown currency {}", self.id, code)))
    }

    /// Charged amount, whichever field this object type uses
    pub fn charged_amount(&self) -> Result<Decimal> {
        let minor = self
            .amount_paid
            .or(self.amount_total)
            .or(self.amount)
            .or(self.amount_due)
            .ok_or_else(|| Error::MalformedPayload(format!("{}: missing amount", self.id)))?;
        Ok(self.currency()?.minor_units_to_decimal(minor))
    }

    /// Refunded amount (charges)
    pub fn refunded_amount(&self) -> Result<Decimal> {
        let minor = self
            .amount_refunded
            .ok_or_else(|| Error::MalformedPayload(format!("{}: missing amount_refunded", self.id)))?;
        Ok(self.currency()?.minor_units_to_decimal(minor))
    }

    /// Gateway creation time
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.created.and_then(|secs| DateTime::from_timestamp(secs, 0))
    }

    /// Metadata value
    pub fn meta(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }
}
