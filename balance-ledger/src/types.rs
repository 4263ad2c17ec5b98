//! Core types for the ledger
//!
//! All types are designed for:
//! - Deterministic serialization (bincode)
//! - Exact arithmetic (Decimal for money, never float)
//! - Stable string codes for anything that crosses a process boundary

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

/// User identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(pub u64);

impl UserId {
    /// Create new user ID
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Big-endian bytes, used as a key prefix
    pub fn to_key_bytes(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// ISO 4217 currency code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[non_exhaustive]
pub enum Currency {
    /// Brazilian Real
    BRL,
    /// US Dollar
    USD,
    /// Euro
    EUR,
    /// British Pound
    GBP,
    /// Japanese Yen
    JPY,
}

impl Currency {
    /// ISO 4217 code
    pub fn code(&self) -> &'static str {
        match self {
            Currency::BRL => "BRL",
            Currency::USD => "USD",
            Currency::EUR => "EUR",
            Currency::GBP => "GBP",
            Currency::JPY => "JPY",
        }
    }

    /// Parse from string, case-insensitive (gateways send lowercase codes)
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "BRL" => Some(Currency::BRL),
            "USD" => Some(Currency::USD),
            "EUR" => Some(Currency::EUR),
            "GBP" => Some(Currency::GBP),
            "JPY" => Some(Currency::JPY),
            _ => None,
        }
    }

    /// Number of decimal places in the minor unit
    pub fn minor_unit_exponent(&self) -> u32 {
        match self {
            Currency::JPY => 0,
            _ => 2,
        }
    }

    /// One minor unit (0.01 for BRL, 1 for JPY)
    pub fn minor_unit(&self) -> Decimal {
        Decimal::new(1, self.minor_unit_exponent())
    }

    /// Convert a minor-unit integer amount (as gateways report it) to a decimal
    pub fn minor_units_to_decimal(&self, minor: i64) -> Decimal {
        Decimal::new(minor, self.minor_unit_exponent())
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Direction of a ledger entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum Direction {
    /// Increases the balance
    Credit = 1,
    /// Decreases the balance
    Debit = 2,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Credit => write!(f, "credit"),
            Direction::Debit => write!(f, "debit"),
        }
    }
}

/// What a ledger entry is linked to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryReference {
    /// An externally initiated payment
    Payment(Uuid),
    /// A balance-consuming operation (e.g. a trade), identified by the caller
    Operation(String),
}

impl fmt::Display for EntryReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntryReference::Payment(id) => write!(f, "payment:{}", id),
            EntryReference::Operation(id) => write!(f, "operation:{}", id),
        }
    }
}

/// Current balance snapshot for one (user, currency)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Balance {
    /// Owner
    pub user_id: UserId,

    /// Currency
    pub currency: Currency,

    /// Current amount
    pub amount: Decimal,

    /// Time of the last entry, `None` for a fresh row
    pub last_transaction_at: Option<DateTime<Utc>>,

    /// Number of entries written against this balance
    pub entry_count: u64,

    /// Hash of the last entry (zero for a fresh row)
    pub last_entry_hash: [u8; 32],
}

impl Balance {
    /// Zero balance for a user/currency that has never been touched
    pub fn zero(user_id: UserId, currency: Currency) -> Self {
        Self {
            user_id,
            currency,
            amount: Decimal::ZERO,
            last_transaction_at: None,
            entry_count: 0,
            last_entry_hash: [0u8; 32],
        }
    }
}

/// Append-only record of one credit or debit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Unique entry ID (UUIDv7 for time-ordering)
    pub entry_id: Uuid,

    /// Owner
    pub user_id: UserId,

    /// Currency
    pub currency: Currency,

    /// Credit or debit
    pub direction: Direction,

    /// Amount moved (always positive)
    pub amount: Decimal,

    /// Balance immediately before this entry
    pub balance_before: Decimal,

    /// Balance immediately after this entry
    pub balance_after: Decimal,

    /// Optional link to a payment or operation
    pub reference: Option<EntryReference>,

    /// Human-readable description
    pub description: String,

    /// Set when the debit was allowed to take the balance below zero
    pub overdraft: bool,

    /// Position in this balance's entry chain (1-based)
    pub sequence: u64,

    /// Hash of the previous entry in the chain
    pub prev_hash: [u8; 32],

    /// SHA-256 over `prev_hash` and the canonical entry bytes
    pub entry_hash: [u8; 32],

    /// Creation timestamp
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    /// Bytes covered by `entry_hash` (every field except the hash itself)
    pub fn canonical_bytes(&self) -> crate::Result<Vec<u8>> {
        let bytes = bincode::serialize(&(
            &self.entry_id,
            &self.user_id,
            &self.currency,
            &self.direction,
            &self.amount,
            &self.balance_before,
            &self.balance_after,
            &self.reference,
            &self.description,
            self.overdraft,
            self.sequence,
            &self.prev_hash,
            &self.created_at,
        ))?;
        Ok(bytes)
    }

    /// Check `balance_after = balance_before ± amount`
    pub fn is_arithmetic_consistent(&self) -> bool {
        match self.direction {
            Direction::Credit => self.balance_after == self.balance_before + self.amount,
            Direction::Debit => self.balance_after == self.balance_before - self.amount,
        }
    }
}

/// Parameters of a credit or debit
#[derive(Debug, Clone)]
pub struct LedgerRequest {
    /// Owner
    pub user_id: UserId,

    /// Currency
    pub currency: Currency,

    /// Amount (must be positive)
    pub amount: Decimal,

    /// Optional link to a payment or operation
    pub reference: Option<EntryReference>,

    /// Human-readable description
    pub description: String,
}

impl LedgerRequest {
    /// Create a request without a reference
    pub fn new(
        user_id: UserId,
        currency: Currency,
        amount: Decimal,
        description: impl Into<String>,
    ) -> Self {
        Self {
            user_id,
            currency,
            amount,
            reference: None,
            description: description.into(),
        }
    }

    /// Attach a reference
    pub fn with_reference(mut self, reference: EntryReference) -> Self {
        self.reference = Some(reference);
        self
    }
}

/// Debit flags
#[derive(Debug, Clone, Copy, Default)]
pub struct DebitOptions {
    /// Allow the balance to go below zero (explicit override, e.g. refunds)
    pub allow_negative: bool,
}

impl DebitOptions {
    /// Overdraft-permitting debit
    pub fn allow_negative() -> Self {
        Self {
            allow_negative: true,
        }
    }
}

/// Kind of externally initiated money movement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum PaymentType {
    /// One-time top-up of the prepaid balance
    Prepaid = 1,
    /// Subscription invoice
    Subscription = 2,
    /// Refund of an earlier payment
    Refund = 3,
}

impl PaymentType {
    /// Stable lowercase code
    pub fn code(&self) -> &'static str {
        match self {
            PaymentType::Prepaid => "prepaid",
            PaymentType::Subscription => "subscription",
            PaymentType::Refund => "refund",
        }
    }

    /// Parse from a stable code
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "prepaid" => Some(PaymentType::Prepaid),
            "subscription" => Some(PaymentType::Subscription),
            "refund" => Some(PaymentType::Refund),
            _ => None,
        }
    }
}

/// Payment status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum PaymentStatus {
    /// Created, waiting for the gateway
    Pending = 1,
    /// Gateway accepted the charge and is processing it
    Processing = 2,
    /// Money received (terminal)
    Succeeded = 3,
    /// Charge failed; the customer may still retry the same intent
    Failed = 4,
}

impl PaymentStatus {
    /// Stable lowercase code
    pub fn code(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Processing => "processing",
            PaymentStatus::Succeeded => "succeeded",
            PaymentStatus::Failed => "failed",
        }
    }

    /// Map a gateway-side status string onto the internal lifecycle
    pub fn from_gateway(s: &str) -> Option<Self> {
        match s {
            "pending" | "requires_payment_method" | "requires_confirmation" | "requires_action" => {
                Some(PaymentStatus::Pending)
            }
            "processing" => Some(PaymentStatus::Processing),
            "succeeded" | "paid" | "available" => Some(PaymentStatus::Succeeded),
            "failed" | "canceled" => Some(PaymentStatus::Failed),
            _ => None,
        }
    }

    /// Whether the gateway may still move this payment
    pub fn is_settled(&self) -> bool {
        matches!(self, PaymentStatus::Succeeded | PaymentStatus::Failed)
    }

    /// Lifecycle check. `Succeeded` never changes; a failed intent may be retried.
    pub fn can_transition_to(&self, next: PaymentStatus) -> bool {
        use PaymentStatus::*;

        match (self, next) {
            (Succeeded, _) => false,
            (a, b) if *a == b => false,
            (Pending, _) => true,
            (Processing, Succeeded) | (Processing, Failed) => true,
            (Failed, Processing) | (Failed, Succeeded) => true,
            _ => false,
        }
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// One externally initiated money movement
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payment {
    /// Internal payment ID
    pub payment_id: Uuid,

    /// Owner
    pub user_id: UserId,

    /// Gateway name ("stripe", ...)
    pub provider: String,

    /// Gateway transaction ID, unique per provider
    pub external_reference_id: Option<String>,

    /// Kind of movement
    pub payment_type: PaymentType,

    /// Current status
    pub status: PaymentStatus,

    /// Amount
    pub amount: Decimal,

    /// Currency
    pub currency: Currency,

    /// Additional metadata
    #[serde(default)]
    pub metadata: HashMap<String, String>,

    /// Created timestamp
    pub created_at: DateTime<Utc>,

    /// Last updated timestamp
    pub updated_at: DateTime<Utc>,
}

impl Payment {
    /// Build a payment from a registration request
    pub fn from_new(new: NewPayment, now: DateTime<Utc>) -> Self {
        Self {
            payment_id: Uuid::now_v7(),
            user_id: new.user_id,
            provider: new.provider,
            external_reference_id: new.external_reference_id,
            payment_type: new.payment_type,
            status: new.status,
            amount: new.amount,
            currency: new.currency,
            metadata: new.metadata,
            created_at: new.created_at.unwrap_or(now),
            updated_at: now,
        }
    }
}

/// Payment registration request
#[derive(Debug, Clone)]
pub struct NewPayment {
    /// Owner
    pub user_id: UserId,

    /// Gateway name
    pub provider: String,

    /// Gateway transaction ID
    pub external_reference_id: Option<String>,

    /// Kind of movement
    pub payment_type: PaymentType,

    /// Initial status (normally `Pending`)
    pub status: PaymentStatus,

    /// Amount
    pub amount: Decimal,

    /// Currency
    pub currency: Currency,

    /// Additional metadata
    pub metadata: HashMap<String, String>,

    /// Creation time as reported by the gateway, defaults to now
    pub created_at: Option<DateTime<Utc>>,
}

impl NewPayment {
    /// Pending payment with no metadata
    pub fn pending(
        user_id: UserId,
        provider: impl Into<String>,
        external_reference_id: impl Into<String>,
        payment_type: PaymentType,
        amount: Decimal,
        currency: Currency,
    ) -> Self {
        Self {
            user_id,
            provider: provider.into(),
            external_reference_id: Some(external_reference_id.into()),
            payment_type,
            status: PaymentStatus::Pending,
            amount,
            currency,
            metadata: HashMap::new(),
            created_at: None,
        }
    }
}

/// Webhook event processing status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum WebhookStatus {
    /// Logged, not yet claimed
    Received = 1,
    /// Claimed by a handler
    Processing = 2,
    /// Handler committed its effects (terminal)
    Processed = 3,
    /// Nothing to do for this event (terminal)
    Ignored = 4,
    /// Handler failed; eligible for manual replay only
    Failed = 5,
}

impl WebhookStatus {
    /// Stable lowercase code
    pub fn code(&self) -> &'static str {
        match self {
            WebhookStatus::Received => "received",
            WebhookStatus::Processing => "processing",
            WebhookStatus::Processed => "processed",
            WebhookStatus::Ignored => "ignored",
            WebhookStatus::Failed => "failed",
        }
    }

    /// Terminal statuses short-circuit redelivery
    pub fn is_terminal(&self) -> bool {
        matches!(self, WebhookStatus::Processed | WebhookStatus::Ignored)
    }
}

impl fmt::Display for WebhookStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// One externally delivered event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEvent {
    /// Gateway name
    pub provider: String,

    /// Idempotency key
    pub external_event_id: String,

    /// Event type string as delivered
    pub event_type: String,

    /// Raw JSON payload
    pub payload: String,

    /// Current status
    pub status: WebhookStatus,

    /// What happened, or the error detail
    pub processing_notes: Option<String>,

    /// Number of times a handler was started for this event
    pub attempts: u32,

    /// First sighting
    pub received_at: DateTime<Utc>,

    /// Last status change
    pub updated_at: DateTime<Utc>,

    /// Time the event reached a terminal status
    pub processed_at: Option<DateTime<Utc>>,
}

/// Gateway-side transaction record (minor units, raw gateway strings)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayTransaction {
    /// Gateway transaction ID
    pub id: String,

    /// Amount in minor units
    pub amount: i64,

    /// Currency code as the gateway reports it
    pub currency: String,

    /// Gateway status string
    pub status: String,

    /// Creation time on the gateway
    pub created_at: DateTime<Utc>,

    /// Gateway fee in minor units
    #[serde(default)]
    pub fee: i64,
}

impl GatewayTransaction {
    /// Parsed currency, if the gateway code is known
    pub fn currency(&self) -> Option<Currency> {
        Currency::parse(&self.currency)
    }

    /// Amount as a decimal, if the currency is known
    pub fn amount_decimal(&self) -> Option<Decimal> {
        self.currency().map(|c| c.minor_units_to_decimal(self.amount))
    }

    /// Fee as a decimal, if the currency is known
    pub fn fee_decimal(&self) -> Option<Decimal> {
        self.currency().map(|c| c.minor_units_to_decimal(self.fee))
    }
}

/// Persisted reconciliation outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ReconciliationStatus {
    /// Both sides agree
    Matched = 1,
    /// Amounts disagree
    Discrepancy = 2,
    /// Needs an operator
    ManualReview = 3,
}

impl ReconciliationStatus {
    /// Stable lowercase code
    pub fn code(&self) -> &'static str {
        match self {
            ReconciliationStatus::Matched => "matched",
            ReconciliationStatus::Discrepancy => "discrepancy",
            ReconciliationStatus::ManualReview => "manual_review",
        }
    }
}

/// Fine-grained reconciliation classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Classification {
    /// Amount and status agree (possibly after a lag correction)
    Matched,
    /// Amount differs beyond tolerance (wins over a status mismatch)
    Discrepancy,
    /// Amount agrees, status disagrees
    ManualReview,
    /// Internal payment with no gateway counterpart
    InternalOnly,
    /// Gateway record with no internal payment
    GatewayOnly,
}

impl Classification {
    /// Stable lowercase code
    pub fn code(&self) -> &'static str {
        match self {
            Classification::Matched => "matched",
            Classification::Discrepancy => "discrepancy",
            Classification::ManualReview => "manual_review",
            Classification::InternalOnly => "internal_only",
            Classification::GatewayOnly => "gateway_only",
        }
    }

    /// Status persisted on the Reconciliation Record
    pub fn record_status(&self) -> ReconciliationStatus {
        match self {
            Classification::Matched => ReconciliationStatus::Matched,
            Classification::Discrepancy => ReconciliationStatus::Discrepancy,
            Classification::ManualReview
            | Classification::InternalOnly
            | Classification::GatewayOnly => ReconciliationStatus::ManualReview,
        }
    }

    /// Whether this outcome raises an operator alert
    pub fn requires_alert(&self) -> bool {
        matches!(
            self,
            Classification::Discrepancy | Classification::InternalOnly | Classification::GatewayOnly
        )
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// One examined payment in a reconciliation pass
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationRecord {
    /// Record ID
    pub record_id: Uuid,

    /// Examined payment
    pub payment_id: Uuid,

    /// Gateway transaction ID
    pub external_transaction_id: Option<String>,

    /// Gateway amount, when a counterpart was found
    pub gateway_amount: Option<Decimal>,

    /// Gateway fee, when a counterpart was found
    pub gateway_fee: Option<Decimal>,

    /// Persisted outcome
    pub status: ReconciliationStatus,

    /// Fine-grained outcome
    pub classification: Classification,

    /// Human-readable explanation
    pub notes: String,

    /// Gateway record as seen during the pass
    pub gateway_snapshot: Option<GatewayTransaction>,

    /// When the record was written
    pub reconciled_at: DateTime<Utc>,

    /// Operator who reconciled it, `None` for automatic passes
    pub reconciled_by: Option<String>,
}
