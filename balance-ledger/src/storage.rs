//! Ledger Store on RocksDB `TransactionDB`
//!
//! # Column Families
//!
//! - `balances` - Current balance per (user, currency) (key: user_id || currency)
//! - `entries` - Append-only ledger entries (key: entry_id)
//! - `payments` - Payments (key: payment_id)
//! - `webhook_events` - Webhook event log (key: provider || 0x00 || external_event_id)
//! - `reconciliations` - Reconciliation records (key: record_id)
//! - `indices` - Secondary indices, one tag byte per index
//!
//! # Transactions
//!
//! Every mutation goes through a [`LedgerTxn`]. Rows that are read in order
//! to be rewritten are locked with `get_for_update`, so two transactions can
//! never both observe the same pre-write state. Lock waits and the overall
//! transaction lifetime are bounded by [`TransactionConfig`]; an uncommitted
//! transaction is rolled back when dropped.

use crate::{
    config::TransactionConfig,
    error::{Error, Result},
    types::{
        Balance, Currency, Direction, EntryReference, LedgerEntry, Payment, ReconciliationRecord,
        UserId, WebhookEvent, WebhookStatus,
    },
    Config,
};
use chrono::{DateTime, Utc};
use rocksdb::{
    ColumnFamily, ColumnFamilyDescriptor, DBCompactionStyle, Direction as ScanDirection,
    IteratorMode, Options, Transaction, TransactionDB, TransactionDBOptions, TransactionOptions,
    WriteOptions,
};
use serde::de::DeserializeOwned;
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

/// Column family names
const CF_BALANCES: &str = "balances";
const CF_ENTRIES: &str = "entries";
const CF_PAYMENTS: &str = "payments";
const CF_WEBHOOK_EVENTS: &str = "webhook_events";
const CF_RECONCILIATIONS: &str = "reconciliations";
const CF_INDICES: &str = "indices";

/// Index tags (first byte of every key in `indices`)
const IDX_USER_ENTRY: u8 = b'e';
const IDX_PAYMENT_ENTRY: u8 = b'p';
const IDX_PAYMENT_REF: u8 = b'x';
const IDX_PAYMENT_TIME: u8 = b't';
const IDX_PAYMENT_RECON: u8 = b'c';

type KvResult = std::result::Result<(Box<[u8]>, Box<[u8]>), rocksdb::Error>;

/// Storage wrapper for RocksDB
pub struct Storage {
    db: TransactionDB,
    path: PathBuf,
    txn_config: TransactionConfig,
}

impl fmt::Debug for Storage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Storage")
            .field("path", &self.path)
            .field("txn_config", &self.txn_config)
            .finish()
    }
}

impl Storage {
    /// Open or create database
    pub fn open(config: &Config) -> Result<Self> {
        let path = &config.data_dir;

        // Create directory if not exists
        std::fs::create_dir_all(path)?;

        // Database options
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        // Tuning from config
        db_opts.set_write_buffer_size(config.rocksdb.write_buffer_size_mb * 1024 * 1024);
        db_opts.set_max_write_buffer_number(config.rocksdb.max_write_buffer_number);
        db_opts.set_max_background_jobs(config.rocksdb.max_background_jobs);
        db_opts.set_compaction_style(DBCompactionStyle::Level);

        if config.rocksdb.enable_statistics {
            db_opts.enable_statistics();
        }

        let mut txn_db_opts = TransactionDBOptions::default();
        txn_db_opts.set_txn_lock_timeout(config.transactions.lock_timeout_ms);
        txn_db_opts.set_default_lock_timeout(config.transactions.lock_timeout_ms);

        // Column family descriptors
        let cf_descriptors = vec![
            ColumnFamilyDescriptor::new(CF_BALANCES, Self::cf_options_hot()),
            ColumnFamilyDescriptor::new(CF_ENTRIES, Self::cf_options_log()),
            ColumnFamilyDescriptor::new(CF_PAYMENTS, Self::cf_options_hot()),
            ColumnFamilyDescriptor::new(CF_WEBHOOK_EVENTS, Self::cf_options_log()),
            ColumnFamilyDescriptor::new(CF_RECONCILIATIONS, Self::cf_options_log()),
            ColumnFamilyDescriptor::new(CF_INDICES, Self::cf_options_indices()),
        ];

        let db = TransactionDB::open_cf_descriptors(&db_opts, &txn_db_opts, path, cf_descriptors)?;

        tracing::info!(path = ?path, "Opened ledger store");

        Ok(Self {
            db,
            path: path.clone(),
            txn_config: config.transactions.clone(),
        })
    }

    // Column family options

    fn cf_options_hot() -> Options {
        let mut opts = Options::default();
        // Balances and payments are read on every mutation, use LZ4 for speed
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        opts
    }

    fn cf_options_log() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Zstd);
        opts.set_bottommost_compression_type(rocksdb::DBCompressionType::Zstd);
        opts
    }

    fn cf_options_indices() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        let mut block_opts = rocksdb::BlockBasedOptions::default();
        block_opts.set_bloom_filter(10.0, false); // 10 bits per key
        opts.set_block_based_table_factory(&block_opts);
        opts
    }

    // Helper: get column family handle

    fn cf_handle(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| Error::Storage(format!("Column family {} not found", name)))
    }

    /// Begin a bounded pessimistic transaction
    pub(crate) fn begin(&self) -> LedgerTxn<'_> {
        let mut txn_opts = TransactionOptions::default();
        txn_opts.set_lock_timeout(self.txn_config.lock_timeout_ms);
        txn_opts.set_expiration(self.txn_config.expiration_ms);
        txn_opts.set_deadlock_detect(true);

        let txn = self.db.transaction_opt(&WriteOptions::default(), &txn_opts);
        LedgerTxn {
            storage: self,
            txn,
            written: Vec::new(),
        }
    }

    // Non-locking reads

    /// Current balance row, if one exists
    pub(crate) fn get_balance(&self, user_id: UserId, currency: Currency) -> Result<Option<Balance>> {
        let cf = self.cf_handle(CF_BALANCES)?;
        self.db
            .get_cf(cf, keys::balance(user_id, currency))?
            .map(|bytes| decode(&bytes))
            .transpose()
    }

    /// Entries for one balance, in sequence order
    pub fn entries_for(&self, user_id: UserId, currency: Currency) -> Result<Vec<LedgerEntry>> {
        let cf_indices = self.cf_handle(CF_INDICES)?;
        let cf_entries = self.cf_handle(CF_ENTRIES)?;

        let prefix = keys::user_entry_prefix(user_id, currency);
        let iter = self
            .db
            .iterator_cf(cf_indices, IteratorMode::From(&prefix, ScanDirection::Forward));

        let mut entries = Vec::new();
        for (_, entry_id) in scan_prefix(iter, &prefix)? {
            let bytes = self
                .db
                .get_cf(cf_entries, &entry_id)?
                .ok_or_else(|| Error::InvariantViolation("index points at missing entry".into()))?;
            entries.push(decode(&bytes)?);
        }

        Ok(entries)
    }

    /// Entries referencing a payment
    pub fn entries_for_payment(&self, payment_id: Uuid) -> Result<Vec<LedgerEntry>> {
        let cf_indices = self.cf_handle(CF_INDICES)?;
        let cf_entries = self.cf_handle(CF_ENTRIES)?;

        let prefix = keys::payment_entry_prefix(payment_id);
        let iter = self
            .db
            .iterator_cf(cf_indices, IteratorMode::From(&prefix, ScanDirection::Forward));

        let mut entries = Vec::new();
        for (key, _) in scan_prefix(iter, &prefix)? {
            let entry_id = &key[prefix.len()..];
            if let Some(bytes) = self.db.get_cf(cf_entries, entry_id)? {
                entries.push(decode(&bytes)?);
            }
        }

        Ok(entries)
    }

    /// Payment by internal ID
    pub fn get_payment(&self, payment_id: Uuid) -> Result<Option<Payment>> {
        let cf = self.cf_handle(CF_PAYMENTS)?;
        self.db
            .get_cf(cf, payment_id.as_bytes())?
            .map(|bytes| decode(&bytes))
            .transpose()
    }

    /// Payment by gateway reference
    pub fn find_payment_by_reference(
        &self,
        provider: &str,
        external_reference_id: &str,
    ) -> Result<Option<Payment>> {
        let cf_indices = self.cf_handle(CF_INDICES)?;
        let key = keys::payment_reference(provider, external_reference_id);

        match self.db.get_cf(cf_indices, key)? {
            Some(id) => self.get_payment(uuid_from_slice(&id)?),
            None => Ok(None),
        }
    }

    /// Payments created in `[from, to)`, oldest first
    pub fn payments_created_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Payment>> {
        let cf_indices = self.cf_handle(CF_INDICES)?;
        let start = keys::payment_time_bound(from);
        let end = keys::payment_time_bound(to);

        let iter = self
            .db
            .iterator_cf(cf_indices, IteratorMode::From(&start, ScanDirection::Forward));

        let mut payments = Vec::new();
        for item in iter {
            let (key, _) = item?;
            if key.as_ref() >= end.as_slice() || key.first() != Some(&IDX_PAYMENT_TIME) {
                break;
            }

            let payment_id = uuid_from_slice(&key[key.len() - 16..])?;
            if let Some(payment) = self.get_payment(payment_id)? {
                payments.push(payment);
            }
        }

        Ok(payments)
    }

    /// Webhook event by idempotency key
    pub fn get_webhook_event(
        &self,
        provider: &str,
        external_event_id: &str,
    ) -> Result<Option<WebhookEvent>> {
        let cf = self.cf_handle(CF_WEBHOOK_EVENTS)?;
        self.db
            .get_cf(cf, keys::webhook_event(provider, external_event_id))?
            .map(|bytes| decode(&bytes))
            .transpose()
    }

    /// All webhook events currently in `status`
    pub fn webhook_events_with_status(&self, status: WebhookStatus) -> Result<Vec<WebhookEvent>> {
        let cf = self.cf_handle(CF_WEBHOOK_EVENTS)?;

        let mut events = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item?;
            let event: WebhookEvent = decode(&value)?;
            if event.status == status {
                events.push(event);
            }
        }

        Ok(events)
    }

    /// Reconciliation records written for a payment
    pub fn reconciliation_records_for(&self, payment_id: Uuid) -> Result<Vec<ReconciliationRecord>> {
        let cf_indices = self.cf_handle(CF_INDICES)?;
        let cf_recon = self.cf_handle(CF_RECONCILIATIONS)?;

        let prefix = keys::payment_recon_prefix(payment_id);
        let iter = self
            .db
            .iterator_cf(cf_indices, IteratorMode::From(&prefix, ScanDirection::Forward));

        let mut records = Vec::new();
        for (key, _) in scan_prefix(iter, &prefix)? {
            let record_id = &key[prefix.len()..];
            if let Some(bytes) = self.db.get_cf(cf_recon, record_id)? {
                records.push(decode(&bytes)?);
            }
        }

        Ok(records)
    }
}

/// One pessimistic transaction against the Ledger Store
///
/// Balance rows are only writable from inside this crate; everything else
/// reaches them through [`crate::BalanceLedger`]'s credit and debit.
pub struct LedgerTxn<'db> {
    storage: &'db Storage,
    txn: Transaction<'db, TransactionDB>,
    written: Vec<LedgerEntry>,
}

impl fmt::Debug for LedgerTxn<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LedgerTxn")
            .field("written", &self.written.len())
            .finish_non_exhaustive()
    }
}

impl<'db> LedgerTxn<'db> {
    fn get_for_update<T: DeserializeOwned>(&self, cf_name: &str, key: &[u8]) -> Result<Option<T>> {
        let cf = self.storage.cf_handle(cf_name)?;
        self.txn
            .get_for_update_cf(cf, key, true)?
            .map(|bytes| decode(&bytes))
            .transpose()
    }

    fn put<T: serde::Serialize>(&self, cf_name: &str, key: &[u8], value: &T) -> Result<()> {
        let cf = self.storage.cf_handle(cf_name)?;
        let bytes = bincode::serialize(value)?;
        self.txn.put_cf(cf, key, bytes)?;
        Ok(())
    }

    fn put_index(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let cf = self.storage.cf_handle(CF_INDICES)?;
        self.txn.put_cf(cf, key, value)?;
        Ok(())
    }

    fn index_keys_with_prefix(&self, prefix: &[u8]) -> Result<Vec<(Box<[u8]>, Box<[u8]>)>> {
        let cf = self.storage.cf_handle(CF_INDICES)?;
        let iter = self
            .txn
            .iterator_cf(cf, IteratorMode::From(prefix, ScanDirection::Forward));
        scan_prefix(iter, prefix)
    }

    // Balance rows (crate-private: only credit/debit write them)

    /// Lock the balance row, materializing a zero balance if it does not exist
    pub(crate) fn lock_balance(&self, user_id: UserId, currency: Currency) -> Result<Balance> {
        let balance = self
            .get_for_update(CF_BALANCES, &keys::balance(user_id, currency))?
            .unwrap_or_else(|| Balance::zero(user_id, currency));
        Ok(balance)
    }

    /// Write the balance row together with the entry that produced it
    pub(crate) fn write_balance_and_entry(&mut self, balance: &Balance, entry: &LedgerEntry) -> Result<()> {
        self.put(CF_BALANCES, &keys::balance(balance.user_id, balance.currency), balance)?;
        self.put(CF_ENTRIES, entry.entry_id.as_bytes(), entry)?;

        self.put_index(
            &keys::user_entry(entry.user_id, entry.currency, entry.sequence),
            entry.entry_id.as_bytes(),
        )?;

        if let Some(EntryReference::Payment(payment_id)) = &entry.reference {
            self.put_index(
                &keys::payment_entry(*payment_id, entry.entry_id),
                &[entry.direction as u8],
            )?;
        }

        self.written.push(entry.clone());
        Ok(())
    }

    /// Entries written so far in this transaction
    pub(crate) fn take_written(&mut self) -> Vec<LedgerEntry> {
        std::mem::take(&mut self.written)
    }

    /// Whether a credit entry already references this payment
    pub fn has_credit_for_payment(&self, payment_id: Uuid) -> Result<bool> {
        let prefix = keys::payment_entry_prefix(payment_id);
        let found = self
            .index_keys_with_prefix(&prefix)?
            .iter()
            .any(|(_, direction)| direction.first() == Some(&(Direction::Credit as u8)));
        Ok(found)
    }

    // Payments

    /// Lock and read a payment
    pub fn payment(&self, payment_id: Uuid) -> Result<Option<Payment>> {
        self.get_for_update(CF_PAYMENTS, payment_id.as_bytes())
    }

    /// Lock and read a payment by gateway reference
    pub fn payment_by_reference(
        &self,
        provider: &str,
        external_reference_id: &str,
    ) -> Result<Option<Payment>> {
        let cf_indices = self.storage.cf_handle(CF_INDICES)?;
        let key = keys::payment_reference(provider, external_reference_id);

        match self.txn.get_for_update_cf(cf_indices, key, true)? {
            Some(id) => self.payment(uuid_from_slice(&id)?),
            None => Ok(None),
        }
    }

    /// Insert a new payment, enforcing reference uniqueness per provider
    pub fn insert_payment(&mut self, payment: &Payment) -> Result<()> {
        if let Some(reference) = &payment.external_reference_id {
            let cf_indices = self.storage.cf_handle(CF_INDICES)?;
            let key = keys::payment_reference(&payment.provider, reference);

            // Locks the index key even when absent, so concurrent inserts serialize here
            if self.txn.get_for_update_cf(cf_indices, &key, true)?.is_some() {
                return Err(Error::DuplicatePayment(format!(
                    "{}:{}",
                    payment.provider, reference
                )));
            }
            self.put_index(&key, payment.payment_id.as_bytes())?;
        }

        self.put_index(
            &keys::payment_time(payment.created_at, payment.payment_id),
            &[],
        )?;
        self.put(CF_PAYMENTS, payment.payment_id.as_bytes(), payment)
    }

    /// Persist a status change on an existing payment; callers go through
    /// [`LedgerTxn::set_payment_status`] so the lifecycle is checked
    pub(crate) fn update_payment(&mut self, payment: &Payment) -> Result<()> {
        self.put(CF_PAYMENTS, payment.payment_id.as_bytes(), payment)
    }

    // Webhook event log

    /// Lock and read a webhook event
    pub fn webhook_event(&self, provider: &str, external_event_id: &str) -> Result<Option<WebhookEvent>> {
        self.get_for_update(CF_WEBHOOK_EVENTS, &keys::webhook_event(provider, external_event_id))
    }

    /// Write a webhook event row
    pub fn put_webhook_event(&mut self, event: &WebhookEvent) -> Result<()> {
        self.put(
            CF_WEBHOOK_EVENTS,
            &keys::webhook_event(&event.provider, &event.external_event_id),
            event,
        )
    }

    // Reconciliation records

    /// Whether any reconciliation record exists for the payment
    pub fn has_reconciliation_record(&self, payment_id: Uuid) -> Result<bool> {
        let prefix = keys::payment_recon_prefix(payment_id);
        Ok(!self.index_keys_with_prefix(&prefix)?.is_empty())
    }

    /// Write a reconciliation record
    pub fn put_reconciliation_record(&mut self, record: &ReconciliationRecord) -> Result<()> {
        self.put(CF_RECONCILIATIONS, record.record_id.as_bytes(), record)?;
        self.put_index(
            &keys::payment_recon(record.payment_id, record.record_id),
            &[record.status as u8],
        )
    }

    /// Atomic commit
    pub(crate) fn commit(self) -> Result<()> {
        self.txn.commit()?;
        Ok(())
    }
}

/// Collect `(key, value)` pairs while keys share `prefix`
fn scan_prefix<I>(iter: I, prefix: &[u8]) -> Result<Vec<(Box<[u8]>, Box<[u8]>)>>
where
    I: Iterator<Item = KvResult>,
{
    let mut out = Vec::new();
    for item in iter {
        let (key, value) = item?;
        if !key.starts_with(prefix) {
            break;
        }
        out.push((key, value));
    }
    Ok(out)
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(bincode::deserialize(bytes)?)
}

fn uuid_from_slice(bytes: &[u8]) -> Result<Uuid> {
    Uuid::from_slice(bytes).map_err(|e| Error::Storage(format!("corrupt uuid in index: {}", e)))
}

/// Key encodings
mod keys {
    use super::*;

    pub(super) fn balance(user_id: UserId, currency: Currency) -> Vec<u8> {
        let mut key = user_id.to_key_bytes().to_vec();
        key.extend_from_slice(currency.code().as_bytes());
        key
    }

    pub(super) fn user_entry_prefix(user_id: UserId, currency: Currency) -> Vec<u8> {
        let mut key = vec![IDX_USER_ENTRY];
        key.extend_from_slice(&balance(user_id, currency));
        key
    }

    pub(super) fn user_entry(user_id: UserId, currency: Currency, sequence: u64) -> Vec<u8> {
        let mut key = user_entry_prefix(user_id, currency);
        key.extend_from_slice(&sequence.to_be_bytes());
        key
    }

    pub(super) fn payment_entry_prefix(payment_id: Uuid) -> Vec<u8> {
        let mut key = vec![IDX_PAYMENT_ENTRY];
        key.extend_from_slice(payment_id.as_bytes());
        key
    }

    pub(super) fn payment_entry(payment_id: Uuid, entry_id: Uuid) -> Vec<u8> {
        let mut key = payment_entry_prefix(payment_id);
        key.extend_from_slice(entry_id.as_bytes());
        key
    }

    pub(super) fn payment_reference(provider: &str, external_reference_id: &str) -> Vec<u8> {
        let mut key = vec![IDX_PAYMENT_REF];
        key.extend_from_slice(provider.as_bytes());
        key.push(0);
        key.extend_from_slice(external_reference_id.as_bytes());
        key
    }

    /// Order-preserving encoding of a signed millisecond timestamp
    pub(super) fn payment_time_bound(at: DateTime<Utc>) -> Vec<u8> {
        let millis = (at.timestamp_millis() as u64) ^ (1u64 << 63);
        let mut key = vec![IDX_PAYMENT_TIME];
        key.extend_from_slice(&millis.to_be_bytes());
        key
    }

    pub(super) fn payment_time(at: DateTime<Utc>, payment_id: Uuid) -> Vec<u8> {
        let mut key = payment_time_bound(at);
        key.extend_from_slice(payment_id.as_bytes());
        key
    }

    pub(super) fn payment_recon_prefix(payment_id: Uuid) -> Vec<u8> {
        let mut key = vec![IDX_PAYMENT_RECON];
        key.extend_from_slice(payment_id.as_bytes());
        key
    }

    pub(super) fn payment_recon(payment_id: Uuid, record_id: Uuid) -> Vec<u8> {
        let mut key = payment_recon_prefix(payment_id);
        key.extend_from_slice(record_id.as_bytes());
        key
    }

    pub(super) fn webhook_event(provider: &str, external_event_id: &str) -> Vec<u8> {
        let mut key = provider.as_bytes().to_vec();
        key.push(0);
        key.extend_from_slice(external_event_id.as_bytes());
        key
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PaymentStatus, PaymentType, NewPayment};
    use rust_decimal::Decimal;
    use tempfile::TempDir;

    fn test_config() -> (Config, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();
        (config, temp_dir)
    }

    fn test_payment(reference: &str) -> Payment {
        Payment::from_new(
            NewPayment::pending(
                UserId(1),
                "stripe",
                reference,
                PaymentType::Prepaid,
                Decimal::new(10000, 2),
                Currency::BRL,
            ),
            Utc::now(),
        )
    }

    #[test]
    fn test_storage_open() {
        let (config, _temp) = test_config();
        let storage = Storage::open(&config).unwrap();
        assert!(storage.cf_handle(CF_BALANCES).is_ok());
        assert!(storage.cf_handle(CF_INDICES).is_ok());
    }

    #[test]
    fn test_missing_balance_reads_as_zero_inside_txn() {
        let (config, _temp) = test_config();
        let storage = Storage::open(&config).unwrap();

        assert!(storage.get_balance(UserId(1), Currency::BRL).unwrap().is_none());

        let txn = storage.begin();
        let balance = txn.lock_balance(UserId(1), Currency::BRL).unwrap();
        assert_eq!(balance.amount, Decimal::ZERO);
        assert_eq!(balance.entry_count, 0);
    }

    #[test]
    fn test_insert_and_find_payment() {
        let (config, _temp) = test_config();
        let storage = Storage::open(&config).unwrap();
        let payment = test_payment("pi_123");

        let mut txn = storage.begin();
        txn.insert_payment(&payment).unwrap();
        txn.commit().unwrap();

        let by_id = storage.get_payment(payment.payment_id).unwrap().unwrap();
        assert_eq!(by_id.status, PaymentStatus::Pending);

        let by_ref = storage
            .find_payment_by_reference("stripe", "pi_123")
            .unwrap()
            .unwrap();
        assert_eq!(by_ref.payment_id, payment.payment_id);

        assert!(storage
            .find_payment_by_reference("other", "pi_123")
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_duplicate_reference_rejected() {
        let (config, _temp) = test_config();
        let storage = Storage::open(&config).unwrap();

        let mut txn = storage.begin();
        txn.insert_payment(&test_payment("pi_dup")).unwrap();
        txn.commit().unwrap();

        let mut txn = storage.begin();
        let result = txn.insert_payment(&test_payment("pi_dup"));
        assert!(matches!(result, Err(Error::DuplicatePayment(_))));
    }

    #[test]
    fn test_uncommitted_txn_rolls_back() {
        let (config, _temp) = test_config();
        let storage = Storage::open(&config).unwrap();
        let payment = test_payment("pi_dropped");

        {
            let mut txn = storage.begin();
            txn.insert_payment(&payment).unwrap();
            // dropped without commit
        }

        assert!(storage.get_payment(payment.payment_id).unwrap().is_none());
        assert!(storage
            .find_payment_by_reference("stripe", "pi_dropped")
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_payments_created_between() {
        let (config, _temp) = test_config();
        let storage = Storage::open(&config).unwrap();
        let base = Utc::now();

        let mut txn = storage.begin();
        for (i, offset) in [-120i64, -30, 0, 90].iter().enumerate() {
            let mut payment = test_payment(&format!("pi_{}", i));
            payment.created_at = base + chrono::Duration::minutes(*offset);
            txn.insert_payment(&payment).unwrap();
        }
        txn.commit().unwrap();

        let window = storage
            .payments_created_between(base - chrono::Duration::minutes(60), base + chrono::Duration::minutes(60))
            .unwrap();

        let refs: Vec<_> = window
            .iter()
            .map(|p| p.external_reference_id.clone().unwrap())
            .collect();
        assert_eq!(refs, vec!["pi_1".to_string(), "pi_2".to_string()]);
    }

    #[test]
    fn test_time_key_ordering_across_epoch() {
        let before_epoch = DateTime::from_timestamp_millis(-1_000).unwrap();
        let after_epoch = DateTime::from_timestamp_millis(1_000).unwrap();
        assert!(keys::payment_time_bound(before_epoch) < keys::payment_time_bound(after_epoch));
    }
}
