//! Operator-controlled user settings
//!
//! The gate reads these on every check. Slot reservation is part of the same
//! source so the open-operation count and the cap check are one atomic step.
//!
//! Slots are keyed by operation reference. An open operation is either
//! `Open` or `Closing`; both count against the cap. Only the caller that
//! moves a reference to `Closing` may settle it, so a repeated close of the
//! same reference neither credits twice nor frees a second slot.

use crate::{Error, Result};
use balance_ledger::{Currency, UserId};
use dashmap::DashMap;
use rust_decimal::Decimal;
use std::collections::HashMap;

/// Settings that apply to one user and currency
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserSettings {
    /// Operator flag; `false` blocks every operation
    pub operable: bool,
    /// User's minimum balance to operate in this currency
    pub minimum_balance: Option<Decimal>,
    /// Per-user override, takes precedence over every other minimum
    pub override_minimum: Option<Decimal>,
    /// Operations currently open
    pub open_operations: u32,
}

impl Default for UserSettings {
    fn default() -> Self {
        Self {
            operable: true,
            minimum_balance: None,
            override_minimum: None,
            open_operations: 0,
        }
    }
}

/// Source of operator settings and open-operation slots
pub trait OperatorSettingsSource: Send + Sync {
    /// Settings for one user and currency
    fn settings(&self, user_id: UserId, currency: Currency) -> Result<UserSettings>;

    /// Take a slot for `reference` if fewer than `cap` are open; returns the
    /// count before taking it. Fails with `OperationAlreadyOpen` if the
    /// reference already holds a slot.
    fn try_reserve_slot(&self, user_id: UserId, reference: &str, cap: u32) -> Result<Option<u32>>;

    /// Move an open operation to `Closing`; `false` if it is not open
    fn begin_close(&self, user_id: UserId, reference: &str) -> Result<bool>;

    /// Put a `Closing` operation back to `Open` after a failed settlement
    fn abort_close(&self, user_id: UserId, reference: &str) -> Result<()>;

    /// Give the reference's slot back; `false` if it held none
    fn release_slot(&self, user_id: UserId, reference: &str) -> Result<bool>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Open,
    Closing,
}

#[derive(Debug, Clone)]
struct UserRecord {
    operable: bool,
    minimums: HashMap<Currency, Decimal>,
    override_minimum: Option<Decimal>,
    slots: HashMap<String, SlotState>,
}

impl UserRecord {
    fn open_operations(&self) -> u32 {
        u32::try_from(self.slots.len()).unwrap_or(u32::MAX)
    }
}

impl Default for UserRecord {
    fn default() -> Self {
        Self {
            operable: true,
            minimums: HashMap::new(),
            override_minimum: None,
            slots: HashMap::new(),
        }
    }
}

/// In-memory settings store
#[derive(Debug, Default)]
pub struct InMemorySettings {
    users: DashMap<UserId, UserRecord>,
}

impl InMemorySettings {
    /// Empty store; unknown users are operable with no minimum
    pub fn new() -> Self {
        Self::default()
    }

    /// Flag a user operable or not
    pub fn set_operable(&self, user_id: UserId, operable: bool) {
        self.users.entry(user_id).or_default().operable = operable;
    }

    /// User's minimum balance for one currency
    pub fn set_minimum_balance(&self, user_id: UserId, currency: Currency, minimum: Decimal) {
        self.users
            .entry(user_id)
            .or_default()
            .minimums
            .insert(currency, minimum);
    }

    /// Per-user override minimum (`None` clears it)
    pub fn set_override_minimum(&self, user_id: UserId, minimum: Option<Decimal>) {
        self.users.entry(user_id).or_default().override_minimum = minimum;
    }

    /// Operations currently open for a user
    pub fn open_operations(&self, user_id: UserId) -> u32 {
        self.users
            .get(&user_id)
            .map(|record| record.open_operations())
            .unwrap_or(0)
    }

    /// Whether `reference` currently holds a slot
    pub fn is_open(&self, user_id: UserId, reference: &str) -> bool {
        self.users
            .get(&user_id)
            .map_or(false, |record| record.slots.contains_key(reference))
    }
}

impl OperatorSettingsSource for InMemorySettings {
    fn settings(&self, user_id: UserId, currency: Currency) -> Result<UserSettings> {
        let settings = match self.users.get(&user_id) {
            Some(record) => UserSettings {
                operable: record.operable,
                minimum_balance: record.minimums.get(&currency).copied(),
                override_minimum: record.override_minimum,
                open_operations: record.open_operations(),
            },
            None => UserSettings::default(),
        };
        Ok(settings)
    }

    fn try_reserve_slot(&self, user_id: UserId, reference: &str, cap: u32) -> Result<Option<u32>> {
        // The entry guard holds the shard lock for the check and the insert
        let mut record = self.users.entry(user_id).or_default();
        if record.slots.contains_key(reference) {
            return Err(Error::OperationAlreadyOpen(reference.to_string()));
        }
        let before = record.open_operations();
        if before >= cap {
            return Ok(None);
        }
        record.slots.insert(reference.to_string(), SlotState::Open);
        Ok(Some(before))
    }

    fn begin_close(&self, user_id: UserId, reference: &str) -> Result<bool> {
        let mut record = match self.users.get_mut(&user_id) {
            Some(record) => record,
            None => return Ok(false),
        };
        match record.slots.get_mut(reference) {
            Some(state) if *state == SlotState::Open => {
                *state = SlotState::Closing;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn abort_close(&self, user_id: UserId, reference: &str) -> Result<()> {
        if let Some(mut record) = self.users.get_mut(&user_id) {
            if let Some(state) = record.slots.get_mut(reference) {
                *state = SlotState::Open;
            }
        }
        Ok(())
    }

    fn release_slot(&self, user_id: UserId, reference: &str) -> Result<bool> {
        Ok(self
            .users
            .get_mut(&user_id)
            .map_or(false, |mut record| record.slots.remove(reference).is_some()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_user_defaults() {
        let store = InMemorySettings::new();
        let settings = store.settings(UserId(1), Currency::BRL).unwrap();
        assert_eq!(settings, UserSettings::default());
    }

    #[test]
    fn test_minimum_is_per_currency() {
        let store = InMemorySettings::new();
        store.set_minimum_balance(UserId(1), Currency::BRL, Decimal::from(50));

        let brl = store.settings(UserId(1), Currency::BRL).unwrap();
        let usd = store.settings(UserId(1), Currency::USD).unwrap();
        assert_eq!(brl.minimum_balance, Some(Decimal::from(50)));
        assert_eq!(usd.minimum_balance, None);
    }

    #[test]
    fn test_slots_respect_cap() {
        let store = InMemorySettings::new();
        let user = UserId(1);

        assert_eq!(store.try_reserve_slot(user, "t1", 2).unwrap(), Some(0));
        assert_eq!(store.try_reserve_slot(user, "t2", 2).unwrap(), Some(1));
        assert_eq!(store.try_reserve_slot(user, "t3", 2).unwrap(), None);
        assert_eq!(store.open_operations(user), 2);

        assert!(store.release_slot(user, "t1").unwrap());
        assert_eq!(store.try_reserve_slot(user, "t3", 2).unwrap(), Some(1));
    }

    #[test]
    fn test_same_reference_cannot_hold_two_slots() {
        let store = InMemorySettings::new();
        store.try_reserve_slot(UserId(1), "t1", 5).unwrap();

        let again = store.try_reserve_slot(UserId(1), "t1", 5);
        assert!(matches!(again, Err(Error::OperationAlreadyOpen(r)) if r == "t1"));
        assert_eq!(store.open_operations(UserId(1)), 1);

        // References are per user
        assert_eq!(store.try_reserve_slot(UserId(2), "t1", 5).unwrap(), Some(0));
    }

    #[test]
    fn test_repeat_release_is_noop() {
        let store = InMemorySettings::new();
        let user = UserId(9);
        assert!(!store.release_slot(user, "never").unwrap());

        store.try_reserve_slot(user, "t1", 2).unwrap();
        store.try_reserve_slot(user, "t2", 2).unwrap();
        assert!(store.release_slot(user, "t1").unwrap());
        assert!(!store.release_slot(user, "t1").unwrap());
        assert_eq!(store.open_operations(user), 1);
        assert!(store.is_open(user, "t2"));
    }

    #[test]
    fn test_close_is_claimed_once() {
        let store = InMemorySettings::new();
        let user = UserId(3);
        store.try_reserve_slot(user, "t1", 1).unwrap();

        assert!(store.begin_close(user, "t1").unwrap());
        assert!(!store.begin_close(user, "t1").unwrap());
        // Closing still counts against the cap
        assert_eq!(store.try_reserve_slot(user, "t2", 1).unwrap(), None);

        store.abort_close(user, "t1").unwrap();
        assert!(store.begin_close(user, "t1").unwrap());
        assert!(store.release_slot(user, "t1").unwrap());
        assert!(!store.begin_close(user, "t1").unwrap());
        assert!(!store.begin_close(UserId(4), "t1").unwrap());
    }
}
