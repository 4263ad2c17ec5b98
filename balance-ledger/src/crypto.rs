//! Hash chain over ledger entries
//!
//! Every entry for a (user, currency) commits to the previous one:
//!
//! ```text
//! entry_hash[n] = SHA-256(entry_hash[n-1] || canonical_bytes(entry[n]))
//! ```
//!
//! The chain starts from the all-zero hash. Replaying it detects edited,
//! dropped or reordered entries.

use crate::types::LedgerEntry;
use crate::{Error, Result};
use sha2::{Digest, Sha256};

/// Hash of an empty chain
pub const GENESIS_HASH: [u8; 32] = [0u8; 32];

/// Compute the chained hash of an entry from its `prev_hash` and canonical bytes
pub fn hash_entry(entry: &LedgerEntry) -> Result<[u8; 32]> {
    let canonical = entry.canonical_bytes()?;

    let mut hasher = Sha256::new();
    hasher.update(entry.prev_hash);
    hasher.update(&canonical);
    Ok(hasher.finalize().into())
}

/// Fill in `entry_hash` for a freshly built entry
pub fn seal_entry(entry: &mut LedgerEntry) -> Result<()> {
    entry.entry_hash = hash_entry(entry)?;
    Ok(())
}

/// Verify a chain of entries in sequence order, returning the final hash
pub fn verify_chain(entries: &[LedgerEntry]) -> Result<[u8; 32]> {
    let mut prev = GENESIS_HASH;

    for (index, entry) in entries.iter().enumerate() {
        let expected_sequence = index as u64 + 1;
        if entry.sequence != expected_sequence {
            return Err(Error::InvariantViolation(format!(
                "entry {} has sequence {}, expected {}",
                entry.entry_id, entry.sequence, expected_sequence
            )));
        }

        if entry.prev_hash != prev {
            return Err(Error::InvariantViolation(format!(
                "entry {} does not link to its predecessor",
                entry.entry_id
            )));
        }

        let recomputed = hash_entry(entry)?;
        if recomputed != entry.entry_hash {
            return Err(Error::InvariantViolation(format!(
                "entry {} hash mismatch: stored {}, computed {}",
                entry.entry_id,
                hex::encode(entry.entry_hash),
                hex::encode(recomputed)
            )));
        }

        prev = entry.entry_hash;
    }

    Ok(prev)
}
