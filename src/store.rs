//! The external, key-addressed byte store holding the callers' persistent records.
//!
//! Records are owned by a [`Namespace`] and are never created or resized by the
//! orchestration layer. Each record that carries encrypted state follows a
//! [`RecordLayout`]: a header, fixed-width plaintext fields, a region of 32-byte
//! ciphertext slots and a trailing 128-bit nonce.

use std::{
    collections::HashMap,
    fmt::{self, Debug},
    sync::RwLock,
};

use serde::{Deserialize, Serialize};

use crate::{encoding::Segment, ledger::Namespace};

/// Width in bytes of one ciphertext slot.
pub const SLOT_LEN: usize = 32;
/// Width in bytes of a stored nonce.
pub const NONCE_LEN: usize = 16;

/// A single ciphertext slot.
pub type Ciphertext = [u8; SLOT_LEN];

/// The address of a record in the [`StateStore`].
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StoreKey(pub [u8; 32]);

impl StoreKey {
    /// Derives a key from a human readable seed, e.g. `"vault/alice"`.
    pub fn derive(seed: &str) -> Self {
        Self(blake3::derive_key("mpc-orchestrator store key", seed.as_bytes()))
    }
}

impl fmt::Display for StoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0[..6] {
            write!(f, "{b:02x}")?;
        }
        write!(f, "…")
    }
}

impl Debug for StoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StoreKey({self})")
    }
}

/// The byte layout of a record type that carries encrypted state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordLayout {
    /// Length of the record header (e.g. a type discriminator).
    pub header_len: u32,
    /// Length of the fixed-width fields between header and ciphertexts.
    pub prefix_len: u32,
    /// Number of logical encrypted fields, one ciphertext slot each.
    pub encrypted_fields: u32,
}

impl RecordLayout {
    /// Creates a layout with `encrypted_fields` slots.
    pub const fn new(header_len: u32, prefix_len: u32, encrypted_fields: u32) -> Self {
        Self {
            header_len,
            prefix_len,
            encrypted_fields,
        }
    }

    /// Byte offset of the first ciphertext slot.
    pub const fn ciphertext_offset(&self) -> u32 {
        self.header_len + self.prefix_len
    }

    /// Length of the ciphertext region.
    pub const fn ciphertext_len(&self) -> u32 {
        self.encrypted_fields * SLOT_LEN as u32
    }

    /// Byte offset of the trailing nonce.
    pub const fn nonce_offset(&self) -> u32 {
        self.ciphertext_offset() + self.ciphertext_len()
    }

    /// Minimal length of a record with this layout.
    pub const fn len(&self) -> usize {
        self.nonce_offset() as usize + NONCE_LEN
    }

    /// Returns true if the layout has no ciphertext slots.
    pub const fn is_empty(&self) -> bool {
        self.encrypted_fields == 0
    }

    /// The argument segment reading this record's ciphertext region.
    pub fn external_read(&self, key: StoreKey) -> Segment {
        Segment::ExternalStateRead {
            key,
            offset: self.ciphertext_offset(),
            length: self.ciphertext_len(),
        }
    }

    /// Reads the encryption state out of a record's bytes.
    pub fn read_state(&self, bytes: &[u8]) -> Result<EncryptionState, StoreError> {
        self.check_len(bytes.len())?;
        let start = self.ciphertext_offset() as usize;
        let slots = bytes[start..self.nonce_offset() as usize]
            .chunks_exact(SLOT_LEN)
            .map(|c| c.try_into().expect("chunks_exact yields SLOT_LEN"))
            .collect();
        let nonce_start = self.nonce_offset() as usize;
        let nonce = u128::from_le_bytes(
            bytes[nonce_start..nonce_start + NONCE_LEN]
                .try_into()
                .expect("slice has NONCE_LEN"),
        );
        Ok(EncryptionState { nonce, slots })
    }

    /// Replaces the full slot set and nonce of a record in place.
    pub fn write_state(&self, bytes: &mut [u8], state: &EncryptionState) -> Result<(), StoreError> {
        self.check_len(bytes.len())?;
        if state.slots.len() != self.encrypted_fields as usize {
            return Err(StoreError::SlotCount {
                expected: self.encrypted_fields as usize,
                actual: state.slots.len(),
            });
        }
        let mut offset = self.ciphertext_offset() as usize;
        for slot in &state.slots {
            bytes[offset..offset + SLOT_LEN].copy_from_slice(slot);
            offset += SLOT_LEN;
        }
        bytes[offset..offset + NONCE_LEN].copy_from_slice(&state.nonce.to_le_bytes());
        Ok(())
    }

    fn check_len(&self, actual: usize) -> Result<(), StoreError> {
        if actual < self.len() {
            Err(StoreError::RecordTooShort {
                required: self.len(),
                actual,
            })
        } else {
            Ok(())
        }
    }
}

/// The nonce bookkeeping and ciphertext slots of a persistent record.
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptionState {
    /// The nonce the current slots are encrypted under.
    pub nonce: u128,
    /// One ciphertext per logical encrypted field.
    pub slots: Vec<Ciphertext>,
}

impl EncryptionState {
    /// The state of a freshly created record: zeroed slots and nonce `0`.
    pub fn zeroed(encrypted_fields: usize) -> Self {
        Self {
            nonce: 0,
            slots: vec![[0; SLOT_LEN]; encrypted_fields],
        }
    }
}

impl Debug for EncryptionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionState")
            .field("nonce", &self.nonce)
            .field("slots", &self.slots.len())
            .finish()
    }
}

/// Errors of the [`StateStore`].
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum StoreError {
    #[error("record {0} does not exist")]
    Missing(StoreKey),
    #[error("record {0} already exists")]
    AlreadyExists(StoreKey),
    #[error("record is {actual} bytes but layout requires {required}")]
    RecordTooShort { required: usize, actual: usize },
    #[error("expected {expected} ciphertext slots but got {actual}")]
    SlotCount { expected: usize, actual: usize },
}

/// A key-addressed byte store with atomic read-modify-write.
///
/// This is the callers' persistent record storage. The orchestration layer only
/// ever reads records and replaces the encrypted state of existing records.
pub trait StateStore: Send + Sync + 'static {
    /// Returns a copy of the record's bytes.
    fn read(&self, key: &StoreKey) -> Option<Vec<u8>>;

    /// Returns the namespace that owns the record.
    fn owner(&self, key: &StoreKey) -> Option<Namespace>;

    /// Atomically modifies a record.
    ///
    /// `f` operates on a copy of the record. The copy is only written back if
    /// `f` returns `Ok`, so a record is either fully updated or left untouched.
    fn modify<T, E>(&self, key: &StoreKey, f: impl FnOnce(&mut [u8]) -> Result<T, E>) -> Result<T, E>
    where
        E: From<StoreError>;
}

/// An in-memory [`StateStore`].
#[derive(Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<StoreKey, StoredRecord>>,
}

struct StoredRecord {
    owner: Namespace,
    bytes: Vec<u8>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates a new record. This is the caller's responsibility, not the
    /// orchestrator's.
    pub fn create(&self, key: StoreKey, owner: Namespace, bytes: Vec<u8>) -> Result<(), StoreError> {
        let mut records = self.records.write().expect("store lock poisoned");
        if records.contains_key(&key) {
            return Err(StoreError::AlreadyExists(key));
        }
        records.insert(key, StoredRecord { owner, bytes });
        Ok(())
    }

    /// Allocates a zeroed record with the given layout.
    pub fn create_zeroed(
        &self,
        key: StoreKey,
        owner: Namespace,
        layout: &RecordLayout,
    ) -> Result<(), StoreError> {
        self.create(key, owner, vec![0; layout.len()])
    }

    /// Removes a record, returning its bytes.
    pub fn remove(&self, key: &StoreKey) -> Option<Vec<u8>> {
        self.records
            .write()
            .expect("store lock poisoned")
            .remove(key)
            .map(|r| r.bytes)
    }
}

impl StateStore for MemoryStore {
    fn read(&self, key: &StoreKey) -> Option<Vec<u8>> {
        let records = self.records.read().expect("store lock poisoned");
        records.get(key).map(|r| r.bytes.clone())
    }

    fn owner(&self, key: &StoreKey) -> Option<Namespace> {
        let records = self.records.read().expect("store lock poisoned");
        records.get(key).map(|r| r.owner.clone())
    }

    fn modify<T, E>(&self, key: &StoreKey, f: impl FnOnce(&mut [u8]) -> Result<T, E>) -> Result<T, E>
    where
        E: From<StoreError>,
    {
        let mut records = self.records.write().expect("store lock poisoned");
        let record = records
            .get_mut(key)
            .ok_or_else(|| StoreError::Missing(key.clone()))?;
        let mut scratch = record.bytes.clone();
        let ret = f(&mut scratch)?;
        record.bytes = scratch;
        Ok(ret)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VAULT: RecordLayout = RecordLayout::new(8, 32, 3);

    #[test]
    fn layout_offsets() {
        assert_eq!(VAULT.ciphertext_offset(), 40);
        assert_eq!(VAULT.ciphertext_len(), 96);
        assert_eq!(VAULT.nonce_offset(), 136);
        assert_eq!(VAULT.len(), 152);
        match VAULT.external_read(StoreKey::derive("v")) {
            Segment::ExternalStateRead { offset, length, .. } => {
                assert_eq!((offset, length), (40, 96));
            }
            other => panic!("unexpected segment {other:?}"),
        }
    }

    #[test]
    fn state_write_then_read() {
        let mut bytes = vec![0xAA; VAULT.len()];
        let state = EncryptionState {
            nonce: 7,
            slots: vec![[1; 32], [2; 32], [3; 32]],
        };
        VAULT.write_state(&mut bytes, &state).unwrap();
        assert_eq!(VAULT.read_state(&bytes).unwrap(), state);
        // header and prefix are untouched
        assert!(bytes[..40].iter().all(|b| *b == 0xAA));
    }

    #[test]
    fn short_record_is_rejected() {
        let bytes = vec![0; VAULT.len() - 1];
        assert_eq!(
            VAULT.read_state(&bytes),
            Err(StoreError::RecordTooShort {
                required: 152,
                actual: 151
            })
        );
    }

    #[test]
    fn failed_modify_leaves_record_untouched() {
        let store = MemoryStore::new();
        let key = StoreKey::derive("vault/a");
        store
            .create_zeroed(key.clone(), Namespace::new("prog"), &VAULT)
            .unwrap();
        let res: Result<(), StoreError> = store.modify(&key, |bytes| {
            bytes[0] = 1;
            Err(StoreError::SlotCount {
                expected: 0,
                actual: 1,
            })
        });
        assert!(res.is_err());
        assert_eq!(store.read(&key).unwrap()[0], 0);

        let missing: Result<(), StoreError> =
            store.modify(&StoreKey::derive("nope"), |_| Ok(()));
        assert!(matches!(missing, Err(StoreError::Missing(_))));
    }
}
