//! Application of verified outputs to the caller's records.

use std::{collections::HashSet, sync::Arc};

use tracing::{debug, error};

use crate::{
    ledger::ComputationRecord,
    output::{CallbackOutput, EncryptedOutput},
    store::{RecordLayout, StateStore, StoreError, StoreKey},
};

/// A verified output could not be applied consistently.
///
/// This is an invariant violation, not an expected runtime condition. Every
/// target record is either fully updated or left untouched.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum StateConsistencyFault {
    #[error("target record {0} no longer exists")]
    TargetVanished(StoreKey),
    #[error("{elements} encrypted output elements for {targets} writable targets")]
    ElementCount { elements: usize, targets: usize },
    #[error("output for {key} has {actual} slots, the record has {expected}")]
    SlotCount {
        key: StoreKey,
        expected: usize,
        actual: usize,
    },
    #[error("target record {0} is routed more than once")]
    DuplicateTarget(StoreKey),
    #[error("output for {key} reuses nonce {nonce}")]
    NonceNotAdvanced { key: StoreKey, nonce: u128 },
    #[error("record {key} is {actual} bytes but its layout requires {required}")]
    RecordTooShort {
        key: StoreKey,
        required: usize,
        actual: usize,
    },
}

/// Writes re-encrypted output elements into their target records.
pub struct StateMutator<S> {
    store: Arc<S>,
}

impl<S: StateStore> StateMutator<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Writes the i-th encrypted element of `output` into the i-th writable
    /// target of `record`, replacing its full slot set and its nonce.
    ///
    /// All targets are checked before any of them is written.
    pub fn apply(
        &self,
        record: &ComputationRecord,
        output: &CallbackOutput,
    ) -> Result<(), StateConsistencyFault> {
        self.try_apply(record, output).inspect_err(|fault| {
            error!(key = %record.key, %fault, "state consistency fault");
        })
    }

    fn try_apply(
        &self,
        record: &ComputationRecord,
        output: &CallbackOutput,
    ) -> Result<(), StateConsistencyFault> {
        let elements = output.encrypted_elements();
        let targets: Vec<_> = record
            .writable_targets()
            .map(|t| (&t.key, t.layout.unwrap_or(RecordLayout::new(0, 0, 0))))
            .collect();
        if elements.len() != targets.len() {
            return Err(StateConsistencyFault::ElementCount {
                elements: elements.len(),
                targets: targets.len(),
            });
        }
        let mut seen = HashSet::new();
        if let Some((key, _)) = targets.iter().find(|(key, _)| !seen.insert(*key)) {
            return Err(StateConsistencyFault::DuplicateTarget((*key).clone()));
        }
        for ((key, layout), element) in targets.iter().zip(&elements) {
            self.check(key, layout, element)?;
        }
        for ((key, layout), element) in targets.iter().zip(&elements) {
            let state = element.to_state();
            // the record may have changed since it was checked
            self.store
                .modify(key, |bytes| {
                    let current = layout.read_state(bytes)?;
                    if current.nonce == state.nonce {
                        return Err(WriteFailure::NonceNotAdvanced);
                    }
                    Ok(layout.write_state(bytes, &state)?)
                })
                .map_err(|failure| match failure {
                    WriteFailure::Store(err) => fault(key, err),
                    WriteFailure::NonceNotAdvanced => StateConsistencyFault::NonceNotAdvanced {
                        key: (*key).clone(),
                        nonce: element.nonce,
                    },
                })?;
            debug!(%key, nonce = element.nonce, "replaced encrypted state");
        }
        Ok(())
    }

    fn check(
        &self,
        key: &StoreKey,
        layout: &RecordLayout,
        element: &EncryptedOutput,
    ) -> Result<(), StateConsistencyFault> {
        let bytes = self
            .store
            .read(key)
            .ok_or_else(|| StateConsistencyFault::TargetVanished(key.clone()))?;
        if element.ciphertexts.len() != layout.encrypted_fields as usize {
            return Err(StateConsistencyFault::SlotCount {
                key: key.clone(),
                expected: layout.encrypted_fields as usize,
                actual: element.ciphertexts.len(),
            });
        }
        let current = layout.read_state(&bytes).map_err(|err| fault(key, err))?;
        if current.nonce == element.nonce {
            return Err(StateConsistencyFault::NonceNotAdvanced {
                key: key.clone(),
                nonce: element.nonce,
            });
        }
        Ok(())
    }
}

enum WriteFailure {
    Store(StoreError),
    NonceNotAdvanced,
}

impl From<StoreError> for WriteFailure {
    fn from(err: StoreError) -> Self {
        WriteFailure::Store(err)
    }
}

fn fault(key: &StoreKey, err: StoreError) -> StateConsistencyFault {
    match err {
        StoreError::RecordTooShort { required, actual } => StateConsistencyFault::RecordTooShort {
            key: key.clone(),
            required,
            actual,
        },
        StoreError::SlotCount { expected, actual } => StateConsistencyFault::SlotCount {
            key: key.clone(),
            expected,
            actual,
        },
        StoreError::Missing(key) | StoreError::AlreadyExists(key) => {
            StateConsistencyFault::TargetVanished(key)
        }
    }
}
