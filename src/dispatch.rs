//! Delivery of finalized results to the awaiting caller.
//!
//! The dispatcher keeps the set of computations a caller still awaits. A result
//! for an identifier that is not awaited, either because it was never queued
//! here or because a retry superseded it, is ignored and never mutates state.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use tracing::{debug, info};

use crate::{
    definition::ComputationDefinition,
    ledger::{ComputationRecord, RecordKey},
    mutator::{StateConsistencyFault, StateMutator},
    output::CallbackOutput,
    store::StateStore,
    verifier::{AbortedComputation, CallbackVerifier, ClusterResult},
};

/// What happened to a delivered result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// The result verified and its encrypted elements were written.
    Applied(CallbackOutput),
    /// The result was for a computation that is no longer awaited.
    Ignored,
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error(transparent)]
    Aborted(#[from] AbortedComputation),
    #[error(transparent)]
    Fault(#[from] StateConsistencyFault),
}

struct Awaited {
    record: Arc<ComputationRecord>,
    definition: Arc<ComputationDefinition>,
}

/// Routes cluster results through verification into state mutation.
pub struct CallbackDispatcher<S> {
    verifier: CallbackVerifier,
    mutator: StateMutator<S>,
    pending: Mutex<HashMap<RecordKey, Awaited>>,
}

impl<S: StateStore> CallbackDispatcher<S> {
    pub fn new(verifier: CallbackVerifier, mutator: StateMutator<S>) -> Self {
        Self {
            verifier,
            mutator,
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn verifier(&self) -> &CallbackVerifier {
        &self.verifier
    }

    /// Starts awaiting the result of `record`.
    pub fn expect(&self, record: Arc<ComputationRecord>, definition: Arc<ComputationDefinition>) {
        debug!(key = %record.key, "awaiting result");
        let mut pending = self.pending.lock().expect("dispatcher lock poisoned");
        pending.insert(record.key.clone(), Awaited { record, definition });
    }

    /// Stops awaiting `key`. A result delivered later is ignored.
    pub fn abandon(&self, key: &RecordKey) -> bool {
        let mut pending = self.pending.lock().expect("dispatcher lock poisoned");
        let abandoned = pending.remove(key).is_some();
        if abandoned {
            debug!(%key, "abandoned computation");
        }
        abandoned
    }

    pub fn is_awaiting(&self, key: &RecordKey) -> bool {
        let pending = self.pending.lock().expect("dispatcher lock poisoned");
        pending.contains_key(key)
    }

    /// Verifies and applies a result for `key`.
    ///
    /// Every result is delivered at most once, the key stops being awaited
    /// regardless of whether verification succeeds.
    pub fn deliver(&self, key: &RecordKey, result: &ClusterResult) -> Result<Delivery, DispatchError> {
        let awaited = {
            let mut pending = self.pending.lock().expect("dispatcher lock poisoned");
            pending.remove(key)
        };
        let Some(Awaited { record, definition }) = awaited else {
            info!(%key, "ignoring result for computation that is not awaited");
            return Ok(Delivery::Ignored);
        };
        let output = self.verifier.verify(&record, &definition, result)?;
        self.mutator.apply(&record, &output)?;
        debug!(%key, "applied result");
        Ok(Delivery::Applied(output))
    }
}

#[cfg(test)]
mod tests {
    use std::time::SystemTime;

    use super::*;
    use crate::{
        definition::CircuitSignature,
        encoding::EncodedArgument,
        ledger::{ComputationId, Namespace, OutputTarget},
        output::{EncryptedOutput, Output, OutputShape},
        store::{MemoryStore, RecordLayout, StoreKey},
        verifier::{ClusterId, ClusterSigner},
    };

    const VAULT: RecordLayout = RecordLayout::new(8, 0, 1);

    struct Fixture {
        signer: ClusterSigner,
        dispatcher: CallbackDispatcher<MemoryStore>,
        store: Arc<MemoryStore>,
        definition: Arc<ComputationDefinition>,
    }

    fn fixture() -> Fixture {
        let signer = ClusterSigner::from_seed(ClusterId(1), [3; 32]);
        let store = Arc::new(MemoryStore::new());
        store
            .create_zeroed(StoreKey::derive("vault"), Namespace::new("vaults"), &VAULT)
            .unwrap();
        let dispatcher = CallbackDispatcher::new(
            CallbackVerifier::new(signer.key()),
            StateMutator::new(store.clone()),
        );
        let definition = Arc::new(ComputationDefinition::new(
            "bump",
            b"bump circuit",
            "mem://bump",
            CircuitSignature {
                params: vec![],
                returns: OutputShape::Encrypted { slots: 1 },
            },
        ));
        Fixture {
            signer,
            dispatcher,
            store,
            definition,
        }
    }

    fn record(f: &Fixture, id: u64) -> Arc<ComputationRecord> {
        Arc::new(ComputationRecord {
            key: RecordKey {
                namespace: Namespace::new("vaults"),
                id: ComputationId(id),
            },
            definition: f.definition.name.clone(),
            circuit_hash: f.definition.circuit_hash,
            args: EncodedArgument::default(),
            routing: vec![OutputTarget::writable(StoreKey::derive("vault"), VAULT)],
            created_at: SystemTime::now(),
        })
    }

    fn result(f: &Fixture, record: &ComputationRecord, nonce: u128) -> ClusterResult {
        let raw = Output::Encrypted(EncryptedOutput {
            ciphertexts: vec![[nonce as u8; 32]],
            nonce,
        })
        .encode();
        f.signer.attest(&record.key, f.definition.circuit_hash, raw)
    }

    fn nonce(f: &Fixture) -> u128 {
        let bytes = f.store.read(&StoreKey::derive("vault")).unwrap();
        VAULT.read_state(&bytes).unwrap().nonce
    }

    #[test]
    fn awaited_result_is_applied_once() {
        let f = fixture();
        let record = record(&f, 1);
        f.dispatcher.expect(record.clone(), f.definition.clone());
        let res = result(&f, &record, 7);
        assert!(matches!(
            f.dispatcher.deliver(&record.key, &res),
            Ok(Delivery::Applied(_))
        ));
        assert_eq!(nonce(&f), 7);
        assert_eq!(f.dispatcher.deliver(&record.key, &res), Ok(Delivery::Ignored));
    }

    #[test]
    fn superseded_result_is_ignored() {
        let f = fixture();
        let first = record(&f, 1);
        let second = record(&f, 2);
        f.dispatcher.expect(first.clone(), f.definition.clone());
        f.dispatcher.abandon(&first.key);
        f.dispatcher.expect(second.clone(), f.definition.clone());

        assert_eq!(
            f.dispatcher.deliver(&first.key, &result(&f, &first, 5)),
            Ok(Delivery::Ignored)
        );
        assert_eq!(nonce(&f), 0);
        assert!(f.dispatcher.is_awaiting(&second.key));
    }

    #[test]
    fn unverified_result_aborts() {
        let f = fixture();
        let record = record(&f, 1);
        f.dispatcher.expect(record.clone(), f.definition.clone());
        let mut res = result(&f, &record, 5);
        res.raw_output[0] ^= 0xff;
        assert_eq!(
            f.dispatcher.deliver(&record.key, &res),
            Err(DispatchError::Aborted(AbortedComputation))
        );
        assert_eq!(nonce(&f), 0);
    }
}
