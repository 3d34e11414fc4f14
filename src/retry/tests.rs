use std::{
    collections::{HashSet, VecDeque},
    sync::{Arc, Mutex},
    time::Duration,
};

use tracing_subscriber::{EnvFilter, util::SubscriberInitExt};

use super::*;
use crate::{
    definition::{CircuitSignature, ComputationDefinition, MemoryRegistry, ensure_registered},
    encoding::{ArgumentBuilder, Param},
    ledger::{MemoryLedger, Namespace, OutputTarget, RecordKey, RecordStatus},
    mutator::StateMutator,
    output::{EncryptedOutput, Output, OutputShape},
    store::{MemoryStore, RecordLayout, StoreKey},
    verifier::{CallbackVerifier, ClusterId, ClusterSigner},
};

const VAULT: RecordLayout = RecordLayout::new(8, 32, 2);

#[derive(Default)]
struct RecordingIdentifiers(Mutex<Vec<ComputationId>>);

impl IdentifierSource for RecordingIdentifiers {
    fn new_identifier(&self) -> ComputationId {
        let id = RandomIdentifiers.new_identifier();
        self.0.lock().unwrap().push(id);
        id
    }
}

type TestOrchestrator =
    RetryOrchestrator<MemoryRegistry, MemoryLedger, MemoryStore, Arc<RecordingIdentifiers>>;

struct Harness {
    orchestrator: TestOrchestrator,
    ids: Arc<RecordingIdentifiers>,
    ledger: Arc<MemoryLedger>,
    store: Arc<MemoryStore>,
    definition: Arc<ComputationDefinition>,
}

fn harness() -> Harness {
    let registry = Arc::new(MemoryRegistry::new());
    let definition = ComputationDefinition::new(
        "init_vault",
        b"init_vault circuit",
        "mem://init_vault",
        CircuitSignature {
            params: vec![Param::Authority],
            returns: OutputShape::Encrypted { slots: 2 },
        },
    );
    ensure_registered(&*registry, definition.clone()).unwrap();
    let ledger = Arc::new(MemoryLedger::new());
    let store = Arc::new(MemoryStore::new());
    store
        .create_zeroed(StoreKey::derive("vault"), Namespace::new("vaults"), &VAULT)
        .unwrap();
    let signer = ClusterSigner::from_seed(ClusterId(1), [1; 32]);
    let dispatcher = Arc::new(CallbackDispatcher::new(
        CallbackVerifier::new(signer.key()),
        StateMutator::new(store.clone()),
    ));
    let scheduler = Scheduler::new(
        Namespace::new("vaults"),
        registry.clone(),
        ledger.clone(),
        store.clone(),
    );
    let ids = Arc::new(RecordingIdentifiers::default());
    Harness {
        orchestrator: RetryOrchestrator::with_identifiers(
            scheduler,
            registry,
            ledger.clone(),
            dispatcher,
            ids.clone(),
        ),
        ids,
        ledger,
        store,
        definition: Arc::new(definition),
    }
}

/// Finalizes claimed records with scripted outcomes. `None` succeeds, an empty
/// script leaves records executing.
fn scripted_cluster(h: &Harness, script: Vec<Option<AbortReason>>) {
    let ledger = h.ledger.clone();
    let hash = h.definition.circuit_hash;
    let mut script = VecDeque::from(script);
    let signer = ClusterSigner::from_seed(ClusterId(1), [1; 32]);
    tokio::spawn(async move {
        let mut nonce = 0u128;
        loop {
            let Some(record) = ledger.claim_next() else {
                tokio::time::sleep(Duration::from_millis(1)).await;
                continue;
            };
            let Some(step) = script.pop_front() else {
                continue;
            };
            let outcome = match step {
                Some(reason) => Outcome::Aborted(reason),
                None => {
                    nonce += 1;
                    let raw = Output::Encrypted(EncryptedOutput {
                        ciphertexts: vec![[nonce as u8; 32]; 2],
                        nonce,
                    })
                    .encode();
                    Outcome::Success(signer.attest(&record.key, hash, raw))
                }
            };
            ledger.finalize(&record.key, outcome).unwrap();
        }
    });
}

fn request(id: ComputationId) -> Result<QueueRequest, EncodingError> {
    Ok(QueueRequest {
        id,
        definition: "init_vault".into(),
        args: ArgumentBuilder::new().build(),
        routing: vec![OutputTarget::writable(StoreKey::derive("vault"), VAULT)],
    })
}

fn fast_policy(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        finalization_timeout: Duration::from_secs(5),
        backoff: Backoff {
            initial: Duration::from_millis(1),
            multiplier: 2,
            max: Duration::from_millis(4),
        },
    }
}

fn key(id: ComputationId) -> RecordKey {
    RecordKey {
        namespace: Namespace::new("vaults"),
        id,
    }
}

#[tokio::test]
async fn retries_with_fresh_identifiers_until_success() {
    let _g = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .set_default();

    let h = harness();
    scripted_cluster(
        &h,
        vec![
            Some(AbortReason::CheatDetected),
            Some(AbortReason::CircuitFetchFailed),
            Some(AbortReason::CheatDetected),
            None,
        ],
    );
    let output = h
        .orchestrator
        .run("init_vault", request, &fast_policy(5))
        .await
        .unwrap();
    assert_eq!(output.encrypted_elements()[0].nonce, 1);

    let ids = h.ids.0.lock().unwrap().clone();
    assert_eq!(ids.len(), 4);
    assert_eq!(ids.iter().collect::<HashSet<_>>().len(), 4);
    for id in &ids[..3] {
        assert!(matches!(
            h.ledger.status(&key(*id)),
            Some(RecordStatus::Finalized(Outcome::Aborted(_)))
        ));
    }
    let bytes = h.store.read(&StoreKey::derive("vault")).unwrap();
    assert_eq!(VAULT.read_state(&bytes).unwrap().nonce, 1);
}

#[tokio::test]
async fn exhausted_retries_carry_last_abort() {
    let h = harness();
    scripted_cluster(
        &h,
        vec![
            Some(AbortReason::CircuitHashMismatch),
            Some(AbortReason::CheatDetected),
            Some(AbortReason::CheatDetected),
        ],
    );
    assert_eq!(
        h.orchestrator
            .run("init_vault", request, &fast_policy(3))
            .await,
        Err(RetryError::RetriesExhausted {
            attempts: 3,
            last_abort: AbortReason::CheatDetected
        })
    );
}

#[tokio::test(start_paused = true)]
async fn unfinalized_attempts_time_out() {
    let h = harness();
    let mut policy = fast_policy(2);
    policy.finalization_timeout = Duration::from_secs(120);
    assert_eq!(
        h.orchestrator.run("init_vault", request, &policy).await,
        Err(RetryError::RetriesExhausted {
            attempts: 2,
            last_abort: AbortReason::Timeout
        })
    );
    // abandoned records stay on the ledger and are no longer awaited
    for id in h.ids.0.lock().unwrap().iter() {
        assert_eq!(h.ledger.status(&key(*id)), Some(RecordStatus::Queued));
        assert!(!h.orchestrator.dispatcher().is_awaiting(&key(*id)));
    }
}

#[tokio::test]
async fn encoding_errors_are_not_retried() {
    let h = harness();
    let res = h
        .orchestrator
        .run(
            "init_vault",
            |_| Err(EncodingError::MissingNonce { param: 0 }),
            &fast_policy(5),
        )
        .await;
    assert_eq!(
        res,
        Err(RetryError::Encoding(EncodingError::MissingNonce { param: 0 }))
    );
    assert_eq!(h.ids.0.lock().unwrap().len(), 1);
    assert_eq!(h.ledger.mempool_len(), 0);
}

#[tokio::test]
async fn request_must_use_minted_identifier() {
    let h = harness();
    let res = h
        .orchestrator
        .run(
            "init_vault",
            |_| request(ComputationId(42)),
            &fast_policy(5),
        )
        .await;
    assert!(matches!(res, Err(RetryError::RequestMismatch { .. })));
    assert_eq!(h.ledger.mempool_len(), 0);
}

#[test]
fn backoff_is_capped() {
    let backoff = Backoff::default();
    let delays: Vec<_> = (1..=7).map(|a| backoff.delay(a).as_millis()).collect();
    assert_eq!(delays, vec![500, 1000, 2000, 4000, 8000, 10000, 10000]);
    assert_eq!(backoff.delay(u32::MAX), Duration::from_secs(10));
}
