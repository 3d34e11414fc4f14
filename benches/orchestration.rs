use std::{
    hint::black_box,
    sync::Arc,
    time::{Duration, Instant, SystemTime},
};

use criterion::{BenchmarkId, Criterion, Throughput};
use mpc_orchestrator::{
    cluster::{
        LocalCluster, StreamCipher,
        vault::{self, InitVault, VAULT_LAYOUT},
    },
    definition::{MemoryCircuitSource, MemoryRegistry, ensure_registered},
    dispatch::CallbackDispatcher,
    encoding::{self, ArgumentBuilder, Param, ScalarType, Value},
    ledger::{ComputationId, ComputationRecord, MemoryLedger, Namespace, OutputTarget, RecordKey},
    mutator::StateMutator,
    output::{EncryptedOutput, Output},
    retry::{Backoff, RetryOrchestrator, RetryPolicy},
    scheduler::{QueueRequest, Scheduler},
    store::{MemoryStore, StoreKey},
    verifier::{CallbackVerifier, ClusterId, ClusterSigner},
};
use tokio::runtime::Runtime;

const LOCATION: &str = "mem://circuits/init_vault";

pub fn encoding_benchmark(c: &mut Criterion) {
    let mut g = c.benchmark_group("encoding");
    for fields in [4usize, 64, 1024] {
        let params: Vec<_> = (0..fields)
            .map(|i| match i % 3 {
                0 => Param::Plaintext(ScalarType::U64),
                1 => Param::Encrypted(ScalarType::U128),
                _ => Param::Tuple(vec![Param::SharedKey, Param::Encrypted(ScalarType::U8)]),
            })
            .collect();
        let values: Vec<_> = (0..fields)
            .map(|i| match i % 3 {
                0 => Value::U64(i as u64),
                1 => Value::Ciphertext([i as u8; 32]),
                _ => Value::Tuple(vec![
                    Value::SharedKey {
                        public_key: [7; 32],
                        nonce: i as u128,
                    },
                    Value::Ciphertext([0; 32]),
                ]),
            })
            .collect();
        let arg = encoding::encode(&params, &values).expect("values match params");

        g.throughput(Throughput::Elements(fields as u64));
        g.bench_function(BenchmarkId::new("encode", fields), |b| {
            b.iter(|| encoding::encode(black_box(&params), black_box(&values)))
        });
        g.bench_function(BenchmarkId::new("validate", fields), |b| {
            b.iter(|| encoding::validate(black_box(&params), black_box(&arg)))
        });
    }
    g.finish();
}

pub fn verification_benchmark(c: &mut Criterion) {
    let definition = vault::init_vault_definition(LOCATION);
    let vault = StoreKey::derive("bench/vault");
    let record = ComputationRecord {
        key: RecordKey {
            namespace: Namespace::new("bench"),
            id: ComputationId(1),
        },
        definition: definition.name.clone(),
        circuit_hash: definition.circuit_hash,
        args: ArgumentBuilder::new().build(),
        routing: vec![OutputTarget::writable(vault, VAULT_LAYOUT)],
        created_at: SystemTime::now(),
    };
    let output = Output::Encrypted(EncryptedOutput {
        ciphertexts: StreamCipher::new([3; 32]).encrypt(9, &[0, 0]),
        nonce: 9,
    });
    let signer = ClusterSigner::from_seed(ClusterId(1), [5; 32]);
    let result = signer.attest(&record.key, definition.circuit_hash, output.encode());
    let verifier = CallbackVerifier::new(signer.key());

    c.bench_function("verify callback", |b| {
        b.iter(|| verifier.check(black_box(&record), &definition, black_box(&result)))
    });
}

pub fn round_trip_benchmark(c: &mut Criterion) {
    // Default runtime for "full" feature is multi-threaded
    let rt = Runtime::new().expect("runtime");

    c.bench_function("init_vault round trip", |b| {
        b.to_async(&rt).iter_custom(|iters| async move {
            let namespace = Namespace::new("bench");
            let registry = Arc::new(MemoryRegistry::new());
            let ledger = Arc::new(MemoryLedger::new());
            let store = Arc::new(MemoryStore::new());
            let source = Arc::new(MemoryCircuitSource::new());
            source.publish(LOCATION, vault::INIT_VAULT_CIRCUIT.to_vec());
            ensure_registered(&*registry, vault::init_vault_definition(LOCATION))
                .expect("fresh registry");
            let vault = StoreKey::derive("bench/vault");
            store
                .create_zeroed(vault.clone(), namespace.clone(), &VAULT_LAYOUT)
                .expect("fresh store");

            let signer = ClusterSigner::generate(ClusterId(1));
            let dispatcher = Arc::new(CallbackDispatcher::new(
                CallbackVerifier::new(signer.key()),
                StateMutator::new(store.clone()),
            ));
            let cluster = Arc::new(
                LocalCluster::new(
                    signer,
                    registry.clone(),
                    ledger.clone(),
                    store.clone(),
                    source,
                )
                .with_poll_interval(Duration::from_micros(100))
                .install(vault::INIT_VAULT_CIRCUIT, InitVault),
            );
            let handle = cluster.spawn();
            let scheduler = Scheduler::new(namespace, registry.clone(), ledger.clone(), store);
            let orchestrator = RetryOrchestrator::new(scheduler, registry, ledger, dispatcher);
            let policy = RetryPolicy {
                max_attempts: 1,
                finalization_timeout: Duration::from_secs(10),
                backoff: Backoff::default(),
            };

            let now = Instant::now();
            for _ in 0..iters {
                orchestrator
                    .run(
                        vault::INIT_VAULT,
                        |id| {
                            Ok(QueueRequest {
                                id,
                                definition: vault::INIT_VAULT.into(),
                                args: ArgumentBuilder::new().build(),
                                routing: vec![OutputTarget::writable(vault.clone(), VAULT_LAYOUT)],
                            })
                        },
                        &policy,
                    )
                    .await
                    .expect("round trip failed");
            }
            let elapsed = now.elapsed();
            handle.abort();
            elapsed
        })
    });
}
