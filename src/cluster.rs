//! An in-process stand-in for the remote MPC cluster.
//!
//! [`LocalCluster`] picks up queued records from the ledger, fetches and
//! hash-checks the circuit, evaluates a registered [`Circuit`] over the resolved
//! arguments, re-encrypts the results under fresh nonces and finalizes the
//! record with a signed [`ClusterResult`].
//!
//! The encryption used here is a keyed `blake3` stream, it only simulates the
//! data flow of the real cluster and provides no confidentiality against the
//! process running it. Faults can be injected with [`LocalCluster::inject`] to
//! exercise abort, timeout and verification paths.

use std::{
    collections::{HashMap, VecDeque},
    fmt::{self, Debug},
    sync::{Arc, Mutex},
    time::Duration,
};

use ed25519_dalek::Signature;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{
    definition::{CircuitHash, CircuitSource, DefinitionRegistry, FetchError, fetch_verified},
    encoding::Segment,
    ledger::{AbortReason, ComputationId, ComputationRecord, Ledger, Outcome, RecordKey},
    output::{EncryptedOutput, Output},
    store::{Ciphertext, SLOT_LEN, StateStore},
    verifier::{ClusterResult, ClusterSigner},
};

pub mod vault;

/// A resolved circuit input.
#[derive(Clone, PartialEq, Eq)]
pub enum Input {
    Scalar(u128),
    Ciphertext(Ciphertext),
    SharedKey { public_key: [u8; 32], nonce: u128 },
    /// The ciphertext region of an external record.
    State(Vec<Ciphertext>),
}

impl Input {
    pub fn scalar(&self) -> Result<u128, CircuitError> {
        match self {
            Input::Scalar(v) => Ok(*v),
            _ => Err(CircuitError::UnexpectedInput("scalar")),
        }
    }

    pub fn ciphertext(&self) -> Result<&Ciphertext, CircuitError> {
        match self {
            Input::Ciphertext(ct) => Ok(ct),
            _ => Err(CircuitError::UnexpectedInput("ciphertext")),
        }
    }

    pub fn shared_key(&self) -> Result<([u8; 32], u128), CircuitError> {
        match self {
            Input::SharedKey { public_key, nonce } => Ok((*public_key, *nonce)),
            _ => Err(CircuitError::UnexpectedInput("shared key")),
        }
    }

    pub fn state(&self) -> Result<&[Ciphertext], CircuitError> {
        match self {
            Input::State(slots) => Ok(slots),
            _ => Err(CircuitError::UnexpectedInput("external state")),
        }
    }
}

impl Debug for Input {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Input::Scalar(_) => f.write_str("Scalar(<REDACTED>)"),
            Input::Ciphertext(_) => f.write_str("Ciphertext"),
            Input::SharedKey { .. } => f.write_str("SharedKey"),
            Input::State(slots) => write!(f, "State({} slots)", slots.len()),
        }
    }
}

/// What a circuit returns before re-encryption.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Emit {
    /// Plaintext revealed to the caller.
    Reveal(Vec<u8>),
    /// Values encrypted to the cluster's own key, e.g. persistent vault state.
    Mxe(Vec<u128>),
    /// Values encrypted to a client's key.
    Shared {
        public_key: [u8; 32],
        values: Vec<u128>,
    },
    Tuple(Vec<Emit>),
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum CircuitError {
    #[error("expected {0} input")]
    UnexpectedInput(&'static str),
    #[error("expected {expected} inputs but got {actual}")]
    InputCount { expected: usize, actual: usize },
    #[error("ciphertext in slot {slot} does not decrypt")]
    InvalidCiphertext { slot: usize },
    #[error("{0}")]
    Rejected(String),
}

/// A stream cipher keyed per recipient, standing in for the cluster's re-encryption.
#[derive(Clone)]
pub struct StreamCipher {
    key: [u8; 32],
}

impl StreamCipher {
    pub fn new(key: [u8; 32]) -> Self {
        Self { key }
    }

    /// The cipher shared between the cluster and the holder of `public_key`.
    pub fn for_public_key(public_key: &[u8; 32]) -> Self {
        Self::new(blake3::derive_key("mpc-orchestrator shared cipher", public_key))
    }

    fn keystream(&self, nonce: u128, slot: usize) -> [u8; SLOT_LEN] {
        let mut hasher = blake3::Hasher::new_keyed(&self.key);
        hasher.update(&nonce.to_le_bytes());
        hasher.update(&(slot as u64).to_le_bytes());
        *hasher.finalize().as_bytes()
    }

    /// Encrypts `values` into consecutive slots under `nonce`.
    pub fn encrypt(&self, nonce: u128, values: &[u128]) -> Vec<Ciphertext> {
        values
            .iter()
            .enumerate()
            .map(|(slot, v)| {
                let mut ct = [0; SLOT_LEN];
                ct[..16].copy_from_slice(&v.to_le_bytes());
                ct.iter_mut()
                    .zip(self.keystream(nonce, slot))
                    .for_each(|(c, k)| *c ^= k);
                ct
            })
            .collect()
    }

    pub fn decrypt(&self, nonce: u128, slots: &[Ciphertext]) -> Result<Vec<u128>, CircuitError> {
        slots
            .iter()
            .enumerate()
            .map(|(slot, ct)| {
                let mut pt = *ct;
                pt.iter_mut()
                    .zip(self.keystream(nonce, slot))
                    .for_each(|(p, k)| *p ^= k);
                if pt[16..].iter().any(|b| *b != 0) {
                    return Err(CircuitError::InvalidCiphertext { slot });
                }
                Ok(u128::from_le_bytes(pt[..16].try_into().expect("16 bytes")))
            })
            .collect()
    }
}

impl Debug for StreamCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("StreamCipher(<REDACTED>)")
    }
}

/// Decryption capabilities available to a circuit during evaluation.
pub struct EvalContext<'a> {
    mxe: &'a StreamCipher,
}

impl EvalContext<'_> {
    pub fn decrypt_mxe(&self, nonce: u128, slots: &[Ciphertext]) -> Result<Vec<u128>, CircuitError> {
        self.mxe.decrypt(nonce, slots)
    }

    pub fn decrypt_shared(
        &self,
        public_key: &[u8; 32],
        nonce: u128,
        slots: &[Ciphertext],
    ) -> Result<Vec<u128>, CircuitError> {
        StreamCipher::for_public_key(public_key).decrypt(nonce, slots)
    }
}

/// The plaintext semantics of a circuit.
pub trait Circuit: Send + Sync + 'static {
    fn evaluate(&self, cx: &EvalContext<'_>, inputs: &[Input]) -> Result<Emit, CircuitError>;
}

/// A scripted misbehavior of the cluster, consumed by the next picked up record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// Finalize the record as aborted.
    Abort(AbortReason),
    /// Claim the record but never finalize it.
    Stall,
    /// Deliver a result with an invalid signature.
    CorruptSignature,
    /// Deliver a result attested for a different computation.
    WrongComputation,
    /// Re-encrypt under the nonce the first target record already holds.
    ReplayNonce,
    /// Execute normally but finalize only after the given delay.
    Delay(Duration),
}

/// A simulated MPC cluster polling a ledger.
pub struct LocalCluster<R, L, S, C> {
    signer: ClusterSigner,
    registry: Arc<R>,
    ledger: Arc<L>,
    store: Arc<S>,
    source: Arc<C>,
    circuits: HashMap<CircuitHash, Arc<dyn Circuit>>,
    mxe: StreamCipher,
    nonces: Mutex<ChaCha20Rng>,
    faults: Mutex<VecDeque<Fault>>,
    poll_interval: Duration,
}

impl<R, L, S, C> LocalCluster<R, L, S, C>
where
    R: DefinitionRegistry,
    L: Ledger,
    S: StateStore,
    C: CircuitSource,
{
    pub fn new(
        signer: ClusterSigner,
        registry: Arc<R>,
        ledger: Arc<L>,
        store: Arc<S>,
        source: Arc<C>,
    ) -> Self {
        let mut rng = ChaCha20Rng::from_seed(rand::random());
        let mxe = StreamCipher::new(rng.random());
        Self {
            signer,
            registry,
            ledger,
            store,
            source,
            circuits: HashMap::new(),
            mxe,
            nonces: Mutex::new(rng),
            faults: Mutex::new(VecDeque::new()),
            poll_interval: Duration::from_millis(10),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Installs the evaluator for the circuit with content `circuit`.
    pub fn install(mut self, circuit: &[u8], evaluator: impl Circuit) -> Self {
        self.circuits
            .insert(CircuitHash::of(circuit), Arc::new(evaluator));
        self
    }

    /// Schedules a fault for the next picked up record.
    pub fn inject(&self, fault: Fault) {
        self.faults.lock().expect("fault lock poisoned").push_back(fault);
    }

    /// Runs the polling loop until the task is aborted.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                if self.run_once().is_none() {
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        })
    }

    /// Picks up and executes at most one queued record.
    pub fn run_once(&self) -> Option<RecordKey> {
        let record = self.ledger.claim_next()?;
        let key = record.key.clone();
        let fault = self.faults.lock().expect("fault lock poisoned").pop_front();
        let outcome = match &fault {
            Some(Fault::Stall) => {
                debug!(%key, "stalling computation");
                return Some(key);
            }
            Some(Fault::Abort(reason)) => Outcome::Aborted(reason.clone()),
            _ => match self.execute(&record, fault.as_ref()) {
                Ok(result) => Outcome::Success(result),
                Err(reason) => Outcome::Aborted(reason),
            },
        };
        if let Some(Fault::Delay(delay)) = fault {
            debug!(%key, ?delay, "delaying finalization");
            let ledger = self.ledger.clone();
            let key = key.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                finalize(&*ledger, &key, outcome);
            });
        } else {
            finalize(&*self.ledger, &key, outcome);
        }
        Some(key)
    }

    fn execute(
        &self,
        record: &ComputationRecord,
        fault: Option<&Fault>,
    ) -> Result<ClusterResult, AbortReason> {
        let definition = self
            .registry
            .resolve(&record.definition)
            .map_err(|err| AbortReason::Other(err.to_string()))?;
        if !definition.circuit_hash.matches(&record.circuit_hash) {
            return Err(AbortReason::CircuitHashMismatch);
        }
        fetch_verified(&definition, &*self.source).map_err(|err| {
            warn!(key = %record.key, %err, "circuit fetch failed");
            match err {
                FetchError::HashMismatch { .. } => AbortReason::CircuitHashMismatch,
                _ => AbortReason::CircuitFetchFailed,
            }
        })?;
        let circuit = self
            .circuits
            .get(&definition.circuit_hash)
            .ok_or_else(|| AbortReason::Other(format!("no evaluator for {}", definition.name)))?;

        let inputs = self.resolve_inputs(record.args.segments())?;
        let emit = circuit
            .evaluate(&EvalContext { mxe: &self.mxe }, &inputs)
            .map_err(|err| {
                warn!(key = %record.key, %err, "circuit evaluation failed");
                AbortReason::Other(err.to_string())
            })?;

        let replay = match fault {
            Some(Fault::ReplayNonce) => Some(self.current_nonce(record)?),
            _ => None,
        };
        let output = self.seal(emit, replay);
        info!(key = %record.key, definition = %definition.name, "computation executed");

        let mut attested_key = record.key.clone();
        if fault == Some(&Fault::WrongComputation) {
            attested_key.id = ComputationId(attested_key.id.0.wrapping_add(1));
        }
        let mut result = self
            .signer
            .attest(&attested_key, definition.circuit_hash, output.encode());
        if fault == Some(&Fault::CorruptSignature) {
            let mut sig = result.attestation.signature.to_bytes();
            sig[0] ^= 1;
            result.attestation.signature = Signature::from_bytes(&sig);
        }
        Ok(result)
    }

    fn resolve_inputs(&self, segments: &[Segment]) -> Result<Vec<Input>, AbortReason> {
        let mut inputs = vec![];
        let mut segments = segments.iter().peekable();
        while let Some(segment) = segments.next() {
            let input = match segment {
                Segment::PlaintextScalar { value, .. } => Input::Scalar(*value),
                Segment::EncryptedScalar(ct) => Input::Ciphertext(*ct),
                Segment::SharedKeyMaterial(public_key) => match segments.next() {
                    Some(Segment::PlaintextScalar { value, .. }) => Input::SharedKey {
                        public_key: *public_key,
                        nonce: *value,
                    },
                    _ => return Err(AbortReason::Other("shared key without nonce".into())),
                },
                Segment::ExternalStateRead {
                    key,
                    offset,
                    length,
                } => {
                    let bytes = self
                        .store
                        .read(key)
                        .ok_or_else(|| AbortReason::Other(format!("record {key} is missing")))?;
                    let (start, end) = (*offset as usize, *offset as usize + *length as usize);
                    let region = bytes.get(start..end).ok_or_else(|| {
                        AbortReason::Other(format!("read of {key} is out of bounds"))
                    })?;
                    Input::State(
                        region
                            .chunks_exact(SLOT_LEN)
                            .map(|c| c.try_into().expect("chunks_exact yields SLOT_LEN"))
                            .collect(),
                    )
                }
            };
            inputs.push(input);
        }
        Ok(inputs)
    }

    fn current_nonce(&self, record: &ComputationRecord) -> Result<u128, AbortReason> {
        record
            .writable_targets()
            .find_map(|t| {
                let bytes = self.store.read(&t.key)?;
                t.layout?.read_state(&bytes).ok()
            })
            .map(|state| state.nonce)
            .ok_or_else(|| AbortReason::Other("no target to replay".into()))
    }

    fn fresh_nonce(&self) -> u128 {
        let mut rng = self.nonces.lock().expect("nonce lock poisoned");
        loop {
            let nonce: u128 = rng.random();
            if nonce != 0 {
                return nonce;
            }
        }
    }

    fn seal(&self, emit: Emit, replay: Option<u128>) -> Output {
        match emit {
            Emit::Reveal(bytes) => Output::Revealed(bytes),
            Emit::Mxe(values) => {
                let nonce = replay.unwrap_or_else(|| self.fresh_nonce());
                Output::Encrypted(EncryptedOutput {
                    ciphertexts: self.mxe.encrypt(nonce, &values),
                    nonce,
                })
            }
            Emit::Shared { public_key, values } => {
                let nonce = self.fresh_nonce();
                Output::Encrypted(EncryptedOutput {
                    ciphertexts: StreamCipher::for_public_key(&public_key).encrypt(nonce, &values),
                    nonce,
                })
            }
            Emit::Tuple(emits) => {
                Output::Tuple(emits.into_iter().map(|e| self.seal(e, replay)).collect())
            }
        }
    }
}

fn finalize<L: Ledger>(ledger: &L, key: &RecordKey, outcome: Outcome) {
    if let Err(err) = ledger.finalize(key, outcome) {
        warn!(%key, %err, "could not finalize computation");
    }
}

impl<R, L, S, C> Debug for LocalCluster<R, L, S, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalCluster")
            .field("signer", &self.signer)
            .field("circuits", &self.circuits.len())
            .field("poll_interval", &self.poll_interval)
            .finish_non_exhaustive()
    }
}
