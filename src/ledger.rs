//! The computation ledger: durable storage of queued, executing and finalized computations.
//!
//! Each [`ComputationRecord`] moves through `Queued -> Executing -> Finalized`.
//! No transition may be skipped and a finalized record never changes again.
//! Records are keyed by the caller's [`Namespace`] and a caller-chosen
//! [`ComputationId`] that is used for exactly one attempt.

use std::{
    collections::{HashMap, VecDeque},
    fmt::{self, Debug},
    sync::{Arc, Mutex},
    time::SystemTime,
};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::{
    definition::CircuitHash,
    encoding::EncodedArgument,
    store::{RecordLayout, StoreKey},
    verifier::ClusterResult,
};

/// The calling program, scoping computation identifiers and owning records.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Namespace(String);

impl Namespace {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Debug for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Namespace({})", self.0)
    }
}

/// A single-use computation identifier (the "offset").
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ComputationId(pub u64);

impl fmt::Display for ComputationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl Debug for ComputationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ComputationId({self})")
    }
}

/// The ledger address of a computation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordKey {
    pub namespace: Namespace,
    pub id: ComputationId,
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.id)
    }
}

/// A record the output of a computation is routed to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputTarget {
    pub key: StoreKey,
    /// Writable targets receive one re-encrypted output element each, in order.
    pub writable: bool,
    /// Layout of a writable target, used to place ciphertexts and nonce.
    pub layout: Option<RecordLayout>,
}

impl OutputTarget {
    pub fn writable(key: StoreKey, layout: RecordLayout) -> Self {
        Self {
            key,
            writable: true,
            layout: Some(layout),
        }
    }

    pub fn read_only(key: StoreKey) -> Self {
        Self {
            key,
            writable: false,
            layout: None,
        }
    }
}

/// A queued computation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputationRecord {
    pub key: RecordKey,
    /// Name of the computation definition.
    pub definition: String,
    /// Circuit hash of the definition at queue time.
    pub circuit_hash: CircuitHash,
    pub args: EncodedArgument,
    pub routing: Vec<OutputTarget>,
    pub created_at: SystemTime,
}

impl ComputationRecord {
    /// Writable targets in routing order.
    pub fn writable_targets(&self) -> impl Iterator<Item = &OutputTarget> {
        self.routing.iter().filter(|t| t.writable)
    }
}

/// Why a computation did not produce a trusted result.
///
/// These causes are logged, but callers only act on the fact that the
/// computation aborted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[non_exhaustive]
pub enum AbortReason {
    #[error("cluster detected a cheating participant")]
    CheatDetected,
    #[error("circuit could not be fetched")]
    CircuitFetchFailed,
    #[error("fetched circuit does not match the registered hash")]
    CircuitHashMismatch,
    #[error("cluster result did not verify")]
    VerificationFailed,
    #[error("computation was not finalized in time")]
    Timeout,
    #[error("{0}")]
    Other(String),
}

/// The terminal outcome of a computation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success(ClusterResult),
    Aborted(AbortReason),
}

/// The lifecycle state of a computation record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordStatus {
    Queued,
    Executing,
    Finalized(Outcome),
}

impl RecordStatus {
    pub fn is_finalized(&self) -> bool {
        matches!(self, RecordStatus::Finalized(_))
    }

    fn name(&self) -> &'static str {
        match self {
            RecordStatus::Queued => "Queued",
            RecordStatus::Executing => "Executing",
            RecordStatus::Finalized(_) => "Finalized",
        }
    }
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum LedgerError {
    #[error("computation {0} already exists")]
    DuplicateIdentifier(RecordKey),
    #[error("computation {0} does not exist")]
    UnknownIdentifier(RecordKey),
    #[error("computation {key} cannot transition from {from} to {to}")]
    InvalidTransition {
        key: RecordKey,
        from: &'static str,
        to: &'static str,
    },
}

/// Durable storage of computation records, shared with the cluster.
pub trait Ledger: Send + Sync + 'static {
    /// Atomically appends a new `Queued` record.
    ///
    /// Fails if a record with the same key exists, finalized or not.
    fn append(&self, record: ComputationRecord) -> Result<Arc<ComputationRecord>, LedgerError>;

    /// Claims the oldest queued record for execution (`Queued -> Executing`).
    fn claim_next(&self) -> Option<Arc<ComputationRecord>>;

    /// Finalizes an executing record.
    ///
    /// Finalizing an already finalized record with the identical outcome is a
    /// no-op, any other outcome is rejected.
    fn finalize(&self, key: &RecordKey, outcome: Outcome) -> Result<(), LedgerError>;

    /// The current status of a record.
    fn status(&self, key: &RecordKey) -> Option<RecordStatus>;

    /// Subscribes to status changes of a record.
    fn subscribe(&self, key: &RecordKey) -> Result<watch::Receiver<RecordStatus>, LedgerError>;

    /// Waits until the record is finalized and returns its outcome.
    fn wait_finalized(
        &self,
        key: &RecordKey,
    ) -> impl Future<Output = Result<Outcome, LedgerError>> + Send {
        let rx = self.subscribe(key);
        let key = key.clone();
        async move {
            let mut rx = rx?;
            let status = rx
                .wait_for(RecordStatus::is_finalized)
                .await
                .map_err(|_| LedgerError::UnknownIdentifier(key))?
                .clone();
            match status {
                RecordStatus::Finalized(outcome) => Ok(outcome),
                _ => unreachable!("wait_for only returns finalized status"),
            }
        }
    }
}

struct Entry {
    record: Arc<ComputationRecord>,
    status: watch::Sender<RecordStatus>,
}

#[derive(Default)]
struct LedgerInner {
    records: HashMap<RecordKey, Entry>,
    mempool: VecDeque<RecordKey>,
}

/// An in-memory [`Ledger`].
#[derive(Default)]
pub struct MemoryLedger {
    inner: Mutex<LedgerInner>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records waiting for pickup.
    pub fn mempool_len(&self) -> usize {
        self.inner.lock().expect("ledger lock poisoned").mempool.len()
    }

    /// Removes all finalized records, returning how many were removed.
    pub fn prune_finalized(&self) -> usize {
        let mut inner = self.inner.lock().expect("ledger lock poisoned");
        let before = inner.records.len();
        inner
            .records
            .retain(|_, entry| !entry.status.borrow().is_finalized());
        let pruned = before - inner.records.len();
        debug!(pruned, "pruned finalized computations");
        pruned
    }
}

impl Ledger for MemoryLedger {
    fn append(&self, record: ComputationRecord) -> Result<Arc<ComputationRecord>, LedgerError> {
        let mut inner = self.inner.lock().expect("ledger lock poisoned");
        if inner.records.contains_key(&record.key) {
            return Err(LedgerError::DuplicateIdentifier(record.key));
        }
        let key = record.key.clone();
        let record = Arc::new(record);
        let (status, _) = watch::channel(RecordStatus::Queued);
        inner.records.insert(
            key.clone(),
            Entry {
                record: record.clone(),
                status,
            },
        );
        inner.mempool.push_back(key.clone());
        debug!(%key, definition = %record.definition, "queued computation");
        Ok(record)
    }

    fn claim_next(&self) -> Option<Arc<ComputationRecord>> {
        let mut inner = self.inner.lock().expect("ledger lock poisoned");
        while let Some(key) = inner.mempool.pop_front() {
            // pruned or otherwise gone records are skipped
            let Some(entry) = inner.records.get(&key) else {
                continue;
            };
            if *entry.status.borrow() == RecordStatus::Queued {
                entry.status.send_replace(RecordStatus::Executing);
                debug!(%key, "computation executing");
                return Some(entry.record.clone());
            }
        }
        None
    }

    fn finalize(&self, key: &RecordKey, outcome: Outcome) -> Result<(), LedgerError> {
        let inner = self.inner.lock().expect("ledger lock poisoned");
        let entry = inner
            .records
            .get(key)
            .ok_or_else(|| LedgerError::UnknownIdentifier(key.clone()))?;
        let current = entry.status.borrow().clone();
        match current {
            RecordStatus::Executing => {
                match &outcome {
                    Outcome::Success(_) => info!(%key, "computation finalized"),
                    Outcome::Aborted(reason) => warn!(%key, %reason, "computation aborted"),
                }
                entry.status.send_replace(RecordStatus::Finalized(outcome));
                Ok(())
            }
            RecordStatus::Finalized(existing) if existing == outcome => Ok(()),
            status => Err(LedgerError::InvalidTransition {
                key: key.clone(),
                from: status.name(),
                to: "Finalized",
            }),
        }
    }

    fn status(&self, key: &RecordKey) -> Option<RecordStatus> {
        let inner = self.inner.lock().expect("ledger lock poisoned");
        inner.records.get(key).map(|e| e.status.borrow().clone())
    }

    fn subscribe(&self, key: &RecordKey) -> Result<watch::Receiver<RecordStatus>, LedgerError> {
        let inner = self.inner.lock().expect("ledger lock poisoned");
        inner
            .records
            .get(key)
            .map(|e| e.status.subscribe())
            .ok_or_else(|| LedgerError::UnknownIdentifier(key.clone()))
    }
}
