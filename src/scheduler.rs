//! Queueing of computations.
//!
//! [`Scheduler::queue`] validates a request against the registered definition and
//! the caller's records, then appends an immutable `Queued` record to the ledger.
//! Queueing is a single atomic step, nothing is observable on failure.

use std::{collections::HashSet, sync::Arc, time::SystemTime};

use tracing::{debug, instrument};

use crate::{
    definition::{DefinitionRegistry, RegistryError},
    encoding::{self, EncodedArgument, EncodingError},
    ledger::{ComputationId, ComputationRecord, Ledger, LedgerError, Namespace, OutputTarget, RecordKey},
    store::{StateStore, StoreKey},
};

/// A request to run a registered computation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueRequest {
    /// Caller-chosen identifier, used for this attempt only.
    pub id: ComputationId,
    /// Name of the registered definition.
    pub definition: String,
    pub args: EncodedArgument,
    /// Records the output is routed to. Writable targets receive the
    /// re-encrypted output elements in order.
    pub routing: Vec<OutputTarget>,
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum ScheduleError {
    #[error("invalid arguments: {0}")]
    Encoding(#[from] EncodingError),
    #[error(transparent)]
    Definition(#[from] RegistryError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error("output target {0} does not exist")]
    MissingTarget(StoreKey),
    #[error("output target {key} is not owned by {namespace}")]
    NotOwner { key: StoreKey, namespace: Namespace },
    #[error("output routing does not match the declared output: {0}")]
    RoutingMismatch(String),
}

/// Queues computations on behalf of a single calling program.
pub struct Scheduler<R, L, S> {
    namespace: Namespace,
    registry: Arc<R>,
    ledger: Arc<L>,
    store: Arc<S>,
}

impl<R, L, S> Scheduler<R, L, S>
where
    R: DefinitionRegistry,
    L: Ledger,
    S: StateStore,
{
    pub fn new(namespace: Namespace, registry: Arc<R>, ledger: Arc<L>, store: Arc<S>) -> Self {
        Self {
            namespace,
            registry,
            ledger,
            store,
        }
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    /// Validates `req` and appends it to the ledger as a `Queued` record.
    #[instrument(level = "debug", skip_all, fields(id = %req.id, definition = %req.definition))]
    pub fn queue(&self, req: QueueRequest) -> Result<Arc<ComputationRecord>, ScheduleError> {
        let definition = self.registry.resolve(&req.definition)?;
        encoding::validate(&definition.signature.params, &req.args)?;
        self.check_routing(&definition.signature.returns.encrypted_slots(), &req.routing)?;

        let record = ComputationRecord {
            key: RecordKey {
                namespace: self.namespace.clone(),
                id: req.id,
            },
            definition: req.definition,
            circuit_hash: definition.circuit_hash,
            args: req.args,
            routing: req.routing,
            created_at: SystemTime::now(),
        };
        let record = self.ledger.append(record)?;
        debug!(key = %record.key, "computation queued");
        Ok(record)
    }

    fn check_routing(&self, slots: &[u32], routing: &[OutputTarget]) -> Result<(), ScheduleError> {
        let writable: Vec<_> = routing.iter().filter(|t| t.writable).collect();
        if writable.len() != slots.len() {
            return Err(ScheduleError::RoutingMismatch(format!(
                "{} encrypted output elements but {} writable targets",
                slots.len(),
                writable.len()
            )));
        }
        let mut seen = HashSet::new();
        if let Some(target) = writable.iter().find(|t| !seen.insert(t.key.clone())) {
            return Err(ScheduleError::RoutingMismatch(format!(
                "writable target {} is routed more than once",
                target.key
            )));
        }
        for (target, slots) in writable.into_iter().zip(slots) {
            let Some(layout) = target.layout else {
                return Err(ScheduleError::RoutingMismatch(format!(
                    "writable target {} has no layout",
                    target.key
                )));
            };
            if layout.encrypted_fields != *slots {
                return Err(ScheduleError::RoutingMismatch(format!(
                    "target {} has {} encrypted fields but the output element has {slots} slots",
                    target.key, layout.encrypted_fields
                )));
            }
            self.check_target(&target.key, layout.len())?;
        }
        for target in routing.iter().filter(|t| !t.writable) {
            if self.store.read(&target.key).is_none() {
                return Err(ScheduleError::MissingTarget(target.key.clone()));
            }
        }
        Ok(())
    }

    fn check_target(&self, key: &StoreKey, min_len: usize) -> Result<(), ScheduleError> {
        let owner = self
            .store
            .owner(key)
            .ok_or_else(|| ScheduleError::MissingTarget(key.clone()))?;
        if owner != self.namespace {
            return Err(ScheduleError::NotOwner {
                key: key.clone(),
                namespace: self.namespace.clone(),
            });
        }
        let len = self.store.read(key).map_or(0, |bytes| bytes.len());
        if len < min_len {
            return Err(ScheduleError::RoutingMismatch(format!(
                "target {key} is {len} bytes but its layout requires {min_len}"
            )));
        }
        Ok(())
    }
}
