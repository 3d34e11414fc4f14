//! Client-side retry loop around a single logical operation.
//!
//! Every attempt uses a freshly minted [`ComputationId`]. An aborted or timed out
//! attempt is abandoned, never resumed: its record is left to finalize on its own
//! and a result that arrives for it later is ignored by the dispatcher.

use std::{sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::{
    definition::DefinitionRegistry,
    dispatch::{CallbackDispatcher, Delivery, DispatchError},
    encoding::EncodingError,
    ledger::{AbortReason, ComputationId, Ledger, LedgerError, Outcome},
    mutator::StateConsistencyFault,
    output::CallbackOutput,
    scheduler::{QueueRequest, ScheduleError, Scheduler},
    store::StateStore,
    utils::serde::millis,
};

#[cfg(test)]
mod tests;

/// Mints single-use computation identifiers.
pub trait IdentifierSource: Send + Sync {
    fn new_identifier(&self) -> ComputationId;
}

impl<T: IdentifierSource + ?Sized> IdentifierSource for Arc<T> {
    fn new_identifier(&self) -> ComputationId {
        (**self).new_identifier()
    }
}

/// Draws identifiers uniformly from the thread-local CSPRNG.
///
/// Identifiers are never derived from counters, their unpredictability is part
/// of the single-use guarantee.
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomIdentifiers;

impl IdentifierSource for RandomIdentifiers {
    fn new_identifier(&self) -> ComputationId {
        ComputationId(rand::random())
    }
}

/// Exponential backoff between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Backoff {
    #[serde(with = "millis")]
    pub initial: Duration,
    pub multiplier: u32,
    #[serde(with = "millis")]
    pub max: Duration,
}

impl Backoff {
    /// The delay after the `attempt`-th failed attempt (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.saturating_pow(attempt.saturating_sub(1));
        self.initial.saturating_mul(factor).min(self.max)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            multiplier: 2,
            max: Duration::from_secs(10),
        }
    }
}

/// Limits of a retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// How long to wait for finalization before an attempt is abandoned.
    #[serde(with = "millis")]
    pub finalization_timeout: Duration,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            finalization_timeout: Duration::from_secs(120),
            backoff: Backoff::default(),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum RetryError {
    #[error("computation aborted {attempts} times, last cause: {last_abort}")]
    RetriesExhausted { attempts: u32, last_abort: AbortReason },
    #[error("could not build request: {0}")]
    Encoding(#[from] EncodingError),
    #[error("could not queue computation: {0}")]
    Schedule(#[from] ScheduleError),
    #[error(transparent)]
    StateConsistency(#[from] StateConsistencyFault),
    #[error("request for {actual_definition} ({actual_id}) built for {expected_definition} ({expected_id})")]
    RequestMismatch {
        expected_id: ComputationId,
        actual_id: ComputationId,
        expected_definition: String,
        actual_definition: String,
    },
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

enum AttemptError {
    Aborted(AbortReason),
    Fatal(RetryError),
}

macro_rules! fatal_from {
    ($($err:ty),*) => {
        $(impl From<$err> for AttemptError {
            fn from(err: $err) -> Self {
                AttemptError::Fatal(err.into())
            }
        })*
    };
}

fatal_from!(RetryError, EncodingError, ScheduleError, LedgerError, StateConsistencyFault);

/// Runs computations to completion, retrying aborts with fresh identifiers.
pub struct RetryOrchestrator<R, L, S, I = RandomIdentifiers> {
    scheduler: Scheduler<R, L, S>,
    registry: Arc<R>,
    ledger: Arc<L>,
    dispatcher: Arc<CallbackDispatcher<S>>,
    ids: I,
}

impl<R, L, S> RetryOrchestrator<R, L, S>
where
    R: DefinitionRegistry,
    L: Ledger,
    S: StateStore,
{
    pub fn new(
        scheduler: Scheduler<R, L, S>,
        registry: Arc<R>,
        ledger: Arc<L>,
        dispatcher: Arc<CallbackDispatcher<S>>,
    ) -> Self {
        Self::with_identifiers(scheduler, registry, ledger, dispatcher, RandomIdentifiers)
    }
}

impl<R, L, S, I> RetryOrchestrator<R, L, S, I>
where
    R: DefinitionRegistry,
    L: Ledger,
    S: StateStore,
    I: IdentifierSource,
{
    pub fn with_identifiers(
        scheduler: Scheduler<R, L, S>,
        registry: Arc<R>,
        ledger: Arc<L>,
        dispatcher: Arc<CallbackDispatcher<S>>,
        ids: I,
    ) -> Self {
        Self {
            scheduler,
            registry,
            ledger,
            dispatcher,
            ids,
        }
    }

    pub fn scheduler(&self) -> &Scheduler<R, L, S> {
        &self.scheduler
    }

    pub fn dispatcher(&self) -> &Arc<CallbackDispatcher<S>> {
        &self.dispatcher
    }

    /// Runs `definition` until an attempt succeeds or `policy.max_attempts` are used up.
    ///
    /// `build_request` is called once per attempt with that attempt's identifier.
    /// Encoding, scheduling and state consistency errors are not retried.
    #[instrument(skip(self, build_request, policy), err)]
    pub async fn run<F>(
        &self,
        definition: &str,
        build_request: F,
        policy: &RetryPolicy,
    ) -> Result<CallbackOutput, RetryError>
    where
        F: Fn(ComputationId) -> Result<QueueRequest, EncodingError>,
    {
        let max_attempts = policy.max_attempts.max(1);
        let mut last_abort = AbortReason::Timeout;
        for attempt in 1..=max_attempts {
            let id = self.ids.new_identifier();
            match self
                .attempt(attempt, id, definition, &build_request, policy.finalization_timeout)
                .await
            {
                Ok(output) => {
                    info!(attempt, %id, "computation succeeded");
                    return Ok(output);
                }
                Err(AttemptError::Fatal(err)) => return Err(err),
                Err(AttemptError::Aborted(reason)) => {
                    warn!(attempt, %id, %reason, "attempt failed");
                    last_abort = reason;
                }
            }
            if attempt < max_attempts {
                let delay = policy.backoff.delay(attempt);
                debug!(?delay, "backing off");
                tokio::time::sleep(delay).await;
            }
        }
        Err(RetryError::RetriesExhausted {
            attempts: max_attempts,
            last_abort,
        })
    }

    #[instrument(level = "debug", skip(self, id, definition, build_request, timeout), fields(%id))]
    async fn attempt<F>(
        &self,
        attempt: u32,
        id: ComputationId,
        definition: &str,
        build_request: &F,
        timeout: Duration,
    ) -> Result<CallbackOutput, AttemptError>
    where
        F: Fn(ComputationId) -> Result<QueueRequest, EncodingError>,
    {
        let req = build_request(id)?;
        if req.id != id || req.definition != definition {
            return Err(RetryError::RequestMismatch {
                expected_id: id,
                actual_id: req.id,
                expected_definition: definition.into(),
                actual_definition: req.definition,
            }
            .into());
        }
        let def = self
            .registry
            .resolve(definition)
            .map_err(ScheduleError::from)?;
        let record = self.scheduler.queue(req)?;
        let key = record.key.clone();
        self.dispatcher.expect(record, def);

        let outcome = match tokio::time::timeout(timeout, self.ledger.wait_finalized(&key)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                self.dispatcher.abandon(&key);
                return Err(AttemptError::Aborted(AbortReason::Timeout));
            }
        };
        let result = match outcome {
            Ok(Outcome::Success(result)) => result,
            Ok(Outcome::Aborted(reason)) => {
                self.dispatcher.abandon(&key);
                return Err(AttemptError::Aborted(reason));
            }
            Err(err) => {
                self.dispatcher.abandon(&key);
                return Err(err.into());
            }
        };
        match self.dispatcher.deliver(&key, &result) {
            Ok(Delivery::Applied(output)) => Ok(output),
            // delivered concurrently by another path
            Ok(Delivery::Ignored) => Err(AttemptError::Aborted(AbortReason::VerificationFailed)),
            Err(DispatchError::Aborted(_)) => {
                Err(AttemptError::Aborted(AbortReason::VerificationFailed))
            }
            Err(DispatchError::Fault(fault)) => Err(fault.into()),
        }
    }
}
