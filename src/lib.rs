//! Orchestration of encrypted computations on a remote multi-party computation (MPC) cluster.
//!
//! This crate moves a request for a privacy-preserving computation from a calling program,
//! through an MPC cluster, to a verified result that is durably written into the caller's
//! records. It does not implement the MPC cryptography itself; the cluster is an opaque
//! collaborator that either finalizes a computation with a signed result or aborts it.
//!
//! ## Main Components
//!
//! * [`encoding`]: Serialization of mixed plaintext/ciphertext arguments into the segment
//!   layout a circuit declares.
//! * [`definition`]: The registry binding operation names to circuit hashes and fetch
//!   locations, plus the circuit fetch protocol.
//! * [`ledger`]: Queued, executing and finalized computation records.
//! * [`scheduler`]: Validation and queueing of computations.
//! * [`verifier`]: Authentication of cluster results against the associated cluster.
//! * [`mutator`]: Application of verified outputs, gated by nonce bookkeeping.
//! * [`dispatch`]: At-most-once delivery of results to awaiting callers.
//! * [`retry`]: The client-side retry loop minting a fresh identifier per attempt.
//! * [`cluster`]: An in-process simulated cluster for tests and local runs.
//!
//! ## Basic Usage
//!
//! ```ignore
//! use mpc_orchestrator::{
//!     cluster::vault::{self, VAULT_LAYOUT},
//!     definition::MemoryRegistry,
//!     encoding::ArgumentBuilder,
//!     ledger::{MemoryLedger, OutputTarget},
//!     retry::{RetryOrchestrator, RetryPolicy},
//!     scheduler::QueueRequest,
//!     store::{MemoryStore, StoreKey},
//! };
//!
//! # async fn example(
//! #     orchestrator: RetryOrchestrator<MemoryRegistry, MemoryLedger, MemoryStore>,
//! #     vault_key: StoreKey,
//! # ) -> Result<(), Box<dyn std::error::Error>> {
//! let output = orchestrator
//!     .run(
//!         vault::INIT_VAULT,
//!         |id| {
//!             Ok(QueueRequest {
//!                 id,
//!                 definition: vault::INIT_VAULT.into(),
//!                 args: ArgumentBuilder::new().build(),
//!                 routing: vec![OutputTarget::writable(vault_key.clone(), VAULT_LAYOUT)],
//!             })
//!         },
//!         &RetryPolicy::default(),
//!     )
//!     .await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Guarantees
//!
//! Computation identifiers are never reused: every attempt of the retry loop mints a new one.
//! A finalized record never changes. A verified output replaces the full encrypted state of
//! each target record together with its nonce, and a nonce that does not advance is rejected
//! as a [`mutator::StateConsistencyFault`].
#![deny(unsafe_code)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod cluster;
pub mod config;
pub mod definition;
pub mod dispatch;
pub mod encoding;
pub mod ledger;
pub mod mutator;
pub mod output;
pub mod retry;
pub mod scheduler;
pub mod store;
pub mod verifier;

mod utils;

pub use config::OrchestratorConfig;
