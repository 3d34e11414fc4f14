//! Verification of cluster-produced results.
//!
//! A cluster signs an attestation binding its identity, the computation's ledger
//! key, the circuit hash and a digest of the raw output. The [`CallbackVerifier`]
//! checks, in order, that
//!
//! 1. the attestation is signed by the cluster currently associated with the program,
//! 2. it refers to exactly the awaited computation,
//! 3. the raw output decodes against the definition's declared return shape.
//!
//! Any failure collapses to [`AbortedComputation`]. The detailed [`VerifyError`]
//! is logged but not handed to the caller.

use std::{
    fmt::{self, Debug},
    sync::RwLock,
};

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    definition::{CircuitHash, ComputationDefinition},
    ledger::{ComputationRecord, RecordKey},
    output::{CallbackOutput, Output, OutputError},
    utils::{generate_signing_key, serialize},
};

const ATTESTATION_DOMAIN: &str = "mpc-orchestrator attestation v1";

/// Identity of an MPC cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClusterId(pub u32);

impl fmt::Display for ClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cluster-{}", self.0)
    }
}

/// The public signing material of a cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterKey {
    pub cluster: ClusterId,
    pub verifying_key: VerifyingKey,
}

/// The private signing material of a cluster.
pub struct ClusterSigner {
    cluster: ClusterId,
    signing_key: SigningKey,
}

impl ClusterSigner {
    /// Generates a fresh signing key.
    pub fn generate(cluster: ClusterId) -> Self {
        Self {
            cluster,
            signing_key: generate_signing_key(),
        }
    }

    pub fn from_seed(cluster: ClusterId, seed: [u8; 32]) -> Self {
        Self {
            cluster,
            signing_key: SigningKey::from_bytes(&seed),
        }
    }

    pub fn key(&self) -> ClusterKey {
        ClusterKey {
            cluster: self.cluster,
            verifying_key: self.signing_key.verifying_key(),
        }
    }

    /// Attests that `raw_output` is the result of the computation at `computation`.
    pub fn attest(
        &self,
        computation: &RecordKey,
        circuit_hash: CircuitHash,
        raw_output: Vec<u8>,
    ) -> ClusterResult {
        let output_digest = *blake3::hash(&raw_output).as_bytes();
        let payload = attestation_payload(self.cluster, computation, &circuit_hash, &output_digest);
        let attestation = ClusterAttestation {
            cluster: self.cluster,
            computation: computation.clone(),
            circuit_hash,
            output_digest,
            signature: self.signing_key.sign(&payload),
        };
        ClusterResult {
            attestation,
            raw_output,
        }
    }
}

impl Debug for ClusterSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterSigner")
            .field("cluster", &self.cluster)
            .field("signing_key", &"<REDACTED>")
            .finish()
    }
}

/// A cluster's signed statement about a computation result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterAttestation {
    pub cluster: ClusterId,
    pub computation: RecordKey,
    pub circuit_hash: CircuitHash,
    pub output_digest: [u8; 32],
    pub signature: Signature,
}

/// What a cluster delivers when a computation succeeds.
#[derive(Clone, PartialEq, Eq)]
pub struct ClusterResult {
    pub attestation: ClusterAttestation,
    pub raw_output: Vec<u8>,
}

impl Debug for ClusterResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterResult")
            .field("attestation", &self.attestation)
            .field("raw_output_len", &self.raw_output.len())
            .finish()
    }
}

#[derive(Serialize)]
struct SignedFields<'a> {
    domain: &'static str,
    cluster: ClusterId,
    computation: &'a RecordKey,
    circuit_hash: &'a CircuitHash,
    output_digest: &'a [u8; 32],
}

fn attestation_payload(
    cluster: ClusterId,
    computation: &RecordKey,
    circuit_hash: &CircuitHash,
    output_digest: &[u8; 32],
) -> Vec<u8> {
    serialize(&SignedFields {
        domain: ATTESTATION_DOMAIN,
        cluster,
        computation,
        circuit_hash,
        output_digest,
    })
    .expect("attestation fields consist of serializable plain data")
}

/// The single externally observable verification failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("computation aborted")]
pub struct AbortedComputation;

/// The reason a result did not verify.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum VerifyError {
    #[error("result attested by {actual} but program is associated with {expected}")]
    UnexpectedCluster {
        expected: ClusterId,
        actual: ClusterId,
    },
    #[error("invalid attestation signature")]
    BadSignature,
    #[error("attestation is for computation {actual} but {expected} was awaited")]
    WrongComputation {
        expected: RecordKey,
        actual: RecordKey,
    },
    #[error("attested circuit {actual} differs from registered circuit {expected}")]
    CircuitMismatch {
        expected: CircuitHash,
        actual: CircuitHash,
    },
    #[error("raw output does not match the attested digest")]
    OutputDigest,
    #[error("output does not match the declared return shape")]
    Shape(#[source] OutputError),
}

/// Verifies results against the cluster associated with the calling program.
#[derive(Debug)]
pub struct CallbackVerifier {
    cluster: RwLock<ClusterKey>,
}

impl CallbackVerifier {
    pub fn new(cluster: ClusterKey) -> Self {
        Self {
            cluster: RwLock::new(cluster),
        }
    }

    /// Associates the program with a different cluster. Results attested by the
    /// previous cluster no longer verify.
    pub fn associate(&self, cluster: ClusterKey) {
        debug!(cluster = %cluster.cluster, "associating cluster");
        *self.cluster.write().expect("cluster lock poisoned") = cluster;
    }

    /// Verifies `result` for `record`, collapsing every failure to [`AbortedComputation`].
    pub fn verify(
        &self,
        record: &ComputationRecord,
        definition: &ComputationDefinition,
        result: &ClusterResult,
    ) -> Result<CallbackOutput, AbortedComputation> {
        self.check(record, definition, result).map_err(|err| {
            warn!(key = %record.key, %err, "callback verification failed");
            AbortedComputation
        })
    }

    /// Verifies `result` for `record`, returning the detailed failure reason.
    pub fn check(
        &self,
        record: &ComputationRecord,
        definition: &ComputationDefinition,
        result: &ClusterResult,
    ) -> Result<CallbackOutput, VerifyError> {
        let att = &result.attestation;

        // (1) signed by the associated cluster
        let expected = self.cluster.read().expect("cluster lock poisoned").clone();
        if att.cluster != expected.cluster {
            return Err(VerifyError::UnexpectedCluster {
                expected: expected.cluster,
                actual: att.cluster,
            });
        }
        let payload = attestation_payload(
            att.cluster,
            &att.computation,
            &att.circuit_hash,
            &att.output_digest,
        );
        expected
            .verifying_key
            .verify(&payload, &att.signature)
            .map_err(|_| VerifyError::BadSignature)?;

        // (2) refers to exactly this computation
        if att.computation != record.key {
            return Err(VerifyError::WrongComputation {
                expected: record.key.clone(),
                actual: att.computation.clone(),
            });
        }
        for expected in [record.circuit_hash, definition.circuit_hash] {
            if !att.circuit_hash.matches(&expected) {
                return Err(VerifyError::CircuitMismatch {
                    expected,
                    actual: att.circuit_hash,
                });
            }
        }
        if blake3::hash(&result.raw_output) != blake3::Hash::from(att.output_digest) {
            return Err(VerifyError::OutputDigest);
        }

        // (3) decodes against the declared return shape
        let output = Output::decode(&definition.signature.returns, &result.raw_output)
            .map_err(VerifyError::Shape)?;
        Ok(CallbackOutput::new(output))
    }
}

#[cfg(test)]
mod tests {
    use std::time::SystemTime;

    use super::*;
    use crate::{
        definition::CircuitSignature,
        encoding::EncodedArgument,
        ledger::{ComputationId, Namespace},
        output::{EncryptedOutput, OutputShape},
    };

    fn fixture() -> (ClusterSigner, ComputationDefinition, ComputationRecord, Vec<u8>) {
        let signer = ClusterSigner::from_seed(ClusterId(1), [7; 32]);
        let definition = ComputationDefinition::new(
            "init_vault",
            b"init_vault circuit",
            "mem://init_vault",
            CircuitSignature {
                params: vec![],
                returns: OutputShape::Tuple(vec![OutputShape::Encrypted { slots: 2 }]),
            },
        );
        let record = ComputationRecord {
            key: RecordKey {
                namespace: Namespace::new("vaults"),
                id: ComputationId(42),
            },
            definition: definition.name.clone(),
            circuit_hash: definition.circuit_hash,
            args: EncodedArgument::default(),
            routing: vec![],
            created_at: SystemTime::now(),
        };
        let raw = Output::Tuple(vec![Output::Encrypted(EncryptedOutput {
            ciphertexts: vec![[1; 32], [2; 32]],
            nonce: 99,
        })])
        .encode();
        (signer, definition, record, raw)
    }

    #[test]
    fn valid_result_verifies() {
        let (signer, definition, record, raw) = fixture();
        let verifier = CallbackVerifier::new(signer.key());
        let result = signer.attest(&record.key, definition.circuit_hash, raw);
        let output = verifier.verify(&record, &definition, &result).unwrap();
        assert_eq!(output.encrypted_elements()[0].nonce, 99);
    }

    #[test]
    fn substituted_cluster_is_rejected() {
        let (signer, definition, record, raw) = fixture();
        let verifier = CallbackVerifier::new(signer.key());

        let impostor = ClusterSigner::from_seed(ClusterId(1), [8; 32]);
        let result = impostor.attest(&record.key, definition.circuit_hash, raw.clone());
        assert_eq!(
            verifier.check(&record, &definition, &result),
            Err(VerifyError::BadSignature)
        );

        // a stale cluster no longer verifies after re-association
        let result = signer.attest(&record.key, definition.circuit_hash, raw);
        verifier.associate(ClusterSigner::from_seed(ClusterId(2), [9; 32]).key());
        assert_eq!(
            verifier.check(&record, &definition, &result),
            Err(VerifyError::UnexpectedCluster {
                expected: ClusterId(2),
                actual: ClusterId(1)
            })
        );
        assert_eq!(
            verifier.verify(&record, &definition, &result),
            Err(AbortedComputation)
        );
    }

    #[test]
    fn replayed_result_is_rejected() {
        let (signer, definition, record, raw) = fixture();
        let verifier = CallbackVerifier::new(signer.key());
        let mut other = record.key.clone();
        other.id = ComputationId(43);
        let result = signer.attest(&other, definition.circuit_hash, raw);
        assert!(matches!(
            verifier.check(&record, &definition, &result),
            Err(VerifyError::WrongComputation { .. })
        ));
    }

    #[test]
    fn tampered_output_is_rejected() {
        let (signer, definition, record, raw) = fixture();
        let verifier = CallbackVerifier::new(signer.key());
        let mut result = signer.attest(&record.key, definition.circuit_hash, raw);
        result.raw_output[0] ^= 1;
        assert_eq!(
            verifier.check(&record, &definition, &result),
            Err(VerifyError::OutputDigest)
        );
    }

    #[test]
    fn wrong_shape_is_rejected() {
        let (signer, definition, record, mut raw) = fixture();
        raw.extend_from_slice(&[0; 8]);
        let verifier = CallbackVerifier::new(signer.key());
        let result = signer.attest(&record.key, definition.circuit_hash, raw);
        assert_eq!(
            verifier.check(&record, &definition, &result),
            Err(VerifyError::Shape(OutputError::TrailingBytes(8)))
        );
    }
}
