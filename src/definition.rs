//! Computation definitions: the immutable binding of an operation name to a circuit.
//!
//! A definition is registered once per deployment. The registry rejects any second
//! write for a name; [`ensure_registered`] layers idempotency on top by checking
//! for an identical existing binding first. A behavioral change of a circuit
//! always requires a new name.

use std::{
    collections::HashMap,
    fmt::{self, Debug},
    sync::{Arc, RwLock},
};

use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use tracing::{debug, info};

use crate::{encoding::Param, output::OutputShape};

/// The content hash of a circuit artifact.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CircuitHash(pub [u8; 32]);

impl CircuitHash {
    /// Hashes circuit bytes.
    pub fn of(circuit: &[u8]) -> Self {
        Self(*blake3::hash(circuit).as_bytes())
    }

    /// Constant-time comparison.
    pub fn matches(&self, other: &Self) -> bool {
        self.0[..].ct_eq(&other.0[..]).into()
    }
}

impl fmt::Display for CircuitHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl Debug for CircuitHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CircuitHash({self})")
    }
}

/// The declared interface of a circuit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CircuitSignature {
    /// Parameters in declaration order.
    pub params: Vec<Param>,
    /// The return type, including nested tuple structure.
    pub returns: OutputShape,
}

/// A registered computation definition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ComputationDefinition {
    /// Stable operation name, e.g. `"init_vault"`.
    pub name: String,
    /// Hash the cluster checks the fetched circuit against.
    pub circuit_hash: CircuitHash,
    /// Where the cluster fetches the circuit from.
    pub fetch_location: String,
    pub signature: CircuitSignature,
}

impl ComputationDefinition {
    /// Creates a definition for the given circuit bytes.
    pub fn new(
        name: impl Into<String>,
        circuit: &[u8],
        fetch_location: impl Into<String>,
        signature: CircuitSignature,
    ) -> Self {
        Self {
            name: name.into(),
            circuit_hash: CircuitHash::of(circuit),
            fetch_location: fetch_location.into(),
            signature,
        }
    }
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum RegistryError {
    #[error("a computation definition named {name:?} is already registered")]
    AlreadyRegistered { name: String },
    #[error("no computation definition named {name:?}")]
    NotFound { name: String },
}

/// An append-only store of computation definitions.
pub trait DefinitionRegistry: Send + Sync + 'static {
    /// Registers a definition. Fails if the name is already taken, regardless
    /// of whether the existing binding is identical.
    fn register(&self, definition: ComputationDefinition) -> Result<(), RegistryError>;

    /// Looks up a definition by name.
    fn resolve(&self, name: &str) -> Result<Arc<ComputationDefinition>, RegistryError>;

    fn contains(&self, name: &str) -> bool {
        self.resolve(name).is_ok()
    }
}

/// The outcome of [`ensure_registered`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    Created,
    AlreadyPresent,
}

/// Registers `definition` unless an identical binding already exists.
///
/// An existing definition with the same name but a different hash, location or
/// signature is an error, the registry never rebinds a name.
pub fn ensure_registered<R>(
    registry: &R,
    definition: ComputationDefinition,
) -> Result<Registration, RegistryError>
where
    R: DefinitionRegistry + ?Sized,
{
    let compare = |existing: &ComputationDefinition, definition: &ComputationDefinition| {
        if existing == definition {
            debug!(name = %definition.name, "definition already registered");
            Ok(Registration::AlreadyPresent)
        } else {
            Err(RegistryError::AlreadyRegistered {
                name: definition.name.clone(),
            })
        }
    };
    if let Ok(existing) = registry.resolve(&definition.name) {
        return compare(&*existing, &definition);
    }
    match registry.register(definition.clone()) {
        Ok(()) => {
            info!(
                name = %definition.name,
                hash = %definition.circuit_hash,
                "registered computation definition"
            );
            Ok(Registration::Created)
        }
        // lost a race against a concurrent registration
        Err(RegistryError::AlreadyRegistered { .. }) => {
            let existing = registry.resolve(&definition.name)?;
            compare(&*existing, &definition)
        }
        Err(err) => Err(err),
    }
}

/// An in-memory [`DefinitionRegistry`].
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    definitions: RwLock<HashMap<String, Arc<ComputationDefinition>>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DefinitionRegistry for MemoryRegistry {
    fn register(&self, definition: ComputationDefinition) -> Result<(), RegistryError> {
        let mut definitions = self.definitions.write().expect("registry lock poisoned");
        if definitions.contains_key(&definition.name) {
            return Err(RegistryError::AlreadyRegistered {
                name: definition.name,
            });
        }
        definitions.insert(definition.name.clone(), Arc::new(definition));
        Ok(())
    }

    fn resolve(&self, name: &str) -> Result<Arc<ComputationDefinition>, RegistryError> {
        let definitions = self.definitions.read().expect("registry lock poisoned");
        definitions
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound { name: name.into() })
    }
}

/// Errors of the circuit fetch protocol. These are observed by the cluster and
/// abort the computation.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum FetchError {
    #[error("circuit at {location} is unavailable")]
    Unavailable { location: String },
    #[error("circuit hash mismatch: registered {expected} but fetched {actual}")]
    HashMismatch {
        expected: CircuitHash,
        actual: CircuitHash,
    },
}

/// Serves circuit artifacts by fetch location.
pub trait CircuitSource: Send + Sync + 'static {
    fn fetch(&self, location: &str) -> Result<Vec<u8>, FetchError>;
}

/// Fetches the circuit of `definition` and checks its content hash.
pub fn fetch_verified<S>(definition: &ComputationDefinition, source: &S) -> Result<Vec<u8>, FetchError>
where
    S: CircuitSource + ?Sized,
{
    let circuit = source.fetch(&definition.fetch_location)?;
    let actual = CircuitHash::of(&circuit);
    if actual.matches(&definition.circuit_hash) {
        Ok(circuit)
    } else {
        Err(FetchError::HashMismatch {
            expected: definition.circuit_hash,
            actual,
        })
    }
}

/// An in-memory [`CircuitSource`].
#[derive(Debug, Default)]
pub struct MemoryCircuitSource {
    circuits: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryCircuitSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `circuit` available at `location`, replacing any previous content.
    pub fn publish(&self, location: impl Into<String>, circuit: Vec<u8>) {
        self.circuits
            .write()
            .expect("circuit source lock poisoned")
            .insert(location.into(), circuit);
    }
}

impl CircuitSource for MemoryCircuitSource {
    fn fetch(&self, location: &str) -> Result<Vec<u8>, FetchError> {
        self.circuits
            .read()
            .expect("circuit source lock poisoned")
            .get(location)
            .cloned()
            .ok_or_else(|| FetchError::Unavailable {
                location: location.into(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::ScalarType;

    fn definition(circuit: &[u8], location: &str) -> ComputationDefinition {
        ComputationDefinition::new(
            "add_together",
            circuit,
            location,
            CircuitSignature {
                params: vec![Param::Plaintext(ScalarType::U64)],
                returns: OutputShape::Revealed(8),
            },
        )
    }

    #[test]
    fn redundant_registration_is_a_noop() {
        let registry = MemoryRegistry::new();
        let def = definition(b"circuit v1", "mem://add_together");
        assert_eq!(
            ensure_registered(&registry, def.clone()),
            Ok(Registration::Created)
        );
        assert_eq!(
            ensure_registered(&registry, def.clone()),
            Ok(Registration::AlreadyPresent)
        );
        // the raw registry itself rejects duplicate writes
        assert_eq!(
            registry.register(def),
            Err(RegistryError::AlreadyRegistered {
                name: "add_together".into()
            })
        );
    }

    #[test]
    fn binding_is_immutable() {
        let registry = MemoryRegistry::new();
        ensure_registered(&registry, definition(b"circuit v1", "mem://a")).unwrap();

        let other_hash = definition(b"circuit v2", "mem://a");
        let other_location = definition(b"circuit v1", "mem://b");
        for def in [other_hash, other_location] {
            assert_eq!(
                ensure_registered(&registry, def),
                Err(RegistryError::AlreadyRegistered {
                    name: "add_together".into()
                })
            );
        }
        let resolved = registry.resolve("add_together").unwrap();
        assert_eq!(resolved.circuit_hash, CircuitHash::of(b"circuit v1"));
        assert_eq!(resolved.fetch_location, "mem://a");
    }

    #[test]
    fn resolve_unknown() {
        let registry = MemoryRegistry::new();
        assert!(!registry.contains("missing"));
        assert_eq!(
            registry.resolve("missing").unwrap_err(),
            RegistryError::NotFound {
                name: "missing".into()
            }
        );
    }

    #[test]
    fn fetch_checks_content_hash() {
        let source = MemoryCircuitSource::new();
        let def = definition(b"circuit v1", "mem://add_together");
        assert!(matches!(
            fetch_verified(&def, &source),
            Err(FetchError::Unavailable { .. })
        ));
        source.publish("mem://add_together", b"circuit v1".to_vec());
        assert_eq!(fetch_verified(&def, &source).unwrap(), b"circuit v1");
        source.publish("mem://add_together", b"tampered".to_vec());
        assert_eq!(
            fetch_verified(&def, &source),
            Err(FetchError::HashMismatch {
                expected: CircuitHash::of(b"circuit v1"),
                actual: CircuitHash::of(b"tampered"),
            })
        );
    }
}
