//! A confidential vault: the reference workload for the simulated cluster.
//!
//! A vault record holds two encrypted fields, its balance and the number of
//! deposits. `init_vault` takes no input beyond the owning authority and
//! produces zeroed state under a fresh nonce. `deposit` adds a client-encrypted
//! amount and reveals whether the deposit was accepted.

use crate::{
    cluster::{Circuit, CircuitError, Emit, EvalContext, Input},
    definition::{CircuitSignature, ComputationDefinition},
    encoding::{Param, ScalarType, Value},
    output::OutputShape,
    store::{RecordLayout, StoreKey},
};

/// An 8-byte discriminator, the 32-byte owner key, balance and deposit count.
pub const VAULT_LAYOUT: RecordLayout = RecordLayout::new(8, 32, 2);

pub const INIT_VAULT: &str = "init_vault";
pub const DEPOSIT: &str = "deposit";

/// Circuit artifact contents, as published at the fetch locations.
pub const INIT_VAULT_CIRCUIT: &[u8] = b"circuit init_vault(mxe) -> Enc<Mxe, Vault> v1";
pub const DEPOSIT_CIRCUIT: &[u8] =
    b"circuit deposit(Enc<Shared, u64>, Enc<Mxe, Vault>) -> (Enc<Mxe, Vault>, bool) v1";

pub fn init_vault_definition(location: &str) -> ComputationDefinition {
    ComputationDefinition::new(
        INIT_VAULT,
        INIT_VAULT_CIRCUIT,
        location,
        CircuitSignature {
            params: vec![Param::Authority],
            returns: OutputShape::Encrypted { slots: 2 },
        },
    )
}

pub fn deposit_definition(location: &str) -> ComputationDefinition {
    ComputationDefinition::new(
        DEPOSIT,
        DEPOSIT_CIRCUIT,
        location,
        CircuitSignature {
            params: deposit_params(),
            returns: OutputShape::Tuple(vec![
                OutputShape::Encrypted { slots: 2 },
                OutputShape::Revealed(1),
            ]),
        },
    )
}

fn deposit_params() -> Vec<Param> {
    vec![
        Param::Tuple(vec![Param::SharedKey, Param::Encrypted(ScalarType::U64)]),
        Param::Plaintext(ScalarType::U128),
        Param::ExternalState(VAULT_LAYOUT),
    ]
}

/// The logical arguments of a deposit of `amount`, encrypted by the client
/// holding `public_key` under `nonce`.
pub fn deposit_values(
    public_key: [u8; 32],
    nonce: u128,
    encrypted_amount: [u8; 32],
    vault: StoreKey,
    vault_nonce: u128,
) -> Vec<Value> {
    vec![
        Value::Tuple(vec![
            Value::SharedKey { public_key, nonce },
            Value::Ciphertext(encrypted_amount),
        ]),
        Value::U128(vault_nonce),
        Value::External(vault),
    ]
}

#[derive(Debug, Clone, Copy, Default)]
pub struct InitVault;

impl Circuit for InitVault {
    fn evaluate(&self, _cx: &EvalContext<'_>, inputs: &[Input]) -> Result<Emit, CircuitError> {
        if !inputs.is_empty() {
            return Err(CircuitError::InputCount {
                expected: 0,
                actual: inputs.len(),
            });
        }
        Ok(Emit::Mxe(vec![0, 0]))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Deposit;

impl Circuit for Deposit {
    fn evaluate(&self, cx: &EvalContext<'_>, inputs: &[Input]) -> Result<Emit, CircuitError> {
        let [key, amount, vault_nonce, state] = inputs else {
            return Err(CircuitError::InputCount {
                expected: 4,
                actual: inputs.len(),
            });
        };
        let (public_key, nonce) = key.shared_key()?;
        let amount = cx.decrypt_shared(&public_key, nonce, std::slice::from_ref(amount.ciphertext()?))?[0];
        let vault = cx.decrypt_mxe(vault_nonce.scalar()?, state.state()?)?;
        let (balance, deposits) = (vault[0], vault[1]);

        let accepted = amount > 0 && amount <= u64::MAX as u128;
        let next = match balance.checked_add(amount) {
            Some(balance) if accepted => vec![balance, deposits + 1],
            _ => vec![balance, deposits],
        };
        let accepted = accepted && next[1] != deposits;
        Ok(Emit::Tuple(vec![
            Emit::Mxe(next),
            Emit::Reveal(vec![accepted as u8]),
        ]))
    }
}
