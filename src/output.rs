//! Typed computation outputs and the shape descriptors they are decoded against.
//!
//! The raw output of a computation is the positional concatenation of its
//! elements: revealed plaintext is copied verbatim, a re-encrypted element is
//! `K` ciphertext slots followed by its 16-byte little-endian nonce. Tuples nest
//! positionally (`field_0`, `field_1`, ...).

use std::fmt::{self, Debug};

use serde::{Deserialize, Serialize};

use crate::store::{Ciphertext, EncryptionState, NONCE_LEN, SLOT_LEN};

/// The declared return type of a circuit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OutputShape {
    /// Plaintext revealed to the caller, of a fixed byte length.
    Revealed(u32),
    /// A re-encrypted value with the given number of ciphertext slots.
    Encrypted { slots: u32 },
    Tuple(Vec<OutputShape>),
}

impl OutputShape {
    /// Length of the raw encoding of an output with this shape.
    pub fn encoded_len(&self) -> usize {
        match self {
            OutputShape::Revealed(len) => *len as usize,
            OutputShape::Encrypted { slots } => *slots as usize * SLOT_LEN + NONCE_LEN,
            OutputShape::Tuple(shapes) => shapes.iter().map(OutputShape::encoded_len).sum(),
        }
    }

    /// Slot counts of all encrypted elements in positional order.
    pub fn encrypted_slots(&self) -> Vec<u32> {
        let mut slots = vec![];
        self.collect_encrypted(&mut slots);
        slots
    }

    fn collect_encrypted(&self, out: &mut Vec<u32>) {
        match self {
            OutputShape::Revealed(_) => {}
            OutputShape::Encrypted { slots } => out.push(*slots),
            OutputShape::Tuple(shapes) => shapes.iter().for_each(|s| s.collect_encrypted(out)),
        }
    }
}

/// A re-encrypted output element.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedOutput {
    pub ciphertexts: Vec<Ciphertext>,
    pub nonce: u128,
}

impl EncryptedOutput {
    /// The encryption state a record takes on when this element is written to it.
    pub fn to_state(&self) -> EncryptionState {
        EncryptionState {
            nonce: self.nonce,
            slots: self.ciphertexts.clone(),
        }
    }
}

impl Debug for EncryptedOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptedOutput")
            .field("ciphertexts", &self.ciphertexts.len())
            .field("nonce", &self.nonce)
            .finish()
    }
}

/// A decoded output element.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Output {
    Revealed(Vec<u8>),
    Encrypted(EncryptedOutput),
    Tuple(Vec<Output>),
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum OutputError {
    #[error("output is truncated: expected {expected} bytes but got {actual}")]
    Truncated { expected: usize, actual: usize },
    #[error("output has {0} trailing bytes")]
    TrailingBytes(usize),
}

impl Output {
    /// Decodes a raw output against the declared shape.
    pub fn decode(shape: &OutputShape, raw: &[u8]) -> Result<Self, OutputError> {
        let expected = shape.encoded_len();
        if raw.len() < expected {
            return Err(OutputError::Truncated {
                expected,
                actual: raw.len(),
            });
        }
        if raw.len() > expected {
            return Err(OutputError::TrailingBytes(raw.len() - expected));
        }
        let mut rest = raw;
        Ok(Self::decode_from(shape, &mut rest))
    }

    // length was checked against `shape.encoded_len()` before
    fn decode_from(shape: &OutputShape, rest: &mut &[u8]) -> Self {
        match shape {
            OutputShape::Revealed(len) => Output::Revealed(take(rest, *len as usize).to_vec()),
            OutputShape::Encrypted { slots } => {
                let ciphertexts = take(rest, *slots as usize * SLOT_LEN)
                    .chunks_exact(SLOT_LEN)
                    .map(|c| c.try_into().expect("chunks_exact yields SLOT_LEN"))
                    .collect();
                let nonce =
                    u128::from_le_bytes(take(rest, NONCE_LEN).try_into().expect("took NONCE_LEN"));
                Output::Encrypted(EncryptedOutput { ciphertexts, nonce })
            }
            OutputShape::Tuple(shapes) => Output::Tuple(
                shapes
                    .iter()
                    .map(|shape| Self::decode_from(shape, rest))
                    .collect(),
            ),
        }
    }

    /// The raw encoding of this output.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![];
        self.encode_into(&mut out);
        out
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            Output::Revealed(bytes) => out.extend_from_slice(bytes),
            Output::Encrypted(enc) => {
                enc.ciphertexts.iter().for_each(|ct| out.extend_from_slice(ct));
                out.extend_from_slice(&enc.nonce.to_le_bytes());
            }
            Output::Tuple(outputs) => outputs.iter().for_each(|o| o.encode_into(out)),
        }
    }

    /// The shape of this output.
    pub fn shape(&self) -> OutputShape {
        match self {
            Output::Revealed(bytes) => OutputShape::Revealed(bytes.len() as u32),
            Output::Encrypted(enc) => OutputShape::Encrypted {
                slots: enc.ciphertexts.len() as u32,
            },
            Output::Tuple(outputs) => OutputShape::Tuple(outputs.iter().map(Output::shape).collect()),
        }
    }

    /// Positional tuple field, `field(0)` corresponds to `field_0`.
    pub fn field(&self, idx: usize) -> Option<&Output> {
        match self {
            Output::Tuple(outputs) => outputs.get(idx),
            _ => None,
        }
    }

    fn collect_encrypted<'a>(&'a self, out: &mut Vec<&'a EncryptedOutput>) {
        match self {
            Output::Revealed(_) => {}
            Output::Encrypted(enc) => out.push(enc),
            Output::Tuple(outputs) => outputs.iter().for_each(|o| o.collect_encrypted(out)),
        }
    }
}

fn take<'a>(rest: &mut &'a [u8], n: usize) -> &'a [u8] {
    let slice: &'a [u8] = *rest;
    let (head, tail) = slice.split_at(n);
    *rest = tail;
    head
}

/// The verified output of a computation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackOutput(Output);

impl CallbackOutput {
    pub(crate) fn new(output: Output) -> Self {
        Self(output)
    }

    pub fn output(&self) -> &Output {
        &self.0
    }

    pub fn into_output(self) -> Output {
        self.0
    }

    /// All re-encrypted elements in positional order.
    ///
    /// The i-th element is written to the i-th writable output target.
    pub fn encrypted_elements(&self) -> Vec<&EncryptedOutput> {
        let mut out = vec![];
        self.0.collect_encrypted(&mut out);
        out
    }

    /// All revealed elements in positional order.
    pub fn revealed(&self) -> Vec<&[u8]> {
        fn collect<'a>(output: &'a Output, out: &mut Vec<&'a [u8]>) {
            match output {
                Output::Revealed(bytes) => out.push(bytes),
                Output::Encrypted(_) => {}
                Output::Tuple(outputs) => outputs.iter().for_each(|o| collect(o, out)),
            }
        }
        let mut out = vec![];
        collect(&self.0, &mut out);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nested() -> Output {
        Output::Tuple(vec![
            Output::Encrypted(EncryptedOutput {
                ciphertexts: vec![[1; 32], [2; 32]],
                nonce: 11,
            }),
            Output::Tuple(vec![
                Output::Revealed(vec![1, 0, 0, 0, 0, 0, 0, 0]),
                Output::Encrypted(EncryptedOutput {
                    ciphertexts: vec![[3; 32]],
                    nonce: 12,
                }),
            ]),
        ])
    }

    #[test]
    fn decode_nested_tuple() {
        let output = nested();
        let shape = output.shape();
        assert_eq!(shape.encoded_len(), 2 * 32 + 16 + 8 + 32 + 16);
        assert_eq!(shape.encrypted_slots(), vec![2, 1]);
        assert_eq!(Output::decode(&shape, &output.encode()).unwrap(), output);

        let cb = CallbackOutput::new(output);
        let nonces: Vec<_> = cb.encrypted_elements().iter().map(|e| e.nonce).collect();
        assert_eq!(nonces, vec![11, 12]);
        assert_eq!(cb.revealed(), vec![&[1, 0, 0, 0, 0, 0, 0, 0][..]]);
        assert!(matches!(
            cb.output().field(1).and_then(|f| f.field(0)),
            Some(Output::Revealed(_))
        ));
    }

    #[test]
    fn arity_mismatch_is_detected() {
        let raw = nested().encode();
        let flat = OutputShape::Tuple(vec![OutputShape::Encrypted { slots: 2 }]);
        assert_eq!(
            Output::decode(&flat, &raw),
            Err(OutputError::TrailingBytes(8 + 32 + 16))
        );
        let wider = OutputShape::Tuple(vec![nested().shape(), OutputShape::Revealed(1)]);
        assert!(matches!(
            Output::decode(&wider, &raw),
            Err(OutputError::Truncated { .. })
        ));
    }
}
