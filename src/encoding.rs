//! Serialization of mixed plaintext/ciphertext arguments into the layout a circuit expects.
//!
//! A circuit declares an ordered list of [`Param`]s. Callers either supply logical
//! [`Value`]s and let [`encode`] produce the [`EncodedArgument`], or assemble the
//! segments themselves with an [`ArgumentBuilder`], in which case [`validate`] checks
//! the result against the declared parameters before anything is queued.
//!
//! Every encrypted value occupies one 32-byte ciphertext slot regardless of the
//! width of the underlying plaintext. A [`Param::SharedKey`] always encodes to a
//! public key segment immediately followed by its 128-bit nonce.

use std::fmt::{self, Debug};

use serde::{Deserialize, Serialize};

use crate::store::{Ciphertext, RecordLayout, SLOT_LEN, StoreKey};

/// Width in bytes of the nonce paired with shared key material.
const NONCE_WIDTH: u8 = 16;

/// The plaintext scalar types a circuit can accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScalarType {
    Bool,
    U8,
    U16,
    U32,
    U64,
    U128,
}

impl ScalarType {
    /// Width of the scalar in its plaintext encoding.
    pub const fn width(self) -> u8 {
        match self {
            ScalarType::Bool | ScalarType::U8 => 1,
            ScalarType::U16 => 2,
            ScalarType::U32 => 4,
            ScalarType::U64 => 8,
            ScalarType::U128 => 16,
        }
    }

    fn fits(self, value: u128) -> bool {
        match self {
            ScalarType::Bool => value <= 1,
            ScalarType::U128 => true,
            ty => value >> (ty.width() as u32 * 8) == 0,
        }
    }
}

/// A parameter as declared by a circuit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Param {
    /// A plaintext scalar.
    Plaintext(ScalarType),
    /// A ciphertext of a scalar of the given type, always one slot wide.
    Encrypted(ScalarType),
    /// Public key material of a client, paired with a nonce.
    SharedKey,
    /// The computation's owning authority without additional data. Encodes to
    /// zero segments.
    Authority,
    /// A read of the ciphertext region of an existing record.
    ExternalState(RecordLayout),
    /// A tuple of parameters. Every component must be declared, even if it
    /// contributes no segments.
    Tuple(Vec<Param>),
}

impl Param {
    /// Number of segments this parameter encodes to.
    pub fn segment_count(&self) -> usize {
        match self {
            Param::Plaintext(_) | Param::Encrypted(_) | Param::ExternalState(_) => 1,
            Param::SharedKey => 2,
            Param::Authority => 0,
            Param::Tuple(params) => params.iter().map(Param::segment_count).sum(),
        }
    }

    fn kind(&self) -> String {
        match self {
            Param::Plaintext(ty) => format!("plaintext {ty:?}"),
            Param::Encrypted(ty) => format!("encrypted {ty:?}"),
            Param::SharedKey => "shared key".into(),
            Param::Authority => "authority".into(),
            Param::ExternalState(_) => "external state".into(),
            Param::Tuple(params) => format!("tuple of {}", params.len()),
        }
    }
}

/// A logical argument value supplied by the caller.
#[derive(Clone, PartialEq, Eq)]
pub enum Value {
    Bool(bool),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    U128(u128),
    /// A client-side encrypted scalar.
    Ciphertext(Ciphertext),
    /// A client's public key together with the nonce its ciphertexts use.
    SharedKey { public_key: [u8; 32], nonce: u128 },
    /// Marker value for [`Param::Authority`].
    Authority,
    /// The record whose ciphertext region is read.
    External(StoreKey),
    Tuple(Vec<Value>),
}

impl Value {
    fn scalar(&self) -> Option<(ScalarType, u128)> {
        match *self {
            Value::Bool(v) => Some((ScalarType::Bool, v as u128)),
            Value::U8(v) => Some((ScalarType::U8, v as u128)),
            Value::U16(v) => Some((ScalarType::U16, v as u128)),
            Value::U32(v) => Some((ScalarType::U32, v as u128)),
            Value::U64(v) => Some((ScalarType::U64, v as u128)),
            Value::U128(v) => Some((ScalarType::U128, v)),
            _ => None,
        }
    }

    fn from_scalar(ty: ScalarType, value: u128) -> Self {
        // callers check `ty.fits(value)` first
        match ty {
            ScalarType::Bool => Value::Bool(value == 1),
            ScalarType::U8 => Value::U8(value as u8),
            ScalarType::U16 => Value::U16(value as u16),
            ScalarType::U32 => Value::U32(value as u32),
            ScalarType::U64 => Value::U64(value as u64),
            ScalarType::U128 => Value::U128(value),
        }
    }

    fn kind(&self) -> String {
        match self {
            Value::Ciphertext(_) => "ciphertext".into(),
            Value::SharedKey { .. } => "shared key".into(),
            Value::Authority => "authority".into(),
            Value::External(_) => "external record".into(),
            Value::Tuple(values) => format!("tuple of {}", values.len()),
            scalar => match scalar.scalar() {
                Some((ty, _)) => format!("plaintext {ty:?}"),
                None => unreachable!("all non-scalar variants are handled above"),
            },
        }
    }
}

impl Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Ciphertext(_) => write!(f, "Ciphertext(<{SLOT_LEN} bytes>)"),
            Value::SharedKey { nonce, .. } => f
                .debug_struct("SharedKey")
                .field("public_key", &"<32 bytes>")
                .field("nonce", nonce)
                .finish(),
            Value::Authority => write!(f, "Authority"),
            Value::External(key) => f.debug_tuple("External").field(key).finish(),
            Value::Tuple(values) => f.debug_list().entries(values).finish(),
            scalar => {
                let (ty, v) = scalar.scalar().expect("remaining variants are scalars");
                write!(f, "{ty:?}({v})")
            }
        }
    }
}

/// One segment of an [`EncodedArgument`].
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Segment {
    /// A little-endian plaintext scalar of `width` bytes.
    PlaintextScalar { width: u8, value: u128 },
    /// A 32-byte ciphertext slot.
    EncryptedScalar(Ciphertext),
    /// A client public key. Must be followed by a 16-byte plaintext nonce.
    SharedKeyMaterial([u8; 32]),
    /// A read of `length` bytes at `offset` of an external record.
    ExternalStateRead {
        key: StoreKey,
        offset: u32,
        length: u32,
    },
}

impl Segment {
    fn kind(&self) -> String {
        match self {
            Segment::PlaintextScalar { width, .. } => format!("{width}-byte plaintext"),
            Segment::EncryptedScalar(_) => "ciphertext".into(),
            Segment::SharedKeyMaterial(_) => "shared key material".into(),
            Segment::ExternalStateRead { .. } => "external read".into(),
        }
    }
}

impl Debug for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Segment::PlaintextScalar { width, .. } => write!(f, "PlaintextScalar({width})"),
            Segment::EncryptedScalar(_) => write!(f, "EncryptedScalar"),
            Segment::SharedKeyMaterial(_) => write!(f, "SharedKeyMaterial"),
            Segment::ExternalStateRead {
                key,
                offset,
                length,
            } => write!(f, "ExternalStateRead({key}, {offset}, {length})"),
        }
    }
}

/// The ordered segments passed to a circuit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodedArgument {
    segments: Vec<Segment>,
}

impl EncodedArgument {
    /// The segments in circuit parameter order.
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Returns true if the argument has no segments.
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// The inline bytes of all segments except external reads, in order.
    pub fn inline_bytes(&self) -> Vec<u8> {
        let mut bytes = vec![];
        for segment in &self.segments {
            match segment {
                Segment::PlaintextScalar { width, value } => {
                    bytes.extend_from_slice(&value.to_le_bytes()[..*width as usize])
                }
                Segment::EncryptedScalar(ct) => bytes.extend_from_slice(ct),
                Segment::SharedKeyMaterial(pk) => bytes.extend_from_slice(pk),
                Segment::ExternalStateRead { .. } => {}
            }
        }
        bytes
    }

    /// The external reads, in order.
    pub fn external_reads(&self) -> impl Iterator<Item = (&StoreKey, u32, u32)> {
        self.segments.iter().filter_map(|s| match s {
            Segment::ExternalStateRead {
                key,
                offset,
                length,
            } => Some((key, *offset, *length)),
            _ => None,
        })
    }
}

impl FromIterator<Segment> for EncodedArgument {
    fn from_iter<T: IntoIterator<Item = Segment>>(iter: T) -> Self {
        Self {
            segments: iter.into_iter().collect(),
        }
    }
}

/// Builds an [`EncodedArgument`] segment by segment.
///
/// The builder performs no checks, use [`validate`] against the circuit's
/// parameters before queueing.
#[derive(Debug, Default)]
pub struct ArgumentBuilder {
    segments: Vec<Segment>,
}

impl ArgumentBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn plaintext_bool(self, value: bool) -> Self {
        self.plaintext(ScalarType::Bool, value as u128)
    }

    pub fn plaintext_u8(self, value: u8) -> Self {
        self.plaintext(ScalarType::U8, value as u128)
    }

    pub fn plaintext_u16(self, value: u16) -> Self {
        self.plaintext(ScalarType::U16, value as u128)
    }

    pub fn plaintext_u32(self, value: u32) -> Self {
        self.plaintext(ScalarType::U32, value as u128)
    }

    pub fn plaintext_u64(self, value: u64) -> Self {
        self.plaintext(ScalarType::U64, value as u128)
    }

    pub fn plaintext_u128(self, value: u128) -> Self {
        self.plaintext(ScalarType::U128, value)
    }

    pub fn encrypted(mut self, ciphertext: Ciphertext) -> Self {
        self.segments.push(Segment::EncryptedScalar(ciphertext));
        self
    }

    /// Public key material. Must be followed by [`ArgumentBuilder::plaintext_u128`]
    /// carrying the nonce.
    pub fn shared_key(mut self, public_key: [u8; 32]) -> Self {
        self.segments.push(Segment::SharedKeyMaterial(public_key));
        self
    }

    pub fn external(mut self, key: StoreKey, offset: u32, length: u32) -> Self {
        self.segments.push(Segment::ExternalStateRead {
            key,
            offset,
            length,
        });
        self
    }

    /// Reads the full ciphertext region of a record with the given layout.
    pub fn external_record(mut self, key: StoreKey, layout: &RecordLayout) -> Self {
        self.segments.push(layout.external_read(key));
        self
    }

    pub fn build(self) -> EncodedArgument {
        EncodedArgument {
            segments: self.segments,
        }
    }

    fn plaintext(mut self, ty: ScalarType, value: u128) -> Self {
        self.segments.push(Segment::PlaintextScalar {
            width: ty.width(),
            value,
        });
        self
    }
}

/// Mismatch between supplied arguments and a circuit's declared parameters.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum EncodingError {
    #[error("expected {expected} arguments but got {actual}")]
    CountMismatch { expected: usize, actual: usize },
    #[error("parameter {param}: expected {expected} but got {found}")]
    TypeMismatch {
        param: usize,
        expected: String,
        found: String,
    },
    #[error("parameter {param}: shared key material is missing its paired nonce")]
    MissingNonce { param: usize },
    #[error(
        "parameter {param}: external read of {actual} bytes, expected 32 x {fields} = {expected}"
    )]
    ExternalReadLength {
        param: usize,
        fields: u32,
        expected: u32,
        actual: u32,
    },
    #[error("parameter {param}: external read starts at byte {actual}, expected {expected}")]
    ExternalReadOffset {
        param: usize,
        expected: u32,
        actual: u32,
    },
    #[error("parameter {param}: value {value} does not fit a {ty:?}")]
    ValueWidth {
        param: usize,
        ty: ScalarType,
        value: u128,
    },
}

/// Encodes logical values against the declared parameters.
pub fn encode(params: &[Param], values: &[Value]) -> Result<EncodedArgument, EncodingError> {
    let mut segments = vec![];
    let mut index = 0;
    encode_into(params, values, &mut index, &mut segments)?;
    Ok(EncodedArgument { segments })
}

fn encode_into(
    params: &[Param],
    values: &[Value],
    index: &mut usize,
    out: &mut Vec<Segment>,
) -> Result<(), EncodingError> {
    if params.len() != values.len() {
        return Err(EncodingError::CountMismatch {
            expected: params.len(),
            actual: values.len(),
        });
    }
    for (param, value) in params.iter().zip(values) {
        if let (Param::Tuple(params), Value::Tuple(values)) = (param, value) {
            encode_into(params, values, index, out)?;
            continue;
        }
        let param_idx = *index;
        *index += 1;
        let mismatch = || EncodingError::TypeMismatch {
            param: param_idx,
            expected: param.kind(),
            found: value.kind(),
        };
        match (param, value) {
            (Param::Plaintext(ty), value) => match value.scalar() {
                Some((found, v)) if found == *ty => out.push(Segment::PlaintextScalar {
                    width: ty.width(),
                    value: v,
                }),
                _ => return Err(mismatch()),
            },
            (Param::Encrypted(_), Value::Ciphertext(ct)) => {
                out.push(Segment::EncryptedScalar(*ct));
            }
            (Param::SharedKey, Value::SharedKey { public_key, nonce }) => {
                out.push(Segment::SharedKeyMaterial(*public_key));
                out.push(Segment::PlaintextScalar {
                    width: NONCE_WIDTH,
                    value: *nonce,
                });
            }
            (Param::Authority, Value::Authority) => {}
            (Param::ExternalState(layout), Value::External(key)) => {
                out.push(layout.external_read(key.clone()));
            }
            _ => return Err(mismatch()),
        }
    }
    Ok(())
}

/// Checks that `arg` has exactly the segment layout the parameters declare.
pub fn validate(params: &[Param], arg: &EncodedArgument) -> Result<(), EncodingError> {
    let mut cursor = Cursor::new(params, arg);
    let mut index = 0;
    walk(params, &mut cursor, &mut index, &mut |_| ())?;
    cursor.finish()
}

/// Decodes an encoded argument back into logical values.
///
/// Plaintext scalars, shared keys and ciphertexts are reproduced exactly. An
/// external read decodes to the [`Value::External`] key it refers to.
pub fn decode(params: &[Param], arg: &EncodedArgument) -> Result<Vec<Value>, EncodingError> {
    let mut cursor = Cursor::new(params, arg);
    let mut index = 0;
    let values = decode_tuple(params, &mut cursor, &mut index)?;
    cursor.finish()?;
    Ok(values)
}

fn decode_tuple(
    params: &[Param],
    cursor: &mut Cursor<'_>,
    index: &mut usize,
) -> Result<Vec<Value>, EncodingError> {
    let mut values = Vec::with_capacity(params.len());
    for param in params {
        if let Param::Tuple(params) = param {
            values.push(Value::Tuple(decode_tuple(params, cursor, index)?));
            continue;
        }
        let mut decoded = None;
        walk(std::slice::from_ref(param), cursor, index, &mut |v| {
            decoded = Some(v)
        })?;
        values.push(decoded.expect("walk emits one value per leaf parameter"));
    }
    Ok(values)
}

struct Cursor<'a> {
    segments: &'a [Segment],
    pos: usize,
    expected: usize,
}

impl<'a> Cursor<'a> {
    fn new(params: &[Param], arg: &'a EncodedArgument) -> Self {
        Self {
            segments: &arg.segments,
            pos: 0,
            expected: params.iter().map(Param::segment_count).sum(),
        }
    }

    fn count_mismatch(&self) -> EncodingError {
        EncodingError::CountMismatch {
            expected: self.expected,
            actual: self.segments.len(),
        }
    }

    fn next(&mut self) -> Option<&'a Segment> {
        let seg = self.segments.get(self.pos);
        self.pos += 1;
        seg
    }

    fn peek(&self) -> Option<&'a Segment> {
        self.segments.get(self.pos)
    }

    fn finish(&self) -> Result<(), EncodingError> {
        if self.pos == self.segments.len() {
            Ok(())
        } else {
            Err(self.count_mismatch())
        }
    }
}

fn walk(
    params: &[Param],
    cursor: &mut Cursor<'_>,
    index: &mut usize,
    emit: &mut dyn FnMut(Value),
) -> Result<(), EncodingError> {
    for param in params {
        if let Param::Tuple(params) = param {
            walk(params, cursor, index, emit)?;
            continue;
        }
        let param_idx = *index;
        *index += 1;
        if matches!(param, Param::Authority) {
            emit(Value::Authority);
            continue;
        }
        let Some(segment) = cursor.next() else {
            return Err(cursor.count_mismatch());
        };
        let mismatch = || EncodingError::TypeMismatch {
            param: param_idx,
            expected: param.kind(),
            found: segment.kind(),
        };
        match (param, segment) {
            (Param::Plaintext(ty), Segment::PlaintextScalar { width, value }) => {
                if *width != ty.width() {
                    return Err(mismatch());
                }
                if !ty.fits(*value) {
                    return Err(EncodingError::ValueWidth {
                        param: param_idx,
                        ty: *ty,
                        value: *value,
                    });
                }
                emit(Value::from_scalar(*ty, *value));
            }
            (Param::Encrypted(_), Segment::EncryptedScalar(ct)) => emit(Value::Ciphertext(*ct)),
            (Param::SharedKey, Segment::SharedKeyMaterial(public_key)) => match cursor.peek() {
                Some(Segment::PlaintextScalar {
                    width: NONCE_WIDTH,
                    value,
                }) => {
                    cursor.next();
                    emit(Value::SharedKey {
                        public_key: *public_key,
                        nonce: *value,
                    });
                }
                _ => return Err(EncodingError::MissingNonce { param: param_idx }),
            },
            (
                Param::ExternalState(layout),
                Segment::ExternalStateRead {
                    key,
                    offset,
                    length,
                },
            ) => {
                if *offset != layout.ciphertext_offset() {
                    return Err(EncodingError::ExternalReadOffset {
                        param: param_idx,
                        expected: layout.ciphertext_offset(),
                        actual: *offset,
                    });
                }
                let expected = layout.ciphertext_len();
                if *length != expected {
                    return Err(EncodingError::ExternalReadLength {
                        param: param_idx,
                        fields: layout.encrypted_fields,
                        expected,
                        actual: *length,
                    });
                }
                emit(Value::External(key.clone()));
            }
            _ => return Err(mismatch()),
        }
    }
    Ok(())
}
