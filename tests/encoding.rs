use mpc_orchestrator::encoding::{
    EncodedArgument, EncodingError, Param, ScalarType, Value, decode, encode, validate,
};
use proptest::prelude::*;

fn leaf() -> impl Strategy<Value = (Param, Value)> {
    prop_oneof![
        any::<bool>().prop_map(|v| (Param::Plaintext(ScalarType::Bool), Value::Bool(v))),
        any::<u8>().prop_map(|v| (Param::Plaintext(ScalarType::U8), Value::U8(v))),
        any::<u16>().prop_map(|v| (Param::Plaintext(ScalarType::U16), Value::U16(v))),
        any::<u32>().prop_map(|v| (Param::Plaintext(ScalarType::U32), Value::U32(v))),
        any::<u64>().prop_map(|v| (Param::Plaintext(ScalarType::U64), Value::U64(v))),
        any::<u128>().prop_map(|v| (Param::Plaintext(ScalarType::U128), Value::U128(v))),
        any::<[u8; 32]>().prop_map(|ct| (Param::Encrypted(ScalarType::U64), Value::Ciphertext(ct))),
        (any::<[u8; 32]>(), any::<u128>()).prop_map(|(public_key, nonce)| {
            (Param::SharedKey, Value::SharedKey { public_key, nonce })
        }),
        Just((Param::Authority, Value::Authority)),
    ]
}

fn param() -> impl Strategy<Value = (Param, Value)> {
    leaf().prop_recursive(3, 24, 4, |inner| {
        prop::collection::vec(inner, 0..4).prop_map(|fields| {
            let (params, values) = fields.into_iter().unzip();
            (Param::Tuple(params), Value::Tuple(values))
        })
    })
}

proptest! {
    #[test]
    fn encoding_round_trips(fields in prop::collection::vec(param(), 0..6)) {
        let (params, values): (Vec<_>, Vec<_>) = fields.into_iter().unzip();
        let arg = encode(&params, &values).unwrap();
        prop_assert_eq!(
            arg.segments().len(),
            params.iter().map(Param::segment_count).sum::<usize>()
        );
        prop_assert_eq!(validate(&params, &arg), Ok(()));
        prop_assert_eq!(decode(&params, &arg).unwrap(), values);
    }

    #[test]
    fn dropping_a_segment_never_validates(
        fields in prop::collection::vec(param(), 1..6),
        drop in any::<prop::sample::Index>(),
    ) {
        let (params, values): (Vec<_>, Vec<_>) = fields.into_iter().unzip();
        let arg = encode(&params, &values).unwrap();
        prop_assume!(!arg.is_empty());
        let mut segments = arg.segments().to_vec();
        segments.remove(drop.index(segments.len()));
        let truncated: EncodedArgument = segments.into_iter().collect();
        prop_assert!(validate(&params, &truncated).is_err());
    }
}

#[test]
fn mismatched_scalar_type_is_rejected() {
    assert!(matches!(
        encode(&[Param::Plaintext(ScalarType::U16)], &[Value::U32(1)]),
        Err(EncodingError::TypeMismatch { param: 0, .. })
    ));
}
