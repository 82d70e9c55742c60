//! `COSE_Sign1` encoding, signing and verification of numeric payloads.
//!
//! Wire layout of a signed value:
//!
//! ```text
//! 18([                          ; COSE_Sign1 tag
//!   h'a10126',                  ; protected: { 1 (alg): -7 (ES256) }
//!   {},                         ; unprotected
//!   h'a13a0001387f44<f32 le>',  ; payload: { -80000: h'<4 bytes>' }
//!   h'<r || s>'                 ; 64-byte ECDSA P-256 signature
//! ])
//! ```
//!
//! The signature covers the SHA-256 of the CBOR encoding of
//! `["Signature1", protected, h'', payload]`.

use ciborium::value::{Integer, Value};
use p256::ecdsa::signature::Verifier;
use p256::ecdsa::{Signature, VerifyingKey};

use crate::error::{IdentityError, IdentityResult};
use crate::partition::{EncodeFormat, SecureService, SIGNATURE_LEN};
use crate::registry::{KeyId, KeyRegistry};

/// CBOR tag for `COSE_Sign1`.
pub const COSE_SIGN1_TAG: u64 = 18;

/// Header label for the algorithm.
const HEADER_ALG: i64 = 1;

/// ES256 algorithm identifier.
const ALG_ES256: i64 = -7;

/// Claim label carrying the inference value.
pub const EAT_INFERENCE_CLAIM: i64 = -80000;

/// Context string for single-signer signatures.
const SIGNATURE1_CONTEXT: &str = "Signature1";

fn to_cbor(value: &Value) -> IdentityResult<Vec<u8>> {
    let mut bytes = Vec::new();
    ciborium::ser::into_writer(value, &mut bytes).map_err(|_| IdentityError::EncodingFailed)?;
    Ok(bytes)
}

fn int(value: i64) -> Value {
    Value::Integer(Integer::from(value))
}

fn is_int(value: &Value, expected: i64) -> bool {
    matches!(value, Value::Integer(i) if i128::from(*i) == i128::from(expected))
}

/// CBOR-encodes `value` as the claim map `{-80000: h'<f32 le>'}`.
///
/// # Errors
///
/// Returns `EncodingFailed` if the CBOR encoder fails.
pub fn encode_payload(value: f32) -> IdentityResult<Vec<u8>> {
    to_cbor(&Value::Map(vec![(
        int(EAT_INFERENCE_CLAIM),
        Value::Bytes(value.to_le_bytes().to_vec()),
    )]))
}

#[allow(clippy::cast_possible_truncation)]
fn narrow(value: f64) -> f32 {
    value as f32
}

/// Decodes a payload back to the float it carries.
///
/// Accepts the claim map produced by [`encode_payload`] and a bare CBOR
/// float.
///
/// # Errors
///
/// Returns `PayloadDecodeFailed` for anything else.
pub fn decode_payload(payload: &[u8]) -> IdentityResult<f32> {
    let value = parse_exact(payload).map_err(|_| IdentityError::PayloadDecodeFailed)?;
    match value {
        Value::Float(f) => Ok(narrow(f)),
        Value::Map(entries) => entries
            .iter()
            .find(|(key, _)| is_int(key, EAT_INFERENCE_CLAIM))
            .and_then(|(_, v)| match v {
                Value::Bytes(b) => <[u8; 4]>::try_from(b.as_slice()).ok(),
                _ => None,
            })
            .map(f32::from_le_bytes)
            .ok_or(IdentityError::PayloadDecodeFailed),
        _ => Err(IdentityError::PayloadDecodeFailed),
    }
}

/// The encoded protected header `{1: -7}`.
///
/// # Errors
///
/// Returns `EncodingFailed` if the CBOR encoder fails.
pub fn protected_header() -> IdentityResult<Vec<u8>> {
    to_cbor(&Value::Map(vec![(int(HEADER_ALG), int(ALG_ES256))]))
}

/// Encodes the `Sig_structure` that is hashed and signed.
///
/// # Errors
///
/// Returns `EncodingFailed` if the CBOR encoder fails.
pub fn sig_structure(protected: &[u8], payload: &[u8]) -> IdentityResult<Vec<u8>> {
    to_cbor(&Value::Array(vec![
        Value::Text(SIGNATURE1_CONTEXT.to_string()),
        Value::Bytes(protected.to_vec()),
        Value::Bytes(Vec::new()),
        Value::Bytes(payload.to_vec()),
    ]))
}

/// Wraps `payload` in a tagged `COSE_Sign1`, signing with `sign`.
///
/// `sign` receives the encoded `Sig_structure` and must return the raw
/// `r || s` ECDSA-SHA256 signature over it.
///
/// # Errors
///
/// Propagates `sign` failures; `EncodingFailed` if CBOR encoding fails.
pub fn sign1<F>(payload: &[u8], sign: F) -> IdentityResult<Vec<u8>>
where
    F: FnOnce(&[u8]) -> IdentityResult<[u8; SIGNATURE_LEN]>,
{
    let protected = protected_header()?;
    let to_be_signed = sig_structure(&protected, payload)?;
    let signature = sign(&to_be_signed)?;

    to_cbor(&Value::Tag(
        COSE_SIGN1_TAG,
        Box::new(Value::Array(vec![
            Value::Bytes(protected),
            Value::Map(Vec::new()),
            Value::Bytes(payload.to_vec()),
            Value::Bytes(signature.to_vec()),
        ])),
    ))
}

/// Encodes `value` through the partition in `format` and copies the result
/// into `out`.
///
/// Returns the number of bytes written. `out` is untouched on error.
///
/// # Errors
///
/// - `UnknownKeyId` if `key_id` is not a registry slot.
/// - `SigningFailed` if the partition cannot sign.
/// - `BufferTooSmall` if `out` cannot hold the encoded structure.
pub fn encode<S: SecureService + ?Sized>(
    service: &S,
    registry: &KeyRegistry,
    key_id: KeyId,
    value: f32,
    format: EncodeFormat,
    out: &mut [u8],
) -> IdentityResult<usize> {
    registry.lookup(key_id)?;
    let encoded = service
        .cbor_encode_and_sign(key_id, value, format)
        .map_err(IdentityError::into_signing_failure)?;
    if encoded.len() > out.len() {
        log::error!(
            "encoded payload needs {} bytes, buffer holds {}",
            encoded.len(),
            out.len()
        );
        return Err(IdentityError::BufferTooSmall);
    }
    out[..encoded.len()].copy_from_slice(&encoded);
    Ok(encoded.len())
}

/// Encodes `value` as a signed `COSE_Sign1` into `out`.
///
/// # Errors
///
/// See [`encode`].
pub fn encode_and_sign<S: SecureService + ?Sized>(
    service: &S,
    registry: &KeyRegistry,
    key_id: KeyId,
    value: f32,
    out: &mut [u8],
) -> IdentityResult<usize> {
    encode(service, registry, key_id, value, EncodeFormat::CoseSign1, out)
}

fn parse_exact(bytes: &[u8]) -> Result<Value, ()> {
    let mut reader = bytes;
    let value: Value = ciborium::de::from_reader(&mut reader).map_err(|_| ())?;
    if reader.is_empty() {
        Ok(value)
    } else {
        Err(())
    }
}

/// Fields of a structurally valid `COSE_Sign1`.
struct Sign1Parts {
    protected: Vec<u8>,
    payload: Vec<u8>,
    signature: Vec<u8>,
}

fn parse_sign1(cose: &[u8]) -> IdentityResult<Sign1Parts> {
    let malformed = |_| IdentityError::MalformedCose;

    let Value::Tag(COSE_SIGN1_TAG, inner) = parse_exact(cose).map_err(malformed)? else {
        return Err(IdentityError::MalformedCose);
    };
    let Value::Array(items) = *inner else {
        return Err(IdentityError::MalformedCose);
    };
    let items: [Value; 4] = items
        .try_into()
        .map_err(|_| IdentityError::MalformedCose)?;
    let [protected, unprotected, payload, signature] = items;

    let (
        Value::Bytes(protected),
        Value::Map(_),
        Value::Bytes(payload),
        Value::Bytes(signature),
    ) = (protected, unprotected, payload, signature)
    else {
        return Err(IdentityError::MalformedCose);
    };

    let Value::Map(headers) = parse_exact(&protected).map_err(malformed)? else {
        return Err(IdentityError::MalformedCose);
    };
    let es256 = headers
        .iter()
        .any(|(label, alg)| is_int(label, HEADER_ALG) && is_int(alg, ALG_ES256));
    if !es256 || signature.len() != SIGNATURE_LEN {
        return Err(IdentityError::MalformedCose);
    }

    Ok(Sign1Parts {
        protected,
        payload,
        signature,
    })
}

/// Verifies a `COSE_Sign1` against a raw SEC1 public key and returns the
/// float it carries.
///
/// Structure is checked completely before any cryptographic work.
///
/// # Errors
///
/// - `InvalidInput` if `public_key` is not a P-256 point.
/// - `MalformedCose` if `cose` is not a tagged ES256 `COSE_Sign1`.
/// - `SignatureInvalid` if the signature does not verify.
/// - `PayloadDecodeFailed` if the verified payload is not a float.
pub fn verify(cose: &[u8], public_key: &[u8]) -> IdentityResult<f32> {
    let verifying_key = VerifyingKey::from_sec1_bytes(public_key)
        .map_err(|_| IdentityError::invalid_input("public key is not a P-256 point"))?;

    let parts = parse_sign1(cose)?;

    let to_be_signed = sig_structure(&parts.protected, &parts.payload)
        .map_err(|_| IdentityError::MalformedCose)?;
    let signature =
        Signature::from_slice(&parts.signature).map_err(|_| IdentityError::SignatureInvalid)?;
    verifying_key
        .verify(&to_be_signed, &signature)
        .map_err(|_| IdentityError::SignatureInvalid)?;

    decode_payload(&parts.payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::EmulatedPartition;

    fn provisioned() -> (EmulatedPartition, KeyRegistry) {
        let partition = EmulatedPartition::new([6u8; 32]);
        let registry = KeyRegistry::new();
        registry.init(&partition);
        (partition, registry)
    }

    #[test]
    fn test_payload_encoding() {
        let payload = encode_payload(1.0).expect("encode");
        assert_eq!(
            payload,
            [0xA1, 0x3A, 0x00, 0x01, 0x38, 0x7F, 0x44, 0x00, 0x00, 0x80, 0x3F]
        );
        assert_eq!(decode_payload(&payload), Ok(1.0));
    }

    #[test]
    fn test_protected_header_bytes() {
        assert_eq!(protected_header().expect("encode"), [0xA1, 0x01, 0x26]);
    }

    #[test]
    fn test_bare_float_payload() {
        // 0xfa: single-precision float 1.5
        assert_eq!(decode_payload(&[0xFA, 0x3F, 0xC0, 0x00, 0x00]), Ok(1.5));
    }

    #[test]
    fn test_payload_wrong_shape() {
        assert_eq!(
            decode_payload(&[0xA1, 0x01, 0x02]),
            Err(IdentityError::PayloadDecodeFailed)
        );
        assert_eq!(
            decode_payload(&[0x61, 0x78]),
            Err(IdentityError::PayloadDecodeFailed)
        );
    }

    #[test]
    fn test_sign1_layout() {
        let (partition, registry) = provisioned();
        let mut out = [0u8; 256];
        let len = encode_and_sign(&partition, &registry, KeyId::COSE_SIGN, 0.5, &mut out)
            .expect("sign");
        let cose = &out[..len];
        assert_eq!(&cose[..8], &[0xD2, 0x84, 0x43, 0xA1, 0x01, 0x26, 0xA0, 0x4B]);
        assert_eq!(&cose[19..21], &[0x58, 0x40]);
        assert_eq!(len, 21 + 64);
    }

    #[test]
    fn test_roundtrip() {
        let (partition, registry) = provisioned();
        let public_key = partition.export_pubkey(KeyId::COSE_SIGN).expect("export");
        let mut out = [0u8; 256];
        let len = encode_and_sign(&partition, &registry, KeyId::COSE_SIGN, -3.25, &mut out)
            .expect("sign");
        let value = verify(&out[..len], &public_key).expect("verify");
        assert_eq!(value.to_bits(), (-3.25f32).to_bits());
    }

    #[test]
    fn test_wrong_key_is_signature_invalid() {
        let (partition, registry) = provisioned();
        let other = partition.export_pubkey(KeyId::CLIENT_TLS).expect("export");
        let mut out = [0u8; 256];
        let len = encode_and_sign(&partition, &registry, KeyId::COSE_SIGN, 2.0, &mut out)
            .expect("sign");
        assert_eq!(
            verify(&out[..len], &other),
            Err(IdentityError::SignatureInvalid)
        );
    }

    #[test]
    fn test_buffer_too_small() {
        let (partition, registry) = provisioned();
        let mut out = [0xEEu8; 32];
        assert_eq!(
            encode_and_sign(&partition, &registry, KeyId::COSE_SIGN, 2.0, &mut out),
            Err(IdentityError::BufferTooSmall)
        );
        assert!(out.iter().all(|&b| b == 0xEE));
    }

    #[test]
    fn test_plain_cbor_format() {
        let (partition, registry) = provisioned();
        let mut out = [0u8; 32];
        let len = encode(
            &partition,
            &registry,
            KeyId::COSE_SIGN,
            7.0,
            EncodeFormat::Cbor,
            &mut out,
        )
        .expect("encode");
        assert_eq!(decode_payload(&out[..len]), Ok(7.0));
    }

    #[test]
    fn test_encrypt_key_cannot_sign() {
        let (partition, registry) = provisioned();
        let mut out = [0u8; 256];
        assert_eq!(
            encode_and_sign(&partition, &registry, KeyId::COSE_ENCRYPT, 1.0, &mut out),
            Err(IdentityError::SigningFailed)
        );
    }

    #[test]
    fn test_rejects_non_cose_before_crypto() {
        let (partition, _) = provisioned();
        let public_key = partition.export_pubkey(KeyId::COSE_SIGN).expect("export");
        let inputs: [&[u8]; 5] = [
            &[],
            &[0x00],
            &[0xD2, 0x80],
            &[0xD3, 0x80],
            &[0x84, 0x40, 0xA0, 0x40, 0x40],
        ];
        for input in inputs {
            assert_eq!(verify(input, &public_key), Err(IdentityError::MalformedCose));
        }
    }

    #[test]
    fn test_rejects_trailing_bytes() {
        let (partition, registry) = provisioned();
        let public_key = partition.export_pubkey(KeyId::COSE_SIGN).expect("export");
        let mut out = [0u8; 256];
        let len = encode_and_sign(&partition, &registry, KeyId::COSE_SIGN, 1.0, &mut out)
            .expect("sign");
        assert_eq!(
            verify(&out[..=len], &public_key),
            Err(IdentityError::MalformedCose)
        );
    }

    #[test]
    fn test_rejects_other_algorithm() {
        let (partition, _) = provisioned();
        let public_key = partition.export_pubkey(KeyId::COSE_SIGN).expect("export");
        let cose = to_cbor(&Value::Tag(
            COSE_SIGN1_TAG,
            Box::new(Value::Array(vec![
                Value::Bytes(vec![0xA1, 0x01, 0x27]),
                Value::Map(Vec::new()),
                Value::Bytes(encode_payload(1.0).expect("payload")),
                Value::Bytes(vec![1u8; 64]),
            ])),
        ))
        .expect("encode");
        assert_eq!(verify(&cose, &public_key), Err(IdentityError::MalformedCose));
    }
}
