//! CBOR messages exchanged with the certificate authority.
//!
//! The request carries the CSR as `{1: h'<csr der>'}`. The response is a
//! map with integer keys in ascending order:
//!
//! | key | value                 |
//! |-----|-----------------------|
//! | 1   | status (uint)         |
//! | 2   | certificate (bstr)    |
//! | 3   | hub name (tstr)       |
//! | 4   | hub port (uint)       |

use ciborium::value::{Integer, Value};

use crate::error::{IdentityError, IdentityResult};
use crate::provision::{ProvisionRecord, Provisioner};
use crate::registry::{KeyId, KeyRegistry};

// request
const KEY_CSR: u64 = 1;

// response
const KEY_STATUS: u64 = 1;
const KEY_CERT: u64 = 2;
const KEY_HUBNAME: u64 = 3;
const KEY_HUBPORT: u64 = 4;

/// Decoded CA response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaResponse {
    /// Status reported by the CA. Not interpreted.
    pub status: u64,
    /// DER-encoded device certificate.
    pub cert_der: Vec<u8>,
    /// Hub host name.
    pub hubname: String,
    /// Hub port.
    pub hubport: u16,
}

impl From<CaResponse> for ProvisionRecord {
    fn from(response: CaResponse) -> Self {
        Self {
            cert_der: response.cert_der,
            hubname: response.hubname,
            hubport: response.hubport,
        }
    }
}

/// Encodes a certificate request for `csr_der`.
///
/// # Errors
///
/// Returns `EncodingFailed` if the CBOR encoder fails.
pub fn encode_ca_request(csr_der: &[u8]) -> IdentityResult<Vec<u8>> {
    let request = Value::Map(vec![(
        Value::Integer(Integer::from(KEY_CSR)),
        Value::Bytes(csr_der.to_vec()),
    )]);
    let mut bytes = Vec::new();
    ciborium::ser::into_writer(&request, &mut bytes).map_err(|_| IdentityError::EncodingFailed)?;
    Ok(bytes)
}

fn key_of(value: &Value) -> Option<u64> {
    match value {
        Value::Integer(i) => u64::try_from(*i).ok(),
        _ => None,
    }
}

fn uint(value: Value, field: &str) -> IdentityResult<u64> {
    key_of(&value).ok_or_else(|| IdentityError::invalid_input(format!("{field} is not a uint")))
}

/// Decodes a CA response.
///
/// # Errors
///
/// - `Serialization` if `bytes` is not CBOR.
/// - `InvalidInput` if the map does not carry exactly keys 1 to 4 in
///   order with the expected value types.
pub fn decode_ca_response(bytes: &[u8]) -> IdentityResult<CaResponse> {
    let value: Value = ciborium::de::from_reader(bytes).map_err(IdentityError::serialization)?;
    let Value::Map(entries) = value else {
        return Err(IdentityError::invalid_input("CA response is not a map"));
    };
    let entries: [(Value, Value); 4] = entries.try_into().map_err(|entries: Vec<_>| {
        IdentityError::invalid_input(format!(
            "CA response has {} entries, expected 4",
            entries.len()
        ))
    })?;

    let mut status = None;
    let mut cert_der = None;
    let mut hubname = None;
    let mut hubport = None;

    for (expected, (key, value)) in (KEY_STATUS..=KEY_HUBPORT).zip(entries) {
        if key_of(&key) != Some(expected) {
            return Err(IdentityError::invalid_input(format!(
                "expected CA response key {expected}"
            )));
        }
        match (expected, value) {
            (KEY_STATUS, value) => status = Some(uint(value, "status")?),
            (KEY_CERT, Value::Bytes(cert)) => cert_der = Some(cert),
            (KEY_HUBNAME, Value::Text(name)) => hubname = Some(name),
            (KEY_HUBPORT, value) => {
                let port = u16::try_from(uint(value, "hub port")?)
                    .map_err(|_| IdentityError::invalid_input("hub port out of range"))?;
                hubport = Some(port);
            }
            (key, _) => {
                return Err(IdentityError::invalid_input(format!(
                    "CA response key {key} has the wrong type"
                )))
            }
        }
    }

    match (status, cert_der, hubname, hubport) {
        (Some(status), Some(cert_der), Some(hubname), Some(hubport)) => Ok(CaResponse {
            status,
            cert_der,
            hubname,
            hubport,
        }),
        _ => Err(IdentityError::invalid_input("incomplete CA response")),
    }
}

/// Decodes a CA response, hands the record to waiting threads and marks
/// the TLS key as certified.
///
/// # Errors
///
/// See [`decode_ca_response`]. Nothing is stored if decoding fails.
pub fn apply_ca_response(
    bytes: &[u8],
    provisioner: &Provisioner,
    registry: &KeyRegistry,
) -> IdentityResult<()> {
    let response = decode_ca_response(bytes)?;
    log::debug!("CA response status {}", response.status);
    provisioner.store(response.into());
    if let Err(err) = registry.mark_certificate_issued(KeyId::CLIENT_TLS) {
        log::warn!("certificate stored but TLS key state not updated: {err}");
    }
    Ok(())
}
