//! Public key export in raw, `SubjectPublicKeyInfo` DER and PEM form.

use crate::der::{der_to_pem, DerWriter};
use crate::error::{IdentityError, IdentityResult};
use crate::partition::{SecureService, PUBLIC_KEY_LEN};
use crate::registry::{KeyId, KeyRegistry, KeyStatus};

/// id-ecPublicKey, 1.2.840.10045.2.1
pub const OID_EC_PUBLIC_KEY: &[u8] = &[0x2A, 0x86, 0x48, 0xCE, 0x3D, 0x02, 0x01];

/// prime256v1, 1.2.840.10045.3.1.7
pub const OID_PRIME256V1: &[u8] = &[0x2A, 0x86, 0x48, 0xCE, 0x3D, 0x03, 0x01, 0x07];

/// PEM label for a `SubjectPublicKeyInfo`.
pub const PEM_LABEL_PUBLIC_KEY: &str = "PUBLIC KEY";

/// Exports the raw `0x04 || X || Y` public key of a registered key.
///
/// # Errors
///
/// - `UnknownKeyId` if `key_id` is not a registry slot.
/// - `ExportFailed` if the slot holds no key or the partition no longer
///   knows the handle.
pub fn export_pubkey<S: SecureService + ?Sized>(
    service: &S,
    registry: &KeyRegistry,
    key_id: KeyId,
) -> IdentityResult<[u8; PUBLIC_KEY_LEN]> {
    let context = registry.context(key_id)?;
    if context.status() == KeyStatus::NotProvisioned {
        return Err(IdentityError::ExportFailed);
    }
    let public_key = service.export_pubkey(key_id).map_err(|err| match err {
        IdentityError::TransportUnavailable => err,
        _ => IdentityError::ExportFailed,
    })?;
    if public_key[0] != 0x04 {
        return Err(IdentityError::ExportFailed);
    }
    Ok(public_key)
}

/// Prepends a `SubjectPublicKeyInfo` for a raw P-256 public key.
///
/// ```text
/// SEQUENCE {
///   SEQUENCE { OID ecPublicKey, OID prime256v1 }
///   BIT STRING 0x00 || 0x04 || X || Y
/// }
/// ```
///
/// # Errors
///
/// Returns `BufferTooSmall` if the structure does not fit.
pub fn write_pubkey_der(
    w: &mut DerWriter<'_>,
    public_key: &[u8; PUBLIC_KEY_LEN],
) -> IdentityResult<usize> {
    let mut len = w.write_bit_string(public_key)?;

    let mut alg_len = w.write_oid(OID_PRIME256V1)?;
    alg_len += w.write_oid(OID_EC_PUBLIC_KEY)?;
    alg_len += w.write_sequence_header(alg_len)?;
    len += alg_len;

    len += w.write_sequence_header(len)?;
    Ok(len)
}

/// Encodes a raw public key as a DER `SubjectPublicKeyInfo`.
///
/// # Errors
///
/// Returns `EncodingFailed` if encoding fails.
pub fn public_key_der(public_key: &[u8; PUBLIC_KEY_LEN]) -> IdentityResult<Vec<u8>> {
    let mut buf = [0u8; 128];
    let mut w = DerWriter::new(&mut buf);
    write_pubkey_der(&mut w, public_key).map_err(|_| IdentityError::EncodingFailed)?;
    Ok(w.written().to_vec())
}

/// Encodes a raw public key as a PEM `PUBLIC KEY` record.
///
/// # Errors
///
/// Returns `EncodingFailed` if encoding fails.
pub fn public_key_pem(public_key: &[u8; PUBLIC_KEY_LEN]) -> IdentityResult<String> {
    Ok(der_to_pem(PEM_LABEL_PUBLIC_KEY, &public_key_der(public_key)?))
}
