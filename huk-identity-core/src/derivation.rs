//! Identity derivation on top of the hardware unique key.
//!
//! The derivation primitive only produces symmetric-key-sized blocks, so the
//! 32-byte P-256 scalar for a key purpose is built from two 16-byte
//! derivations under distinct labels:
//!
//! ```text
//! scalar = derive(label || "_EC_PRIV_KEY_HI" || suffix, 16)
//!       || derive(label || "_EC_PRIV_KEY_LO" || suffix, 16)
//! ```
//!
//! The device UUID is a single 16-byte derivation under `"UUID" || suffix`
//! with the RFC 4122 version 4 and variant bits forced.

use uuid::Uuid;
use zeroize::Zeroizing;

use crate::error::{IdentityError, IdentityResult};
use crate::partition::{SecureService, MIN_DERIVATION_LEN};

/// Label suffix for the high half of an EC private key.
const LABEL_EC_PRIV_KEY_HI: &str = "_EC_PRIV_KEY_HI";

/// Label suffix for the low half of an EC private key.
const LABEL_EC_PRIV_KEY_LO: &str = "_EC_PRIV_KEY_LO";

/// Label for the device UUID.
pub const LABEL_UUID: &str = "UUID";

/// Length of a hyphenated UUID string.
pub const UUID_STR_LEN: usize = 36;

/// Half of a P-256 scalar.
const HALF_KEY_LEN: usize = MIN_DERIVATION_LEN;

/// Builds key and UUID material from the derivation primitive.
pub struct IdentityDeriver<'a, S: SecureService + ?Sized> {
    service: &'a S,
}

impl<'a, S: SecureService + ?Sized> IdentityDeriver<'a, S> {
    /// Wraps a secure service.
    pub const fn new(service: &'a S) -> Self {
        Self { service }
    }

    fn label(&self, base: &str, part: &str) -> String {
        format!("{base}{part}{}", self.service.label_suffix())
    }

    fn derive_half(&self, label: &str) -> IdentityResult<Zeroizing<Vec<u8>>> {
        let half = self.service.derive_bytes(label.as_bytes(), HALF_KEY_LEN)?;
        if half.len() != HALF_KEY_LEN {
            log::error!("derivation for {label} returned {} bytes", half.len());
            return Err(IdentityError::BufferTooSmall);
        }
        Ok(half)
    }

    /// Derives the 32-byte P-256 private scalar for a key purpose.
    ///
    /// Either half failing fails the whole derivation.
    ///
    /// # Errors
    ///
    /// Propagates the derivation primitive's error. A half that is not
    /// exactly 16 bytes is rejected with `BufferTooSmall`.
    pub fn ec_private_key(&self, purpose_label: &str) -> IdentityResult<Zeroizing<[u8; 32]>> {
        let hi = self.derive_half(&self.label(purpose_label, LABEL_EC_PRIV_KEY_HI))?;
        let lo = self.derive_half(&self.label(purpose_label, LABEL_EC_PRIV_KEY_LO))?;

        let mut scalar = Zeroizing::new([0u8; 32]);
        scalar[..HALF_KEY_LEN].copy_from_slice(&hi);
        scalar[HALF_KEY_LEN..].copy_from_slice(&lo);
        Ok(scalar)
    }

    /// Derives the 16 UUID bytes with version and variant bits applied.
    ///
    /// # Errors
    ///
    /// Propagates the derivation primitive's error.
    pub fn uuid_bytes(&self) -> IdentityResult<[u8; 16]> {
        let raw = self.derive_half(&self.label(LABEL_UUID, ""))?;
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&raw);
        Ok(apply_uuid_v4_bits(bytes))
    }

    /// Derives the device UUID rendered as lowercase 8-4-4-4-12 hex.
    ///
    /// # Errors
    ///
    /// Propagates the derivation primitive's error.
    pub fn uuid(&self) -> IdentityResult<String> {
        Ok(format_uuid(self.uuid_bytes()?))
    }
}

/// Forces the RFC 4122 version 4 and variant `10` bits.
#[must_use]
pub const fn apply_uuid_v4_bits(mut bytes: [u8; 16]) -> [u8; 16] {
    bytes[6] = (bytes[6] & 0x0F) | 0x40;
    bytes[8] = (bytes[8] & 0x3F) | 0x80;
    bytes
}

/// Renders UUID bytes in canonical lowercase hyphenated form.
#[must_use]
pub fn format_uuid(bytes: [u8; 16]) -> String {
    Uuid::from_bytes(bytes).hyphenated().to_string()
}
