//! The secure-partition call surface.
//!
//! Private key material never leaves an implementation of [`SecureService`].
//! The rest of the crate only sees derived bytes, public keys, signatures and
//! encoded payloads, which is the contract a hardware-isolated partition
//! offers over its request/response channel.

mod emulated;
pub use emulated::EmulatedPartition;

use std::ops::BitOr;

use strum::{Display, EnumString};
use zeroize::Zeroizing;

use crate::derivation::IdentityDeriver;
use crate::error::IdentityResult;
use crate::registry::KeyId;

/// Smallest output the derivation primitive accepts, in bytes.
pub const MIN_DERIVATION_LEN: usize = 16;

/// Largest output the derivation primitive produces per call, in bytes.
pub const MAX_DERIVATION_LEN: usize = 32;

/// Length of a raw uncompressed P-256 public key (`0x04 || X || Y`).
pub const PUBLIC_KEY_LEN: usize = 65;

/// Length of a raw `r || s` P-256 signature.
pub const SIGNATURE_LEN: usize = 64;

/// Permitted operations for an imported key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyUsage(u32);

impl KeyUsage {
    /// Sign a message hash.
    pub const SIGN_HASH: Self = Self(0x0000_1000);
    /// Verify a message hash.
    pub const VERIFY_HASH: Self = Self(0x0000_2000);
    /// Encrypt.
    pub const ENCRYPT: Self = Self(0x0000_0100);

    /// Whether every bit of `other` is set in `self`.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Raw flag bits.
    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }
}

impl BitOr for KeyUsage {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Output format for [`SecureService::cbor_encode_and_sign`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum EncodeFormat {
    /// The CBOR claim map only, unsigned.
    Cbor,
    /// A complete tagged `COSE_Sign1` message.
    #[strum(serialize = "cose", serialize = "cose_sign1")]
    CoseSign1,
}

/// Operations offered by the secure partition.
///
/// Every call either succeeds completely or returns an error; callers never
/// observe partial success. Implementations must be safe to share between
/// the application thread and a network callback thread.
pub trait SecureService: Send + Sync {
    /// Derives `out_len` pseudorandom bytes from the hardware unique key.
    ///
    /// # Arguments
    ///
    /// * `label` - Domain-separation label. Identical labels always yield
    ///   identical output for the life of the hardware key.
    /// * `out_len` - Number of bytes to derive.
    ///
    /// # Errors
    ///
    /// - `BufferTooSmall` if `out_len` is below [`MIN_DERIVATION_LEN`].
    /// - `DerivationUnavailable` if the hardware key service is unreachable.
    fn derive_bytes(&self, label: &[u8], out_len: usize) -> IdentityResult<Zeroizing<Vec<u8>>>;

    /// Imports a raw 32-byte P-256 scalar as a persistent key pair.
    ///
    /// Re-importing the identical scalar under the same id is accepted.
    ///
    /// # Errors
    ///
    /// Returns `ImportFailed` if the scalar is not a valid private key or if
    /// different material is already stored under `key_id`.
    fn import_ec_key(
        &self,
        key_id: KeyId,
        usage: KeyUsage,
        scalar: &[u8; 32],
    ) -> IdentityResult<()>;

    /// Returns the raw uncompressed public key for `key_id`.
    ///
    /// # Errors
    ///
    /// Returns `ExportFailed` if no key is held under `key_id`.
    fn export_pubkey(&self, key_id: KeyId) -> IdentityResult<[u8; PUBLIC_KEY_LEN]>;

    /// Hashes `message` with SHA-256 and signs it with `key_id`.
    ///
    /// The partition only signs certificate request bodies: `message` must
    /// be a single DER SEQUENCE whose declared length covers the rest of
    /// the input exactly.
    ///
    /// # Errors
    ///
    /// Returns `SigningFailed` if the key is missing, lacks the sign usage,
    /// or the message is rejected.
    fn hash_and_sign(&self, key_id: KeyId, message: &[u8]) -> IdentityResult<[u8; SIGNATURE_LEN]>;

    /// CBOR-encodes `value` and, for [`EncodeFormat::CoseSign1`], wraps and
    /// signs it with `key_id`.
    ///
    /// # Errors
    ///
    /// Returns `SigningFailed` on any signing failure, or `EncodingFailed`
    /// if the CBOR encoder fails.
    fn cbor_encode_and_sign(
        &self,
        key_id: KeyId,
        value: f32,
        format: EncodeFormat,
    ) -> IdentityResult<Vec<u8>>;

    /// Returns the device UUID in its 36-character hyphenated form.
    ///
    /// # Errors
    ///
    /// Propagates derivation failures.
    fn generate_uuid(&self) -> IdentityResult<String>;

    /// Extra string appended to every derivation label.
    fn label_suffix(&self) -> &str;

    /// Replaces the derivation label suffix.
    ///
    /// Keys derived and the UUID computed under the previous suffix are not
    /// re-derived; call this before the key table is initialized.
    fn set_label_suffix(&mut self, suffix: &str);

    /// Derives the EC private key for `label` and imports it under `key_id`.
    ///
    /// The derived scalar is zeroed as soon as the import returns.
    ///
    /// # Errors
    ///
    /// Propagates derivation failures and `ImportFailed`.
    fn derive_key(&self, key_id: KeyId, label: &str, usage: KeyUsage) -> IdentityResult<()> {
        let scalar = IdentityDeriver::new(self).ec_private_key(label)?;
        self.import_ec_key(key_id, usage, &scalar)
    }
}
