//! In-process stand-in for the hardware-isolated partition.
//!
//! The hardware unique key is a fixed 32-byte secret supplied at
//! construction and derivation is HKDF-SHA256 over it, so a given seed
//! reproduces the same device identity on every run.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, OnceLock};

use hkdf::Hkdf;
use p256::ecdsa::signature::Signer;
use p256::ecdsa::{Signature, SigningKey};
use rand::{rngs::OsRng, RngCore};
use secrecy::{ExposeSecret, SecretBox};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use super::{
    EncodeFormat, KeyUsage, SecureService, MAX_DERIVATION_LEN, MIN_DERIVATION_LEN,
    PUBLIC_KEY_LEN, SIGNATURE_LEN,
};
use crate::cose;
use crate::der;
use crate::derivation::IdentityDeriver;
use crate::error::{IdentityError, IdentityResult};
use crate::registry::KeyId;

/// HKDF salt standing in for the hardware derivation engine's context.
const HUK_DERIVATION_SALT: &[u8] = b"huk-identity:huk-derivation";

struct StoredKey {
    signing_key: SigningKey,
    usage: KeyUsage,
}

/// Secure partition emulated in the calling process.
pub struct EmulatedPartition {
    huk: SecretBox<[u8; 32]>,
    label_suffix: String,
    online: AtomicBool,
    keys: Mutex<HashMap<KeyId, StoredKey>>,
    uuid: OnceLock<String>,
}

impl std::fmt::Debug for EmulatedPartition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmulatedPartition")
            .field("huk", &"[REDACTED]")
            .field("label_suffix", &self.label_suffix)
            .field("online", &self.online.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl EmulatedPartition {
    /// Creates a partition around a fixed hardware unique key.
    #[must_use]
    pub fn new(huk: [u8; 32]) -> Self {
        Self {
            huk: SecretBox::new(Box::new(huk)),
            label_suffix: String::new(),
            online: AtomicBool::new(true),
            keys: Mutex::new(HashMap::new()),
            uuid: OnceLock::new(),
        }
    }

    /// Creates a partition with a random hardware unique key.
    #[must_use]
    pub fn random() -> Self {
        let mut huk = Zeroizing::new([0u8; 32]);
        OsRng.fill_bytes(&mut *huk);
        Self::new(*huk)
    }

    /// Appends `suffix` to every derivation label.
    #[must_use]
    pub fn with_label_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.label_suffix = suffix.into();
        self
    }

    /// Simulates the partition becoming reachable or unreachable.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    fn ensure_online(&self) -> IdentityResult<()> {
        if self.online.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(IdentityError::TransportUnavailable)
        }
    }

    fn keys(&self) -> IdentityResult<MutexGuard<'_, HashMap<KeyId, StoredKey>>> {
        self.keys
            .lock()
            .map_err(|_| IdentityError::TransportUnavailable)
    }

    /// Signs `message` with a sign-capable key, without inspecting it.
    fn sign_raw(&self, key_id: KeyId, message: &[u8]) -> IdentityResult<[u8; SIGNATURE_LEN]> {
        let keys = self.keys()?;
        let stored = keys.get(&key_id).ok_or(IdentityError::SigningFailed)?;
        if !stored.usage.contains(KeyUsage::SIGN_HASH) {
            log::warn!("key {key_id} is not permitted to sign");
            return Err(IdentityError::SigningFailed);
        }

        let signature: Signature = stored
            .signing_key
            .try_sign(message)
            .map_err(|_| IdentityError::SigningFailed)?;

        let mut out = [0u8; SIGNATURE_LEN];
        out.copy_from_slice(&signature.to_bytes());
        Ok(out)
    }
}

impl SecureService for EmulatedPartition {
    fn derive_bytes(&self, label: &[u8], out_len: usize) -> IdentityResult<Zeroizing<Vec<u8>>> {
        if !self.online.load(Ordering::SeqCst) {
            return Err(IdentityError::DerivationUnavailable);
        }
        if out_len < MIN_DERIVATION_LEN {
            return Err(IdentityError::BufferTooSmall);
        }
        if out_len > MAX_DERIVATION_LEN {
            return Err(IdentityError::invalid_input(format!(
                "derivation length {out_len} exceeds {MAX_DERIVATION_LEN}"
            )));
        }

        let hkdf = Hkdf::<Sha256>::new(Some(HUK_DERIVATION_SALT), self.huk.expose_secret());
        let mut out = Zeroizing::new(vec![0u8; out_len]);
        hkdf.expand(label, out.as_mut_slice())
            .map_err(|_| IdentityError::DerivationUnavailable)?;
        Ok(out)
    }

    fn import_ec_key(
        &self,
        key_id: KeyId,
        usage: KeyUsage,
        scalar: &[u8; 32],
    ) -> IdentityResult<()> {
        self.ensure_online()?;
        let signing_key =
            SigningKey::from_slice(scalar).map_err(|_| IdentityError::ImportFailed)?;

        let mut keys = self.keys()?;
        if let Some(existing) = keys.get(&key_id) {
            let same_scalar = existing
                .signing_key
                .to_bytes()
                .as_slice()
                .ct_eq(scalar.as_slice());
            if existing.usage == usage && bool::from(same_scalar) {
                log::debug!("key {key_id} already present with identical material");
                return Ok(());
            }
            log::warn!("key {key_id} already holds different material");
            return Err(IdentityError::ImportFailed);
        }

        keys.insert(key_id, StoredKey { signing_key, usage });
        drop(keys);
        Ok(())
    }

    fn export_pubkey(&self, key_id: KeyId) -> IdentityResult<[u8; PUBLIC_KEY_LEN]> {
        self.ensure_online()?;
        let keys = self.keys()?;
        let stored = keys.get(&key_id).ok_or(IdentityError::ExportFailed)?;
        let point = stored.signing_key.verifying_key().to_encoded_point(false);

        let mut out = [0u8; PUBLIC_KEY_LEN];
        if point.as_bytes().len() != PUBLIC_KEY_LEN {
            return Err(IdentityError::ExportFailed);
        }
        out.copy_from_slice(point.as_bytes());
        Ok(out)
    }

    fn hash_and_sign(&self, key_id: KeyId, message: &[u8]) -> IdentityResult<[u8; SIGNATURE_LEN]> {
        self.ensure_online()?;
        if let Err(err) = der::check_sequence(message) {
            log::error!("refusing to sign request body for key {key_id}: {err}");
            return Err(IdentityError::SigningFailed);
        }
        self.sign_raw(key_id, message)
    }

    fn cbor_encode_and_sign(
        &self,
        key_id: KeyId,
        value: f32,
        format: EncodeFormat,
    ) -> IdentityResult<Vec<u8>> {
        self.ensure_online()?;
        let payload = cose::encode_payload(value)?;
        match format {
            EncodeFormat::Cbor => Ok(payload),
            EncodeFormat::CoseSign1 => {
                cose::sign1(&payload, |to_be_signed| self.sign_raw(key_id, to_be_signed))
            }
        }
    }

    fn generate_uuid(&self) -> IdentityResult<String> {
        self.ensure_online()?;
        if let Some(uuid) = self.uuid.get() {
            return Ok(uuid.clone());
        }
        let uuid = IdentityDeriver::new(self).uuid()?;
        Ok(self.uuid.get_or_init(|| uuid).clone())
    }

    fn label_suffix(&self) -> &str {
        &self.label_suffix
    }

    fn set_label_suffix(&mut self, suffix: &str) {
        suffix.clone_into(&mut self.label_suffix);
        self.uuid = OnceLock::new();
    }
}
