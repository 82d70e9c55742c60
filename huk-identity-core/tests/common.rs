//! Common test utilities shared across integration tests.

#![allow(dead_code, missing_docs)]

use std::sync::atomic::{AtomicUsize, Ordering};

use huk_identity_core::{
    EmulatedPartition, EncodeFormat, IdentityError, IdentityResult, KeyId, KeyUsage,
    SecureService,
};
use zeroize::Zeroizing;

/// Fixed HUK so every run derives the same identity.
pub const TEST_HUK: [u8; 32] = [
    0x3b, 0x1f, 0x72, 0x0e, 0x9a, 0x44, 0xc1, 0x56, 0x08, 0xd3, 0x6e, 0x2a, 0xb7, 0x91, 0x5c,
    0xe4, 0x17, 0x88, 0x4d, 0xa0, 0xf2, 0x39, 0x65, 0xcb, 0x0d, 0x7e, 0x23, 0x9f, 0x50, 0xb6,
    0x14, 0xaa,
];

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

pub fn partition() -> EmulatedPartition {
    EmulatedPartition::new(TEST_HUK)
}

/// Partition whose key store refuses one key id, and that counts imports.
pub struct FlakyPartition {
    inner: EmulatedPartition,
    reject: KeyId,
    imports: AtomicUsize,
}

impl FlakyPartition {
    pub fn rejecting(reject: KeyId) -> Self {
        Self {
            inner: partition(),
            reject,
            imports: AtomicUsize::new(0),
        }
    }

    pub fn imports(&self) -> usize {
        self.imports.load(Ordering::SeqCst)
    }

    pub fn inner(&self) -> &EmulatedPartition {
        &self.inner
    }
}

impl SecureService for FlakyPartition {
    fn derive_bytes(&self, label: &[u8], out_len: usize) -> IdentityResult<Zeroizing<Vec<u8>>> {
        self.inner.derive_bytes(label, out_len)
    }

    fn import_ec_key(
        &self,
        key_id: KeyId,
        usage: KeyUsage,
        scalar: &[u8; 32],
    ) -> IdentityResult<()> {
        self.imports.fetch_add(1, Ordering::SeqCst);
        if key_id == self.reject {
            return Err(IdentityError::ImportFailed);
        }
        self.inner.import_ec_key(key_id, usage, scalar)
    }

    fn export_pubkey(&self, key_id: KeyId) -> IdentityResult<[u8; 65]> {
        self.inner.export_pubkey(key_id)
    }

    fn hash_and_sign(&self, key_id: KeyId, message: &[u8]) -> IdentityResult<[u8; 64]> {
        self.inner.hash_and_sign(key_id, message)
    }

    fn cbor_encode_and_sign(
        &self,
        key_id: KeyId,
        value: f32,
        format: EncodeFormat,
    ) -> IdentityResult<Vec<u8>> {
        self.inner.cbor_encode_and_sign(key_id, value, format)
    }

    fn generate_uuid(&self) -> IdentityResult<String> {
        self.inner.generate_uuid()
    }

    fn label_suffix(&self) -> &str {
        self.inner.label_suffix()
    }

    fn set_label_suffix(&mut self, suffix: &str) {
        self.inner.set_label_suffix(suffix);
    }
}
