//! The device identity context tying the partition, key table and
//! provisioning state together.

use crate::ca;
use crate::config::IdentityConfig;
use crate::cose;
use crate::csr::{CsrBuilder, CsrFormat};
use crate::error::{IdentityError, IdentityResult};
use crate::export;
use crate::partition::{EncodeFormat, SecureService, PUBLIC_KEY_LEN};
use crate::provision::{ProvisionRecord, Provisioner};
use crate::registry::{KeyId, KeyRegistry};

/// Version reported by `info version`.
pub const VERSION: &str = "1.0.0";

/// Process-wide identity state of one device.
///
/// Construct once at start-up, call [`Device::init`], then share by
/// reference. All methods take `&self`.
#[derive(Debug)]
pub struct Device<S: SecureService> {
    config: IdentityConfig,
    service: S,
    registry: KeyRegistry,
    provisioner: Provisioner,
}

impl<S: SecureService> Device<S> {
    /// Wraps `service` without touching the partition.
    ///
    /// A non-empty `config.label_suffix` replaces the partition's own
    /// suffix, so every key and the UUID are derived under it.
    #[must_use]
    pub fn new(mut service: S, config: IdentityConfig) -> Self {
        if !config.label_suffix.is_empty() {
            service.set_label_suffix(&config.label_suffix);
        }
        Self {
            config,
            service,
            registry: KeyRegistry::new(),
            provisioner: Provisioner::new(),
        }
    }

    /// Derives and imports every key slot. See [`KeyRegistry::init`].
    pub fn init(&self) -> usize {
        let ready = self.registry.init(&self.service);
        log::info!(
            "{ready} of {} device keys ready",
            self.registry.contexts().len()
        );
        ready
    }

    /// Active configuration.
    #[must_use]
    pub const fn config(&self) -> &IdentityConfig {
        &self.config
    }

    /// The secure partition.
    #[must_use]
    pub const fn service(&self) -> &S {
        &self.service
    }

    /// The key table.
    #[must_use]
    pub const fn registry(&self) -> &KeyRegistry {
        &self.registry
    }

    /// The provisioning synchronizer.
    #[must_use]
    pub const fn provisioner(&self) -> &Provisioner {
        &self.provisioner
    }

    /// The device UUID.
    ///
    /// # Errors
    ///
    /// Returns `DerivationUnavailable` or `TransportUnavailable` if the
    /// partition cannot be reached.
    pub fn uuid(&self) -> IdentityResult<String> {
        self.service.generate_uuid()
    }

    /// Raw public key of `key_id`. See [`export::export_pubkey`].
    ///
    /// # Errors
    ///
    /// See [`export::export_pubkey`].
    pub fn public_key(&self, key_id: KeyId) -> IdentityResult<[u8; PUBLIC_KEY_LEN]> {
        export::export_pubkey(&self.service, &self.registry, key_id)
    }

    /// Generates a CSR for `key_id` with the device UUID as common name.
    ///
    /// # Errors
    ///
    /// See [`CsrBuilder::generate`]; partition failures while fetching the
    /// UUID are passed through.
    pub fn generate_csr(&self, key_id: KeyId, format: CsrFormat) -> IdentityResult<Vec<u8>> {
        let uuid = self.uuid()?;
        CsrBuilder::new(&self.service, &self.registry, &self.config).generate(key_id, &uuid, format)
    }

    /// Encodes `value` with the COSE signing key.
    ///
    /// # Errors
    ///
    /// See [`cose::encode`].
    pub fn encode_value(&self, value: f32, format: EncodeFormat) -> IdentityResult<Vec<u8>> {
        let mut out = vec![0u8; self.config.cose_buffer_size];
        let len = cose::encode(
            &self.service,
            &self.registry,
            KeyId::COSE_SIGN,
            value,
            format,
            &mut out,
        )?;
        out.truncate(len);
        Ok(out)
    }

    /// Verifies a `COSE_Sign1` against the public key of `key_id`.
    ///
    /// # Errors
    ///
    /// `ExportFailed` or `UnknownKeyId` if the key cannot be fetched, then
    /// see [`cose::verify`].
    pub fn verify(&self, key_id: KeyId, cose: &[u8]) -> IdentityResult<f32> {
        let public_key = self.public_key(key_id)?;
        cose::verify(cose, &public_key)
    }

    /// Handles a CA response. See [`ca::apply_ca_response`].
    ///
    /// # Errors
    ///
    /// See [`ca::decode_ca_response`].
    pub fn apply_ca_response(&self, bytes: &[u8]) -> IdentityResult<()> {
        ca::apply_ca_response(bytes, &self.provisioner, &self.registry)
    }

    /// Waits for provisioning, bounded by the configured timeout if any,
    /// and returns the record.
    ///
    /// # Errors
    ///
    /// Returns `NotProvisioned` if the configured timeout elapses first.
    pub fn wait_for_record(&self) -> IdentityResult<ProvisionRecord> {
        match self.config.provision_timeout() {
            Some(timeout) => {
                if !self.provisioner.wait_until_provisioned_timeout(timeout) {
                    return Err(IdentityError::NotProvisioned);
                }
            }
            None => self.provisioner.wait_until_provisioned(),
        }
        self.provisioner.record()
    }
}
