//! The fixed table of device key slots.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use strum::{Display, EnumIter, IntoEnumIterator};

use crate::error::{IdentityError, IdentityResult};
use crate::partition::{KeyUsage, SecureService};

/// Numeric key identifier shared with the secure partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyId(pub u32);

impl KeyId {
    /// Client TLS key.
    pub const CLIENT_TLS: Self = Self(0x5001);
    /// `COSE_Sign1` signing key.
    pub const COSE_SIGN: Self = Self(0x5002);
    /// COSE encryption key.
    pub const COSE_ENCRYPT: Self = Self(0x5003);

    /// Parses `0x5001`-style or decimal identifiers.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` when `text` is not a number.
    pub fn parse(text: &str) -> IdentityResult<Self> {
        let trimmed = text.trim();
        let parsed = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .map_or_else(|| trimmed.parse(), |hex| u32::from_str_radix(hex, 16));
        parsed
            .map(Self)
            .map_err(|_| IdentityError::invalid_input(format!("not a key id: {text}")))
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&format!("{:#x}", self.0))
    }
}

/// The named purposes a device key can serve. The set is fixed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter)]
pub enum KeySlot {
    /// TLS client authentication.
    ClientTls,
    /// Signing of `COSE_Sign1` payloads.
    CoseSign,
    /// COSE encryption.
    CoseEncrypt,
}

impl KeySlot {
    /// Stable key identifier.
    #[must_use]
    pub const fn key_id(self) -> KeyId {
        match self {
            Self::ClientTls => KeyId::CLIENT_TLS,
            Self::CoseSign => KeyId::COSE_SIGN,
            Self::CoseEncrypt => KeyId::COSE_ENCRYPT,
        }
    }

    /// Display label, also the base derivation label and the CSR `OU`.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::ClientTls => "Device Client TLS",
            Self::CoseSign => "Device COSE SIGN",
            Self::CoseEncrypt => "Device COSE ENCRYPT",
        }
    }

    /// Usage flags the key is imported with.
    #[must_use]
    pub fn usage(self) -> KeyUsage {
        match self {
            Self::ClientTls | Self::CoseSign => KeyUsage::SIGN_HASH | KeyUsage::VERIFY_HASH,
            Self::CoseEncrypt => KeyUsage::ENCRYPT,
        }
    }
}

/// Provisioning state of a key slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[repr(u8)]
pub enum KeyStatus {
    /// No key has been imported.
    #[strum(serialize = "Not provisioned")]
    NotProvisioned = 0,
    /// The key pair exists in the partition.
    #[strum(serialize = "Key generated")]
    KeyGenerated = 1,
    /// A certificate has been issued for the key.
    #[strum(serialize = "X.509 certificate gen")]
    CertificateGenerated = 2,
}

impl KeyStatus {
    const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::KeyGenerated,
            2 => Self::CertificateGenerated,
            _ => Self::NotProvisioned,
        }
    }
}

/// One entry of the key table.
#[derive(Debug)]
pub struct KeyContext {
    slot: KeySlot,
    status: AtomicU8,
}

impl KeyContext {
    fn new(slot: KeySlot) -> Self {
        Self {
            slot,
            status: AtomicU8::new(KeyStatus::NotProvisioned as u8),
        }
    }

    /// The purpose this entry serves.
    #[must_use]
    pub const fn slot(&self) -> KeySlot {
        self.slot
    }

    /// Stable key identifier.
    #[must_use]
    pub const fn key_id(&self) -> KeyId {
        self.slot.key_id()
    }

    /// Display label.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        self.slot.label()
    }

    /// Current provisioning state.
    #[must_use]
    pub fn status(&self) -> KeyStatus {
        KeyStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    fn set_status(&self, status: KeyStatus) {
        self.status.store(status as u8, Ordering::Release);
    }
}

/// The device key table.
///
/// Constructed once at start-up and passed by reference to everything that
/// takes a key identifier. After [`KeyRegistry::init`] the only writes are
/// status flips on certificate issuance, which readers may observe without
/// further locking.
#[derive(Debug)]
pub struct KeyRegistry {
    contexts: Vec<KeyContext>,
}

impl Default for KeyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyRegistry {
    /// Creates the table with every slot `NotProvisioned`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            contexts: KeySlot::iter().map(KeyContext::new).collect(),
        }
    }

    /// Derives and imports the key for every slot that does not have one.
    ///
    /// A slot whose derivation or import fails is logged and left
    /// `NotProvisioned`; the remaining slots are still initialized. Slots
    /// already past `NotProvisioned` are not touched.
    ///
    /// Returns the number of slots holding a key afterwards.
    pub fn init<S: SecureService + ?Sized>(&self, service: &S) -> usize {
        for context in &self.contexts {
            if context.status() != KeyStatus::NotProvisioned {
                log::debug!("{} already provisioned, skipping", context.label());
                continue;
            }

            let slot = context.slot();
            match service.derive_key(slot.key_id(), slot.label(), slot.usage()) {
                Ok(()) => {
                    context.set_status(KeyStatus::KeyGenerated);
                    log::info!("{} key generated ({})", slot.label(), slot.key_id());
                }
                Err(err) => {
                    log::error!(
                        "{} key import failed: {} ({})",
                        slot.label(),
                        err.label(),
                        err.code()
                    );
                }
            }
        }

        self.contexts
            .iter()
            .filter(|context| context.status() != KeyStatus::NotProvisioned)
            .count()
    }

    /// Translates an external key identifier to its slot index.
    ///
    /// # Errors
    ///
    /// Returns `UnknownKeyId` if no slot carries `key_id`.
    pub fn lookup(&self, key_id: KeyId) -> IdentityResult<usize> {
        self.contexts
            .iter()
            .position(|context| context.key_id() == key_id)
            .ok_or(IdentityError::UnknownKeyId)
    }

    /// Returns the entry for `key_id`.
    ///
    /// # Errors
    ///
    /// Returns `UnknownKeyId` if no slot carries `key_id`.
    pub fn context(&self, key_id: KeyId) -> IdentityResult<&KeyContext> {
        let index = self.lookup(key_id)?;
        Ok(&self.contexts[index])
    }

    /// All entries in slot order.
    #[must_use]
    pub fn contexts(&self) -> &[KeyContext] {
        &self.contexts
    }

    /// Records that a certificate has been issued for `key_id`.
    ///
    /// # Errors
    ///
    /// - `UnknownKeyId` if no slot carries `key_id`.
    /// - `InvalidInput` if the slot has no key yet.
    pub fn mark_certificate_issued(&self, key_id: KeyId) -> IdentityResult<()> {
        let context = self.context(key_id)?;
        if context.status() == KeyStatus::NotProvisioned {
            return Err(IdentityError::invalid_input(format!(
                "{} has no key to certify",
                context.label()
            )));
        }
        context.set_status(KeyStatus::CertificateGenerated);
        log::info!("{} certificate recorded", context.label());
        Ok(())
    }

    /// Renders the key status table shown by `keys status`.
    #[must_use]
    pub fn status_table(&self) -> String {
        let mut table = format!("| {:<20}| {:<12} | {:<22} |\n", "Key", "Key ID", "Status");
        for context in &self.contexts {
            table.push_str(&format!(
                "| {:<20}| {:<12} | {:<22} |\n",
                context.label(),
                context.key_id(),
                context.status()
            ));
        }
        table
    }
}
