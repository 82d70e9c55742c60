//! Runtime configuration for the identity subsystem.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{IdentityError, IdentityResult};

/// Default organization placed in the `O=` attribute of every CSR subject.
pub const DEFAULT_ORGANIZATION: &str = "Linaro";

/// Default working buffer for CSR generation.
pub const DEFAULT_CSR_BUFFER_SIZE: usize = 1024;

/// Default output buffer for `COSE_Sign1` encoding.
pub const DEFAULT_COSE_BUFFER_SIZE: usize = 256;

/// Tunables shared by the deriver, CSR builder, COSE engine and provisioning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IdentityConfig {
    /// Organization name used for the CSR subject.
    pub organization: String,
    /// Extra string appended to every derivation label.
    ///
    /// Lets one device family derive keys distinct from another that shares
    /// the same label set. Empty by default.
    pub label_suffix: String,
    /// Size of the backward-written CSR buffer.
    pub csr_buffer_size: usize,
    /// Size of the `COSE_Sign1` output buffer.
    pub cose_buffer_size: usize,
    /// Bound on provisioning waits; `None` waits forever.
    pub provision_timeout_ms: Option<u64>,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            organization: DEFAULT_ORGANIZATION.to_string(),
            label_suffix: String::new(),
            csr_buffer_size: DEFAULT_CSR_BUFFER_SIZE,
            cose_buffer_size: DEFAULT_COSE_BUFFER_SIZE,
            provision_timeout_ms: None,
        }
    }
}

impl IdentityConfig {
    /// Parses a configuration document. Missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// Returns `Serialization` if the JSON is malformed or names an unknown
    /// field.
    pub fn from_json(json: &str) -> IdentityResult<Self> {
        serde_json::from_str(json).map_err(IdentityError::serialization)
    }

    /// The provisioning wait bound, if one is configured.
    #[must_use]
    pub fn provision_timeout(&self) -> Option<Duration> {
        self.provision_timeout_ms.map(Duration::from_millis)
    }
}
