#![deny(clippy::all, clippy::pedantic, clippy::nursery)]

//! Device identity rooted in a hardware unique key.
//!
//! Every private key lives in a secure partition reached through
//! [`SecureService`]. This crate derives the purpose keys and the device
//! UUID from the hardware unique key, builds signed X.509 certificate
//! signing requests, produces and verifies `COSE_Sign1` payloads and hands
//! the issued certificate to whoever waits for it.
//!
//! ```rust
//! use huk_identity_core::{Device, EmulatedPartition, EncodeFormat, IdentityConfig, KeyId};
//!
//! let device = Device::new(EmulatedPartition::new([7u8; 32]), IdentityConfig::default());
//! assert_eq!(device.init(), 3);
//!
//! let signed = device.encode_value(0.25, EncodeFormat::CoseSign1).unwrap();
//! assert_eq!(device.verify(KeyId::COSE_SIGN, &signed).unwrap(), 0.25);
//! ```

mod error;
pub use error::*;

mod config;
pub use config::*;

mod device;
pub use device::*;

pub mod ca;
pub mod cose;
pub mod csr;
pub mod der;
pub mod derivation;
pub mod export;
pub mod infer;
pub mod logger;
pub mod partition;
pub mod provision;
pub mod registry;

pub use csr::{CsrBuilder, CsrFormat};
pub use infer::InferenceEngine;
pub use partition::{EmulatedPartition, EncodeFormat, KeyUsage, SecureService};
pub use provision::{ProvisionRecord, Provisioner};
pub use registry::{KeyId, KeyRegistry, KeySlot, KeyStatus};
