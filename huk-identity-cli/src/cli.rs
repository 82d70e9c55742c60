//! Command-line surface.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use eyre::{eyre, WrapErr as _};
use huk_identity_core::{CsrFormat, EncodeFormat, IdentityConfig, InferenceEngine, KeyId};

/// Developer shell for the HUK-rooted device identity.
#[derive(Debug, Parser)]
#[command(name = "huk-identity", version, about)]
pub struct Cli {
    /// Organization placed in CSR subjects.
    #[arg(long, env = "HUK_ORG", global = true)]
    pub org: Option<String>,

    /// Extra string appended to every derivation label.
    #[arg(long, env = "HUK_LABEL_SUFFIX", global = true)]
    pub label_suffix: Option<String>,

    /// Hardware unique key of the emulated partition, 32 bytes as hex.
    /// A random key is used when absent.
    #[arg(long, env = "HUK_SEED", global = true, value_parser = parse_seed)]
    pub seed: Option<[u8; 32]>,

    /// JSON configuration file. Flags override its values.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log at debug level unless `RUST_LOG` says otherwise.
    #[arg(long, short, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Device information.
    #[command(subcommand)]
    Info(InfoCommand),
    /// Key table and public keys.
    #[command(subcommand)]
    Keys(KeysCommand),
    /// Certificate signing requests.
    #[command(subcommand)]
    Csr(CsrCommand),
    /// `COSE_Sign1` payloads.
    #[command(subcommand)]
    Cose(CoseCommand),
    /// Provisioning hand-off.
    #[command(subcommand)]
    Provision(ProvisionCommand),
    /// Run a sine model and sign its output.
    Infer(InferArgs),
}

#[derive(Debug, Subcommand)]
pub enum InfoCommand {
    /// Print the device UUID.
    Uuid,
    /// Print the identity subsystem version.
    Version,
}

#[derive(Debug, Subcommand)]
pub enum KeysCommand {
    /// Print the key status table.
    Status,
    /// Print public keys as hex rows and PEM.
    Public {
        /// Only this key; every provisioned key when absent.
        #[arg(long, value_parser = parse_key_id)]
        key_id: Option<KeyId>,
    },
}

#[derive(Debug, Subcommand)]
pub enum CsrCommand {
    /// Generate a CSR for one key.
    Generate {
        #[arg(long, value_parser = parse_key_id, default_value = "0x5001")]
        key_id: KeyId,
        #[arg(long, default_value = "pem")]
        format: CsrFormat,
    },
}

#[derive(Debug, Subcommand)]
pub enum CoseCommand {
    /// Encode a value with the COSE signing key and print it as hex.
    Sign {
        #[arg(long, allow_negative_numbers = true)]
        value: f32,
        #[arg(long, default_value = "cose")]
        format: EncodeFormat,
    },
    /// Verify a hex `COSE_Sign1` and print the value it carries.
    Verify {
        #[arg(long, value_parser = parse_key_id, default_value = "0x5002")]
        key_id: KeyId,
        #[arg(long)]
        payload: String,
    },
}

#[derive(Debug, Subcommand)]
pub enum ProvisionCommand {
    /// Store a record from one thread and read it from another.
    Demo {
        #[arg(long, default_value = "localhost")]
        hubname: String,
        #[arg(long, default_value_t = 8883)]
        hubport: u16,
    },
}

#[derive(Debug, Args)]
pub struct InferArgs {
    #[arg(long, default_value = "tflm")]
    pub engine: InferenceEngine,
    /// Single model input in `[0, 2π]`.
    #[arg(long, conflicts_with = "steps")]
    pub input: Option<f32>,
    /// Sweep the whole input range in this many steps.
    #[arg(long, default_value_t = 8)]
    pub steps: u8,
}

fn parse_key_id(text: &str) -> Result<KeyId, String> {
    KeyId::parse(text).map_err(|err| err.to_string())
}

fn parse_seed(text: &str) -> Result<[u8; 32], String> {
    let bytes = hex::decode(text.trim_start_matches("0x")).map_err(|err| err.to_string())?;
    <[u8; 32]>::try_from(bytes.as_slice())
        .map_err(|_| format!("expected 32 bytes, got {}", bytes.len()))
}

impl Cli {
    /// Resolves the configuration file and flag overrides.
    pub fn identity_config(&self) -> eyre::Result<IdentityConfig> {
        let mut config = match &self.config {
            Some(path) => load_config(path)?,
            None => IdentityConfig::default(),
        };
        if let Some(org) = &self.org {
            config.organization.clone_from(org);
        }
        if let Some(suffix) = &self.label_suffix {
            config.label_suffix.clone_from(suffix);
        }
        Ok(config)
    }
}

/// Reads an [`IdentityConfig`] from a JSON file.
pub fn load_config(path: &std::path::Path) -> eyre::Result<IdentityConfig> {
    let json = std::fs::read_to_string(path)
        .wrap_err_with(|| format!("failed to read config {}", path.display()))?;
    IdentityConfig::from_json(&json).map_err(|err| eyre!("invalid config {}: {err}", path.display()))
}
