use thiserror::Error;

/// Result alias used across the identity subsystem.
pub type IdentityResult<T> = Result<T, IdentityError>;

/// Error outputs from the device identity subsystem.
///
/// The `Display` form of every variant is a short, stable label that is safe
/// to show to an operator. Secure-call internals are never carried in it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentityError {
    /// The hardware unique key service could not be reached
    #[error("derivation_unavailable")]
    DerivationUnavailable,
    /// A caller-supplied buffer (or derivation budget) is too small
    #[error("buffer_too_small")]
    BufferTooSmall,
    /// The secure key store rejected a key import
    #[error("import_failed")]
    ImportFailed,
    /// The key identifier does not name any known key slot
    #[error("unknown_key_id")]
    UnknownKeyId,
    /// The public key could not be exported from the key handle
    #[error("export_failed")]
    ExportFailed,
    /// The CSR subject name could not be assembled
    #[error("subject_name_invalid")]
    SubjectNameInvalid,
    /// The secure hash-and-sign call failed
    #[error("signing_failed")]
    SigningFailed,
    /// A DER or PEM encoding step failed
    #[error("encoding_failed")]
    EncodingFailed,
    /// The input is not a well-formed `COSE_Sign1` structure
    #[error("malformed_cose")]
    MalformedCose,
    /// Signature verification failed
    #[error("signature_invalid")]
    SignatureInvalid,
    /// The signature is valid but the payload is not a CBOR float
    #[error("payload_decode_failed")]
    PayloadDecodeFailed,
    /// No provisioning record has been stored yet
    #[error("not_provisioned")]
    NotProvisioned,
    /// The secure-call channel could not be opened
    #[error("transport_unavailable")]
    TransportUnavailable,
    /// The presented input is not valid for the requested operation
    #[error("invalid_input: {0}")]
    InvalidInput(String),
    /// Unexpected error serializing or deserializing information
    #[error("serialization_error: {0}")]
    Serialization(String),
}

impl IdentityError {
    /// Returns the stable numeric code reported next to the label.
    #[must_use]
    pub const fn code(&self) -> i32 {
        match self {
            Self::DerivationUnavailable => -1,
            Self::BufferTooSmall => -2,
            Self::ImportFailed => -3,
            Self::UnknownKeyId => -4,
            Self::ExportFailed => -5,
            Self::SubjectNameInvalid => -6,
            Self::SigningFailed => -7,
            Self::EncodingFailed => -8,
            Self::MalformedCose => -9,
            Self::SignatureInvalid => -10,
            Self::PayloadDecodeFailed => -11,
            Self::NotProvisioned => -12,
            Self::TransportUnavailable => -13,
            Self::InvalidInput(_) => -14,
            Self::Serialization(_) => -15,
        }
    }

    /// Returns the bare label without any detail payload.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::DerivationUnavailable => "derivation_unavailable",
            Self::BufferTooSmall => "buffer_too_small",
            Self::ImportFailed => "import_failed",
            Self::UnknownKeyId => "unknown_key_id",
            Self::ExportFailed => "export_failed",
            Self::SubjectNameInvalid => "subject_name_invalid",
            Self::SigningFailed => "signing_failed",
            Self::EncodingFailed => "encoding_failed",
            Self::MalformedCose => "malformed_cose",
            Self::SignatureInvalid => "signature_invalid",
            Self::PayloadDecodeFailed => "payload_decode_failed",
            Self::NotProvisioned => "not_provisioned",
            Self::TransportUnavailable => "transport_unavailable",
            Self::InvalidInput(_) => "invalid_input",
            Self::Serialization(_) => "serialization_error",
        }
    }

    pub(crate) fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    pub(crate) fn serialization(err: impl std::fmt::Display) -> Self {
        Self::Serialization(err.to_string())
    }

    /// Collapses a secure-call failure during signing to `SigningFailed`,
    /// keeping transport and buffer errors visible to the caller.
    pub(crate) fn into_signing_failure(self) -> Self {
        match self {
            Self::TransportUnavailable | Self::BufferTooSmall => self,
            _ => Self::SigningFailed,
        }
    }
}
