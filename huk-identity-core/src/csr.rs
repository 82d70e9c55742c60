//! PKCS#10 certificate signing requests for device keys.
//!
//! The request body is written backward into a fixed working buffer,
//! handed to the secure partition for hash-and-sign, and then reassembled
//! with the signature into the final `CertificationRequest`:
//!
//! ```text
//! CertificationRequest ::= SEQUENCE {
//!   certificationRequestInfo SEQUENCE {
//!     version       INTEGER 0,
//!     subject       Name,                 -- O=<org>,CN=<uuid>,OU=<label>
//!     subjectPKInfo SubjectPublicKeyInfo,
//!     attributes    [0] {}
//!   },
//!   signatureAlgorithm SEQUENCE { ecdsa-with-SHA256 },
//!   signature          BIT STRING { SEQUENCE { INTEGER r, INTEGER s } }
//! }
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::config::IdentityConfig;
use crate::der::{der_to_pem, DerWriter, TAG_BIT_STRING, TAG_CONTEXT_0, TAG_SET};
use crate::error::{IdentityError, IdentityResult};
use crate::export::{export_pubkey, write_pubkey_der};
use crate::partition::SecureService;
use crate::registry::{KeyId, KeyRegistry};

/// ecdsa-with-SHA256, 1.2.840.10045.4.3.2
pub const OID_ECDSA_WITH_SHA256: &[u8] = &[0x2A, 0x86, 0x48, 0xCE, 0x3D, 0x04, 0x03, 0x02];

/// id-at-commonName, 2.5.4.3
const OID_COMMON_NAME: &[u8] = &[0x55, 0x04, 0x03];

/// id-at-organizationName, 2.5.4.10
const OID_ORGANIZATION: &[u8] = &[0x55, 0x04, 0x0A];

/// id-at-organizationalUnitName, 2.5.4.11
const OID_ORGANIZATIONAL_UNIT: &[u8] = &[0x55, 0x04, 0x0B];

/// Upper bound for `O`, `CN` and `OU` values (X.520 `ub-*-name`).
const MAX_ATTRIBUTE_LEN: usize = 64;

/// PEM label for a certificate signing request.
pub const PEM_LABEL_CSR: &str = "CERTIFICATE REQUEST";

/// One `<type>=<value>` component of a subject name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameAttribute {
    /// `O`
    Organization,
    /// `CN`
    CommonName,
    /// `OU`
    OrganizationalUnit,
}

impl NameAttribute {
    const fn oid(self) -> &'static [u8] {
        match self {
            Self::Organization => OID_ORGANIZATION,
            Self::CommonName => OID_COMMON_NAME,
            Self::OrganizationalUnit => OID_ORGANIZATIONAL_UNIT,
        }
    }

    fn from_short_name(name: &str) -> Option<Self> {
        match name {
            "O" => Some(Self::Organization),
            "CN" => Some(Self::CommonName),
            "OU" => Some(Self::OrganizationalUnit),
            _ => None,
        }
    }

    const fn short_name(self) -> &'static str {
        match self {
            Self::Organization => "O",
            Self::CommonName => "CN",
            Self::OrganizationalUnit => "OU",
        }
    }
}

/// A parsed subject distinguished name, in the order it is encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubjectName {
    attributes: Vec<(NameAttribute, String)>,
}

impl SubjectName {
    /// Builds `O=<organization>,CN=<uuid>,OU=<label>`.
    ///
    /// # Errors
    ///
    /// Returns `SubjectNameInvalid` if any component is empty, too long, or
    /// contains `,` or `=`.
    pub fn for_device(organization: &str, uuid: &str, label: &str) -> IdentityResult<Self> {
        format!("O={organization},CN={uuid},OU={label}").parse()
    }

    /// The attributes in encoding order.
    #[must_use]
    pub fn attributes(&self) -> &[(NameAttribute, String)] {
        &self.attributes
    }

    /// Prepends the DER `Name` (a SEQUENCE of single-valued RDN SETs).
    ///
    /// # Errors
    ///
    /// Returns `BufferTooSmall` if the name does not fit.
    pub fn write_der(&self, w: &mut DerWriter<'_>) -> IdentityResult<usize> {
        let mut len = 0;
        for (attribute, value) in self.attributes.iter().rev() {
            let mut atv_len = w.write_utf8_string(value)?;
            atv_len += w.write_oid(attribute.oid())?;
            atv_len += w.write_sequence_header(atv_len)?;

            let mut rdn_len = atv_len;
            rdn_len += w.write_header(TAG_SET, atv_len)?;
            len += rdn_len;
        }
        len += w.write_sequence_header(len)?;
        Ok(len)
    }
}

impl FromStr for SubjectName {
    type Err = IdentityError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let mut attributes = Vec::new();
        for component in text.split(',') {
            let (name, value) = component
                .split_once('=')
                .ok_or(IdentityError::SubjectNameInvalid)?;
            let attribute = NameAttribute::from_short_name(name.trim())
                .ok_or(IdentityError::SubjectNameInvalid)?;
            if value.is_empty() || value.len() > MAX_ATTRIBUTE_LEN || value.contains('=') {
                return Err(IdentityError::SubjectNameInvalid);
            }
            attributes.push((attribute, value.to_string()));
        }
        Ok(Self { attributes })
    }
}

impl fmt::Display for SubjectName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (attribute, value)) in self.attributes.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}={value}", attribute.short_name())?;
        }
        Ok(())
    }
}

/// Output rendering for a generated CSR.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum CsrFormat {
    /// PEM text between `CERTIFICATE REQUEST` markers.
    #[default]
    Pem,
    /// Raw DER bytes.
    Der,
    /// `{"CSR": "<pem>"}`
    Json,
}

/// Progress of a single CSR generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CsrState {
    /// Nothing done yet.
    Start,
    /// The subject name has been assembled and validated.
    SubjectBuilt,
    /// The request body has been DER-encoded.
    TbsEncoded,
    /// The partition has signed the request body.
    Signed,
    /// The complete `CertificationRequest` DER is assembled.
    AsnAssembled,
    /// The DER has been armored as PEM.
    PemEncoded,
    /// Generation finished.
    Done,
    /// Generation stopped with the given error.
    Failed(IdentityError),
}

/// JSON envelope posted to certificate authorities.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CsrJson {
    /// The CSR in PEM form.
    #[serde(rename = "CSR")]
    pub csr: String,
}

/// Builds a signed CSR for one registered key.
///
/// Each builder tracks the state of its most recent generation; nothing is
/// retried internally.
pub struct CsrBuilder<'a, S: SecureService + ?Sized> {
    service: &'a S,
    registry: &'a KeyRegistry,
    organization: &'a str,
    buffer_size: usize,
    state: CsrState,
}

impl<'a, S: SecureService + ?Sized> CsrBuilder<'a, S> {
    /// Creates a builder using the configured organization and buffer size.
    pub fn new(service: &'a S, registry: &'a KeyRegistry, config: &'a IdentityConfig) -> Self {
        Self {
            service,
            registry,
            organization: &config.organization,
            buffer_size: config.csr_buffer_size,
            state: CsrState::Start,
        }
    }

    /// State reached by the last generation.
    #[must_use]
    pub const fn state(&self) -> &CsrState {
        &self.state
    }

    fn fail(&mut self, err: IdentityError) -> IdentityError {
        log::error!("CSR generation failed: {} ({})", err.label(), err.code());
        self.state = CsrState::Failed(err.clone());
        err
    }

    /// Generates the CSR DER for `key_id` into the tail of `buf`.
    ///
    /// Returns the DER length; the request occupies
    /// `buf[buf.len() - len..]`. On error the contents of `buf` are
    /// unspecified.
    ///
    /// # Errors
    ///
    /// - `UnknownKeyId` if `key_id` is not a registry slot.
    /// - `SubjectNameInvalid` if the subject cannot be assembled.
    /// - `BufferTooSmall` if `buf` cannot hold the request.
    /// - `SigningFailed` if the partition does not sign the body.
    /// - `EncodingFailed` for any other DER step failure.
    pub fn generate_into(
        &mut self,
        key_id: KeyId,
        uuid: &str,
        buf: &mut [u8],
    ) -> IdentityResult<usize> {
        self.state = CsrState::Start;
        self.build_der(key_id, uuid, buf).map_err(|err| self.fail(err))
    }

    fn build_der(&mut self, key_id: KeyId, uuid: &str, buf: &mut [u8]) -> IdentityResult<usize> {
        let context = self.registry.context(key_id)?;
        let subject = SubjectName::for_device(self.organization, uuid, context.label())?;
        log::info!("generating CSR for '{}', subject {subject}", context.label());
        self.state = CsrState::SubjectBuilt;

        let public_key =
            export_pubkey(self.service, self.registry, key_id).map_err(|err| match err {
                IdentityError::TransportUnavailable => err,
                _ => IdentityError::EncodingFailed,
            })?;

        let mut w = DerWriter::new(buf);
        let tbs = {
            let mut len = w.write_header(TAG_CONTEXT_0, 0).map_err(encoding)?;
            len += write_pubkey_der(&mut w, &public_key).map_err(encoding)?;
            len += subject.write_der(&mut w).map_err(encoding)?;
            len += w.write_integer_u8(0).map_err(encoding)?;
            w.write_sequence_header(len).map_err(encoding)?;
            w.written().to_vec()
        };
        self.state = CsrState::TbsEncoded;

        let signature = self
            .service
            .hash_and_sign(key_id, &tbs)
            .map_err(IdentityError::into_signing_failure)?;
        self.state = CsrState::Signed;

        w.reset();
        let mut len = {
            let mut sig_len = w.write_ecdsa_signature(&signature).map_err(encoding)?;
            sig_len += w.write_byte(0x00).map_err(encoding)?;
            sig_len += w.write_header(TAG_BIT_STRING, sig_len).map_err(encoding)?;
            sig_len
        };

        let mut alg_len = w.write_oid(OID_ECDSA_WITH_SHA256).map_err(encoding)?;
        alg_len += w.write_sequence_header(alg_len).map_err(encoding)?;
        len += alg_len;

        len += w.write_raw(&tbs).map_err(encoding)?;
        len += w.write_sequence_header(len).map_err(encoding)?;
        self.state = CsrState::AsnAssembled;
        Ok(len)
    }

    /// Generates the CSR for `key_id` in the requested format.
    ///
    /// Uses a working buffer of the configured size.
    ///
    /// # Errors
    ///
    /// See [`CsrBuilder::generate_into`]; JSON rendering failures are
    /// reported as `EncodingFailed`.
    pub fn generate(
        &mut self,
        key_id: KeyId,
        uuid: &str,
        format: CsrFormat,
    ) -> IdentityResult<Vec<u8>> {
        let mut buf = vec![0u8; self.buffer_size];
        let len = self.generate_into(key_id, uuid, &mut buf)?;
        let der = &buf[buf.len() - len..];

        let out = match format {
            CsrFormat::Der => der.to_vec(),
            CsrFormat::Pem => {
                let pem = der_to_pem(PEM_LABEL_CSR, der);
                self.state = CsrState::PemEncoded;
                pem.into_bytes()
            }
            CsrFormat::Json => {
                let pem = der_to_pem(PEM_LABEL_CSR, der);
                self.state = CsrState::PemEncoded;
                csr_json_encode(&pem).map_err(|_| self.fail(IdentityError::EncodingFailed))?
            }
        };
        self.state = CsrState::Done;
        Ok(out)
    }
}

/// Wraps a PEM CSR in the `{"CSR": "<pem>"}` envelope.
///
/// # Errors
///
/// Returns `Serialization` if JSON encoding fails.
pub fn csr_json_encode(pem: &str) -> IdentityResult<Vec<u8>> {
    serde_json::to_vec(&CsrJson {
        csr: pem.to_string(),
    })
    .map_err(IdentityError::serialization)
}

fn encoding(err: IdentityError) -> IdentityError {
    match err {
        IdentityError::BufferTooSmall => err,
        _ => IdentityError::EncodingFailed,
    }
}
