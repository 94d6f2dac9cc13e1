//! Signing key and trusted certificate resolution.
//!
//! Certificate material is resolved once (at startup or explicit reload) and
//! is read-only afterwards. Selection by a non-unique attribute fails closed.

use std::{
    fmt,
    path::{Path, PathBuf},
};

use base64::{prelude::BASE64_STANDARD, Engine};
use openssl::{
    hash::MessageDigest,
    pkcs12::Pkcs12,
    pkey::{PKey, Private},
    x509::X509,
};
use serde::Deserialize;

use crate::{
    config::{ServiceProviderConfig, SigningKeySource},
    error::ConfigurationError,
    idp_metadata::TrustDescriptor,
    utils::decode_xml_base64,
};

/// A DER-encoded X.509 certificate known to parse.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Certificate {
    der: Vec<u8>,
}

impl Certificate {
    pub fn from_der(der: &[u8]) -> Result<Self, ConfigurationError> {
        X509::from_der(der).map_err(|e| ConfigurationError::InvalidKeyMaterial(e.to_string()))?;
        Ok(Self { der: der.to_vec() })
    }

    pub fn from_pem(pem: &[u8]) -> Result<Self, ConfigurationError> {
        let x509 =
            X509::from_pem(pem).map_err(|e| ConfigurationError::InvalidKeyMaterial(e.to_string()))?;
        Self::from_x509(&x509)
    }

    /// Parses the base64 body of a `ds:X509Certificate` element.
    pub fn from_base64(encoded: &str) -> Result<Self, ConfigurationError> {
        let der = decode_xml_base64(encoded)
            .map_err(|e| ConfigurationError::InvalidKeyMaterial(e.to_string()))?;
        Self::from_der(&der)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigurationError> {
        let bytes = read(path)?;
        if bytes.starts_with(b"-----") || bytes.windows(5).any(|w| w == b"BEGIN") {
            Self::from_pem(&bytes)
        } else {
            Self::from_der(&bytes)
        }
    }

    fn from_x509(x509: &X509) -> Result<Self, ConfigurationError> {
        let der = x509
            .to_der()
            .map_err(|e| ConfigurationError::InvalidKeyMaterial(e.to_string()))?;
        Ok(Self { der })
    }

    pub fn der(&self) -> &[u8] {
        &self.der
    }

    pub fn to_base64(&self) -> String {
        BASE64_STANDARD.encode(&self.der)
    }

    pub fn to_pem(&self) -> Vec<u8> {
        self.x509().and_then(|x| x.to_pem().ok()).unwrap_or_default()
    }

    pub(crate) fn x509(&self) -> Option<X509> {
        X509::from_der(&self.der).ok()
    }

    /// Uppercase hex serial number without leading zeros.
    pub fn serial_number(&self) -> String {
        self.x509()
            .and_then(|x| x.serial_number().to_bn().ok())
            .and_then(|bn| bn.to_hex_str().ok())
            .map(|hex| normalize_hex(&hex))
            .unwrap_or_default()
    }

    /// Uppercase hex SHA-1 digest of the DER encoding.
    pub fn thumbprint(&self) -> String {
        self.x509()
            .and_then(|x| x.digest(MessageDigest::sha1()).ok())
            .map(|digest| hex::encode_upper(&*digest))
            .unwrap_or_default()
    }

    /// Subject distinguished name rendered as `CN=..., O=...`.
    pub fn subject(&self) -> String {
        let Some(x509) = self.x509() else {
            return String::new();
        };
        x509.subject_name()
            .entries()
            .filter_map(|entry| {
                let name = entry.object().nid().short_name().ok()?;
                let value = entry.data().as_utf8().ok()?;
                Some(format!("{name}={value}"))
            })
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl fmt::Debug for Certificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Certificate")
            .field("subject", &self.subject())
            .field("thumbprint", &self.thumbprint())
            .finish()
    }
}

/// The SP private key together with its certificate.
#[derive(Clone)]
pub struct SigningCredential {
    key: PKey<Private>,
    certificate: Certificate,
}

impl SigningCredential {
    pub fn new(key: PKey<Private>, certificate: Certificate) -> Result<Self, ConfigurationError> {
        let x509 = certificate
            .x509()
            .ok_or_else(|| {
                ConfigurationError::InvalidKeyMaterial("unreadable certificate".into())
            })?;
        let public = x509
            .public_key()
            .map_err(|e| ConfigurationError::InvalidKeyMaterial(e.to_string()))?;
        if !public.public_eq(&key) {
            return Err(ConfigurationError::InvalidKeyMaterial(
                "private key does not belong to the certificate".into(),
            ));
        }
        Ok(Self { key, certificate })
    }

    pub fn from_pem(
        private_key_pem: &[u8],
        certificate_pem: &[u8],
    ) -> Result<Self, ConfigurationError> {
        let key = PKey::private_key_from_pem(private_key_pem)
            .map_err(|e| ConfigurationError::InvalidKeyMaterial(e.to_string()))?;
        Self::new(key, Certificate::from_pem(certificate_pem)?)
    }

    pub fn from_pkcs12(der: &[u8], password: &str) -> Result<Self, ConfigurationError> {
        let parsed = Pkcs12::from_der(der)
            .and_then(|p| p.parse2(password))
            .map_err(|e| ConfigurationError::InvalidKeyMaterial(e.to_string()))?;
        let key = parsed
            .pkey
            .ok_or_else(|| {
                ConfigurationError::KeyNotFound("private key in PKCS#12 bundle".into())
            })?;
        let cert = parsed
            .cert
            .ok_or_else(|| {
                ConfigurationError::KeyNotFound("certificate in PKCS#12 bundle".into())
            })?;
        Self::new(key, Certificate::from_x509(&cert)?)
    }

    pub fn key(&self) -> &PKey<Private> {
        &self.key
    }

    pub fn certificate(&self) -> &Certificate {
        &self.certificate
    }

    pub(crate) fn private_key_pem(&self) -> Result<Vec<u8>, String> {
        self.key.private_key_to_pem_pkcs8().map_err(|e| e.to_string())
    }
}

impl fmt::Debug for SigningCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningCredential")
            .field("certificate", &self.certificate)
            .finish_non_exhaustive()
    }
}

/// How to pick a certificate out of a store.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(tag = "by", content = "value", rename_all = "snake_case")]
pub enum CertificateSelector {
    SerialNumber(String),
    Thumbprint(String),
    /// Case-insensitive substring of the subject DN.
    SubjectName(String),
}

impl CertificateSelector {
    pub fn matches(&self, certificate: &Certificate) -> bool {
        match self {
            CertificateSelector::SerialNumber(serial) => {
                normalize_hex(serial) == certificate.serial_number()
            }
            CertificateSelector::Thumbprint(thumbprint) => {
                normalize_hex(thumbprint) == normalize_hex(&certificate.thumbprint())
            }
            CertificateSelector::SubjectName(name) => certificate
                .subject()
                .to_lowercase()
                .contains(&name.to_lowercase()),
        }
    }
}

impl fmt::Display for CertificateSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CertificateSelector::SerialNumber(v) => write!(f, "serial number {v}"),
            CertificateSelector::Thumbprint(v) => write!(f, "thumbprint {v}"),
            CertificateSelector::SubjectName(v) => write!(f, "subject name {v:?}"),
        }
    }
}

fn normalize_hex(value: &str) -> String {
    let cleaned: String = value
        .chars()
        .filter(|c| c.is_ascii_hexdigit())
        .map(|c| c.to_ascii_uppercase())
        .collect();
    let trimmed = cleaned.trim_start_matches('0');
    if trimmed.is_empty() {
        "0".into()
    } else {
        trimmed.into()
    }
}

fn read(path: &Path) -> Result<Vec<u8>, ConfigurationError> {
    std::fs::read(path).map_err(|source| ConfigurationError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Resolves the SP key pair and the certificates trusted for IdP signatures.
pub trait CertificateProvider: Send + Sync {
    fn resolve_signing_key(&self) -> Result<SigningCredential, ConfigurationError>;

    fn resolve_trusted_certificates(
        &self,
        trust: &TrustDescriptor,
    ) -> Result<Vec<Certificate>, ConfigurationError>;
}

struct StoreEntry {
    path: PathBuf,
    certificate: Certificate,
    key: Option<PKey<Private>>,
}

/// A directory of PEM (`.pem`, `.crt`, `.cer`) and PKCS#12 (`.pfx`, `.p12`) files.
#[derive(Debug, Clone)]
pub struct DirectoryCertificateStore {
    directory: PathBuf,
    password: Option<String>,
}

impl DirectoryCertificateStore {
    pub fn new(directory: impl Into<PathBuf>, password: Option<String>) -> Self {
        Self {
            directory: directory.into(),
            password,
        }
    }

    fn entries(&self) -> Result<Vec<StoreEntry>, ConfigurationError> {
        let io_err = |source| ConfigurationError::Io {
            path: self.directory.clone(),
            source,
        };
        let mut paths = std::fs::read_dir(&self.directory)
            .map_err(io_err)?
            .map(|entry| entry.map(|e| e.path()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(io_err)?;
        paths.sort();

        let mut entries = Vec::new();
        for path in paths {
            let extension = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| e.to_ascii_lowercase());
            match extension.as_deref() {
                Some("pem" | "crt" | "cer") => {
                    let bytes = read(&path)?;
                    let key = PKey::private_key_from_pem(&bytes).ok();
                    let certificates = X509::stack_from_pem(&bytes)
                        .map_err(|e| ConfigurationError::InvalidKeyMaterial(e.to_string()))?;
                    for x509 in certificates {
                        entries.push(StoreEntry {
                            path: path.clone(),
                            certificate: Certificate::from_x509(&x509)?,
                            key: key.clone(),
                        });
                    }
                }
                Some("pfx" | "p12") => {
                    let bytes = read(&path)?;
                    let password = self.password.as_deref().unwrap_or_default();
                    match SigningCredential::from_pkcs12(&bytes, password) {
                        Ok(credential) => entries.push(StoreEntry {
                            path: path.clone(),
                            certificate: credential.certificate,
                            key: Some(credential.key),
                        }),
                        Err(e) => {
                            tracing::debug!(
                                path = %path.display(),
                                error = %e,
                                "skipping unreadable PKCS#12 file"
                            );
                        }
                    }
                }
                _ => {}
            }
        }
        Ok(entries)
    }

    /// Certificates matching the selector, regardless of whether a key is present.
    pub fn find(
        &self,
        selector: &CertificateSelector,
    ) -> Result<Vec<Certificate>, ConfigurationError> {
        Ok(self
            .entries()?
            .into_iter()
            .filter(|entry| selector.matches(&entry.certificate))
            .map(|entry| entry.certificate)
            .collect())
    }

    pub fn find_signing_key(
        &self,
        selector: &CertificateSelector,
    ) -> Result<SigningCredential, ConfigurationError> {
        let mut matches: Vec<_> = self
            .entries()?
            .into_iter()
            .filter(|entry| selector.matches(&entry.certificate))
            .collect();
        match matches.len() {
            0 => Err(ConfigurationError::KeyNotFound(selector.to_string())),
            1 => {
                let entry = matches.remove(0);
                let key = entry.key.ok_or_else(|| {
                    ConfigurationError::KeyNotFound(format!(
                        "private key for {selector} in {}",
                        entry.path.display()
                    ))
                })?;
                SigningCredential::new(key, entry.certificate)
            }
            count => Err(ConfigurationError::AmbiguousKey {
                selector: selector.to_string(),
                count,
            }),
        }
    }
}

/// Resolves keys from a [`SigningKeySource`] plus pinned trust anchors.
#[derive(Debug, Clone, Default)]
pub struct ConfiguredCertificateProvider {
    signing_key: Option<SigningKeySource>,
    pinned: Vec<Certificate>,
}

impl ConfiguredCertificateProvider {
    pub fn new(signing_key: Option<SigningKeySource>, pinned: Vec<Certificate>) -> Self {
        Self {
            signing_key,
            pinned,
        }
    }

    pub fn from_config(config: &ServiceProviderConfig) -> Result<Self, ConfigurationError> {
        let pinned = config
            .trusted_certificate_files
            .iter()
            .map(|path| Certificate::from_file(path))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(config.signing_key.clone(), pinned))
    }
}

impl CertificateProvider for ConfiguredCertificateProvider {
    fn resolve_signing_key(&self) -> Result<SigningCredential, ConfigurationError> {
        match &self.signing_key {
            None => Err(ConfigurationError::KeyNotFound("no signing key configured".into())),
            Some(SigningKeySource::Pkcs12File { path, password }) => {
                SigningCredential::from_pkcs12(&read(path)?, password)
            }
            Some(SigningKeySource::PemFiles {
                key_path,
                certificate_path,
            }) => SigningCredential::from_pem(&read(key_path)?, &read(certificate_path)?),
            Some(SigningKeySource::Inline {
                private_key_pem,
                certificate_pem,
            }) => {
                SigningCredential::from_pem(private_key_pem.as_bytes(), certificate_pem.as_bytes())
            }
            Some(SigningKeySource::Store {
                directory,
                password,
                selector,
            }) => DirectoryCertificateStore::new(directory, password.clone())
                .find_signing_key(selector),
        }
    }

    fn resolve_trusted_certificates(
        &self,
        trust: &TrustDescriptor,
    ) -> Result<Vec<Certificate>, ConfigurationError> {
        let mut certificates = trust.certificates.clone();
        for certificate in &self.pinned {
            if !certificates.contains(certificate) {
                certificates.push(certificate.clone());
            }
        }
        Ok(certificates)
    }
}
