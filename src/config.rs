use std::path::{Path, PathBuf};

use serde::Deserialize;
use time::Duration;
use url::Url;

use crate::{
    authn_request::ProtocolBinding, certificate::CertificateSelector, error::ConfigurationError,
    signature::SignatureAlgorithm, utils::DocumentLimits, NAME_ID_FORMAT_UNSPECIFIED,
};

/// Where the SP signing key pair comes from.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SigningKeySource {
    /// PKCS#12 bundle holding both the key and the certificate.
    Pkcs12File { path: PathBuf, password: String },
    /// Separate PEM files for the private key and the certificate.
    PemFiles {
        key_path: PathBuf,
        certificate_path: PathBuf,
    },
    /// PEM material supplied inline.
    Inline {
        private_key_pem: String,
        certificate_pem: String,
    },
    /// A directory of PEM/PKCS#12 files searched by selector.
    Store {
        directory: PathBuf,
        #[serde(default)]
        password: Option<String>,
        selector: CertificateSelector,
    },
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ContactType {
    #[default]
    Technical,
    Support,
    Administrative,
    Billing,
    Other,
}

impl ContactType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContactType::Technical => "technical",
            ContactType::Support => "support",
            ContactType::Administrative => "administrative",
            ContactType::Billing => "billing",
            ContactType::Other => "other",
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq, Default)]
pub struct ContactPerson {
    #[serde(default)]
    pub contact_type: ContactType,
    pub company: Option<String>,
    pub given_name: Option<String>,
    pub surname: Option<String>,
    #[serde(default)]
    pub email_addresses: Vec<String>,
    #[serde(default)]
    pub telephone_numbers: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct Organization {
    pub name: String,
    pub display_name: String,
    pub url: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MetadataConfig {
    /// IdP metadata location: an http(s) URL or a local file path.
    pub address: Option<String>,
    pub fetch_timeout_seconds: u64,
    /// Require IdP metadata to carry a signature made by one of these certificates.
    pub signing_certificate_files: Vec<PathBuf>,
    /// Write the generated SP metadata to disk at startup.
    pub create_metadata_file: bool,
    pub metadata_file_name: String,
    pub metadata_folder: PathBuf,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            address: None,
            fetch_timeout_seconds: 10,
            signing_certificate_files: Vec::new(),
            create_metadata_file: false,
            metadata_file_name: "Metadata.xml".into(),
            metadata_folder: PathBuf::from("wwwroot"),
        }
    }
}

impl MetadataConfig {
    pub fn metadata_file_path(&self) -> PathBuf {
        self.metadata_folder.join(&self.metadata_file_name)
    }
}

/// Service provider settings, fixed at startup and shared read-only.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ServiceProviderConfig {
    pub entity_id: String,
    pub assertion_consumer_service_url: String,
    pub sign_out_url: String,
    #[serde(default)]
    pub application_production_url: Option<String>,
    #[serde(default)]
    pub application_stage_url: Option<String>,

    #[serde(default)]
    pub signing_key: Option<SigningKeySource>,
    #[serde(default)]
    pub trusted_certificate_files: Vec<PathBuf>,
    #[serde(default)]
    pub signature_algorithm: SignatureAlgorithm,

    /// Sign outgoing AuthnRequest and logout messages.
    #[serde(default)]
    pub require_message_signed: bool,
    #[serde(default = "default_true")]
    pub want_assertions_signed: bool,
    #[serde(default)]
    pub want_responses_signed: bool,
    #[serde(default = "default_true")]
    pub require_signed_logout: bool,
    #[serde(default)]
    pub force_authn: bool,
    #[serde(default)]
    pub is_passive: bool,
    #[serde(default)]
    pub allow_idp_initiated: bool,
    #[serde(default)]
    pub authn_request_binding: ProtocolBinding,
    #[serde(default = "default_name_id_format")]
    pub name_id_format: String,

    #[serde(default = "default_clock_skew")]
    pub clock_skew_seconds: u64,
    #[serde(default = "default_request_lifetime")]
    pub request_lifetime_seconds: u64,
    #[serde(default = "default_ticket_lifetime")]
    pub ticket_lifetime_seconds: u64,
    #[serde(default = "default_validation_timeout")]
    pub validation_timeout_millis: u64,
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
    #[serde(default = "default_max_xml_depth")]
    pub max_xml_depth: usize,

    #[serde(default)]
    pub metadata: MetadataConfig,

    #[serde(default)]
    pub service_name: Option<String>,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default)]
    pub organization: Option<Organization>,
    #[serde(default)]
    pub contact_person: Option<ContactPerson>,

    /// Log subject identifiers and attribute values.
    #[serde(default)]
    pub show_pii: bool,
}

fn default_true() -> bool {
    true
}

fn default_name_id_format() -> String {
    NAME_ID_FORMAT_UNSPECIFIED.into()
}

const MAX_CLOCK_SKEW_SECONDS: u64 = 60 * 60;
const MAX_REQUEST_LIFETIME_SECONDS: u64 = 24 * 60 * 60;
const MAX_TICKET_LIFETIME_SECONDS: u64 = 366 * 24 * 60 * 60;

fn default_clock_skew() -> u64 {
    180
}

fn default_request_lifetime() -> u64 {
    300
}

fn default_ticket_lifetime() -> u64 {
    3600
}

fn default_validation_timeout() -> u64 {
    5000
}

fn default_max_message_size() -> usize {
    512 * 1024
}

fn default_max_xml_depth() -> usize {
    64
}

fn default_language() -> String {
    "en-US".into()
}

impl ServiceProviderConfig {
    pub fn builder(
        entity_id: &str,
        acs_url: &str,
        sign_out_url: &str,
    ) -> ServiceProviderConfigBuilder {
        ServiceProviderConfigBuilder::new(entity_id, acs_url, sign_out_url)
    }

    pub fn from_toml_str(input: &str) -> Result<Self, ConfigurationError> {
        let config: Self = toml::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigurationError> {
        let path = path.as_ref();
        let input = std::fs::read_to_string(path).map_err(|source| ConfigurationError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&input)
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        match Url::parse(&self.entity_id) {
            Ok(url) if !url.cannot_be_a_base() || url.scheme() == "urn" => {}
            _ => return Err(ConfigurationError::InvalidEntityId(self.entity_id.clone())),
        }

        check_http_url("assertion_consumer_service_url", &self.assertion_consumer_service_url)?;
        check_http_url("sign_out_url", &self.sign_out_url)?;
        if let Some(url) = &self.application_production_url {
            check_http_url("application_production_url", url)?;
        }
        if let Some(url) = &self.application_stage_url {
            check_http_url("application_stage_url", url)?;
        }
        if let Some(organization) = &self.organization {
            check_http_url("organization.url", &organization.url)?;
        }

        if self.require_message_signed && self.signing_key.is_none() {
            return Err(ConfigurationError::MissingField("signing_key"));
        }
        if self.name_id_format.is_empty() {
            return Err(ConfigurationError::MissingField("name_id_format"));
        }

        for (name, value) in [
            ("request_lifetime_seconds", self.request_lifetime_seconds),
            ("ticket_lifetime_seconds", self.ticket_lifetime_seconds),
            ("validation_timeout_millis", self.validation_timeout_millis),
            ("metadata.fetch_timeout_seconds", self.metadata.fetch_timeout_seconds),
            ("max_message_size", self.max_message_size as u64),
            ("max_xml_depth", self.max_xml_depth as u64),
        ] {
            if value == 0 {
                return Err(ConfigurationError::InvalidLimit(name));
            }
        }
        for (name, value, max) in [
            (
                "clock_skew_seconds",
                self.clock_skew_seconds,
                MAX_CLOCK_SKEW_SECONDS,
            ),
            (
                "request_lifetime_seconds",
                self.request_lifetime_seconds,
                MAX_REQUEST_LIFETIME_SECONDS,
            ),
            (
                "ticket_lifetime_seconds",
                self.ticket_lifetime_seconds,
                MAX_TICKET_LIFETIME_SECONDS,
            ),
        ] {
            if value > max {
                return Err(ConfigurationError::LimitOutOfRange { name, max });
            }
        }
        Ok(())
    }

    /// Every URL at which this SP accepts assertions, default first.
    pub fn acs_urls(&self) -> Vec<&str> {
        let mut urls = vec![self.assertion_consumer_service_url.as_str()];
        urls.extend(self.application_production_url.as_deref());
        urls.extend(self.application_stage_url.as_deref());
        urls
    }

    pub fn clock_skew(&self) -> Duration {
        Duration::seconds(self.clock_skew_seconds as i64)
    }

    pub fn request_lifetime(&self) -> Duration {
        Duration::seconds(self.request_lifetime_seconds as i64)
    }

    pub fn ticket_lifetime(&self) -> Duration {
        Duration::seconds(self.ticket_lifetime_seconds as i64)
    }

    pub fn validation_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.validation_timeout_millis)
    }

    pub fn metadata_fetch_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.metadata.fetch_timeout_seconds)
    }

    pub(crate) fn document_limits(&self) -> DocumentLimits {
        DocumentLimits {
            max_size: self.max_message_size,
            max_depth: self.max_xml_depth,
        }
    }
}

fn check_http_url(field: &'static str, value: &str) -> Result<(), ConfigurationError> {
    match Url::parse(value) {
        Ok(url) if matches!(url.scheme(), "http" | "https") && url.host().is_some() => Ok(()),
        _ => Err(ConfigurationError::InvalidUrl {
            field,
            value: value.to_string(),
        }),
    }
}

pub struct ServiceProviderConfigBuilder {
    config: ServiceProviderConfig,
}

impl ServiceProviderConfigBuilder {
    pub fn new(entity_id: &str, acs_url: &str, sign_out_url: &str) -> Self {
        Self {
            config: ServiceProviderConfig {
                entity_id: entity_id.into(),
                assertion_consumer_service_url: acs_url.into(),
                sign_out_url: sign_out_url.into(),
                application_production_url: None,
                application_stage_url: None,
                signing_key: None,
                trusted_certificate_files: Vec::new(),
                signature_algorithm: SignatureAlgorithm::default(),
                require_message_signed: false,
                want_assertions_signed: true,
                want_responses_signed: false,
                require_signed_logout: true,
                force_authn: false,
                is_passive: false,
                allow_idp_initiated: false,
                authn_request_binding: ProtocolBinding::default(),
                name_id_format: default_name_id_format(),
                clock_skew_seconds: default_clock_skew(),
                request_lifetime_seconds: default_request_lifetime(),
                ticket_lifetime_seconds: default_ticket_lifetime(),
                validation_timeout_millis: default_validation_timeout(),
                max_message_size: default_max_message_size(),
                max_xml_depth: default_max_xml_depth(),
                metadata: MetadataConfig::default(),
                service_name: None,
                language: default_language(),
                organization: None,
                contact_person: None,
                show_pii: false,
            },
        }
    }

    pub fn signing_key(mut self, source: SigningKeySource) -> Self {
        self.config.signing_key = Some(source);
        self
    }

    pub fn trusted_certificate_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.trusted_certificate_files.push(path.into());
        self
    }

    pub fn signature_algorithm(mut self, algorithm: SignatureAlgorithm) -> Self {
        self.config.signature_algorithm = algorithm;
        self
    }

    pub fn require_message_signed(mut self, value: bool) -> Self {
        self.config.require_message_signed = value;
        self
    }

    pub fn want_assertions_signed(mut self, value: bool) -> Self {
        self.config.want_assertions_signed = value;
        self
    }

    pub fn want_responses_signed(mut self, value: bool) -> Self {
        self.config.want_responses_signed = value;
        self
    }

    pub fn require_signed_logout(mut self, value: bool) -> Self {
        self.config.require_signed_logout = value;
        self
    }

    pub fn force_authn(mut self, value: bool) -> Self {
        self.config.force_authn = value;
        self
    }

    pub fn is_passive(mut self, value: bool) -> Self {
        self.config.is_passive = value;
        self
    }

    pub fn allow_idp_initiated(mut self, value: bool) -> Self {
        self.config.allow_idp_initiated = value;
        self
    }

    pub fn authn_request_binding(mut self, binding: ProtocolBinding) -> Self {
        self.config.authn_request_binding = binding;
        self
    }

    pub fn name_id_format(mut self, format: &str) -> Self {
        self.config.name_id_format = format.into();
        self
    }

    pub fn clock_skew_seconds(mut self, seconds: u64) -> Self {
        self.config.clock_skew_seconds = seconds;
        self
    }

    pub fn request_lifetime_seconds(mut self, seconds: u64) -> Self {
        self.config.request_lifetime_seconds = seconds;
        self
    }

    pub fn ticket_lifetime_seconds(mut self, seconds: u64) -> Self {
        self.config.ticket_lifetime_seconds = seconds;
        self
    }

    pub fn max_message_size(mut self, bytes: usize) -> Self {
        self.config.max_message_size = bytes;
        self
    }

    pub fn metadata_address(mut self, address: &str) -> Self {
        self.config.metadata.address = Some(address.into());
        self
    }

    pub fn metadata(mut self, metadata: MetadataConfig) -> Self {
        self.config.metadata = metadata;
        self
    }

    pub fn application_production_url(mut self, url: &str) -> Self {
        self.config.application_production_url = Some(url.into());
        self
    }

    pub fn application_stage_url(mut self, url: &str) -> Self {
        self.config.application_stage_url = Some(url.into());
        self
    }

    pub fn service_name(mut self, name: &str) -> Self {
        self.config.service_name = Some(name.into());
        self
    }

    pub fn language(mut self, language: &str) -> Self {
        self.config.language = language.into();
        self
    }

    pub fn organization(mut self, organization: Organization) -> Self {
        self.config.organization = Some(organization);
        self
    }

    pub fn contact_person(mut self, contact: ContactPerson) -> Self {
        self.config.contact_person = Some(contact);
        self
    }

    pub fn show_pii(mut self, value: bool) -> Self {
        self.config.show_pii = value;
        self
    }

    pub fn build(self) -> Result<ServiceProviderConfig, ConfigurationError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
entity_id = "https://sp.example.org"
assertion_consumer_service_url = "https://sp.example.org/saml2/acs"
sign_out_url = "https://sp.example.org/signedout"
require_message_signed = true
want_assertions_signed = false
force_authn = true
service_name = "My Test Site"

[signing_key]
kind = "pkcs12_file"
path = "democert.pfx"
password = "1234"

[metadata]
address = "https://idp.example.org/metadata"
create_metadata_file = true

[organization]
name = "Example Org"
display_name = "Example Organization"
url = "https://example.org"

[contact_person]
contact_type = "technical"
given_name = "Jo"
email_addresses = ["jo@example.org"]
"#;

    #[test]
    fn loads_toml_with_defaults() {
        let config = ServiceProviderConfig::from_toml_str(SAMPLE).unwrap();
        assert!(config.require_message_signed);
        assert!(!config.want_assertions_signed);
        assert!(config.force_authn);
        assert!(config.require_signed_logout);
        assert_eq!(config.clock_skew(), Duration::minutes(3));
        assert_eq!(config.request_lifetime(), Duration::minutes(5));
        assert_eq!(config.metadata.metadata_file_name, "Metadata.xml");
        assert_eq!(
            config.signing_key,
            Some(SigningKeySource::Pkcs12File {
                path: "democert.pfx".into(),
                password: "1234".into()
            })
        );
        assert_eq!(
            config.contact_person.unwrap().contact_type,
            ContactType::Technical
        );
    }

    #[test]
    fn rejects_unbounded_lifetimes() {
        let builder = || {
            ServiceProviderConfig::builder(
                "https://sp.example.org",
                "https://sp.example.org/acs",
                "https://sp.example.org/signedout",
            )
        };
        let err = builder()
            .ticket_lifetime_seconds(400_000_000_000)
            .build()
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigurationError::LimitOutOfRange {
                name: "ticket_lifetime_seconds",
                ..
            }
        ));
        let err = builder()
            .request_lifetime_seconds(u64::MAX)
            .build()
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigurationError::LimitOutOfRange {
                name: "request_lifetime_seconds",
                ..
            }
        ));
        let err = builder().clock_skew_seconds(u64::MAX).build().unwrap_err();
        assert!(matches!(
            err,
            ConfigurationError::LimitOutOfRange {
                name: "clock_skew_seconds",
                ..
            }
        ));

        let config = builder()
            .ticket_lifetime_seconds(MAX_TICKET_LIFETIME_SECONDS)
            .build()
            .unwrap();
        assert_eq!(config.ticket_lifetime(), Duration::days(366));
    }

    #[test]
    fn toml_lifetimes_are_bounded() {
        let input = SAMPLE.replace(
            "force_authn = true",
            "force_authn = true\nticket_lifetime_seconds = 400000000000",
        );
        let err = ServiceProviderConfig::from_toml_str(&input).unwrap_err();
        assert!(matches!(err, ConfigurationError::LimitOutOfRange { .. }));
    }

    #[test]
    fn rejects_relative_entity_id() {
        let err = ServiceProviderConfig::builder("my-sp", "https://sp/acs", "https://sp/out")
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigurationError::InvalidEntityId(_)));
    }

    #[test]
    fn accepts_urn_entity_id() {
        ServiceProviderConfig::builder(
            "urn:example:sp",
            "https://sp.example.org/acs",
            "https://sp.example.org/signedout",
        )
        .build()
        .unwrap();
    }

    #[test]
    fn signing_requires_key_source() {
        let err = ServiceProviderConfig::builder(
            "https://sp.example.org",
            "https://sp.example.org/acs",
            "https://sp.example.org/signedout",
        )
        .require_message_signed(true)
        .build()
        .unwrap_err();
        assert!(matches!(err, ConfigurationError::MissingField("signing_key")));
    }

    #[test]
    fn rejects_non_http_acs_url() {
        let err = ServiceProviderConfig::builder(
            "https://sp.example.org",
            "/saml2/acs",
            "https://sp.example.org/signedout",
        )
        .build()
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigurationError::InvalidUrl {
                field: "assertion_consumer_service_url",
                ..
            }
        ));
    }

    #[test]
    fn acs_urls_include_production_and_stage() {
        let config = ServiceProviderConfig::builder(
            "https://sp.example.org",
            "https://sp.example.org/acs",
            "https://sp.example.org/signedout",
        )
        .application_production_url("https://prod.example.org/acs")
        .application_stage_url("https://stage.example.org/acs")
        .build()
        .unwrap();
        assert_eq!(
            config.acs_urls(),
            [
                "https://sp.example.org/acs",
                "https://prod.example.org/acs",
                "https://stage.example.org/acs"
            ]
        );
    }
}
