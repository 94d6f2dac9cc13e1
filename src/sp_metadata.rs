use std::path::PathBuf;

use yaserde::YaSerialize;

use crate::{
    authn_request::ProtocolBinding,
    certificate::Certificate,
    config::{
        ContactPerson as ContactConfig, MetadataConfig, Organization as OrganizationConfig,
        ServiceProviderConfig,
    },
    error::{ConfigurationError, Error},
};

#[derive(YaSerialize)]
#[yaserde(
  namespaces = {
    "md" = "urn:oasis:names:tc:SAML:2.0:metadata",
    "ds" = "http://www.w3.org/2000/09/xmldsig#",
  },
  prefix = "md"
)]
struct EntityDescriptor {
    #[yaserde(attribute = true, rename = "entityID")]
    entity_id: String,
    #[yaserde(rename = "SPSSODescriptor", prefix = "md")]
    sp_sso_descriptor: SPSSODescriptor,
    #[yaserde(rename = "Organization", prefix = "md")]
    organization: Option<Organization>,
    #[yaserde(rename = "ContactPerson", prefix = "md")]
    contact_person: Vec<ContactPerson>,
}

#[derive(YaSerialize)]
struct SPSSODescriptor {
    #[yaserde(attribute = true, rename = "AuthnRequestsSigned")]
    authn_requests_signed: bool,
    #[yaserde(attribute = true, rename = "WantAssertionsSigned")]
    want_assertions_signed: bool,
    #[yaserde(attribute = true, rename = "protocolSupportEnumeration")]
    protocol_support_enumeration: String,
    #[yaserde(rename = "KeyDescriptor", prefix = "md")]
    key_descriptor: Vec<KeyDescriptor>,
    #[yaserde(rename = "SingleLogoutService", prefix = "md")]
    single_logout_service: Vec<Endpoint>,
    #[yaserde(rename = "NameIDFormat", prefix = "md")]
    name_id_format: Vec<String>,
    #[yaserde(rename = "AssertionConsumerService", prefix = "md")]
    assertion_consumer_service: Vec<IndexedEndpoint>,
    #[yaserde(rename = "AttributeConsumingService", prefix = "md")]
    attribute_consuming_service: Option<AttributeConsumingService>,
}

#[derive(YaSerialize)]
struct KeyDescriptor {
    #[yaserde(attribute = true, rename = "use")]
    key_use: String,
    #[yaserde(rename = "KeyInfo", prefix = "ds")]
    key_info: KeyInfo,
}

#[derive(YaSerialize)]
struct KeyInfo {
    #[yaserde(rename = "X509Data", prefix = "ds")]
    x509_data: X509Data,
}

#[derive(YaSerialize)]
struct X509Data {
    #[yaserde(rename = "X509Certificate", prefix = "ds")]
    x509_certificate: String,
}

#[derive(YaSerialize)]
struct Endpoint {
    #[yaserde(attribute = true, rename = "Binding")]
    binding: String,
    #[yaserde(attribute = true, rename = "Location")]
    location: String,
}

#[derive(YaSerialize)]
struct IndexedEndpoint {
    #[yaserde(attribute = true, rename = "Binding")]
    binding: String,
    #[yaserde(attribute = true, rename = "Location")]
    location: String,
    #[yaserde(attribute = true)]
    index: u32,
    #[yaserde(attribute = true, rename = "isDefault")]
    is_default: Option<bool>,
}

#[derive(YaSerialize)]
struct AttributeConsumingService {
    #[yaserde(attribute = true)]
    index: u32,
    #[yaserde(rename = "ServiceName", prefix = "md")]
    service_name: LocalizedName,
}

#[derive(YaSerialize)]
struct LocalizedName {
    #[yaserde(attribute = true, rename = "xml:lang")]
    lang: String,
    #[yaserde(text = true)]
    content: String,
}

#[derive(YaSerialize)]
struct Organization {
    #[yaserde(rename = "OrganizationName", prefix = "md")]
    name: LocalizedName,
    #[yaserde(rename = "OrganizationDisplayName", prefix = "md")]
    display_name: LocalizedName,
    #[yaserde(rename = "OrganizationURL", prefix = "md")]
    url: LocalizedName,
}

#[derive(YaSerialize)]
struct ContactPerson {
    #[yaserde(attribute = true, rename = "contactType")]
    contact_type: String,
    #[yaserde(rename = "Company", prefix = "md")]
    company: Option<String>,
    #[yaserde(rename = "GivenName", prefix = "md")]
    given_name: Option<String>,
    #[yaserde(rename = "SurName", prefix = "md")]
    surname: Option<String>,
    #[yaserde(rename = "EmailAddress", prefix = "md")]
    email_address: Vec<String>,
    #[yaserde(rename = "TelephoneNumber", prefix = "md")]
    telephone_number: Vec<String>,
}

#[derive(Default)]
pub struct SpMetadataBuilder {
    entity_id: Option<String>,
    acs_urls: Vec<String>,
    slo_url: Option<String>,
    name_id_format: Option<String>,
    signing_certificate: Option<Certificate>,
    authn_requests_signed: bool,
    want_assertions_signed: bool,
    language: Option<String>,
    service_name: Option<String>,
    organization: Option<OrganizationConfig>,
    contact_person: Option<ContactConfig>,
}

impl SpMetadataBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entity_id(self, entity_id: &str) -> Self {
        Self {
            entity_id: Some(entity_id.into()),
            ..self
        }
    }

    /// Adds an `AssertionConsumerService`; the first one added is the default.
    pub fn acs_url(mut self, acs_url: &str) -> Self {
        self.acs_urls.push(acs_url.into());
        self
    }

    pub fn slo_url(self, slo_url: &str) -> Self {
        Self {
            slo_url: Some(slo_url.into()),
            ..self
        }
    }

    pub fn name_id_format(self, name_id_format: &str) -> Self {
        Self {
            name_id_format: Some(name_id_format.into()),
            ..self
        }
    }

    pub fn signing_certificate(self, certificate: Certificate) -> Self {
        Self {
            signing_certificate: Some(certificate),
            ..self
        }
    }

    pub fn authn_requests_signed(self, signed: bool) -> Self {
        Self {
            authn_requests_signed: signed,
            ..self
        }
    }

    pub fn want_assertions_signed(self, signed: bool) -> Self {
        Self {
            want_assertions_signed: signed,
            ..self
        }
    }

    pub fn language(self, language: &str) -> Self {
        Self {
            language: Some(language.into()),
            ..self
        }
    }

    pub fn service_name(self, service_name: &str) -> Self {
        Self {
            service_name: Some(service_name.into()),
            ..self
        }
    }

    pub fn organization(self, organization: OrganizationConfig) -> Self {
        Self {
            organization: Some(organization),
            ..self
        }
    }

    pub fn contact_person(self, contact_person: ContactConfig) -> Self {
        Self {
            contact_person: Some(contact_person),
            ..self
        }
    }

    pub fn build(self) -> Result<String, Error> {
        let entity_id = self
            .entity_id
            .ok_or(ConfigurationError::MissingField("entity_id"))?;
        if self.acs_urls.is_empty() {
            return Err(ConfigurationError::MissingField("assertion_consumer_service_url").into());
        }
        let language = self.language.unwrap_or_else(|| "en".into());
        let localized = |content: &str| LocalizedName {
            lang: language.clone(),
            content: content.into(),
        };

        let metadata = EntityDescriptor {
            entity_id,
            sp_sso_descriptor: SPSSODescriptor {
                authn_requests_signed: self.authn_requests_signed,
                want_assertions_signed: self.want_assertions_signed,
                protocol_support_enumeration: crate::NS_PROTOCOL.into(),
                key_descriptor: self
                    .signing_certificate
                    .iter()
                    .map(|certificate| KeyDescriptor {
                        key_use: "signing".into(),
                        key_info: KeyInfo {
                            x509_data: X509Data {
                                x509_certificate: certificate.to_base64(),
                            },
                        },
                    })
                    .collect(),
                single_logout_service: self
                    .slo_url
                    .iter()
                    .flat_map(|url| {
                        [ProtocolBinding::Redirect, ProtocolBinding::Post].map(|binding| Endpoint {
                            binding: binding.to_string(),
                            location: url.clone(),
                        })
                    })
                    .collect(),
                name_id_format: self.name_id_format.into_iter().collect(),
                assertion_consumer_service: self
                    .acs_urls
                    .iter()
                    .enumerate()
                    .map(|(index, url)| IndexedEndpoint {
                        binding: ProtocolBinding::Post.to_string(),
                        location: url.clone(),
                        index: index as u32,
                        is_default: (index == 0).then_some(true),
                    })
                    .collect(),
                attribute_consuming_service: self.service_name.as_deref().map(|name| {
                    AttributeConsumingService {
                        index: 0,
                        service_name: localized(name),
                    }
                }),
            },
            organization: self.organization.as_ref().map(|org| Organization {
                name: localized(&org.name),
                display_name: localized(&org.display_name),
                url: localized(&org.url),
            }),
            contact_person: self
                .contact_person
                .into_iter()
                .map(|contact| ContactPerson {
                    contact_type: contact.contact_type.as_str().into(),
                    company: contact.company,
                    given_name: contact.given_name,
                    surname: contact.surname,
                    email_address: contact.email_addresses,
                    telephone_number: contact.telephone_numbers,
                })
                .collect(),
        };
        yaserde::ser::to_string(&metadata).map_err(Error::Xml)
    }
}

/// SP metadata for `config`. The signing certificate is published only when
/// outbound messages are signed.
pub fn build_sp_metadata(
    config: &ServiceProviderConfig,
    signing_certificate: Option<&Certificate>,
) -> Result<String, Error> {
    let mut builder = SpMetadataBuilder::new()
        .entity_id(&config.entity_id)
        .slo_url(&config.sign_out_url)
        .name_id_format(&config.name_id_format)
        .authn_requests_signed(config.require_message_signed)
        .want_assertions_signed(config.want_assertions_signed)
        .language(&config.language);
    for url in config.acs_urls() {
        builder = builder.acs_url(url);
    }
    if config.require_message_signed {
        if let Some(certificate) = signing_certificate {
            builder = builder.signing_certificate(certificate.clone());
        }
    }
    if let Some(name) = &config.service_name {
        builder = builder.service_name(name);
    }
    if let Some(organization) = &config.organization {
        builder = builder.organization(organization.clone());
    }
    if let Some(contact) = &config.contact_person {
        builder = builder.contact_person(contact.clone());
    }
    builder.build()
}

/// Writes `xml` to the configured metadata file, creating its folder.
pub fn write_metadata_file(
    config: &MetadataConfig,
    xml: &str,
) -> Result<PathBuf, ConfigurationError> {
    let path = config.metadata_file_path();
    let io_err = |source| ConfigurationError::Io {
        path: path.clone(),
        source,
    };
    std::fs::create_dir_all(&config.metadata_folder).map_err(io_err)?;
    std::fs::write(&path, xml).map_err(io_err)?;
    tracing::info!(path = %path.display(), "wrote service provider metadata");
    Ok(path)
}
