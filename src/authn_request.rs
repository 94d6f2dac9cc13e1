use std::{fmt::Display, str::FromStr};

use serde::Deserialize;
use time::OffsetDateTime;
use yaserde::YaSerialize;

use crate::{
    binding::{redirect_location, OutboundMessage, PostForm, SAML_REQUEST},
    clock::Clock,
    config::ServiceProviderConfig,
    error::{ConfigurationError, Error, MetadataError},
    idp_metadata::TrustDescriptor,
    signature::XmlSigner,
    store::{PendingRequestKind, PendingRequestRecord, PendingRequestStore},
    utils::{format_instant, random_id},
    NAME_ID_FORMAT_ENTITY,
};

#[derive(YaSerialize)]
#[yaserde(
  namespaces = {
    "samlp" = "urn:oasis:names:tc:SAML:2.0:protocol",
    "saml" = "urn:oasis:names:tc:SAML:2.0:assertion",
  },
  prefix = "samlp"
)]
struct AuthnRequest {
    #[yaserde(attribute = true, rename = "ID")]
    id: String,
    #[yaserde(attribute = true, rename = "Version")]
    version: String,
    #[yaserde(attribute = true, rename = "IssueInstant")]
    issue_instant: String,
    #[yaserde(attribute = true, rename = "Destination")]
    destination: String,
    #[yaserde(attribute = true, rename = "ForceAuthn")]
    force_authn: Option<bool>,
    #[yaserde(attribute = true, rename = "IsPassive")]
    is_passive: Option<bool>,
    #[yaserde(attribute = true, rename = "ProtocolBinding")]
    protocol_binding: String,
    #[yaserde(attribute = true, rename = "AssertionConsumerServiceURL")]
    assertion_consumer_service_url: String,
    #[yaserde(rename = "Issuer", prefix = "saml")]
    issuer: Issuer,
    #[yaserde(rename = "Subject", prefix = "saml")]
    subject: Option<Subject>,
    #[yaserde(rename = "NameIDPolicy", prefix = "samlp")]
    name_id_policy: NameIdPolicy,
}

#[derive(YaSerialize)]
struct Issuer {
    #[yaserde(attribute = true, rename = "Format")]
    format: String,
    #[yaserde(text = true)]
    content: String,
}

#[derive(YaSerialize)]
struct NameIdPolicy {
    #[yaserde(attribute = true, rename = "Format")]
    format: String,
    #[yaserde(attribute = true, rename = "AllowCreate")]
    allow_create: bool,
}

#[derive(YaSerialize)]
struct Subject {
    #[yaserde(rename = "NameID", prefix = "saml")]
    name_id: NameId,
}

#[derive(YaSerialize)]
struct NameId {
    #[yaserde(attribute = true, rename = "Format")]
    format: String,
    #[yaserde(text = true)]
    content: String,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolBinding {
    Post,
    #[default]
    Redirect,
}

impl Display for ProtocolBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            ProtocolBinding::Post => write!(f, "urn:oasis:names:tc:SAML:2.0:bindings:HTTP-POST"),
            ProtocolBinding::Redirect => {
                write!(f, "urn:oasis:names:tc:SAML:2.0:bindings:HTTP-Redirect")
            }
        }
    }
}

impl FromStr for ProtocolBinding {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "urn:oasis:names:tc:SAML:2.0:bindings:HTTP-POST" => Ok(ProtocolBinding::Post),
            "urn:oasis:names:tc:SAML:2.0:bindings:HTTP-Redirect" => Ok(ProtocolBinding::Redirect),
            _ => Err(()),
        }
    }
}

#[derive(Default)]
pub struct AuthnRequestBuilder {
    id: Option<String>,
    issue_instant: Option<OffsetDateTime>,
    issuer: Option<String>,
    destination: Option<String>,
    protocol_binding: ProtocolBinding,
    consumer_url: Option<String>,
    name_format: Option<String>,
    deny_create: bool,
    force_authn: bool,
    is_passive: bool,
    subject: Option<String>,
}

impl AuthnRequestBuilder {
    pub fn new() -> Self {
        Self {
            protocol_binding: ProtocolBinding::Post,
            ..Self::default()
        }
    }

    pub fn id(self, id: &str) -> Self {
        AuthnRequestBuilder {
            id: Some(id.into()),
            ..self
        }
    }

    pub fn auto_id(self) -> Self {
        AuthnRequestBuilder {
            id: Some(random_id()),
            ..self
        }
    }

    pub fn issue_instant(self, instant: OffsetDateTime) -> Self {
        AuthnRequestBuilder {
            issue_instant: Some(instant),
            ..self
        }
    }

    pub fn issuer(self, issuer: &str) -> Self {
        AuthnRequestBuilder {
            issuer: Some(issuer.into()),
            ..self
        }
    }

    pub fn destination(self, destination: &str) -> Self {
        AuthnRequestBuilder {
            destination: Some(destination.into()),
            ..self
        }
    }

    /// Binding the IdP should use to deliver the response.
    pub fn protocol_binding(self, binding: ProtocolBinding) -> Self {
        AuthnRequestBuilder {
            protocol_binding: binding,
            ..self
        }
    }

    pub fn consumer_url(self, url: &str) -> Self {
        AuthnRequestBuilder {
            consumer_url: Some(url.into()),
            ..self
        }
    }

    pub fn name_format(self, format: &str) -> Self {
        AuthnRequestBuilder {
            name_format: Some(format.into()),
            ..self
        }
    }

    pub fn allow_create(self, allow: bool) -> Self {
        AuthnRequestBuilder {
            deny_create: !allow,
            ..self
        }
    }

    pub fn force_authn(self, force_authn: bool) -> Self {
        AuthnRequestBuilder {
            force_authn,
            ..self
        }
    }

    pub fn is_passive(self, is_passive: bool) -> Self {
        AuthnRequestBuilder {
            is_passive,
            ..self
        }
    }

    pub fn subject(self, subject: &str) -> Self {
        AuthnRequestBuilder {
            subject: Some(subject.into()),
            ..self
        }
    }

    pub fn build(self) -> Result<String, Error> {
        let required =
            |value: Option<String>, name| value.ok_or(ConfigurationError::MissingField(name));
        let name_format = required(self.name_format, "name_id_format")?;
        let issue_instant = self
            .issue_instant
            .ok_or(ConfigurationError::MissingField("issue_instant"))?;

        let req = AuthnRequest {
            id: required(self.id, "id")?,
            version: "2.0".to_string(),
            issue_instant: format_instant(issue_instant).map_err(Error::Xml)?,
            destination: required(self.destination, "destination")?,
            force_authn: self.force_authn.then_some(true),
            is_passive: self.is_passive.then_some(true),
            protocol_binding: self.protocol_binding.to_string(),
            assertion_consumer_service_url: required(
                self.consumer_url,
                "assertion_consumer_service_url",
            )?,
            issuer: Issuer {
                format: NAME_ID_FORMAT_ENTITY.to_string(),
                content: required(self.issuer, "entity_id")?,
            },
            subject: self.subject.map(|subject| Subject {
                name_id: NameId {
                    format: name_format.clone(),
                    content: subject,
                },
            }),
            name_id_policy: NameIdPolicy {
                format: name_format,
                allow_create: !self.deny_create,
            },
        };
        yaserde::ser::to_string(&req).map_err(Error::Xml)
    }
}

/// Per-challenge overrides of the configured defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthnRequestOptions {
    pub force_authn: Option<bool>,
    pub is_passive: Option<bool>,
    /// Opaque value echoed back by the IdP.
    pub relay_state: Option<String>,
    /// Where to send the user after sign-in; kept locally, never sent.
    pub return_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AuthnRequestOutput {
    pub id: String,
    /// The request as sent; carries the enveloped signature for POST.
    pub xml: String,
    pub message: OutboundMessage,
}

/// Builds, signs and encodes an AuthnRequest for the IdP's preferred SSO
/// endpoint, and records it as pending.
pub fn build_authn_request(
    config: &ServiceProviderConfig,
    trust: &TrustDescriptor,
    signer: Option<&XmlSigner>,
    pending: &PendingRequestStore,
    clock: &dyn Clock,
    options: &AuthnRequestOptions,
) -> Result<AuthnRequestOutput, Error> {
    let endpoint = trust
        .sso_endpoint(config.authn_request_binding)
        .ok_or(MetadataError::NoUsableEndpoint)?;
    if config.require_message_signed && signer.is_none() {
        return Err(ConfigurationError::MissingField("signing_key").into());
    }
    let signer = signer.filter(|_| config.require_message_signed);
    if trust.want_authn_requests_signed && signer.is_none() {
        tracing::warn!(
            entity_id = %trust.entity_id,
            "identity provider wants signed requests but signing is disabled"
        );
    }

    let now = clock.now();
    let id = random_id();
    let xml = AuthnRequestBuilder::new()
        .id(&id)
        .issue_instant(now)
        .issuer(&config.entity_id)
        .destination(&endpoint.location)
        .consumer_url(&config.assertion_consumer_service_url)
        .name_format(&config.name_id_format)
        .force_authn(options.force_authn.unwrap_or(config.force_authn))
        .is_passive(options.is_passive.unwrap_or(config.is_passive))
        .build()?;

    let relay_state = options.relay_state.as_deref();
    let (xml, message) = match endpoint.binding {
        ProtocolBinding::Redirect => {
            let location =
                redirect_location(&endpoint.location, SAML_REQUEST, &xml, relay_state, signer)?;
            (xml, OutboundMessage::Redirect { location })
        }
        ProtocolBinding::Post => {
            let xml = match signer {
                Some(signer) => signer.sign(&xml, &id)?,
                None => xml,
            };
            let form = PostForm::new(&endpoint.location, SAML_REQUEST, &xml, relay_state);
            (xml, OutboundMessage::Post(form))
        }
    };

    pending.insert(PendingRequestRecord {
        id: id.clone(),
        kind: PendingRequestKind::Authn,
        created_at: now,
        expires_at: now.saturating_add(config.request_lifetime()),
        return_url: options.return_url.clone(),
        relay_state: options.relay_state.clone(),
    });
    tracing::debug!(
        request_id = %id,
        destination = %endpoint.location,
        binding = %endpoint.binding,
        signed = signer.is_some(),
        "issued authentication request"
    );

    Ok(AuthnRequestOutput { id, xml, message })
}
