//! Single Logout messages.

use libxml::tree::Node;
use time::OffsetDateTime;
use yaserde::YaSerialize;

use crate::{
    assertion::NameId,
    error::{ConfigurationError, Error},
    response::Status,
    utils::{child_elements, format_instant, optional_child, parse_instant, random_id, text},
    NAME_ID_FORMAT_ENTITY, NS_ASSERTION, NS_PROTOCOL, STATUS_SUCCESS,
};

#[derive(YaSerialize)]
#[yaserde(
  rename = "LogoutRequest",
  namespaces = {
    "samlp" = "urn:oasis:names:tc:SAML:2.0:protocol",
    "saml" = "urn:oasis:names:tc:SAML:2.0:assertion",
  },
  prefix = "samlp"
)]
struct LogoutRequestElement {
    #[yaserde(attribute = true, rename = "ID")]
    id: String,
    #[yaserde(attribute = true, rename = "Version")]
    version: String,
    #[yaserde(attribute = true, rename = "IssueInstant")]
    issue_instant: String,
    #[yaserde(attribute = true, rename = "Destination")]
    destination: String,
    #[yaserde(attribute = true, rename = "NotOnOrAfter")]
    not_on_or_after: Option<String>,
    #[yaserde(rename = "Issuer", prefix = "saml")]
    issuer: Issuer,
    #[yaserde(rename = "NameID", prefix = "saml")]
    name_id: NameIdElement,
    #[yaserde(rename = "SessionIndex", prefix = "samlp")]
    session_index: Vec<String>,
}

#[derive(YaSerialize)]
#[yaserde(
  rename = "LogoutResponse",
  namespaces = {
    "samlp" = "urn:oasis:names:tc:SAML:2.0:protocol",
    "saml" = "urn:oasis:names:tc:SAML:2.0:assertion",
  },
  prefix = "samlp"
)]
struct LogoutResponseElement {
    #[yaserde(attribute = true, rename = "ID")]
    id: String,
    #[yaserde(attribute = true, rename = "Version")]
    version: String,
    #[yaserde(attribute = true, rename = "IssueInstant")]
    issue_instant: String,
    #[yaserde(attribute = true, rename = "Destination")]
    destination: String,
    #[yaserde(attribute = true, rename = "InResponseTo")]
    in_response_to: String,
    #[yaserde(rename = "Issuer", prefix = "saml")]
    issuer: Issuer,
    #[yaserde(rename = "Status", prefix = "samlp")]
    status: StatusElement,
}

#[derive(YaSerialize)]
struct Issuer {
    #[yaserde(attribute = true, rename = "Format")]
    format: String,
    #[yaserde(text = true)]
    content: String,
}

#[derive(YaSerialize)]
struct NameIdElement {
    #[yaserde(attribute = true, rename = "Format")]
    format: Option<String>,
    #[yaserde(attribute = true, rename = "NameQualifier")]
    name_qualifier: Option<String>,
    #[yaserde(attribute = true, rename = "SPNameQualifier")]
    sp_name_qualifier: Option<String>,
    #[yaserde(text = true)]
    content: String,
}

#[derive(YaSerialize)]
struct StatusElement {
    #[yaserde(rename = "StatusCode", prefix = "samlp")]
    status_code: StatusCodeElement,
}

#[derive(YaSerialize)]
struct StatusCodeElement {
    #[yaserde(attribute = true, rename = "Value")]
    value: String,
}

#[derive(Default)]
pub struct LogoutRequestBuilder {
    id: Option<String>,
    issue_instant: Option<OffsetDateTime>,
    not_on_or_after: Option<OffsetDateTime>,
    issuer: Option<String>,
    destination: Option<String>,
    name_id: Option<NameId>,
    session_index: Option<String>,
}

impl LogoutRequestBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn id(self, id: &str) -> Self {
        LogoutRequestBuilder {
            id: Some(id.into()),
            ..self
        }
    }

    pub fn auto_id(self) -> Self {
        LogoutRequestBuilder {
            id: Some(random_id()),
            ..self
        }
    }

    pub fn issue_instant(self, instant: OffsetDateTime) -> Self {
        LogoutRequestBuilder {
            issue_instant: Some(instant),
            ..self
        }
    }

    pub fn not_on_or_after(self, instant: OffsetDateTime) -> Self {
        LogoutRequestBuilder {
            not_on_or_after: Some(instant),
            ..self
        }
    }

    pub fn issuer(self, issuer: &str) -> Self {
        LogoutRequestBuilder {
            issuer: Some(issuer.into()),
            ..self
        }
    }

    pub fn destination(self, destination: &str) -> Self {
        LogoutRequestBuilder {
            destination: Some(destination.into()),
            ..self
        }
    }

    /// The subject exactly as the IdP named it in the assertion.
    pub fn name_id(self, name_id: NameId) -> Self {
        LogoutRequestBuilder {
            name_id: Some(name_id),
            ..self
        }
    }

    pub fn session_index(self, session_index: &str) -> Self {
        LogoutRequestBuilder {
            session_index: Some(session_index.into()),
            ..self
        }
    }

    pub fn build(self) -> Result<String, Error> {
        let required =
            |value: Option<String>, name| value.ok_or(ConfigurationError::MissingField(name));
        let issue_instant = self
            .issue_instant
            .ok_or(ConfigurationError::MissingField("issue_instant"))?;
        let name_id = self.name_id.ok_or(ConfigurationError::MissingField("name_id"))?;

        let req = LogoutRequestElement {
            id: required(self.id, "id")?,
            version: "2.0".to_string(),
            issue_instant: format_instant(issue_instant).map_err(Error::Xml)?,
            destination: required(self.destination, "destination")?,
            not_on_or_after: self
                .not_on_or_after
                .map(format_instant)
                .transpose()
                .map_err(Error::Xml)?,
            issuer: Issuer {
                format: NAME_ID_FORMAT_ENTITY.to_string(),
                content: required(self.issuer, "entity_id")?,
            },
            name_id: NameIdElement {
                format: name_id.format,
                name_qualifier: name_id.name_qualifier,
                sp_name_qualifier: name_id.sp_name_qualifier,
                content: name_id.value,
            },
            session_index: self.session_index.into_iter().collect(),
        };
        yaserde::ser::to_string(&req).map_err(Error::Xml)
    }
}

#[derive(Default)]
pub struct LogoutResponseBuilder {
    id: Option<String>,
    issue_instant: Option<OffsetDateTime>,
    issuer: Option<String>,
    destination: Option<String>,
    in_response_to: Option<String>,
    status: Option<String>,
}

impl LogoutResponseBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn id(self, id: &str) -> Self {
        LogoutResponseBuilder {
            id: Some(id.into()),
            ..self
        }
    }

    pub fn auto_id(self) -> Self {
        LogoutResponseBuilder {
            id: Some(random_id()),
            ..self
        }
    }

    pub fn issue_instant(self, instant: OffsetDateTime) -> Self {
        LogoutResponseBuilder {
            issue_instant: Some(instant),
            ..self
        }
    }

    pub fn issuer(self, issuer: &str) -> Self {
        LogoutResponseBuilder {
            issuer: Some(issuer.into()),
            ..self
        }
    }

    pub fn destination(self, destination: &str) -> Self {
        LogoutResponseBuilder {
            destination: Some(destination.into()),
            ..self
        }
    }

    pub fn in_response_to(self, request_id: &str) -> Self {
        LogoutResponseBuilder {
            in_response_to: Some(request_id.into()),
            ..self
        }
    }

    /// Top-level status code; defaults to Success.
    pub fn status(self, status: &str) -> Self {
        LogoutResponseBuilder {
            status: Some(status.into()),
            ..self
        }
    }

    pub fn build(self) -> Result<String, Error> {
        let required =
            |value: Option<String>, name| value.ok_or(ConfigurationError::MissingField(name));
        let issue_instant = self
            .issue_instant
            .ok_or(ConfigurationError::MissingField("issue_instant"))?;

        let res = LogoutResponseElement {
            id: required(self.id, "id")?,
            version: "2.0".to_string(),
            issue_instant: format_instant(issue_instant).map_err(Error::Xml)?,
            destination: required(self.destination, "destination")?,
            in_response_to: required(self.in_response_to, "in_response_to")?,
            issuer: Issuer {
                format: NAME_ID_FORMAT_ENTITY.to_string(),
                content: required(self.issuer, "entity_id")?,
            },
            status: StatusElement {
                status_code: StatusCodeElement {
                    value: self.status.unwrap_or_else(|| STATUS_SUCCESS.to_string()),
                },
            },
        };
        yaserde::ser::to_string(&res).map_err(Error::Xml)
    }
}

/// An inbound `samlp:LogoutRequest`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogoutRequest {
    pub id: String,
    pub issue_instant: OffsetDateTime,
    pub issuer: Option<String>,
    pub destination: Option<String>,
    pub not_on_or_after: Option<OffsetDateTime>,
    pub name_id: NameId,
    pub session_indexes: Vec<String>,
}

impl LogoutRequest {
    pub(crate) fn from_node(node: &Node) -> Result<Self, String> {
        let (id, issue_instant) = message_header(node)?;
        let name_id = optional_child(node, NS_ASSERTION, "NameID")?
            .map(|n| NameId::from_node(&n))
            .filter(|name_id| !name_id.value.is_empty())
            .ok_or("LogoutRequest without NameID")?;
        Ok(Self {
            id,
            issue_instant,
            issuer: issuer(node)?,
            destination: node.get_attribute("Destination"),
            not_on_or_after: node
                .get_attribute("NotOnOrAfter")
                .map(|v| parse_instant(&v))
                .transpose()?,
            name_id,
            session_indexes: child_elements(node, NS_PROTOCOL, "SessionIndex")
                .iter()
                .map(text)
                .collect(),
        })
    }
}

/// An inbound `samlp:LogoutResponse`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogoutResponse {
    pub id: String,
    pub issue_instant: OffsetDateTime,
    pub issuer: Option<String>,
    pub destination: Option<String>,
    pub in_response_to: Option<String>,
    pub status_code: String,
    pub sub_status_code: Option<String>,
    pub status_message: Option<String>,
}

impl LogoutResponse {
    pub(crate) fn from_node(node: &Node) -> Result<Self, String> {
        let (id, issue_instant) = message_header(node)?;
        let status = Status::from_parent(node)?;
        Ok(Self {
            id,
            issue_instant,
            issuer: issuer(node)?,
            destination: node.get_attribute("Destination"),
            in_response_to: node.get_attribute("InResponseTo").filter(|v| !v.is_empty()),
            status_code: status.code,
            sub_status_code: status.sub_code,
            status_message: status.message,
        })
    }

    pub fn is_success(&self) -> bool {
        self.status_code == STATUS_SUCCESS
    }
}

fn message_header(node: &Node) -> Result<(String, OffsetDateTime), String> {
    if node.get_attribute("Version").as_deref() != Some("2.0") {
        return Err("unsupported protocol version".into());
    }
    let id = node
        .get_attribute("ID")
        .filter(|id| !id.is_empty())
        .ok_or("message has no ID")?;
    let issue_instant = node
        .get_attribute("IssueInstant")
        .ok_or("missing IssueInstant")?;
    let issue_instant = parse_instant(&issue_instant)?;
    Ok((id, issue_instant))
}

fn issuer(node: &Node) -> Result<Option<String>, String> {
    Ok(optional_child(node, NS_ASSERTION, "Issuer")?.map(|n| text(&n)))
}
