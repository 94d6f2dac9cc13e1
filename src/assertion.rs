//! The parts of a `saml:Assertion` this SP consumes.

use std::collections::BTreeMap;

use libxml::tree::Node;
use time::{Duration, OffsetDateTime};

use crate::{
    error::ValidationError,
    utils::{child_elements, optional_child, parse_instant, single_child, text},
    NS_ASSERTION, SUBJECT_CONFIRMATION_BEARER,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameId {
    pub value: String,
    pub format: Option<String>,
    pub name_qualifier: Option<String>,
    pub sp_name_qualifier: Option<String>,
}

impl NameId {
    pub(crate) fn from_node(node: &Node) -> Self {
        Self {
            value: text(node),
            format: node.get_attribute("Format"),
            name_qualifier: node.get_attribute("NameQualifier"),
            sp_name_qualifier: node.get_attribute("SPNameQualifier"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubjectConfirmation {
    pub method: String,
    pub not_before: Option<OffsetDateTime>,
    pub not_on_or_after: Option<OffsetDateTime>,
    pub recipient: Option<String>,
    pub in_response_to: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Subject {
    pub name_id: Option<NameId>,
    pub confirmations: Vec<SubjectConfirmation>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Conditions {
    pub not_before: Option<OffsetDateTime>,
    pub not_on_or_after: Option<OffsetDateTime>,
    /// One entry per `AudienceRestriction`; each must name this SP.
    pub audience_restrictions: Vec<Vec<String>>,
    pub one_time_use: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthnStatement {
    pub authn_instant: OffsetDateTime,
    pub session_index: Option<String>,
    pub session_not_on_or_after: Option<OffsetDateTime>,
    pub authn_context_class_ref: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assertion {
    pub id: String,
    pub issue_instant: OffsetDateTime,
    pub issuer: String,
    pub subject: Subject,
    pub conditions: Option<Conditions>,
    pub authn_statements: Vec<AuthnStatement>,
    /// Attribute name to values, merged across attribute statements.
    pub attributes: BTreeMap<String, Vec<String>>,
}

fn optional_instant(node: &Node, attribute: &str) -> Result<Option<OffsetDateTime>, String> {
    node.get_attribute(attribute)
        .map(|value| parse_instant(&value))
        .transpose()
}

impl Assertion {
    pub(crate) fn from_node(node: &Node) -> Result<Self, String> {
        if node.get_attribute("Version").as_deref() != Some("2.0") {
            return Err("assertion is not SAML 2.0".into());
        }
        let id = node
            .get_attribute("ID")
            .filter(|id| !id.is_empty())
            .ok_or("assertion without ID")?;
        let issue_instant = parse_instant(
            &node
                .get_attribute("IssueInstant")
                .ok_or("assertion without IssueInstant")?,
        )?;
        let issuer = text(&single_child(node, NS_ASSERTION, "Issuer")?);

        let subject = match optional_child(node, NS_ASSERTION, "Subject")? {
            Some(subject) => parse_subject(&subject)?,
            None => Subject::default(),
        };
        let conditions = optional_child(node, NS_ASSERTION, "Conditions")?
            .map(|c| parse_conditions(&c))
            .transpose()?;

        let mut authn_statements = Vec::new();
        for statement in child_elements(node, NS_ASSERTION, "AuthnStatement") {
            let authn_instant = parse_instant(
                &statement
                    .get_attribute("AuthnInstant")
                    .ok_or("AuthnStatement without AuthnInstant")?,
            )?;
            let class_ref = optional_child(&statement, NS_ASSERTION, "AuthnContext")?
                .map(|context| optional_child(&context, NS_ASSERTION, "AuthnContextClassRef"))
                .transpose()?
                .flatten()
                .map(|node| text(&node));
            authn_statements.push(AuthnStatement {
                authn_instant,
                session_index: statement.get_attribute("SessionIndex"),
                session_not_on_or_after: optional_instant(&statement, "SessionNotOnOrAfter")?,
                authn_context_class_ref: class_ref,
            });
        }

        let mut attributes: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for statement in child_elements(node, NS_ASSERTION, "AttributeStatement") {
            for attribute in child_elements(&statement, NS_ASSERTION, "Attribute") {
                let name = attribute
                    .get_attribute("Name")
                    .ok_or("Attribute without Name")?;
                let values = attributes.entry(name).or_default();
                values.extend(
                    child_elements(&attribute, NS_ASSERTION, "AttributeValue")
                        .iter()
                        .map(text),
                );
            }
        }

        Ok(Self {
            id,
            issue_instant,
            issuer,
            subject,
            conditions,
            authn_statements,
            attributes,
        })
    }

    /// Temporal, audience and bearer confirmation checks at `now`.
    pub(crate) fn check_conditions(
        &self,
        now: OffsetDateTime,
        skew: Duration,
        audience: &str,
        recipients: &[&str],
    ) -> Result<(), ValidationError> {
        let failed = |reason: &str| Err(ValidationError::ConditionsNotMet(reason.into()));

        let Some(conditions) = &self.conditions else {
            return failed("assertion has no Conditions");
        };
        if conditions.not_before.is_some_and(|nb| now + skew < nb) {
            return failed("assertion is not yet valid");
        }
        if conditions.not_on_or_after.is_some_and(|noa| now - skew >= noa) {
            return failed("assertion has expired");
        }
        if conditions.audience_restrictions.is_empty() {
            return failed("assertion has no AudienceRestriction");
        }
        if !conditions
            .audience_restrictions
            .iter()
            .all(|audiences| audiences.iter().any(|a| a == audience))
        {
            return failed("audience restriction excludes this service provider");
        }

        let bearer_ok = self
            .subject
            .confirmations
            .iter()
            .filter(|c| c.method == SUBJECT_CONFIRMATION_BEARER)
            .any(|c| {
                c.not_on_or_after.is_some_and(|noa| now - skew < noa)
                    && c.not_before.map_or(true, |nb| now + skew >= nb)
                    && c.recipient
                        .as_deref()
                        .map_or(true, |r| recipients.contains(&r))
            });
        if !bearer_ok {
            return failed("no usable bearer subject confirmation");
        }
        Ok(())
    }

    /// `InResponseTo` carried by the bearer confirmation, if any.
    pub fn in_response_to(&self) -> Option<&str> {
        self.subject
            .confirmations
            .iter()
            .filter(|c| c.method == SUBJECT_CONFIRMATION_BEARER)
            .find_map(|c| c.in_response_to.as_deref())
    }

    /// How long the assertion id has to be remembered to stop replays.
    pub(crate) fn replay_expiry(&self, skew: Duration) -> Option<OffsetDateTime> {
        let conditions = self.conditions.as_ref().and_then(|c| c.not_on_or_after);
        let bearer = self
            .subject
            .confirmations
            .iter()
            .filter_map(|c| c.not_on_or_after)
            .max();
        [conditions, bearer]
            .into_iter()
            .flatten()
            .max()
            .map(|t| t.saturating_add(skew))
    }
}

fn parse_subject(node: &Node) -> Result<Subject, String> {
    let name_id = optional_child(node, NS_ASSERTION, "NameID")?.map(|n| NameId::from_node(&n));
    let mut confirmations = Vec::new();
    for confirmation in child_elements(node, NS_ASSERTION, "SubjectConfirmation") {
        let method = confirmation
            .get_attribute("Method")
            .ok_or("SubjectConfirmation without Method")?;
        let data = optional_child(&confirmation, NS_ASSERTION, "SubjectConfirmationData")?;
        let (not_before, not_on_or_after, recipient, in_response_to) = match &data {
            Some(data) => (
                optional_instant(data, "NotBefore")?,
                optional_instant(data, "NotOnOrAfter")?,
                data.get_attribute("Recipient"),
                data.get_attribute("InResponseTo"),
            ),
            None => (None, None, None, None),
        };
        confirmations.push(SubjectConfirmation {
            method,
            not_before,
            not_on_or_after,
            recipient,
            in_response_to,
        });
    }
    Ok(Subject {
        name_id,
        confirmations,
    })
}

fn parse_conditions(node: &Node) -> Result<Conditions, String> {
    Ok(Conditions {
        not_before: optional_instant(node, "NotBefore")?,
        not_on_or_after: optional_instant(node, "NotOnOrAfter")?,
        audience_restrictions: child_elements(node, NS_ASSERTION, "AudienceRestriction")
            .iter()
            .map(|restriction| {
                child_elements(restriction, NS_ASSERTION, "Audience")
                    .iter()
                    .map(text)
                    .collect()
            })
            .collect(),
        one_time_use: !child_elements(node, NS_ASSERTION, "OneTimeUse").is_empty(),
    })
}

/// Normalised outcome of an accepted assertion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimSet {
    pub issuer: String,
    pub subject: NameId,
    pub assertion_id: String,
    pub session_index: Option<String>,
    pub authn_instant: Option<OffsetDateTime>,
    pub authn_context_class_ref: Option<String>,
    pub session_not_on_or_after: Option<OffsetDateTime>,
    pub attributes: BTreeMap<String, Vec<String>>,
}

impl ClaimSet {
    pub(crate) fn from_assertion(assertion: &Assertion) -> Result<Self, ValidationError> {
        let subject = assertion
            .subject
            .name_id
            .clone()
            .filter(|name_id| !name_id.value.is_empty())
            .ok_or_else(|| ValidationError::MalformedResponse("assertion has no NameID".into()))?;
        let statement = assertion.authn_statements.first();
        Ok(Self {
            issuer: assertion.issuer.clone(),
            subject,
            assertion_id: assertion.id.clone(),
            session_index: statement.and_then(|s| s.session_index.clone()),
            authn_instant: statement.map(|s| s.authn_instant),
            authn_context_class_ref: statement.and_then(|s| s.authn_context_class_ref.clone()),
            session_not_on_or_after: statement.and_then(|s| s.session_not_on_or_after),
            attributes: assertion.attributes.clone(),
        })
    }
}
