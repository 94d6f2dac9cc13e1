//! Validation of `samlp:Response` messages posted to the ACS endpoint.
//!
//! A response moves through the stages of [`ValidationStage`] in order and is
//! rejected at the first stage that fails. Nothing is consumed from the
//! pending-request store or the replay cache until every check before the
//! correlation stage has passed.

use std::{fmt, sync::Arc, time::Instant};

use libxml::tree::Node;

use crate::{
    assertion::{Assertion, ClaimSet},
    certificate::CertificateProvider,
    clock::Clock,
    config::ServiceProviderConfig,
    error::ValidationError,
    idp_metadata::TrustDescriptor,
    signature::{all_signatures, ensure_unique_ids, register_ids, verify_enveloped},
    store::{PendingRequestKind, PendingRequestRecord, PendingRequestStore, ReplayCache},
    utils::{
        child_elements, decode_xml_base64, is_element, optional_child, parse_document, redact, text,
    },
    NS_ASSERTION, NS_PROTOCOL, STATUS_SUCCESS,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValidationStage {
    Received,
    StructurallyParsed,
    SignatureVerified,
    StatusChecked,
    ConditionsChecked,
    CorrelationChecked,
    ReplayChecked,
    Accepted,
}

impl fmt::Display for ValidationStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValidationStage::Received => "received",
            ValidationStage::StructurallyParsed => "structurally_parsed",
            ValidationStage::SignatureVerified => "signature_verified",
            ValidationStage::StatusChecked => "status_checked",
            ValidationStage::ConditionsChecked => "conditions_checked",
            ValidationStage::CorrelationChecked => "correlation_checked",
            ValidationStage::ReplayChecked => "replay_checked",
            ValidationStage::Accepted => "accepted",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ValidationOptions {
    /// Checked before every stage; past it the response is rejected with
    /// [`ValidationError::Timeout`].
    pub deadline: Option<Instant>,
}

impl ValidationOptions {
    pub fn with_timeout(timeout: std::time::Duration) -> Self {
        Self {
            deadline: Some(Instant::now() + timeout),
        }
    }
}

/// An accepted response.
#[derive(Debug, Clone)]
pub struct ValidatedResponse {
    pub response_id: String,
    pub in_response_to: Option<String>,
    pub assertion: Assertion,
    pub claims: ClaimSet,
    /// The request this response answers; `None` for IdP-initiated logins.
    pub request: Option<PendingRequestRecord>,
}

/// Top-level status of a protocol response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Status {
    pub code: String,
    pub sub_code: Option<String>,
    pub message: Option<String>,
}

impl Status {
    pub(crate) fn from_parent(node: &Node) -> Result<Self, String> {
        let status = optional_child(node, NS_PROTOCOL, "Status")?.ok_or("missing Status")?;
        let code = optional_child(&status, NS_PROTOCOL, "StatusCode")?.ok_or("missing StatusCode")?;
        let value = code
            .get_attribute("Value")
            .filter(|v| !v.is_empty())
            .ok_or("StatusCode without Value")?;
        let sub_code = optional_child(&code, NS_PROTOCOL, "StatusCode")?
            .and_then(|sub| sub.get_attribute("Value"));
        let message = optional_child(&status, NS_PROTOCOL, "StatusMessage")?.map(|m| text(&m));
        Ok(Self {
            code: value,
            sub_code,
            message,
        })
    }

    pub(crate) fn is_success(&self) -> bool {
        self.code == STATUS_SUCCESS
    }

    pub(crate) fn into_error(self) -> ValidationError {
        ValidationError::IdpReportedFailure {
            status_code: self.code,
            sub_code: self.sub_code,
            message: self.message,
        }
    }
}

pub struct ResponseValidator {
    config: Arc<ServiceProviderConfig>,
    certificates: Arc<dyn CertificateProvider>,
    pending: Arc<PendingRequestStore>,
    replay: Arc<ReplayCache>,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for ResponseValidator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseValidator")
            .field("entity_id", &self.config.entity_id)
            .finish_non_exhaustive()
    }
}

impl ResponseValidator {
    pub fn new(
        config: Arc<ServiceProviderConfig>,
        certificates: Arc<dyn CertificateProvider>,
        pending: Arc<PendingRequestStore>,
        replay: Arc<ReplayCache>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            certificates,
            pending,
            replay,
            clock,
        }
    }

    /// Validates the base64 `SAMLResponse` form field of an HTTP-POST.
    pub fn validate_post(
        &self,
        saml_response: &str,
        trust: Option<&TrustDescriptor>,
        options: ValidationOptions,
    ) -> Result<ValidatedResponse, ValidationError> {
        let xml = decode_xml_base64(saml_response).map_err(|e| {
            let err = ValidationError::MalformedResponse(format!("invalid base64: {e}"));
            tracing::warn!(
                stage = %ValidationStage::Received,
                reason = %err,
                "rejected SAML response"
            );
            err
        })?;
        self.validate(&xml, trust, options)
    }

    /// Validates a decoded response document.
    pub fn validate(
        &self,
        xml: &[u8],
        trust: Option<&TrustDescriptor>,
        options: ValidationOptions,
    ) -> Result<ValidatedResponse, ValidationError> {
        let mut stage = ValidationStage::Received;
        match self.run(xml, trust, options, &mut stage) {
            Ok(validated) => {
                tracing::info!(
                    response_id = %validated.response_id,
                    subject = %redact(&validated.claims.subject.value, self.config.show_pii),
                    "accepted SAML response"
                );
                Ok(validated)
            }
            Err(err) => {
                tracing::warn!(%stage, reason = %err, "rejected SAML response");
                if self.config.show_pii {
                    tracing::debug!(
                        xml = %String::from_utf8_lossy(xml),
                        "rejected response document"
                    );
                }
                Err(err)
            }
        }
    }

    // `stage` is the last stage reached, so a rejection can be attributed.
    fn run(
        &self,
        xml: &[u8],
        trust: Option<&TrustDescriptor>,
        options: ValidationOptions,
        stage: &mut ValidationStage,
    ) -> Result<ValidatedResponse, ValidationError> {
        let malformed = ValidationError::MalformedResponse;
        let trust = trust.ok_or(ValidationError::NoTrustedIdentityProvider)?;
        let now = self.clock.now();
        trust.ensure_current(now)?;
        let skew = self.config.clock_skew();

        check_deadline(&options)?;
        let document = parse_document(xml, self.config.document_limits()).map_err(malformed)?;
        let root = document
            .get_root_element()
            .ok_or_else(|| malformed("empty document".into()))?;
        if !is_element(&root, NS_PROTOCOL, "Response") {
            return Err(malformed("root element is not samlp:Response".into()));
        }
        if root.get_attribute("Version").as_deref() != Some("2.0") {
            return Err(malformed("unsupported protocol version".into()));
        }
        let response_id = root
            .get_attribute("ID")
            .filter(|id| !id.is_empty())
            .ok_or_else(|| malformed("Response has no ID".into()))?;
        if !child_elements(&root, NS_ASSERTION, "EncryptedAssertion").is_empty() {
            return Err(malformed("encrypted assertions are not supported".into()));
        }
        let mut assertion_nodes = child_elements(&root, NS_ASSERTION, "Assertion");
        if assertion_nodes.len() > 1 {
            return Err(malformed("more than one Assertion".into()));
        }
        let assertion_node = assertion_nodes.pop();
        let status = Status::from_parent(&root).map_err(malformed)?;
        let response_issuer = optional_child(&root, NS_ASSERTION, "Issuer")
            .map_err(malformed)?
            .map(|issuer| text(&issuer));
        let assertion = assertion_node
            .as_ref()
            .map(Assertion::from_node)
            .transpose()
            .map_err(malformed)?;
        register_ids(&document).map_err(malformed)?;
        *stage = ValidationStage::StructurallyParsed;

        check_deadline(&options)?;
        self.verify_signatures(&root, assertion_node.as_ref(), trust)?;
        *stage = ValidationStage::SignatureVerified;

        check_deadline(&options)?;
        if !status.is_success() {
            return Err(status.into_error());
        }
        let assertion =
            assertion.ok_or_else(|| malformed("successful response without an Assertion".into()))?;
        *stage = ValidationStage::StatusChecked;

        check_deadline(&options)?;
        let claims = ClaimSet::from_assertion(&assertion)?;
        let acs_urls = self.config.acs_urls();
        assertion.check_conditions(now, skew, &self.config.entity_id, &acs_urls)?;
        *stage = ValidationStage::ConditionsChecked;

        check_deadline(&options)?;
        if response_issuer.is_some_and(|issuer| issuer != trust.entity_id)
            || assertion.issuer != trust.entity_id
        {
            return Err(ValidationError::IssuerMismatch);
        }
        let destination = root.get_attribute("Destination").unwrap_or_default();
        if !acs_urls.contains(&destination.as_str()) {
            return Err(ValidationError::DestinationMismatch {
                expected: self.config.assertion_consumer_service_url.clone(),
                actual: destination,
            });
        }
        let in_response_to = root.get_attribute("InResponseTo").filter(|v| !v.is_empty());
        if let (Some(outer), Some(inner)) =
            (in_response_to.as_deref(), assertion.in_response_to())
        {
            if outer != inner {
                return Err(ValidationError::UnsolicitedResponse);
            }
        }
        let request = match in_response_to.as_deref().or(assertion.in_response_to()) {
            Some(request_id) => {
                match self.pending.consume(request_id, PendingRequestKind::Authn, now) {
                    Some(record) => Some(record),
                    // The request was answered before; this is the same assertion again.
                    None if self.replay.contains(&assertion.id, now) => {
                        return Err(ValidationError::ReplayedAssertion)
                    }
                    None => return Err(ValidationError::UnsolicitedResponse),
                }
            }
            None if self.config.allow_idp_initiated => None,
            None => return Err(ValidationError::UnsolicitedResponse),
        };
        *stage = ValidationStage::CorrelationChecked;

        check_deadline(&options)?;
        let expires_at = assertion
            .replay_expiry(skew)
            .unwrap_or_else(|| now.saturating_add(skew));
        if !self.replay.check_and_insert(&assertion.id, expires_at, now) {
            return Err(ValidationError::ReplayedAssertion);
        }
        *stage = ValidationStage::ReplayChecked;

        *stage = ValidationStage::Accepted;
        Ok(ValidatedResponse {
            response_id,
            in_response_to,
            assertion,
            claims,
            request,
        })
    }

    fn verify_signatures(
        &self,
        root: &Node,
        assertion: Option<&Node>,
        trust: &TrustDescriptor,
    ) -> Result<(), ValidationError> {
        ensure_unique_ids(root)?;

        let allowed_parents: Vec<&Node> = std::iter::once(root).chain(assertion).collect();
        for signature in all_signatures(root) {
            let parent_ok = signature
                .get_parent()
                .is_some_and(|parent| allowed_parents.iter().any(|allowed| **allowed == parent));
            if !parent_ok {
                tracing::debug!("signature outside Response and Assertion");
                return Err(ValidationError::InvalidSignature);
            }
        }

        let certificates = self
            .certificates
            .resolve_trusted_certificates(trust)
            .map_err(|e| {
                tracing::warn!(error = %e, "cannot resolve trusted certificates");
                ValidationError::InvalidSignature
            })?;
        if certificates.is_empty() {
            return Err(ValidationError::InvalidSignature);
        }

        let response_signed = verify_enveloped(root, &certificates)?;
        let assertion_signed = match assertion {
            Some(node) => verify_enveloped(node, &certificates)?,
            None => false,
        };

        if self.config.want_responses_signed && !response_signed {
            return Err(ValidationError::UnsignedResponse);
        }
        if assertion.is_some() {
            if self.config.want_assertions_signed && !assertion_signed {
                return Err(ValidationError::UnsignedResponse);
            }
            if !response_signed && !assertion_signed {
                return Err(ValidationError::UnsignedResponse);
            }
        }
        Ok(())
    }
}

fn check_deadline(options: &ValidationOptions) -> Result<(), ValidationError> {
    match options.deadline {
        Some(deadline) if Instant::now() >= deadline => Err(ValidationError::Timeout),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use time::{macros::datetime, Duration, OffsetDateTime};

    use super::*;
    use crate::{
        certificate::{Certificate, ConfiguredCertificateProvider, SigningCredential},
        clock::FixedClock,
        signature::{SignatureAlgorithm, XmlSigner},
        utils::format_instant,
        STATUS_AUTHN_FAILED, STATUS_RESPONDER,
    };

    const IDP_KEY: &[u8] = include_bytes!("../static/idp.key");
    const IDP_CERT: &[u8] = include_bytes!("../static/idp.cert");
    const ROLLOVER_KEY: &[u8] = include_bytes!("../static/idp_rollover.key");
    const ROLLOVER_CERT: &[u8] = include_bytes!("../static/idp_rollover.cert");
    const SP_KEY: &[u8] = include_bytes!("../static/sp.key");
    const SP_CERT: &[u8] = include_bytes!("../static/sp.cert");

    const IDP: &str = "https://idp.example.org/metadata";
    const SP: &str = "https://sp.example.org";
    const ACS: &str = "https://sp.example.org/saml2/acs";
    const NOW: OffsetDateTime = datetime!(2025-01-08 16:31:18 UTC);

    struct Fixture {
        in_response_to: Option<&'static str>,
        destination: &'static str,
        status: &'static str,
        sub_status: Option<&'static str>,
        assertion_id: &'static str,
        name_id: &'static str,
        audience: &'static str,
        not_before: OffsetDateTime,
        not_on_or_after: OffsetDateTime,
        with_assertion: bool,
    }

    impl Default for Fixture {
        fn default() -> Self {
            Self {
                in_response_to: Some("_req"),
                destination: ACS,
                status: STATUS_SUCCESS,
                sub_status: None,
                assertion_id: "_assert",
                name_id: "alice@example.org",
                audience: SP,
                not_before: NOW - Duration::minutes(1),
                not_on_or_after: NOW + Duration::minutes(5),
                with_assertion: true,
            }
        }
    }

    fn instant(t: OffsetDateTime) -> String {
        format_instant(t).unwrap()
    }

    impl Fixture {
        fn assertion_xml(&self) -> String {
            let in_response_to = self
                .in_response_to
                .map(|id| format!(r#" InResponseTo="{id}""#))
                .unwrap_or_default();
            format!(
                concat!(
                    r#"<saml:Assertion ID="{id}" Version="2.0" IssueInstant="{now}">"#,
                    r#"<saml:Issuer>{idp}</saml:Issuer>"#,
                    r#"<saml:Subject><saml:NameID Format="urn:oasis:names:tc:SAML:1.1:nameid-format:emailAddress">{name}</saml:NameID>"#,
                    r#"<saml:SubjectConfirmation Method="urn:oasis:names:tc:SAML:2.0:cm:bearer">"#,
                    r#"<saml:SubjectConfirmationData{irt} NotOnOrAfter="{noa}" Recipient="{acs}"/>"#,
                    r#"</saml:SubjectConfirmation></saml:Subject>"#,
                    r#"<saml:Conditions NotBefore="{nb}" NotOnOrAfter="{noa}">"#,
                    r#"<saml:AudienceRestriction><saml:Audience>{aud}</saml:Audience></saml:AudienceRestriction>"#,
                    r#"</saml:Conditions>"#,
                    r#"<saml:AuthnStatement AuthnInstant="{now}" SessionIndex="_session">"#,
                    r#"<saml:AuthnContext><saml:AuthnContextClassRef>urn:oasis:names:tc:SAML:2.0:ac:classes:PasswordProtectedTransport</saml:AuthnContextClassRef></saml:AuthnContext>"#,
                    r#"</saml:AuthnStatement>"#,
                    r#"<saml:AttributeStatement><saml:Attribute Name="role"><saml:AttributeValue>admin</saml:AttributeValue></saml:Attribute></saml:AttributeStatement>"#,
                    r#"</saml:Assertion>"#,
                ),
                id = self.assertion_id,
                now = instant(NOW),
                idp = IDP,
                name = self.name_id,
                irt = in_response_to,
                noa = instant(self.not_on_or_after),
                acs = ACS,
                nb = instant(self.not_before),
                aud = self.audience,
            )
        }

        fn response_xml(&self) -> String {
            let in_response_to = self
                .in_response_to
                .map(|id| format!(r#" InResponseTo="{id}""#))
                .unwrap_or_default();
            let sub_status = self
                .sub_status
                .map(|code| format!(r#"<samlp:StatusCode Value="{code}"/>"#))
                .unwrap_or_default();
            let assertion = if self.with_assertion {
                self.assertion_xml()
            } else {
                String::new()
            };
            format!(
                concat!(
                    r#"<samlp:Response xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol" "#,
                    r#"xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion" ID="_response" Version="2.0" "#,
                    r#"IssueInstant="{now}" Destination="{dest}"{irt}>"#,
                    r#"<saml:Issuer>{idp}</saml:Issuer>"#,
                    r#"<samlp:Status><samlp:StatusCode Value="{status}">{sub}</samlp:StatusCode></samlp:Status>"#,
                    r#"{assertion}</samlp:Response>"#,
                ),
                now = instant(NOW),
                dest = self.destination,
                irt = in_response_to,
                idp = IDP,
                status = self.status,
                sub = sub_status,
                assertion = assertion,
            )
        }
    }

    fn signer(key: &[u8], cert: &[u8]) -> XmlSigner {
        XmlSigner::new(
            SigningCredential::from_pem(key, cert).unwrap(),
            SignatureAlgorithm::RsaSha256,
        )
    }

    fn sign_assertion(xml: &str) -> String {
        signer(IDP_KEY, IDP_CERT).sign(xml, "_assert").unwrap()
    }

    struct Harness {
        validator: ResponseValidator,
        pending: Arc<PendingRequestStore>,
        trust: TrustDescriptor,
    }

    fn harness_with(config: ServiceProviderConfig) -> Harness {
        let pending = Arc::new(PendingRequestStore::new());
        pending.insert(PendingRequestRecord {
            id: "_req".into(),
            kind: PendingRequestKind::Authn,
            created_at: NOW - Duration::minutes(1),
            expires_at: NOW + Duration::minutes(4),
            return_url: Some("/dashboard".into()),
            relay_state: None,
        });
        let validator = ResponseValidator::new(
            Arc::new(config),
            Arc::new(ConfiguredCertificateProvider::new(None, Vec::new())),
            pending.clone(),
            Arc::new(ReplayCache::new()),
            Arc::new(FixedClock::new(NOW)),
        );
        let trust = TrustDescriptor::for_tests(IDP, vec![Certificate::from_pem(IDP_CERT).unwrap()]);
        Harness {
            validator,
            pending,
            trust,
        }
    }

    fn harness() -> Harness {
        harness_with(
            ServiceProviderConfig::builder(SP, ACS, "https://sp.example.org/saml2/logout")
                .build()
                .unwrap(),
        )
    }

    impl Harness {
        fn validate(&self, xml: &str) -> Result<ValidatedResponse, ValidationError> {
            self.validator
                .validate(xml.as_bytes(), Some(&self.trust), ValidationOptions::default())
        }
    }

    #[test]
    fn accepts_signed_assertion() {
        let h = harness();
        let validated = h.validate(&sign_assertion(&Fixture::default().response_xml())).unwrap();
        assert_eq!(validated.claims.subject.value, "alice@example.org");
        assert_eq!(validated.claims.session_index.as_deref(), Some("_session"));
        assert_eq!(validated.claims.attributes["role"], vec!["admin".to_string()]);
        assert_eq!(validated.request.unwrap().return_url.as_deref(), Some("/dashboard"));
        assert!(h.pending.is_empty());
    }

    #[test]
    fn accepts_base64_post_body() {
        use base64::{prelude::BASE64_STANDARD, Engine};
        let h = harness();
        let encoded = BASE64_STANDARD.encode(sign_assertion(&Fixture::default().response_xml()));
        let validated = h
            .validator
            .validate_post(&encoded, Some(&h.trust), ValidationOptions::default())
            .unwrap();
        assert_eq!(validated.response_id, "_response");
        assert_eq!(validated.in_response_to.as_deref(), Some("_req"));
    }

    #[test]
    fn second_submission_is_a_replay() {
        let h = harness();
        let xml = sign_assertion(&Fixture::default().response_xml());
        h.validate(&xml).unwrap();
        assert_eq!(h.validate(&xml).unwrap_err(), ValidationError::ReplayedAssertion);
    }

    #[test]
    fn unknown_in_response_to_is_unsolicited() {
        let h = harness();
        let xml = sign_assertion(
            &Fixture {
                in_response_to: Some("_other"),
                ..Default::default()
            }
            .response_xml(),
        );
        assert_eq!(h.validate(&xml).unwrap_err(), ValidationError::UnsolicitedResponse);
    }

    #[test]
    fn idp_initiated_requires_opt_in() {
        let fixture = Fixture {
            in_response_to: None,
            ..Default::default()
        };
        let xml = sign_assertion(&fixture.response_xml());
        assert_eq!(
            harness().validate(&xml).unwrap_err(),
            ValidationError::UnsolicitedResponse
        );

        let h = harness_with(
            ServiceProviderConfig::builder(SP, ACS, "https://sp.example.org/saml2/logout")
                .allow_idp_initiated(true)
                .build()
                .unwrap(),
        );
        let validated = h.validate(&xml).unwrap();
        assert!(validated.request.is_none());
    }

    #[test]
    fn tampered_assertion_is_rejected() {
        let h = harness();
        let xml = sign_assertion(&Fixture::default().response_xml())
            .replace("alice@example.org", "mallory@example.org");
        assert_eq!(h.validate(&xml).unwrap_err(), ValidationError::InvalidSignature);
        assert_eq!(h.pending.len(), 1);
    }

    #[test]
    fn wrapped_assertion_is_rejected() {
        let h = harness();
        let signed = sign_assertion(&Fixture::default().response_xml());
        let start = signed.find("<saml:Assertion").unwrap();
        let end = signed.find("</saml:Assertion>").unwrap() + "</saml:Assertion>".len();
        let original = &signed[start..end];

        let evil = Fixture {
            assertion_id: "_evil",
            name_id: "mallory@example.org",
            ..Default::default()
        }
        .assertion_xml()
        .replace(
            "</saml:Assertion>",
            &format!("<saml:Advice>{original}</saml:Advice></saml:Assertion>"),
        );
        let wrapped = signed.replace(original, &evil);
        assert_eq!(h.validate(&wrapped).unwrap_err(), ValidationError::InvalidSignature);
    }

    #[test]
    fn reference_to_another_element_is_rejected() {
        let h = harness();
        let xml = sign_assertion(&Fixture::default().response_xml())
            .replace(r#"ID="_assert""#, r#"ID="_moved""#);
        assert_eq!(h.validate(&xml).unwrap_err(), ValidationError::InvalidSignature);
    }

    #[test]
    fn unsigned_assertion_is_rejected() {
        let h = harness();
        let xml = Fixture::default().response_xml();
        assert_eq!(h.validate(&xml).unwrap_err(), ValidationError::UnsignedResponse);
    }

    #[test]
    fn response_signature_required_when_configured() {
        let h = harness_with(
            ServiceProviderConfig::builder(SP, ACS, "https://sp.example.org/saml2/logout")
                .want_responses_signed(true)
                .build()
                .unwrap(),
        );
        let assertion_only = sign_assertion(&Fixture::default().response_xml());
        assert_eq!(
            h.validate(&assertion_only).unwrap_err(),
            ValidationError::UnsignedResponse
        );

        let both = signer(IDP_KEY, IDP_CERT).sign(&assertion_only, "_response").unwrap();
        h.validate(&both).unwrap();
    }

    #[test]
    fn signature_by_untrusted_key_is_rejected() {
        let h = harness();
        let xml = signer(SP_KEY, SP_CERT)
            .sign(&Fixture::default().response_xml(), "_assert")
            .unwrap();
        assert_eq!(h.validate(&xml).unwrap_err(), ValidationError::InvalidSignature);
    }

    #[test]
    fn rollover_certificate_is_accepted() {
        let mut h = harness();
        h.trust.certificates.push(Certificate::from_pem(ROLLOVER_CERT).unwrap());
        let xml = signer(ROLLOVER_KEY, ROLLOVER_CERT)
            .sign(&Fixture::default().response_xml(), "_assert")
            .unwrap();
        h.validate(&xml).unwrap();
    }

    #[test]
    fn idp_failure_status_is_reported() {
        let h = harness();
        let fixture = Fixture {
            status: STATUS_RESPONDER,
            sub_status: Some(STATUS_AUTHN_FAILED),
            with_assertion: false,
            ..Default::default()
        };
        let xml = signer(IDP_KEY, IDP_CERT)
            .sign(&fixture.response_xml(), "_response")
            .unwrap();
        assert_eq!(
            h.validate(&xml).unwrap_err(),
            ValidationError::IdpReportedFailure {
                status_code: STATUS_RESPONDER.into(),
                sub_code: Some(STATUS_AUTHN_FAILED.into()),
                message: None,
            }
        );
        assert_eq!(h.pending.len(), 1);
    }

    #[test]
    fn expired_assertion_fails_conditions() {
        let h = harness();
        let xml = sign_assertion(
            &Fixture {
                not_before: NOW - Duration::minutes(20),
                not_on_or_after: NOW - Duration::minutes(10),
                ..Default::default()
            }
            .response_xml(),
        );
        assert!(matches!(
            h.validate(&xml).unwrap_err(),
            ValidationError::ConditionsNotMet(_)
        ));
    }

    #[test]
    fn not_yet_valid_assertion_fails_conditions() {
        let h = harness();
        let xml = sign_assertion(
            &Fixture {
                not_before: NOW + Duration::minutes(10),
                not_on_or_after: NOW + Duration::minutes(20),
                ..Default::default()
            }
            .response_xml(),
        );
        assert!(matches!(
            h.validate(&xml).unwrap_err(),
            ValidationError::ConditionsNotMet(_)
        ));
    }

    #[test]
    fn wrong_audience_fails_conditions() {
        let h = harness();
        let xml = sign_assertion(
            &Fixture {
                audience: "https://other.example.org",
                ..Default::default()
            }
            .response_xml(),
        );
        assert!(matches!(
            h.validate(&xml).unwrap_err(),
            ValidationError::ConditionsNotMet(_)
        ));
    }

    #[test]
    fn wrong_destination_is_rejected() {
        let h = harness();
        let xml = sign_assertion(
            &Fixture {
                destination: "https://evil.example.org/acs",
                ..Default::default()
            }
            .response_xml(),
        );
        assert!(matches!(
            h.validate(&xml).unwrap_err(),
            ValidationError::DestinationMismatch { .. }
        ));
    }

    #[test]
    fn foreign_issuer_is_rejected() {
        let mut h = harness();
        h.trust.entity_id = "https://other-idp.example.org".into();
        let xml = sign_assertion(&Fixture::default().response_xml());
        assert_eq!(h.validate(&xml).unwrap_err(), ValidationError::IssuerMismatch);
    }

    #[test]
    fn missing_trust_is_reported() {
        let h = harness();
        let xml = sign_assertion(&Fixture::default().response_xml());
        let err = h
            .validator
            .validate(xml.as_bytes(), None, ValidationOptions::default())
            .unwrap_err();
        assert_eq!(err, ValidationError::NoTrustedIdentityProvider);
    }

    #[test]
    fn expired_trust_is_refused() {
        let mut h = harness();
        h.trust.valid_until = Some(NOW - Duration::minutes(1));
        let xml = sign_assertion(&Fixture::default().response_xml());
        assert_eq!(h.validate(&xml).unwrap_err(), ValidationError::NoTrustedIdentityProvider);
        assert_eq!(h.pending.len(), 1);
    }

    #[test]
    fn far_future_expiry_is_accepted() {
        let h = harness();
        let fixture = Fixture {
            not_on_or_after: datetime!(9999-12-31 23:59:59 UTC),
            ..Default::default()
        };
        let xml = sign_assertion(&fixture.response_xml());
        let validated = h.validate(&xml).unwrap();
        assert_eq!(validated.claims.assertion_id, "_assert");
        assert_eq!(h.validate(&xml).unwrap_err(), ValidationError::ReplayedAssertion);
    }

    #[test]
    fn encrypted_assertion_is_malformed() {
        let h = harness();
        let xml = Fixture {
            with_assertion: false,
            ..Default::default()
        }
        .response_xml()
        .replace(
            "</samlp:Response>",
            "<saml:EncryptedAssertion/></samlp:Response>",
        );
        assert!(matches!(
            h.validate(&xml).unwrap_err(),
            ValidationError::MalformedResponse(_)
        ));
    }

    #[test]
    fn garbage_is_malformed() {
        let h = harness();
        assert!(matches!(
            h.validate("<html/>").unwrap_err(),
            ValidationError::MalformedResponse(_)
        ));
        assert!(matches!(
            h.validate("not xml").unwrap_err(),
            ValidationError::MalformedResponse(_)
        ));
    }

    #[test]
    fn elapsed_deadline_times_out() {
        let h = harness();
        let xml = sign_assertion(&Fixture::default().response_xml());
        let options = ValidationOptions {
            deadline: Some(Instant::now()),
        };
        let err = h
            .validator
            .validate(xml.as_bytes(), Some(&h.trust), options)
            .unwrap_err();
        assert_eq!(err, ValidationError::Timeout);
    }

    #[test]
    fn stage_names_are_snake_case() {
        assert_eq!(ValidationStage::SignatureVerified.to_string(), "signature_verified");
    }
}
