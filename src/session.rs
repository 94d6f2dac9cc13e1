//! Local sign-in tickets and the Single Logout exchange with the IdP.
//!
//! The coordinator never stores a session; it hands tickets to the caller and
//! validates logout messages against the current trust snapshot.

use std::{fmt, sync::Arc};

use libxml::tree::{Document, Node};
use time::OffsetDateTime;

use crate::{
    assertion::{ClaimSet, NameId},
    authn_request::ProtocolBinding,
    binding::{
        redirect_location, InboundMessage, OutboundMessage, PostForm, SAML_REQUEST, SAML_RESPONSE,
    },
    certificate::CertificateProvider,
    clock::Clock,
    config::ServiceProviderConfig,
    error::{Error, MetadataError, ValidationError},
    idp_metadata::TrustDescriptor,
    logout::{LogoutRequest, LogoutRequestBuilder, LogoutResponse, LogoutResponseBuilder},
    signature::{
        all_signatures, ensure_unique_ids, register_ids, verify_enveloped, verify_query, XmlSigner,
    },
    store::{PendingRequestKind, PendingRequestRecord, PendingRequestStore},
    utils::{format_instant, is_element, parse_document, random_id, redact},
    NS_PROTOCOL,
};

pub const CLAIM_NAME_ID: &str = "name_id";
pub const CLAIM_NAME_ID_FORMAT: &str = "name_id_format";
pub const CLAIM_SESSION_INDEX: &str = "session_index";
pub const CLAIM_AUTHN_CONTEXT: &str = "authn_context_class_ref";
pub const CLAIM_AUTHN_INSTANT: &str = "authn_instant";

pub const AUTHENTICATION_TYPE: &str = "saml2";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claim {
    pub claim_type: String,
    pub value: String,
    /// Entity ID of the party that asserted the claim.
    pub issuer: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimsPrincipal {
    pub authentication_type: String,
    pub claims: Vec<Claim>,
}

impl ClaimsPrincipal {
    pub fn find_first(&self, claim_type: &str) -> Option<&Claim> {
        self.claims.iter().find(|c| c.claim_type == claim_type)
    }

    pub fn find_all<'a>(&'a self, claim_type: &'a str) -> impl Iterator<Item = &'a Claim> + 'a {
        self.claims.iter().filter(move |c| c.claim_type == claim_type)
    }

    /// The subject's NameID value.
    pub fn name(&self) -> Option<&str> {
        self.find_first(CLAIM_NAME_ID).map(|c| c.value.as_str())
    }

    pub fn add_claim(&mut self, claim_type: &str, value: &str, issuer: &str) {
        self.claims.push(Claim {
            claim_type: claim_type.into(),
            value: value.into(),
            issuer: issuer.into(),
        });
    }
}

/// What the hosting session layer persists for a signed-in user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticationTicket {
    pub principal: ClaimsPrincipal,
    /// Kept verbatim for Single Logout.
    pub name_id: NameId,
    pub session_index: Option<String>,
    pub idp_entity_id: String,
    pub issued_at: OffsetDateTime,
    pub expires_at: OffsetDateTime,
    pub return_url: Option<String>,
}

impl AuthenticationTicket {
    pub fn is_expired(&self, now: OffsetDateTime) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogoutOptions {
    /// Where to send the user once the IdP confirms; kept locally.
    pub return_url: Option<String>,
    pub relay_state: Option<String>,
}

#[derive(Debug, Clone)]
pub struct LogoutRequestOutput {
    pub id: String,
    pub xml: String,
    pub message: OutboundMessage,
}

/// A validated answer to one of our logout requests.
#[derive(Debug, Clone)]
pub struct CompletedLogout {
    pub response: LogoutResponse,
    pub request: PendingRequestRecord,
}

pub struct SessionCoordinator {
    config: Arc<ServiceProviderConfig>,
    certificates: Arc<dyn CertificateProvider>,
    signer: Option<XmlSigner>,
    pending: Arc<PendingRequestStore>,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for SessionCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionCoordinator")
            .field("entity_id", &self.config.entity_id)
            .field("signs_messages", &self.signer.is_some())
            .finish_non_exhaustive()
    }
}

impl SessionCoordinator {
    /// `signer` signs outbound logout messages; pass `None` to send them unsigned.
    pub fn new(
        config: Arc<ServiceProviderConfig>,
        certificates: Arc<dyn CertificateProvider>,
        signer: Option<XmlSigner>,
        pending: Arc<PendingRequestStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            certificates,
            signer,
            pending,
            clock,
        }
    }

    /// Maps accepted claims onto a ticket. The ticket never outlives the
    /// IdP's `SessionNotOnOrAfter`.
    pub fn issue_ticket(
        &self,
        claims: &ClaimSet,
        return_url: Option<String>,
    ) -> AuthenticationTicket {
        let issuer = claims.issuer.as_str();
        let mut principal = ClaimsPrincipal {
            authentication_type: AUTHENTICATION_TYPE.into(),
            claims: Vec::new(),
        };
        principal.add_claim(CLAIM_NAME_ID, &claims.subject.value, issuer);
        if let Some(format) = &claims.subject.format {
            principal.add_claim(CLAIM_NAME_ID_FORMAT, format, issuer);
        }
        if let Some(index) = &claims.session_index {
            principal.add_claim(CLAIM_SESSION_INDEX, index, issuer);
        }
        if let Some(class_ref) = &claims.authn_context_class_ref {
            principal.add_claim(CLAIM_AUTHN_CONTEXT, class_ref, issuer);
        }
        if let Some(instant) = claims.authn_instant.and_then(|i| format_instant(i).ok()) {
            principal.add_claim(CLAIM_AUTHN_INSTANT, &instant, issuer);
        }
        for (name, values) in &claims.attributes {
            for value in values {
                principal.add_claim(name, value, issuer);
            }
        }

        let issued_at = self.clock.now();
        let mut expires_at = issued_at.saturating_add(self.config.ticket_lifetime());
        if let Some(limit) = claims.session_not_on_or_after {
            expires_at = expires_at.min(limit);
        }
        tracing::debug!(
            subject = %redact(&claims.subject.value, self.config.show_pii),
            claims = principal.claims.len(),
            %expires_at,
            "issued authentication ticket"
        );
        AuthenticationTicket {
            principal,
            name_id: claims.subject.clone(),
            session_index: claims.session_index.clone(),
            idp_entity_id: claims.issuer.clone(),
            issued_at,
            expires_at,
            return_url,
        }
    }

    /// Starts SP-initiated logout for `ticket` and records the request as pending.
    pub fn build_logout_request(
        &self,
        trust: &TrustDescriptor,
        ticket: &AuthenticationTicket,
        options: &LogoutOptions,
    ) -> Result<LogoutRequestOutput, Error> {
        let endpoint = trust
            .slo_endpoint(self.config.authn_request_binding)
            .ok_or(MetadataError::NoUsableEndpoint)?;
        let now = self.clock.now();
        let expires_at = now.saturating_add(self.config.request_lifetime());
        let id = random_id();

        let mut builder = LogoutRequestBuilder::new()
            .id(&id)
            .issue_instant(now)
            .not_on_or_after(expires_at)
            .issuer(&self.config.entity_id)
            .destination(&endpoint.location)
            .name_id(ticket.name_id.clone());
        if let Some(index) = &ticket.session_index {
            builder = builder.session_index(index);
        }
        let xml = builder.build()?;
        let (xml, message) = self.encode(
            &endpoint.location,
            endpoint.binding,
            SAML_REQUEST,
            xml,
            &id,
            options.relay_state.as_deref(),
        )?;

        self.pending.insert(PendingRequestRecord {
            id: id.clone(),
            kind: PendingRequestKind::Logout,
            created_at: now,
            expires_at,
            return_url: options.return_url.clone(),
            relay_state: options.relay_state.clone(),
        });
        tracing::debug!(
            request_id = %id,
            destination = %endpoint.location,
            "issued logout request"
        );
        Ok(LogoutRequestOutput { id, xml, message })
    }

    /// Answers an IdP-initiated logout request.
    pub fn build_logout_response(
        &self,
        trust: &TrustDescriptor,
        request: &LogoutRequest,
        status: &str,
        relay_state: Option<&str>,
    ) -> Result<OutboundMessage, Error> {
        let endpoint = trust
            .slo_endpoint(self.config.authn_request_binding)
            .ok_or(MetadataError::NoUsableEndpoint)?;
        let destination = endpoint.response_location();
        let id = random_id();
        let xml = LogoutResponseBuilder::new()
            .id(&id)
            .issue_instant(self.clock.now())
            .issuer(&self.config.entity_id)
            .destination(destination)
            .in_response_to(&request.id)
            .status(status)
            .build()?;
        let (_, message) =
            self.encode(destination, endpoint.binding, SAML_RESPONSE, xml, &id, relay_state)?;
        tracing::debug!(in_response_to = %request.id, %status, "answered logout request");
        Ok(message)
    }

    /// Validates the IdP's answer to one of our logout requests and consumes
    /// the matching pending record.
    pub fn handle_logout_response(
        &self,
        trust: Option<&TrustDescriptor>,
        message: &InboundMessage,
    ) -> Result<CompletedLogout, ValidationError> {
        let trust = trust.ok_or(ValidationError::NoTrustedIdentityProvider)?;
        trust.ensure_current(self.clock.now())?;
        let document = parse_document(&message.xml, self.config.document_limits())
            .map_err(ValidationError::MalformedResponse)?;
        let root = self.protocol_root(&document, "LogoutResponse")?;
        let response =
            LogoutResponse::from_node(&root).map_err(ValidationError::MalformedResponse)?;
        self.verify_message(&root, message, trust)?;
        self.check_envelope(response.issuer.as_deref(), response.destination.as_deref(), trust)?;

        if !response.is_success() {
            return Err(ValidationError::IdpReportedFailure {
                status_code: response.status_code,
                sub_code: response.sub_status_code,
                message: response.status_message,
            });
        }
        let request = response
            .in_response_to
            .as_deref()
            .and_then(|id| self.pending.consume(id, PendingRequestKind::Logout, self.clock.now()))
            .ok_or(ValidationError::UnsolicitedResponse)?;
        tracing::info!(request_id = %request.id, "logout confirmed by identity provider");
        Ok(CompletedLogout { response, request })
    }

    /// Validates an IdP-initiated logout request.
    pub fn handle_logout_request(
        &self,
        trust: Option<&TrustDescriptor>,
        message: &InboundMessage,
    ) -> Result<LogoutRequest, ValidationError> {
        let trust = trust.ok_or(ValidationError::NoTrustedIdentityProvider)?;
        trust.ensure_current(self.clock.now())?;
        let document = parse_document(&message.xml, self.config.document_limits())
            .map_err(ValidationError::MalformedResponse)?;
        let root = self.protocol_root(&document, "LogoutRequest")?;
        let request = LogoutRequest::from_node(&root).map_err(ValidationError::MalformedResponse)?;
        self.verify_message(&root, message, trust)?;
        self.check_envelope(request.issuer.as_deref(), request.destination.as_deref(), trust)?;

        let now = self.clock.now();
        if request
            .not_on_or_after
            .is_some_and(|noa| now - self.config.clock_skew() >= noa)
        {
            return Err(ValidationError::ConditionsNotMet("logout request has expired".into()));
        }
        tracing::info!(
            request_id = %request.id,
            subject = %redact(&request.name_id.value, self.config.show_pii),
            "identity provider requested logout"
        );
        Ok(request)
    }

    fn encode(
        &self,
        destination: &str,
        binding: ProtocolBinding,
        parameter: &'static str,
        xml: String,
        id: &str,
        relay_state: Option<&str>,
    ) -> Result<(String, OutboundMessage), Error> {
        match binding {
            ProtocolBinding::Redirect => {
                let location = redirect_location(
                    destination,
                    parameter,
                    &xml,
                    relay_state,
                    self.signer.as_ref(),
                )?;
                Ok((xml, OutboundMessage::Redirect { location }))
            }
            ProtocolBinding::Post => {
                let xml = match &self.signer {
                    Some(signer) => signer.sign(&xml, id)?,
                    None => xml,
                };
                let form = PostForm::new(destination, parameter, &xml, relay_state);
                Ok((xml, OutboundMessage::Post(form)))
            }
        }
    }

    fn protocol_root(&self, document: &Document, name: &str) -> Result<Node, ValidationError> {
        let root = document
            .get_root_element()
            .filter(|root| is_element(root, NS_PROTOCOL, name))
            .ok_or_else(|| {
                ValidationError::MalformedResponse(format!("root element is not samlp:{name}"))
            })?;
        register_ids(document).map_err(ValidationError::MalformedResponse)?;
        Ok(root)
    }

    // Either an enveloped signature on the root or a redirect query signature.
    fn verify_message(
        &self,
        root: &Node,
        message: &InboundMessage,
        trust: &TrustDescriptor,
    ) -> Result<(), ValidationError> {
        ensure_unique_ids(root)?;
        if all_signatures(root)
            .iter()
            .any(|signature| signature.get_parent().as_ref() != Some(root))
        {
            return Err(ValidationError::InvalidSignature);
        }
        let certificates = self
            .certificates
            .resolve_trusted_certificates(trust)
            .map_err(|_| ValidationError::InvalidSignature)?;

        let enveloped = verify_enveloped(root, &certificates)?;
        let query_signed = match &message.query_signature {
            Some(qs)
                if verify_query(&qs.signed_octets, &qs.sig_alg, &qs.signature, &certificates) =>
            {
                true
            }
            Some(_) => return Err(ValidationError::InvalidSignature),
            None => false,
        };
        if self.config.require_signed_logout && !enveloped && !query_signed {
            return Err(ValidationError::UnsignedResponse);
        }
        Ok(())
    }

    fn check_envelope(
        &self,
        issuer: Option<&str>,
        destination: Option<&str>,
        trust: &TrustDescriptor,
    ) -> Result<(), ValidationError> {
        if issuer != Some(trust.entity_id.as_str()) {
            return Err(ValidationError::IssuerMismatch);
        }
        match destination {
            Some(destination) if destination != self.config.sign_out_url => {
                Err(ValidationError::DestinationMismatch {
                    expected: self.config.sign_out_url.clone(),
                    actual: destination.to_string(),
                })
            }
            _ => Ok(()),
        }
    }
}
