//! HTTP-facing entry points: challenge, assertion consumer, sign-out, single
//! logout callback and SP metadata.
//!
//! Routing and cookie handling belong to the host. Every method here takes or
//! returns plain `http` types.

use std::{fmt, sync::Arc};

use http::{header, Method, Request, Response, StatusCode};
use tokio_util::sync::CancellationToken;

use crate::{
    authn_request::{build_authn_request, AuthnRequestOptions},
    binding::{InboundMessage, OutboundMessage, SAML_REQUEST, SAML_RESPONSE},
    certificate::{Certificate, CertificateProvider},
    clock::{Clock, SystemClock},
    config::ServiceProviderConfig,
    error::{ConfigurationError, Error, MetadataError, ValidationError},
    idp_metadata::{MetadataParseOptions, MetadataSource, TrustDescriptor, TrustStore},
    logout::LogoutRequest,
    response::{ResponseValidator, ValidationOptions},
    session::{AuthenticationTicket, LogoutOptions, SessionCoordinator},
    signature::XmlSigner,
    sp_metadata::{build_sp_metadata, write_metadata_file},
    store::{PendingRequestStore, ReplayCache},
    STATUS_SUCCESS,
};

/// What to do after a sign-in attempt failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteFailureAction {
    /// Hand the error to the host unchanged.
    Propagate,
    /// Send the browser to this URL instead.
    Redirect(String),
}

/// Hooks around the sign-in flow. Both default to doing nothing.
pub trait Saml2Events: Send + Sync {
    /// Called with every freshly issued ticket; may add claims or reject it.
    fn on_ticket_received(
        &self,
        _ticket: &mut AuthenticationTicket,
    ) -> Result<(), ValidationError> {
        Ok(())
    }

    fn on_remote_failure(&self, _error: &ValidationError) -> RemoteFailureAction {
        RemoteFailureAction::Propagate
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultEvents;

impl Saml2Events for DefaultEvents {}

/// Result of a request to the single logout endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogoutCompletion {
    /// The IdP confirmed a logout we started.
    Confirmed { return_url: Option<String> },
    /// The IdP asks us to end the session named in `request`. Clear it, then
    /// answer with [`Saml2Middleware::answer_logout_request`].
    Requested {
        request: LogoutRequest,
        relay_state: Option<String>,
    },
}

pub struct Saml2Middleware {
    config: Arc<ServiceProviderConfig>,
    trust: TrustStore,
    pending: Arc<PendingRequestStore>,
    replay: Arc<ReplayCache>,
    clock: Arc<dyn Clock>,
    signer: Option<XmlSigner>,
    metadata_signers: Vec<Certificate>,
    validator: ResponseValidator,
    sessions: SessionCoordinator,
    events: Arc<dyn Saml2Events>,
    sp_metadata: String,
}

impl fmt::Debug for Saml2Middleware {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Saml2Middleware")
            .field("entity_id", &self.config.entity_id)
            .field("trust", &self.trust)
            .field("pending_requests", &self.pending.len())
            .finish_non_exhaustive()
    }
}

impl Saml2Middleware {
    pub fn new(
        config: ServiceProviderConfig,
        certificates: Arc<dyn CertificateProvider>,
    ) -> Result<Self, Error> {
        Self::with_clock(config, certificates, Arc::new(SystemClock))
    }

    /// Validates `config`, resolves the signing key and renders SP metadata.
    /// Any failure here is a startup error.
    pub fn with_clock(
        config: ServiceProviderConfig,
        certificates: Arc<dyn CertificateProvider>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, Error> {
        config.validate()?;
        let signer = if config.require_message_signed {
            let credential = certificates.resolve_signing_key()?;
            Some(XmlSigner::new(credential, config.signature_algorithm))
        } else {
            None
        };
        let metadata_signers = config
            .metadata
            .signing_certificate_files
            .iter()
            .map(|path| Certificate::from_file(path))
            .collect::<Result<Vec<_>, _>>()?;

        let sp_metadata = build_sp_metadata(&config, signer.as_ref().map(XmlSigner::certificate))?;
        if config.metadata.create_metadata_file {
            write_metadata_file(&config.metadata, &sp_metadata)?;
        }

        let config = Arc::new(config);
        let pending = Arc::new(PendingRequestStore::new());
        let replay = Arc::new(ReplayCache::new());
        let validator = ResponseValidator::new(
            config.clone(),
            certificates.clone(),
            pending.clone(),
            replay.clone(),
            clock.clone(),
        );
        let sessions = SessionCoordinator::new(
            config.clone(),
            certificates,
            signer.clone(),
            pending.clone(),
            clock.clone(),
        );
        tracing::info!(
            entity_id = %config.entity_id,
            signs_requests = signer.is_some(),
            "service provider initialised"
        );

        Ok(Self {
            config,
            trust: TrustStore::new(),
            pending,
            replay,
            clock,
            signer,
            metadata_signers,
            validator,
            sessions,
            events: Arc::new(DefaultEvents),
            sp_metadata,
        })
    }

    pub fn with_events(self, events: Arc<dyn Saml2Events>) -> Self {
        Self { events, ..self }
    }

    pub fn config(&self) -> &ServiceProviderConfig {
        &self.config
    }

    pub fn trust_store(&self) -> &TrustStore {
        &self.trust
    }

    pub fn pending_requests(&self) -> &PendingRequestStore {
        &self.pending
    }

    /// Sends the browser to the IdP, returning to `return_url` after sign-in.
    pub fn challenge(&self, return_url: &str) -> Result<Response<String>, Error> {
        self.challenge_with(&AuthnRequestOptions {
            return_url: Some(return_url.to_string()),
            ..Default::default()
        })
    }

    pub fn challenge_with(&self, options: &AuthnRequestOptions) -> Result<Response<String>, Error> {
        let trust = self.current_trust()?;
        let output = build_authn_request(
            &self.config,
            &trust,
            self.signer.as_ref(),
            &self.pending,
            self.clock.as_ref(),
            options,
        )?;
        output.message.into_http_response()
    }

    /// Consumes the HTTP-POST delivered to the assertion consumer endpoint.
    pub fn handle_callback<B: AsRef<[u8]>>(
        &self,
        request: &Request<B>,
    ) -> Result<AuthenticationTicket, ValidationError> {
        if request.method() != Method::POST {
            return Err(ValidationError::MalformedResponse(
                "assertion consumer expects HTTP-POST".into(),
            ));
        }
        let message = InboundMessage::from_form(
            request.body().as_ref(),
            &[SAML_RESPONSE],
            self.config.max_message_size,
        )
        .map_err(ValidationError::MalformedResponse)?;

        let trust = self.trust.current_at(self.clock.now());
        let options = ValidationOptions::with_timeout(self.config.validation_timeout());
        let validated = self.validator.validate(&message.xml, trust.as_deref(), options)?;

        let return_url = match validated.request {
            Some(record) => record.return_url,
            None => message.relay_state.filter(|rs| is_local_path(rs)),
        };
        let mut ticket = self.sessions.issue_ticket(&validated.claims, return_url);
        self.events.on_ticket_received(&mut ticket)?;
        Ok(ticket)
    }

    /// Lets [`Saml2Events::on_remote_failure`] turn a failed sign-in into a
    /// response. `None` means the host should handle `error` itself.
    pub fn failure_response(
        &self,
        error: &ValidationError,
    ) -> Result<Option<Response<String>>, Error> {
        match self.events.on_remote_failure(error) {
            RemoteFailureAction::Propagate => Ok(None),
            RemoteFailureAction::Redirect(location) => {
                Ok(Some(OutboundMessage::Redirect { location }.into_http_response()?))
            }
        }
    }

    /// Starts single logout for `ticket`. Without an IdP logout endpoint the
    /// browser goes straight to `return_url`.
    pub fn sign_out(
        &self,
        ticket: &AuthenticationTicket,
        return_url: &str,
    ) -> Result<Response<String>, Error> {
        let local = || {
            OutboundMessage::Redirect {
                location: return_url.to_string(),
            }
            .into_http_response()
        };
        let Some(trust) = self.trust.current_at(self.clock.now()) else {
            return local();
        };
        if trust.slo_endpoint(self.config.authn_request_binding).is_none() {
            tracing::debug!(
                entity_id = %trust.entity_id,
                "identity provider has no logout endpoint"
            );
            return local();
        }
        let output = self.sessions.build_logout_request(
            &trust,
            ticket,
            &LogoutOptions {
                return_url: Some(return_url.to_string()),
                relay_state: None,
            },
        )?;
        output.message.into_http_response()
    }

    /// Handles a logout message at the sign-out URL, either binding.
    pub fn handle_logout_callback<B: AsRef<[u8]>>(
        &self,
        request: &Request<B>,
    ) -> Result<LogoutCompletion, ValidationError> {
        let accepted = [SAML_REQUEST, SAML_RESPONSE];
        let max_size = self.config.max_message_size;
        let message = if request.method() == Method::GET {
            let query = request.uri().query().unwrap_or_default();
            InboundMessage::from_query(query, &accepted, max_size)
        } else if request.method() == Method::POST {
            InboundMessage::from_form(request.body().as_ref(), &accepted, max_size)
        } else {
            Err(format!("unsupported method {}", request.method()))
        }
        .map_err(ValidationError::MalformedResponse)?;

        let trust = self.trust.current_at(self.clock.now());
        if message.parameter == SAML_RESPONSE {
            let completed = self.sessions.handle_logout_response(trust.as_deref(), &message)?;
            Ok(LogoutCompletion::Confirmed {
                return_url: completed.request.return_url,
            })
        } else {
            let request = self.sessions.handle_logout_request(trust.as_deref(), &message)?;
            Ok(LogoutCompletion::Requested {
                request,
                relay_state: message.relay_state,
            })
        }
    }

    /// Acknowledges an IdP-initiated logout once the local session is gone.
    pub fn answer_logout_request(
        &self,
        request: &LogoutRequest,
        relay_state: Option<&str>,
    ) -> Result<Response<String>, Error> {
        let trust = self.current_trust()?;
        self.sessions
            .build_logout_response(&trust, request, STATUS_SUCCESS, relay_state)?
            .into_http_response()
    }

    pub fn sp_metadata(&self) -> &str {
        &self.sp_metadata
    }

    pub fn sp_metadata_response(&self) -> Result<Response<String>, Error> {
        Ok(Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "application/samlmetadata+xml")
            .body(self.sp_metadata.clone())?)
    }

    /// Replaces the trust snapshot from `source`. On failure the previous
    /// snapshot stays in effect.
    pub async fn load_idp_metadata(
        &self,
        source: &MetadataSource,
        cancel: &CancellationToken,
    ) -> Result<Arc<TrustDescriptor>, MetadataError> {
        let options = MetadataParseOptions {
            signing_certificates: self.metadata_signers.clone(),
            now: self.clock.now(),
            ..Default::default()
        };
        self.trust
            .reload(source, &options, self.config.metadata_fetch_timeout(), cancel)
            .await
    }

    /// [`load_idp_metadata`](Self::load_idp_metadata) from the configured address.
    pub async fn load_configured_idp_metadata(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Arc<TrustDescriptor>, Error> {
        let address = self
            .config
            .metadata
            .address
            .as_deref()
            .ok_or(ConfigurationError::MissingField("metadata.address"))?;
        let source = MetadataSource::from_address(address)?;
        Ok(self.load_idp_metadata(&source, cancel).await?)
    }

    /// Drops expired pending requests and replay entries.
    pub fn sweep(&self) {
        let now = self.clock.now();
        let requests = self.pending.sweep(now);
        let assertions = self.replay.sweep(now);
        tracing::debug!(requests, assertions, "swept correlation state");
    }

    fn current_trust(&self) -> Result<Arc<TrustDescriptor>, ValidationError> {
        self.trust
            .current_at(self.clock.now())
            .ok_or(ValidationError::NoTrustedIdentityProvider)
    }
}

// RelayState from an unsolicited response is attacker controlled; only
// same-origin paths are followed.
fn is_local_path(url: &str) -> bool {
    url.starts_with('/') && !url.starts_with("//") && !url.contains('\\')
}
