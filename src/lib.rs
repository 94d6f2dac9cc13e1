mod assertion;
mod authn_request;
mod binding;
mod certificate;
mod clock;
mod config;
mod error;
mod idp_metadata;
mod logout;
mod middleware;
mod response;
mod session;
mod signature;
mod sp_metadata;
mod store;
mod utils;

pub use assertion::{
    Assertion, AuthnStatement, ClaimSet, Conditions, NameId, Subject, SubjectConfirmation,
};
pub use authn_request::{
    build_authn_request, AuthnRequestBuilder, AuthnRequestOptions, AuthnRequestOutput,
    ProtocolBinding,
};
pub use binding::{
    decode_redirect_payload, InboundMessage, OutboundMessage, PostForm, QuerySignature, RawQuery,
};
pub use certificate::{
    Certificate, CertificateProvider, CertificateSelector, ConfiguredCertificateProvider,
    DirectoryCertificateStore, SigningCredential,
};
pub use clock::{Clock, FixedClock, SystemClock};
pub use config::{
    ContactPerson, ContactType, MetadataConfig, Organization, ServiceProviderConfig,
    ServiceProviderConfigBuilder, SigningKeySource,
};
pub use error::{
    ConfigurationError, Error, MetadataError, Result, RetryHint, TransportError, ValidationError,
};
pub use idp_metadata::{
    fetch_metadata, parse_idp_metadata, Endpoint, EntityRole, MetadataParseOptions,
    MetadataSource, TrustDescriptor, TrustStore,
};
pub use logout::{LogoutRequest, LogoutRequestBuilder, LogoutResponse, LogoutResponseBuilder};
pub use middleware::{
    DefaultEvents, LogoutCompletion, RemoteFailureAction, Saml2Events, Saml2Middleware,
};
pub use response::{ResponseValidator, ValidatedResponse, ValidationOptions, ValidationStage};
pub use session::{
    AuthenticationTicket, Claim, ClaimsPrincipal, CompletedLogout, LogoutOptions,
    LogoutRequestOutput, SessionCoordinator, AUTHENTICATION_TYPE, CLAIM_AUTHN_CONTEXT,
    CLAIM_AUTHN_INSTANT, CLAIM_NAME_ID, CLAIM_NAME_ID_FORMAT, CLAIM_SESSION_INDEX,
};
pub use signature::{SignatureAlgorithm, XmlSigner};
pub use sp_metadata::{build_sp_metadata, write_metadata_file, SpMetadataBuilder};
pub use store::{PendingRequestKind, PendingRequestRecord, PendingRequestStore, ReplayCache};

use time::format_description::well_known::iso8601::{self, TimePrecision};

pub const NS_PROTOCOL: &str = "urn:oasis:names:tc:SAML:2.0:protocol";
pub const NS_ASSERTION: &str = "urn:oasis:names:tc:SAML:2.0:assertion";
pub const NS_METADATA: &str = "urn:oasis:names:tc:SAML:2.0:metadata";
pub const NS_XMLDSIG: &str = "http://www.w3.org/2000/09/xmldsig#";

pub const NAME_ID_FORMAT_EMAIL_ADDRESS: &str =
    "urn:oasis:names:tc:SAML:1.1:nameid-format:emailAddress";
pub const NAME_ID_FORMAT_UNSPECIFIED: &str =
    "urn:oasis:names:tc:SAML:1.1:nameid-format:unspecified";
pub const NAME_ID_FORMAT_PERSISTENT: &str =
    "urn:oasis:names:tc:SAML:2.0:nameid-format:persistent";
pub const NAME_ID_FORMAT_TRANSIENT: &str = "urn:oasis:names:tc:SAML:2.0:nameid-format:transient";
pub const NAME_ID_FORMAT_ENTITY: &str = "urn:oasis:names:tc:SAML:2.0:nameid-format:entity";

pub const STATUS_SUCCESS: &str = "urn:oasis:names:tc:SAML:2.0:status:Success";
pub const STATUS_REQUESTER: &str = "urn:oasis:names:tc:SAML:2.0:status:Requester";
pub const STATUS_RESPONDER: &str = "urn:oasis:names:tc:SAML:2.0:status:Responder";
pub const STATUS_AUTHN_FAILED: &str = "urn:oasis:names:tc:SAML:2.0:status:AuthnFailed";
pub const STATUS_NO_PASSIVE: &str = "urn:oasis:names:tc:SAML:2.0:status:NoPassive";
pub const STATUS_NO_AUTHN_CONTEXT: &str = "urn:oasis:names:tc:SAML:2.0:status:NoAuthnContext";
pub const STATUS_PARTIAL_LOGOUT: &str = "urn:oasis:names:tc:SAML:2.0:status:PartialLogout";

pub const SUBJECT_CONFIRMATION_BEARER: &str = "urn:oasis:names:tc:SAML:2.0:cm:bearer";

// xs:dateTime isn't actually ISO8601, because implementors often don't support higher precisions.
pub const DATE_TIME_FORMAT: iso8601::Iso8601<
    {
        iso8601::Config::DEFAULT
            .set_time_precision(TimePrecision::Second {
                decimal_digits: None,
            })
            .encode()
    },
> = iso8601::Iso8601;
