//! Error taxonomy.
//!
//! Configuration problems are fatal at startup, metadata problems are
//! reported to whoever triggered a (re)load, and validation problems are
//! discriminated rejections of a single inbound message.

use std::path::PathBuf;

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("no certificate matches {0}")]
    KeyNotFound(String),

    #[error("{count} certificates match {selector}, refusing to pick one")]
    AmbiguousKey { selector: String, count: usize },

    #[error("entity ID {0:?} is not an absolute URI")]
    InvalidEntityId(String),

    #[error("{field} must be an absolute http(s) URL, got {value:?}")]
    InvalidUrl { field: &'static str, value: String },

    #[error("{0} is required")]
    MissingField(&'static str),

    #[error("{0} must be greater than zero")]
    InvalidLimit(&'static str),

    #[error("{name} must be at most {max}")]
    LimitOutOfRange { name: &'static str, max: u64 },

    #[error("invalid key material: {0}")]
    InvalidKeyMaterial(String),

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration file: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("metadata request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("metadata endpoint answered with HTTP {0}")]
    Status(u16),

    #[error("metadata fetch timed out")]
    Timeout,

    #[error("metadata fetch was cancelled")]
    Cancelled,

    #[error("failed to read metadata from {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("malformed metadata: {0}")]
    MalformedMetadata(String),

    #[error("metadata signature could not be verified")]
    UntrustedMetadataSignature,

    #[error("metadata declares no SSO endpoint with a supported binding")]
    NoUsableEndpoint,

    #[error("metadata expired at {0}")]
    Expired(String),

    #[error("metadata describes a service provider, not an identity provider")]
    WrongRole,

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Reason an inbound protocol message was rejected.
///
/// The rendered message never contains assertion content.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("signature did not verify against any trusted certificate")]
    InvalidSignature,

    #[error("message is not signed as required")]
    UnsignedResponse,

    #[error("identity provider reported {status_code}{}", sub_code_suffix(.sub_code))]
    IdpReportedFailure {
        status_code: String,
        sub_code: Option<String>,
        message: Option<String>,
    },

    #[error("assertion conditions not met: {0}")]
    ConditionsNotMet(String),

    #[error("response does not answer a pending request")]
    UnsolicitedResponse,

    #[error("destination {actual:?} is not this service provider ({expected})")]
    DestinationMismatch { expected: String, actual: String },

    #[error("issuer does not match the trusted identity provider")]
    IssuerMismatch,

    #[error("assertion has already been consumed")]
    ReplayedAssertion,

    #[error("no current identity provider metadata is loaded")]
    NoTrustedIdentityProvider,

    #[error("validation deadline exceeded")]
    Timeout,
}

fn sub_code_suffix(sub_code: &Option<String>) -> String {
    sub_code
        .as_deref()
        .map(|code| format!(" / {code}"))
        .unwrap_or_default()
}

/// Caller-side recovery suggested by a non-fatal IdP status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryHint {
    RetryWithoutPassive,
    RetryWithDifferentAuthnContext,
}

impl ValidationError {
    pub fn retry_hint(&self) -> Option<RetryHint> {
        let ValidationError::IdpReportedFailure { sub_code, .. } = self else {
            return None;
        };
        match sub_code.as_deref() {
            Some(crate::STATUS_NO_PASSIVE) => Some(RetryHint::RetryWithoutPassive),
            Some(crate::STATUS_NO_AUTHN_CONTEXT) => Some(RetryHint::RetryWithDifferentAuthnContext),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    Metadata(#[from] MetadataError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("signing failed: {0}")]
    Signing(String),

    #[error("invalid XML: {0}")]
    Xml(String),

    #[error("cannot build HTTP response: {0}")]
    Http(#[from] http::Error),
}
