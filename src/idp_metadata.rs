//! Parsing of peer metadata into a [`TrustDescriptor`], and the snapshot
//! holder the validators read from.

use std::{path::PathBuf, sync::Arc, time::Duration};

use libxml::tree::Node;
use parking_lot::RwLock;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::{
    authn_request::ProtocolBinding,
    certificate::Certificate,
    error::{ConfigurationError, MetadataError, TransportError, ValidationError},
    signature::{all_signatures, ensure_unique_ids, register_ids, verify_enveloped},
    utils::{child_elements, is_element, parse_document, parse_instant, text, DocumentLimits},
    NS_METADATA, NS_PROTOCOL, NS_XMLDSIG,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityRole {
    IdentityProvider,
    ServiceProvider,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub binding: ProtocolBinding,
    pub location: String,
    pub response_location: Option<String>,
    pub index: Option<u16>,
    pub is_default: bool,
}

impl Endpoint {
    /// Where responses to a request received at this endpoint should go.
    pub fn response_location(&self) -> &str {
        self.response_location.as_deref().unwrap_or(&self.location)
    }
}

/// Everything needed to trust and talk to one peer entity.
///
/// Built once per (re)load and never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustDescriptor {
    pub entity_id: String,
    pub role: EntityRole,
    /// `SingleSignOnService` for an IdP, `AssertionConsumerService` for an SP.
    pub sso_endpoints: Vec<Endpoint>,
    pub slo_endpoints: Vec<Endpoint>,
    /// Signature verification certificates in document order. More than one
    /// means a key rollover is in progress.
    pub certificates: Vec<Certificate>,
    pub name_id_formats: Vec<String>,
    pub want_authn_requests_signed: bool,
    pub want_assertions_signed: bool,
    pub valid_until: Option<OffsetDateTime>,
}

impl TrustDescriptor {
    /// The endpoint for `preferred`, or any supported one.
    pub fn sso_endpoint(&self, preferred: ProtocolBinding) -> Option<&Endpoint> {
        pick_endpoint(&self.sso_endpoints, preferred)
    }

    pub fn slo_endpoint(&self, preferred: ProtocolBinding) -> Option<&Endpoint> {
        pick_endpoint(&self.slo_endpoints, preferred)
    }

    pub fn is_expired(&self, now: OffsetDateTime) -> bool {
        self.valid_until.is_some_and(|until| now >= until)
    }

    /// Refuses a descriptor whose `validUntil` has passed since it was loaded.
    pub(crate) fn ensure_current(&self, now: OffsetDateTime) -> Result<(), ValidationError> {
        if self.is_expired(now) {
            tracing::warn!(
                entity_id = %self.entity_id,
                valid_until = ?self.valid_until,
                "identity provider metadata has expired"
            );
            return Err(ValidationError::NoTrustedIdentityProvider);
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn for_tests(entity_id: &str, certificates: Vec<Certificate>) -> Self {
        Self {
            entity_id: entity_id.into(),
            role: EntityRole::IdentityProvider,
            sso_endpoints: vec![Endpoint {
                binding: ProtocolBinding::Redirect,
                location: "https://idp.example.org/sso".into(),
                response_location: None,
                index: None,
                is_default: false,
            }],
            slo_endpoints: Vec::new(),
            certificates,
            name_id_formats: Vec::new(),
            want_authn_requests_signed: false,
            want_assertions_signed: false,
            valid_until: None,
        }
    }
}

fn pick_endpoint(endpoints: &[Endpoint], preferred: ProtocolBinding) -> Option<&Endpoint> {
    // first isDefault endpoint wins, then document order
    let best = |same_binding: bool| {
        endpoints
            .iter()
            .filter(|e| (e.binding == preferred) == same_binding)
            .min_by_key(|e| !e.is_default)
    };
    best(true).or_else(|| best(false))
}

#[derive(Debug, Clone)]
pub struct MetadataParseOptions {
    pub max_size: usize,
    pub max_depth: usize,
    /// When non-empty, the metadata must carry a signature made with one of
    /// these certificates.
    pub signing_certificates: Vec<Certificate>,
    /// Selects an entity out of an `EntitiesDescriptor`.
    pub entity_id: Option<String>,
    pub now: OffsetDateTime,
}

impl Default for MetadataParseOptions {
    fn default() -> Self {
        Self {
            max_size: 4 * 1024 * 1024,
            max_depth: 64,
            signing_certificates: Vec::new(),
            entity_id: None,
            now: OffsetDateTime::now_utc(),
        }
    }
}

fn malformed(reason: impl Into<String>) -> MetadataError {
    MetadataError::MalformedMetadata(reason.into())
}

/// Parses an `EntityDescriptor` (or the matching entry of an
/// `EntitiesDescriptor`) for either an IdP or an SP.
pub fn parse_idp_metadata(
    input: &[u8],
    options: &MetadataParseOptions,
) -> Result<TrustDescriptor, MetadataError> {
    let limits = DocumentLimits {
        max_size: options.max_size,
        max_depth: options.max_depth,
    };
    let document = parse_document(input, limits).map_err(malformed)?;
    let root = document
        .get_root_element()
        .ok_or_else(|| malformed("empty document"))?;

    let entity = if is_element(&root, NS_METADATA, "EntityDescriptor") {
        root.clone()
    } else if is_element(&root, NS_METADATA, "EntitiesDescriptor") {
        select_entity(&root, options.entity_id.as_deref())?
    } else {
        return Err(malformed(format!("unexpected root element {}", root.get_name())));
    };

    if !options.signing_certificates.is_empty() {
        register_ids(&document).map_err(malformed)?;
        verify_metadata_signature(&root, &entity, &options.signing_certificates)?;
    }

    for node in [&root, &entity] {
        if let Some(until) = node.get_attribute("validUntil") {
            let until = parse_instant(&until).map_err(malformed)?;
            if options.now >= until {
                return Err(MetadataError::Expired(until.to_string()));
            }
        }
    }

    let entity_id = entity
        .get_attribute("entityID")
        .filter(|id| !id.is_empty())
        .ok_or_else(|| malformed("EntityDescriptor without entityID"))?;

    let (role, descriptor) = role_descriptor(&entity)?;
    let protocols = descriptor
        .get_attribute("protocolSupportEnumeration")
        .unwrap_or_default();
    if !protocols.split_whitespace().any(|p| p == NS_PROTOCOL) {
        return Err(malformed("role descriptor does not support SAML 2.0"));
    }

    let endpoint_name = match role {
        EntityRole::IdentityProvider => "SingleSignOnService",
        EntityRole::ServiceProvider => "AssertionConsumerService",
    };
    let sso_endpoints = endpoints(&descriptor, endpoint_name)?;
    if sso_endpoints.is_empty() {
        return Err(MetadataError::NoUsableEndpoint);
    }

    let valid_until = [&entity, &root]
        .iter()
        .filter_map(|node| node.get_attribute("validUntil"))
        .filter_map(|until| parse_instant(&until).ok())
        .min();

    let descriptor_flag = |name: &str| {
        descriptor
            .get_attribute(name)
            .is_some_and(|v| v == "true" || v == "1")
    };

    let descriptor = TrustDescriptor {
        entity_id,
        role,
        slo_endpoints: endpoints(&descriptor, "SingleLogoutService")?,
        certificates: signing_certificates(&descriptor)?,
        name_id_formats: child_elements(&descriptor, NS_METADATA, "NameIDFormat")
            .iter()
            .map(text)
            .collect(),
        want_authn_requests_signed: descriptor_flag("WantAuthnRequestsSigned"),
        want_assertions_signed: descriptor_flag("WantAssertionsSigned"),
        sso_endpoints,
        valid_until,
    };

    tracing::debug!(
        entity_id = %descriptor.entity_id,
        certificates = descriptor.certificates.len(),
        "parsed metadata"
    );
    Ok(descriptor)
}

fn select_entity(root: &Node, entity_id: Option<&str>) -> Result<Node, MetadataError> {
    let entities: Vec<Node> = crate::utils::descendants(root)
        .into_iter()
        .filter(|node| is_element(node, NS_METADATA, "EntityDescriptor"))
        .collect();

    let found = match entity_id {
        Some(wanted) => entities
            .into_iter()
            .find(|e| e.get_attribute("entityID").as_deref() == Some(wanted)),
        None => entities
            .iter()
            .find(|e| !child_elements(e, NS_METADATA, "IDPSSODescriptor").is_empty())
            .or_else(|| entities.first())
            .cloned(),
    };
    found.ok_or_else(|| malformed("no matching EntityDescriptor"))
}

fn role_descriptor(entity: &Node) -> Result<(EntityRole, Node), MetadataError> {
    let single = |name: &str| -> Result<Option<Node>, MetadataError> {
        let mut nodes = child_elements(entity, NS_METADATA, name);
        match nodes.len() {
            0 => Ok(None),
            1 => Ok(nodes.pop()),
            _ => Err(malformed(format!("more than one {name}"))),
        }
    };
    if let Some(idp) = single("IDPSSODescriptor")? {
        return Ok((EntityRole::IdentityProvider, idp));
    }
    if let Some(sp) = single("SPSSODescriptor")? {
        return Ok((EntityRole::ServiceProvider, sp));
    }
    Err(malformed("no IDPSSODescriptor or SPSSODescriptor"))
}

fn endpoints(descriptor: &Node, name: &str) -> Result<Vec<Endpoint>, MetadataError> {
    let mut out = Vec::new();
    for node in child_elements(descriptor, NS_METADATA, name) {
        let binding = node
            .get_attribute("Binding")
            .ok_or_else(|| malformed(format!("{name} without Binding")))?;
        let location = node
            .get_attribute("Location")
            .filter(|l| !l.is_empty())
            .ok_or_else(|| malformed(format!("{name} without Location")))?;
        let Ok(binding) = binding.parse::<ProtocolBinding>() else {
            tracing::debug!(
                %binding,
                endpoint = name,
                "skipping endpoint with unsupported binding"
            );
            continue;
        };
        let index = node
            .get_attribute("index")
            .map(|i| i.parse::<u16>())
            .transpose()
            .map_err(|_| malformed(format!("{name} has an invalid index")))?;
        out.push(Endpoint {
            binding,
            location,
            response_location: node.get_attribute("ResponseLocation"),
            index,
            is_default: node
                .get_attribute("isDefault")
                .is_some_and(|v| v == "true" || v == "1"),
        });
    }
    Ok(out)
}

fn signing_certificates(descriptor: &Node) -> Result<Vec<Certificate>, MetadataError> {
    let mut certificates: Vec<Certificate> = Vec::new();
    for key_descriptor in child_elements(descriptor, NS_METADATA, "KeyDescriptor") {
        match key_descriptor.get_attribute("use").as_deref() {
            None | Some("signing") => {}
            Some(_) => continue,
        }
        for key_info in child_elements(&key_descriptor, NS_XMLDSIG, "KeyInfo") {
            for x509_data in child_elements(&key_info, NS_XMLDSIG, "X509Data") {
                for node in child_elements(&x509_data, NS_XMLDSIG, "X509Certificate") {
                    let certificate = Certificate::from_base64(&text(&node))
                        .map_err(|e| malformed(format!("bad X509Certificate: {e}")))?;
                    if !certificates.contains(&certificate) {
                        certificates.push(certificate);
                    }
                }
            }
        }
    }
    Ok(certificates)
}

fn verify_metadata_signature(
    root: &Node,
    entity: &Node,
    certificates: &[Certificate],
) -> Result<(), MetadataError> {
    ensure_unique_ids(root).map_err(|_| MetadataError::UntrustedMetadataSignature)?;

    let mut covered = false;
    for signature in all_signatures(root) {
        let parent = signature
            .get_parent()
            .ok_or(MetadataError::UntrustedMetadataSignature)?;
        match verify_enveloped(&parent, certificates) {
            Ok(true) => {
                covered |= parent == *root || parent == *entity;
            }
            _ => return Err(MetadataError::UntrustedMetadataSignature),
        }
    }
    if covered {
        Ok(())
    } else {
        Err(MetadataError::UntrustedMetadataSignature)
    }
}

/// Where to load peer metadata from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataSource {
    Url(Url),
    File(PathBuf),
    Bytes(Vec<u8>),
}

impl MetadataSource {
    /// `http(s)://` addresses are fetched, anything else is a file path.
    pub fn from_address(address: &str) -> Result<Self, ConfigurationError> {
        if address.starts_with("http://") || address.starts_with("https://") {
            let url = Url::parse(address).map_err(|_| ConfigurationError::InvalidUrl {
                field: "metadata.address",
                value: address.to_string(),
            })?;
            Ok(MetadataSource::Url(url))
        } else {
            Ok(MetadataSource::File(PathBuf::from(address)))
        }
    }
}

/// Retrieves raw metadata bytes, giving up after `timeout` or when `cancel`
/// fires.
pub async fn fetch_metadata(
    source: &MetadataSource,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<Vec<u8>, TransportError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(TransportError::Cancelled),
        result = tokio::time::timeout(timeout, read_source(source, timeout)) => {
            result.map_err(|_| TransportError::Timeout)?
        }
    }
}

async fn read_source(
    source: &MetadataSource,
    timeout: Duration,
) -> Result<Vec<u8>, TransportError> {
    match source {
        MetadataSource::Bytes(bytes) => Ok(bytes.clone()),
        MetadataSource::File(path) => tokio::fs::read(path)
            .await
            .map_err(|source| TransportError::Io {
                path: path.clone(),
                source,
            }),
        MetadataSource::Url(url) => {
            let client = reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .map_err(TransportError::Http)?;
            let response = client.get(url.clone()).send().await.map_err(map_reqwest)?;
            let status = response.status();
            if !status.is_success() {
                return Err(TransportError::Status(status.as_u16()));
            }
            Ok(response.bytes().await.map_err(map_reqwest)?.to_vec())
        }
    }
}

fn map_reqwest(error: reqwest::Error) -> TransportError {
    if error.is_timeout() {
        TransportError::Timeout
    } else {
        TransportError::Http(error)
    }
}

/// Holds the current trust snapshot. Readers get the whole descriptor or
/// nothing; a failed reload leaves the previous one in place.
#[derive(Debug, Default)]
pub struct TrustStore {
    current: RwLock<Option<Arc<TrustDescriptor>>>,
}

impl TrustStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<Arc<TrustDescriptor>> {
        self.current.read().clone()
    }

    /// The snapshot if it is still valid at `now`.
    pub fn current_at(&self, now: OffsetDateTime) -> Option<Arc<TrustDescriptor>> {
        self.current().filter(|descriptor| descriptor.ensure_current(now).is_ok())
    }

    fn replace(&self, descriptor: Arc<TrustDescriptor>) -> Option<Arc<TrustDescriptor>> {
        self.current.write().replace(descriptor)
    }

    /// Parses `input` as IdP metadata and installs it on success.
    pub fn load(
        &self,
        input: &[u8],
        options: &MetadataParseOptions,
    ) -> Result<Arc<TrustDescriptor>, MetadataError> {
        let result = parse_idp_metadata(input, options).and_then(|descriptor| {
            if descriptor.role == EntityRole::IdentityProvider {
                Ok(descriptor)
            } else {
                Err(MetadataError::WrongRole)
            }
        });
        match result {
            Ok(descriptor) => {
                let descriptor = Arc::new(descriptor);
                let previous = self.replace(descriptor.clone());
                tracing::info!(
                    entity_id = %descriptor.entity_id,
                    replaced = previous.is_some(),
                    "identity provider metadata loaded"
                );
                Ok(descriptor)
            }
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    stale = self.current.read().is_some(),
                    "metadata reload failed"
                );
                Err(e)
            }
        }
    }

    /// Fetches from `source`, then [`load`](Self::load)s.
    pub async fn reload(
        &self,
        source: &MetadataSource,
        options: &MetadataParseOptions,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Arc<TrustDescriptor>, MetadataError> {
        let bytes = fetch_metadata(source, timeout, cancel).await.map_err(|e| {
            tracing::warn!(error = %e, "metadata fetch failed");
            MetadataError::from(e)
        })?;
        self.load(&bytes, options)
    }
}
