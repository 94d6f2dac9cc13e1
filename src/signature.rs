//! XML-DSig signing and verification.
//!
//! Enveloped signatures are produced and checked by xmlsec. Before xmlsec is
//! asked to verify anything, the structure around each `ds:Signature` is
//! checked so that the element a signature covers is exactly the element
//! whose content is later consumed.

use std::collections::HashSet;

use base64::{prelude::BASE64_STANDARD, Engine};
use libxml::{
    parser::Parser as XmlParser,
    tree::{Document, Node},
};
use openssl::{hash::MessageDigest, sign::Signer, sign::Verifier};
use serde::Deserialize;
use xmlsec::{XmlSecDocumentExt as _, XmlSecKey, XmlSecKeyFormat, XmlSecSignatureContext};

use crate::{
    certificate::{Certificate, SigningCredential},
    error::{Error, ValidationError},
    utils::{child_elements, descendants, is_element, single_child, xpath_context},
    NS_ASSERTION, NS_METADATA, NS_PROTOCOL, NS_XMLDSIG,
};

const C14N_EXCLUSIVE: &str = "http://www.w3.org/2001/10/xml-exc-c14n#";
const C14N_INCLUSIVE: &str = "http://www.w3.org/TR/2001/REC-xml-c14n-20010315";
const TRANSFORM_ENVELOPED: &str = "http://www.w3.org/2000/09/xmldsig#enveloped-signature";

const ALLOWED_TRANSFORMS: [&str; 3] = [TRANSFORM_ENVELOPED, C14N_EXCLUSIVE, C14N_INCLUSIVE];
const ALLOWED_CANONICALIZATIONS: [&str; 2] = [C14N_EXCLUSIVE, C14N_INCLUSIVE];

// Elements whose ID attribute a signature reference may point at.
const ID_BEARERS: [&str; 7] = [
    "//samlp:Response",
    "//saml:Assertion",
    "//samlp:AuthnRequest",
    "//samlp:LogoutRequest",
    "//samlp:LogoutResponse",
    "//md:EntityDescriptor",
    "//md:EntitiesDescriptor",
];

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
pub enum SignatureAlgorithm {
    #[serde(rename = "rsa-sha1")]
    RsaSha1,
    #[default]
    #[serde(rename = "rsa-sha256")]
    RsaSha256,
    #[serde(rename = "rsa-sha384")]
    RsaSha384,
    #[serde(rename = "rsa-sha512")]
    RsaSha512,
}

impl SignatureAlgorithm {
    pub fn uri(&self) -> &'static str {
        match self {
            SignatureAlgorithm::RsaSha1 => "http://www.w3.org/2000/09/xmldsig#rsa-sha1",
            SignatureAlgorithm::RsaSha256 => "http://www.w3.org/2001/04/xmldsig-more#rsa-sha256",
            SignatureAlgorithm::RsaSha384 => "http://www.w3.org/2001/04/xmldsig-more#rsa-sha384",
            SignatureAlgorithm::RsaSha512 => "http://www.w3.org/2001/04/xmldsig-more#rsa-sha512",
        }
    }

    pub fn digest_uri(&self) -> &'static str {
        match self {
            SignatureAlgorithm::RsaSha1 => "http://www.w3.org/2000/09/xmldsig#sha1",
            SignatureAlgorithm::RsaSha256 => "http://www.w3.org/2001/04/xmlenc#sha256",
            SignatureAlgorithm::RsaSha384 => "http://www.w3.org/2001/04/xmldsig-more#sha384",
            SignatureAlgorithm::RsaSha512 => "http://www.w3.org/2001/04/xmlenc#sha512",
        }
    }

    pub fn from_uri(uri: &str) -> Option<Self> {
        [
            SignatureAlgorithm::RsaSha1,
            SignatureAlgorithm::RsaSha256,
            SignatureAlgorithm::RsaSha384,
            SignatureAlgorithm::RsaSha512,
        ]
        .into_iter()
        .find(|alg| alg.uri() == uri)
    }

    fn message_digest(&self) -> MessageDigest {
        match self {
            SignatureAlgorithm::RsaSha1 => MessageDigest::sha1(),
            SignatureAlgorithm::RsaSha256 => MessageDigest::sha256(),
            SignatureAlgorithm::RsaSha384 => MessageDigest::sha384(),
            SignatureAlgorithm::RsaSha512 => MessageDigest::sha512(),
        }
    }
}

/// Produces enveloped signatures and redirect-binding query signatures.
#[derive(Debug, Clone)]
pub struct XmlSigner {
    credential: SigningCredential,
    algorithm: SignatureAlgorithm,
}

impl XmlSigner {
    pub fn new(credential: SigningCredential, algorithm: SignatureAlgorithm) -> Self {
        Self {
            credential,
            algorithm,
        }
    }

    pub fn algorithm(&self) -> SignatureAlgorithm {
        self.algorithm
    }

    pub fn certificate(&self) -> &Certificate {
        self.credential.certificate()
    }

    /// Signs the element carrying `ID="reference_id"`.
    ///
    /// The signature is placed right after the element's `Issuer`, or as its
    /// first child when it has none.
    pub fn sign(&self, xml: &str, reference_id: &str) -> Result<String, Error> {
        let templated = insert_template(xml, reference_id, &self.template(reference_id))?;

        let document = XmlParser::default()
            .parse_string(&templated)
            .map_err(|e| Error::Xml(format!("{e:?}")))?;
        register_ids(&document).map_err(Error::Signing)?;
        let root = document
            .get_root_element()
            .ok_or_else(|| Error::Xml("empty document".into()))?;
        let target = descendants(&root)
            .into_iter()
            .find(|node| node.get_attribute("ID").as_deref() == Some(reference_id))
            .ok_or_else(|| Error::Signing(format!("no element with ID {reference_id}")))?;
        let signature_node =
            single_child(&target, NS_XMLDSIG, "Signature").map_err(Error::Signing)?;

        let key_pem = self.credential.private_key_pem().map_err(Error::Signing)?;
        let mut key = XmlSecKey::from_memory(&key_pem, XmlSecKeyFormat::Pem, None)
            .map_err(|e| Error::Signing(format!("{e:?}")))?;
        key.load_cert_from_memory(self.credential.certificate().der(), XmlSecKeyFormat::CertDer)
            .map_err(|e| Error::Signing(format!("{e:?}")))?;

        let mut sigctx = XmlSecSignatureContext::new();
        sigctx.insert_key(key);
        sigctx
            .sign_node(&signature_node)
            .map_err(|e| Error::Signing(format!("{e:?}")))?;

        Ok(document.node_to_string(&root))
    }

    /// Base64 signature over the octets of a redirect-binding query string.
    pub fn sign_query(&self, query: &str) -> Result<String, Error> {
        let mut signer = Signer::new(self.algorithm.message_digest(), self.credential.key())
            .map_err(|e| Error::Signing(e.to_string()))?;
        signer
            .update(query.as_bytes())
            .map_err(|e| Error::Signing(e.to_string()))?;
        let signature = signer
            .sign_to_vec()
            .map_err(|e| Error::Signing(e.to_string()))?;
        Ok(BASE64_STANDARD.encode(signature))
    }

    fn template(&self, reference_id: &str) -> String {
        format!(
            concat!(
                r#"<ds:Signature xmlns:ds="{ds}"><ds:SignedInfo>"#,
                r#"<ds:CanonicalizationMethod Algorithm="{c14n}"/>"#,
                r#"<ds:SignatureMethod Algorithm="{signature}"/>"#,
                r##"<ds:Reference URI="#{id}"><ds:Transforms>"##,
                r#"<ds:Transform Algorithm="{enveloped}"/>"#,
                r#"<ds:Transform Algorithm="{c14n}"/>"#,
                r#"</ds:Transforms><ds:DigestMethod Algorithm="{digest}"/>"#,
                r#"<ds:DigestValue></ds:DigestValue></ds:Reference></ds:SignedInfo>"#,
                r#"<ds:SignatureValue></ds:SignatureValue>"#,
                r#"<ds:KeyInfo><ds:X509Data/></ds:KeyInfo></ds:Signature>"#,
            ),
            ds = NS_XMLDSIG,
            c14n = C14N_EXCLUSIVE,
            signature = self.algorithm.uri(),
            id = reference_id,
            enveloped = TRANSFORM_ENVELOPED,
            digest = self.algorithm.digest_uri(),
        )
    }
}

fn insert_template(xml: &str, reference_id: &str, template: &str) -> Result<String, Error> {
    let needle = format!("ID=\"{reference_id}\"");
    let attr_pos = xml
        .match_indices(&needle)
        .map(|(pos, _)| pos)
        .find(|&pos| pos > 0 && xml.as_bytes()[pos - 1].is_ascii_whitespace())
        .ok_or_else(|| Error::Signing(format!("no element with ID {reference_id}")))?;
    let tag_end = xml[attr_pos..]
        .find('>')
        .map(|offset| attr_pos + offset)
        .ok_or_else(|| Error::Xml("unterminated start tag".into()))?;
    if xml.as_bytes()[tag_end - 1] == b'/' {
        return Err(Error::Signing("cannot sign an empty element".into()));
    }
    let mut insert_at = tag_end + 1;

    let rest = &xml[insert_at..];
    let leading = rest.len() - rest.trim_start().len();
    let child = &rest[leading..];
    if let Some(stripped) = child.strip_prefix('<') {
        let name_len = stripped
            .find(|c: char| c.is_whitespace() || c == '>' || c == '/')
            .unwrap_or(stripped.len());
        let name = &stripped[..name_len];
        if name == "Issuer" || name.ends_with(":Issuer") {
            let child_start = insert_at + leading;
            let close = format!("</{name}>");
            let issuer_end = xml[child_start..]
                .find(&close)
                .map(|offset| child_start + offset + close.len())
                .or_else(|| {
                    xml[child_start..]
                        .find("/>")
                        .map(|offset| child_start + offset + 2)
                })
                .ok_or_else(|| Error::Xml("unterminated Issuer".into()))?;
            insert_at = issuer_end;
        }
    }

    let mut out = String::with_capacity(xml.len() + template.len());
    out.push_str(&xml[..insert_at]);
    out.push_str(template);
    out.push_str(&xml[insert_at..]);
    Ok(out)
}

/// Declares `ID` as the identifier attribute of every SAML element that can be
/// the target of a signature reference.
pub(crate) fn register_ids(document: &Document) -> Result<(), String> {
    let context = xpath_context(document)?;
    let namespaces = [
        ("samlp", NS_PROTOCOL),
        ("saml", NS_ASSERTION),
        ("md", NS_METADATA),
    ];
    for search in ID_BEARERS {
        let present = context
            .findnodes(search, None)
            .map(|nodes| !nodes.is_empty())
            .unwrap_or(false);
        if present {
            document
                .specify_idattr(search, "ID", Some(&namespaces))
                .map_err(|e| format!("{e:?}"))?;
        }
    }
    Ok(())
}

/// Rejects documents in which two elements share an `ID` value.
pub(crate) fn ensure_unique_ids(root: &Node) -> Result<(), ValidationError> {
    let mut seen = HashSet::new();
    for node in descendants(root) {
        if let Some(id) = node.get_attribute("ID") {
            if !seen.insert(id) {
                return Err(ValidationError::InvalidSignature);
            }
        }
    }
    Ok(())
}

/// Every `ds:Signature` element in the tree below `root`.
pub(crate) fn all_signatures(root: &Node) -> Vec<Node> {
    descendants(root)
        .into_iter()
        .filter(|node| is_element(node, NS_XMLDSIG, "Signature"))
        .collect()
}

/// Checks the enveloped signature that is a direct child of `element`.
///
/// Returns `Ok(false)` when the element carries no signature and `Ok(true)`
/// when the signature covers exactly `element` and verifies with one of
/// `certificates`.
pub(crate) fn verify_enveloped(
    element: &Node,
    certificates: &[Certificate],
) -> Result<bool, ValidationError> {
    let mut signatures = child_elements(element, NS_XMLDSIG, "Signature");
    let signature = match signatures.len() {
        0 => return Ok(false),
        1 => signatures.remove(0),
        _ => return Err(ValidationError::InvalidSignature),
    };

    check_signature_structure(element, &signature)?;

    for certificate in certificates {
        let key = match XmlSecKey::from_memory(certificate.der(), XmlSecKeyFormat::CertDer, None) {
            Ok(key) => key,
            Err(e) => {
                tracing::debug!(error = ?e, "unusable trust certificate");
                continue;
            }
        };
        let mut sigctx = XmlSecSignatureContext::new();
        sigctx.insert_key(key);
        match sigctx.verify_node(&signature) {
            Ok(true) => return Ok(true),
            Ok(false) => {}
            Err(e) => tracing::debug!(error = ?e, "signature verification error"),
        }
    }
    Err(ValidationError::InvalidSignature)
}

fn check_signature_structure(element: &Node, signature: &Node) -> Result<(), ValidationError> {
    let invalid = |_| ValidationError::InvalidSignature;
    let id = element
        .get_attribute("ID")
        .filter(|id| !id.is_empty())
        .ok_or(ValidationError::InvalidSignature)?;

    let signed_info = single_child(signature, NS_XMLDSIG, "SignedInfo").map_err(invalid)?;
    let c14n = single_child(&signed_info, NS_XMLDSIG, "CanonicalizationMethod").map_err(invalid)?;
    let c14n_algorithm = c14n.get_attribute("Algorithm").unwrap_or_default();
    if !ALLOWED_CANONICALIZATIONS.contains(&c14n_algorithm.as_str()) {
        return Err(ValidationError::InvalidSignature);
    }
    let method = single_child(&signed_info, NS_XMLDSIG, "SignatureMethod").map_err(invalid)?;
    let method_algorithm = method.get_attribute("Algorithm").unwrap_or_default();
    if SignatureAlgorithm::from_uri(&method_algorithm).is_none() {
        return Err(ValidationError::InvalidSignature);
    }

    let reference = single_child(&signed_info, NS_XMLDSIG, "Reference").map_err(invalid)?;
    if reference.get_attribute("URI").as_deref() != Some(format!("#{id}").as_str()) {
        return Err(ValidationError::InvalidSignature);
    }
    if let Some(transforms) = child_elements(&reference, NS_XMLDSIG, "Transforms").first() {
        for transform in child_elements(transforms, NS_XMLDSIG, "Transform") {
            let algorithm = transform.get_attribute("Algorithm").unwrap_or_default();
            if !ALLOWED_TRANSFORMS.contains(&algorithm.as_str()) {
                return Err(ValidationError::InvalidSignature);
            }
        }
    }
    Ok(())
}

/// Verifies a redirect-binding signature against any of `certificates`.
///
/// `signed_octets` is `SAMLRequest=..[&RelayState=..]&SigAlg=..` exactly as
/// received on the wire.
pub(crate) fn verify_query(
    signed_octets: &str,
    sig_alg: &str,
    signature: &str,
    certificates: &[Certificate],
) -> bool {
    let Some(algorithm) = SignatureAlgorithm::from_uri(sig_alg) else {
        return false;
    };
    let Ok(signature) = BASE64_STANDARD.decode(signature.replace([' ', '\n', '\r'], "")) else {
        return false;
    };

    certificates.iter().any(|certificate| {
        let Some(public_key) = certificate.x509().and_then(|x| x.public_key().ok()) else {
            return false;
        };
        Verifier::new(algorithm.message_digest(), &public_key)
            .and_then(|mut verifier| {
                verifier.update(signed_octets.as_bytes())?;
                verifier.verify(&signature)
            })
            .unwrap_or(false)
    })
}
