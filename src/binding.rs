//! HTTP-Redirect and HTTP-POST bindings.

use std::io::Read;

use base64::{prelude::BASE64_STANDARD, Engine};
use deflate::deflate_bytes;
use flate2::read::DeflateDecoder;
use http::{header, Response, StatusCode};

use crate::{
    authn_request::ProtocolBinding, error::Error, signature::XmlSigner, utils::decode_xml_base64,
};

pub(crate) const SAML_REQUEST: &str = "SAMLRequest";
pub(crate) const SAML_RESPONSE: &str = "SAMLResponse";
pub(crate) const RELAY_STATE: &str = "RelayState";
pub(crate) const SIG_ALG: &str = "SigAlg";
pub(crate) const SIGNATURE: &str = "Signature";

/// What the browser has to do to deliver a message to the other party.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundMessage {
    Redirect { location: String },
    Post(PostForm),
}

impl OutboundMessage {
    pub fn into_http_response(self) -> Result<Response<String>, Error> {
        let response = match self {
            OutboundMessage::Redirect { location } => Response::builder()
                .status(StatusCode::FOUND)
                .header(header::LOCATION, location)
                .header(header::CACHE_CONTROL, "no-cache, no-store")
                .body(String::new())?,
            OutboundMessage::Post(form) => Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, "text/html; charset=utf-8")
                .header(header::CACHE_CONTROL, "no-cache, no-store")
                .body(form.render_html())?,
        };
        Ok(response)
    }
}

/// An auto-submitting form carrying a base64 encoded protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostForm {
    pub action: String,
    pub parameter: &'static str,
    pub value: String,
    pub relay_state: Option<String>,
}

impl PostForm {
    pub(crate) fn new(
        action: &str,
        parameter: &'static str,
        xml: &str,
        relay_state: Option<&str>,
    ) -> Self {
        Self {
            action: action.into(),
            parameter,
            value: BASE64_STANDARD.encode(xml),
            relay_state: relay_state.map(String::from),
        }
    }

    pub fn render_html(&self) -> String {
        let relay_state_input = self
            .relay_state
            .as_deref()
            .map(|rs| {
                format!(
                    r#"<input type="hidden" name="{RELAY_STATE}" value="{}"/>"#,
                    html_escape(rs)
                )
            })
            .unwrap_or_default();

        format!(
            r#"<!DOCTYPE html>
<html>
<head>
    <meta charset="UTF-8">
    <title>Continue</title>
</head>
<body onload="document.forms[0].submit()">
    <noscript>
        <p>JavaScript is disabled. Click the button below to continue.</p>
    </noscript>
    <form method="post" action="{}">
        <input type="hidden" name="{}" value="{}"/>
        {}
        <noscript>
            <input type="submit" value="Continue"/>
        </noscript>
    </form>
</body>
</html>"#,
            html_escape(&self.action),
            self.parameter,
            html_escape(&self.value),
            relay_state_input
        )
    }
}

fn html_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            c => out.push(c),
        }
    }
    out
}

/// Builds the redirect URL for a deflated message, signing the query when a
/// signer is supplied.
pub(crate) fn redirect_location(
    destination: &str,
    parameter: &str,
    xml: &str,
    relay_state: Option<&str>,
    signer: Option<&XmlSigner>,
) -> Result<String, Error> {
    let encoded = BASE64_STANDARD.encode(deflate_bytes(xml.as_bytes()));
    let mut query = format!("{parameter}={}", urlencoding::encode(&encoded));
    if let Some(rs) = relay_state {
        query.push_str(&format!("&{RELAY_STATE}={}", urlencoding::encode(rs)));
    }
    if let Some(signer) = signer {
        query.push_str(&format!(
            "&{SIG_ALG}={}",
            urlencoding::encode(signer.algorithm().uri())
        ));
        let signature = signer.sign_query(&query)?;
        query.push_str(&format!("&{SIGNATURE}={}", urlencoding::encode(&signature)));
    }

    let separator = if destination.contains('?') { '&' } else { '?' };
    Ok(format!("{destination}{separator}{query}"))
}

/// Inflates a redirect-binding payload that has already been percent-decoded.
///
/// Output is capped at `max_size` bytes.
pub fn decode_redirect_payload(value: &str, max_size: usize) -> Result<Vec<u8>, String> {
    let compressed = decode_xml_base64(value).map_err(|e| format!("invalid base64: {e}"))?;
    let mut decoder = DeflateDecoder::new(compressed.as_slice()).take(max_size as u64 + 1);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| format!("invalid deflate stream: {e}"))?;
    if out.len() > max_size {
        return Err(format!("inflated message exceeds {max_size} bytes"));
    }
    Ok(out)
}

/// A query string split into raw (still percent-encoded) pairs.
///
/// Redirect-binding signatures cover the octets as sent, so they have to be
/// checked against the raw values rather than re-encoded ones.
#[derive(Debug, Clone)]
pub struct RawQuery<'a> {
    pairs: Vec<(&'a str, &'a str)>,
}

impl<'a> RawQuery<'a> {
    /// Fails when a protocol parameter appears more than once.
    pub fn parse(query: &'a str) -> Result<Self, String> {
        let pairs: Vec<_> = query
            .split('&')
            .filter(|pair| !pair.is_empty())
            .map(|pair| pair.split_once('=').unwrap_or((pair, "")))
            .collect();
        for name in [SAML_REQUEST, SAML_RESPONSE, RELAY_STATE, SIG_ALG, SIGNATURE] {
            if pairs.iter().filter(|(key, _)| *key == name).count() > 1 {
                return Err(format!("duplicate {name} parameter"));
            }
        }
        Ok(Self { pairs })
    }

    pub fn raw(&self, name: &str) -> Option<&'a str> {
        self.pairs
            .iter()
            .find(|(key, _)| *key == name)
            .map(|(_, value)| *value)
    }

    pub fn decoded(&self, name: &str) -> Option<String> {
        let raw = self.raw(name)?;
        urlencoding::decode(raw).ok().map(|v| v.into_owned())
    }

    /// `SAMLxxx=..[&RelayState=..]&SigAlg=..` as received, if signed.
    pub fn signed_octets(&self, parameter: &str) -> Option<String> {
        let mut octets = format!("{parameter}={}", self.raw(parameter)?);
        if let Some(relay_state) = self.raw(RELAY_STATE) {
            octets.push_str(&format!("&{RELAY_STATE}={relay_state}"));
        }
        octets.push_str(&format!("&{SIG_ALG}={}", self.raw(SIG_ALG)?));
        Some(octets)
    }
}

/// Redirect-binding signature parameters and the octets they cover.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuerySignature {
    pub signed_octets: String,
    pub sig_alg: String,
    pub signature: String,
}

/// A protocol message delivered by the browser, decoded from its binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub binding: ProtocolBinding,
    /// `SAMLRequest` or `SAMLResponse`.
    pub parameter: &'static str,
    pub xml: Vec<u8>,
    pub relay_state: Option<String>,
    pub query_signature: Option<QuerySignature>,
}

impl InboundMessage {
    /// Decodes an HTTP-Redirect query carrying one of `accepted`.
    pub fn from_query(
        query: &str,
        accepted: &[&'static str],
        max_size: usize,
    ) -> Result<Self, String> {
        let query = RawQuery::parse(query)?;
        let parameter = single_parameter(accepted, |name| query.raw(name).is_some())?;
        let value = query
            .decoded(parameter)
            .ok_or_else(|| format!("{parameter} is not valid percent-encoding"))?;
        let xml = decode_redirect_payload(&value, max_size)?;

        let query_signature = match query.decoded(SIGNATURE) {
            Some(signature) => Some(QuerySignature {
                signed_octets: query
                    .signed_octets(parameter)
                    .ok_or_else(|| format!("{SIGNATURE} without {SIG_ALG}"))?,
                sig_alg: query
                    .decoded(SIG_ALG)
                    .ok_or_else(|| format!("{SIGNATURE} without {SIG_ALG}"))?,
                signature,
            }),
            None => None,
        };
        Ok(Self {
            binding: ProtocolBinding::Redirect,
            parameter,
            xml,
            relay_state: query.decoded(RELAY_STATE),
            query_signature,
        })
    }

    /// Decodes an `application/x-www-form-urlencoded` HTTP-POST body.
    pub fn from_form(
        body: &[u8],
        accepted: &[&'static str],
        max_size: usize,
    ) -> Result<Self, String> {
        // base64 inflates by a third; anything far beyond that cannot decode small enough
        if body.len() > max_size.saturating_mul(2) {
            return Err(format!("form body exceeds {max_size} bytes"));
        }
        let fields: Vec<(String, String)> =
            url::form_urlencoded::parse(body).into_owned().collect();
        let mut present = Vec::new();
        for name in accepted {
            if form_field(&fields, name)?.is_some() {
                present.push(*name);
            }
        }
        let parameter = single_parameter(&present, |_| true)?;
        let value = form_field(&fields, parameter)?.unwrap_or_default();
        let xml = decode_xml_base64(value).map_err(|e| format!("invalid base64: {e}"))?;
        if xml.len() > max_size {
            return Err(format!("message exceeds {max_size} bytes"));
        }
        Ok(Self {
            binding: ProtocolBinding::Post,
            parameter,
            xml,
            relay_state: form_field(&fields, RELAY_STATE)?.map(String::from),
            query_signature: None,
        })
    }
}

fn form_field<'a>(fields: &'a [(String, String)], name: &str) -> Result<Option<&'a str>, String> {
    let mut values = fields.iter().filter(|(key, _)| key == name);
    let first = values.next().map(|(_, value)| value.as_str());
    if values.next().is_some() {
        return Err(format!("duplicate {name} field"));
    }
    Ok(first)
}

fn single_parameter(
    accepted: &[&'static str],
    present: impl Fn(&str) -> bool,
) -> Result<&'static str, String> {
    let mut found = accepted.iter().copied().filter(|name| present(name));
    match (found.next(), found.next()) {
        (Some(name), None) => Ok(name),
        (None, _) => Err("no SAML message in request".into()),
        (Some(_), Some(_)) => Err("more than one SAML message in request".into()),
    }
}
