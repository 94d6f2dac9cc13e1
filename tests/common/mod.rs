#![allow(dead_code)]

use std::sync::Arc;

use base64::{prelude::BASE64_STANDARD, Engine};
use deflate::deflate_bytes;
use http::{header, Request};
use saml2_sp::{
    ConfiguredCertificateProvider, FixedClock, LogoutRequestBuilder, LogoutResponseBuilder,
    MetadataSource, NameId, Saml2Middleware, ServiceProviderConfig, SignatureAlgorithm,
    SigningCredential, XmlSigner, DATE_TIME_FORMAT, NAME_ID_FORMAT_EMAIL_ADDRESS, STATUS_SUCCESS,
};
use time::{macros::datetime, Duration, OffsetDateTime};
use tokio_util::sync::CancellationToken;

pub const NOW: OffsetDateTime = datetime!(2025-01-08 16:31:18 UTC);
pub const SP: &str = "https://sp.example.org";
pub const ACS: &str = "https://sp.example.org/saml2/acs";
pub const SIGN_OUT: &str = "https://sp.example.org/saml2/logout";
pub const IDP: &str = "https://idp.example.org/metadata";

pub const IDP_METADATA: &[u8] = include_bytes!("../../static/idp_metadata.xml");
const IDP_KEY: &[u8] = include_bytes!("../../static/idp.key");
const IDP_CERT: &[u8] = include_bytes!("../../static/idp.cert");
const ROLLOVER_KEY: &[u8] = include_bytes!("../../static/idp_rollover.key");
const ROLLOVER_CERT: &[u8] = include_bytes!("../../static/idp_rollover.cert");
const SP_KEY: &[u8] = include_bytes!("../../static/sp.key");
const SP_CERT: &[u8] = include_bytes!("../../static/sp.cert");

pub fn signer(key: &[u8], cert: &[u8]) -> XmlSigner {
    XmlSigner::new(
        SigningCredential::from_pem(key, cert).unwrap(),
        SignatureAlgorithm::RsaSha256,
    )
}

pub fn config() -> ServiceProviderConfig {
    ServiceProviderConfig::builder(SP, ACS, SIGN_OUT).build().unwrap()
}

pub struct TestSp {
    pub sp: Saml2Middleware,
    pub clock: Arc<FixedClock>,
}

/// A service provider with the test IdP's metadata already loaded.
pub async fn service_provider(config: ServiceProviderConfig) -> TestSp {
    service_provider_with_metadata(config, IDP_METADATA).await
}

pub async fn service_provider_with_metadata(
    config: ServiceProviderConfig,
    metadata: &[u8],
) -> TestSp {
    let clock = Arc::new(FixedClock::new(NOW));
    let certificates = Arc::new(ConfiguredCertificateProvider::from_config(&config).unwrap());
    let sp = Saml2Middleware::with_clock(config, certificates, clock.clone()).unwrap();
    sp.load_idp_metadata(
        &MetadataSource::Bytes(metadata.to_vec()),
        &CancellationToken::new(),
    )
    .await
    .unwrap();
    TestSp { sp, clock }
}

fn instant(t: OffsetDateTime) -> String {
    t.format(&DATE_TIME_FORMAT).unwrap()
}

/// Shape of the next response the simulated IdP will issue.
#[derive(Debug, Clone)]
pub struct Issue {
    pub response_id: String,
    pub assertion_id: String,
    pub in_response_to: Option<String>,
    pub subject: String,
    pub status: String,
    pub sub_status: Option<String>,
    pub destination: String,
    pub audience: String,
    pub not_on_or_after: OffsetDateTime,
    pub with_assertion: bool,
}

impl Issue {
    pub fn answering(request_id: &str) -> Self {
        Self {
            response_id: "_response".into(),
            assertion_id: "_assertion".into(),
            in_response_to: Some(request_id.into()),
            subject: "alice@example.org".into(),
            status: STATUS_SUCCESS.into(),
            sub_status: None,
            destination: ACS.into(),
            audience: SP.into(),
            not_on_or_after: NOW + Duration::minutes(5),
            with_assertion: true,
        }
    }

    pub fn unsolicited() -> Self {
        Self {
            in_response_to: None,
            ..Self::answering("")
        }
    }

    pub fn assertion_xml(&self) -> String {
        let in_response_to = self
            .in_response_to
            .as_ref()
            .map(|id| format!(r#" InResponseTo="{id}""#))
            .unwrap_or_default();
        format!(
            concat!(
                r#"<saml:Assertion ID="{id}" Version="2.0" IssueInstant="{now}">"#,
                r#"<saml:Issuer>{idp}</saml:Issuer>"#,
                r#"<saml:Subject><saml:NameID Format="{format}">{subject}</saml:NameID>"#,
                r#"<saml:SubjectConfirmation Method="urn:oasis:names:tc:SAML:2.0:cm:bearer">"#,
                r#"<saml:SubjectConfirmationData{irt} NotOnOrAfter="{noa}" Recipient="{acs}"/>"#,
                r#"</saml:SubjectConfirmation></saml:Subject>"#,
                r#"<saml:Conditions NotBefore="{nb}" NotOnOrAfter="{noa}">"#,
                r#"<saml:AudienceRestriction><saml:Audience>{aud}</saml:Audience></saml:AudienceRestriction>"#,
                r#"</saml:Conditions>"#,
                r#"<saml:AuthnStatement AuthnInstant="{now}" SessionIndex="_idp_session" SessionNotOnOrAfter="{session_end}">"#,
                r#"<saml:AuthnContext><saml:AuthnContextClassRef>urn:oasis:names:tc:SAML:2.0:ac:classes:PasswordProtectedTransport</saml:AuthnContextClassRef></saml:AuthnContext>"#,
                r#"</saml:AuthnStatement>"#,
                r#"<saml:AttributeStatement>"#,
                r#"<saml:Attribute Name="groups"><saml:AttributeValue>staff</saml:AttributeValue><saml:AttributeValue>admins</saml:AttributeValue></saml:Attribute>"#,
                r#"</saml:AttributeStatement>"#,
                r#"</saml:Assertion>"#,
            ),
            id = self.assertion_id,
            now = instant(NOW),
            idp = IDP,
            format = NAME_ID_FORMAT_EMAIL_ADDRESS,
            subject = self.subject,
            irt = in_response_to,
            noa = instant(self.not_on_or_after),
            acs = ACS,
            nb = instant(NOW - Duration::minutes(1)),
            aud = self.audience,
            session_end = instant(NOW + Duration::minutes(30)),
        )
    }

    pub fn response_xml(&self) -> String {
        let in_response_to = self
            .in_response_to
            .as_ref()
            .map(|id| format!(r#" InResponseTo="{id}""#))
            .unwrap_or_default();
        let sub_status = self
            .sub_status
            .as_ref()
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
                r#"xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion" ID="{id}" Version="2.0" "#,
                r#"IssueInstant="{now}" Destination="{dest}"{irt}>"#,
                r#"<saml:Issuer>{idp}</saml:Issuer>"#,
                r#"<samlp:Status><samlp:StatusCode Value="{status}">{sub}</samlp:StatusCode></samlp:Status>"#,
                r#"{assertion}</samlp:Response>"#,
            ),
            id = self.response_id,
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

/// Signs and delivers messages the way the test IdP would.
pub struct IdentityProvider {
    pub signer: XmlSigner,
    pub rollover: XmlSigner,
    pub stranger: XmlSigner,
}

impl IdentityProvider {
    pub fn new() -> Self {
        Self {
            signer: signer(IDP_KEY, IDP_CERT),
            rollover: signer(ROLLOVER_KEY, ROLLOVER_CERT),
            stranger: signer(SP_KEY, SP_CERT),
        }
    }

    /// A response whose assertion carries the IdP signature.
    pub fn respond(&self, issue: &Issue) -> String {
        self.signer
            .sign(&issue.response_xml(), &issue.assertion_id)
            .unwrap()
    }

    pub fn logout_request(&self, id: &str, subject: &str) -> String {
        LogoutRequestBuilder::new()
            .id(id)
            .issue_instant(NOW)
            .not_on_or_after(NOW + Duration::minutes(5))
            .issuer(IDP)
            .destination(SIGN_OUT)
            .name_id(NameId {
                value: subject.into(),
                format: Some(NAME_ID_FORMAT_EMAIL_ADDRESS.into()),
                name_qualifier: None,
                sp_name_qualifier: None,
            })
            .session_index("_idp_session")
            .build()
            .unwrap()
    }

    pub fn logout_response(&self, id: &str, in_response_to: &str, status: &str) -> String {
        LogoutResponseBuilder::new()
            .id(id)
            .issue_instant(NOW)
            .issuer(IDP)
            .destination(SIGN_OUT)
            .in_response_to(in_response_to)
            .status(status)
            .build()
            .unwrap()
    }

    /// Query string for an HTTP-Redirect delivery signed with this IdP's key.
    pub fn redirect_query(&self, parameter: &str, xml: &str, relay_state: Option<&str>) -> String {
        let encoded = BASE64_STANDARD.encode(deflate_bytes(xml.as_bytes()));
        let mut query = format!("{parameter}={}", urlencoding::encode(&encoded));
        if let Some(rs) = relay_state {
            query.push_str(&format!("&RelayState={}", urlencoding::encode(rs)));
        }
        query.push_str(&format!(
            "&SigAlg={}",
            urlencoding::encode(self.signer.algorithm().uri())
        ));
        let signature = self.signer.sign_query(&query).unwrap();
        query.push_str(&format!("&Signature={}", urlencoding::encode(&signature)));
        query
    }
}

/// An HTTP-POST form submission to `uri`.
pub fn post_form(uri: &str, fields: &[(&str, &str)]) -> Request<Vec<u8>> {
    let body = url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(fields)
        .finish();
    Request::post(uri)
        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(body.into_bytes())
        .unwrap()
}

pub fn post_response(xml: &str, relay_state: Option<&str>) -> Request<Vec<u8>> {
    let encoded = BASE64_STANDARD.encode(xml);
    let mut fields = vec![("SAMLResponse", encoded.as_str())];
    if let Some(rs) = relay_state {
        fields.push(("RelayState", rs));
    }
    post_form(ACS, &fields)
}

/// Pulls the `ID` attribute off the root element of `xml`.
pub fn root_id(xml: &str) -> String {
    let start = xml.find(" ID=\"").unwrap() + " ID=\"".len();
    let end = xml[start..].find('"').unwrap();
    xml[start..start + end].to_string()
}
