mod common;

use base64::{prelude::BASE64_STANDARD, Engine};
use common::*;
use http::{header, Request, StatusCode};
use saml2_sp::{
    decode_redirect_payload, AuthenticationTicket, LogoutCompletion, RawQuery, SigningKeySource,
    ServiceProviderConfig, ValidationError, STATUS_PARTIAL_LOGOUT, STATUS_SUCCESS,
};

fn signed_in(sp: &TestSp) -> AuthenticationTicket {
    let response = sp.sp.challenge("/dashboard").unwrap();
    let location = response.headers()[header::LOCATION].to_str().unwrap();
    let query = RawQuery::parse(location.split_once('?').unwrap().1).unwrap();
    let xml = decode_redirect_payload(&query.decoded("SAMLRequest").unwrap(), 64 * 1024).unwrap();
    let request_id = root_id(&String::from_utf8(xml).unwrap());

    let xml = IdentityProvider::new().respond(&Issue::answering(&request_id));
    sp.sp.handle_callback(&post_response(&xml, None)).unwrap()
}

/// Decodes the message carried by a redirect response, plus the raw query.
fn redirected(response: &http::Response<String>, parameter: &str) -> (String, String, String) {
    assert_eq!(response.status(), StatusCode::FOUND);
    let location = response.headers()[header::LOCATION].to_str().unwrap();
    let (endpoint, query) = location.split_once('?').unwrap();
    let parsed = RawQuery::parse(query).unwrap();
    let xml = decode_redirect_payload(&parsed.decoded(parameter).unwrap(), 64 * 1024).unwrap();
    (
        endpoint.to_string(),
        query.to_string(),
        String::from_utf8(xml).unwrap(),
    )
}

fn get(query: &str) -> Request<Vec<u8>> {
    Request::get(format!("{SIGN_OUT}?{query}")).body(Vec::new()).unwrap()
}

#[tokio::test]
async fn sp_initiated_logout_round_trip() {
    let sp = service_provider(config()).await;
    let idp = IdentityProvider::new();
    let ticket = signed_in(&sp);

    let (endpoint, _, request_xml) =
        redirected(&sp.sp.sign_out(&ticket, "/goodbye").unwrap(), "SAMLRequest");
    assert_eq!(endpoint, "https://idp.example.org/slo");
    assert!(request_xml.contains("alice@example.org"));
    assert!(request_xml.contains("_idp_session"));
    assert_eq!(sp.sp.pending_requests().len(), 1);

    let request_id = root_id(&request_xml);
    let response = idp.logout_response("_logout_response", &request_id, STATUS_SUCCESS);
    let query = idp.redirect_query("SAMLResponse", &response, None);
    assert_eq!(
        sp.sp.handle_logout_callback(&get(&query)).unwrap(),
        LogoutCompletion::Confirmed {
            return_url: Some("/goodbye".into())
        }
    );

    assert_eq!(
        sp.sp.handle_logout_callback(&get(&query)).unwrap_err(),
        ValidationError::UnsolicitedResponse
    );
}

#[tokio::test]
async fn partial_logout_is_reported() {
    let sp = service_provider(config()).await;
    let idp = IdentityProvider::new();
    let ticket = signed_in(&sp);

    let (_, _, request_xml) = redirected(&sp.sp.sign_out(&ticket, "/").unwrap(), "SAMLRequest");
    let response = idp.logout_response("_partial", &root_id(&request_xml), STATUS_PARTIAL_LOGOUT);
    let err = sp
        .sp
        .handle_logout_callback(&get(&idp.redirect_query("SAMLResponse", &response, None)))
        .unwrap_err();
    assert!(matches!(err, ValidationError::IdpReportedFailure { .. }));
}

#[tokio::test]
async fn idp_initiated_logout_is_answered() {
    let sp = service_provider(config()).await;
    let idp = IdentityProvider::new();

    let request = idp.logout_request("_idp_logout", "alice@example.org");
    let query = idp.redirect_query("SAMLRequest", &request, Some("rs-1"));
    let LogoutCompletion::Requested {
        request,
        relay_state,
    } = sp.sp.handle_logout_callback(&get(&query)).unwrap()
    else {
        panic!("expected a logout request");
    };
    assert_eq!(request.id, "_idp_logout");
    assert_eq!(request.name_id.value, "alice@example.org");
    assert_eq!(request.session_indexes, ["_idp_session"]);
    assert_eq!(relay_state.as_deref(), Some("rs-1"));

    let answer = sp
        .sp
        .answer_logout_request(&request, relay_state.as_deref())
        .unwrap();
    let (endpoint, raw_query, xml) = redirected(&answer, "SAMLResponse");
    assert_eq!(endpoint, "https://idp.example.org/slo");
    assert!(raw_query.contains("RelayState=rs-1"));
    assert!(xml.contains(r#"InResponseTo="_idp_logout""#));
    assert!(xml.contains(STATUS_SUCCESS));
}

#[tokio::test]
async fn idp_initiated_logout_over_post() {
    let sp = service_provider(config()).await;
    let idp = IdentityProvider::new();

    let request = idp.logout_request("_idp_post", "alice@example.org");
    let unsigned = post_form(
        SIGN_OUT,
        &[("SAMLRequest", BASE64_STANDARD.encode(&request).as_str())],
    );
    assert_eq!(
        sp.sp.handle_logout_callback(&unsigned).unwrap_err(),
        ValidationError::UnsignedResponse
    );

    let signed = idp.signer.sign(&request, "_idp_post").unwrap();
    let form = post_form(
        SIGN_OUT,
        &[("SAMLRequest", BASE64_STANDARD.encode(&signed).as_str())],
    );
    assert!(matches!(
        sp.sp.handle_logout_callback(&form).unwrap(),
        LogoutCompletion::Requested { relay_state: None, .. }
    ));
}

#[tokio::test]
async fn forged_logout_requests_are_rejected() {
    let sp = service_provider(config()).await;
    let idp = IdentityProvider::new();

    let request = idp.logout_request("_forged", "alice@example.org");
    let query = idp
        .redirect_query("SAMLRequest", &request, Some("rs-1"))
        .replace("RelayState=rs-1", "RelayState=rs-2");
    assert_eq!(
        sp.sp.handle_logout_callback(&get(&query)).unwrap_err(),
        ValidationError::InvalidSignature
    );

    let by_stranger = idp.stranger.sign(&request, "_forged").unwrap();
    let form = post_form(
        SIGN_OUT,
        &[("SAMLRequest", BASE64_STANDARD.encode(&by_stranger).as_str())],
    );
    assert_eq!(
        sp.sp.handle_logout_callback(&form).unwrap_err(),
        ValidationError::InvalidSignature
    );

    let ambiguous = get(&format!(
        "{}&{}",
        idp.redirect_query("SAMLRequest", &request, None),
        "SAMLResponse=abc"
    ));
    assert!(matches!(
        sp.sp.handle_logout_callback(&ambiguous).unwrap_err(),
        ValidationError::MalformedResponse(_)
    ));
}

#[tokio::test]
async fn signing_sp_signs_outbound_logout() {
    let dir = env!("CARGO_MANIFEST_DIR");
    let config = ServiceProviderConfig::builder(SP, ACS, SIGN_OUT)
        .require_message_signed(true)
        .signing_key(SigningKeySource::PemFiles {
            key_path: format!("{dir}/static/sp.key").into(),
            certificate_path: format!("{dir}/static/sp.cert").into(),
        })
        .build()
        .unwrap();
    let sp = service_provider(config).await;
    assert!(sp.sp.sp_metadata().contains("KeyDescriptor"));

    let ticket = signed_in(&sp);
    let (_, query, _) = redirected(&sp.sp.sign_out(&ticket, "/").unwrap(), "SAMLRequest");
    assert!(query.contains("SigAlg="));
    assert!(query.contains("&Signature="));
}
