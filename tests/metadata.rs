mod common;

use std::sync::Arc;

use common::*;
use saml2_sp::{
    parse_idp_metadata, ConfiguredCertificateProvider, EntityRole, Error, FixedClock,
    MetadataConfig, MetadataError, MetadataParseOptions, MetadataSource, ProtocolBinding,
    Saml2Middleware, ServiceProviderConfig, TransportError,
};
use tokio_util::sync::CancellationToken;
use wiremock::{
    matchers::{method, path},
    Mock, MockServer, ResponseTemplate,
};

fn middleware(config: ServiceProviderConfig) -> Saml2Middleware {
    let certificates = Arc::new(ConfiguredCertificateProvider::from_config(&config).unwrap());
    Saml2Middleware::with_clock(config, certificates, Arc::new(FixedClock::new(NOW))).unwrap()
}

#[tokio::test]
async fn configured_address_is_fetched() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/saml/metadata"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(IDP_METADATA))
        .expect(1)
        .mount(&server)
        .await;

    let sp = middleware(
        ServiceProviderConfig::builder(SP, ACS, SIGN_OUT)
            .metadata_address(&format!("{}/saml/metadata", server.uri()))
            .build()
            .unwrap(),
    );
    let trust = sp
        .load_configured_idp_metadata(&CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(trust.entity_id, IDP);
    assert_eq!(sp.trust_store().current().unwrap().entity_id, IDP);
}

#[tokio::test]
async fn failed_reload_keeps_previous_snapshot() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/metadata"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let sp = middleware(config());
    sp.load_idp_metadata(
        &MetadataSource::Bytes(IDP_METADATA.to_vec()),
        &CancellationToken::new(),
    )
    .await
    .unwrap();

    let source = MetadataSource::from_address(&format!("{}/metadata", server.uri())).unwrap();
    let err = sp
        .load_idp_metadata(&source, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        MetadataError::Transport(TransportError::Status(503))
    ));
    assert_eq!(sp.trust_store().current().unwrap().entity_id, IDP);

    let garbage = sp
        .load_idp_metadata(
            &MetadataSource::Bytes(b"<html/>".to_vec()),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(garbage, MetadataError::MalformedMetadata(_)));
    assert!(sp.trust_store().current().is_some());
}

#[tokio::test]
async fn cancelled_fetch_gives_up() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(IDP_METADATA)
                .set_delay(std::time::Duration::from_secs(30)),
        )
        .mount(&server)
        .await;

    let sp = middleware(config());
    let cancel = CancellationToken::new();
    cancel.cancel();
    let source = MetadataSource::from_address(&server.uri()).unwrap();
    let err = sp.load_idp_metadata(&source, &cancel).await.unwrap_err();
    assert!(matches!(
        err,
        MetadataError::Transport(TransportError::Cancelled)
    ));
    assert!(sp.trust_store().current().is_none());
}

#[tokio::test]
async fn metadata_file_is_loaded() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("idp.xml");
    std::fs::write(&file, IDP_METADATA).unwrap();

    let sp = middleware(
        ServiceProviderConfig::builder(SP, ACS, SIGN_OUT)
            .metadata_address(file.to_str().unwrap())
            .build()
            .unwrap(),
    );
    let trust = sp
        .load_configured_idp_metadata(&CancellationToken::new())
        .await
        .unwrap();
    assert!(trust.sso_endpoint(ProtocolBinding::Post).is_some());

    let missing = middleware(
        ServiceProviderConfig::builder(SP, ACS, SIGN_OUT)
            .metadata_address(dir.path().join("absent.xml").to_str().unwrap())
            .build()
            .unwrap(),
    );
    let err = missing
        .load_configured_idp_metadata(&CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Metadata(MetadataError::Transport(TransportError::Io { .. }))
    ));
}

#[tokio::test]
async fn unsigned_metadata_is_refused_when_signers_configured() {
    let dir = env!("CARGO_MANIFEST_DIR");
    let sp = middleware(
        ServiceProviderConfig::builder(SP, ACS, SIGN_OUT)
            .metadata(MetadataConfig {
                signing_certificate_files: vec![
                    format!("{dir}/static/metadata_signer.cert").into()
                ],
                ..MetadataConfig::default()
            })
            .build()
            .unwrap(),
    );
    let err = sp
        .load_idp_metadata(
            &MetadataSource::Bytes(IDP_METADATA.to_vec()),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, MetadataError::UntrustedMetadataSignature));
}

#[test]
fn sp_metadata_describes_the_service_provider() {
    let sp = middleware(config());
    let options = MetadataParseOptions {
        now: NOW,
        ..MetadataParseOptions::default()
    };
    let parsed = parse_idp_metadata(sp.sp_metadata().as_bytes(), &options).unwrap();
    assert_eq!(parsed.role, EntityRole::ServiceProvider);
    assert_eq!(parsed.entity_id, SP);
    assert_eq!(parsed.sso_endpoints[0].location, ACS);
    assert_eq!(parsed.sso_endpoints[0].binding, ProtocolBinding::Post);
    assert_eq!(parsed.slo_endpoints[0].location, SIGN_OUT);
    assert!(parsed.certificates.is_empty());
    assert!(parsed.want_assertions_signed);
}

#[test]
fn sp_metadata_file_is_written_at_startup() {
    let dir = tempfile::tempdir().unwrap();
    let sp = middleware(
        ServiceProviderConfig::builder(SP, ACS, SIGN_OUT)
            .metadata(MetadataConfig {
                create_metadata_file: true,
                metadata_folder: dir.path().join("wwwroot"),
                ..MetadataConfig::default()
            })
            .build()
            .unwrap(),
    );
    let written = std::fs::read_to_string(dir.path().join("wwwroot/Metadata.xml")).unwrap();
    assert_eq!(written, sp.sp_metadata());
}
