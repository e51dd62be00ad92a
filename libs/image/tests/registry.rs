//! Registry interactions against a mock registry.

use std::io::Write;

use casnap_image::manifest::{OCI_CONFIG, OCI_INDEX, OCI_MANIFEST};
use casnap_image::{
    build_seed, pull, pull_seed, push_seed, unpack_layer, Descriptor, Digest, ImageConfig,
    ImageError, Manifest, OciClient, OciConfig, OciError, Platform,
};
use flate2::write::GzEncoder;
use flate2::Compression;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client(dir: &std::path::Path) -> OciClient {
    OciClient::new(OciConfig {
        blob_dir: dir.join("blobs"),
        platform: Platform {
            architecture: "amd64".to_string(),
            os: "linux".to_string(),
            variant: None,
        },
        ..Default::default()
    })
    .unwrap()
}

/// Registry name for the mock server, e.g. `http://127.0.0.1:1234/demo/app:v1`.
fn name(server: &MockServer, rest: &str) -> String {
    format!("{}/{rest}", server.uri())
}

struct Fixture {
    manifest: Vec<u8>,
    config: Vec<u8>,
    config_digest: Digest,
    layer: Vec<u8>,
    layer_digest: Digest,
}

fn fixture() -> Fixture {
    let mut builder = tar::Builder::new(Vec::new());
    let mut h = tar::Header::new_gnu();
    h.set_size(6);
    h.set_mode(0o644);
    builder
        .append_data(&mut h, "etc/os-release", &b"casnap"[..])
        .unwrap();
    let tar = builder.into_inner().unwrap();

    let mut gz = GzEncoder::new(Vec::new(), Compression::default());
    gz.write_all(&tar).unwrap();
    let layer = gz.finish().unwrap();
    let layer_digest = Digest::of(&layer);

    let mut config = ImageConfig::default();
    config.rootfs.diff_ids = vec![Digest::of(&tar)];
    let config = serde_json::to_vec(&config).unwrap();
    let config_digest = Digest::of(&config);

    let manifest = Manifest {
        schema_version: 2,
        media_type: Some(OCI_MANIFEST.to_string()),
        config: Descriptor {
            media_type: OCI_CONFIG.to_string(),
            digest: config_digest.clone(),
            size: config.len() as u64,
        },
        layers: vec![Descriptor {
            media_type: "application/vnd.oci.image.layer.v1.tar+gzip".to_string(),
            digest: layer_digest.clone(),
            size: layer.len() as u64,
        }],
    };

    Fixture {
        manifest: serde_json::to_vec(&manifest).unwrap(),
        config,
        config_digest,
        layer,
        layer_digest,
    }
}

async fn serve_image(server: &MockServer, repo: &str, reference: &str, f: &Fixture) {
    Mock::given(method("GET"))
        .and(path(format!("/v2/{repo}/manifests/{reference}")))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", OCI_MANIFEST)
                .set_body_bytes(f.manifest.clone()),
        )
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/v2/{repo}/blobs/{}", f.config_digest)))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(f.config.clone()))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/v2/{repo}/blobs/{}", f.layer_digest)))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(f.layer.clone()))
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_pull_image_and_unpack() {
    let server = MockServer::start().await;
    let f = fixture();
    serve_image(&server, "demo/app", "v1", &f).await;
    let dir = tempfile::tempdir().unwrap();
    let client = client(dir.path());

    let image = pull(&client, &name(&server, "demo/app:v1")).await.unwrap();

    assert_eq!(image.digest, Digest::of(&f.manifest));
    assert_eq!(image.layers.len(), 1);
    assert_eq!(image.layers[0].digest(), &f.layer_digest);
    assert!(client.blob_exists(&f.layer_digest));
    assert!(image.layers[0].is_gzip().unwrap());

    let lower = dir.path().join("lower");
    unpack_layer(&image.layers[0], &lower).unwrap();
    assert_eq!(std::fs::read(lower.join("etc/os-release")).unwrap(), b"casnap");

    // A second pull reuses the local blob.
    let again = pull(&client, &name(&server, "demo/app:v1")).await.unwrap();
    assert_eq!(again.layers[0].path(), image.layers[0].path());
    let layer_gets = server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter(|r| r.url.path().ends_with(f.layer_digest.hex()))
        .count();
    assert_eq!(layer_gets, 1);
}

#[tokio::test]
async fn test_pull_answers_bearer_challenge() {
    let server = MockServer::start().await;
    let f = fixture();
    let challenge = format!(
        r#"Bearer realm="{}/token",service="mock-registry""#,
        server.uri()
    );

    Mock::given(method("GET"))
        .and(path("/token"))
        .and(query_param("service", "mock-registry"))
        .and(query_param("scope", "repository:demo/app:pull"))
        // base64("u:p")
        .and(header("authorization", "Basic dTpw"))
        .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"token":"t0k"}"#))
        .mount(&server)
        .await;
    for (route, body) in [
        ("/v2/demo/app/manifests/v1".to_string(), f.manifest.clone()),
        (format!("/v2/demo/app/blobs/{}", f.config_digest), f.config.clone()),
        (format!("/v2/demo/app/blobs/{}", f.layer_digest), f.layer.clone()),
    ] {
        Mock::given(method("GET"))
            .and(path(route.clone()))
            .and(header("authorization", "Bearer t0k"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", OCI_MANIFEST)
                    .set_body_bytes(body),
            )
            .with_priority(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(route))
            .respond_with(
                ResponseTemplate::new(401).insert_header("www-authenticate", challenge.as_str()),
            )
            .with_priority(2)
            .mount(&server)
            .await;
    }

    let dir = tempfile::tempdir().unwrap();
    let authed_client = client(dir.path());
    let authed = format!("http://u:p@{}/demo/app:v1", server.address());
    let image = pull(&authed_client, &authed).await.unwrap();
    assert_eq!(image.layers.len(), 1);

    // Without credentials the token endpoint refuses.
    let dir = tempfile::tempdir().unwrap();
    let err = pull(&client(dir.path()), &name(&server, "demo/app:v1"))
        .await
        .unwrap_err();
    assert!(
        matches!(err, ImageError::Oci(OciError::Status { .. } | OciError::AuthRequired(_))),
        "{err}"
    );
}

#[tokio::test]
async fn test_pull_by_digest_verifies_manifest() {
    let server = MockServer::start().await;
    let f = fixture();
    let wrong = Digest::of(b"something else");
    serve_image(&server, "demo/app", &wrong.to_string(), &f).await;

    let dir = tempfile::tempdir().unwrap();
    let err = pull(&client(dir.path()), &name(&server, &format!("demo/app@{wrong}")))
        .await
        .unwrap_err();
    assert!(
        matches!(err, ImageError::Oci(OciError::DigestMismatch { .. })),
        "{err}"
    );
}

#[tokio::test]
async fn test_pull_resolves_platform_index() {
    let server = MockServer::start().await;
    let f = fixture();
    let manifest_digest = Digest::of(&f.manifest);
    let index = serde_json::json!({
        "schemaVersion": 2,
        "mediaType": OCI_INDEX,
        "manifests": [
            {
                "mediaType": OCI_MANIFEST,
                "digest": Digest::of(b"arm").to_string(),
                "size": 3,
                "platform": {"architecture": "arm64", "os": "linux"}
            },
            {
                "mediaType": OCI_MANIFEST,
                "digest": manifest_digest.to_string(),
                "size": f.manifest.len(),
                "platform": {"architecture": "amd64", "os": "linux"}
            }
        ]
    });
    Mock::given(method("GET"))
        .and(path("/v2/demo/app/manifests/multi"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", OCI_INDEX)
                .set_body_bytes(serde_json::to_vec(&index).unwrap()),
        )
        .mount(&server)
        .await;
    serve_image(&server, "demo/app", &manifest_digest.to_string(), &f).await;

    let dir = tempfile::tempdir().unwrap();
    let image = pull(&client(dir.path()), &name(&server, "demo/app:multi"))
        .await
        .unwrap();
    assert_eq!(image.digest, manifest_digest);
}

#[tokio::test]
async fn test_missing_image_is_not_found() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let err = pull(&client(dir.path()), &name(&server, "demo/absent:v1"))
        .await
        .unwrap_err();
    assert!(err.is_not_found(), "{err}");
}

#[tokio::test]
async fn test_push_seed_uploads_blobs_and_manifest() {
    let server = MockServer::start().await;
    Mock::given(method("HEAD"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v2/seeds/app/blobs/uploads/"))
        .respond_with(
            ResponseTemplate::new(202)
                .insert_header("location", "/v2/seeds/app/blobs/uploads/u1?state=abc"),
        )
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/v2/seeds/app/blobs/uploads/u1"))
        .and(query_param("state", "abc"))
        .respond_with(ResponseTemplate::new(201))
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/v2/seeds/app/manifests/v1"))
        .and(header("content-type", OCI_MANIFEST))
        .respond_with(ResponseTemplate::new(201))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let diff_id = push_seed(&client(dir.path()), &name(&server, "seeds/app:v1"), "feedface")
        .await
        .unwrap();

    let seed = build_seed("feedface").unwrap();
    assert_eq!(diff_id, seed.diff_id.hex());

    let requests = server.received_requests().await.unwrap();
    let uploaded: Vec<String> = requests
        .iter()
        .filter(|r| r.method.as_str() == "PUT" && r.url.path().contains("/uploads/"))
        .filter_map(|r| {
            r.url
                .query_pairs()
                .find(|(k, _)| k == "digest")
                .map(|(_, v)| v.into_owned())
        })
        .collect();
    assert_eq!(
        uploaded,
        vec![
            seed.diff_id.to_string(),
            Digest::of(&seed.config).to_string()
        ]
    );

    let manifest = requests
        .iter()
        .find(|r| r.method.as_str() == "PUT" && r.url.path().ends_with("/manifests/v1"))
        .unwrap();
    assert_eq!(manifest.body, seed.manifest.to_vec());
}

#[tokio::test]
async fn test_push_seed_skips_existing_blobs() {
    let server = MockServer::start().await;
    Mock::given(method("HEAD"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/v2/seeds/app/manifests/v1"))
        .respond_with(ResponseTemplate::new(201))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    push_seed(&client(dir.path()), &name(&server, "seeds/app:v1"), "feedface")
        .await
        .unwrap();

    let posts = server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter(|r| r.method.as_str() == "POST")
        .count();
    assert_eq!(posts, 0);
}

#[tokio::test]
async fn test_pull_seed_from_registry() {
    let server = MockServer::start().await;
    let seed = build_seed("feedface").unwrap();
    Mock::given(method("GET"))
        .and(path("/v2/seeds/app/manifests/v1"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", OCI_MANIFEST)
                .set_body_bytes(seed.manifest.to_vec()),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/v2/seeds/app/blobs/{}", Digest::of(&seed.config))))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(seed.config.to_vec()))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let diff_id = pull_seed(&client(dir.path()), &name(&server, "seeds/app:v1"))
        .await
        .unwrap();
    assert_eq!(diff_id, seed.diff_id.hex());
}
