// tests/yumrepofs.rs

//! Integration tests for the yumrepofs HTTP surface

mod common;

use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode, header};
use axum::response::Response;
use common::{TestEnv, rpm_bytes};
use peridot_builder::db::models::Key;
use peridot_builder::metadata::codec::{b64_encode, decompress_gz};
use peridot_builder::metadata::{decode_primary, decode_repomd};
use peridot_builder::server::{ServerState, create_router};
use peridot_builder::workflow::{LookasideUploadRequest, RpmLookasideBatchImportRequest};
use std::collections::BTreeMap;
use std::sync::Arc;
use tower::ServiceExt;

async fn get(env: &TestEnv, uri: &str) -> Response {
    let state = Arc::new(ServerState::new(env.controller.db_path.clone(), env.controller.store.clone()));
    create_router(state)
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap()
}

async fn body_of(response: Response) -> Vec<u8> {
    to_bytes(response.into_body(), usize::MAX).await.unwrap().to_vec()
}

fn content_type(response: &Response) -> &str {
    response.headers()[header::CONTENT_TYPE].to_str().unwrap()
}

fn repo_uri(env: &TestEnv, arch: &str, rest: &str) -> String {
    format!("/v1/projects/{}/repo/BaseOS/{}/{}", env.project.id, arch, rest)
}

#[tokio::test]
async fn test_health() {
    let env = TestEnv::new();
    let response = get(&env, "/health").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_of(response).await, b"OK");
}

#[tokio::test]
async fn test_repomd_and_primary_of_latest_revision() {
    let env = TestEnv::new();
    let repo = env.repository("BaseOS", &["bash"]);
    env.publish(&repo, "x86_64", &["Packages/t0/bash-5.1.8-5.el9.x86_64.rpm"], &BTreeMap::new());
    let latest = env.publish(&repo, "x86_64", &["Packages/t1/bash-5.1.8-6.el9.x86_64.rpm"], &BTreeMap::new());

    let response = get(&env, &repo_uri(&env, "x86_64", "repodata/repomd.xml")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(content_type(&response), "application/xml");
    let repomd = decode_repomd(&body_of(response).await).unwrap();
    assert_eq!(repomd.revision, latest.id);

    let href = repomd.find("primary").unwrap().location.href.clone();
    let blob = href.trim_start_matches("repodata/");
    let response = get(&env, &repo_uri(&env, "x86_64", &format!("repodata/{blob}"))).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(content_type(&response), "application/xml+gzip");
    let primary = decode_primary(&decompress_gz(&body_of(response).await).unwrap()).unwrap();
    assert_eq!(primary.packages[0].version.rel, "6.el9");

    // Plain variant is served decompressed
    let plain = blob.trim_end_matches(".gz");
    let response = get(&env, &repo_uri(&env, "x86_64", &format!("repodata/{plain}"))).await;
    assert_eq!(content_type(&response), "application/xml");
    let primary = decode_primary(&body_of(response).await).unwrap();
    assert_eq!(primary.package_count, 1);
}

#[tokio::test]
async fn test_i386_reads_i686_revision() {
    let env = TestEnv::new();
    let repo = env.repository("BaseOS", &["glibc"]);
    let revision = env.publish(&repo, "i686", &["Packages/t1/glibc-2.34-60.el9.i686.rpm"], &BTreeMap::new());

    let response = get(&env, &repo_uri(&env, "i386", "repodata/repomd.xml")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let repomd = decode_repomd(&body_of(response).await).unwrap();
    assert_eq!(repomd.revision, revision.id);
}

#[tokio::test]
async fn test_missing_and_invalid_repodata() {
    let env = TestEnv::new();
    env.repository("BaseOS", &["bash"]);

    let response = get(&env, &repo_uri(&env, "x86_64", "repodata/repomd.xml")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = get(&env, &repo_uri(&env, "x86_64", "repodata/PRIMARY.json")).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = get(&env, &repo_uri(&env, "x86_64", "repodata/nope-PRIMARY.xml.gz")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = get(&env, "/v1/projects/unknown/repo/BaseOS/x86_64/repodata/repomd.xml").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_repomd_signature_from_store() {
    let env = TestEnv::new();
    let repo = env.repository("BaseOS", &["bash"]);
    let revision = env.publish(&repo, "x86_64", &[], &BTreeMap::new());

    let response = get(&env, &repo_uri(&env, "x86_64", "repodata/repomd.xml.asc")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let signature = b"-----BEGIN PGP SIGNATURE-----\n-----END PGP SIGNATURE-----\n";
    env.controller
        .store
        .put(&format!("repo-signatures/{}.xml.asc", revision.id), signature)
        .unwrap();
    let response = get(&env, &repo_uri(&env, "x86_64", "repodata/repomd.xml.asc")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(content_type(&response), "application/pgp-signature");
    assert_eq!(body_of(response).await, signature);
}

#[tokio::test]
async fn test_rpm_download_through_url_mappings() {
    let env = TestEnv::new();
    let repo = env.repository("BaseOS", &["bash"]);
    let content = rpm_bytes(env.dir.path(), "bash", "5.1.8", "6.el9", "x86_64");
    env.controller.store.put("t1/bash-5.1.8-6.el9.x86_64.rpm", &content).unwrap();

    let mut mappings = BTreeMap::new();
    mappings.insert(
        "b/bash-5.1.8-6.el9.x86_64.rpm".to_string(),
        "t1/bash-5.1.8-6.el9.x86_64.rpm".to_string(),
    );
    env.publish(&repo, "x86_64", &["Packages/b/bash-5.1.8-6.el9.x86_64.rpm"], &mappings);

    let direct = get(&env, &repo_uri(&env, "x86_64", "Packages/t1/bash-5.1.8-6.el9.x86_64.rpm")).await;
    assert_eq!(direct.status(), StatusCode::OK);
    assert_eq!(body_of(direct).await, content);

    let hashed = get(&env, &repo_uri(&env, "x86_64", "Packages/b/bash-5.1.8-6.el9.x86_64.rpm")).await;
    assert_eq!(hashed.status(), StatusCode::OK);
    assert_eq!(body_of(hashed).await, content);

    let unmapped = get(&env, &repo_uri(&env, "x86_64", "Packages/z/zsh-5.8-9.el9.x86_64.rpm")).await;
    assert_eq!(unmapped.status(), StatusCode::NOT_FOUND);

    let response = get(&env, &repo_uri(&env, "x86_64", "url-mappings")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let served: BTreeMap<String, String> = serde_json::from_slice(&body_of(response).await).unwrap();
    assert_eq!(served, mappings);
}

#[tokio::test]
async fn test_public_key_of_default_key() {
    let env = TestEnv::new();
    let uri = format!("/v1/projects/{}/public-key", env.project.id);
    assert_eq!(get(&env, &uri).await.status(), StatusCode::NOT_FOUND);

    let armor = "-----BEGIN PGP PUBLIC KEY BLOCK-----\nabc\n-----END PGP PUBLIC KEY BLOCK-----\n";
    {
        let conn = env.conn();
        let key = Key::new("rocky", "releng@rocky.test", "6D745A60", armor);
        key.insert(&conn).unwrap();
        Key::attach_to_project(&conn, &env.project.id, &key.id, true).unwrap();
    }
    let response = get(&env, &uri).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(content_type(&response), "application/pgp-keys");
    assert_eq!(body_of(response).await, armor.as_bytes());
}

#[tokio::test]
async fn test_imported_rpm_is_served() {
    let env = TestEnv::new();
    env.package("bash");
    env.repository("BaseOS", &["bash"]);

    let content = rpm_bytes(env.dir.path(), "bash", "5.1.8", "6.el9", "x86_64");
    let upload = env
        .controller
        .submit_lookaside_upload(
            LookasideUploadRequest {
                project_id: Some(env.project.id.clone()),
                file: b64_encode(&content),
            },
            None,
        )
        .await
        .unwrap();
    let req = RpmLookasideBatchImportRequest {
        project_id: env.project.id.clone(),
        lookaside_blobs: vec![upload.digest],
        force_override: false,
    };
    env.controller.submit_rpm_batch_import(req, None).await.unwrap();

    // Built without a source RPM tag, so it is published as the source package
    let response = get(&env, &repo_uri(&env, "src", "repodata/repomd.xml")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let repomd = decode_repomd(&body_of(response).await).unwrap();
    let primary_href = repomd.find("primary").unwrap().location.href.clone();

    let response = get(&env, &repo_uri(&env, "src", &primary_href)).await;
    let primary = decode_primary(&decompress_gz(&body_of(response).await).unwrap()).unwrap();
    assert_eq!(primary.packages.len(), 1);
    let rpm_href = primary.packages[0].location.href.clone();
    assert!(rpm_href.ends_with("/bash-5.1.8-6.el9.src.rpm"));

    let response = get(&env, &repo_uri(&env, "src", &rpm_href)).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(content_type(&response), "application/x-rpm");
    assert_eq!(body_of(response).await, content);
}
