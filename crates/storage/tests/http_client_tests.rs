mod common;

use bytes::Bytes;
use common::{image_id, md5_hex};
use depot_core::SwiftStoreConfig;
use depot_storage::{
    AuthToken, ByteSource, ByteStream, Credentials, HttpSwiftClient, ImageStore, ObjectBody,
    PutOptions, StorageResult, SwiftClient, SwiftStore,
};
use futures::StreamExt;
use httpmock::Method::{DELETE, GET, HEAD, PUT};
use httpmock::MockServer;
use serde_json::json;
use std::net::TcpListener;
use std::sync::Arc;
use url::Url;

const TOKEN: &str = "AUTH_tk0123";

fn can_bind_localhost() -> bool {
    TcpListener::bind("127.0.0.1:0").is_ok()
}

fn auth_for(server: &MockServer) -> AuthToken {
    AuthToken {
        storage_url: server.url("/v1/AUTH_test"),
        token: TOKEN.to_string(),
    }
}

async fn read_all(mut stream: ByteStream) -> Vec<u8> {
    let mut out = Vec::new();
    while let Some(piece) = stream.next().await {
        out.extend_from_slice(&piece.unwrap());
    }
    out
}

#[tokio::test]
async fn authenticate_returns_storage_url_and_token() {
    if !can_bind_localhost() {
        eprintln!("Skipping httpmock tests: cannot bind to localhost");
        return;
    }

    let server = MockServer::start_async().await;
    let auth_mock = server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/auth/v1.0")
                .header("x-auth-user", "test:tester")
                .header("x-auth-key", "testing");
            then.status(200)
                .header("X-Storage-Url", server.url("/v1/AUTH_test"))
                .header("X-Auth-Token", TOKEN);
        })
        .await;

    let client = HttpSwiftClient::new();
    let credentials = Credentials {
        auth_url: Url::parse(&server.url("/auth/v1.0")).unwrap(),
        user: "test:tester".to_string(),
        key: "testing".to_string(),
    };
    let auth = client.authenticate(&credentials).await.unwrap();
    assert_eq!(auth.storage_url, server.url("/v1/AUTH_test"));
    assert_eq!(auth.token, TOKEN);
    auth_mock.assert_async().await;

    let bad = Credentials {
        key: "wrong".to_string(),
        ..credentials
    };
    let err = client.authenticate(&bad).await.unwrap_err();
    assert_eq!(err.status, Some(404));
}

#[tokio::test]
async fn authenticate_rejects_missing_headers() {
    if !can_bind_localhost() {
        eprintln!("Skipping httpmock tests: cannot bind to localhost");
        return;
    }

    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/auth/v1.0");
            then.status(200);
        })
        .await;

    let credentials = Credentials {
        auth_url: Url::parse(&server.url("/auth/v1.0")).unwrap(),
        user: "user".to_string(),
        key: "key".to_string(),
    };
    let err = HttpSwiftClient::new()
        .authenticate(&credentials)
        .await
        .unwrap_err();
    assert_eq!(err.status, None);
    assert!(err.message.contains("X-Storage-Url"));
}

#[tokio::test]
async fn object_requests_map_status_codes() {
    if !can_bind_localhost() {
        eprintln!("Skipping httpmock tests: cannot bind to localhost");
        return;
    }

    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(HEAD)
                .path("/v1/AUTH_test/glance")
                .header("x-auth-token", TOKEN);
            then.status(404);
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(HEAD)
                .path("/v1/AUTH_test/glance/missing")
                .header("x-auth-token", TOKEN);
            then.status(404);
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(PUT)
                .path("/v1/AUTH_test/glance/taken")
                .header("if-none-match", "*");
            then.status(412);
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(DELETE).path("/v1/AUTH_test/glance/broken");
            then.status(503).body("service unavailable");
        })
        .await;

    let client = HttpSwiftClient::new();
    let auth = auth_for(&server);

    let err = client.head_container(&auth, "glance").await.unwrap_err();
    assert!(err.is_not_found());

    let err = client
        .head_object(&auth, "glance", "missing")
        .await
        .unwrap_err();
    assert!(err.is_not_found());

    let err = client
        .put_object(
            &auth,
            "glance",
            "taken",
            Bytes::from_static(b"data").into(),
            PutOptions::new().create_only(),
        )
        .await
        .unwrap_err();
    assert!(err.is_conflict());

    let err = client
        .delete_object(&auth, "glance", "broken")
        .await
        .unwrap_err();
    assert_eq!(err.status, Some(503));
    assert!(err.message.contains("service unavailable"));
}

#[tokio::test]
async fn put_object_sends_swift_headers() {
    if !can_bind_localhost() {
        eprintln!("Skipping httpmock tests: cannot bind to localhost");
        return;
    }

    let server = MockServer::start_async().await;
    let digest = md5_hex(b"hello world");
    let segment_mock = server
        .mock_async(|when, then| {
            when.method(PUT)
                .path("/v1/AUTH_test/glance/img/00001")
                .header("x-auth-token", TOKEN)
                .header("etag", digest.as_str())
                .header("if-none-match", "*")
                .body("hello world");
            then.status(201).header("Etag", digest.as_str());
        })
        .await;
    let manifest_mock = server
        .mock_async(|when, then| {
            when.method(PUT)
                .path("/v1/AUTH_test/glance/img")
                .header("x-object-manifest", "glance/img/")
                .header("x-object-meta-checksum", digest.as_str());
            then.status(201)
                .header("Etag", "\"d41d8cd98f00b204e9800998ecf8427e\"");
        })
        .await;

    let client = HttpSwiftClient::new();
    let auth = auth_for(&server);

    let pieces: Vec<StorageResult<Bytes>> = vec![
        Ok(Bytes::from_static(b"hello ")),
        Ok(Bytes::from_static(b"world")),
    ];
    let stream: ByteStream = Box::pin(futures::stream::iter(pieces));
    let etag = client
        .put_object(
            &auth,
            "glance",
            "img/00001",
            ObjectBody::Stream(stream),
            PutOptions::new().with_etag(digest.clone()).create_only(),
        )
        .await
        .unwrap();
    assert_eq!(etag, digest);
    segment_mock.assert_async().await;

    let etag = client
        .put_object(
            &auth,
            "glance",
            "img",
            ObjectBody::empty(),
            PutOptions::new()
                .with_manifest("glance/img/")
                .with_metadata("Checksum", digest.clone()),
        )
        .await
        .unwrap();
    assert_eq!(etag, "d41d8cd98f00b204e9800998ecf8427e");
    manifest_mock.assert_async().await;
}

#[tokio::test]
async fn get_object_streams_body_and_headers() {
    if !can_bind_localhost() {
        eprintln!("Skipping httpmock tests: cannot bind to localhost");
        return;
    }

    let server = MockServer::start_async().await;
    let digest = md5_hex(b"hello");
    server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/v1/AUTH_test/glance/img-one")
                .header("x-auth-token", TOKEN);
            then.status(200)
                .header("Etag", digest.as_str())
                .header("X-Object-Meta-Checksum", digest.as_str())
                .body("hello");
        })
        .await;

    let client = HttpSwiftClient::new();
    let (headers, stream) = client
        .get_object(&auth_for(&server), "glance", "img-one")
        .await
        .unwrap();
    assert_eq!(headers.content_length, 5);
    assert_eq!(headers.etag.as_deref(), Some(digest.as_str()));
    assert_eq!(
        headers.metadata.get("checksum").map(String::as_str),
        Some(digest.as_str())
    );
    assert!(!headers.is_manifest());
    assert_eq!(read_all(stream).await, b"hello");
}

#[tokio::test]
async fn list_objects_follows_markers() {
    if !can_bind_localhost() {
        eprintln!("Skipping httpmock tests: cannot bind to localhost");
        return;
    }

    let server = MockServer::start_async().await;
    // Registered first so requests carrying the marker match it.
    let second_page = server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/v1/AUTH_test/glance")
                .query_param("format", "json")
                .query_param("prefix", "img/")
                .query_param("marker", "img/00002");
            then.status(200).json_body(json!([]));
        })
        .await;
    let first_page = server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/v1/AUTH_test/glance")
                .query_param("format", "json")
                .query_param("prefix", "img/");
            then.status(200).json_body(json!([
                {"name": "img/00001", "bytes": 1024, "hash": "0f343b0931126a20f133d67c2b018a3b",
                 "content_type": "application/octet-stream", "last_modified": "2024-01-01T00:00:00.000000"},
                {"name": "img/00002", "bytes": 10, "hash": "f1c9645dbc14efddc7d8a322685f26eb",
                 "content_type": "application/octet-stream", "last_modified": "2024-01-01T00:00:00.000000"}
            ]));
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/v1/AUTH_test/glance")
                .query_param("prefix", "none/");
            then.status(204);
        })
        .await;

    let client = HttpSwiftClient::new();
    let auth = auth_for(&server);

    let entries = client.list_objects(&auth, "glance", "img/").await.unwrap();
    let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, vec!["img/00001", "img/00002"]);
    assert_eq!(entries[0].bytes, 1024);
    assert_eq!(
        entries[1].hash.as_deref(),
        Some("f1c9645dbc14efddc7d8a322685f26eb")
    );
    first_page.assert_async().await;
    second_page.assert_async().await;

    let entries = client.list_objects(&auth, "glance", "none/").await.unwrap();
    assert!(entries.is_empty());
}

#[tokio::test]
async fn store_adds_image_over_http() {
    if !can_bind_localhost() {
        eprintln!("Skipping httpmock tests: cannot bind to localhost");
        return;
    }

    let server = MockServer::start_async().await;
    let id = image_id();
    let data = vec![b'*'; 5120];
    let digest = md5_hex(&data);
    let object_path = format!("/v1/AUTH_test/glance/{id}");

    let auth_mock = server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/auth/v1.0")
                .header("x-auth-user", "user")
                .header("x-auth-key", "key");
            then.status(200)
                .header("X-Storage-Url", server.url("/v1/AUTH_test"))
                .header("X-Auth-Token", TOKEN);
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(HEAD).path("/v1/AUTH_test/glance");
            then.status(204);
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(HEAD).path(object_path.as_str());
            then.status(404);
        })
        .await;
    let put_mock = server
        .mock_async(|when, then| {
            when.method(PUT)
                .path(object_path.as_str())
                .header("x-auth-token", TOKEN)
                .header("if-none-match", "*")
                .body(String::from_utf8(data.clone()).unwrap());
            then.status(201).header("Etag", digest.as_str());
        })
        .await;

    let address = format!("http://{}/auth/v1.0", server.address());
    let config = SwiftStoreConfig {
        user: Some("user".to_string()),
        key: Some("key".to_string()),
        auth_address: Some(address),
        ..Default::default()
    };
    let store = SwiftStore::new(&config, Arc::new(HttpSwiftClient::new())).unwrap();

    let stored = store
        .add(&id, ByteSource::from_bytes(data.clone()), 5120)
        .await
        .unwrap();
    assert_eq!(
        stored.location.to_uri(),
        format!("swift+http://user:key@{}/auth/v1.0/glance/{id}", server.address())
    );
    assert_eq!(stored.size, 5120);
    assert_eq!(stored.checksum.to_hex(), digest);
    auth_mock.assert_async().await;
    put_mock.assert_async().await;
}
