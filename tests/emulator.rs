//! The HTTP client against the bundled Swift emulator, end to end.

mod common;

use common::*;
use std::sync::Arc;
use swift_objstore::{
    Container, ErrorKind, Payload, SwiftConnection, WritePath, connection::Connection,
};

const CHUNK: u64 = 16;

async fn open(emulator: &Emulator, version: u8) -> (Arc<SwiftConnection>, Container) {
    let conn = Arc::new(
        SwiftConnection::connect(emulator.options(version))
            .await
            .unwrap(),
    );
    let container = Container::open(conn.clone(), settings(CHUNK), true)
        .await
        .unwrap();
    (conn, container)
}

async fn exercise(emulator: &Emulator, c: &Container) {
    let small = pattern(CHUNK as usize - 1);
    let large = pattern(4 * CHUNK as usize + 3);

    let report = c.upload("dir/small", Payload::from(small.clone())).await.unwrap();
    assert_eq!(report.path, WritePath::Single);
    let report = c.upload("dir/large", Payload::from(large.clone())).await.unwrap();
    assert_eq!(report.segments, 5);

    assert_eq!(fetch(c, "dir/small").await, small);
    assert_eq!(fetch(c, "dir/large").await, large);
    assert_eq!(fetch_range(c, "dir/large", 10, 30).await, &large[10..40]);
    assert_eq!(fetch_range(c, "dir/large", 60, -1).await, &large[60..]);

    let attrs = c.attributes("dir/large").await.unwrap();
    assert_eq!(attrs.size, large.len() as u64);

    assert_eq!(list(c, "").await, vec!["dir/"]);
    assert_eq!(list(c, "dir").await, vec!["dir/large", "dir/small"]);

    c.delete("dir/large").await.unwrap();
    c.delete("dir/small").await.unwrap();
    assert!(!c.exists("dir/large").await.unwrap());
    assert!(list(c, "").await.is_empty());
    assert!(emulator.backend.object_names_in("data_segments").is_empty());
}

#[tokio::test]
async fn v1_auth_round_trip() {
    let emulator = Emulator::start().await;
    let (_, c) = open(&emulator, 1).await;
    exercise(&emulator, &c).await;
}

#[tokio::test]
async fn v2_auth_round_trip() {
    let emulator = Emulator::start().await;
    let (_, c) = open(&emulator, 2).await;
    exercise(&emulator, &c).await;
}

#[tokio::test]
async fn v3_auth_round_trip() {
    let emulator = Emulator::start().await;
    let (_, c) = open(&emulator, 3).await;
    exercise(&emulator, &c).await;
}

#[tokio::test]
async fn version_is_detected_from_url() {
    let emulator = Emulator::start().await;
    let mut opts = emulator.options(3);
    opts.auth_version = 0;
    let conn = SwiftConnection::connect(opts).await.unwrap();
    conn.health_check().await.unwrap();
}

#[tokio::test]
async fn wrong_key_is_an_auth_error() {
    let emulator = Emulator::start().await;
    for version in [1, 2, 3] {
        let mut opts = emulator.options(version);
        opts.password = "wrong".into();
        let err = SwiftConnection::connect(opts).await.err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Auth, "auth v{version}");
    }
}

#[tokio::test]
async fn expired_token_is_renewed() {
    let emulator = Emulator::start().await;
    let (_, c) = open(&emulator, 1).await;
    c.upload("k", Payload::from("value")).await.unwrap();

    emulator.state.revoke_tokens();
    assert_eq!(c.attributes("k").await.unwrap().size, 5);
    assert_eq!(fetch(&c, "k").await, b"value");
}

#[tokio::test]
async fn missing_objects_map_to_not_found() {
    let emulator = Emulator::start().await;
    let (conn, c) = open(&emulator, 1).await;
    assert!(c.attributes("ghost").await.unwrap_err().is_not_found());
    assert!(c.get("ghost").await.err().unwrap().is_not_found());
    assert!(c.delete("ghost").await.unwrap_err().is_not_found());
    assert!(!conn.container_exists("no-such-container").await.unwrap());
}

#[tokio::test]
async fn non_empty_container_delete_conflicts() {
    let emulator = Emulator::start().await;
    let (conn, c) = open(&emulator, 1).await;
    c.upload("k", Payload::from("v")).await.unwrap();
    let err = conn.container_delete("data").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Backend);
    assert_eq!(err.status(), Some(409));
}

#[tokio::test]
async fn listing_pages_over_http() {
    let emulator = Emulator::start().await;
    let (_, c) = open(&emulator, 1).await;
    let names: Vec<String> = (0..7).map(|i| format!("p/{i:02}")).collect();
    for name in &names {
        c.upload(name, Payload::from("x")).await.unwrap();
    }
    let c = c.with_list_limit(2);
    assert_eq!(list(&c, "p").await, names);
}

#[tokio::test]
async fn health_endpoints() {
    let emulator = Emulator::start().await;
    let client = reqwest::Client::new();
    let resp = client
        .get(format!("{}/healthz", emulator.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let resp = client
        .get(format!("{}/readyz", emulator.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["checks"]["backend"]["ok"], true);
}

#[tokio::test]
async fn storage_requests_require_a_token() {
    let emulator = Emulator::start().await;
    let resp = reqwest::Client::new()
        .head(format!("{}/v1/{}/data", emulator.base_url, ACCOUNT))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);
}
