//! Abort cleanup, pagination, integrity and cancellation against the
//! in-memory fake with injected faults.

mod common;

use bytes::Bytes;
use common::*;
use futures::stream;
use std::{io, sync::Arc, time::Duration};
use swift_objstore::{
    Container, Error, ErrorKind, MemoryConnection, OpScope, Payload, connection::Connection,
    payload::read_all,
};

const CHUNK: u64 = 16;

#[tokio::test]
async fn failed_segment_keeps_previous_version() {
    let (conn, c) = memory_container(CHUNK).await;
    c.upload("doc", Payload::from("version one")).await.unwrap();

    conn.fail_puts_after(1);
    let err = c
        .upload("doc", Payload::from(pattern(3 * CHUNK as usize)))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Backend);
    assert_eq!(err.status(), Some(503));

    conn.clear_faults();
    assert_eq!(fetch(&c, "doc").await, b"version one");
    assert!(conn.object_names_in("data_segments").is_empty());
}

#[tokio::test]
async fn failed_manifest_commit_removes_segments() {
    let (conn, c) = memory_container(CHUNK).await;
    conn.fail_manifest_put(true);
    let err = c
        .upload("big", Payload::from(pattern(2 * CHUNK as usize + 1)))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Backend);

    conn.clear_faults();
    assert!(!c.exists("big").await.unwrap());
    assert!(conn.object_names_in("data_segments").is_empty());
}

#[tokio::test]
async fn source_failure_is_a_read_error() {
    let (conn, c) = memory_container(CHUNK).await;
    let chunks = vec![
        Ok(Bytes::from(pattern(20))),
        Err(io::Error::new(io::ErrorKind::ConnectionReset, "peer went away")),
    ];
    let err = c
        .upload("broken", Payload::from_stream(stream::iter(chunks)))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Read);
    assert!(!c.exists("broken").await.unwrap());
    assert!(conn.object_names_in("data_segments").is_empty());
}

#[tokio::test]
async fn declared_size_must_match_source() {
    let (conn, c) = memory_container(CHUNK).await;

    let short = Payload::from(pattern(4)).with_size(8);
    assert_eq!(c.upload("short", short).await.unwrap_err().kind(), ErrorKind::Read);

    let long = Payload::from(pattern(40)).with_size(20);
    assert_eq!(c.upload("long", long).await.unwrap_err().kind(), ErrorKind::Read);

    assert!(conn.object_names_in("data").is_empty());
    assert!(conn.object_names_in("data_segments").is_empty());
}

#[tokio::test]
async fn iteration_follows_every_page() {
    let (conn, c) = memory_container(CHUNK).await;
    let names = ["a", "b", "c", "d", "e", "f", "g"];
    for name in names {
        c.upload(name, Payload::from("x")).await.unwrap();
    }

    conn.cap_page_size(2);
    assert_eq!(list(&c, "").await, names);
    // Four non-empty pages, then the empty one that ends the listing.
    assert_eq!(conn.list_calls(), 5);

    conn.clear_faults();
    let c = c.with_list_limit(3);
    let before = conn.list_calls();
    assert_eq!(list(&c, "").await, names);
    assert_eq!(conn.list_calls() - before, 4);
}

#[tokio::test]
async fn paged_directories_are_reported_once() {
    let (conn, c) = memory_container(CHUNK).await;
    for name in ["d/1", "d/2", "d/3", "d/4", "e", "f/x"] {
        c.upload(name, Payload::from("x")).await.unwrap();
    }
    conn.cap_page_size(1);
    assert_eq!(list(&c, "").await, vec!["d/", "e", "f/"]);
    assert_eq!(list(&c, "d").await, vec!["d/1", "d/2", "d/3", "d/4"]);
}

#[tokio::test]
async fn stuck_listing_is_an_error() {
    let (conn, c) = memory_container(CHUNK).await;
    for name in ["a", "b", "c"] {
        c.upload(name, Payload::from("x")).await.unwrap();
    }
    conn.cap_page_size(2);
    conn.stale_listing(true);

    let mut seen = Vec::new();
    let err = c
        .iter("", |entry| {
            seen.push(entry.to_string());
            Ok(())
        })
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Backend);
    assert!(err.to_string().contains("did not advance"));
    assert_eq!(seen, vec!["a", "b"]);
}

#[tokio::test]
async fn visit_error_stops_iteration() {
    let (_, c) = memory_container(CHUNK).await;
    for name in ["a", "b", "c"] {
        c.upload(name, Payload::from("x")).await.unwrap();
    }

    let mut seen = Vec::new();
    let err = c
        .iter("", |entry| {
            seen.push(entry.to_string());
            if entry == "b" {
                anyhow::bail!("enough");
            }
            Ok(())
        })
        .await
        .unwrap_err();
    assert_eq!(seen, vec!["a", "b"]);
    assert_eq!(err.kind(), ErrorKind::Other);
    assert!(err.to_string().contains("enough"));

    let err = c
        .iter("", |entry| Err(Error::object_not_found("elsewhere", entry).into()))
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn tampered_object_fails_full_read() {
    let (conn, c) = memory_container(CHUNK).await;
    c.upload("blob", Payload::from("original bytes")).await.unwrap();
    assert!(conn.corrupt("data", "blob", "tampered bytes"));

    let err = read_all(c.get("blob").await.unwrap()).await.unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::InvalidData);

    // Ranged reads are served as stored.
    let partial = read_all(c.get_range("blob", 0, 8).await.unwrap())
        .await
        .unwrap();
    assert_eq!(partial, b"tampered");
}

#[tokio::test]
async fn deadline_aborts_slow_operation() {
    let (conn, c) = memory_container(CHUNK).await;
    conn.set_latency(Duration::from_secs(30));

    let scope = OpScope::new().timeout(Duration::from_millis(20));
    let err = scope.run(c.attributes("any")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DeadlineExceeded);
}

#[tokio::test]
async fn cancellation_aborts_upload() {
    let (conn, c) = memory_container(CHUNK).await;
    conn.set_latency(Duration::from_secs(30));

    let scope = OpScope::new();
    let canceller = scope.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        canceller.cancel();
    });
    let err = scope
        .run(c.upload("slow", Payload::from("x")))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Canceled);

    conn.clear_faults();
    assert!(!c.exists("slow").await.unwrap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_uploads_of_one_name() {
    let (conn, c) = memory_container(CHUNK).await;
    let first = vec![1u8; 3 * CHUNK as usize + 1];
    let second = vec![2u8; 3 * CHUNK as usize + 2];

    let (a, b) = (c.clone(), c.clone());
    let (x, y) = (first.clone(), second.clone());
    let (ra, rb) = tokio::join!(
        tokio::spawn(async move { a.upload("shared", Payload::from(x)).await }),
        tokio::spawn(async move { b.upload("shared", Payload::from(y)).await }),
    );
    assert_eq!(ra.unwrap().unwrap().segments, 4);
    assert_eq!(rb.unwrap().unwrap().segments, 4);

    let got = fetch(&c, "shared").await;
    assert!(got == first || got == second);

    // Each attempt wrote its own segment directory.
    let segments = conn.object_names_in("data_segments");
    assert_eq!(segments.len(), 8);
    let mut prefixes: Vec<String> = segments
        .iter()
        .map(|name| name.rsplit_once('/').unwrap().0.to_string())
        .collect();
    prefixes.dedup();
    assert_eq!(prefixes.len(), 2);
    let object_dir = prefixes[0].rsplit_once('/').unwrap().0;
    assert!(prefixes[1].starts_with(object_dir));

    // Whichever manifest won references only its own segments.
    let manifest = conn.manifest_get("data", "shared").await.unwrap().unwrap();
    let winner = manifest.segments[0].name.rsplit_once('/').unwrap().0;
    assert!(manifest.segments.iter().all(|s| s.name.starts_with(winner)));
}

#[tokio::test]
async fn open_respects_create_policy() {
    let conn = MemoryConnection::new();
    let backend: Arc<dyn Connection> = Arc::new(conn.clone());

    let err = Container::open(backend.clone(), settings(CHUNK), false)
        .await
        .err()
        .unwrap();
    assert!(err.is_not_found());

    conn.fail_container_create(true);
    let err = Container::open(backend.clone(), settings(CHUNK), true)
        .await
        .err()
        .unwrap();
    assert_eq!(err.kind(), ErrorKind::CreateFailed);

    conn.clear_faults();
    let c = Container::open(backend.clone(), settings(CHUNK), true)
        .await
        .unwrap();
    assert_eq!(c.name(), "data");
    assert!(conn.container_exists("data_segments").await.unwrap());
}
