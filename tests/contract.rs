//! Object-store contract checks, run against the in-memory and the
//! SQLite/disk backends.

mod common;

use common::*;
use swift_objstore::{
    Container, ErrorKind, Payload, WritePath, connection::Connection, is_not_found,
};

const CHUNK: u64 = 16;

async fn round_trips_across_the_threshold(c: &Container) {
    let chunk = CHUNK as usize;
    let cases = [
        (0, WritePath::Single, 0),
        (chunk - 1, WritePath::Single, 0),
        (chunk, WritePath::Segmented, 1),
        (chunk + 1, WritePath::Segmented, 2),
        (3 * chunk + 5, WritePath::Segmented, 4),
    ];
    for (len, path, segments) in cases {
        let name = format!("obj-{len}");
        let data = pattern(len);
        let report = c.upload(&name, Payload::from(data.clone())).await.unwrap();
        assert_eq!(report.path, path, "write path for {len} bytes");
        assert_eq!(report.segments, segments, "segments for {len} bytes");
        assert_eq!(report.bytes, len as u64);

        assert_eq!(fetch(c, &name).await, data, "content of {name}");
        assert_eq!(c.attributes(&name).await.unwrap().size, len as u64);
    }
}

async fn ranges_slice_the_content(c: &Container) {
    let data = pattern(3 * CHUNK as usize + 7);
    c.upload("ranged", Payload::from(data.clone())).await.unwrap();

    assert_eq!(fetch_range(c, "ranged", 0, 5).await, &data[0..5]);
    // Across a segment boundary.
    assert_eq!(fetch_range(c, "ranged", 14, 6).await, &data[14..20]);
    assert_eq!(fetch_range(c, "ranged", 20, -1).await, &data[20..]);
    assert!(fetch_range(c, "ranged", 3, 0).await.is_empty());

    let small = pattern(10);
    c.upload("small", Payload::from(small.clone())).await.unwrap();
    assert_eq!(fetch_range(c, "small", 4, 3).await, &small[4..7]);
    assert_eq!(fetch_range(c, "small", 9, -1).await, &small[9..]);
}

async fn iterates_one_level(c: &Container) {
    for name in ["a", "b/c", "b/d"] {
        c.upload(name, Payload::from("x")).await.unwrap();
    }
    assert_eq!(list(c, "").await, vec!["a", "b/"]);
    assert_eq!(list(c, "b").await, vec!["b/c", "b/d"]);
    assert_eq!(list(c, "b/").await, vec!["b/c", "b/d"]);
    assert!(list(c, "missing").await.is_empty());
}

async fn missing_objects_are_not_found(c: &Container) {
    let err = c.attributes("nope").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert!(is_not_found(&err));

    let err = c.get("nope").await.err().unwrap();
    assert!(is_not_found(&err));

    let err = c.get_range("nope", 1, 2).await.err().unwrap();
    assert!(is_not_found(&err));

    let err = c.delete("nope").await.unwrap_err();
    assert!(is_not_found(&err));
    assert!(!c.exists("nope").await.unwrap());
}

async fn delete_removes_segments(c: &Container, conn: &dyn Connection) {
    let data = pattern(5 * CHUNK as usize);
    c.upload("big", Payload::from(data)).await.unwrap();
    c.upload("plain", Payload::from("tiny")).await.unwrap();
    assert_eq!(list_all(conn, "data_segments").await.len(), 5);

    c.delete("big").await.unwrap();
    assert!(!c.exists("big").await.unwrap());
    assert!(list_all(conn, "data_segments").await.is_empty());

    c.delete("plain").await.unwrap();
    assert!(!c.exists("plain").await.unwrap());
}

async fn overwrite_replaces_content(c: &Container, conn: &dyn Connection) {
    c.upload("k", Payload::from(pattern(40))).await.unwrap();
    c.upload("k", Payload::from("short")).await.unwrap();
    assert_eq!(fetch(c, "k").await, b"short");
    assert_eq!(c.attributes("k").await.unwrap().size, 5);

    // Each upload writes under a fresh prefix.
    c.upload("k", Payload::from(pattern(40))).await.unwrap();
    assert_eq!(fetch(c, "k").await, pattern(40));
    assert!(list_all(conn, "data_segments").await.len() >= 3);
}

async fn unknown_size_is_segmented(c: &Container) {
    let data = pattern(CHUNK as usize - 1);
    let report = c.upload("unsized", unknown_size(data.clone())).await.unwrap();
    assert_eq!(report.path, WritePath::Segmented);
    assert_eq!(report.segments, 1);
    assert_eq!(fetch(c, "unsized").await, data);

    let report = c.upload("unsized-empty", unknown_size(Vec::new())).await.unwrap();
    assert_eq!(report.segments, 0);
    assert!(c.exists("unsized-empty").await.unwrap());
    assert!(fetch(c, "unsized-empty").await.is_empty());
}

#[tokio::test]
async fn memory_backend_round_trips() {
    let (_, c) = memory_container(CHUNK).await;
    round_trips_across_the_threshold(&c).await;
}

#[tokio::test]
async fn memory_backend_ranges() {
    let (_, c) = memory_container(CHUNK).await;
    ranges_slice_the_content(&c).await;
}

#[tokio::test]
async fn memory_backend_iteration() {
    let (_, c) = memory_container(CHUNK).await;
    iterates_one_level(&c).await;
}

#[tokio::test]
async fn memory_backend_not_found() {
    let (_, c) = memory_container(CHUNK).await;
    missing_objects_are_not_found(&c).await;
}

#[tokio::test]
async fn memory_backend_delete() {
    let (conn, c) = memory_container(CHUNK).await;
    delete_removes_segments(&c, &conn).await;
}

#[tokio::test]
async fn memory_backend_overwrite() {
    let (conn, c) = memory_container(CHUNK).await;
    overwrite_replaces_content(&c, &conn).await;
}

#[tokio::test]
async fn memory_backend_unknown_size() {
    let (_, c) = memory_container(CHUNK).await;
    unknown_size_is_segmented(&c).await;
}

#[tokio::test]
async fn local_backend_round_trips() {
    let (_dir, _, c) = local_container(CHUNK).await;
    round_trips_across_the_threshold(&c).await;
}

#[tokio::test]
async fn local_backend_ranges() {
    let (_dir, _, c) = local_container(CHUNK).await;
    ranges_slice_the_content(&c).await;
}

#[tokio::test]
async fn local_backend_iteration() {
    let (_dir, _, c) = local_container(CHUNK).await;
    iterates_one_level(&c).await;
}

#[tokio::test]
async fn local_backend_not_found() {
    let (_dir, _, c) = local_container(CHUNK).await;
    missing_objects_are_not_found(&c).await;
}

#[tokio::test]
async fn local_backend_delete() {
    let (_dir, conn, c) = local_container(CHUNK).await;
    delete_removes_segments(&c, &conn).await;
}

#[tokio::test]
async fn local_backend_overwrite() {
    let (_dir, conn, c) = local_container(CHUNK).await;
    overwrite_replaces_content(&c, &conn).await;
}

#[tokio::test]
async fn local_backend_unknown_size() {
    let (_dir, _, c) = local_container(CHUNK).await;
    unknown_size_is_segmented(&c).await;
}

#[tokio::test]
async fn local_backend_survives_reopen() {
    let (dir, conn, c) = local_container(CHUNK).await;
    let data = pattern(2 * CHUNK as usize + 3);
    c.upload("persist/me", Payload::from(data.clone())).await.unwrap();
    conn.db.close().await;

    let url = format!("sqlite://{}", dir.path().join("meta.db").display());
    let reopened = swift_objstore::LocalConnection::connect(&url, dir.path().join("objects"))
        .await
        .unwrap();
    let c = Container::open(std::sync::Arc::new(reopened), settings(CHUNK), false)
        .await
        .unwrap();
    assert_eq!(fetch(&c, "persist/me").await, data);
    assert_eq!(list(&c, "persist").await, vec!["persist/me"]);
}
