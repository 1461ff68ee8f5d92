//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use std::sync::Arc;
use swift_objstore::{
    Container, ContainerSettings, LocalConnection, MemoryConnection, Payload,
    connection::{Connection, swift::ConnectOptions},
    handlers::EmulatorState,
    payload::read_all,
    routes,
};
use tempfile::TempDir;
use tokio::net::TcpListener;

pub const ACCOUNT: &str = "AUTH_test";
pub const USER: &str = "test:tester";
pub const KEY: &str = "testing";

pub fn settings(chunk: u64) -> ContainerSettings {
    ContainerSettings::new("data".into(), "data_segments".into(), chunk)
}

pub async fn memory_container(chunk: u64) -> (MemoryConnection, Container) {
    let conn = MemoryConnection::new();
    let container = Container::open(Arc::new(conn.clone()), settings(chunk), true)
        .await
        .unwrap();
    (conn, container)
}

/// Local SQLite/disk backend rooted in a fresh temp dir. Keep the `TempDir`
/// alive for the duration of the test.
pub async fn local_backend() -> (TempDir, LocalConnection) {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("meta.db").display());
    let conn = LocalConnection::connect(&url, dir.path().join("objects"))
        .await
        .unwrap();
    (dir, conn)
}

pub async fn local_container(chunk: u64) -> (TempDir, LocalConnection, Container) {
    let (dir, conn) = local_backend().await;
    let container = Container::open(Arc::new(conn.clone()), settings(chunk), true)
        .await
        .unwrap();
    (dir, conn, container)
}

/// A running emulator on an ephemeral port.
pub struct Emulator {
    pub base_url: String,
    pub state: EmulatorState,
    pub backend: MemoryConnection,
}

impl Emulator {
    pub async fn start() -> Self {
        let backend = MemoryConnection::new();
        let state = EmulatorState::new(Arc::new(backend.clone()), ACCOUNT, USER, KEY);
        let app = routes::routes().with_state(state.clone());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self {
            base_url: format!("http://{addr}"),
            state,
            backend,
        }
    }

    /// Connect options for the given auth version against this emulator.
    pub fn options(&self, version: u8) -> ConnectOptions {
        let auth_url = match version {
            1 => format!("{}/auth/v1.0", self.base_url),
            2 => format!("{}/v2.0", self.base_url),
            _ => format!("{}/v3", self.base_url),
        };
        ConnectOptions {
            auth_version: version,
            auth_url,
            username: USER.into(),
            password: KEY.into(),
            project_name: "test".into(),
            user_domain_name: "Default".into(),
            retries: 1,
            ..Default::default()
        }
    }
}

/// Deterministic, non-repeating-looking test data.
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

pub async fn fetch(container: &Container, name: &str) -> Vec<u8> {
    read_all(container.get(name).await.unwrap()).await.unwrap()
}

pub async fn fetch_range(container: &Container, name: &str, offset: i64, length: i64) -> Vec<u8> {
    read_all(container.get_range(name, offset, length).await.unwrap())
        .await
        .unwrap()
}

pub async fn list(container: &Container, dir: &str) -> Vec<String> {
    let mut out = Vec::new();
    container
        .iter(dir, |entry| {
            out.push(entry.to_string());
            Ok(())
        })
        .await
        .unwrap();
    out
}

/// Every object name in `container`, following sub-directories.
pub async fn list_all(conn: &dyn Connection, container: &str) -> Vec<String> {
    conn.object_names(container, &Default::default())
        .await
        .unwrap()
}

pub fn unknown_size(data: Vec<u8>) -> Payload {
    let chunks: Vec<std::io::Result<bytes::Bytes>> = data
        .chunks(3)
        .map(|c| Ok(bytes::Bytes::copy_from_slice(c)))
        .collect();
    Payload::from_stream(futures::stream::iter(chunks))
}
