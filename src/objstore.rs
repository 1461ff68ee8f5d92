//! The uniform object-store contract storage-tier code programs against.

use crate::{
    errors::{self, Error, Result},
    models::ObjectAttributes,
    payload::{ByteStream, Payload},
    services::Container,
};
use async_trait::async_trait;

/// Callback invoked once per listed entry.
pub type Visit<'a> = &'a mut (dyn FnMut(&str) -> anyhow::Result<()> + Send);

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Human-readable name of the bucket behind this store.
    fn name(&self) -> &str;

    /// List the direct children of `dir`; sub-directories end in `/`.
    async fn iter(&self, dir: &str, visit: Visit<'_>) -> Result<()>;

    async fn get(&self, name: &str) -> Result<ByteStream>;

    /// `length == -1` reads from `offset` to the end.
    async fn get_range(&self, name: &str, offset: i64, length: i64) -> Result<ByteStream>;

    async fn attributes(&self, name: &str) -> Result<ObjectAttributes>;

    async fn exists(&self, name: &str) -> Result<bool>;

    async fn upload(&self, name: &str, payload: Payload) -> Result<()>;

    async fn delete(&self, name: &str) -> Result<()>;

    fn is_obj_not_found_err(&self, err: &Error) -> bool {
        errors::is_not_found(err)
    }

    async fn close(&self) -> Result<()>;
}

#[async_trait]
impl ObjectStore for Container {
    fn name(&self) -> &str {
        Container::name(self)
    }

    async fn iter(&self, dir: &str, visit: Visit<'_>) -> Result<()> {
        Container::iter(self, dir, visit).await
    }

    async fn get(&self, name: &str) -> Result<ByteStream> {
        Container::get(self, name).await
    }

    async fn get_range(&self, name: &str, offset: i64, length: i64) -> Result<ByteStream> {
        Container::get_range(self, name, offset, length).await
    }

    async fn attributes(&self, name: &str) -> Result<ObjectAttributes> {
        Container::attributes(self, name).await
    }

    async fn exists(&self, name: &str) -> Result<bool> {
        Container::exists(self, name).await
    }

    async fn upload(&self, name: &str, payload: Payload) -> Result<()> {
        Container::upload(self, name, payload).await.map(|_| ())
    }

    async fn delete(&self, name: &str) -> Result<()> {
        Container::delete(self, name).await
    }

    async fn close(&self) -> Result<()> {
        Container::close(self).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{connection::MemoryConnection, services::ContainerSettings};
    use std::sync::Arc;

    #[tokio::test]
    async fn container_behind_trait_object() {
        let conn = MemoryConnection::new();
        let settings = ContainerSettings::new("bucket".into(), String::new(), 16);
        let store: Arc<dyn ObjectStore> = Arc::new(
            Container::open(Arc::new(conn), settings, true)
                .await
                .unwrap(),
        );
        assert_eq!(store.name(), "bucket");

        store.upload("dir/obj", Payload::from("hello")).await.unwrap();
        let mut seen = Vec::new();
        store
            .iter("", &mut |entry| {
                seen.push(entry.to_string());
                Ok(())
            })
            .await
            .unwrap();
        assert_eq!(seen, vec!["dir/"]);

        let err = store.attributes("nope").await.unwrap_err();
        assert!(store.is_obj_not_found_err(&err));
        store.close().await.unwrap();
    }
}
