//! Swift (OpenStack Object Storage) adapter for a uniform object-store
//! contract: streamed get/put with static large object segmentation, ranged
//! reads, directory-style iteration and a backend-independent not-found
//! classifier.
//!
//! ```no_run
//! # async fn demo() -> swift_objstore::Result<()> {
//! use swift_objstore::{Container, Payload, SwiftConfig};
//!
//! let cfg = SwiftConfig::from_env()?;
//! let bucket = Container::from_config(&cfg, true).await?;
//! bucket.upload("logs/today.txt", Payload::from("hello")).await?;
//! assert!(bucket.exists("logs/today.txt").await?);
//! # Ok(())
//! # }
//! ```

pub mod cancel;
pub mod checksum;
pub mod config;
pub mod connection;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod objstore;
pub mod payload;
pub mod routes;
pub mod services;

pub use cancel::OpScope;
pub use config::{ServerConfig, SwiftConfig};
pub use connection::{Connection, LocalConnection, MemoryConnection, SwiftConnection};
pub use errors::{Error, ErrorKind, Result, is_not_found};
pub use models::{ByteRange, Manifest, ObjectAttributes, ObjectInfo, SegmentRef};
pub use objstore::ObjectStore;
pub use payload::{ByteStream, Payload};
pub use services::{Container, ContainerSettings, UploadReport, WritePath};
