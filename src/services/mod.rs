pub mod container;
pub mod upload;

pub use container::{Container, ContainerSettings};
pub use upload::{UploadEngine, UploadReport, UploadState, WritePath};
