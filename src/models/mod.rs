//! Data models shared by the connection layer, the container handle and the
//! emulator.

pub mod manifest;
pub mod object;

pub use manifest::{Manifest, SegmentRef};
pub use object::{ByteRange, ObjectAttributes, ObjectInfo};
