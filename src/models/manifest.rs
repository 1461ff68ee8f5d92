//! Static large object manifests and the segments they reference.

use serde::{Deserialize, Serialize};

/// One entry of a manifest: a segment object and what it must contain.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct SegmentRef {
    /// Segment container.
    pub container: String,

    /// Segment object name inside `container`.
    pub name: String,

    /// MD5 of the segment content.
    pub etag: String,

    /// Segment size in bytes.
    pub size_bytes: u64,
}

impl SegmentRef {
    /// `/{container}/{name}`, the form Swift uses to address segments.
    pub fn path(&self) -> String {
        format!("/{}/{}", self.container, self.name)
    }

    fn from_path(path: &str, etag: String, size_bytes: u64) -> Option<Self> {
        let (container, name) = path.trim_start_matches('/').split_once('/')?;
        if container.is_empty() || name.is_empty() {
            return None;
        }
        Some(Self {
            container: container.to_string(),
            name: name.to_string(),
            etag,
            size_bytes,
        })
    }
}

/// Ordered list of segments whose concatenation is the logical object.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct Manifest {
    pub segments: Vec<SegmentRef>,
}

/// Entry shape accepted by `PUT ?multipart-manifest=put`.
#[derive(Serialize, Deserialize, Debug)]
pub struct ManifestPutEntry {
    pub path: String,
    pub etag: String,
    pub size_bytes: u64,
}

/// Entry shape returned by `GET ?multipart-manifest=get`.
#[derive(Serialize, Deserialize, Debug)]
pub struct ManifestGetEntry {
    pub name: String,
    pub hash: String,
    pub bytes: u64,
}

impl Manifest {
    pub fn new(segments: Vec<SegmentRef>) -> Self {
        Self { segments }
    }

    pub fn total_size(&self) -> u64 {
        self.segments.iter().map(|s| s.size_bytes).sum()
    }

    /// ETag Swift reports for the manifest: MD5 over the concatenated
    /// segment ETags.
    pub fn etag(&self) -> String {
        let mut ctx = md5::Context::new();
        for segment in &self.segments {
            ctx.consume(segment.etag.as_bytes());
        }
        format!("{:x}", ctx.compute())
    }

    pub fn to_put_entries(&self) -> Vec<ManifestPutEntry> {
        self.segments
            .iter()
            .map(|s| ManifestPutEntry {
                path: s.path(),
                etag: s.etag.clone(),
                size_bytes: s.size_bytes,
            })
            .collect()
    }

    pub fn to_get_entries(&self) -> Vec<ManifestGetEntry> {
        self.segments
            .iter()
            .map(|s| ManifestGetEntry {
                name: s.path(),
                hash: s.etag.clone(),
                bytes: s.size_bytes,
            })
            .collect()
    }

    /// Returns `None` if any entry has a malformed path.
    pub fn from_put_entries(entries: Vec<ManifestPutEntry>) -> Option<Self> {
        entries
            .into_iter()
            .map(|e| SegmentRef::from_path(&e.path, e.etag, e.size_bytes))
            .collect::<Option<Vec<_>>>()
            .map(Self::new)
    }

    /// Returns `None` if any entry has a malformed path.
    pub fn from_get_entries(entries: Vec<ManifestGetEntry>) -> Option<Self> {
        entries
            .into_iter()
            .map(|e| SegmentRef::from_path(&e.name, e.hash, e.bytes))
            .collect::<Option<Vec<_>>>()
            .map(Self::new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest() -> Manifest {
        Manifest::new(vec![
            SegmentRef {
                container: "segs".into(),
                name: "segments/ab/u/0000000000000001".into(),
                etag: "0cc175b9c0f1b6a831c399e269772661".into(),
                size_bytes: 1,
            },
            SegmentRef {
                container: "segs".into(),
                name: "segments/ab/u/0000000000000002".into(),
                etag: "92eb5ffee6ae2fec3ad71c777531578f".into(),
                size_bytes: 1,
            },
        ])
    }

    #[test]
    fn swift_wire_shapes_preserve_order() {
        let m = manifest();
        let put = serde_json::to_value(m.to_put_entries()).unwrap();
        assert_eq!(put[0]["path"], "/segs/segments/ab/u/0000000000000001");
        assert_eq!(put[1]["size_bytes"], 1);

        let back = Manifest::from_get_entries(m.to_get_entries()).unwrap();
        assert_eq!(back, m);
        assert_eq!(back.total_size(), 2);
    }

    #[test]
    fn malformed_paths_are_rejected() {
        let entries = vec![ManifestPutEntry {
            path: "/only-container".into(),
            etag: String::new(),
            size_bytes: 0,
        }];
        assert!(Manifest::from_put_entries(entries).is_none());
    }

    #[test]
    fn etag_depends_on_segment_order() {
        let m = manifest();
        let mut reversed = m.clone();
        reversed.segments.reverse();
        assert_ne!(m.etag(), reversed.etag());
    }
}
