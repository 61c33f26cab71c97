//! The published state of a cloud container.

use exn::ResultExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::{ErrorKind, Result};
use crate::names::ContainerId;

/// Which content each db file of a container currently has.
///
/// Content blobs are immutable and addressed by hash, so a reader holding an
/// older manifest keeps seeing a consistent older container while a writer
/// publishes a new one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Bumped on every publish.
    pub generation: u64,
    pub files: BTreeMap<String, ManifestEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub hash: String,
    pub size: u64,
}

impl Manifest {
    pub fn from_bytes(data: &[u8], container: &ContainerId) -> Result<Self> {
        serde_json::from_slice(data).or_raise(|| ErrorKind::InvalidManifest(container.to_string()))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec_pretty(self).or_raise(|| ErrorKind::InvalidManifest("<serialize>".to_string()))
    }

    pub fn is_referenced(&self, hash: &str) -> bool {
        self.files.values().any(|entry| entry.hash == hash)
    }
}

pub fn content_hash(data: &[u8]) -> String {
    blake3::hash(data).to_hex().to_string()
}

/// Storage keys of one container.
#[derive(Debug, Clone)]
pub(crate) struct RemoteLayout {
    root: PathBuf,
}

impl RemoteLayout {
    pub(crate) fn new(container: &ContainerId) -> Self {
        Self { root: PathBuf::from(container.as_str()) }
    }

    pub(crate) fn manifest(&self) -> PathBuf {
        self.root.join("manifest.json")
    }

    pub(crate) fn write_lock(&self) -> PathBuf {
        self.root.join("write-lock.json")
    }

    pub(crate) fn blobs(&self) -> PathBuf {
        self.root.join("blobs")
    }

    pub(crate) fn blob(&self, hash: &str) -> PathBuf {
        self.blobs().join(hash)
    }

    /// The hash a blob key refers to, if it is a blob key at all.
    pub(crate) fn blob_hash<'a>(&self, key: &'a Path) -> Option<&'a str> {
        key.strip_prefix(self.blobs()).ok()?.to_str().filter(|hash| !hash.contains('/'))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manifest_json_shape() {
        let id = ContainerId::new("fonts-02").unwrap();
        let manifest = Manifest::from_bytes(
            br#"{"generation": 3, "files": {"fonts-1.0.0.wsdb": {"hash": "ab12", "size": 4096}}}"#,
            &id,
        )
        .unwrap();
        assert_eq!(manifest.generation, 3);
        assert!(manifest.is_referenced("ab12"));
        assert!(!manifest.is_referenced("cd34"));
        let err = Manifest::from_bytes(b"[]", &id).unwrap_err();
        assert!(matches!(&*err, ErrorKind::InvalidManifest(_)));
    }

    #[test]
    fn test_layout() {
        let layout = RemoteLayout::new(&ContainerId::new("fonts-02").unwrap());
        assert_eq!(layout.manifest(), Path::new("fonts-02/manifest.json"));
        assert_eq!(layout.blob("ab12"), Path::new("fonts-02/blobs/ab12"));
        assert_eq!(layout.blob_hash(Path::new("fonts-02/blobs/ab12")), Some("ab12"));
        assert_eq!(layout.blob_hash(Path::new("fonts-02/manifest.json")), None);
        assert_eq!(layout.blob_hash(Path::new("fonts-02/blobs/x/y")), None);
    }

    #[test]
    fn test_content_hash_is_stable() {
        assert_eq!(content_hash(b"abc"), content_hash(b"abc"));
        assert_ne!(content_hash(b"abc"), content_hash(b"abd"));
        assert_eq!(content_hash(b"").len(), 64);
    }
}
