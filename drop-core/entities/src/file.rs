use serde::{Deserialize, Serialize};

/// One file offered by a sender.
///
/// `handle` is only meaningful to the sender's file store (usually an
/// absolute path); the receiver uses `name` and `size`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub handle: String,
    pub name: String,
    pub size: u64,
}

impl ManifestEntry {
    pub fn new(
        handle: impl Into<String>,
        name: impl Into<String>,
        size: u64,
    ) -> Self {
        Self {
            handle: handle.into(),
            name: name.into(),
            size,
        }
    }
}

/// Ordered list of files making up one drop. Immutable once a request
/// has been created from it.
pub type FileManifest = Vec<ManifestEntry>;

/// Sum of all entry sizes, saturating at `u64::MAX`.
pub fn manifest_size(manifest: &[ManifestEntry]) -> u64 {
    manifest
        .iter()
        .fold(0u64, |total, entry| total.saturating_add(entry.size))
}

/// Sum of all entry sizes, or `None` if it does not fit in a `u64`.
pub fn checked_manifest_size(manifest: &[ManifestEntry]) -> Option<u64> {
    manifest
        .iter()
        .try_fold(0u64, |total, entry| total.checked_add(entry.size))
}
