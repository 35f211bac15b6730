//! Per-file mode and ownership used to permission replicas.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::Path;
use stripeline_transport::StatusCode;

/// Recorded metadata of one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMeta {
    /// Permission bits.
    pub mode: u32,
    /// Identity of the owner.
    pub owner: String,
}

/// Source of per-file metadata.
pub trait MetadataLookup: Send + Sync {
    /// Metadata for `file`, or the status explaining why there is none.
    fn lookup(&self, file: &OsStr) -> Result<FileMeta, StatusCode>;
}

/// Same metadata for every file.
#[derive(Debug, Clone)]
pub struct UniformMetadata {
    meta: FileMeta,
}

impl UniformMetadata {
    /// Every file gets `mode` and `owner`.
    pub fn new(mode: u32, owner: impl Into<String>) -> Self {
        Self {
            meta: FileMeta {
                mode,
                owner: owner.into(),
            },
        }
    }
}

impl MetadataLookup for UniformMetadata {
    fn lookup(&self, _file: &OsStr) -> Result<FileMeta, StatusCode> {
        Ok(self.meta.clone())
    }
}

/// Metadata from a manifest mapping file names to `{mode, owner}`.
#[derive(Debug, Clone, Default)]
pub struct MapMetadata {
    entries: HashMap<String, FileMeta>,
}

impl MapMetadata {
    /// Builds a lookup from explicit entries.
    pub fn new(entries: HashMap<String, FileMeta>) -> Self {
        Self { entries }
    }

    /// Parses a JSON manifest such as `{"a/b": {"mode": 420, "owner": "alice"}}`.
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        Ok(Self::new(serde_json::from_str(json)?))
    }

    /// Reads and parses a JSON manifest file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Ok(Self::from_json(&contents)?)
    }

    /// Number of files described.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the manifest is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl MetadataLookup for MapMetadata {
    fn lookup(&self, file: &OsStr) -> Result<FileMeta, StatusCode> {
        file.to_str()
            .and_then(|name| self.entries.get(name))
            .cloned()
            .ok_or(StatusCode::NoSuchFile)
    }
}

/// Mode a replica is created with. Replicas written on behalf of another
/// owner get group and other write access and lose setuid, setgid and
/// sticky bits.
pub fn replica_mode(meta: &FileMeta, identity: &str) -> u32 {
    if meta.owner != identity {
        (meta.mode | 0o022) & 0o777
    } else {
        meta.mode & 0o7777
    }
}
