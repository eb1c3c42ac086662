//! Index metadata sidecar (`index-meta.json`).
//!
//! One small JSON record per base directory: the runtime schema version the
//! shards were built with, the dataset fingerprint they reflect, and when the
//! last full build finished. Writes go through a temp file and a rename so a
//! crash never leaves a half-written record.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Bump when the shard schema or normalization changes; forces a full rebuild.
pub const RUNTIME_INDEX_VERSION: &str = "3";

pub const METADATA_FILE_NAME: &str = "index-meta.json";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndexMetadata {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub fingerprint: String,
    /// Unix seconds; `0` if never built.
    #[serde(default)]
    pub last_built: i64,
}

impl IndexMetadata {
    /// Load from `path`. A missing or empty file yields default metadata.
    pub fn load(path: &Path) -> Result<Self> {
        let data = match std::fs::read(path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("read index metadata: {}", path.display()))
            }
        };
        if data.is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_slice(&data)
            .with_context(|| format!("parse index metadata: {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let data = serde_json::to_vec_pretty(self)?;
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = std::path::PathBuf::from(tmp);
        std::fs::write(&tmp, data)
            .with_context(|| format!("write index metadata: {}", tmp.display()))?;
        std::fs::rename(&tmp, path)
            .with_context(|| format!("replace index metadata: {}", path.display()))?;
        Ok(())
    }

    pub fn version_matches(&self) -> bool {
        self.version == RUNTIME_INDEX_VERSION
    }
}
