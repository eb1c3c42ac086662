//! Index statistics and health overview.
//!
//! A quick summary of what each shard holds, used by hosts to show whether
//! rebuilds and incremental updates are landing where expected.

use anyhow::Result;
use serde::Serialize;
use std::path::PathBuf;

use crate::index::Index;
use crate::metadata::IndexMetadata;

#[derive(Debug, Clone, Serialize)]
pub struct ShardStats {
    pub store_id: String,
    pub path: PathBuf,
    pub documents: i64,
    pub checkpoints: i64,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct IndexStats {
    pub metadata: IndexMetadata,
    pub shards: Vec<ShardStats>,
}

impl IndexStats {
    pub fn total_documents(&self) -> i64 {
        self.shards.iter().map(|s| s.documents).sum()
    }

    pub fn total_size(&self) -> String {
        format_bytes(self.shards.iter().map(|s| s.size_bytes).sum())
    }
}

pub async fn collect_stats(index: &Index) -> Result<IndexStats> {
    let mut shards = Vec::new();
    for shard in index.shards().await {
        let size_bytes = std::fs::metadata(shard.path())
            .map(|m| m.len())
            .unwrap_or(0);
        shards.push(ShardStats {
            store_id: shard.store_id().to_string(),
            path: shard.path().to_path_buf(),
            documents: shard.document_count().await?,
            checkpoints: shard.checkpoint_count().await?,
            size_bytes,
        });
    }
    Ok(IndexStats {
        metadata: index.metadata().await,
        shards,
    })
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}
