//! The set of per-store shards plus the metadata sidecar.
//!
//! [`Index`] owns one [`ShardIndex`] per store ID, opens and closes them as
//! the datasource's store list changes, and answers federated searches by
//! querying every shard and merging the results.
//!
//! # Federated top-K
//!
//! Every shard orders hits by the same key (bm25 ascending, time descending,
//! seq descending). A hit at global position `< offset + limit` must also be
//! within the first `offset + limit` of its own shard, so each shard is
//! asked for exactly that many rows; the concatenation is re-sorted by the
//! same key and sliced to `[offset, offset + limit)`. Totals come from each
//! shard's separate `COUNT(*)` and are exact.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::config::IndexConfig;
use crate::error::IndexError;
use crate::metadata::{IndexMetadata, METADATA_FILE_NAME, RUNTIME_INDEX_VERSION};
use crate::models::{Message, MessageStore, SearchHit};
use crate::shard::{ShardIndex, ShardQuery};

struct IndexInner {
    meta: IndexMetadata,
    shards: HashMap<String, Arc<ShardIndex>>,
}

pub struct Index {
    config: IndexConfig,
    meta_path: PathBuf,
    inner: RwLock<IndexInner>,
}

impl Index {
    /// Prepare an index rooted at `config.base_dir`. Shards open lazily.
    pub fn open(config: &IndexConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.base_dir).with_context(|| {
            format!("create index base dir: {}", config.base_dir.display())
        })?;

        let meta_path = config.base_dir.join(METADATA_FILE_NAME);
        let meta = IndexMetadata::load(&meta_path).context("load index metadata")?;

        Ok(Self {
            config: config.clone(),
            meta_path,
            inner: RwLock::new(IndexInner {
                meta,
                shards: HashMap::new(),
            }),
        })
    }

    /// Close every open shard and forget it.
    pub async fn close(&self) {
        let shards: Vec<Arc<ShardIndex>> = {
            let mut inner = self.inner.write().await;
            inner.shards.drain().map(|(_, shard)| shard).collect()
        };
        for shard in shards {
            shard.close().await;
        }
    }

    /// Close every open shard and delete its file.
    pub async fn reset(&self) {
        let mut inner = self.inner.write().await;
        for (id, shard) in inner.shards.drain() {
            if let Err(e) = shard.reset().await {
                tracing::warn!(store = %id, error = %e, "reset shard failed");
            }
        }
    }

    /// Make the open shard set match `stores`: open or reopen shards for
    /// each store, close shards whose store is gone.
    ///
    /// A store whose shard cannot be opened is logged and left out. Returns
    /// the number of open shards.
    pub async fn sync_stores(&self, stores: &[MessageStore]) -> usize {
        let mut inner = self.inner.write().await;

        let mut desired = HashMap::with_capacity(stores.len());
        for store in stores {
            let id = store.id.trim();
            if id.is_empty() {
                continue;
            }
            match self.ensure_shard_locked(&mut inner, store).await {
                Ok(shard) => {
                    desired.insert(id.to_string(), shard);
                }
                Err(e) => {
                    tracing::warn!(store = %id, error = %format!("{:#}", e), "skip store, open shard failed");
                }
            }
        }

        for (id, shard) in inner.shards.iter() {
            if !desired.contains_key(id) {
                shard.close().await;
                tracing::info!(store = %id, "store removed, shard closed");
            }
        }

        inner.shards = desired;
        inner.shards.len()
    }

    /// Compare the persisted schema version to [`RUNTIME_INDEX_VERSION`].
    ///
    /// On mismatch the new version is persisted and `false` is returned; the
    /// caller should treat the stored fingerprint as invalid.
    pub async fn ensure_version(&self) -> Result<bool> {
        let mut inner = self.inner.write().await;
        if inner.meta.version_matches() {
            return Ok(true);
        }
        inner.meta.version = RUNTIME_INDEX_VERSION.to_string();
        inner.meta.save(&self.meta_path)?;
        Ok(false)
    }

    pub async fn update_fingerprint(&self, fingerprint: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.meta.fingerprint = fingerprint.trim().to_string();
        inner.meta.save(&self.meta_path)
    }

    pub async fn fingerprint(&self) -> String {
        self.inner.read().await.meta.fingerprint.clone()
    }

    pub async fn update_last_built(&self, at: DateTime<Utc>) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.meta.last_built = at.timestamp();
        inner.meta.save(&self.meta_path)
    }

    pub async fn last_built(&self) -> Option<DateTime<Utc>> {
        let last_built = self.inner.read().await.meta.last_built;
        if last_built == 0 {
            return None;
        }
        DateTime::from_timestamp(last_built, 0)
    }

    pub async fn metadata(&self) -> IndexMetadata {
        self.inner.read().await.meta.clone()
    }

    /// Snapshot of the open shards, ordered by store ID.
    pub async fn shards(&self) -> Vec<Arc<ShardIndex>> {
        let inner = self.inner.read().await;
        let mut shards: Vec<_> = inner.shards.values().cloned().collect();
        shards.sort_by(|a, b| a.store_id().cmp(b.store_id()));
        shards
    }

    pub async fn shard(&self, store_id: &str) -> Option<Arc<ShardIndex>> {
        self.inner.read().await.shards.get(store_id).cloned()
    }

    /// Index `messages` into the shard for `store`, opening it if needed.
    pub async fn index_store_messages(
        &self,
        store: &MessageStore,
        messages: &[Message],
    ) -> Result<usize> {
        if messages.is_empty() {
            return Ok(0);
        }
        let shard = {
            let mut inner = self.inner.write().await;
            self.ensure_shard_locked(&mut inner, store).await?
        };
        shard.index_batch(messages).await
    }

    /// Search every open shard and merge into one page.
    ///
    /// `query.match_expr` must be non-empty; `offset`/`limit` are expected to
    /// be normalized by the caller.
    pub async fn search(
        &self,
        query: &ShardQuery,
        offset: usize,
        limit: usize,
    ) -> Result<(Vec<SearchHit>, usize)> {
        let shards = self.shards().await;
        if shards.is_empty() || query.match_expr.is_empty() {
            return Ok((Vec::new(), 0));
        }

        let per_shard_limit = offset.saturating_add(limit);
        let mut combined = Vec::new();
        let mut total = 0;
        for shard in &shards {
            let (hits, count) = shard
                .search(query, 0, per_shard_limit)
                .await
                .with_context(|| format!("search store {}", shard.store_id()))?;
            total += count;
            combined.extend(hits);
        }

        Ok((merge_hits(combined, offset, limit), total))
    }

    async fn ensure_shard_locked(
        &self,
        inner: &mut IndexInner,
        store: &MessageStore,
    ) -> Result<Arc<ShardIndex>> {
        let id = store.id.trim();
        if id.is_empty() {
            return Err(IndexError::EmptyStoreId.into());
        }

        let path = self.resolve_store_path(store);
        if let Some(existing) = inner.shards.get(id) {
            if existing.path() == path {
                return Ok(existing.clone());
            }
            tracing::info!(
                store = %id,
                old = %existing.path().display(),
                new = %path.display(),
                "store path changed, reopening shard"
            );
            existing.close().await;
        }

        let shard = Arc::new(ShardIndex::open(id, &path, &self.config).await?);
        inner.shards.insert(id.to_string(), shard.clone());
        Ok(shard)
    }

    fn resolve_store_path(&self, store: &MessageStore) -> PathBuf {
        match &store.index_path {
            Some(path) if !path.as_os_str().is_empty() => {
                if path.is_absolute() {
                    path.clone()
                } else {
                    self.config.base_dir.join(path)
                }
            }
            _ => self
                .config
                .base_dir
                .join(format!("{}.fts.db", store.id.trim())),
        }
    }
}

/// Global ranking key: score ascending, then time and seq descending.
fn compare_hits(a: &SearchHit, b: &SearchHit) -> Ordering {
    a.score
        .total_cmp(&b.score)
        .then_with(|| b.message.time.cmp(&a.message.time))
        .then_with(|| b.message.seq.cmp(&a.message.seq))
}

/// Sort hits gathered from several shards and cut out one page.
pub fn merge_hits(mut hits: Vec<SearchHit>, offset: usize, limit: usize) -> Vec<SearchHit> {
    if offset >= hits.len() {
        return Vec::new();
    }
    hits.sort_by(compare_hits);
    let end = offset.saturating_add(limit).min(hits.len());
    hits.drain(offset..end).collect()
}
