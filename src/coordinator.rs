//! Index coordinator: readiness state machine, rebuild and incremental
//! protocols, and the federated search entry point.
//!
//! # States
//!
//! ```text
//!  Unbuilt ──▶ InProgress ──▶ Ready
//!                 ▲             │
//!                 └─────────────┘  fingerprint changed
//! ```
//!
//! `in_progress` is checked and set under the coordinator's lock, so at most
//! one rebuild runs at a time; a second trigger observes it and returns
//! not-ready. Searches never wait for a rebuild: while the index is warming
//! they return an empty page together with the current [`IndexStatus`].
//!
//! The coordinator is always handed out as an `Arc`. [`IndexCoordinator::open`]
//! launches the initial rebuild as a background task tied to the
//! coordinator's [`CancellationToken`]; [`IndexCoordinator::close`] cancels
//! and awaits it.

use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::IndexConfig;
use crate::datasource::{Datasource, MessageSink};
use crate::error::IndexError;
use crate::index::Index;
use crate::locate::StoreLocator;
use crate::models::{IndexStatus, Message, MessageStore, SearchRequest, SearchResponse};
use crate::progress::{LogProgress, RebuildProgressEvent, RebuildProgressReporter};
use crate::query::{compile_query, dedupe_strings};
use crate::shard::ShardQuery;
use crate::stats::{collect_stats, IndexStats};

#[derive(Default)]
struct CoordinatorState {
    status: IndexStatus,
    /// Fingerprint the shards reflect; empty until the first successful build.
    fingerprint: String,
}

/// Outcome of the readiness check that precedes a rebuild.
enum Gate {
    Ready,
    Busy,
    /// The caller now owns the rebuild for this fingerprint.
    Rebuild(String),
}

/// Clears `in_progress` if a rebuild is abandoned without reaching an outcome
/// (its future dropped, or a panic unwinding through it).
struct RebuildGuard<'a> {
    state: &'a Mutex<CoordinatorState>,
    armed: bool,
}

impl RebuildGuard<'_> {
    fn finish(mut self, f: impl FnOnce(&mut CoordinatorState)) {
        self.armed = false;
        let mut state = self.state.lock();
        state.status.in_progress = false;
        f(&mut state);
    }
}

impl Drop for RebuildGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.state.lock().status.in_progress = false;
        }
    }
}

pub struct IndexCoordinator {
    me: Weak<IndexCoordinator>,
    config: IndexConfig,
    datasource: Arc<dyn Datasource>,
    index: Option<Index>,
    state: Mutex<CoordinatorState>,
    reporter: Box<dyn RebuildProgressReporter>,
    rebuilds: AtomicU64,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl IndexCoordinator {
    /// Open the coordinator and, if `config.build_on_open`, start the initial
    /// rebuild in the background. Must be called inside a Tokio runtime.
    pub fn open(config: IndexConfig, datasource: Arc<dyn Datasource>) -> Result<Arc<Self>> {
        Self::open_with_reporter(config, datasource, Box::new(LogProgress))
    }

    pub fn open_with_reporter(
        config: IndexConfig,
        datasource: Arc<dyn Datasource>,
        reporter: Box<dyn RebuildProgressReporter>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let index = if config.enabled {
            Some(Index::open(&config)?)
        } else {
            None
        };

        let build_on_open = config.build_on_open && index.is_some();
        let coordinator = Arc::new_cyclic(|me| Self {
            me: me.clone(),
            config,
            datasource,
            index,
            state: Mutex::new(CoordinatorState::default()),
            reporter,
            rebuilds: AtomicU64::new(0),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        });

        if build_on_open {
            coordinator.spawn_background(|this, cancel| async move {
                this.ensure_index(&cancel).await.map(|_| ())
            });
        }
        Ok(coordinator)
    }

    /// Snapshot of the readiness status; `None` when indexing is disabled.
    pub fn status(&self) -> Option<IndexStatus> {
        self.index.as_ref()?;
        Some(self.state.lock().status.clone())
    }

    /// Number of full rebuilds started since construction.
    pub fn rebuild_count(&self) -> u64 {
        self.rebuilds.load(Ordering::Relaxed)
    }

    pub fn index(&self) -> Option<&Index> {
        self.index.as_ref()
    }

    /// Make sure the shards reflect the datasource's current fingerprint,
    /// running a full rebuild inline if they do not.
    ///
    /// Returns `Ok(false)` without error when indexing is disabled or another
    /// rebuild is already running.
    pub async fn ensure_index(&self, cancel: &CancellationToken) -> Result<bool> {
        match self.gate().await? {
            Gate::Ready => Ok(true),
            Gate::Busy => Ok(false),
            Gate::Rebuild(fingerprint) => {
                self.run_rebuild(cancel, fingerprint).await?;
                Ok(true)
            }
        }
    }

    /// Like [`ensure_index`](Self::ensure_index) but never waits for a
    /// rebuild: one that is needed is started as a background task.
    async fn ensure_index_background(&self) -> Result<bool> {
        match self.gate().await? {
            Gate::Ready => Ok(true),
            Gate::Busy => Ok(false),
            Gate::Rebuild(fingerprint) => {
                self.spawn_background(move |this, cancel| async move {
                    this.run_rebuild(&cancel, fingerprint).await
                });
                Ok(false)
            }
        }
    }

    async fn gate(&self) -> Result<Gate> {
        let Some(index) = &self.index else {
            return Ok(Gate::Busy);
        };

        if !index.ensure_version().await? {
            let mut state = self.state.lock();
            state.status.ready = false;
            state.status.progress = 0.0;
            state.fingerprint.clear();
        }

        let fingerprint = self
            .datasource
            .dataset_fingerprint()
            .await
            .context("get dataset fingerprint")?;
        let fingerprint = fingerprint.trim();
        if fingerprint.is_empty() {
            return Err(IndexError::EmptyFingerprint.into());
        }

        let mut state = self.state.lock();
        if state.fingerprint == fingerprint && state.status.ready && !state.status.in_progress {
            if state.status.progress < 1.0 {
                state.status.progress = 1.0;
            }
            return Ok(Gate::Ready);
        }
        if state.status.in_progress {
            return Ok(Gate::Busy);
        }
        state.status.in_progress = true;
        state.status.ready = false;
        state.status.progress = 0.0;
        state.status.last_started_at = Some(Utc::now());
        state.status.last_error = None;
        Ok(Gate::Rebuild(fingerprint.to_string()))
    }

    /// Run the rebuild owned by a [`Gate::Rebuild`] and record its outcome.
    async fn run_rebuild(&self, cancel: &CancellationToken, fingerprint: String) -> Result<()> {
        let guard = RebuildGuard {
            state: &self.state,
            armed: true,
        };
        self.rebuilds.fetch_add(1, Ordering::Relaxed);

        let Some(index) = &self.index else {
            guard.finish(|_| {});
            return Ok(());
        };

        match self.rebuild_index(index, cancel, &fingerprint).await {
            Ok(documents) => {
                guard.finish(|state| {
                    state.fingerprint = fingerprint;
                    state.status.ready = true;
                    state.status.progress = 1.0;
                    state.status.last_completed_at = Some(Utc::now());
                });
                self.reporter
                    .report(RebuildProgressEvent::Finished { documents });
                Ok(())
            }
            Err(e) if IndexError::is_cancelled(&e) => {
                guard.finish(|_| {});
                Err(e)
            }
            Err(e) => {
                guard.finish(|state| {
                    state.status.last_error = Some(format!("{:#}", e));
                });
                Err(e)
            }
        }
    }

    /// Full rebuild: reset every shard, then walk every talker and re-index
    /// its messages. Returns the number of documents written.
    async fn rebuild_index(
        &self,
        index: &Index,
        cancel: &CancellationToken,
        fingerprint: &str,
    ) -> Result<u64> {
        // shards are untouched until the walk is known to proceed
        if cancel.is_cancelled() {
            return Err(IndexError::Cancelled.into());
        }
        let stores = self
            .datasource
            .list_message_stores()
            .await
            .context("list message stores")?;

        // Open every known shard first so the reset clears files left by a
        // previous process as well.
        index.sync_stores(&stores).await;
        index.reset().await;
        index.ensure_version().await?;
        index.sync_stores(&stores).await;

        if stores.is_empty() {
            return self.finish_build(index, fingerprint).await.map(|_| 0);
        }

        let mut talkers = self
            .datasource
            .list_talkers()
            .await
            .context("list talkers")?;
        if talkers.is_empty() {
            return self.finish_build(index, fingerprint).await.map(|_| 0);
        }
        talkers.sort();

        let mut open_stores = Vec::with_capacity(stores.len());
        for store in &stores {
            if index.shard(store.id.trim()).await.is_some() {
                open_stores.push(store.clone());
            }
        }
        let locator = StoreLocator::new(&open_stores);

        self.reporter.report(RebuildProgressEvent::Started {
            stores: open_stores.len(),
            talkers: talkers.len(),
        });

        let mut buffers = StoreBuffers::new(self.config.batch_size);
        let total = talkers.len();
        for (i, talker) in talkers.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(IndexError::Cancelled.into());
            }

            let (sink, rx) = MessageSink::channel(self.config.batch_size);
            let producer =
                self.datasource
                    .iterate_messages(cancel, std::slice::from_ref(talker), sink);
            let consumer = async {
                let mut rx = rx;
                while let Some(msg) = rx.recv().await {
                    let store = match locator.locate(self.datasource.as_ref(), &msg) {
                        Ok(store) => store,
                        Err(e) => {
                            tracing::warn!(talker = %msg.talker, error = %format!("{:#}", e), "skip message without store");
                            continue;
                        }
                    };
                    buffers.push(index, store, msg).await?;
                }
                Ok::<_, anyhow::Error>(())
            };
            let (produced, consumed) = tokio::join!(producer, consumer);
            consumed.with_context(|| format!("index talker {}", talker))?;

            if let Err(e) = produced {
                if !cancel.is_cancelled() {
                    return Err(e).with_context(|| format!("iterate messages for {}", talker));
                }
            }

            buffers.flush_dirty(index, &locator).await?;
            // a cancelled walk must not persist the fingerprint
            if cancel.is_cancelled() {
                return Err(IndexError::Cancelled.into());
            }
            self.update_progress((i + 1) as f64 / total as f64);
            self.reporter.report(RebuildProgressEvent::Talker {
                talker: talker.clone(),
                n: i + 1,
                total,
            });
        }

        buffers.flush_dirty(index, &locator).await?;
        self.finish_build(index, fingerprint).await?;
        Ok(buffers.written)
    }

    async fn finish_build(&self, index: &Index, fingerprint: &str) -> Result<()> {
        index.update_fingerprint(fingerprint).await?;
        index.update_last_built(Utc::now()).await
    }

    fn update_progress(&self, progress: f64) {
        self.state.lock().status.progress = progress.clamp(0.0, 1.0);
    }

    /// Index newly arrived messages without a full rebuild.
    ///
    /// Skipped while the index is rebuilding or not yet ready; the next
    /// rebuild picks the data up instead. After the writes the stored
    /// fingerprint is advanced to the datasource's current one, assuming the
    /// caller has passed every change behind it.
    pub async fn index_messages(&self, messages: &[Message]) -> Result<usize> {
        let Some(index) = &self.index else {
            return Ok(0);
        };
        if messages.is_empty() || !self.is_idle_and_ready() {
            return Ok(0);
        }

        let mut batches: BTreeMap<String, (MessageStore, Vec<Message>)> = BTreeMap::new();
        for msg in messages {
            match self.datasource.locate_message_store(msg) {
                Ok(Some(store)) => {
                    batches
                        .entry(store.id.clone())
                        .or_insert_with(|| (store, Vec::new()))
                        .1
                        .push(msg.clone());
                }
                Ok(None) => {
                    tracing::warn!(talker = %msg.talker, "skip incremental index: message store not found");
                }
                Err(e) => {
                    tracing::warn!(talker = %msg.talker, error = %format!("{:#}", e), "locate message store for incremental index failed");
                }
            }
        }

        let mut written = 0;
        for (store, batch) in batches.values() {
            written += index.index_store_messages(store, batch).await?;
        }
        if written == 0 {
            return Ok(0);
        }

        let fingerprint = match self.datasource.dataset_fingerprint().await {
            Ok(fp) if !fp.trim().is_empty() => fp.trim().to_string(),
            Ok(_) => return Ok(written),
            Err(e) => {
                tracing::debug!(error = %format!("{:#}", e), "get dataset fingerprint for incremental index failed");
                return Ok(written);
            }
        };

        // a rebuild that started meanwhile owns the fingerprint
        if !self.is_idle_and_ready() {
            return Ok(written);
        }
        index.update_fingerprint(&fingerprint).await?;
        let mut state = self.state.lock();
        if state.status.ready && !state.status.in_progress {
            state.fingerprint = fingerprint;
            state.status.last_completed_at = Some(Utc::now());
        }
        Ok(written)
    }

    fn is_idle_and_ready(&self) -> bool {
        let state = self.state.lock();
        state.status.ready && !state.status.in_progress
    }

    /// Federated search across all shards.
    ///
    /// An empty query returns an empty page without touching any shard. A
    /// not-yet-ready index returns an empty page carrying the status.
    pub async fn search(&self, req: &SearchRequest) -> Result<SearchResponse> {
        let limit = self.config.page_limit(req.limit);
        let match_expr = compile_query(&req.query);
        if match_expr.is_empty() {
            return Ok(SearchResponse::empty(req, limit, self.status()));
        }
        let Some(index) = &self.index else {
            return Ok(SearchResponse::empty(req, limit, None));
        };

        if !self.ensure_index_background().await? {
            return Ok(SearchResponse::empty(req, limit, self.status()));
        }

        let (start_unix, end_unix) = req.unix_bounds();
        let query = ShardQuery {
            match_expr,
            talkers: dedupe_strings(&req.talkers),
            senders: dedupe_strings(&req.senders),
            start_unix,
            end_unix,
        };

        let begin = Instant::now();
        let (hits, total) = index.search(&query, req.offset, limit).await?;
        let duration_ms = begin.elapsed().as_millis() as u64;
        tracing::debug!(query = %query.match_expr, total, hits = hits.len(), duration_ms, "fts search");

        Ok(SearchResponse {
            total,
            hits,
            duration_ms,
            limit,
            offset: req.offset,
            query: req.query.clone(),
            index: self.status(),
        })
    }

    pub async fn stats(&self) -> Result<Option<IndexStats>> {
        match &self.index {
            Some(index) => collect_stats(index).await.map(Some),
            None => Ok(None),
        }
    }

    /// Delete every shard file and forget readiness; the next
    /// [`ensure_index`](Self::ensure_index) rebuilds from scratch.
    pub async fn reset(&self) -> Result<()> {
        let Some(index) = &self.index else {
            return Ok(());
        };
        index.reset().await;
        index.update_fingerprint("").await?;
        let mut state = self.state.lock();
        state.fingerprint.clear();
        state.status.ready = false;
        state.status.progress = 0.0;
        Ok(())
    }

    /// Cancel background work, wait for it, and close every shard.
    pub async fn close(&self) {
        self.cancel.cancel();
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "background index task failed");
            }
        }
        if let Some(index) = &self.index {
            index.close().await;
        }
    }

    fn spawn_background<F, Fut>(&self, f: F)
    where
        F: FnOnce(Arc<Self>, CancellationToken) -> Fut,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let Some(this) = self.me.upgrade() else {
            return;
        };
        let fut = f(this, self.cancel.child_token());
        let handle = tokio::spawn(async move {
            match fut.await {
                Ok(()) => tracing::info!("fts index ready"),
                Err(e) if IndexError::is_cancelled(&e) => {
                    tracing::info!("fts index rebuild cancelled")
                }
                Err(e) => tracing::warn!(error = %format!("{:#}", e), "ensure fts index failed"),
            }
        });

        let mut tasks = self.tasks.lock();
        tasks.retain(|t| !t.is_finished());
        tasks.push(handle);
    }
}

/// Per-store message buffers used during a rebuild.
struct StoreBuffers {
    batch_size: usize,
    pending: HashMap<String, Vec<Message>>,
    dirty: HashSet<String>,
    written: u64,
}

impl StoreBuffers {
    fn new(batch_size: usize) -> Self {
        Self {
            batch_size,
            pending: HashMap::new(),
            dirty: HashSet::new(),
            written: 0,
        }
    }

    /// Buffer `msg` for `store`, flushing once the buffer is full.
    async fn push(&mut self, index: &Index, store: &MessageStore, msg: Message) -> Result<()> {
        let buf = self.pending.entry(store.id.clone()).or_default();
        buf.push(msg);
        if buf.len() >= self.batch_size {
            let batch = std::mem::take(buf);
            self.written += index.index_store_messages(store, &batch).await? as u64;
        }
        self.dirty.insert(store.id.clone());
        Ok(())
    }

    /// Flush every store with buffered documents.
    async fn flush_dirty(&mut self, index: &Index, locator: &StoreLocator<'_>) -> Result<()> {
        for id in std::mem::take(&mut self.dirty) {
            let batch = self.pending.remove(&id).unwrap_or_default();
            if batch.is_empty() {
                continue;
            }
            let Some(store) = locator.store(&id) else {
                continue;
            };
            self.written += index.index_store_messages(store, &batch).await? as u64;
        }
        Ok(())
    }
}
