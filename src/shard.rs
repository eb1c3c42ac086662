//! Per-store shard: one SQLite file with an FTS5 index over message content.
//!
//! # Schema
//!
//! - `messages(doc_id UNIQUE, talker, sender, unix, seq, content, message_json)`
//!   with secondary indexes on `talker`, `sender` and `unix`.
//! - `checkpoints(talker PRIMARY KEY, last_seq)`: per-talker high-water mark.
//! - `messages_fts`: external-content FTS5 table over `messages.content`,
//!   kept in sync by insert/update/delete triggers so both structures change
//!   in the same transaction.
//!
//! Each shard is local, single-writer and rebuildable, so connections run
//! with WAL, `synchronous = NORMAL` and in-memory temp storage.

use anyhow::{Context, Result};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::{QueryBuilder, Row, Sqlite};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};

use crate::config::IndexConfig;
use crate::error::IndexError;
use crate::models::{Document, Message, SearchHit};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS messages (
        doc_id       TEXT NOT NULL UNIQUE,
        talker       TEXT NOT NULL,
        sender       TEXT NOT NULL,
        unix         INTEGER NOT NULL,
        seq          INTEGER NOT NULL,
        content      TEXT NOT NULL,
        message_json TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_messages_talker ON messages(talker)",
    "CREATE INDEX IF NOT EXISTS idx_messages_sender ON messages(sender)",
    "CREATE INDEX IF NOT EXISTS idx_messages_unix ON messages(unix)",
    r#"
    CREATE TABLE IF NOT EXISTS checkpoints (
        talker   TEXT PRIMARY KEY,
        last_seq INTEGER NOT NULL
    )
    "#,
];

const FTS_TABLE: &str = r#"
    CREATE VIRTUAL TABLE messages_fts USING fts5(
        content,
        content='messages',
        content_rowid='rowid',
        tokenize='unicode61 remove_diacritics 2'
    )
"#;

const TRIGGERS: &[&str] = &[
    r#"
    CREATE TRIGGER IF NOT EXISTS messages_ai AFTER INSERT ON messages BEGIN
        INSERT INTO messages_fts(rowid, content) VALUES (new.rowid, new.content);
    END
    "#,
    r#"
    CREATE TRIGGER IF NOT EXISTS messages_ad AFTER DELETE ON messages BEGIN
        INSERT INTO messages_fts(messages_fts, rowid, content) VALUES ('delete', old.rowid, old.content);
    END
    "#,
    r#"
    CREATE TRIGGER IF NOT EXISTS messages_au AFTER UPDATE ON messages BEGIN
        INSERT INTO messages_fts(messages_fts, rowid, content) VALUES ('delete', old.rowid, old.content);
        INSERT INTO messages_fts(rowid, content) VALUES (new.rowid, new.content);
    END
    "#,
];

/// Filters for a single-shard search. Empty lists and zero bounds are not applied.
#[derive(Debug, Clone, Default)]
pub struct ShardQuery {
    pub match_expr: String,
    pub talkers: Vec<String>,
    pub senders: Vec<String>,
    pub start_unix: i64,
    pub end_unix: i64,
}

pub struct ShardIndex {
    store_id: String,
    path: PathBuf,
    pool: RwLock<Option<SqlitePool>>,
    writer: Mutex<()>,
    snippet_tokens: u32,
    searches: AtomicU64,
}

impl ShardIndex {
    /// Open (creating if needed) the shard file at `path` and ensure its schema.
    pub async fn open(store_id: &str, path: &Path, config: &IndexConfig) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create store index dir: {}", parent.display()))?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_millis(config.busy_timeout_ms))
            .foreign_keys(true)
            .pragma("temp_store", "MEMORY");

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await
            .with_context(|| format!("open store index: {}", path.display()))?;

        if let Err(e) = init_schema(&pool).await {
            pool.close().await;
            return Err(e);
        }

        tracing::debug!(store = %store_id, path = %path.display(), "shard opened");

        Ok(Self {
            store_id: store_id.to_string(),
            path: path.to_path_buf(),
            pool: RwLock::new(Some(pool)),
            writer: Mutex::new(()),
            snippet_tokens: config.snippet_tokens,
            searches: AtomicU64::new(0),
        })
    }

    pub fn store_id(&self) -> &str {
        &self.store_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of searches this shard has served.
    pub fn search_count(&self) -> u64 {
        self.searches.load(Ordering::Relaxed)
    }

    pub async fn is_open(&self) -> bool {
        self.pool.read().await.is_some()
    }

    async fn pool(&self) -> Result<SqlitePool> {
        self.pool
            .read()
            .await
            .as_ref()
            .cloned()
            .ok_or_else(|| IndexError::ShardClosed.into())
    }

    /// Upsert `messages` in one transaction and advance per-talker checkpoints.
    ///
    /// Any failing row rolls back the whole batch. Returns the number of
    /// documents written.
    pub async fn index_batch(&self, messages: &[Message]) -> Result<usize> {
        if messages.is_empty() {
            return Ok(0);
        }

        let mut docs = Vec::with_capacity(messages.len());
        let mut max_seq: HashMap<&str, i64> = HashMap::new();
        for msg in messages {
            docs.push(Document::from_message(msg)?);
            let seq = max_seq.entry(msg.talker.as_str()).or_insert(msg.seq);
            if msg.seq > *seq {
                *seq = msg.seq;
            }
        }

        let _writer = self.writer.lock().await;
        let pool = self.pool().await?;
        let mut tx = pool.begin().await?;

        for doc in &docs {
            sqlx::query(
                r#"
                INSERT INTO messages (doc_id, talker, sender, unix, seq, content, message_json)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(doc_id) DO UPDATE SET
                    talker = excluded.talker,
                    sender = excluded.sender,
                    unix = excluded.unix,
                    seq = excluded.seq,
                    content = excluded.content,
                    message_json = excluded.message_json
                "#,
            )
            .bind(&doc.id)
            .bind(&doc.talker)
            .bind(&doc.sender)
            .bind(doc.unix)
            .bind(doc.seq)
            .bind(&doc.content)
            .bind(&doc.message_json)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("insert message {}", doc.id))?;
        }

        for (talker, seq) in &max_seq {
            sqlx::query(
                r#"
                INSERT INTO checkpoints (talker, last_seq) VALUES (?, ?)
                ON CONFLICT(talker) DO UPDATE SET last_seq = MAX(last_seq, excluded.last_seq)
                "#,
            )
            .bind(*talker)
            .bind(*seq)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("update checkpoint {}", talker))?;
        }

        tx.commit().await?;

        tracing::debug!(store = %self.store_id, documents = docs.len(), "batch indexed");
        Ok(docs.len())
    }

    /// Ranked search within this shard, plus the unlimited match count.
    ///
    /// Ordered by bm25 ascending, then `unix` and `seq` descending.
    pub async fn search(
        &self,
        query: &ShardQuery,
        offset: usize,
        limit: usize,
    ) -> Result<(Vec<SearchHit>, usize)> {
        self.searches.fetch_add(1, Ordering::Relaxed);
        let pool = self.pool().await?;

        let total: i64 = filtered_query("SELECT COUNT(*)", query)
            .build_query_scalar::<i64>()
            .fetch_one(&pool)
            .await
            .context("count search results")?;

        let select = format!(
            "SELECT m.message_json, \
             COALESCE(snippet(messages_fts, 0, '<mark>', '</mark>', '...', {}), '') AS snippet, \
             COALESCE(bm25(messages_fts), 0.0) AS score",
            self.snippet_tokens
        );
        let mut qb = filtered_query(&select, query);
        qb.push(" ORDER BY score ASC, m.unix DESC, m.seq DESC LIMIT ");
        // a negative LIMIT means unbounded to SQLite
        qb.push_bind(i64::try_from(limit).unwrap_or(i64::MAX));
        qb.push(" OFFSET ");
        qb.push_bind(i64::try_from(offset).unwrap_or(i64::MAX));

        let rows = qb
            .build()
            .fetch_all(&pool)
            .await
            .context("execute search query")?;

        let mut hits = Vec::with_capacity(rows.len());
        for row in &rows {
            let message_json: String = row.get("message_json");
            let message: Message =
                serde_json::from_str(&message_json).context("decode message")?;
            hits.push(SearchHit {
                message,
                snippet: row.get("snippet"),
                score: row.get("score"),
                store_id: self.store_id.clone(),
            });
        }

        Ok((hits, total.max(0) as usize))
    }

    /// Highest sequence number indexed for `talker`.
    pub async fn checkpoint(&self, talker: &str) -> Result<Option<i64>> {
        let pool = self.pool().await?;
        let seq: Option<i64> =
            sqlx::query_scalar("SELECT last_seq FROM checkpoints WHERE talker = ?")
                .bind(talker)
                .fetch_optional(&pool)
                .await?;
        Ok(seq)
    }

    pub async fn document_count(&self) -> Result<i64> {
        let pool = self.pool().await?;
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM messages")
            .fetch_one(&pool)
            .await?)
    }

    pub async fn checkpoint_count(&self) -> Result<i64> {
        let pool = self.pool().await?;
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM checkpoints")
            .fetch_one(&pool)
            .await?)
    }

    /// Close the database handle. No-op if already closed.
    pub async fn close(&self) {
        let pool = self.pool.write().await.take();
        if let Some(pool) = pool {
            pool.close().await;
            tracing::debug!(store = %self.store_id, "shard closed");
        }
    }

    /// Close and delete the shard file with its WAL sidecars.
    pub async fn reset(&self) -> Result<()> {
        self.close().await;
        for path in [self.path.clone(), sidecar(&self.path, "-wal"), sidecar(&self.path, "-shm")] {
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(e).with_context(|| format!("remove {}", path.display()));
                }
            }
        }
        Ok(())
    }
}

fn sidecar(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

async fn init_schema(pool: &SqlitePool) -> Result<()> {
    for stmt in SCHEMA {
        sqlx::query(stmt)
            .execute(pool)
            .await
            .context("init schema statement failed")?;
    }

    let fts_exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='messages_fts'",
    )
    .fetch_one(pool)
    .await?;
    if !fts_exists {
        sqlx::query(FTS_TABLE)
            .execute(pool)
            .await
            .context("create messages_fts")?;
    }

    for stmt in TRIGGERS {
        sqlx::query(stmt)
            .execute(pool)
            .await
            .context("init schema statement failed")?;
    }
    Ok(())
}

fn filtered_query<'a>(select: &str, query: &'a ShardQuery) -> QueryBuilder<'a, Sqlite> {
    let mut qb = QueryBuilder::new(select);
    qb.push(
        " FROM messages_fts JOIN messages m ON m.rowid = messages_fts.rowid \
         WHERE messages_fts MATCH ",
    );
    qb.push_bind(query.match_expr.as_str());

    for (column, values) in [("m.talker", &query.talkers), ("m.sender", &query.senders)] {
        if values.is_empty() {
            continue;
        }
        qb.push(format!(" AND {} IN (", column));
        let mut list = qb.separated(", ");
        for value in values {
            list.push_bind(value.as_str());
        }
        list.push_unseparated(")");
    }
    if query.start_unix > 0 {
        qb.push(" AND m.unix >= ");
        qb.push_bind(query.start_unix);
    }
    if query.end_unix > 0 {
        qb.push(" AND m.unix <= ");
        qb.push_bind(query.end_unix);
    }
    qb
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::compile_query;
    use chrono::{TimeZone, Utc};
    use tempfile::TempDir;

    fn msg(talker: &str, sender: &str, seq: i64, unix: i64, content: &str) -> Message {
        Message {
            seq,
            time: Utc.timestamp_opt(unix, 0).unwrap(),
            talker: talker.to_string(),
            talker_name: String::new(),
            sender: sender.to_string(),
            sender_name: String::new(),
            is_self: false,
            kind: 1,
            content: content.to_string(),
        }
    }

    fn query(raw: &str) -> ShardQuery {
        ShardQuery {
            match_expr: compile_query(raw),
            ..Default::default()
        }
    }

    async fn open_shard(tmp: &TempDir) -> ShardIndex {
        let config = IndexConfig::new(tmp.path());
        ShardIndex::open("msg_0", &tmp.path().join("msg_0.fts.db"), &config)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn reindexing_same_identity_keeps_one_row_with_latest_content() {
        let tmp = TempDir::new().unwrap();
        let shard = open_shard(&tmp).await;

        shard.index_batch(&[msg("room", "a", 1, 100, "old words")]).await.unwrap();
        shard.index_batch(&[msg("room", "a", 1, 100, "fresh words")]).await.unwrap();

        assert_eq!(shard.document_count().await.unwrap(), 1);
        let (hits, total) = shard.search(&query("fresh"), 0, 10).await.unwrap();
        assert_eq!(total, 1);
        assert_eq!(hits[0].message.content, "fresh words");
        let (_, stale) = shard.search(&query("old"), 0, 10).await.unwrap();
        assert_eq!(stale, 0, "fts entry for replaced content must be gone");
    }

    #[tokio::test]
    async fn checkpoints_never_decrease() {
        let tmp = TempDir::new().unwrap();
        let shard = open_shard(&tmp).await;

        shard
            .index_batch(&[msg("room", "a", 5, 100, "x"), msg("room", "a", 9, 101, "y")])
            .await
            .unwrap();
        assert_eq!(shard.checkpoint("room").await.unwrap(), Some(9));

        shard.index_batch(&[msg("room", "a", 3, 99, "z")]).await.unwrap();
        assert_eq!(shard.checkpoint("room").await.unwrap(), Some(9));
        assert_eq!(shard.checkpoint("other").await.unwrap(), None);
        assert_eq!(shard.checkpoint_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn mixed_script_content_matches_either_token() {
        let tmp = TempDir::new().unwrap();
        let shard = open_shard(&tmp).await;
        shard.index_batch(&[msg("room", "a", 1, 100, "hello世界test")]).await.unwrap();

        for term in ["hello", "世界", "TEST"] {
            let (hits, total) = shard.search(&query(term), 0, 10).await.unwrap();
            assert_eq!(total, 1, "term {term} should match");
            assert!(hits[0].snippet.contains("<mark>"));
        }
    }

    #[tokio::test]
    async fn filters_and_ordering() {
        let tmp = TempDir::new().unwrap();
        let shard = open_shard(&tmp).await;
        shard
            .index_batch(&[
                msg("room", "alice", 1, 100, "deploy tonight"),
                msg("room", "bob", 2, 200, "deploy tomorrow"),
                msg("dm", "alice", 1, 300, "deploy now"),
            ])
            .await
            .unwrap();

        let (hits, total) = shard.search(&query("deploy"), 0, 10).await.unwrap();
        assert_eq!(total, 3);
        // identical bm25 scores fall back to newest first
        let times: Vec<i64> = hits.iter().map(|h| h.message.time.timestamp()).collect();
        assert_eq!(times, vec![300, 200, 100]);

        let mut q = query("deploy");
        q.talkers = vec!["room".to_string()];
        q.senders = vec!["alice".to_string()];
        let (hits, total) = shard.search(&q, 0, 10).await.unwrap();
        assert_eq!(total, 1);
        assert_eq!(hits[0].message.seq, 1);

        let mut q = query("deploy");
        q.start_unix = 150;
        q.end_unix = 250;
        let (hits, total) = shard.search(&q, 0, 10).await.unwrap();
        assert_eq!(total, 1);
        assert_eq!(hits[0].message.sender, "bob");
    }

    #[tokio::test]
    async fn total_counts_beyond_limit() {
        let tmp = TempDir::new().unwrap();
        let shard = open_shard(&tmp).await;
        let batch: Vec<Message> = (1..=5).map(|i| msg("room", "a", i, 100 + i, "ping")).collect();
        shard.index_batch(&batch).await.unwrap();

        let (hits, total) = shard.search(&query("ping"), 0, 2).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(total, 5);
        assert_eq!(shard.search_count(), 1);
    }

    #[tokio::test]
    async fn closed_shard_rejects_work_and_close_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let shard = open_shard(&tmp).await;
        shard.close().await;
        shard.close().await;
        assert!(!shard.is_open().await);

        let err = shard.search(&query("x"), 0, 10).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<IndexError>(),
            Some(IndexError::ShardClosed)
        ));
        assert!(shard.index_batch(&[msg("room", "a", 1, 1, "x")]).await.is_err());
    }

    #[tokio::test]
    async fn reset_deletes_file_and_reopen_starts_empty() {
        let tmp = TempDir::new().unwrap();
        let shard = open_shard(&tmp).await;
        shard.index_batch(&[msg("room", "a", 1, 100, "keep")]).await.unwrap();
        shard.reset().await.unwrap();
        shard.reset().await.unwrap();
        assert!(!shard.path().exists());

        let reopened = open_shard(&tmp).await;
        assert_eq!(reopened.document_count().await.unwrap(), 0);
    }
}
