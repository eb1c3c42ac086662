//! Core data models used throughout the index.
//!
//! Messages and stores come from the datasource; documents are what a shard
//! persists; requests, hits and status are what callers see.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;

/// A single chat message as produced by the datasource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub seq: i64,
    pub time: DateTime<Utc>,
    pub talker: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub talker_name: String,
    pub sender: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sender_name: String,
    #[serde(default)]
    pub is_self: bool,
    #[serde(rename = "type", default)]
    pub kind: i64,
    #[serde(default)]
    pub content: String,
}

impl Message {
    /// Text that should be searchable for this message.
    pub fn plain_text_content(&self) -> &str {
        self.content.trim()
    }

    /// Stable document identity: `talker:seq`.
    pub fn doc_id(&self) -> String {
        format!("{}:{}", self.talker, self.seq)
    }
}

/// Lowercase hex MD5 of a talker name, the key stores use in [`MessageStore::talkers`].
pub fn talker_hash(talker: &str) -> String {
    format!("{:x}", md5::compute(talker.trim().as_bytes()))
}

/// One physical source database and the window of time it is authoritative for.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageStore {
    pub id: String,
    pub file_path: PathBuf,
    /// Explicit shard location; relative paths are resolved against the index base dir.
    pub index_path: Option<PathBuf>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    /// Talker hashes (see [`talker_hash`]) known to live in this store.
    pub talkers: HashSet<String>,
}

impl MessageStore {
    pub fn new(id: impl Into<String>, file_path: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            file_path: file_path.into(),
            ..Default::default()
        }
    }

    pub fn add_talker(&mut self, talker: &str) {
        self.talkers.insert(talker_hash(talker));
    }

    pub fn has_talker_hash(&self, hash: &str) -> bool {
        self.talkers.contains(hash)
    }

    /// Whether `time` falls in `[start_time, end_time)`. Missing bounds are open.
    pub fn covers(&self, time: &DateTime<Utc>) -> bool {
        let after_start = self.start_time.map_or(true, |start| *time >= start);
        let before_end = self.end_time.map_or(true, |end| *time < end);
        after_start && before_end
    }
}

/// The indexed unit: one row in a shard's `messages` table.
#[derive(Debug, Clone)]
pub struct Document {
    pub id: String,
    pub talker: String,
    pub sender: String,
    pub unix: i64,
    pub seq: i64,
    pub content: String,
    pub message_json: String,
}

impl Document {
    pub fn from_message(msg: &Message) -> Result<Self> {
        let message_json = serde_json::to_string(msg)
            .with_context(|| format!("marshal message {}", msg.doc_id()))?;
        Ok(Self {
            id: msg.doc_id(),
            talker: msg.talker.clone(),
            sender: msg.sender.clone(),
            unix: msg.time.timestamp(),
            seq: msg.seq,
            content: crate::normalize::normalize_content(msg.plain_text_content()),
            message_json,
        })
    }
}

/// A user's search request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    #[serde(default)]
    pub talkers: Vec<String>,
    #[serde(default)]
    pub senders: Vec<String>,
    #[serde(default)]
    pub start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end: Option<DateTime<Utc>>,
    #[serde(default)]
    pub offset: usize,
    /// Page size; `0` means the configured default.
    #[serde(default)]
    pub limit: usize,
}

impl SearchRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Default::default()
        }
    }

    /// `(start, end)` as Unix seconds, `0` meaning unbounded, swapped if reversed.
    pub fn unix_bounds(&self) -> (i64, i64) {
        let start = self.start.map_or(0, |t| t.timestamp().max(0));
        let end = self.end.map_or(0, |t| t.timestamp().max(0));
        if start > 0 && end > 0 && end < start {
            (end, start)
        } else {
            (start, end)
        }
    }
}

/// A single hit mapped back to its original message.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub message: Message,
    pub snippet: String,
    /// FTS5 bm25 score; lower is better.
    pub score: f64,
    pub store_id: String,
}

/// Readiness of the index, shown to callers alongside every search.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IndexStatus {
    pub ready: bool,
    pub in_progress: bool,
    pub progress: f64,
    pub last_started_at: Option<DateTime<Utc>>,
    pub last_completed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResponse {
    pub total: usize,
    pub hits: Vec<SearchHit>,
    pub duration_ms: u64,
    pub limit: usize,
    pub offset: usize,
    pub query: String,
    /// `None` when indexing is disabled.
    pub index: Option<IndexStatus>,
}

impl SearchResponse {
    pub fn empty(req: &SearchRequest, limit: usize, index: Option<IndexStatus>) -> Self {
        Self {
            total: 0,
            hits: Vec::new(),
            duration_ms: 0,
            limit,
            offset: req.offset,
            query: req.query.clone(),
            index,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn store_window_is_half_open() {
        let mut store = MessageStore::new("msg_0", "/data/msg_0.db");
        store.start_time = Some(ts(100));
        store.end_time = Some(ts(200));
        assert!(store.covers(&ts(100)));
        assert!(store.covers(&ts(199)));
        assert!(!store.covers(&ts(200)));
        assert!(!store.covers(&ts(99)));
    }

    #[test]
    fn talker_hash_matches_md5_hex() {
        assert_eq!(talker_hash("filehelper"), talker_hash("  filehelper "));
        assert_eq!(talker_hash("abc"), "900150983cd24fb0d6963f7d28e17f72");
    }

    #[test]
    fn document_identity_and_normalized_content() {
        let msg = Message {
            seq: 42,
            time: ts(1_700_000_000),
            talker: "wxid_a".into(),
            talker_name: String::new(),
            sender: "wxid_b".into(),
            sender_name: String::new(),
            is_self: false,
            kind: 1,
            content: "Hello世界".into(),
        };
        let doc = Document::from_message(&msg).unwrap();
        assert_eq!(doc.id, "wxid_a:42");
        assert_eq!(doc.unix, 1_700_000_000);
        assert_eq!(doc.content, "hello 世界");
        let back: Message = serde_json::from_str(&doc.message_json).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn reversed_bounds_are_swapped() {
        let mut req = SearchRequest::new("x");
        req.start = Some(ts(500));
        req.end = Some(ts(100));
        assert_eq!(req.unix_bounds(), (100, 500));
        req.end = None;
        assert_eq!(req.unix_bounds(), (500, 0));
    }
}
