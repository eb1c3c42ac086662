//! # chatlog-index
//!
//! A federated, incrementally maintained full-text index over local
//! chat-history stores.
//!
//! Every message store a [`Datasource`] exposes gets its own SQLite FTS5
//! shard. A single [`IndexCoordinator`] keeps the shards in step with the
//! datasource: it rebuilds them when the dataset fingerprint changes,
//! appends newly arrived messages, and answers searches by querying every
//! shard and merging their rankings into one page.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌─────────────┐   ┌──────────────┐
//! │ Datasource  │──▶│ Coordinator │──▶│ Shard × N     │
//! │ stores/msgs │   │ rebuild/inc │   │ FTS5 per store│
//! └─────────────┘   └──────┬──────┘   └──────┬───────┘
//!                          │                 │
//!                          ▼                 ▼
//!                    ┌──────────┐      ┌───────────┐
//!                    │  search  │◀─────│ top-K merge│
//!                    └──────────┘      └───────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`datasource`] | Contract consumed from the chat-history backend |
//! | [`normalize`] | Content normalization for mixed-script text |
//! | [`query`] | User query to FTS5 MATCH compilation |
//! | [`shard`] | One SQLite FTS5 database per store |
//! | [`metadata`] | Version and fingerprint sidecar |
//! | [`index`] | Shard set and federated top-K merge |
//! | [`locate`] | Message to store resolution during rebuilds |
//! | [`coordinator`] | Readiness state, rebuild and incremental protocols |
//! | [`progress`] | Rebuild progress reporting |
//! | [`stats`] | Per-shard statistics |
//! | [`error`] | Typed error conditions |

pub mod config;
pub mod coordinator;
pub mod datasource;
pub mod error;
pub mod index;
pub mod locate;
pub mod metadata;
pub mod models;
pub mod normalize;
pub mod progress;
pub mod query;
pub mod shard;
pub mod stats;

pub use config::IndexConfig;
pub use coordinator::IndexCoordinator;
pub use datasource::{Datasource, MessageSink};
pub use error::IndexError;
pub use models::{IndexStatus, Message, MessageStore, SearchHit, SearchRequest, SearchResponse};
