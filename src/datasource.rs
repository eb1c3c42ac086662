//! The contract the index consumes from the chat-history datasource.
//!
//! Backends that parse platform-specific databases implement [`Datasource`];
//! the index only ever sees [`MessageStore`]s, talker names and
//! [`Message`]s.
//!
//! Message iteration is push-based over a bounded channel: the datasource
//! sends into a [`MessageSink`] while the indexer drains it, so a talker's
//! whole history is never buffered in memory at once.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::models::{Message, MessageStore};

/// Sending half handed to [`Datasource::iterate_messages`].
#[derive(Clone)]
pub struct MessageSink {
    tx: mpsc::Sender<Message>,
}

impl MessageSink {
    /// Create a sink and the receiver that drains it.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Deliver one message, waiting while the consumer is behind.
    ///
    /// Fails once the consumer has stopped; implementations should return
    /// that error instead of continuing to iterate.
    pub async fn send(&self, msg: Message) -> Result<()> {
        self.tx
            .send(msg)
            .await
            .map_err(|_| anyhow!("message consumer stopped"))
    }
}

#[async_trait]
pub trait Datasource: Send + Sync {
    /// The current authoritative set of stores. Reflects added or removed files.
    async fn list_message_stores(&self) -> Result<Vec<MessageStore>>;

    /// Resolve the store owning `msg`, `None` if no store claims it.
    fn locate_message_store(&self, msg: &Message) -> Result<Option<MessageStore>>;

    /// Non-empty and stable while the visible message set is unchanged.
    async fn dataset_fingerprint(&self) -> Result<String>;

    /// Every talker (contact or group) worth indexing.
    async fn list_talkers(&self) -> Result<Vec<String>>;

    /// Stream the messages of `talkers` into `sink`.
    ///
    /// Must stop on the first failed send or once `cancel` fires.
    async fn iterate_messages(
        &self,
        cancel: &CancellationToken,
        talkers: &[String],
        sink: MessageSink,
    ) -> Result<()>;
}
