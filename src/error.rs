//! Contract and state errors raised by the index.
//!
//! Everything fallible returns [`anyhow::Result`]; these variants are the
//! conditions callers may want to match on after a downcast.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum IndexError {
    /// The datasource answered with a blank fingerprint.
    #[error("dataset fingerprint is empty")]
    EmptyFingerprint,

    #[error("empty store id")]
    EmptyStoreId,

    /// The shard's database handle has already been closed.
    #[error("fts index not initialized")]
    ShardClosed,

    #[error("message store not found for talker {0}")]
    StoreNotFound(String),

    #[error("message store {0} not registered")]
    StoreNotRegistered(String),

    #[error("index rebuild cancelled")]
    Cancelled,
}

impl IndexError {
    /// Returns true if `err` (or anything in its chain) is [`IndexError::Cancelled`].
    pub fn is_cancelled(err: &anyhow::Error) -> bool {
        err.chain().any(|cause| {
            matches!(
                cause.downcast_ref::<IndexError>(),
                Some(IndexError::Cancelled)
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn cancelled_is_found_through_context() {
        let err: anyhow::Error = Err::<(), _>(IndexError::Cancelled)
            .context("rebuild talker wxid_a")
            .unwrap_err();
        assert!(IndexError::is_cancelled(&err));
    }

    #[test]
    fn other_errors_are_not_cancellation() {
        let err = anyhow::Error::new(IndexError::EmptyFingerprint);
        assert!(!IndexError::is_cancelled(&err));
        assert!(!IndexError::is_cancelled(&anyhow::anyhow!("disk full")));
    }
}
