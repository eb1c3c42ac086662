//! Rebuild progress reporting.
//!
//! A full rebuild walks every talker and can take minutes on a large
//! history. Besides updating [`IndexStatus::progress`](crate::models::IndexStatus),
//! the coordinator emits [`RebuildProgressEvent`]s to a reporter so hosts
//! can log or display them.

/// A single progress event for a full rebuild.
#[derive(Clone, Debug, PartialEq)]
pub enum RebuildProgressEvent {
    /// Shards reset and re-synced; `talkers` is the number about to be walked.
    Started { stores: usize, talkers: usize },
    /// `n` of `total` talkers fully indexed and flushed.
    Talker { talker: String, n: usize, total: usize },
    /// Rebuild finished; `documents` written across all shards.
    Finished { documents: u64 },
}

/// Receives rebuild progress. Called from the rebuild task.
pub trait RebuildProgressReporter: Send + Sync {
    fn report(&self, event: RebuildProgressEvent);
}

/// Reports through `tracing`: start/finish at info, per-talker at debug.
pub struct LogProgress;

impl RebuildProgressReporter for LogProgress {
    fn report(&self, event: RebuildProgressEvent) {
        match event {
            RebuildProgressEvent::Started { stores, talkers } => {
                tracing::info!(stores, talkers = %format_number(talkers as u64), "fts rebuild started");
            }
            RebuildProgressEvent::Talker { talker, n, total } => {
                tracing::debug!(
                    %talker,
                    "fts rebuild  {} / {} talkers",
                    format_number(n as u64),
                    format_number(total as u64)
                );
            }
            RebuildProgressEvent::Finished { documents } => {
                tracing::info!(documents = %format_number(documents), "fts rebuild finished");
            }
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl RebuildProgressReporter for NoProgress {
    fn report(&self, _event: RebuildProgressEvent) {}
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    for (i, c) in s.chars().enumerate() {
        if i > 0 && (s.len() - i) % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result
}
