//! Pipeline tunables.

use std::time::Duration;

/// Configuration for a [`crate::StreamPipeline`] and its components.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Queue length at which backpressure dropping kicks in.
    pub max_queue_size: usize,
    /// Events delivered per drain batch.
    pub batch_size: usize,
    /// Delay between drain batches (one animation frame).
    pub batch_delay: Duration,

    /// Sliding deduplication window.
    pub dedup_ttl: Duration,
    /// Maximum deduplication entries before oldest-first eviction.
    pub dedup_max_entries: usize,

    /// How long a completed message id keeps rejecting stray duplicates.
    pub completed_ttl: Duration,

    /// Base delay for exponential reconnect backoff.
    pub base_backoff: Duration,
    /// Backoff ceiling.
    pub max_backoff: Duration,
    /// Reconnect attempts before settling in terminal error.
    pub max_reconnect_attempts: u32,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 1000,
            batch_size: 10,
            batch_delay: Duration::from_millis(16),
            dedup_ttl: Duration::from_secs(60),
            dedup_max_entries: 500,
            completed_ttl: Duration::from_secs(30),
            base_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            max_reconnect_attempts: 50,
        }
    }
}
