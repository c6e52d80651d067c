//! Append-only chunk accumulator with cached materialization.
//!
//! Streaming produces many small content deltas. Joining on every append is
//! quadratic in the number of chunks, so chunks are stored as-is and the
//! joined string is built once, on demand, and cached until the next append.

use std::sync::Arc;

/// Append-only chunk store with lazy, cached string materialization.
#[derive(Debug, Default)]
pub struct ChunkAccumulator {
    chunks: Vec<String>,
    total_len: usize,
    cached: Option<Arc<str>>,
}

impl ChunkAccumulator {
    /// Create an empty accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk. Empty input is a safe no-op.
    pub fn append(&mut self, chunk: &str) {
        if chunk.is_empty() {
            return;
        }
        self.total_len += chunk.len();
        self.chunks.push(chunk.to_string());
        self.cached = None;
    }

    /// The joined content. Materialized once and cached until the next
    /// append; repeated calls return the identical allocation.
    pub fn text(&mut self) -> Arc<str> {
        if let Some(cached) = &self.cached {
            return cached.clone();
        }
        let mut joined = String::with_capacity(self.total_len);
        for chunk in &self.chunks {
            joined.push_str(chunk);
        }
        let cached: Arc<str> = joined.into();
        self.cached = Some(cached.clone());
        cached
    }

    /// Total length of all appended content, in bytes.
    pub fn total_len(&self) -> usize {
        self.total_len
    }

    /// Whether nothing has been appended.
    pub fn is_empty(&self) -> bool {
        self.total_len == 0
    }

    /// Drop all chunks, the running length, and the cache.
    pub fn clear(&mut self) {
        self.chunks.clear();
        self.total_len = 0;
        self.cached = None;
    }
}
