//! When is a chunk complete?

use std::time::{Duration, Instant};

/// Decides when the current chunk has accumulated enough items.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionPolicy {
    /// Complete after a fixed number of items.
    ChunkSize(usize),
    /// Complete once the chunk has been open for the given duration.
    TimeBoxed(Duration),
    /// Complete as soon as any child policy is complete.
    Composite(Vec<CompletionPolicy>),
}

impl Default for CompletionPolicy {
    fn default() -> Self {
        CompletionPolicy::ChunkSize(10)
    }
}

/// Progress of one chunk.
#[derive(Debug, Clone, Copy)]
pub struct ChunkProgress {
    items: usize,
    started_at: Instant,
}

impl ChunkProgress {
    pub fn items(&self) -> usize {
        self.items
    }

    pub fn record_item(&mut self) {
        self.items += 1;
    }
}

impl CompletionPolicy {
    pub fn start(&self) -> ChunkProgress {
        ChunkProgress {
            items: 0,
            started_at: Instant::now(),
        }
    }

    pub fn is_complete(&self, progress: &ChunkProgress) -> bool {
        match self {
            CompletionPolicy::ChunkSize(size) => progress.items >= (*size).max(1),
            CompletionPolicy::TimeBoxed(limit) => progress.started_at.elapsed() >= *limit,
            CompletionPolicy::Composite(policies) => {
                policies.iter().any(|p| p.is_complete(progress))
            }
        }
    }
}
