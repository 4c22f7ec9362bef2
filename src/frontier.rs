use std::collections::{HashSet, VecDeque};

use crate::canonical::CanonicalUrl;

/// Breadth-first work queue plus the set of URLs already handed out.
///
/// A URL is queued at most once over the frontier's lifetime: once queued it
/// stays in `seen`, so rediscovering it, before or after it is dequeued, is a
/// no-op.
#[derive(Debug, Default)]
pub struct Frontier {
    queue: VecDeque<CanonicalUrl>,
    seen: HashSet<CanonicalUrl>,
    visited: HashSet<CanonicalUrl>,
}

impl Frontier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seeded(seed: CanonicalUrl) -> Self {
        let mut frontier = Self::new();
        frontier.push(seed);
        frontier
    }

    /// Queues `url` unless it was queued or visited before. Returns whether
    /// it was queued.
    pub fn push(&mut self, url: CanonicalUrl) -> bool {
        if self.is_visited(&url) || !self.seen.insert(url.clone()) {
            return false;
        }
        self.queue.push_back(url);
        true
    }

    /// Dequeues the next unvisited URL and marks it visited before handing it
    /// out.
    pub fn next_unvisited(&mut self) -> Option<CanonicalUrl> {
        while let Some(url) = self.queue.pop_front() {
            if self.visited.insert(url.clone()) {
                return Some(url);
            }
        }
        None
    }

    pub fn is_visited(&self, url: &CanonicalUrl) -> bool {
        self.visited.contains(url)
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    pub fn visited_count(&self) -> usize {
        self.visited.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
