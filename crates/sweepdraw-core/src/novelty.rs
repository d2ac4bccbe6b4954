// Novelty detection: decides whether an allocation deserves a reveal.

use std::collections::HashSet;

use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Novelty {
    /// Part of the initial load, or seen before initialization.
    PreExisting,
    /// Already revealed in this session.
    AlreadyPresented,
    /// New since the initial load; recorded as presented by `classify`.
    Novel,
}

/// Tracks the ids present at initial load and the ids already revealed.
/// Both sets live for the whole session and only `reset` clears them.
#[derive(Debug, Default)]
pub struct NoveltyDetector {
    initialized: bool,
    initial: HashSet<String>,
    presented: HashSet<String>,
}

impl NoveltyDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Record the allocation ids present at initial load. Subsequent calls
    /// are ignored.
    pub fn mark_initialized<I, S>(&mut self, ids: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if self.initialized {
            warn!("novelty detector already initialized; ignoring new initial set");
            return;
        }
        self.initial = ids.into_iter().map(Into::into).collect();
        self.initialized = true;
    }

    pub fn classify(&mut self, id: &str) -> Novelty {
        if !self.initialized || self.initial.contains(id) {
            return Novelty::PreExisting;
        }
        if self.presented.contains(id) {
            return Novelty::AlreadyPresented;
        }
        self.presented.insert(id.to_string());
        Novelty::Novel
    }

    /// Forget everything; only for a full session restart.
    pub fn reset(&mut self) {
        self.initialized = false;
        self.initial.clear();
        self.presented.clear();
    }
}
