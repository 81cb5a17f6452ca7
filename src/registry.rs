//! Set of match channels the caller wants to observe.
//!
//! Channels are additive only: the registry is never cleared and has no
//! removal operation, so every reconnect replays the full set.

use std::collections::HashSet;

/// De-duplicated, insertion-ordered set of match ids.
#[derive(Clone, Debug, Default)]
pub struct ChannelRegistry {
    order: Vec<String>,
    known: HashSet<String>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `match_id`, returning `false` when it was already registered.
    pub fn add(&mut self, match_id: impl Into<String>) -> bool {
        let match_id = match_id.into();
        if self.known.contains(&match_id) {
            return false;
        }
        self.known.insert(match_id.clone());
        self.order.push(match_id);
        true
    }

    /// Adds every id from `match_ids`, returning the ones that were new.
    pub fn extend<I, S>(&mut self, match_ids: I) -> Vec<String>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        match_ids
            .into_iter()
            .map(Into::into)
            .filter(|match_id: &String| self.add(match_id.clone()))
            .collect()
    }

    pub fn contains(&self, match_id: &str) -> bool {
        self.known.contains(match_id)
    }

    /// Current channels, each exactly once.
    pub fn snapshot(&self) -> Vec<String> {
        self.order.clone()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}
