//! Database configuration.

use std::time::Duration;

/// Configuration for opening a database.
#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum depth a revision tree may reach before old history is
    /// pruned. Pruning removes ancestors, never leaves.
    pub max_rev_tree_depth: usize,

    /// Default wait before an empty longpoll changes call gives up.
    pub longpoll_timeout: Duration,

    /// Whether view queries refresh the index before reading by default.
    /// Callers can still request stale reads per query.
    pub update_views_on_query: bool,

    /// Whether to fsync the backend after every committed write.
    pub sync_on_commit: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_rev_tree_depth: 20,
            longpoll_timeout: Duration::from_secs(60),
            update_views_on_query: true,
            sync_on_commit: true,
        }
    }
}

impl Config {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the maximum revision tree depth.
    #[must_use]
    pub const fn max_rev_tree_depth(mut self, depth: usize) -> Self {
        self.max_rev_tree_depth = depth;
        self
    }

    /// Sets the default longpoll timeout.
    #[must_use]
    pub const fn longpoll_timeout(mut self, timeout: Duration) -> Self {
        self.longpoll_timeout = timeout;
        self
    }

    /// Sets whether view queries refresh the index by default.
    #[must_use]
    pub const fn update_views_on_query(mut self, value: bool) -> Self {
        self.update_views_on_query = value;
        self
    }

    /// Sets whether to fsync after every commit.
    #[must_use]
    pub const fn sync_on_commit(mut self, value: bool) -> Self {
        self.sync_on_commit = value;
        self
    }
}
