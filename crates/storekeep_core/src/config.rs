//! Connection manager configuration.

/// Configuration for a [`ConnectionManager`](crate::ConnectionManager).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Version requested when a store is first opened.
    pub initial_version: u64,

    /// How many version bumps one schema change may attempt when other
    /// openers keep moving the store's version.
    pub max_upgrade_attempts: u32,

    /// Whether opening a store that already sits at a higher version falls
    /// back to that version instead of failing.
    pub version_fallback: bool,

    /// Whether a blocked or failed upgrade reopens the store at its current
    /// version so the connection stays usable.
    pub restore_on_failure: bool,

    /// Number of events kept for [`EventFeed::poll`](crate::EventFeed::poll).
    pub event_history: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            initial_version: 1,
            max_upgrade_attempts: 3,
            version_fallback: true,
            restore_on_failure: true,
            event_history: 1000,
        }
    }
}

impl Config {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the version requested on first open.
    #[must_use]
    pub const fn initial_version(mut self, version: u64) -> Self {
        self.initial_version = version;
        self
    }

    /// Sets the number of version bumps a schema change may attempt.
    #[must_use]
    pub const fn max_upgrade_attempts(mut self, attempts: u32) -> Self {
        self.max_upgrade_attempts = attempts;
        self
    }

    /// Sets whether opens fall back to the store's current version.
    #[must_use]
    pub const fn version_fallback(mut self, value: bool) -> Self {
        self.version_fallback = value;
        self
    }

    /// Sets whether failed upgrades restore a live handle.
    #[must_use]
    pub const fn restore_on_failure(mut self, value: bool) -> Self {
        self.restore_on_failure = value;
        self
    }

    /// Sets the event history size.
    #[must_use]
    pub const fn event_history(mut self, size: usize) -> Self {
        self.event_history = size;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = Config::default();
        assert_eq!(config.initial_version, 1);
        assert_eq!(config.max_upgrade_attempts, 3);
        assert!(config.version_fallback);
        assert!(config.restore_on_failure);
    }

    #[test]
    fn builder_pattern() {
        let config = Config::new()
            .initial_version(4)
            .version_fallback(false)
            .max_upgrade_attempts(1)
            .event_history(10);

        assert_eq!(config.initial_version, 4);
        assert!(!config.version_fallback);
        assert_eq!(config.max_upgrade_attempts, 1);
        assert_eq!(config.event_history, 10);
    }
}
