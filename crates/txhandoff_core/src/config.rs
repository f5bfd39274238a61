//! Handoff and reference manager configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for a [`HandoffContext`](crate::HandoffContext).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HandoffConfig {
    /// Label used in log events emitted by this context.
    pub name: String,

    /// Whether an unclosed connector closes itself when dropped on its
    /// owning thread.
    pub close_on_drop: bool,
}

impl Default for HandoffConfig {
    fn default() -> Self {
        Self {
            name: "handoff".to_string(),
            close_on_drop: true,
        }
    }
}

impl HandoffConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the log label.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Sets whether dropped connectors close themselves.
    #[must_use]
    pub fn close_on_drop(mut self, value: bool) -> Self {
        self.close_on_drop = value;
        self
    }
}

/// Configuration for the [`InMemoryTransactionManager`](crate::InMemoryTransactionManager).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Kind reported by the manager.
    pub name: String,

    /// Timeout applied when a definition does not carry one (None = no timeout).
    pub default_timeout: Option<Duration>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            name: "in-memory".to_string(),
            default_timeout: None,
        }
    }
}

impl ManagerConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the reported manager kind.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Sets the default transaction timeout.
    #[must_use]
    pub const fn default_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_timeout = timeout;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = HandoffConfig::default();
        assert!(config.close_on_drop);
        assert_eq!(config.name, "handoff");

        let manager = ManagerConfig::default();
        assert!(manager.default_timeout.is_none());
    }

    #[test]
    fn builder_pattern() {
        let config = HandoffConfig::new().name("pipeline").close_on_drop(false);
        assert_eq!(config.name, "pipeline");
        assert!(!config.close_on_drop);

        let manager = ManagerConfig::new()
            .name("jta")
            .default_timeout(Some(Duration::from_secs(30)));
        assert_eq!(manager.name, "jta");
        assert_eq!(manager.default_timeout, Some(Duration::from_secs(30)));
    }

    #[test]
    fn config_from_json_fills_defaults() {
        let config: HandoffConfig = serde_json::from_str(r#"{"name":"sender"}"#).unwrap();
        assert_eq!(config.name, "sender");
        assert!(config.close_on_drop);

        let manager: ManagerConfig =
            serde_json::from_str(r#"{"default_timeout":{"secs":5,"nanos":0}}"#).unwrap();
        assert_eq!(manager.name, "in-memory");
        assert_eq!(manager.default_timeout, Some(Duration::from_secs(5)));
    }
}
