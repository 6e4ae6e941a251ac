//! Runtime configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigurationError;

/// Default idle timeout for owners: 5 minutes.
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// When applied events are handed to the event log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitPolicy {
    /// The owner commits after every successful perform.
    #[default]
    Automatic,
    /// Applied events stay pending until
    /// [`AggregateOperations::commit`](crate::AggregateOperations::commit)
    /// is called.
    ///
    /// If an owner loses pending events (node stop, idle deactivation, a
    /// panicking mutation), the next operation on the instance fails with
    /// [`DispatchError::UncommittedEventsLost`](crate::DispatchError::UncommittedEventsLost).
    Manual,
}

/// Settings for the owners and the in-process cluster.
///
/// Deserializable from JSON with durations in milliseconds:
///
/// ```
/// use aggregate_runtime::{CommitPolicy, RuntimeConfig};
///
/// let config: RuntimeConfig = serde_json::from_str(
///     r#"{ "idle_timeout": 250, "nodes": 3, "commit_policy": "manual" }"#,
/// ).unwrap();
/// assert_eq!(config.idle_timeout.as_millis(), 250);
/// assert_eq!(config.nodes, 3);
/// assert_eq!(config.commit_policy, CommitPolicy::Manual);
/// assert_eq!(config.mailbox_capacity, 32);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// How long an owner waits for an operation before deactivating.
    ///
    /// Default: 5 minutes.
    #[serde(with = "duration_ms")]
    pub idle_timeout: Duration,

    /// Capacity of each owner's mailbox.
    ///
    /// Default: 32.
    pub mailbox_capacity: usize,

    /// Number of in-process nodes owners are placed on.
    ///
    /// Default: 1.
    pub nodes: u32,

    /// How often a single operation may be handed back by a departing owner
    /// before the dispatch gives up.
    ///
    /// Default: 3.
    pub max_relocations: u32,

    /// When applied events are committed.
    ///
    /// Default: [`CommitPolicy::Automatic`].
    pub commit_policy: CommitPolicy,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            mailbox_capacity: 32,
            nodes: 1,
            max_relocations: 3,
            commit_policy: CommitPolicy::Automatic,
        }
    }
}

impl RuntimeConfig {
    /// Check that every value is usable.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigurationError::InvalidRuntimeConfig`] naming the first
    /// out-of-range value.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.idle_timeout.is_zero() {
            return Err(ConfigurationError::InvalidRuntimeConfig {
                reason: "idle_timeout must be greater than zero",
            });
        }
        if self.mailbox_capacity == 0 {
            return Err(ConfigurationError::InvalidRuntimeConfig {
                reason: "mailbox_capacity must be at least 1",
            });
        }
        if self.nodes == 0 {
            return Err(ConfigurationError::InvalidRuntimeConfig {
                reason: "nodes must be at least 1",
            });
        }
        Ok(())
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(value: &Duration, ser: S) -> Result<S::Ok, S::Error> {
        let millis = u64::try_from(value.as_millis()).unwrap_or(u64::MAX);
        ser.serialize_u64(millis)
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Duration, D::Error> {
        u64::deserialize(de).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = RuntimeConfig::default();
        assert_eq!(config.idle_timeout, Duration::from_secs(300));
        assert_eq!(config.mailbox_capacity, 32);
        assert_eq!(config.nodes, 1);
        assert_eq!(config.max_relocations, 3);
        assert_eq!(config.commit_policy, CommitPolicy::Automatic);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn serializes_durations_as_millis() {
        let config = RuntimeConfig {
            idle_timeout: Duration::from_millis(1500),
            ..RuntimeConfig::default()
        };
        let json = serde_json::to_value(&config).expect("serialize");
        assert_eq!(json["idle_timeout"], 1500);
        assert_eq!(json["commit_policy"], "automatic");

        let back: RuntimeConfig = serde_json::from_value(json).expect("deserialize");
        assert_eq!(back, config);
    }

    #[test]
    fn empty_object_deserializes_to_defaults() {
        let config: RuntimeConfig = serde_json::from_str("{}").expect("deserialize");
        assert_eq!(config, RuntimeConfig::default());
    }

    #[test]
    fn validate_rejects_zero_values() {
        let zero_nodes = RuntimeConfig {
            nodes: 0,
            ..RuntimeConfig::default()
        };
        assert!(matches!(
            zero_nodes.validate(),
            Err(ConfigurationError::InvalidRuntimeConfig { .. })
        ));

        let zero_mailbox = RuntimeConfig {
            mailbox_capacity: 0,
            ..RuntimeConfig::default()
        };
        assert!(zero_mailbox.validate().is_err());

        let zero_idle = RuntimeConfig {
            idle_timeout: Duration::ZERO,
            ..RuntimeConfig::default()
        };
        assert!(zero_idle.validate().is_err());
    }
}
