//! Coordinator configuration

use crate::InstanceId;
use serde::{Deserialize, Serialize};

/// What the durable record says after a transaction fails
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Leave the row `IN_PROGRESS` so the next start replays it once.
    /// Begin failures and failed replays are still persisted as `FAILED`.
    KeepForReplay,
    /// Persist `FAILED` with the error text and failed driver
    #[default]
    RecordFailed,
}

/// Startup recovery options
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// A failed replay aborts the whole load; `false` logs and skips it
    pub abort_on_replay_error: bool,
    /// Reason stored on rows canceled for configuration drift
    pub cancel_reason: Box<str>,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            abort_on_replay_error: true,
            cancel_reason: "operation configuration changed since the transaction was recorded".into(),
        }
    }
}

/// Service configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Instance owning the transactions this process creates and replays
    pub instance_id: InstanceId,
    /// Defaults to `RecordFailed`
    #[serde(default)]
    pub failure_policy: FailurePolicy,
    /// Startup recovery options
    #[serde(default)]
    pub recovery: RecoveryConfig,
}

impl ServiceConfig {
    /// Defaults for everything but the instance
    pub fn new(instance_id: InstanceId) -> Self {
        Self {
            instance_id,
            ..Default::default()
        }
    }

    /// Choose what a failure leaves in the system store
    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    /// Replace the startup recovery options
    pub fn with_recovery(mut self, recovery: RecoveryConfig) -> Self {
        self.recovery = recovery;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServiceConfig::new(InstanceId(3));
        assert_eq!(config.failure_policy, FailurePolicy::RecordFailed);
        assert!(config.recovery.abort_on_replay_error);
    }

    #[test]
    fn test_deserialize_partial() {
        let config: ServiceConfig =
            serde_json::from_str(r#"{"instance_id": 4, "failure_policy": "keep_for_replay"}"#).unwrap();
        assert_eq!(config.instance_id, InstanceId(4));
        assert_eq!(config.failure_policy, FailurePolicy::KeepForReplay);
        assert!(config.recovery.abort_on_replay_error);
    }
}
