//! Dispatcher configuration.
//!
//! Every knob has a `DEFAULT_*` constant and a `SWITCHYARD_*` environment
//! override. Unset, unparsable or zero overrides fall back to the default.

use std::time::Duration;

pub const DEFAULT_MAX_CONCURRENT_CALLS: usize = 16;
pub const DEFAULT_MAX_CONCURRENT_INSTANCES: usize = 26;
pub const DEFAULT_MAX_CONCURRENT_SESSIONS: usize = 10;
pub const DEFAULT_CLOSE_AFTER_FAULT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_TRANSACTION_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_FILTER_NODE_QUOTA: usize = 100_000;
pub const DEFAULT_MAX_REPLY_TOMBSTONES: usize = 1024;

fn env_usize(name: &str, default: usize) -> usize {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(default)
}

fn env_millis(name: &str) -> Option<Duration> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|v| *v > 0)
        .map(Duration::from_millis)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatcherConfig {
    /// Calls admitted at once across all channels sharing a throttle.
    pub max_concurrent_calls: usize,
    /// Live instance contexts admitted at once.
    pub max_concurrent_instances: usize,
    /// Sessions admitted at once.
    pub max_concurrent_sessions: usize,
    /// Grace period for closing a session channel after an unhandled fault
    /// was replied to.
    pub close_after_fault_timeout: Duration,
    /// Timeout for replies and duplex sends.
    pub send_timeout: Duration,
    pub transaction_timeout: Duration,
    /// Work budget for a single filter evaluation.
    pub filter_node_quota: usize,
    /// Abort sessions idle for this long. `None` disables the idle timer.
    pub session_idle_timeout: Option<Duration>,
    /// Correlation keys remembered after a request completed without a reply.
    pub max_reply_tombstones: usize,
    /// Requests drained per transaction batch. Zero disables batching.
    pub max_batch_size: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_concurrent_calls: DEFAULT_MAX_CONCURRENT_CALLS,
            max_concurrent_instances: DEFAULT_MAX_CONCURRENT_INSTANCES,
            max_concurrent_sessions: DEFAULT_MAX_CONCURRENT_SESSIONS,
            close_after_fault_timeout: DEFAULT_CLOSE_AFTER_FAULT_TIMEOUT,
            send_timeout: DEFAULT_SEND_TIMEOUT,
            transaction_timeout: DEFAULT_TRANSACTION_TIMEOUT,
            filter_node_quota: DEFAULT_FILTER_NODE_QUOTA,
            session_idle_timeout: None,
            max_reply_tombstones: DEFAULT_MAX_REPLY_TOMBSTONES,
            max_batch_size: 0,
        }
    }
}

impl DispatcherConfig {
    /// Defaults overridden by any `SWITCHYARD_*` variables that are set.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_concurrent_calls: env_usize(
                "SWITCHYARD_MAX_CONCURRENT_CALLS",
                defaults.max_concurrent_calls,
            ),
            max_concurrent_instances: env_usize(
                "SWITCHYARD_MAX_CONCURRENT_INSTANCES",
                defaults.max_concurrent_instances,
            ),
            max_concurrent_sessions: env_usize(
                "SWITCHYARD_MAX_CONCURRENT_SESSIONS",
                defaults.max_concurrent_sessions,
            ),
            close_after_fault_timeout: env_millis("SWITCHYARD_CLOSE_AFTER_FAULT_TIMEOUT_MS")
                .unwrap_or(defaults.close_after_fault_timeout),
            send_timeout: env_millis("SWITCHYARD_SEND_TIMEOUT_MS").unwrap_or(defaults.send_timeout),
            transaction_timeout: env_millis("SWITCHYARD_TRANSACTION_TIMEOUT_MS")
                .unwrap_or(defaults.transaction_timeout),
            filter_node_quota: env_usize(
                "SWITCHYARD_FILTER_NODE_QUOTA",
                defaults.filter_node_quota,
            ),
            session_idle_timeout: env_millis("SWITCHYARD_SESSION_IDLE_TIMEOUT_MS"),
            max_reply_tombstones: env_usize(
                "SWITCHYARD_MAX_REPLY_TOMBSTONES",
                defaults.max_reply_tombstones,
            ),
            max_batch_size: env_usize("SWITCHYARD_MAX_BATCH_SIZE", defaults.max_batch_size),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_values_fall_back_to_defaults() {
        assert_eq!(env_usize("SWITCHYARD_TEST_UNSET_KNOB", 5), 5);
        assert_eq!(env_millis("SWITCHYARD_TEST_UNSET_KNOB"), None);
    }

    #[test]
    fn defaults_disable_optional_features() {
        let config = DispatcherConfig::default();
        assert_eq!(config.session_idle_timeout, None);
        assert_eq!(config.max_batch_size, 0);
        assert_eq!(config.close_after_fault_timeout, Duration::from_secs(10));
    }
}
