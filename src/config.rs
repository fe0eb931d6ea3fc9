// System
use std::time::Duration;

// Local
use crate::backoff::BackoffPolicy;
use crate::error::{CollectorError, Result};

/// Default lower bound of the reconnect backoff ladder.
pub const MINIMUM_BACKOFF: Duration = Duration::from_secs(60);
/// Default ceiling of the reconnect backoff ladder.
pub const MAXIMUM_BACKOFF: Duration = Duration::from_secs(60 * 60);

/// Upper bound accepted for any configured duration.
pub const MAXIMUM_CONFIG_DURATION: Duration = Duration::from_secs(30 * 24 * 60 * 60);

const WATCHER_MINIMUM_BACKOFF: Duration = Duration::from_secs(1);
const WATCHER_MAXIMUM_BACKOFF: Duration = Duration::from_secs(30);

/// Tunables of the collector's connection admission and translation pipeline.
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    pub min_backoff: Duration,
    pub max_backoff: Duration,
    /// A connection that stayed up longer than this resets the backoff ladder.
    pub recovery_threshold: Duration,
    /// Size of the admission lease pool. Zero disables cold-start admission.
    pub cold_start_num: u32,
    /// Cold start is abandoned once this much time has passed since process start.
    pub max_cold_start_duration: Duration,
    /// Longest a single node waits for an admission lease before connecting anyway.
    pub max_wait_for_lease: Duration,
    /// Seconds of startup delay contributed by each node in the fleet.
    pub per_node_conn_delay: f64,
    pub min_random_conn_delay: Duration,
    pub max_random_conn_delay: Duration,
    pub event_queue_len: usize,
    /// Longest the collector waits for its mirrors' initial sync before connecting.
    pub startup_sync_wait: Duration,
    /// Interval between event counter log lines. Zero disables logging.
    pub event_counts_log_time: Duration,
    pub watcher_min_backoff: Duration,
    pub watcher_max_backoff: Duration,
    pub lease_namespace: String,
    pub lease_prefix: String,
    pub lease_ttl: Duration,
    pub lease_poll_interval: Duration,
    pub collector_address: String,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            min_backoff: MINIMUM_BACKOFF,
            max_backoff: MAXIMUM_BACKOFF,
            recovery_threshold: MAXIMUM_BACKOFF,
            cold_start_num: 0,
            max_cold_start_duration: Duration::from_secs(15 * 60),
            max_wait_for_lease: Duration::from_secs(5 * 60),
            per_node_conn_delay: 0.0,
            min_random_conn_delay: Duration::ZERO,
            max_random_conn_delay: Duration::ZERO,
            event_queue_len: 1024,
            startup_sync_wait: Duration::from_secs(60),
            event_counts_log_time: Duration::from_secs(60),
            watcher_min_backoff: WATCHER_MINIMUM_BACKOFF,
            watcher_max_backoff: WATCHER_MAXIMUM_BACKOFF,
            lease_namespace: "default".to_string(),
            lease_prefix: "congroup-cold-start".to_string(),
            lease_ttl: Duration::from_secs(30),
            lease_poll_interval: Duration::from_secs(2),
            collector_address: "127.0.0.1:6443".to_string(),
        }
    }
}

impl CollectorConfig {
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("min_backoff", self.min_backoff),
            ("max_backoff", self.max_backoff),
            ("recovery_threshold", self.recovery_threshold),
            ("max_cold_start_duration", self.max_cold_start_duration),
            ("max_wait_for_lease", self.max_wait_for_lease),
            ("min_random_conn_delay", self.min_random_conn_delay),
            ("max_random_conn_delay", self.max_random_conn_delay),
            ("startup_sync_wait", self.startup_sync_wait),
            ("event_counts_log_time", self.event_counts_log_time),
            ("watcher_max_backoff", self.watcher_max_backoff),
            ("lease_ttl", self.lease_ttl),
            ("lease_poll_interval", self.lease_poll_interval),
        ] {
            if value > MAXIMUM_CONFIG_DURATION {
                return Err(CollectorError::Configuration(format!(
                    "{} {:?} exceeds {:?}",
                    name, value, MAXIMUM_CONFIG_DURATION
                )));
            }
        }
        if self.min_backoff > self.max_backoff {
            return Err(CollectorError::Configuration(format!(
                "min_backoff {:?} exceeds max_backoff {:?}",
                self.min_backoff, self.max_backoff
            )));
        }
        if self.watcher_min_backoff > self.watcher_max_backoff {
            return Err(CollectorError::Configuration(format!(
                "watcher_min_backoff {:?} exceeds watcher_max_backoff {:?}",
                self.watcher_min_backoff, self.watcher_max_backoff
            )));
        }
        if self.event_queue_len == 0 {
            return Err(CollectorError::Configuration(
                "event_queue_len must be greater than zero".to_string(),
            ));
        }
        if !self.per_node_conn_delay.is_finite() || self.per_node_conn_delay < 0.0 {
            return Err(CollectorError::Configuration(format!(
                "per_node_conn_delay must be a non-negative number, got {}",
                self.per_node_conn_delay
            )));
        }
        Ok(())
    }

    /// Backoff applied between streaming connection and admission attempts.
    pub fn connection_backoff(&self) -> BackoffPolicy {
        BackoffPolicy::new(self.min_backoff, self.max_backoff)
            .with_recovery_threshold(self.recovery_threshold)
    }

    /// Backoff applied between watch stream restarts.
    pub fn watcher_backoff(&self) -> BackoffPolicy {
        BackoffPolicy::new(self.watcher_min_backoff, self.watcher_max_backoff)
    }

    pub fn cold_start_enabled(&self) -> bool {
        self.cold_start_num > 0
    }
}
