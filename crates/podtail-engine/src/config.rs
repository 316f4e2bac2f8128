//! Engine configuration.

use crate::error::{EngineError, Result};

/// Hard ceiling on stream workers; more open follow streams than this is
/// pressure the API server should not be asked to absorb from one client.
pub const MAX_WORKERS: usize = 128;

/// Tuning knobs for a tail session.
///
/// Two separate concurrency domains are configured here: `concurrency`
/// bounds in-flight pod reconciliations (the cluster-fetch path) while
/// `workers` bounds concurrently open log streams.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Stream worker count, bounds concurrently open log streams.
    pub workers: usize,
    /// Pending stream tasks the scheduler queues before rejecting.
    pub queue_depth: usize,
    /// Maximum in-flight pod reconciliations.
    pub concurrency: usize,
    /// Dedup cache capacity in (pod, container) entries.
    pub dedup_capacity: usize,
    /// Request timestamps on log streams and split them off each line.
    pub timestamps: bool,
    /// Only return log lines newer than this many seconds.
    pub since_seconds: Option<i64>,
    /// Number of lines from the end of each log to start with.
    pub tail_lines: Option<i64>,
    /// Qualify output with the namespace (multi-namespace sessions).
    pub namespaced: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: 8,
            queue_depth: 64,
            concurrency: 10,
            dedup_capacity: 1024,
            timestamps: false,
            since_seconds: None,
            tail_lines: None,
            namespaced: false,
        }
    }
}

impl EngineConfig {
    /// Validate ranges before a session starts.
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 || self.workers > MAX_WORKERS {
            return Err(EngineError::InvalidConfig(format!(
                "workers must be between 1 and {MAX_WORKERS}, got {}",
                self.workers
            )));
        }
        if self.queue_depth == 0 {
            return Err(EngineError::InvalidConfig(
                "queue depth must be at least 1".to_string(),
            ));
        }
        if self.concurrency == 0 {
            return Err(EngineError::InvalidConfig(
                "concurrency must be at least 1".to_string(),
            ));
        }
        if self.dedup_capacity == 0 {
            return Err(EngineError::InvalidConfig(
                "dedup capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_zero_workers() {
        let config = EngineConfig {
            workers: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_oversized_worker_count() {
        let config = EngineConfig {
            workers: MAX_WORKERS + 1,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_concurrency() {
        let config = EngineConfig {
            concurrency: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
