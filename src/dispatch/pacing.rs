use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::GroupMailError;

/// Delay before retrying a transiently failed send, by attempt number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RetryBackoff {
    Fixed { delay_ms: u64 },
    /// delay = base_delay_ms * 2^(attempt - 1), capped at max_delay_ms.
    Exponential { base_delay_ms: u64, max_delay_ms: u64 },
}

impl Default for RetryBackoff {
    fn default() -> Self {
        RetryBackoff::Exponential {
            base_delay_ms: 1000,
            max_delay_ms: 60_000,
        }
    }
}

impl RetryBackoff {
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let ms = match self {
            RetryBackoff::Fixed { delay_ms } => *delay_ms,
            RetryBackoff::Exponential {
                base_delay_ms,
                max_delay_ms,
            } => {
                let factor = 2u64.checked_pow(attempt.saturating_sub(1)).unwrap_or(u64::MAX);
                base_delay_ms.saturating_mul(factor).min(*max_delay_ms)
            }
        };
        Duration::from_millis(ms)
    }
}

/// Throughput and retry limits for a dispatch run.
#[derive(Debug, Clone, PartialEq)]
pub struct PacingConfig {
    pub batch_size: usize,
    pub inter_job_delay: Duration,
    pub inter_batch_delay: Duration,
    pub max_attempts_per_job: u32,
    pub retry_backoff: RetryBackoff,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            inter_job_delay: Duration::from_secs(2),
            inter_batch_delay: Duration::from_secs(30),
            max_attempts_per_job: 3,
            retry_backoff: RetryBackoff::default(),
        }
    }
}

impl PacingConfig {
    /// No waiting anywhere.
    #[cfg(test)]
    pub fn immediate(batch_size: usize, max_attempts_per_job: u32) -> Self {
        Self {
            batch_size,
            inter_job_delay: Duration::ZERO,
            inter_batch_delay: Duration::ZERO,
            max_attempts_per_job,
            retry_backoff: RetryBackoff::Fixed { delay_ms: 0 },
        }
    }

    pub fn validate(&self) -> Result<(), GroupMailError> {
        if self.batch_size < 1 {
            return Err(GroupMailError::config("batch_size must be at least 1"));
        }
        if self.max_attempts_per_job < 1 {
            return Err(GroupMailError::config(
                "max_attempts_per_job must be at least 1",
            ));
        }
        Ok(())
    }
}
