//! Capped exponential backoff shared by placement and apply retries

use crate::error::{Result, SliceError};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn default_initial_ms() -> u64 {
    50
}

fn default_max_ms() -> u64 {
    2_000
}

/// Delay doubles per attempt until it reaches `max_ms`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backoff {
    #[serde(default = "default_initial_ms")]
    pub initial_ms: u64,
    #[serde(default = "default_max_ms")]
    pub max_ms: u64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial_ms: default_initial_ms(),
            max_ms: default_max_ms(),
        }
    }
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial_ms: initial.as_millis() as u64,
            max_ms: max.as_millis() as u64,
        }
    }

    /// Delay before retry number `attempt` (0-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let mut current = self.initial_ms;
        for _ in 0..attempt {
            current = std::cmp::min(current.saturating_mul(2), self.max_ms);
            if current == self.max_ms {
                break;
            }
        }
        Duration::from_millis(std::cmp::min(current, self.max_ms))
    }

    /// Sleep for the delay of `attempt`, returning early on cancellation
    pub async fn wait(&self, attempt: u32, cancel: &CancellationToken) -> Result<()> {
        tokio::select! {
            _ = cancel.cancelled() => Err(SliceError::Cancelled),
            _ = tokio::time::sleep(self.delay(attempt)) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_doubles_until_cap() {
        let backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(500));
        assert_eq!(backoff.delay(0), Duration::from_millis(100));
        assert_eq!(backoff.delay(1), Duration::from_millis(200));
        assert_eq!(backoff.delay(2), Duration::from_millis(400));
        assert_eq!(backoff.delay(3), Duration::from_millis(500));
        assert_eq!(backoff.delay(30), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_wait_observes_cancellation() {
        let backoff = Backoff::new(Duration::from_secs(30), Duration::from_secs(30));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = backoff.wait(0, &cancel).await;
        assert!(matches!(result, Err(SliceError::Cancelled)));
    }
}
