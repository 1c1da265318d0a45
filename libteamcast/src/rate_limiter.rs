//! Per-account throttle tracking
//!
//! Counts HTTP 429 responses per account in one-hour windows. Once an
//! account collects `threshold` of them inside the current window it should
//! be moved to `RateLimited`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::repository::ThrottleRepository;

const WINDOW_SECS: i64 = 3600;

#[derive(Clone)]
pub struct ThrottleTracker {
    repo: Arc<dyn ThrottleRepository>,
    threshold: u32,
}

impl ThrottleTracker {
    pub fn new(repo: Arc<dyn ThrottleRepository>, threshold: u32) -> Self {
        Self { repo, threshold }
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    /// Record one 429. Returns true once the window has reached the threshold.
    pub async fn record(&self, account_id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let count = self.repo.increment_throttle(account_id, window_start(now)).await?;
        Ok(count >= self.threshold)
    }

    /// Whether the current window is already at the threshold (without recording)
    pub async fn is_throttled(&self, account_id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let count = self.repo.throttle_count(account_id, window_start(now)).await?;
        Ok(count >= self.threshold)
    }

    /// Forget an account's windows after it recovers
    pub async fn reset(&self, account_id: Uuid) -> Result<()> {
        self.repo.clear_throttle(account_id).await
    }

    /// Drop windows that ended before `cutoff`
    pub async fn cleanup_old_windows(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        self.repo.delete_throttle_windows_before(window_start(cutoff)).await
    }
}

/// Unix seconds floored to the hour
fn window_start(at: DateTime<Utc>) -> i64 {
    at.timestamp().div_euclid(WINDOW_SECS) * WINDOW_SECS
}
