//! Bounded exponential backoff for queued mutations.
//!
//! An action that has failed `k` times becomes eligible again once
//! `base * 2^k` has elapsed since its last attempt. `k` counts completed
//! failed attempts, so with the default one-minute base the waits after the
//! first four failures are 2, 4, 8 and 16 minutes. An action that was never
//! attempted is eligible immediately.

use chrono::{DateTime, Duration, Utc};

use crate::model::MutationRecord;

pub const DEFAULT_MAX_RETRIES: i32 = 5;

// 2^30 of any sane base already exceeds any realistic retry ceiling.
const MAX_EXPONENT: i32 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::minutes(1),
        }
    }
}

impl Backoff {
    pub fn new(base: Duration) -> Self {
        Self { base }
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    /// Wait required after `retry_count` completed failures.
    pub fn window(&self, retry_count: i32) -> Duration {
        let exp = retry_count.clamp(0, MAX_EXPONENT);
        self.base
            .checked_mul(1_i32 << exp)
            .unwrap_or(Duration::MAX)
    }

    /// Earliest instant the action may be attempted again, or `None` when it
    /// has never been attempted.
    pub fn next_attempt_at(&self, action: &MutationRecord) -> Option<DateTime<Utc>> {
        let last = action.last_attempt_at?;
        Some(
            last.checked_add_signed(self.window(action.retry_count))
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        )
    }

    pub fn is_due(&self, action: &MutationRecord, now: DateTime<Utc>) -> bool {
        match self.next_attempt_at(action) {
            None => true,
            Some(at) => now >= at,
        }
    }
}
