// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Delivery retry policy.
//!
//! A failed attempt is retried when the request never got a response or the
//! endpoint answered 5xx, 408 or 429. Delays grow exponentially:
//!
//! | After attempt | Next attempt in |
//! |---------------|-----------------|
//! | 1             | 2 minutes       |
//! | 2             | 4 minutes       |
//! | 3             | 8 minutes       |
//! | 4             | 16 minutes      |
//! | 5             | never (terminal)|
//!
//! Delays are capped at 24 hours for policies with more attempts.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

/// How a single attempt ended, for retry classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptResult {
    /// The endpoint answered with this status.
    Response(u16),
    /// Connection failure, reset or timeout; no response arrived.
    NetworkFailure,
    /// The request could not be built or sent for a non-transient reason.
    RequestError,
}

impl AttemptResult {
    /// 2xx response.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Response(status) if (200..300).contains(status))
    }

    /// Whether a later attempt might succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Response(status) => *status >= 500 || *status == 408 || *status == 429,
            Self::NetworkFailure => true,
            Self::RequestError => false,
        }
    }
}

/// Configuration for exponential delivery retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: i64,
    /// Delay unit; attempt `n` waits `base * 2^n`.
    pub base: Duration,
    /// Upper bound for a single delay.
    pub cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl RetryPolicy {
    /// Five attempts, delays 2, 4, 8 and 16 minutes.
    pub const DEFAULT: Self = Self {
        max_attempts: 5,
        base: Duration::from_secs(60),
        cap: Duration::from_secs(24 * 60 * 60),
    };

    /// Delay scheduled after attempt number `attempt` (1-based).
    pub fn backoff_for_attempt(&self, attempt: i64) -> Duration {
        let exponent = attempt.clamp(0, 32) as u32;
        self.base
            .checked_mul(2u32.saturating_pow(exponent))
            .map_or(self.cap, |d| d.min(self.cap))
    }

    /// When to retry after attempt number `attempt` ended with `result` at
    /// `now`. `None` means the delivery is terminal.
    pub fn next_retry_at(
        &self,
        attempt: i64,
        result: AttemptResult,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        if result.is_success() || !result.is_retryable() || attempt >= self.max_attempts {
            return None;
        }
        let delay = TimeDelta::from_std(self.backoff_for_attempt(attempt)).unwrap_or(TimeDelta::MAX);
        now.checked_add_signed(delay)
    }
}
