// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Retry delay policies for failed tasks.

use std::time::Duration;

/// Delay before a failed task becomes eligible again.
///
/// The default is linear: `retry_count × 1 minute`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffPolicy {
    /// `retry_count × step`
    Linear {
        /// Delay added per failure.
        step: Duration,
    },
    /// Same delay after every failure.
    Fixed {
        /// The delay.
        delay: Duration,
    },
    /// `base × 2^(retry_count - 1)`, capped at `max`.
    Exponential {
        /// Delay after the first failure.
        base: Duration,
        /// Upper bound.
        max: Duration,
    },
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::Linear {
            step: Duration::from_secs(60),
        }
    }
}

impl BackoffPolicy {
    /// Delay to apply after the `retry_count`-th failure (1-based).
    pub fn delay(&self, retry_count: u32) -> Duration {
        match *self {
            Self::Linear { step } => step.saturating_mul(retry_count),
            Self::Fixed { delay } => delay,
            Self::Exponential { base, max } => {
                let exponent = retry_count.saturating_sub(1).min(31);
                base.saturating_mul(1u32 << exponent).min(max)
            }
        }
    }
}
