//! Backoff configuration and delay calculation for automatic resumes.

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Delay strategy applied before an automatic resume. Values are milliseconds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackOff {
    /// Base delay.
    pub delay: i64,
    /// Upper bound. Required when `random` is set.
    #[serde(default)]
    pub max_delay: Option<i64>,
    /// Linear growth factor applied per attempt.
    #[serde(default)]
    pub multiplier: Option<i64>,
    /// Pick a uniformly random delay in `[delay, max_delay]`.
    #[serde(default)]
    pub random: bool,
}

impl BackOff {
    /// A fixed delay.
    #[must_use]
    pub const fn fixed(delay: i64) -> Self {
        Self {
            delay,
            max_delay: None,
            multiplier: None,
            random: false,
        }
    }

    /// Sets the multiplier.
    #[must_use]
    pub const fn with_multiplier(mut self, multiplier: i64) -> Self {
        self.multiplier = Some(multiplier);
        self
    }

    /// Sets the maximum delay.
    #[must_use]
    pub const fn with_max_delay(mut self, max_delay: i64) -> Self {
        self.max_delay = Some(max_delay);
        self
    }

    /// Enables random delays.
    #[must_use]
    pub const fn randomized(mut self) -> Self {
        self.random = true;
        self
    }

    /// Appends validation failures to `errors`.
    pub fn validate(&self, errors: &mut Vec<String>) {
        if self.delay < 0 {
            errors.push("delay must not be negative".to_string());
        }
        if self.random && self.max_delay.is_none() {
            errors.push("Must set maxDelay when random is true".to_string());
        }
        if let Some(max_delay) = self.max_delay {
            if max_delay < self.delay {
                errors.push("maxDelay must not be lower than delay".to_string());
            }
            if max_delay < 0 {
                errors.push("maxDelay must not be negative".to_string());
            }
        }
        if self.multiplier.is_some_and(|m| m < 1) {
            errors.push("multiplier must be positive".to_string());
        }
    }
}

/// Computes the delay before resuming after `attempt` failed attempts.
///
/// Random backoffs ignore the attempt and pick from `[delay, max_delay]`.
/// Otherwise the delay grows as `delay * multiplier * attempt` when a
/// non-zero multiplier is set and stays at `delay` when it is not. Positive
/// `max_delay` caps the result. Arithmetic saturates.
#[must_use]
pub fn compute_delay(back_off: &BackOff, attempt: u32) -> u64 {
    let delay = u64::try_from(back_off.delay).unwrap_or(0);
    let max_delay = back_off
        .max_delay
        .and_then(|m| u64::try_from(m).ok())
        .filter(|m| *m > 0);

    if back_off.random {
        return match max_delay {
            Some(max) if max > delay => rand::thread_rng().gen_range(delay..=max),
            _ => delay,
        };
    }

    let computed = match back_off
        .multiplier
        .and_then(|m| u64::try_from(m).ok())
        .filter(|m| *m > 0)
    {
        Some(multiplier) => delay
            .saturating_mul(multiplier)
            .saturating_mul(u64::from(attempt.max(1))),
        None => delay,
    };

    max_delay.map_or(computed, |max| computed.min(max))
}
