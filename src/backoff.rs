use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Smallest delay the exponential strategy will ever produce
pub const MIN_EXPONENTIAL_DELAY: Duration = Duration::from_millis(100);

/// Maps a 1-based attempt number to the delay that follows it.
///
/// The delay computed after failed attempt `k` precedes attempt `k + 1`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// `base * multiplier^(attempt-1)`, capped, optionally jittered, floored at 100ms
    Exponential {
        multiplier: f64,
        max_delay: Duration,
        jitter: bool,
        jitter_factor: f64,
    },
    /// `base + increment * (attempt-1)`, capped
    Linear {
        increment: Duration,
        max_delay: Duration,
    },
    /// Always the same delay, the policy's base delay is ignored
    Fixed { delay: Duration },
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        BackoffStrategy::Exponential {
            multiplier: 2.0,
            max_delay: Duration::from_secs(60),
            jitter: true,
            jitter_factor: 0.1,
        }
    }
}

impl BackoffStrategy {
    /// Exponential backoff with the default 10% jitter
    pub fn exponential(multiplier: f64, max_delay: Duration) -> Self {
        BackoffStrategy::Exponential {
            multiplier,
            max_delay,
            jitter: true,
            jitter_factor: 0.1,
        }
    }

    /// Linear backoff
    pub fn linear(increment: Duration, max_delay: Duration) -> Self {
        BackoffStrategy::Linear {
            increment,
            max_delay,
        }
    }

    /// Constant delay
    pub fn fixed(delay: Duration) -> Self {
        BackoffStrategy::Fixed { delay }
    }

    /// Disable jitter (no-op for non-exponential strategies)
    pub fn without_jitter(self) -> Self {
        match self {
            BackoffStrategy::Exponential {
                multiplier,
                max_delay,
                jitter_factor,
                ..
            } => BackoffStrategy::Exponential {
                multiplier,
                max_delay,
                jitter: false,
                jitter_factor,
            },
            other => other,
        }
    }

    /// Enable jitter with the given factor, clamped to `0.0..=1.0`
    pub fn with_jitter(self, factor: f64) -> Self {
        match self {
            BackoffStrategy::Exponential {
                multiplier,
                max_delay,
                ..
            } => BackoffStrategy::Exponential {
                multiplier,
                max_delay,
                jitter: true,
                jitter_factor: factor.clamp(0.0, 1.0),
            },
            other => other,
        }
    }

    /// Delay to wait after failed attempt `attempt` (1-based)
    pub fn get_delay(&self, attempt: u32, base_delay: Duration) -> Duration {
        let steps = attempt.saturating_sub(1);

        match self {
            BackoffStrategy::Exponential {
                multiplier,
                max_delay,
                jitter,
                jitter_factor,
            } => {
                let cap = max_delay.as_secs_f64();
                let mut delay = base_delay.as_secs_f64() * multiplier.powi(steps as i32);
                if !delay.is_finite() || delay > cap {
                    delay = cap;
                }

                if *jitter {
                    // Uniform offset in [-delay*factor, +delay*factor]
                    let spread = delay * jitter_factor;
                    delay += (fastrand::f64() * 2.0 - 1.0) * spread;
                }

                let floor = MIN_EXPONENTIAL_DELAY.as_secs_f64();
                if !delay.is_finite() || delay < floor {
                    delay = floor;
                }
                Duration::from_secs_f64(delay)
            }
            BackoffStrategy::Linear {
                increment,
                max_delay,
            } => {
                let delay = base_delay.saturating_add(increment.saturating_mul(steps));
                delay.min(*max_delay)
            }
            BackoffStrategy::Fixed { delay } => *delay,
        }
    }
}
