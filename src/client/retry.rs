//! Retransmission policy for JIP exchanges.
//!
//! JIP runs over plain UDP across a lossy mesh, so every exchange is retried
//! on timeout. The policy decides how often and how long to pause between
//! sends.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Retransmission policy.
///
/// `max_attempts` counts retransmissions: the request is sent
/// `max_attempts + 1` times in total before the exchange times out.
///
/// # Examples
///
/// ```rust
/// use async_jip::Retry;
/// use std::time::Duration;
///
/// // Single send
/// let retry = Retry::none();
/// assert_eq!(retry.total_sends(), 1);
///
/// // Three sends, 100ms apart
/// let retry = Retry::fixed(2, Duration::from_millis(100));
///
/// // Backing off 250ms, 500ms, 1s, 1s
/// let retry = Retry::exponential(4)
///     .initial_delay(Duration::from_millis(250))
///     .max_delay(Duration::from_secs(1))
///     .jitter(0.0)
///     .build();
/// ```
#[derive(Clone, Debug, PartialEq)]
pub struct Retry {
    /// Retransmissions after the first send.
    pub max_attempts: u32,
    /// Pause before each retransmission, on top of the response timeout.
    pub backoff: Backoff,
}

/// Pause between a timed out attempt and the next send.
#[derive(Clone, Debug, Default, PartialEq)]
pub enum Backoff {
    /// Resend as soon as the previous attempt times out.
    #[default]
    None,

    /// Constant pause.
    Fixed { delay: Duration },

    /// Pause doubling per attempt up to `max`, randomised by `jitter`
    /// (0.25 means ±25%).
    Exponential {
        initial: Duration,
        max: Duration,
        jitter: f64,
    },
}

impl Default for Retry {
    /// Three sends back to back.
    fn default() -> Self {
        Self {
            max_attempts: 2,
            backoff: Backoff::None,
        }
    }
}

impl Retry {
    /// Send once.
    pub fn none() -> Self {
        Self {
            max_attempts: 0,
            backoff: Backoff::None,
        }
    }

    /// `attempts` retransmissions, each after a pause of `delay`.
    pub fn fixed(attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: attempts,
            backoff: Backoff::Fixed { delay },
        }
    }

    /// Start configuring exponential backoff with `attempts` retransmissions.
    pub fn exponential(attempts: u32) -> RetryBuilder {
        RetryBuilder {
            max_attempts: attempts,
            ..Default::default()
        }
    }

    /// Number of datagrams an exchange sends before giving up.
    pub fn total_sends(&self) -> u32 {
        self.max_attempts.saturating_add(1)
    }

    /// Pause before retransmission number `attempt` (zero based).
    pub fn compute_delay(&self, attempt: u32) -> Duration {
        match &self.backoff {
            Backoff::None => Duration::ZERO,
            Backoff::Fixed { delay } => *delay,
            Backoff::Exponential {
                initial,
                max,
                jitter,
            } => {
                let multiplier = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
                let capped = initial.saturating_mul(multiplier).min(*max);
                Duration::from_secs_f64(capped.as_secs_f64() * jitter_factor(*jitter))
            }
        }
    }
}

/// Builder for [`Backoff::Exponential`].
pub struct RetryBuilder {
    max_attempts: u32,
    initial: Duration,
    max: Duration,
    jitter: f64,
}

impl Default for RetryBuilder {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            initial: Duration::from_millis(250),
            max: Duration::from_secs(2),
            jitter: 0.25,
        }
    }
}

impl RetryBuilder {
    /// First pause (default: 250 ms).
    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial = delay;
        self
    }

    /// Longest pause (default: 2 s).
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max = delay;
        self
    }

    /// Randomisation factor, clamped to [0.0, 1.0] (default: 0.25).
    pub fn jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    pub fn build(self) -> Retry {
        Retry {
            max_attempts: self.max_attempts,
            backoff: Backoff::Exponential {
                initial: self.initial,
                max: self.max,
                jitter: self.jitter,
            },
        }
    }
}

impl From<RetryBuilder> for Retry {
    fn from(builder: RetryBuilder) -> Self {
        builder.build()
    }
}

static SPREAD_COUNTER: AtomicU64 = AtomicU64::new(0x2545_f491);

/// Cheap well-spread 64-bit value from a shared counter (Knuth's
/// multiplicative hash). Good enough to desynchronise retries and pick
/// one-shot handles; not for anything that needs real randomness.
pub(crate) fn spread() -> u64 {
    SPREAD_COUNTER
        .fetch_add(1, Ordering::Relaxed)
        .wrapping_mul(0x5851_f42d_4c95_7f2d)
}

/// A factor in [1 - jitter, 1 + jitter].
fn jitter_factor(jitter: f64) -> f64 {
    if jitter <= 0.0 {
        return 1.0;
    }
    let unit = (spread() >> 11) as f64 / (1u64 << 53) as f64;
    1.0 + (unit - 0.5) * 2.0 * jitter
}
