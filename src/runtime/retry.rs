use rand::Rng;
use std::time::Duration;

/// Delay schedule between attempts of one activity.
#[derive(Debug, Clone, PartialEq)]
pub enum BackoffStrategy {
    /// Retry immediately.
    None,
    /// Same delay before every retry.
    Fixed { delay: Duration },
    /// `base * attempt`, capped at `max`.
    Linear { base: Duration, max: Duration },
    /// `base * multiplier^(attempt-1)`, capped at `max`.
    Exponential {
        base: Duration,
        multiplier: f64,
        max: Duration,
    },
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        BackoffStrategy::Exponential {
            base: Duration::from_millis(100),
            multiplier: 2.0,
            max: Duration::from_secs(30),
        }
    }
}

impl BackoffStrategy {
    /// Delay to wait after `attempt` failed (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        match self {
            BackoffStrategy::None => Duration::ZERO,
            BackoffStrategy::Fixed { delay } => *delay,
            BackoffStrategy::Linear { base, max } => base.saturating_mul(attempt).min(*max),
            BackoffStrategy::Exponential { base, multiplier, max } => {
                if base.is_zero() {
                    return Duration::ZERO;
                }
                let factor = multiplier.powi(attempt.saturating_sub(1).min(i32::MAX as u32) as i32);
                let nanos = base.as_nanos() as f64 * factor;
                if !nanos.is_finite() || nanos >= max.as_nanos() as f64 {
                    *max
                } else {
                    Duration::from_nanos(nanos as u64)
                }
            }
        }
    }
}

/// Attempt budget, backoff and per-attempt timeout for one activity.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: BackoffStrategy,
    /// Wall-clock limit for one attempt. Exceeding it counts as a transient failure.
    pub timeout: Option<Duration>,
    /// Fraction of the backoff delay randomized in both directions, `0.0..=1.0`.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff: BackoffStrategy::default(),
            timeout: None,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// # Panics
    ///
    /// Panics if `max_attempts` is 0.
    pub fn new(max_attempts: u32) -> Self {
        assert!(max_attempts >= 1, "max_attempts must be at least 1");
        Self {
            max_attempts,
            ..Default::default()
        }
    }

    /// Single attempt, no retries.
    pub fn no_retry() -> Self {
        Self::new(1).with_backoff(BackoffStrategy::None).with_jitter(0.0)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffStrategy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = if jitter.is_nan() { 0.0 } else { jitter.clamp(0.0, 1.0) };
        self
    }

    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.backoff.delay_for_attempt(attempt)
    }

    /// Backoff delay with jitter applied. Only the executor calls this; the
    /// orchestration engine never looks at wall-clock delays.
    pub fn delay_with_jitter(&self, attempt: u32) -> Duration {
        let delay = self.delay_for_attempt(attempt);
        if self.jitter <= 0.0 || delay.is_zero() {
            return delay;
        }
        let spread = rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        Duration::from_secs_f64((delay.as_secs_f64() * (1.0 + spread)).max(0.0))
    }

    pub fn has_attempts_left(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}
