use std::time::Duration;

use rand::Rng;

use crate::connector::{MAX_RECEIVE_TIMEOUT, MAX_VISIBILITY_TIMEOUT};
use crate::errors::ConfigError;

/// Capped exponential backoff with multiplicative jitter, used for the retries that never give
/// up: resolving the queue and receiving from it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub base: Duration,
    /// Upper bound of the delay before jitter.
    pub max: Duration,
    /// Whether each delay is scaled by a random factor in `[0.5, 1.5)`.
    pub jitter: bool,
}

impl BackoffPolicy {
    pub const fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            jitter: true,
        }
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Delay before retry number `attempt` (starting at 0).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(31));
        let delay = self.base.saturating_mul(factor).min(self.max);
        if self.jitter {
            delay.mul_f64(rand::thread_rng().gen_range(0.5..1.5))
        } else {
            delay
        }
    }
}

/// Configuration of one consumption pipeline.
///
/// Built from [`Default`] and adjusted through the `with_*` methods. Durations left unset are
/// derived from the visibility timeout when the pipeline starts.
///
/// # Fields
/// - `visibility_timeout`: how long received messages stay invisible, and how far every
///   renewal pushes the deadline. Whole seconds, between 1s and 12h.
/// - `receive_timeout`: the long-poll wait of each receive call.
#[derive(Debug, Clone)]
pub struct ConsumeConfig {
    pub visibility_timeout: Duration,

    pub receive_timeout: Duration,

    /// Renew the visibility of in-flight messages while their handlers run.
    pub automatic_visibility_extension: bool,

    /// How long before the deadline a renewal is issued. Defaults to the smaller of 3s and a
    /// fifth of the visibility timeout.
    pub extension_threshold: Option<Duration>,

    /// Immediate retries of a renewal call whose failure was not "already deleted".
    pub renewal_retries: u32,

    /// How long an individual consumer's actions are collected before being executed as one
    /// batch. Defaults to 60% of the visibility timeout.
    pub chunk_window: Option<Duration>,

    pub resolve_backoff: BackoffPolicy,

    pub receive_backoff: BackoffPolicy,
}

impl Default for ConsumeConfig {
    fn default() -> Self {
        ConsumeConfig {
            visibility_timeout: Duration::from_secs(30),
            receive_timeout: Duration::from_secs(20),
            automatic_visibility_extension: true,
            extension_threshold: None,
            renewal_retries: 0,
            chunk_window: None,
            resolve_backoff: BackoffPolicy::new(Duration::from_secs(10), Duration::from_secs(300)),
            receive_backoff: BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(60)),
        }
    }
}

impl ConsumeConfig {
    pub fn with_visibility_timeout(mut self, visibility_timeout: Duration) -> Self {
        self.visibility_timeout = visibility_timeout;
        self
    }

    pub fn with_receive_timeout(mut self, receive_timeout: Duration) -> Self {
        self.receive_timeout = receive_timeout;
        self
    }

    pub fn with_automatic_visibility_extension(mut self, enabled: bool) -> Self {
        self.automatic_visibility_extension = enabled;
        self
    }

    pub fn with_extension_threshold(mut self, threshold: Duration) -> Self {
        self.extension_threshold = Some(threshold);
        self
    }

    pub fn with_renewal_retries(mut self, retries: u32) -> Self {
        self.renewal_retries = retries;
        self
    }

    pub fn with_chunk_window(mut self, window: Duration) -> Self {
        self.chunk_window = Some(window);
        self
    }

    pub fn with_resolve_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.resolve_backoff = backoff;
        self
    }

    pub fn with_receive_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.receive_backoff = backoff;
        self
    }

    pub fn extension_threshold(&self) -> Duration {
        self.extension_threshold
            .unwrap_or_else(|| Duration::from_secs(3).min(self.visibility_timeout / 5))
    }

    /// Delay between registering a batch (or renewing it) and the next renewal.
    pub fn renewal_interval(&self) -> Duration {
        self.visibility_timeout
            .saturating_sub(self.extension_threshold())
    }

    pub fn chunk_window(&self) -> Duration {
        self.chunk_window
            .unwrap_or_else(|| self.visibility_timeout.mul_f64(0.6))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.visibility_timeout.is_zero()
            || self.visibility_timeout.subsec_nanos() > 0
            || self.visibility_timeout > MAX_VISIBILITY_TIMEOUT
        {
            return Err(ConfigError::InvalidVisibilityTimeout(self.visibility_timeout));
        }
        if self.receive_timeout > MAX_RECEIVE_TIMEOUT {
            return Err(ConfigError::InvalidReceiveTimeout(self.receive_timeout));
        }
        let threshold = self.extension_threshold();
        if threshold >= self.visibility_timeout {
            return Err(ConfigError::InvalidExtensionThreshold {
                threshold,
                visibility_timeout: self.visibility_timeout,
            });
        }
        Ok(())
    }
}

/// Per-consumer settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumerConfiguration {
    /// Maximum number of handler invocations running at once.
    pub parallelism: usize,
}

impl Default for ConsumerConfiguration {
    fn default() -> Self {
        ConsumerConfiguration { parallelism: 1 }
    }
}

impl ConsumerConfiguration {
    pub fn with_parallelism(parallelism: usize) -> Self {
        ConsumerConfiguration { parallelism }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.parallelism == 0 {
            return Err(ConfigError::InvalidParallelism);
        }
        Ok(())
    }
}
