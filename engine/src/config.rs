//! Configuration for synchronized tables.

use serde_json::Value;
use std::time::Duration;

/// Per-table options.
#[derive(Debug, Clone, PartialEq)]
pub struct TableOptions {
    /// Extra options forwarded with every read and changefeed query.
    pub query_options: Vec<Value>,
    /// Window over which save requests are coalesced.
    pub debounce: Duration,
    /// Batch change notifications over this interval. Overrides the
    /// table schema's throttle when set.
    pub throttle: Option<Duration>,
    /// Timeout passed to the transport with every query.
    pub query_timeout: Duration,
    /// Retry policy for saves.
    pub save_retry: RetryConfig,
    /// Retry policy for (re)establishing the subscription.
    pub connect_retry: RetryConfig,
    /// Fatal-marked transport messages that should be treated as transient.
    pub fatal_exceptions: Vec<String>,
}

impl Default for TableOptions {
    fn default() -> Self {
        Self {
            query_options: Vec::new(),
            debounce: Duration::from_millis(1500),
            throttle: None,
            query_timeout: Duration::from_secs(30),
            save_retry: RetryConfig::default(),
            connect_retry: RetryConfig::default().with_max_time(None),
            fatal_exceptions: Vec::new(),
        }
    }
}

impl TableOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_query_options(mut self, options: Vec<Value>) -> Self {
        self.query_options = options;
        self
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    pub fn with_throttle(mut self, throttle: Duration) -> Self {
        self.throttle = Some(throttle);
        self
    }

    pub fn with_query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = timeout;
        self
    }

    pub fn with_save_retry(mut self, retry: RetryConfig) -> Self {
        self.save_retry = retry;
        self
    }

    pub fn with_connect_retry(mut self, retry: RetryConfig) -> Self {
        self.connect_retry = retry;
        self
    }

    pub fn with_fatal_exception(mut self, message: impl Into<String>) -> Self {
        self.fatal_exceptions.push(message.into());
        self
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Initial delay between retries.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Give up once this much time has passed since the first attempt.
    /// `None` retries until success.
    pub max_time: Option<Duration>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(20),
            backoff_multiplier: 2.0,
            max_time: Some(Duration::from_secs(30)),
        }
    }
}

impl RetryConfig {
    /// Creates a configuration that never retries.
    pub fn no_retry() -> Self {
        Self {
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            max_time: Some(Duration::ZERO),
        }
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    pub fn with_max_time(mut self, max_time: Option<Duration>) -> Self {
        self.max_time = max_time;
        self
    }

    /// Delay before retry number `attempt` (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.backoff_multiplier.max(1.0).powi(attempt as i32);
        let delay = self.initial_delay.as_nanos() as f64 * factor;
        let max = self.max_delay.as_nanos() as f64;
        Duration::from_nanos(delay.min(max) as u64)
    }

    /// Whether another attempt fits in the budget after `elapsed`.
    pub fn allows(&self, elapsed: Duration, next_delay: Duration) -> bool {
        match self.max_time {
            Some(max) => elapsed + next_delay <= max,
            None => true,
        }
    }
}
