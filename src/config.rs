//! Configuration types for cursor establishment.

use std::time::Duration;

/// Which member of a shard's replica set a command may be sent to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadPreference {
    /// Only the primary.
    #[default]
    Primary,

    /// The primary if known, otherwise a secondary.
    PrimaryPreferred,

    /// Only secondaries.
    Secondary,

    /// A secondary if any, otherwise the primary.
    SecondaryPreferred,

    /// Any member.
    Nearest,
}

/// Whether the dispatch engine may resend a command after a retriable failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetryPolicy {
    /// Never resend.
    NoRetry,

    /// The command is safe to resend (opening a cursor is).
    #[default]
    Idempotent,
}

/// Configuration for the task executor.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Maximum number of remote commands running at once (backpressure).
    pub max_in_flight: usize,

    /// Deadline applied to a remote command that does not carry its own.
    pub request_timeout: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 5000,
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl ExecutorConfig {
    /// Create a config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the in-flight limit.
    pub fn with_max_in_flight(mut self, max: usize) -> Self {
        self.max_in_flight = max;
        self
    }

    /// Set the default per-request deadline.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

/// Configuration for establishing cursors.
#[derive(Debug, Clone)]
pub struct EstablishConfig {
    /// Read preference used to pick a host on each shard.
    pub read_preference: ReadPreference,

    /// Retry policy for open-cursor commands.
    pub retry_policy: RetryPolicy,

    /// Total attempts per shard, including the first one.
    pub max_attempts: u32,

    /// Pause between attempts on the same shard.
    pub retry_backoff: Duration,
}

impl Default for EstablishConfig {
    fn default() -> Self {
        Self {
            read_preference: ReadPreference::Primary,
            retry_policy: RetryPolicy::Idempotent,
            max_attempts: 3,
            retry_backoff: Duration::from_millis(50),
        }
    }
}

impl EstablishConfig {
    /// Create a config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the read preference.
    pub fn with_read_preference(mut self, read_preference: ReadPreference) -> Self {
        self.read_preference = read_preference;
        self
    }

    /// Set the retry policy.
    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    /// Set the total number of attempts per shard. Values below 1 are raised to 1.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Set the pause between attempts.
    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    /// Whether another attempt may follow `attempts_made` failed ones.
    pub fn allows_retry(&self, attempts_made: u32) -> bool {
        self.retry_policy == RetryPolicy::Idempotent && attempts_made < self.max_attempts
    }
}
