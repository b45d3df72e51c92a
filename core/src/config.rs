use std::time::Duration;

/// What the limiter does when its store round-trip fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Treat the request as a server fault and refuse it.
    #[default]
    FailClosed,
    /// Let the request through and log the failure.
    FailOpen,
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub capacity: f64,
    /// Tokens restored per second.
    pub refill_rate: f64,
    pub failure_policy: FailurePolicy,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self { capacity: 5.0, refill_rate: 0.5, failure_policy: FailurePolicy::FailClosed }
    }
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Time between drains of the retry queue.
    pub interval: Duration,
    /// How long a drain waits on an empty queue before giving up.
    pub pop_timeout: Duration,
    /// Attempts (including the first retry) before a job is dead-lettered.
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            pop_timeout: Duration::from_secs(1),
            max_attempts: 3,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TrendingConfig {
    pub window_minutes: i64,
    pub default_limit: usize,
    /// Upper bound on buckets a single tick decays after a pause.
    pub max_catch_up_minutes: i64,
}

impl Default for TrendingConfig {
    fn default() -> Self {
        Self { window_minutes: 60, default_limit: 50, max_catch_up_minutes: 24 * 60 }
    }
}

#[derive(Debug, Clone)]
pub struct TypeaheadConfig {
    pub min_len: usize,
    pub max_len: usize,
    pub default_limit: usize,
}

impl Default for TypeaheadConfig {
    fn default() -> Self {
        Self { min_len: 3, max_len: 20, default_limit: 10 }
    }
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Results per search page.
    pub page_size: usize,
    pub rate_limit: RateLimitConfig,
    pub retry: RetryConfig,
    pub trending: TrendingConfig,
    pub typeahead: TypeaheadConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            page_size: 10,
            rate_limit: RateLimitConfig::default(),
            retry: RetryConfig::default(),
            trending: TrendingConfig::default(),
            typeahead: TypeaheadConfig::default(),
        }
    }
}
