//! Token-bucket rate limiting.
//!
//! A [`RateLimiter`] owns one [`TokenBucket`] that refills lazily from the
//! elapsed wall-clock time on every access. Callers that cannot be served
//! immediately either wait for the deficit to refill or, in fire-immediately
//! mode, get the (negative) deficit back without waiting.

use crate::error::ProviderError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// The interval over which `tokens_per_interval` are granted.
///
/// In configuration files this is either a unit name (`"second"`,
/// `"minute"`, `"hour"`, `"day"`) or an explicit number of milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "IntervalRepr", into = "IntervalRepr")]
pub enum Interval {
    /// One second
    Second,
    /// One minute
    Minute,
    /// One hour
    Hour,
    /// One day
    Day,
    /// An explicit number of milliseconds
    Millis(u64),
}

impl Interval {
    /// Length of the interval.
    #[must_use]
    pub fn as_duration(self) -> Duration {
        match self {
            Self::Second => Duration::from_secs(1),
            Self::Minute => Duration::from_secs(60),
            Self::Hour => Duration::from_secs(3_600),
            Self::Day => Duration::from_secs(86_400),
            Self::Millis(ms) => Duration::from_millis(ms),
        }
    }

    /// Length of the interval in milliseconds.
    #[must_use]
    pub fn as_millis_f64(self) -> f64 {
        self.as_duration().as_secs_f64() * 1_000.0
    }
}

impl From<Duration> for Interval {
    fn from(duration: Duration) -> Self {
        Self::Millis(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }
}

impl FromStr for Interval {
    type Err = ProviderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sec" | "second" | "seconds" => Ok(Self::Second),
            "min" | "minute" | "minutes" => Ok(Self::Minute),
            "hr" | "hour" | "hours" => Ok(Self::Hour),
            "day" | "days" => Ok(Self::Day),
            other => other
                .parse::<u64>()
                .map(Self::Millis)
                .map_err(|_| ProviderError::invalid_config("interval", format!("unknown unit '{s}'"))),
        }
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Second => f.write_str("second"),
            Self::Minute => f.write_str("minute"),
            Self::Hour => f.write_str("hour"),
            Self::Day => f.write_str("day"),
            Self::Millis(ms) => write!(f, "{ms}ms"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum IntervalRepr {
    Millis(u64),
    Named(String),
}

impl TryFrom<IntervalRepr> for Interval {
    type Error = ProviderError;

    fn try_from(repr: IntervalRepr) -> Result<Self, Self::Error> {
        match repr {
            IntervalRepr::Millis(ms) => Ok(Self::Millis(ms)),
            IntervalRepr::Named(name) => name.parse(),
        }
    }
}

impl From<Interval> for IntervalRepr {
    fn from(interval: Interval) -> Self {
        match interval {
            Interval::Millis(ms) => Self::Millis(ms),
            named => Self::Named(named.to_string()),
        }
    }
}

/// Rate-limit policy attached to a provider configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitPolicy {
    /// Tokens granted per interval
    pub tokens_per_interval: u32,
    /// The refill interval
    pub interval: Interval,
    /// Bucket capacity; defaults to `tokens_per_interval`
    #[serde(default)]
    pub bucket_size: Option<u32>,
    /// Return the deficit instead of waiting when the bucket is short
    #[serde(default)]
    pub fire_immediately: bool,
    /// With `fire_immediately`, have providers fail a call that arrives
    /// while the bucket is short instead of sending it anyway
    #[serde(default)]
    pub reject_on_deficit: bool,
}

impl RateLimitPolicy {
    /// Creates a blocking policy whose bucket holds one interval's worth.
    #[must_use]
    pub fn new(tokens_per_interval: u32, interval: Interval) -> Self {
        Self {
            tokens_per_interval,
            interval,
            bucket_size: None,
            fire_immediately: false,
            reject_on_deficit: false,
        }
    }

    /// Sets the bucket capacity.
    #[must_use]
    pub fn with_bucket_size(mut self, bucket_size: u32) -> Self {
        self.bucket_size = Some(bucket_size);
        self
    }

    /// Switches to non-blocking mode.
    #[must_use]
    pub fn fire_immediately(mut self) -> Self {
        self.fire_immediately = true;
        self
    }

    /// Switches to non-blocking mode and rejects calls made while the
    /// bucket is short.
    #[must_use]
    pub fn reject_on_deficit(mut self) -> Self {
        self.fire_immediately = true;
        self.reject_on_deficit = true;
        self
    }

    /// Effective bucket capacity.
    #[must_use]
    pub fn capacity(&self) -> u32 {
        self.bucket_size.unwrap_or(self.tokens_per_interval)
    }

    /// Refill rate in tokens per millisecond.
    #[must_use]
    pub fn refill_per_ms(&self) -> f64 {
        f64::from(self.tokens_per_interval) / self.interval.as_millis_f64()
    }

    /// Checks that the policy can describe a usable bucket.
    ///
    /// # Errors
    ///
    /// Returns `INVALID_CONFIG` for a zero rate, interval or capacity.
    pub fn validate(&self) -> Result<(), ProviderError> {
        if self.tokens_per_interval == 0 {
            return Err(ProviderError::invalid_config(
                "rate_limit.tokens_per_interval",
                "must be greater than zero",
            ));
        }
        if self.interval.as_duration().is_zero() {
            return Err(ProviderError::invalid_config(
                "rate_limit.interval",
                "must be longer than zero",
            ));
        }
        if self.capacity() == 0 {
            return Err(ProviderError::invalid_config(
                "rate_limit.bucket_size",
                "must be greater than zero",
            ));
        }
        Ok(())
    }
}

/// Runtime state of a token bucket.
///
/// `tokens` never exceeds `capacity`; it is refilled lazily from the time
/// elapsed since `last_refill`.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    tokens: f64,
    capacity: f64,
    refill_per_ms: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Creates a full bucket.
    #[must_use]
    pub fn new(capacity: f64, refill_per_ms: f64) -> Self {
        Self {
            tokens: capacity,
            capacity,
            refill_per_ms,
            last_refill: Instant::now(),
        }
    }

    /// Adds the tokens earned since the last refill, capped at capacity.
    pub fn refill(&mut self, now: Instant) {
        let elapsed_ms = now.saturating_duration_since(self.last_refill).as_secs_f64() * 1_000.0;
        self.tokens = (self.tokens + elapsed_ms * self.refill_per_ms).min(self.capacity);
        self.last_refill = now;
    }

    /// Tokens currently in the bucket (as of the last refill).
    #[must_use]
    pub fn tokens(&self) -> f64 {
        self.tokens
    }

    /// Bucket capacity.
    #[must_use]
    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    /// Time until `cost` tokens are available, rounded up to whole milliseconds.
    #[must_use]
    pub fn time_until(&self, cost: f64) -> Duration {
        let deficit = cost - self.tokens;
        if deficit <= 0.0 {
            return Duration::ZERO;
        }
        let millis = (deficit / self.refill_per_ms).ceil().max(1.0);
        Duration::from_millis(millis as u64)
    }

    fn take(&mut self, cost: f64) -> f64 {
        self.tokens = (self.tokens - cost).max(0.0);
        self.tokens
    }
}

/// Token-bucket rate limiter owned by a single provider instance.
///
/// The bucket sits behind a fair async mutex that a waiting caller holds
/// while it sleeps, so waiters are served strictly in call order.
#[derive(Debug)]
pub struct RateLimiter {
    policy: RateLimitPolicy,
    bucket: Mutex<TokenBucket>,
}

impl RateLimiter {
    /// Creates a rate limiter with a full bucket.
    ///
    /// # Errors
    ///
    /// Returns an `InvalidConfig` error if the policy grants no tokens, has
    /// a zero-length interval or a zero-sized bucket.
    pub fn new(policy: RateLimitPolicy) -> Result<Self, ProviderError> {
        policy.validate()?;
        let bucket = TokenBucket::new(f64::from(policy.capacity()), policy.refill_per_ms());
        Ok(Self {
            policy,
            bucket: Mutex::new(bucket),
        })
    }

    /// The policy this limiter enforces.
    #[must_use]
    pub fn policy(&self) -> &RateLimitPolicy {
        &self.policy
    }

    /// Removes `cost` tokens, waiting for a refill if necessary.
    ///
    /// Returns the tokens remaining after the removal. In fire-immediately
    /// mode a short bucket is left untouched and the negative deficit
    /// (`available - cost`) is returned without waiting.
    ///
    /// # Errors
    ///
    /// Returns a `CapacityExceeded` error when `cost` exceeds the bucket
    /// size, since such a request could never be satisfied.
    pub async fn remove_tokens(&self, cost: u32) -> Result<f64, ProviderError> {
        let cost = f64::from(cost);
        let capacity = f64::from(self.policy.capacity());
        if cost > capacity {
            return Err(ProviderError::capacity_exceeded(cost, capacity));
        }

        let mut bucket = self.bucket.lock().await;
        bucket.refill(Instant::now());

        if bucket.tokens() >= cost {
            return Ok(bucket.take(cost));
        }

        if self.policy.fire_immediately {
            let deficit = bucket.tokens() - cost;
            tracing::debug!(cost, deficit, "rate limit short, not waiting");
            return Ok(deficit);
        }

        let wait = bucket.time_until(cost);
        tracing::debug!(
            cost,
            available = bucket.tokens(),
            wait_ms = wait.as_millis() as u64,
            "waiting for rate limit tokens"
        );
        tokio::time::sleep(wait).await;
        bucket.refill(Instant::now());
        Ok(bucket.take(cost))
    }

    /// Removes `cost` tokens only if they are available right now.
    ///
    /// Returns false without waiting when the bucket is short or another
    /// caller is currently waiting on it.
    pub fn try_remove_tokens(&self, cost: u32) -> bool {
        let Ok(mut bucket) = self.bucket.try_lock() else {
            return false;
        };
        bucket.refill(Instant::now());
        let cost = f64::from(cost);
        if bucket.tokens() >= cost {
            bucket.take(cost);
            true
        } else {
            false
        }
    }

    /// Tokens currently available, after a lazy refill.
    pub async fn tokens_remaining(&self) -> f64 {
        let mut bucket = self.bucket.lock().await;
        bucket.refill(Instant::now());
        bucket.tokens()
    }
}
