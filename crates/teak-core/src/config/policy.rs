//! Per-endpoint delivery policy.

use std::time::Duration;

use rand::Rng;
use serde::Deserialize;
use thiserror::Error;

/// Errors raised while validating a policy.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PolicyError {
    /// A delay was negative, NaN or infinite.
    #[error("invalid {field}: {value}")]
    InvalidDuration {
        /// Offending field name.
        field: &'static str,
        /// Offending value in seconds.
        value: f64,
    },

    /// A batch count of zero can never flush.
    #[error("batch count must be at least 1")]
    ZeroCount,
}

fn seconds(field: &'static str, value: f64) -> Result<Duration, PolicyError> {
    if value.is_finite() && value >= 0.0 {
        Ok(Duration::from_secs_f64(value))
    } else {
        Err(PolicyError::InvalidDuration { field, value })
    }
}

/// Ordered retry delays plus a symmetric jitter.
///
/// Attempt `n` (zero based) after a 5xx waits `times[n] + uniform(-jitter, +jitter)`,
/// clamped to zero.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RetryPolicy {
    times: Vec<Duration>,
    jitter: Duration,
}

impl RetryPolicy {
    /// Build a validated policy from delays and jitter expressed in seconds.
    pub fn new(times_secs: &[f64], jitter_secs: f64) -> Result<Self, PolicyError> {
        let times = times_secs
            .iter()
            .map(|t| seconds("retry time", *t))
            .collect::<Result<Vec<_>, _>>()?;
        let jitter = seconds("retry jitter", jitter_secs)?;
        Ok(Self { times, jitter })
    }

    /// A policy that never retries.
    pub fn none() -> Self {
        Self::default()
    }

    /// Number of retries this policy allows.
    pub fn max_retries(&self) -> usize {
        self.times.len()
    }

    /// Configured jitter.
    pub fn jitter(&self) -> Duration {
        self.jitter
    }

    /// Delay before retry `index`, or `None` once retries are exhausted.
    pub fn delay_for(&self, index: usize) -> Option<Duration> {
        let jitter = self.jitter.as_secs_f64();
        let offset = if jitter > 0.0 { rand::thread_rng().gen_range(-jitter..=jitter) } else { 0.0 };
        self.delay_with_offset(index, offset)
    }

    fn delay_with_offset(&self, index: usize, offset_secs: f64) -> Option<Duration> {
        let base = self.times.get(index)?.as_secs_f64();
        Some(Duration::from_secs_f64((base + offset_secs).max(0.0)))
    }
}

/// Batching rules for one endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchPolicy {
    count: Option<usize>,
    time: Duration,
    max_wait: Option<Duration>,
    last_write_wins: bool,
}

impl BatchPolicy {
    /// Build a validated batch policy. Times are in seconds.
    ///
    /// `count = None` means no count threshold. Last-write-wins forces that,
    /// so flushing relies on the timers alone.
    pub fn new(
        count: Option<usize>,
        time_secs: f64,
        max_wait_secs: Option<f64>,
        last_write_wins: bool,
    ) -> Result<Self, PolicyError> {
        if count == Some(0) {
            return Err(PolicyError::ZeroCount);
        }
        let time = seconds("batch time", time_secs)?;
        let max_wait = max_wait_secs.map(|w| seconds("batch maxWait", w)).transpose()?;
        Ok(Self {
            count: if last_write_wins { None } else { count },
            time,
            max_wait,
            last_write_wins,
        })
    }

    /// A policy that sends every request on its own.
    pub fn none() -> Self {
        Self { count: Some(1), time: Duration::ZERO, max_wait: None, last_write_wins: false }
    }

    /// True when requests for this endpoint go through an accumulator.
    pub fn is_batching(&self) -> bool {
        self.last_write_wins || !self.time.is_zero() || self.count.is_none_or(|c| c > 1)
    }

    /// Count threshold, `None` when unbounded.
    pub fn count(&self) -> Option<usize> {
        self.count
    }

    /// Debounce delay before a flush.
    pub fn time(&self) -> Duration {
        self.time
    }

    /// Hard cap measured from the first add.
    pub fn max_wait(&self) -> Option<Duration> {
        self.max_wait
    }

    /// Whether only the latest payload is kept.
    pub fn last_write_wins(&self) -> bool {
        self.last_write_wins
    }

    /// True once `len` payloads should be flushed without waiting.
    pub fn threshold_reached(&self, len: usize) -> bool {
        self.count.is_some_and(|c| len >= c)
    }
}

impl Default for BatchPolicy {
    fn default() -> Self {
        Self::none()
    }
}

/// Everything the engine needs to know about one (hostname, endpoint).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EndpointPolicy {
    /// Discard requests instead of sending them.
    pub blackhole: bool,
    /// Retry rules for 5xx responses.
    pub retry: RetryPolicy,
    /// Batching rules.
    pub batch: BatchPolicy,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct RawEndpointPolicy {
    #[serde(default)]
    blackhole: bool,
    #[serde(default)]
    retry: Option<RawRetryPolicy>,
    #[serde(default)]
    batch: Option<RawBatchPolicy>,
}

#[derive(Debug, Default, Deserialize)]
struct RawRetryPolicy {
    #[serde(default)]
    times: Vec<f64>,
    #[serde(default)]
    jitter: f64,
}

#[derive(Debug, Default, Deserialize)]
struct RawBatchPolicy {
    #[serde(default)]
    count: Option<usize>,
    #[serde(default, alias = "delay")]
    time: f64,
    #[serde(default, rename = "maxWait", alias = "max_wait")]
    max_wait: Option<f64>,
    #[serde(default, alias = "lastWriteWins")]
    lww: bool,
}

impl TryFrom<RawEndpointPolicy> for EndpointPolicy {
    type Error = PolicyError;

    fn try_from(raw: RawEndpointPolicy) -> Result<Self, Self::Error> {
        let retry = match raw.retry {
            Some(r) => RetryPolicy::new(&r.times, r.jitter)?,
            None => RetryPolicy::none(),
        };
        let batch = match raw.batch {
            Some(b) => BatchPolicy::new(b.count, b.time, b.max_wait, b.lww)?,
            None => BatchPolicy::none(),
        };
        Ok(Self { blackhole: raw.blackhole, retry, batch })
    }
}
