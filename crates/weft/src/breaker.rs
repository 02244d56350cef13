//! Rolling-window circuit breaker for the Upload→Payment call path.
//!
//! Counts outcomes in one-second buckets over a sliding window. When the
//! failure ratio crosses the threshold the breaker opens and calls are
//! rejected immediately; after the open interval a single half-open
//! probe decides whether to close again.

use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Sliding window length in seconds.
    pub window_secs: u64,
    /// Open when failures/total meets this ratio (0.0–1.0).
    pub failure_ratio: f64,
    /// Minimum calls in the window before the ratio is meaningful.
    pub min_calls: u64,
    /// How long the breaker stays open before probing.
    pub open_for: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            window_secs: 10,
            failure_ratio: 0.5,
            min_calls: 5,
            open_for: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Closed,
    Open { until_elapsed_ms: u128 },
    HalfOpen { probe_in_flight: bool },
}

#[derive(Debug, Default, Clone, Copy)]
struct Bucket {
    second: u64,
    ok: u64,
    failed: u64,
}

struct Inner {
    state: State,
    buckets: Vec<Bucket>,
}

pub struct CircuitBreaker {
    config: BreakerConfig,
    epoch: Instant,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        let buckets = vec![Bucket::default(); config.window_secs as usize];
        Self {
            config,
            epoch: Instant::now(),
            inner: Mutex::new(Inner {
                state: State::Closed,
                buckets,
            }),
        }
    }

    fn now_ms(&self) -> u128 {
        self.epoch.elapsed().as_millis()
    }

    /// Whether a call may proceed right now. In the half-open state only
    /// one probe is admitted; the rest are rejected until it reports.
    pub fn allow(&self) -> bool {
        let now_ms = self.now_ms();
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        match inner.state {
            State::Closed => true,
            State::Open { until_elapsed_ms } => {
                if now_ms >= until_elapsed_ms {
                    inner.state = State::HalfOpen {
                        probe_in_flight: true,
                    };
                    true
                } else {
                    false
                }
            }
            State::HalfOpen { probe_in_flight } => {
                if probe_in_flight {
                    false
                } else {
                    inner.state = State::HalfOpen {
                        probe_in_flight: true,
                    };
                    true
                }
            }
        }
    }

    /// Record a call outcome.
    pub fn record(&self, ok: bool) {
        let now_ms = self.now_ms();
        let second = (now_ms / 1000) as u64;
        let mut inner = self.inner.lock().expect("breaker lock poisoned");

        let idx = (second % self.config.window_secs) as usize;
        let bucket = &mut inner.buckets[idx];
        if bucket.second != second {
            *bucket = Bucket {
                second,
                ok: 0,
                failed: 0,
            };
        }
        if ok {
            bucket.ok += 1;
        } else {
            bucket.failed += 1;
        }

        match inner.state {
            State::HalfOpen { .. } => {
                if ok {
                    tracing::info!("circuit breaker closed after successful probe");
                    inner.state = State::Closed;
                    for b in inner.buckets.iter_mut() {
                        *b = Bucket::default();
                    }
                } else {
                    tracing::warn!("circuit breaker re-opened after failed probe");
                    inner.state = State::Open {
                        until_elapsed_ms: now_ms + self.config.open_for.as_millis(),
                    };
                }
            }
            State::Closed => {
                let horizon = second.saturating_sub(self.config.window_secs - 1);
                let (mut total, mut failed) = (0u64, 0u64);
                for b in inner.buckets.iter() {
                    if b.second >= horizon && b.second <= second {
                        total += b.ok + b.failed;
                        failed += b.failed;
                    }
                }
                if total >= self.config.min_calls
                    && (failed as f64) / (total as f64) >= self.config.failure_ratio
                {
                    tracing::warn!(
                        failed,
                        total,
                        "circuit breaker opened on payment call failures"
                    );
                    inner.state = State::Open {
                        until_elapsed_ms: now_ms + self.config.open_for.as_millis(),
                    };
                }
            }
            State::Open { .. } => {}
        }
    }

    /// True while the breaker is rejecting calls.
    pub fn is_open(&self) -> bool {
        let inner = self.inner.lock().expect("breaker lock poisoned");
        matches!(inner.state, State::Open { .. })
    }
}
