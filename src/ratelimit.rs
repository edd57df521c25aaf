//! Per-principal request rate limiting.
//!
//! Fixed window counter per key: each key gets `limit` requests per
//! `window`; the counter resets when the window has elapsed.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitResult {
    Allowed { remaining: u32 },
    Limited { retry_after: Duration },
}

impl RateLimitResult {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateLimitResult::Allowed { .. })
    }
}

#[derive(Debug, Clone, Copy)]
struct Window {
    started: Instant,
    count: u32,
}

pub struct RateLimiter {
    limit: u32,
    window: Duration,
    state: Mutex<HashMap<String, Window>>,
}

impl RateLimiter {
    /// `limit == 0` disables limiting.
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            state: Mutex::new(HashMap::new()),
        }
    }

    pub fn check(&self, key: &str) -> RateLimitResult {
        self.check_at(key, Instant::now())
    }

    /// Counts one request for `key` at `now`.
    pub fn check_at(&self, key: &str, now: Instant) -> RateLimitResult {
        if self.limit == 0 {
            return RateLimitResult::Allowed { remaining: u32::MAX };
        }
        let mut state = self.state.lock();
        let window = state.entry(key.to_string()).or_insert(Window {
            started: now,
            count: 0,
        });
        if now.saturating_duration_since(window.started) >= self.window {
            *window = Window {
                started: now,
                count: 0,
            };
        }
        if window.count >= self.limit {
            let elapsed = now.saturating_duration_since(window.started);
            return RateLimitResult::Limited {
                retry_after: self.window.saturating_sub(elapsed),
            };
        }
        window.count += 1;
        RateLimitResult::Allowed {
            remaining: self.limit - window.count,
        }
    }

    /// Drops windows idle for more than two window lengths.
    pub fn sweep_at(&self, now: Instant) -> usize {
        let mut state = self.state.lock();
        let before = state.len();
        let horizon = self.window * 2;
        state.retain(|_, w| now.saturating_duration_since(w.started) < horizon);
        before - state.len()
    }

    pub fn tracked_keys(&self) -> usize {
        self.state.lock().len()
    }

    /// Sweep cadence: two window lengths, never under a second.
    pub fn sweep_interval(&self) -> Duration {
        (self.window * 2).max(Duration::from_secs(1))
    }

    /// Sweeps every [`sweep_interval`](Self::sweep_interval) until `shutdown` is cancelled.
    pub async fn run_sweeper(&self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.sweep_interval());
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    let dropped = self.sweep_at(Instant::now());
                    if dropped > 0 {
                        tracing::debug!(dropped, "Rate limiter swept idle windows");
                    }
                }
            }
        }
    }
}
