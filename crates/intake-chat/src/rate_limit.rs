//! Keyed fixed-window rate limiting.
//!
//! The limiter is injected wherever it is needed (AI turns, HTTP routes)
//! rather than living in a global. Each key gets its own window that
//! resets once `window` has elapsed since the first hit.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

/// Outcome of a rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allowed { remaining: u32 },
    Denied { retry_after: Duration },
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed { .. })
    }
}

pub trait RateLimiter: Send + Sync {
    /// Count one hit against `key` and decide whether it may proceed.
    fn check(&self, key: &str, limit: u32, window: Duration) -> Decision;
}

#[derive(Debug, Clone, Copy)]
struct Window {
    started: Instant,
    count: u32,
}

/// In-process fixed-window limiter.
pub struct InProcessRateLimiter {
    windows: Mutex<HashMap<String, Window>>,
    /// Prune expired windows once the map grows past this size.
    prune_threshold: usize,
}

impl Default for InProcessRateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl InProcessRateLimiter {
    pub fn new() -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
            prune_threshold: 10_000,
        }
    }

    /// Check against an explicit clock reading.
    pub fn check_at(&self, key: &str, limit: u32, window: Duration, now: Instant) -> Decision {
        let mut windows = match self.windows.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if windows.len() > self.prune_threshold {
            windows.retain(|_, w| now.duration_since(w.started) < window);
        }

        let entry = windows.entry(key.to_string()).or_insert(Window {
            started: now,
            count: 0,
        });

        if now.duration_since(entry.started) >= window {
            entry.started = now;
            entry.count = 0;
        }

        if entry.count < limit {
            entry.count += 1;
            Decision::Allowed {
                remaining: limit - entry.count,
            }
        } else {
            let elapsed = now.duration_since(entry.started);
            Decision::Denied {
                retry_after: window.saturating_sub(elapsed),
            }
        }
    }

    pub fn tracked_keys(&self) -> usize {
        self.windows.lock().map(|w| w.len()).unwrap_or(0)
    }
}

impl RateLimiter for InProcessRateLimiter {
    fn check(&self, key: &str, limit: u32, window: Duration) -> Decision {
        self.check_at(key, limit, window, Instant::now())
    }
}

/// Limiter that never denies. Used when limits are disabled.
#[derive(Debug, Default, Clone, Copy)]
pub struct Unlimited;

impl RateLimiter for Unlimited {
    fn check(&self, _key: &str, limit: u32, _window: Duration) -> Decision {
        Decision::Allowed { remaining: limit }
    }
}
