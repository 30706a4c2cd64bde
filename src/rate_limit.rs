//! Per-tenant admission control.
//!
//! Sliding-window-log limiter: each API key owns a log of request
//! timestamps. On every check the log is pruned to the trailing window and
//! the request is admitted iff fewer than `max_requests` timestamps remain.
//!
//! Logs live in a [`DashMap`]; `admit` holds the key's shard lock for the
//! whole prune-check-append sequence, so two concurrent admits competing
//! for the last slot cannot both succeed.
//!
//! Timestamps come from `tokio::time::Instant`, which is monotonic and can
//! be paused in tests.

use std::collections::VecDeque;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::time::Instant;

use crate::config::RateLimitConfig;

/// Answer to [`RateLimiter::remaining`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitStatus {
    pub remaining: usize,
    /// Seconds until the oldest request in the window expires, rounded up.
    /// Zero when the window is empty.
    pub reset_seconds: u64,
}

pub struct RateLimiter {
    max_requests: usize,
    window: Duration,
    logs: DashMap<String, VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(max_requests: usize, window: Duration) -> Self {
        tracing::info!(
            max_requests,
            window_secs = window.as_secs(),
            "rate limiter initialized"
        );
        Self {
            max_requests,
            window,
            logs: DashMap::new(),
        }
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(
            config.max_requests,
            Duration::from_secs(config.window_seconds),
        )
    }

    pub fn max_requests(&self) -> usize {
        self.max_requests
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Admit one request for `tenant`, recording it if admitted.
    pub fn admit(&self, tenant: &str) -> bool {
        let now = Instant::now();
        let mut log = self.logs.entry(tenant.to_string()).or_default();

        while let Some(&oldest) = log.front() {
            if self.expired(oldest, now) {
                log.pop_front();
            } else {
                break;
            }
        }

        if log.len() < self.max_requests {
            log.push_back(now);
            return true;
        }

        tracing::warn!(tenant = %redact_key(tenant), "rate limit exceeded");
        false
    }

    /// Report remaining capacity for `tenant` without recording a request.
    pub fn remaining(&self, tenant: &str) -> RateLimitStatus {
        let now = Instant::now();
        let log = match self.logs.get(tenant) {
            Some(log) => log,
            None => {
                return RateLimitStatus {
                    remaining: self.max_requests,
                    reset_seconds: 0,
                }
            }
        };

        let mut live = log.iter().filter(|&&t| !self.expired(t, now));
        let oldest = live.next().copied();
        let in_window = oldest.map(|_| 1 + live.count()).unwrap_or(0);

        let reset_seconds = oldest
            .map(|t| {
                let left = self.window.saturating_sub(now.saturating_duration_since(t));
                let secs = left.as_secs();
                if left.subsec_nanos() > 0 {
                    secs + 1
                } else {
                    secs
                }
            })
            .unwrap_or(0);

        RateLimitStatus {
            remaining: self.max_requests.saturating_sub(in_window),
            reset_seconds,
        }
    }

    /// Drop logs whose every timestamp has left the window.
    ///
    /// Returns the number of tenants forgotten.
    pub fn forget_idle(&self) -> usize {
        let now = Instant::now();
        let before = self.logs.len();
        self.logs.retain(|_, log| match log.back() {
            Some(&newest) => !self.expired(newest, now),
            None => false,
        });
        before.saturating_sub(self.logs.len())
    }

    fn expired(&self, t: Instant, now: Instant) -> bool {
        now.saturating_duration_since(t) >= self.window
    }
}

/// First eight characters of an API key, for logs and status responses.
pub fn redact_key(key: &str) -> String {
    let prefix: String = key.chars().take(8).collect();
    format!("{}...", prefix)
}
