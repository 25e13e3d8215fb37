//! Sliding-window rate limiting behind a swappable counter port.
//!
//! The in-process store keeps per-key hit timestamps; increments are
//! atomic per key. A Redis-compatible implementation can replace the port
//! without touching the limiter.

use std::collections::VecDeque;
use std::sync::Mutex;

use dashmap::DashMap;
use tracing::debug;

use maestro_core::config::{RateLimitConfig, RateLimitScope, RateWindow};

use crate::error::{AuthError, Result};

/// Identity facets a request is counted against.
#[derive(Debug, Clone, Default)]
pub struct RateIdentity {
    pub ip: Option<String>,
    pub user: Option<String>,
    pub tenant: Option<String>,
}

/// Counter port: record a hit and report how many hits remain inside the
/// window, plus seconds until the oldest hit leaves it.
pub trait CounterStore: Send + Sync {
    fn hit(&self, key: &str, window_seconds: u64, now_unix: i64) -> (u64, u64);
}

/// In-process sliding window over a DashMap of timestamp queues.
#[derive(Default)]
pub struct MemoryCounterStore {
    hits: DashMap<String, Mutex<VecDeque<i64>>>,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CounterStore for MemoryCounterStore {
    fn hit(&self, key: &str, window_seconds: u64, now_unix: i64) -> (u64, u64) {
        let entry = self
            .hits
            .entry(key.to_string())
            .or_insert_with(|| Mutex::new(VecDeque::new()));
        let mut q = entry.lock().unwrap();
        let cutoff = now_unix - window_seconds as i64;
        while q.front().is_some_and(|t| *t <= cutoff) {
            q.pop_front();
        }
        q.push_back(now_unix);
        let count = q.len() as u64;
        let retry_after = q
            .front()
            .map(|oldest| ((oldest + window_seconds as i64) - now_unix).max(1) as u64)
            .unwrap_or(1);
        (count, retry_after)
    }
}

pub struct RateLimiter {
    windows: Vec<RateWindow>,
    store: Box<dyn CounterStore>,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            windows: config.windows.clone(),
            store: Box::new(MemoryCounterStore::new()),
        }
    }

    pub fn with_store(config: &RateLimitConfig, store: Box<dyn CounterStore>) -> Self {
        Self {
            windows: config.windows.clone(),
            store,
        }
    }

    /// Count this request against every applicable window; the first
    /// exceeded window denies with its retry hint.
    pub fn check(&self, identity: &RateIdentity) -> Result<()> {
        self.check_at(identity, chrono::Utc::now().timestamp())
    }

    pub fn check_at(&self, identity: &RateIdentity, now_unix: i64) -> Result<()> {
        for window in &self.windows {
            let Some(subject) = subject_for(window.scope, identity) else {
                continue;
            };
            let key = format!("rl:{}:{}", window.name, subject);
            let (count, retry_after) = self.store.hit(&key, window.window_seconds, now_unix);
            if count > window.limit {
                debug!(window = %window.name, subject = %subject, count, "rate limit exceeded");
                return Err(AuthError::RateLimited {
                    window: window.name.clone(),
                    retry_after_secs: retry_after,
                });
            }
        }
        Ok(())
    }
}

fn subject_for(scope: RateLimitScope, identity: &RateIdentity) -> Option<String> {
    match scope {
        RateLimitScope::Ip => identity.ip.clone(),
        RateLimitScope::User => identity.user.clone(),
        RateLimitScope::Tenant => identity.tenant.clone(),
        RateLimitScope::Global => Some("global".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(limit: u64, window_seconds: u64) -> RateLimiter {
        RateLimiter::new(&RateLimitConfig {
            windows: vec![RateWindow {
                name: "test".to_string(),
                limit,
                window_seconds,
                scope: RateLimitScope::User,
            }],
        })
    }

    fn identity(user: &str) -> RateIdentity {
        RateIdentity {
            user: Some(user.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn under_the_limit_passes() {
        let l = limiter(3, 60);
        for _ in 0..3 {
            l.check_at(&identity("u1"), 1000).unwrap();
        }
    }

    #[test]
    fn exceeding_the_window_denies_with_retry_hint() {
        let l = limiter(2, 60);
        l.check_at(&identity("u1"), 1000).unwrap();
        l.check_at(&identity("u1"), 1000).unwrap();
        match l.check_at(&identity("u1"), 1000).unwrap_err() {
            AuthError::RateLimited {
                window,
                retry_after_secs,
            } => {
                assert_eq!(window, "test");
                assert!(retry_after_secs >= 1 && retry_after_secs <= 60);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn window_slides_as_time_passes() {
        let l = limiter(2, 60);
        l.check_at(&identity("u1"), 1000).unwrap();
        l.check_at(&identity("u1"), 1000).unwrap();
        assert!(l.check_at(&identity("u1"), 1030).is_err());
        // first two hits have aged out
        l.check_at(&identity("u1"), 1061).unwrap();
    }

    #[test]
    fn identities_do_not_share_buckets() {
        let l = limiter(1, 60);
        l.check_at(&identity("u1"), 1000).unwrap();
        l.check_at(&identity("u2"), 1000).unwrap();
        assert!(l.check_at(&identity("u1"), 1000).is_err());
    }

    #[test]
    fn windows_without_a_subject_are_skipped() {
        let l = RateLimiter::new(&RateLimitConfig {
            windows: vec![RateWindow {
                name: "ip".to_string(),
                limit: 1,
                window_seconds: 60,
                scope: RateLimitScope::Ip,
            }],
        });
        // no IP on the identity: the window cannot apply
        for _ in 0..5 {
            l.check_at(&RateIdentity::default(), 1000).unwrap();
        }
    }
}
