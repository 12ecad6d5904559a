//! Fixed-window rate limiting: `/register` per source IP, and
//! `/connection/*` + `/signal` traffic per authenticated client.
//!
//! Grounded on the relay's windowed counter (`fedi3_relay::RateLimiter`),
//! minus its Redis-backed pool path — this service's single-process scope
//! means the in-process window is already authoritative,
//! so there's nothing a shared counter would buy beyond what
//! [`crate::store::Store`] already gives the rest of the server.

use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

#[derive(Clone, Copy)]
struct WindowCounter {
    window_start_ms: u64,
    count: u32,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

pub struct RateLimiter {
    windows: Mutex<HashMap<String, WindowCounter>>,
    window: Duration,
}

impl RateLimiter {
    pub fn new(window: Duration) -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
            window,
        }
    }

    /// Check and consume one unit of `bucket:key`'s budget. Returns `Ok(())`
    /// if under `limit`, or the number of seconds to wait otherwise.
    pub fn check(&self, bucket: &str, key: &str, limit: u32) -> Result<(), u64> {
        let window_ms = self.window.as_millis() as u64;
        let full_key = format!("{bucket}:{key}");
        let now = now_ms();

        let mut windows = self.windows.lock();
        if windows.len() > 50_000 {
            let cutoff = now.saturating_sub(window_ms * 2);
            windows.retain(|_, w| w.window_start_ms >= cutoff);
        }

        let counter = windows.entry(full_key).or_insert(WindowCounter {
            window_start_ms: now,
            count: 0,
        });
        if now.saturating_sub(counter.window_start_ms) >= window_ms {
            counter.window_start_ms = now;
            counter.count = 0;
        }

        if counter.count >= limit {
            let elapsed = now.saturating_sub(counter.window_start_ms);
            let retry_after_ms = window_ms.saturating_sub(elapsed).max(1);
            return Err(retry_after_ms.div_ceil(1000));
        }
        counter.count += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_up_to_the_limit() {
        let limiter = RateLimiter::new(Duration::from_secs(60));
        for _ in 0..5 {
            assert!(limiter.check("register", "1.2.3.4", 5).is_ok());
        }
        assert!(limiter.check("register", "1.2.3.4", 5).is_err());
    }

    #[test]
    fn buckets_are_independent_per_key() {
        let limiter = RateLimiter::new(Duration::from_secs(60));
        for _ in 0..5 {
            assert!(limiter.check("register", "1.2.3.4", 5).is_ok());
        }
        assert!(limiter.check("register", "5.6.7.8", 5).is_ok());
    }

    #[test]
    fn buckets_are_independent_per_name() {
        let limiter = RateLimiter::new(Duration::from_secs(60));
        for _ in 0..5 {
            assert!(limiter.check("register", "1.2.3.4", 5).is_ok());
        }
        assert!(limiter.check("connection", "1.2.3.4", 5).is_ok());
    }

    #[test]
    fn window_resets_after_it_elapses() {
        let limiter = RateLimiter::new(Duration::from_millis(10));
        assert!(limiter.check("register", "k", 1).is_ok());
        assert!(limiter.check("register", "k", 1).is_err());
        std::thread::sleep(Duration::from_millis(30));
        assert!(limiter.check("register", "k", 1).is_ok());
    }

    #[test]
    fn rejection_reports_a_positive_retry_after() {
        let limiter = RateLimiter::new(Duration::from_secs(60));
        assert!(limiter.check("register", "k", 1).is_ok());
        let retry_after = limiter.check("register", "k", 1).unwrap_err();
        assert!(retry_after > 0);
    }
}
