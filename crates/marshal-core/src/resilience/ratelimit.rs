//! Sliding-window rate limiter.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::time::sleep;

/// Permits at most `max_calls` acquisitions per trailing `window`.
/// `acquire()` suspends the caller until a slot frees up.
pub struct RateLimiter {
    max_calls: usize,
    window: Duration,
    calls: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(max_calls: usize, window: Duration) -> Self {
        assert!(max_calls > 0, "rate limiter needs at least one slot");
        Self {
            max_calls,
            window,
            calls: Mutex::new(VecDeque::with_capacity(max_calls)),
        }
    }

    /// Take a slot immediately if one is free.
    pub fn try_acquire(&self) -> bool {
        self.slot_or_wait().is_none()
    }

    /// Wait for a slot, then take it.
    pub async fn acquire(&self) {
        loop {
            match self.slot_or_wait() {
                None => return,
                Some(wait) => sleep(wait).await,
            }
        }
    }

    /// Either records a call (None) or returns how long until the oldest
    /// in-window call expires.
    fn slot_or_wait(&self) -> Option<Duration> {
        let mut calls = self.calls.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        while let Some(front) = calls.front() {
            if now.duration_since(*front) >= self.window {
                calls.pop_front();
            } else {
                break;
            }
        }
        if calls.len() < self.max_calls {
            calls.push_back(now);
            None
        } else {
            let oldest = *calls.front().expect("non-empty at capacity");
            Some(self.window.saturating_sub(now.duration_since(oldest)))
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn try_acquire_exhausts_slots() {
        let limiter = RateLimiter::new(2, Duration::from_secs(60));
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
    }

    #[test]
    fn slots_free_after_window() {
        let limiter = RateLimiter::new(1, Duration::from_millis(20));
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
        std::thread::sleep(Duration::from_millis(30));
        assert!(limiter.try_acquire());
    }

    #[tokio::test]
    async fn acquire_blocks_until_slot_frees() {
        let limiter = RateLimiter::new(2, Duration::from_millis(50));
        let start = Instant::now();
        limiter.acquire().await;
        limiter.acquire().await;
        // Third acquisition must wait out the window
        limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_millis(40));
    }
}
