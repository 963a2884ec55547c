//! Per-service rate-limit accumulator. Tracks a sliding 60s window
//! of HTTP 429 responses and trips the Router's seed-rotation hook once the
//! first recorded hit is at least 60s old.
//!
//! Mutex-protected rather than CAS-based: the filter-chain rate limiter this
//! is grounded on documented a refill bug where a CAS-only update silently
//! drops updates under contention. The accumulator is updated far less often
//! than a request-path token bucket, so a `tokio::sync::Mutex` costs nothing.

use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

const WINDOW: Duration = Duration::from_secs(60);

struct Inner {
    first_hit: Option<Instant>,
    hits: VecDeque<Instant>,
    last_hit: Option<Instant>,
    pending_rotation: bool,
}

pub struct RateLimitAccumulator {
    inner: Mutex<Inner>,
}

impl Default for RateLimitAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimitAccumulator {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                first_hit: None,
                hits: VecDeque::new(),
                last_hit: None,
                pending_rotation: false,
            }),
        }
    }

    /// Record an HTTP 429. Returns `true` exactly once per rotation cycle —
    /// the moment the first-hit timestamp crosses the 60s threshold — so the
    /// caller can invoke the Router's rotation hook without double-firing.
    pub async fn record_429(&self) -> bool {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        if inner.first_hit.is_none() {
            inner.first_hit = Some(now);
        }
        inner.hits.push_back(now);
        while let Some(front) = inner.hits.front() {
            if now.duration_since(*front) > WINDOW {
                inner.hits.pop_front();
            } else {
                break;
            }
        }
        inner.last_hit = Some(now);

        if inner.pending_rotation {
            return false;
        }
        if let Some(first) = inner.first_hit {
            if now.duration_since(first) >= WINDOW {
                inner.pending_rotation = true;
                return true;
            }
        }
        false
    }

    /// Any non-429 success clears the accumulator entirely.
    pub async fn record_success(&self) {
        let mut inner = self.inner.lock().await;
        inner.first_hit = None;
        inner.hits.clear();
        inner.last_hit = None;
        inner.pending_rotation = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn success_clears_state() {
        let acc = RateLimitAccumulator::new();
        acc.record_429().await;
        acc.record_success().await;
        let inner = acc.inner.lock().await;
        assert!(inner.first_hit.is_none());
        assert!(inner.hits.is_empty());
    }

    #[tokio::test]
    async fn single_hit_does_not_trigger_rotation() {
        let acc = RateLimitAccumulator::new();
        assert!(!acc.record_429().await);
    }

    #[tokio::test]
    async fn pending_rotation_does_not_refire() {
        let acc = RateLimitAccumulator::new();
        {
            let mut inner = acc.inner.lock().await;
            inner.first_hit = Some(Instant::now() - Duration::from_secs(61));
        }
        assert!(acc.record_429().await);
        // Second 429 after rotation already pending must not refire.
        assert!(!acc.record_429().await);
    }

    #[tokio::test]
    async fn sixty_second_old_first_hit_triggers_rotation() {
        let acc = RateLimitAccumulator::new();
        {
            let mut inner = acc.inner.lock().await;
            inner.first_hit = Some(Instant::now() - Duration::from_secs(60));
        }
        assert!(acc.record_429().await);
    }
}
