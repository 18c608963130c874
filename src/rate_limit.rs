//! Per-client token-bucket rate limiting.
//!
//! One bucket per client key, created lazily with full burst capacity and
//! refilled continuously at the steady rate. Buckets unused for longer than
//! the idle timeout are evicted by a periodic sweep so the registry stays
//! bounded by the number of recently active clients.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: f64,
    rate: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// A full bucket holding `capacity` tokens, refilling at `rate` per second.
    pub fn new(rate: f64, capacity: u32, now: Instant) -> Self {
        Self {
            capacity: f64::from(capacity),
            rate,
            tokens: f64::from(capacity),
            last_refill: now,
        }
    }

    /// Refill for the time elapsed since the last call, then try to take one token.
    pub fn try_acquire(&mut self, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.capacity);
        if now > self.last_refill {
            self.last_refill = now;
        }
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    pub fn available(&self) -> f64 {
        self.tokens
    }
}

struct Entry {
    bucket: TokenBucket,
    last_seen: Instant,
}

pub struct RateLimiterRegistry {
    entries: Mutex<HashMap<String, Entry>>,
    rate: f64,
    burst: u32,
    idle_timeout: Duration,
}

impl RateLimiterRegistry {
    pub fn new(rate: f64, burst: u32, idle_timeout: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            rate,
            burst,
            idle_timeout,
        }
    }

    /// Try to admit one request for `key`.
    ///
    /// The refill and consume happen under the registry lock, so concurrent
    /// checks for one key never spend the same token twice.
    pub fn check(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(key) {
            entry.last_seen = now;
            return entry.bucket.try_acquire(now);
        }

        let mut bucket = TokenBucket::new(self.rate, self.burst, now);
        let allowed = bucket.try_acquire(now);
        entries.insert(
            key.to_string(),
            Entry {
                bucket,
                last_seen: now,
            },
        );
        allowed
    }

    /// Drop every key idle for longer than the idle timeout. Returns the count removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| now.saturating_duration_since(entry.last_seen) <= self.idle_timeout);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run [`sweep`](Self::sweep) every `interval` until shutdown is signalled
    /// or the registry is dropped.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let registry = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                if *shutdown.borrow() {
                    break;
                }
                tokio::select! {
                    _ = ticker.tick() => {
                        let Some(registry) = registry.upgrade() else {
                            debug!("rate limiter dropped, sweeper exiting");
                            break;
                        };
                        let removed = registry.sweep();
                        if removed > 0 {
                            debug!(removed, remaining = registry.len(), "evicted idle rate limiters");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        })
    }
}
