//! Per-source admission rate limiting
//!
//! Each source gets a token bucket (rate R, burst 2R). Buckets are created on
//! first sight and evicted after ten minutes of silence by a background
//! sweeper, so the map stays bounded by recent traffic rather than by every
//! address ever seen.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::debug;

const SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);
const IDLE_EVICTION: Duration = Duration::from_secs(10 * 60);

/// Token-bucket state. Refill happens lazily on each decision.
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(burst: f64, now: Instant) -> Self {
        Self {
            tokens: burst,
            last_refill: now,
        }
    }

    fn take(&mut self, rate: f64, burst: f64, now: Instant) -> bool {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * rate).min(burst);
        self.last_refill = now;
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

struct Entry {
    bucket: Mutex<TokenBucket>,
    last_seen: Mutex<Instant>,
}

/// Shared admission limiter. The map mutex only covers structural access;
/// the bucket decision itself runs on the entry's own lock.
pub struct RateLimiter {
    entries: Mutex<HashMap<String, Arc<Entry>>>,
    rate: f64,
    burst: f64,
}

impl RateLimiter {
    pub fn new(rate: f64) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            rate,
            burst: (rate * 2.0).floor(),
        }
    }

    /// Decide whether a request from `source` is admitted right now.
    /// Creates the bucket on first sight and touches its `last_seen`.
    pub fn allow(&self, source: &str) -> bool {
        let now = Instant::now();
        let entry = {
            let mut entries = self.entries.lock().unwrap();
            Arc::clone(
                entries
                    .entry(source.to_string())
                    .or_insert_with(|| Arc::new(Entry {
                        bucket: Mutex::new(TokenBucket::new(self.burst, now)),
                        last_seen: Mutex::new(now),
                    })),
            )
        };

        *entry.last_seen.lock().unwrap() = now;
        let admitted = entry.bucket.lock().unwrap().take(self.rate, self.burst, now);
        admitted
    }

    /// Drop entries idle longer than the eviction window. Returns how many
    /// were removed.
    fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    fn sweep_at(&self, now: Instant) -> usize {
        let mut entries = self.entries.lock().unwrap();
        let before = entries.len();
        entries.retain(|_, entry| {
            now.duration_since(*entry.last_seen.lock().unwrap()) <= IDLE_EVICTION
        });
        before - entries.len()
    }

    /// Background eviction loop; runs until the shutdown token fires.
    pub async fn run_sweeper(self: Arc<Self>, shutdown: CancellationToken) {
        let start = tokio::time::Instant::now() + SWEEP_INTERVAL;
        let mut ticker = tokio::time::interval_at(start, SWEEP_INTERVAL);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = ticker.tick() => {
                    let removed = self.sweep();
                    if removed > 0 {
                        debug!(removed, "rate limiter evicted idle sources");
                    }
                }
            }
        }
    }

    #[cfg(test)]
    fn entry_count(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}
