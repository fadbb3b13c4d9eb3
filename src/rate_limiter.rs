// SPDX-License-Identifier: BUSL-1.1

//! Token-bucket rate limiting, shared by the per-client inbound limiter, the
//! per-IP and global connection limiters, and the Resource Guard's ingress
//! and broadcast buckets.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::Instant;

/// A single token bucket. `try_acquire` is synchronous and non-blocking;
/// refill is computed lazily from elapsed wall-clock time rather than via a
/// background tick.
pub struct TokenBucket {
    rate_per_sec: f64,
    capacity: f64,
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(rate_per_sec: f64, capacity: f64) -> Self {
        Self {
            rate_per_sec,
            capacity,
            state: Mutex::new(BucketState { tokens: capacity, last_refill: Instant::now() }),
        }
    }

    /// Construct a bucket with burst = `2x` the rate, matching the Ingress
    /// and Broadcast bucket policy.
    pub fn with_double_burst(rate_per_sec: f64) -> Self {
        Self::new(rate_per_sec, rate_per_sec * 2.0)
    }

    /// Attempt to consume one token. Returns `true` if a token was
    /// available.
    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.last_refill = now;
        state.tokens = (state.tokens + elapsed * self.rate_per_sec).min(self.capacity);
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Per-IP connection token buckets, created lazily and never actively
/// swept — IPs that stop connecting simply stop refilling past capacity and
/// cost a single map entry each, acceptable at the target scale (§1).
pub struct PerIpBuckets {
    rate_per_sec: f64,
    burst: f64,
    buckets: Mutex<HashMap<IpAddr, TokenBucket>>,
}

impl PerIpBuckets {
    pub fn new(rate_per_sec: f64, burst: f64) -> Self {
        Self { rate_per_sec, burst, buckets: Mutex::new(HashMap::new()) }
    }

    pub fn try_acquire(&self, ip: IpAddr) -> bool {
        let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        let bucket = buckets.entry(ip).or_insert_with(|| TokenBucket::new(self.rate_per_sec, self.burst));
        bucket.try_acquire()
    }
}
