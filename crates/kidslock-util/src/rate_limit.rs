//! Per-client request throttling for the control socket

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::ClientId;

/// Token bucket per client, refilled continuously at `capacity / window`
#[derive(Debug)]
pub struct RateLimiter {
    capacity: f64,
    per_second: f64,
    buckets: HashMap<ClientId, Bucket>,
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    updated: Instant,
}

impl RateLimiter {
    /// Allow bursts of `capacity` requests, sustained at `capacity` per `window`
    pub fn new(capacity: u32, window: Duration) -> Self {
        let window = window.as_secs_f64().max(f64::EPSILON);
        Self {
            capacity: capacity as f64,
            per_second: capacity as f64 / window,
            buckets: HashMap::new(),
        }
    }

    /// Take a token for `client_id`; `false` means the request is over the limit
    pub fn check(&mut self, client_id: &ClientId) -> bool {
        self.check_at(client_id, Instant::now())
    }

    pub fn check_at(&mut self, client_id: &ClientId, now: Instant) -> bool {
        let capacity = self.capacity;
        let bucket = self.buckets.entry(client_id.clone()).or_insert(Bucket {
            tokens: capacity,
            updated: now,
        });

        let elapsed = now.saturating_duration_since(bucket.updated).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.per_second).min(capacity);
        bucket.updated = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    pub fn remove_client(&mut self, client_id: &ClientId) {
        self.buckets.remove(client_id);
    }

    pub fn tracked_clients(&self) -> usize {
        self.buckets.len()
    }
}
