/*
 * limiter.rs
 * Copyright (C) 2026 Chris Burdess
 *
 * This file is part of Portalettere, a self-hostable mail server.
 *
 * Portalettere is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Portalettere is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Portalettere.  If not, see <http://www.gnu.org/licenses/>.
 */

//! Sliding-window rate limiting per client IP and per authenticated user.
//!
//! Every identity owns one counter. Identities are also grouped into coarse
//! time buckets (bucket size = 2 × window) by the bucket they were last
//! filed under; cleanup drops whole expired buckets, so expiry is O(1) per
//! identity rather than a scan of all counters.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::debug;

/// Piggy-backed cleanup runs once per this many mutations.
const CLEANUP_EVERY: u32 = 256;

struct Counter {
    window_start: Instant,
    count: u32,
    #[allow(dead_code)]
    last_request: Instant,
    bucket_key: u64,
}

struct LimiterState {
    counters: HashMap<String, Counter>,
    buckets: HashMap<u64, HashSet<String>>,
    ops: u32,
}

/// Counters and bucket counts, for logs and admin surfaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimiterStats {
    pub identities: usize,
    pub buckets: usize,
}

pub struct RateLimiter {
    ip_limit: u32,
    user_limit: u32,
    window: Duration,
    epoch: Instant,
    inner: Mutex<LimiterState>,
}

impl RateLimiter {
    pub fn new(ip_limit: u32, user_limit: u32, window: Duration) -> Self {
        Self {
            ip_limit,
            user_limit,
            window,
            epoch: Instant::now(),
            inner: Mutex::new(LimiterState {
                counters: HashMap::new(),
                buckets: HashMap::new(),
                ops: 0,
            }),
        }
    }

    fn bucket_size(&self) -> u64 {
        (self.window.as_secs() * 2).max(1)
    }

    fn bucket_for(&self, now: Instant) -> u64 {
        now.duration_since(self.epoch).as_secs() / self.bucket_size()
    }

    /// Record a hit from `ip`; false means the window budget is spent.
    pub fn check_and_increment(&self, ip: IpAddr) -> bool {
        self.hit(format!("ip:{}", ip), self.ip_limit, Instant::now())
    }

    /// Record a hit for an authenticated user.
    pub fn check_and_increment_user(&self, username: &str) -> bool {
        self.hit(format!("user:{}", username), self.user_limit, Instant::now())
    }

    pub fn remaining(&self, ip: IpAddr) -> u32 {
        self.remaining_key(&format!("ip:{}", ip), self.ip_limit, Instant::now())
    }

    pub fn remaining_user(&self, username: &str) -> u32 {
        self.remaining_key(&format!("user:{}", username), self.user_limit, Instant::now())
    }

    fn hit(&self, key: String, limit: u32, now: Instant) -> bool {
        if limit == 0 {
            return false;
        }
        let bucket = self.bucket_for(now);
        let mut state = self.inner.lock().expect("limiter lock");
        state.ops = state.ops.wrapping_add(1);
        if state.ops % CLEANUP_EVERY == 0 {
            Self::cleanup_locked(&mut state, bucket);
        }

        // (allowed, bucket the identity migrated out of, if any)
        let (allowed, migrated_from) = match state.counters.get_mut(&key) {
            Some(c) => {
                if now.duration_since(c.window_start) >= self.window {
                    c.window_start = now;
                    c.count = 1;
                    c.last_request = now;
                    // A refreshed identity migrates to the current bucket so
                    // bulk expiry never collects it mid-window.
                    if c.bucket_key != bucket {
                        let old = c.bucket_key;
                        c.bucket_key = bucket;
                        (true, Some(old))
                    } else {
                        (true, None)
                    }
                } else if c.count >= limit {
                    // count == limit rejects; the window never resets early.
                    c.last_request = now;
                    (false, None)
                } else {
                    c.count += 1;
                    c.last_request = now;
                    (true, None)
                }
            }
            None => {
                state.counters.insert(
                    key.clone(),
                    Counter {
                        window_start: now,
                        count: 1,
                        last_request: now,
                        bucket_key: bucket,
                    },
                );
                state.buckets.entry(bucket).or_default().insert(key.clone());
                (true, None)
            }
        };
        if let Some(old) = migrated_from {
            if let Some(set) = state.buckets.get_mut(&old) {
                set.remove(&key);
                if set.is_empty() {
                    state.buckets.remove(&old);
                }
            }
            state.buckets.entry(bucket).or_default().insert(key);
        }
        allowed
    }

    fn remaining_key(&self, key: &str, limit: u32, now: Instant) -> u32 {
        let state = self.inner.lock().expect("limiter lock");
        match state.counters.get(key) {
            Some(c) if now.duration_since(c.window_start) < self.window => {
                limit.saturating_sub(c.count)
            }
            _ => limit,
        }
    }

    /// Drop every bucket strictly older than the previous one, freeing all
    /// counters filed under it. Idempotent; callable from a background task
    /// as well as piggy-backed on hits.
    pub fn cleanup(&self) {
        let bucket = self.bucket_for(Instant::now());
        let mut state = self.inner.lock().expect("limiter lock");
        Self::cleanup_locked(&mut state, bucket);
    }

    fn cleanup_locked(state: &mut LimiterState, current_bucket: u64) {
        let expired: Vec<u64> = state
            .buckets
            .keys()
            .copied()
            .filter(|&k| k + 1 < current_bucket)
            .collect();
        if expired.is_empty() {
            return;
        }
        let mut freed = 0usize;
        for key in expired {
            if let Some(identities) = state.buckets.remove(&key) {
                for id in identities {
                    // Guard against an identity that migrated after this
                    // bucket snapshot was taken.
                    if state.counters.get(&id).map(|c| c.bucket_key) == Some(key) {
                        state.counters.remove(&id);
                        freed += 1;
                    }
                }
            }
        }
        if freed > 0 {
            debug!(freed, "rate limiter cleanup");
        }
    }

    pub fn stats(&self) -> LimiterStats {
        let state = self.inner.lock().expect("limiter lock");
        LimiterStats {
            identities: state.counters.len(),
            buckets: state.buckets.len(),
        }
    }
}
