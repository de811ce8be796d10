// Token-bucket sampling
//
// Two layers of rate gating: one global bucket shared by all probes and one
// bucket per probe. A hit proceeds to capture only if it can withdraw a token
// from both; failing either silently drops the hit. Buckets refill
// continuously and hold at most one second worth of tokens.

use std::collections::HashMap;
use std::time::Instant;

use tracing::trace;

#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: f64,
    tokens: f64,
    rate_per_second: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Burst is one second of tokens, but never less than a single token so
    /// sub-1/s rates can fire at all. Buckets start full: the first hit of a
    /// fresh probe is always accepted.
    pub fn new(rate_per_second: f64, now: Instant) -> Self {
        let capacity = rate_per_second.max(1.0);
        TokenBucket { capacity, tokens: capacity, rate_per_second, last_refill: now }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.tokens = (self.tokens + elapsed.as_secs_f64() * self.rate_per_second)
            .min(self.capacity);
        self.last_refill = now;
    }

    pub fn try_acquire(&mut self, now: Instant) -> bool {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Return a token taken from this bucket when the other layer denied the
    /// hit, so a global rejection does not also consume probe budget.
    fn release(&mut self) {
        self.tokens = (self.tokens + 1.0).min(self.capacity);
    }
}

#[derive(Debug)]
struct ProbeBucket {
    bucket: TokenBucket,
    last_accepted: Option<Instant>,
}

/// Sampling state for all live probes. Owned by the manager; created and
/// destroyed alongside each probe.
#[derive(Debug)]
pub struct Sampler {
    global: TokenBucket,
    probes: HashMap<String, ProbeBucket>,
}

impl Sampler {
    pub fn new(global_rate_per_second: f64, now: Instant) -> Self {
        Sampler { global: TokenBucket::new(global_rate_per_second, now), probes: HashMap::new() }
    }

    pub fn track_probe(&mut self, probe_id: &str, rate_per_second: f64, now: Instant) {
        self.probes.insert(
            probe_id.to_string(),
            ProbeBucket { bucket: TokenBucket::new(rate_per_second, now), last_accepted: None },
        );
    }

    pub fn forget_probe(&mut self, probe_id: &str) {
        self.probes.remove(probe_id);
    }

    /// Withdraw from both the probe's bucket and the global bucket. The
    /// acceptance timestamp is recorded only on success.
    pub fn try_acquire(&mut self, probe_id: &str, now: Instant) -> bool {
        let Some(probe) = self.probes.get_mut(probe_id) else {
            return false;
        };
        if !probe.bucket.try_acquire(now) {
            trace!(probe_id, "hit dropped by probe rate limit");
            return false;
        }
        if !self.global.try_acquire(now) {
            probe.bucket.release();
            trace!(probe_id, "hit dropped by global rate limit");
            return false;
        }
        probe.last_accepted = Some(now);
        true
    }

    pub fn last_accepted(&self, probe_id: &str) -> Option<Instant> {
        self.probes.get(probe_id).and_then(|probe| probe.last_accepted)
    }
}
