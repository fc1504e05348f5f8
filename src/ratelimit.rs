//! Token buckets for upload shaping and per-peer ingress limits.
//!
//! A bucket holds at most `capacity` tokens and refills at `rate` tokens per
//! second. Byte buckets (upload, neighbor-repair egress) debit the frame size;
//! message buckets (proxy publish, unicast ingress) debit one token per frame.

use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
pub struct TokenBucket {
    tokens: f64,
    capacity: f64,
    rate: f64,
    last_update: Instant,
}

impl TokenBucket {
    /// Starts full.
    pub fn new(rate: f64, capacity: f64) -> Self {
        let capacity = capacity.max(0.0);
        Self {
            tokens: capacity,
            capacity,
            rate: rate.max(0.0),
            last_update: Instant::now(),
        }
    }

    /// Byte bucket sized for `burst_secs` worth of traffic at `bytes_per_sec`.
    pub fn bytes(bytes_per_sec: u64, burst_secs: f64) -> Self {
        let rate = bytes_per_sec as f64;
        Self::new(rate, (rate * burst_secs).max(1.0))
    }

    /// Message bucket; a zero burst still admits a single message.
    pub fn messages(per_sec: f64, burst: u32) -> Self {
        Self::new(per_sec, burst.max(1) as f64)
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_update).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.capacity);
        self.last_update = now;
    }

    /// Debit `cost` tokens if available. Costs larger than the capacity are
    /// admitted from a full bucket so oversized frames are not starved forever.
    pub fn try_consume(&mut self, cost: f64) -> bool {
        self.refill();
        if self.tokens >= cost || (self.tokens >= self.capacity && cost > self.capacity) {
            self.tokens = (self.tokens - cost).max(0.0);
            true
        } else {
            false
        }
    }

    pub fn try_consume_one(&mut self) -> bool {
        self.try_consume(1.0)
    }
}
