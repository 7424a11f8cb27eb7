/// Receive-rate throttler. Token bucket over a bytes/sec rate; `limit`
/// blocks the calling worker until the bytes it just moved are admitted.
/// Accounting is deficit based, so one call larger than the bucket still
/// paces correctly instead of stalling forever.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

pub struct Throttler {
    rate_bytes_per_sec: f64,
    capacity: f64,
    bucket: Mutex<Bucket>,
}

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl Throttler {
    pub fn new(rate_bytes_per_sec: u64) -> Throttler {
        let rate = rate_bytes_per_sec.max(1) as f64;
        // a quarter second of burst keeps short reads from sleeping
        let capacity = (rate / 4.0).max(64.0 * 1024.0);
        Throttler {
            rate_bytes_per_sec: rate,
            capacity,
            bucket: Mutex::new(Bucket {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn rate_bytes_per_sec(&self) -> u64 {
        self.rate_bytes_per_sec as u64
    }

    /// Account `bytes` against the rate, sleeping off any deficit.
    pub fn limit(&self, bytes: u64) {
        let sleep_for = {
            let mut b = self.bucket.lock();
            let now = Instant::now();
            let elapsed = now.duration_since(b.last_refill).as_secs_f64();
            b.last_refill = now;
            b.tokens = (b.tokens + elapsed * self.rate_bytes_per_sec).min(self.capacity);
            b.tokens -= bytes as f64;
            if b.tokens < 0.0 {
                Duration::from_secs_f64(-b.tokens / self.rate_bytes_per_sec)
            } else {
                Duration::ZERO
            }
        };
        if !sleep_for.is_zero() {
            std::thread::sleep(sleep_for);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paces_sustained_transfer() {
        let throttler = Throttler::new(1_000_000);
        let start = Instant::now();
        // 850k over a 1 MB/s rate with a 250k burst allowance: at least
        // ~600ms must be slept off
        for _ in 0..17 {
            throttler.limit(50_000);
        }
        assert!(start.elapsed() >= Duration::from_millis(450));
    }

    #[test]
    fn small_burst_passes_untouched() {
        let throttler = Throttler::new(1_000_000);
        let start = Instant::now();
        throttler.limit(10_000);
        assert!(start.elapsed() < Duration::from_millis(50));
    }
}
