//! Shared token-bucket throttler bounding aggregate bytes/sec.

use parking_lot::Mutex;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::abort::AbortChecker;

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket shared by every worker of one side. Refills at the average
/// rate; the bucket capacity bounds bursts so short windows stay under the
/// peak rate.
pub struct Throttler {
    avg_bytes_per_sec: f64,
    capacity: f64,
    bucket: Mutex<Bucket>,
}

impl Throttler {
    /// Rates are mebibytes/sec; `peak <= 0` derives a small burst allowance
    /// from the average.
    pub fn new(avg_mbytes_per_sec: f64, peak_mbytes_per_sec: f64) -> Arc<Throttler> {
        let avg = avg_mbytes_per_sec * 1_048_576.0;
        let peak = if peak_mbytes_per_sec > 0.0 {
            peak_mbytes_per_sec * 1_048_576.0
        } else {
            avg * 1.2
        };
        // bursts may run at peak for up to 100ms
        let capacity = (peak * 0.1).max(1.0);
        Arc::new(Throttler {
            avg_bytes_per_sec: avg,
            capacity,
            bucket: Mutex::new(Bucket {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        })
    }

    /// Block until the bucket admits `bytes`. Returns false if the abort
    /// flag fired while waiting.
    pub fn limit(&self, bytes: u64, abort: &dyn AbortChecker) -> bool {
        let mut need = bytes as f64;
        loop {
            if abort.should_abort() {
                return false;
            }
            let wait = {
                let mut bucket = self.bucket.lock();
                let now = Instant::now();
                let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
                bucket.last_refill = now;
                bucket.tokens = (bucket.tokens + elapsed * self.avg_bytes_per_sec)
                    .min(self.capacity.max(need));
                if bucket.tokens >= need {
                    bucket.tokens -= need;
                    return true;
                }
                // drain what is there, sleep for the rest
                need -= bucket.tokens;
                bucket.tokens = 0.0;
                need / self.avg_bytes_per_sec
            };
            let wait = Duration::from_secs_f64(wait.min(0.05));
            thread::sleep(wait);
        }
    }
}
