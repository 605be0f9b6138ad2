//! Running statistics for the pool's readouts. Weakly consistent by design:
//! readers may observe a sequence mid-update relative to the counters.

use std::sync::Mutex;

/// Exponentially discounted sample sequence. Tracks a decaying average and
/// variance so sizing heuristics weigh recent cycles heavier than old ones.
pub struct SampleSeq {
    sync: Mutex<SampleSeqSync>,
}

struct SampleSeqSync {
    count: usize,
    davg: f64,
    dvariance: f64,
}

impl SampleSeq {
    /// Discount factor per sample.
    const ALPHA: f64 = 0.3;

    pub const fn new() -> Self {
        Self {
            sync: Mutex::new(SampleSeqSync {
                count: 0,
                davg: 0.0,
                dvariance: 0.0,
            }),
        }
    }

    pub fn add(&self, value: f64) {
        let mut sync = self.sync.lock().unwrap();
        if sync.count == 0 {
            sync.davg = value;
            sync.dvariance = 0.0;
        } else {
            let diff = value - sync.davg;
            let incr = Self::ALPHA * diff;
            sync.davg += incr;
            // Decaying variance, see Knuth/West style update with discount.
            sync.dvariance = (1.0 - Self::ALPHA) * (sync.dvariance + diff * incr);
        }
        sync.count += 1;
    }

    pub fn count(&self) -> usize {
        self.sync.lock().unwrap().count
    }

    pub fn davg(&self) -> f64 {
        self.sync.lock().unwrap().davg
    }

    pub fn dvariance(&self) -> f64 {
        self.sync.lock().unwrap().dvariance
    }
}

impl Default for SampleSeq {
    fn default() -> Self {
        Self::new()
    }
}
