//! Adaptive page-size optimizer (spec §4.1).
//!
//! Grows the recommended page size while observed elapsed time stays safely
//! below the per-query timeout budget; a timeout sample treats the attempted
//! size as an upper cap and backs off hard. Modeled on the teacher's rolling
//! latency tracker (`RedisPublishLatency`) plus its threshold evaluator
//! (`HealthEvaluator`): a ring buffer of recent samples feeds a simple,
//! inspectable decision rule rather than a closed-form curve.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// One observed (page_size, elapsed_ms) sample, or a timeout marker.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub page_size: usize,
    pub elapsed_ms: u64,
    pub timed_out: bool,
}

const HISTORY_CAPACITY: usize = 64;

/// Fraction of the timeout budget below which we consider there to be
/// "headroom" to grow the page size on the next fetch.
const GROWTH_HEADROOM: f64 = 0.5;
/// Multiplicative growth factor applied when headroom is observed.
const GROWTH_FACTOR: f64 = 1.5;
/// Multiplicative shrink factor applied immediately after a timeout.
const BACKOFF_FACTOR: f64 = 0.5;

#[derive(Debug)]
pub struct PageSizeOptimizer {
    current: AtomicUsize,
    initial_page_size: usize,
    max_page_size: usize,
    timeout_budget_ms: u64,
    history: Mutex<Vec<Sample>>,
}

impl PageSizeOptimizer {
    pub fn new(initial_page_size: usize, timeout_budget_ms: u64, max_page_size: usize) -> Self {
        Self {
            current: AtomicUsize::new(initial_page_size),
            initial_page_size,
            max_page_size,
            timeout_budget_ms,
            history: Mutex::new(Vec::with_capacity(HISTORY_CAPACITY)),
        }
    }

    pub fn size(&self) -> usize {
        self.current.load(Ordering::Relaxed)
    }

    /// Record a successful fetch's elapsed time at `size`. Callers must pass
    /// `max(stage1_ms, stage2_ms, 1)` — never the faster leg (spec §4.3),
    /// since feeding only the fast stage would grow the page size until the
    /// slow stage starts timing out.
    pub fn record_timing(&self, size: usize, elapsed_ms: u64) {
        self.push_sample(Sample {
            page_size: size,
            elapsed_ms,
            timed_out: false,
        });

        let headroom_ratio = elapsed_ms as f64 / self.timeout_budget_ms.max(1) as f64;
        let next = if headroom_ratio < GROWTH_HEADROOM {
            ((size as f64) * GROWTH_FACTOR).round() as usize
        } else {
            size
        };
        let next = next.clamp(self.initial_page_size.min(next.max(1)), self.max_page_size).max(1);
        self.current.store(next, Ordering::Relaxed);
    }

    /// Record a query-timeout sample at `size`: treat `size` as an upper cap
    /// and back off strictly below it.
    pub fn record_timeout(&self, size: usize) {
        self.push_sample(Sample {
            page_size: size,
            elapsed_ms: self.timeout_budget_ms,
            timed_out: true,
        });

        let capped = ((size as f64) * BACKOFF_FACTOR).round() as usize;
        let next = capped.clamp(1, size.saturating_sub(1).max(1));
        self.current.store(next, Ordering::Relaxed);
    }

    pub fn history(&self) -> Vec<Sample> {
        self.history.lock().expect("page size history poisoned").clone()
    }

    fn push_sample(&self, sample: Sample) {
        let mut hist = self.history.lock().expect("page size history poisoned");
        if hist.len() == HISTORY_CAPACITY {
            hist.remove(0);
        }
        hist.push(sample);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grows_with_headroom() {
        let opt = PageSizeOptimizer::new(1_000, 5_000, 40_000);
        opt.record_timing(1_000, 500); // 10% of budget: plenty of headroom
        assert!(opt.size() > 1_000);
    }

    #[test]
    fn does_not_grow_near_budget() {
        let opt = PageSizeOptimizer::new(1_000, 5_000, 40_000);
        opt.record_timing(1_000, 4_900); // 98% of budget: no headroom
        assert_eq!(opt.size(), 1_000);
    }

    #[test]
    fn timeout_strictly_decreases_below_attempted_size() {
        let opt = PageSizeOptimizer::new(10_000, 5_000, 40_000);
        let before = opt.size();
        opt.record_timeout(before);
        assert!(opt.size() < before);
    }

    #[test]
    fn never_exceeds_max_page_size() {
        let opt = PageSizeOptimizer::new(39_000, 5_000, 40_000);
        for _ in 0..10 {
            opt.record_timing(opt.size(), 1);
        }
        assert!(opt.size() <= 40_000);
    }

    #[test]
    fn history_is_bounded_and_ordered() {
        let opt = PageSizeOptimizer::new(1_000, 5_000, 40_000);
        for i in 0..(HISTORY_CAPACITY + 10) {
            opt.record_timing(1_000, i as u64);
        }
        let hist = opt.history();
        assert_eq!(hist.len(), HISTORY_CAPACITY);
        assert_eq!(hist.last().unwrap().elapsed_ms, (HISTORY_CAPACITY + 9) as u64);
    }

    #[test]
    fn query_timeout_example_from_spec() {
        // §8 scenario 6: Stage 1 at page size 10,000 times out -> next
        // size() is strictly less than 10,000.
        let opt = PageSizeOptimizer::new(1_000, 5_000, 40_000);
        opt.current.store(10_000, Ordering::Relaxed);
        opt.record_timeout(10_000);
        assert!(opt.size() < 10_000);
    }
}
