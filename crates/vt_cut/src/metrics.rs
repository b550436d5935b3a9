//! Dispatch metrics: cumulative counters and a rolling timing history.
//!
//! # Usage
//!
//! ```ignore
//! let metrics = engine.metrics();
//! if let Some((min, max)) = metrics.dispatch_us.min_max() {
//!     println!("dispatch {:.1}us avg ({min}..{max})", metrics.dispatch_us.average());
//! }
//! ```

use std::collections::VecDeque;

use crate::engine::DispatchStats;

/// Most recent durations in microseconds, oldest evicted first.
#[derive(Debug, Clone)]
pub struct TimingWindow {
    buffer: VecDeque<u64>,
    capacity: usize,
    sum: u64,
}

impl TimingWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: VecDeque::with_capacity(capacity),
            capacity,
            sum: 0,
        }
    }

    /// Push a new value, evicting the oldest if at capacity.
    pub fn push(&mut self, value: u64) {
        if self.capacity == 0 {
            return;
        }
        if self.buffer.len() >= self.capacity {
            if let Some(oldest) = self.buffer.pop_front() {
                self.sum -= oldest;
            }
        }
        self.buffer.push_back(value);
        self.sum += value;
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn sum(&self) -> u64 {
        self.sum
    }

    /// Average of all values; 0 when empty.
    pub fn average(&self) -> f64 {
        if self.buffer.is_empty() {
            0.0
        } else {
            self.sum as f64 / self.buffer.len() as f64
        }
    }

    pub fn min_max(&self) -> Option<(u64, u64)> {
        let min = self.buffer.iter().min()?;
        let max = self.buffer.iter().max()?;
        Some((*min, *max))
    }
}

impl Default for TimingWindow {
    fn default() -> Self {
        Self::new(128) // ~2 seconds of 60Hz feedback
    }
}

/// Engine-wide dispatch counters, summed over every context.
#[derive(Debug, Clone, Default)]
pub struct DispatchMetrics {
    /// Completed dispatches.
    pub dispatches: u64,
    /// Dispatches that ran while frozen.
    pub frozen_dispatches: u64,
    pub splits: u64,
    pub collapses: u64,
    /// Split candidates demoted by the budget.
    pub demoted: u64,
    /// Actions deferred because a tile or slot was not available.
    pub deferred: u64,
    /// Recent dispatch durations in microseconds.
    pub dispatch_us: TimingWindow,
}

impl DispatchMetrics {
    /// Fold the statistics of one dispatch in.
    pub fn record(&mut self, stats: &DispatchStats) {
        self.dispatches += 1;
        if stats.frozen {
            self.frozen_dispatches += 1;
        }
        self.splits += stats.splits as u64;
        self.collapses += stats.collapses as u64;
        self.demoted += stats.demoted as u64;
        self.deferred += stats.deferred as u64;
        self.dispatch_us.push(stats.dispatch_us);
    }
}
