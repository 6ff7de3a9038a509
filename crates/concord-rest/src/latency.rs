//! Rolling latency and clock-offset estimation.
//!
//! The remote reports absolute reset timestamps against its own clock.
//! Converting those into safe local deadlines needs an estimate of both
//! the round-trip latency and the skew between the local clock and the
//! remote `Date` header.

use std::sync::Mutex;

/// Number of samples kept in each rolling window.
const WINDOW: usize = 10;

/// Rolling estimator over the last [`WINDOW`] round trips.
#[derive(Debug, Default)]
pub(crate) struct LatencyEstimator {
    inner: Mutex<Windows>,
}

#[derive(Debug, Default)]
struct Windows {
    /// Round-trip samples in milliseconds.
    latency: Window<u64>,
    /// Local-minus-remote clock offsets in milliseconds.
    offset: Window<i64>,
}

#[derive(Debug)]
struct Window<T> {
    samples: [T; WINDOW],
    next: usize,
    filled: usize,
}

impl<T: Copy + Default> Default for Window<T> {
    fn default() -> Self {
        Self {
            samples: [T::default(); WINDOW],
            next: 0,
            filled: 0,
        }
    }
}

impl<T: Copy + Default> Window<T> {
    fn push(&mut self, sample: T) {
        self.samples[self.next] = sample;
        self.next = self.next.wrapping_add(1) % WINDOW;
        self.filled = self.filled.saturating_add(1).min(WINDOW);
    }
}

impl LatencyEstimator {
    /// Record one round-trip sample in milliseconds.
    pub(crate) fn record_latency(&self, millis: u64) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.latency.push(millis);
        }
    }

    /// Record one clock-offset sample (local now minus remote `Date`),
    /// in milliseconds.
    pub(crate) fn record_offset(&self, millis: i64) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.offset.push(millis);
        }
    }

    /// Smoothed round-trip latency in milliseconds. Zero before any sample.
    pub(crate) fn latency(&self) -> u64 {
        let Ok(inner) = self.inner.lock() else {
            return 0;
        };
        let w = &inner.latency;
        if w.filled == 0 {
            return 0;
        }
        let sum: u64 = w.samples[..w.filled].iter().copied().sum();
        sum / w.filled as u64
    }

    /// Smoothed local-minus-remote clock offset in milliseconds.
    pub(crate) fn offset(&self) -> i64 {
        let Ok(inner) = self.inner.lock() else {
            return 0;
        };
        let w = &inner.offset;
        if w.filled == 0 {
            return 0;
        }
        let sum: i64 = w.samples[..w.filled].iter().copied().sum();
        sum / w.filled as i64
    }
}
