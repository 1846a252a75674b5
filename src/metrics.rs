//! Per-neighbour protocol counters for the monitoring layer.
//!
//! One counter record per table slot; slot 0 holds the aggregates that are
//! not attributable to a particular peer. Rows are formatted and reset in a
//! single critical section so the reporter and the engine never race.

use core::cell::RefCell;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;

use crate::MAX_NODES;

/// Fixed array of counter records guarded by one mutex.
pub struct MetricsStore<T> {
    inner: Mutex<CriticalSectionRawMutex, RefCell<[T; MAX_NODES]>>,
}

impl<T: Copy + Default> MetricsStore<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RefCell::new([T::default(); MAX_NODES])),
        }
    }

    /// Run `f` over the counter array inside the store's critical section.
    /// Used both for counting and for atomic read-and-reset reporting.
    pub fn with<R>(&self, f: impl FnOnce(&mut [T; MAX_NODES]) -> R) -> R {
        self.inner.lock(|cell| f(&mut cell.borrow_mut()))
    }
}

impl<T: Copy + Default> Default for MetricsStore<T> {
    fn default() -> Self {
        Self::new()
    }
}
