//! A blocking full/empty synchronization cell.
//!
//! A [`SyncCell`] holds a 64-bit value and a full/empty bit. Readers that
//! require a full cell and writers that require an empty one park on a futex
//! until the cell transitions into the state they need. This one primitive
//! backs critical sections, atomic sections, simple locks, task join
//! handles, and region join handles.

use core::sync::atomic::AtomicU32;
use core::sync::atomic::AtomicU64;
use core::sync::atomic::Ordering;

const EMPTY: u32 = 0;
const FULL: u32 = 1;
// An exclusive intermediate state taken by a writer between claiming an empty
// cell and publishing its value.
const WRITING: u32 = 2;

/// A 64-bit cell with a full/empty bit and blocking transitions.
pub struct SyncCell {
    state: AtomicU32,
    value: AtomicU64,
}

impl SyncCell {
    /// Creates a cell in the empty state.
    pub const fn empty() -> SyncCell {
        SyncCell {
            state: AtomicU32::new(EMPTY),
            value: AtomicU64::new(0),
        }
    }

    /// Creates a cell in the full state, holding `value`.
    pub const fn full(value: u64) -> SyncCell {
        SyncCell {
            state: AtomicU32::new(FULL),
            value: AtomicU64::new(value),
        }
    }

    /// Returns true if the cell is currently full. The answer may be stale by
    /// the time the caller acts on it.
    pub fn is_full(&self) -> bool {
        self.state.load(Ordering::Acquire) == FULL
    }

    /// Attempts to read the cell's value and mark it empty. Returns `None`
    /// without blocking if the cell is not full.
    pub fn try_read_fe(&self) -> Option<u64> {
        if self
            .state
            .compare_exchange(FULL, EMPTY, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            let value = self.value.load(Ordering::Relaxed);
            atomic_wait::wake_all(&self.state);
            Some(value)
        } else {
            None
        }
    }

    /// Blocks until the cell is full, then reads its value and marks it
    /// empty. Exactly one reader wins each fill.
    pub fn read_fe(&self) -> u64 {
        loop {
            if let Some(value) = self.try_read_fe() {
                return value;
            }
            let state = self.state.load(Ordering::Relaxed);
            if state != FULL {
                atomic_wait::wait(&self.state, state);
            }
        }
    }

    /// Attempts to claim an empty cell and fill it with `value`. Returns
    /// false without blocking if the cell is not empty.
    pub fn try_write_ef(&self, value: u64) -> bool {
        if self
            .state
            .compare_exchange(EMPTY, WRITING, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            self.value.store(value, Ordering::Relaxed);
            self.state.store(FULL, Ordering::Release);
            atomic_wait::wake_all(&self.state);
            true
        } else {
            false
        }
    }

    /// Blocks until the cell is empty, then fills it with `value`. Exactly
    /// one writer wins each drain.
    pub fn write_ef(&self, value: u64) {
        loop {
            if self.try_write_ef(value) {
                return;
            }
            let state = self.state.load(Ordering::Relaxed);
            if state != EMPTY {
                atomic_wait::wait(&self.state, state);
            }
        }
    }

    /// Fills the cell with `value` regardless of its current state, without
    /// blocking. Callers must ensure no writer holds the cell mid-publish.
    pub fn write_f(&self, value: u64) {
        self.value.store(value, Ordering::Relaxed);
        self.state.store(FULL, Ordering::Release);
        atomic_wait::wake_all(&self.state);
    }
}

// -----------------------------------------------------------------------------
// Tests

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::SyncCell;

    #[test]
    fn read_takes_the_value_and_empties() {
        let cell = SyncCell::full(17);
        assert!(cell.is_full());
        assert_eq!(cell.read_fe(), 17);
        assert!(!cell.is_full());
        assert_eq!(cell.try_read_fe(), None);
    }

    #[test]
    fn write_ef_requires_an_empty_cell() {
        let cell = SyncCell::empty();
        assert!(cell.try_write_ef(1));
        assert!(!cell.try_write_ef(2));
        assert_eq!(cell.read_fe(), 1);
        assert!(cell.try_write_ef(3));
    }

    #[test]
    fn blocked_reader_is_released_by_a_writer() {
        let cell = Arc::new(SyncCell::empty());
        let reader = {
            let cell = Arc::clone(&cell);
            thread::spawn(move || cell.read_fe())
        };
        // The reader may or may not have parked yet; either way the write
        // must release it.
        cell.write_f(99);
        assert_eq!(reader.join().unwrap(), 99);
    }

    #[test]
    fn cell_acts_as_a_baton_between_threads() {
        let cell = Arc::new(SyncCell::full(0));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let cell = Arc::clone(&cell);
            handles.push(thread::spawn(move || {
                for _ in 0..1000 {
                    let value = cell.read_fe();
                    cell.write_ef(value + 1);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(cell.read_fe(), 4000);
    }
}
