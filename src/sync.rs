//! Standalone locks and the unimplemented synchronization stubs.
//!
//! [`Lock`] is the simple lock surface: a bare full/empty cell that is empty
//! when unlocked. The nestable lock family, lock polling, and memory flushes
//! are declared but deliberately unimplemented; calling them terminates the
//! process with a diagnostic naming the operation.

use crate::cell::SyncCell;
use crate::util::fatal;

// -----------------------------------------------------------------------------
// Simple locks

/// A simple blocking lock over a full/empty cell. The cell is empty while
/// the lock is free and full while it is held.
pub struct Lock {
    cell: SyncCell,
}

impl Lock {
    /// Creates an unlocked lock.
    pub const fn new() -> Lock {
        Lock {
            cell: SyncCell::empty(),
        }
    }

    /// Acquires the lock, blocking until it is free. The lock is not
    /// reentrant: re-acquiring from the holding thread deadlocks.
    pub fn set(&self) {
        self.cell.write_ef(1);
    }

    /// Releases the lock.
    pub fn unset(&self) {
        let _ = self.cell.read_fe();
    }

    /// Lock polling is not implemented; calling this terminates the
    /// process.
    pub fn try_set(&self) -> bool {
        fatal!("test_lock is not yet implemented, aborting");
    }
}

impl Default for Lock {
    fn default() -> Lock {
        Lock::new()
    }
}

// -----------------------------------------------------------------------------
// Nestable locks

/// The nestable lock family. Every operation, including construction, is a
/// fatal stub.
pub struct NestLock {
    _private: (),
}

impl NestLock {
    /// Nestable locks are not implemented; calling this terminates the
    /// process.
    pub fn new() -> NestLock {
        fatal!("init_nest_lock is not yet implemented, aborting");
    }

    /// Nestable locks are not implemented; calling this terminates the
    /// process.
    pub fn set(&self) {
        fatal!("set_nest_lock is not yet implemented, aborting");
    }

    /// Nestable locks are not implemented; calling this terminates the
    /// process.
    pub fn unset(&self) {
        fatal!("unset_nest_lock is not yet implemented, aborting");
    }

    /// Nestable locks are not implemented; calling this terminates the
    /// process.
    pub fn try_set(&self) -> bool {
        fatal!("test_nest_lock is not yet implemented, aborting");
    }
}

// -----------------------------------------------------------------------------
// Flushes

/// Whole-memory flushes are not implemented; calling this terminates the
/// process.
pub fn flush_all() {
    fatal!("flush_all is not yet implemented, aborting");
}

/// Single-location flushes are not implemented; calling this terminates the
/// process.
pub fn flush_one<T>(_value: &T) {
    fatal!("flush_one is not yet implemented, aborting");
}

// -----------------------------------------------------------------------------
// Tests
