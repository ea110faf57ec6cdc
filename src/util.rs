//! Small crate-internal helpers.

use core::hint;
use std::thread;

/// Prints a one-line diagnostic to stderr and terminates the process with a
/// non-zero exit status. Used for unrecoverable configuration errors and for
/// operations that are declared but intentionally unimplemented.
macro_rules! fatal {
    ($($arg:tt)*) => {{
        ::std::eprintln!($($arg)*);
        ::std::process::exit(1)
    }};
}

pub(crate) use fatal;

/// A bounded-backoff spinner. Polling loops that expect to be released within
/// a few hundred cycles (descriptor publication, ordered turn-taking) spin
/// with exponentially increasing pauses, then degrade to yielding the thread.
pub(crate) struct Backoff {
    step: u32,
}

impl Backoff {
    pub(crate) fn new() -> Backoff {
        Backoff { step: 0 }
    }

    pub(crate) fn snooze(&mut self) {
        if self.step < 6 {
            for _ in 0..(1 << self.step) {
                hint::spin_loop();
            }
            self.step += 1;
        } else {
            thread::yield_now();
        }
    }
}
