//! The explicit task join list.
//!
//! Every forked task registers a completion cell here before being queued.
//! A task-wait drains the list newest-first, blocking on each cell in turn.
//! Workers block cooperatively, so tasks still sitting in the shared queue
//! get executed by the waiting worker itself.

use std::sync::Arc;
use std::sync::Mutex;

use tracing::trace;

use crate::cell::SyncCell;
use crate::pool::Worker;

/// The set of forked tasks that have not yet been joined.
pub(crate) struct TaskJoinList {
    pending: Mutex<Vec<Arc<SyncCell>>>,
}

impl TaskJoinList {
    pub(crate) fn new() -> TaskJoinList {
        TaskJoinList {
            pending: Mutex::new(Vec::new()),
        }
    }

    /// Registers a new task and returns the cell its completion will be
    /// written to.
    pub(crate) fn register(&self) -> Arc<SyncCell> {
        let cell = Arc::new(SyncCell::empty());
        self.pending.lock().unwrap().push(Arc::clone(&cell));
        cell
    }

    /// Blocks until every registered task has completed, joining them
    /// newest-first. When called from a worker, queued jobs are executed
    /// while waiting.
    pub(crate) fn drain(&self, worker: Option<&Worker>) {
        loop {
            let Some(cell) = self.pending.lock().unwrap().pop() else {
                break;
            };
            trace!("joining forked task");
            match worker {
                Some(worker) => {
                    worker.wait_cell(&cell);
                }
                None => {
                    cell.read_fe();
                }
            }
        }
    }

    /// The number of tasks registered but not yet joined.
    #[cfg(test)]
    pub(crate) fn outstanding(&self) -> usize {
        self.pending.lock().unwrap().len()
    }
}

// -----------------------------------------------------------------------------
// Tests

#[cfg(test)]
mod tests {
    use std::thread;

    use super::TaskJoinList;

    #[test]
    fn drain_joins_every_registered_task() {
        let list = TaskJoinList::new();
        let cells = [list.register(), list.register(), list.register()];
        assert_eq!(list.outstanding(), 3);
        thread::scope(|scope| {
            scope.spawn(|| {
                for cell in &cells {
                    cell.write_f(1);
                }
            });
            list.drain(None);
        });
        assert_eq!(list.outstanding(), 0);
    }
}
