//! The worker pool underpinning the runtime.
//!
//! A [`WorkerPool`] owns a resizable team of OS threads. Each worker has an
//! index, a private inbox for jobs addressed to it specifically (forked
//! region bodies), and access to a shared queue for jobs any worker may run
//! (explicit tasks). The pool also carries the two team-wide rendezvous
//! primitives: a reusable barrier and a first-arrival race.

use core::cell::Cell;
use core::cmp;
use core::ptr;
use core::sync::atomic::AtomicBool;
use core::sync::atomic::AtomicU32;
use core::sync::atomic::AtomicUsize;
use core::sync::atomic::Ordering;
use std::collections::VecDeque;
use std::num::NonZero;
use std::sync::Arc;
use std::sync::Barrier;
use std::sync::Condvar;
use std::sync::Mutex;
use std::thread;
use std::thread::Builder as ThreadBuilder;
use std::thread::JoinHandle;

use tracing::debug;
use tracing::trace;

use crate::cell::SyncCell;
use crate::job::JobRef;
use crate::util::Backoff;

// -----------------------------------------------------------------------------
// Thread local worker handle

thread_local! {
    static WORKER_PTR: Cell<*const Worker> = const { Cell::new(ptr::null()) };
}

// -----------------------------------------------------------------------------
// Worker pool

/// A resizable pool of worker threads with per-worker inboxes and a shared
/// job queue.
pub struct WorkerPool {
    /// Queues and thread handles, guarded by a single lock.
    state: Mutex<PoolState>,
    /// Signaled when a job lands in any queue, and when workers are halted.
    job_is_ready: Condvar,
    /// The team-wide rendezvous barrier.
    barrier: PoolBarrier,
    /// The team-wide first-arrival race, used for single sections.
    arrive: ArriveFirst,
}

struct PoolState {
    /// One private inbox per live worker, indexed by worker id.
    inboxes: Vec<VecDeque<JobRef>>,
    /// Jobs any worker may pick up.
    shared: VecDeque<JobRef>,
    /// Control handles for the live workers, in id order.
    workers: Vec<ManagedWorker>,
}

impl PoolState {
    /// Pops the next job visible to the worker with the given id: its own
    /// inbox first, then the shared queue.
    fn take_work(&mut self, index: usize) -> Option<JobRef> {
        if let Some(job_ref) = self.inboxes.get_mut(index).and_then(VecDeque::pop_front) {
            return Some(job_ref);
        }
        self.shared.pop_front()
    }
}

/// Control data for a single managed worker thread.
struct ManagedWorker {
    /// The worker's id, shared with the thread so that it survives
    /// renumbering during a shrink.
    index: Arc<AtomicUsize>,
    /// Tells the worker to exit its main loop.
    halt: Arc<AtomicBool>,
    /// Join handle for the worker's thread.
    handle: JoinHandle<()>,
}

impl WorkerPool {
    /// Creates a pool and populates it with `width` workers.
    pub fn new(width: usize) -> Arc<WorkerPool> {
        let pool = Arc::new(WorkerPool {
            state: Mutex::new(PoolState {
                inboxes: Vec::new(),
                shared: VecDeque::new(),
                workers: Vec::new(),
            }),
            job_is_ready: Condvar::new(),
            barrier: PoolBarrier::new(0),
            arrive: ArriveFirst::new(0),
        });
        pool.resize_to(width);
        pool
    }

    /// The parallelism the host advertises, used as the default pool width.
    pub fn available_width() -> usize {
        thread::available_parallelism()
            .map(NonZero::get)
            .unwrap_or(1)
    }

    /// The number of live workers.
    pub fn active(&self) -> usize {
        self.state.lock().unwrap().workers.len()
    }

    /// Grows or shrinks the pool to exactly `new_size` workers, then resizes
    /// the rendezvous primitives to match.
    ///
    /// When a worker thread itself requests a shrink that would cut its own
    /// id, it is first renumbered into the surviving range and another worker
    /// is retired in its place. The calling worker is never halted.
    ///
    /// Must not be called while a worksharing loop is distributing blocks.
    pub fn resize_to(self: &Arc<Self>, new_size: usize) -> usize {
        debug!("resizing worker pool to {} workers", new_size);
        let mut state = self.state.lock().unwrap();
        let current = state.workers.len();
        match new_size.cmp(&current) {
            cmp::Ordering::Equal => {
                drop(state);
            }
            cmp::Ordering::Greater => {
                // Spawn the missing workers, then block on a barrier until
                // they are all live.
                let startup = Arc::new(Barrier::new(new_size - current + 1));
                for index in current..new_size {
                    debug!("spawning managed worker {}", index);
                    let slot = Arc::new(AtomicUsize::new(index));
                    let halt = Arc::new(AtomicBool::new(false));
                    let pool = Arc::clone(self);
                    let worker_slot = Arc::clone(&slot);
                    let worker_halt = Arc::clone(&halt);
                    let worker_startup = Arc::clone(&startup);
                    let handle = ThreadBuilder::new()
                        .name(format!("worker {index}"))
                        .spawn(move || managed_worker(pool, worker_slot, worker_halt, worker_startup))
                        .unwrap();
                    state.inboxes.push(VecDeque::new());
                    state.workers.push(ManagedWorker {
                        index: slot,
                        halt,
                        handle,
                    });
                }
                drop(state);
                startup.wait();
            }
            cmp::Ordering::Less => {
                // If the caller is a worker of this pool above the cut, swap
                // it into the surviving range so some other worker retires
                // instead.
                let me = Worker::map_current(|worker| {
                    ptr::eq(Arc::as_ptr(&worker.pool), Arc::as_ptr(self)).then(|| worker.index())
                })
                .flatten();
                if let Some(me) = me {
                    if me >= new_size && new_size > 0 {
                        let last_kept = new_size - 1;
                        state.workers.swap(me, last_kept);
                        state.inboxes.swap(me, last_kept);
                        state.workers[last_kept].index.store(last_kept, Ordering::Relaxed);
                        state.workers[me].index.store(me, Ordering::Relaxed);
                    }
                }
                let victims = state.workers.split_off(new_size);
                state.inboxes.truncate(new_size);
                for victim in &victims {
                    victim.halt.store(true, Ordering::Relaxed);
                }
                self.job_is_ready.notify_all();
                drop(state);
                let current_thread = thread::current().id();
                for victim in victims {
                    if victim.handle.thread().id() != current_thread {
                        let _ = victim.handle.join();
                    }
                }
            }
        }
        self.barrier.resize(new_size as u32);
        self.arrive.resize(new_size as u32);
        debug!("completed worker pool resize");
        new_size
    }

    /// Queues a job on the private inbox of the worker with the given id.
    pub(crate) fn spawn_on(&self, index: usize, job_ref: JobRef) {
        let mut state = self.state.lock().unwrap();
        state.inboxes[index].push_back(job_ref);
        drop(state);
        self.job_is_ready.notify_all();
    }

    /// Queues a job that any worker may execute.
    pub(crate) fn spawn_shared(&self, job_ref: JobRef) {
        let mut state = self.state.lock().unwrap();
        state.shared.push_back(job_ref);
        drop(state);
        self.job_is_ready.notify_all();
    }

    /// Blocks the calling worker on the team barrier.
    pub fn barrier_enter(&self) {
        self.barrier.enter();
    }

    /// Enters the first-arrival race. Returns true for exactly one caller
    /// per round.
    pub fn arrive_first(&self) -> bool {
        self.arrive.arrive()
    }
}

/// The main loop executed by each managed worker thread.
fn managed_worker(
    pool: Arc<WorkerPool>,
    index: Arc<AtomicUsize>,
    halt: Arc<AtomicBool>,
    startup: Arc<Barrier>,
) {
    trace!("starting managed worker");
    startup.wait();
    let worker = Worker {
        pool: Arc::clone(&pool),
        index,
    };
    Worker::occupy(&worker, || {
        loop {
            let job_ref = {
                let mut state = pool.state.lock().unwrap();
                loop {
                    if halt.load(Ordering::Relaxed) {
                        return;
                    }
                    if let Some(job_ref) = state.take_work(worker.index()) {
                        break job_ref;
                    }
                    state = pool.job_is_ready.wait(state).unwrap();
                }
            };
            job_ref.execute(&worker);
        }
    });
    trace!("exiting managed worker");
}

// -----------------------------------------------------------------------------
// Worker handle

/// A handle to one worker in the pool, passed to every job it executes.
pub struct Worker {
    pool: Arc<WorkerPool>,
    /// Shared with the pool's control block so that renumbering during a
    /// shrink is visible to the thread immediately.
    index: Arc<AtomicUsize>,
}

/// The result of [`Worker::yield_now`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Yield {
    /// A queued job was found and executed.
    Executed,
    /// No work was available.
    Idle,
}

impl Worker {
    /// The worker's current id within the pool.
    pub fn index(&self) -> usize {
        self.index.load(Ordering::Relaxed)
    }

    /// The pool this worker belongs to.
    pub(crate) fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Runs a closure against the worker occupying the current thread, or
    /// returns `None` if the current thread is not a pool worker.
    pub fn map_current<F, R>(f: F) -> Option<R>
    where
        F: FnOnce(&Worker) -> R,
    {
        let worker_ptr = WORKER_PTR.with(Cell::get);
        if worker_ptr.is_null() {
            None
        } else {
            // SAFETY: The pointer was installed by `occupy` from a live
            // reference, and is cleared before that reference expires.
            Some(f(unsafe { &*worker_ptr }))
        }
    }

    /// Marks the current thread as occupied by `worker` for the duration of
    /// the closure.
    pub(crate) fn occupy<F, R>(worker: &Worker, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        let outer = WORKER_PTR.with(|cell| cell.replace(ptr::from_ref(worker)));
        let result = f();
        WORKER_PTR.with(|cell| cell.set(outer));
        result
    }

    /// Tries to execute one queued job. Waiting loops call this so that the
    /// pool keeps making progress while a worker blocks on a condition.
    pub fn yield_now(&self) -> Yield {
        let job_ref = {
            let mut state = self.pool.state.lock().unwrap();
            state.take_work(self.index())
        };
        match job_ref {
            Some(job_ref) => {
                job_ref.execute(self);
                Yield::Executed
            }
            None => Yield::Idle,
        }
    }

    /// Blocks on a cell becoming full, executing queued jobs while waiting.
    /// This is what keeps a task-wait from deadlocking when the awaited task
    /// is still sitting in the shared queue.
    pub fn wait_cell(&self, cell: &SyncCell) -> u64 {
        let mut backoff = Backoff::new();
        loop {
            if let Some(value) = cell.try_read_fe() {
                return value;
            }
            match self.yield_now() {
                Yield::Executed => backoff = Backoff::new(),
                Yield::Idle => backoff.snooze(),
            }
        }
    }
}

// -----------------------------------------------------------------------------
// Team barrier

/// A reusable sense-reversing barrier over a futex. The participant count can
/// be changed between rounds.
pub(crate) struct PoolBarrier {
    arrived: AtomicU32,
    participants: AtomicU32,
    epoch: AtomicU32,
}

impl PoolBarrier {
    const fn new(participants: u32) -> PoolBarrier {
        PoolBarrier {
            arrived: AtomicU32::new(0),
            participants: AtomicU32::new(participants),
            epoch: AtomicU32::new(0),
        }
    }

    /// Blocks until every participant has entered the current round. The
    /// last arrival resets the count and releases the rest.
    fn enter(&self) {
        let epoch = self.epoch.load(Ordering::Acquire);
        let arrived = self.arrived.fetch_add(1, Ordering::AcqRel) + 1;
        if arrived == self.participants.load(Ordering::Relaxed) {
            self.arrived.store(0, Ordering::Relaxed);
            self.epoch.fetch_add(1, Ordering::Release);
            atomic_wait::wake_all(&self.epoch);
        } else {
            while self.epoch.load(Ordering::Acquire) == epoch {
                atomic_wait::wait(&self.epoch, epoch);
            }
        }
    }

    /// Sets the participant count for subsequent rounds. Must not be called
    /// while a round is in progress.
    fn resize(&self, participants: u32) {
        self.participants.store(participants, Ordering::Relaxed);
    }
}

// -----------------------------------------------------------------------------
// First-arrival race

/// Elects exactly one winner among the participants of each round. The final
/// arrival resets the race for the next round.
pub(crate) struct ArriveFirst {
    arrived: AtomicU32,
    participants: AtomicU32,
}

impl ArriveFirst {
    const fn new(participants: u32) -> ArriveFirst {
        ArriveFirst {
            arrived: AtomicU32::new(0),
            participants: AtomicU32::new(participants),
        }
    }

    fn arrive(&self) -> bool {
        let arrived = self.arrived.fetch_add(1, Ordering::AcqRel);
        if arrived + 1 == self.participants.load(Ordering::Relaxed) {
            self.arrived.store(0, Ordering::Relaxed);
        }
        arrived == 0
    }

    /// Sets the participant count for subsequent rounds. Must not be called
    /// while a round is in progress.
    fn resize(&self, participants: u32) {
        self.participants.store(participants, Ordering::Relaxed);
    }
}

// -----------------------------------------------------------------------------
// Tests

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_grows_and_shrinks() {
        let pool = WorkerPool::new(2);
        assert_eq!(pool.active(), 2);
        pool.resize_to(5);
        assert_eq!(pool.active(), 5);
        pool.resize_to(1);
        assert_eq!(pool.active(), 1);
        pool.resize_to(0);
        assert_eq!(pool.active(), 0);
    }

    #[test]
    fn arrive_first_elects_one_winner_per_round() {
        let race = ArriveFirst::new(3);
        for _ in 0..4 {
            let winners = (0..3).filter(|_| race.arrive()).count();
            assert_eq!(winners, 1);
        }
    }
}
