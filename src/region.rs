//! Parallel regions and the per-worker region context.
//!
//! A [`ParallelRegion`] holds the single loop slot the team races on when a
//! worksharing loop starts. A [`RegionCtx`] is handed to each team member and
//! exposes every construct legal inside a region: loop initialization and
//! block claiming, ordered sections, barriers, master and single sections,
//! critical and atomic sections, and explicit tasks.

use core::ptr;
use core::ptr::NonNull;
use core::sync::atomic::AtomicPtr;
use core::sync::atomic::Ordering;

use tracing::trace;

use crate::descriptor::LoopDescriptor;
use crate::descriptor::Span;
use crate::pool::Worker;
use crate::runtime::Runtime;
use crate::status::Schedule;
use crate::util::Backoff;

// -----------------------------------------------------------------------------
// Parallel region

/// While the winning worker of the descriptor race allocates and publishes,
/// the loop slot holds this marker so the rest of the team knows to wait.
fn claimed() -> *mut LoopDescriptor {
    NonNull::dangling().as_ptr()
}

/// The team-shared state of one parallel region.
pub struct ParallelRegion {
    /// The current worksharing loop, or null between loops. Holds the
    /// `claimed` marker while a descriptor is being prepared.
    for_loop: AtomicPtr<LoopDescriptor>,
    /// The number of workers executing this region.
    width: usize,
    /// Zero for a top-level region, counting up through serialized nesting.
    level: u32,
}

impl ParallelRegion {
    pub(crate) fn new(width: usize, level: u32) -> ParallelRegion {
        ParallelRegion {
            for_loop: AtomicPtr::new(ptr::null_mut()),
            width,
            level,
        }
    }

    /// The number of workers executing this region.
    pub fn width(&self) -> usize {
        self.width
    }

    /// The nesting depth of this region.
    pub fn level(&self) -> u32 {
        self.level
    }

    pub(crate) fn loop_slot(&self) -> &AtomicPtr<LoopDescriptor> {
        &self.for_loop
    }
}

impl Drop for ParallelRegion {
    fn drop(&mut self) {
        // Every well-formed region retires its loops through `loop_end`, but
        // if one leaks past the region (a panicking body, say) the memory
        // still has to come back.
        let raw = *self.for_loop.get_mut();
        if !raw.is_null() && raw != claimed() {
            // SAFETY: The slot owns the descriptor it points at. With the
            // region dropping, no worker can still hold a reference to it.
            drop(unsafe { Box::from_raw(raw) });
        }
    }
}

// -----------------------------------------------------------------------------
// Loop handles

/// One worker's handle on the current worksharing loop. A detached handle
/// (the worker arrived after another had already departed) claims no blocks
/// and participates only in the end-of-loop barriers.
pub struct LoopRef {
    descriptor: Option<NonNull<LoopDescriptor>>,
}

impl LoopRef {
    /// Whether this worker actually joined the loop.
    pub fn is_attached(&self) -> bool {
        self.descriptor.is_some()
    }

    fn get(&self) -> Option<&LoopDescriptor> {
        // SAFETY: The descriptor stays live until the last attached worker
        // departs in `loop_end_nowait`, which consumes every handle first.
        self.descriptor.map(|raw| unsafe { raw.as_ref() })
    }
}

// -----------------------------------------------------------------------------
// Region context

/// The view of the runtime handed to each member of a parallel region.
pub struct RegionCtx<'a> {
    pub(crate) runtime: &'a Runtime,
    pub(crate) region: &'a ParallelRegion,
    pub(crate) worker: &'a Worker,
    /// The worker's rank within the region's team. Equal to the worker id in
    /// a top-level region, zero in a serialized nested region.
    pub(crate) rank: usize,
}

impl RegionCtx<'_> {
    /// The calling worker's rank within the team.
    pub fn thread_num(&self) -> usize {
        self.rank
    }

    /// The number of workers in the team.
    pub fn num_threads(&self) -> usize {
        self.region.width()
    }

    /// True for the team's rank-zero member.
    pub fn master(&self) -> bool {
        self.rank == 0
    }

    /// Enters a single section. Exactly one team member per round sees true.
    pub fn single(&self) -> bool {
        if self.region.width() <= 1 {
            return true;
        }
        self.runtime.pool().arrive_first()
    }

    /// Joins all outstanding tasks, then blocks until the whole team has
    /// arrived. Draining tasks first keeps a task queued behind a blocked
    /// worker from deadlocking the barrier.
    pub fn barrier(&self) {
        self.runtime.tasks().drain(Some(self.worker));
        if self.region.width() > 1 {
            self.runtime.pool().barrier_enter();
        }
    }

    // -------------------------------------------------------------------------
    // Worksharing loops

    /// Starts a statically scheduled loop over `[lower, upper)`.
    pub fn loop_static_init(&self, lower: i64, upper: i64, stride: i64, chunk: i64) -> LoopRef {
        self.loop_init(Schedule::Static, false, lower, upper, stride, chunk)
    }

    /// Starts a dynamically scheduled loop over `[lower, upper)`.
    pub fn loop_dynamic_init(&self, lower: i64, upper: i64, stride: i64, chunk: i64) -> LoopRef {
        self.loop_init(Schedule::Dynamic, false, lower, upper, stride, chunk)
    }

    /// Starts a guided loop over `[lower, upper)`. The chunk parameter is
    /// accepted for symmetry but guided block sizes are computed from the
    /// remaining work.
    pub fn loop_guided_init(&self, lower: i64, upper: i64, stride: i64, chunk: i64) -> LoopRef {
        self.loop_init(Schedule::Guided, false, lower, upper, stride, chunk)
    }

    /// Starts a loop scheduled by the runtime's default policy.
    pub fn loop_runtime_init(&self, lower: i64, upper: i64, stride: i64) -> LoopRef {
        self.loop_init(Schedule::Runtime, false, lower, upper, stride, 1)
    }

    /// Starts an ordered statically scheduled loop.
    pub fn loop_ordered_static_init(
        &self,
        lower: i64,
        upper: i64,
        stride: i64,
        chunk: i64,
    ) -> LoopRef {
        self.loop_init(Schedule::Static, true, lower, upper, stride, chunk)
    }

    /// Starts an ordered dynamically scheduled loop.
    pub fn loop_ordered_dynamic_init(
        &self,
        lower: i64,
        upper: i64,
        stride: i64,
        chunk: i64,
    ) -> LoopRef {
        self.loop_init(Schedule::Dynamic, true, lower, upper, stride, chunk)
    }

    /// Starts an ordered guided loop.
    pub fn loop_ordered_guided_init(
        &self,
        lower: i64,
        upper: i64,
        stride: i64,
        chunk: i64,
    ) -> LoopRef {
        self.loop_init(Schedule::Guided, true, lower, upper, stride, chunk)
    }

    /// Starts an ordered loop scheduled by the runtime's default policy.
    pub fn loop_ordered_runtime_init(&self, lower: i64, upper: i64, stride: i64) -> LoopRef {
        self.loop_init(Schedule::Runtime, true, lower, upper, stride, 1)
    }

    /// The common loop entry: the first worker to arrive claims the region's
    /// loop slot, prepares a descriptor, and publishes it; the rest of the
    /// team waits for the pointer and attaches to the shared descriptor.
    fn loop_init(
        &self,
        schedule: Schedule,
        ordered: bool,
        lower: i64,
        upper: i64,
        stride: i64,
        chunk: i64,
    ) -> LoopRef {
        // RUNTIME resolves to the configured default at loop start, never
        // reaching block computation.
        let schedule = if schedule == Schedule::Runtime {
            self.runtime.status().default_schedule()
        } else {
            schedule
        };

        let slot = self.region.loop_slot();
        let mut backoff = Backoff::new();
        let raw = loop {
            match slot.compare_exchange(
                ptr::null_mut(),
                claimed(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    let mut descriptor = self.runtime.cache().acquire(self.region.width());
                    descriptor.prepare(schedule, ordered, lower, upper, stride, chunk);
                    let raw = Box::into_raw(descriptor);
                    slot.store(raw, Ordering::Release);
                    trace!("published loop descriptor");
                    break raw;
                }
                Err(current) => {
                    if current == claimed() {
                        // Another worker won the race and is still
                        // publishing.
                        backoff.snooze();
                        continue;
                    }
                    break current;
                }
            }
        };

        // SAFETY: The descriptor is owned by the loop slot and stays live
        // until the last attached worker recycles it, which cannot happen
        // before this worker passes the barrier in `loop_end_nowait`.
        let descriptor = unsafe { &*raw };
        if descriptor.attach() {
            LoopRef {
                descriptor: NonNull::new(raw),
            }
        } else {
            // Some worker already departed; joining now could hand out
            // blocks the team believes are finished.
            LoopRef { descriptor: None }
        }
    }

    /// Claims the next block of the loop for this worker, or `None` when the
    /// loop is exhausted or the handle is detached.
    pub fn loop_next(&self, handle: &LoopRef) -> Option<Span> {
        handle.get().and_then(|descriptor| descriptor.next_block(self.rank))
    }

    /// Retires this worker's participation in the loop. The last worker out
    /// clears the region's loop slot and returns the descriptor to the
    /// cache. Two barriers bracket the teardown so no worker can start the
    /// next loop while this one is still being recycled.
    pub fn loop_end(&self, handle: LoopRef) {
        self.loop_end_nowait(handle);
    }

    /// Identical to [`RegionCtx::loop_end`]. The underlying barriers are
    /// required for safe descriptor recycling even when the source loop was
    /// declared nowait.
    pub fn loop_end_nowait(&self, handle: LoopRef) {
        self.barrier();
        if let Some(raw) = handle.descriptor {
            // SAFETY: All attached workers have passed the barrier above, so
            // none is still claiming blocks. The descriptor remains live
            // until the last of them departs below.
            let descriptor = unsafe { raw.as_ref() };
            if descriptor.depart() {
                self.region.loop_slot().store(ptr::null_mut(), Ordering::Release);
                // SAFETY: This worker is the last to depart, so it holds the
                // only remaining path to the descriptor, which was created
                // by `Box::into_raw` in `loop_init`.
                let descriptor = unsafe { Box::from_raw(raw.as_ptr()) };
                self.runtime.cache().release(descriptor);
                trace!("recycled loop descriptor");
            }
        }
        self.barrier();
    }

    /// Blocks until the worker's current iteration is the next in loop
    /// order. A detached handle returns immediately.
    pub fn ordered_start(&self, handle: &LoopRef) {
        if let Some(descriptor) = handle.get() {
            descriptor.ordered_start(self.rank);
        }
    }

    /// Leaves the ordered section, releasing the next iteration.
    pub fn ordered_end(&self, handle: &LoopRef) {
        if let Some(descriptor) = handle.get() {
            descriptor.ordered_end();
        }
    }

    // -------------------------------------------------------------------------
    // Critical and atomic sections

    /// Enters the global critical section, blocking until it is free. All
    /// critical sections in the process share one exclusion domain
    /// regardless of `key`; the key only names the release token.
    pub fn critical_start(&self, key: Option<u64>) {
        let _ = key;
        let _token = self.runtime.status().critical.read_fe();
    }

    /// Leaves the global critical section. The negated key (default: this
    /// worker's rank) is left behind as the release token.
    pub fn critical_end(&self, key: Option<u64>) {
        let token = key.unwrap_or(self.rank as u64);
        self.runtime.status().critical.write_f(token.wrapping_neg());
    }

    /// Runs a closure inside the global critical section.
    pub fn critical<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        self.critical_start(None);
        let result = f();
        self.critical_end(None);
        result
    }

    /// Enters the global atomic section, a separate domain from critical
    /// sections, serializing updates that the hardware cannot perform
    /// atomically.
    pub fn atomic_start(&self) {
        let _token = self.runtime.status().atomic_lock.read_fe();
    }

    /// Leaves the global atomic section.
    pub fn atomic_end(&self) {
        self.runtime.status().atomic_lock.write_f(0);
    }

    // -------------------------------------------------------------------------
    // Tasks

    /// Forks a task onto the shared queue. The task is joined by the next
    /// [`RegionCtx::taskwait`] or [`RegionCtx::barrier`], and always before
    /// the region completes.
    pub fn task<F>(&self, f: F)
    where
        F: FnOnce(&Worker) + Send,
    {
        self.runtime.fork(f);
    }

    /// Forks a task when `if_clause` is true; otherwise runs the closure
    /// immediately on the calling worker.
    pub fn task_if<F>(&self, if_clause: bool, f: F)
    where
        F: FnOnce(&Worker) + Send,
    {
        if if_clause {
            self.task(f);
        } else {
            f(self.worker);
        }
    }

    /// Blocks until every outstanding task has completed, executing queued
    /// jobs while waiting.
    pub fn taskwait(&self) {
        self.runtime.tasks().drain(Some(self.worker));
    }

    // -------------------------------------------------------------------------
    // Nesting

    /// Enters a nested parallel region. Nested regions are serialized: the
    /// body runs once, inline, as a team of one.
    pub fn parallel<F>(&self, f: F)
    where
        F: Fn(&RegionCtx<'_>),
    {
        self.runtime.parallel_nested(self.worker, &f);
    }
}
