//! The runtime: pool ownership, region fork/join, and the query surface.

use core::any::Any;
use core::mem;
use core::sync::atomic::AtomicU32;
use core::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;

use tracing::debug;

use crate::cell::SyncCell;
use crate::descriptor::DescriptorCache;
use crate::job::HeapJob;
use crate::pool::Worker;
use crate::pool::WorkerPool;
use crate::region::ParallelRegion;
use crate::region::RegionCtx;
use crate::status::RuntimeConfig;
use crate::status::RuntimeStatus;
use crate::status::Schedule;
use crate::tasks::TaskJoinList;
use crate::unwind;
use crate::util::fatal;

// -----------------------------------------------------------------------------
// Runtime

/// An OpenMP-style work-sharing runtime.
///
/// A runtime owns a worker pool, the descriptor cache, the task join list,
/// and the global status block. [`Runtime::parallel`] forks a region body
/// onto every worker and blocks until the team and all forked tasks have
/// completed.
pub struct Runtime {
    pool: Arc<WorkerPool>,
    status: RuntimeStatus,
    cache: DescriptorCache,
    tasks: TaskJoinList,
}

impl Runtime {
    /// Creates a runtime configured from the environment, with one worker
    /// per hardware thread unless `OMP_SCHEDULE`/`OMP_NESTED` say otherwise.
    /// Invalid environment values terminate the process.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Runtime {
        Runtime::with_config(RuntimeConfig::from_env())
    }

    /// Creates a runtime from an explicit configuration, ignoring the
    /// environment.
    pub fn with_config(config: RuntimeConfig) -> Runtime {
        let width = config
            .threads
            .unwrap_or_else(WorkerPool::available_width)
            .max(1);
        debug!("starting runtime with {} workers", width);
        Runtime {
            pool: WorkerPool::new(width),
            status: RuntimeStatus::new(&config),
            cache: DescriptorCache::new(),
            tasks: TaskJoinList::new(),
        }
    }

    pub(crate) fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub(crate) fn status(&self) -> &RuntimeStatus {
        &self.status
    }

    pub(crate) fn cache(&self) -> &DescriptorCache {
        &self.cache
    }

    pub(crate) fn tasks(&self) -> &TaskJoinList {
        &self.tasks
    }

    // -------------------------------------------------------------------------
    // Parallel regions

    /// Runs `f` as a parallel region: once on every worker in the pool,
    /// blocking until the whole team and any tasks it forked have finished.
    /// A panic in any team member is re-raised on the caller after the
    /// region joins.
    ///
    /// Called while a region is already active, the body instead runs
    /// serialized as a nested team of one.
    pub fn parallel<F>(&self, f: F)
    where
        F: Fn(&RegionCtx<'_>) + Sync,
    {
        if self.status.inside_parallel() {
            let ran = Worker::map_current(|worker| self.parallel_nested(worker, &f));
            if ran.is_none() {
                fatal!("nested parallel region entered from outside the worker pool, aborting");
            }
            return;
        }

        let width = self.pool.active();
        debug!("forking parallel region across {} workers", width);
        self.status.set_inside_parallel(true);
        let region = ParallelRegion::new(width, 0);
        let pending = AtomicU32::new(width as u32);
        let done = Arc::new(SyncCell::empty());
        let panic_slot: Mutex<Option<Box<dyn Any + Send>>> = Mutex::new(None);
        {
            let region = &region;
            let pending = &pending;
            let panic_slot = &panic_slot;
            let body = &f;
            for index in 0..width {
                let done = Arc::clone(&done);
                let job = HeapJob::new(move |worker: &Worker| {
                    let ctx = RegionCtx {
                        runtime: self,
                        region,
                        worker,
                        rank: index,
                    };
                    if let Err(payload) = unwind::halt_unwinding(|| body(&ctx)) {
                        let mut slot = panic_slot.lock().unwrap();
                        if slot.is_none() {
                            *slot = Some(payload);
                        }
                    }
                    if pending.fetch_sub(1, Ordering::AcqRel) == 1 {
                        done.write_f(1);
                    }
                });
                // SAFETY: We block on `done` below until every job has
                // executed, so no job outlives the borrows it closes over.
                let job_ref = unsafe { job.into_job_ref() };
                self.pool.spawn_on(index, job_ref);
            }
        }
        done.read_fe();
        // Tasks forked by the region but never awaited still have to finish
        // before the fork/join contract is satisfied.
        self.tasks.drain(None);
        self.status.set_inside_parallel(false);
        debug!("joined parallel region");
        match panic_slot.into_inner().unwrap() {
            Some(payload) => {
                // The region drop reclaims any loop the panicking body
                // abandoned mid-flight.
                drop(region);
                unwind::resume_unwinding(payload);
            }
            None => {
                debug_assert!(
                    region.loop_slot().load(Ordering::Acquire).is_null(),
                    "a worksharing loop outlived its region"
                );
            }
        }
    }

    /// Runs a region body serialized as a team of one, on the calling
    /// worker. Used for nested regions.
    pub(crate) fn parallel_nested<F>(&self, worker: &Worker, f: &F)
    where
        F: Fn(&RegionCtx<'_>),
    {
        self.status.push_nested();
        let level = self.status.nested_level();
        debug!("running nested parallel region at level {} inline", level);
        let region = ParallelRegion::new(1, level);
        let ctx = RegionCtx {
            runtime: self,
            region: &region,
            worker,
            rank: 0,
        };
        f(&ctx);
        self.tasks.drain(Some(worker));
        self.status.pop_nested();
    }

    // -------------------------------------------------------------------------
    // Tasks

    /// Queues `f` as an explicit task on the shared queue and registers it
    /// with the join list.
    pub(crate) fn fork<F>(&self, f: F)
    where
        F: FnOnce(&Worker) + Send,
    {
        let cell = self.tasks.register();
        let job = HeapJob::new(move |worker: &Worker| {
            // A panic here has no frame to land in; abort rather than poison
            // the join list.
            let abort_guard = unwind::AbortOnDrop;
            f(worker);
            mem::forget(abort_guard);
            cell.write_f(1);
        });
        // SAFETY: The task is joined by `TaskJoinList::drain` before the
        // enclosing region returns, so the job cannot outlive the data it
        // closes over.
        let job_ref = unsafe { job.into_job_ref() };
        self.pool.spawn_shared(job_ref);
    }

    /// Blocks the caller until every outstanding task has completed. When
    /// called from a worker, queued jobs are executed while waiting.
    pub fn taskwait(&self) {
        let drained = Worker::map_current(|worker| self.tasks.drain(Some(worker)));
        if drained.is_none() {
            self.tasks.drain(None);
        }
    }

    // -------------------------------------------------------------------------
    // Queries and settings

    /// Resizes the worker pool. A worker requesting a shrink below its own
    /// id is renumbered into the surviving range rather than halted. Must
    /// not be called while a loop is distributing blocks.
    pub fn set_num_threads(&self, threads: usize) {
        self.pool.resize_to(threads.max(1));
    }

    /// The number of workers currently in the pool.
    pub fn get_num_threads(&self) -> usize {
        self.pool.active()
    }

    /// The width the next parallel region will fork at. Equal to
    /// [`Runtime::get_num_threads`]: the pool has no over-provisioning.
    pub fn get_max_threads(&self) -> usize {
        self.pool.active()
    }

    /// The calling worker's id, or zero when called from outside the pool.
    pub fn get_thread_num(&self) -> usize {
        Worker::map_current(|worker| worker.index()).unwrap_or(0)
    }

    /// True while a parallel region is executing.
    pub fn in_parallel(&self) -> bool {
        self.status.inside_parallel()
    }

    /// Records whether nested parallelism is requested. Nested regions are
    /// serialized regardless; this only tracks the setting.
    pub fn set_nested(&self, nested: bool) {
        self.status.set_nested_allowed(nested);
    }

    /// Whether nested parallelism has been requested.
    pub fn get_nested(&self) -> bool {
        self.status.nested_allowed()
    }

    /// Stores the `dyn-var` setting. The value is tracked but has no effect
    /// on scheduling.
    pub fn set_dynamic(&self, value: i64) {
        self.status.set_dynamic(value);
    }

    /// The stored `dyn-var` setting.
    pub fn get_dynamic(&self) -> i64 {
        self.status.dynamic()
    }

    /// Sets the schedule substituted for `RUNTIME` loops.
    pub fn set_schedule(&self, schedule: Schedule) {
        if schedule == Schedule::Runtime {
            fatal!("the default schedule cannot itself be RUNTIME, aborting");
        }
        self.status.set_default_schedule(schedule);
    }

    /// The schedule substituted for `RUNTIME` loops.
    pub fn get_schedule(&self) -> Schedule {
        self.status.default_schedule()
    }

    /// Seconds of wall-clock time since the runtime was created.
    pub fn get_wtime(&self) -> f64 {
        self.status.wtime()
    }

    /// The nominal resolution of [`Runtime::get_wtime`], in seconds.
    pub fn get_wtick(&self) -> f64 {
        self.status.wtick()
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.tasks.drain(None);
        self.pool.resize_to(0);
    }
}
