//! Work-sharing parallel loops and synchronization constructs in the style of
//! an OpenMP runtime, built on a small pool of cooperating worker threads.
//!
//! The central type is [`Runtime`]. Calling [`Runtime::parallel`] forks a
//! region body onto every worker in the pool; inside the body, the provided
//! [`RegionCtx`] hands out iteration blocks under static, dynamic, or guided
//! schedules, and exposes ordered sections, critical sections, barriers, and
//! explicit tasks. Loop descriptors are created exactly once per loop by
//! whichever worker arrives first, shared by the rest of the team, and
//! recycled through a one-slot cache when the loop retires.
//!
//! Blocking synchronization bottoms out in [`SyncCell`], a full/empty cell
//! that parks threads on a futex. Workers waiting on a cell keep draining the
//! pool's queues, so forked tasks make progress even while their parent
//! blocks in a task-wait.

// -----------------------------------------------------------------------------
// Modules

mod cell;
mod descriptor;
mod job;
mod pool;
mod region;
mod runtime;
mod status;
mod sync;
mod tasks;
mod unwind;
mod util;

// -----------------------------------------------------------------------------
// Top-level exports

pub use cell::SyncCell;
pub use descriptor::DescriptorCache;
pub use descriptor::LoopDescriptor;
pub use descriptor::Span;
pub use pool::Worker;
pub use pool::WorkerPool;
pub use pool::Yield;
pub use region::LoopRef;
pub use region::ParallelRegion;
pub use region::RegionCtx;
pub use runtime::Runtime;
pub use status::RuntimeConfig;
pub use status::Schedule;
pub use sync::Lock;
pub use sync::NestLock;
pub use sync::flush_all;
pub use sync::flush_one;
