//! Loop descriptors: the shared state behind one worksharing loop.
//!
//! A [`LoopDescriptor`] snapshots the loop bounds and schedule, and carries
//! the atomics workers use to claim iteration blocks: a shared cursor for
//! dynamic and guided loops, per-worker round counters for static loops, and
//! the turn-taking state for ordered sections. Descriptors are recycled
//! through a [`DescriptorCache`] so that back-to-back loops of the same team
//! width reuse one allocation.

use core::sync::atomic::AtomicI64;
use core::sync::atomic::AtomicU32;
use core::sync::atomic::AtomicU64;
use core::sync::atomic::Ordering;
use std::sync::Mutex;

use tracing::trace;

use crate::status::Schedule;
use crate::util::Backoff;
use crate::util::fatal;

// -----------------------------------------------------------------------------
// Iteration spans

/// An inclusive block of loop iterations handed to one worker. The worker
/// runs `lower`, `lower + stride`, and so on up through `upper`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Span {
    /// The first iteration in the block.
    pub lower: i64,
    /// The last iteration in the block, inclusive.
    pub upper: i64,
}

// -----------------------------------------------------------------------------
// Loop descriptor

/// Shared scheduling state for one worksharing loop.
///
/// The bounds follow the half-open convention: the loop covers `lower` up to
/// but not including `upper`, advancing by `stride` (which must be positive).
/// Once a descriptor is published to a team it is only accessed through
/// `&self`; all mutable configuration happens in [`LoopDescriptor::prepare`]
/// before publication.
pub struct LoopDescriptor {
    start: i64,
    stop: i64,
    step: i64,
    /// The last value any block may cover, `stop - 1`. Blocks are clipped to
    /// this and a computed lower bound past it means the loop is exhausted.
    done: i64,
    schedule: Schedule,
    chunk: i64,
    ordered: bool,
    /// The team width the per-worker arrays were sized for.
    width: usize,
    /// The shared claim cursor for dynamic and guided loops.
    cursor: AtomicI64,
    /// The next iteration allowed to enter its ordered section.
    ordered_cursor: AtomicI64,
    /// Workers that joined this loop before any worker departed.
    attached: AtomicU32,
    /// Workers that have finished the loop.
    departed: AtomicU32,
    /// Per-worker count of static rounds already claimed.
    rounds: Box<[AtomicU64]>,
    /// Per-worker next ordered iteration.
    turn_markers: Box<[AtomicI64]>,
}

impl LoopDescriptor {
    /// Allocates a descriptor with per-worker state for a team of `width`
    /// workers. The bounds are unset until [`LoopDescriptor::prepare`] runs.
    pub fn new(width: usize) -> LoopDescriptor {
        LoopDescriptor {
            start: 0,
            stop: 0,
            step: 1,
            done: -1,
            schedule: Schedule::Guided,
            chunk: 1,
            ordered: false,
            width,
            cursor: AtomicI64::new(0),
            ordered_cursor: AtomicI64::new(0),
            attached: AtomicU32::new(0),
            departed: AtomicU32::new(0),
            rounds: (0..width).map(|_| AtomicU64::new(0)).collect(),
            turn_markers: (0..width).map(|_| AtomicI64::new(0)).collect(),
        }
    }

    /// Configures the descriptor for a new loop and resets all claim state.
    /// Must happen before the descriptor is shared with the team.
    pub fn prepare(
        &mut self,
        schedule: Schedule,
        ordered: bool,
        lower: i64,
        upper: i64,
        stride: i64,
        chunk: i64,
    ) {
        debug_assert!(stride >= 1, "loop stride must be positive");
        self.start = lower;
        self.stop = upper;
        self.step = stride.max(1);
        self.done = upper - 1;
        self.schedule = schedule;
        self.chunk = chunk.max(1);
        self.ordered = ordered;
        *self.cursor.get_mut() = lower;
        *self.ordered_cursor.get_mut() = lower;
        *self.attached.get_mut() = 0;
        *self.departed.get_mut() = 0;
        for round in &mut self.rounds {
            *round.get_mut() = 0;
        }
        for marker in &mut self.turn_markers {
            *marker.get_mut() = 0;
        }
    }

    /// The team width this descriptor was sized for.
    pub fn width(&self) -> usize {
        self.width
    }

    /// The resolved scheduling policy.
    pub fn schedule(&self) -> Schedule {
        self.schedule
    }

    /// The loop stride.
    pub fn stride(&self) -> i64 {
        self.step
    }

    /// Whether the loop carries ordered-section state.
    pub fn is_ordered(&self) -> bool {
        self.ordered
    }

    /// Registers a worker with the loop. Fails once any worker has departed,
    /// in which case the late arrival must not take blocks from this loop.
    pub(crate) fn attach(&self) -> bool {
        if self.departed.load(Ordering::Acquire) != 0 {
            return false;
        }
        self.attached.fetch_add(1, Ordering::AcqRel);
        true
    }

    /// Records a worker leaving the loop. Returns true for the last attached
    /// worker out, which is responsible for recycling the descriptor.
    pub(crate) fn depart(&self) -> bool {
        let departed = self.departed.fetch_add(1, Ordering::AcqRel) + 1;
        departed == self.attached.load(Ordering::Acquire)
    }

    // -------------------------------------------------------------------------
    // Block computation

    /// Claims the next block of iterations for the given worker, or returns
    /// `None` when the loop is exhausted for that worker. For ordered loops
    /// this also stages the worker's turn marker at the block's first
    /// iteration.
    pub fn next_block(&self, worker: usize) -> Option<Span> {
        let span = match self.schedule {
            Schedule::Static => self.next_static(worker),
            Schedule::Dynamic => self.next_shared(self.chunk),
            Schedule::Guided => self.next_shared(self.guided_block()),
            Schedule::Runtime => {
                fatal!("reached block computation with an unresolved RUNTIME schedule, aborting")
            }
        };
        if self.ordered {
            if let Some(span) = span {
                self.turn_markers[worker].store(span.lower, Ordering::Release);
            }
        }
        span
    }

    /// Static blocks need no shared cursor: worker `w`'s `k`-th block starts
    /// at iteration index `chunk * (k * width + w)`, so blocks rotate
    /// round-robin through the team and never overlap.
    fn next_static(&self, worker: usize) -> Option<Span> {
        let round = self.rounds[worker].fetch_add(1, Ordering::Relaxed) as i64;
        let first = self.chunk * (round * self.width as i64 + worker as i64);
        let lower = self.start + self.step * first;
        if lower > self.done {
            return None;
        }
        let upper = (lower + self.step * (self.chunk - 1)).min(self.done);
        Some(Span { lower, upper })
    }

    /// Claims `block` iterations from the shared cursor.
    fn next_shared(&self, block: i64) -> Option<Span> {
        let take = block.max(1) * self.step;
        let lower = self.cursor.fetch_add(take, Ordering::AcqRel);
        if lower > self.done {
            return None;
        }
        let upper = (lower + take - self.step).min(self.done);
        Some(Span { lower, upper })
    }

    /// The guided block size: an even share of the remaining iterations,
    /// never less than one. The estimate may race with concurrent claims;
    /// that only makes blocks smaller, never incorrect.
    fn guided_block(&self) -> i64 {
        let remaining = (self.done + 1 - self.cursor.load(Ordering::Relaxed)) / self.step;
        (remaining / self.width as i64).max(1)
    }

    // -------------------------------------------------------------------------
    // Ordered sections

    /// Blocks until the calling worker's staged iteration is the next in
    /// loop order, then advances the stage to the following iteration of its
    /// current block.
    pub fn ordered_start(&self, worker: usize) {
        let turn = self.turn_markers[worker].load(Ordering::Acquire);
        let mut backoff = Backoff::new();
        while self.ordered_cursor.load(Ordering::Acquire) != turn {
            backoff.snooze();
        }
        self.turn_markers[worker].store(turn + self.step, Ordering::Relaxed);
    }

    /// Releases the ordered section, allowing the next iteration in.
    pub fn ordered_end(&self) {
        self.ordered_cursor.fetch_add(self.step, Ordering::AcqRel);
    }
}

// -----------------------------------------------------------------------------
// Descriptor cache

/// A one-slot cache of retired loop descriptors.
///
/// Worksharing loops are usually executed back to back with the same team, so
/// the last retired descriptor is kept and handed straight back when the next
/// loop asks for the same width. A width mismatch drops the spare and
/// allocates fresh.
pub struct DescriptorCache {
    spare: Mutex<Option<Box<LoopDescriptor>>>,
}

impl DescriptorCache {
    /// Creates an empty cache.
    pub fn new() -> DescriptorCache {
        DescriptorCache {
            spare: Mutex::new(None),
        }
    }

    /// Returns a descriptor sized for `width` workers, reusing the cached
    /// spare when it matches. The descriptor still holds its previous
    /// configuration; callers must [`LoopDescriptor::prepare`] it.
    pub fn acquire(&self, width: usize) -> Box<LoopDescriptor> {
        let spare = self.spare.lock().unwrap().take();
        match spare {
            Some(descriptor) if descriptor.width == width => {
                trace!("reusing cached loop descriptor");
                descriptor
            }
            _ => Box::new(LoopDescriptor::new(width)),
        }
    }

    /// Returns a retired descriptor to the cache, displacing any previous
    /// spare.
    pub fn release(&self, descriptor: Box<LoopDescriptor>) {
        *self.spare.lock().unwrap() = Some(descriptor);
    }
}

impl Default for DescriptorCache {
    fn default() -> DescriptorCache {
        DescriptorCache::new()
    }
}

// -----------------------------------------------------------------------------
// Tests

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attach_fails_once_any_worker_departed() {
        let mut descriptor = LoopDescriptor::new(2);
        descriptor.prepare(Schedule::Dynamic, false, 0, 10, 1, 1);
        assert!(descriptor.attach());
        assert!(descriptor.attach());
        assert!(!descriptor.depart());
        // A late arrival must receive a detached handle.
        assert!(!descriptor.attach());
        assert!(descriptor.depart());
    }

    #[test]
    fn last_departing_worker_is_flagged() {
        let mut descriptor = LoopDescriptor::new(3);
        descriptor.prepare(Schedule::Static, false, 0, 10, 1, 1);
        for _ in 0..3 {
            assert!(descriptor.attach());
        }
        assert!(!descriptor.depart());
        assert!(!descriptor.depart());
        assert!(descriptor.depart());
    }

    #[test]
    fn prepare_clears_previous_claim_state() {
        let mut descriptor = LoopDescriptor::new(2);
        descriptor.prepare(Schedule::Dynamic, false, 0, 8, 1, 8);
        assert!(descriptor.next_block(0).is_some());
        assert!(descriptor.next_block(0).is_none());

        descriptor.prepare(Schedule::Dynamic, true, 4, 12, 2, 2);
        let span = descriptor.next_block(1).unwrap();
        assert_eq!(span, Span { lower: 4, upper: 6 });
        assert!(descriptor.is_ordered());
        assert_eq!(descriptor.stride(), 2);
    }
}
