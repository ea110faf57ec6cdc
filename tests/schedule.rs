//! Tests for block computation: static, dynamic and guided schedules,
//! ordered turn-taking, loop exhaustion, and descriptor recycling. These
//! drive the descriptor directly, simulating workers by id.

use std::ptr;
use std::sync::Mutex;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::thread;

use workshare::DescriptorCache;
use workshare::LoopDescriptor;
use workshare::Schedule;
use workshare::Span;

fn descriptor(
    schedule: Schedule,
    ordered: bool,
    width: usize,
    lower: i64,
    upper: i64,
    stride: i64,
    chunk: i64,
) -> LoopDescriptor {
    let mut descriptor = LoopDescriptor::new(width);
    descriptor.prepare(schedule, ordered, lower, upper, stride, chunk);
    descriptor
}

/// Collects every span a single simulated worker can claim.
fn drain_worker(descriptor: &LoopDescriptor, worker: usize) -> Vec<Span> {
    let mut spans = Vec::new();
    while let Some(span) = descriptor.next_block(worker) {
        spans.push(span);
    }
    spans
}

// -----------------------------------------------------------------------------
// Static schedule

#[test]
fn static_blocks_rotate_round_robin() {
    let descriptor = descriptor(Schedule::Static, false, 4, 0, 100, 1, 1);
    let spans = drain_worker(&descriptor, 0);
    let starts: Vec<i64> = spans.iter().map(|span| span.lower).collect();
    assert_eq!(starts, (0..100).step_by(4).collect::<Vec<i64>>());
    for span in &spans {
        assert_eq!(span.lower, span.upper);
    }

    let spans = drain_worker(&descriptor, 3);
    let starts: Vec<i64> = spans.iter().map(|span| span.lower).collect();
    assert_eq!(starts, (3..100).step_by(4).collect::<Vec<i64>>());
}

#[test]
fn static_partition_is_complete_for_any_width() {
    for width in 1..=64 {
        let descriptor = descriptor(Schedule::Static, false, width, 0, 100, 1, 1);
        let mut seen = vec![0u32; 100];
        for worker in 0..width {
            for span in drain_worker(&descriptor, worker) {
                for i in span.lower..=span.upper {
                    seen[i as usize] += 1;
                }
            }
        }
        assert!(
            seen.iter().all(|&count| count == 1),
            "width {width} produced an uneven partition"
        );
    }
}

#[test]
fn static_chunked_blocks_are_disjoint() {
    let descriptor = descriptor(Schedule::Static, false, 3, 0, 50, 1, 7);
    let mut seen = vec![0u32; 50];
    for worker in 0..3 {
        for span in drain_worker(&descriptor, worker) {
            assert!(span.upper - span.lower < 7);
            for i in span.lower..=span.upper {
                seen[i as usize] += 1;
            }
        }
    }
    assert!(seen.iter().all(|&count| count == 1));
}

#[test]
fn static_respects_stride() {
    // Iterations 10, 13, ..., 28; two workers alternate them.
    let descriptor = descriptor(Schedule::Static, false, 2, 10, 29, 3, 1);
    let starts: Vec<i64> = drain_worker(&descriptor, 0)
        .iter()
        .map(|span| span.lower)
        .collect();
    assert_eq!(starts, vec![10, 16, 22, 28]);
    let starts: Vec<i64> = drain_worker(&descriptor, 1)
        .iter()
        .map(|span| span.lower)
        .collect();
    assert_eq!(starts, vec![13, 19, 25]);
}

// -----------------------------------------------------------------------------
// Dynamic schedule

#[test]
fn dynamic_hands_out_fixed_chunks_in_order() {
    let descriptor = descriptor(Schedule::Dynamic, false, 4, 0, 30, 1, 8);
    let spans = drain_worker(&descriptor, 0);
    assert_eq!(
        spans,
        vec![
            Span { lower: 0, upper: 7 },
            Span { lower: 8, upper: 15 },
            Span { lower: 16, upper: 23 },
            Span { lower: 24, upper: 29 },
        ]
    );
}

#[test]
fn dynamic_blocks_stay_disjoint_under_contention() {
    const ITERATIONS: usize = 10_000;
    let descriptor = descriptor(Schedule::Dynamic, false, 8, 0, ITERATIONS as i64, 1, 3);
    let seen: Vec<AtomicU32> = (0..ITERATIONS).map(|_| AtomicU32::new(0)).collect();
    thread::scope(|scope| {
        for worker in 0..8 {
            let descriptor = &descriptor;
            let seen = &seen;
            scope.spawn(move || {
                while let Some(span) = descriptor.next_block(worker) {
                    for i in span.lower..=span.upper {
                        seen[i as usize].fetch_add(1, Ordering::Relaxed);
                    }
                }
            });
        }
    });
    assert!(seen.iter().all(|count| count.load(Ordering::Relaxed) == 1));
}

// -----------------------------------------------------------------------------
// Guided schedule

#[test]
fn guided_blocks_shrink_and_cover_the_range() {
    const ITERATIONS: i64 = 10_000;
    let descriptor = descriptor(Schedule::Guided, false, 4, 0, ITERATIONS, 1, 1);
    let spans = drain_worker(&descriptor, 0);

    let sizes: Vec<i64> = spans.iter().map(|span| span.upper - span.lower + 1).collect();
    for pair in sizes.windows(2) {
        assert!(pair[1] <= pair[0], "guided block sizes must not grow");
    }
    assert_eq!(sizes.first(), Some(&(ITERATIONS / 4)));
    assert_eq!(sizes.last(), Some(&1));
    assert_eq!(sizes.iter().sum::<i64>(), ITERATIONS);

    // Blocks are contiguous when claimed by one worker.
    let mut expected = 0;
    for span in &spans {
        assert_eq!(span.lower, expected);
        expected = span.upper + 1;
    }
}

// -----------------------------------------------------------------------------
// Exhaustion

#[test]
fn exhausted_loops_keep_returning_none() {
    let descriptor = descriptor(Schedule::Dynamic, false, 2, 0, 4, 1, 2);
    drain_worker(&descriptor, 0);
    for _ in 0..10 {
        assert_eq!(descriptor.next_block(0), None);
        assert_eq!(descriptor.next_block(1), None);
    }
}

#[test]
fn empty_loops_yield_no_blocks() {
    let descriptor = descriptor(Schedule::Static, false, 2, 5, 5, 1, 1);
    assert_eq!(descriptor.next_block(0), None);
    let descriptor = descriptor_with_defaults(Schedule::Guided);
    assert_eq!(descriptor.next_block(0), None);
}

fn descriptor_with_defaults(schedule: Schedule) -> LoopDescriptor {
    descriptor(schedule, false, 2, 7, 7, 1, 1)
}

// -----------------------------------------------------------------------------
// Ordered turn-taking

#[test]
fn ordered_sections_release_in_iteration_order() {
    const ITERATIONS: i64 = 200;
    let descriptor = descriptor(Schedule::Dynamic, true, 4, 0, ITERATIONS, 1, 3);
    let order = Mutex::new(Vec::new());
    thread::scope(|scope| {
        for worker in 0..4 {
            let descriptor = &descriptor;
            let order = &order;
            scope.spawn(move || {
                while let Some(span) = descriptor.next_block(worker) {
                    for i in span.lower..=span.upper {
                        descriptor.ordered_start(worker);
                        order.lock().unwrap().push(i);
                        descriptor.ordered_end();
                    }
                }
            });
        }
    });
    let order = order.into_inner().unwrap();
    assert_eq!(order, (0..ITERATIONS).collect::<Vec<i64>>());
}

// -----------------------------------------------------------------------------
// Descriptor recycling

#[test]
fn cache_recycles_descriptors_of_matching_width() {
    let cache = DescriptorCache::new();
    let first = cache.acquire(4);
    let first_addr = ptr::from_ref(&*first) as usize;
    cache.release(first);

    // Same width: the same allocation comes back.
    let second = cache.acquire(4);
    assert_eq!(ptr::from_ref(&*second) as usize, first_addr);
    cache.release(second);

    // Width change: the spare is discarded and a fresh descriptor is built.
    let third = cache.acquire(8);
    assert_eq!(third.width(), 8);
}

#[test]
fn recycled_descriptors_schedule_cleanly() {
    let cache = DescriptorCache::new();
    let mut descriptor = cache.acquire(2);
    descriptor.prepare(Schedule::Dynamic, false, 0, 10, 1, 4);
    while descriptor.next_block(0).is_some() {}
    cache.release(descriptor);

    let mut descriptor = cache.acquire(2);
    descriptor.prepare(Schedule::Static, false, 0, 6, 1, 1);
    let starts: Vec<i64> = drain_worker(&descriptor, 0)
        .iter()
        .map(|span| span.lower)
        .collect();
    assert_eq!(starts, vec![0, 2, 4]);
}
