//! Process-wide runtime status and startup configuration.
//!
//! [`RuntimeConfig`] captures the knobs a runtime is built with, either set
//! programmatically or parsed from the `OMP_SCHEDULE` and `OMP_NESTED`
//! environment variables. Unrecognized values are a fatal startup error.
//! [`RuntimeStatus`] is the live mutable state: the in-parallel flag, nesting
//! depth, the resolved default schedule, and the two global exclusion cells.

use core::sync::atomic::AtomicBool;
use core::sync::atomic::AtomicI64;
use core::sync::atomic::AtomicU8;
use core::sync::atomic::AtomicU32;
use core::sync::atomic::Ordering;
use std::env;
use std::time::Instant;

use tracing::debug;

use crate::cell::SyncCell;
use crate::util::fatal;

// -----------------------------------------------------------------------------
// Schedules

/// A loop scheduling policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Schedule {
    /// Iteration blocks are assigned round-robin by worker id, computed
    /// independently by each worker without shared state.
    Static = 0,
    /// Fixed-size blocks are claimed from a shared cursor.
    Dynamic = 1,
    /// Blocks are claimed from a shared cursor and shrink as the loop
    /// drains, proportional to the remaining work per worker.
    Guided = 2,
    /// Resolved to the runtime's default schedule when the loop starts.
    Runtime = 3,
}

impl Schedule {
    /// Parses an `OMP_SCHEDULE` value. Returns `None` for anything other
    /// than the three recognized spellings.
    pub fn parse(value: &str) -> Option<Schedule> {
        match value {
            "GUIDED_SCHED" => Some(Schedule::Guided),
            "STATIC_SCHED" => Some(Schedule::Static),
            "DYNAMIC_SCHED" => Some(Schedule::Dynamic),
            _ => None,
        }
    }

    fn from_u8(raw: u8) -> Schedule {
        match raw {
            0 => Schedule::Static,
            1 => Schedule::Dynamic,
            2 => Schedule::Guided,
            _ => Schedule::Runtime,
        }
    }
}

// -----------------------------------------------------------------------------
// Configuration

/// Startup configuration for a [`crate::Runtime`]. Unset fields fall back to
/// defaults: one worker per hardware thread, the guided schedule, and nesting
/// disabled.
pub struct RuntimeConfig {
    /// The number of workers in the pool.
    pub threads: Option<usize>,
    /// The schedule substituted for `RUNTIME` loops.
    pub schedule: Option<Schedule>,
    /// Whether nested parallel regions are tracked as enabled.
    pub nested: Option<bool>,
}

impl RuntimeConfig {
    /// Creates an empty configuration. All fields fall back to defaults.
    pub fn new() -> RuntimeConfig {
        RuntimeConfig {
            threads: None,
            schedule: None,
            nested: None,
        }
    }

    /// Reads configuration from the environment. `OMP_SCHEDULE` must be one
    /// of `GUIDED_SCHED`, `STATIC_SCHED` or `DYNAMIC_SCHED`, and `OMP_NESTED`
    /// must be `TRUE` or `FALSE`; any other value terminates the process
    /// with a diagnostic.
    pub fn from_env() -> RuntimeConfig {
        let mut config = RuntimeConfig::new();
        if let Ok(value) = env::var("OMP_SCHEDULE") {
            match Schedule::parse(&value) {
                Some(schedule) => {
                    debug!("using schedule {:?} from OMP_SCHEDULE", schedule);
                    config.schedule = Some(schedule);
                }
                None => {
                    fatal!("OMP_SCHEDULE set to '{value}' which is not a valid value, aborting");
                }
            }
        }
        if let Ok(value) = env::var("OMP_NESTED") {
            match value.as_str() {
                "TRUE" => config.nested = Some(true),
                "FALSE" => config.nested = Some(false),
                _ => {
                    fatal!("OMP_NESTED set to '{value}' which is not TRUE or FALSE, aborting");
                }
            }
        }
        config
    }

    /// Sets the number of workers in the pool.
    pub fn threads(mut self, threads: usize) -> RuntimeConfig {
        self.threads = Some(threads);
        self
    }

    /// Sets the schedule substituted for `RUNTIME` loops.
    pub fn schedule(mut self, schedule: Schedule) -> RuntimeConfig {
        self.schedule = Some(schedule);
        self
    }

    /// Sets whether nested parallelism is tracked as enabled.
    pub fn nested(mut self, nested: bool) -> RuntimeConfig {
        self.nested = Some(nested);
        self
    }
}

impl Default for RuntimeConfig {
    fn default() -> RuntimeConfig {
        RuntimeConfig::new()
    }
}

// -----------------------------------------------------------------------------
// Live status

/// The mutable global state of one runtime instance.
pub(crate) struct RuntimeStatus {
    /// True while a top-level parallel region is executing.
    inside_parallel: AtomicBool,
    /// Whether nested parallelism is nominally enabled. Nested regions are
    /// serialized either way; this flag only tracks the user's request.
    nested_allowed: AtomicBool,
    /// Depth of serialized nested regions below the top-level one.
    nested_level: AtomicU32,
    /// The `dyn-var` setting. Stored but not acted upon.
    dynamic: AtomicI64,
    /// The schedule substituted for `RUNTIME` loops.
    default_schedule: AtomicU8,
    /// The single global critical-section cell. Full when the section is
    /// free; the held value is the release token of the previous owner.
    pub(crate) critical: SyncCell,
    /// The global cell serializing atomic sections, separate from the
    /// critical-section domain.
    pub(crate) atomic_lock: SyncCell,
    /// The instant the runtime was created; wall-clock queries are relative
    /// to this.
    epoch: Instant,
}

impl RuntimeStatus {
    pub(crate) fn new(config: &RuntimeConfig) -> RuntimeStatus {
        RuntimeStatus {
            inside_parallel: AtomicBool::new(false),
            nested_allowed: AtomicBool::new(config.nested.unwrap_or(false)),
            nested_level: AtomicU32::new(0),
            dynamic: AtomicI64::new(0),
            default_schedule: AtomicU8::new(config.schedule.unwrap_or(Schedule::Guided) as u8),
            critical: SyncCell::full(0),
            atomic_lock: SyncCell::full(0),
            epoch: Instant::now(),
        }
    }

    pub(crate) fn inside_parallel(&self) -> bool {
        self.inside_parallel.load(Ordering::Acquire)
    }

    pub(crate) fn set_inside_parallel(&self, inside: bool) {
        self.inside_parallel.store(inside, Ordering::Release);
    }

    pub(crate) fn nested_allowed(&self) -> bool {
        self.nested_allowed.load(Ordering::Relaxed)
    }

    pub(crate) fn set_nested_allowed(&self, nested: bool) {
        self.nested_allowed.store(nested, Ordering::Relaxed);
    }

    pub(crate) fn nested_level(&self) -> u32 {
        self.nested_level.load(Ordering::Relaxed)
    }

    pub(crate) fn push_nested(&self) {
        self.nested_level.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn pop_nested(&self) {
        self.nested_level.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn dynamic(&self) -> i64 {
        self.dynamic.load(Ordering::Relaxed)
    }

    pub(crate) fn set_dynamic(&self, value: i64) {
        self.dynamic.store(value, Ordering::Relaxed);
    }

    pub(crate) fn default_schedule(&self) -> Schedule {
        Schedule::from_u8(self.default_schedule.load(Ordering::Relaxed))
    }

    pub(crate) fn set_default_schedule(&self, schedule: Schedule) {
        self.default_schedule.store(schedule as u8, Ordering::Relaxed);
    }

    /// Seconds elapsed since the runtime was created.
    pub(crate) fn wtime(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64()
    }

    /// The nominal resolution of [`RuntimeStatus::wtime`], in seconds.
    pub(crate) fn wtick(&self) -> f64 {
        1e-9
    }
}

// -----------------------------------------------------------------------------
// Tests

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_parse_recognizes_the_three_spellings() {
        assert_eq!(Schedule::parse("GUIDED_SCHED"), Some(Schedule::Guided));
        assert_eq!(Schedule::parse("STATIC_SCHED"), Some(Schedule::Static));
        assert_eq!(Schedule::parse("DYNAMIC_SCHED"), Some(Schedule::Dynamic));
        assert_eq!(Schedule::parse("guided"), None);
        assert_eq!(Schedule::parse(""), None);
        assert_eq!(Schedule::parse("RUNTIME_SCHED"), None);
    }

    #[test]
    fn status_defaults_to_guided_and_no_nesting() {
        let status = RuntimeStatus::new(&RuntimeConfig::new());
        assert_eq!(status.default_schedule(), Schedule::Guided);
        assert!(!status.nested_allowed());
        assert!(!status.inside_parallel());
        assert_eq!(status.nested_level(), 0);
    }

    #[test]
    fn config_overrides_reach_the_status() {
        let config = RuntimeConfig::new().schedule(Schedule::Dynamic).nested(true);
        let status = RuntimeStatus::new(&config);
        assert_eq!(status.default_schedule(), Schedule::Dynamic);
        assert!(status.nested_allowed());
    }
}
