//! Tests for environment configuration and the fatal error path. Fatal cases
//! terminate the whole process, so each one re-runs this test binary as a
//! child filtered down to the same test, with an environment flag selecting
//! the child branch, and asserts on the child's exit status and stderr.

use std::env;
use std::process::Command;
use std::process::Output;

use workshare::Lock;
use workshare::Runtime;
use workshare::Schedule;
use workshare::flush_all;

/// Re-runs this test binary filtered to `test_name`, with `vars` set in the
/// child environment.
fn run_child(test_name: &str, vars: &[(&str, &str)]) -> Output {
    let exe = env::current_exe().unwrap();
    let mut command = Command::new(exe);
    command
        .args([test_name, "--exact", "--nocapture", "--test-threads=1"])
        .env_remove("OMP_SCHEDULE")
        .env_remove("OMP_NESTED");
    for (key, value) in vars {
        command.env(key, value);
    }
    command.output().unwrap()
}

fn stderr_of(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

// -----------------------------------------------------------------------------
// Environment parsing

#[test]
fn valid_omp_schedule_selects_the_schedule() {
    if env::var("CONFIG_CHILD_VALID_SCHEDULE").is_ok() {
        let rt = Runtime::new();
        assert_eq!(rt.get_schedule(), Schedule::Static);
        return;
    }
    let output = run_child(
        "valid_omp_schedule_selects_the_schedule",
        &[
            ("CONFIG_CHILD_VALID_SCHEDULE", "1"),
            ("OMP_SCHEDULE", "STATIC_SCHED"),
        ],
    );
    assert!(output.status.success(), "child failed: {}", stderr_of(&output));
}

#[test]
fn invalid_omp_schedule_is_fatal() {
    if env::var("CONFIG_CHILD_BAD_SCHEDULE").is_ok() {
        let _rt = Runtime::new();
        unreachable!("an invalid OMP_SCHEDULE must abort runtime startup");
    }
    let output = run_child(
        "invalid_omp_schedule_is_fatal",
        &[
            ("CONFIG_CHILD_BAD_SCHEDULE", "1"),
            ("OMP_SCHEDULE", "BOGUS_SCHED"),
        ],
    );
    assert!(!output.status.success());
    assert!(stderr_of(&output).contains("BOGUS_SCHED"));
}

#[test]
fn valid_omp_nested_enables_nesting() {
    if env::var("CONFIG_CHILD_VALID_NESTED").is_ok() {
        let rt = Runtime::new();
        assert!(rt.get_nested());
        return;
    }
    let output = run_child(
        "valid_omp_nested_enables_nesting",
        &[("CONFIG_CHILD_VALID_NESTED", "1"), ("OMP_NESTED", "TRUE")],
    );
    assert!(output.status.success(), "child failed: {}", stderr_of(&output));
}

#[test]
fn invalid_omp_nested_is_fatal() {
    if env::var("CONFIG_CHILD_BAD_NESTED").is_ok() {
        let _rt = Runtime::new();
        unreachable!("an invalid OMP_NESTED must abort runtime startup");
    }
    let output = run_child(
        "invalid_omp_nested_is_fatal",
        &[("CONFIG_CHILD_BAD_NESTED", "1"), ("OMP_NESTED", "MAYBE")],
    );
    assert!(!output.status.success());
    assert!(stderr_of(&output).contains("MAYBE"));
}

// -----------------------------------------------------------------------------
// Unimplemented stubs

#[test]
fn lock_polling_is_a_fatal_stub() {
    if env::var("CONFIG_CHILD_TEST_LOCK").is_ok() {
        let lock = Lock::new();
        let _ = lock.try_set();
        unreachable!("test_lock must abort");
    }
    let output = run_child("lock_polling_is_a_fatal_stub", &[("CONFIG_CHILD_TEST_LOCK", "1")]);
    assert!(!output.status.success());
    assert!(stderr_of(&output).contains("test_lock"));
}

#[test]
fn flush_is_a_fatal_stub() {
    if env::var("CONFIG_CHILD_FLUSH").is_ok() {
        flush_all();
        unreachable!("flush_all must abort");
    }
    let output = run_child("flush_is_a_fatal_stub", &[("CONFIG_CHILD_FLUSH", "1")]);
    assert!(!output.status.success());
    assert!(stderr_of(&output).contains("flush_all"));
}
