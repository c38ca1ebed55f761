use crate::infrastructure::crash_assertions::*;
use crate::infrastructure::DeathTestHarness;
use anyhow::Result;
use crashprobe::expectation::TEST_RUNNER_FRAME;
use crashprobe::orchestrator::{Mode, ScenarioFailure};
use nix::sys::signal::Signal;
use tracing::debug;

/// A self-raised abort must produce a real stack reaching the test runner,
/// not an empty or stub report.
#[test]
fn test_self_raised_abort_walks_to_test_runner() -> Result<()> {
    let harness = DeathTestHarness::new().with_stack_marker(TEST_RUNNER_FRAME);
    let report = harness.run_expecting_pass(libc::SIGABRT, Mode::SelfRaise)?;

    debug!("Output from the subject:\n{}", report.output);
    assert_killed_by(&report, Signal::SIGABRT);
    assert_output_contains(&report, "*** SIG_ABORT received at time=");
    assert_output_contains(&report, TEST_RUNNER_FRAME);
    Ok(())
}

/// Without symbolization only addresses are printed.
#[test]
fn test_unsymbolized_report_has_addresses_only() -> Result<()> {
    let harness = DeathTestHarness::new().with_config(|config| {
        config.handler_options.symbolize_stacktrace = false;
    });
    let report = harness.run_expecting_pass(libc::SIGABRT, Mode::SelfRaise)?;

    assert_output_contains(&report, "    @ 0x");
    let output = report.output.to_string_lossy();
    assert!(!output.contains(TEST_RUNNER_FRAME), "symbol names leaked:\n{output}");
    Ok(())
}

/// The report still works when the handler runs on the thread's own stack.
#[test]
fn test_report_without_alternate_stack() -> Result<()> {
    let harness = DeathTestHarness::new()
        .with_stack_marker(TEST_RUNNER_FRAME)
        .with_config(|config| config.handler_options.use_alternate_stack = false);
    let report = harness.run_expecting_pass(libc::SIGSEGV, Mode::SelfRaise)?;

    assert_killed_by(&report, Signal::SIGSEGV);
    Ok(())
}

/// A marker that cannot appear fails the scenario with its own reason.
#[test]
fn test_absent_frame_is_a_distinct_failure() -> Result<()> {
    let harness = DeathTestHarness::new().with_stack_marker("no_such_frame_in_any_stack");
    let report = harness.run(libc::SIGABRT, Mode::SelfRaise);

    assert_killed_by(&report, Signal::SIGABRT);
    assert_output_contains(&report, "*** SIG_ABORT received at time=");
    assert_failed_with(
        &report,
        |failure| matches!(failure, ScenarioFailure::MissingStackFrame { .. }),
        "a missing stack frame",
    );
    Ok(())
}
