use crate::infrastructure::crash_assertions::*;
use crate::infrastructure::DeathTestHarness;
use anyhow::Result;
use crashprobe::catalog::FAILURE_SIGNALS;
use crashprobe::orchestrator::{Mode, Pacing, ScenarioFailure};
use crashprobe::sandbox::EXIT_SURVIVED;
use nix::sys::signal::Signal;

/// Without the handler every signal kills silently by its default action.
#[test]
fn test_default_disposition_prints_nothing() -> Result<()> {
    let harness = DeathTestHarness::without_handler();
    for signal in FAILURE_SIGNALS {
        let report = harness.run_expecting_pass(signal as i32, Mode::SelfRaise)?;
        assert_killed_by(&report, signal);
        assert_no_report(&report);
        assert!(report.output.is_empty(), "{}: {}", report.scenario, report.output);
    }
    Ok(())
}

#[test]
fn test_external_abort_without_handler_prints_nothing() -> Result<()> {
    let harness = DeathTestHarness::without_handler().with_pacing(Pacing::Handshake);
    let report = harness.run_expecting_pass(libc::SIGABRT, Mode::ExternalDelivery)?;

    assert_killed_by(&report, Signal::SIGABRT);
    assert_no_report(&report);
    Ok(())
}

/// The same signal with and without the handler is told apart by the
/// captured output alone.
#[test]
fn test_handler_presence_is_observable() -> Result<()> {
    let with_handler = DeathTestHarness::new().run_expecting_pass(libc::SIGTERM, Mode::SelfRaise)?;
    let without_handler = DeathTestHarness::without_handler().run_expecting_pass(libc::SIGTERM, Mode::SelfRaise)?;

    assert_output_contains(&with_handler, "*** SIG_TERM received at time=");
    assert_no_report(&without_handler);
    assert_eq!(with_handler.termination, without_handler.termination);
    Ok(())
}

fn failing_install(_: &crashprobe::HandlerOptions) -> crashprobe::Result<()> {
    Err(crashprobe::HarnessError::Install(nix::errno::Errno::EINVAL))
}

/// A subject whose installation fails never raises, and survives; that is
/// reported as survival rather than as a missing report.
#[test]
fn test_failed_install_is_unexpected_survival() -> Result<()> {
    let harness = DeathTestHarness::new().with_config(|config| config.installer = Some(failing_install));
    let report = harness.run(libc::SIGABRT, Mode::SelfRaise);

    assert_eq!(report.termination, Some(crashprobe::Termination::Exited(EXIT_SURVIVED)));
    assert_output_contains(&report, "Failed to install failure signal handler");
    assert_failed_with(
        &report,
        |failure| matches!(failure, ScenarioFailure::UnexpectedSurvival { .. }),
        "unexpected survival",
    );
    Ok(())
}

/// The runtime's own SIGSEGV handler must not leak into subjects: without a
/// failure handler a raised SIGSEGV still kills by the default action.
#[test]
fn test_segv_without_handler_kills_by_default_action() -> Result<()> {
    let report = DeathTestHarness::without_handler().run_expecting_pass(libc::SIGSEGV, Mode::SelfRaise)?;

    assert_killed_by(&report, Signal::SIGSEGV);
    assert_no_report(&report);
    assert_full_lifecycle(&report);
    Ok(())
}

/// A subject that cannot install never becomes ready; the parent skips
/// delivery and still reports survival with the subject's own message.
#[test]
fn test_failed_install_under_handshake_is_unexpected_survival() -> Result<()> {
    let harness = DeathTestHarness::new()
        .with_pacing(Pacing::Handshake)
        .with_config(|config| config.installer = Some(failing_install));
    let report = harness.run(libc::SIGABRT, Mode::ExternalDelivery);

    assert_eq!(report.termination, Some(crashprobe::Termination::Exited(EXIT_SURVIVED)));
    assert_output_contains(&report, "crashprobe: Failed to install failure signal handler");
    assert_failed_with(
        &report,
        |failure| matches!(failure, ScenarioFailure::UnexpectedSurvival { .. }),
        "unexpected survival",
    );
    Ok(())
}
