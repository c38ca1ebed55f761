use crate::infrastructure::crash_assertions::*;
use crate::infrastructure::{DeathTestHarness, TEST_GRACE_DELAY};
use anyhow::Result;
use crashprobe::catalog::FAILURE_SIGNALS;
use crashprobe::orchestrator::{Mode, Pacing};
use nix::sys::signal::Signal;
use std::time::Instant;

/// Parent waits the grace delay, then sends SIGABRT to the sleeping subject.
#[test]
fn test_externally_delivered_abort_is_reported() -> Result<()> {
    let harness = DeathTestHarness::new();
    let started = Instant::now();
    let report = harness.run_expecting_pass(libc::SIGABRT, Mode::ExternalDelivery)?;

    assert!(started.elapsed() >= TEST_GRACE_DELAY, "signal sent before the grace delay");
    assert_killed_by(&report, Signal::SIGABRT);
    assert_output_contains(&report, "*** SIG_ABORT received at time=");
    assert_full_lifecycle(&report);
    Ok(())
}

/// Same scenario paced by the readiness handshake; the sentinel byte must
/// not leak into the captured output.
#[test]
fn test_handshake_paced_abort_is_reported() -> Result<()> {
    let harness = DeathTestHarness::new().with_pacing(Pacing::Handshake);
    let report = harness.run_expecting_pass(libc::SIGABRT, Mode::ExternalDelivery)?;

    assert_killed_by(&report, Signal::SIGABRT);
    assert!(report.output.as_bytes().starts_with(b"*** SIG_ABORT received at time="));
    Ok(())
}

/// External delivery for the whole catalog.
#[test]
fn test_external_delivery_for_every_signal() -> Result<()> {
    let harness = DeathTestHarness::new().with_pacing(Pacing::Handshake);
    for signal in FAILURE_SIGNALS {
        let report = harness.run_expecting_pass(signal as i32, Mode::ExternalDelivery)?;
        assert_killed_by(&report, signal);
    }
    Ok(())
}
