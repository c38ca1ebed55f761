use crate::infrastructure::crash_assertions::*;
use crate::infrastructure::DeathTestHarness;
use anyhow::Result;
use crashprobe::catalog::{self, SignalCase};
use crashprobe::expectation::build_pattern;
use crashprobe::orchestrator::{self, Mode};
use crashprobe::reporter::{self, HandlerOptions};
use libc::c_int;
use nix::sys::signal::{raise, signal, SigHandler, Signal};
use regex::bytes::Regex;

/// One death test per catalogued signal: install, raise, expect the report.
macro_rules! failure_signal_death_test {
    ($name:ident, $signal:expr, $label:literal) => {
        #[test]
        fn $name() -> Result<()> {
            let harness = DeathTestHarness::new();
            let report = harness.run_expecting_pass($signal as i32, Mode::SelfRaise)?;

            assert_killed_by(&report, $signal);
            assert_output_contains(&report, concat!("*** ", $label, " received at time="));
            assert_full_lifecycle(&report);
            Ok(())
        }
    };
}

failure_signal_death_test!(test_sig_segv_is_reported, Signal::SIGSEGV, "SIG_SEGV");
failure_signal_death_test!(test_sig_ill_is_reported, Signal::SIGILL, "SIG_ILL");
failure_signal_death_test!(test_sig_fpe_is_reported, Signal::SIGFPE, "SIG_FPE");
failure_signal_death_test!(test_sig_abort_is_reported, Signal::SIGABRT, "SIG_ABORT");
failure_signal_death_test!(test_sig_term_is_reported, Signal::SIGTERM, "SIG_TERM");

/// The whole catalog through one orchestrator; every scenario gets its own
/// subject and its own verdict.
#[test]
fn test_catalog_matrix_passes() -> Result<()> {
    let harness = DeathTestHarness::new();
    let cases = catalog::cases();
    let scenarios = orchestrator::scenarios(&cases, &[Mode::SelfRaise]);

    let reports = harness.orchestrator().run_matrix(&scenarios);

    assert_eq!(reports.len(), cases.len());
    for report in &reports {
        assert!(report.passed(), "{}: {}", report.scenario, report.verdict);
        assert_output_contains(report, report.scenario.case.label());
    }
    Ok(())
}

/// Installing twice inside one subject must not break the handler.
#[test]
fn test_repeated_install_still_reports() -> Result<()> {
    let harness = DeathTestHarness::new();
    let pattern = build_pattern(&SignalCase::new(libc::SIGABRT));

    let verdict = harness.orchestrator().expect_death(
        || {
            let options = HandlerOptions::default();
            let _ = reporter::install(&options);
            let _ = reporter::install(&options);
            let _ = raise(Signal::SIGABRT);
        },
        &pattern,
    );

    assert!(verdict.passed(), "{verdict}");
    Ok(())
}

extern "C" fn announce_previous(_: c_int) {
    let _ = nix::unistd::write(std::io::stderr(), b"previous handler ran\n");
}

/// With chaining enabled the handler that was installed first still runs,
/// after the report.
#[test]
fn test_previous_handler_is_chained() -> Result<()> {
    let harness = DeathTestHarness::new();
    let pattern = Regex::new(r"(?s)\*\*\* SIG_TERM received at time=.*previous handler ran")?;

    let verdict = harness.orchestrator().expect_death(
        || {
            // SAFETY: the handler only calls write(2).
            let _ = unsafe { signal(Signal::SIGTERM, SigHandler::Handler(announce_previous)) };
            let options = HandlerOptions {
                call_previous_handler: true,
                ..Default::default()
            };
            let _ = reporter::install(&options);
            let _ = raise(Signal::SIGTERM);
        },
        &pattern,
    );

    assert!(verdict.passed(), "{verdict}");
    Ok(())
}
