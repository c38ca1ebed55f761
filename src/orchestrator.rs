use std::fmt;
use std::time::Duration;

use nix::sys::signal::{raise, Signal};
use regex::bytes::Regex;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::capture::{self, CapturedOutput};
use crate::catalog::SignalCase;
use crate::error::HarnessError;
use crate::expectation::{self, Expectation};
use crate::reporter::{self, HandlerOptions};
use crate::sandbox::{ProcessSandbox, SandboxConfig, Subject, Termination};

/// Installs the failure handler inside a subject.
pub type InstallFn = fn(&HandlerOptions) -> crate::error::Result<()>;

/// How the fatal signal reaches the subject
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    /// The subject raises the signal on itself right after installing
    SelfRaise,
    /// The subject installs and sleeps; the parent sends the signal
    ExternalDelivery,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::SelfRaise => f.write_str("self-raise"),
            Mode::ExternalDelivery => f.write_str("external"),
        }
    }
}

/// How the parent waits for the subject to be ready before an external
/// delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pacing {
    /// Sleep a fixed time and assume installation finished. Under heavy load
    /// the signal can still arrive first and the scenario fails with a
    /// pattern mismatch.
    GraceDelay(Duration),
    /// Block until the subject writes the readiness sentinel.
    Handshake,
}

impl Default for Pacing {
    fn default() -> Self {
        Pacing::GraceDelay(Duration::from_secs(1))
    }
}

/// Settings shared by every scenario an orchestrator runs
#[derive(Debug, Clone)]
pub struct ScenarioConfig {
    /// Pacing for external delivery
    pub pacing: Pacing,
    /// How long an external-delivery subject sleeps waiting for its signal
    pub subject_sleep: Duration,
    /// Options handed to the installer
    pub handler_options: HandlerOptions,
    /// Handler installer; `None` runs subjects without a handler
    pub installer: Option<InstallFn>,
    /// Frame identifier that must also appear in the report
    pub stack_marker: Option<String>,
    /// Subject process settings
    pub sandbox: SandboxConfig,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self {
            pacing: Pacing::default(),
            subject_sleep: Duration::from_secs(10),
            handler_options: HandlerOptions::default(),
            installer: Some(reporter::install),
            stack_marker: None,
            sandbox: SandboxConfig::default(),
        }
    }
}

impl ScenarioConfig {
    /// Whether subjects are expected to print a failure report.
    pub fn expects_report(&self) -> bool {
        self.installer.is_some()
    }
}

/// One signal under one delivery mode
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Scenario {
    pub case: SignalCase,
    pub mode: Mode,
}

impl Scenario {
    pub fn new(case: SignalCase, mode: Mode) -> Self {
        Self { case, mode }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.case, self.mode)
    }
}

/// Every case crossed with every mode.
pub fn scenarios(cases: &[SignalCase], modes: &[Mode]) -> Vec<Scenario> {
    cases
        .iter()
        .flat_map(|case| modes.iter().map(move |mode| Scenario::new(case.clone(), *mode)))
        .collect()
}

/// Progress of one scenario
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScenarioState {
    Spawned,
    Capturing,
    Signaled,
    Reaped,
    /// Terminal; carries the verdict
    Verified(bool),
}

impl ScenarioState {
    fn may_follow(self, previous: Option<ScenarioState>) -> bool {
        use ScenarioState::*;
        matches!(
            (previous, self),
            (None, Spawned)
                | (Some(Spawned), Capturing)
                | (Some(Capturing), Signaled)
                | (Some(Signaled), Reaped)
                // A subject that never became ready is reaped unsignaled.
                | (Some(Capturing), Reaped)
                | (Some(Reaped), Verified(_))
                // Setup failures verify early as failed.
                | (None | Some(Spawned | Capturing | Signaled), Verified(false))
        )
    }
}

/// Why a scenario failed
#[derive(Error, Debug)]
pub enum ScenarioFailure {
    /// Pipe, fork, delivery or wait failed
    #[error("setup failed: {0}")]
    Setup(#[from] HarnessError),

    /// The report header is missing
    #[error("captured output does not match `{expected}`; captured output:\n{captured}")]
    PatternMismatch { expected: String, captured: String },

    /// The report has no trace of the expected frame
    #[error("captured output lacks stack frame `{marker}`; captured output:\n{captured}")]
    MissingStackFrame { marker: String, captured: String },

    /// The subject did not die from a signal
    #[error("subject survived: {termination}; captured output:\n{captured}")]
    UnexpectedSurvival { termination: Termination, captured: String },

    /// The subject died from a different signal than the one under test
    #[error("subject {actual} instead of by {}", .expected.as_str())]
    UnexpectedTermination { expected: Signal, actual: Termination },

    /// A report appeared although no handler was installed
    #[error("captured output matches `{pattern}` without a handler installed; captured output:\n{captured}")]
    UnexpectedReport { pattern: String, captured: String },
}

/// Pass or fail; no partial credit
#[derive(Debug)]
pub enum Verdict {
    Pass,
    Fail(ScenarioFailure),
}

impl Verdict {
    pub fn passed(&self) -> bool {
        matches!(self, Verdict::Pass)
    }

    pub fn failure(&self) -> Option<&ScenarioFailure> {
        match self {
            Verdict::Pass => None,
            Verdict::Fail(failure) => Some(failure),
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Pass => f.write_str("pass"),
            Verdict::Fail(failure) => write!(f, "fail: {failure}"),
        }
    }
}

/// Everything observed while running one scenario
#[derive(Debug)]
pub struct ScenarioReport {
    pub scenario: Scenario,
    pub states: Vec<ScenarioState>,
    pub termination: Option<Termination>,
    pub output: CapturedOutput,
    pub verdict: Verdict,
}

impl ScenarioReport {
    pub fn passed(&self) -> bool {
        self.verdict.passed()
    }
}

/// Records state transitions for one scenario.
struct Progress<'a> {
    scenario: &'a Scenario,
    states: Vec<ScenarioState>,
}

impl<'a> Progress<'a> {
    fn new(scenario: &'a Scenario) -> Self {
        Self {
            scenario,
            states: Vec::with_capacity(5),
        }
    }

    fn enter(&mut self, next: ScenarioState) {
        let previous = self.states.last().copied();
        if !next.may_follow(previous) {
            warn!("{}: unexpected transition {:?} -> {:?}", self.scenario, previous, next);
        }
        debug!("{}: {:?}", self.scenario, next);
        self.states.push(next);
    }
}

/// Runs signal scenarios, each in its own subject process.
///
/// One scenario's failure never stops the others; nothing is retried.
#[derive(Debug, Clone, Default)]
pub struct TestOrchestrator {
    sandbox: ProcessSandbox,
    config: ScenarioConfig,
}

impl TestOrchestrator {
    pub fn new(config: ScenarioConfig) -> Self {
        Self {
            sandbox: ProcessSandbox::new(config.sandbox.clone()),
            config,
        }
    }

    pub fn config(&self) -> &ScenarioConfig {
        &self.config
    }

    /// Runs every scenario and returns one report per scenario, in order.
    pub fn run_matrix(&self, scenarios: &[Scenario]) -> Vec<ScenarioReport> {
        let reports: Vec<ScenarioReport> = scenarios.iter().map(|scenario| self.run(scenario)).collect();
        let failed = reports.iter().filter(|report| !report.passed()).count();
        info!("{} of {} scenarios passed", reports.len() - failed, reports.len());
        reports
    }

    /// Runs one scenario to a verdict.
    pub fn run(&self, scenario: &Scenario) -> ScenarioReport {
        info!("Running scenario {}", scenario);
        let mut progress = Progress::new(scenario);

        let (termination, output, verdict) = match self.drive(scenario, &mut progress) {
            Ok((termination, output)) => {
                let verdict = self.verify(&scenario.case, termination, &output);
                (Some(termination), output, verdict)
            }
            Err(err) => {
                error!("{}: {}", scenario, err);
                (None, CapturedOutput::default(), Verdict::Fail(err.into()))
            }
        };

        progress.enter(ScenarioState::Verified(verdict.passed()));
        match &verdict {
            Verdict::Pass => info!("{}: pass", scenario),
            Verdict::Fail(failure) => warn!("{}: {}", scenario, failure),
        }

        ScenarioReport {
            scenario: scenario.clone(),
            states: progress.states,
            termination,
            output,
            verdict,
        }
    }

    fn drive(
        &self,
        scenario: &Scenario,
        progress: &mut Progress<'_>,
    ) -> Result<(Termination, CapturedOutput), HarnessError> {
        let signal = scenario.case.signal()?;
        let mut subject = self.spawn_subject(signal, scenario.mode)?;
        progress.enter(ScenarioState::Spawned);
        progress.enter(ScenarioState::Capturing);

        let ready = match (scenario.mode, self.config.pacing) {
            (Mode::SelfRaise, _) => true,
            (Mode::ExternalDelivery, Pacing::GraceDelay(delay)) => {
                std::thread::sleep(delay);
                true
            }
            (Mode::ExternalDelivery, Pacing::Handshake) => match subject.await_ready() {
                Ok(()) => true,
                Err(err) => {
                    // The subject gave up before sleeping; reap it and let
                    // its exit status and output tell why.
                    warn!("{}: {}, not delivering {}", scenario, err, signal.as_str());
                    false
                }
            },
        };
        if ready {
            if scenario.mode == Mode::ExternalDelivery {
                self.sandbox.deliver_signal(&subject, signal)?;
            }
            progress.enter(ScenarioState::Signaled);
        }

        self.finish(&mut subject)?;
        progress.enter(ScenarioState::Reaped);
        finished_parts(subject)
    }

    fn spawn_subject(&self, signal: Signal, mode: Mode) -> Result<Subject, HarnessError> {
        let installer = self.config.installer;
        let options = self.config.handler_options.clone();
        let handshake = self.config.pacing == Pacing::Handshake;
        let sleep = self.config.subject_sleep;

        self.sandbox.spawn(move || {
            if let Some(install) = installer {
                if let Err(err) = install(&options) {
                    let message = format!("crashprobe: {err}\n");
                    let _ = nix::unistd::write(std::io::stderr(), message.as_bytes());
                    return;
                }
            }
            match mode {
                Mode::SelfRaise => {
                    let _ = raise(signal);
                }
                Mode::ExternalDelivery => {
                    if handshake {
                        let _ = capture::signal_ready();
                    }
                    std::thread::sleep(sleep);
                }
            }
        })
    }

    /// Drains the subject's output, then reaps it. Draining first keeps a
    /// subject that fills the pipe from blocking forever on its own write.
    fn finish(&self, subject: &mut Subject) -> Result<(), HarnessError> {
        subject.drain()?;
        self.sandbox.wait_for_exit(subject)?;
        Ok(())
    }

    fn verify(&self, case: &SignalCase, termination: Termination, output: &CapturedOutput) -> Verdict {
        let expectation = Expectation::for_case(case);
        let expected_signal = match case.signal() {
            Ok(signal) => signal,
            Err(err) => return Verdict::Fail(err.into()),
        };

        match termination {
            Termination::Exited(_) => {
                return Verdict::Fail(ScenarioFailure::UnexpectedSurvival {
                    termination,
                    captured: output.to_string_lossy(),
                });
            }
            Termination::Signaled { signal, .. } if signal != expected_signal => {
                return Verdict::Fail(ScenarioFailure::UnexpectedTermination {
                    expected: expected_signal,
                    actual: termination,
                });
            }
            Termination::Signaled { .. } => {}
        }

        if !self.config.expects_report() {
            if expectation.is_met_by(output) {
                return Verdict::Fail(ScenarioFailure::UnexpectedReport {
                    pattern: expectation.to_string(),
                    captured: output.to_string_lossy(),
                });
            }
            return Verdict::Pass;
        }

        if !expectation.is_met_by(output) {
            return Verdict::Fail(ScenarioFailure::PatternMismatch {
                expected: expectation.to_string(),
                captured: output.to_string_lossy(),
            });
        }

        if let Some(marker) = &self.config.stack_marker {
            if !expectation::contains_stack_frame(output, marker) {
                return Verdict::Fail(ScenarioFailure::MissingStackFrame {
                    marker: marker.clone(),
                    captured: output.to_string_lossy(),
                });
            }
        }

        Verdict::Pass
    }

    /// Runs `behavior` in a subject and checks that it dies from a signal
    /// with output matching `pattern`.
    pub fn expect_death<F>(&self, behavior: F, pattern: &Regex) -> Verdict
    where
        F: FnOnce(),
    {
        let result = self.sandbox.spawn(behavior).and_then(|mut subject| {
            self.finish(&mut subject)?;
            finished_parts(subject)
        });

        let (termination, output) = match result {
            Ok(parts) => parts,
            Err(err) => return Verdict::Fail(err.into()),
        };

        if termination.signal().is_none() {
            return Verdict::Fail(ScenarioFailure::UnexpectedSurvival {
                termination,
                captured: output.to_string_lossy(),
            });
        }
        if !expectation::matches(&output, pattern) {
            return Verdict::Fail(ScenarioFailure::PatternMismatch {
                expected: pattern.as_str().to_string(),
                captured: output.to_string_lossy(),
            });
        }
        Verdict::Pass
    }
}

fn finished_parts(subject: Subject) -> Result<(Termination, CapturedOutput), HarnessError> {
    let pid = subject.pid();
    subject.into_parts().ok_or(HarnessError::Wait {
        pid,
        source: nix::errno::Errno::ECHILD,
    })
}
