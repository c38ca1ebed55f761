//! Process-isolated verification of a crash-diagnostic signal handler.
//!
//! Each scenario forks a subject that installs the failure handler and dies
//! from one fatal signal, either raised on itself or sent by the parent. The
//! subject's stdout and stderr are captured through a pipe and checked for
//! the handler's `*** <label> received at time=` report.

pub mod capture;
pub mod catalog;
pub mod error;
pub mod expectation;
pub mod orchestrator;
pub mod reporter;
pub mod sandbox;

pub use capture::CapturedOutput;
pub use catalog::{SignalCase, FAILURE_SIGNALS};
pub use error::{HarnessError, Result};
pub use expectation::{Expectation, TEST_RUNNER_FRAME};
pub use orchestrator::{
    Mode, Pacing, Scenario, ScenarioConfig, ScenarioFailure, ScenarioReport, ScenarioState, TestOrchestrator, Verdict,
};
pub use reporter::HandlerOptions;
pub use sandbox::{ProcessSandbox, SandboxConfig, Subject, Termination};
