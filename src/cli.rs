use clap::{Parser, ValueEnum};
use eyre::eyre;
use std::time::Duration;

use crashprobe::catalog::{self, SignalCase};
use crashprobe::orchestrator::{self, Mode, Pacing, Scenario, ScenarioConfig};
use crashprobe::reporter::HandlerOptions;
use crashprobe::sandbox::SandboxConfig;
use nix::sys::signal::Signal;

type Result<T> = color_eyre::eyre::Result<T>;

/// Which delivery modes to run
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ModeArg {
    /// Subject raises the signal on itself
    SelfRaise,
    /// Parent sends the signal to a sleeping subject
    External,
    /// Both of the above
    Both,
}

/// Verifies that the failure signal handler reports fatal signals
#[derive(Parser)]
#[command(name = "crashprobe")]
#[command(about = "Verifies that the failure signal handler reports fatal signals")]
#[command(version)]
pub struct Cli {
    /// Comma-separated signals to test (SIGABRT, abrt, SIG_ABORT or 6; default: all catalogued)
    #[arg(long, value_delimiter = ',')]
    pub signals: Vec<String>,

    /// Delivery modes to run
    #[arg(long, value_enum, default_value = "both")]
    pub mode: ModeArg,

    /// Run external delivery for every signal instead of SIGABRT only
    #[arg(long)]
    pub external_all: bool,

    /// Delay before external delivery (ms)
    #[arg(long, default_value = "1000")]
    pub grace_delay_ms: u64,

    /// How long an external-delivery subject sleeps (seconds)
    #[arg(long, default_value = "10")]
    pub subject_sleep_secs: u64,

    /// Wait for a readiness byte from the subject instead of a fixed delay
    #[arg(long)]
    pub handshake: bool,

    /// Do not install the handler; subjects must then die without a report
    #[arg(long)]
    pub skip_install: bool,

    /// Frame identifier that must also appear in every report
    #[arg(long)]
    pub stack_marker: Option<String>,

    /// Report raw addresses only
    #[arg(long)]
    pub no_symbolize: bool,

    /// Run the handler on the thread's normal stack
    #[arg(long)]
    pub no_alternate_stack: bool,

    /// Chain to the previously installed handler after reporting
    #[arg(long)]
    pub call_previous_handler: bool,

    /// Allow subjects to write core files
    #[arg(long)]
    pub keep_core_dumps: bool,
}

/// Validated configuration for a harness run
#[derive(Debug, Clone)]
pub struct Config {
    /// Signals under test
    pub cases: Vec<SignalCase>,
    /// Modes to run
    pub mode: ModeArg,
    /// Whether non-abort signals also get external delivery
    pub external_all: bool,
    /// Settings handed to the orchestrator
    pub scenario: ScenarioConfig,
}

impl Config {
    /// Parse command line arguments into configuration
    pub fn from_cli(cli: Cli) -> Result<Self> {
        let cases = if cli.signals.is_empty() {
            catalog::cases()
        } else {
            cli.signals
                .iter()
                .map(|name| {
                    catalog::parse_signal(name)
                        .map(SignalCase::from)
                        .map_err(|e| eyre!("Invalid signal '{}': {}", name, e))
                })
                .collect::<Result<Vec<_>>>()?
        };

        let pacing = if cli.handshake {
            Pacing::Handshake
        } else {
            Pacing::GraceDelay(Duration::from_millis(cli.grace_delay_ms))
        };

        let grace = Duration::from_millis(cli.grace_delay_ms);
        let sleep = Duration::from_secs(cli.subject_sleep_secs);
        if !cli.handshake && grace >= sleep {
            return Err(eyre!(
                "Grace delay ({:?}) must be shorter than the subject sleep ({:?})",
                grace,
                sleep
            ));
        }

        if cli.stack_marker.as_deref().is_some_and(|marker| marker.trim().is_empty()) {
            return Err(eyre!("Stack marker must not be empty"));
        }

        Ok(Config {
            cases,
            mode: cli.mode,
            external_all: cli.external_all,
            scenario: ScenarioConfig {
                pacing,
                subject_sleep: sleep,
                handler_options: HandlerOptions {
                    symbolize_stacktrace: !cli.no_symbolize,
                    use_alternate_stack: !cli.no_alternate_stack,
                    call_previous_handler: cli.call_previous_handler,
                },
                installer: if cli.skip_install {
                    None
                } else {
                    Some(crashprobe::reporter::install)
                },
                stack_marker: cli.stack_marker,
                sandbox: SandboxConfig {
                    keep_core_dumps: cli.keep_core_dumps,
                },
            },
        })
    }

    /// Scenarios to run, in order
    pub fn scenarios(&self) -> Vec<Scenario> {
        let mut scenarios = Vec::new();
        if matches!(self.mode, ModeArg::SelfRaise | ModeArg::Both) {
            scenarios.extend(orchestrator::scenarios(&self.cases, &[Mode::SelfRaise]));
        }
        if matches!(self.mode, ModeArg::External | ModeArg::Both) {
            let external: Vec<SignalCase> = self
                .cases
                .iter()
                .filter(|case| self.external_all || case.signo() == Signal::SIGABRT as i32)
                .cloned()
                .collect();
            scenarios.extend(orchestrator::scenarios(&external, &[Mode::ExternalDelivery]));
        }
        scenarios
    }
}
