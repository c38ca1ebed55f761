type Result<T> = color_eyre::eyre::Result<T>;

mod cli;

use clap::Parser;
use eyre::eyre;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cli::{Cli, Config};
use crashprobe::orchestrator::{ScenarioReport, TestOrchestrator};

fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::from_cli(cli)?;
    let scenarios = config.scenarios();

    info!("crashprobe starting, {} scenarios", scenarios.len());

    // Subjects are forked from this thread, so everything runs synchronously
    // on it.
    let orchestrator = TestOrchestrator::new(config.scenario.clone());
    let reports = orchestrator.run_matrix(&scenarios);

    let failed = summarize(&reports);
    if failed > 0 {
        return Err(eyre!("{} of {} scenarios failed", failed, reports.len()));
    }

    info!("crashprobe exiting");
    Ok(())
}

/// Logs one line per scenario and returns the number of failures.
fn summarize(reports: &[ScenarioReport]) -> usize {
    let mut failed = 0;
    for report in reports {
        let termination = report
            .termination
            .map(|t| t.to_string())
            .unwrap_or_else(|| "not reaped".to_string());
        if report.passed() {
            info!("PASS {} ({})", report.scenario, termination);
        } else {
            failed += 1;
            error!("FAIL {} ({}): {}", report.scenario, termination, report.verdict);
        }
    }
    failed
}
