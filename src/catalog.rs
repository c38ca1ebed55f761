//! The closed set of fatal signals exercised against the failure handler,
//! and the labels the handler prints for them.

use std::fmt;
use std::str::FromStr;

use nix::sys::signal::Signal;

use crate::error::{HarnessError, Result};

/// Signals under test. This is the contract surface with the handler, not a
/// list of every signal that can kill a process.
pub const FAILURE_SIGNALS: [Signal; 5] = [
    Signal::SIGSEGV,
    Signal::SIGILL,
    Signal::SIGFPE,
    Signal::SIGABRT,
    Signal::SIGTERM,
];

/// Returns the label the failure handler prints for `signo`, or an empty
/// string when the signal is not in the catalog.
pub fn name_of(signo: i32) -> &'static str {
    match Signal::try_from(signo) {
        Ok(Signal::SIGSEGV) => "SIG_SEGV",
        Ok(Signal::SIGILL) => "SIG_ILL",
        Ok(Signal::SIGFPE) => "SIG_FPE",
        Ok(Signal::SIGABRT) => "SIG_ABORT",
        Ok(Signal::SIGTERM) => "SIG_TERM",
        _ => "",
    }
}

/// One signal under test together with its printed label.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SignalCase {
    signo: i32,
    label: String,
}

impl SignalCase {
    /// Builds a case for `signo`. Signals outside the catalog are labelled
    /// with their decimal number.
    pub fn new(signo: i32) -> Self {
        let label = match name_of(signo) {
            "" => signo.to_string(),
            name => name.to_string(),
        };
        Self { signo, label }
    }

    pub fn signo(&self) -> i32 {
        self.signo
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Whether the handler is expected to know this signal by name.
    pub fn is_cataloged(&self) -> bool {
        !name_of(self.signo).is_empty()
    }

    pub fn signal(&self) -> Result<Signal> {
        Signal::try_from(self.signo).map_err(|_| HarnessError::UnknownSignal(self.label.clone()))
    }
}

impl From<Signal> for SignalCase {
    fn from(signal: Signal) -> Self {
        Self::new(signal as i32)
    }
}

impl fmt::Display for SignalCase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label)
    }
}

/// One case per catalogued signal.
pub fn cases() -> Vec<SignalCase> {
    FAILURE_SIGNALS.iter().copied().map(SignalCase::from).collect()
}

/// Parses a signal given as a number (`6`), an OS name (`SIGABRT`, `abrt`)
/// or a catalog label (`SIG_ABORT`).
pub fn parse_signal(input: &str) -> Result<Signal> {
    let trimmed = input.trim();
    let unknown = || HarnessError::UnknownSignal(trimmed.to_string());

    if let Ok(number) = trimmed.parse::<i32>() {
        return Signal::try_from(number).map_err(|_| unknown());
    }

    let upper = trimmed.to_ascii_uppercase();
    if let Some(signal) = FAILURE_SIGNALS
        .iter()
        .copied()
        .find(|signal| name_of(*signal as i32) == upper)
    {
        return Ok(signal);
    }

    let os_name = if upper.starts_with("SIG") {
        upper
    } else {
        format!("SIG{upper}")
    };
    Signal::from_str(&os_name).map_err(|_| unknown())
}
