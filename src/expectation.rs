//! What a subject's captured output must (or must not) contain.

use std::fmt;

use regex::bytes::Regex;

use crate::capture::CapturedOutput;
use crate::catalog::SignalCase;

/// Literal substring of the libtest frame that drives every `#[test]`
/// function. Its presence in a report proves the stack walk reached the
/// test runner rather than stopping inside the handler.
pub const TEST_RUNNER_FRAME: &str = "test::__rust_begin_short_backtrace";

/// Expected report for one signal case.
#[derive(Debug, Clone)]
pub struct Expectation {
    case: SignalCase,
    pattern: Regex,
}

impl Expectation {
    pub fn for_case(case: &SignalCase) -> Self {
        Self {
            case: case.clone(),
            pattern: build_pattern(case),
        }
    }

    pub fn case(&self) -> &SignalCase {
        &self.case
    }

    pub fn pattern(&self) -> &Regex {
        &self.pattern
    }

    pub fn is_met_by(&self, output: &CapturedOutput) -> bool {
        matches(output, &self.pattern)
    }
}

impl fmt::Display for Expectation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.pattern.as_str())
    }
}

/// Builds the report header pattern for `case`: the `***` marker, the
/// signal's label and `received at time=`. The timestamp itself is left
/// unconstrained.
pub fn build_pattern(case: &SignalCase) -> Regex {
    let source = format!(r"\*\*\* {} received at time=", regex::escape(case.label()));
    // The label is escaped, so the pattern is always valid.
    Regex::new(&source).unwrap_or_else(|_| unreachable!("escaped pattern failed to compile: {source}"))
}

/// Whether `pattern` occurs anywhere in `output`.
pub fn matches(output: &CapturedOutput, pattern: &Regex) -> bool {
    pattern.is_match(output.as_bytes())
}

/// Whether `marker` occurs literally anywhere in `output`.
///
/// An empty marker proves nothing about the stack and never matches.
pub fn contains_stack_frame(output: &CapturedOutput, marker: &str) -> bool {
    if marker.is_empty() {
        return false;
    }
    match Regex::new(&regex::escape(marker)) {
        Ok(frame) => frame.is_match(output.as_bytes()),
        Err(_) => false,
    }
}
