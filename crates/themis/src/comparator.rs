//! Per-test verdict derivation
//!
//! The precedence is an explicit ordered list, first match wins:
//! compile failure, timeout, memory, abnormal exit, output mismatch.

use themis_common::{ComparisonMode, Verdict};

use crate::sandbox::Outcome;

/// Score one test case.
pub fn score(expected: &str, actual: &str, outcome: &Outcome, mode: ComparisonMode) -> Verdict {
    if outcome.compile_failed {
        Verdict::CompileError
    } else if outcome.timed_out {
        Verdict::TimeLimitExceeded
    } else if outcome.oom {
        Verdict::MemoryLimitExceeded
    } else if outcome.exit_code != Some(0) || outcome.signal.is_some() {
        Verdict::RuntimeError
    } else if !outputs_match(expected, actual, mode) {
        Verdict::WrongAnswer
    } else {
        Verdict::Accepted
    }
}

/// Compare program output with the expected answer.
pub fn outputs_match(expected: &str, actual: &str, mode: ComparisonMode) -> bool {
    match mode {
        ComparisonMode::Exact => expected.as_bytes() == actual.as_bytes(),
        ComparisonMode::Normalized => normalize(expected) == normalize(actual),
    }
}

/// Strip trailing whitespace from every line and drop trailing empty lines.
///
/// Internal spacing and case are left alone.
pub fn normalize(text: &str) -> String {
    let mut lines: Vec<&str> = text.lines().map(str::trim_end).collect();
    while lines.last().is_some_and(|line| line.is_empty()) {
        lines.pop();
    }
    lines.join("\n")
}
