/// Verdict Classification - Pure Grading Rules
///
/// **Core Responsibility:**
/// Turn raw guard measurements and exit codes into verdicts.
///
/// **Critical Properties:**
/// - Knows nothing about Docker
/// - Knows nothing about the endpoint
/// - Pure functions only, no I/O
///
/// **Run classification (first match wins):**
/// - time-exceeded → timelimit
/// - memory-exceeded → run-error
/// - output-exceeded → run-error
/// - nonzero exit → run-error
/// - otherwise the run is clean and proceeds to comparison
///
/// **Comparison exit codes:**
/// - 42 → correct
/// - 43 → wrong-answer
/// - anything else is a judge error, never a verdict

use crate::guard::RunInfo;
use judgehost_common::types::Verdict;
use thiserror::Error;

pub const EXIT_CORRECT: i64 = 42;
pub const EXIT_WRONG_ANSWER: i64 = 43;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("compare script exited with unexpected code {0}")]
pub struct UnexpectedJudgeExit(pub i64);

/// Classify a guarded run
///
/// ## Returns
/// `Some(verdict)` when the run itself decides the testcase,
/// `None` when it was clean and the comparison stage must decide.
pub fn classify_run(info: &RunInfo, exit_code: i64) -> Option<Verdict> {
    if info.time_exceeded {
        Some(Verdict::TimeLimit)
    } else if info.memory_exceeded || info.output_exceeded {
        Some(Verdict::RunError)
    } else if exit_code != 0 {
        Some(Verdict::RunError)
    } else {
        None
    }
}

pub fn classify_judge(exit_code: i64) -> Result<Verdict, UnexpectedJudgeExit> {
    match exit_code {
        EXIT_CORRECT => Ok(Verdict::Correct),
        EXIT_WRONG_ANSWER => Ok(Verdict::WrongAnswer),
        other => Err(UnexpectedJudgeExit(other)),
    }
}

/// Reason a run was cut short, for the system metadata block.
fn quota_reason(info: &RunInfo) -> Option<&'static str> {
    if info.time_exceeded {
        Some("time limit exceeded")
    } else if info.memory_exceeded {
        Some("memory limit exceeded")
    } else if info.output_exceeded {
        Some("output limit exceeded")
    } else {
        None
    }
}

/// Human readable usage block attached to every posted result
///
/// ## Arguments
/// * `label` - verdict name, or `ok` for a clean run awaiting comparison
/// * `info` - guard measurements of the run
pub fn system_meta(label: &str, info: &RunInfo) -> String {
    let seconds = info.used_time.as_secs_f64();
    let mut meta = format!(
        "{}.\nruntime: {:.3}s cpu, {:.3}s wall\nmemory used: {} bytes\n",
        label, seconds, seconds, info.used_memory
    );
    if let Some(reason) = quota_reason(info) {
        meta.push_str(reason);
        meta.push('\n');
    }
    meta
}

/// Compiler diagnostics as posted for a compile error.
pub fn compile_error_message(exit_code: i64, stderr: &str) -> String {
    format!(
        "--------------------------------------------------------------\n\
         Compile Error Message (exit code {})\n\
         --------------------------------------------------------------\n\
         {}",
        exit_code, stderr
    )
}

/// Parse the content of an `exitcode` file.
pub fn parse_exit_code(content: &str) -> Option<i64> {
    content.trim().parse().ok()
}
