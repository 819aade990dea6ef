use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::plan::{PlanStep, TaskId};
use crate::tools::{Arguments, ToolName, ToolOutput};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Succeeded,
    Failed,
    Skipped,
}

/// Why an attempt did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The capability itself failed. The only kind eligible for self-heal.
    Executor,
    /// Arguments did not fit the tool's declared parameters.
    Validation,
    /// A path argument resolved to a forbidden location.
    Forbidden,
    /// A corrected command matched the destructive-command denylist.
    Safety,
    Timeout,
    Cancelled,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ErrorKind::Executor => "executor error",
            ErrorKind::Validation => "validation error",
            ErrorKind::Forbidden => "forbidden path",
            ErrorKind::Safety => "safety rejection",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Cancelled => "cancelled",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub kind: ErrorKind,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Whether another attempt with corrected arguments may help.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind, ErrorKind::Executor | ErrorKind::Timeout)
    }
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Outcome of one attempt at one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub step_index: u32,
    pub tool: ToolName,
    /// Arguments used for this attempt, after any correction.
    pub arguments: Arguments,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<ToolOutput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    /// 1-based attempt number.
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl StepResult {
    fn from_step(step: &PlanStep, attempt: u32, status: StepStatus, started_at: DateTime<Utc>) -> Self {
        Self {
            step_index: step.step_index,
            tool: step.tool,
            arguments: step.arguments.clone(),
            status,
            output: None,
            error: None,
            attempt,
            started_at,
            finished_at: Utc::now(),
        }
    }

    pub fn succeeded(step: &PlanStep, attempt: u32, output: ToolOutput, started_at: DateTime<Utc>) -> Self {
        Self {
            output: Some(output),
            ..Self::from_step(step, attempt, StepStatus::Succeeded, started_at)
        }
    }

    pub fn failed(step: &PlanStep, attempt: u32, error: ErrorInfo, started_at: DateTime<Utc>) -> Self {
        Self {
            error: Some(error),
            ..Self::from_step(step, attempt, StepStatus::Failed, started_at)
        }
    }

    pub fn skipped(step: &PlanStep, reason: impl Into<String>) -> Self {
        Self {
            error: Some(ErrorInfo::new(ErrorKind::Cancelled, reason)),
            attempt: 0,
            ..Self::from_step(step, 0, StepStatus::Skipped, Utc::now())
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == StepStatus::Succeeded
    }

    /// One-line outcome for reports and prompts.
    pub fn outcome_text(&self) -> String {
        match (&self.status, &self.output, &self.error) {
            (StepStatus::Succeeded, Some(output), _) => output.message.clone(),
            (StepStatus::Succeeded, None, _) => "ok".to_string(),
            (_, _, Some(error)) => error.to_string(),
            (StepStatus::Skipped, _, None) => "skipped".to_string(),
            (StepStatus::Failed, _, None) => "failed".to_string(),
        }
    }
}

/// Overall result of running a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// Every step's final attempt succeeded.
    Succeeded,
    /// Some steps failed terminally, others succeeded.
    PartiallyFailed,
    /// No step succeeded.
    Failed,
    /// The run was stopped before all steps ran.
    Cancelled,
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RunOutcome::Succeeded => "succeeded",
            RunOutcome::PartiallyFailed => "partially failed",
            RunOutcome::Failed => "failed",
            RunOutcome::Cancelled => "cancelled",
        };
        f.write_str(label)
    }
}

/// Append-only log of every attempt made while running one plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub task_id: TaskId,
    results: Vec<StepResult>,
    cancelled: bool,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl ExecutionRecord {
    pub fn new(task_id: TaskId) -> Self {
        Self {
            task_id,
            results: Vec::new(),
            cancelled: false,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn push(&mut self, result: StepResult) {
        self.results.push(result);
    }

    pub fn mark_cancelled(&mut self) {
        self.cancelled = true;
    }

    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    /// Every attempt, in the order it happened.
    pub fn results(&self) -> &[StepResult] {
        &self.results
    }

    pub fn attempts_for(&self, step_index: u32) -> Vec<&StepResult> {
        self.results
            .iter()
            .filter(|r| r.step_index == step_index)
            .collect()
    }

    /// The last attempt of each step, in step order.
    pub fn final_results(&self) -> Vec<&StepResult> {
        let mut finals: Vec<&StepResult> = Vec::new();
        for result in &self.results {
            match finals.iter_mut().find(|r| r.step_index == result.step_index) {
                Some(slot) => *slot = result,
                None => finals.push(result),
            }
        }
        finals
    }

    pub fn succeeded_steps(&self) -> usize {
        self.final_results().iter().filter(|r| r.is_success()).count()
    }

    pub fn total_steps(&self) -> usize {
        self.final_results().len()
    }

    pub fn outcome(&self) -> RunOutcome {
        if self.cancelled {
            return RunOutcome::Cancelled;
        }
        let finals = self.final_results();
        let succeeded = finals.iter().filter(|r| r.is_success()).count();
        if succeeded == finals.len() {
            RunOutcome::Succeeded
        } else if succeeded == 0 {
            RunOutcome::Failed
        } else {
            RunOutcome::PartiallyFailed
        }
    }

    /// The final failed attempt of each terminally failed step.
    pub fn terminal_failures(&self) -> Vec<&StepResult> {
        self.final_results()
            .into_iter()
            .filter(|r| r.status == StepStatus::Failed)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(index: u32) -> PlanStep {
        PlanStep::new(index, ToolName::ReadFile, Arguments::new())
    }

    fn fail(index: u32, attempt: u32) -> StepResult {
        StepResult::failed(&step(index), attempt, ErrorInfo::new(ErrorKind::Executor, "boom"), Utc::now())
    }

    fn ok(index: u32, attempt: u32) -> StepResult {
        StepResult::succeeded(&step(index), attempt, ToolOutput::new("done"), Utc::now())
    }

    #[test]
    fn test_final_results_take_last_attempt() {
        let mut record = ExecutionRecord::new(TaskId::new());
        record.push(fail(1, 1));
        record.push(ok(1, 2));
        record.push(fail(2, 1));

        assert_eq!(record.results().len(), 3);
        assert_eq!(record.attempts_for(1).len(), 2);
        let finals = record.final_results();
        assert_eq!(finals.len(), 2);
        assert!(finals[0].is_success());
        assert_eq!(finals[0].attempt, 2);
        assert_eq!(record.outcome(), RunOutcome::PartiallyFailed);
        assert_eq!(record.terminal_failures()[0].step_index, 2);
    }

    #[test]
    fn test_outcomes() {
        let mut record = ExecutionRecord::new(TaskId::new());
        assert_eq!(record.outcome(), RunOutcome::Succeeded);
        record.push(fail(1, 1));
        assert_eq!(record.outcome(), RunOutcome::Failed);
        record.push(StepResult::skipped(&step(2), "cancelled"));
        record.mark_cancelled();
        assert_eq!(record.outcome(), RunOutcome::Cancelled);
    }

    #[test]
    fn test_outcome_text() {
        assert_eq!(ok(1, 1).outcome_text(), "done");
        assert_eq!(fail(1, 1).outcome_text(), "executor error: boom");
        assert!(ErrorInfo::new(ErrorKind::Timeout, "slow").is_retryable());
        assert!(!ErrorInfo::new(ErrorKind::Forbidden, "no").is_retryable());
    }
}
