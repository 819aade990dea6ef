use chrono::{DateTime, Utc};
use serde::Serialize;

use super::{ExecutionRecord, RunOutcome, Task, TaskId, TaskPlan, VerificationVerdict};

/// One completed cycle, as shown to the user and written to the audit log.
#[derive(Debug, Clone, Serialize)]
pub struct TaskReport {
    pub task_id: TaskId,
    pub task: Task,
    pub plan: TaskPlan,
    pub record: ExecutionRecord,
    pub outcome: RunOutcome,
    pub verdict: VerificationVerdict,
    pub created_at: DateTime<Utc>,
}

impl TaskReport {
    pub fn new(plan: TaskPlan, record: ExecutionRecord, verdict: VerificationVerdict) -> Self {
        Self {
            task_id: plan.task_id,
            task: plan.task.clone(),
            outcome: record.outcome(),
            plan,
            record,
            verdict,
            created_at: Utc::now(),
        }
    }

    /// Succeeded and judged to have done what was asked.
    pub fn is_success(&self) -> bool {
        self.outcome == RunOutcome::Succeeded && self.verdict.passed
    }

    /// `"n/m steps succeeded"`.
    pub fn tally(&self) -> String {
        format!(
            "{}/{} steps succeeded",
            self.record.succeeded_steps(),
            self.plan.len()
        )
    }
}
