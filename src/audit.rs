//! Durable trail of task cycles as JSON lines.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Serialize;
use tokio::io::AsyncWriteExt;

pub const AUDIT_FILE_NAME: &str = "atlas_audit.jsonl";

/// Appends one JSON object per line. Entries are never rewritten.
#[derive(Debug, Clone)]
pub struct AuditLog {
    path: PathBuf,
}

impl AuditLog {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// `atlas_audit.jsonl` inside `logs_dir`.
    pub fn in_dir(logs_dir: &Path) -> Self {
        Self::new(logs_dir.join(AUDIT_FILE_NAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn append<T: Serialize>(&self, entry: &T) -> anyhow::Result<()> {
        let mut line = serde_json::to_string(entry).context("Failed to serialize audit entry")?;
        line.push('\n');

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("Failed to open {}", self.path.display()))?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{ExecutionRecord, PlanStep, StepResult, Task, TaskId, TaskPlan, TaskReport, VerificationVerdict};
    use crate::tools::{Arguments, ToolName, ToolOutput};
    use chrono::Utc;
    use serde_json::Value;

    fn report() -> TaskReport {
        let step = PlanStep::new(1, ToolName::ListFiles, Arguments::new());
        let plan = TaskPlan::new(TaskId::new(), Task::new("list desktop"), None, vec![step.clone()]).unwrap();
        let mut record = ExecutionRecord::new(plan.task_id);
        record.push(StepResult::succeeded(&step, 1, ToolOutput::new("3 entries"), Utc::now()));
        record.finish();
        TaskReport::new(plan, record, VerificationVerdict::passed("listed"))
    }

    #[tokio::test]
    async fn test_appends_one_line_per_entry() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::in_dir(&dir.path().join("logs"));

        tokio_test::assert_ok!(log.append(&report()).await);
        tokio_test::assert_ok!(log.append(&report()).await);

        let text = std::fs::read_to_string(log.path()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);

        let entry: Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(entry["task"], "list desktop");
        assert_eq!(entry["outcome"], "succeeded");
        assert_eq!(entry["verdict"]["passed"], true);
        assert_eq!(entry["record"]["results"][0]["tool"], "list_files");
        assert_eq!(entry["record"]["results"][0]["status"], "succeeded");
    }
}
