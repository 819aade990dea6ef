use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::tools::{Arguments, ToolName, ValidationError};

/// Unique identifier of one plan/execute/verify cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The user's request, as submitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Task(String);

impl Task {
    pub fn new(text: impl Into<String>) -> Self {
        Self(text.into().trim().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One tool invocation of a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    pub step_index: u32,
    pub tool: ToolName,
    pub arguments: Arguments,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl PlanStep {
    pub fn new(step_index: u32, tool: ToolName, arguments: Arguments) -> Self {
        Self {
            step_index,
            tool,
            arguments,
            description: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        let description = description.into();
        self.description = Some(description).filter(|d| !d.trim().is_empty());
        self
    }

    /// Same step with replacement arguments. Tool and index are kept.
    pub fn with_arguments(&self, arguments: Arguments) -> Self {
        Self {
            arguments,
            ..self.clone()
        }
    }

    pub fn arg_str(&self, name: &str) -> Option<&str> {
        self.arguments.get(name).and_then(Value::as_str)
    }

    /// `tool(key=value, ...)` with long values shortened.
    pub fn call_text(&self) -> String {
        let args: Vec<String> = self
            .arguments
            .iter()
            .map(|(k, v)| {
                let text = match v {
                    Value::String(s) => format!("{:?}", s),
                    other => other.to_string(),
                };
                let text = if text.chars().count() > 60 {
                    format!("{}...", text.chars().take(57).collect::<String>())
                } else {
                    text
                };
                format!("{}={}", k, text)
            })
            .collect();
        format!("{}({})", self.tool, args.join(", "))
    }
}

/// An ordered, linear sequence of steps for one task.
///
/// Step indices are strictly increasing; construction enforces it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskPlan {
    pub task_id: TaskId,
    pub task: Task,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    steps: Vec<PlanStep>,
}

impl TaskPlan {
    pub fn new(
        task_id: TaskId,
        task: Task,
        summary: Option<String>,
        steps: Vec<PlanStep>,
    ) -> Result<Self, ValidationError> {
        for pair in steps.windows(2) {
            if pair[1].step_index <= pair[0].step_index {
                return Err(ValidationError::NonIncreasingStepIndex {
                    previous: pair[0].step_index,
                    index: pair[1].step_index,
                });
            }
        }
        Ok(Self {
            task_id,
            task,
            summary: summary.filter(|s| !s.trim().is_empty()),
            steps,
        })
    }

    pub fn steps(&self) -> &[PlanStep] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::testing::args;
    use serde_json::json;

    fn step(index: u32) -> PlanStep {
        PlanStep::new(index, ToolName::ListFiles, Arguments::new())
    }

    #[test]
    fn test_plan_requires_increasing_indices() {
        let plan = TaskPlan::new(TaskId::new(), Task::new(" list "), None, vec![step(1), step(3)]).unwrap();
        assert_eq!(plan.len(), 2);
        assert_eq!(plan.task.as_str(), "list");

        assert_eq!(
            TaskPlan::new(TaskId::new(), Task::new("x"), None, vec![step(2), step(2)]),
            Err(ValidationError::NonIncreasingStepIndex { previous: 2, index: 2 })
        );
    }

    #[test]
    fn test_with_arguments_keeps_identity() {
        let original = PlanStep::new(4, ToolName::ReadFile, args(json!({"path": "a.txt"})))
            .with_description("read it");
        let fixed = original.with_arguments(args(json!({"path": "b.txt"})));
        assert_eq!(fixed.tool, ToolName::ReadFile);
        assert_eq!(fixed.step_index, 4);
        assert_eq!(fixed.arg_str("path"), Some("b.txt"));
        assert_eq!(fixed.description.as_deref(), Some("read it"));
    }

    #[test]
    fn test_call_text() {
        let s = PlanStep::new(1, ToolName::CreateTextFile, args(json!({"path": "desktop/a.txt", "content": "x".repeat(100)})));
        let text = s.call_text();
        assert!(text.starts_with("create_text_file(path=\"desktop/a.txt\", content=\"xxx"));
        assert!(text.ends_with("...)"));
    }

    #[test]
    fn test_step_serializes_tool_name() {
        let value = serde_json::to_value(step(1)).unwrap();
        assert_eq!(value["tool"], "list_files");
        assert!(value.get("description").is_none());
    }
}
