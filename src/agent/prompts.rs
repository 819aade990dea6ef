use std::path::Path;

use crate::safety::UserDirs;
use crate::task::{ErrorInfo, ExecutionRecord, PlanStep, Task};
use crate::tools::ToolRegistry;

const VERIFY_SUMMARY_CHARS: usize = 1500;
const OUTCOME_CHARS: usize = 200;

/// Where the agent is running, as shown to the model.
pub struct Environment<'a> {
    pub dirs: &'a UserDirs,
    pub working_dir: &'a Path,
    pub screenshots_dir: &'a Path,
}

pub fn system_prompt(registry: &ToolRegistry, env: &Environment<'_>) -> String {
    format!(
        r#"You are ATLAS, an agent that automates tasks on the user's desktop.
You receive a request, break it into concrete steps, pick one tool per step,
and the steps are executed for you in order.

RULES
1. Plan first. Use the fewest steps that do the job.
2. Use only the tools listed below. Never invent tool names or parameters.
3. Paths may start with desktop/, documents/, downloads/ or home/, or be
   absolute paths inside the directories below. Never guess other paths.
4. Be brief. No filler text.
5. If a step fails you will be shown the error. Answer with corrected
   parameters only.

ENVIRONMENT
Desktop     : {desktop}
Home        : {home}
Documents   : {documents}
Downloads   : {downloads}
Workspace   : {workspace}
Screenshots : {screenshots}

TOOLS
{catalog}
RESPONSE FORMAT
For a task, reply with only this JSON object, no prose and no code fences:
{{"plan":"<short description>","steps":[{{"step":1,"description":"<what>","tool":"<tool_name>","params":{{"<key>":"<value>"}}}}]}}

For a question that needs no tools, reply in plain text, 1-3 sentences.

To correct a failed step, reply with:
{{"params":{{"<key>":"<value>"}}}}

To verify results, reply with:
{{"success":true,"note":"<brief assessment>"}} or {{"success":false,"note":"<what went wrong>"}}

SAFETY
Never run destructive commands (formatting disks, deleting system files,
shutting down or restarting the machine). Such plans are refused."#,
        desktop = env.dirs.desktop.display(),
        home = env.dirs.home.display(),
        documents = env.dirs.documents.display(),
        downloads = env.dirs.downloads.display(),
        workspace = env.working_dir.display(),
        screenshots = env.screenshots_dir.display(),
        catalog = registry.catalog_text(),
    )
}

pub fn plan_prompt(task: &Task) -> String {
    format!(
        "Task: \"{}\"\nRespond ONLY with the JSON plan. No explanation.",
        task
    )
}

pub fn correction_prompt(step: &PlanStep, error: &ErrorInfo) -> String {
    let arguments = serde_json::to_string(&step.arguments).unwrap_or_else(|_| "{}".to_string());
    format!(
        "Step {} failed.\nTool: {}\nSignature: {}\nParams: {}\nError: {}\n\
         Fix the params and respond ONLY with JSON: {{\"params\":{{...}}}}",
        step.step_index,
        step.tool,
        step.tool.signature(),
        arguments,
        error.message,
    )
}

pub fn verification_prompt(task: &Task, record: &ExecutionRecord) -> String {
    let lines: Vec<String> = record
        .final_results()
        .iter()
        .map(|r| {
            let outcome = r.outcome_text();
            let outcome = if outcome.chars().count() > OUTCOME_CHARS {
                format!("{}...", outcome.chars().take(OUTCOME_CHARS).collect::<String>())
            } else {
                outcome
            };
            format!(
                "Step {} ({}, attempt {}): {:?} - {}",
                r.step_index, r.tool, r.attempt, r.status, outcome
            )
        })
        .collect();

    let mut summary = lines.join("\n");
    if summary.chars().count() > VERIFY_SUMMARY_CHARS {
        summary = summary.chars().take(VERIFY_SUMMARY_CHARS).collect();
        summary.push_str("\n...");
    }

    format!(
        "Task: \"{}\"\nResults:\n{}\nDid these steps accomplish the task? \
         Respond ONLY JSON: {{\"success\":true/false,\"note\":\"brief\"}}",
        task, summary
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{ErrorKind, StepResult, TaskId};
    use crate::tools::testing::{args, MockTool};
    use crate::tools::{ToolName, ToolOutput};
    use chrono::Utc;
    use serde_json::json;
    use std::path::PathBuf;

    #[test]
    fn test_system_prompt_lists_environment_and_tools() {
        let mut registry = ToolRegistry::empty();
        registry.register(MockTool::ok(ToolName::CreateTextFile));
        let dirs = UserDirs::under(PathBuf::from("/home/ada"));
        let env = Environment {
            dirs: &dirs,
            working_dir: Path::new("/home/ada/atlas_workspace"),
            screenshots_dir: Path::new("/home/ada/atlas_workspace/screenshots"),
        };

        let prompt = system_prompt(&registry, &env);
        assert!(prompt.contains("/home/ada/Desktop"));
        assert!(prompt.contains("create_text_file(path, content)"));
        assert!(!prompt.contains("read_file"));
        assert!(prompt.contains(r#"{"plan":"<short description>","steps":[{"step":1"#));
    }

    #[test]
    fn test_correction_prompt() {
        let step = PlanStep::new(2, ToolName::ReadFile, args(json!({"path": "desktop/x.txt"})));
        let prompt = correction_prompt(&step, &ErrorInfo::new(ErrorKind::Executor, "File not found"));
        assert!(prompt.contains("Tool: read_file"));
        assert!(prompt.contains(r#"Params: {"path":"desktop/x.txt"}"#));
        assert!(prompt.contains("Error: File not found"));
    }

    #[test]
    fn test_verification_prompt_uses_final_attempts() {
        let step = PlanStep::new(1, ToolName::ReadFile, args(json!({"path": "a"})));
        let mut record = ExecutionRecord::new(TaskId::new());
        record.push(StepResult::failed(&step, 1, ErrorInfo::new(ErrorKind::Executor, "missing"), Utc::now()));
        record.push(StepResult::succeeded(&step, 2, ToolOutput::new("Read 3 chars"), Utc::now()));

        let prompt = verification_prompt(&Task::new("read a"), &record);
        assert!(prompt.contains("Step 1 (read_file, attempt 2): Succeeded - Read 3 chars"));
        assert!(!prompt.contains("missing"));
    }
}
