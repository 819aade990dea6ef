//! Sequential step execution with bounded self-heal.
//!
//! Each step goes through validation, path resolution and dispatch. An
//! executor failure is followed, while attempts remain, by a backoff pause
//! and a correction request to the model; the corrected arguments are
//! re-validated and re-scanned before the next attempt. Every attempt is
//! appended to the [`ExecutionRecord`]. A step that fails terminally does not
//! stop the plan.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::parser::parse_correction;
use super::session::ModelSession;
use crate::config::Config;
use crate::safety::{SafetyGate, SafetyRejection};
use crate::task::{ErrorInfo, ErrorKind, ExecutionRecord, PlanStep, StepResult, TaskPlan};
use crate::tools::{ToolContext, ToolOutput, ToolRegistry};

/// Retry bound and pacing of the self-heal loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts after the first.
    pub max_retries: u32,
    /// Pause before the first retry; doubled for each further one.
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_retries: config.max_retries,
            backoff: config.retry_backoff,
        }
    }

    /// Pause before attempt `next_attempt` (2-based).
    pub fn delay_before(&self, next_attempt: u32) -> Duration {
        let exponent = next_attempt.saturating_sub(2).min(16);
        self.backoff.saturating_mul(1 << exponent)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            backoff: Duration::from_millis(500),
        }
    }
}

pub struct ExecutionEngine {
    registry: Arc<ToolRegistry>,
    gate: Arc<SafetyGate>,
    ctx: ToolContext,
    policy: RetryPolicy,
}

impl ExecutionEngine {
    pub fn new(
        registry: Arc<ToolRegistry>,
        gate: Arc<SafetyGate>,
        ctx: ToolContext,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            registry,
            gate,
            ctx,
            policy,
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub fn context(&self) -> &ToolContext {
        &self.ctx
    }

    /// Run every step of `plan` in order.
    ///
    /// Cancellation is observed only between steps and between attempts;
    /// steps not started by then are recorded as skipped.
    pub async fn run(
        &self,
        plan: &TaskPlan,
        session: &mut ModelSession,
        cancel: &CancellationToken,
    ) -> ExecutionRecord {
        let mut record = ExecutionRecord::new(plan.task_id);
        info!("Executing plan {} ({} steps)", plan.task_id, plan.len());

        for step in plan.steps() {
            if cancel.is_cancelled() {
                info!("Skipping step {}: cancelled", step.step_index);
                record.push(StepResult::skipped(step, "cancelled before the step started"));
                record.mark_cancelled();
                continue;
            }
            self.run_step(step, session, cancel, &mut record).await;
        }

        record.finish();
        info!(
            "Plan {} finished: {} ({}/{} steps succeeded)",
            plan.task_id,
            record.outcome(),
            record.succeeded_steps(),
            plan.len()
        );
        record
    }

    async fn run_step(
        &self,
        step: &PlanStep,
        session: &mut ModelSession,
        cancel: &CancellationToken,
        record: &mut ExecutionRecord,
    ) {
        let mut current = step.clone();
        let mut attempt = 1;

        loop {
            let started_at = Utc::now();
            info!(
                "Step {} attempt {}: {}",
                current.step_index,
                attempt,
                current.call_text()
            );

            let (executed, error) = match self.attempt(&current).await {
                Ok((executed, output)) => {
                    let result = StepResult::succeeded(&executed, attempt, output, started_at);
                    info!("Step {} succeeded: {}", current.step_index, result.outcome_text());
                    record.push(result);
                    return;
                }
                Err(failure) => failure,
            };

            warn!("Step {} attempt {} failed: {}", current.step_index, attempt, error);
            record.push(StepResult::failed(&executed, attempt, error.clone(), started_at));

            if !error.is_retryable() {
                warn!("Step {} failed terminally ({})", current.step_index, error.kind);
                return;
            }
            if attempt > self.policy.max_retries {
                warn!(
                    "Step {} failed after {} attempts: {}",
                    current.step_index, attempt, error.message
                );
                return;
            }
            if cancel.is_cancelled() {
                info!("Step {}: cancelled, not retrying", current.step_index);
                return;
            }

            attempt += 1;
            tokio::time::sleep(self.policy.delay_before(attempt)).await;

            match self.heal(&current, &error, session).await {
                Heal::Corrected(corrected) => current = corrected,
                Heal::Unchanged => {}
                Heal::Rejected(corrected, rejection) => {
                    warn!("Step {}: correction rejected: {}", current.step_index, rejection);
                    record.push(StepResult::failed(
                        &corrected,
                        attempt,
                        ErrorInfo::new(ErrorKind::Safety, rejection.to_string()),
                        Utc::now(),
                    ));
                    return;
                }
            }
        }
    }

    /// One attempt. Both outcomes carry the step as it was dispatched, with
    /// path arguments resolved when resolution got that far.
    async fn attempt(&self, step: &PlanStep) -> Result<(PlanStep, ToolOutput), (PlanStep, ErrorInfo)> {
        if let Err(e) = self.registry.validate(step.tool, &step.arguments) {
            return Err((step.clone(), ErrorInfo::new(ErrorKind::Validation, e.to_string())));
        }
        let Some(tool) = self.registry.get(step.tool) else {
            return Err((
                step.clone(),
                ErrorInfo::new(ErrorKind::Validation, format!("unknown tool '{}'", step.tool)),
            ));
        };

        let resolved = match self.gate.resolve_step(step) {
            Ok(resolved) => resolved,
            Err(SafetyRejection::ForbiddenPath { error, .. }) => {
                return Err((step.clone(), ErrorInfo::new(ErrorKind::Forbidden, error.to_string())));
            }
            Err(other) => {
                return Err((step.clone(), ErrorInfo::new(ErrorKind::Safety, other.to_string())));
            }
        };

        match tool.execute(&resolved.arguments, &self.ctx).await {
            Ok(output) => Ok((resolved, output)),
            Err(e) => {
                let timed_out = e.chain().any(|c| c.is::<tokio::time::error::Elapsed>());
                let kind = if timed_out {
                    ErrorKind::Timeout
                } else {
                    ErrorKind::Executor
                };
                Err((resolved, ErrorInfo::new(kind, format!("{:#}", e))))
            }
        }
    }

    /// Ask the model for corrected arguments.
    async fn heal(&self, step: &PlanStep, error: &ErrorInfo, session: &mut ModelSession) -> Heal {
        info!("Step {}: requesting corrected parameters", step.step_index);
        let reply = match session.correct(step, error).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!("Step {}: correction request failed: {}", step.step_index, e);
                return Heal::Unchanged;
            }
        };

        let arguments = match parse_correction(&reply, step, &self.registry) {
            Ok(arguments) => arguments,
            Err(e) => {
                warn!("Step {}: unusable correction: {}", step.step_index, e.reason);
                return Heal::Unchanged;
            }
        };

        let corrected = step.with_arguments(arguments);
        if let Err(rejection) = self.gate.check_step(&corrected) {
            return Heal::Rejected(corrected, rejection);
        }
        info!("Step {}: corrected to {}", step.step_index, corrected.call_text());
        Heal::Corrected(corrected)
    }
}

enum Heal {
    Corrected(PlanStep),
    /// No usable correction; the same arguments are tried again.
    Unchanged,
    /// The correction itself was blocked; it is recorded but never run.
    Rejected(PlanStep, SafetyRejection),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::scripted::ScriptedClient;
    use crate::safety::{PathResolver, UserDirs};
    use crate::task::{RunOutcome, StepStatus, Task, TaskId};
    use crate::tools::testing::{args, context, MockTool};
    use crate::tools::ToolName;
    use serde_json::json;
    use std::path::Path;

    struct Harness {
        engine: ExecutionEngine,
        client: Arc<ScriptedClient>,
        session: ModelSession,
    }

    fn harness(home: &Path, tools: Vec<Arc<MockTool>>, replies: Vec<&str>) -> Harness {
        let mut registry = ToolRegistry::empty();
        for tool in tools {
            registry.register(tool);
        }
        let ctx = context(home);
        let resolver = PathResolver::from_config(UserDirs::under(home.to_path_buf()), &ctx.config);
        let gate = SafetyGate::new(Arc::new(resolver)).unwrap();
        let policy = RetryPolicy {
            max_retries: 2,
            backoff: Duration::from_millis(1),
        };
        let client = Arc::new(ScriptedClient::new(replies));
        let session = ModelSession::new(client.clone(), "m", "s".into(), 12, Duration::from_secs(5));
        Harness {
            engine: ExecutionEngine::new(Arc::new(registry), Arc::new(gate), ctx, policy),
            client,
            session,
        }
    }

    fn plan(steps: Vec<PlanStep>) -> TaskPlan {
        TaskPlan::new(TaskId::new(), Task::new("test"), None, steps).unwrap()
    }

    fn read(index: u32, path: &str) -> PlanStep {
        PlanStep::new(index, ToolName::ReadFile, args(json!({ "path": path })))
    }

    #[tokio::test]
    async fn test_corrected_retry_yields_two_results() {
        let dir = tempfile::tempdir().unwrap();
        let reader = MockTool::scripted(ToolName::ReadFile, vec![Err("File not found".into())]);
        let lister = MockTool::ok(ToolName::ListFiles);
        let mut h = harness(
            dir.path(),
            vec![reader.clone(), lister.clone()],
            vec![r#"{"params": {"path": "desktop/right.txt"}}"#],
        );
        let plan = plan(vec![
            read(1, "desktop/wrong.txt"),
            PlanStep::new(2, ToolName::ListFiles, args(json!({}))),
        ]);

        let record = h.engine.run(&plan, &mut h.session, &CancellationToken::new()).await;

        let attempts = record.attempts_for(1);
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[0].status, StepStatus::Failed);
        assert_eq!(attempts[0].attempt, 1);
        assert_eq!(attempts[1].status, StepStatus::Succeeded);
        assert_eq!(attempts[1].attempt, 2);
        assert!(attempts[1].arguments["path"].as_str().unwrap().ends_with("right.txt"));
        assert_eq!(lister.invocations(), 1);
        assert_eq!(record.outcome(), RunOutcome::Succeeded);

        let calls = reader.calls();
        let desktop = dir.path().join("Desktop");
        assert_eq!(calls[1]["path"], json!(desktop.join("right.txt").to_string_lossy()));
        assert!(h.client.prompts()[0].contains("File not found"));
    }

    #[tokio::test]
    async fn test_exhausted_retries_continue_with_next_step() {
        let dir = tempfile::tempdir().unwrap();
        let reader = MockTool::failing(ToolName::ReadFile, "disk on fire");
        let lister = MockTool::ok(ToolName::ListFiles);
        // Unusable corrections keep the original arguments.
        let mut h = harness(dir.path(), vec![reader.clone(), lister.clone()], vec!["no idea", "sorry"]);
        let plan = plan(vec![
            read(1, "notes.txt"),
            PlanStep::new(2, ToolName::ListFiles, args(json!({}))),
        ]);

        let record = h.engine.run(&plan, &mut h.session, &CancellationToken::new()).await;

        let attempts = record.attempts_for(1);
        assert_eq!(attempts.len(), 3);
        assert!(attempts.iter().all(|r| r.status == StepStatus::Failed));
        assert_eq!(
            attempts.iter().map(|r| r.attempt).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert_eq!(reader.invocations(), 3);
        assert_eq!(lister.invocations(), 1);
        assert_eq!(h.client.request_count(), 2);
        assert_eq!(record.outcome(), RunOutcome::PartiallyFailed);
    }

    #[tokio::test]
    async fn test_model_failure_during_heal_consumes_attempt() {
        let dir = tempfile::tempdir().unwrap();
        let reader = MockTool::scripted(ToolName::ReadFile, vec![Err("busy".into())]);
        // Script is empty: the correction request fails, same arguments are retried.
        let mut h = harness(dir.path(), vec![reader.clone()], vec![]);

        let record = h
            .engine
            .run(&plan(vec![read(1, "a.txt")]), &mut h.session, &CancellationToken::new())
            .await;

        assert_eq!(record.results().len(), 2);
        assert!(record.results()[1].is_success());
        assert_eq!(reader.calls()[0], reader.calls()[1]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_forbidden_path_is_terminal_without_heal() {
        let dir = tempfile::tempdir().unwrap();
        let reader = MockTool::ok(ToolName::ReadFile);
        let mut h = harness(dir.path(), vec![reader.clone()], vec![]);

        let record = h
            .engine
            .run(
                &plan(vec![read(1, "/etc/shadow"), read(2, "desktop/a.txt")]),
                &mut h.session,
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(record.results().len(), 2);
        let first = &record.results()[0];
        assert_eq!(first.status, StepStatus::Failed);
        assert_eq!(first.error.as_ref().unwrap().kind, ErrorKind::Forbidden);
        assert_eq!(reader.invocations(), 1);
        assert_eq!(h.client.request_count(), 0);
    }

    #[tokio::test]
    async fn test_denylisted_correction_fails_with_safety() {
        let dir = tempfile::tempdir().unwrap();
        let shell = MockTool::failing(ToolName::RunShell, "exit 1");
        let mut h = harness(
            dir.path(),
            vec![shell.clone()],
            vec![r#"{"params": {"command": "shutdown /s /t 0"}}"#],
        );
        let step = PlanStep::new(1, ToolName::RunShell, args(json!({"command": "cleanup.bat"})));

        let record = h.engine.run(&plan(vec![step]), &mut h.session, &CancellationToken::new()).await;

        assert_eq!(record.results().len(), 2);
        let rejected = &record.results()[1];
        assert_eq!(rejected.error.as_ref().unwrap().kind, ErrorKind::Safety);
        assert_eq!(rejected.attempt, 2);
        assert_eq!(rejected.arguments["command"], "shutdown /s /t 0");
        assert_eq!(record.results()[0].arguments["command"], "cleanup.bat");
        assert_eq!(shell.invocations(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_run_skips_remaining_steps() {
        let dir = tempfile::tempdir().unwrap();
        let lister = MockTool::ok(ToolName::ListFiles);
        let mut h = harness(dir.path(), vec![lister.clone()], vec![]);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let steps = vec![
            PlanStep::new(1, ToolName::ListFiles, args(json!({}))),
            PlanStep::new(2, ToolName::ListFiles, args(json!({}))),
        ];
        let record = h.engine.run(&plan(steps), &mut h.session, &cancel).await;

        assert_eq!(record.results().len(), 2);
        assert!(record.results().iter().all(|r| r.status == StepStatus::Skipped));
        assert_eq!(record.outcome(), RunOutcome::Cancelled);
        assert_eq!(lister.invocations(), 0);
    }

    #[test]
    fn test_backoff_doubles() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_before(2), Duration::from_millis(500));
        assert_eq!(policy.delay_before(3), Duration::from_millis(1000));
    }
}
