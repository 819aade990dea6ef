//! The plan / execute / verify cycle.
//!
//! [`Agent::handle`] takes one request through the whole pipeline:
//!
//! 1. the model is asked for a plan and its reply is parsed ([`parser`]);
//!    a reply with no structured content is a conversational answer;
//! 2. the [`SafetyGate`] scans the plan and asks for confirmation;
//! 3. the [`ExecutionEngine`] runs the steps with bounded self-heal;
//! 4. the model judges the run ([`verify`]).
//!
//! Each request gets its own [`ModelSession`], so conversation history never
//! leaks between tasks. Only the registry, the resolver and the
//! configuration are shared, and they are read-only.

pub mod engine;
pub mod parser;
pub mod prompts;
pub mod session;
pub mod verify;

pub use engine::{ExecutionEngine, RetryPolicy};
pub use parser::{PlanParseError, PlanReply};
pub use session::ModelSession;

use std::sync::Arc;

use serde_json::json;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::audit::AuditLog;
use crate::config::Config;
use crate::llm::{LlmClient, LlmError};
use crate::safety::{Confirmer, PathError, PathResolver, SafetyGate, SafetyRejection, UserDirs};
use crate::task::{Task, TaskId, TaskPlan, TaskReport};
use crate::tools::{ToolContext, ToolRegistry};

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("model unavailable: {0}")]
    Model(#[from] LlmError),

    #[error(transparent)]
    Parse(#[from] PlanParseError),

    #[error(transparent)]
    Path(#[from] PathError),

    #[error("invalid command policy: {0}")]
    Policy(#[from] regex::Error),
}

/// Result of one request.
#[derive(Debug)]
pub enum TaskOutcome {
    /// The model answered without proposing any steps.
    Conversation(String),
    /// The plan ran (possibly with failures) and was verified.
    Completed(TaskReport),
    /// The plan was refused before anything ran.
    Rejected {
        plan: TaskPlan,
        rejection: SafetyRejection,
    },
}

pub struct Agent {
    config: Arc<Config>,
    client: Arc<dyn LlmClient>,
    registry: Arc<ToolRegistry>,
    resolver: Arc<PathResolver>,
    gate: Arc<SafetyGate>,
    engine: ExecutionEngine,
    system_prompt: String,
    audit: Option<AuditLog>,
}

impl Agent {
    pub fn new(
        config: Arc<Config>,
        client: Arc<dyn LlmClient>,
        registry: ToolRegistry,
        dirs: UserDirs,
    ) -> Result<Self, AgentError> {
        let registry = Arc::new(registry);
        let resolver = Arc::new(PathResolver::from_config(dirs, &config));
        let gate = Arc::new(SafetyGate::new(resolver.clone())?);
        let ctx = ToolContext::new(config.clone(), resolver.clone());
        let engine = ExecutionEngine::new(
            registry.clone(),
            gate.clone(),
            ctx,
            RetryPolicy::from_config(&config),
        );
        let system_prompt = prompts::system_prompt(
            &registry,
            &prompts::Environment {
                dirs: resolver.dirs(),
                working_dir: &config.working_dir,
                screenshots_dir: &config.screenshots_dir,
            },
        );

        Ok(Self {
            config,
            client,
            registry,
            resolver,
            gate,
            engine,
            system_prompt,
            audit: None,
        })
    }

    /// Every desktop capability, the detected user directories and the
    /// configured model backend.
    pub fn from_config(config: Arc<Config>) -> Result<Self, AgentError> {
        let client = config.llm_client();
        let dirs = UserDirs::detect()?;
        let audit = AuditLog::in_dir(&config.logs_dir);
        Ok(Self::new(config, client, ToolRegistry::desktop(), dirs)?.with_audit(audit))
    }

    pub fn with_audit(mut self, audit: AuditLog) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn resolver(&self) -> &PathResolver {
        &self.resolver
    }

    pub fn provider(&self) -> &str {
        self.client.provider()
    }

    /// A fresh conversation for one task.
    pub fn session(&self) -> ModelSession {
        ModelSession::new(
            self.client.clone(),
            self.config.model.clone(),
            self.system_prompt.clone(),
            self.config.history_window,
            self.config.model_timeout,
        )
    }

    pub async fn check_connection(&self) -> Result<(), LlmError> {
        self.session().check_connection().await
    }

    /// Release process-wide resources such as the browser session.
    pub async fn shutdown(&self) {
        self.engine.context().browser.close().await;
    }

    /// Plan, authorize, execute and verify one request.
    pub async fn handle(
        &self,
        request: &str,
        confirmer: &dyn Confirmer,
        cancel: &CancellationToken,
    ) -> Result<TaskOutcome, AgentError> {
        let task = Task::new(request);
        let task_id = TaskId::new();
        let mut session = self.session();

        info!("Planning task {}: {}", task_id, task);
        let raw = session.plan(&task).await?;
        let plan = match parser::parse_reply(&raw, task_id, &task, &self.registry) {
            Ok(PlanReply::Plan(plan)) => plan,
            Ok(PlanReply::Conversation(text)) => {
                info!("Task {}: conversational reply", task_id);
                return Ok(TaskOutcome::Conversation(text));
            }
            Err(e) => {
                warn!("Task {}: {}", task_id, e);
                return Err(e.into());
            }
        };
        info!("Task {}: plan with {} steps", task_id, plan.len());

        if let Err(rejection) = self.gate.authorize(&plan, confirmer).await {
            self.audit(&json!({
                "task_id": plan.task_id,
                "task": plan.task,
                "plan": plan,
                "rejected": rejection.to_string(),
            }))
            .await;
            return Ok(TaskOutcome::Rejected { plan, rejection });
        }

        let record = self.engine.run(&plan, &mut session, cancel).await;
        let verdict = verify::verify(&mut session, &task, &record).await;
        let report = TaskReport::new(plan, record, verdict);
        self.audit(&report).await;
        Ok(TaskOutcome::Completed(report))
    }

    async fn audit<T: serde::Serialize>(&self, entry: &T) {
        if let Some(audit) = &self.audit {
            if let Err(e) = audit.append(entry).await {
                warn!("Failed to write audit log {}: {:#}", audit.path().display(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::scripted::ScriptedClient;
    use crate::safety::AutoConfirm;
    use crate::task::{RunOutcome, StepStatus};
    use crate::tools::testing::MockTool;
    use crate::tools::ToolName;
    use std::path::Path;

    fn agent(home: &Path, registry: ToolRegistry, replies: Vec<&str>) -> (Agent, Arc<ScriptedClient>) {
        let mut config = Config::new(home.join("atlas_workspace"));
        config.retry_backoff = std::time::Duration::from_millis(1);
        let client = Arc::new(ScriptedClient::new(replies));
        let agent = Agent::new(
            Arc::new(config),
            client.clone(),
            registry,
            UserDirs::under(home.to_path_buf()),
        )
        .unwrap();
        (agent, client)
    }

    #[tokio::test]
    async fn test_hello_file_on_desktop() {
        let dir = tempfile::tempdir().unwrap();
        let logs = dir.path().join("logs");
        let (agent, client) = agent(
            dir.path(),
            ToolRegistry::desktop(),
            vec![
                r#"{"plan":"Create hello.txt","steps":[{"step":1,"description":"write file","tool":"create_text_file","params":{"path":"desktop/hello.txt","content":"Hello"}}]}"#,
                r#"{"success":true,"note":"hello.txt created on the desktop"}"#,
            ],
        );
        let agent = agent.with_audit(AuditLog::in_dir(&logs));

        let outcome = agent
            .handle(
                "create hello.txt on desktop with content Hello",
                &AutoConfirm,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let TaskOutcome::Completed(report) = outcome else {
            panic!("expected a completed task");
        };
        let file = dir.path().join("Desktop").join("hello.txt");
        assert_eq!(std::fs::read_to_string(&file).unwrap(), "Hello");

        let results = report.record.results();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].status, StepStatus::Succeeded);
        assert_eq!(results[0].arguments["path"], &*file.to_string_lossy());
        assert_eq!(report.outcome, RunOutcome::Succeeded);
        assert!(report.verdict.passed);
        assert!(report.is_success());
        assert_eq!(report.tally(), "1/1 steps succeeded");
        assert_eq!(client.request_count(), 2);

        let audit = std::fs::read_to_string(logs.join(crate::audit::AUDIT_FILE_NAME)).unwrap();
        assert_eq!(audit.lines().count(), 1);
    }

    #[tokio::test]
    async fn test_format_command_rejected_with_zero_invocations() {
        let dir = tempfile::tempdir().unwrap();
        let shell = MockTool::ok(ToolName::RunShell);
        let writer = MockTool::ok(ToolName::CreateTextFile);
        let mut registry = ToolRegistry::empty();
        registry.register(shell.clone());
        registry.register(writer.clone());
        let (agent, _client) = agent(
            dir.path(),
            registry,
            vec![
                r#"Plan: {"steps":[{"tool":"create_text_file","params":{"path":"desktop/a.txt","content":"x"}},{"tool":"run_shell","params":{"command":"echo y | format c: /q"}}]}"#,
            ],
        );

        let outcome = agent
            .handle("wipe my disk", &AutoConfirm, &CancellationToken::new())
            .await
            .unwrap();

        match outcome {
            TaskOutcome::Rejected { rejection, plan } => {
                assert!(matches!(rejection, SafetyRejection::DeniedCommand { step_index: 2, .. }));
                assert_eq!(plan.len(), 2);
            }
            other => panic!("expected rejection, got {other:?}"),
        }
        assert_eq!(shell.invocations(), 0);
        assert_eq!(writer.invocations(), 0);
    }

    #[tokio::test]
    async fn test_prose_reply_is_conversation() {
        let dir = tempfile::tempdir().unwrap();
        let (agent, _) = agent(dir.path(), ToolRegistry::desktop(), vec!["I am ATLAS, your desktop agent."]);
        let outcome = agent
            .handle("who are you?", &AutoConfirm, &CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(outcome, TaskOutcome::Conversation(text) if text.contains("ATLAS")));
    }

    #[tokio::test]
    async fn test_invalid_plan_surfaces_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let (agent, _) = agent(
            dir.path(),
            ToolRegistry::desktop(),
            vec![r#"{"steps":[{"tool":"hack_the_planet","params":{}}]}"#],
        );
        let err = agent
            .handle("do something", &AutoConfirm, &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            AgentError::Parse(e) => assert!(e.reason.contains("hack_the_planet")),
            other => panic!("expected parse error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unreachable_model_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let (agent, _) = agent(dir.path(), ToolRegistry::desktop(), vec![]);
        let err = agent
            .handle("anything", &AutoConfirm, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Model(_)));
        assert!(agent.check_connection().await.is_err());
    }

    #[tokio::test]
    async fn test_inconclusive_verification_fails_report() {
        let dir = tempfile::tempdir().unwrap();
        let lister = MockTool::ok(ToolName::ListFiles);
        let mut registry = ToolRegistry::empty();
        registry.register(lister.clone());
        // No verification reply scripted: the request fails.
        let (agent, _) = agent(dir.path(), registry, vec![r#"[{"tool":"list_files"}]"#]);

        let outcome = agent
            .handle("list files", &AutoConfirm, &CancellationToken::new())
            .await
            .unwrap();
        let TaskOutcome::Completed(report) = outcome else {
            panic!("expected a completed task");
        };
        assert_eq!(report.outcome, RunOutcome::Succeeded);
        assert!(!report.verdict.passed);
        assert!(report.verdict.explanation.contains("inconclusive"));
        assert_eq!(lister.invocations(), 1);
    }
}
