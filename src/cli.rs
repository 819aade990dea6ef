use std::collections::VecDeque;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::Context;
use async_trait::async_trait;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use atlas_agent::agent::ModelSession;
use atlas_agent::config::LlmProvider;
use atlas_agent::safety::{AutoConfirm, Confirmer, PlanPreview, SafetyRejection};
use atlas_agent::task::{StepStatus, TaskReport};
use atlas_agent::{Agent, AgentError, Config, TaskOutcome};

const REPORT_HISTORY: usize = 10;

#[derive(Debug, Parser)]
#[command(
    name = "atlas",
    version,
    about = "Desktop task agent: plan, execute and verify tasks with a local LLM"
)]
pub struct Cli {
    /// Run a single task and exit
    #[arg(long, short)]
    task: Option<String>,
    /// Model id to use
    #[arg(long, short)]
    model: Option<String>,
    /// Execute plans without asking for confirmation
    #[arg(long, short = 'y')]
    yes: bool,
    /// Directory for outputs, screenshots and logs
    #[arg(long)]
    working_dir: Option<PathBuf>,
    /// Ollama server URL
    #[arg(long)]
    ollama_url: Option<String>,
    #[arg(long, short)]
    verbose: bool,
}

impl Cli {
    pub async fn run(self) -> anyhow::Result<()> {
        let config = self.config()?;
        init_tracing(self.verbose, &config.logs_dir);

        let agent = Agent::from_config(Arc::new(config)).context("Failed to start the agent")?;
        let interrupts = Interrupts::install();
        let confirmer: Box<dyn Confirmer> = if agent.config().auto_confirm {
            Box::new(AutoConfirm)
        } else {
            Box::new(PromptConfirm {
                interrupts: interrupts.clone(),
            })
        };

        let result = match self.task {
            Some(task) => run_once(&agent, confirmer.as_ref(), &interrupts, &task).await,
            None => run_interactive(&agent, confirmer.as_ref(), &interrupts).await,
        };
        agent.shutdown().await;
        result
    }

    fn config(&self) -> anyhow::Result<Config> {
        let working_dir = match &self.working_dir {
            Some(dir) => dir.clone(),
            None => std::env::current_dir().context("Failed to read the current directory")?,
        };
        let mut config = Config::load(working_dir);

        if let Some(dir) = &self.working_dir {
            config.set_working_dir(dir.clone());
        }
        if let Some(model) = &self.model {
            config.model = model.clone();
        }
        if let Some(url) = &self.ollama_url {
            config.provider = LlmProvider::Ollama {
                base_url: url.clone(),
            };
        }
        if self.yes {
            config.auto_confirm = true;
        }

        config
            .ensure_dirs()
            .with_context(|| format!("Failed to create output directories in {}", config.working_dir.display()))?;
        Ok(config)
    }
}

fn init_tracing(verbose: bool, logs_dir: &Path) {
    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    // The console stays quiet unless asked; the file gets everything the filter lets through.
    let console_level = if verbose { LevelFilter::DEBUG } else { LevelFilter::WARN };
    let console = fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(console_level);
    let file = create_log_writer(logs_dir).map(|writer| {
        fmt::layer()
            .with_target(true)
            .with_ansi(false)
            .with_writer(writer)
    });

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file)
        .try_init();
}

fn create_log_writer(logs_dir: &Path) -> Option<Mutex<std::fs::File>> {
    if let Err(err) = std::fs::create_dir_all(logs_dir) {
        eprintln!("failed to create log directory '{}': {}", logs_dir.display(), err);
        return None;
    }
    let file_path = logs_dir.join(format!(
        "atlas_{}.log",
        chrono::Local::now().format("%Y%m%d_%H%M%S")
    ));
    match std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&file_path)
    {
        Ok(file) => Some(Mutex::new(file)),
        Err(err) => {
            eprintln!("failed to open log file '{}': {}", file_path.display(), err);
            None
        }
    }
}

/// Prints the plan and asks `Execute? [Y/n]` on the terminal.
struct PromptConfirm {
    interrupts: Interrupts,
}

#[async_trait]
impl Confirmer for PromptConfirm {
    async fn confirm(&self, preview: &PlanPreview<'_>) -> bool {
        print_plan(preview);
        let answer = read_line("Execute? [Y/n] ").await;
        if self.interrupts.task_cancelled() {
            return false;
        }
        match answer {
            Ok(Some(answer)) => !matches!(answer.trim().to_lowercase().as_str(), "n" | "no" | "nie"),
            // No answer is no consent.
            _ => false,
        }
    }
}

fn print_plan(preview: &PlanPreview<'_>) {
    let plan = preview.plan;
    println!();
    match &plan.summary {
        Some(summary) => println!("Plan: {}", summary),
        None => println!("Plan for: {}", plan.task),
    }
    for step in plan.steps() {
        match &step.description {
            Some(description) => println!("  {}. {}", step.step_index, description),
            None => println!("  {}. {}", step.step_index, step.tool),
        }
        println!("       {}", step.call_text());
    }
    if !preview.warnings.is_empty() {
        println!("Warnings:");
        for warning in preview.warnings {
            println!("  ! {}", warning);
        }
    }
}

/// One line from stdin, `None` on end of input.
async fn read_line(prompt: &str) -> std::io::Result<Option<String>> {
    print!("{}", prompt);
    std::io::stdout().flush()?;
    tokio::task::spawn_blocking(|| {
        let mut line = String::new();
        let read = std::io::stdin().lock().read_line(&mut line)?;
        Ok(if read == 0 { None } else { Some(line) })
    })
    .await
    .map_err(std::io::Error::other)?
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InterruptAction {
    CancelTask,
    Exit,
}

/// Routes Ctrl-C for the whole process: the first press cancels the running
/// task, a press while idle (or a second press) exits.
#[derive(Debug, Clone, Default)]
struct Interrupts {
    running: Arc<Mutex<Option<CancellationToken>>>,
}

impl Interrupts {
    fn install() -> Self {
        let interrupts = Self::default();
        let router = interrupts.clone();
        tokio::spawn(async move {
            while tokio::signal::ctrl_c().await.is_ok() {
                match router.on_interrupt() {
                    InterruptAction::CancelTask => {
                        eprintln!("\nInterrupted, skipping remaining steps (Ctrl-C again to quit)...");
                    }
                    InterruptAction::Exit => {
                        eprintln!();
                        std::process::exit(130);
                    }
                }
            }
        });
        interrupts
    }

    /// Token for a task that starts now.
    fn begin(&self) -> CancellationToken {
        let token = CancellationToken::new();
        if let Ok(mut slot) = self.running.lock() {
            *slot = Some(token.clone());
        }
        token
    }

    fn finish(&self) {
        if let Ok(mut slot) = self.running.lock() {
            *slot = None;
        }
    }

    fn task_cancelled(&self) -> bool {
        self.running
            .lock()
            .ok()
            .and_then(|slot| slot.as_ref().map(CancellationToken::is_cancelled))
            .unwrap_or(false)
    }

    fn on_interrupt(&self) -> InterruptAction {
        let token = self.running.lock().ok().and_then(|slot| slot.clone());
        match token {
            Some(token) if !token.is_cancelled() => {
                token.cancel();
                InterruptAction::CancelTask
            }
            _ => InterruptAction::Exit,
        }
    }
}

async fn check_backend(agent: &Agent) -> anyhow::Result<()> {
    if let Err(e) = agent.check_connection().await {
        let hint = match &agent.config().provider {
            LlmProvider::Ollama { base_url } => format!(
                "Is Ollama running at {}? Start it with `ollama serve` and pull the model with `ollama pull {}`.",
                base_url,
                agent.config().model
            ),
            LlmProvider::OpenRouter { .. } => "Check OPENROUTER_API_KEY and your network connection.".to_string(),
        };
        anyhow::bail!("Model backend unreachable ({}): {}\n{}", agent.provider(), e, hint);
    }
    Ok(())
}

async fn run_once(
    agent: &Agent,
    confirmer: &dyn Confirmer,
    interrupts: &Interrupts,
    task: &str,
) -> anyhow::Result<()> {
    check_backend(agent).await?;

    let cancel = interrupts.begin();
    let outcome = agent.handle(task, confirmer, &cancel).await;
    interrupts.finish();

    match outcome? {
        TaskOutcome::Conversation(text) => {
            println!("{}", text);
            Ok(())
        }
        TaskOutcome::Rejected { rejection, .. } => {
            print_rejection(&rejection);
            anyhow::bail!("Plan rejected: {}", rejection)
        }
        TaskOutcome::Completed(report) => {
            print_report(&report);
            if report.verdict.passed {
                Ok(())
            } else {
                anyhow::bail!("Task not verified: {}", report.verdict.explanation)
            }
        }
    }
}

async fn run_interactive(
    agent: &Agent,
    confirmer: &dyn Confirmer,
    interrupts: &Interrupts,
) -> anyhow::Result<()> {
    print_banner(agent);
    check_backend(agent).await?;
    println!("Model ready. Type a task, or /help for commands.\n");

    let mut reports: VecDeque<TaskReport> = VecDeque::with_capacity(REPORT_HISTORY);
    let mut chat = agent.session();

    loop {
        let line = match read_line("atlas> ").await? {
            Some(line) => line,
            None => break,
        };
        let input = line.trim();
        if input.is_empty() {
            continue;
        }

        let (command, rest) = match input.split_once(char::is_whitespace) {
            Some((command, rest)) => (command, rest.trim()),
            None => (input, ""),
        };
        match command.to_lowercase().as_str() {
            "/exit" | "/quit" | "/q" | "exit" | "quit" => break,
            "/help" => print_help(),
            "/tools" => println!("{}", agent.registry().catalog_text()),
            "/status" => print_status(agent, &reports, &chat),
            "/history" => print_history(&reports),
            "/clear" => {
                chat.clear_history();
                println!("Session history cleared.");
            }
            "/ask" if rest.is_empty() => println!("Usage: /ask <question>"),
            "/ask" => ask(&mut chat, rest).await,
            other if other.starts_with('/') => {
                println!("Unknown command {}. Type /help for commands.", other)
            }
            _ => {
                if let Some(report) = run_task(agent, confirmer, interrupts, input).await {
                    if reports.len() == REPORT_HISTORY {
                        reports.pop_front();
                    }
                    reports.push_back(report);
                }
            }
        }
    }

    println!("Goodbye.");
    Ok(())
}

async fn run_task(
    agent: &Agent,
    confirmer: &dyn Confirmer,
    interrupts: &Interrupts,
    input: &str,
) -> Option<TaskReport> {
    let cancel = interrupts.begin();
    let outcome = agent.handle(input, confirmer, &cancel).await;
    interrupts.finish();

    match outcome {
        Ok(TaskOutcome::Conversation(text)) => {
            println!("{}\n", text);
            None
        }
        Ok(TaskOutcome::Rejected { rejection, .. }) => {
            print_rejection(&rejection);
            None
        }
        Ok(TaskOutcome::Completed(report)) => {
            print_report(&report);
            Some(report)
        }
        Err(AgentError::Parse(e)) => {
            println!("Could not understand the model's plan: {}", e.reason);
            tracing::debug!("Unparsed reply: {}", e.raw_text);
            None
        }
        Err(e) => {
            println!("Error: {}", e);
            None
        }
    }
}

async fn ask(chat: &mut ModelSession, question: &str) {
    match chat.converse(question).await {
        Ok(answer) => println!("{}\n", answer.trim()),
        Err(e) => println!("Error: {}", e),
    }
}

fn print_rejection(rejection: &SafetyRejection) {
    match rejection {
        SafetyRejection::UserDeclined => println!("Cancelled. Nothing was executed."),
        other => println!("Plan blocked: {}. Nothing was executed.", other),
    }
}

fn print_report(report: &TaskReport) {
    println!();
    for result in report.record.final_results() {
        let mark = match result.status {
            StepStatus::Succeeded => "[ok]  ",
            StepStatus::Failed => "[fail]",
            StepStatus::Skipped => "[skip]",
        };
        let retries = if result.attempt > 1 {
            format!(" (attempt {})", result.attempt)
        } else {
            String::new()
        };
        println!(
            "  {} Step {} {}{}: {}",
            mark,
            result.step_index,
            result.tool,
            retries,
            result.outcome_text()
        );
    }
    println!("{} ({})", report.tally(), report.outcome);

    for failure in report.record.terminal_failures() {
        println!(
            "Task '{}' failed at step {} ({}): {}",
            report.task,
            failure.step_index,
            failure.tool,
            failure.outcome_text()
        );
    }

    let verdict = if report.verdict.passed { "PASSED" } else { "FAILED" };
    println!("Verification {}: {}\n", verdict, report.verdict.explanation);
}

fn print_banner(agent: &Agent) {
    let config = agent.config();
    println!("ATLAS {} - desktop task agent", env!("CARGO_PKG_VERSION"));
    println!("  model:       {} ({})", config.model, agent.provider());
    println!("  working dir: {}", config.working_dir.display());
    println!("  tools:       {}", agent.registry().len());
    println!("Checking model backend...");
}

fn print_help() {
    println!(
        "Type a task in plain language, for example:\n  \
         create hello.txt on the desktop with content Hello\n\n\
         Commands:\n  \
         /help          this message\n  \
         /tools         list available tools\n  \
         /status        model, directories and session state\n  \
         /history       last {} task reports\n  \
         /ask <text>    ask a question without running anything\n  \
         /clear         forget the conversation history\n  \
         /exit          quit (also /quit, /q, exit, quit)\n",
        REPORT_HISTORY
    );
}

fn print_status(agent: &Agent, reports: &VecDeque<TaskReport>, chat: &ModelSession) {
    let config = agent.config();
    let verified = reports.iter().filter(|r| r.is_success()).count();
    println!("Model:        {} via {}", config.model, agent.provider());
    println!("Working dir:  {}", config.working_dir.display());
    println!("Screenshots:  {}", config.screenshots_dir.display());
    println!("Logs:         {}", config.logs_dir.display());
    println!("Allowed:      {}", format_roots(agent.resolver().allowed_roots()));
    println!("Retries:      {} per step", config.max_retries);
    println!("Confirmation: {}", if config.auto_confirm { "off" } else { "on" });
    println!("Tasks:        {} run, {} verified", reports.len(), verified);
    println!("History:      {} messages\n", chat.history().count());
}

fn format_roots(roots: &[PathBuf]) -> String {
    roots
        .iter()
        .map(|root| root.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

fn print_history(reports: &VecDeque<TaskReport>) {
    if reports.is_empty() {
        println!("No tasks run yet.");
        return;
    }
    for report in reports {
        println!(
            "{} [{}] {} - {}, {}",
            report.created_at.with_timezone(&chrono::Local).format("%H:%M:%S"),
            if report.is_success() { "ok" } else { "failed" },
            report.task,
            report.tally(),
            report.verdict.explanation
        );
    }
    println!();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interrupt_cancels_running_task_then_exits() {
        let interrupts = Interrupts::default();
        assert_eq!(interrupts.on_interrupt(), InterruptAction::Exit);

        let token = interrupts.begin();
        assert!(!interrupts.task_cancelled());
        assert_eq!(interrupts.on_interrupt(), InterruptAction::CancelTask);
        assert!(token.is_cancelled());
        assert!(interrupts.task_cancelled());
        assert_eq!(interrupts.on_interrupt(), InterruptAction::Exit);
    }

    #[test]
    fn test_interrupt_after_task_finished_exits() {
        let interrupts = Interrupts::default();
        let token = interrupts.begin();
        interrupts.finish();
        assert_eq!(interrupts.on_interrupt(), InterruptAction::Exit);
        assert!(!token.is_cancelled());
        assert!(!interrupts.task_cancelled());
    }
}
