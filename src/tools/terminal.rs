//! Shell execution and host information.
//!
//! Commands run in the working directory with a timeout. A non-zero exit
//! status is a step failure carrying the command's stderr, so the repair
//! loop sees what went wrong.

use std::path::Path;
use std::process::{Output, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use sysinfo::System;
use tokio::process::Command;

use super::{opt_int_arg, str_arg, Arguments, Tool, ToolContext, ToolName, ToolOutput};

const MAX_OUTPUT_CHARS: usize = 10_000;

/// Make command output safe to show to the model.
/// Mostly-binary output is replaced with a short notice.
fn sanitize_output(bytes: &[u8]) -> String {
    let non_printable_count = bytes
        .iter()
        .filter(|&&b| b < 0x20 && b != b'\n' && b != b'\r' && b != b'\t')
        .count();

    if bytes.len() > 100 && non_printable_count > bytes.len() / 10 {
        return format!(
            "[Binary output detected - {} bytes, {}% non-printable]",
            bytes.len(),
            non_printable_count * 100 / bytes.len()
        );
    }

    let text = String::from_utf8_lossy(bytes);
    text.chars()
        .filter(|&c| c == '\n' || c == '\r' || c == '\t' || (c >= ' ' && c != '\u{FFFD}'))
        .collect::<String>()
        .trim_end()
        .to_string()
}

fn truncate(mut text: String) -> String {
    if text.chars().count() > MAX_OUTPUT_CHARS {
        text = text.chars().take(MAX_OUTPUT_CHARS).collect();
        text.push_str("\n... [output truncated]");
    }
    text
}

fn timeout_from(args: &Arguments, ctx: &ToolContext) -> Duration {
    match opt_int_arg(args, "timeout") {
        Some(secs) if secs > 0 => Duration::from_secs(secs as u64),
        _ => ctx.config.shell_timeout,
    }
}

/// Spawn `program args` in `cwd`, wait at most `timeout`.
pub(crate) async fn run_process(
    program: &str,
    args: &[&str],
    cwd: Option<&Path>,
    timeout: Duration,
) -> anyhow::Result<Output> {
    let mut cmd = Command::new(program);
    cmd.args(args);
    if let Some(cwd) = cwd {
        cmd.current_dir(cwd);
    }
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = cmd
        .spawn()
        .map_err(|e| anyhow::anyhow!("Failed to execute {}: {}", program, e))?;

    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(e)) => Err(anyhow::anyhow!("Failed to execute {}: {}", program, e)),
        Err(elapsed) => Err(anyhow::Error::new(elapsed).context(format!(
            "Command timed out after {} seconds",
            timeout.as_secs_f64()
        ))),
    }
}

/// Run a platform helper program and require success.
pub(crate) async fn run_helper(program: &str, args: &[&str], timeout: Duration) -> anyhow::Result<String> {
    let output = run_process(program, args, None, timeout).await?;
    let stdout = sanitize_output(&output.stdout);
    if output.status.success() {
        Ok(stdout)
    } else {
        let stderr = sanitize_output(&output.stderr);
        Err(anyhow::anyhow!(
            "{} failed (exit {}): {}",
            program,
            output.status.code().unwrap_or(-1),
            if stderr.is_empty() { stdout } else { stderr }
        ))
    }
}

/// Turn process output into a tool result. Non-zero exit is an error.
fn command_result(command: &str, output: Output) -> anyhow::Result<ToolOutput> {
    let stdout = sanitize_output(&output.stdout);
    let stderr = sanitize_output(&output.stderr);
    let exit_code = output.status.code().unwrap_or(-1);

    tracing::debug!(
        "Command completed: exit={}, stdout_len={}, stderr_len={}",
        exit_code,
        stdout.len(),
        stderr.len()
    );

    if !output.status.success() {
        let detail = if stderr.is_empty() { &stdout } else { &stderr };
        return Err(anyhow::anyhow!(
            "Command exited with code {}: {}",
            exit_code,
            truncate(detail.clone())
        ));
    }

    let message = if stdout.is_empty() {
        format!("Command succeeded: {}", command)
    } else {
        truncate(stdout.clone())
    };
    Ok(ToolOutput::new(message).with_data(json!({
        "exit_code": exit_code,
        "stdout": truncate(stdout),
        "stderr": truncate(stderr),
    })))
}

async fn run_in_workspace(
    program: &str,
    args: &[&str],
    command: &str,
    timeout: Duration,
    ctx: &ToolContext,
) -> anyhow::Result<ToolOutput> {
    let cwd = &ctx.config.working_dir;
    tokio::fs::create_dir_all(cwd).await?;
    tracing::info!("Executing command in {:?}: {}", cwd, command);
    let output = run_process(program, args, Some(cwd), timeout).await?;
    command_result(command, output)
}

/// Run a command through the platform shell.
pub struct RunShell;

#[async_trait]
impl Tool for RunShell {
    fn name(&self) -> ToolName {
        ToolName::RunShell
    }

    async fn execute(&self, args: &Arguments, ctx: &ToolContext) -> anyhow::Result<ToolOutput> {
        let command = str_arg(args, "command")?;
        let timeout = timeout_from(args, ctx);
        let (shell, flag) = if cfg!(target_os = "windows") {
            ("cmd", "/C")
        } else {
            ("/bin/sh", "-c")
        };
        run_in_workspace(shell, &[flag, command], command, timeout, ctx).await
    }
}

/// Run a command through PowerShell without loading a profile.
pub struct RunPowershell;

#[async_trait]
impl Tool for RunPowershell {
    fn name(&self) -> ToolName {
        ToolName::RunPowershell
    }

    async fn execute(&self, args: &Arguments, ctx: &ToolContext) -> anyhow::Result<ToolOutput> {
        let command = str_arg(args, "command")?;
        let timeout = timeout_from(args, ctx);
        // PowerShell Core is `pwsh` outside Windows.
        let program = if cfg!(target_os = "windows") {
            "powershell"
        } else {
            "pwsh"
        };
        run_in_workspace(program, &["-NoProfile", "-Command", command], command, timeout, ctx).await
    }
}

/// Report platform, user folders, CPU and memory.
pub struct GetSystemInfo;

#[async_trait]
impl Tool for GetSystemInfo {
    fn name(&self) -> ToolName {
        ToolName::GetSystemInfo
    }

    async fn execute(&self, _args: &Arguments, ctx: &ToolContext) -> anyhow::Result<ToolOutput> {
        let (cores, cpu_percent, total, used) = tokio::task::spawn_blocking(|| {
            let mut sys = System::new();
            sys.refresh_memory();
            sys.refresh_cpu_usage();
            std::thread::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL);
            sys.refresh_cpu_usage();
            (
                sys.cpus().len(),
                sys.global_cpu_usage(),
                sys.total_memory(),
                sys.used_memory(),
            )
        })
        .await?;

        const GIB: f64 = 1024.0 * 1024.0 * 1024.0;
        let platform = format!(
            "{} {}",
            System::name().unwrap_or_else(|| std::env::consts::OS.to_string()),
            System::os_version().unwrap_or_default()
        );
        let user = std::env::var("USER")
            .or_else(|_| std::env::var("USERNAME"))
            .unwrap_or_else(|_| "unknown".to_string());
        let dirs = ctx.resolver.dirs();

        let info = json!({
            "platform": platform.trim(),
            "host": System::host_name(),
            "user": user,
            "home": dirs.home,
            "desktop": dirs.desktop,
            "workspace": ctx.config.working_dir,
            "cpu_cores": cores,
            "cpu_percent": (cpu_percent * 10.0).round() / 10.0,
            "ram_total_gb": (total as f64 / GIB * 10.0).round() / 10.0,
            "ram_used_gb": (used as f64 / GIB * 10.0).round() / 10.0,
        });

        let message = format!(
            "{} | {} cores at {:.1}% | RAM {:.1}/{:.1} GB",
            platform.trim(),
            cores,
            cpu_percent,
            used as f64 / GIB,
            total as f64 / GIB
        );
        Ok(ToolOutput::new(message).with_data(info))
    }
}
