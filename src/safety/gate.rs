//! Pre-execution checks: the destructive-command denylist, path policy and
//! user confirmation.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};

use super::path::{PathError, PathResolver};
use crate::task::{PlanStep, TaskPlan};
use crate::tools::{ParamKind, ToolName};

/// Destructive command patterns, matched case-insensitively anywhere in the
/// command text.
const DENIED_COMMANDS: &[(&str, &str)] = &[
    (r"\bformat(\.com)?\s+[a-z]:", "format drive"),
    (r"\bformat-volume\b", "format drive"),
    // cmd: switches before or after a drive root ("C:", "C:\", "C:\*", "C:\*.*").
    (
        r#"\b(del|erase|rd|rmdir)\s+(/[a-z]\s+)*/s\s+(/[a-z]\s+)*["']?[a-z]:[\\/]?\*?(\.\*)?["']?(\s|$|[;&|])"#,
        "recursive delete of a drive",
    ),
    (
        r#"\b(del|erase|rd|rmdir)\s+([^;&|]*\s)?["']?[a-z]:[\\/]?\*?(\.\*)?["']?\s[^;&|]*/s\b"#,
        "recursive delete of a drive",
    ),
    // PowerShell: -Recurse before or after a drive root.
    (
        r#"\bremove-item\b[^;&|]*\s["']?[a-z]:[\\/]?\*?["']?\s[^;&|]*-r(ecurse)?\b"#,
        "recursive delete of a drive",
    ),
    (
        r#"\bremove-item\b[^;&|]*\s-r(ecurse)?\b[^;&|]*\s["']?[a-z]:[\\/]?\*?["']?(\s|$|[;&|])"#,
        "recursive delete of a drive",
    ),
    // rm with a recursive flag (short, bundled or long, any order) aimed at "/".
    (
        r"\brm\s+(--?[a-z-]+\s+)*(--recursive|-[a-z]*r[a-z]*)\s+(--?[a-z-]+\s+)*/\*?(\s|$|[;&|])",
        "recursive forced removal of root",
    ),
    (r"--no-preserve-root", "recursive forced removal of root"),
    (r"\bshutdown\b", "shutdown"),
    (r"\bstop-computer\b", "shutdown"),
    (r"\bpoweroff\b", "shutdown"),
    (r"\bhalt\b", "shutdown"),
    (r"\breboot\b", "restart"),
    (r"\brestart-computer\b", "restart"),
    (r"\bmkfs(\.[a-z0-9]+)?\b", "format drive"),
    (r"\bdd\b[^;&|]*\bof=/dev/", "raw disk write"),
    (r"\b(clear-disk|diskpart)\b", "disk partitioning"),
    (r":\(\)\s*\{\s*:\s*\|\s*:\s*&\s*\}\s*;\s*:", "fork bomb"),
];

/// A compiled denylist of command patterns.
#[derive(Debug, Clone)]
pub struct CommandPolicy {
    patterns: Vec<(Regex, String)>,
}

impl CommandPolicy {
    pub fn new<'a>(patterns: impl IntoIterator<Item = (&'a str, &'a str)>) -> Result<Self, regex::Error> {
        let patterns = patterns
            .into_iter()
            .map(|(pattern, label)| Ok((Regex::new(&format!("(?i){}", pattern))?, label.to_string())))
            .collect::<Result<Vec<_>, regex::Error>>()?;
        Ok(Self { patterns })
    }

    /// The built-in denylist.
    pub fn standard() -> Result<Self, regex::Error> {
        Self::new(DENIED_COMMANDS.iter().copied())
    }

    /// Label of the first pattern the command matches.
    pub fn scan(&self, command: &str) -> Option<&str> {
        self.patterns
            .iter()
            .find(|(re, _)| re.is_match(command))
            .map(|(_, label)| label.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SafetyRejection {
    #[error("step {step_index} ({tool}) contains a blocked command ({pattern})")]
    DeniedCommand {
        step_index: u32,
        tool: ToolName,
        pattern: String,
    },

    #[error("step {step_index} ({tool}): {error}")]
    ForbiddenPath {
        step_index: u32,
        tool: ToolName,
        error: PathError,
    },

    #[error("execution declined by the user")]
    UserDeclined,
}

/// A path argument that will fail when its step runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathWarning {
    pub step_index: u32,
    pub param: String,
    pub error: PathError,
}

impl fmt::Display for PathWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "step {} '{}': {}", self.step_index, self.param, self.error)
    }
}

/// What the user is asked to approve.
#[derive(Debug, Clone, Copy)]
pub struct PlanPreview<'a> {
    pub plan: &'a TaskPlan,
    pub warnings: &'a [PathWarning],
}

/// Asks the user whether a plan may run.
#[async_trait]
pub trait Confirmer: Send + Sync {
    async fn confirm(&self, preview: &PlanPreview<'_>) -> bool;
}

/// Approves every plan (`--yes`).
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoConfirm;

#[async_trait]
impl Confirmer for AutoConfirm {
    async fn confirm(&self, _preview: &PlanPreview<'_>) -> bool {
        true
    }
}

/// A plan that passed the gate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Authorization {
    pub warnings: Vec<PathWarning>,
}

pub struct SafetyGate {
    policy: CommandPolicy,
    resolver: Arc<PathResolver>,
}

impl SafetyGate {
    pub fn new(resolver: Arc<PathResolver>) -> Result<Self, regex::Error> {
        Ok(Self::with_policy(CommandPolicy::standard()?, resolver))
    }

    pub fn with_policy(policy: CommandPolicy, resolver: Arc<PathResolver>) -> Self {
        Self { policy, resolver }
    }

    pub fn resolver(&self) -> &PathResolver {
        &self.resolver
    }

    /// Scan the command-bearing arguments of one step.
    pub fn check_step(&self, step: &PlanStep) -> Result<(), SafetyRejection> {
        for spec in step.tool.parameters().iter().filter(|p| p.kind == ParamKind::Command) {
            let Some(command) = step.arguments.get(spec.name).and_then(Value::as_str) else {
                continue;
            };
            if let Some(label) = self.policy.scan(command) {
                return Err(SafetyRejection::DeniedCommand {
                    step_index: step.step_index,
                    tool: step.tool,
                    pattern: label.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Scan every step. One match rejects the whole plan.
    pub fn scan(&self, plan: &TaskPlan) -> Result<(), SafetyRejection> {
        plan.steps().iter().try_for_each(|step| self.check_step(step))
    }

    /// Path arguments that resolve to forbidden locations.
    pub fn path_warnings(&self, plan: &TaskPlan) -> Vec<PathWarning> {
        let mut warnings = Vec::new();
        for step in plan.steps() {
            for spec in step.tool.parameters().iter().filter(|p| p.kind == ParamKind::Path) {
                let Some(raw) = step.arguments.get(spec.name).and_then(Value::as_str) else {
                    continue;
                };
                if let Err(error) = self.resolver.resolve(raw) {
                    warnings.push(PathWarning {
                        step_index: step.step_index,
                        param: spec.name.to_string(),
                        error,
                    });
                }
            }
        }
        warnings
    }

    /// Copy of `step` with every path argument resolved to an absolute path.
    pub fn resolve_step(&self, step: &PlanStep) -> Result<PlanStep, SafetyRejection> {
        let mut arguments = step.arguments.clone();
        for spec in step.tool.parameters().iter().filter(|p| p.kind == ParamKind::Path) {
            let Some(raw) = arguments.get(spec.name).and_then(Value::as_str) else {
                continue;
            };
            let resolved = self
                .resolver
                .resolve(raw)
                .map_err(|error| SafetyRejection::ForbiddenPath {
                    step_index: step.step_index,
                    tool: step.tool,
                    error,
                })?;
            arguments.insert(
                spec.name.to_string(),
                Value::String(resolved.to_string_lossy().into_owned()),
            );
        }
        Ok(step.with_arguments(arguments))
    }

    /// Denylist scan, then user confirmation. Nothing runs unless both pass.
    pub async fn authorize(
        &self,
        plan: &TaskPlan,
        confirmer: &dyn Confirmer,
    ) -> Result<Authorization, SafetyRejection> {
        if let Err(rejection) = self.scan(plan) {
            warn!("Plan {} rejected: {}", plan.task_id, rejection);
            return Err(rejection);
        }

        let warnings = self.path_warnings(plan);
        for warning in &warnings {
            warn!("Plan {}: {}", plan.task_id, warning);
        }

        let preview = PlanPreview {
            plan,
            warnings: &warnings,
        };
        if !confirmer.confirm(&preview).await {
            info!("Plan {} declined", plan.task_id);
            return Err(SafetyRejection::UserDeclined);
        }

        info!("Plan {} authorized ({} steps)", plan.task_id, plan.len());
        Ok(Authorization { warnings })
    }
}
