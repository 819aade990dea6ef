//! Capability registry and the executors behind it.
//!
//! Every capability is a [`Tool`] registered under a [`ToolName`]. The
//! registry validates argument mappings against the declared
//! [`ParamSpec`]s before anything is dispatched; executors receive arguments
//! that already passed validation, with path parameters made absolute.

mod browser;
mod catalog;
mod chart;
mod document;
mod file_ops;
mod gui;
mod package;
mod screenshot;
mod spreadsheet;
mod terminal;
mod web;

pub use browser::BrowserSession;
pub use catalog::{ParamKind, ParamSpec, ToolName};
pub use spreadsheet::{CellValue, Workbook, Worksheet};

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::config::Config;
use crate::safety::PathResolver;

/// Untyped argument mapping as decoded from the model's output.
pub type Arguments = serde_json::Map<String, Value>;

/// Rejection of a step before it reaches an executor.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("unknown tool '{0}'")]
    UnknownTool(String),

    #[error("{tool} is missing required parameter '{param}'")]
    MissingParameter { tool: ToolName, param: String },

    #[error("{tool} does not accept parameter '{param}'")]
    UnknownParameter { tool: ToolName, param: String },

    #[error("parameter '{param}' of {tool} must be {expected}")]
    InvalidArgument {
        tool: ToolName,
        param: String,
        expected: &'static str,
    },

    #[error("arguments must be an object, got {0}")]
    NotAnObject(String),

    #[error("step index {index} does not follow {previous}")]
    NonIncreasingStepIndex { previous: u32, index: u32 },
}

/// Successful result of one executor call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolOutput {
    pub message: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files_created: Vec<PathBuf>,
}

impl ToolOutput {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    pub fn with_file(mut self, path: PathBuf) -> Self {
        self.files_created.push(path);
        self
    }
}

/// Process-wide state an executor may need.
#[derive(Clone)]
pub struct ToolContext {
    pub config: Arc<Config>,
    pub resolver: Arc<PathResolver>,
    pub browser: Arc<BrowserSession>,
}

impl ToolContext {
    pub fn new(config: Arc<Config>, resolver: Arc<PathResolver>) -> Self {
        let browser = Arc::new(BrowserSession::new(config.webdriver_url.clone()));
        Self {
            config,
            resolver,
            browser,
        }
    }

    /// Absolute form of a path argument.
    pub fn path_arg(&self, args: &Arguments, name: &str) -> anyhow::Result<PathBuf> {
        let raw = str_arg(args, name)?;
        Ok(self.resolver.expand(raw)?)
    }
}

/// A capability the agent can dispatch to.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> ToolName;

    fn description(&self) -> &str {
        self.name().description()
    }

    fn parameters(&self) -> &'static [ParamSpec] {
        self.name().parameters()
    }

    /// Run with validated arguments. Any error is a step failure.
    async fn execute(&self, args: &Arguments, ctx: &ToolContext) -> anyhow::Result<ToolOutput>;
}

/// Fixed mapping from tool name to executor. Immutable once built.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: BTreeMap<ToolName, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Every desktop capability.
    pub fn desktop() -> Self {
        let mut registry = Self::empty();

        registry.register(Arc::new(file_ops::CreateTextFile));
        registry.register(Arc::new(file_ops::ReadFile));
        registry.register(Arc::new(file_ops::EditFile));
        registry.register(Arc::new(file_ops::DeleteFile));
        registry.register(Arc::new(file_ops::ListFiles));
        registry.register(Arc::new(file_ops::CreateDirectory));
        registry.register(Arc::new(file_ops::CopyFile));
        registry.register(Arc::new(file_ops::MoveFile));
        registry.register(Arc::new(file_ops::SearchFiles));
        registry.register(Arc::new(file_ops::AppendToFile));

        registry.register(Arc::new(spreadsheet::CreateExcel));
        registry.register(Arc::new(spreadsheet::EditExcel));
        registry.register(Arc::new(spreadsheet::AddExcelChart));
        registry.register(Arc::new(spreadsheet::ReadExcel));

        registry.register(Arc::new(screenshot::TakeScreenshot));
        registry.register(Arc::new(screenshot::ScreenshotRegion));

        registry.register(Arc::new(web::OpenUrl));
        registry.register(Arc::new(browser::WebFillForm));
        registry.register(Arc::new(browser::WebClick));
        registry.register(Arc::new(web::WebScrape));

        registry.register(Arc::new(terminal::RunShell));
        registry.register(Arc::new(terminal::RunPowershell));
        registry.register(Arc::new(terminal::GetSystemInfo));

        registry.register(Arc::new(gui::MouseClick));
        registry.register(Arc::new(gui::TypeText));
        registry.register(Arc::new(gui::Hotkey));
        registry.register(Arc::new(gui::WaitSeconds));

        registry.register(Arc::new(chart::CreateChart));
        registry.register(Arc::new(document::CreateWordDocument));

        registry
    }

    /// Later registrations under the same name replace earlier ones.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name(), tool);
    }

    pub fn get(&self, name: ToolName) -> Option<Arc<dyn Tool>> {
        self.tools.get(&name).cloned()
    }

    pub fn names(&self) -> impl Iterator<Item = ToolName> + '_ {
        self.tools.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Parse a raw tool name and require that it is registered.
    pub fn lookup(&self, raw: &str) -> Result<ToolName, ValidationError> {
        let name: ToolName = raw.parse()?;
        if self.tools.contains_key(&name) {
            Ok(name)
        } else {
            Err(ValidationError::UnknownTool(raw.trim().to_string()))
        }
    }

    /// Check an argument mapping against the tool's declared parameters.
    ///
    /// Keys must be a subset of the declared names, every required parameter
    /// must be present and non-null, and each value must fit its kind.
    pub fn validate(&self, tool: ToolName, args: &Arguments) -> Result<(), ValidationError> {
        let executor = self
            .tools
            .get(&tool)
            .ok_or_else(|| ValidationError::UnknownTool(tool.to_string()))?;
        let params = executor.parameters();

        for (key, value) in args {
            let spec = params.iter().find(|p| p.name == key).ok_or_else(|| {
                ValidationError::UnknownParameter {
                    tool,
                    param: key.clone(),
                }
            })?;
            if value.is_null() {
                continue;
            }
            if !kind_accepts(spec.kind, value) {
                return Err(ValidationError::InvalidArgument {
                    tool,
                    param: key.clone(),
                    expected: spec.kind.describe(),
                });
            }
        }

        for spec in params.iter().filter(|p| p.required) {
            if args.get(spec.name).map_or(true, Value::is_null) {
                return Err(ValidationError::MissingParameter {
                    tool,
                    param: spec.name.to_string(),
                });
            }
        }

        Ok(())
    }

    /// Grouped tool listing for prompts and the `/tools` command.
    pub fn catalog_text(&self) -> String {
        let mut out = String::new();
        let mut current_group = "";
        for tool in ToolName::ALL.into_iter().filter(|t| self.tools.contains_key(t)) {
            if tool.group() != current_group {
                current_group = tool.group();
                if !out.is_empty() {
                    out.push('\n');
                }
                out.push_str(current_group);
                out.push('\n');
            }
            out.push_str(&format!("  {:<44} {}\n", tool.signature(), tool.description()));
        }
        out
    }
}

fn kind_accepts(kind: ParamKind, value: &Value) -> bool {
    match kind {
        ParamKind::Text => matches!(value, Value::String(_) | Value::Number(_) | Value::Bool(_)),
        ParamKind::Path | ParamKind::Command => {
            value.as_str().map_or(false, |s| !s.trim().is_empty())
        }
        ParamKind::Integer => as_integer(value).is_some(),
        ParamKind::Number => as_number(value).is_some(),
        ParamKind::Boolean => match value {
            Value::Bool(_) => true,
            Value::String(s) => matches!(s.trim().to_lowercase().as_str(), "true" | "false"),
            _ => false,
        },
        ParamKind::Object => value.is_object(),
        ParamKind::List => value.is_array(),
        ParamKind::Any => true,
    }
}

fn as_integer(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub(crate) fn str_arg<'a>(args: &'a Arguments, name: &str) -> anyhow::Result<&'a str> {
    args.get(name)
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow::anyhow!("Missing '{}' argument", name))
}

/// Optional string argument; blank counts as absent.
pub(crate) fn opt_str_arg<'a>(args: &'a Arguments, name: &str) -> Option<&'a str> {
    args.get(name)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// String argument that also accepts numbers and booleans.
pub(crate) fn text_arg(args: &Arguments, name: &str) -> anyhow::Result<String> {
    match args.get(name) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(v @ (Value::Number(_) | Value::Bool(_))) => Ok(v.to_string()),
        _ => Err(anyhow::anyhow!("Missing '{}' argument", name)),
    }
}

pub(crate) fn int_arg(args: &Arguments, name: &str) -> anyhow::Result<i64> {
    args.get(name)
        .and_then(as_integer)
        .ok_or_else(|| anyhow::anyhow!("Missing '{}' argument", name))
}

pub(crate) fn opt_int_arg(args: &Arguments, name: &str) -> Option<i64> {
    args.get(name).and_then(as_integer)
}

pub(crate) fn num_arg(args: &Arguments, name: &str) -> anyhow::Result<f64> {
    args.get(name)
        .and_then(as_number)
        .ok_or_else(|| anyhow::anyhow!("Missing '{}' argument", name))
}

#[cfg(test)]
pub(crate) mod testing {
    //! Recording stand-ins for real executors.

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use super::*;

    /// Replays a fixed sequence of outcomes and records every call.
    pub(crate) struct MockTool {
        name: ToolName,
        outcomes: Mutex<Vec<Result<String, String>>>,
        calls: Mutex<Vec<Arguments>>,
        invocations: AtomicUsize,
    }

    impl MockTool {
        /// Succeeds on every call.
        pub(crate) fn ok(name: ToolName) -> Arc<Self> {
            Self::scripted(name, Vec::new())
        }

        /// Fails on every call with `error`.
        pub(crate) fn failing(name: ToolName, error: &str) -> Arc<Self> {
            Self::scripted(name, vec![Err(error.to_string()); 64])
        }

        /// Plays `outcomes` in order, then succeeds.
        pub(crate) fn scripted(name: ToolName, outcomes: Vec<Result<String, String>>) -> Arc<Self> {
            Arc::new(Self {
                name,
                outcomes: Mutex::new(outcomes.into_iter().rev().collect()),
                calls: Mutex::new(Vec::new()),
                invocations: AtomicUsize::new(0),
            })
        }

        pub(crate) fn invocations(&self) -> usize {
            self.invocations.load(Ordering::SeqCst)
        }

        pub(crate) fn calls(&self) -> Vec<Arguments> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Tool for MockTool {
        fn name(&self) -> ToolName {
            self.name
        }

        async fn execute(&self, args: &Arguments, _ctx: &ToolContext) -> anyhow::Result<ToolOutput> {
            self.invocations.fetch_add(1, Ordering::SeqCst);
            self.calls.lock().unwrap().push(args.clone());
            match self.outcomes.lock().unwrap().pop() {
                Some(Err(e)) => Err(anyhow::anyhow!(e)),
                Some(Ok(message)) => Ok(ToolOutput::new(message)),
                None => Ok(ToolOutput::new(format!("{} done", self.name))),
            }
        }
    }

    /// Context rooted in a temporary home with a working directory inside it.
    pub(crate) fn context(home: &std::path::Path) -> ToolContext {
        use crate::safety::UserDirs;

        let config = Config::new(home.join("atlas_workspace"));
        let resolver = PathResolver::from_config(UserDirs::under(home.to_path_buf()), &config);
        ToolContext::new(Arc::new(config), Arc::new(resolver))
    }

    pub(crate) fn args(value: Value) -> Arguments {
        match value {
            Value::Object(map) => map,
            other => panic!("expected an object, got {other}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::args;
    use super::*;
    use serde_json::json;

    #[test]
    fn test_desktop_registry_covers_every_tool() {
        let registry = ToolRegistry::desktop();
        assert_eq!(registry.len(), ToolName::ALL.len());
        for tool in ToolName::ALL {
            assert_eq!(registry.get(tool).unwrap().name(), tool);
        }
    }

    #[test]
    fn test_lookup_requires_registration() {
        let mut registry = ToolRegistry::empty();
        registry.register(testing::MockTool::ok(ToolName::ReadFile));
        assert_eq!(registry.lookup("READ_FILE").unwrap(), ToolName::ReadFile);
        assert!(matches!(
            registry.lookup("delete_file"),
            Err(ValidationError::UnknownTool(_))
        ));
    }

    #[test]
    fn test_validate_accepts_subset_of_declared_params() {
        let registry = ToolRegistry::desktop();
        registry
            .validate(ToolName::ListFiles, &args(json!({})))
            .unwrap();
        registry
            .validate(
                ToolName::CreateTextFile,
                &args(json!({"path": "desktop/a.txt", "content": "hi"})),
            )
            .unwrap();
        registry
            .validate(
                ToolName::ScreenshotRegion,
                &args(json!({"x": "10", "y": 20.0, "width": 30, "height": 40, "filename": null})),
            )
            .unwrap();
    }

    #[test]
    fn test_validate_rejects_bad_arguments() {
        let registry = ToolRegistry::desktop();

        assert_eq!(
            registry.validate(ToolName::CreateTextFile, &args(json!({"path": "a.txt"}))),
            Err(ValidationError::MissingParameter {
                tool: ToolName::CreateTextFile,
                param: "content".into()
            })
        );
        assert_eq!(
            registry.validate(
                ToolName::ReadFile,
                &args(json!({"path": "a.txt", "encoding": "utf-8"}))
            ),
            Err(ValidationError::UnknownParameter {
                tool: ToolName::ReadFile,
                param: "encoding".into()
            })
        );
        assert!(matches!(
            registry.validate(ToolName::RunShell, &args(json!({"command": "  "}))),
            Err(ValidationError::InvalidArgument { .. })
        ));
        assert!(matches!(
            registry.validate(ToolName::MouseClick, &args(json!({"x": "left", "y": 1}))),
            Err(ValidationError::InvalidArgument { .. })
        ));
        assert!(matches!(
            registry.validate(ToolName::CreateTextFile, &args(json!({"path": null, "content": "x"}))),
            Err(ValidationError::MissingParameter { .. })
        ));
    }

    #[test]
    fn test_catalog_text_groups_tools() {
        let text = ToolRegistry::desktop().catalog_text();
        assert!(text.starts_with("FILE OPERATIONS\n"));
        assert!(text.contains("run_shell(command, timeout?)"));
        assert!(text.contains("WORD DOCUMENTS"));
    }

    #[test]
    fn test_argument_helpers() {
        let a = args(json!({"s": "x", "n": 3, "f": "2.5", "b": true, "blank": " "}));
        assert_eq!(str_arg(&a, "s").unwrap(), "x");
        assert!(str_arg(&a, "n").is_err());
        assert_eq!(text_arg(&a, "n").unwrap(), "3");
        assert_eq!(text_arg(&a, "b").unwrap(), "true");
        assert_eq!(int_arg(&a, "n").unwrap(), 3);
        assert_eq!(num_arg(&a, "f").unwrap(), 2.5);
        assert_eq!(opt_str_arg(&a, "blank"), None);
        assert_eq!(opt_int_arg(&a, "missing"), None);
    }
}
