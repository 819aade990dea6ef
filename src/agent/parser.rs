//! Recovery of structured plans from free-form model output.
//!
//! The pipeline is a sequence of small stages, each usable on its own:
//! [`strip_fences`] → [`locate_structured`] → [`decode`] (falling back to
//! [`normalize`] once) → [`interpret_plan`] / [`interpret_correction`].
//! A plan either validates completely against the registry or is rejected;
//! partially valid plans are never returned.

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::task::{PlanStep, Task, TaskId, TaskPlan};
use crate::tools::{Arguments, ToolName, ToolRegistry, ValidationError};

const TOOL_KEYS: &[&str] = &["tool", "tool_name", "name", "action"];
const ARGUMENT_KEYS: &[&str] = &["params", "arguments", "args", "parameters"];
const INDEX_KEYS: &[&str] = &["step", "step_index", "index"];
const DESCRIPTION_KEYS: &[&str] = &["description", "desc"];

/// Model output that could not be turned into a valid plan or correction.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("could not parse model output: {reason}")]
pub struct PlanParseError {
    pub reason: String,
    pub raw_text: String,
}

impl PlanParseError {
    fn new(reason: impl Into<String>, raw_text: &str) -> Self {
        Self {
            reason: reason.into(),
            raw_text: raw_text.to_string(),
        }
    }
}

/// What a planning reply turned out to be.
#[derive(Debug, Clone, PartialEq)]
pub enum PlanReply {
    Plan(TaskPlan),
    /// No structured content at all: the model answered in prose.
    Conversation(String),
}

/// Content of the first fenced block that looks structured, or the text with
/// fence markers removed.
pub fn strip_fences(text: &str) -> String {
    if !text.contains("```") {
        return text.to_string();
    }

    let mut blocks = Vec::new();
    let mut rest = text;
    while let Some(open) = rest.find("```") {
        let after = &rest[open + 3..];
        // Skip the info string ("json", "JSON", ...) up to the end of the line.
        let body_start = after.find('\n').map(|i| i + 1).unwrap_or(after.len());
        let body = &after[body_start..];
        match body.find("```") {
            Some(close) => {
                blocks.push(&body[..close]);
                rest = &body[close + 3..];
            }
            None => {
                blocks.push(body);
                break;
            }
        }
    }

    if let Some(block) = blocks.iter().find(|b| b.contains('{') || b.contains('[')) {
        return block.trim().to_string();
    }

    text.lines()
        .filter(|line| !line.trim_start().starts_with("```"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// The longest balanced `{...}` or `[...]` span of `text`.
///
/// Brackets inside quoted strings (single or double) are ignored.
pub fn locate_structured(text: &str) -> Option<&str> {
    let bytes = text.as_bytes();
    let mut best: Option<(usize, usize)> = None;
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'{' || bytes[i] == b'[' {
            if let Some(end) = balanced_end(bytes, i) {
                if best.map_or(true, |(s, e)| end - i > e - s) {
                    best = Some((i, end));
                }
                i = end + 1;
                continue;
            }
        }
        i += 1;
    }

    best.map(|(start, end)| &text[start..=end])
}

/// Index of the bracket closing the one at `start`.
fn balanced_end(bytes: &[u8], start: usize) -> Option<usize> {
    let mut stack: Vec<u8> = Vec::new();
    let mut quote: Option<u8> = None;
    let mut escaped = false;

    for (offset, &b) in bytes[start..].iter().enumerate() {
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == q {
                quote = None;
            }
            continue;
        }
        match b {
            b'"' => quote = Some(b),
            // An apostrophe directly after a word character is prose, not a quote.
            b'\'' if offset == 0 || !bytes[start + offset - 1].is_ascii_alphanumeric() => {
                quote = Some(b)
            }
            b'{' => stack.push(b'}'),
            b'[' => stack.push(b']'),
            b'}' | b']' => {
                if stack.pop() != Some(b) {
                    return None;
                }
                if stack.is_empty() {
                    return Some(start + offset);
                }
            }
            _ => {}
        }
    }
    None
}

pub fn decode(candidate: &str) -> Result<Value, serde_json::Error> {
    serde_json::from_str(candidate)
}

/// Repair common near-JSON: trailing commas, single-quoted strings, Python
/// literals and typographic quotes.
pub fn normalize(candidate: &str) -> String {
    let chars: Vec<char> = candidate
        .chars()
        .map(|c| match c {
            '\u{201C}' | '\u{201D}' => '"',
            '\u{2018}' | '\u{2019}' => '\'',
            other => other,
        })
        .collect();

    let mut out = String::with_capacity(chars.len());
    let mut quote: Option<char> = None;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if let Some(q) = quote {
            match c {
                '\\' if i + 1 < chars.len() => {
                    let next = chars[i + 1];
                    if q == '\'' && next == '\'' {
                        out.push('\'');
                    } else {
                        out.push('\\');
                        out.push(next);
                    }
                    i += 2;
                    continue;
                }
                '"' if q == '\'' => out.push_str("\\\""),
                c if c == q => {
                    out.push('"');
                    quote = None;
                }
                '\n' => out.push_str("\\n"),
                other => out.push(other),
            }
            i += 1;
            continue;
        }

        match c {
            '"' | '\'' => {
                quote = Some(c);
                out.push('"');
            }
            ',' => {
                let next = chars[i + 1..].iter().find(|c| !c.is_whitespace());
                if !matches!(next, Some('}') | Some(']') | None) {
                    out.push(',');
                }
            }
            c if c.is_ascii_alphabetic() => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                out.push_str(match word.as_str() {
                    "True" => "true",
                    "False" => "false",
                    "None" => "null",
                    other => other,
                });
                continue;
            }
            other => out.push(other),
        }
        i += 1;
    }
    out
}

/// Whether the first `{` or `[` of `text` is never closed, as happens when a
/// reply is cut off by the token limit or a stop sequence.
pub fn is_unterminated(text: &str) -> bool {
    text.find(|c: char| c == '{' || c == '[')
        .map_or(false, |start| balanced_end(text.as_bytes(), start).is_none())
}

/// Run the recovery pipeline up to a decoded value.
///
/// `Ok(None)` means the text holds no structured content at all.
pub(crate) fn recover(raw: &str) -> Result<Option<Value>, PlanParseError> {
    let unfenced = strip_fences(raw);
    if is_unterminated(&unfenced) {
        return Err(PlanParseError::new("unterminated structured output", raw));
    }
    let Some(candidate) = locate_structured(&unfenced) else {
        return Ok(None);
    };

    match decode(candidate) {
        Ok(value) => Ok(Some(value)),
        Err(first) => {
            debug!("Decoding failed ({}), retrying after normalization", first);
            decode(&normalize(candidate))
                .map(Some)
                .map_err(|e| PlanParseError::new(format!("invalid JSON: {}", e), raw))
        }
    }
}

fn first_field<'a>(object: &'a serde_json::Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|k| object.get(*k))
}

fn index_of(value: &Value) -> Option<u32> {
    match value {
        Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        Value::String(s) => s.trim().trim_end_matches('.').parse().ok(),
        _ => None,
    }
}

/// Argument mapping with `null` entries dropped.
fn arguments_from(value: Option<&Value>) -> Result<Arguments, ValidationError> {
    let mut arguments = match value {
        None | Some(Value::Null) => Arguments::new(),
        Some(Value::Object(map)) => map.clone(),
        // Some models emit the mapping as a JSON string.
        Some(Value::String(s)) => match serde_json::from_str::<Value>(s) {
            Ok(Value::Object(map)) => map,
            _ => return Err(ValidationError::NotAnObject(s.clone())),
        },
        Some(other) => return Err(ValidationError::NotAnObject(other.to_string())),
    };
    arguments.retain(|_, v| !v.is_null());
    Ok(arguments)
}

fn interpret_step(
    value: &Value,
    position: usize,
    registry: &ToolRegistry,
) -> Result<PlanStep, String> {
    let object = value
        .as_object()
        .ok_or_else(|| format!("step {} is not an object", position + 1))?;

    let raw_tool = first_field(object, TOOL_KEYS)
        .and_then(Value::as_str)
        .ok_or_else(|| format!("step {} has no tool name", position + 1))?;
    let tool = registry.lookup(raw_tool).map_err(|e| e.to_string())?;

    let arguments = arguments_from(first_field(object, ARGUMENT_KEYS)).map_err(|e| e.to_string())?;
    registry.validate(tool, &arguments).map_err(|e| e.to_string())?;

    let step_index = first_field(object, INDEX_KEYS)
        .and_then(index_of)
        .unwrap_or(position as u32 + 1);

    let mut step = PlanStep::new(step_index, tool, arguments);
    if let Some(description) = first_field(object, DESCRIPTION_KEYS).and_then(Value::as_str) {
        step = step.with_description(description);
    }
    Ok(step)
}

/// Plan summary and validated steps from a decoded value.
///
/// Accepts `{"plan": "...", "steps": [...]}`, `{"plan": [...]}`, a bare
/// array of steps, or a single step object. Indices that are missing are
/// taken from position; indices that do not strictly increase are replaced by
/// positions.
pub fn interpret_plan(
    value: &Value,
    registry: &ToolRegistry,
) -> Result<(Option<String>, Vec<PlanStep>), String> {
    let (summary, items): (Option<String>, Vec<Value>) = match value {
        Value::Array(items) => (None, items.clone()),
        Value::Object(object) => {
            let summary = ["plan", "summary"]
                .iter()
                .find_map(|k| object.get(*k).and_then(Value::as_str))
                .map(str::to_string);
            if let Some(steps) = object.get("steps") {
                let items = steps
                    .as_array()
                    .cloned()
                    .ok_or_else(|| "'steps' is not a list".to_string())?;
                (summary, items)
            } else if let Some(Value::Array(items)) = object.get("plan") {
                (None, items.clone())
            } else if first_field(object, TOOL_KEYS).is_some() {
                (None, vec![value.clone()])
            } else {
                return Err("no steps found".to_string());
            }
        }
        _ => return Err("expected an object or a list of steps".to_string()),
    };

    let mut steps = items
        .iter()
        .enumerate()
        .map(|(position, item)| interpret_step(item, position, registry))
        .collect::<Result<Vec<_>, _>>()?;

    let increasing = steps.windows(2).all(|w| w[1].step_index > w[0].step_index);
    if !increasing {
        warn!("Step indices are not strictly increasing, renumbering by position");
        for (position, step) in steps.iter_mut().enumerate() {
            step.step_index = position as u32 + 1;
        }
    }

    Ok((summary, steps))
}

/// Replacement arguments for `tool` from a decoded correction.
///
/// Accepts `{"params": {...}}` (or any argument alias), a full step object,
/// a `{"steps": [...]}` plan whose first step is used, or a bare argument
/// mapping. A tool named in the correction is ignored; identity stays fixed.
pub fn interpret_correction(
    value: &Value,
    tool: ToolName,
    registry: &ToolRegistry,
) -> Result<Arguments, String> {
    let arguments = match value {
        Value::Array(items) => {
            let first = items.first().ok_or_else(|| "empty correction".to_string())?;
            return interpret_correction(first, tool, registry);
        }
        Value::Object(object) => {
            if let Some(named) = first_field(object, TOOL_KEYS).and_then(Value::as_str) {
                if named.parse::<ToolName>().ok() != Some(tool) {
                    debug!("Correction names tool '{}', keeping {}", named, tool);
                }
            }
            if let Some(inner) = first_field(object, ARGUMENT_KEYS) {
                arguments_from(Some(inner)).map_err(|e| e.to_string())?
            } else if let Some(Value::Array(steps)) = object.get("steps") {
                let first = steps.first().ok_or_else(|| "empty correction".to_string())?;
                return interpret_correction(first, tool, registry);
            } else {
                let mut bare = object.clone();
                for key in TOOL_KEYS.iter().chain(INDEX_KEYS).chain(DESCRIPTION_KEYS) {
                    bare.remove(*key);
                }
                arguments_from(Some(&Value::Object(bare))).map_err(|e| e.to_string())?
            }
        }
        _ => return Err("expected an object".to_string()),
    };

    registry.validate(tool, &arguments).map_err(|e| e.to_string())?;
    Ok(arguments)
}

/// Classify a planning reply as a plan or a conversational answer.
pub fn parse_reply(
    raw: &str,
    task_id: TaskId,
    task: &Task,
    registry: &ToolRegistry,
) -> Result<PlanReply, PlanParseError> {
    let Some(value) = recover(raw)? else {
        return Ok(PlanReply::Conversation(raw.trim().to_string()));
    };

    let (summary, steps) =
        interpret_plan(&value, registry).map_err(|reason| PlanParseError::new(reason, raw))?;
    if steps.is_empty() {
        return match summary {
            Some(text) if !text.trim().is_empty() => Ok(PlanReply::Conversation(text)),
            _ => Err(PlanParseError::new("plan has no steps", raw)),
        };
    }

    TaskPlan::new(task_id, task.clone(), summary, steps)
        .map(PlanReply::Plan)
        .map_err(|e| PlanParseError::new(e.to_string(), raw))
}

/// Like [`parse_reply`], but prose is an error.
pub fn parse_plan(
    raw: &str,
    task_id: TaskId,
    task: &Task,
    registry: &ToolRegistry,
) -> Result<TaskPlan, PlanParseError> {
    match parse_reply(raw, task_id, task, registry)? {
        PlanReply::Plan(plan) => Ok(plan),
        PlanReply::Conversation(_) => Err(PlanParseError::new("no structured plan found", raw)),
    }
}

/// Corrected arguments for `step` from a self-heal reply.
pub fn parse_correction(
    raw: &str,
    step: &PlanStep,
    registry: &ToolRegistry,
) -> Result<Arguments, PlanParseError> {
    let value = recover(raw)?.ok_or_else(|| PlanParseError::new("no structured content", raw))?;
    interpret_correction(&value, step.tool, registry).map_err(|reason| PlanParseError::new(reason, raw))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::testing::{args, MockTool};
    use serde_json::json;

    fn registry() -> ToolRegistry {
        let mut registry = ToolRegistry::empty();
        for name in [
            ToolName::CreateTextFile,
            ToolName::ReadFile,
            ToolName::ListFiles,
            ToolName::RunShell,
            ToolName::GetSystemInfo,
        ] {
            registry.register(MockTool::ok(name));
        }
        registry
    }

    fn plan(raw: &str) -> Result<TaskPlan, PlanParseError> {
        parse_plan(raw, TaskId::new(), &Task::new("test"), &registry())
    }

    #[test]
    fn test_strip_fences() {
        let text = "Here you go:\n```json\n{\"a\": 1}\n```\nDone.";
        assert_eq!(strip_fences(text), "{\"a\": 1}");
        assert_eq!(strip_fences("no fences"), "no fences");
        assert_eq!(strip_fences("```\nplain\n```"), "plain");
        assert_eq!(strip_fences("```json\n[1, 2]"), "[1, 2]");
    }

    #[test]
    fn test_locate_structured_picks_largest_span() {
        let text = "I will {maybe} do this: {\"steps\": [{\"tool\": \"x\"}]} ok?";
        assert_eq!(locate_structured(text), Some("{\"steps\": [{\"tool\": \"x\"}]}"));
        assert_eq!(locate_structured("just words"), None);
        assert_eq!(locate_structured("{\"a\": \"}\"}"), Some("{\"a\": \"}\"}"));
        assert_eq!(locate_structured("it's {'a': 1}"), Some("{'a': 1}"));
        assert_eq!(locate_structured("{unbalanced"), None);
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("{\"a\": 1,}"), "{\"a\": 1}");
        assert_eq!(normalize("[1, 2,]"), "[1, 2]");
        assert_eq!(normalize("{'a': 'it\\'s \"x\"'}"), "{\"a\": \"it's \\\"x\\\"\"}");
        assert_eq!(normalize("{'ok': True, 'v': None}"), "{\"ok\": true, \"v\": null}");
        assert_eq!(normalize("{\u{201C}a\u{201D}: 1}"), "{\"a\": 1}");
        assert_eq!(normalize("{\"t\": \"True, \"}"), "{\"t\": \"True, \"}");
    }

    #[test]
    fn test_parses_plan_in_noisy_prose() {
        let raw = "Sure! Here is the plan:\n```json\n{\"plan\": \"Create file\", \"steps\": [\
            {\"step\": 1, \"description\": \"write\", \"tool\": \"create_text_file\", \
            \"params\": {\"path\": \"desktop/hello.txt\", \"content\": \"Hello\"}}]}\n```\nLet me know!";
        let plan = plan(raw).unwrap();
        assert_eq!(plan.summary.as_deref(), Some("Create file"));
        assert_eq!(plan.len(), 1);
        let step = &plan.steps()[0];
        assert_eq!(step.tool, ToolName::CreateTextFile);
        assert_eq!(step.step_index, 1);
        assert_eq!(step.arg_str("path"), Some("desktop/hello.txt"));
        assert_eq!(step.description.as_deref(), Some("write"));
    }

    #[test]
    fn test_accepts_aliases_and_near_json() {
        let raw = "[{'action': 'read_file', 'arguments': {'path': 'a.txt'},}, \
                   {'name': 'list_files'}]";
        let plan = plan(raw).unwrap();
        assert_eq!(plan.len(), 2);
        assert_eq!(plan.steps()[0].tool, ToolName::ReadFile);
        assert_eq!(plan.steps()[1].tool, ToolName::ListFiles);
        assert_eq!(plan.steps()[1].step_index, 2);
        assert!(plan.steps()[1].arguments.is_empty());
    }

    #[test]
    fn test_single_step_object() {
        let plan = plan("{\"tool\": \"get_system_info\"}").unwrap();
        assert_eq!(plan.steps()[0].tool, ToolName::GetSystemInfo);
    }

    #[test]
    fn test_renumbers_non_increasing_indices() {
        let raw = json!({"steps": [
            {"step": 2, "tool": "list_files"},
            {"step": 1, "tool": "get_system_info"},
        ]})
        .to_string();
        let plan = plan(&raw).unwrap();
        let indices: Vec<u32> = plan.steps().iter().map(|s| s.step_index).collect();
        assert_eq!(indices, vec![1, 2]);
    }

    #[test]
    fn test_rejects_whole_plan_on_any_invalid_step() {
        let unknown = json!({"steps": [
            {"tool": "list_files"},
            {"tool": "launch_rockets", "params": {}},
        ]})
        .to_string();
        let err = plan(&unknown).unwrap_err();
        assert!(err.reason.contains("launch_rockets"));
        assert_eq!(err.raw_text, unknown);

        let missing = json!({"steps": [{"tool": "read_file", "params": {}}]}).to_string();
        assert!(plan(&missing).unwrap_err().reason.contains("path"));

        let extra = json!({"steps": [{"tool": "read_file", "params": {"path": "a", "mode": "r"}}]}).to_string();
        assert!(plan(&extra).unwrap_err().reason.contains("mode"));
    }

    #[test]
    fn test_null_arguments_are_absent() {
        let raw = json!({"steps": [{"tool": "list_files", "params": {"directory": null}}]}).to_string();
        assert!(plan(&raw).unwrap().steps()[0].arguments.is_empty());
    }

    #[test]
    fn test_undecodable_structure_is_an_error() {
        let err = plan("Plan: {\"steps\": [{\"tool\" \"read_file\"}]}").unwrap_err();
        assert!(err.reason.starts_with("invalid JSON"));
    }

    #[test]
    fn test_truncated_reply_is_a_parse_error() {
        let cut = r#"{"plan":"Create file","steps":[{"step":1,"tool":"create_text_file","params":{"path":"desktop/a.txt","content":"long"#;
        let err = parse_reply(cut, TaskId::new(), &Task::new("q"), &registry()).unwrap_err();
        assert_eq!(err.reason, "unterminated structured output");
        assert_eq!(err.raw_text, cut);

        // A complete inner step must not be run as if it were the whole plan.
        let cut_after_step = r#"{"plan":"x","steps":[{"tool":"list_files","params":{}},{"tool":"#;
        assert!(plan(cut_after_step).is_err());

        let fenced = "```json\n[{\"tool\": \"list_files\"";
        assert!(plan(fenced).unwrap_err().reason.contains("unterminated"));
    }

    #[test]
    fn test_prose_reply_is_conversation() {
        let reply = parse_reply("Paris is the capital of France.", TaskId::new(), &Task::new("q"), &registry()).unwrap();
        assert_eq!(reply, PlanReply::Conversation("Paris is the capital of France.".to_string()));
        assert!(plan("Paris is the capital of France.").is_err());

        let empty = parse_reply("{\"plan\": \"Nothing to do\", \"steps\": []}", TaskId::new(), &Task::new("q"), &registry()).unwrap();
        assert_eq!(empty, PlanReply::Conversation("Nothing to do".to_string()));
    }

    #[test]
    fn test_correction_shapes() {
        let registry = registry();
        let step = PlanStep::new(3, ToolName::ReadFile, args(json!({"path": "a.txt"})));
        let expected = args(json!({"path": "b.txt"}));

        for raw in [
            "{\"params\": {\"path\": \"b.txt\"}}",
            "Fixed: ```json\n{\"arguments\": {\"path\": \"b.txt\"}}\n```",
            "{\"tool\": \"run_shell\", \"params\": {\"path\": \"b.txt\"}}",
            "{\"steps\": [{\"tool\": \"read_file\", \"params\": {\"path\": \"b.txt\"}}]}",
            "{'path': 'b.txt'}",
        ] {
            assert_eq!(parse_correction(raw, &step, &registry).unwrap(), expected, "{raw}");
        }

        assert!(parse_correction("I cannot fix this", &step, &registry).is_err());
        assert!(parse_correction("{\"params\": {\"file\": \"b.txt\"}}", &step, &registry).is_err());
    }
}
