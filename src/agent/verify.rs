//! Post-execution verdicts.

use regex::Regex;
use serde_json::Value;
use tracing::{info, warn};

use super::parser::recover;
use super::session::ModelSession;
use crate::task::{ExecutionRecord, Task, VerificationVerdict};

const PASS_KEYS: &[&str] = &["success", "passed", "ok", "completed", "result"];
const NOTE_KEYS: &[&str] = &["note", "explanation", "reason", "message", "summary"];
const EXPLANATION_CHARS: usize = 300;

const NEUTRAL_PHRASES: &str = r"(?i)\b(no|without|not)\s+(any\s+)?(errors?|issues?|problems?|failures?|further|more|other|additional|longer\s+needed|needed|required|necessary)\b|\bnothing\s+(else|more|further)\b|\bnot\s+only\b";
const NEGATIVE_MARKERS: &str = r"(?i)\b(not|no|fail|fails|failed|failure|unsuccessful|error|incomplete|false|nie|niepowodzenie|błąd)\b";
const AFFIRMATIVE_MARKERS: &str = r"(?i)\b(yes|success|successful|successfully|succeeded|complete|completed|done|passed|true|ok|tak|sukces|gotowe)\b";

fn flag(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_i64().map(|n| n != 0),
        Value::String(s) => match s.trim().to_lowercase().as_str() {
            "true" | "yes" | "success" | "passed" | "ok" | "tak" => Some(true),
            "false" | "no" | "fail" | "failed" | "failure" | "nie" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn structured(value: &Value) -> Option<VerificationVerdict> {
    let object = value.as_object()?;
    let passed = PASS_KEYS.iter().find_map(|k| object.get(*k).and_then(flag))?;
    let note = NOTE_KEYS
        .iter()
        .find_map(|k| object.get(*k).and_then(Value::as_str))
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .unwrap_or("no explanation given")
        .to_string();
    Some(VerificationVerdict { passed, explanation: note })
}

fn shorten(text: &str) -> String {
    let text = text.trim();
    if text.chars().count() > EXPLANATION_CHARS {
        format!("{}...", text.chars().take(EXPLANATION_CHARS).collect::<String>())
    } else {
        text.to_string()
    }
}

/// Verdict from affirmative or negative words. Negative markers win.
pub fn lexical_verdict(raw: &str) -> Option<VerificationVerdict> {
    let neutral = Regex::new(NEUTRAL_PHRASES).ok()?;
    let negative = Regex::new(NEGATIVE_MARKERS).ok()?;
    let affirmative = Regex::new(AFFIRMATIVE_MARKERS).ok()?;

    let text = neutral.replace_all(raw, " ");
    if negative.is_match(&text) {
        Some(VerificationVerdict::failed(shorten(raw)))
    } else if affirmative.is_match(&text) {
        Some(VerificationVerdict::passed(shorten(raw)))
    } else {
        None
    }
}

/// Structured verdict if one can be recovered, else lexical markers, else
/// inconclusive.
pub fn parse_verdict(raw: &str) -> VerificationVerdict {
    if let Ok(Some(value)) = recover(raw) {
        if let Some(verdict) = structured(&value) {
            return verdict;
        }
    }
    lexical_verdict(raw).unwrap_or_else(|| VerificationVerdict::inconclusive("unrecognised reply"))
}

/// Ask the model whether `record` accomplished `task`.
///
/// A model failure yields an inconclusive verdict; it never retracts
/// anything that already ran.
pub async fn verify(session: &mut ModelSession, task: &Task, record: &ExecutionRecord) -> VerificationVerdict {
    if record.is_cancelled() {
        return VerificationVerdict::failed("Run cancelled before all steps ran");
    }

    let verdict = match session.verify(task, record).await {
        Ok(raw) => parse_verdict(&raw),
        Err(e) => {
            warn!("Verification request failed: {}", e);
            VerificationVerdict::inconclusive(e)
        }
    };
    info!(
        "Verification {}: {}",
        if verdict.passed { "passed" } else { "failed" },
        verdict.explanation
    );
    verdict
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_structured_verdicts() {
        assert_eq!(
            parse_verdict(r#"{"success": true, "note": "File created"}"#),
            VerificationVerdict::passed("File created")
        );
        assert_eq!(
            parse_verdict("Verdict:\n```json\n{'success': 'false', 'note': 'Nothing written'}\n```"),
            VerificationVerdict::failed("Nothing written")
        );
        assert_eq!(
            parse_verdict(r#"{"passed": 1}"#),
            VerificationVerdict::passed("no explanation given")
        );
    }

    #[test]
    fn test_lexical_fallback() {
        assert!(parse_verdict("Yes, the file was created successfully.").passed);
        assert!(parse_verdict("Completed with no errors.").passed);
        assert!(!parse_verdict("The task was not completed.").passed);
        assert!(!parse_verdict("Step 2 failed").passed);
        assert!(parse_verdict("Tak, gotowe.").passed);
        assert!(parse_verdict("Done, the file exists; no further action needed.").passed);
        assert!(parse_verdict("Completed. Nothing else to do, no additional steps required.").passed);
        assert!(parse_verdict("Done without any issues.").passed);
        assert!(!parse_verdict("Done, but the file is not there.").passed);
    }

    #[test]
    fn test_unparseable_is_inconclusive() {
        let verdict = parse_verdict("¯\\_(ツ)_/¯");
        assert!(!verdict.passed);
        assert!(verdict.explanation.starts_with("Verification inconclusive"));

        // Structured but without a recognisable flag falls back to words.
        let verdict = parse_verdict(r#"{"status": "unknown"}"#);
        assert!(!verdict.passed);
        assert!(verdict.explanation.contains("inconclusive"));
    }
}
