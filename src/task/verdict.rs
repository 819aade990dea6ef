use serde::{Deserialize, Serialize};

/// The model's judgement of whether a run satisfied its task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationVerdict {
    pub passed: bool,
    pub explanation: String,
}

impl VerificationVerdict {
    pub fn passed(explanation: impl Into<String>) -> Self {
        Self {
            passed: true,
            explanation: explanation.into(),
        }
    }

    pub fn failed(explanation: impl Into<String>) -> Self {
        Self {
            passed: false,
            explanation: explanation.into(),
        }
    }

    /// A verdict that could not be obtained counts as not passed.
    pub fn inconclusive(reason: impl std::fmt::Display) -> Self {
        Self::failed(format!("Verification inconclusive: {}", reason))
    }
}
