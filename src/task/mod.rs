//! Task data model: plans, per-attempt results, verdicts and reports.
//!
//! A [`TaskPlan`] is built once by the parser and never mutated. The engine
//! owns one [`ExecutionRecord`] per run and only ever appends to it, so the
//! record is a complete trail of every attempt including retries.

mod plan;
mod record;
mod report;
mod verdict;

pub use plan::{PlanStep, Task, TaskId, TaskPlan};
pub use record::{ErrorInfo, ErrorKind, ExecutionRecord, RunOutcome, StepResult, StepStatus};
pub use report::TaskReport;
pub use verdict::VerificationVerdict;
