//! # ATLAS
//!
//! A desktop task agent driven by a local language model.
//!
//! A natural-language request goes through three phases:
//!
//! ```text
//!   request ──► Plan ──► SafetyGate ──► Execute ──► Verify ──► TaskReport
//!                │           │             │  ▲
//!                │      confirm/reject     │  │ self-heal
//!                ▼                         ▼  │
//!           conversation              ToolRegistry ◄── model correction
//! ```
//!
//! ## Modules
//! - `agent`: the cycle itself, model session, plan parsing and verification
//! - `safety`: path resolution and the pre-execution gate
//! - `tools`: the desktop capabilities a plan may call
//! - `task`: plans, execution records and reports
//! - `llm`: model backends (Ollama, OpenRouter)
//! - `config`: process-wide configuration
//! - `audit`: JSON-lines trail of every cycle

pub mod agent;
pub mod audit;
pub mod config;
pub mod llm;
pub mod safety;
pub mod task;
pub mod tools;

pub use agent::{Agent, AgentError, TaskOutcome};
pub use config::Config;
