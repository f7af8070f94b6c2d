//! buildq-agent
//!
//! Worker execution core for buildq. This crate handles:
//! - Claiming jobs from a build queue and reporting their outcome
//! - Compiling job instructions into a phase-ordered build script
//! - Running builds under total and inactivity timeouts
//! - Killing whole process trees (or containers) on forced stops
//! - Streaming build output to the server with a plain-text fallback
//! - Worker identity files and the running guard

pub mod error;
pub mod host;
pub mod identity;
pub mod journal;
pub mod log_sink;
pub mod script;
pub mod strategy;
pub mod supervisor;
pub mod terminator;
pub mod worker;

// Re-export commonly used types
pub use error::{AgentError, AgentResult};
pub use identity::{IdentityStore, RunningGuard, WorkerIdentity};
pub use journal::{Journal, JournalEvent};
pub use log_sink::{BuildLog, LogOptions, LogTransport, OutputSink};
pub use strategy::{build_strategy, ExecutionStrategy, StrategyKind};
pub use supervisor::{supervise, Limits, Supervised, Termination};
pub use terminator::{kill_tree, ProcessTreeTerminator, Terminator};
pub use worker::{Worker, WorkerOptions};
