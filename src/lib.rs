// Deep Research - job orchestration and document chat client core

pub mod backend;
pub mod chat;
pub mod config;
pub mod jobs;
pub mod models;
pub mod status;
pub mod storage;
pub mod types;
pub mod utils;

#[cfg(test)]
mod testing;

// Re-exports for convenience
pub use chat::{AskOutcome, ChatPhase, ChatSession, TranscriptEntry};
pub use config::Config;
pub use jobs::{JobCollaborators, JobOrchestrator, OrchestratorSettings};
pub use status::{StatusProjector, StatusSink};
pub use types::{ClientError, ClientResult, WorkflowRun};
