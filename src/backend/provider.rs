use crate::models::ResearchParameters;
use crate::types::{ClientResult, WorkflowRun};
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

/// Chunk type that carries the final, displayable answer of a chat turn
pub const TERMINAL_CHUNK_TYPE: &str = "complete";

/// One event of a workflow message stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamChunk {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl StreamChunk {
    pub fn new(kind: impl Into<String>, message: Option<&str>) -> Self {
        Self {
            kind: kind.into(),
            message: message.map(str::to_string),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.kind == TERMINAL_CHUNK_TYPE
    }
}

pub type ChunkStream = BoxStream<'static, ClientResult<StreamChunk>>;

/// Starts document-generation jobs.
#[async_trait]
pub trait JobBackend: Send + Sync {
    async fn create_document_job(&self, parameters: &ResearchParameters) -> ClientResult<WorkflowRun>;
}

/// Starts one chat turn about a document.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// `history` is the role-prefixed transcript of the conversation so far.
    async fn create_chat_turn(
        &self,
        document_id: &str,
        question: &str,
        history: &str,
    ) -> ClientResult<WorkflowRun>;
}

/// Opens the message stream of a running workflow.
///
/// The returned stream ends when the workflow finishes; an `Err` item means
/// the stream failed and no more items follow.
#[async_trait]
pub trait EventStreamSource: Send + Sync {
    async fn open_event_stream(&self, run: &WorkflowRun) -> ClientResult<ChunkStream>;
}

/// Reports how many documents exist in the library right now.
#[async_trait]
pub trait DocumentCounter: Send + Sync {
    async fn current_document_count(&self) -> ClientResult<u64>;
}
