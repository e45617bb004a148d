//! Chat Session Manager
//!
//! One conversation about one document at a time. A turn moves through
//! `Idle → AwaitingJobHandle → Streaming → Idle`; switching documents or
//! closing the session cancels whatever is in flight and wipes the transcript.
//!
//! While a turn is pending the transcript ends with a "thinking" placeholder.
//! It is removed in the same critical section that appends the turn's first
//! assistant message, so the two are never visible together.

pub mod stream;
pub mod transcript;

use crate::backend::{ChatBackend, EventStreamSource};
use crate::models::{ChatMessage, DocumentRef};
use crate::types::{ClientError, ClientResult, WorkflowRun};
use chrono::NaiveDate;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use stream::{StreamConnection, StreamObserver};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

pub const SUBMIT_ERROR_MESSAGE: &str = "Sorry, there was an error processing your question.";
pub const STREAM_ERROR_MESSAGE: &str = "Sorry, there was an error with the response stream.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatPhase {
    Idle,
    AwaitingJobHandle,
    Streaming,
    Closed,
}

/// One line of the rendered conversation
#[derive(Debug, Clone, PartialEq)]
pub enum TranscriptEntry {
    Message(ChatMessage),
    Thinking,
}

/// What happened to a question passed to [`ChatSession::ask`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AskOutcome {
    /// Blank text, no open document, or a turn already in progress
    Ignored,
    Streaming,
    /// The turn could not be started; an error message was appended
    Failed,
    /// The document was switched or closed while the turn was being created
    Superseded,
}

struct ActiveStream {
    id: u64,
    connection: StreamConnection,
    answered: bool,
}

struct SessionState {
    document: Option<DocumentRef>,
    /// Bumped on every reset so in-flight turns can tell they are stale
    epoch: u64,
    messages: Vec<ChatMessage>,
    thinking: bool,
    phase: ChatPhase,
    active: Option<ActiveStream>,
    next_stream_id: u64,
}

impl SessionState {
    fn cancel_active(&mut self) {
        if let Some(active) = self.active.take() {
            active.connection.cancel();
        }
    }

    fn reset(&mut self, document: Option<DocumentRef>, phase: ChatPhase) {
        self.cancel_active();
        self.document = document;
        self.epoch += 1;
        self.messages.clear();
        self.thinking = false;
        self.phase = phase;
    }

    /// Take the active stream if `stream_id` still names it
    fn take_active(&mut self, stream_id: u64) -> Option<ActiveStream> {
        if self.active.as_ref().is_some_and(|active| active.id == stream_id) {
            self.active.take()
        } else {
            None
        }
    }

    fn fail_turn(&mut self, message: &str) {
        self.thinking = false;
        self.messages.push(ChatMessage::assistant(message));
        self.phase = ChatPhase::Idle;
    }
}

struct SessionShared {
    state: Mutex<SessionState>,
    backend: Arc<dyn ChatBackend>,
    streams: Arc<dyn EventStreamSource>,
    revision: watch::Sender<u64>,
}

impl SessionShared {
    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self) {
        self.revision.send_modify(|revision| *revision += 1);
    }

    fn handle_message(&self, stream_id: u64, message: String) {
        {
            let mut state = self.lock();
            let Some(active) = state.active.as_mut().filter(|active| active.id == stream_id) else {
                debug!(stream_id, "Dropping message from stale stream");
                return;
            };
            if message.trim().is_empty() {
                return;
            }
            active.answered = true;

            state.thinking = false;
            state.messages.push(ChatMessage::assistant(message));
            if state.phase == ChatPhase::Streaming {
                state.phase = ChatPhase::Idle;
            }
        }
        self.notify();
    }

    fn handle_complete(&self, stream_id: u64) {
        {
            let mut state = self.lock();
            let Some(active) = state.take_active(stream_id) else { return };
            if !active.answered {
                warn!(stream_id, "Stream ended without an answer");
                state.fail_turn(STREAM_ERROR_MESSAGE);
            }
        }
        self.notify();
    }

    fn handle_error(&self, stream_id: u64, error: ClientError) {
        {
            let mut state = self.lock();
            if state.take_active(stream_id).is_none() {
                return;
            }
            error!("Chat stream failed: {}", error);
            state.fail_turn(STREAM_ERROR_MESSAGE);
        }
        self.notify();
    }
}

impl Drop for SessionShared {
    fn drop(&mut self) {
        self.state
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .cancel_active();
    }
}

/// Routes stream callbacks back to the session that opened the stream
struct TurnObserver {
    session: Weak<SessionShared>,
    stream_id: u64,
}

impl StreamObserver for TurnObserver {
    fn on_message(&self, message: String) {
        if let Some(session) = self.session.upgrade() {
            session.handle_message(self.stream_id, message);
        }
    }

    fn on_complete(&self) {
        if let Some(session) = self.session.upgrade() {
            session.handle_complete(self.stream_id);
        }
    }

    fn on_error(&self, error: ClientError) {
        if let Some(session) = self.session.upgrade() {
            session.handle_error(self.stream_id, error);
        }
    }
}

/// Chat about a single document. Cheap to clone.
#[derive(Clone)]
pub struct ChatSession {
    shared: Arc<SessionShared>,
}

impl ChatSession {
    /// Create a closed session; call [`switch_document`](Self::switch_document) to open one.
    pub fn new(backend: Arc<dyn ChatBackend>, streams: Arc<dyn EventStreamSource>) -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            shared: Arc::new(SessionShared {
                state: Mutex::new(SessionState {
                    document: None,
                    epoch: 0,
                    messages: Vec::new(),
                    thinking: false,
                    phase: ChatPhase::Closed,
                    active: None,
                    next_stream_id: 0,
                }),
                backend,
                streams,
                revision,
            }),
        }
    }

    /// Ask a question about the open document.
    pub async fn ask(&self, text: &str) -> AskOutcome {
        let question = text.trim();
        if question.is_empty() {
            return AskOutcome::Ignored;
        }

        let (document_id, history, epoch) = {
            let mut state = self.shared.lock();
            if state.phase != ChatPhase::Idle {
                return AskOutcome::Ignored;
            }
            let Some(document_id) = state.document.as_ref().map(|doc| doc.id.clone()) else {
                return AskOutcome::Ignored;
            };

            // A finished turn may still hold its connection open
            state.cancel_active();
            state.messages.push(ChatMessage::user(question));
            state.thinking = true;
            state.phase = ChatPhase::AwaitingJobHandle;
            (document_id, transcript::serialize_history(&state.messages), state.epoch)
        };
        self.shared.notify();

        let result = self
            .shared
            .backend
            .create_chat_turn(&document_id, question, &history)
            .await;

        let outcome = {
            let mut state = self.shared.lock();
            if state.epoch != epoch {
                debug!(document_id = %document_id, "Discarding chat turn for a closed conversation");
                return AskOutcome::Superseded;
            }
            match result {
                Ok(run) => {
                    self.start_stream(&mut state, run);
                    AskOutcome::Streaming
                }
                Err(e) => {
                    error!("Error sending question: {}", e);
                    state.fail_turn(SUBMIT_ERROR_MESSAGE);
                    AskOutcome::Failed
                }
            }
        };
        self.shared.notify();
        outcome
    }

    fn start_stream(&self, state: &mut SessionState, run: WorkflowRun) {
        let stream_id = state.next_stream_id;
        state.next_stream_id += 1;
        info!(stream_id, run = %run, "Opening chat stream");

        let observer = Arc::new(TurnObserver {
            session: Arc::downgrade(&self.shared),
            stream_id,
        });
        let connection = StreamConnection::open(Arc::clone(&self.shared.streams), run, observer);

        state.active = Some(ActiveStream {
            id: stream_id,
            connection,
            answered: false,
        });
        state.phase = ChatPhase::Streaming;
    }

    /// Open a fresh conversation about `document`.
    pub fn switch_document(&self, document: DocumentRef) {
        info!(document_id = %document.id, "Opening chat");
        self.shared.lock().reset(Some(document), ChatPhase::Idle);
        self.shared.notify();
    }

    pub fn close(&self) {
        self.shared.lock().reset(None, ChatPhase::Closed);
        self.shared.notify();
    }

    pub fn phase(&self) -> ChatPhase {
        self.shared.lock().phase
    }

    pub fn input_enabled(&self) -> bool {
        self.phase() == ChatPhase::Idle
    }

    pub fn document(&self) -> Option<DocumentRef> {
        self.shared.lock().document.clone()
    }

    pub fn messages(&self) -> Vec<ChatMessage> {
        self.shared.lock().messages.clone()
    }

    /// Messages in order, followed by the placeholder while a turn is pending
    pub fn transcript(&self) -> Vec<TranscriptEntry> {
        let state = self.shared.lock();
        let mut entries: Vec<TranscriptEntry> =
            state.messages.iter().cloned().map(TranscriptEntry::Message).collect();
        if state.thinking {
            entries.push(TranscriptEntry::Thinking);
        }
        entries
    }

    pub fn has_active_stream(&self) -> bool {
        self.shared.lock().active.is_some()
    }

    /// Revision counter bumped on every visible change
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.shared.revision.subscribe()
    }

    pub fn export_markdown(&self, date: NaiveDate) -> ClientResult<String> {
        let state = self.shared.lock();
        let title = state
            .document
            .as_ref()
            .map(|doc| doc.title.as_str())
            .ok_or_else(|| ClientError::InvalidRequest("No document is open".to_string()))?;
        transcript::export_markdown(title, &state.messages, date)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MessageRole;
    use crate::testing::{chunk, settle, FakeChatBackend, ScriptedStreams};
    use std::time::Duration;

    struct Harness {
        session: ChatSession,
        backend: Arc<FakeChatBackend>,
        streams: Arc<ScriptedStreams>,
    }

    fn harness() -> Harness {
        let backend = Arc::new(FakeChatBackend::default());
        let streams = Arc::new(ScriptedStreams::default());
        let session = ChatSession::new(backend.clone(), streams.clone());
        session.switch_document(DocumentRef::new("doc-a", "Battery Report"));
        Harness { session, backend, streams }
    }

    fn contents(session: &ChatSession) -> Vec<(MessageRole, String)> {
        session
            .messages()
            .into_iter()
            .map(|msg| (msg.role, msg.content))
            .collect()
    }

    fn thinking_count(session: &ChatSession) -> usize {
        session
            .transcript()
            .iter()
            .filter(|entry| **entry == TranscriptEntry::Thinking)
            .count()
    }

    #[tokio::test(start_paused = true)]
    async fn test_question_answered_from_complete_chunk() {
        let h = harness();
        let tx = h.streams.script();

        let outcome = h.session.ask("What is the conclusion?").await;
        assert_eq!(outcome, AskOutcome::Streaming);
        assert_eq!(h.session.phase(), ChatPhase::Streaming);
        assert!(!h.session.input_enabled());
        assert_eq!(h.session.transcript().last(), Some(&TranscriptEntry::Thinking));

        tx.unbounded_send(chunk("progress", Some("Reading the document"))).unwrap();
        settle().await;
        assert_eq!(thinking_count(&h.session), 1);
        assert_eq!(h.session.messages().len(), 1);

        tx.unbounded_send(chunk("complete", Some("The conclusion is X"))).unwrap();
        settle().await;
        assert_eq!(
            contents(&h.session),
            vec![
                (MessageRole::User, "What is the conclusion?".to_string()),
                (MessageRole::Assistant, "The conclusion is X".to_string()),
            ]
        );
        assert_eq!(thinking_count(&h.session), 0);
        assert!(h.session.input_enabled());

        drop(tx);
        settle().await;
        assert!(!h.session.has_active_stream());
        assert_eq!(h.session.messages().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_history_includes_prior_turns() {
        let h = harness();
        let first = h.streams.script();
        h.session.ask("First question").await;
        first.unbounded_send(chunk("complete", Some("First answer"))).unwrap();
        drop(first);
        settle().await;

        let _second = h.streams.script();
        h.session.ask("  Second question  ").await;

        let calls = h.backend.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0], (
            "doc-a".to_string(),
            "First question".to_string(),
            "User: First question".to_string(),
        ));
        assert_eq!(calls[1].1, "Second question");
        assert_eq!(
            calls[1].2,
            "User: First question\nAssistant: First answer\nUser: Second question"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_blank_question_is_ignored() {
        let h = harness();

        assert_eq!(h.session.ask("   ").await, AskOutcome::Ignored);
        assert!(h.session.messages().is_empty());
        assert!(h.backend.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ask_requires_open_document() {
        let h = harness();
        h.session.close();

        assert_eq!(h.session.ask("Anyone there?").await, AskOutcome::Ignored);
        assert!(h.backend.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ask_ignored_while_turn_pending() {
        let h = harness();
        let _tx = h.streams.script();
        h.session.ask("First").await;

        assert_eq!(h.session.ask("Second").await, AskOutcome::Ignored);
        assert_eq!(h.backend.calls().len(), 1);
        assert_eq!(thinking_count(&h.session), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_failure_appends_error() {
        let h = harness();
        h.backend.fail_next();

        assert_eq!(h.session.ask("What is the conclusion?").await, AskOutcome::Failed);

        assert_eq!(
            contents(&h.session),
            vec![
                (MessageRole::User, "What is the conclusion?".to_string()),
                (MessageRole::Assistant, SUBMIT_ERROR_MESSAGE.to_string()),
            ]
        );
        assert_eq!(thinking_count(&h.session), 0);
        assert!(h.session.input_enabled());
        assert!(h.streams.opened().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_error_appends_error() {
        let h = harness();
        let tx = h.streams.script();
        h.session.ask("What is the conclusion?").await;

        tx.unbounded_send(Err(ClientError::Stream("connection reset".to_string()))).unwrap();
        settle().await;

        assert_eq!(h.session.messages().last().map(|m| m.content.as_str()), Some(STREAM_ERROR_MESSAGE));
        assert_eq!(thinking_count(&h.session), 0);
        assert!(h.session.input_enabled());
        assert!(!h.session.has_active_stream());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_ending_without_answer_is_an_error() {
        let h = harness();
        let tx = h.streams.script();
        h.session.ask("What is the conclusion?").await;

        tx.unbounded_send(chunk("complete", Some("   "))).unwrap();
        drop(tx);
        settle().await;

        assert_eq!(
            contents(&h.session),
            vec![
                (MessageRole::User, "What is the conclusion?".to_string()),
                (MessageRole::Assistant, STREAM_ERROR_MESSAGE.to_string()),
            ]
        );
        assert!(h.session.input_enabled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_extra_complete_chunks_are_appended() {
        let h = harness();
        let tx = h.streams.script();
        h.session.ask("Summarize").await;

        tx.unbounded_send(chunk("complete", Some("Part one"))).unwrap();
        tx.unbounded_send(chunk("complete", Some("Part two"))).unwrap();
        drop(tx);
        settle().await;

        let messages = contents(&h.session);
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[2], (MessageRole::Assistant, "Part two".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_switch_document_cancels_stream() {
        let h = harness();
        let tx = h.streams.script();
        h.session.ask("What is the conclusion?").await;
        settle().await;

        h.session.switch_document(DocumentRef::new("doc-b", "Grid Storage"));
        tx.unbounded_send(chunk("complete", Some("Answer about A"))).ok();
        settle().await;

        assert!(h.session.messages().is_empty());
        assert_eq!(thinking_count(&h.session), 0);
        assert_eq!(h.session.phase(), ChatPhase::Idle);
        assert_eq!(h.session.document().map(|d| d.id), Some("doc-b".to_string()));
        assert!(tx.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_question_cancels_previous_stream() {
        let h = harness();
        let first = h.streams.script();
        h.session.ask("First").await;
        first.unbounded_send(chunk("complete", Some("First answer"))).unwrap();
        settle().await;
        assert!(h.session.has_active_stream());

        let second = h.streams.script();
        assert_eq!(h.session.ask("Second").await, AskOutcome::Streaming);
        settle().await;
        assert!(first.is_closed());
        first.unbounded_send(chunk("complete", Some("Late first answer"))).ok();

        second.unbounded_send(chunk("complete", Some("Second answer"))).unwrap();
        settle().await;

        let answers: Vec<String> = contents(&h.session)
            .into_iter()
            .filter(|(role, _)| *role == MessageRole::Assistant)
            .map(|(_, content)| content)
            .collect();
        assert_eq!(answers, vec!["First answer", "Second answer"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_switch_while_awaiting_job_handle() {
        let h = harness();
        *h.backend.delay.lock().unwrap() = Some(Duration::from_secs(5));

        let session = h.session.clone();
        let pending = tokio::spawn(async move { session.ask("What is the conclusion?").await });
        settle().await;
        assert_eq!(h.session.phase(), ChatPhase::AwaitingJobHandle);

        h.session.switch_document(DocumentRef::new("doc-b", "Grid Storage"));
        let outcome = pending.await.unwrap();

        assert_eq!(outcome, AskOutcome::Superseded);
        assert!(h.session.messages().is_empty());
        assert_eq!(h.session.phase(), ChatPhase::Idle);
        assert!(h.streams.opened().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_resets_session() {
        let h = harness();
        let _tx = h.streams.script();
        h.session.ask("What is the conclusion?").await;
        let mut revisions = h.session.subscribe();
        revisions.borrow_and_update();

        h.session.close();

        assert_eq!(h.session.phase(), ChatPhase::Closed);
        assert!(h.session.document().is_none());
        assert!(h.session.transcript().is_empty());
        assert!(!h.session.has_active_stream());
        assert!(revisions.has_changed().unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_export_markdown_uses_document_title() {
        let h = harness();
        let tx = h.streams.script();
        h.session.ask("What is the conclusion?").await;
        tx.unbounded_send(chunk("complete", Some("The conclusion is X"))).unwrap();
        settle().await;

        let date = NaiveDate::from_ymd_opt(2025, 10, 21).unwrap();
        let markdown = h.session.export_markdown(date).unwrap();

        assert!(markdown.starts_with("# Chat with Battery Report\n\nDate: October 21, 2025"));
        assert!(markdown.contains("**Assistant**: The conclusion is X"));
    }
}
