//! In-memory collaborators shared by the unit tests

use crate::backend::{
    ChatBackend, ChunkStream, DocumentCounter, EventStreamSource, JobBackend, StreamChunk,
};
use crate::models::{ResearchModifiers, ResearchParameters};
use crate::status::StatusSink;
use crate::types::{ClientError, ClientResult, WorkflowRun};
use async_trait::async_trait;
use futures::channel::mpsc;
use futures::StreamExt;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

pub fn sample_parameters(scope: &str) -> ResearchParameters {
    ResearchParameters {
        capability: "Market Analysis".to_string(),
        framework: "SWOT".to_string(),
        context: "Solid-state batteries".to_string(),
        modifiers: ResearchModifiers {
            scope: scope.to_string(),
            overview_details: "standard".to_string(),
            analytical_rigor: "high".to_string(),
            perspective: "neutral".to_string(),
        },
    }
}

/// Let spawned tasks run; with a paused clock this also fires due timers
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

#[derive(Default)]
pub struct FakeJobBackend {
    pub fail: AtomicBool,
    pub calls: AtomicUsize,
}

#[async_trait]
impl JobBackend for FakeJobBackend {
    async fn create_document_job(&self, _parameters: &ResearchParameters) -> ClientResult<WorkflowRun> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(ClientError::Api("job creation rejected (500)".to_string()));
        }
        Ok(WorkflowRun::new(format!("research-{}", n), "run"))
    }
}

#[derive(Default)]
pub struct FakeCounter {
    pub count: AtomicU64,
    pub fail: AtomicBool,
    pub calls: AtomicUsize,
}

impl FakeCounter {
    pub fn with_count(count: u64) -> Self {
        let counter = Self::default();
        counter.count.store(count, Ordering::SeqCst);
        counter
    }

    pub fn set(&self, count: u64) {
        self.count.store(count, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DocumentCounter for FakeCounter {
    async fn current_document_count(&self) -> ClientResult<u64> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(ClientError::Api("document listing unavailable (503)".to_string()));
        }
        Ok(self.count.load(Ordering::SeqCst))
    }
}

/// Counter answering from a script of `(latency, count)` pairs, one per call
#[derive(Default)]
pub struct ScriptedCounter {
    script: Mutex<VecDeque<(Duration, u64)>>,
    pub calls: AtomicUsize,
}

impl ScriptedCounter {
    pub fn push(&self, latency: Duration, count: u64) {
        self.script.lock().unwrap().push_back((latency, count));
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DocumentCounter for ScriptedCounter {
    async fn current_document_count(&self) -> ClientResult<u64> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self.script.lock().unwrap().pop_front();
        let Some((latency, count)) = next else {
            return Err(ClientError::Api("no count scripted".to_string()));
        };
        tokio::time::sleep(latency).await;
        Ok(count)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusEvent {
    Shown(String),
    Hidden,
}

#[derive(Default)]
pub struct RecordingSink {
    pub events: Mutex<Vec<StatusEvent>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<StatusEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn last(&self) -> Option<StatusEvent> {
        self.events.lock().unwrap().last().cloned()
    }
}

impl StatusSink for RecordingSink {
    fn show(&self, label: &str) {
        self.events.lock().unwrap().push(StatusEvent::Shown(label.to_string()));
    }

    fn hide(&self) {
        self.events.lock().unwrap().push(StatusEvent::Hidden);
    }
}

/// Chat backend answering with scripted results, in order
#[derive(Default)]
pub struct FakeChatBackend {
    pub responses: Mutex<VecDeque<ClientResult<WorkflowRun>>>,
    pub calls: Mutex<Vec<(String, String, String)>>,
    pub delay: Mutex<Option<Duration>>,
}

impl FakeChatBackend {
    pub fn fail_next(&self) {
        self.responses
            .lock()
            .unwrap()
            .push_back(Err(ClientError::Api("turn rejected (500)".to_string())));
    }

    pub fn calls(&self) -> Vec<(String, String, String)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatBackend for FakeChatBackend {
    async fn create_chat_turn(
        &self,
        document_id: &str,
        question: &str,
        history: &str,
    ) -> ClientResult<WorkflowRun> {
        let n = {
            let mut calls = self.calls.lock().unwrap();
            calls.push((document_id.to_string(), question.to_string(), history.to_string()));
            calls.len()
        };

        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let scripted = self.responses.lock().unwrap().pop_front();
        scripted.unwrap_or_else(|| Ok(WorkflowRun::new(format!("chat-{}", n), "run")))
    }
}

pub type ChunkSender = mpsc::UnboundedSender<ClientResult<StreamChunk>>;

/// Event streams fed by the test through channel senders.
///
/// Each `script()` call queues one stream for the next `open_event_stream`.
#[derive(Default)]
pub struct ScriptedStreams {
    pending: Mutex<VecDeque<mpsc::UnboundedReceiver<ClientResult<StreamChunk>>>>,
    pub opened: Mutex<Vec<WorkflowRun>>,
}

impl ScriptedStreams {
    pub fn script(&self) -> ChunkSender {
        let (tx, rx) = mpsc::unbounded();
        self.pending.lock().unwrap().push_back(rx);
        tx
    }

    pub fn opened(&self) -> Vec<WorkflowRun> {
        self.opened.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventStreamSource for ScriptedStreams {
    async fn open_event_stream(&self, run: &WorkflowRun) -> ClientResult<ChunkStream> {
        self.opened.lock().unwrap().push(run.clone());
        let rx = self
            .pending
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| ClientError::Stream("no stream scripted".to_string()))?;
        Ok(rx.boxed())
    }
}

pub fn chunk(kind: &str, message: Option<&str>) -> ClientResult<StreamChunk> {
    Ok(StreamChunk::new(kind, message))
}
