//! Status Projector
//!
//! Turns the number of active research jobs into a rotating, human-readable
//! label. It only ever reads the queue length it is handed; nothing here feeds
//! back into the queue.

use rand::seq::SliceRandom;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};

/// Phrases the indicator rotates through while jobs are active
pub const STATUS_PHRASES: &[&str] = &[
    "Researching",
    "Gathering sources",
    "Analyzing findings",
    "Cross-checking data",
    "Drafting document",
    "Synthesizing insights",
];

/// Where the status indicator is displayed
pub trait StatusSink: Send + Sync {
    fn show(&self, label: &str);
    fn hide(&self);
}

pub fn status_label(phrase: &str, queue_len: usize) -> String {
    format!("{} ({}) active", phrase, queue_len)
}

fn pick_phrase() -> &'static str {
    STATUS_PHRASES
        .choose(&mut rand::thread_rng())
        .copied()
        .unwrap_or("Researching")
}

struct ProjectorState {
    queue_len: usize,
    phrase: &'static str,
    rotation: Option<JoinHandle<()>>,
}

pub struct StatusProjector {
    state: Arc<Mutex<ProjectorState>>,
    sink: Arc<dyn StatusSink>,
    rotation_interval: Duration,
}

impl StatusProjector {
    pub fn new(sink: Arc<dyn StatusSink>, rotation_interval: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(ProjectorState {
                queue_len: 0,
                phrase: STATUS_PHRASES[0],
                rotation: None,
            })),
            sink,
            rotation_interval,
        }
    }

    /// Show or hide the indicator for `queue_len` active jobs.
    ///
    /// Must be called from within a tokio runtime: the first non-zero render
    /// starts the rotation timer.
    pub fn render(&self, queue_len: usize) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.queue_len = queue_len;

        if queue_len == 0 {
            if let Some(rotation) = state.rotation.take() {
                rotation.abort();
            }
            self.sink.hide();
            return;
        }

        if state.rotation.is_none() {
            state.phrase = pick_phrase();
            state.rotation = Some(self.spawn_rotation());
        }
        self.sink.show(&status_label(state.phrase, queue_len));
    }

    pub fn is_rotating(&self) -> bool {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.rotation.is_some()
    }

    fn spawn_rotation(&self) -> JoinHandle<()> {
        let state: Weak<Mutex<ProjectorState>> = Arc::downgrade(&self.state);
        let sink = Arc::clone(&self.sink);
        let period = self.rotation_interval;

        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            loop {
                ticker.tick().await;
                let Some(state) = state.upgrade() else { break };
                let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
                if state.queue_len == 0 {
                    break;
                }
                state.phrase = pick_phrase();
                sink.show(&status_label(state.phrase, state.queue_len));
            }
        })
    }
}

impl Drop for StatusProjector {
    fn drop(&mut self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(rotation) = state.rotation.take() {
            rotation.abort();
        }
    }
}
