//! Debounced, bounded admission into the image generation stage.
//!
//! A request moves `Submitted -> Accepted -> Dispatched -> Completed | Failed`.
//! Failing either the debounce or the capacity check sends it straight to
//! `Dropped`; nothing about a dropped request is kept beyond a log line.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, info};

use crate::clock::Clock;

/// One unit of work for the generation worker.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub request_id: String,
    pub keywords: Vec<String>,
    pub origin_text: String,
    pub topic_score: f64,
    /// Set by the queue on acceptance.
    pub enqueue_time: f64,
}

impl GenerationRequest {
    pub fn new(
        request_id: impl Into<String>,
        keywords: Vec<String>,
        origin_text: impl Into<String>,
        topic_score: f64,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            keywords,
            origin_text: origin_text.into(),
            topic_score,
            enqueue_time: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Submitted,
    Accepted,
    Dispatched,
    Completed,
    Failed,
    Dropped,
}

impl RequestState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Submitted => "submitted",
            Self::Accepted => "accepted",
            Self::Dispatched => "dispatched",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Dropped => "dropped",
        }
    }
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a request was not admitted.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Rejection {
    #[error("debounced: {elapsed:.2}s since last accepted request (minimum {debounce:.2}s)")]
    Debounced { elapsed: f64, debounce: f64 },

    #[error("queue full: {len}/{max}")]
    Backlog { len: usize, max: usize },
}

impl Rejection {
    /// Short reason for logs and metric labels.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Debounced { .. } => "debounced",
            Self::Backlog { .. } => "backlog",
        }
    }
}

struct QueueState {
    items: VecDeque<GenerationRequest>,
    last_enqueue_time: Option<f64>,
}

/// Bounded FIFO with a debounce on acceptance.
///
/// Producers call [`try_enqueue`](Self::try_enqueue) from the stage loop;
/// the single generation worker waits in
/// [`dequeue_blocking`](Self::dequeue_blocking).
pub struct AdmissionQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    debounce_secs: f64,
    max_queue: usize,
    clock: Arc<dyn Clock>,
}

impl AdmissionQueue {
    pub fn new(debounce_secs: f64, max_queue: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                last_enqueue_time: None,
            }),
            notify: Notify::new(),
            debounce_secs: debounce_secs.max(0.0),
            max_queue: max_queue.max(1),
            clock,
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn debounce_secs(&self) -> f64 {
        self.debounce_secs
    }

    pub fn max_queue(&self) -> usize {
        self.max_queue
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run both admission checks and queue the request if they pass.
    pub fn admit(&self, mut request: GenerationRequest) -> Result<(), Rejection> {
        let now = self.clock.now();
        {
            let mut state = self.lock();
            if let Some(last) = state.last_enqueue_time {
                let elapsed = now - last;
                if elapsed < self.debounce_secs {
                    return Err(Rejection::Debounced {
                        elapsed,
                        debounce: self.debounce_secs,
                    });
                }
            }
            if state.items.len() >= self.max_queue {
                return Err(Rejection::Backlog {
                    len: state.items.len(),
                    max: self.max_queue,
                });
            }
            request.enqueue_time = now;
            state.last_enqueue_time = Some(now);
            state.items.push_back(request);
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Returns false when the request was dropped.
    pub fn try_enqueue(&self, request: GenerationRequest) -> bool {
        let request_id = request.request_id.clone();
        match self.admit(request) {
            Ok(()) => {
                debug!(%request_id, state = %RequestState::Accepted, "Generation request queued");
                true
            }
            Err(reason) => {
                info!(%request_id, state = %RequestState::Dropped, %reason, "Generation request dropped");
                false
            }
        }
    }

    /// Wait up to `timeout` for the next request.
    ///
    /// Returns `None` on timeout; the caller loops.
    pub async fn dequeue_blocking(&self, timeout: Duration) -> Option<GenerationRequest> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            if let Some(request) = self.lock().items.pop_front() {
                return Some(request);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.lock().items.pop_front();
            }
        }
    }
}
