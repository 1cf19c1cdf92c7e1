//! Handle to one running agent turn.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use gantry_backend::connector::AgentSession;
use gantry_domain::AgentEvent;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

/// Terminal error of a stream. Cancellation is its own variant so callers
/// never mistake a user-requested stop for a backend failure.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum StreamError {
    Canceled,
    Failed(String),
}

impl std::fmt::Display for StreamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamError::Canceled => write!(f, "stream canceled"),
            StreamError::Failed(message) => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for StreamError {}

/// Do-once closer shared between the stream handle and the orchestrator's
/// active-stream registry. Closing cancels the forwarding task's token and
/// shuts the adapter session down; in-flight sends unblock.
#[derive(Clone)]
pub(crate) struct StreamCloser {
    token: CancellationToken,
    session: Arc<dyn AgentSession>,
    closed: Arc<AtomicBool>,
}

impl StreamCloser {
    pub(crate) fn new(token: CancellationToken, session: Arc<dyn AgentSession>) -> Self {
        Self {
            token,
            session,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub(crate) fn close(&self) {
        if self
            .closed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.token.cancel();
            self.session.close();
        }
    }
}

/// Caller-facing side of a stream: the generated id, the event channel,
/// the single-fire completion signal, and the close function.
pub struct StreamHandle {
    id: String,
    events: mpsc::Receiver<AgentEvent>,
    done: Option<oneshot::Receiver<Result<(), StreamError>>>,
    wait_result: Option<Result<(), StreamError>>,
    closer: StreamCloser,
}

impl StreamHandle {
    pub(crate) fn new(
        id: String,
        events: mpsc::Receiver<AgentEvent>,
        done: oneshot::Receiver<Result<(), StreamError>>,
        closer: StreamCloser,
    ) -> Self {
        Self {
            id,
            events,
            done: Some(done),
            wait_result: None,
            closer,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Next forwarded event; None once the stream has ended.
    pub async fn next_event(&mut self) -> Option<AgentEvent> {
        self.events.recv().await
    }

    /// Idempotent close: cancels the stream and the underlying session.
    pub fn close(&self) {
        self.closer.close();
    }

    /// Blocks until the stream finishes and returns its terminal result.
    /// Safe to call repeatedly; later calls return the cached result.
    pub async fn wait(&mut self) -> Result<(), StreamError> {
        if let Some(result) = &self.wait_result {
            return result.clone();
        }
        let result = match self.done.take() {
            // A dropped sender means the forwarding task ended without an
            // explicit verdict; report a clean completion.
            Some(done) => done.await.unwrap_or(Ok(())),
            None => Ok(()),
        };
        self.wait_result = Some(result.clone());
        result
    }
}

impl std::fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamHandle").field("id", &self.id).finish()
    }
}
