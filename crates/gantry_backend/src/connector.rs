//! Uniform contract over heterogeneous agent backends.
//!
//! An adapter turns [`SessionOptions`] into a live session plus its event
//! stream. Whatever the backend, the stream obeys the same rules: events
//! are normalized [`AgentEvent`]s, the channel closes exactly once after a
//! terminal event, and the `done` signal reports how the session ended
//! without conflating a user-requested cancel with a backend failure.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use gantry_domain::{AgentEvent, CapabilitySet, Prompt, Thread};
use tokio::sync::{mpsc, oneshot};

/// Buffered capacity of a session's event channel.
pub const SESSION_EVENT_BUFFER: usize = 256;

pub const METADATA_MODEL: &str = "model";
pub const METADATA_THREAD_EXTERNAL_ID: &str = "threadExternalId";
pub const METADATA_OUTPUT_SCHEMA: &str = "outputSchema";
pub const METADATA_REASONING_LEVEL: &str = "reasoningLevel";

/// Contextual data required to open a session.
#[derive(Clone, Debug)]
pub struct SessionOptions {
    pub thread: Thread,
    pub working_directory: Option<PathBuf>,
    pub sandbox_mode: String,
    pub skip_git_repo_check: bool,
    pub env: HashMap<String, String>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl SessionOptions {
    pub fn for_thread(thread: Thread) -> Self {
        let working_directory = thread.worktree_path.as_ref().map(PathBuf::from);
        let sandbox_mode = thread.sandbox_mode.clone();
        Self {
            thread,
            working_directory,
            sandbox_mode,
            skip_git_repo_check: false,
            env: HashMap::new(),
            metadata: serde_json::Map::new(),
        }
    }

    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key)?.as_str()
    }

    /// Backend-assigned thread identifier used for resumption, from the
    /// thread record or the request metadata.
    pub fn external_thread_id(&self) -> Option<String> {
        if let Some(id) = self.thread.external_id.as_deref() {
            let trimmed = id.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_owned());
            }
        }
        self.metadata_str(METADATA_THREAD_EXTERNAL_ID)
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_owned)
    }
}

/// How a session's underlying process or call ended.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SessionOutcome {
    Completed,
    Canceled,
    Failed { message: String },
}

/// Receiving side of a session: the normalized event channel and the
/// single-fire completion signal.
pub struct SessionStream {
    pub events: mpsc::Receiver<AgentEvent>,
    pub done: oneshot::Receiver<SessionOutcome>,
}

/// Live interaction with a backend agent.
pub trait AgentSession: Send + Sync {
    /// Submits one turn. Rejects when the session is closed or a turn is
    /// already running.
    fn send(&self, prompts: Vec<Prompt>) -> anyhow::Result<()>;
    fn capabilities(&self) -> CapabilitySet;
    /// Idempotent; terminates the underlying process or call and unblocks
    /// any in-flight send.
    fn close(&self);
}

pub struct StartedSession {
    pub session: Arc<dyn AgentSession>,
    pub stream: SessionStream,
}

impl std::fmt::Debug for StartedSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StartedSession").finish_non_exhaustive()
    }
}

/// A pluggable backend integration.
pub trait AgentAdapter: Send + Sync {
    fn id(&self) -> &str;
    fn capabilities(&self) -> CapabilitySet;
    fn start(&self, opts: SessionOptions) -> anyhow::Result<StartedSession>;
}
