//! The agent session orchestrator.
//!
//! Owns the adapter registry and the active-stream registry, resolves or
//! creates threads, provisions worktrees, and drives the forwarding
//! pipeline connecting adapter sessions to persistence and observers.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use anyhow::{anyhow, Context as _};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use gantry_backend::connector::{
    AgentAdapter, SessionOptions, SessionOutcome, SessionStream, METADATA_MODEL,
    METADATA_OUTPUT_SCHEMA, METADATA_REASONING_LEVEL, METADATA_THREAD_EXTERNAL_ID,
    SESSION_EVENT_BUFFER,
};
use gantry_backend::{
    collect_diff_stats, summarize_diff_stats, DiffSummary, FileDiffStat, ThreadStore,
    WorktreeManager,
};
use gantry_domain::{
    naming, AgentEvent, ConversationEntry, EntryRole, InputSegment, Prompt, PromptSegment,
    SendRequest, Thread, ThreadStatus, UserEntryPayload, ENTRY_TYPE_USER_MESSAGE,
};

use crate::persistence::StreamRecorder;
use crate::reclaim::{self, ReclaimHandle, SweepContext};
use crate::stream::{StreamCloser, StreamError, StreamHandle};

pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Result of cancelling a stream: the owning thread and its new status.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CancelOutcome {
    pub thread_id: i64,
    pub status: ThreadStatus,
}

#[derive(Clone)]
pub(crate) struct ActiveStream {
    pub(crate) thread_id: i64,
    closer: StreamCloser,
    recorder: Arc<StreamRecorder>,
}

/// Mutex-guarded registry of running streams, keyed by stream id. Shared
/// with each stream's forwarding task, which owns the removal of its own
/// entry.
pub(crate) type ActiveStreams = Arc<Mutex<HashMap<String, ActiveStream>>>;

pub(crate) fn thread_has_active_stream(active: &ActiveStreams, thread_id: i64) -> bool {
    active
        .lock()
        .map(|streams| streams.values().any(|entry| entry.thread_id == thread_id))
        .unwrap_or(false)
}

pub struct AgentService {
    adapters: RwLock<HashMap<String, Arc<dyn AgentAdapter>>>,
    default_agent: String,
    store: Arc<dyn ThreadStore>,
    worktrees: Option<Arc<WorktreeManager>>,
    active: ActiveStreams,
    cleanup: Mutex<Option<ReclaimHandle>>,
}

impl AgentService {
    pub fn new(default_agent: impl Into<String>, store: Arc<dyn ThreadStore>) -> Self {
        Self {
            adapters: RwLock::new(HashMap::new()),
            default_agent: default_agent.into(),
            store,
            worktrees: None,
            active: Arc::new(Mutex::new(HashMap::new())),
            cleanup: Mutex::new(None),
        }
    }

    pub fn with_worktrees(mut self, manager: Arc<WorktreeManager>) -> Self {
        self.worktrees = Some(manager);
        self
    }

    /// Associates an adapter with a logical agent identifier.
    pub fn register(&self, agent_id: &str, adapter: Arc<dyn AgentAdapter>) -> anyhow::Result<()> {
        let agent_id = agent_id.trim();
        if agent_id.is_empty() {
            return Err(anyhow!("agent id is required"));
        }
        let mut adapters = self
            .adapters
            .write()
            .map_err(|_| anyhow!("adapter registry lock poisoned"))?;
        let _ = adapters.insert(agent_id.to_owned(), adapter);
        Ok(())
    }

    pub fn registered_agents(&self) -> Vec<String> {
        let Ok(adapters) = self.adapters.read() else {
            return Vec::new();
        };
        let mut ids: Vec<String> = adapters.keys().cloned().collect();
        ids.sort();
        ids
    }

    fn load_adapter(&self, agent_id: &str) -> anyhow::Result<Arc<dyn AgentAdapter>> {
        let adapters = self
            .adapters
            .read()
            .map_err(|_| anyhow!("adapter registry lock poisoned"))?;
        adapters
            .get(agent_id)
            .cloned()
            .ok_or_else(|| anyhow!("agent {agent_id} not registered"))
    }

    /// Starts streaming one turn. Returns the stream handle and a snapshot
    /// of the (possibly newly created) thread.
    ///
    /// Must be called from within a tokio runtime; the forwarding pipeline
    /// runs as a spawned task.
    pub fn send(&self, mut req: SendRequest) -> anyhow::Result<(StreamHandle, Thread)> {
        let agent_id = req
            .agent_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .unwrap_or(self.default_agent.as_str())
            .to_owned();
        if agent_id.is_empty() {
            return Err(anyhow!("agent id is required"));
        }
        let adapter = self.load_adapter(&agent_id)?;

        if req.input.trim().is_empty() && req.segments.is_empty() {
            return Err(anyhow!("input text or segments are required"));
        }

        let mut thread = self.prepare_thread(&req)?;

        // Provision the worktree before anything touches the backend, and
        // pin the turn's working directory to it.
        if let Some(manager) = &self.worktrees {
            let project = self.store.get_project_by_id(thread.project_id)?;
            let provisioned = manager.ensure_for_thread(
                Path::new(&project.path),
                thread.id,
                &thread.title,
                thread.branch_name.as_deref(),
            )?;
            let worktree_path = provisioned.worktree_path.to_string_lossy().into_owned();
            if let Err(err) = self.store.set_thread_worktree_path(thread.id, &worktree_path) {
                tracing::warn!(error = %err, thread_id = thread.id, "failed to persist worktree path");
            }
            thread.worktree_path = Some(worktree_path);
            req.thread_options.working_directory =
                Some(provisioned.working_dir.to_string_lossy().into_owned());
            req.thread_options.skip_git_repo_check = false;
        }

        // Persist the user's message before the stream starts.
        let user_text = req.user_message_text();
        if !user_text.is_empty() || !req.segments.is_empty() {
            let payload = serde_json::to_value(UserEntryPayload {
                text: user_text.clone(),
                segments: req.segments.clone(),
            })
            .context("encode user entry")?;
            let entry = self.store.create_entry(
                thread.id,
                EntryRole::User,
                ENTRY_TYPE_USER_MESSAGE,
                Some(payload),
                None,
            )?;
            self.store
                .touch_thread_activity(thread.id, entry.created_at_unix_ms)?;
            thread.last_message_at_unix_ms = Some(entry.created_at_unix_ms);
        }

        let opts = build_session_options(&thread, &req);
        let prompt = build_prompt(&req);

        let started = adapter.start(opts)?;
        if let Err(err) = started.session.send(vec![prompt]) {
            started.session.close();
            return Err(err.context("failed to submit turn"));
        }

        let stream_id = Uuid::new_v4().to_string();
        let token = CancellationToken::new();
        let closer = StreamCloser::new(token.clone(), started.session.clone());
        let recorder = Arc::new(StreamRecorder::new(self.store.clone(), thread.clone()));

        let (events_tx, events_rx) = mpsc::channel::<AgentEvent>(SESSION_EVENT_BUFFER);
        let (done_tx, done_rx) = oneshot::channel::<Result<(), StreamError>>();

        {
            let mut active = self
                .active
                .lock()
                .map_err(|_| anyhow!("active stream registry lock poisoned"))?;
            let _ = active.insert(
                stream_id.clone(),
                ActiveStream {
                    thread_id: thread.id,
                    closer: closer.clone(),
                    recorder: recorder.clone(),
                },
            );
        }

        tokio::spawn(forward_stream(
            self.active.clone(),
            stream_id.clone(),
            recorder,
            token,
            started.stream,
            events_tx,
            done_tx,
        ));

        let handle = StreamHandle::new(stream_id, events_rx, done_rx, closer);
        Ok((handle, thread))
    }

    fn prepare_thread(&self, req: &SendRequest) -> anyhow::Result<Thread> {
        if let Some(thread_id) = req.thread_id {
            let thread = self.store.get_thread(thread_id)?;
            let opts = &req.thread_options;
            let wants_update = (!opts.model.is_empty() && opts.model != thread.model)
                || (!opts.sandbox_mode.is_empty() && opts.sandbox_mode != thread.sandbox_mode)
                || (!opts.reasoning_level.is_empty()
                    && opts.reasoning_level != thread.reasoning_level);
            if wants_update {
                let model = if opts.model.is_empty() { &thread.model } else { &opts.model };
                let sandbox = if opts.sandbox_mode.is_empty() {
                    &thread.sandbox_mode
                } else {
                    &opts.sandbox_mode
                };
                let reasoning = if opts.reasoning_level.is_empty() {
                    &thread.reasoning_level
                } else {
                    &opts.reasoning_level
                };
                self.store
                    .update_thread_options(thread_id, model, sandbox, reasoning)?;
                return self.store.get_thread(thread_id);
            }
            return Ok(thread);
        }

        let project_id = req
            .project_id
            .ok_or_else(|| anyhow!("project id is required for new threads"))?;
        let title = naming::derive_thread_title(&req.input, &req.segments);
        let mut thread = self.store.create_thread(
            project_id,
            &title,
            &req.thread_options.model,
            &req.thread_options.sandbox_mode,
            &req.thread_options.reasoning_level,
        )?;
        let branch = naming::branch_for_thread(&title, thread.id);
        self.store.set_thread_branch(thread.id, &branch)?;
        thread.branch_name = Some(branch);
        Ok(thread)
    }

    /// Stops an active stream and reports the resulting thread status.
    pub fn cancel(&self, stream_id: &str) -> anyhow::Result<CancelOutcome> {
        let entry = {
            let active = self
                .active
                .lock()
                .map_err(|_| anyhow!("active stream registry lock poisoned"))?;
            active.get(stream_id).cloned()
        };
        let Some(entry) = entry else {
            return Err(anyhow!("stream {stream_id} not found"));
        };

        entry.closer.close();
        entry.recorder.record_status(ThreadStatus::Stopped);
        let thread = entry.recorder.finalize(Some(ThreadStatus::Stopped))?;
        Ok(CancelOutcome {
            thread_id: thread.id,
            status: thread.status,
        })
    }

    /// True when any active stream belongs to the thread. Used by the
    /// reclamation scan so a live worktree is never deleted.
    pub fn is_thread_streaming(&self, thread_id: i64) -> bool {
        thread_has_active_stream(&self.active, thread_id)
    }

    pub fn active_stream_count(&self) -> usize {
        self.active.lock().map(|active| active.len()).unwrap_or(0)
    }

    pub fn list_threads(&self, project_id: i64) -> anyhow::Result<Vec<Thread>> {
        self.store.list_threads_by_project(project_id)
    }

    pub fn get_thread(&self, thread_id: i64) -> anyhow::Result<Thread> {
        self.store.get_thread(thread_id)
    }

    pub fn rename_thread(&self, thread_id: i64, title: &str) -> anyhow::Result<Thread> {
        let title = title.trim();
        if title.is_empty() {
            return Err(anyhow!("thread title is required"));
        }
        self.store.update_thread_title(thread_id, title)?;
        self.store.get_thread(thread_id)
    }

    /// Deletes a thread and its transcript. The worktree is removed first,
    /// best-effort; a missing directory is an acceptable end state.
    pub fn delete_thread(&self, thread_id: i64) -> anyhow::Result<()> {
        let thread = self.store.get_thread(thread_id)?;
        if let Some(manager) = &self.worktrees
            && let Some(worktree) = thread.worktree_path.as_deref()
            && !worktree.trim().is_empty()
            && let Err(err) = manager.remove_for_thread(Path::new(worktree))
        {
            tracing::debug!(error = %err, thread_id, "worktree removal skipped");
        }
        self.store.delete_thread(thread_id)
    }

    pub fn load_thread_conversation(
        &self,
        thread_id: i64,
    ) -> anyhow::Result<Vec<ConversationEntry>> {
        let _ = self.store.get_thread(thread_id)?;
        self.store.list_entries(thread_id)
    }

    pub fn list_thread_diff_stats(&self, thread_id: i64) -> anyhow::Result<Vec<FileDiffStat>> {
        let thread = self.store.get_thread(thread_id)?;
        let worktree = thread
            .worktree_path
            .as_deref()
            .map(str::trim)
            .filter(|path| !path.is_empty())
            .ok_or_else(|| anyhow!("thread {thread_id} has no worktree"))?;
        collect_diff_stats(Path::new(worktree))
    }

    /// Aggregated diff summary for a thread's worktree; None when the
    /// worktree is absent, unreadable, or unchanged.
    pub fn diff_summary(&self, thread: &Thread) -> Option<DiffSummary> {
        let worktree = thread.worktree_path.as_deref()?.trim();
        if worktree.is_empty() {
            return None;
        }
        let stats = collect_diff_stats(Path::new(worktree)).ok()?;
        let summary = summarize_diff_stats(&stats);
        (!summary.is_empty()).then_some(summary)
    }

    pub fn record_pr_url(&self, thread_id: i64, url: &str) -> anyhow::Result<()> {
        self.store.set_thread_pr_url(thread_id, url)
    }

    fn sweep_context(&self) -> Option<SweepContext> {
        let manager = self.worktrees.as_ref()?;
        Some(SweepContext::new(
            self.store.clone(),
            manager.clone(),
            self.active.clone(),
        ))
    }

    /// Launches the periodic orphan-worktree reclamation task. Idempotent;
    /// a no-op when no worktree manager is configured.
    pub fn start_worktree_cleanup(&self, interval: Duration) {
        let Some(context) = self.sweep_context() else {
            return;
        };
        let interval = if interval.is_zero() {
            DEFAULT_CLEANUP_INTERVAL
        } else {
            interval
        };
        let Ok(mut cleanup) = self.cleanup.lock() else {
            return;
        };
        if cleanup.is_some() {
            return;
        }
        *cleanup = Some(reclaim::spawn_reclaimer(context, interval));
    }

    /// Runs one reclamation pass immediately. The periodic task performs
    /// the same pass on every tick.
    pub fn reclaim_orphan_worktrees(&self) {
        if let Some(context) = self.sweep_context() {
            reclaim::sweep_orphan_worktrees(&context);
        }
    }

    /// Stops the reclamation task if running. Idempotent.
    pub fn stop_worktree_cleanup(&self) {
        if let Ok(mut cleanup) = self.cleanup.lock()
            && let Some(handle) = cleanup.take()
        {
            handle.stop();
        }
    }
}

/// One task per stream: persist each raw event, then forward it to the
/// external channel, then finalize exactly once. Removal of the active
/// registry entry is owned by this task alone.
async fn forward_stream(
    active: ActiveStreams,
    stream_id: String,
    recorder: Arc<StreamRecorder>,
    token: CancellationToken,
    mut session_stream: SessionStream,
    events_tx: mpsc::Sender<AgentEvent>,
    done_tx: oneshot::Sender<Result<(), StreamError>>,
) {
    let mut canceled = false;
    let mut forwarding = true;

    loop {
        if token.is_cancelled() {
            canceled = true;
            break;
        }
        let Some(event) = session_stream.events.recv().await else {
            break;
        };

        // Durably record first so observers never get ahead of the store.
        let persist_recorder = recorder.clone();
        let persist_event = event.clone();
        if let Err(err) =
            tokio::task::spawn_blocking(move || persist_recorder.process_event(&persist_event))
                .await
        {
            tracing::error!(error = %err, stream_id, "persistence task failed");
        }

        if !forwarding {
            continue;
        }
        tokio::select! {
            sent = events_tx.send(event) => {
                if sent.is_err() {
                    // Consumer went away; keep draining for persistence.
                    forwarding = false;
                }
            }
            _ = token.cancelled() => {
                canceled = true;
                break;
            }
        }
    }

    let mut failure: Option<String> = None;
    match session_stream.done.try_recv() {
        Ok(SessionOutcome::Failed { message }) => failure = Some(message),
        Ok(SessionOutcome::Canceled) => canceled = true,
        Ok(SessionOutcome::Completed) | Err(_) => {}
    }
    if token.is_cancelled() {
        canceled = true;
    }

    let status = if canceled {
        Some(ThreadStatus::Stopped)
    } else {
        failure.as_ref().map(|_| ThreadStatus::Failed)
    };

    let finalize_recorder = recorder.clone();
    let finalize_result =
        tokio::task::spawn_blocking(move || finalize_recorder.finalize(status)).await;
    let finalize_error = match finalize_result {
        Ok(Ok(_)) => None,
        Ok(Err(err)) => {
            tracing::error!(error = %err, stream_id, "finalize failed");
            Some(format!("{err:#}"))
        }
        Err(err) => {
            tracing::error!(error = %err, stream_id, "finalize task panicked");
            Some(err.to_string())
        }
    };

    // The forwarding task is the sole owner of its registry entry.
    if let Ok(mut streams) = active.lock() {
        let _ = streams.remove(&stream_id);
    }

    let outcome = if canceled {
        Err(StreamError::Canceled)
    } else if let Some(message) = failure {
        Err(StreamError::Failed(message))
    } else if let Some(message) = finalize_error {
        Err(StreamError::Failed(message))
    } else {
        Ok(())
    };
    let _ = done_tx.send(outcome);
}

fn build_session_options(thread: &Thread, req: &SendRequest) -> SessionOptions {
    let mut opts = SessionOptions::for_thread(thread.clone());
    if let Some(dir) = req
        .thread_options
        .working_directory
        .as_deref()
        .map(str::trim)
        .filter(|dir| !dir.is_empty())
    {
        opts.working_directory = Some(dir.into());
    }
    if !req.thread_options.sandbox_mode.trim().is_empty() {
        opts.sandbox_mode = req.thread_options.sandbox_mode.clone();
    }
    opts.skip_git_repo_check = req.thread_options.skip_git_repo_check;

    if !req.thread_options.model.trim().is_empty() {
        let _ = opts.metadata.insert(
            METADATA_MODEL.to_owned(),
            serde_json::Value::String(req.thread_options.model.clone()),
        );
    }
    if !req.thread_options.reasoning_level.trim().is_empty() {
        let _ = opts.metadata.insert(
            METADATA_REASONING_LEVEL.to_owned(),
            serde_json::Value::String(req.thread_options.reasoning_level.clone()),
        );
    }
    if let Some(external_id) = thread.external_id.as_deref() {
        let _ = opts.metadata.insert(
            METADATA_THREAD_EXTERNAL_ID.to_owned(),
            serde_json::Value::String(external_id.to_owned()),
        );
    }
    opts
}

fn build_prompt(req: &SendRequest) -> Prompt {
    let mut segments = Vec::new();
    let input = req.input.trim();
    if !input.is_empty() {
        segments.push(PromptSegment::text(input));
    }
    for segment in &req.segments {
        match segment {
            InputSegment::Text { text } => {
                if !text.trim().is_empty() {
                    segments.push(PromptSegment::text(text.clone()));
                }
            }
            InputSegment::Image { image_path } => {
                if !image_path.trim().is_empty() {
                    segments.push(PromptSegment::local_image(image_path.clone()));
                }
            }
        }
    }

    let mut prompt = Prompt::user(segments);
    if let Some(schema) = req
        .turn_options
        .as_ref()
        .and_then(|turn| turn.output_schema.clone())
    {
        let mut metadata = serde_json::Map::new();
        let _ = metadata.insert(METADATA_OUTPUT_SCHEMA.to_owned(), schema);
        prompt.metadata = Some(serde_json::Value::Object(metadata));
    }
    prompt
}
