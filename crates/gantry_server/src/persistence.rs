//! Incremental, idempotent persistence of one stream's conversation state.
//!
//! Events are durably recorded before they are forwarded to observers, so
//! persisted state never lags what a consumer has already seen. Terminal
//! signals accumulate in memory and are written once, by [`StreamRecorder::finalize`].

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::SystemTime;

use anyhow::Context as _;
use gantry_backend::ThreadStore;
use gantry_domain::time::now_unix_millis;
use gantry_domain::{
    AgentEvent, AgentItem, EntryRole, EventKind, SystemEntryPayload, Thread, ThreadStatus,
    TokenUsage, ENTRY_TYPE_SYSTEM_MESSAGE,
};

struct RecorderState {
    thread: Thread,
    items_loaded: bool,
    seen_item_ids: HashSet<String>,
    final_status: Option<ThreadStatus>,
    last_activity_unix_ms: Option<i64>,
    final_agent_text: String,
    reasoning_parts: Vec<String>,
    usage: Option<TokenUsage>,
    final_error: String,
    agent_message_persisted: bool,
    reasoning_persisted: bool,
    finalized: bool,
}

pub struct StreamRecorder {
    store: Arc<dyn ThreadStore>,
    state: Mutex<RecorderState>,
}

impl StreamRecorder {
    pub fn new(store: Arc<dyn ThreadStore>, thread: Thread) -> Self {
        Self {
            store,
            state: Mutex::new(RecorderState {
                thread,
                items_loaded: false,
                seen_item_ids: HashSet::new(),
                final_status: None,
                last_activity_unix_ms: None,
                final_agent_text: String::new(),
                reasoning_parts: Vec::new(),
                usage: None,
                final_error: String::new(),
                agent_message_persisted: false,
                reasoning_persisted: false,
                finalized: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RecorderState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn thread_snapshot(&self) -> Thread {
        self.lock().thread.clone()
    }

    /// Applies one raw adapter event to durable state.
    pub fn process_event(&self, event: &AgentEvent) {
        match &event.kind {
            EventKind::SessionStarted => {
                if let Some(thread_id) = event.thread_id.as_deref() {
                    self.record_external_id(thread_id);
                }
            }
            EventKind::ItemStarted | EventKind::ItemUpdated | EventKind::ItemCompleted => {
                if let Some(item) = &event.item {
                    let _ = self.store_agent_item(item);
                }
            }
            EventKind::TurnCompleted => {
                self.record_status(ThreadStatus::Completed);
                self.record_usage(event.usage);
            }
            EventKind::TurnFailed | EventKind::SessionError => {
                self.record_status(ThreadStatus::Failed);
                self.record_usage(event.usage);
                let message = event
                    .error
                    .as_ref()
                    .map(|error| error.message.as_str())
                    .or(event.message.as_deref())
                    .unwrap_or_default();
                self.record_error(message);
            }
            _ => {}
        }

        // Stray informational messages become system entries, except on
        // terminal kinds (handled above) and item events (already stored).
        if event.item.is_none()
            && !matches!(
                event.kind,
                EventKind::TurnCompleted
                    | EventKind::TurnFailed
                    | EventKind::SessionError
                    | EventKind::SessionStarted
            )
            && let Some(message) = event.message.as_deref()
            && !message.trim().is_empty()
        {
            let _ = self.create_system_entry("info", message, None);
        }
    }

    /// First event carrying a backend thread id wins; later ids are ignored.
    fn record_external_id(&self, external_id: &str) {
        let external_id = external_id.trim();
        if external_id.is_empty() {
            return;
        }
        let thread_id = {
            let state = self.lock();
            if state.thread.external_id.is_some() {
                return;
            }
            state.thread.id
        };
        match self.store.set_thread_external_id(thread_id, external_id) {
            Ok(_) => {
                if let Ok(updated) = self.store.get_thread(thread_id) {
                    self.lock().thread = updated;
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, thread_id, "failed to record external thread id");
            }
        }
    }

    /// Persists one agent item. Items with a non-empty id are written at
    /// most once per thread; the first delivery wins. Returns the entry's
    /// creation time when a row was written.
    fn store_agent_item(&self, item: &AgentItem) -> Option<i64> {
        let id = item.id().trim().to_owned();
        if !id.is_empty() && self.has_persisted_item(&id) {
            return None;
        }
        let payload = serde_json::to_value(item).ok()?;
        let thread_id = self.lock().thread.id;
        let now = now_unix_millis();
        if let Err(err) = self.store.create_entry(
            thread_id,
            EntryRole::Agent,
            item.entry_kind(),
            Some(payload),
            Some(now),
        ) {
            tracing::warn!(error = %err, thread_id, "failed to persist agent item");
            return None;
        }

        let mut state = self.lock();
        if !id.is_empty() {
            let _ = state.seen_item_ids.insert(id);
        }
        state.last_activity_unix_ms = Some(now);
        match item {
            AgentItem::AgentMessage { text, .. } => {
                state.agent_message_persisted = true;
                if !text.trim().is_empty() {
                    state.final_agent_text = text.clone();
                }
            }
            AgentItem::Reasoning { text, .. } => {
                state.reasoning_persisted = true;
                if !text.trim().is_empty() {
                    state.reasoning_parts.push(text.clone());
                }
            }
            _ => {}
        }
        Some(now)
    }

    fn has_persisted_item(&self, id: &str) -> bool {
        self.ensure_seen_items();
        self.lock().seen_item_ids.contains(id)
    }

    /// Loads the ids of already-persisted agent items once, on first need.
    fn ensure_seen_items(&self) {
        let thread_id = {
            let state = self.lock();
            if state.items_loaded {
                return;
            }
            state.thread.id
        };

        let mut cache = HashSet::new();
        match self.store.list_entries(thread_id) {
            Ok(entries) => {
                for entry in entries {
                    if entry.role != EntryRole::Agent {
                        continue;
                    }
                    let Some(payload) = entry.payload else { continue };
                    let Ok(item) = serde_json::from_value::<AgentItem>(payload) else {
                        continue;
                    };
                    let id = item.id().trim().to_owned();
                    if !id.is_empty() {
                        let _ = cache.insert(id);
                    }
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, thread_id, "failed to load existing agent items");
            }
        }

        let mut state = self.lock();
        state.seen_item_ids.extend(cache);
        state.items_loaded = true;
    }

    pub fn record_status(&self, status: ThreadStatus) {
        self.lock().final_status = Some(status);
    }

    fn record_usage(&self, usage: Option<TokenUsage>) {
        if let Some(usage) = usage {
            self.lock().usage = Some(usage);
        }
    }

    fn record_error(&self, message: &str) {
        let message = message.trim();
        if message.is_empty() {
            return;
        }
        self.lock().final_error = message.to_owned();
    }

    fn create_system_entry(
        &self,
        tone: &str,
        message: &str,
        meta: Option<serde_json::Value>,
    ) -> Option<i64> {
        if message.trim().is_empty() {
            return None;
        }
        let payload = serde_json::to_value(SystemEntryPayload {
            tone: tone.to_owned(),
            message: message.to_owned(),
            meta,
        })
        .ok()?;
        let thread_id = self.lock().thread.id;
        let now = now_unix_millis();
        if let Err(err) = self.store.create_entry(
            thread_id,
            EntryRole::System,
            ENTRY_TYPE_SYSTEM_MESSAGE,
            Some(payload),
            Some(now),
        ) {
            tracing::warn!(error = %err, thread_id, "failed to persist system entry");
            return None;
        }
        self.lock().last_activity_unix_ms = Some(now);
        Some(now)
    }

    /// Converts accumulated state into durable records and a terminal
    /// status, exactly once. The normal completion path and an explicit
    /// cancel may both call this; the first caller wins.
    pub fn finalize(&self, status: Option<ThreadStatus>) -> anyhow::Result<Thread> {
        let (thread, resolved_status, snapshot) = {
            let mut state = self.lock();
            if state.finalized {
                return Ok(state.thread.clone());
            }
            state.finalized = true;
            let resolved = status
                .or(state.final_status)
                .unwrap_or(ThreadStatus::Completed);
            let snapshot = FinalizeSnapshot {
                last_activity: state.last_activity_unix_ms,
                final_text: state.final_agent_text.clone(),
                reasoning: state.reasoning_parts.clone(),
                usage: state.usage,
                final_error: state.final_error.clone(),
                agent_message_persisted: state.agent_message_persisted,
                reasoning_persisted: state.reasoning_persisted,
            };
            (state.thread.clone(), resolved, snapshot)
        };

        let mut latest: Option<i64> = None;
        let mut track = |created: Option<i64>| {
            if let Some(at) = created
                && latest.is_none_or(|current| at > current)
            {
                latest = Some(at);
            }
        };

        if !snapshot.final_text.trim().is_empty() && !snapshot.agent_message_persisted {
            track(self.store_agent_item(&AgentItem::AgentMessage {
                id: String::new(),
                text: snapshot.final_text.clone(),
            }));
        }
        if !snapshot.reasoning.is_empty() && !snapshot.reasoning_persisted {
            track(self.store_agent_item(&AgentItem::Reasoning {
                id: String::new(),
                text: snapshot.reasoning.join("\n"),
            }));
        }
        if let Some(usage) = snapshot.usage {
            let message = format!(
                "Token usage: {} in / {} out",
                usage.input_tokens, usage.output_tokens
            );
            let meta = serde_json::json!({
                "inputTokens": usage.input_tokens,
                "cachedInputTokens": usage.cached_input_tokens,
                "outputTokens": usage.output_tokens,
            });
            track(self.create_system_entry("info", &message, Some(meta)));
        }
        if !snapshot.final_error.trim().is_empty() {
            track(self.create_system_entry("error", &snapshot.final_error, None));
        }

        let last_message_at = latest
            .or(snapshot.last_activity)
            .unwrap_or_else(now_unix_millis);

        self.store
            .update_thread_status(thread.id, resolved_status, Some(last_message_at))
            .context("update thread status")?;
        let mut updated = self
            .store
            .get_thread(thread.id)
            .context("reload finalized thread")?;

        // Best-effort enrichment: record the newest session transcript if
        // none is known yet.
        if updated.conversation_path.is_none()
            && let Some(worktree) = updated.worktree_path.as_deref()
            && let Some(path) = find_latest_transcript(Path::new(worktree))
        {
            if let Err(err) = self.store.set_thread_conversation_path(updated.id, &path) {
                tracing::debug!(error = %err, "failed to record transcript path");
            } else {
                updated.conversation_path = Some(path);
            }
        }

        self.lock().thread = updated.clone();
        Ok(updated)
    }
}

struct FinalizeSnapshot {
    last_activity: Option<i64>,
    final_text: String,
    reasoning: Vec<String>,
    usage: Option<TokenUsage>,
    final_error: String,
    agent_message_persisted: bool,
    reasoning_persisted: bool,
}

/// Most recently modified `.codex/sessions/*.jsonl` file under the
/// worktree, if any.
fn find_latest_transcript(worktree: &Path) -> Option<String> {
    let mut latest: Option<(SystemTime, String)> = None;
    for entry in walkdir::WalkDir::new(worktree)
        .follow_links(false)
        .into_iter()
        .filter_map(Result::ok)
    {
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        if !path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("jsonl"))
        {
            continue;
        }
        let raw = path.to_string_lossy();
        if !raw.contains("/.codex/sessions/") {
            continue;
        }
        let Some(modified) = entry.metadata().ok().and_then(|meta| meta.modified().ok()) else {
            continue;
        };
        if latest
            .as_ref()
            .is_none_or(|(current, _)| modified > *current)
        {
            latest = Some((modified, raw.into_owned()));
        }
    }
    latest.map(|(_, path)| path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_backend::SqliteStore;
    use gantry_domain::EventKind;

    fn recorder() -> (tempfile::TempDir, Arc<dyn ThreadStore>, StreamRecorder) {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store: Arc<dyn ThreadStore> =
            Arc::new(SqliteStore::open(tmp.path().join("gantry.db")).expect("store"));
        let project = store.upsert_project("/tmp/proj", None).expect("project");
        let thread = store
            .create_thread(project.id, "t", "", "", "")
            .expect("thread");
        let rec = StreamRecorder::new(store.clone(), thread);
        (tmp, store, rec)
    }

    fn message_event(kind: EventKind, id: &str, text: &str) -> AgentEvent {
        AgentEvent::item_event(
            kind,
            AgentItem::AgentMessage {
                id: id.to_owned(),
                text: text.to_owned(),
            },
        )
    }

    #[test]
    fn duplicate_item_ids_are_persisted_once() {
        let (_tmp, store, rec) = recorder();
        rec.process_event(&message_event(EventKind::ItemStarted, "m1", "partial"));
        rec.process_event(&message_event(EventKind::ItemUpdated, "m1", "longer text"));
        rec.process_event(&message_event(EventKind::ItemCompleted, "m1", "final"));

        let thread = rec.thread_snapshot();
        let entries = store.list_entries(thread.id).expect("entries");
        assert_eq!(entries.len(), 1, "one entry per item id");
    }

    #[test]
    fn items_without_ids_are_always_persisted() {
        let (_tmp, store, rec) = recorder();
        rec.process_event(&message_event(EventKind::ItemUpdated, "", "a"));
        rec.process_event(&message_event(EventKind::ItemUpdated, "", "b"));
        let thread = rec.thread_snapshot();
        assert_eq!(store.list_entries(thread.id).expect("entries").len(), 2);
    }

    #[test]
    fn existing_entries_suppress_replayed_ids_across_recorders() {
        let (_tmp, store, rec) = recorder();
        rec.process_event(&message_event(EventKind::ItemCompleted, "m1", "final"));
        let thread = rec.thread_snapshot();

        // A fresh recorder on the same thread must load the seen ids lazily.
        let rec2 = StreamRecorder::new(store.clone(), thread.clone());
        rec2.process_event(&message_event(EventKind::ItemCompleted, "m1", "replayed"));
        assert_eq!(store.list_entries(thread.id).expect("entries").len(), 1);
    }

    #[test]
    fn external_id_capture_is_first_write_wins() {
        let (_tmp, store, rec) = recorder();
        let mut started = AgentEvent::of_kind(EventKind::SessionStarted);
        started.thread_id = Some("thr_first".to_owned());
        rec.process_event(&started);

        let mut second = AgentEvent::of_kind(EventKind::SessionStarted);
        second.thread_id = Some("thr_second".to_owned());
        rec.process_event(&second);

        let thread = store.get_thread(rec.thread_snapshot().id).expect("thread");
        assert_eq!(thread.external_id.as_deref(), Some("thr_first"));
    }

    #[test]
    fn finalize_runs_once_and_writes_synthetic_entries() {
        let (_tmp, store, rec) = recorder();
        let mut completed = AgentEvent::of_kind(EventKind::TurnCompleted);
        completed.usage = Some(TokenUsage {
            input_tokens: 10,
            cached_input_tokens: 2,
            output_tokens: 20,
        });
        rec.process_event(&completed);

        let finalized = rec.finalize(None).expect("finalize");
        assert_eq!(finalized.status, ThreadStatus::Completed);
        assert!(finalized.last_message_at_unix_ms.is_some());

        let entries = store.list_entries(finalized.id).expect("entries");
        assert_eq!(entries.len(), 1, "usage summary entry");
        assert_eq!(entries[0].role, EntryRole::System);

        // A second finalize is a no-op, even with a different status.
        let again = rec.finalize(Some(ThreadStatus::Failed)).expect("finalize again");
        assert_eq!(again.status, ThreadStatus::Completed);
        assert_eq!(store.list_entries(finalized.id).expect("entries").len(), 1);
    }

    #[test]
    fn finalize_prefers_explicit_status_over_accumulated() {
        let (_tmp, _store, rec) = recorder();
        rec.process_event(&AgentEvent::of_kind(EventKind::TurnCompleted));
        let finalized = rec.finalize(Some(ThreadStatus::Stopped)).expect("finalize");
        assert_eq!(finalized.status, ThreadStatus::Stopped);
    }

    #[test]
    fn failed_turns_record_an_error_entry() {
        let (_tmp, store, rec) = recorder();
        rec.process_event(&AgentEvent::error_event(
            EventKind::TurnFailed,
            "model exploded",
        ));
        let finalized = rec.finalize(None).expect("finalize");
        assert_eq!(finalized.status, ThreadStatus::Failed);

        let entries = store.list_entries(finalized.id).expect("entries");
        let error_entry = entries
            .iter()
            .find(|entry| entry.role == EntryRole::System)
            .expect("error entry");
        let payload: SystemEntryPayload =
            serde_json::from_value(error_entry.payload.clone().expect("payload")).expect("decode");
        assert_eq!(payload.tone, "error");
        assert_eq!(payload.message, "model exploded");
    }

    #[test]
    fn streamed_chunks_do_not_duplicate_on_finalize() {
        let (_tmp, store, rec) = recorder();
        // Streamed text chunks carry no id and no discrete agent message is
        // ever completed; finalize should materialize one.
        rec.process_event(&message_event(EventKind::ItemUpdated, "", "streamed tail"));
        let before = store
            .list_entries(rec.thread_snapshot().id)
            .expect("entries")
            .len();
        let finalized = rec.finalize(None).expect("finalize");
        // The chunk itself was persisted, so no synthetic duplicate.
        assert_eq!(store.list_entries(finalized.id).expect("entries").len(), before);
    }
}
