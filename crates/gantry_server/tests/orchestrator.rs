//! End-to-end orchestrator behavior against a scripted mock backend and a
//! real SQLite store (plus real git where worktrees are involved).

use std::path::Path;
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use gantry_backend::connector::{
    AgentAdapter, AgentSession, SessionOptions, SessionOutcome, SessionStream, StartedSession,
    SESSION_EVENT_BUFFER,
};
use gantry_backend::{SqliteStore, ThreadStore, WorktreeManager};
use gantry_domain::{
    AgentEvent, AgentItem, CapabilitySet, EntryRole, EventKind, Prompt, SendRequest, ThreadStatus,
    TokenUsage,
};
use gantry_server::{AgentService, StreamError};
use tokio::sync::{mpsc, oneshot};

struct MockAdapter {
    scripted: Vec<AgentEvent>,
    hold_open: bool,
    fail_with: Option<String>,
}

impl MockAdapter {
    fn new(scripted: Vec<AgentEvent>) -> Self {
        Self {
            scripted,
            hold_open: false,
            fail_with: None,
        }
    }

    fn holding_open(mut self) -> Self {
        self.hold_open = true;
        self
    }

    fn failing_with(mut self, message: &str) -> Self {
        self.fail_with = Some(message.to_owned());
        self
    }
}

struct MockSession {
    closed: Arc<AtomicBool>,
    turn: Mutex<Option<(mpsc::Sender<AgentEvent>, oneshot::Sender<SessionOutcome>)>>,
    scripted: Vec<AgentEvent>,
    hold_open: bool,
    fail_with: Option<String>,
}

impl AgentAdapter for MockAdapter {
    fn id(&self) -> &str {
        "mock"
    }

    fn capabilities(&self) -> CapabilitySet {
        CapabilitySet::new()
    }

    fn start(&self, _opts: SessionOptions) -> anyhow::Result<StartedSession> {
        let (tx, rx) = mpsc::channel(SESSION_EVENT_BUFFER);
        let (done_tx, done_rx) = oneshot::channel();
        let session = Arc::new(MockSession {
            closed: Arc::new(AtomicBool::new(false)),
            turn: Mutex::new(Some((tx, done_tx))),
            scripted: self.scripted.clone(),
            hold_open: self.hold_open,
            fail_with: self.fail_with.clone(),
        });
        Ok(StartedSession {
            session,
            stream: SessionStream {
                events: rx,
                done: done_rx,
            },
        })
    }
}

impl AgentSession for MockSession {
    fn send(&self, _prompts: Vec<Prompt>) -> anyhow::Result<()> {
        let (tx, done_tx) = self
            .turn
            .lock()
            .expect("turn lock")
            .take()
            .ok_or_else(|| anyhow::anyhow!("turn already running"))?;
        let scripted = self.scripted.clone();
        let closed = self.closed.clone();
        let hold_open = self.hold_open;
        let fail_with = self.fail_with.clone();
        std::thread::spawn(move || {
            for event in scripted {
                if closed.load(Ordering::SeqCst) {
                    break;
                }
                if tx.blocking_send(event).is_err() {
                    break;
                }
            }
            while hold_open && !closed.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(10));
            }
            let outcome = if closed.load(Ordering::SeqCst) {
                SessionOutcome::Canceled
            } else if let Some(message) = fail_with {
                SessionOutcome::Failed { message }
            } else {
                SessionOutcome::Completed
            };
            let _ = done_tx.send(outcome);
            drop(tx);
        });
        Ok(())
    }

    fn capabilities(&self) -> CapabilitySet {
        CapabilitySet::new()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

fn open_store(dir: &Path) -> Arc<dyn ThreadStore> {
    Arc::new(SqliteStore::open(dir.join("gantry.db")).expect("open store"))
}

fn message_item(id: &str, text: &str) -> AgentItem {
    AgentItem::AgentMessage {
        id: id.to_owned(),
        text: text.to_owned(),
    }
}

fn completed_turn_script() -> Vec<AgentEvent> {
    let mut started = AgentEvent::of_kind(EventKind::SessionStarted);
    started.thread_id = Some("thr_ext_1".to_owned());

    let mut completed = AgentEvent::of_kind(EventKind::TurnCompleted);
    completed.usage = Some(TokenUsage {
        input_tokens: 11,
        cached_input_tokens: 0,
        output_tokens: 42,
    });

    vec![
        started,
        AgentEvent::item_event(EventKind::ItemStarted, message_item("m1", "working...")),
        AgentEvent::item_event(EventKind::ItemUpdated, message_item("m1", "almost")),
        AgentEvent::item_event(EventKind::ItemCompleted, message_item("m1", "All done.")),
        completed,
    ]
}

fn run_git(repo: &Path, args: &[&str]) {
    let output = Command::new("git")
        .args(args)
        .current_dir(repo)
        .env("GIT_AUTHOR_NAME", "gantry-tests")
        .env("GIT_AUTHOR_EMAIL", "gantry-tests@localhost")
        .env("GIT_COMMITTER_NAME", "gantry-tests")
        .env("GIT_COMMITTER_EMAIL", "gantry-tests@localhost")
        .output()
        .expect("git should spawn");
    assert!(
        output.status.success(),
        "git {args:?} failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
}

fn init_repo(repo: &Path) {
    std::fs::create_dir_all(repo).expect("create repo dir");
    run_git(repo, &["init", "-b", "main"]);
    std::fs::write(repo.join("README.md"), "seed\n").expect("seed file");
    run_git(repo, &["add", "."]);
    run_git(repo, &["commit", "--no-gpg-sign", "-m", "seed"]);
}

#[tokio::test]
async fn send_streams_persists_and_finalizes_exactly_once() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let store = open_store(tmp.path());
    let project = store.upsert_project("/tmp/proj", None).expect("project");

    let service = Arc::new(AgentService::new("mock", store.clone()));
    service
        .register("mock", Arc::new(MockAdapter::new(completed_turn_script())))
        .expect("register");

    let (mut stream, thread) = service
        .send(SendRequest {
            project_id: Some(project.id),
            input: "Refactor the auth module across six files in total length".to_owned(),
            ..SendRequest::default()
        })
        .expect("send");

    assert_eq!(thread.title, "Refactor the auth module across six files in");
    assert_eq!(
        thread.branch_name.as_deref(),
        Some(format!("gantry/refactor-the-auth-module-across-six-files-in-{}", thread.id).as_str())
    );
    assert!(!stream.id().is_empty());

    let mut kinds = Vec::new();
    while let Some(event) = stream.next_event().await {
        kinds.push(event.kind.clone());
    }
    assert!(kinds.contains(&EventKind::TurnCompleted));

    assert_eq!(stream.wait().await, Ok(()));
    // Wait is idempotent.
    assert_eq!(stream.wait().await, Ok(()));

    let finalized = service.get_thread(thread.id).expect("thread");
    assert_eq!(finalized.status, ThreadStatus::Completed);
    assert_eq!(finalized.external_id.as_deref(), Some("thr_ext_1"));
    assert!(finalized.last_message_at_unix_ms.is_some());

    let entries = store.list_entries(thread.id).expect("entries");
    let user_entries = entries.iter().filter(|e| e.role == EntryRole::User).count();
    let agent_entries = entries.iter().filter(|e| e.role == EntryRole::Agent).count();
    let system_entries = entries.iter().filter(|e| e.role == EntryRole::System).count();
    assert_eq!(user_entries, 1, "one user entry");
    assert_eq!(agent_entries, 1, "item m1 persisted exactly once");
    assert_eq!(system_entries, 1, "usage summary entry");

    assert_eq!(service.active_stream_count(), 0);
    assert!(!service.is_thread_streaming(thread.id));
}

#[tokio::test]
async fn cancel_before_terminal_event_yields_stopped() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let store = open_store(tmp.path());
    let project = store.upsert_project("/tmp/proj", None).expect("project");

    let script = vec![AgentEvent::item_event(
        EventKind::ItemCompleted,
        message_item("m1", "still going"),
    )];
    let service = Arc::new(AgentService::new("mock", store.clone()));
    service
        .register("mock", Arc::new(MockAdapter::new(script).holding_open()))
        .expect("register");

    let (mut stream, thread) = service
        .send(SendRequest {
            project_id: Some(project.id),
            input: "long running change".to_owned(),
            ..SendRequest::default()
        })
        .expect("send");

    // Let the first event through so the stream is known to be live.
    let first = stream.next_event().await.expect("first event");
    assert_eq!(first.kind, EventKind::ItemCompleted);

    let outcome = service.cancel(stream.id()).expect("cancel");
    assert_eq!(outcome.thread_id, thread.id);
    assert_eq!(outcome.status, ThreadStatus::Stopped);

    while stream.next_event().await.is_some() {}
    assert_eq!(stream.wait().await, Err(StreamError::Canceled));

    let finalized = service.get_thread(thread.id).expect("thread");
    assert_eq!(finalized.status, ThreadStatus::Stopped);
    assert_eq!(service.active_stream_count(), 0);

    // A second cancel no longer finds the stream.
    assert!(service.cancel(stream.id()).is_err());
}

#[tokio::test]
async fn backend_failure_yields_failed_status_and_error_entry() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let store = open_store(tmp.path());
    let project = store.upsert_project("/tmp/proj", None).expect("project");

    let script = vec![AgentEvent::error_event(
        EventKind::SessionError,
        "backend crashed",
    )];
    let service = Arc::new(AgentService::new("mock", store.clone()));
    service
        .register(
            "mock",
            Arc::new(MockAdapter::new(script).failing_with("backend crashed")),
        )
        .expect("register");

    let (mut stream, thread) = service
        .send(SendRequest {
            project_id: Some(project.id),
            input: "doomed".to_owned(),
            ..SendRequest::default()
        })
        .expect("send");

    while stream.next_event().await.is_some() {}
    assert_eq!(
        stream.wait().await,
        Err(StreamError::Failed("backend crashed".to_owned()))
    );

    let finalized = service.get_thread(thread.id).expect("thread");
    assert_eq!(finalized.status, ThreadStatus::Failed);

    let entries = store.list_entries(thread.id).expect("entries");
    assert!(
        entries
            .iter()
            .any(|entry| entry.role == EntryRole::System
                && entry
                    .payload
                    .as_ref()
                    .is_some_and(|p| p["tone"] == "error")),
        "a system error entry is written on finalize"
    );
}

#[tokio::test]
async fn send_rejects_missing_agents_and_empty_input() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let store = open_store(tmp.path());
    let project = store.upsert_project("/tmp/proj", None).expect("project");

    let service = Arc::new(AgentService::new("mock", store.clone()));

    let err = service
        .send(SendRequest {
            project_id: Some(project.id),
            input: "hello".to_owned(),
            ..SendRequest::default()
        })
        .expect_err("unregistered agent");
    assert!(format!("{err:#}").contains("not registered"));

    service
        .register("mock", Arc::new(MockAdapter::new(Vec::new())))
        .expect("register");
    let err = service
        .send(SendRequest {
            project_id: Some(project.id),
            ..SendRequest::default()
        })
        .expect_err("empty input");
    assert!(format!("{err:#}").contains("input text or segments"));

    let err = service
        .send(SendRequest {
            input: "hello".to_owned(),
            ..SendRequest::default()
        })
        .expect_err("missing project");
    assert!(format!("{err:#}").contains("project id is required"));
}

#[tokio::test]
async fn existing_thread_reuse_refreshes_options() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let store = open_store(tmp.path());
    let project = store.upsert_project("/tmp/proj", None).expect("project");

    let service = Arc::new(AgentService::new("mock", store.clone()));
    service
        .register("mock", Arc::new(MockAdapter::new(completed_turn_script())))
        .expect("register");

    let (mut stream, thread) = service
        .send(SendRequest {
            project_id: Some(project.id),
            input: "first turn".to_owned(),
            ..SendRequest::default()
        })
        .expect("send");
    while stream.next_event().await.is_some() {}
    let _ = stream.wait().await;

    let mut req = SendRequest {
        thread_id: Some(thread.id),
        input: "second turn".to_owned(),
        ..SendRequest::default()
    };
    req.thread_options.model = "gpt-5.1-codex-mini".to_owned();
    let (mut stream2, thread2) = service.send(req).expect("second send");
    assert_eq!(thread2.id, thread.id);
    assert_eq!(thread2.model, "gpt-5.1-codex-mini");
    while stream2.next_event().await.is_some() {}
    let _ = stream2.wait().await;

    // Replayed item ids from the first turn stay deduplicated across turns.
    let entries = store.list_entries(thread.id).expect("entries");
    let agent_entries = entries.iter().filter(|e| e.role == EntryRole::Agent).count();
    assert_eq!(agent_entries, 1, "m1 persisted once across both turns");
}

#[tokio::test]
async fn send_provisions_a_worktree_for_new_threads() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let repo = tmp.path().join("acme-app");
    init_repo(&repo);

    let store = open_store(tmp.path());
    let project = store
        .upsert_project(&repo.to_string_lossy(), None)
        .expect("project");

    let manager = Arc::new(WorktreeManager::new(tmp.path().join("worktrees")));
    let service =
        Arc::new(AgentService::new("mock", store.clone()).with_worktrees(manager.clone()));
    service
        .register("mock", Arc::new(MockAdapter::new(completed_turn_script())))
        .expect("register");

    let (mut stream, thread) = service
        .send(SendRequest {
            project_id: Some(project.id),
            input: "Refactor the auth module across six files in total length".to_owned(),
            ..SendRequest::default()
        })
        .expect("send");

    let worktree = thread.worktree_path.clone().expect("worktree path");
    let expected_leaf = format!("refactor-the-auth-module-across-six-files-in-{}", thread.id);
    assert!(
        worktree.ends_with(&format!("acme-app/{expected_leaf}")),
        "worktree at <root>/<slug>/<slug2>-<id>, got {worktree}"
    );
    assert!(Path::new(&worktree).join(".git").exists());

    while stream.next_event().await.is_some() {}
    assert_eq!(stream.wait().await, Ok(()));

    // Deleting the thread tears the worktree down, best-effort.
    service.delete_thread(thread.id).expect("delete");
    assert!(!Path::new(&worktree).exists());
    assert!(service.get_thread(thread.id).is_err());
}

#[tokio::test]
async fn reclamation_removes_only_true_orphans() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let repo = tmp.path().join("acme-app");
    init_repo(&repo);

    let store = open_store(tmp.path());
    let project = store
        .upsert_project(&repo.to_string_lossy(), None)
        .expect("project");

    let manager = Arc::new(WorktreeManager::new(tmp.path().join("worktrees")));
    let service =
        Arc::new(AgentService::new("mock", store.clone()).with_worktrees(manager.clone()));
    service
        .register(
            "mock",
            Arc::new(MockAdapter::new(Vec::new()).holding_open()),
        )
        .expect("register");

    // A live thread with an active stream.
    let (mut stream, thread) = service
        .send(SendRequest {
            project_id: Some(project.id),
            input: "keep me".to_owned(),
            ..SendRequest::default()
        })
        .expect("send");
    let live_worktree = thread.worktree_path.clone().expect("worktree");

    // An orphan: a worktree whose thread row never existed.
    let orphan = manager
        .ensure_for_thread(&repo, 4242, "ghost", None)
        .expect("orphan worktree");

    service.reclaim_orphan_worktrees();
    assert!(
        Path::new(&live_worktree).exists(),
        "a thread present in the store is never reclaimed"
    );
    assert!(!orphan.worktree_path.exists(), "orphan is reclaimed");

    // Delete the live thread's row while its stream is still active: the
    // registry check must protect the worktree.
    store.delete_thread(thread.id).expect("row delete");
    service.reclaim_orphan_worktrees();
    assert!(
        Path::new(&live_worktree).exists(),
        "an active stream protects its worktree even without a row"
    );

    // Once the stream winds down, the next sweep reclaims it.
    service.cancel(stream.id()).expect("cancel");
    while stream.next_event().await.is_some() {}
    let _ = stream.wait().await;
    service.reclaim_orphan_worktrees();
    assert!(!Path::new(&live_worktree).exists());
}

#[tokio::test]
async fn rename_and_conversation_passthroughs() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let store = open_store(tmp.path());
    let project = store.upsert_project("/tmp/proj", None).expect("project");

    let service = Arc::new(AgentService::new("mock", store.clone()));
    service
        .register("mock", Arc::new(MockAdapter::new(completed_turn_script())))
        .expect("register");

    let (mut stream, thread) = service
        .send(SendRequest {
            project_id: Some(project.id),
            input: "conversation fodder".to_owned(),
            ..SendRequest::default()
        })
        .expect("send");
    while stream.next_event().await.is_some() {}
    let _ = stream.wait().await;

    let renamed = service.rename_thread(thread.id, "  Better name  ").expect("rename");
    assert_eq!(renamed.title, "Better name");
    assert!(service.rename_thread(thread.id, "   ").is_err());
    assert!(service.rename_thread(99_999, "x").is_err());

    let conversation = service
        .load_thread_conversation(thread.id)
        .expect("conversation");
    assert!(conversation.len() >= 2);
    assert_eq!(conversation[0].role, EntryRole::User);

    // Threads list is ordered and carries the renamed title.
    let listed = service.list_threads(project.id).expect("list");
    assert_eq!(listed[0].title, "Better name");
}
