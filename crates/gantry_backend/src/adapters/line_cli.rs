//! Subprocess adapter speaking single-line JSON over the child's standard
//! streams.
//!
//! The child emits one JSON object per stdout line; anything that fails to
//! parse is wrapped as a text chunk (stdout) or an error chunk (stderr)
//! instead of being dropped. A waiter thread reaps the child, emits the
//! final exit event, and closes the channel.

use anyhow::{anyhow, Context as _};
use std::collections::HashMap;
use std::io::{BufRead as _, BufReader, BufWriter, Read, Write as _};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use gantry_domain::{
    AgentEvent, AgentItem, Capability, CapabilitySet, EventError, EventKind, Prompt, TokenUsage,
};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};

use crate::connector::{
    AgentAdapter, AgentSession, SessionOptions, SessionOutcome, SessionStream, StartedSession,
    SESSION_EVENT_BUFFER,
};

/// Launches a configured CLI agent command per session.
pub struct CliAdapter {
    pub identifier: String,
    pub cmd: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub base_capabilities: CapabilitySet,
}

impl CliAdapter {
    fn effective_capabilities(&self) -> CapabilitySet {
        if self.base_capabilities.is_empty() {
            return [Capability::SupportsAttachments].into_iter().collect();
        }
        self.base_capabilities.clone()
    }
}

impl AgentAdapter for CliAdapter {
    fn id(&self) -> &str {
        let trimmed = self.identifier.trim();
        if trimmed.is_empty() { "cli" } else { trimmed }
    }

    fn capabilities(&self) -> CapabilitySet {
        self.effective_capabilities()
    }

    fn start(&self, opts: SessionOptions) -> anyhow::Result<StartedSession> {
        let cmd = self.cmd.trim();
        if cmd.is_empty() {
            return Err(anyhow!("agent command is required"));
        }

        let mut command = Command::new(cmd);
        command.args(&self.args);
        if let Some(dir) = &opts.working_directory {
            command.current_dir(dir);
        }
        for (key, value) in &self.env {
            command.env(key, value);
        }
        for (key, value) in &opts.env {
            command.env(key, value);
        }

        let mut child = command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| {
                if err.kind() == std::io::ErrorKind::NotFound {
                    anyhow!("missing agent executable ({cmd}): ensure it is available on PATH")
                } else {
                    anyhow!(err).context(format!("failed to spawn {cmd}"))
                }
            })?;

        let stdin = child.stdin.take().ok_or_else(|| anyhow!("missing stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("missing stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow!("missing stderr"))?;

        let (tx, rx) = mpsc::channel::<AgentEvent>(SESSION_EVENT_BUFFER);
        let (done_tx, done_rx) = oneshot::channel::<SessionOutcome>();

        let stopped = Arc::new(AtomicBool::new(false));
        let finished = Arc::new(AtomicBool::new(false));
        let child = Arc::new(Mutex::new(child));

        let killer = spawn_killer(child.clone(), stopped.clone(), finished.clone());
        let stdout_reader = spawn_line_reader(stdout, tx.clone(), stopped.clone(), false);
        let stderr_reader = spawn_line_reader(stderr, tx.clone(), stopped.clone(), true);

        {
            let child = child.clone();
            let stopped = stopped.clone();
            let finished = finished.clone();
            std::thread::spawn(move || {
                let _ = stdout_reader.join();
                let _ = stderr_reader.join();
                let status = child
                    .lock()
                    .ok()
                    .and_then(|mut child| child.wait().ok());
                finished.store(true, Ordering::SeqCst);
                let _ = killer.join();

                let was_stopped = stopped.load(Ordering::SeqCst);
                let code = status.and_then(|status| status.code()).unwrap_or(-1);
                let clean = was_stopped || code == 0;

                let mut event = AgentEvent::of_kind(if clean {
                    EventKind::Custom
                } else {
                    EventKind::SessionError
                });
                event.message = Some(format!("agent exited with code {code}"));
                let mut meta = serde_json::Map::new();
                meta.insert("exitCode".to_owned(), serde_json::json!(code));
                if was_stopped {
                    meta.insert("stopped".to_owned(), serde_json::json!(true));
                }
                event.metadata = Some(serde_json::Value::Object(meta));
                if !clean {
                    event.error = Some(EventError::new(format!("agent exited with code {code}")));
                }
                let _ = tx.blocking_send(event);

                let outcome = if was_stopped {
                    SessionOutcome::Canceled
                } else if code != 0 {
                    SessionOutcome::Failed {
                        message: format!("agent exited with code {code}"),
                    }
                } else {
                    SessionOutcome::Completed
                };
                // Resolve the outcome before the channel closes so a
                // non-blocking drain after the last event always sees it.
                let _ = done_tx.send(outcome);
                drop(tx);
            });
        }

        let session = Arc::new(CliSession {
            stdin: Mutex::new(Some(BufWriter::new(stdin))),
            stopped,
            capabilities: self.effective_capabilities(),
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

struct CliSession {
    stdin: Mutex<Option<BufWriter<ChildStdin>>>,
    stopped: Arc<AtomicBool>,
    capabilities: CapabilitySet,
}

#[derive(Serialize)]
struct PromptLine<'a> {
    #[serde(rename = "type")]
    line_type: &'static str,
    prompts: &'a [Prompt],
}

impl AgentSession for CliSession {
    fn send(&self, prompts: Vec<Prompt>) -> anyhow::Result<()> {
        if prompts.is_empty() {
            return Ok(());
        }
        if self.stopped.load(Ordering::SeqCst) {
            return Err(anyhow!("session closed"));
        }
        let payload = serde_json::to_string(&PromptLine {
            line_type: "prompt",
            prompts: &prompts,
        })
        .context("encode prompt line")?;

        let mut guard = self
            .stdin
            .lock()
            .map_err(|_| anyhow!("stdin lock poisoned"))?;
        let stdin = guard.as_mut().ok_or_else(|| anyhow!("session closed"))?;
        writeln!(stdin, "{payload}").context("write prompt line")?;
        stdin.flush().context("flush prompt line")?;
        Ok(())
    }

    fn capabilities(&self) -> CapabilitySet {
        self.capabilities.clone()
    }

    fn close(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        if let Ok(mut guard) = self.stdin.lock() {
            // Dropping stdin delivers EOF before the killer escalates.
            let _ = guard.take();
        }
    }
}

fn spawn_killer(
    child: Arc<Mutex<Child>>,
    stopped: Arc<AtomicBool>,
    finished: Arc<AtomicBool>,
) -> JoinHandle<()> {
    std::thread::spawn(move || {
        while !finished.load(Ordering::SeqCst) && !stopped.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(25));
        }
        if stopped.load(Ordering::SeqCst)
            && !finished.load(Ordering::SeqCst)
            && let Ok(mut child) = child.lock()
        {
            let _ = child.kill();
        }
    })
}

fn spawn_line_reader<R: Read + Send + 'static>(
    stream: R,
    tx: mpsc::Sender<AgentEvent>,
    stopped: Arc<AtomicBool>,
    is_err: bool,
) -> JoinHandle<()> {
    std::thread::spawn(move || {
        let reader = BufReader::new(stream);
        for line in reader.lines() {
            let line = match line {
                Ok(line) => line,
                Err(err) => {
                    if !stopped.load(Ordering::SeqCst) {
                        let _ = tx.blocking_send(AgentEvent::error_event(
                            EventKind::SessionError,
                            err.to_string(),
                        ));
                    }
                    return;
                }
            };
            let text = line.trim_end_matches(['\r', '\n']);
            if text.is_empty() {
                continue;
            }
            let event = parse_line(text).unwrap_or_else(|| plain_text_event(text, is_err));
            if tx.blocking_send(event).is_err() {
                return;
            }
        }
    })
}

/// Parses one protocol line. Returns None for non-JSON input.
fn parse_line(line: &str) -> Option<AgentEvent> {
    let raw: serde_json::Map<String, serde_json::Value> = serde_json::from_str(line).ok()?;
    let kind = resolve_kind(&raw)?;

    let mut event = AgentEvent::of_kind(kind);
    if let Some(message) = string_field(&raw, "message") {
        event.message = Some(message);
    }
    if let Some(text) = string_field(&raw, "text") {
        event.message = Some(text.clone());
        event.item = Some(AgentItem::AgentMessage {
            id: string_field(&raw, "id").unwrap_or_default(),
            text,
        });
    }
    if let Some(plan) = string_field(&raw, "plan") {
        event.message = Some(plan);
    }
    if let Some(item_raw) = raw.get("item")
        && let Ok(item) = serde_json::from_value::<AgentItem>(item_raw.clone())
    {
        event.item = Some(item);
    }
    if let Some(prompt_id) = string_field(&raw, "promptId") {
        event.prompt_id = Some(prompt_id);
    }
    if let Some(thread_id) = string_field(&raw, "threadId") {
        event.thread_id = Some(thread_id);
    }
    if let Some(usage) = usage_field(&raw) {
        event.usage = Some(usage);
    }
    if let Some(err) = string_field(&raw, "err") {
        event.error = Some(EventError::new(err));
    }
    event.metadata = Some(serde_json::Value::Object(raw));
    Some(event)
}

fn plain_text_event(text: &str, is_err: bool) -> AgentEvent {
    if is_err {
        AgentEvent::error_event(EventKind::SessionError, text)
    } else {
        let mut event = AgentEvent::item_event(
            EventKind::ItemUpdated,
            AgentItem::AgentMessage {
                id: String::new(),
                text: text.to_owned(),
            },
        );
        event.message = Some(text.to_owned());
        event
    }
}

fn resolve_kind(raw: &serde_json::Map<String, serde_json::Value>) -> Option<EventKind> {
    let raw_type = string_field(raw, "kind").or_else(|| string_field(raw, "type"))?;
    Some(map_known_type(&raw_type).unwrap_or_else(|| EventKind::parse(&raw_type)))
}

/// Short type names used by older line-protocol agents.
fn map_known_type(value: &str) -> Option<EventKind> {
    match value {
        "text_chunk" | "text" => Some(EventKind::ItemUpdated),
        "plan_update" => Some(EventKind::PlanUpdated),
        "tool_call" => Some(EventKind::ToolStarted),
        "tool_completed" => Some(EventKind::ToolCompleted),
        "diff" => Some(EventKind::DiffSummary),
        "usage" => Some(EventKind::UsageUpdated),
        "error" => Some(EventKind::SessionError),
        "complete" | "exit" => Some(EventKind::TurnCompleted),
        "start" => Some(EventKind::SessionStarted),
        _ => None,
    }
}

fn string_field(raw: &serde_json::Map<String, serde_json::Value>, key: &str) -> Option<String> {
    raw.get(key)?.as_str().map(str::to_owned)
}

fn usage_field(raw: &serde_json::Map<String, serde_json::Value>) -> Option<TokenUsage> {
    let usage = raw.get("usage")?.as_object()?;
    let field = |key: &str| usage.get(key).and_then(serde_json::Value::as_u64);
    Some(TokenUsage {
        input_tokens: field("input").or_else(|| field("input_tokens")).unwrap_or(0),
        cached_input_tokens: field("cached")
            .or_else(|| field("cached_input_tokens"))
            .unwrap_or(0),
        output_tokens: field("output")
            .or_else(|| field("output_tokens"))
            .unwrap_or(0),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_domain::{PromptSegment, Thread, ThreadStatus};

    fn dummy_thread() -> Thread {
        Thread {
            id: 1,
            project_id: 1,
            external_id: None,
            conversation_path: None,
            worktree_path: None,
            branch_name: None,
            pr_url: None,
            title: "t".to_owned(),
            model: String::new(),
            sandbox_mode: String::new(),
            reasoning_level: String::new(),
            status: ThreadStatus::Active,
            created_at_unix_ms: 0,
            updated_at_unix_ms: 0,
            last_message_at_unix_ms: None,
        }
    }

    #[test]
    fn parse_line_maps_short_type_names() {
        let event = parse_line(r#"{"kind":"text_chunk","text":"hello"}"#).expect("parse");
        assert_eq!(event.kind, EventKind::ItemUpdated);
        assert_eq!(event.message.as_deref(), Some("hello"));
        assert!(matches!(
            event.item,
            Some(AgentItem::AgentMessage { ref text, .. }) if text == "hello"
        ));
    }

    #[test]
    fn parse_line_passes_unknown_types_through() {
        let event = parse_line(r#"{"type":"backend.trace","message":"m"}"#).expect("parse");
        assert_eq!(event.kind, EventKind::Other("backend.trace".to_owned()));
        assert_eq!(event.message.as_deref(), Some("m"));
    }

    #[test]
    fn parse_line_reads_usage_and_thread_id() {
        let event = parse_line(
            r#"{"type":"complete","threadId":"thr_9","usage":{"input":5,"cached":1,"output":7}}"#,
        )
        .expect("parse");
        assert_eq!(event.kind, EventKind::TurnCompleted);
        assert_eq!(event.thread_id.as_deref(), Some("thr_9"));
        assert_eq!(
            event.usage,
            Some(TokenUsage {
                input_tokens: 5,
                cached_input_tokens: 1,
                output_tokens: 7
            })
        );
    }

    #[test]
    fn parse_line_decodes_embedded_canonical_items() {
        let event = parse_line(
            r#"{"type":"item.completed","item":{"type":"web_search","id":"ws1","query":"q"}}"#,
        )
        .expect("parse");
        assert_eq!(event.kind, EventKind::ItemCompleted);
        assert!(matches!(event.item, Some(AgentItem::WebSearch { ref id, .. }) if id == "ws1"));
    }

    #[test]
    fn non_json_lines_become_text_or_error_chunks() {
        assert!(parse_line("plain words").is_none());
        let stdout = plain_text_event("plain words", false);
        assert_eq!(stdout.kind, EventKind::ItemUpdated);
        let stderr = plain_text_event("boom", true);
        assert_eq!(stderr.kind, EventKind::SessionError);
        assert_eq!(stderr.error.as_ref().map(|e| e.message.as_str()), Some("boom"));
    }

    #[test]
    fn missing_executable_is_reported_on_start() {
        let adapter = CliAdapter {
            identifier: "missing".to_owned(),
            cmd: "definitely-not-on-path-gantry".to_owned(),
            args: Vec::new(),
            env: HashMap::new(),
            base_capabilities: CapabilitySet::new(),
        };
        let err = adapter
            .start(SessionOptions::for_thread(dummy_thread()))
            .expect_err("missing binary should fail");
        assert!(format!("{err:#}").contains("missing agent executable"));
    }

    #[tokio::test]
    async fn session_streams_events_and_closes_after_exit() {
        let adapter = CliAdapter {
            identifier: "echo".to_owned(),
            cmd: "sh".to_owned(),
            args: vec![
                "-c".to_owned(),
                r#"echo '{"type":"complete","usage":{"input":1,"output":2}}'"#.to_owned(),
            ],
            env: HashMap::new(),
            base_capabilities: CapabilitySet::new(),
        };
        let started = adapter
            .start(SessionOptions::for_thread(dummy_thread()))
            .expect("start");
        let mut stream = started.stream;

        let mut kinds = Vec::new();
        while let Some(event) = stream.events.recv().await {
            kinds.push(event.kind.clone());
        }
        assert_eq!(kinds.first(), Some(&EventKind::TurnCompleted));
        assert_eq!(kinds.last(), Some(&EventKind::Custom));
        assert_eq!(stream.done.await.ok(), Some(SessionOutcome::Completed));
    }

    #[tokio::test]
    async fn close_kills_a_lingering_child() {
        let adapter = CliAdapter {
            identifier: "sleep".to_owned(),
            cmd: "sh".to_owned(),
            args: vec!["-c".to_owned(), "sleep 30".to_owned()],
            env: HashMap::new(),
            base_capabilities: CapabilitySet::new(),
        };
        let started = adapter
            .start(SessionOptions::for_thread(dummy_thread()))
            .expect("start");
        started.session.close();
        // Sending after close is rejected.
        let err = started
            .session
            .send(vec![Prompt::user(vec![PromptSegment::text("hi")])])
            .expect_err("send after close");
        assert!(format!("{err:#}").contains("session closed"));

        let mut stream = started.stream;
        while stream.events.recv().await.is_some() {}
        assert_eq!(stream.done.await.ok(), Some(SessionOutcome::Canceled));
    }
}
