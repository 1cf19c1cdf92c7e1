//! Adapter over the Codex CLI's native streaming protocol.
//!
//! Each turn runs `codex exec --json` in the session's working directory.
//! Stdout lines deserialize into the typed protocol events below and are
//! translated into the canonical taxonomy. Item identifiers restart at
//! `item_0` every turn, so they are qualified with a per-turn scope id
//! before leaving the adapter.

use anyhow::{anyhow, Context as _};
use rand::{rngs::OsRng, Rng as _};
use std::io::{BufRead as _, BufReader, Read as _, Write as _};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use gantry_domain::time::now_unix_micros;
use gantry_domain::{
    paths, AgentEvent, AgentItem, Capability, CapabilitySet, EventError, EventKind, Prompt,
    SegmentKind, TokenUsage,
};
use serde::Deserialize;
use tokio::sync::{mpsc, oneshot};

use crate::connector::{
    AgentAdapter, AgentSession, SessionOptions, SessionOutcome, SessionStream, StartedSession,
    METADATA_MODEL, METADATA_OUTPUT_SCHEMA, METADATA_REASONING_LEVEL, SESSION_EVENT_BUFFER,
};

pub const DEFAULT_CODEX_MODEL: &str = "gpt-5.1-codex";

/// Typed wire events emitted by `codex exec --json`. Item payloads reuse
/// the canonical union; the field names and tags line up.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum CodexEvent {
    #[serde(rename = "thread.started")]
    ThreadStarted { thread_id: String },
    #[serde(rename = "turn.started")]
    TurnStarted,
    #[serde(rename = "turn.completed")]
    TurnCompleted { usage: TokenUsage },
    #[serde(rename = "turn.failed")]
    TurnFailed { error: EventError },
    #[serde(rename = "item.started")]
    ItemStarted { item: AgentItem },
    #[serde(rename = "item.updated")]
    ItemUpdated { item: AgentItem },
    #[serde(rename = "item.completed")]
    ItemCompleted { item: AgentItem },
    #[serde(rename = "error")]
    Error { message: String },
}

enum StdoutLine {
    Event(Box<CodexEvent>),
    Ignored { message: String },
    Noise { message: String },
}

fn parse_stdout_line(line: &str) -> StdoutLine {
    let payload = line.trim();
    if payload.is_empty() {
        return StdoutLine::Noise {
            message: String::new(),
        };
    }
    if !payload.starts_with('{') && !payload.starts_with('[') {
        return StdoutLine::Noise {
            message: payload.to_owned(),
        };
    }

    match serde_json::from_str::<CodexEvent>(payload) {
        Ok(event) => StdoutLine::Event(Box::new(event)),
        Err(_) => {
            let Ok(value) = serde_json::from_str::<serde_json::Value>(payload) else {
                return StdoutLine::Noise {
                    message: payload.to_owned(),
                };
            };
            let type_name = value
                .as_object()
                .and_then(|obj| obj.get("type"))
                .and_then(|v| v.as_str())
                .unwrap_or("<missing type>");
            StdoutLine::Ignored {
                message: format!("ignored codex event: {type_name}"),
            }
        }
    }
}

fn generate_turn_scope_id() -> String {
    let micros = now_unix_micros();
    let rand: u64 = OsRng.r#gen();
    format!("turn-{micros:x}-{rand:x}")
}

fn qualify_item(turn_scope_id: &str, item: AgentItem) -> AgentItem {
    let raw_id = item.id();
    if raw_id.is_empty() || raw_id.starts_with(turn_scope_id) {
        return item;
    }
    let qualified = format!("{turn_scope_id}/{raw_id}");
    item.with_id(qualified)
}

fn convert_event(event: CodexEvent, turn_scope_id: &str, thread_id: Option<String>) -> AgentEvent {
    let mut converted = match event {
        CodexEvent::ThreadStarted { thread_id } => {
            let mut out = AgentEvent::of_kind(EventKind::SessionStarted);
            out.thread_id = Some(thread_id);
            return out;
        }
        CodexEvent::TurnStarted => AgentEvent::of_kind(EventKind::TurnStarted),
        CodexEvent::TurnCompleted { usage } => {
            let mut out = AgentEvent::of_kind(EventKind::TurnCompleted);
            out.usage = Some(usage);
            out
        }
        CodexEvent::TurnFailed { error } => {
            let mut out = AgentEvent::error_event(EventKind::TurnFailed, error.message.clone());
            out.error = Some(error);
            out
        }
        CodexEvent::ItemStarted { item } => {
            AgentEvent::item_event(EventKind::ItemStarted, qualify_item(turn_scope_id, item))
        }
        CodexEvent::ItemUpdated { item } => {
            AgentEvent::item_event(EventKind::ItemUpdated, qualify_item(turn_scope_id, item))
        }
        CodexEvent::ItemCompleted { item } => {
            AgentEvent::item_event(EventKind::ItemCompleted, qualify_item(turn_scope_id, item))
        }
        CodexEvent::Error { message } => AgentEvent::error_event(EventKind::SessionError, message),
    };
    converted.thread_id = thread_id;
    converted
}

struct TurnParams {
    resume_thread_id: Option<String>,
    working_dir: Option<PathBuf>,
    sandbox_mode: String,
    prompt: String,
    image_paths: Vec<PathBuf>,
    model: String,
    reasoning_effort: Option<String>,
    output_schema_path: Option<PathBuf>,
    skip_git_repo_check: bool,
}

/// Runs one codex turn, invoking `on_event` per protocol event. A canceled
/// turn returns Ok; the caller inspects the cancel flag.
fn run_codex_turn(
    codex: &Path,
    params: TurnParams,
    cancel: Arc<AtomicBool>,
    mut on_event: impl FnMut(CodexEvent),
) -> anyhow::Result<()> {
    let TurnParams {
        resume_thread_id,
        working_dir,
        sandbox_mode,
        prompt,
        image_paths,
        model,
        reasoning_effort,
        output_schema_path,
        skip_git_repo_check,
    } = params;

    let mut command = Command::new(codex);
    command
        .arg("--sandbox")
        .arg(&sandbox_mode)
        .arg("--ask-for-approval")
        .arg("never")
        .arg("exec")
        .arg("--json");
    if let Some(dir) = &working_dir {
        command.arg("-C").arg(dir);
    }
    if skip_git_repo_check {
        command.arg("--skip-git-repo-check");
    }
    if !image_paths.is_empty() {
        command.arg("--image");
        for path in &image_paths {
            command.arg(path);
        }
    }
    command.arg("--model").arg(&model);
    if let Some(effort) = &reasoning_effort {
        command
            .arg("-c")
            .arg(format!("model_reasoning_effort=\"{effort}\""));
    }
    if let Some(schema) = &output_schema_path {
        command.arg("--output-schema").arg(schema);
    }
    if let Some(thread_id) = &resume_thread_id {
        command.arg("resume").arg(thread_id).arg("-");
    } else {
        command.arg("-");
    }

    let mut child = command
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                anyhow!(
                    "missing codex executable ({}): install the Codex CLI and ensure it is on PATH",
                    codex.display()
                )
            } else {
                anyhow!(err).context("failed to spawn codex")
            }
        })?;

    child
        .stdin
        .as_mut()
        .ok_or_else(|| anyhow!("missing stdin"))?
        .write_all(prompt.as_bytes())
        .context("failed to write prompt")?;
    drop(child.stdin.take());

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("missing stdout"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("missing stderr"))?;

    let finished = Arc::new(AtomicBool::new(false));
    let child = Arc::new(Mutex::new(child));
    let killer = {
        let child = child.clone();
        let cancel = cancel.clone();
        let finished = finished.clone();
        std::thread::spawn(move || {
            while !finished.load(Ordering::SeqCst) && !cancel.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(25));
            }
            if cancel.load(Ordering::SeqCst)
                && let Ok(mut child) = child.lock()
            {
                let _ = child.kill();
            }
        })
    };

    let stderr_handle = std::thread::spawn(move || -> String {
        let mut buf = Vec::new();
        let mut reader = BufReader::new(stderr);
        let _ = reader.read_to_end(&mut buf);
        String::from_utf8_lossy(&buf).into_owned()
    });

    let mut stdout_noise: Vec<String> = Vec::new();
    for line in BufReader::new(stdout).lines() {
        let line = match line {
            Ok(line) => line,
            Err(err) => {
                if cancel.load(Ordering::SeqCst) {
                    break;
                }
                return Err(err).context("failed to read codex stdout");
            }
        };
        if cancel.load(Ordering::SeqCst) {
            break;
        }
        match parse_stdout_line(&line) {
            StdoutLine::Event(event) => on_event(*event),
            StdoutLine::Ignored { message } | StdoutLine::Noise { message } => {
                if !message.is_empty() && stdout_noise.len() < 64 {
                    stdout_noise.push(message);
                }
            }
        }
    }

    let status = child
        .lock()
        .map_err(|_| anyhow!("failed to lock codex child"))?
        .wait()
        .context("failed to wait for codex")?;
    finished.store(true, Ordering::SeqCst);
    let _ = killer.join();
    let stderr_text = stderr_handle.join().unwrap_or_default();

    if cancel.load(Ordering::SeqCst) {
        return Ok(());
    }

    if !status.success() {
        let noise = if stdout_noise.is_empty() {
            String::new()
        } else {
            format!("\nstdout (non-protocol):\n{}", stdout_noise.join("\n"))
        };
        return Err(anyhow!(
            "codex failed ({}):\nstderr:\n{}{}",
            status,
            stderr_text.trim(),
            noise
        ));
    }

    Ok(())
}

/// Streams turns through the Codex CLI.
pub struct CodexAdapter {
    executable: PathBuf,
    model: Option<String>,
}

impl CodexAdapter {
    /// Builds an adapter using environment overrides for the binary path.
    pub fn from_env() -> Self {
        let executable = std::env::var_os(paths::GANTRY_CODEX_BIN_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("codex"));
        Self {
            executable,
            model: None,
        }
    }

    pub fn with_model(mut self, model: Option<String>) -> Self {
        self.model = model;
        self
    }
}

fn normalize_sandbox_mode(raw: &str) -> String {
    match raw.trim().to_ascii_lowercase().as_str() {
        "read-only" => "read-only".to_owned(),
        "danger-full-access" => "danger-full-access".to_owned(),
        _ => "workspace-write".to_owned(),
    }
}

impl AgentAdapter for CodexAdapter {
    fn id(&self) -> &str {
        "codex"
    }

    fn capabilities(&self) -> CapabilitySet {
        [
            Capability::SupportsImages,
            Capability::SupportsReasoningLevel,
            Capability::SupportsSandbox,
            Capability::EmitsDiffs,
            Capability::SupportsAttachments,
            Capability::SupportsCustomSchemas,
        ]
        .into_iter()
        .collect()
    }

    fn start(&self, opts: SessionOptions) -> anyhow::Result<StartedSession> {
        let model = opts
            .metadata_str(METADATA_MODEL)
            .map(str::to_owned)
            .or_else(|| {
                let trimmed = opts.thread.model.trim();
                (!trimmed.is_empty()).then(|| trimmed.to_owned())
            })
            .or_else(|| self.model.clone())
            .unwrap_or_else(|| DEFAULT_CODEX_MODEL.to_owned());

        let reasoning_effort = opts
            .metadata_str(METADATA_REASONING_LEVEL)
            .map(str::to_owned)
            .or_else(|| {
                let trimmed = opts.thread.reasoning_level.trim();
                (!trimmed.is_empty()).then(|| trimmed.to_owned())
            });

        let working_dir = opts
            .working_directory
            .clone()
            .or_else(|| opts.thread.worktree_path.as_ref().map(PathBuf::from));

        let (tx, rx) = mpsc::channel::<AgentEvent>(SESSION_EVENT_BUFFER);
        let (done_tx, done_rx) = oneshot::channel::<SessionOutcome>();

        let session = Arc::new(CodexSession {
            executable: self.executable.clone(),
            working_dir,
            sandbox_mode: normalize_sandbox_mode(&opts.sandbox_mode),
            model,
            reasoning_effort,
            skip_git_repo_check: opts.skip_git_repo_check,
            thread_id: Arc::new(Mutex::new(opts.external_thread_id())),
            turn: Mutex::new(Some(TurnChannels { tx, done_tx })),
            cancel: Arc::new(AtomicBool::new(false)),
            closed: AtomicBool::new(false),
            capabilities: self.capabilities(),
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

struct TurnChannels {
    tx: mpsc::Sender<AgentEvent>,
    done_tx: oneshot::Sender<SessionOutcome>,
}

struct CodexSession {
    executable: PathBuf,
    working_dir: Option<PathBuf>,
    sandbox_mode: String,
    model: String,
    reasoning_effort: Option<String>,
    skip_git_repo_check: bool,
    /// Backend-assigned thread id, shared with the turn thread so later
    /// turns resume the thread the backend created.
    thread_id: Arc<Mutex<Option<String>>>,
    turn: Mutex<Option<TurnChannels>>,
    cancel: Arc<AtomicBool>,
    closed: AtomicBool,
    capabilities: CapabilitySet,
}

impl CodexSession {
    fn known_thread_id(&self) -> Option<String> {
        self.thread_id.lock().ok().and_then(|guard| guard.clone())
    }
}

fn prompt_text_and_images(prompts: &[Prompt]) -> (String, Vec<PathBuf>) {
    let mut parts = Vec::new();
    let mut images = Vec::new();
    for prompt in prompts {
        for segment in &prompt.segments {
            match segment.kind {
                SegmentKind::ImageLocal => {
                    if let Some(path) = segment.path.as_deref().map(str::trim)
                        && !path.is_empty()
                    {
                        images.push(PathBuf::from(path));
                    }
                }
                SegmentKind::Code => {
                    let lang = segment.lang.as_deref().unwrap_or_default();
                    parts.push(format!("```{lang}\n{}\n```", segment.text));
                }
                SegmentKind::Text | SegmentKind::Markdown | SegmentKind::AttachmentRef => {
                    if !segment.text.is_empty() {
                        parts.push(segment.text.clone());
                    }
                }
            }
        }
    }
    (parts.join("\n\n"), images)
}

fn find_output_schema(prompts: &[Prompt]) -> Option<serde_json::Value> {
    prompts
        .iter()
        .find_map(|prompt| prompt.metadata_value(METADATA_OUTPUT_SCHEMA).cloned())
}

fn write_schema_file(schema: &serde_json::Value) -> anyhow::Result<PathBuf> {
    let path = std::env::temp_dir().join(format!(
        "gantry-schema-{}-{:x}.json",
        std::process::id(),
        now_unix_micros()
    ));
    std::fs::write(&path, serde_json::to_vec(schema).context("encode schema")?)
        .context("write schema file")?;
    Ok(path)
}

impl AgentSession for CodexSession {
    fn send(&self, prompts: Vec<Prompt>) -> anyhow::Result<()> {
        if prompts.is_empty() {
            return Err(anyhow!("prompt is required"));
        }
        if self.closed.load(Ordering::SeqCst) {
            return Err(anyhow!("session closed"));
        }

        let Some(TurnChannels { tx, done_tx }) = self
            .turn
            .lock()
            .map_err(|_| anyhow!("turn lock poisoned"))?
            .take()
        else {
            return Err(anyhow!("turn already running"));
        };

        let (prompt, image_paths) = prompt_text_and_images(&prompts);
        if prompt.trim().is_empty() && image_paths.is_empty() {
            // Hand the channels back so the caller can retry with content.
            if let Ok(mut guard) = self.turn.lock() {
                *guard = Some(TurnChannels { tx, done_tx });
            }
            return Err(anyhow!("prompt has no content"));
        }

        let output_schema_path = match find_output_schema(&prompts) {
            Some(schema) => Some(write_schema_file(&schema)?),
            None => None,
        };

        let params = TurnParams {
            resume_thread_id: self.known_thread_id(),
            working_dir: self.working_dir.clone(),
            sandbox_mode: self.sandbox_mode.clone(),
            prompt,
            image_paths,
            model: self.model.clone(),
            reasoning_effort: self.reasoning_effort.clone(),
            output_schema_path: output_schema_path.clone(),
            skip_git_repo_check: self.skip_git_repo_check,
        };

        let executable = self.executable.clone();
        let cancel = self.cancel.clone();
        let thread_id_slot = self.thread_id.clone();
        let turn_scope_id = generate_turn_scope_id();
        let mut current_thread_id = self.known_thread_id();

        std::thread::spawn(move || {
            let result = run_codex_turn(&executable, params, cancel.clone(), |event| {
                if let CodexEvent::ThreadStarted { thread_id } = &event {
                    let trimmed = thread_id.trim();
                    if !trimmed.is_empty() {
                        current_thread_id = Some(trimmed.to_owned());
                        if let Ok(mut guard) = thread_id_slot.lock() {
                            *guard = Some(trimmed.to_owned());
                        }
                    }
                }
                let converted = convert_event(event, &turn_scope_id, current_thread_id.clone());
                let _ = tx.blocking_send(converted);
            });

            let outcome = if cancel.load(Ordering::SeqCst) {
                SessionOutcome::Canceled
            } else {
                match result {
                    Ok(()) => SessionOutcome::Completed,
                    Err(err) => {
                        let message = format!("{err:#}");
                        let mut event =
                            AgentEvent::error_event(EventKind::SessionError, message.clone());
                        event.thread_id = current_thread_id.clone();
                        let _ = tx.blocking_send(event);
                        SessionOutcome::Failed { message }
                    }
                }
            };

            if let Some(path) = output_schema_path {
                let _ = std::fs::remove_file(path);
            }

            // Resolve the outcome before the channel closes so a
            // non-blocking drain after the last event always sees it.
            let _ = done_tx.send(outcome);
            drop(tx);
        });

        Ok(())
    }

    fn capabilities(&self) -> CapabilitySet {
        self.capabilities.clone()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.cancel.store(true, Ordering::SeqCst);
    }
}
