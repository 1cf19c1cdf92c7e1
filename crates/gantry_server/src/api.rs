//! Facade consumed by an embedding shell: wire-shaped responses, event
//! publication to the observer bus, and the one-shot PR convenience flow.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context as _};
use gantry_api::{
    entry_to_dto, event_to_wire, stream_outcome_event, thread_to_dto, CancelDto,
    ConversationEntryDto, DiffSummaryDto, FileDiffStatDto, StreamStartedDto, ThreadDto,
};
use gantry_backend::adapters::CodexAdapter;
use gantry_backend::connector::{
    AgentAdapter, SessionOptions, SessionOutcome, METADATA_MODEL, METADATA_REASONING_LEVEL,
};
use gantry_domain::{AgentItem, Prompt, PromptSegment, SendRequest, Thread};

use crate::bus::{file_change_topic, stream_topic, EventBus};
use crate::pr::{build_create_pr_instruction, extract_pr_url_from_event};
use crate::service::AgentService;
use crate::stream::StreamError;

const PR_STREAM_DEADLINE: Duration = Duration::from_secs(5 * 60);
const PR_MODEL: &str = "gpt-5.1-codex";

pub struct AgentApi {
    service: Arc<AgentService>,
    bus: EventBus,
}

impl AgentApi {
    pub fn new(service: Arc<AgentService>, bus: EventBus) -> Self {
        Self { service, bus }
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Starts a stream and relays its events onto the bus. Returns the
    /// stream handle identifiers immediately.
    pub async fn send(&self, req: SendRequest) -> anyhow::Result<StreamStartedDto> {
        let service = self.service.clone();
        let (mut stream, thread) = tokio::task::spawn_blocking(move || service.send(req))
            .await
            .context("join send task")??;

        let dto = StreamStartedDto {
            stream_id: stream.id().to_owned(),
            thread_id: thread.id,
            thread_external_id: thread.external_id.clone(),
        };

        let service = self.service.clone();
        let bus = self.bus.clone();
        tokio::spawn(async move {
            let topic = stream_topic(stream.id());
            while let Some(event) = stream.next_event().await {
                let touched_files = matches!(event.item, Some(AgentItem::DiffChunk { .. }));
                match serde_json::to_value(event_to_wire(&event)) {
                    Ok(payload) => bus.emit(&topic, payload),
                    Err(err) => tracing::warn!(error = %err, "failed to encode stream event"),
                }
                if touched_files {
                    publish_diff(&service, &bus, thread.id).await;
                }
            }

            let final_event = match stream.wait().await {
                Ok(()) => {
                    let status = service
                        .get_thread(thread.id)
                        .ok()
                        .map(|thread| thread.status.as_str().to_owned());
                    stream_outcome_event(None, status.as_deref())
                }
                // A cancel is not an error from the observer's point of view.
                Err(StreamError::Canceled) => stream_outcome_event(None, Some("stopped")),
                Err(StreamError::Failed(message)) => stream_outcome_event(Some(message), None),
            };
            if let Ok(payload) = serde_json::to_value(final_event) {
                bus.emit(&topic, payload);
            }
            publish_diff(&service, &bus, thread.id).await;
        });

        Ok(dto)
    }

    pub async fn cancel(&self, stream_id: &str) -> anyhow::Result<CancelDto> {
        let service = self.service.clone();
        let stream_id = stream_id.to_owned();
        let outcome = tokio::task::spawn_blocking(move || service.cancel(&stream_id))
            .await
            .context("join cancel task")??;
        Ok(CancelDto {
            thread_id: outcome.thread_id,
            status: outcome.status.as_str().to_owned(),
        })
    }

    pub async fn list_threads(&self, project_id: i64) -> anyhow::Result<Vec<ThreadDto>> {
        let service = self.service.clone();
        tokio::task::spawn_blocking(move || {
            let threads = service.list_threads(project_id)?;
            Ok(threads
                .iter()
                .map(|thread| to_thread_dto(&service, thread))
                .collect())
        })
        .await
        .context("join list threads task")?
    }

    pub async fn get_thread(&self, thread_id: i64) -> anyhow::Result<ThreadDto> {
        let service = self.service.clone();
        tokio::task::spawn_blocking(move || {
            let thread = service.get_thread(thread_id)?;
            Ok(to_thread_dto(&service, &thread))
        })
        .await
        .context("join get thread task")?
    }

    pub async fn rename_thread(&self, thread_id: i64, title: String) -> anyhow::Result<ThreadDto> {
        let service = self.service.clone();
        tokio::task::spawn_blocking(move || {
            let thread = service.rename_thread(thread_id, &title)?;
            Ok(thread_to_dto(&thread, None))
        })
        .await
        .context("join rename task")?
    }

    pub async fn delete_thread(&self, thread_id: i64) -> anyhow::Result<()> {
        let service = self.service.clone();
        tokio::task::spawn_blocking(move || service.delete_thread(thread_id))
            .await
            .context("join delete task")?
    }

    pub async fn load_thread_conversation(
        &self,
        thread_id: i64,
    ) -> anyhow::Result<Vec<ConversationEntryDto>> {
        let service = self.service.clone();
        tokio::task::spawn_blocking(move || {
            let entries = service.load_thread_conversation(thread_id)?;
            Ok(entries.iter().map(entry_to_dto).collect())
        })
        .await
        .context("join conversation task")?
    }

    pub async fn list_thread_file_diffs(
        &self,
        thread_id: i64,
    ) -> anyhow::Result<Vec<FileDiffStatDto>> {
        let service = self.service.clone();
        tokio::task::spawn_blocking(move || {
            let stats = service.list_thread_diff_stats(thread_id)?;
            Ok(stats.into_iter().map(to_diff_stat_dto).collect())
        })
        .await
        .context("join diff stats task")?
    }

    /// Commits pending changes, pushes the thread branch, and opens a PR by
    /// driving a one-shot codex stream bound to the worktree. Returns the
    /// PR URL; an already-recorded URL is returned unchanged.
    pub async fn create_pull_request(&self, thread_id: i64) -> anyhow::Result<String> {
        let thread = {
            let service = self.service.clone();
            tokio::task::spawn_blocking(move || service.get_thread(thread_id))
                .await
                .context("join get thread task")??
        };
        if let Some(url) = thread.pr_url.as_deref().map(str::trim)
            && !url.is_empty()
        {
            return Ok(url.to_owned());
        }
        let worktree = thread
            .worktree_path
            .as_deref()
            .map(str::trim)
            .filter(|path| !path.is_empty())
            .ok_or_else(|| anyhow!("thread {thread_id} has no worktree"))?
            .to_owned();

        let diffs = self.list_thread_file_diffs(thread_id).await?;
        if diffs.is_empty() {
            return Err(anyhow!("no file changes detected"));
        }

        let branch = thread
            .branch_name
            .clone()
            .unwrap_or_else(|| gantry_domain::fallback_branch_for_thread(thread.id));
        let instruction = build_create_pr_instruction(&branch);

        let url = run_pr_stream(thread.clone(), PathBuf::from(worktree), instruction).await?;

        let service = self.service.clone();
        let record_url = url.clone();
        tokio::task::spawn_blocking(move || service.record_pr_url(thread_id, &record_url))
            .await
            .context("join record pr url task")??;
        publish_diff(&self.service, &self.bus, thread_id).await;
        Ok(url)
    }
}

fn to_thread_dto(service: &AgentService, thread: &Thread) -> ThreadDto {
    let summary = service.diff_summary(thread).map(|summary| DiffSummaryDto {
        added: summary.added,
        removed: summary.removed,
    });
    thread_to_dto(thread, summary)
}

fn to_diff_stat_dto(stat: gantry_backend::FileDiffStat) -> FileDiffStatDto {
    FileDiffStatDto {
        path: stat.path,
        added: stat.added,
        removed: stat.removed,
        status: stat.status,
    }
}

async fn publish_diff(service: &Arc<AgentService>, bus: &EventBus, thread_id: i64) {
    let stats_service = service.clone();
    let stats =
        tokio::task::spawn_blocking(move || stats_service.list_thread_diff_stats(thread_id)).await;
    let Ok(Ok(stats)) = stats else {
        return;
    };
    let files: Vec<FileDiffStatDto> = stats.into_iter().map(to_diff_stat_dto).collect();
    let payload = serde_json::json!({
        "threadId": thread_id,
        "files": files,
    });
    bus.emit(file_change_topic(thread_id), payload);
}

/// Drives a dedicated codex session for the PR instruction under a bounded
/// deadline, harvesting the PR URL from its events.
async fn run_pr_stream(
    thread: Thread,
    worktree: PathBuf,
    instruction: String,
) -> anyhow::Result<String> {
    let adapter = CodexAdapter::from_env();
    let mut opts = SessionOptions::for_thread(thread);
    opts.working_directory = Some(worktree);
    if opts.sandbox_mode.trim().is_empty() {
        opts.sandbox_mode = "workspace-write".to_owned();
    }
    let _ = opts.metadata.insert(
        METADATA_MODEL.to_owned(),
        serde_json::Value::String(PR_MODEL.to_owned()),
    );
    let _ = opts.metadata.insert(
        METADATA_REASONING_LEVEL.to_owned(),
        serde_json::Value::String("low".to_owned()),
    );

    let started = adapter.start(opts)?;
    started
        .session
        .send(vec![Prompt::user(vec![PromptSegment::text(instruction)])])
        .context("failed to submit pr instruction")?;

    let mut stream = started.stream;
    let session = started.session.clone();
    let drained = tokio::time::timeout(PR_STREAM_DEADLINE, async {
        let mut url: Option<String> = None;
        while let Some(event) = stream.events.recv().await {
            if let Some(found) = extract_pr_url_from_event(&event) {
                url = Some(found);
            }
        }
        (url, stream.done.await.ok())
    })
    .await;

    let (url, outcome) = match drained {
        Ok(result) => result,
        Err(_) => {
            session.close();
            return Err(anyhow!("pr creation timed out"));
        }
    };

    if let Some(SessionOutcome::Failed { message }) = outcome {
        return Err(anyhow!(message).context("pr agent run failed"));
    }
    url.ok_or_else(|| anyhow!("failed to detect a PR URL in the agent output"))
}
