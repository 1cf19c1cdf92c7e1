//! Background reclamation of orphaned worktrees.
//!
//! A worktree is an orphan when its leaf directory names a thread that no
//! longer exists in the store and no active stream is using it. Only a
//! definitive "not found" triggers deletion; any other storage error skips
//! the leaf.

use std::sync::Arc;
use std::time::Duration;

use gantry_backend::{is_not_found, ThreadStore, WorktreeManager};
use gantry_domain::naming::parse_thread_id_from_dir;
use tokio_util::sync::CancellationToken;

use crate::service::{thread_has_active_stream, ActiveStreams};

/// Everything one sweep needs, detached from the service so the periodic
/// task owns its own handles.
pub(crate) struct SweepContext {
    store: Arc<dyn ThreadStore>,
    manager: Arc<WorktreeManager>,
    active: ActiveStreams,
}

impl SweepContext {
    pub(crate) fn new(
        store: Arc<dyn ThreadStore>,
        manager: Arc<WorktreeManager>,
        active: ActiveStreams,
    ) -> Self {
        Self {
            store,
            manager,
            active,
        }
    }
}

pub(crate) struct ReclaimHandle {
    token: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

impl ReclaimHandle {
    pub(crate) fn stop(self) {
        self.token.cancel();
        self.task.abort();
    }
}

pub(crate) fn spawn_reclaimer(context: SweepContext, interval: Duration) -> ReclaimHandle {
    let token = CancellationToken::new();
    let task_token = token.clone();
    let context = Arc::new(context);
    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it so a freshly started
        // service does not sweep while it is still bootstrapping.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let context = context.clone();
                    let swept =
                        tokio::task::spawn_blocking(move || sweep_orphan_worktrees(&context)).await;
                    if let Err(err) = swept {
                        tracing::error!(error = %err, "worktree reclamation task failed");
                    }
                }
                _ = task_token.cancelled() => return,
            }
        }
    });
    ReclaimHandle { token, task }
}

/// One reclamation pass over `<root>/<project-slug>/<thread-suffix>`.
pub(crate) fn sweep_orphan_worktrees(context: &SweepContext) {
    let root = context.manager.root().to_path_buf();
    let Ok(project_dirs) = std::fs::read_dir(&root) else {
        return;
    };

    for project_dir in project_dirs.flatten() {
        if !project_dir.file_type().map(|ft| ft.is_dir()).unwrap_or(false) {
            continue;
        }
        let Ok(leaf_dirs) = std::fs::read_dir(project_dir.path()) else {
            continue;
        };
        for leaf in leaf_dirs.flatten() {
            if !leaf.file_type().map(|ft| ft.is_dir()).unwrap_or(false) {
                continue;
            }
            let name = leaf.file_name();
            let Some(thread_id) = parse_thread_id_from_dir(&name.to_string_lossy()) else {
                continue;
            };
            if thread_has_active_stream(&context.active, thread_id) {
                continue;
            }
            match context.store.get_thread(thread_id) {
                Ok(_) => {}
                Err(err) if is_not_found(&err) => {
                    tracing::info!(thread_id, path = %leaf.path().display(), "reclaiming orphan worktree");
                    if let Err(err) = context.manager.remove_for_thread(&leaf.path()) {
                        tracing::debug!(error = %err, "orphan worktree removal skipped");
                    }
                }
                Err(err) => {
                    // A flaky store read must never delete a live worktree.
                    tracing::debug!(error = %err, thread_id, "skipping leaf on store error");
                }
            }
        }
    }
}
