use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context as _};
use tracing_subscriber::EnvFilter;

use gantry_backend::adapters::CodexAdapter;
use gantry_backend::registry::{build_adapter, load_agent_entries};
use gantry_backend::{SqliteStore, ThreadStore, WorktreeManager};
use gantry_domain::paths;
use gantry_server::{AgentApi, AgentService, EventBus};

fn resolve_gantry_root() -> anyhow::Result<PathBuf> {
    if let Some(root) = std::env::var_os(paths::GANTRY_ROOT_ENV) {
        let root = root.to_string_lossy();
        let trimmed = root.trim();
        if trimmed.is_empty() {
            return Err(anyhow!("{} is set but empty", paths::GANTRY_ROOT_ENV));
        }
        return Ok(PathBuf::from(trimmed));
    }
    let home = std::env::var_os("HOME").ok_or_else(|| anyhow!("HOME is not set"))?;
    Ok(PathBuf::from(home).join(".gantry"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let root = resolve_gantry_root()?;
    std::fs::create_dir_all(&root)
        .with_context(|| format!("failed to create {}", root.display()))?;

    let store: Arc<dyn ThreadStore> = Arc::new(
        SqliteStore::open(paths::sqlite_path(&root)).context("failed to init thread store")?,
    );
    let worktrees = Arc::new(WorktreeManager::new(paths::worktrees_root(&root)));

    let service = Arc::new(AgentService::new("codex", store).with_worktrees(worktrees));
    service.register("codex", Arc::new(CodexAdapter::from_env()))?;

    let config_path = std::env::var_os(paths::GANTRY_AGENTS_CONFIG_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| paths::agents_config_path(&root));
    for entry in load_agent_entries(&config_path) {
        service.register(&entry.id, build_adapter(&entry))?;
    }
    tracing::info!(agents = ?service.registered_agents(), root = %root.display(), "gantry ready");

    service.start_worktree_cleanup(Duration::from_secs(60 * 60));

    let bus = EventBus::new(256);
    let _api = AgentApi::new(service.clone(), bus);

    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    tracing::info!("shutting down");
    service.stop_worktree_cleanup();
    Ok(())
}
