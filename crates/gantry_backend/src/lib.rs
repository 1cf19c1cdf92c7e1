mod git;
mod gitdiff;
mod store;
mod worktrees;

pub mod adapters;
pub mod connector;
pub mod registry;

pub use gitdiff::{collect_diff_stats, summarize_diff_stats, DiffSummary, FileDiffStat};
pub use store::{is_not_found, SqliteStore, StoreError, ThreadStore};
pub use worktrees::{ProvisionedWorktree, WorktreeManager};

#[cfg(test)]
mod test_support;
