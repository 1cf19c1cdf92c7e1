//! Per-thread git worktree provisioning under a managed root directory.
//!
//! Layout: `<root>/<project-slug>/<thread-suffix>/` where the suffix is
//! either the bare thread id (older layout, still reused when valid) or
//! `<title-slug>-<id>`.

use anyhow::{anyhow, Context as _};
use std::path::{Path, PathBuf};

use gantry_domain::naming;

use crate::git::{resolve_git_bin, run_git};

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProvisionedWorktree {
    pub worktree_path: PathBuf,
    /// Directory the agent should run in. Differs from `worktree_path` when
    /// the project lives in a subdirectory of its repository.
    pub working_dir: PathBuf,
    pub repo_root: PathBuf,
}

pub struct WorktreeManager {
    root: PathBuf,
    git: PathBuf,
}

impl WorktreeManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            git: resolve_git_bin(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Creates or reuses the worktree for a thread. An existing directory
    /// that is a valid worktree is reused unchanged; stale content is
    /// overwritten with a forced attach.
    pub fn ensure_for_thread(
        &self,
        project_path: &Path,
        thread_id: i64,
        name_hint: &str,
        branch_name: Option<&str>,
    ) -> anyhow::Result<ProvisionedWorktree> {
        if project_path.as_os_str().is_empty() {
            return Err(anyhow!("project path is required"));
        }

        let repo_root = PathBuf::from(
            self.repo_root(project_path)
                .context("project is not a git repository")?,
        );

        let project_slug = naming::sanitize_slug(
            &project_path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default(),
        );

        let id_suffix = thread_id.to_string();
        let hint = name_hint.trim();
        let dir_suffix = if hint.is_empty() {
            id_suffix.clone()
        } else {
            naming::worktree_dir_suffix(hint, thread_id)
        };

        let mut worktree_path = self.root.join(&project_slug).join(&dir_suffix);
        if dir_suffix != id_suffix {
            // Older layout used the bare thread id; keep using it when the
            // directory is still a valid worktree.
            let old_path = self.root.join(&project_slug).join(&id_suffix);
            if old_path.is_dir() && self.is_worktree(&old_path) {
                worktree_path = old_path;
            }
        }

        if let Some(parent) = worktree_path.parent() {
            std::fs::create_dir_all(parent).context("failed to create worktrees root")?;
        }

        if worktree_path.is_dir() {
            if !self.is_worktree(&worktree_path) {
                self.attach(&repo_root, &worktree_path, project_path, thread_id, branch_name, true)?;
            }
        } else {
            self.attach(&repo_root, &worktree_path, project_path, thread_id, branch_name, false)?;
        }

        let working_dir = match project_path.strip_prefix(&repo_root) {
            Ok(rel) if !rel.as_os_str().is_empty() => {
                let dir = worktree_path.join(rel);
                std::fs::create_dir_all(&dir).context("failed to create working subdir")?;
                dir
            }
            _ => worktree_path.clone(),
        };

        Ok(ProvisionedWorktree {
            worktree_path,
            working_dir,
            repo_root,
        })
    }

    /// Detaches a worktree from its repository and prunes stale metadata.
    /// Best-effort: a missing repository or an already-removed worktree is
    /// an acceptable end state. Paths outside the managed root are refused.
    pub fn remove_for_thread(&self, worktree_path: &Path) -> anyhow::Result<()> {
        if worktree_path.as_os_str().is_empty() {
            return Ok(());
        }
        if !self.within_root(worktree_path) {
            return Err(anyhow!(
                "worktree path {} lies outside the managed root",
                worktree_path.display()
            ));
        }
        let Ok(repo_root) = self.repo_root(worktree_path) else {
            return Ok(());
        };
        let repo_root = PathBuf::from(repo_root);
        if let Err(err) = run_git(
            &self.git,
            &repo_root,
            [
                "worktree",
                "remove",
                "--force",
                &worktree_path.to_string_lossy(),
            ],
        ) {
            tracing::debug!(error = %err, path = %worktree_path.display(), "worktree remove skipped");
        }
        let _ = run_git(&self.git, &repo_root, ["worktree", "prune"]);
        Ok(())
    }

    fn attach(
        &self,
        repo_root: &Path,
        worktree_path: &Path,
        project_path: &Path,
        thread_id: i64,
        branch_name: Option<&str>,
        force: bool,
    ) -> anyhow::Result<()> {
        let base_ref = self.current_ref(project_path)?;
        let branch = branch_name
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_owned)
            .unwrap_or_else(|| naming::fallback_branch_for_thread(thread_id));

        let path_str = worktree_path
            .to_str()
            .ok_or_else(|| anyhow!("invalid worktree path"))?;

        let mut args = vec!["worktree", "add"];
        if force {
            args.push("--force");
        }
        args.extend(["-B", &branch, path_str, &base_ref]);
        run_git(&self.git, repo_root, args)
            .with_context(|| format!("failed to attach worktree at {}", worktree_path.display()))?;
        Ok(())
    }

    fn current_ref(&self, path: &Path) -> anyhow::Result<String> {
        // Prefer the branch name, fall back to the commit hash.
        if let Ok(branch) = run_git(&self.git, path, ["symbolic-ref", "--short", "-q", "HEAD"])
            && !branch.is_empty()
        {
            return Ok(branch);
        }
        run_git(&self.git, path, ["rev-parse", "HEAD"]).context("failed to resolve base ref")
    }

    fn is_worktree(&self, path: &Path) -> bool {
        run_git(&self.git, path, ["rev-parse", "--is-inside-work-tree"]).is_ok()
    }

    fn repo_root(&self, path: &Path) -> anyhow::Result<String> {
        run_git(&self.git, path, ["rev-parse", "--show-toplevel"])
    }

    fn within_root(&self, path: &Path) -> bool {
        let root = match std::path::absolute(&self.root) {
            Ok(root) => root,
            Err(_) => return false,
        };
        let path = match std::path::absolute(path) {
            Ok(path) => path,
            Err(_) => return false,
        };
        path != root && path.starts_with(&root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{assert_git_success, init_repo_with_commit};

    #[test]
    fn ensure_creates_then_reuses_a_worktree() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let repo = tmp.path().join("proj");
        init_repo_with_commit(&repo);

        let manager = WorktreeManager::new(tmp.path().join("worktrees"));
        let first = manager
            .ensure_for_thread(&repo, 7, "Fix Flaky Tests", None)
            .expect("first ensure should provision");
        assert!(first.worktree_path.ends_with("proj/fix-flaky-tests-7"));
        assert_eq!(first.working_dir, first.worktree_path);
        assert!(first.worktree_path.join(".git").exists());

        // Drop a marker; a pure reuse must leave it in place.
        let marker = first.worktree_path.join("marker.txt");
        std::fs::write(&marker, "keep").expect("write marker");

        let second = manager
            .ensure_for_thread(&repo, 7, "Fix Flaky Tests", None)
            .expect("second ensure should reuse");
        assert_eq!(second.worktree_path, first.worktree_path);
        assert_eq!(std::fs::read_to_string(&marker).expect("marker"), "keep");
    }

    #[test]
    fn ensure_maps_subdirectory_projects_into_the_worktree() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let repo = tmp.path().join("mono");
        init_repo_with_commit(&repo);
        let nested = repo.join("services").join("api");
        std::fs::create_dir_all(&nested).expect("nested dirs");

        let manager = WorktreeManager::new(tmp.path().join("worktrees"));
        let provisioned = manager
            .ensure_for_thread(&nested, 3, "", Some("gantry/api-3"))
            .expect("ensure should provision");
        assert!(provisioned.working_dir.ends_with("services/api"));
        assert!(provisioned.working_dir.starts_with(&provisioned.worktree_path));
    }

    #[test]
    fn ensure_fails_outside_a_repository() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let plain = tmp.path().join("plain");
        std::fs::create_dir_all(&plain).expect("mkdir");

        let manager = WorktreeManager::new(tmp.path().join("worktrees"));
        let err = manager
            .ensure_for_thread(&plain, 1, "", None)
            .expect_err("non-repo must be rejected");
        assert!(format!("{err:#}").contains("not a git repository"));
    }

    #[test]
    fn remove_refuses_paths_outside_the_managed_root() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let manager = WorktreeManager::new(tmp.path().join("worktrees"));
        let err = manager
            .remove_for_thread(tmp.path())
            .expect_err("outside path must be refused");
        assert!(format!("{err:#}").contains("outside the managed root"));
    }

    #[test]
    fn remove_detaches_a_provisioned_worktree() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let repo = tmp.path().join("proj");
        init_repo_with_commit(&repo);

        let manager = WorktreeManager::new(tmp.path().join("worktrees"));
        let provisioned = manager
            .ensure_for_thread(&repo, 11, "cleanup", None)
            .expect("ensure should provision");
        manager
            .remove_for_thread(&provisioned.worktree_path)
            .expect("remove should succeed");
        assert!(!provisioned.worktree_path.exists());

        // Removing again is fine; "already gone" is an acceptable end state.
        manager
            .remove_for_thread(&provisioned.worktree_path)
            .expect("second remove is a no-op");
        assert_git_success(&repo, &["worktree", "prune"]);
    }
}
