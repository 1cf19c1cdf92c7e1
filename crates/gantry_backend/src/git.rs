use anyhow::{anyhow, Context as _};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::Command;

use gantry_domain::paths;

/// Git binary to invoke, overridable for packaged installs.
pub(crate) fn resolve_git_bin() -> PathBuf {
    std::env::var_os(paths::GANTRY_GIT_BIN_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("git"))
}

/// Runs git in `repo_path` and returns trimmed stdout, folding stderr into
/// the error on failure.
pub(crate) fn run_git<I, S>(git: &Path, repo_path: &Path, args: I) -> anyhow::Result<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = Command::new(git)
        .args(args)
        .current_dir(repo_path)
        .output()
        .context("failed to spawn git")?;

    if !output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(anyhow!(
            "git failed ({}):\nstdout:\n{}\nstderr:\n{}",
            output.status,
            stdout.trim(),
            stderr.trim()
        ));
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_owned())
}
