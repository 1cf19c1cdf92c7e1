//! Aggregated staged + unstaged diff statistics for a worktree.

use anyhow::{anyhow, Context as _};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::git::{resolve_git_bin, run_git};

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct FileDiffStat {
    pub path: String,
    pub added: i64,
    pub removed: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub status: String,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct DiffSummary {
    pub added: i64,
    pub removed: i64,
}

impl DiffSummary {
    pub fn is_empty(self) -> bool {
        self.added == 0 && self.removed == 0
    }
}

pub fn summarize_diff_stats(stats: &[FileDiffStat]) -> DiffSummary {
    let mut summary = DiffSummary::default();
    for stat in stats {
        summary.added += stat.added;
        summary.removed += stat.removed;
    }
    summary
}

/// Collects per-file added/removed counts plus porcelain status codes for
/// everything changed in the worktree, staged or not.
pub fn collect_diff_stats(worktree: &Path) -> anyhow::Result<Vec<FileDiffStat>> {
    if worktree.as_os_str().is_empty() {
        return Err(anyhow!("worktree path is required"));
    }
    let meta = std::fs::metadata(worktree).context("stat worktree")?;
    if !meta.is_dir() {
        return Err(anyhow!("worktree path {} is not a directory", worktree.display()));
    }

    let git = resolve_git_bin();
    let status_map = parse_status(&run_git(&git, worktree, ["status", "--porcelain"])?);

    let mut numstat = BTreeMap::<String, (i64, i64)>::new();
    match run_git(&git, worktree, ["diff", "--numstat", "HEAD"]) {
        Ok(output) => accumulate_numstat(&output, &mut numstat),
        Err(_) => {
            // Unborn branch: diff against the empty tree instead.
            let empty_tree = run_git(&git, worktree, ["hash-object", "-t", "tree", "/dev/null"])
                .context("resolve empty tree hash")?;
            let output = run_git(&git, worktree, ["diff", "--numstat", empty_tree.trim()])?;
            accumulate_numstat(&output, &mut numstat);
        }
    }
    let cached = run_git(&git, worktree, ["diff", "--numstat", "--cached"])?;
    accumulate_numstat(&cached, &mut numstat);

    let mut result: Vec<FileDiffStat> = Vec::new();
    let mut push = |path: &str, status: &str, counts: Option<(i64, i64)>| {
        if result.iter().any(|stat| stat.path == path) {
            return;
        }
        let (added, removed) = counts.unwrap_or_default();
        result.push(FileDiffStat {
            path: path.to_owned(),
            added,
            removed,
            status: status.to_owned(),
        });
    };

    for (path, status) in &status_map {
        push(path, status, numstat.get(path).copied());
    }
    for (path, counts) in &numstat {
        let status = status_map.get(path).map(String::as_str).unwrap_or_default();
        push(path, status, Some(*counts));
    }

    result.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(result)
}

fn parse_status(output: &str) -> BTreeMap<String, String> {
    let mut status = BTreeMap::new();
    for line in output.lines() {
        if line.len() < 3 {
            continue;
        }
        let code = line[..2].trim();
        let mut path = line[3..].trim();
        if code.is_empty() || path.is_empty() {
            continue;
        }
        if let Some((_, renamed)) = path.rsplit_once(" -> ") {
            path = renamed.trim();
        }
        let path = path.trim_matches('"');
        status.insert(path.to_owned(), code.to_owned());
    }
    status
}

fn accumulate_numstat(output: &str, accum: &mut BTreeMap<String, (i64, i64)>) {
    for line in output.lines() {
        let mut parts = line.split('\t');
        let (Some(added), Some(removed), Some(raw_path)) =
            (parts.next(), parts.next(), parts.next())
        else {
            continue;
        };
        let mut path = raw_path.trim();
        if path.is_empty() {
            continue;
        }
        if let Some((_, renamed)) = path.rsplit_once(" -> ") {
            path = renamed.trim();
        }
        let entry = accum.entry(path.to_owned()).or_default();
        entry.0 += parse_numstat_value(added);
        entry.1 += parse_numstat_value(removed);
    }
}

fn parse_numstat_value(value: &str) -> i64 {
    let value = value.trim();
    if value == "-" {
        return 0;
    }
    value.parse().unwrap_or(0)
}
