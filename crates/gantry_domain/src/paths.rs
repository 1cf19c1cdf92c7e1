use std::path::{Path, PathBuf};

pub const GANTRY_ROOT_ENV: &str = "GANTRY_ROOT";
pub const GANTRY_CODEX_BIN_ENV: &str = "GANTRY_CODEX_BIN";
pub const GANTRY_GIT_BIN_ENV: &str = "GANTRY_GIT_BIN";
pub const GANTRY_AGENTS_CONFIG_ENV: &str = "GANTRY_AGENTS_CONFIG";

pub fn worktrees_root(gantry_root: &Path) -> PathBuf {
    gantry_root.join("worktrees")
}

pub fn sqlite_path(gantry_root: &Path) -> PathBuf {
    gantry_root.join("gantry.db")
}

pub fn agents_config_path(gantry_root: &Path) -> PathBuf {
    gantry_root.join("agents.json")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roots_join_to_expected_subpaths() {
        let base = PathBuf::from("gantry-root");
        assert_eq!(worktrees_root(&base), base.join("worktrees"));
        assert_eq!(sqlite_path(&base), base.join("gantry.db"));
        assert_eq!(agents_config_path(&base), base.join("agents.json"));
        assert_eq!(GANTRY_ROOT_ENV, "GANTRY_ROOT");
    }
}
