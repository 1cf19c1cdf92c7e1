use std::path::Path;
use std::process::{Command, Output};

pub(crate) fn run_git(repo_path: &Path, args: &[&str]) -> Output {
    Command::new("git")
        .args(args)
        .current_dir(repo_path)
        .env("GIT_AUTHOR_NAME", "gantry-tests")
        .env("GIT_AUTHOR_EMAIL", "gantry-tests@localhost")
        .env("GIT_COMMITTER_NAME", "gantry-tests")
        .env("GIT_COMMITTER_EMAIL", "gantry-tests@localhost")
        .output()
        .expect("git should spawn")
}

pub(crate) fn assert_git_success(repo_path: &Path, args: &[&str]) {
    let output = run_git(repo_path, args);
    if !output.status.success() {
        panic!(
            "git failed ({args:?}):\nstdout:\n{}\nstderr:\n{}",
            String::from_utf8_lossy(&output.stdout).trim(),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
}

/// Initializes a repository at `path` with one commit on `main`.
pub(crate) fn init_repo_with_commit(path: &Path) {
    std::fs::create_dir_all(path).expect("create repo dir");
    assert_git_success(path, &["init", "-b", "main"]);
    std::fs::write(path.join("README.md"), "seed\n").expect("write seed file");
    assert_git_success(path, &["add", "."]);
    assert_git_success(path, &["commit", "--no-gpg-sign", "-m", "seed"]);
}
