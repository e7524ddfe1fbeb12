//! Synchronous git reads for status display and folder copies.
//!
//! Everything here shells out to `git` and degrades instead of failing: a
//! folder that is not a repository, a repository without commits, or a
//! missing git binary all produce well-defined defaults.

use std::{
    fs,
    path::{Path, PathBuf},
    process::Command,
};

use tracing::{debug, warn};

use crate::{
    error::{Error, Result},
    types::GitStatus,
};

const SHORT_HASH_LEN: usize = 7;

/// Locate the git directory of a working tree. Handles `.git` files written
/// by worktrees and submodules (`gitdir: <path>`).
pub fn git_dir(path: &Path) -> Option<PathBuf> {
    let dot_git = path.join(".git");
    if dot_git.is_dir() {
        return Some(dot_git);
    }
    let content = fs::read_to_string(&dot_git).ok()?;
    let target = content.trim().strip_prefix("gitdir:")?.trim();
    let target = PathBuf::from(target);
    let resolved = if target.is_absolute() {
        target
    } else {
        path.join(target)
    };
    resolved.is_dir().then_some(resolved)
}

/// Current status of the working tree at `path`. Never fails.
pub fn read_status(path: &Path) -> GitStatus {
    let Some(git_dir) = git_dir(path) else {
        return GitStatus::unknown();
    };
    let Some(branch) = read_branch(&git_dir) else {
        return GitStatus::unknown();
    };
    GitStatus {
        branch,
        diff_count: diff_count(path),
        latest_commit: latest_commit(path),
    }
}

/// Branch name from `HEAD`, or the short hash when detached.
fn read_branch(git_dir: &Path) -> Option<String> {
    let head = fs::read_to_string(git_dir.join("HEAD")).ok()?;
    let head = head.trim();
    if let Some(reference) = head.strip_prefix("ref:") {
        let reference = reference.trim();
        return Some(
            reference
                .strip_prefix("refs/heads/")
                .unwrap_or(reference)
                .to_string(),
        );
    }
    Some(head.chars().take(SHORT_HASH_LEN).collect())
}

fn diff_count(path: &Path) -> u32 {
    run_git(path, "git status", &["status", "--porcelain"])
        .map(|out| out.lines().filter(|l| !l.trim().is_empty()).count())
        .map(|n| u32::try_from(n).unwrap_or(u32::MAX))
        .unwrap_or(0)
}

fn latest_commit(path: &Path) -> String {
    run_git(path, "git log", &["log", "-1", "--format=%s (%h)"])
        .map(|out| out.trim().to_string())
        .unwrap_or_default()
}

/// Files git would carry over: tracked plus untracked-but-not-ignored.
/// `None` when `path` is not a repository or git is unavailable.
///
/// Names are taken byte for byte from git, so non-UTF-8 names survive.
pub fn listed_files(path: &Path) -> Option<Vec<PathBuf>> {
    let out = git_output(path, "git ls-files", &[
        "ls-files",
        "-z",
        "-co",
        "--exclude-standard",
    ])
    .inspect_err(|e| debug!(path = %path.display(), error = %e, "cannot list files"))
    .ok()?;
    Some(
        out.split(|byte| *byte == 0)
            .filter(|entry| !entry.is_empty())
            .map(path_from_bytes)
            .collect(),
    )
}

#[cfg(unix)]
fn path_from_bytes(bytes: &[u8]) -> PathBuf {
    use std::{ffi::OsStr, os::unix::ffi::OsStrExt};
    PathBuf::from(OsStr::from_bytes(bytes))
}

#[cfg(not(unix))]
fn path_from_bytes(bytes: &[u8]) -> PathBuf {
    PathBuf::from(String::from_utf8_lossy(bytes).into_owned())
}

/// Committer identity configured in the repository itself (not global).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalIdentity {
    pub name: Option<String>,
    pub email: Option<String>,
}

impl LocalIdentity {
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.email.is_none()
    }
}

pub fn local_identity(path: &Path) -> LocalIdentity {
    let read = |key: &str| {
        run_git(path, "git config", &["config", "--local", key])
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    };
    LocalIdentity {
        name: read("user.name"),
        email: read("user.email"),
    }
}

/// Write `identity` into the repository at `path`. Failures are logged.
pub fn apply_identity(path: &Path, identity: &LocalIdentity) {
    for (key, value) in [("user.name", &identity.name), ("user.email", &identity.email)] {
        let Some(value) = value else { continue };
        let args = ["config", "--local", key, value.as_str()];
        if let Err(e) = git_output(path, "git config", &args) {
            warn!(path = %path.display(), key, error = %e, "failed to restore git identity");
        }
    }
}

/// Run git in `cwd`, returning raw stdout on success.
fn git_output(cwd: &Path, operation: &'static str, args: &[&str]) -> Result<Vec<u8>> {
    let output = Command::new("git")
        .args(args)
        .current_dir(cwd)
        .output()
        .map_err(|e| Error::command_execution(operation, e))?;
    if !output.status.success() {
        return Err(Error::command_failed(
            operation,
            String::from_utf8_lossy(&output.stderr).trim(),
        ));
    }
    Ok(output.stdout)
}

/// Text output of a git read, `None` on any failure.
fn run_git(cwd: &Path, operation: &'static str, args: &[&str]) -> Option<String> {
    match git_output(cwd, operation, args) {
        Ok(stdout) => Some(String::from_utf8_lossy(&stdout).into_owned()),
        Err(e) => {
            debug!(cwd = %cwd.display(), error = %e, "git read failed");
            None
        },
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn git(dir: &Path, args: &[&str]) {
        let status = Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .unwrap()
            .status;
        assert!(status.success(), "git {args:?} failed");
    }

    pub(crate) fn init_test_repo() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        git(dir.path(), &["init", "-b", "main"]);
        git(dir.path(), &["config", "user.email", "test@test.com"]);
        git(dir.path(), &["config", "user.name", "Test"]);
        git(dir.path(), &["commit", "--allow-empty", "-m", "init"]);
        dir
    }

    #[test]
    fn non_repository_is_unknown() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(read_status(dir.path()), GitStatus::unknown());
        assert!(listed_files(dir.path()).is_none());
    }

    #[test]
    fn missing_path_is_unknown() {
        assert_eq!(
            read_status(Path::new("/definitely/not/here")),
            GitStatus::unknown()
        );
    }

    #[test]
    fn reads_branch_dirty_count_and_commit() {
        let repo = init_test_repo();
        fs::write(repo.path().join("a.txt"), "a").unwrap();
        fs::write(repo.path().join("b.txt"), "b").unwrap();

        let status = read_status(repo.path());
        assert_eq!(status.branch, "main");
        assert_eq!(status.diff_count, 2);
        assert!(status.latest_commit.starts_with("init ("));
        assert!(status.latest_commit.ends_with(')'));
    }

    #[test]
    fn detached_head_shows_short_hash() {
        let dir = tempfile::tempdir().unwrap();
        let git_dir = dir.path().join(".git");
        fs::create_dir(&git_dir).unwrap();
        fs::write(
            git_dir.join("HEAD"),
            "0123456789abcdef0123456789abcdef01234567\n",
        )
        .unwrap();
        assert_eq!(read_branch(&git_dir).unwrap(), "0123456");
    }

    #[test]
    fn follows_gitdir_files() {
        let dir = tempfile::tempdir().unwrap();
        let real = dir.path().join("real-git");
        fs::create_dir(&real).unwrap();
        fs::write(real.join("HEAD"), "ref: refs/heads/feature/x\n").unwrap();
        let work = dir.path().join("work");
        fs::create_dir(&work).unwrap();
        fs::write(work.join(".git"), "gitdir: ../real-git\n").unwrap();

        assert_eq!(git_dir(&work).unwrap(), work.join("../real-git"));
        assert_eq!(read_branch(&git_dir(&work).unwrap()).unwrap(), "feature/x");
    }

    #[test]
    fn listed_files_respects_ignore_rules() {
        let repo = init_test_repo();
        fs::write(repo.path().join(".gitignore"), ".env.local\n").unwrap();
        fs::write(repo.path().join(".env.local"), "SECRET=1").unwrap();
        fs::write(repo.path().join("main.rs"), "fn main() {}").unwrap();

        let mut files = listed_files(repo.path()).unwrap();
        files.sort();
        assert_eq!(files, vec![PathBuf::from(".gitignore"), PathBuf::from("main.rs")]);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn listed_files_keeps_non_utf8_names() {
        use std::{ffi::OsStr, os::unix::ffi::OsStrExt};

        let repo = init_test_repo();
        let odd = PathBuf::from(OsStr::from_bytes(b"caf\xe9.txt"));
        fs::write(repo.path().join(&odd), "bytes").unwrap();

        let files = listed_files(repo.path()).unwrap();
        assert_eq!(files, vec![odd.clone()]);
        assert!(repo.path().join(&files[0]).is_file());
    }

    #[test]
    fn failed_git_command_reports_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let err = git_output(dir.path(), "git log", &["log", "-1"]).unwrap_err();
        assert!(matches!(
            err,
            Error::CommandFailed { operation: "git log", ref stderr } if !stderr.is_empty()
        ));
    }

    #[test]
    fn identity_round_trip() {
        let repo = init_test_repo();
        let identity = local_identity(repo.path());
        assert_eq!(identity.name.as_deref(), Some("Test"));

        let other = init_test_repo();
        git(other.path(), &["config", "--unset", "user.name"]);
        apply_identity(other.path(), &LocalIdentity {
            name: Some("Copied".into()),
            email: None,
        });
        assert_eq!(local_identity(other.path()).name.as_deref(), Some("Copied"));
    }
}
