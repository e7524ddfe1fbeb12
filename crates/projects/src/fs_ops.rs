//! Folder primitives: selective copy, move with copy fallback, removal,
//! duplicate naming, directory listing, and the desktop adapters (folder
//! picker, editor launcher).
//!
//! The disk functions are blocking; async callers run them on the blocking
//! pool.

use std::{
    fs,
    path::{Component, Path, PathBuf},
    sync::LazyLock,
};

use {
    async_trait::async_trait,
    regex::Regex,
    roost_config::EditorChoice,
    tracing::{debug, warn},
    walkdir::WalkDir,
};

use crate::{
    error::{Context, Error, Result},
    events::{DirEntry, DirListing},
    git,
    path_key::{canonicalize, display_name_of},
};

#[allow(clippy::expect_used)]
static NUMERIC_SUFFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(.*?)-(\d+)$").expect("suffix pattern is valid"));

/// First free sibling name for a copy of `path`: `app` becomes `app-1`,
/// `app-3` becomes `app-4`, probing upward while `is_taken` says so.
pub fn next_duplicate_path(path: &Path, is_taken: impl Fn(&Path) -> bool) -> PathBuf {
    let path = canonicalize(path);
    let name = display_name_of(&path);
    let parent = path.parent().map(Path::to_path_buf).unwrap_or_default();
    let (mut base, mut counter) = match NUMERIC_SUFFIX.captures(&name) {
        Some(caps) => match caps[2].parse::<u64>().ok().and_then(|n| n.checked_add(1)) {
            Some(next) => (caps[1].to_string(), next),
            None => (name.clone(), 1),
        },
        None => (name.clone(), 1),
    };
    loop {
        let candidate = parent.join(format!("{base}-{counter}"));
        if !is_taken(&candidate) {
            return candidate;
        }
        match counter.checked_add(1) {
            Some(next) => counter = next,
            None => {
                base = format!("{base}-{counter}");
                counter = 1;
            },
        }
    }
}

/// Copy a working tree the way a fresh checkout would look, plus selected
/// extras.
///
/// `.git` is copied whole. Of the working files, only what git tracks or
/// would track (untracked but not ignored) is copied, plus any `include`
/// entries that exist, ignored or not. Symlinks stay symlinks. A local
/// `user.name`/`user.email` is carried over. Individual file failures are
/// logged and skipped; the skipped entries are returned, relative to `src`.
pub fn copy_tree(src: &Path, dst: &Path, include: &[String]) -> Result<Vec<PathBuf>> {
    if !src.is_dir() {
        return Err(Error::invalid_path(src));
    }
    fs::create_dir_all(dst).with_context(|| format!("failed to create {}", dst.display()))?;
    let identity = git::local_identity(src);

    let dot_git = src.join(".git");
    if fs::symlink_metadata(&dot_git).is_ok() {
        copy_entry(&dot_git, &dst.join(".git")).context("failed to copy .git")?;
    }

    let mut files = git::listed_files(src).unwrap_or_else(|| {
        debug!(path = %src.display(), "not a git repository, copying include list only");
        Vec::new()
    });
    for extra in include {
        let relative = PathBuf::from(extra);
        if !files.contains(&relative) && fs::symlink_metadata(src.join(&relative)).is_ok() {
            files.push(relative);
        }
    }

    let mut skipped = Vec::new();
    for relative in files {
        if !is_plain_relative(&relative) {
            warn!(entry = %relative.display(), "skipping entry outside the folder");
            continue;
        }
        if let Err(e) = copy_entry(&src.join(&relative), &dst.join(&relative)) {
            warn!(entry = %relative.display(), error = %e, "failed to copy entry");
            skipped.push(relative);
        }
    }

    if !identity.is_empty() {
        git::apply_identity(dst, &identity);
    }
    debug!(src = %src.display(), dst = %dst.display(), skipped = skipped.len(), "copied tree");
    Ok(skipped)
}

/// Move `src` to `dst`. Tries a rename first and falls back to a full copy
/// followed by deleting the source, for moves across devices.
pub fn move_tree(src: &Path, dst: &Path) -> Result<()> {
    if fs::symlink_metadata(dst).is_ok() {
        return Err(Error::TargetExists {
            path: dst.to_path_buf(),
        });
    }
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }
    match fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(rename_err) => {
            debug!(
                src = %src.display(),
                dst = %dst.display(),
                error = %rename_err,
                "rename failed, copying instead"
            );
            if let Err(e) = copy_all(src, dst) {
                if let Err(cleanup) = fs::remove_dir_all(dst) {
                    warn!(path = %dst.display(), error = %cleanup, "failed to clean partial copy");
                }
                return Err(e);
            }
            remove_tree(src)
        },
    }
}

pub fn remove_tree(path: &Path) -> Result<()> {
    let meta = fs::symlink_metadata(path)?;
    if meta.is_dir() {
        fs::remove_dir_all(path)?;
    } else {
        fs::remove_file(path)?;
    }
    Ok(())
}

/// Remove `path` only if it is an empty directory.
pub fn remove_empty_dir(path: &Path) -> Result<()> {
    fs::remove_dir(path)?;
    Ok(())
}

/// Visible subdirectories of `path`, sorted by name.
pub fn list_dirs(path: &Path) -> Result<DirListing> {
    let current = canonicalize(path);
    let mut dirs = Vec::new();
    for entry in fs::read_dir(&current)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') || !entry.file_type()?.is_dir() {
            continue;
        }
        dirs.push(DirEntry {
            name,
            path: entry.path(),
        });
    }
    dirs.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(DirListing {
        parent: current.parent().map(Path::to_path_buf),
        current_path: current,
        dirs,
    })
}

/// Copy a file, symlink, or directory to `dst`.
fn copy_entry(src: &Path, dst: &Path) -> Result<()> {
    let meta = fs::symlink_metadata(src)?;
    if meta.is_dir() {
        return copy_all(src, dst);
    }
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }
    if meta.file_type().is_symlink() {
        recreate_symlink(src, dst)
    } else {
        fs::copy(src, dst)?;
        Ok(())
    }
}

/// Recursive copy of everything under `src`, preserving symlinks.
fn copy_all(src: &Path, dst: &Path) -> Result<()> {
    for entry in WalkDir::new(src).follow_links(false) {
        let entry = entry.map_err(|e| Error::external("walking source tree", e))?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| Error::external("walking source tree", e))?;
        let target = dst.join(relative);
        let file_type = entry.file_type();
        if file_type.is_dir() {
            fs::create_dir_all(&target)?;
        } else if file_type.is_symlink() {
            recreate_symlink(entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

fn recreate_symlink(src: &Path, dst: &Path) -> Result<()> {
    let target = fs::read_link(src)?;
    if fs::symlink_metadata(dst).is_ok() {
        fs::remove_file(dst)?;
    }
    #[cfg(unix)]
    std::os::unix::fs::symlink(&target, dst)?;
    #[cfg(windows)]
    {
        if src.is_dir() {
            std::os::windows::fs::symlink_dir(&target, dst)?;
        } else {
            std::os::windows::fs::symlink_file(&target, dst)?;
        }
    }
    Ok(())
}

fn is_plain_relative(path: &Path) -> bool {
    path.components().all(|c| matches!(c, Component::Normal(_)))
}

// ── Desktop adapters ────────────────────────────────────────────────

/// Asks the user for a folder.
#[async_trait]
pub trait FolderPicker: Send + Sync {
    /// `None` when the user cancels.
    async fn pick(&self) -> Result<Option<PathBuf>>;
}

/// Native folder dialog: `osascript` on macOS, `zenity` elsewhere.
pub struct CommandPicker;

#[async_trait]
impl FolderPicker for CommandPicker {
    async fn pick(&self) -> Result<Option<PathBuf>> {
        let mut command = if cfg!(target_os = "macos") {
            let mut c = tokio::process::Command::new("osascript");
            c.args(["-e", "POSIX path of (choose folder)"]);
            c
        } else {
            let mut c = tokio::process::Command::new("zenity");
            c.args(["--file-selection", "--directory"]);
            c
        };
        let output = command
            .output()
            .await
            .map_err(|e| Error::command_execution("folder picker", e))?;
        if !output.status.success() {
            debug!("folder picker cancelled");
            return Ok(None);
        }
        let picked = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok((!picked.is_empty()).then(|| canonicalize(picked)))
    }
}

/// Launches an external editor on a folder.
pub trait EditorLauncher: Send + Sync {
    fn launch(&self, editor: &EditorChoice, path: &Path) -> Result<()>;
}

/// Opens the folder with the named application, detached from this process.
pub struct SystemEditorLauncher;

impl EditorLauncher for SystemEditorLauncher {
    fn launch(&self, editor: &EditorChoice, path: &Path) -> Result<()> {
        let app = editor.app_name();
        open::with_detached(path, app)
            .map_err(|e| Error::command_execution("open in editor", e))?;
        debug!(path = %path.display(), app, "launched editor");
        Ok(())
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::git::tests::init_test_repo,
        rstest::rstest,
        std::{collections::HashSet, process::Command},
    };

    #[rstest]
    #[case("/p/app", &[], "/p/app-1")]
    #[case("/p/app", &["/p/app-1"], "/p/app-2")]
    #[case("/p/app-3", &[], "/p/app-4")]
    #[case("/p/app-3/", &["/p/app-4", "/p/app-5"], "/p/app-6")]
    #[case("/p/my-app", &[], "/p/my-app-1")]
    #[case("/p/app-18446744073709551615", &[], "/p/app-18446744073709551615-1")]
    #[case("/p/app-99999999999999999999", &[], "/p/app-99999999999999999999-1")]
    fn duplicate_names(#[case] path: &str, #[case] taken: &[&str], #[case] expected: &str) {
        let taken: HashSet<PathBuf> = taken.iter().map(PathBuf::from).collect();
        let next = next_duplicate_path(Path::new(path), |p| taken.contains(p));
        assert_eq!(next, PathBuf::from(expected));
    }

    #[test]
    fn copy_tree_is_selective() {
        let repo = init_test_repo();
        let src = repo.path();
        fs::write(src.join(".gitignore"), "target/\n.env.local\n").unwrap();
        fs::write(src.join("main.rs"), "fn main() {}").unwrap();
        fs::write(src.join(".env.local"), "SECRET=1").unwrap();
        fs::create_dir(src.join("target")).unwrap();
        fs::write(src.join("target/big.bin"), "junk").unwrap();
        #[cfg(unix)]
        std::os::unix::fs::symlink("main.rs", src.join("link.rs")).unwrap();

        let out = tempfile::tempdir().unwrap();
        let dst = out.path().join("copy");
        copy_tree(src, &dst, &[".env.local".into(), "missing.txt".into()]).unwrap();

        assert!(dst.join("main.rs").is_file());
        assert!(dst.join(".gitignore").is_file());
        assert_eq!(fs::read_to_string(dst.join(".env.local")).unwrap(), "SECRET=1");
        assert!(!dst.join("target").exists());
        assert!(!dst.join("missing.txt").exists());
        assert!(dst.join(".git/HEAD").is_file());
        #[cfg(unix)]
        assert!(fs::symlink_metadata(dst.join("link.rs")).unwrap().file_type().is_symlink());

        let name = Command::new("git")
            .args(["config", "--local", "user.name"])
            .current_dir(&dst)
            .output()
            .unwrap();
        assert_eq!(String::from_utf8_lossy(&name.stdout).trim(), "Test");
    }

    #[test]
    fn copy_tree_without_git_copies_include_list_only() {
        let src = tempfile::tempdir().unwrap();
        fs::write(src.path().join("notes.txt"), "n").unwrap();
        fs::write(src.path().join(".env.local"), "x").unwrap();
        let out = tempfile::tempdir().unwrap();
        let dst = out.path().join("copy");

        copy_tree(src.path(), &dst, &[".env.local".into()]).unwrap();
        assert!(dst.join(".env.local").is_file());
        assert!(!dst.join("notes.txt").exists());
    }

    #[cfg(unix)]
    #[test]
    fn copy_tree_reports_entries_it_cannot_copy() {
        let src = tempfile::tempdir().unwrap();
        fs::write(src.path().join(".env.local"), "x").unwrap();
        let _socket = std::os::unix::net::UnixListener::bind(src.path().join("app.sock")).unwrap();
        let out = tempfile::tempdir().unwrap();
        let dst = out.path().join("copy");

        let skipped = copy_tree(src.path(), &dst, &[".env.local".into(), "app.sock".into()]).unwrap();
        assert_eq!(skipped, vec![PathBuf::from("app.sock")]);
        assert!(dst.join(".env.local").is_file());
    }

    #[cfg(unix)]
    #[test]
    fn copy_preserves_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let src = tempfile::tempdir().unwrap();
        let script = src.path().join("run.sh");
        fs::write(&script, "#!/bin/sh\n").unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
        let out = tempfile::tempdir().unwrap();
        let dst = out.path().join("copy");

        copy_all(src.path(), &dst).unwrap();
        let mode = fs::metadata(dst.join("run.sh")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
    }

    #[test]
    fn move_tree_renames_and_creates_parents() {
        let root = tempfile::tempdir().unwrap();
        let src = root.path().join("a/x");
        fs::create_dir_all(&src).unwrap();
        fs::write(src.join("f.txt"), "f").unwrap();
        let dst = root.path().join("b/deeper/x");

        move_tree(&src, &dst).unwrap();
        assert!(!src.exists());
        assert_eq!(fs::read_to_string(dst.join("f.txt")).unwrap(), "f");
    }

    #[test]
    fn move_tree_refuses_existing_target() {
        let root = tempfile::tempdir().unwrap();
        let src = root.path().join("x");
        let dst = root.path().join("y");
        fs::create_dir_all(&src).unwrap();
        fs::create_dir_all(&dst).unwrap();

        let err = move_tree(&src, &dst).unwrap_err();
        assert_eq!(err.to_string(), "Target exists");
        assert!(src.exists());
    }

    #[test]
    fn lists_visible_dirs_sorted() {
        let root = tempfile::tempdir().unwrap();
        for name in ["zeta", "alpha", ".hidden"] {
            fs::create_dir(root.path().join(name)).unwrap();
        }
        fs::write(root.path().join("file.txt"), "").unwrap();

        let listing = list_dirs(root.path()).unwrap();
        let names: Vec<_> = listing.dirs.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
        assert_eq!(listing.parent.as_deref(), root.path().parent());
    }

    #[test]
    fn remove_empty_dir_refuses_content() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("g");
        fs::create_dir(&dir).unwrap();
        fs::write(dir.join("keep"), "").unwrap();
        assert!(remove_empty_dir(&dir).is_err());
        fs::remove_file(dir.join("keep")).unwrap();
        remove_empty_dir(&dir).unwrap();
        assert!(!dir.exists());
    }
}
