//! The request surface the coordinator drives, and its local implementation.
//!
//! Long-running requests (`duplicate`, `delete`, `move_bulk`, `pick_folder`)
//! validate their input, return immediately, and report their outcome later
//! as a [`ServerEvent`] carrying the caller's [`OperationId`].

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use {
    async_trait::async_trait,
    roost_config::{EditorChoice, MoveMode, WatcherConfig},
    tokio::sync::{Mutex, broadcast},
    tracing::{debug, info, warn},
};

use crate::{
    error::{Error, Result},
    events::{DirListing, MoveResult, OperationId, ServerEvent},
    fs_ops::{self, CommandPicker, EditorLauncher, FolderPicker, SystemEditorLauncher},
    git,
    path_key::{canonicalize, display_name_of},
    types::GitStatus,
    watcher::StatusWatcher,
};

const EVENT_CAPACITY: usize = 256;

pub const SOURCE_MISSING: &str = "Source does not exist";

#[async_trait]
pub trait FolderBackend: Send + Sync {
    /// Open the folder picker. The choice arrives as `FolderPicked`.
    async fn pick_folder(&self, op_id: OperationId) -> Result<()>;

    /// Copy `path` to the next free `-N` sibling. Completes with
    /// `DuplicationComplete`.
    async fn duplicate(&self, op_id: OperationId, path: &Path, include_files: &[String])
    -> Result<()>;

    /// Remove `path` from disk. Completes with `DeletionComplete`.
    async fn delete(&self, op_id: OperationId, path: &Path) -> Result<()>;

    /// Move every path into `target_parent`. Completes with one
    /// `MoveBulkComplete` holding a result per input path.
    async fn move_bulk(
        &self,
        op_id: OperationId,
        paths: &[PathBuf],
        target_parent: &Path,
        include_files: &[String],
        mode: MoveMode,
    ) -> Result<()>;

    /// Start watching `path` and return its current status.
    async fn watch(&self, path: &Path) -> Result<GitStatus>;

    /// Start watching every path that exists. Returns their statuses.
    async fn watch_bulk(&self, paths: &[PathBuf]) -> Result<HashMap<PathBuf, GitStatus>>;

    async fn unwatch(&self, path: &Path) -> Result<()>;

    /// Read statuses without watching.
    async fn git_info(&self, paths: &[PathBuf]) -> Result<HashMap<PathBuf, GitStatus>>;

    async fn open_in_editor(&self, editor: &EditorChoice, path: &Path) -> Result<()>;

    /// Write `content` to `dir/filename`.
    async fn write_file(&self, dir: &Path, filename: &str, content: &str) -> Result<()>;

    async fn list_dirs(&self, path: &Path) -> Result<DirListing>;

    /// Remove `path` if it is an empty directory.
    async fn remove_empty_dir(&self, path: &Path) -> Result<()>;

    fn subscribe(&self) -> broadcast::Receiver<ServerEvent>;
}

struct Inner {
    events: broadcast::Sender<ServerEvent>,
    watcher: Mutex<StatusWatcher>,
    picker: Box<dyn FolderPicker>,
    launcher: Box<dyn EditorLauncher>,
    picking: AtomicBool,
}

impl Inner {
    fn publish(&self, event: ServerEvent) {
        debug!(kind = %event.kind(), "publishing event");
        let _ = self.events.send(event);
    }
}

/// Works directly on the local filesystem.
#[derive(Clone)]
pub struct LocalBackend {
    inner: Arc<Inner>,
}

impl LocalBackend {
    pub fn new(config: WatcherConfig) -> Self {
        Self::with_adapters(config, Box::new(CommandPicker), Box::new(SystemEditorLauncher))
    }

    pub fn with_adapters(
        config: WatcherConfig,
        picker: Box<dyn FolderPicker>,
        launcher: Box<dyn EditorLauncher>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let watcher = StatusWatcher::new(config, events.clone());
        Self {
            inner: Arc::new(Inner {
                events,
                watcher: Mutex::new(watcher),
                picker,
                launcher,
                picking: AtomicBool::new(false),
            }),
        }
    }

    pub async fn watched_paths(&self) -> Vec<PathBuf> {
        self.inner.watcher.lock().await.watched()
    }

    /// Release every watch.
    pub async fn shutdown(&self) {
        self.inner.watcher.lock().await.stop_all();
    }
}

#[async_trait]
impl FolderBackend for LocalBackend {
    async fn pick_folder(&self, op_id: OperationId) -> Result<()> {
        if self.inner.picking.swap(true, Ordering::SeqCst) {
            debug!("picker already open");
            self.inner
                .publish(ServerEvent::FolderPicked { op_id, path: None });
            return Ok(());
        }
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let path = match inner.picker.pick().await {
                Ok(path) => path,
                Err(e) => {
                    warn!(error = %e, "folder picker failed");
                    None
                },
            };
            inner.picking.store(false, Ordering::SeqCst);
            inner.publish(ServerEvent::FolderPicked { op_id, path });
        });
        Ok(())
    }

    async fn duplicate(
        &self,
        op_id: OperationId,
        path: &Path,
        include_files: &[String],
    ) -> Result<()> {
        let src = canonicalize(path);
        if !src.is_dir() {
            return Err(Error::invalid_path(src));
        }
        let include = include_files.to_vec();
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let copy_src = src.clone();
            let result = run_blocking(move || {
                let target = fs_ops::next_duplicate_path(&copy_src, |p| p.exists());
                fs_ops::copy_tree(&copy_src, &target, &include).map(|_skipped| target)
            })
            .await;
            let event = match result {
                Ok(target) => {
                    info!(src = %src.display(), dst = %target.display(), "duplicated folder");
                    ServerEvent::DuplicationComplete {
                        op_id,
                        path: src,
                        new_path: Some(target),
                        success: true,
                        error: None,
                    }
                },
                Err(e) => {
                    warn!(src = %src.display(), error = %e, "duplicate failed");
                    ServerEvent::DuplicationComplete {
                        op_id,
                        path: src,
                        new_path: None,
                        success: false,
                        error: Some(e.to_string()),
                    }
                },
            };
            inner.publish(event);
        });
        Ok(())
    }

    async fn delete(&self, op_id: OperationId, path: &Path) -> Result<()> {
        let target = canonicalize(path);
        if std::fs::symlink_metadata(&target).is_err() {
            return Err(Error::invalid_path(target));
        }
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            inner.watcher.lock().await.stop_watching(&target);
            let doomed = target.clone();
            let result = run_blocking(move || fs_ops::remove_tree(&doomed)).await;
            let error = match result {
                Ok(()) => {
                    info!(path = %target.display(), "deleted folder");
                    None
                },
                Err(e) => {
                    warn!(path = %target.display(), error = %e, "delete failed");
                    Some(e.to_string())
                },
            };
            inner.publish(ServerEvent::DeletionComplete {
                op_id,
                path: target,
                success: error.is_none(),
                error,
            });
        });
        Ok(())
    }

    async fn move_bulk(
        &self,
        op_id: OperationId,
        paths: &[PathBuf],
        target_parent: &Path,
        include_files: &[String],
        mode: MoveMode,
    ) -> Result<()> {
        if target_parent.as_os_str().is_empty() {
            return Err(Error::invalid_path(target_parent));
        }
        let sources: Vec<PathBuf> = paths.iter().map(canonicalize).collect();
        let target_parent = canonicalize(target_parent);
        let include = include_files.to_vec();
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            info!(count = sources.len(), target = %target_parent.display(), %mode, "moving folders");
            let mut results = Vec::with_capacity(sources.len());
            for src in sources {
                let dst = target_parent.join(display_name_of(&src));
                let (from, to, include) = (src.clone(), dst.clone(), include.clone());
                let outcome = run_blocking(move || move_one(&from, &to, &include, mode)).await;
                match outcome {
                    Ok(()) => {
                        inner.watcher.lock().await.stop_watching(&src);
                        debug!(src = %src.display(), dst = %dst.display(), "moved folder");
                        results.push(MoveResult::moved(src, dst));
                    },
                    Err(e) => {
                        warn!(src = %src.display(), error = %e, "move failed");
                        results.push(MoveResult::failed(src, e.to_string()));
                    },
                }
            }
            inner.publish(ServerEvent::MoveBulkComplete { op_id, results });
        });
        Ok(())
    }

    async fn watch(&self, path: &Path) -> Result<GitStatus> {
        let path = canonicalize(path);
        self.inner.watcher.lock().await.start_watching(&path)?;
        run_blocking(move || Ok(git::read_status(&path))).await
    }

    async fn watch_bulk(&self, paths: &[PathBuf]) -> Result<HashMap<PathBuf, GitStatus>> {
        let mut watched = Vec::with_capacity(paths.len());
        {
            let mut watcher = self.inner.watcher.lock().await;
            for path in paths.iter().map(canonicalize) {
                match watcher.start_watching(&path) {
                    Ok(_) => watched.push(path),
                    Err(e) => debug!(path = %path.display(), error = %e, "not watching"),
                }
            }
        }
        read_statuses(watched).await
    }

    async fn unwatch(&self, path: &Path) -> Result<()> {
        self.inner.watcher.lock().await.stop_watching(path);
        Ok(())
    }

    async fn git_info(&self, paths: &[PathBuf]) -> Result<HashMap<PathBuf, GitStatus>> {
        read_statuses(paths.iter().map(canonicalize).collect()).await
    }

    async fn open_in_editor(&self, editor: &EditorChoice, path: &Path) -> Result<()> {
        let path = canonicalize(path);
        if !path.is_dir() {
            return Err(Error::invalid_path(path));
        }
        self.inner.launcher.launch(editor, &path)
    }

    async fn write_file(&self, dir: &Path, filename: &str, content: &str) -> Result<()> {
        let dir = canonicalize(dir);
        if !dir.is_dir() {
            return Err(Error::invalid_path(dir));
        }
        let file = dir.join(filename);
        if file.parent() != Some(dir.as_path()) {
            return Err(Error::invalid_path(file));
        }
        let content = content.to_string();
        run_blocking(move || {
            std::fs::write(&file, content)?;
            debug!(path = %file.display(), "wrote managed file");
            Ok(())
        })
        .await
    }

    async fn list_dirs(&self, path: &Path) -> Result<DirListing> {
        let path = canonicalize(path);
        run_blocking(move || fs_ops::list_dirs(&path)).await
    }

    async fn remove_empty_dir(&self, path: &Path) -> Result<()> {
        let path = canonicalize(path);
        run_blocking(move || fs_ops::remove_empty_dir(&path)).await
    }

    fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.inner.events.subscribe()
    }
}

fn move_one(src: &Path, dst: &Path, include: &[String], mode: MoveMode) -> Result<()> {
    if std::fs::symlink_metadata(src).is_err() {
        warn!(src = %src.display(), "source vanished, skipping");
        return Err(Error::message(SOURCE_MISSING));
    }
    if std::fs::symlink_metadata(dst).is_ok() {
        return Err(Error::TargetExists {
            path: dst.to_path_buf(),
        });
    }
    match mode {
        MoveMode::Move => fs_ops::move_tree(src, dst),
        MoveMode::Copy => {
            let skipped = fs_ops::copy_tree(src, dst, include).inspect_err(|_| discard(dst))?;
            if !skipped.is_empty() {
                discard(dst);
                return Err(Error::message(format!(
                    "Could not copy {} entries, source kept",
                    skipped.len()
                )));
            }
            if let Err(e) = fs_ops::remove_tree(src) {
                warn!(src = %src.display(), error = %e, "copied but failed to remove source");
            }
            Ok(())
        },
    }
}

/// Remove a partial copy, if any.
fn discard(dst: &Path) {
    if std::fs::symlink_metadata(dst).is_err() {
        return;
    }
    if let Err(e) = fs_ops::remove_tree(dst) {
        warn!(dst = %dst.display(), error = %e, "failed to clean partial copy");
    }
}

async fn read_statuses(paths: Vec<PathBuf>) -> Result<HashMap<PathBuf, GitStatus>> {
    run_blocking(move || {
        Ok(paths
            .into_iter()
            .map(|path| {
                let status = git::read_status(&path);
                (path, status)
            })
            .collect())
    })
    .await
}

async fn run_blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::external("blocking task failed", e))?
}
