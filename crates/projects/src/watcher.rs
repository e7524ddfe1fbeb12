//! Per-folder git status watches.
//!
//! Each watched folder gets two debounced watchers: one on the folder itself
//! (bounded depth, ignored directories skipped) and one on its git directory
//! filtered to `HEAD` and `index`. Any relevant event re-reads the status and
//! publishes a [`ServerEvent::GitInfoUpdate`]. There is no polling.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use {
    notify_debouncer_full::{
        DebounceEventResult, Debouncer, RecommendedCache, new_debouncer,
        notify::{EventKind as NotifyKind, RecommendedWatcher, RecursiveMode},
    },
    roost_config::WatcherConfig,
    tokio::sync::broadcast,
    tracing::{debug, info, warn},
    walkdir::WalkDir,
};

use crate::{
    error::{Error, Result},
    events::ServerEvent,
    git,
    path_key::canonicalize,
};

type FolderDebouncer = Debouncer<RecommendedWatcher, RecommendedCache>;

const GIT_STATE_FILES: &[&str] = &["HEAD", "index"];

struct WatchHandle {
    _content: FolderDebouncer,
    _git: Option<FolderDebouncer>,
}

/// Owns every active watch. Starting an active watch is a no-op and stopping
/// releases both watchers of a folder.
pub struct StatusWatcher {
    config: WatcherConfig,
    events: broadcast::Sender<ServerEvent>,
    active: HashMap<PathBuf, WatchHandle>,
}

impl StatusWatcher {
    pub fn new(config: WatcherConfig, events: broadcast::Sender<ServerEvent>) -> Self {
        Self {
            config,
            events,
            active: HashMap::new(),
        }
    }

    /// Begin observing `path`. Returns `false` when it was already watched.
    pub fn start_watching(&mut self, path: &Path) -> Result<bool> {
        let root = canonicalize(path);
        if self.active.contains_key(&root) {
            return Ok(false);
        }
        if !root.is_dir() {
            return Err(Error::invalid_path(root));
        }

        let content = self.content_watcher(&root)?;
        let git = match git::git_dir(&root) {
            Some(git_dir) => match self.git_watcher(&root, &git_dir) {
                Ok(debouncer) => Some(debouncer),
                Err(e) => {
                    warn!(path = %root.display(), error = %e, "failed to watch git state");
                    None
                },
            },
            None => None,
        };

        info!(path = %root.display(), git = git.is_some(), "watching folder");
        self.active.insert(root, WatchHandle {
            _content: content,
            _git: git,
        });
        Ok(true)
    }

    /// Release the watches on `path`. Returns whether it was watched.
    pub fn stop_watching(&mut self, path: &Path) -> bool {
        let root = canonicalize(path);
        let stopped = self.active.remove(&root).is_some();
        if stopped {
            debug!(path = %root.display(), "stopped watching folder");
        }
        stopped
    }

    pub fn stop_all(&mut self) {
        let count = self.active.len();
        self.active.clear();
        if count > 0 {
            debug!(count, "stopped all folder watches");
        }
    }

    pub fn is_watching(&self, path: &Path) -> bool {
        self.active.contains_key(&canonicalize(path))
    }

    pub fn watched(&self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = self.active.keys().cloned().collect();
        paths.sort();
        paths
    }

    fn content_watcher(&self, root: &Path) -> Result<FolderDebouncer> {
        let events = self.events.clone();
        let ignored = self.config.ignored_dirs.clone();
        let owner = root.to_path_buf();
        let mut debouncer = new_debouncer(
            self.config.debounce(),
            None,
            move |result: DebounceEventResult| match result {
                Ok(batch) => {
                    let relevant = batch.iter().any(|event| {
                        is_change(&event.kind)
                            && event
                                .paths
                                .iter()
                                .any(|p| !under_ignored(&owner, p, &ignored))
                    });
                    if relevant {
                        publish_status(&events, &owner);
                    }
                },
                Err(errors) => {
                    for e in errors {
                        warn!(path = %owner.display(), error = %e, "folder watcher error");
                    }
                },
            },
        )?;

        debouncer.watch(root, RecursiveMode::NonRecursive)?;
        let config = &self.config;
        let subdirs = WalkDir::new(root)
            .min_depth(1)
            .max_depth(config.max_depth)
            .into_iter()
            .filter_entry(|entry| {
                entry.file_type().is_dir()
                    && !config.is_ignored(&entry.file_name().to_string_lossy())
            })
            .filter_map(std::result::Result::ok);
        for entry in subdirs {
            if let Err(e) = debouncer.watch(entry.path(), RecursiveMode::NonRecursive) {
                debug!(path = %entry.path().display(), error = %e, "skipping subdirectory watch");
            }
        }
        Ok(debouncer)
    }

    fn git_watcher(&self, root: &Path, git_dir: &Path) -> Result<FolderDebouncer> {
        let events = self.events.clone();
        let owner = root.to_path_buf();
        let mut debouncer = new_debouncer(
            self.config.debounce(),
            None,
            move |result: DebounceEventResult| match result {
                Ok(batch) => {
                    let touched = batch.iter().any(|event| {
                        event.paths.iter().any(|p| {
                            p.file_name()
                                .and_then(|n| n.to_str())
                                .is_some_and(|n| GIT_STATE_FILES.contains(&n))
                        })
                    });
                    if touched {
                        publish_status(&events, &owner);
                    }
                },
                Err(errors) => {
                    for e in errors {
                        warn!(path = %owner.display(), error = %e, "git state watcher error");
                    }
                },
            },
        )?;
        debouncer.watch(git_dir, RecursiveMode::NonRecursive)?;
        Ok(debouncer)
    }
}

impl Drop for StatusWatcher {
    fn drop(&mut self) {
        self.stop_all();
    }
}

fn is_change(kind: &NotifyKind) -> bool {
    matches!(
        kind,
        NotifyKind::Create(_) | NotifyKind::Modify(_) | NotifyKind::Remove(_) | NotifyKind::Any
    )
}

/// Whether `path` lies in an ignored directory below `root`.
fn under_ignored(root: &Path, path: &Path, ignored: &[String]) -> bool {
    path.strip_prefix(root).is_ok_and(|relative| {
        relative
            .components()
            .any(|c| ignored.iter().any(|i| c.as_os_str() == i.as_str()))
    })
}

fn publish_status(events: &broadcast::Sender<ServerEvent>, path: &Path) {
    let status = git::read_status(path);
    debug!(path = %path.display(), branch = %status.branch, "git status changed");
    // No receivers just means nobody is listening right now.
    let _ = events.send(ServerEvent::GitInfoUpdate {
        path: path.to_path_buf(),
        status,
    });
}
