//! The bulk operation coordinator: the single owner of the registry tree.
//!
//! Every mutating operation runs the same transaction:
//!
//! 1. plan: validate against the current tree, no side effects
//! 2. predict: apply the expected outcome to the tree right away, with status
//!    prefixes and temporary ids on the affected entries
//! 3. execute: ask the backend to do the disk work and wait for its
//!    completion event (bounded by the completion timeout)
//! 4. reconcile: replace predictions with what the backend reports, or roll
//!    the prediction back when the whole request failed
//! 5. settle: restart watches at new paths, finish the notice, persist
//!
//! The coordinator is single-threaded. Tree state lives in `RefCell`s and no
//! borrow is held across an `.await`, so several operations (and the event
//! loop feeding completions) can interleave on one task.

use std::{
    cell::{Cell, RefCell},
    collections::{HashMap, HashSet},
    future::Future,
    path::{Path, PathBuf},
    sync::Arc,
};

use {
    roost_common::now_ms,
    roost_config::{MoveMode, OperationsConfig, Preferences},
    tokio::sync::broadcast::{self, error::RecvError},
    tracing::{debug, error, info, warn},
};

use crate::{
    backend::FolderBackend,
    completion::CompletionTable,
    error::{Error, Result},
    events::{EventKind, MoveResult, OperationId, ServerEvent},
    fs_ops::next_duplicate_path,
    notices::{Notice, NoticeLevel, Notices},
    path_key::{canonicalize, common_prefix, display_name_of, identity_of, is_within, parent_of},
    status::{StatusPrefix, tag},
    store::{RegistryFile, RegistryStore},
    sync::{ManagedFile, SyncResult},
    tree::{Origin, SortOrder, TreeStore, shared_parent},
    types::{
        GitStatus, GroupKind, GroupNode, LeafNode, RegistryNode, TEMP_ID_PREFIX, group_id_of,
    },
};

/// A mutating request on registered folders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Duplicate {
        path: PathBuf,
        include_files: Vec<String>,
    },
    MoveBulk {
        paths: Vec<PathBuf>,
        target_parent: PathBuf,
        include_files: Vec<String>,
        mode: MoveMode,
    },
    Group {
        paths: Vec<PathBuf>,
        name: String,
    },
    Ungroup {
        group_id: String,
    },
}

/// What a settled operation did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationReport {
    pub op_id: OperationId,
    /// One record per moved or copied folder.
    pub results: Vec<MoveResult>,
    /// Id of the leaf or group the operation created, if any.
    pub created: Option<String>,
}

impl OperationReport {
    fn new(op_id: OperationId) -> Self {
        Self {
            op_id,
            results: Vec::new(),
            created: None,
        }
    }

    pub fn all_succeeded(&self) -> bool {
        self.results.iter().all(|r| r.success)
    }
}

/// Trim and collapse internal whitespace to `_`. `None` when nothing usable
/// remains.
pub fn sanitize_group_name(name: &str) -> Option<String> {
    let sanitized = name.split_whitespace().collect::<Vec<_>>().join("_");
    let usable = !sanitized.is_empty()
        && sanitized != "."
        && sanitized != ".."
        && !sanitized.contains(std::path::is_separator);
    usable.then_some(sanitized)
}

// ── Transaction pieces ──────────────────────────────────────────────

enum Plan {
    Duplicate {
        source: LeafNode,
        include: Vec<String>,
    },
    Move {
        sources: Vec<LeafNode>,
        target_parent: PathBuf,
        include: Vec<String>,
        mode: MoveMode,
    },
    LogicalGroup {
        sources: Vec<LeafNode>,
        path: PathBuf,
    },
    PhysicalGroup {
        sources: Vec<LeafNode>,
        path: PathBuf,
        include: Vec<String>,
        mode: MoveMode,
    },
    Ungroup {
        group: GroupNode,
        /// `None` for logical groups, whose children stay where they are.
        target_parent: Option<PathBuf>,
        include: Vec<String>,
        mode: MoveMode,
    },
}

impl Plan {
    /// Registry entries the operation works on, leaves and groups.
    fn claimed_ids(&self) -> Vec<String> {
        match self {
            Self::Duplicate { source, .. } => vec![source.id.clone()],
            Self::Move { sources, .. }
            | Self::LogicalGroup { sources, .. }
            | Self::PhysicalGroup { sources, .. } => {
                sources.iter().map(|s| s.id.clone()).collect()
            },
            Self::Ungroup { group, .. } => std::iter::once(group.id.clone())
                .chain(group.children.iter().map(|c| c.id.clone()))
                .collect(),
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Self::Duplicate { .. } => "duplicate",
            Self::Move { .. } => "move",
            Self::LogicalGroup { .. } | Self::PhysicalGroup { .. } => "group",
            Self::Ungroup { .. } => "ungroup",
        }
    }

    fn progress(&self) -> String {
        match self {
            Self::Duplicate { source, .. } => format!("Duplicating {}...", source.plain_name()),
            Self::Move { sources, .. } => format!("Moving {}...", folders(sources.len())),
            Self::LogicalGroup { sources, path } | Self::PhysicalGroup { sources, path, .. } => {
                format!(
                    "Grouping {} into {}...",
                    folders(sources.len()),
                    display_name_of(path)
                )
            },
            Self::Ungroup { group, .. } => format!("Ungrouping {}...", group.plain_name()),
        }
    }

    fn summary(&self, report: &OperationReport) -> (NoticeLevel, String) {
        let total = report.results.len();
        let failed = report.results.iter().filter(|r| !r.success).count();
        let done = match self {
            Self::Duplicate { source, .. } => format!("Duplicated {}", source.plain_name()),
            Self::Move { .. } => format!("Moved {}", folders(total)),
            Self::LogicalGroup { path, .. } | Self::PhysicalGroup { path, .. } => {
                format!("Grouped into {}", display_name_of(path))
            },
            Self::Ungroup { group, .. } => format!("Ungrouped {}", group.plain_name()),
        };
        if failed == 0 {
            return (NoticeLevel::Success, done);
        }
        let first_error = report
            .results
            .iter()
            .find_map(|r| r.error.as_deref())
            .unwrap_or("unknown error");
        (
            NoticeLevel::Error,
            format!(
                "{} failed for {failed} of {total}: {first_error}",
                capitalize(self.label())
            ),
        )
    }
}

/// Undo log of a prediction.
enum Prediction {
    /// A preview leaf was inserted.
    Added { temp_id: String, source: PathBuf },
    /// Leaves were retagged in place.
    Retagged { moving: Vec<Moving> },
    /// Leaves were taken out of the tree into a temporary group.
    Regrouped {
        group_temp_id: String,
        taken: Vec<(LeafNode, Origin)>,
    },
    /// Leaves were wrapped into a real group.
    Grouped {
        group_id: String,
        taken: Vec<(LeafNode, Origin)>,
    },
    /// A group's children were retagged in place.
    Ungrouping { snapshot: GroupNode },
}

struct Moving {
    temp_id: String,
    original: LeafNode,
}

enum Completion {
    Duplicated(PathBuf),
    Moved(Vec<MoveResult>),
    /// Nothing to wait for: the change was registry-only.
    Immediate,
}

fn temp_id(op_id: OperationId, slot: usize) -> String {
    format!("{TEMP_ID_PREFIX}{op_id}:{slot}")
}

fn group_temp_id(op_id: OperationId) -> String {
    format!("{TEMP_ID_PREFIX}{op_id}:group")
}

fn folders(n: usize) -> String {
    if n == 1 {
        "1 folder".into()
    } else {
        format!("{n} folders")
    }
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn origin_index(origin: &Origin) -> usize {
    match origin {
        Origin::TopLevel { index } => *index,
        Origin::Group { group_index, .. } => *group_index,
    }
}

/// The new path of `source` if the backend moved it.
fn moved_to(results: &[MoveResult], source: &Path) -> Option<PathBuf> {
    results
        .iter()
        .find(|r| r.path == source)
        .filter(|r| r.success)
        .and_then(|r| r.new_path.clone())
}

/// Point the temporary leaf at its final path. Drops it instead when another
/// leaf already owns that path.
fn land(tree: &mut TreeStore, temp_id: &str, new_path: &Path, status: Option<GitStatus>) {
    if tree
        .find_by_path(new_path)
        .is_some_and(|other| other.id != temp_id)
    {
        debug!(path = %new_path.display(), "already registered, dropping moved entry");
        tree.take_leaf(temp_id);
        return;
    }
    tree.update_leaf(temp_id, |leaf| {
        leaf.relocate(new_path);
        if let Some(status) = status {
            leaf.status = status;
        }
    });
}

/// Put the pre-operation leaf back in place of its temporary stand-in.
fn restore_in_place(tree: &mut TreeStore, temp_id: &str, original: LeafNode) {
    if tree
        .find_by_path(&original.path)
        .is_some_and(|other| other.id != temp_id)
    {
        debug!(path = %original.path.display(), "path registered meanwhile, dropping entry");
        tree.take_leaf(temp_id);
        return;
    }
    tree.update_leaf(temp_id, |leaf| *leaf = original);
}

/// Marks a registry entry as taken by a running operation until dropped.
struct InFlight<'a> {
    ids: &'a RefCell<HashSet<String>>,
    id: String,
}

impl<'a> InFlight<'a> {
    fn mark(ids: &'a RefCell<HashSet<String>>, id: impl Into<String>) -> Self {
        let id = id.into();
        ids.borrow_mut().insert(id.clone());
        Self { ids, id }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.ids.borrow_mut().remove(&self.id);
    }
}

// ── Coordinator ─────────────────────────────────────────────────────

pub struct Coordinator {
    backend: Arc<dyn FolderBackend>,
    store: Arc<dyn RegistryStore>,
    config: OperationsConfig,
    tree: RefCell<TreeStore>,
    preferences: RefCell<Preferences>,
    managed_files: RefCell<Vec<ManagedFile>>,
    completions: CompletionTable,
    notices: RefCell<Notices>,
    in_flight: RefCell<HashSet<String>>,
    picking: Cell<bool>,
}

impl Coordinator {
    /// Build from an already loaded registry. The tree is healed on the way
    /// in.
    pub fn new(
        backend: Arc<dyn FolderBackend>,
        store: Arc<dyn RegistryStore>,
        config: OperationsConfig,
        file: RegistryFile,
    ) -> Self {
        let notices = Notices::new(config.success_notice(), config.failure_notice());
        Self {
            backend,
            store,
            config,
            tree: RefCell::new(TreeStore::from_persisted(file.nodes)),
            preferences: RefCell::new(file.preferences),
            managed_files: RefCell::new(file.managed_files),
            completions: CompletionTable::new(),
            notices: RefCell::new(notices),
            in_flight: RefCell::new(HashSet::new()),
            picking: Cell::new(false),
        }
    }

    pub async fn load(
        backend: Arc<dyn FolderBackend>,
        store: Arc<dyn RegistryStore>,
        config: OperationsConfig,
    ) -> Result<Self> {
        let file = store.load().await?;
        Ok(Self::new(backend, store, config, file))
    }

    // ── Read access ─────────────────────────────────────────────────

    /// A copy of the current tree.
    pub fn snapshot(&self) -> TreeStore {
        self.tree.borrow().clone()
    }

    /// Top-level nodes in the order the preferences ask for.
    pub fn ordered_nodes(&self) -> Vec<RegistryNode> {
        let order = if self.preferences.borrow().sort_by_name {
            SortOrder::Name
        } else {
            SortOrder::Registry
        };
        self.tree
            .borrow()
            .ordered(order)
            .into_iter()
            .cloned()
            .collect()
    }

    pub fn preferences(&self) -> Preferences {
        self.preferences.borrow().clone()
    }

    pub fn managed_files(&self) -> Vec<ManagedFile> {
        self.managed_files.borrow().clone()
    }

    /// Notices still on screen.
    pub fn notices(&self) -> Vec<Notice> {
        self.notices.borrow_mut().visible().to_vec()
    }

    pub fn events(&self) -> broadcast::Receiver<ServerEvent> {
        self.backend.subscribe()
    }

    // ── Event intake ────────────────────────────────────────────────

    /// Apply one backend event: status updates land on matching leaves,
    /// completions go to whoever waits for them.
    pub fn handle_event(&self, event: ServerEvent) {
        match event {
            ServerEvent::GitInfoUpdate { path, status } => {
                let path = canonicalize(path);
                let mut updated = 0;
                self.tree.borrow_mut().update_leaves(|leaf| {
                    if leaf.path == path {
                        leaf.status = status.clone();
                        updated += 1;
                    }
                });
                if updated == 0 {
                    debug!(path = %path.display(), "status for unregistered path");
                }
            },
            completion => {
                self.completions.dispatch(&completion);
            },
        }
    }

    /// Feed events into [`handle_event`](Self::handle_event) until the
    /// channel closes.
    pub async fn run_event_loop(&self, mut events: broadcast::Receiver<ServerEvent>) {
        loop {
            match events.recv().await {
                Ok(event) => self.handle_event(event),
                Err(RecvError::Lagged(missed)) => {
                    warn!(missed, "event loop lagged, some status updates were lost");
                },
                Err(RecvError::Closed) => break,
            }
        }
    }

    /// Run `work` while feeding events, returning its output.
    pub async fn drive<T>(
        &self,
        events: &mut broadcast::Receiver<ServerEvent>,
        work: impl Future<Output = T>,
    ) -> T {
        tokio::pin!(work);
        loop {
            tokio::select! {
                output = &mut work => return output,
                received = events.recv() => match received {
                    Ok(event) => self.handle_event(event),
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "event loop lagged, some status updates were lost");
                    },
                    Err(RecvError::Closed) => return work.await,
                },
            }
        }
    }

    // ── Operations ──────────────────────────────────────────────────

    pub async fn duplicate(&self, path: impl AsRef<Path>) -> Result<OperationReport> {
        let include_files = self.preferences.borrow().copy_include_files.clone();
        self.run(Operation::Duplicate {
            path: path.as_ref().to_path_buf(),
            include_files,
        })
        .await
    }

    /// Move with the preferred mode and include list.
    pub async fn move_bulk(
        &self,
        paths: Vec<PathBuf>,
        target_parent: impl AsRef<Path>,
    ) -> Result<OperationReport> {
        let (include_files, mode) = {
            let prefs = self.preferences.borrow();
            (prefs.copy_include_files.clone(), prefs.operation_mode)
        };
        self.run(Operation::MoveBulk {
            paths,
            target_parent: target_parent.as_ref().to_path_buf(),
            include_files,
            mode,
        })
        .await
    }

    pub async fn group(&self, paths: Vec<PathBuf>, name: &str) -> Result<OperationReport> {
        self.run(Operation::Group {
            paths,
            name: name.to_string(),
        })
        .await
    }

    pub async fn ungroup(&self, group_id: &str) -> Result<OperationReport> {
        self.run(Operation::Ungroup {
            group_id: group_id.to_string(),
        })
        .await
    }

    /// Run one operation through plan, predict, execute, reconcile, settle.
    pub async fn run(&self, operation: Operation) -> Result<OperationReport> {
        let plan = self.plan(operation)?;
        let _claimed: Vec<InFlight<'_>> = plan
            .claimed_ids()
            .into_iter()
            .map(|id| InFlight::mark(&self.in_flight, id))
            .collect();
        let op_id = OperationId::new();
        let notice = self.notices.borrow_mut().start(plan.progress());
        info!(%op_id, operation = plan.label(), "operation started");

        let prediction = self.predict(op_id, &plan);
        let outcome = match self.execute(op_id, &plan).await {
            Ok(completion) => Ok(self.reconcile(op_id, prediction, completion).await),
            Err(e) => {
                warn!(%op_id, operation = plan.label(), error = %e, "operation failed, rolling back");
                self.rollback(prediction);
                Err(e)
            },
        };

        match &outcome {
            Ok(report) => {
                let (level, message) = plan.summary(report);
                info!(%op_id, operation = plan.label(), ?level, "operation settled");
                self.notices.borrow_mut().settle(notice, level, message);
            },
            Err(e) => {
                self.notices.borrow_mut().settle(
                    notice,
                    NoticeLevel::Error,
                    format!("{} failed: {e}", capitalize(plan.label())),
                );
            },
        }
        self.persist().await;
        outcome
    }

    fn plan(&self, operation: Operation) -> Result<Plan> {
        let tree = self.tree.borrow();
        let prefs = self.preferences.borrow();
        let in_flight = self.in_flight.borrow();
        match operation {
            Operation::Duplicate {
                path,
                include_files,
            } => Ok(Plan::Duplicate {
                source: registered(&tree, &in_flight, &path)?,
                include: include_files,
            }),
            Operation::MoveBulk {
                paths,
                target_parent,
                include_files,
                mode,
            } => {
                let target_parent = canonicalize(&target_parent);
                if target_parent.as_os_str().is_empty() {
                    return Err(Error::invalid_path(target_parent));
                }
                let sources = registered_all(&tree, &in_flight, &paths)?;
                if let Some(source) = sources.iter().find(|s| is_within(&target_parent, &s.path)) {
                    return Err(Error::invalid_path(source.path.clone()));
                }
                Ok(Plan::Move {
                    sources,
                    target_parent,
                    include: include_files,
                    mode,
                })
            },
            Operation::Group { paths, name } => {
                let name = sanitize_group_name(&name).ok_or(Error::EmptyGroupName)?;
                let sources = registered_all(&tree, &in_flight, &paths)?;
                let (path, kind) = match shared_parent(&sources) {
                    Some(parent) => (parent.join(&name), GroupKind::Logical),
                    None => {
                        let selected: Vec<PathBuf> = sources.iter().map(|s| s.path.clone()).collect();
                        let mut base = common_prefix(&selected)
                            .ok_or_else(|| Error::message("selected folders share no common directory"))?;
                        if selected.contains(&base) {
                            base = parent_of(&base).ok_or_else(|| Error::invalid_path(base.clone()))?;
                        }
                        (base.join(&name), GroupKind::Physical)
                    },
                };
                if tree.group(&group_id_of(&path)).is_some() || tree.contains_path(&path) {
                    return Err(Error::TargetExists { path });
                }
                Ok(match kind {
                    GroupKind::Logical => Plan::LogicalGroup { sources, path },
                    GroupKind::Physical => Plan::PhysicalGroup {
                        sources,
                        path,
                        include: prefs.copy_include_files.clone(),
                        mode: prefs.operation_mode,
                    },
                })
            },
            Operation::Ungroup { group_id } => {
                let group = tree
                    .group(&group_id)
                    .filter(|g| !g.is_temporary())
                    .cloned()
                    .ok_or(Error::GroupNotFound { id: group_id })?;
                if in_flight.contains(&group.id) {
                    return Err(Error::message(format!("{} is busy", group.plain_name())));
                }
                if let Some(busy) = group.children.iter().find(|c| is_busy(c, &in_flight)) {
                    return Err(Error::message(format!("{} is busy", busy.plain_name())));
                }
                let target_parent = match group.kind {
                    GroupKind::Logical => None,
                    GroupKind::Physical => Some(
                        parent_of(&group.path).ok_or_else(|| Error::invalid_path(group.path.clone()))?,
                    ),
                };
                Ok(Plan::Ungroup {
                    group,
                    target_parent,
                    include: prefs.copy_include_files.clone(),
                    mode: prefs.operation_mode,
                })
            },
        }
    }

    fn predict(&self, op_id: OperationId, plan: &Plan) -> Prediction {
        let mut tree = self.tree.borrow_mut();
        match plan {
            Plan::Duplicate { source, .. } => {
                let predicted = next_duplicate_path(&source.path, |p| tree.contains_path(p));
                let mut preview = LeafNode::new(&predicted, now_ms());
                preview.id = temp_id(op_id, 0);
                preview.name = tag(StatusPrefix::Copying, &preview.name);
                preview.status = GitStatus::loading();
                let index = tree
                    .top_level_index(&source.id)
                    .map_or(tree.len(), |i| i + 1);
                let temp_id = preview.id.clone();
                tree.insert_node(index, RegistryNode::Leaf(preview));
                Prediction::Added {
                    temp_id,
                    source: source.path.clone(),
                }
            },
            Plan::Move {
                sources,
                target_parent,
                ..
            } => {
                let mut moving = Vec::with_capacity(sources.len());
                for (slot, source) in sources.iter().enumerate() {
                    let temp = temp_id(op_id, slot);
                    let predicted = target_parent.join(display_name_of(&source.path));
                    let free = !tree.contains_path(&predicted);
                    tree.update_leaf(&source.id, |leaf| {
                        if free {
                            leaf.path = predicted;
                        }
                        leaf.id = temp.clone();
                        leaf.name = tag(StatusPrefix::Moving, leaf.plain_name());
                    });
                    moving.push(Moving {
                        temp_id: temp,
                        original: source.clone(),
                    });
                }
                Prediction::Retagged { moving }
            },
            Plan::LogicalGroup { sources, path } => {
                let (taken, index) = take_all(&mut tree, sources);
                let children = taken.iter().map(|(leaf, _)| leaf.clone()).collect();
                let group = GroupNode::new(GroupKind::Logical, path, children, now_ms());
                let group_id = group.id.clone();
                tree.insert_node(index, RegistryNode::Group(group));
                Prediction::Grouped { group_id, taken }
            },
            Plan::PhysicalGroup { sources, path, .. } => {
                let (taken, index) = take_all(&mut tree, sources);
                let mut claimed: HashSet<PathBuf> =
                    taken.iter().map(|(leaf, _)| leaf.path.clone()).collect();
                let children = taken
                    .iter()
                    .enumerate()
                    .map(|(slot, (leaf, _))| {
                        let mut child = leaf.clone();
                        let predicted = path.join(display_name_of(&leaf.path));
                        if !tree.contains_path(&predicted) && claimed.insert(predicted.clone()) {
                            child.path = predicted;
                        }
                        child.id = temp_id(op_id, slot);
                        child.name = tag(StatusPrefix::Moving, leaf.plain_name());
                        child
                    })
                    .collect();
                let mut group = GroupNode::new(GroupKind::Physical, path, children, now_ms());
                group.id = group_temp_id(op_id);
                group.name = tag(StatusPrefix::Grouping, &group.name);
                let group_temp_id = group.id.clone();
                tree.insert_node(index, RegistryNode::Group(group));
                Prediction::Regrouped {
                    group_temp_id,
                    taken,
                }
            },
            Plan::Ungroup {
                group,
                target_parent,
                ..
            } => {
                if let Some(parent) = target_parent {
                    let mut claimed = HashSet::new();
                    let predicted: Vec<Option<PathBuf>> = group
                        .children
                        .iter()
                        .map(|child| {
                            let p = parent.join(display_name_of(&child.path));
                            (!tree.contains_path(&p) && claimed.insert(p.clone())).then_some(p)
                        })
                        .collect();
                    tree.update_group(&group.id, |g| {
                        g.name = tag(StatusPrefix::Ungrouping, g.plain_name());
                        for (slot, (child, path)) in g.children.iter_mut().zip(predicted).enumerate() {
                            if let Some(path) = path {
                                child.path = path;
                            }
                            child.id = temp_id(op_id, slot);
                            child.name = tag(StatusPrefix::Ungrouping, child.plain_name());
                        }
                    });
                }
                Prediction::Ungrouping {
                    snapshot: group.clone(),
                }
            },
        }
    }

    async fn execute(&self, op_id: OperationId, plan: &Plan) -> Result<Completion> {
        match plan {
            Plan::Duplicate { source, include } => {
                let pending = self
                    .completions
                    .register_op(EventKind::DuplicationComplete, op_id);
                self.backend.duplicate(op_id, &source.path, include).await?;
                match pending.wait(self.config.completion_timeout()).await? {
                    ServerEvent::DuplicationComplete {
                        success: true,
                        new_path: Some(new_path),
                        ..
                    } => Ok(Completion::Duplicated(canonicalize(new_path))),
                    ServerEvent::DuplicationComplete { error, .. } => Err(Error::message(
                        error.unwrap_or_else(|| "duplicate failed".into()),
                    )),
                    other => Err(Error::message(format!("unexpected {} event", other.kind()))),
                }
            },
            Plan::Move {
                sources,
                target_parent,
                include,
                mode,
            }
            | Plan::PhysicalGroup {
                sources,
                path: target_parent,
                include,
                mode,
            } => {
                let paths: Vec<PathBuf> = sources.iter().map(|s| s.path.clone()).collect();
                self.move_and_wait(op_id, &paths, target_parent, include, *mode)
                    .await
                    .map(Completion::Moved)
            },
            Plan::Ungroup {
                group,
                target_parent: Some(parent),
                include,
                mode,
            } => {
                let paths: Vec<PathBuf> = group.children.iter().map(|c| c.path.clone()).collect();
                self.move_and_wait(op_id, &paths, parent, include, *mode)
                    .await
                    .map(Completion::Moved)
            },
            Plan::LogicalGroup { .. }
            | Plan::Ungroup {
                target_parent: None,
                ..
            } => Ok(Completion::Immediate),
        }
    }

    /// Issue a bulk move and wait for its results, one per source in source
    /// order.
    async fn move_and_wait(
        &self,
        op_id: OperationId,
        sources: &[PathBuf],
        target_parent: &Path,
        include: &[String],
        mode: MoveMode,
    ) -> Result<Vec<MoveResult>> {
        let pending = self
            .completions
            .register_op(EventKind::MoveBulkComplete, op_id);
        self.backend
            .move_bulk(op_id, sources, target_parent, include, mode)
            .await?;
        let ServerEvent::MoveBulkComplete { results, .. } =
            pending.wait(self.config.completion_timeout()).await?
        else {
            return Err(Error::message("unexpected completion for move"));
        };
        let results: Vec<MoveResult> = results
            .into_iter()
            .map(|r| MoveResult {
                path: canonicalize(&r.path),
                new_path: r.new_path.map(canonicalize),
                ..r
            })
            .collect();
        Ok(sources
            .iter()
            .map(|source| {
                results
                    .iter()
                    .find(|r| &r.path == source)
                    .cloned()
                    .unwrap_or_else(|| MoveResult::failed(source, "no result reported"))
            })
            .collect())
    }

    async fn reconcile(
        &self,
        op_id: OperationId,
        prediction: Prediction,
        completion: Completion,
    ) -> OperationReport {
        match (prediction, completion) {
            (Prediction::Added { temp_id, source }, Completion::Duplicated(new_path)) => {
                self.settle_duplicate(op_id, &temp_id, source, new_path).await
            },
            (Prediction::Retagged { moving }, Completion::Moved(results)) => {
                self.settle_moves(op_id, moving, results).await
            },
            (
                Prediction::Regrouped {
                    group_temp_id,
                    taken,
                },
                Completion::Moved(results),
            ) => self.settle_group(op_id, &group_temp_id, taken, results).await,
            (Prediction::Grouped { group_id, .. }, Completion::Immediate) => OperationReport {
                created: Some(group_id),
                ..OperationReport::new(op_id)
            },
            (Prediction::Ungrouping { snapshot }, completion) => {
                self.settle_ungroup(op_id, snapshot, completion).await
            },
            (prediction, _) => {
                error!(%op_id, "completion does not fit the prediction, rolling back");
                self.rollback(prediction);
                OperationReport::new(op_id)
            },
        }
    }

    async fn settle_duplicate(
        &self,
        op_id: OperationId,
        temp_id: &str,
        source: PathBuf,
        new_path: PathBuf,
    ) -> OperationReport {
        let status = self.watch_status(&new_path).await;
        let mut tree = self.tree.borrow_mut();
        let created = if tree
            .find_by_path(&new_path)
            .is_some_and(|other| other.id != temp_id)
        {
            tree.take_leaf(temp_id);
            None
        } else {
            let added_at = now_ms();
            tree.update_leaf(temp_id, |leaf| {
                leaf.relocate(&new_path);
                leaf.status = status;
                leaf.added_at = added_at;
                leaf.last_used_at = 0;
            });
            Some(identity_of(&new_path))
        };
        OperationReport {
            op_id,
            results: vec![MoveResult::moved(source, new_path)],
            created,
        }
    }

    async fn settle_moves(
        &self,
        op_id: OperationId,
        moving: Vec<Moving>,
        results: Vec<MoveResult>,
    ) -> OperationReport {
        let mut statuses = HashMap::new();
        for m in &moving {
            if let Some(new_path) = moved_to(&results, &m.original.path) {
                let status = self.rewatch(&m.original.path, &new_path).await;
                statuses.insert(new_path, status);
            }
        }
        {
            let mut tree = self.tree.borrow_mut();
            for m in moving {
                match moved_to(&results, &m.original.path) {
                    Some(new_path) => {
                        let status = statuses.remove(&new_path);
                        land(&mut tree, &m.temp_id, &new_path, status);
                    },
                    None => restore_in_place(&mut tree, &m.temp_id, m.original),
                }
            }
        }
        OperationReport {
            results,
            ..OperationReport::new(op_id)
        }
    }

    async fn settle_group(
        &self,
        op_id: OperationId,
        group_temp_id: &str,
        taken: Vec<(LeafNode, Origin)>,
        results: Vec<MoveResult>,
    ) -> OperationReport {
        let mut statuses = HashMap::new();
        for (original, _) in &taken {
            if let Some(new_path) = moved_to(&results, &original.path) {
                let status = self.rewatch(&original.path, &new_path).await;
                statuses.insert(new_path, status);
            }
        }

        let mut tree = self.tree.borrow_mut();
        let Some((index, RegistryNode::Group(mut group))) = tree.remove_node(group_temp_id) else {
            error!(%op_id, "temporary group vanished before settling");
            for (original, origin) in taken.into_iter().rev() {
                if moved_to(&results, &original.path).is_none() {
                    tree.restore_leaf(original, origin);
                }
            }
            return OperationReport {
                results,
                ..OperationReport::new(op_id)
            };
        };

        let mut failed = Vec::new();
        for (slot, (original, origin)) in taken.into_iter().enumerate() {
            let temp = temp_id(op_id, slot);
            match moved_to(&results, &original.path) {
                Some(new_path) => {
                    if let Some(child) = group.children.iter_mut().find(|c| c.id == temp) {
                        child.relocate(&new_path);
                        if let Some(status) = statuses.remove(&new_path) {
                            child.status = status;
                        }
                    }
                },
                None => {
                    group.children.retain(|c| c.id != temp);
                    failed.push((original, origin));
                },
            }
        }
        group.children.retain(|c| !tree.contains_path(&c.path));
        for (original, origin) in failed.into_iter().rev() {
            tree.restore_leaf(original, origin);
        }

        let created = if group.children.is_empty() {
            debug!(%op_id, "no folder reached the group, dropping it");
            None
        } else {
            group.id = group_id_of(&group.path);
            group.name = display_name_of(&group.path);
            let id = group.id.clone();
            tree.insert_node(index, RegistryNode::Group(group));
            Some(id)
        };
        OperationReport {
            op_id,
            results,
            created,
        }
    }

    async fn settle_ungroup(
        &self,
        op_id: OperationId,
        snapshot: GroupNode,
        completion: Completion,
    ) -> OperationReport {
        let (results, logical) = match completion {
            Completion::Moved(results) => (results, false),
            Completion::Immediate | Completion::Duplicated(_) => (Vec::new(), true),
        };
        let mut statuses = HashMap::new();
        for child in &snapshot.children {
            if let Some(new_path) = moved_to(&results, &child.path) {
                let status = self.rewatch(&child.path, &new_path).await;
                statuses.insert(new_path, status);
            }
        }

        let emptied = {
            let mut tree = self.tree.borrow_mut();
            let Some((index, RegistryNode::Group(current))) = tree.remove_node(&snapshot.id) else {
                error!(%op_id, group = %snapshot.id, "group vanished before settling");
                return OperationReport {
                    results,
                    ..OperationReport::new(op_id)
                };
            };

            let mut spliced = Vec::new();
            let mut remaining = Vec::new();
            for (slot, original) in snapshot.children.iter().enumerate() {
                let temp = temp_id(op_id, slot);
                let current_child = current
                    .children
                    .iter()
                    .find(|c| c.id == temp || c.id == original.id)
                    .cloned();
                if logical {
                    spliced.push(current_child.unwrap_or_else(|| original.clone()));
                    continue;
                }
                match moved_to(&results, &original.path) {
                    Some(new_path) => {
                        let mut leaf = current_child.unwrap_or_else(|| original.clone());
                        leaf.relocate(&new_path);
                        if let Some(status) = statuses.remove(&new_path) {
                            leaf.status = status;
                        }
                        spliced.push(leaf);
                    },
                    None => remaining.push(original.clone()),
                }
            }
            spliced.retain(|leaf| !tree.contains_path(&leaf.path));

            let emptied = remaining.is_empty();
            let mut at = index;
            if !emptied {
                tree.insert_node(
                    at,
                    RegistryNode::Group(GroupNode {
                        children: remaining,
                        ..snapshot.clone()
                    }),
                );
                at += 1;
            }
            for leaf in spliced {
                tree.insert_node(at, RegistryNode::Leaf(leaf));
                at += 1;
            }
            emptied
        };

        if emptied && !logical {
            if let Err(e) = self.backend.remove_empty_dir(&snapshot.path).await {
                warn!(path = %snapshot.path.display(), error = %e, "could not remove group directory");
            }
        }
        OperationReport {
            results,
            ..OperationReport::new(op_id)
        }
    }

    fn rollback(&self, prediction: Prediction) {
        let mut tree = self.tree.borrow_mut();
        match prediction {
            Prediction::Added { temp_id, .. } => {
                tree.take_leaf(&temp_id);
            },
            Prediction::Retagged { moving } => {
                for m in moving {
                    restore_in_place(&mut tree, &m.temp_id, m.original);
                }
            },
            Prediction::Regrouped {
                group_temp_id,
                taken,
            }
            | Prediction::Grouped {
                group_id: group_temp_id,
                taken,
            } => {
                tree.remove_node(&group_temp_id);
                for (leaf, origin) in taken.into_iter().rev() {
                    tree.restore_leaf(leaf, origin);
                }
            },
            Prediction::Ungrouping { snapshot } => {
                let id = snapshot.id.clone();
                if !tree.replace_node(&id, RegistryNode::Group(snapshot)) {
                    warn!(group = %id, "group vanished, nothing to roll back");
                }
            },
        }
    }

    /// Move the watch from `old` to `new` and return the status at `new`.
    async fn rewatch(&self, old: &Path, new: &Path) -> GitStatus {
        if let Err(e) = self.backend.unwatch(old).await {
            debug!(path = %old.display(), error = %e, "unwatch failed");
        }
        self.watch_status(new).await
    }

    async fn watch_status(&self, path: &Path) -> GitStatus {
        match self.backend.watch(path).await {
            Ok(status) => status,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to watch folder");
                GitStatus::unknown()
            },
        }
    }

    // ── Non-optimistic operations ───────────────────────────────────

    /// Delete a registered folder from disk, then from the registry. The
    /// entry stays unless the backend confirms the deletion.
    pub async fn delete(&self, path: impl AsRef<Path>) -> Result<()> {
        let leaf = registered(&self.tree.borrow(), &self.in_flight.borrow(), path.as_ref())?;
        let _claimed = InFlight::mark(&self.in_flight, &leaf.id);
        let notice = self
            .notices
            .borrow_mut()
            .start(format!("Deleting {}...", leaf.plain_name()));
        let outcome = self.delete_and_wait(&leaf.path).await;
        match &outcome {
            Ok(()) => {
                self.tree
                    .borrow_mut()
                    .remove_by_paths(std::slice::from_ref(&leaf.path));
                info!(path = %leaf.path.display(), "deleted");
                self.notices.borrow_mut().settle(
                    notice,
                    NoticeLevel::Success,
                    format!("Deleted {}", leaf.plain_name()),
                );
                self.persist().await;
            },
            Err(e) => {
                warn!(path = %leaf.path.display(), error = %e, "delete failed");
                self.notices.borrow_mut().settle(
                    notice,
                    NoticeLevel::Error,
                    format!("Delete failed: {e}"),
                );
            },
        }
        outcome
    }

    /// Register a folder. Without a path the folder picker asks for one;
    /// `Ok(None)` means the user cancelled or a picker was already open.
    pub async fn import(&self, path: Option<PathBuf>) -> Result<Option<LeafNode>> {
        let path = match path {
            Some(path) => path,
            None => match self.pick_folder().await? {
                Some(path) => path,
                None => return Ok(None),
            },
        };
        let path = canonicalize(path);
        if path.as_os_str().is_empty() {
            return Err(Error::invalid_path(path));
        }
        if let Some(existing) = self.tree.borrow().find_by_path(&path) {
            debug!(path = %path.display(), "already registered");
            return Ok(Some(existing.clone()));
        }

        let mut preview = LeafNode::new(&path, now_ms());
        let plain_name = preview.name.clone();
        let id = preview.id.clone();
        let _claimed = InFlight::mark(&self.in_flight, &id);
        preview.name = tag(StatusPrefix::Importing, &plain_name);
        preview.status = GitStatus::loading();
        self.tree.borrow_mut().upsert_leaf(preview);
        let notice = self
            .notices
            .borrow_mut()
            .start(format!("Importing {plain_name}..."));

        match self.backend.watch(&path).await {
            Ok(status) => {
                let mut imported = None;
                self.tree.borrow_mut().update_leaf(&id, |leaf| {
                    leaf.status = status;
                    leaf.name = plain_name.clone();
                    imported = Some(leaf.clone());
                });
                info!(path = %path.display(), "imported folder");
                self.notices.borrow_mut().settle(
                    notice,
                    NoticeLevel::Success,
                    format!("Imported {plain_name}"),
                );
                self.persist().await;
                Ok(imported)
            },
            Err(e) => {
                self.tree
                    .borrow_mut()
                    .remove_by_paths(std::slice::from_ref(&path));
                self.notices.borrow_mut().settle(
                    notice,
                    NoticeLevel::Error,
                    format!("Import failed: {e}"),
                );
                Err(e)
            },
        }
    }

    /// Ask the backend's picker for a folder. A second call while one is
    /// open resolves to `None` right away.
    pub async fn pick_folder(&self) -> Result<Option<PathBuf>> {
        if self.picking.replace(true) {
            debug!("folder picker already open");
            return Ok(None);
        }
        let picked = self.pick_and_wait().await;
        self.picking.set(false);
        match picked? {
            ServerEvent::FolderPicked { path, .. } => Ok(path.map(canonicalize)),
            _ => Ok(None),
        }
    }

    async fn pick_and_wait(&self) -> Result<ServerEvent> {
        let op_id = OperationId::new();
        let pending = self.completions.register_op(EventKind::FolderPicked, op_id);
        self.backend.pick_folder(op_id).await?;
        pending.wait(self.config.completion_timeout()).await
    }

    async fn delete_and_wait(&self, path: &Path) -> Result<()> {
        let op_id = OperationId::new();
        let pending = self
            .completions
            .register_op(EventKind::DeletionComplete, op_id);
        self.backend.delete(op_id, path).await?;
        match pending.wait(self.config.completion_timeout()).await? {
            ServerEvent::DeletionComplete { success: true, .. } => Ok(()),
            ServerEvent::DeletionComplete { error, .. } => Err(Error::message(
                error.unwrap_or_else(|| "delete failed".into()),
            )),
            other => Err(Error::message(format!("unexpected {} event", other.kind()))),
        }
    }

    /// Open a registered folder in the preferred editor.
    pub async fn open_in_editor(&self, path: impl AsRef<Path>) -> Result<()> {
        let leaf = registered(&self.tree.borrow(), &self.in_flight.borrow(), path.as_ref())?;
        let editor = self.preferences.borrow().editor.clone();
        if let Err(e) = self.backend.open_in_editor(&editor, &leaf.path).await {
            self.notices
                .borrow_mut()
                .flash(NoticeLevel::Error, format!("Could not open editor: {e}"));
            return Err(e);
        }
        let used_at = now_ms();
        self.tree
            .borrow_mut()
            .update_leaf(&leaf.id, |l| l.last_used_at = used_at);
        self.persist().await;
        Ok(())
    }

    /// Start watches for every registered folder and take their statuses.
    pub async fn sync_watches(&self) -> Result<usize> {
        let paths: Vec<PathBuf> = self
            .tree
            .borrow()
            .flatten()
            .iter()
            .map(|leaf| leaf.path.clone())
            .collect();
        let statuses = self.backend.watch_bulk(&paths).await?;
        self.tree.borrow_mut().update_leaves(|leaf| {
            if let Some(status) = statuses.get(&leaf.path) {
                leaf.status = status.clone();
            }
        });
        info!(count = statuses.len(), "watching registered folders");
        Ok(statuses.len())
    }

    // ── Preferences and managed files ───────────────────────────────

    pub async fn set_preferences(&self, preferences: Preferences) {
        *self.preferences.borrow_mut() = preferences;
        self.persist().await;
    }

    pub async fn upsert_managed_file(&self, file: ManagedFile) -> Result<()> {
        file.validate()?;
        {
            let mut files = self.managed_files.borrow_mut();
            match files.iter_mut().find(|f| f.id == file.id) {
                Some(existing) => *existing = file,
                None => files.push(file),
            }
        }
        self.persist().await;
        Ok(())
    }

    pub async fn remove_managed_file(&self, id: &str) -> bool {
        let removed = {
            let mut files = self.managed_files.borrow_mut();
            let before = files.len();
            files.retain(|f| f.id != id);
            files.len() != before
        };
        if removed {
            self.persist().await;
        }
        removed
    }

    /// Write a managed file into every folder its pattern matches.
    pub async fn sync_managed_file(&self, id: &str) -> Result<Vec<SyncResult>> {
        let file = self
            .managed_files
            .borrow()
            .iter()
            .find(|f| f.id == id)
            .cloned()
            .ok_or_else(|| Error::message(format!("no managed file {id}")))?;
        file.validate()?;
        let targets: Vec<PathBuf> = file
            .matched_leaves(&self.tree.borrow())?
            .iter()
            .map(|leaf| leaf.path.clone())
            .collect();
        if targets.is_empty() {
            return Err(Error::message(format!(
                "no folders match {}",
                file.target_pattern
            )));
        }

        let notice = self
            .notices
            .borrow_mut()
            .start(format!("Syncing {}...", file.filename));
        let mut results = Vec::with_capacity(targets.len());
        for path in targets {
            let outcome = self
                .backend
                .write_file(&path, &file.filename, &file.content)
                .await;
            results.push(SyncResult {
                success: outcome.is_ok(),
                error: outcome.err().map(|e| e.to_string()),
                path,
            });
        }
        let failed = results.iter().filter(|r| !r.success).count();
        let (level, message) = if failed == 0 {
            (
                NoticeLevel::Success,
                format!("Synced {} to {}", file.filename, folders(results.len())),
            )
        } else {
            (
                NoticeLevel::Error,
                format!("Sync failed for {failed} of {}", results.len()),
            )
        };
        self.notices.borrow_mut().settle(notice, level, message);
        Ok(results)
    }

    // ── Persistence ─────────────────────────────────────────────────

    /// Save the registry. Skipped while an operation's preview is in the
    /// tree; that operation saves when it settles.
    pub async fn persist(&self) {
        let file = {
            let tree = self.tree.borrow();
            if tree.has_temporary() {
                debug!("operation in flight, deferring save");
                return;
            }
            RegistryFile {
                preferences: self.preferences.borrow().clone(),
                nodes: tree.nodes().to_vec(),
                managed_files: self.managed_files.borrow().clone(),
            }
        };
        if let Err(e) = self.store.save(&file).await {
            warn!(error = %e, "failed to save registry");
        }
    }
}

fn is_busy(leaf: &LeafNode, in_flight: &HashSet<String>) -> bool {
    leaf.is_temporary() || in_flight.contains(&leaf.id)
}

/// The registered leaf at `path`, which must not be mid-operation.
fn registered(tree: &TreeStore, in_flight: &HashSet<String>, path: &Path) -> Result<LeafNode> {
    let leaf = tree
        .find_by_path(path)
        .ok_or_else(|| Error::PathNotFound {
            path: canonicalize(path),
        })?;
    if is_busy(leaf, in_flight) {
        return Err(Error::message(format!("{} is busy", leaf.plain_name())));
    }
    Ok(leaf.clone())
}

fn registered_all(
    tree: &TreeStore,
    in_flight: &HashSet<String>,
    paths: &[PathBuf],
) -> Result<Vec<LeafNode>> {
    if paths.is_empty() {
        return Err(Error::message("no folders selected"));
    }
    let mut seen = HashSet::new();
    let mut leaves = Vec::with_capacity(paths.len());
    for path in paths {
        let leaf = registered(tree, in_flight, path)?;
        if seen.insert(leaf.path.clone()) {
            leaves.push(leaf);
        }
    }
    Ok(leaves)
}

/// Take every source out of the tree. Returns them with their origins and
/// the index where a node replacing them should go.
fn take_all(tree: &mut TreeStore, sources: &[LeafNode]) -> (Vec<(LeafNode, Origin)>, usize) {
    let mut taken = Vec::with_capacity(sources.len());
    let mut index = usize::MAX;
    for source in sources {
        if let Some((leaf, origin)) = tree.take_leaf(&source.id) {
            index = index.min(origin_index(&origin));
            taken.push((leaf, origin));
        }
    }
    (taken, index.min(tree.len()))
}
