use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use {
    anyhow::{Context, Result},
    clap::Subcommand,
    roost_config::{MoveMode, RoostConfig},
    roost_projects::{
        Coordinator, FolderBackend, GitStatus, GroupKind, LeafNode, LocalBackend, NoticeLevel,
        Operation, OperationReport, RegistryNode, RegistryStore, ServerEvent, TomlRegistryStore,
        types::group_id_of,
    },
    tokio::sync::broadcast::error::RecvError,
    tracing::{info, warn},
};

#[derive(Subcommand)]
pub enum FolderCommand {
    /// List registered folders and groups.
    List {
        /// Read fresh git status for every folder first.
        #[arg(long)]
        refresh: bool,
    },
    /// Register a folder. Opens a folder picker when no path is given.
    Import { path: Option<PathBuf> },
    /// Copy a registered folder to the next free `-N` sibling.
    Duplicate { path: PathBuf },
    /// Delete a registered folder from disk and from the registry.
    Delete { path: PathBuf },
    /// Move registered folders into another directory.
    Move {
        /// Destination parent directory.
        #[arg(long)]
        to: PathBuf,
        /// Copy tracked files and remove the source instead of renaming.
        #[arg(long)]
        copy: bool,
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },
    /// Collect registered folders into a named group.
    Group {
        #[arg(long)]
        name: String,
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },
    /// Dissolve a group, by id or by path.
    Ungroup { group: String },
    /// Open a registered folder in the configured editor.
    Open { path: PathBuf },
    /// Print git status for folders, registered or not.
    Status {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },
    /// List the subdirectories of a directory.
    Ls { path: Option<PathBuf> },
    /// Watch every registered folder and print status changes until Ctrl-C.
    Watch,
    /// Write a managed file into every folder its pattern matches.
    Sync { id: String },
}

pub async fn handle_folders(command: FolderCommand) -> Result<()> {
    let config = roost_config::discover_and_load();
    let backend = Arc::new(LocalBackend::new(config.watcher.clone()));

    let outcome = match command {
        FolderCommand::Status { paths } => status(backend.as_ref(), &paths).await,
        FolderCommand::Ls { path } => ls(backend.as_ref(), path).await,
        command => {
            let coordinator = open_registry(&config, backend.clone()).await?;
            run(&coordinator, command).await
        },
    };
    backend.shutdown().await;
    outcome
}

async fn open_registry(config: &RoostConfig, backend: Arc<LocalBackend>) -> Result<Coordinator> {
    let path = roost_config::registry_path(config);
    let store = Arc::new(TomlRegistryStore::new(path.clone()));
    let mut file = store
        .load()
        .await
        .with_context(|| format!("failed to read registry {}", path.display()))?;
    if !path.exists() {
        file.preferences = config.preferences.clone();
    }
    info!(registry = %path.display(), nodes = file.nodes.len(), "registry loaded");
    Ok(Coordinator::new(
        backend,
        store,
        config.operations.clone(),
        file,
    ))
}

async fn run(coordinator: &Coordinator, command: FolderCommand) -> Result<()> {
    let mut events = coordinator.events();
    match command {
        FolderCommand::List { refresh } => {
            if refresh {
                coordinator.sync_watches().await?;
            }
            print_tree(coordinator);
            Ok(())
        },
        FolderCommand::Import { path } => {
            let path = path.map(|p| absolute(&p)).transpose()?;
            let imported = coordinator
                .drive(&mut events, coordinator.import(path))
                .await?;
            match imported {
                Some(leaf) => println!("{}", leaf_line(&leaf)),
                None => eprintln!("Nothing imported."),
            }
            Ok(())
        },
        FolderCommand::Duplicate { path } => {
            let path = absolute(&path)?;
            let report = coordinator
                .drive(&mut events, coordinator.duplicate(&path))
                .await;
            finish(coordinator, report)
        },
        FolderCommand::Delete { path } => {
            let path = absolute(&path)?;
            let outcome = coordinator
                .drive(&mut events, coordinator.delete(&path))
                .await;
            print_notice(coordinator);
            outcome.map_err(Into::into)
        },
        FolderCommand::Move { to, copy, paths } => {
            let prefs = coordinator.preferences();
            let operation = Operation::MoveBulk {
                paths: absolute_all(&paths)?,
                target_parent: absolute(&to)?,
                include_files: prefs.copy_include_files,
                mode: if copy {
                    MoveMode::Copy
                } else {
                    prefs.operation_mode
                },
            };
            let report = coordinator
                .drive(&mut events, coordinator.run(operation))
                .await;
            finish(coordinator, report)
        },
        FolderCommand::Group { name, paths } => {
            let paths = absolute_all(&paths)?;
            let report = coordinator
                .drive(&mut events, coordinator.group(paths, &name))
                .await;
            finish(coordinator, report)
        },
        FolderCommand::Ungroup { group } => {
            let id = if group.starts_with("group:") {
                group
            } else {
                group_id_of(absolute(Path::new(&group))?)
            };
            let report = coordinator
                .drive(&mut events, coordinator.ungroup(&id))
                .await;
            finish(coordinator, report)
        },
        FolderCommand::Open { path } => {
            coordinator.open_in_editor(absolute(&path)?).await?;
            Ok(())
        },
        FolderCommand::Watch => watch(coordinator, events).await,
        FolderCommand::Sync { id } => {
            let results = coordinator.sync_managed_file(&id).await?;
            for result in &results {
                match &result.error {
                    None => println!("wrote    {}", result.path.display()),
                    Some(error) => println!("failed   {}: {error}", result.path.display()),
                }
            }
            print_notice(coordinator);
            Ok(())
        },
        FolderCommand::Status { .. } | FolderCommand::Ls { .. } => Ok(()),
    }
}

async fn watch(
    coordinator: &Coordinator,
    mut events: tokio::sync::broadcast::Receiver<ServerEvent>,
) -> Result<()> {
    let count = coordinator.sync_watches().await?;
    eprintln!("Watching {count} folder(s). Press Ctrl-C to stop.");

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            received = events.recv() => match received {
                Ok(event) => {
                    if let ServerEvent::GitInfoUpdate { path, status } = &event {
                        println!("{}  {}", path.display(), status_line(status));
                    }
                    coordinator.handle_event(event);
                },
                Err(RecvError::Lagged(missed)) => warn!(missed, "missed status updates"),
                Err(RecvError::Closed) => break,
            },
        }
    }
    coordinator.persist().await;
    Ok(())
}

async fn status(backend: &dyn FolderBackend, paths: &[PathBuf]) -> Result<()> {
    let paths = absolute_all(paths)?;
    let statuses = backend.git_info(&paths).await?;
    for path in &paths {
        let status = statuses.get(path).cloned().unwrap_or_default();
        println!("{}  {}", path.display(), status_line(&status));
    }
    Ok(())
}

async fn ls(backend: &dyn FolderBackend, path: Option<PathBuf>) -> Result<()> {
    let path = match path {
        Some(path) => absolute(&path)?,
        None => std::env::current_dir()?,
    };
    let listing = backend.list_dirs(&path).await?;
    println!("{}", listing.current_path.display());
    if let Some(parent) = &listing.parent {
        println!("  ..  ({})", parent.display());
    }
    for dir in &listing.dirs {
        println!("  {}/", dir.name);
    }
    Ok(())
}

// ── Output ──────────────────────────────────────────────────────────

fn finish(coordinator: &Coordinator, report: roost_projects::Result<OperationReport>) -> Result<()> {
    let report = report?;
    for result in &report.results {
        match (&result.new_path, &result.error) {
            (Some(new_path), _) if result.success => {
                println!("{} -> {}", result.path.display(), new_path.display());
            },
            (_, error) => println!(
                "{} failed: {}",
                result.path.display(),
                error.as_deref().unwrap_or("unknown error")
            ),
        }
    }
    print_notice(coordinator);
    Ok(())
}

fn print_notice(coordinator: &Coordinator) {
    if let Some(notice) = coordinator.notices().pop() {
        match notice.level {
            NoticeLevel::Error => eprintln!("error: {}", notice.message),
            NoticeLevel::Success | NoticeLevel::Loading => eprintln!("{}", notice.message),
        }
    }
}

fn print_tree(coordinator: &Coordinator) {
    let nodes = coordinator.ordered_nodes();
    if nodes.is_empty() {
        println!("No folders registered.");
        return;
    }
    for node in &nodes {
        match node {
            RegistryNode::Leaf(leaf) => println!("{}", leaf_line(leaf)),
            RegistryNode::Group(group) => {
                let kind = match group.kind {
                    GroupKind::Logical => "logical",
                    GroupKind::Physical => "physical",
                };
                println!(
                    "{}/  [{kind}] {}  ({})",
                    group.name,
                    group.path.display(),
                    group.id
                );
                for child in &group.children {
                    println!("  {}", leaf_line(child));
                }
            },
        }
    }
}

fn leaf_line(leaf: &LeafNode) -> String {
    format!(
        "{:<24} {}  {}",
        leaf.name,
        status_line(&leaf.status),
        leaf.path.display()
    )
}

fn status_line(status: &GitStatus) -> String {
    if status.branch == GitStatus::NO_BRANCH {
        return format!("{:<16}", status.branch);
    }
    let dirty = if status.diff_count > 0 {
        format!("+{}", status.diff_count)
    } else {
        "clean".into()
    };
    format!("{:<10} {:<5} {}", status.branch, dirty, status.latest_commit)
}

fn absolute(path: &Path) -> Result<PathBuf> {
    std::path::absolute(path).with_context(|| format!("invalid path {}", path.display()))
}

fn absolute_all(paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
    paths.iter().map(|p| absolute(p)).collect()
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        roost_projects::RegistryFile,
        tempfile::TempDir,
    };

    fn config_in(dir: &TempDir) -> RoostConfig {
        let mut config = RoostConfig::default();
        config.registry.path = Some(dir.path().join("registry.toml"));
        config.preferences.sort_by_name = true;
        config
    }

    #[tokio::test]
    async fn fresh_registry_takes_config_preferences() {
        let dir = TempDir::new().unwrap();
        let config = config_in(&dir);
        let backend = Arc::new(LocalBackend::new(config.watcher.clone()));

        let coordinator = open_registry(&config, backend.clone()).await.unwrap();

        assert!(coordinator.preferences().sort_by_name);
        assert!(coordinator.snapshot().flatten().is_empty());
        backend.shutdown().await;
    }

    #[tokio::test]
    async fn saved_preferences_win_over_config() {
        let dir = TempDir::new().unwrap();
        let config = config_in(&dir);
        let store = TomlRegistryStore::new(dir.path().join("registry.toml"));
        store.save(&RegistryFile::default()).await.unwrap();
        let backend = Arc::new(LocalBackend::new(config.watcher.clone()));

        let coordinator = open_registry(&config, backend.clone()).await.unwrap();

        assert!(!coordinator.preferences().sort_by_name);
        backend.shutdown().await;
    }

    #[test]
    fn status_line_formats() {
        assert_eq!(status_line(&GitStatus::unknown()).trim_end(), "no branch");

        let dirty = GitStatus {
            branch: "main".into(),
            diff_count: 3,
            latest_commit: "fix parser".into(),
        };
        assert_eq!(status_line(&dirty), "main       +3    fix parser");

        let clean = GitStatus {
            diff_count: 0,
            ..dirty
        };
        assert!(status_line(&clean).contains("clean"));
    }

    #[test]
    fn relative_paths_become_absolute() {
        let paths = absolute_all(&[PathBuf::from("a/b"), PathBuf::from("/x/y")]).unwrap();
        assert!(paths[0].is_absolute());
        assert!(paths[0].ends_with("a/b"));
        assert_eq!(paths[1], PathBuf::from("/x/y"));
    }
}
