//! End-to-end operations against real directories through `LocalBackend`.
#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::{
    fs,
    path::{Path, PathBuf},
    process::Command,
    sync::Arc,
};

use {
    roost_config::{OperationsConfig, WatcherConfig},
    roost_projects::{
        Coordinator, GroupKind, LocalBackend, NoticeLevel, RegistryFile, RegistryStore,
        TomlRegistryStore, types::group_id_of,
    },
    tempfile::TempDir,
    tokio::sync::broadcast,
};

// ── Fixtures ─────────────────────────────────────────────────────────────────

fn git(dir: &Path, args: &[&str]) {
    let status = Command::new("git")
        .args(args)
        .current_dir(dir)
        .status()
        .unwrap();
    assert!(status.success(), "git {args:?} failed");
}

fn init_repo(path: &Path) {
    fs::create_dir_all(path).unwrap();
    git(path, &["init", "-q", "-b", "main"]);
    git(path, &["config", "user.email", "dev@example.com"]);
    git(path, &["config", "user.name", "Dev"]);
    fs::write(path.join("README.md"), "# app\n").unwrap();
    fs::write(path.join(".gitignore"), ".env.local\ntarget/\n").unwrap();
    git(path, &["add", "."]);
    git(path, &["commit", "-q", "-m", "init"]);
}

fn plain_dir(path: &Path) {
    fs::create_dir_all(path).unwrap();
    fs::write(path.join("notes.txt"), "x").unwrap();
}

struct Env {
    root: TempDir,
    backend: Arc<LocalBackend>,
    coordinator: Coordinator,
    events: broadcast::Receiver<roost_projects::ServerEvent>,
}

impl Env {
    async fn new() -> Self {
        let root = tempfile::tempdir().unwrap();
        let backend = Arc::new(LocalBackend::new(WatcherConfig::default()));
        let store = Arc::new(TomlRegistryStore::new(root.path().join("data/registry.toml")));
        let coordinator = Coordinator::load(backend.clone(), store, OperationsConfig::default())
            .await
            .unwrap();
        let events = coordinator.events();
        Self {
            root,
            backend,
            coordinator,
            events,
        }
    }

    fn path(&self, rel: &str) -> PathBuf {
        self.root.path().join(rel)
    }

    async fn register(&self, rel: &str) -> PathBuf {
        let path = self.path(rel);
        self.coordinator
            .import(Some(path.clone()))
            .await
            .unwrap()
            .unwrap();
        path
    }

    fn registered_paths(&self) -> Vec<PathBuf> {
        self.coordinator
            .snapshot()
            .flatten()
            .iter()
            .map(|l| l.path.clone())
            .collect()
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn duplicate_copies_tracked_files_and_includes() {
    let mut env = Env::new().await;
    let app = env.path("p/app");
    init_repo(&app);
    fs::write(app.join(".env.local"), "SECRET=1\n").unwrap();
    fs::create_dir_all(app.join("target")).unwrap();
    fs::write(app.join("target/out.bin"), "junk").unwrap();
    fs::write(app.join("draft.md"), "untracked\n").unwrap();
    env.register("p/app").await;

    let report = env
        .coordinator
        .drive(&mut env.events, env.coordinator.duplicate(&app))
        .await
        .unwrap();

    let copy = env.path("p/app-1");
    assert_eq!(report.results[0].new_path.as_deref(), Some(copy.as_path()));
    assert!(copy.join("README.md").is_file());
    assert!(copy.join("draft.md").is_file());
    assert!(copy.join(".env.local").is_file());
    assert!(copy.join(".git").exists());
    assert!(!copy.join("target").exists());

    let tree = env.coordinator.snapshot();
    let leaf = tree.find_by_path(&copy).unwrap();
    assert_eq!(leaf.name, "app-1");
    assert_eq!(leaf.status.branch, "main");
    assert!(leaf.status.latest_commit.starts_with("init"));
    env.backend.shutdown().await;
}

#[tokio::test]
async fn move_keeps_conflicting_folder_in_place() {
    let mut env = Env::new().await;
    plain_dir(&env.path("a/x"));
    plain_dir(&env.path("a/y"));
    plain_dir(&env.path("b/y"));
    let x = env.register("a/x").await;
    let y = env.register("a/y").await;
    let target = env.path("b");

    let report = env
        .coordinator
        .drive(
            &mut env.events,
            env.coordinator.move_bulk(vec![x.clone(), y.clone()], target),
        )
        .await
        .unwrap();

    assert!(report.results[0].success);
    assert_eq!(report.results[1].error.as_deref(), Some("Target exists"));
    assert!(env.path("b/x/notes.txt").is_file());
    assert!(!x.exists());
    assert!(y.is_dir());
    assert_eq!(env.registered_paths(), vec![env.path("b/x"), y]);

    let notice = env.coordinator.notices().pop().unwrap();
    assert_eq!(notice.level, NoticeLevel::Error);
    env.backend.shutdown().await;
}

#[tokio::test]
async fn physical_group_and_ungroup_round_trip() {
    let mut env = Env::new().await;
    plain_dir(&env.path("w/a/x"));
    plain_dir(&env.path("w/b/y"));
    let x = env.register("w/a/x").await;
    let y = env.register("w/b/y").await;

    let report = env
        .coordinator
        .drive(&mut env.events, env.coordinator.group(vec![x, y], "tools"))
        .await
        .unwrap();

    let group_id = group_id_of(env.path("w/tools"));
    assert_eq!(report.created.as_deref(), Some(group_id.as_str()));
    assert!(env.path("w/tools/x/notes.txt").is_file());
    assert!(env.path("w/tools/y/notes.txt").is_file());
    let tree = env.coordinator.snapshot();
    let group = tree.group(&group_id).unwrap();
    assert_eq!(group.kind, GroupKind::Physical);
    assert_eq!(group.children.len(), 2);

    env.coordinator
        .drive(&mut env.events, env.coordinator.ungroup(&group_id))
        .await
        .unwrap();

    assert!(!env.path("w/tools").exists());
    assert_eq!(env.registered_paths(), vec![env.path("w/x"), env.path("w/y")]);
    assert!(env.coordinator.snapshot().group(&group_id).is_none());
    env.backend.shutdown().await;
}

#[tokio::test]
async fn delete_removes_folder_and_entry() {
    let mut env = Env::new().await;
    plain_dir(&env.path("p/old"));
    let old = env.register("p/old").await;

    env.coordinator
        .drive(&mut env.events, env.coordinator.delete(&old))
        .await
        .unwrap();

    assert!(!old.exists());
    assert!(env.registered_paths().is_empty());
    env.backend.shutdown().await;
}

#[tokio::test]
async fn registry_survives_restart() {
    let mut env = Env::new().await;
    plain_dir(&env.path("p/a"));
    plain_dir(&env.path("p/b"));
    let a = env.register("p/a").await;
    let b = env.register("p/b").await;
    env.coordinator
        .drive(&mut env.events, env.coordinator.group(vec![a, b], "pair"))
        .await
        .unwrap();
    env.backend.shutdown().await;

    let store = TomlRegistryStore::new(env.path("data/registry.toml"));
    let file: RegistryFile = store.load().await.unwrap();
    let reloaded = Coordinator::new(
        Arc::new(LocalBackend::new(WatcherConfig::default())),
        Arc::new(store),
        OperationsConfig::default(),
        file,
    );

    assert_eq!(reloaded.snapshot(), env.coordinator.snapshot());
    let tree = reloaded.snapshot();
    let group = tree.group(&group_id_of(env.path("p/pair"))).unwrap();
    assert_eq!(group.kind, GroupKind::Logical);
}
