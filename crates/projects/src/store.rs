use std::{fs, path::PathBuf, sync::Mutex};

use {
    async_trait::async_trait,
    roost_config::Preferences,
    serde::{Deserialize, Serialize},
    tracing::debug,
};

use crate::{error::Result, sync::ManagedFile, types::RegistryNode};

/// Everything persisted between runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryFile {
    pub preferences: Preferences,
    pub nodes: Vec<RegistryNode>,
    pub managed_files: Vec<ManagedFile>,
}

/// Trait for persisting the registry. Implementations can be file-backed,
/// in-memory, etc.
#[async_trait]
pub trait RegistryStore: Send + Sync {
    async fn load(&self) -> Result<RegistryFile>;
    async fn save(&self, file: &RegistryFile) -> Result<()>;
}

// ── TOML file-backed implementation ──────────────────────────────────

/// Stores the registry in a TOML file at the given path.
pub struct TomlRegistryStore {
    path: PathBuf,
}

impl TomlRegistryStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    fn read_file(&self) -> Result<RegistryFile> {
        if self.path.exists() {
            let data = fs::read_to_string(&self.path)?;
            Ok(toml::from_str(&data)?)
        } else {
            debug!(path = %self.path.display(), "no registry yet");
            Ok(RegistryFile::default())
        }
    }

    fn write_file(&self, file: &RegistryFile) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let data = toml::to_string_pretty(file)?;
        // Readers never see a partially written registry.
        let tmp = self.path.with_extension("toml.tmp");
        fs::write(&tmp, data)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[async_trait]
impl RegistryStore for TomlRegistryStore {
    async fn load(&self) -> Result<RegistryFile> {
        self.read_file()
    }

    async fn save(&self, file: &RegistryFile) -> Result<()> {
        self.write_file(file)
    }
}

// ── In-memory implementation ────────────────────────────────────────

/// Keeps the registry in memory. Counts saves so callers can assert on them.
#[derive(Default)]
pub struct MemoryRegistryStore {
    file: Mutex<RegistryFile>,
    saves: Mutex<usize>,
}

impl MemoryRegistryStore {
    pub fn new(file: RegistryFile) -> Self {
        Self {
            file: Mutex::new(file),
            saves: Mutex::new(0),
        }
    }

    pub fn snapshot(&self) -> RegistryFile {
        self.file.lock().map(|f| f.clone()).unwrap_or_default()
    }

    pub fn save_count(&self) -> usize {
        self.saves.lock().map(|n| *n).unwrap_or_default()
    }
}

#[async_trait]
impl RegistryStore for MemoryRegistryStore {
    async fn load(&self) -> Result<RegistryFile> {
        Ok(self.snapshot())
    }

    async fn save(&self, file: &RegistryFile) -> Result<()> {
        if let Ok(mut stored) = self.file.lock() {
            *stored = file.clone();
        }
        if let Ok(mut saves) = self.saves.lock() {
            *saves += 1;
        }
        Ok(())
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::types::{GroupKind, GroupNode, LeafNode},
        roost_config::{EditorChoice, MoveMode},
    };

    fn sample() -> RegistryFile {
        let mut leaf = LeafNode::new("/p/app", 10);
        leaf.status.branch = "main".into();
        leaf.last_used_at = 20;
        RegistryFile {
            preferences: Preferences {
                editor: EditorChoice::Custom("Zed".into()),
                operation_mode: MoveMode::Copy,
                ..Preferences::default()
            },
            nodes: vec![
                RegistryNode::Leaf(leaf),
                RegistryNode::Group(GroupNode::new(
                    GroupKind::Physical,
                    "/w/tools",
                    vec![LeafNode::new("/w/tools/a", 1), LeafNode::new("/w/tools/b", 2)],
                    3,
                )),
            ],
            managed_files: vec![ManagedFile {
                id: "agents".into(),
                filename: "AGENTS.md".into(),
                content: "# rules\n".into(),
                target_pattern: "app".into(),
            }],
        }
    }

    #[tokio::test]
    async fn toml_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = TomlRegistryStore::new(dir.path().join("nested/registry.toml"));

        assert_eq!(store.load().await.unwrap(), RegistryFile::default());

        let file = sample();
        store.save(&file).await.unwrap();
        assert_eq!(store.load().await.unwrap(), file);
        assert!(!dir.path().join("nested/registry.toml.tmp").exists());
    }

    #[tokio::test]
    async fn toml_store_tolerates_missing_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.toml");
        fs::write(
            &path,
            r#"
[[nodes]]
type = "leaf"
id = "stale"
path = "/p/app/"
name = "Moving: app"

[[nodes]]
type = "group"
id = "legacy"
name = "tools"

[[nodes.children]]
id = "x"
path = "/w/a"
"#,
        )
        .unwrap();

        let file = TomlRegistryStore::new(path).load().await.unwrap();
        assert_eq!(file.nodes.len(), 2);
        assert_eq!(file.preferences, Preferences::default());
        let group = file.nodes[1].as_group().unwrap();
        assert_eq!(group.children.len(), 1);
        assert!(group.path.as_os_str().is_empty());
    }

    #[tokio::test]
    async fn memory_store_counts_saves() {
        let store = MemoryRegistryStore::default();
        store.save(&sample()).await.unwrap();
        store.save(&sample()).await.unwrap();
        assert_eq!(store.save_count(), 2);
        assert_eq!(store.load().await.unwrap(), sample());
    }
}
