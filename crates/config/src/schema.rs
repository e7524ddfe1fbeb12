//! Config schema types (registry, operations, watcher, preferences).

use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

/// Editors offered as presets. Anything else goes through [`EditorChoice::Custom`].
pub const SUPPORTED_EDITORS: &[&str] = &["Cursor", "VSCode", "Trae", "Qoder", "Antigravity"];

/// Root configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoostConfig {
    pub registry: RegistryConfig,
    pub operations: OperationsConfig,
    pub watcher: WatcherConfig,
    /// Defaults applied when the registry file carries no preferences yet.
    pub preferences: Preferences,
}

/// Where the folder registry is persisted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Registry file. Defaults to `<data_dir>/registry.toml`.
    pub path: Option<PathBuf>,
}

/// Timing for bulk operations and their user-facing notices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OperationsConfig {
    /// How long to wait for a background completion before rolling back.
    pub completion_timeout_secs: u64,
    pub success_notice_ms: u64,
    pub failure_notice_ms: u64,
}

impl Default for OperationsConfig {
    fn default() -> Self {
        Self {
            completion_timeout_secs: 120,
            success_notice_ms: 2_000,
            failure_notice_ms: 3_000,
        }
    }
}

impl OperationsConfig {
    pub fn completion_timeout(&self) -> Duration {
        Duration::from_secs(self.completion_timeout_secs)
    }

    pub fn success_notice(&self) -> Duration {
        Duration::from_millis(self.success_notice_ms)
    }

    pub fn failure_notice(&self) -> Duration {
        Duration::from_millis(self.failure_notice_ms)
    }
}

/// Git-status watcher tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    pub debounce_ms: u64,
    /// Directory levels below a registered folder that are observed.
    pub max_depth: usize,
    /// Directory names never descended into.
    pub ignored_dirs: Vec<String>,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 200,
            max_depth: 1,
            ignored_dirs: vec![".git".into(), "node_modules".into()],
        }
    }
}

impl WatcherConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn is_ignored(&self, dir_name: &str) -> bool {
        self.ignored_dirs.iter().any(|d| d == dir_name)
    }
}

/// Editor used by "open in editor".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum EditorChoice {
    /// One of [`SUPPORTED_EDITORS`], launched by application name.
    Preset(String),
    /// A user-supplied application name or command.
    Custom(String),
}

impl Default for EditorChoice {
    fn default() -> Self {
        Self::Preset("Cursor".into())
    }
}

impl EditorChoice {
    pub fn app_name(&self) -> &str {
        match self {
            Self::Preset(name) | Self::Custom(name) => name,
        }
    }

    pub fn is_known_preset(&self) -> bool {
        matches!(self, Self::Preset(name) if SUPPORTED_EDITORS.contains(&name.as_str()))
    }
}

/// How bulk moves transfer folder contents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MoveMode {
    /// Rename in place, falling back to copy + delete across devices.
    #[default]
    Move,
    /// Copy tracked and untracked-not-ignored files plus the include list,
    /// then delete the source.
    Copy,
}

impl std::fmt::Display for MoveMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Move => f.write_str("move"),
            Self::Copy => f.write_str("copy"),
        }
    }
}

/// User preferences persisted next to the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Preferences {
    pub editor: EditorChoice,
    /// Files carried over on copy/duplicate even when git ignores them.
    pub copy_include_files: Vec<String>,
    pub operation_mode: MoveMode,
    pub sort_by_name: bool,
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            editor: EditorChoice::default(),
            copy_include_files: vec![".env.local".into()],
            operation_mode: MoveMode::Move,
            sort_by_name: false,
        }
    }
}
