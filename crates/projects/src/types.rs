use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{
    path_key::{canonicalize, display_name_of, identity_of},
    status,
};

/// Prefix of ids given to entries that only preview an in-flight operation.
/// `:` never appears in a path identity, so these cannot collide.
pub const TEMP_ID_PREFIX: &str = "tmp:";

const GROUP_ID_PREFIX: &str = "group:";

/// Snapshot of a folder's git state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GitStatus {
    pub branch: String,
    pub diff_count: u32,
    pub latest_commit: String,
}

impl GitStatus {
    pub const NO_BRANCH: &'static str = "no branch";

    /// Status of a folder that is not a repository, or whose state is unknown.
    pub fn unknown() -> Self {
        Self {
            branch: Self::NO_BRANCH.into(),
            diff_count: 0,
            latest_commit: String::new(),
        }
    }

    /// Placeholder shown until the first read completes.
    pub fn loading() -> Self {
        Self {
            branch: "loading...".into(),
            ..Self::unknown()
        }
    }
}

impl Default for GitStatus {
    fn default() -> Self {
        Self::unknown()
    }
}

/// One registered folder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeafNode {
    pub id: String,
    pub path: PathBuf,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub status: GitStatus,
    #[serde(default)]
    pub added_at: u64,
    #[serde(default)]
    pub last_used_at: u64,
}

impl LeafNode {
    pub fn new(path: impl AsRef<Path>, added_at: u64) -> Self {
        let path = canonicalize(path);
        Self {
            id: identity_of(&path),
            name: display_name_of(&path),
            path,
            status: GitStatus::unknown(),
            added_at,
            last_used_at: 0,
        }
    }

    /// Name without any in-flight status prefix.
    pub fn plain_name(&self) -> &str {
        status::untag(&self.name)
    }

    pub fn is_temporary(&self) -> bool {
        self.id.starts_with(TEMP_ID_PREFIX)
    }

    /// Point the leaf at `path`, recomputing id and name from it.
    pub fn relocate(&mut self, path: impl AsRef<Path>) {
        self.path = canonicalize(path);
        self.id = identity_of(&self.path);
        self.name = display_name_of(&self.path);
    }

    /// Whether the id matches the one derived from the current path.
    pub fn id_is_coherent(&self) -> bool {
        self.id == identity_of(&self.path)
    }
}

/// Whether a group only associates leaves or owns a real directory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupKind {
    /// Children stay where they are on disk.
    #[default]
    Logical,
    /// Children were moved into `path`.
    Physical,
}

/// A named collection of leaves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupNode {
    pub id: String,
    pub name: String,
    /// The real directory for physical groups, a synthetic identity path for
    /// logical ones. Older registries may lack it (empty after load).
    #[serde(default)]
    pub path: PathBuf,
    #[serde(default)]
    pub kind: GroupKind,
    #[serde(default)]
    pub children: Vec<LeafNode>,
    #[serde(default)]
    pub added_at: u64,
}

impl GroupNode {
    pub fn new(
        kind: GroupKind,
        path: impl AsRef<Path>,
        children: Vec<LeafNode>,
        added_at: u64,
    ) -> Self {
        let path = canonicalize(path);
        Self {
            id: group_id_of(&path),
            name: display_name_of(&path),
            path,
            kind,
            children,
            added_at,
        }
    }

    /// Most recent use across children, 0 when none was ever opened.
    pub fn last_used_at(&self) -> u64 {
        self.children
            .iter()
            .map(|c| c.last_used_at)
            .max()
            .unwrap_or(0)
    }

    pub fn plain_name(&self) -> &str {
        status::untag(&self.name)
    }

    pub fn is_temporary(&self) -> bool {
        self.id.starts_with(TEMP_ID_PREFIX)
    }
}

/// Group ids live in their own namespace so a logical group's synthetic path
/// can coincide with a leaf's path without sharing its id.
pub fn group_id_of(path: impl AsRef<Path>) -> String {
    format!("{GROUP_ID_PREFIX}{}", identity_of(path))
}

/// A top-level registry entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RegistryNode {
    Leaf(LeafNode),
    Group(GroupNode),
}

impl RegistryNode {
    pub fn id(&self) -> &str {
        match self {
            Self::Leaf(leaf) => &leaf.id,
            Self::Group(group) => &group.id,
        }
    }

    pub fn plain_name(&self) -> &str {
        match self {
            Self::Leaf(leaf) => leaf.plain_name(),
            Self::Group(group) => group.plain_name(),
        }
    }

    pub fn added_at(&self) -> u64 {
        match self {
            Self::Leaf(leaf) => leaf.added_at,
            Self::Group(group) => group.added_at,
        }
    }

    pub fn as_group(&self) -> Option<&GroupNode> {
        match self {
            Self::Group(group) => Some(group),
            Self::Leaf(_) => None,
        }
    }
}
