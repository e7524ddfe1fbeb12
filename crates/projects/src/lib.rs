//! Folder registry for roost.
//!
//! A registry holds folders (usually git repositories) as leaves, optionally
//! collected into groups. The [`Coordinator`] owns the registry tree and runs
//! duplicate, move, group and ungroup operations against a [`FolderBackend`],
//! showing their predicted outcome immediately and reconciling it with what
//! the backend reports once the disk work completes.

pub mod backend;
pub mod completion;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod fs_ops;
pub mod git;
pub mod notices;
pub mod path_key;
pub mod status;
pub mod store;
pub mod sync;
pub mod tree;
pub mod types;
pub mod watcher;

pub use {
    backend::{FolderBackend, LocalBackend},
    coordinator::{Coordinator, Operation, OperationReport, sanitize_group_name},
    error::{Error, Result},
    events::{EventKind, MoveResult, OperationId, ServerEvent},
    notices::{Notice, NoticeLevel},
    store::{MemoryRegistryStore, RegistryFile, RegistryStore, TomlRegistryStore},
    sync::{ManagedFile, SyncResult},
    tree::{SortOrder, TreeStore},
    types::{GitStatus, GroupKind, GroupNode, LeafNode, RegistryNode},
};
