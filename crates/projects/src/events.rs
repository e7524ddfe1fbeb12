//! Events published by the backend: completions of requested work and
//! unsolicited git status updates.

use std::{fmt, path::PathBuf};

use serde::{Deserialize, Serialize};

use crate::types::GitStatus;

/// Correlates a request with the completion event it eventually causes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(uuid::Uuid);

impl OperationId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for OperationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    FolderPicked,
    DuplicationComplete,
    DeletionComplete,
    MoveBulkComplete,
    GitInfoUpdate,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::FolderPicked => "FOLDER_PICKED",
            Self::DuplicationComplete => "DUPLICATION_COMPLETE",
            Self::DeletionComplete => "DELETION_COMPLETE",
            Self::MoveBulkComplete => "MOVE_BULK_COMPLETE",
            Self::GitInfoUpdate => "GIT_INFO_UPDATE",
        })
    }
}

/// Outcome of one path in a bulk move.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MoveResult {
    pub path: PathBuf,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl MoveResult {
    pub fn moved(path: impl Into<PathBuf>, new_path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            success: true,
            new_path: Some(new_path.into()),
            error: None,
        }
    }

    pub fn failed(path: impl Into<PathBuf>, error: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            success: false,
            new_path: None,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerEvent {
    #[serde(rename_all = "camelCase")]
    FolderPicked {
        op_id: OperationId,
        path: Option<PathBuf>,
    },
    #[serde(rename_all = "camelCase")]
    DuplicationComplete {
        op_id: OperationId,
        path: PathBuf,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        new_path: Option<PathBuf>,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    DeletionComplete {
        op_id: OperationId,
        path: PathBuf,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    MoveBulkComplete {
        op_id: OperationId,
        results: Vec<MoveResult>,
    },
    #[serde(rename_all = "camelCase")]
    GitInfoUpdate {
        path: PathBuf,
        #[serde(flatten)]
        status: GitStatus,
    },
}

impl ServerEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::FolderPicked { .. } => EventKind::FolderPicked,
            Self::DuplicationComplete { .. } => EventKind::DuplicationComplete,
            Self::DeletionComplete { .. } => EventKind::DeletionComplete,
            Self::MoveBulkComplete { .. } => EventKind::MoveBulkComplete,
            Self::GitInfoUpdate { .. } => EventKind::GitInfoUpdate,
        }
    }

    /// The request this event completes. Status updates are unsolicited.
    pub fn op_id(&self) -> Option<OperationId> {
        match self {
            Self::FolderPicked { op_id, .. }
            | Self::DuplicationComplete { op_id, .. }
            | Self::DeletionComplete { op_id, .. }
            | Self::MoveBulkComplete { op_id, .. } => Some(*op_id),
            Self::GitInfoUpdate { .. } => None,
        }
    }
}

/// One level of a directory, for browsing without a native picker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirListing {
    pub current_path: PathBuf,
    pub parent: Option<PathBuf>,
    pub dirs: Vec<DirEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    pub name: String,
    pub path: PathBuf,
}
