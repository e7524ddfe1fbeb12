//! Managed files: a file kept in sync across every folder whose name matches
//! a pattern, e.g. one `AGENTS.md` for `app`, `app-1`, `app-2`.

use {
    regex::Regex,
    serde::{Deserialize, Serialize},
};

use crate::{
    error::{Error, Result},
    tree::TreeStore,
    types::LeafNode,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagedFile {
    pub id: String,
    pub filename: String,
    #[serde(default)]
    pub content: String,
    /// Folder base name. `app` matches `app` and `app-<digits>`.
    pub target_pattern: String,
}

impl ManagedFile {
    fn matcher(&self) -> Result<Regex> {
        let pattern = format!(r"^{}(-\d+)?$", regex::escape(self.target_pattern.trim()));
        Regex::new(&pattern).map_err(|e| Error::external("invalid target pattern", e))
    }

    /// Leaves whose plain name matches the target pattern, in registry order.
    pub fn matched_leaves<'a>(&self, tree: &'a TreeStore) -> Result<Vec<&'a LeafNode>> {
        let matcher = self.matcher()?;
        Ok(tree
            .flatten()
            .into_iter()
            .filter(|leaf| matcher.is_match(leaf.plain_name()))
            .collect())
    }

    /// Reject files that cannot be written anywhere.
    pub fn validate(&self) -> Result<()> {
        let name = self.filename.trim();
        if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
            return Err(Error::message(format!(
                "invalid managed file name: {:?}",
                self.filename
            )));
        }
        if self.target_pattern.trim().is_empty() {
            return Err(Error::message("managed file has no target pattern"));
        }
        Ok(())
    }
}

/// Outcome of writing a managed file into one folder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResult {
    pub path: std::path::PathBuf,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
