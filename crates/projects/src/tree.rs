//! The registry tree: top-level leaves and groups of leaves.
//!
//! Every structural edit keeps two properties: no two leaves share a canonical
//! path, and no group is left without children.

use std::{
    collections::HashSet,
    path::{Path, PathBuf},
};

use tracing::debug;

use crate::{
    path_key::{canonicalize, common_prefix, display_name_of, identity_of, parent_of},
    status::untag,
    types::{GroupNode, LeafNode, RegistryNode, group_id_of},
};

/// Where a leaf sat before [`TreeStore::take_leaf`] removed it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Origin {
    TopLevel {
        index: usize,
    },
    Group {
        group_index: usize,
        child_index: usize,
        /// The group as it was, minus its children. Used to recreate it if
        /// removing the leaf emptied it.
        shell: GroupNode,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortOrder {
    /// Insertion order.
    #[default]
    Registry,
    /// Case-insensitive by display name.
    Name,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TreeStore {
    nodes: Vec<RegistryNode>,
}

impl TreeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a tree from nodes read back from storage, healing anything an
    /// interrupted run or an older format left behind: status prefixes are
    /// stripped, ids recomputed from paths, groups without a path get a
    /// synthetic one, duplicate paths keep their first occurrence, and
    /// empty groups are dropped.
    pub fn from_persisted(nodes: Vec<RegistryNode>) -> Self {
        let mut seen = HashSet::new();
        let mut healed = Vec::with_capacity(nodes.len());
        for node in nodes {
            match node {
                RegistryNode::Leaf(leaf) => {
                    if let Some(leaf) = heal_leaf(leaf, &mut seen) {
                        healed.push(RegistryNode::Leaf(leaf));
                    }
                },
                RegistryNode::Group(mut group) => {
                    group.children = std::mem::take(&mut group.children)
                        .into_iter()
                        .filter_map(|child| heal_leaf(child, &mut seen))
                        .collect();
                    if group.children.is_empty() {
                        debug!(group = %group.name, "dropping empty group on load");
                        continue;
                    }
                    heal_group(&mut group);
                    healed.push(RegistryNode::Group(group));
                },
            }
        }
        Self { nodes: healed }
    }

    pub fn nodes(&self) -> &[RegistryNode] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Every leaf, top-level or nested, exactly once.
    pub fn flatten(&self) -> Vec<&LeafNode> {
        let mut leaves = Vec::new();
        for node in &self.nodes {
            match node {
                RegistryNode::Leaf(leaf) => leaves.push(leaf),
                RegistryNode::Group(group) => leaves.extend(group.children.iter()),
            }
        }
        leaves
    }

    pub fn find_by_path(&self, path: impl AsRef<Path>) -> Option<&LeafNode> {
        let path = canonicalize(path);
        self.flatten().into_iter().find(|leaf| leaf.path == path)
    }

    pub fn contains_path(&self, path: impl AsRef<Path>) -> bool {
        self.find_by_path(path).is_some()
    }

    pub fn group(&self, id: &str) -> Option<&GroupNode> {
        self.nodes
            .iter()
            .filter_map(RegistryNode::as_group)
            .find(|group| group.id == id)
    }

    /// The group holding the leaf with `leaf_id`, if it is nested.
    pub fn group_containing(&self, leaf_id: &str) -> Option<&GroupNode> {
        self.nodes
            .iter()
            .filter_map(RegistryNode::as_group)
            .find(|group| group.children.iter().any(|c| c.id == leaf_id))
    }

    pub fn position(&self, id: &str) -> Option<usize> {
        self.nodes.iter().position(|node| node.id() == id)
    }

    /// Index of the top-level node holding the leaf: the leaf itself or its
    /// group.
    pub fn top_level_index(&self, leaf_id: &str) -> Option<usize> {
        self.locate(leaf_id).map(|(index, _)| index)
    }

    /// Whether any entry previews an operation that has not settled.
    pub fn has_temporary(&self) -> bool {
        self.nodes.iter().any(|node| match node {
            RegistryNode::Leaf(leaf) => leaf.is_temporary(),
            RegistryNode::Group(group) => {
                group.is_temporary() || group.children.iter().any(LeafNode::is_temporary)
            },
        })
    }

    /// Apply `f` to every leaf. Groups keep their shape.
    pub fn update_leaves(&mut self, mut f: impl FnMut(&mut LeafNode)) {
        for node in &mut self.nodes {
            match node {
                RegistryNode::Leaf(leaf) => f(leaf),
                RegistryNode::Group(group) => group.children.iter_mut().for_each(&mut f),
            }
        }
    }

    /// Apply `f` to the leaf with `id`. Returns whether it was found.
    pub fn update_leaf(&mut self, id: &str, f: impl FnOnce(&mut LeafNode)) -> bool {
        match self.leaf_mut(id) {
            Some(leaf) => {
                f(leaf);
                true
            },
            None => false,
        }
    }

    pub fn update_group(&mut self, id: &str, f: impl FnOnce(&mut GroupNode)) -> bool {
        let group = self.nodes.iter_mut().find_map(|node| match node {
            RegistryNode::Group(group) if group.id == id => Some(group),
            _ => None,
        });
        match group {
            Some(group) => {
                f(group);
                true
            },
            None => false,
        }
    }

    fn leaf_mut(&mut self, id: &str) -> Option<&mut LeafNode> {
        self.nodes.iter_mut().find_map(|node| match node {
            RegistryNode::Leaf(leaf) if leaf.id == id => Some(leaf),
            RegistryNode::Leaf(_) => None,
            RegistryNode::Group(group) => group.children.iter_mut().find(|c| c.id == id),
        })
    }

    /// Remove leaves matching any of `paths`, wherever they sit, then drop
    /// groups left empty. Returns how many leaves were removed.
    pub fn remove_by_paths(&mut self, paths: &[PathBuf]) -> usize {
        let targets: HashSet<PathBuf> = paths.iter().map(canonicalize).collect();
        let before = self.flatten().len();
        self.nodes.retain_mut(|node| match node {
            RegistryNode::Leaf(leaf) => !targets.contains(&leaf.path),
            RegistryNode::Group(group) => {
                group.children.retain(|c| !targets.contains(&c.path));
                !group.children.is_empty()
            },
        });
        before - self.flatten().len()
    }

    /// Insert `leaf` at the end unless a leaf with the same path exists.
    /// Returns whether it was inserted.
    pub fn upsert_leaf(&mut self, leaf: LeafNode) -> bool {
        if self.contains_path(&leaf.path) {
            debug!(path = %leaf.path.display(), "already registered");
            return false;
        }
        self.nodes.push(RegistryNode::Leaf(leaf));
        true
    }

    /// Insert a top-level node at `index` (clamped to the end).
    pub fn insert_node(&mut self, index: usize, node: RegistryNode) {
        let index = index.min(self.nodes.len());
        self.nodes.insert(index, node);
    }

    /// Remove a top-level node by id, returning it with its former index.
    pub fn remove_node(&mut self, id: &str) -> Option<(usize, RegistryNode)> {
        let index = self.position(id)?;
        Some((index, self.nodes.remove(index)))
    }

    /// Replace a top-level node in place. Returns whether `id` was found.
    pub fn replace_node(&mut self, id: &str, node: RegistryNode) -> bool {
        match self.position(id) {
            Some(index) => {
                self.nodes[index] = node;
                true
            },
            None => false,
        }
    }

    /// Detach a leaf and report where it was. A group emptied by the removal
    /// is dropped; its shell is kept in the returned [`Origin`].
    ///
    /// Restoring taken leaves in reverse order reproduces the tree exactly.
    pub fn take_leaf(&mut self, id: &str) -> Option<(LeafNode, Origin)> {
        let (index, child) = self.locate(id)?;
        match child {
            None => {
                let RegistryNode::Leaf(leaf) = self.nodes.remove(index) else {
                    return None;
                };
                Some((leaf, Origin::TopLevel { index }))
            },
            Some(child_index) => {
                let RegistryNode::Group(group) = &mut self.nodes[index] else {
                    return None;
                };
                let leaf = group.children.remove(child_index);
                let shell = GroupNode {
                    children: Vec::new(),
                    ..group.clone()
                };
                if group.children.is_empty() {
                    self.nodes.remove(index);
                }
                Some((leaf, Origin::Group {
                    group_index: index,
                    child_index,
                    shell,
                }))
            },
        }
    }

    /// Top-level index of the leaf, plus its child index when nested.
    fn locate(&self, id: &str) -> Option<(usize, Option<usize>)> {
        self.nodes
            .iter()
            .enumerate()
            .find_map(|(index, node)| match node {
                RegistryNode::Leaf(leaf) => (leaf.id == id).then_some((index, None)),
                RegistryNode::Group(group) => group
                    .children
                    .iter()
                    .position(|c| c.id == id)
                    .map(|child| (index, Some(child))),
            })
    }

    /// Put a leaf back where [`take_leaf`](Self::take_leaf) found it. A
    /// dropped group is recreated from its shell. Refuses to create a second
    /// leaf for an already-registered path.
    pub fn restore_leaf(&mut self, leaf: LeafNode, origin: Origin) -> bool {
        if self.contains_path(&leaf.path) {
            debug!(path = %leaf.path.display(), "not restoring, path registered meanwhile");
            return false;
        }
        match origin {
            Origin::TopLevel { index } => self.insert_node(index, RegistryNode::Leaf(leaf)),
            Origin::Group {
                group_index,
                child_index,
                shell,
            } => {
                let existing = self.nodes.iter_mut().find_map(|node| match node {
                    RegistryNode::Group(group) if group.id == shell.id => Some(group),
                    _ => None,
                });
                match existing {
                    Some(group) => {
                        let at = child_index.min(group.children.len());
                        group.children.insert(at, leaf);
                    },
                    None => self.insert_node(
                        group_index,
                        RegistryNode::Group(GroupNode {
                            children: vec![leaf],
                            ..shell
                        }),
                    ),
                }
            },
        }
        true
    }

    /// Top-level nodes in display order.
    pub fn ordered(&self, order: SortOrder) -> Vec<&RegistryNode> {
        let mut nodes: Vec<&RegistryNode> = self.nodes.iter().collect();
        if order == SortOrder::Name {
            nodes.sort_by_cached_key(|node| node.plain_name().to_lowercase());
        }
        nodes
    }
}

fn heal_leaf(mut leaf: LeafNode, seen: &mut HashSet<PathBuf>) -> Option<LeafNode> {
    leaf.path = canonicalize(&leaf.path);
    if leaf.path.as_os_str().is_empty() {
        debug!(id = %leaf.id, "dropping leaf without a path");
        return None;
    }
    if !seen.insert(leaf.path.clone()) {
        debug!(path = %leaf.path.display(), "dropping duplicate leaf");
        return None;
    }
    let name = untag(&leaf.name);
    leaf.name = if name.is_empty() {
        display_name_of(&leaf.path)
    } else {
        name.to_string()
    };
    leaf.id = identity_of(&leaf.path);
    Some(leaf)
}

fn heal_group(group: &mut GroupNode) {
    let name = untag(&group.name).to_string();
    if group.path.as_os_str().is_empty() {
        let base = shared_parent(&group.children).or_else(|| {
            let paths: Vec<PathBuf> = group.children.iter().map(|c| c.path.clone()).collect();
            common_prefix(&paths)
        });
        let fallback = if name.is_empty() { "group" } else { &name };
        group.path = base.unwrap_or_default().join(fallback);
    }
    group.path = canonicalize(&group.path);
    group.name = if name.is_empty() {
        display_name_of(&group.path)
    } else {
        name
    };
    group.id = group_id_of(&group.path);
}

/// The parent directory shared by every leaf, if they all have the same one.
pub(crate) fn shared_parent(leaves: &[LeafNode]) -> Option<PathBuf> {
    let mut parents = leaves.iter().map(|leaf| parent_of(&leaf.path));
    let first = parents.next()??;
    parents
        .all(|p| p.as_ref() == Some(&first))
        .then_some(first)
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::types::{GroupKind, TEMP_ID_PREFIX},
    };

    fn leaf(path: &str) -> LeafNode {
        LeafNode::new(path, 1)
    }

    fn sample() -> TreeStore {
        let mut tree = TreeStore::new();
        tree.upsert_leaf(leaf("/a/x"));
        tree.insert_node(
            1,
            RegistryNode::Group(GroupNode::new(
                GroupKind::Physical,
                "/g",
                vec![leaf("/g/one"), leaf("/g/two")],
                1,
            )),
        );
        tree.upsert_leaf(leaf("/a/y"));
        tree
    }

    #[test]
    fn flatten_and_find() {
        let tree = sample();
        let paths: Vec<_> = tree.flatten().iter().map(|l| l.path.clone()).collect();
        assert_eq!(paths, vec![
            PathBuf::from("/a/x"),
            PathBuf::from("/g/one"),
            PathBuf::from("/g/two"),
            PathBuf::from("/a/y"),
        ]);
        assert!(tree.find_by_path("/g/two/").is_some());
        assert!(tree.find_by_path("/g").is_none());
        assert_eq!(
            tree.group_containing(&identity_of("/g/one")).unwrap().name,
            "g"
        );
    }

    #[test]
    fn upsert_refuses_known_paths() {
        let mut tree = sample();
        assert!(!tree.upsert_leaf(leaf("/g/one/")));
        assert!(tree.upsert_leaf(leaf("/a/z")));
        assert_eq!(tree.flatten().len(), 5);
    }

    #[test]
    fn update_leaves_touches_nested_children() {
        let mut tree = sample();
        tree.update_leaves(|l| l.status.diff_count = 7);
        assert!(tree.flatten().iter().all(|l| l.status.diff_count == 7));
        assert!(tree.group(&group_id_of("/g")).is_some());
    }

    #[test]
    fn remove_by_paths_drops_emptied_groups() {
        let mut tree = sample();
        let removed = tree.remove_by_paths(&[
            PathBuf::from("/g/one"),
            PathBuf::from("/g/two/"),
            PathBuf::from("/nowhere"),
        ]);
        assert_eq!(removed, 2);
        assert_eq!(tree.len(), 2);
        assert!(tree.nodes().iter().all(|n| n.as_group().is_none()));
    }

    #[test]
    fn take_then_restore_in_reverse_is_exact() {
        let original = sample();
        let mut tree = original.clone();
        let mut taken = Vec::new();
        for path in ["/a/y", "/g/one", "/g/two", "/a/x"] {
            let id = identity_of(path);
            taken.push(tree.take_leaf(&id).unwrap());
        }
        assert!(tree.is_empty());
        for (leaf, origin) in taken.into_iter().rev() {
            assert!(tree.restore_leaf(leaf, origin));
        }
        assert_eq!(tree, original);
    }

    #[test]
    fn restore_refuses_duplicate_paths() {
        let mut tree = sample();
        let (taken, origin) = tree.take_leaf(&identity_of("/a/x")).unwrap();
        tree.upsert_leaf(leaf("/a/x"));
        assert!(!tree.restore_leaf(taken, origin));
        assert_eq!(tree.flatten().len(), 4);
    }

    #[test]
    fn heals_persisted_state() {
        let mut tagged = leaf("/a/x/");
        tagged.name = "Moving: x".into();
        tagged.id = format!("{TEMP_ID_PREFIX}op:0");
        let duplicate = leaf("/a/x");
        let legacy_group = GroupNode {
            id: "legacy".into(),
            name: "Grouping: tools".into(),
            path: PathBuf::new(),
            kind: GroupKind::Logical,
            children: vec![leaf("/w/one"), leaf("/w/two")],
            added_at: 3,
        };
        let empty_group = GroupNode::new(GroupKind::Physical, "/e", Vec::new(), 1);

        let tree = TreeStore::from_persisted(vec![
            RegistryNode::Leaf(tagged),
            RegistryNode::Leaf(duplicate),
            RegistryNode::Group(legacy_group),
            RegistryNode::Group(empty_group),
        ]);

        assert_eq!(tree.len(), 2);
        let x = tree.find_by_path("/a/x").unwrap();
        assert_eq!(x.name, "x");
        assert!(x.id_is_coherent());
        let group = tree.nodes()[1].as_group().unwrap();
        assert_eq!(group.name, "tools");
        assert_eq!(group.path, PathBuf::from("/w/tools"));
        assert_eq!(group.id, group_id_of("/w/tools"));
    }

    #[test]
    fn legacy_group_across_parents_uses_common_prefix() {
        let group = GroupNode {
            id: String::new(),
            name: "mixed".into(),
            path: PathBuf::new(),
            kind: GroupKind::Logical,
            children: vec![leaf("/w/a/one"), leaf("/w/b/two")],
            added_at: 0,
        };
        let tree = TreeStore::from_persisted(vec![RegistryNode::Group(group)]);
        assert_eq!(
            tree.nodes()[0].as_group().unwrap().path,
            PathBuf::from("/w/mixed")
        );
    }

    #[test]
    fn ordered_by_name_is_case_insensitive() {
        let mut tree = TreeStore::new();
        tree.upsert_leaf(leaf("/p/beta"));
        tree.upsert_leaf(leaf("/p/Alpha"));
        tree.upsert_leaf(leaf("/p/gamma"));
        let names: Vec<_> = tree
            .ordered(SortOrder::Name)
            .iter()
            .map(|n| n.plain_name().to_string())
            .collect();
        assert_eq!(names, vec!["Alpha", "beta", "gamma"]);
        assert_eq!(tree.ordered(SortOrder::Registry)[0].plain_name(), "beta");
    }

    #[test]
    fn shared_parent_requires_a_single_parent() {
        assert_eq!(
            shared_parent(&[leaf("/a/x"), leaf("/a/y")]),
            Some(PathBuf::from("/a"))
        );
        assert_eq!(shared_parent(&[leaf("/a/x"), leaf("/b/y")]), None);
        assert_eq!(shared_parent(&[]), None);
    }
}
