//! Identity of a file being downloaded and the hash tree it is checked against.

use crate::error::HashError;
use crate::thex::{HashTree, TigerHash, TreeNode};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard};
use tracing::debug;

/// Tree shared read-mostly between verification jobs; merges take the write lock.
pub type SharedTree = Arc<RwLock<HashTree>>;

/// Snapshot of a target's identity for events and progress
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetInfo {
    pub root: TigerHash,
    pub total_size: u64,
    pub block_size: u64,
    pub name: Option<String>,
}

/// The file being acquired
#[derive(Debug, Clone)]
pub struct DownloadTarget {
    root: TigerHash,
    total_size: u64,
    block_size: u64,
    name: Option<String>,
    tree: SharedTree,
}

impl DownloadTarget {
    /// Target whose tree is known only by its root.
    pub fn new(root: TigerHash, total_size: u64, block_size: u64) -> Self {
        let block_size = block_size.max(1);
        Self {
            root,
            total_size,
            block_size,
            name: None,
            tree: Arc::new(RwLock::new(HashTree::new_partial(
                total_size, block_size, root,
            ))),
        }
    }

    /// Target with a tree obtained up front (e.g. deserialized from a peer).
    pub fn with_tree(tree: HashTree) -> Self {
        Self {
            root: tree.root(),
            total_size: tree.file_size(),
            block_size: tree.block_size(),
            name: None,
            tree: Arc::new(RwLock::new(tree)),
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn root(&self) -> TigerHash {
        self.root
    }

    /// Key used for this target in pools and engines
    pub fn id(&self) -> String {
        self.root.to_base32()
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn tree(&self) -> &SharedTree {
        &self.tree
    }

    pub fn read_tree(&self) -> RwLockReadGuard<'_, HashTree> {
        self.tree.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fold fetched nodes into the shared tree. Returns how many nodes became trusted.
    pub fn merge_nodes(&self, nodes: &[TreeNode]) -> Result<usize, HashError> {
        let mut guard = self.tree.write().unwrap_or_else(PoisonError::into_inner);
        let before = guard.known_nodes();
        let merged = guard.merge(nodes)?;
        let gained = merged.known_nodes() - before;
        *guard = merged;
        debug!(target_root = %self.root, gained, "Merged tree nodes");
        Ok(gained)
    }

    pub fn info(&self) -> TargetInfo {
        TargetInfo {
            root: self.root,
            total_size: self.total_size,
            block_size: self.block_size,
            name: self.name.clone(),
        }
    }
}
