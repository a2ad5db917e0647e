//! Hash trees for files we share.
//!
//! Trees are computed on the hashing queue's sharing lane and cached per path until
//! the file's modification time changes. Published files are indexed by root so tree
//! metadata requests from other peers can be answered.

use crate::error::SwarmError;
use crate::hash_queue::{HashCalculationQueue, TreeSource};
use crate::thex::{encode_nodes, HashTree, TigerHash};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::SystemTime;
use tracing::{debug, info};

/// Announces a shared file's root to the rest of the network
#[async_trait]
pub trait RootPublisher: Send + Sync {
    async fn publish_root_hash(
        &self,
        path: &Path,
        root: &TigerHash,
        sha1_urn: &str,
    ) -> Result<(), SwarmError>;
}

/// A hashed local file
#[derive(Debug, Clone)]
pub struct SharedFile {
    pub path: PathBuf,
    pub size: u64,
    pub modified: Option<SystemTime>,
    pub tree: HashTree,
    pub sha1_urn: String,
}

impl SharedFile {
    pub fn root(&self) -> TigerHash {
        self.tree.root()
    }
}

#[derive(Default)]
struct Index {
    by_path: HashMap<PathBuf, Arc<SharedFile>>,
    by_root: HashMap<TigerHash, Arc<SharedFile>>,
}

pub struct SharingService {
    queue: HashCalculationQueue,
    block_size: u64,
    publisher: Option<Arc<dyn RootPublisher>>,
    index: Mutex<Index>,
}

impl SharingService {
    pub fn new(
        queue: HashCalculationQueue,
        block_size: u64,
        publisher: Option<Arc<dyn RootPublisher>>,
    ) -> Self {
        Self {
            queue,
            block_size: block_size.max(1),
            publisher,
            index: Mutex::new(Index::default()),
        }
    }

    fn index(&self) -> MutexGuard<'_, Index> {
        self.index.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Tree and SHA-1 URN of `path`, computed once per modification.
    pub async fn hash_tree_for(&self, path: &Path) -> Result<Arc<SharedFile>, SwarmError> {
        let metadata = tokio::fs::metadata(path).await?;
        let modified = metadata.modified().ok();
        if let Some(cached) = self.index().by_path.get(path) {
            if cached.modified == modified && cached.size == metadata.len() {
                debug!(path = %path.display(), "Using cached hash tree");
                return Ok(cached.clone());
            }
        }

        let digest = self
            .queue
            .compute_tree(TreeSource::File(path.to_path_buf()), self.block_size)
            .await?;
        let shared = Arc::new(SharedFile {
            path: path.to_path_buf(),
            size: digest.size,
            modified,
            tree: digest.tree,
            sha1_urn: digest.sha1_urn,
        });
        self.index()
            .by_path
            .insert(path.to_path_buf(), shared.clone());
        Ok(shared)
    }

    /// Announce `root` for `path` and make the file's tree servable.
    pub async fn publish_root_hash(&self, path: &Path, root: TigerHash) -> Result<(), SwarmError> {
        let shared = self.hash_tree_for(path).await?;
        if shared.root() != root {
            return Err(SwarmError::Publish(format!(
                "{} hashes to {}, not {}",
                path.display(),
                shared.root(),
                root
            )));
        }
        if let Some(publisher) = &self.publisher {
            publisher
                .publish_root_hash(path, &root, &shared.sha1_urn)
                .await?;
        }
        self.index().by_root.insert(root, shared);
        info!(path = %path.display(), root = %root, "Published root hash");
        Ok(())
    }

    pub fn shared_file(&self, root: &TigerHash) -> Option<Arc<SharedFile>> {
        self.index().by_root.get(root).cloned()
    }

    /// Encoded tree nodes down to `max_depth` for a published root.
    pub fn tree_nodes_for(&self, root: &TigerHash, max_depth: usize) -> Option<Vec<u8>> {
        let shared = self.shared_file(root)?;
        Some(encode_nodes(&shared.tree.nodes(max_depth)))
    }

    /// Full serialized tree for a published root.
    pub fn serialized_tree_for(&self, root: &TigerHash) -> Option<Vec<u8>> {
        self.shared_file(root)?.tree.serialize().ok()
    }
}
