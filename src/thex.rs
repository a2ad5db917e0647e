//! Tiger Tree Hash (THEX) support
//!
//! A file is cut into fixed-size blocks. Every block is hashed as a leaf
//! (`Tiger(0x00 || block)`), pairs of nodes are combined (`Tiger(0x01 || left || right)`)
//! and an unpaired node at the end of a level is promoted unchanged, up to a single
//! root. The root identifies the file; the rest of the tree lets any aligned block be
//! checked on its own.
//!
//! A download starts with a tree that knows only its root. Nodes learned from peers are
//! folded in with [`HashTree::merge`], which only ever trusts a node once it chains to
//! the root. Leaves that are not trusted yet verify as [`VerifyResult::Indeterminate`],
//! never as valid.

use crate::error::HashError;
use data_encoding::BASE32_NOPAD;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashMap;
use std::fmt;
use std::io::Read;
use std::ops::Range;
use std::str::FromStr;
use tiger::{Digest, Tiger};

/// Tiger digest length in bytes
pub const HASH_LEN: usize = 24;

const LEAF_PREFIX: u8 = 0x00;
const NODE_PREFIX: u8 = 0x01;

/// URN prefix used when advertising a tree root
pub const TREE_URN_PREFIX: &str = "urn:tree:tiger/:";

/// Bytes per node in the compact node encoding: level, index, hash
const ENCODED_NODE_LEN: usize = 1 + 4 + HASH_LEN;

/// A 192-bit Tiger digest
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TigerHash(pub [u8; HASH_LEN]);

impl TigerHash {
    pub fn to_base32(&self) -> String {
        BASE32_NOPAD.encode(&self.0)
    }

    pub fn from_base32(encoded: &str) -> Option<Self> {
        let trimmed = encoded.trim().trim_end_matches('=').to_ascii_uppercase();
        let bytes = BASE32_NOPAD.decode(trimmed.as_bytes()).ok()?;
        if bytes.len() != HASH_LEN {
            return None;
        }
        let mut out = [0u8; HASH_LEN];
        out.copy_from_slice(&bytes);
        Some(Self(out))
    }

    pub fn to_urn(&self) -> String {
        format!("{}{}", TREE_URN_PREFIX, self.to_base32())
    }
}

impl fmt::Display for TigerHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base32())
    }
}

impl fmt::Debug for TigerHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TigerHash({})", self.to_base32())
    }
}

impl FromStr for TigerHash {
    type Err = HashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let encoded = match trimmed.get(..TREE_URN_PREFIX.len()) {
            Some(prefix) if prefix.eq_ignore_ascii_case(TREE_URN_PREFIX) => {
                &trimmed[TREE_URN_PREFIX.len()..]
            }
            _ => trimmed,
        };
        TigerHash::from_base32(encoded)
            .ok_or_else(|| HashError::Malformed(format!("invalid tiger hash: {}", s)))
    }
}

impl Serialize for TigerHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_base32())
    }
}

impl<'de> Deserialize<'de> for TigerHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

fn digest_to_hash(hasher: Tiger) -> TigerHash {
    let out = hasher.finalize();
    let mut bytes = [0u8; HASH_LEN];
    bytes.copy_from_slice(&out);
    TigerHash(bytes)
}

/// Hash of one block (the last block is hashed over its true length)
pub fn leaf_hash(block: &[u8]) -> TigerHash {
    let mut hasher = Tiger::new();
    hasher.update([LEAF_PREFIX]);
    hasher.update(block);
    digest_to_hash(hasher)
}

/// Hash of an internal node
pub fn inner_hash(left: &TigerHash, right: &TigerHash) -> TigerHash {
    let mut hasher = Tiger::new();
    hasher.update([NODE_PREFIX]);
    hasher.update(left.0);
    hasher.update(right.0);
    digest_to_hash(hasher)
}

/// Number of leaves for a file; the empty file still has one (empty) leaf.
pub fn leaf_count_for(file_size: u64, block_size: u64) -> usize {
    if file_size == 0 || block_size == 0 {
        return 1;
    }
    file_size.div_ceil(block_size) as usize
}

fn level_widths(leaf_count: usize) -> Vec<usize> {
    let mut widths = vec![leaf_count.max(1)];
    while let Some(&w) = widths.last() {
        if w <= 1 {
            break;
        }
        widths.push(w.div_ceil(2));
    }
    widths
}

fn next_level(level: &[TigerHash]) -> Vec<TigerHash> {
    level
        .chunks(2)
        .map(|pair| match pair {
            [left, right] => inner_hash(left, right),
            [single] => *single,
            _ => unreachable!("chunks(2) yields one or two items"),
        })
        .collect()
}

/// Root of a subtree given its leaves, using the same pairing as the full tree.
pub fn subtree_root(leaves: &[TigerHash]) -> Option<TigerHash> {
    if leaves.is_empty() {
        return None;
    }
    let mut level = leaves.to_vec();
    while level.len() > 1 {
        level = next_level(&level);
    }
    Some(level[0])
}

/// Outcome of checking a byte range against the tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum VerifyResult {
    Valid,
    Invalid,
    /// Not enough aligned data or not enough tree to decide; buffer and retry.
    Indeterminate,
}

/// A single tree node as exchanged with peers; level 0 is the leaf level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TreeNode {
    pub level: usize,
    pub index: usize,
    pub hash: TigerHash,
}

/// Encode nodes as `level (u8) | index (u32 BE) | hash (24 bytes)` records.
pub fn encode_nodes(nodes: &[TreeNode]) -> Vec<u8> {
    let mut out = Vec::with_capacity(nodes.len() * ENCODED_NODE_LEN);
    for node in nodes {
        out.push(node.level as u8);
        out.extend_from_slice(&(node.index as u32).to_be_bytes());
        out.extend_from_slice(&node.hash.0);
    }
    out
}

pub fn decode_nodes(bytes: &[u8]) -> Result<Vec<TreeNode>, HashError> {
    if bytes.len() % ENCODED_NODE_LEN != 0 {
        return Err(HashError::Malformed(format!(
            "node data length {} is not a multiple of {}",
            bytes.len(),
            ENCODED_NODE_LEN
        )));
    }
    Ok(bytes
        .chunks_exact(ENCODED_NODE_LEN)
        .map(|record| {
            let mut index = [0u8; 4];
            index.copy_from_slice(&record[1..5]);
            let mut hash = [0u8; HASH_LEN];
            hash.copy_from_slice(&record[5..]);
            TreeNode {
                level: record[0] as usize,
                index: u32::from_be_bytes(index) as usize,
                hash: TigerHash(hash),
            }
        })
        .collect())
}

/// Incremental tree construction over a byte stream
#[derive(Debug, Clone)]
pub struct TreeBuilder {
    block_size: u64,
    block: Vec<u8>,
    leaves: Vec<TigerHash>,
    total: u64,
}

impl TreeBuilder {
    pub fn new(block_size: u64) -> Self {
        Self {
            block_size: block_size.max(1),
            block: Vec::with_capacity(block_size.min(1 << 20) as usize),
            leaves: Vec::new(),
            total: 0,
        }
    }

    pub fn update(&mut self, mut data: &[u8]) {
        self.total += data.len() as u64;
        while !data.is_empty() {
            let room = self.block_size as usize - self.block.len();
            let take = room.min(data.len());
            self.block.extend_from_slice(&data[..take]);
            data = &data[take..];
            if self.block.len() as u64 == self.block_size {
                self.leaves.push(leaf_hash(&self.block));
                self.block.clear();
            }
        }
    }

    pub fn bytes_hashed(&self) -> u64 {
        self.total
    }

    pub fn finish(mut self) -> HashTree {
        if !self.block.is_empty() || self.leaves.is_empty() {
            self.leaves.push(leaf_hash(&self.block));
        }
        HashTree::from_leaves(self.total, self.block_size, self.leaves)
    }
}

/// Merkle tree over the blocks of one file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashTree {
    file_size: u64,
    block_size: u64,
    root: TigerHash,
    /// `levels[0]` holds the leaves, the last level holds only the root.
    /// Every `Some` node chains to the root.
    levels: Vec<Vec<Option<TigerHash>>>,
    /// Fetched nodes that could not be linked to a trusted parent yet
    pending: HashMap<(usize, usize), TigerHash>,
}

impl HashTree {
    /// Complete tree from already computed leaf hashes.
    pub fn from_leaves(file_size: u64, block_size: u64, mut leaves: Vec<TigerHash>) -> Self {
        if leaves.is_empty() {
            leaves.push(leaf_hash(&[]));
        }
        let mut levels = vec![leaves.iter().copied().map(Some).collect::<Vec<_>>()];
        let mut current = leaves;
        while current.len() > 1 {
            current = next_level(&current);
            levels.push(current.iter().copied().map(Some).collect());
        }
        Self {
            file_size,
            block_size,
            root: current[0],
            levels,
            pending: HashMap::new(),
        }
    }

    /// Read `reader` to the end and build the full tree.
    pub fn build_from_bytes<R: Read>(block_size: u64, mut reader: R) -> Result<Self, HashError> {
        let mut builder = TreeBuilder::new(block_size);
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(HashError::Io(e)),
            };
            builder.update(&buf[..n]);
        }
        Ok(builder.finish())
    }

    pub fn build_from_slice(block_size: u64, data: &[u8]) -> Self {
        let mut builder = TreeBuilder::new(block_size);
        builder.update(data);
        builder.finish()
    }

    /// Tree for a download in progress: only the root is trusted.
    pub fn new_partial(file_size: u64, block_size: u64, root: TigerHash) -> Self {
        let widths = level_widths(leaf_count_for(file_size, block_size));
        let mut levels: Vec<Vec<Option<TigerHash>>> =
            widths.iter().map(|&w| vec![None; w]).collect();
        if let Some(top) = levels.last_mut() {
            top[0] = Some(root);
        }
        let mut tree = Self {
            file_size,
            block_size: block_size.max(1),
            root,
            levels,
            pending: HashMap::new(),
        };
        // Promoted nodes equal their parent, so they are trusted from the start.
        let _ = tree.link_pending();
        tree
    }

    pub fn root(&self) -> TigerHash {
        self.root
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    pub fn leaf_count(&self) -> usize {
        self.levels[0].len()
    }

    /// Number of levels including leaves and root
    pub fn depth(&self) -> usize {
        self.levels.len()
    }

    pub fn is_complete(&self) -> bool {
        self.levels[0].iter().all(Option::is_some)
    }

    pub fn known_nodes(&self) -> usize {
        self.levels
            .iter()
            .map(|level| level.iter().filter(|n| n.is_some()).count())
            .sum()
    }

    pub fn known_leaves(&self) -> usize {
        self.levels[0].iter().filter(|n| n.is_some()).count()
    }

    pub fn leaf(&self, index: usize) -> Option<TigerHash> {
        self.levels[0].get(index).copied().flatten()
    }

    /// Byte range covered by a leaf
    pub fn leaf_range(&self, index: usize) -> Range<u64> {
        let start = (index as u64).saturating_mul(self.block_size).min(self.file_size);
        let end = start.saturating_add(self.block_size).min(self.file_size);
        start..end
    }

    fn leaves_overlapping(&self, range: &Range<u64>) -> Range<usize> {
        if range.start >= range.end {
            return 0..0;
        }
        let first = (range.start / self.block_size) as usize;
        let last = range.end.div_ceil(self.block_size) as usize;
        first.min(self.leaf_count())..last.min(self.leaf_count())
    }

    /// Whether every leaf overlapping `range` is trusted.
    pub fn covers(&self, range: Range<u64>) -> bool {
        self.leaves_overlapping(&range)
            .all(|idx| self.levels[0][idx].is_some())
    }

    /// Check `data` placed at `offset` against the tree.
    ///
    /// Blocks whose own leaf is unknown are checked against the lowest trusted
    /// ancestor when `data` covers every leaf under it.
    pub fn verify_range(&self, offset: u64, data: &[u8]) -> VerifyResult {
        if data.is_empty() || offset % self.block_size != 0 || offset >= self.file_size {
            return VerifyResult::Indeterminate;
        }
        let end = offset + data.len() as u64;
        if end > self.file_size {
            return VerifyResult::Indeterminate;
        }

        let first_leaf = (offset / self.block_size) as usize;
        let mut computed: HashMap<usize, TigerHash> = HashMap::new();
        let mut partial_tail = false;
        for (k, chunk) in data.chunks(self.block_size as usize).enumerate() {
            let idx = first_leaf + k;
            let expected_len = {
                let r = self.leaf_range(idx);
                (r.end - r.start) as usize
            };
            if chunk.len() < expected_len {
                partial_tail = true;
                break;
            }
            computed.insert(idx, leaf_hash(chunk));
        }

        let mut result = if partial_tail {
            VerifyResult::Indeterminate
        } else {
            VerifyResult::Valid
        };

        let mut leaves: Vec<usize> = computed.keys().copied().collect();
        leaves.sort_unstable();
        let mut ancestors: HashMap<(usize, usize), VerifyResult> = HashMap::new();
        for idx in leaves {
            match self.levels[0][idx] {
                Some(expected) => {
                    if computed[&idx] != expected {
                        return VerifyResult::Invalid;
                    }
                }
                None => match self.check_against_ancestor(idx, &computed, &mut ancestors) {
                    VerifyResult::Invalid => return VerifyResult::Invalid,
                    VerifyResult::Indeterminate => result = VerifyResult::Indeterminate,
                    VerifyResult::Valid => {}
                },
            }
        }
        result
    }

    fn check_against_ancestor(
        &self,
        leaf: usize,
        computed: &HashMap<usize, TigerHash>,
        checked: &mut HashMap<(usize, usize), VerifyResult>,
    ) -> VerifyResult {
        let mut level = 0;
        let mut index = leaf;
        let ancestor = loop {
            if level + 1 >= self.levels.len() {
                break None;
            }
            level += 1;
            index /= 2;
            if let Some(hash) = self.levels[level][index] {
                break Some(hash);
            }
        };
        let Some(expected) = ancestor else {
            return VerifyResult::Indeterminate;
        };
        if let Some(result) = checked.get(&(level, index)) {
            return *result;
        }

        let span_start = index << level;
        let span_end = ((index + 1) << level).min(self.leaf_count());
        let span: Option<Vec<TigerHash>> = (span_start..span_end)
            .map(|idx| computed.get(&idx).copied().or(self.levels[0][idx]))
            .collect();
        let result = match span.as_deref().and_then(subtree_root) {
            Some(root) if root == expected => VerifyResult::Valid,
            Some(_) => VerifyResult::Invalid,
            None => VerifyResult::Indeterminate,
        };
        checked.insert((level, index), result);
        result
    }

    /// Fold fetched nodes into a copy of this tree.
    ///
    /// Trusted nodes are never replaced. A fetched node that contradicts a trusted
    /// node, or a fetched pair that does not combine to its trusted parent, fails the
    /// whole merge with [`HashError::TreeMismatch`] and leaves `self` untouched.
    ///
    /// Nodes left pending by earlier merges are unverified. When they conflict with
    /// this batch they are dropped and the batch is linked on its own, so a mismatch
    /// is only ever reported against the nodes passed in here.
    pub fn merge(&self, fetched: &[TreeNode]) -> Result<HashTree, HashError> {
        let mut batch = HashMap::new();
        for node in fetched {
            let width = self
                .levels
                .get(node.level)
                .map(Vec::len)
                .ok_or_else(|| HashError::Malformed(format!("no tree level {}", node.level)))?;
            if node.index >= width {
                return Err(HashError::Malformed(format!(
                    "index {} out of range for level {} (width {})",
                    node.index, node.level, width
                )));
            }
            match self.levels[node.level][node.index] {
                Some(trusted) if trusted != node.hash => {
                    return Err(HashError::TreeMismatch {
                        level: node.level,
                        index: node.index,
                    });
                }
                Some(_) => {}
                None => {
                    batch.insert((node.level, node.index), node.hash);
                }
            }
        }

        let mut combined = self.clone();
        combined.pending.extend(batch.clone());
        match combined.link_pending() {
            Ok(()) => Ok(combined),
            Err(e) if e.is_tree_mismatch() && !self.pending.is_empty() => {
                let mut fresh = self.clone();
                fresh.pending = batch;
                fresh.link_pending()?;
                Ok(fresh)
            }
            Err(e) => Err(e),
        }
    }

    /// Move pending nodes into the trusted levels wherever they chain to a trusted
    /// parent, top-down so one pass links whole paths.
    fn link_pending(&mut self) -> Result<(), HashError> {
        for level in (1..self.levels.len()).rev() {
            let child_level = level - 1;
            let child_width = self.levels[child_level].len();
            for index in 0..self.levels[level].len() {
                let Some(parent) = self.levels[level][index] else {
                    continue;
                };
                let left_idx = index * 2;
                let right_idx = left_idx + 1;

                if right_idx >= child_width {
                    // promoted node
                    let left = self.child(child_level, left_idx);
                    if let Some(hash) = left {
                        if hash != parent {
                            return Err(HashError::TreeMismatch {
                                level: child_level,
                                index: left_idx,
                            });
                        }
                    }
                    self.trust(child_level, left_idx, parent);
                    continue;
                }

                if self.levels[child_level][left_idx].is_some()
                    && self.levels[child_level][right_idx].is_some()
                {
                    continue;
                }
                let (Some(left), Some(right)) = (
                    self.child(child_level, left_idx),
                    self.child(child_level, right_idx),
                ) else {
                    continue;
                };
                if inner_hash(&left, &right) != parent {
                    let culprit = if self.levels[child_level][left_idx].is_none() {
                        left_idx
                    } else {
                        right_idx
                    };
                    return Err(HashError::TreeMismatch {
                        level: child_level,
                        index: culprit,
                    });
                }
                self.trust(child_level, left_idx, left);
                self.trust(child_level, right_idx, right);
            }
        }
        Ok(())
    }

    fn child(&self, level: usize, index: usize) -> Option<TigerHash> {
        self.levels[level][index].or_else(|| self.pending.get(&(level, index)).copied())
    }

    fn trust(&mut self, level: usize, index: usize, hash: TigerHash) {
        self.pending.remove(&(level, index));
        self.levels[level][index] = Some(hash);
    }

    /// Trusted nodes from the root down `max_depth` levels (0 = root only).
    pub fn nodes(&self, max_depth: usize) -> Vec<TreeNode> {
        let top = self.levels.len() - 1;
        let lowest = top.saturating_sub(max_depth);
        let mut out = Vec::new();
        for level in (lowest..=top).rev() {
            for (index, hash) in self.levels[level].iter().enumerate() {
                if let Some(hash) = hash {
                    out.push(TreeNode {
                        level,
                        index,
                        hash: *hash,
                    });
                }
            }
        }
        out
    }

    /// THEX breadth-first serialization: root first, leaves last.
    pub fn serialize(&self) -> Result<Vec<u8>, HashError> {
        if !self.is_complete() {
            return Err(HashError::Incomplete);
        }
        let total: usize = self.levels.iter().map(Vec::len).sum();
        let mut out = Vec::with_capacity(total * HASH_LEN);
        for level in self.levels.iter().rev() {
            for node in level.iter().flatten() {
                out.extend_from_slice(&node.0);
            }
        }
        Ok(out)
    }

    /// Parse a breadth-first serialization and check every node against the
    /// leaves and the expected root.
    pub fn deserialize(
        bytes: &[u8],
        file_size: u64,
        block_size: u64,
        expected_root: TigerHash,
    ) -> Result<HashTree, HashError> {
        let widths = level_widths(leaf_count_for(file_size, block_size));
        let total: usize = widths.iter().sum();
        if bytes.len() != total * HASH_LEN {
            return Err(HashError::Malformed(format!(
                "expected {} bytes of tree data, got {}",
                total * HASH_LEN,
                bytes.len()
            )));
        }

        let mut parsed: Vec<Vec<TigerHash>> = Vec::with_capacity(widths.len());
        let mut cursor = 0;
        for &width in widths.iter().rev() {
            let level = bytes[cursor..cursor + width * HASH_LEN]
                .chunks_exact(HASH_LEN)
                .map(|c| {
                    let mut h = [0u8; HASH_LEN];
                    h.copy_from_slice(c);
                    TigerHash(h)
                })
                .collect();
            parsed.push(level);
            cursor += width * HASH_LEN;
        }
        parsed.reverse();

        let top = parsed.len() - 1;
        if parsed[top][0] != expected_root {
            return Err(HashError::TreeMismatch {
                level: top,
                index: 0,
            });
        }

        let tree = HashTree::from_leaves(file_size, block_size.max(1), parsed[0].clone());
        for (level, nodes) in parsed.iter().enumerate() {
            for (index, hash) in nodes.iter().enumerate() {
                if tree.levels[level][index] != Some(*hash) {
                    return Err(HashError::TreeMismatch { level, index });
                }
            }
        }
        Ok(tree)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    #[test]
    fn empty_file_has_single_empty_leaf() {
        let tree = HashTree::build_from_slice(1024, &[]);
        assert_eq!(tree.leaf_count(), 1);
        assert_eq!(tree.root(), leaf_hash(&[]));
    }

    #[test]
    fn odd_leaf_is_promoted() {
        let data = sample(3 * 1024);
        let tree = HashTree::build_from_slice(1024, &data);
        let l0 = leaf_hash(&data[..1024]);
        let l1 = leaf_hash(&data[1024..2048]);
        let l2 = leaf_hash(&data[2048..]);
        assert_eq!(tree.root(), inner_hash(&inner_hash(&l0, &l1), &l2));
        assert_eq!(tree.depth(), 3);
    }

    #[test]
    fn last_block_hashed_over_true_length() {
        let data = sample(2500);
        let tree = HashTree::build_from_slice(1000, &data);
        assert_eq!(tree.leaf_count(), 3);
        assert_eq!(tree.leaf(2), Some(leaf_hash(&data[2000..])));
        assert_eq!(tree.leaf_range(2), 2000..2500);
    }

    #[test]
    fn reader_and_slice_agree() {
        let data = sample(10_000);
        let a = HashTree::build_from_bytes(1000, &data[..]).unwrap();
        let b = HashTree::build_from_slice(1000, &data);
        assert_eq!(a.root(), b.root());
    }

    #[test]
    fn unaligned_offset_is_indeterminate() {
        let data = sample(4000);
        let tree = HashTree::build_from_slice(1000, &data);
        assert_eq!(
            tree.verify_range(500, &data[500..1500]),
            VerifyResult::Indeterminate
        );
    }

    #[test]
    fn partial_trailing_block_is_indeterminate() {
        let data = sample(4000);
        let tree = HashTree::build_from_slice(1000, &data);
        assert_eq!(
            tree.verify_range(1000, &data[1000..2500]),
            VerifyResult::Indeterminate
        );
    }

    #[test]
    fn invalid_wins_over_indeterminate() {
        let mut data = sample(4000);
        let tree = HashTree::build_from_slice(1000, &data);
        data[1200] ^= 0xff;
        assert_eq!(
            tree.verify_range(1000, &data[1000..2500]),
            VerifyResult::Invalid
        );
    }

    #[test]
    fn root_only_tree_verifies_whole_file() {
        let data = sample(5000);
        let full = HashTree::build_from_slice(1000, &data);
        let partial = HashTree::new_partial(5000, 1000, full.root());

        assert_eq!(
            partial.verify_range(0, &data[..1000]),
            VerifyResult::Indeterminate
        );
        assert_eq!(partial.verify_range(0, &data), VerifyResult::Valid);

        let mut bad = data.clone();
        bad[4999] ^= 1;
        assert_eq!(partial.verify_range(0, &bad), VerifyResult::Invalid);
    }

    #[test]
    fn merge_learns_leaves_and_keeps_self() {
        let data = sample(8000);
        let full = HashTree::build_from_slice(1000, &data);
        let partial = HashTree::new_partial(8000, 1000, full.root());

        let merged = partial.merge(&full.nodes(full.depth())).unwrap();
        assert!(merged.is_complete());
        assert_eq!(partial.known_leaves(), 0);
        assert_eq!(merged.verify_range(3000, &data[3000..4000]), VerifyResult::Valid);
    }

    #[test]
    fn merge_keeps_unlinked_nodes_pending() {
        let data = sample(8000);
        let full = HashTree::build_from_slice(1000, &data);
        let partial = HashTree::new_partial(8000, 1000, full.root());

        let leaves: Vec<TreeNode> = full
            .nodes(full.depth())
            .into_iter()
            .filter(|n| n.level == 0)
            .collect();
        let step = partial.merge(&leaves).unwrap();
        assert_eq!(step.known_leaves(), 0);

        let upper: Vec<TreeNode> = full
            .nodes(full.depth())
            .into_iter()
            .filter(|n| n.level > 0)
            .collect();
        let done = step.merge(&upper).unwrap();
        assert!(done.is_complete());
    }

    #[test]
    fn stale_forged_leaves_do_not_block_honest_levels() {
        let data = sample(8000);
        let full = HashTree::build_from_slice(1000, &data);
        let partial = HashTree::new_partial(8000, 1000, full.root());

        let forged: Vec<TreeNode> = (0..8)
            .map(|index| TreeNode {
                level: 0,
                index,
                hash: leaf_hash(format!("forged {}", index).as_bytes()),
            })
            .collect();
        let poisoned = partial.merge(&forged).unwrap();
        assert_eq!(poisoned.known_leaves(), 0);

        let upper: Vec<TreeNode> = full
            .nodes(full.depth())
            .into_iter()
            .filter(|n| n.level > 0)
            .collect();
        let step = poisoned.merge(&upper).unwrap();
        assert_eq!(step.known_leaves(), 0);
        assert_eq!(step.known_nodes(), full.known_nodes() - 8);
        assert_eq!(step.verify_range(0, &data[..2000]), VerifyResult::Valid);

        let done = step.merge(&full.nodes(full.depth())).unwrap();
        assert!(done.is_complete());
    }

    #[test]
    fn conflict_within_one_batch_is_still_reported() {
        let data = sample(8000);
        let full = HashTree::build_from_slice(1000, &data);
        let partial = HashTree::new_partial(8000, 1000, full.root());

        let leaves: Vec<TreeNode> = full
            .nodes(full.depth())
            .into_iter()
            .filter(|n| n.level == 0)
            .collect();
        let step = partial.merge(&leaves).unwrap();

        let mut upper: Vec<TreeNode> = full
            .nodes(full.depth())
            .into_iter()
            .filter(|n| n.level > 0)
            .collect();
        let last = upper.len() - 1;
        upper[last].hash = leaf_hash(b"forged");
        assert!(step.merge(&upper).unwrap_err().is_tree_mismatch());
    }

    #[test]
    fn merge_rejects_conflicting_nodes() {
        let data = sample(4000);
        let full = HashTree::build_from_slice(1000, &data);
        let partial = HashTree::new_partial(4000, 1000, full.root());

        let mut nodes = full.nodes(1);
        nodes[1].hash = leaf_hash(b"forged");
        let err = partial.merge(&nodes).unwrap_err();
        assert!(err.is_tree_mismatch());
        assert_eq!(partial.known_nodes(), 1);
    }

    #[test]
    fn serialization_round_trip_checks_root() {
        let data = sample(7000);
        let tree = HashTree::build_from_slice(1000, &data);
        let bytes = tree.serialize().unwrap();

        let back = HashTree::deserialize(&bytes, 7000, 1000, tree.root()).unwrap();
        assert_eq!(back, tree);

        let other = leaf_hash(b"other");
        assert!(HashTree::deserialize(&bytes, 7000, 1000, other)
            .unwrap_err()
            .is_tree_mismatch());
        assert!(matches!(
            HashTree::deserialize(&bytes[1..], 7000, 1000, tree.root()),
            Err(HashError::Malformed(_))
        ));
    }

    #[test]
    fn partial_tree_cannot_serialize() {
        let partial = HashTree::new_partial(4000, 1000, leaf_hash(b"x"));
        assert!(matches!(partial.serialize(), Err(HashError::Incomplete)));
    }

    #[test]
    fn node_encoding_round_trip() {
        let tree = HashTree::build_from_slice(1000, &sample(3000));
        let nodes = tree.nodes(tree.depth());
        let decoded = decode_nodes(&encode_nodes(&nodes)).unwrap();
        assert_eq!(decoded, nodes);
        assert!(decode_nodes(&[1, 2, 3]).is_err());
    }

    #[test]
    fn hash_parses_from_urn_and_base32() {
        let hash = leaf_hash(b"abc");
        let urn = hash.to_urn();
        assert_eq!(urn.parse::<TigerHash>().unwrap(), hash);
        assert_eq!(hash.to_base32().parse::<TigerHash>().unwrap(), hash);
        assert_eq!(hash.to_base32().len(), 39);
        assert!("not-a-hash".parse::<TigerHash>().is_err());
    }
}
