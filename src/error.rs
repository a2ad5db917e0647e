//! Error taxonomy for the swarming engine.
//!
//! Per-segment and per-candidate failures are absorbed by the segment manager and the
//! candidate pool and turned into state transitions. Only [`SwarmError`] ever reaches
//! the caller of a download.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;

/// Hash tree and hashing pipeline errors
#[derive(Debug, thiserror::Error)]
pub enum HashError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A fetched node disagrees with an already trusted part of the tree.
    #[error("Tree mismatch at level {level} index {index}")]
    TreeMismatch { level: usize, index: usize },

    #[error("Malformed tree data: {0}")]
    Malformed(String),

    #[error("Hash tree is incomplete")]
    Incomplete,

    #[error("Hash queue is closed")]
    QueueClosed,
}

impl HashError {
    pub fn is_tree_mismatch(&self) -> bool {
        matches!(self, HashError::TreeMismatch { .. })
    }
}

/// Errors surfaced by the range-fetch collaborator
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum TransferError {
    #[error("Connection refused: {0}")]
    ConnectionRefused(String),

    #[error("Timeout")]
    Timeout,

    #[error("Protocol error: {0}")]
    Protocol(String),
}

/// Errors surfaced by the tree-fetch collaborator
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum TreeFetchError {
    #[error("Tree data unavailable")]
    Unavailable,

    #[error("Protocol error: {0}")]
    Protocol(String),
}

/// Kind of failure attributed to a candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FailureKind {
    Timeout,
    ConnectionRefused,
    ProtocolError,
    HashMismatch,
    /// The candidate served tree nodes contradicting the trusted root.
    TreeMismatch,
}

impl FailureKind {
    /// Integrity violations discard data and escalate faster than transient errors.
    pub fn is_integrity_violation(&self) -> bool {
        matches!(self, FailureKind::HashMismatch | FailureKind::TreeMismatch)
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureKind::Timeout => "timeout",
            FailureKind::ConnectionRefused => "connection-refused",
            FailureKind::ProtocolError => "protocol-error",
            FailureKind::HashMismatch => "hash-mismatch",
            FailureKind::TreeMismatch => "tree-mismatch",
        };
        f.write_str(s)
    }
}

impl From<&TransferError> for FailureKind {
    fn from(err: &TransferError) -> Self {
        match err {
            TransferError::ConnectionRefused(_) => FailureKind::ConnectionRefused,
            TransferError::Timeout => FailureKind::Timeout,
            TransferError::Protocol(_) => FailureKind::ProtocolError,
        }
    }
}

impl From<&TreeFetchError> for FailureKind {
    fn from(_: &TreeFetchError) -> Self {
        FailureKind::ProtocolError
    }
}

/// Why a segment went back to `Unclaimed`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type", content = "detail")]
pub enum FailureReason {
    Candidate(FailureKind),
    /// Local write failed; not the candidate's fault.
    Io(String),
    /// Data could not be verified before the buffer limit was reached.
    TreeUnavailable,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Candidate(kind) => write!(f, "{}", kind),
            FailureReason::Io(msg) => write!(f, "io: {}", msg),
            FailureReason::TreeUnavailable => f.write_str("tree-unavailable"),
        }
    }
}

/// Returned to a segment worker when its bytes cannot be accepted
#[derive(Debug, thiserror::Error)]
pub enum SegmentFault {
    #[error("Download cancelled")]
    Cancelled,

    /// The segment was reassigned, failed or finished by someone else.
    #[error("Assignment for segment {0} is no longer current")]
    StaleAssignment(u64),

    #[error("Gap in received data: expected offset {expected}, got {got}")]
    Gap { expected: u64, got: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Hash error: {0}")]
    Hash(#[from] HashError),
}

/// Aggregate report when a download gives up
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureSummary {
    pub remaining: Vec<Range<u64>>,
    pub remaining_bytes: u64,
    pub last_errors: Vec<(String, FailureKind)>,
    pub known_candidates: usize,
}

impl fmt::Display for FailureSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} bytes in {} ranges remaining, {} candidates known",
            self.remaining_bytes,
            self.remaining.len(),
            self.known_candidates
        )?;
        if !self.last_errors.is_empty() {
            let errors: Vec<String> = self
                .last_errors
                .iter()
                .map(|(id, kind)| format!("{}={}", id, kind))
                .collect();
            write!(f, ", last errors: {}", errors.join(", "))?;
        }
        Ok(())
    }
}

/// Errors reported to the caller of a download
#[derive(Debug, thiserror::Error)]
pub enum SwarmError {
    #[error("Download already in progress: {0}")]
    AlreadyActive(String),

    #[error("Download not found: {0}")]
    NotFound(String),

    #[error("No eligible candidates left: {0}")]
    NoCandidates(FailureSummary),

    #[error("Whole-file verification failed: expected root {expected}, got {actual}")]
    FinalVerification { expected: String, actual: String },

    #[error("Download cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Hash error: {0}")]
    Hash(#[from] HashError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Publishing failed: {0}")]
    Publish(String),
}
