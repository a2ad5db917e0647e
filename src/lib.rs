//! Swarming download engine with Tiger tree verification.
//!
//! A target file, identified by its tree root, is fetched as disjoint segments from
//! many candidates at once. Every byte is checked against the hash tree before it is
//! written; corrupt ranges are re-sourced and the sources that served them are cooled
//! down or banned.

pub mod candidate;
pub mod candidate_pool;
pub mod config;
pub mod download;
pub mod error;
pub mod hash_queue;
pub mod logging;
pub mod security;
pub mod segment;
pub mod segment_manager;
pub mod sharing;
pub mod target;
pub mod thex;
pub mod transport;
pub mod worker;

pub use candidate::{Candidate, CapabilitySet};
pub use candidate_pool::{CandidatePool, FailureOutcome};
pub use config::SwarmConfig;
pub use download::{DownloadEngine, SwarmDownload, SwarmEvent};
pub use error::{FailureKind, SwarmError};
pub use hash_queue::HashCalculationQueue;
pub use segment_manager::{DownloadProgress, SegmentManager};
pub use target::DownloadTarget;
pub use thex::{HashTree, TigerHash, VerifyResult};
