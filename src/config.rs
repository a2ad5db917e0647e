//! Tunable parameters for downloads, candidate handling and hashing.
//!
//! All thresholds are plain values so they can be loaded from a JSON file and
//! overridden per node. Durations are stored in milliseconds, like the rest of the
//! transfer code.

use crate::error::SwarmError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

/// Default leaf block size (64 KiB)
pub const DEFAULT_BLOCK_SIZE: u64 = 64 * 1024;

/// Default maximum parallel workers per download
pub const DEFAULT_MAX_WORKERS_PER_DOWNLOAD: usize = 12;

/// Default size of the first segment requested from a candidate with unknown speed
pub const DEFAULT_INITIAL_SEGMENT_SIZE: u64 = 16 * 1024;

/// Default maximum segment size (10 MiB)
pub const DEFAULT_MAX_SEGMENT_SIZE: u64 = 10 * 1024 * 1024;

/// Consecutive failures after which a candidate is ranked as bad
pub const DEFAULT_BAD_CANDIDATE_FAILURES: u32 = 3;

/// Consecutive failures after which a candidate is dropped for the target
pub const DEFAULT_MAX_CONSECUTIVE_FAILURES: u32 = 12;

/// Download scheduling and segment sizing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DownloadConfig {
    /// Leaf block size used for hashing; segment boundaries are multiples of it
    pub block_size: u64,
    pub max_workers_per_download: usize,
    /// Segment size for a candidate whose transfer rate is not known yet
    pub initial_segment_size: u64,
    /// Segments are sized so a candidate finishes one in roughly this time
    pub segment_target_time_secs: u64,
    pub max_segment_size: u64,
    /// Smallest piece segment stealing will leave on either side of a split
    pub min_split_size: u64,
    /// An idle candidate must be this many times faster to steal a segment tail
    pub steal_speed_ratio: f64,
    /// Unverifiable bytes buffered per segment before it is given up
    pub max_unverified_buffer: usize,
    /// Pause for a candidate whose data could not be verified yet; not a failure
    pub unverifiable_retry_ms: u64,
    /// How long a download may sit without any eligible candidate before failing
    pub no_candidate_grace_ms: u64,
    /// Per range request timeout handed to the transport
    pub request_timeout_ms: u64,
    /// Stall timeout between two chunks of one response
    pub read_timeout_ms: u64,
    /// Scheduling loop wake-up interval when nothing is signalled
    pub poll_interval_ms: u64,
    /// Cut the whole file into block-sized segments at start instead of one segment
    pub presplit: bool,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            max_workers_per_download: DEFAULT_MAX_WORKERS_PER_DOWNLOAD,
            initial_segment_size: DEFAULT_INITIAL_SEGMENT_SIZE,
            segment_target_time_secs: 90,
            max_segment_size: DEFAULT_MAX_SEGMENT_SIZE,
            min_split_size: 64 * 1024,
            steal_speed_ratio: 2.0,
            max_unverified_buffer: 256 * 1024,
            unverifiable_retry_ms: 10_000,
            no_candidate_grace_ms: 5 * 60 * 1000,
            request_timeout_ms: 30_000,
            read_timeout_ms: 60_000,
            poll_interval_ms: 1_000,
            presplit: false,
        }
    }
}

impl DownloadConfig {
    pub fn no_candidate_grace(&self) -> Duration {
        Duration::from_millis(self.no_candidate_grace_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn unverifiable_retry(&self) -> Duration {
        Duration::from_millis(self.unverifiable_retry_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Candidate ranking, cool-down and removal thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CandidateConfig {
    pub bad_candidate_failures: u32,
    pub max_consecutive_failures: u32,
    /// Hash mismatches tolerated before the candidate is removed and banned
    pub max_hash_mismatches: u32,
    /// Cool-down step per consecutive refused connection
    pub connection_failed_step_ms: u64,
    /// Cool-down step per consecutive timeout
    pub timeout_step_ms: u64,
    /// Cool-down step per consecutive protocol error
    pub protocol_step_ms: u64,
    /// Upper bound for cumulative transient cool-downs
    pub max_cooldown_ms: u64,
    /// Cool-down applied immediately on a verified hash mismatch
    pub hash_mismatch_cooldown_ms: u64,
    pub ban_duration_ms: u64,
    /// Entries kept in each candidate's event log (0 disables the log)
    pub candidate_log_size: usize,
    /// Random extension of cool-downs (0.0 to 1.0) so sources do not retry in lockstep
    pub jitter_factor: f64,
    /// How long the ban batch worker parks on an empty queue before releasing itself
    pub ban_batch_idle_ms: u64,
}

impl Default for CandidateConfig {
    fn default() -> Self {
        Self {
            bad_candidate_failures: DEFAULT_BAD_CANDIDATE_FAILURES,
            max_consecutive_failures: DEFAULT_MAX_CONSECUTIVE_FAILURES,
            max_hash_mismatches: 2,
            connection_failed_step_ms: 2 * 60 * 1000,
            timeout_step_ms: 60 * 1000,
            protocol_step_ms: 60 * 1000,
            max_cooldown_ms: 30 * 60 * 1000,
            hash_mismatch_cooldown_ms: 3 * 60 * 60 * 1000,
            ban_duration_ms: 3 * 60 * 60 * 1000,
            candidate_log_size: 16,
            jitter_factor: 0.1,
            ban_batch_idle_ms: 30_000,
        }
    }
}

impl CandidateConfig {
    pub fn hash_mismatch_cooldown(&self) -> Duration {
        Duration::from_millis(self.hash_mismatch_cooldown_ms)
    }

    pub fn ban_duration(&self) -> Duration {
        Duration::from_millis(self.ban_duration_ms)
    }

    pub fn ban_batch_idle(&self) -> Duration {
        Duration::from_millis(self.ban_batch_idle_ms)
    }
}

/// Hash calculation queue sizing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HashQueueConfig {
    /// Jobs admitted at once; further submissions wait for a slot
    pub capacity: usize,
    /// Parallel verification workers; tree computation always runs on one
    pub verify_workers: usize,
    /// Idle time after which a worker is released
    pub idle_timeout_ms: u64,
    pub read_buffer_size: usize,
    /// Sleep `elapsed * factor` after every read while computing a tree (0 = off)
    pub throttle_factor: f64,
}

impl Default for HashQueueConfig {
    fn default() -> Self {
        Self {
            capacity: 64,
            verify_workers: 2,
            idle_timeout_ms: 30_000,
            read_buffer_size: 64 * 1024,
            throttle_factor: 0.0,
        }
    }
}

impl HashQueueConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

/// Complete engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, bon::Builder)]
#[serde(rename_all = "camelCase", default)]
pub struct SwarmConfig {
    #[builder(default)]
    pub download: DownloadConfig,
    #[builder(default)]
    pub candidates: CandidateConfig,
    #[builder(default)]
    pub hashing: HashQueueConfig,
}

impl SwarmConfig {
    /// Load configuration from a JSON file; missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self, SwarmError> {
        let content = std::fs::read_to_string(path)?;
        let config: SwarmConfig = serde_json::from_str(&content)
            .map_err(|e| SwarmError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        info!(path = %path.display(), "Loaded swarm configuration");
        debug!("Swarm configuration: {:?}", config);
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), SwarmError> {
        let d = &self.download;
        if d.block_size == 0 {
            return Err(SwarmError::Config("blockSize must be positive".to_string()));
        }
        if d.max_workers_per_download == 0 {
            return Err(SwarmError::Config(
                "maxWorkersPerDownload must be positive".to_string(),
            ));
        }
        if d.max_segment_size < d.block_size {
            return Err(SwarmError::Config(
                "maxSegmentSize must be at least one block".to_string(),
            ));
        }
        if !(d.steal_speed_ratio > 1.0) {
            return Err(SwarmError::Config(
                "stealSpeedRatio must be greater than 1".to_string(),
            ));
        }
        if self.hashing.capacity == 0 || self.hashing.verify_workers == 0 {
            return Err(SwarmError::Config(
                "hash queue capacity and workers must be positive".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.candidates.jitter_factor) {
            return Err(SwarmError::Config(
                "jitterFactor must be within 0.0..=1.0".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        assert!(SwarmConfig::default().validate().is_ok());
    }

    #[test]
    fn load_fills_missing_fields() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"download": {{"blockSize": 1024}}}}"#).unwrap();

        let config = SwarmConfig::load(file.path()).unwrap();
        assert_eq!(config.download.block_size, 1024);
        assert_eq!(
            config.download.max_workers_per_download,
            DEFAULT_MAX_WORKERS_PER_DOWNLOAD
        );
        assert_eq!(config.candidates.max_hash_mismatches, 2);
    }

    #[test]
    fn rejects_zero_block_size() {
        let config = SwarmConfig::builder()
            .download(DownloadConfig {
                block_size: 0,
                ..Default::default()
            })
            .build();
        assert!(matches!(config.validate(), Err(SwarmError::Config(_))));
    }
}
