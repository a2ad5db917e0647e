//! Scheduling loop of a swarm download and the engine running several of them.

use crate::candidate::Candidate;
use crate::candidate_pool::{CandidatePool, FailureOutcome};
use crate::config::{DownloadConfig, SwarmConfig};
use crate::error::{FailureKind, FailureReason, SwarmError};
use crate::hash_queue::HashCalculationQueue;
use crate::security::AccessControl;
use crate::segment_manager::{DownloadProgress, SegmentManager};
use crate::target::DownloadTarget;
use crate::transport::{DataSink, RangeFetcher, TreeFetcher};
use crate::worker::{SegmentWorker, WorkerOutcome};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

/// Notifications about downloads
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum SwarmEvent {
    DownloadStarted {
        target_id: String,
        total_size: u64,
        candidates: usize,
    },
    SegmentCompleted {
        target_id: String,
        start: u64,
        end: u64,
        candidate: String,
    },
    SegmentFailed {
        target_id: String,
        start: u64,
        end: u64,
        reason: FailureReason,
    },
    CandidatePenalized {
        target_id: String,
        candidate: String,
        kind: FailureKind,
        outcome: FailureOutcome,
    },
    ProgressUpdate {
        progress: DownloadProgress,
    },
    DownloadCompleted {
        target_id: String,
        root: String,
        duration_secs: u64,
    },
    DownloadFailed {
        target_id: String,
        error: String,
    },
    DownloadCancelled {
        target_id: String,
    },
}

/// Drives one target to completion
pub struct SwarmDownload {
    manager: Arc<SegmentManager>,
    fetcher: Arc<dyn RangeFetcher>,
    trees: Option<Arc<dyn TreeFetcher>>,
    events: Option<mpsc::UnboundedSender<SwarmEvent>>,
}

impl SwarmDownload {
    pub fn new(
        manager: Arc<SegmentManager>,
        fetcher: Arc<dyn RangeFetcher>,
        trees: Option<Arc<dyn TreeFetcher>>,
    ) -> Self {
        Self {
            manager,
            fetcher,
            trees,
            events: None,
        }
    }

    pub fn with_events(mut self, events: mpsc::UnboundedSender<SwarmEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn manager(&self) -> &Arc<SegmentManager> {
        &self.manager
    }

    fn emit(&self, event: SwarmEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }

    /// Run until the file is complete and verified, the download is cancelled, or no
    /// candidate has been usable for the grace period. Candidates of the target are
    /// dropped from the pool on every exit.
    pub async fn run(self) -> Result<DownloadProgress, SwarmError> {
        let target_id = self.manager.target_id().to_string();
        let started = Instant::now();
        let result = self.schedule().await;
        let removed = self.manager.pool().remove_target(&target_id);
        debug!(target_id = %target_id, removed, "Released candidates of finished download");

        match &result {
            Ok(_) => {
                let root = self.manager.target().root().to_urn();
                info!(target_id = %target_id, root = %root, "Download completed");
                self.emit(SwarmEvent::DownloadCompleted {
                    target_id,
                    root,
                    duration_secs: started.elapsed().as_secs(),
                });
            }
            Err(SwarmError::Cancelled) => {
                self.emit(SwarmEvent::DownloadCancelled { target_id });
            }
            Err(e) => {
                error!(target_id = %target_id, "Download failed: {}", e);
                self.emit(SwarmEvent::DownloadFailed {
                    target_id,
                    error: e.to_string(),
                });
            }
        }
        result
    }

    async fn schedule(&self) -> Result<DownloadProgress, SwarmError> {
        let config: DownloadConfig = self.manager.config().clone();
        let notify = self.manager.notifier();
        let mut workers: JoinSet<WorkerOutcome> = JoinSet::new();
        let mut starved_since: Option<Instant> = None;

        loop {
            if self.manager.is_cancelled() {
                workers.shutdown().await;
                return Err(SwarmError::Cancelled);
            }

            if self.manager.is_complete() {
                // every range is verified; stragglers have nothing left to deliver
                workers.shutdown().await;
                self.manager.verify_complete_file().await?;
                return Ok(self.manager.progress());
            }

            while workers.len() < config.max_workers_per_download {
                if self.manager.is_cancelled() {
                    break;
                }
                let Some(assignment) = self.manager.allocate_work() else {
                    break;
                };
                let worker = SegmentWorker::new(
                    self.manager.clone(),
                    self.fetcher.clone(),
                    self.trees.clone(),
                    assignment,
                );
                workers.spawn(worker.run());
            }

            if workers.is_empty() {
                let since = *starved_since.get_or_insert_with(Instant::now);
                if since.elapsed() >= config.no_candidate_grace() {
                    let summary = self.manager.failure_summary();
                    warn!(
                        target_id = %self.manager.target_id(),
                        grace_ms = config.no_candidate_grace_ms,
                        "No usable candidates left: {}",
                        summary
                    );
                    self.manager.cancel();
                    return Err(SwarmError::NoCandidates(summary));
                }
            } else {
                starved_since = None;
            }

            tokio::select! {
                _ = notify.notified() => {}
                Some(joined) = workers.join_next(), if !workers.is_empty() => {
                    log_joined(joined);
                    self.emit(SwarmEvent::ProgressUpdate {
                        progress: self.manager.progress(),
                    });
                }
                _ = sleep(config.poll_interval()) => {}
                _ = self.manager.cancelled() => {}
            }
        }
    }
}

fn log_joined(joined: Result<WorkerOutcome, tokio::task::JoinError>) {
    match joined {
        Ok(outcome) => debug!(outcome = ?outcome, "Worker joined"),
        Err(e) if e.is_cancelled() => {}
        Err(e) => error!("Worker panicked: {}", e),
    }
}

struct ActiveDownload {
    manager: Arc<SegmentManager>,
}

/// Runs swarm downloads keyed by content hash
pub struct DownloadEngine {
    config: SwarmConfig,
    pool: Arc<CandidatePool>,
    queue: HashCalculationQueue,
    fetcher: Arc<dyn RangeFetcher>,
    trees: Option<Arc<dyn TreeFetcher>>,
    active: Arc<Mutex<HashMap<String, ActiveDownload>>>,
    event_tx: mpsc::UnboundedSender<SwarmEvent>,
}

impl DownloadEngine {
    pub fn new(
        config: SwarmConfig,
        access: Arc<dyn AccessControl>,
        fetcher: Arc<dyn RangeFetcher>,
        trees: Option<Arc<dyn TreeFetcher>>,
    ) -> (Self, mpsc::UnboundedReceiver<SwarmEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let pool = Arc::new(CandidatePool::new(config.candidates.clone(), access));
        let queue = HashCalculationQueue::new(config.hashing.clone());
        (
            Self {
                config,
                pool,
                queue,
                fetcher,
                trees,
                active: Arc::new(Mutex::new(HashMap::new())),
                event_tx,
            },
            event_rx,
        )
    }

    fn active(&self) -> MutexGuard<'_, HashMap<String, ActiveDownload>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn pool(&self) -> &Arc<CandidatePool> {
        &self.pool
    }

    pub fn queue(&self) -> &HashCalculationQueue {
        &self.queue
    }

    /// Start downloading `target` into `sink`. Fails if the same content is already
    /// being downloaded.
    pub fn start(
        &self,
        target: DownloadTarget,
        sink: Arc<dyn DataSink>,
        candidates: Vec<Candidate>,
    ) -> Result<JoinHandle<Result<DownloadProgress, SwarmError>>, SwarmError> {
        let target_id = target.id();
        let total_size = target.total_size();
        let mut download_config = self.config.download.clone();
        download_config.block_size = target.block_size();

        let manager = {
            let mut active = self.active();
            if active.contains_key(&target_id) {
                return Err(SwarmError::AlreadyActive(target_id));
            }
            let manager = Arc::new(
                SegmentManager::new(
                    target,
                    download_config,
                    self.pool.clone(),
                    self.queue.clone(),
                    sink,
                )
                .with_events(self.event_tx.clone()),
            );
            active.insert(
                target_id.clone(),
                ActiveDownload {
                    manager: manager.clone(),
                },
            );
            manager
        };

        let added = candidates
            .into_iter()
            .filter(|candidate| self.pool.add_candidate(&target_id, candidate.clone()))
            .count();
        info!(target_id = %target_id, total_size, candidates = added, "Starting swarm download");
        let _ = self.event_tx.send(SwarmEvent::DownloadStarted {
            target_id: target_id.clone(),
            total_size,
            candidates: added,
        });

        let download = SwarmDownload::new(manager, self.fetcher.clone(), self.trees.clone())
            .with_events(self.event_tx.clone());
        let active = self.active.clone();
        Ok(tokio::spawn(async move {
            let result = download.run().await;
            active
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&target_id);
            result
        }))
    }

    /// Feed a newly discovered source to a running download.
    pub fn add_candidate(&self, target_id: &str, candidate: Candidate) -> Result<bool, SwarmError> {
        let manager = self.manager(target_id)?;
        let added = self.pool.add_candidate(target_id, candidate);
        if added {
            manager.notifier().notify_one();
        }
        Ok(added)
    }

    pub fn cancel(&self, target_id: &str) -> Result<(), SwarmError> {
        self.manager(target_id)?.cancel();
        Ok(())
    }

    pub fn progress(&self, target_id: &str) -> Option<DownloadProgress> {
        self.active()
            .get(target_id)
            .map(|download| download.manager.progress())
    }

    pub fn active_downloads(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.active().keys().cloned().collect();
        ids.sort();
        ids
    }

    fn manager(&self, target_id: &str) -> Result<Arc<SegmentManager>, SwarmError> {
        self.active()
            .get(target_id)
            .map(|download| download.manager.clone())
            .ok_or_else(|| SwarmError::NotFound(target_id.to_string()))
    }
}
