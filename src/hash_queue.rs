//! Background hashing pipeline.
//!
//! Two kinds of work go through the queue: computing a full tree (and SHA-1 URN) for a
//! file we share, and verifying downloaded bytes against a target's tree. Hashing runs
//! on the blocking pool so it never stalls segment I/O.
//!
//! Tree computations run one at a time in submission order. Verifications run on up to
//! `verify_workers` workers in any order, since every verified range is self-contained.
//! Workers are spawned on demand and release themselves after `idle_timeout` without
//! work.

use crate::config::HashQueueConfig;
use crate::error::HashError;
use crate::target::SharedTree;
use crate::thex::{HashTree, TreeBuilder, VerifyResult};
use data_encoding::BASE32;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::collections::VecDeque;
use std::io::Read;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Where the bytes of a tree computation come from
#[derive(Debug, Clone)]
pub enum TreeSource {
    File(PathBuf),
    Bytes(Arc<Vec<u8>>),
}

impl TreeSource {
    fn describe(&self) -> String {
        match self {
            TreeSource::File(path) => path.display().to_string(),
            TreeSource::Bytes(bytes) => format!("<{} bytes in memory>", bytes.len()),
        }
    }
}

/// A unit of hashing work
pub enum HashJob {
    /// Sharing path: full tree plus SHA-1 URN of a local file
    ComputeTree { source: TreeSource, block_size: u64 },
    /// Download path: check `data` at `offset` against `tree`
    Verify {
        tree: SharedTree,
        offset: u64,
        data: Vec<u8>,
    },
}

impl HashJob {
    fn lane(&self) -> Lane {
        match self {
            HashJob::ComputeTree { .. } => Lane::Share,
            HashJob::Verify { .. } => Lane::Verify,
        }
    }
}

/// Result of a tree computation
#[derive(Debug, Clone)]
pub struct ShareDigest {
    pub tree: HashTree,
    /// `urn:sha1:<base32>`
    pub sha1_urn: String,
    pub size: u64,
}

#[derive(Debug)]
pub enum JobOutput {
    Tree(ShareDigest),
    Verified(VerifyResult),
}

/// Pending result of a submitted job
#[derive(Debug)]
pub struct JobHandle {
    id: u64,
    rx: oneshot::Receiver<Result<JobOutput, HashError>>,
}

impl JobHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub async fn result(self) -> Result<JobOutput, HashError> {
        self.rx.await.map_err(|_| HashError::QueueClosed)?
    }
}

/// Counters exposed for status displays
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub queued: usize,
    pub running: usize,
    pub completed: u64,
    pub failed: u64,
    pub workers: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lane {
    Share,
    Verify,
}

struct QueuedJob {
    id: u64,
    job: HashJob,
    reply: oneshot::Sender<Result<JobOutput, HashError>>,
    _slot: OwnedSemaphorePermit,
}

#[derive(Default)]
struct Lanes {
    share: VecDeque<QueuedJob>,
    verify: VecDeque<QueuedJob>,
    share_worker: bool,
    verify_workers: usize,
    verify_idle: usize,
    running: usize,
    completed: u64,
    failed: u64,
}

struct QueueInner {
    config: HashQueueConfig,
    lanes: Mutex<Lanes>,
    share_notify: Notify,
    verify_notify: Notify,
    slots: Arc<Semaphore>,
    next_id: AtomicU64,
}

impl QueueInner {
    fn lanes(&self) -> std::sync::MutexGuard<'_, Lanes> {
        self.lanes.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Bounded hashing queue with lazily spun workers
#[derive(Clone)]
pub struct HashCalculationQueue {
    inner: Arc<QueueInner>,
}

impl HashCalculationQueue {
    pub fn new(config: HashQueueConfig) -> Self {
        let slots = Arc::new(Semaphore::new(config.capacity.max(1)));
        Self {
            inner: Arc::new(QueueInner {
                config,
                lanes: Mutex::new(Lanes::default()),
                share_notify: Notify::new(),
                verify_notify: Notify::new(),
                slots,
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Enqueue a job, waiting only while the queue is at capacity.
    pub async fn submit(&self, job: HashJob) -> Result<JobHandle, HashError> {
        let slot = self
            .inner
            .slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| HashError::QueueClosed)?;
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (reply, rx) = oneshot::channel();
        let lane = job.lane();
        let queued = QueuedJob {
            id,
            job,
            reply,
            _slot: slot,
        };

        let spawn = {
            let mut lanes = self.inner.lanes();
            match lane {
                Lane::Share => {
                    lanes.share.push_back(queued);
                    let spawn = !lanes.share_worker;
                    lanes.share_worker = true;
                    spawn
                }
                Lane::Verify => {
                    lanes.verify.push_back(queued);
                    let spawn = lanes.verify_idle == 0
                        && lanes.verify_workers < self.inner.config.verify_workers.max(1);
                    if spawn {
                        lanes.verify_workers += 1;
                    }
                    spawn
                }
            }
        };

        if spawn {
            debug!(lane = ?lane, "Spawning hash worker");
            tokio::spawn(run_worker(self.inner.clone(), lane));
        }
        match lane {
            Lane::Share => self.inner.share_notify.notify_one(),
            Lane::Verify => self.inner.verify_notify.notify_one(),
        }
        Ok(JobHandle { id, rx })
    }

    /// Verify a range and wait for the answer.
    pub async fn verify(
        &self,
        tree: SharedTree,
        offset: u64,
        data: Vec<u8>,
    ) -> Result<VerifyResult, HashError> {
        let handle = self.submit(HashJob::Verify { tree, offset, data }).await?;
        match handle.result().await? {
            JobOutput::Verified(result) => Ok(result),
            JobOutput::Tree(_) => Err(HashError::Malformed(
                "verification returned a tree".to_string(),
            )),
        }
    }

    /// Compute a full tree and wait for it.
    pub async fn compute_tree(
        &self,
        source: TreeSource,
        block_size: u64,
    ) -> Result<ShareDigest, HashError> {
        let handle = self
            .submit(HashJob::ComputeTree { source, block_size })
            .await?;
        match handle.result().await? {
            JobOutput::Tree(digest) => Ok(digest),
            JobOutput::Verified(_) => Err(HashError::Malformed(
                "tree computation returned a verification".to_string(),
            )),
        }
    }

    /// Refuse further submissions; queued jobs still finish.
    pub fn close(&self) {
        self.inner.slots.close();
    }

    pub fn stats(&self) -> QueueStats {
        let lanes = self.inner.lanes();
        QueueStats {
            queued: lanes.share.len() + lanes.verify.len(),
            running: lanes.running,
            completed: lanes.completed,
            failed: lanes.failed,
            workers: lanes.verify_workers + usize::from(lanes.share_worker),
        }
    }
}

async fn run_worker(inner: Arc<QueueInner>, lane: Lane) {
    loop {
        let next = {
            let mut lanes = inner.lanes();
            let next = match lane {
                Lane::Share => lanes.share.pop_front(),
                Lane::Verify => lanes.verify.pop_front(),
            };
            match &next {
                Some(_) => lanes.running += 1,
                None if lane == Lane::Verify => lanes.verify_idle += 1,
                None => {}
            }
            next
        };

        if let Some(queued) = next {
            execute(&inner, queued).await;
            continue;
        }

        let notify = match lane {
            Lane::Share => &inner.share_notify,
            Lane::Verify => &inner.verify_notify,
        };
        let _ = timeout(inner.config.idle_timeout(), notify.notified()).await;

        let mut lanes = inner.lanes();
        if lane == Lane::Verify {
            lanes.verify_idle -= 1;
        }
        let empty = match lane {
            Lane::Share => lanes.share.is_empty(),
            Lane::Verify => lanes.verify.is_empty(),
        };
        if empty {
            match lane {
                Lane::Share => lanes.share_worker = false,
                Lane::Verify => lanes.verify_workers -= 1,
            }
            debug!(lane = ?lane, "Releasing idle hash worker");
            break;
        }
    }
}

async fn execute(inner: &QueueInner, queued: QueuedJob) {
    let config = &inner.config;
    let QueuedJob {
        id,
        job,
        reply,
        _slot,
    } = queued;
    let read_buffer = config.read_buffer_size.max(4096);
    let throttle = config.throttle_factor;

    let outcome = tokio::task::spawn_blocking(move || match job {
        HashJob::ComputeTree { source, block_size } => {
            compute_digest(&source, block_size, read_buffer, throttle).map(JobOutput::Tree)
        }
        HashJob::Verify { tree, offset, data } => {
            let tree = tree.read().unwrap_or_else(PoisonError::into_inner);
            Ok(JobOutput::Verified(tree.verify_range(offset, &data)))
        }
    })
    .await
    .unwrap_or_else(|e| Err(HashError::Io(std::io::Error::other(e.to_string()))));

    {
        let mut lanes = inner.lanes();
        lanes.running -= 1;
        match &outcome {
            Ok(_) => lanes.completed += 1,
            Err(e) => {
                lanes.failed += 1;
                warn!(job_id = id, "Hash job failed: {}", e);
            }
        }
    }
    // the submitter may have stopped waiting
    let _ = reply.send(outcome);
}

fn compute_digest(
    source: &TreeSource,
    block_size: u64,
    read_buffer: usize,
    throttle: f64,
) -> Result<ShareDigest, HashError> {
    let started = Instant::now();
    let mut builder = TreeBuilder::new(block_size);
    let mut sha1 = Sha1::new();

    match source {
        TreeSource::Bytes(bytes) => {
            builder.update(bytes);
            sha1.update(bytes.as_slice());
        }
        TreeSource::File(path) => {
            let mut file = std::fs::File::open(path)?;
            let mut buf = vec![0u8; read_buffer];
            let mut step = Instant::now();
            loop {
                let n = match file.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(HashError::Io(e)),
                };
                builder.update(&buf[..n]);
                sha1.update(&buf[..n]);
                if throttle > 0.0 {
                    let pause = step.elapsed().mul_f64(throttle);
                    std::thread::sleep(pause.min(Duration::from_secs(1)));
                    step = Instant::now();
                }
            }
        }
    }

    let size = builder.bytes_hashed();
    let tree = builder.finish();
    let sha1_urn = format!("urn:sha1:{}", BASE32.encode(&sha1.finalize()));
    info!(
        source = %source.describe(),
        size,
        root = %tree.root(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Computed hash tree"
    );
    Ok(ShareDigest {
        tree,
        sha1_urn,
        size,
    })
}
