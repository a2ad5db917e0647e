//! Access control collaborator and background ban batching.
//!
//! Rule storage belongs to the security subsystem; the swarm only asks whether an
//! address may be used and asks for malicious sources to be banned. Bans are applied
//! by a [`BanBatch`] worker so a burst of bans never stalls a download.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

/// Query/insert contract of the security subsystem
pub trait AccessControl: Send + Sync {
    fn is_access_granted(&self, address: &str) -> bool;
    fn ban(&self, address: &str, duration: Duration);
}

/// In-process rule table, used by the CLI and tests
#[derive(Debug, Default)]
pub struct MemoryAccessControl {
    bans: Mutex<HashMap<String, Instant>>,
}

impl MemoryAccessControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ban_count(&self) -> usize {
        let now = Instant::now();
        self.bans
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|until| **until > now)
            .count()
    }
}

impl AccessControl for MemoryAccessControl {
    fn is_access_granted(&self, address: &str) -> bool {
        let bans = self.bans.lock().unwrap_or_else(PoisonError::into_inner);
        match bans.get(address) {
            Some(until) => Instant::now() >= *until,
            None => true,
        }
    }

    fn ban(&self, address: &str, duration: Duration) {
        let mut bans = self.bans.lock().unwrap_or_else(PoisonError::into_inner);
        bans.insert(address.to_string(), Instant::now() + duration);
    }
}

#[derive(Default)]
struct BanQueue {
    pending: VecDeque<(String, Duration)>,
    worker_running: bool,
    applied: u64,
}

struct BanBatchInner {
    access: Arc<dyn AccessControl>,
    queue: Mutex<BanQueue>,
    notify: Notify,
    idle_timeout: Duration,
}

/// Applies bans in the background.
///
/// The worker task is created on the first queued ban, drains the queue, parks for
/// `idle_timeout` when it runs dry and then releases itself. The emptiness check and
/// the release happen under the queue lock, so a ban queued concurrently either is
/// picked up by the parting worker or starts a new one.
#[derive(Clone)]
pub struct BanBatch {
    inner: Arc<BanBatchInner>,
}

impl BanBatch {
    pub fn new(access: Arc<dyn AccessControl>, idle_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(BanBatchInner {
                access,
                queue: Mutex::new(BanQueue::default()),
                notify: Notify::new(),
                idle_timeout,
            }),
        }
    }

    pub fn access(&self) -> &Arc<dyn AccessControl> {
        &self.inner.access
    }

    pub fn add(&self, address: &str, duration: Duration) {
        let spawn = {
            let mut queue = self.inner.queue.lock().unwrap_or_else(PoisonError::into_inner);
            queue.pending.push_back((address.to_string(), duration));
            let spawn = !queue.worker_running;
            queue.worker_running = true;
            spawn
        };

        if spawn {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    debug!("Creating ban batch worker");
                    handle.spawn(run_batch(self.inner.clone()));
                }
                Err(_) => {
                    warn!("No runtime for ban batch, applying bans inline");
                    drain_inline(&self.inner);
                }
            }
        }
        self.inner.notify.notify_one();
    }

    pub fn pending(&self) -> usize {
        self.inner
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pending
            .len()
    }

    pub fn is_running(&self) -> bool {
        self.inner
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .worker_running
    }

    pub fn applied(&self) -> u64 {
        self.inner
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .applied
    }
}

fn apply_one(inner: &BanBatchInner, address: &str, duration: Duration) -> bool {
    // only ban if not already denied by an earlier batch
    if !inner.access.is_access_granted(address) {
        return false;
    }
    inner.access.ban(address, duration);
    info!(address = %address, duration_secs = duration.as_secs(), "Banned host");
    true
}

fn drain_inline(inner: &BanBatchInner) {
    let mut queue = inner.queue.lock().unwrap_or_else(PoisonError::into_inner);
    while let Some((address, duration)) = queue.pending.pop_front() {
        if apply_one(inner, &address, duration) {
            queue.applied += 1;
        }
    }
    queue.worker_running = false;
}

async fn run_batch(inner: Arc<BanBatchInner>) {
    loop {
        let next = inner
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pending
            .pop_front();

        if let Some((address, duration)) = next {
            if apply_one(&inner, &address, duration) {
                inner
                    .queue
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .applied += 1;
            }
            continue;
        }

        let _ = timeout(inner.idle_timeout, inner.notify.notified()).await;

        let mut queue = inner.queue.lock().unwrap_or_else(PoisonError::into_inner);
        if queue.pending.is_empty() {
            queue.worker_running = false;
            debug!("Releasing ban batch worker");
            break;
        }
    }
}
