//! End-to-end swarm downloads against scripted candidates
//!
//! Tests cover:
//! - a corrupt source among honest ones
//! - a source serving a forged hash tree
//! - tree data arriving in pieces from several sources
//! - a fully received range that cannot be verified yet
//! - giving up when no candidate is usable
//! - cancellation in the middle of transfers
//! - the download engine with a file-backed sink

use async_trait::async_trait;
use chiral_swarm::candidate::Candidate;
use chiral_swarm::candidate_pool::{CandidatePool, FailureOutcome};
use chiral_swarm::config::{CandidateConfig, DownloadConfig, HashQueueConfig, SwarmConfig};
use chiral_swarm::download::{DownloadEngine, SwarmDownload, SwarmEvent};
use chiral_swarm::error::{
    FailureKind, FailureReason, SegmentFault, SwarmError, TransferError, TreeFetchError,
};
use chiral_swarm::hash_queue::HashCalculationQueue;
use chiral_swarm::security::{AccessControl, MemoryAccessControl};
use chiral_swarm::segment::SegmentStatus;
use chiral_swarm::segment_manager::SegmentManager;
use chiral_swarm::target::DownloadTarget;
use chiral_swarm::thex::{encode_nodes, leaf_hash, HashTree, TigerHash, TreeNode};
use chiral_swarm::transport::{ByteStream, FileSink, MemorySink, RangeFetcher, RangeRequest, TreeFetcher};
use chiral_swarm::worker::{SegmentWorker, WorkerOutcome};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const SIZE: usize = 10_000;
const BLOCK: u64 = 1000;

fn file_data() -> Arc<Vec<u8>> {
    Arc::new((0..SIZE).map(|i| (i * 13 % 241) as u8).collect())
}

#[derive(Clone, Copy)]
enum Behavior {
    Honest,
    CorruptAt(usize),
    Refuse,
    StallAfterFirstChunk,
    EndAfterFirstChunk,
}

struct ScriptedFetcher {
    data: Arc<Vec<u8>>,
    behaviors: HashMap<String, Behavior>,
    chunk: usize,
    requests: AtomicUsize,
    served: Arc<AtomicUsize>,
}

impl ScriptedFetcher {
    fn new(data: Arc<Vec<u8>>, behaviors: &[(&str, Behavior)]) -> Self {
        Self {
            data,
            behaviors: behaviors
                .iter()
                .map(|(id, behavior)| (id.to_string(), *behavior))
                .collect(),
            chunk: 1000,
            requests: AtomicUsize::new(0),
            served: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[async_trait]
impl RangeFetcher for ScriptedFetcher {
    async fn fetch_range(
        &self,
        candidate: &Candidate,
        request: RangeRequest,
    ) -> Result<ByteStream, TransferError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        let behavior = self
            .behaviors
            .get(&candidate.id)
            .copied()
            .unwrap_or(Behavior::Honest);
        let start = request.offset as usize;
        let end = start + request.length as usize;
        let mut bytes = self.data[start..end].to_vec();
        match behavior {
            Behavior::Refuse => {
                return Err(TransferError::ConnectionRefused(candidate.id.clone()))
            }
            Behavior::CorruptAt(pos) if (start..end).contains(&pos) => bytes[pos - start] ^= 0xff,
            _ => {}
        }

        let chunks: Vec<Result<Vec<u8>, TransferError>> =
            bytes.chunks(self.chunk).map(|c| Ok(c.to_vec())).collect();
        let served = self.served.clone();
        let stream = futures::stream::iter(chunks).inspect(move |_| {
            served.fetch_add(1, Ordering::SeqCst);
        });
        match behavior {
            Behavior::StallAfterFirstChunk => {
                Ok(Box::pin(stream.take(1).chain(futures::stream::pending())))
            }
            Behavior::EndAfterFirstChunk => Ok(Box::pin(stream.take(1))),
            _ => Ok(Box::pin(stream)),
        }
    }
}

/// Serves the full tree by default; liars get leaf 3 forged, and single
/// candidates can be given their own node set.
struct ScriptedTrees {
    nodes: Vec<u8>,
    served: HashMap<String, Vec<u8>>,
}

impl ScriptedTrees {
    fn new(tree: &HashTree, liars: &[&str]) -> Self {
        let nodes = tree.nodes(tree.depth());
        let mut forged = nodes.clone();
        for node in forged.iter_mut().filter(|n| n.level == 0 && n.index == 3) {
            node.hash = leaf_hash(b"forged block");
        }
        let forged = encode_nodes(&forged);
        Self {
            nodes: encode_nodes(&nodes),
            served: liars
                .iter()
                .map(|id| (id.to_string(), forged.clone()))
                .collect(),
        }
    }

    fn serving(mut self, candidate: &str, nodes: &[TreeNode]) -> Self {
        self.served.insert(candidate.to_string(), encode_nodes(nodes));
        self
    }
}

#[async_trait]
impl TreeFetcher for ScriptedTrees {
    async fn fetch_tree_metadata(
        &self,
        candidate: &Candidate,
        _root: &TigerHash,
    ) -> Result<Vec<u8>, TreeFetchError> {
        Ok(self
            .served
            .get(&candidate.id)
            .unwrap_or(&self.nodes)
            .clone())
    }
}

fn download_config() -> DownloadConfig {
    DownloadConfig {
        block_size: BLOCK,
        max_segment_size: 5000,
        poll_interval_ms: 50,
        ..Default::default()
    }
}

struct Harness {
    manager: Arc<SegmentManager>,
    pool: Arc<CandidatePool>,
    access: Arc<MemoryAccessControl>,
    sink: Arc<MemorySink>,
    tree: HashTree,
}

fn harness(config: DownloadConfig, events: Option<mpsc::UnboundedSender<SwarmEvent>>) -> Harness {
    let data = file_data();
    let tree = HashTree::build_from_slice(BLOCK, &data);
    let target = DownloadTarget::new(tree.root(), SIZE as u64, BLOCK);
    let access = Arc::new(MemoryAccessControl::new());
    let pool = Arc::new(CandidatePool::new(
        CandidateConfig {
            jitter_factor: 0.0,
            ban_batch_idle_ms: 100,
            ..Default::default()
        },
        access.clone(),
    ));
    let sink = Arc::new(MemorySink::new(SIZE as u64));
    let queue = HashCalculationQueue::new(HashQueueConfig::default());
    let mut manager = SegmentManager::new(target, config, pool.clone(), queue, sink.clone());
    if let Some(events) = events {
        manager = manager.with_events(events);
    }
    Harness {
        manager: Arc::new(manager),
        pool,
        access,
        sink,
        tree,
    }
}

fn assert_partition(manager: &SegmentManager) {
    let mut expected = 0;
    for seg in manager.segments() {
        assert_eq!(seg.start, expected, "segments must be contiguous");
        expected = seg.end;
    }
    assert_eq!(expected, SIZE as u64);
}

#[tokio::test]
async fn test_corrupt_source_is_detected_and_range_resourced() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let h = harness(download_config(), Some(tx.clone()));
    let target_id = h.manager.target_id().to_string();
    for id in ["a", "b", "c"] {
        h.pool.add_candidate(&target_id, Candidate::new(id));
    }
    let fetcher = Arc::new(ScriptedFetcher::new(
        file_data(),
        &[("b", Behavior::CorruptAt(7500))],
    ));
    let trees = Arc::new(ScriptedTrees::new(&h.tree, &[]));

    let progress = SwarmDownload::new(h.manager.clone(), fetcher, Some(trees))
        .with_events(tx)
        .run()
        .await
        .unwrap();

    assert!(progress.complete);
    assert_eq!(progress.bytes_verified, SIZE as u64);
    assert_eq!(progress.hash_mismatches, 1);
    assert_eq!(h.sink.contents(), *file_data());
    assert_partition(&h.manager);
    assert!(h.manager.segments().iter().all(|s| s.status == SegmentStatus::Complete));

    let mut penalized = Vec::new();
    let mut completed_ranges = Vec::new();
    while let Ok(event) = rx.try_recv() {
        match event {
            SwarmEvent::CandidatePenalized { candidate, kind, .. } => {
                penalized.push((candidate, kind))
            }
            SwarmEvent::SegmentCompleted {
                start, end, candidate, ..
            } => completed_ranges.push((start, end, candidate)),
            _ => {}
        }
    }
    assert_eq!(penalized, vec![("b".to_string(), FailureKind::HashMismatch)]);
    // the block holding the corrupt byte came from an honest source
    assert!(completed_ranges
        .iter()
        .any(|(start, end, candidate)| *start <= 7000 && *end >= 8000 && candidate != "b"));
}

#[tokio::test]
async fn test_forged_tree_bans_source() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let h = harness(
        DownloadConfig {
            max_workers_per_download: 1,
            ..download_config()
        },
        Some(tx.clone()),
    );
    let target_id = h.manager.target_id().to_string();
    h.pool.add_candidate(&target_id, Candidate::new("liar"));
    h.pool.add_candidate(&target_id, Candidate::new("honest"));
    let fetcher = Arc::new(ScriptedFetcher::new(file_data(), &[]));
    let trees = Arc::new(ScriptedTrees::new(&h.tree, &["liar"]));

    SwarmDownload::new(h.manager.clone(), fetcher, Some(trees))
        .with_events(tx)
        .run()
        .await
        .unwrap();
    assert_eq!(h.sink.contents(), *file_data());

    let banned = std::iter::from_fn(|| rx.try_recv().ok()).any(|event| {
        matches!(
            event,
            SwarmEvent::CandidatePenalized {
                ref candidate,
                kind: FailureKind::TreeMismatch,
                outcome: FailureOutcome::Banned,
                ..
            } if candidate == "liar"
        )
    });
    assert!(banned);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!h.access.is_access_granted("liar"));
    assert!(h.access.is_access_granted("honest"));
}

#[tokio::test]
async fn test_tree_pieces_from_two_sources_blame_only_the_liar() {
    let h = harness(
        DownloadConfig {
            max_segment_size: 2000,
            unverifiable_retry_ms: 0,
            ..download_config()
        },
        None,
    );
    let target_id = h.manager.target_id().to_string();
    h.pool.add_candidate(&target_id, Candidate::new("liar"));
    h.pool.add_candidate(&target_id, Candidate::new("honest"));

    let forged_leaves: Vec<TreeNode> = (0..h.tree.leaf_count())
        .map(|index| TreeNode {
            level: 0,
            index,
            hash: leaf_hash(format!("forged {}", index).as_bytes()),
        })
        .collect();
    // everything but the leaves
    let upper_levels = h.tree.nodes(h.tree.depth() - 2);
    assert!(upper_levels.iter().all(|n| n.level > 0));
    let trees: Arc<dyn TreeFetcher> = Arc::new(
        ScriptedTrees::new(&h.tree, &[])
            .serving("liar", &forged_leaves)
            .serving("honest", &upper_levels),
    );
    let fetcher: Arc<dyn RangeFetcher> = Arc::new(ScriptedFetcher::new(file_data(), &[]));
    let worker = |assignment| {
        SegmentWorker::new(h.manager.clone(), fetcher.clone(), Some(trees.clone()), assignment)
    };

    let liar_first = h.manager.allocate_work().unwrap();
    let honest_first = h.manager.allocate_work().unwrap();
    assert_eq!(liar_first.candidate.id, "liar");
    assert_eq!(honest_first.candidate.id, "honest");

    // forged leaves alone link to nothing, so the liar's range stays unverifiable
    assert_eq!(
        worker(liar_first).run().await,
        WorkerOutcome::Rejected(FailureReason::TreeUnavailable)
    );
    assert_eq!(worker(honest_first).run().await, WorkerOutcome::Completed);

    let honest_next = h.manager.allocate_work().unwrap();
    let liar_next = h.manager.allocate_work().unwrap();
    assert_eq!(honest_next.candidate.id, "honest");
    assert_eq!(liar_next.candidate.id, "liar");
    assert_eq!(
        worker(liar_next).run().await,
        WorkerOutcome::Failed(FailureKind::TreeMismatch)
    );
    assert_eq!(worker(honest_next).run().await, WorkerOutcome::Completed);

    let honest = h
        .pool
        .snapshot(&target_id)
        .into_iter()
        .find(|c| c.id == "honest")
        .unwrap();
    assert_eq!(honest.consecutive_failures, 0);
    assert_eq!(honest.last_failure, None);
    assert_eq!(h.pool.known_count(&target_id), 1);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!h.access.is_access_granted("liar"));
    assert!(h.access.is_access_granted("honest"));
    assert_eq!(h.manager.progress().bytes_verified, 4000);
    assert_partition(&h.manager);
}

#[tokio::test]
async fn test_unverifiable_range_defers_candidate_without_penalty() {
    let h = harness(download_config(), None);
    let target_id = h.manager.target_id().to_string();
    h.pool.add_candidate(&target_id, Candidate::new("a"));
    let fetcher = Arc::new(ScriptedFetcher::new(file_data(), &[]));

    let assignment = h.manager.allocate_work().unwrap();
    assert_eq!(assignment.range, 0..5000);
    let outcome = SegmentWorker::new(h.manager.clone(), fetcher, None, assignment)
        .run()
        .await;
    assert_eq!(outcome, WorkerOutcome::Rejected(FailureReason::TreeUnavailable));

    let snapshot = &h.pool.snapshot(&target_id)[0];
    assert_eq!(snapshot.consecutive_failures, 0);
    assert_eq!(snapshot.last_failure, None);
    assert!(!snapshot.assigned);
    assert!(snapshot.cooldown_remaining_ms > 0);

    let first = &h.manager.segments()[0];
    assert_eq!(first.status, SegmentStatus::Unclaimed);
    assert_eq!(first.last_failure, Some(FailureReason::TreeUnavailable));
}

#[tokio::test]
async fn test_truncated_stream_penalizes_candidate() {
    let h = harness(download_config(), None);
    let target_id = h.manager.target_id().to_string();
    h.pool.add_candidate(&target_id, Candidate::new("short"));
    let fetcher = Arc::new(ScriptedFetcher::new(
        file_data(),
        &[("short", Behavior::EndAfterFirstChunk)],
    ));

    let assignment = h.manager.allocate_work().unwrap();
    let outcome = SegmentWorker::new(h.manager.clone(), fetcher, None, assignment)
        .run()
        .await;
    assert_eq!(outcome, WorkerOutcome::Failed(FailureKind::ProtocolError));
    assert_eq!(h.pool.snapshot(&target_id)[0].consecutive_failures, 1);
}

#[tokio::test(start_paused = true)]
async fn test_no_candidates_fails_after_grace_period() {
    let h = harness(download_config(), None);
    assert!(h.manager.allocate_work().is_none());
    assert!(h.manager.allocate_work().is_none());

    let fetcher = Arc::new(ScriptedFetcher::new(file_data(), &[]));
    let err = SwarmDownload::new(h.manager.clone(), fetcher.clone(), None)
        .run()
        .await
        .unwrap_err();

    match err {
        SwarmError::NoCandidates(summary) => {
            assert_eq!(summary.remaining, vec![0..SIZE as u64]);
            assert_eq!(summary.remaining_bytes, SIZE as u64);
            assert_eq!(summary.known_candidates, 0);
        }
        other => panic!("unexpected error {:?}", other),
    }
    assert_eq!(fetcher.requests.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn test_refusing_sources_exhaust_into_failure_summary() {
    let h = harness(
        DownloadConfig {
            no_candidate_grace_ms: 60_000,
            ..download_config()
        },
        None,
    );
    let target_id = h.manager.target_id().to_string();
    h.pool.add_candidate(&target_id, Candidate::new("down"));
    let fetcher = Arc::new(ScriptedFetcher::new(file_data(), &[("down", Behavior::Refuse)]));

    let err = SwarmDownload::new(h.manager.clone(), fetcher.clone(), None)
        .run()
        .await
        .unwrap_err();
    let SwarmError::NoCandidates(summary) = err else {
        panic!("expected NoCandidates");
    };
    assert_eq!(summary.remaining_bytes, SIZE as u64);
    assert!(summary
        .last_errors
        .contains(&("down".to_string(), FailureKind::ConnectionRefused)));
    assert_eq!(fetcher.requests.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_cancel_stops_workers_mid_transfer() {
    let h = harness(download_config(), None);
    let target_id = h.manager.target_id().to_string();
    h.pool.add_candidate(&target_id, Candidate::new("a"));
    h.pool.add_candidate(&target_id, Candidate::new("b"));
    let fetcher = Arc::new(ScriptedFetcher::new(
        file_data(),
        &[
            ("a", Behavior::StallAfterFirstChunk),
            ("b", Behavior::StallAfterFirstChunk),
        ],
    ));
    let trees = Arc::new(ScriptedTrees::new(&h.tree, &[]));
    let served = fetcher.served.clone();

    let handle = tokio::spawn(
        SwarmDownload::new(h.manager.clone(), fetcher, Some(trees)).run(),
    );
    for _ in 0..500 {
        if served.load(Ordering::SeqCst) >= 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(served.load(Ordering::SeqCst), 2);

    h.manager.cancel();
    let result = handle.await.unwrap();
    assert!(matches!(result, Err(SwarmError::Cancelled)));

    let segments = h.manager.segments();
    assert!(segments
        .iter()
        .all(|s| matches!(s.status, SegmentStatus::Cancelled | SegmentStatus::Complete)));
    assert!(h.manager.allocate_work().is_none());

    let before = h.sink.contents();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.sink.contents(), before);
    assert_eq!(h.manager.segments(), segments);
    assert_eq!(served.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_late_bytes_after_cancel_are_refused() {
    let h = harness(download_config(), None);
    let target_id = h.manager.target_id().to_string();
    h.pool.add_candidate(&target_id, Candidate::new("a"));
    let assignment = h.manager.allocate_work().unwrap();
    h.manager.cancel();

    let err = h
        .manager
        .on_bytes_received(&assignment, 0, &file_data()[..1000])
        .await
        .unwrap_err();
    assert!(matches!(err, SegmentFault::Cancelled));
    assert_eq!(h.manager.progress().bytes_received, 0);
}

#[tokio::test]
async fn test_engine_downloads_into_file() {
    let data = file_data();
    let tree = HashTree::build_from_slice(BLOCK, &data);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("swarmed.bin");

    let config = SwarmConfig::builder().download(download_config()).build();
    let fetcher = Arc::new(ScriptedFetcher::new(data.clone(), &[]));
    let trees = Arc::new(ScriptedTrees::new(&tree, &[]));
    let (engine, mut events) = DownloadEngine::new(
        config,
        Arc::new(MemoryAccessControl::new()),
        fetcher,
        Some(trees),
    );

    let target = DownloadTarget::new(tree.root(), SIZE as u64, BLOCK).named("swarmed.bin");
    let sink = Arc::new(FileSink::create(&path, SIZE as u64).await.unwrap());
    let candidates = vec![Candidate::new("a"), Candidate::new("b")];
    let handle = engine.start(target.clone(), sink.clone(), candidates.clone()).unwrap();

    let duplicate = engine.start(target.clone(), sink, candidates);
    assert!(matches!(duplicate, Err(SwarmError::AlreadyActive(_))));

    let progress = handle.await.unwrap().unwrap();
    assert!(progress.complete);
    assert_eq!(std::fs::read(&path).unwrap(), *data);
    assert!(engine.active_downloads().is_empty());
    assert!(matches!(engine.cancel(&target.id()), Err(SwarmError::NotFound(_))));

    let first = events.try_recv().unwrap();
    assert!(matches!(first, SwarmEvent::DownloadStarted { candidates: 2, .. }));
    let last = std::iter::from_fn(|| events.try_recv().ok()).last().unwrap();
    assert!(matches!(last, SwarmEvent::DownloadCompleted { .. }));
}
