//! Authoritative segment table of one download.
//!
//! Segments always partition `[0, total_size)`. Every mutation of the table happens
//! under one lock; hashing, sink writes and candidate pool updates that can wait are
//! done after it is released. Workers identify their assignment by a generation
//! number, so a worker whose segment was failed, cancelled or split under it cannot
//! write into someone else's range.

use crate::candidate::Candidate;
use crate::candidate_pool::CandidatePool;
use crate::config::DownloadConfig;
use crate::download::SwarmEvent;
use crate::error::{FailureKind, FailureReason, FailureSummary, HashError, SegmentFault, SwarmError};
use crate::hash_queue::HashCalculationQueue;
use crate::segment::{Segment, SegmentInfo, SegmentStatus};
use crate::target::DownloadTarget;
use crate::thex::{TigerHash, TreeNode, VerifyResult};
use crate::transport::DataSink;
use serde::{Deserialize, Serialize};
use std::ops::Range;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

fn align_up(value: u64, block: u64) -> u64 {
    value.div_ceil(block) * block
}

fn align_down(value: u64, block: u64) -> u64 {
    value / block * block
}

/// A segment handed to a candidate
#[derive(Debug, Clone)]
pub struct Assignment {
    pub segment_id: u64,
    pub generation: u64,
    pub candidate: Candidate,
    pub range: Range<u64>,
}

/// What happened to bytes handed to `on_bytes_received`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiveOutcome {
    /// Accepted; keep streaming
    Progress { received_end: u64, verified_end: u64 },
    /// The whole segment is verified and written
    Complete,
    /// The segment was given up; stop streaming
    Rejected(FailureReason),
}

/// Aggregate state of one download
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadProgress {
    pub target_id: String,
    pub total_size: u64,
    pub bytes_verified: u64,
    pub bytes_received: u64,
    pub active_sources: usize,
    pub segments_total: usize,
    pub segments_complete: usize,
    pub segments_active: usize,
    pub failures: u64,
    pub hash_mismatches: u64,
    pub complete: bool,
    pub cancelled: bool,
}

#[derive(Default)]
struct Table {
    segments: Vec<Segment>,
    next_id: u64,
    next_generation: u64,
    cancelled: bool,
    failures: u64,
    hash_mismatches: u64,
}

impl Table {
    fn take_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn take_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }
}

/// Candidate-side consequence of a segment failure, applied after the lock is dropped
enum Followup {
    Penalize(String, FailureKind),
    Defer(String),
    Release(String),
    Nothing,
}

pub struct SegmentManager {
    target: DownloadTarget,
    target_id: String,
    config: DownloadConfig,
    pool: Arc<CandidatePool>,
    queue: HashCalculationQueue,
    sink: Arc<dyn DataSink>,
    table: Mutex<Table>,
    cancel: CancellationToken,
    notify: Arc<Notify>,
    events: Option<mpsc::UnboundedSender<SwarmEvent>>,
}

impl SegmentManager {
    pub fn new(
        target: DownloadTarget,
        config: DownloadConfig,
        pool: Arc<CandidatePool>,
        queue: HashCalculationQueue,
        sink: Arc<dyn DataSink>,
    ) -> Self {
        let mut table = Table::default();
        let total = target.total_size();
        let block = target.block_size();
        if total > 0 {
            let step = if config.presplit {
                align_up(config.initial_segment_size.max(1), block)
            } else {
                total
            };
            let mut start = 0;
            while start < total {
                let end = (start + step).min(total);
                let id = table.take_id();
                table.segments.push(Segment::new(id, start..end));
                start = end;
            }
        }

        Self {
            target_id: target.id(),
            target,
            config,
            pool,
            queue,
            sink,
            table: Mutex::new(table),
            cancel: CancellationToken::new(),
            notify: Arc::new(Notify::new()),
            events: None,
        }
    }

    pub fn with_events(mut self, events: mpsc::UnboundedSender<SwarmEvent>) -> Self {
        self.events = Some(events);
        self
    }

    fn table(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: SwarmEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }

    pub fn target(&self) -> &DownloadTarget {
        &self.target
    }

    pub fn target_id(&self) -> &str {
        &self.target_id
    }

    pub fn config(&self) -> &DownloadConfig {
        &self.config
    }

    pub fn pool(&self) -> &Arc<CandidatePool> {
        &self.pool
    }

    /// Woken whenever a segment finishes, fails or the download is cancelled.
    pub fn notifier(&self) -> Arc<Notify> {
        self.notify.clone()
    }

    /// Token for a worker; fired by `cancel`.
    pub fn worker_token(&self) -> CancellationToken {
        self.cancel.child_token()
    }

    pub fn cancelled(&self) -> tokio_util::sync::WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    /// Hand out the next piece of work, or `None` when there is nothing to hand out
    /// right now. Never blocks.
    pub fn allocate_work(&self) -> Option<Assignment> {
        if self.cancel.is_cancelled() {
            return None;
        }
        let now = Instant::now();
        let mut table = self.table();
        if table.cancelled {
            return None;
        }

        let mut order: Vec<usize> = table
            .segments
            .iter()
            .enumerate()
            .filter(|(_, seg)| seg.status == SegmentStatus::Unclaimed && !seg.is_empty())
            .map(|(idx, _)| idx)
            .collect();

        if order.is_empty() {
            return self.steal(&mut table, now);
        }

        order.sort_by(|&a, &b| {
            let (a, b) = (&table.segments[a], &table.segments[b]);
            b.len()
                .cmp(&a.len())
                .then(a.retry_count.cmp(&b.retry_count))
                .then(a.start.cmp(&b.start))
        });

        for idx in order {
            let seg = &table.segments[idx];
            let candidate = self.pool.next_eligible_for(
                &self.target_id,
                &seg.failed_candidates,
                &seg.tried_candidates,
            );
            if let Some(candidate) = candidate {
                return Some(self.carve(&mut table, idx, candidate, now));
            }
        }
        None
    }

    /// Segment size for a candidate: enough for `segment_target_time` at its measured
    /// rate, block aligned, between one block and the maximum segment size.
    fn preferred_size(&self, candidate: &str) -> u64 {
        let block = self.target.block_size();
        let rate = self.pool.throughput(&self.target_id, candidate);
        let raw = if rate > 0.0 {
            (rate * self.config.segment_target_time_secs as f64) as u64
        } else {
            self.config.initial_segment_size
        };
        let max = align_down(self.config.max_segment_size, block).max(block);
        align_up(raw.max(1), block).clamp(block, max)
    }

    fn carve(&self, table: &mut Table, idx: usize, candidate: Candidate, now: Instant) -> Assignment {
        let preferred = self.preferred_size(&candidate.id);
        if table.segments[idx].len() > preferred {
            let id = table.take_id();
            let at = table.segments[idx].start + preferred;
            let tail = table.segments[idx].split_off(at, id);
            table.segments.insert(idx + 1, tail);
        }

        let generation = table.take_generation();
        let seg = &mut table.segments[idx];
        seg.assign(&candidate.id, generation, now);
        debug!(
            target_id = %self.target_id,
            segment = seg.id,
            start = seg.start,
            end = seg.end,
            candidate = %candidate.id,
            "Assigned segment"
        );
        Assignment {
            segment_id: seg.id,
            generation,
            range: seg.range(),
            candidate,
        }
    }

    /// Split the unreceived tail of the slowest in-flight segment and give it to an
    /// idle candidate that is sufficiently faster.
    fn steal(&self, table: &mut Table, now: Instant) -> Option<Assignment> {
        let block = self.target.block_size();
        let min_split = self.config.min_split_size.max(block);

        let (idx, victim_rate) = table
            .segments
            .iter()
            .enumerate()
            .filter(|(_, seg)| {
                seg.status.is_active() && seg.unreceived() >= min_split.saturating_mul(2)
            })
            .map(|(idx, seg)| (idx, seg.live_rate(now).unwrap_or(0.0)))
            .min_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))?;

        let candidate = self.pool.next_eligible_for(
            &self.target_id,
            &table.segments[idx].failed_candidates,
            &table.segments[idx].tried_candidates,
        )?;
        let rate = self.pool.throughput(&self.target_id, &candidate.id);
        if rate <= 0.0 || rate < victim_rate * self.config.steal_speed_ratio {
            self.pool.release(&self.target_id, &candidate.id);
            return None;
        }

        let victim = &table.segments[idx];
        let mid = align_up(victim.received_end + victim.unreceived() / 2, block);
        if mid <= victim.received_end || mid >= victim.end {
            self.pool.release(&self.target_id, &candidate.id);
            return None;
        }

        let id = table.take_id();
        let tail = table.segments[idx].split_off(mid, id);
        table.segments.insert(idx + 1, tail);
        info!(
            target_id = %self.target_id,
            victim = table.segments[idx].id,
            split_at = mid,
            candidate = %candidate.id,
            rate,
            victim_rate,
            "Stealing segment tail for faster candidate"
        );

        let generation = table.take_generation();
        let seg = &mut table.segments[idx + 1];
        seg.assign(&candidate.id, generation, now);
        Some(Assignment {
            segment_id: seg.id,
            generation,
            range: seg.range(),
            candidate,
        })
    }

    fn current(&self, table: &Table, assignment: &Assignment) -> Result<usize, SegmentFault> {
        if table.cancelled {
            return Err(SegmentFault::Cancelled);
        }
        table
            .segments
            .iter()
            .position(|seg| seg.assignment == Some(assignment.generation))
            .ok_or(SegmentFault::StaleAssignment(assignment.segment_id))
    }

    /// Accept bytes streamed for `assignment` starting at `offset`.
    ///
    /// Data outside the segment is dropped, bytes already received are ignored and a
    /// gap fails the segment. Complete blocks are verified and, when valid, written to
    /// the sink before the segment advances.
    pub async fn on_bytes_received(
        &self,
        assignment: &Assignment,
        offset: u64,
        data: &[u8],
    ) -> Result<ReceiveOutcome, SegmentFault> {
        {
            let mut table = self.table();
            let idx = self.current(&table, assignment)?;
            let seg = &mut table.segments[idx];
            if seg.is_complete() {
                return Ok(ReceiveOutcome::Complete);
            }
            if offset > seg.received_end {
                let expected = seg.received_end;
                let followup = self.fail_locked(
                    &mut table,
                    idx,
                    FailureReason::Candidate(FailureKind::ProtocolError),
                );
                drop(table);
                self.apply(followup);
                return Err(SegmentFault::Gap {
                    expected,
                    got: offset,
                });
            }
            let from = seg.received_end.max(offset);
            let to = (offset + data.len() as u64).min(seg.end);
            if to > from {
                let slice = &data[(from - offset) as usize..(to - offset) as usize];
                seg.buffer.extend_from_slice(slice);
                seg.received_end = to;
            }
        }

        let block = self.target.block_size();
        loop {
            let (verify_from, batch) = {
                let mut table = self.table();
                let idx = self.current(&table, assignment)?;
                let seg = &mut table.segments[idx];
                if seg.is_complete() {
                    return Ok(ReceiveOutcome::Complete);
                }
                let verify_to = if seg.received_end == seg.end {
                    seg.end
                } else {
                    align_down(seg.received_end, block)
                };
                if verify_to <= seg.verified_end {
                    return Ok(ReceiveOutcome::Progress {
                        received_end: seg.received_end,
                        verified_end: seg.verified_end,
                    });
                }
                let len = (verify_to - seg.verified_end) as usize;
                seg.status = SegmentStatus::Verifying {
                    candidate: assignment.candidate.id.clone(),
                };
                (seg.verified_end, seg.buffer[..len].to_vec())
            };

            let result = self
                .queue
                .verify(self.target.tree().clone(), verify_from, batch.clone())
                .await;

            let result = match result {
                Ok(result) => result,
                Err(e) => {
                    self.fail_assignment(assignment, FailureReason::Io(e.to_string()));
                    return Err(SegmentFault::Hash(e));
                }
            };

            match result {
                VerifyResult::Invalid => {
                    warn!(
                        target_id = %self.target_id,
                        candidate = %assignment.candidate.id,
                        offset = verify_from,
                        len = batch.len(),
                        "Received data failed verification"
                    );
                    let reason = FailureReason::Candidate(FailureKind::HashMismatch);
                    self.fail_current(assignment, reason.clone())?;
                    return Ok(ReceiveOutcome::Rejected(reason));
                }
                VerifyResult::Indeterminate => {
                    let mut table = self.table();
                    let idx = self.current(&table, assignment)?;
                    let seg = &mut table.segments[idx];
                    seg.status = SegmentStatus::Assigned {
                        candidate: assignment.candidate.id.clone(),
                    };
                    if seg.buffer.len() > self.config.max_unverified_buffer {
                        debug!(
                            target_id = %self.target_id,
                            segment = seg.id,
                            buffered = seg.buffer.len(),
                            "Giving up segment that cannot be verified"
                        );
                        let followup =
                            self.fail_locked(&mut table, idx, FailureReason::TreeUnavailable);
                        drop(table);
                        self.apply(followup);
                        return Ok(ReceiveOutcome::Rejected(FailureReason::TreeUnavailable));
                    }
                    return Ok(ReceiveOutcome::Progress {
                        received_end: seg.received_end,
                        verified_end: seg.verified_end,
                    });
                }
                VerifyResult::Valid => {}
            }

            {
                let table = self.table();
                self.current(&table, assignment)?;
            }
            if let Err(e) = self.sink.write_at(verify_from, &batch).await {
                warn!(target_id = %self.target_id, offset = verify_from, "Sink write failed: {}", e);
                self.fail_assignment(assignment, FailureReason::Io(e.to_string()));
                return Err(SegmentFault::Io(e));
            }

            let mut table = self.table();
            let idx = self.current(&table, assignment)?;
            let seg = &mut table.segments[idx];
            let len = batch.len();
            seg.verified_end += len as u64;
            seg.buffer.drain(..len);
            if seg.verified_end < seg.end {
                seg.status = SegmentStatus::Assigned {
                    candidate: assignment.candidate.id.clone(),
                };
                continue;
            }

            seg.status = SegmentStatus::Complete;
            seg.buffer = Vec::new();
            let range = seg.range();
            let bytes = seg.received_end - seg.received_at_assignment;
            let elapsed = seg
                .assigned_at
                .map(|at| at.elapsed())
                .unwrap_or_default();
            drop(table);

            debug!(
                target_id = %self.target_id,
                start = range.start,
                end = range.end,
                candidate = %assignment.candidate.id,
                "Segment complete"
            );
            self.pool
                .report_success(&self.target_id, &assignment.candidate.id, bytes, elapsed);
            self.pool.release(&self.target_id, &assignment.candidate.id);
            self.emit(SwarmEvent::SegmentCompleted {
                target_id: self.target_id.clone(),
                start: range.start,
                end: range.end,
                candidate: assignment.candidate.id.clone(),
            });
            self.notify.notify_one();
            return Ok(ReceiveOutcome::Complete);
        }
    }

    /// Return the segment to `Unclaimed`, keeping any verified prefix as a complete
    /// segment of its own.
    fn fail_locked(&self, table: &mut Table, idx: usize, reason: FailureReason) -> Followup {
        let prefix_id = table.next_id;
        let seg = &mut table.segments[idx];
        let candidate = seg.status.candidate().map(str::to_string);

        if let (FailureReason::Candidate(kind), Some(id)) = (&reason, &candidate) {
            if kind.is_integrity_violation() {
                seg.failed_candidates.insert(id.clone());
            }
        }
        seg.retry_count = seg.retry_count.saturating_add(1);
        seg.last_failure = Some(reason.clone());
        seg.status = SegmentStatus::Unclaimed;
        let prefix = seg.split_verified_prefix(prefix_id);
        seg.reset_unverified();
        let range = seg.range();

        if let Some(prefix) = prefix {
            table.next_id += 1;
            table.segments.insert(idx, prefix);
        }
        table.failures += 1;
        if reason == FailureReason::Candidate(FailureKind::HashMismatch) {
            table.hash_mismatches += 1;
        }

        debug!(
            target_id = %self.target_id,
            start = range.start,
            end = range.end,
            reason = %reason,
            "Segment failed"
        );
        self.emit(SwarmEvent::SegmentFailed {
            target_id: self.target_id.clone(),
            start: range.start,
            end: range.end,
            reason: reason.clone(),
        });

        match (reason, candidate) {
            (FailureReason::Candidate(kind), Some(id)) => Followup::Penalize(id, kind),
            (FailureReason::TreeUnavailable, Some(id)) => Followup::Defer(id),
            (_, Some(id)) => Followup::Release(id),
            (_, None) => Followup::Nothing,
        }
    }

    fn apply(&self, followup: Followup) {
        match followup {
            Followup::Penalize(id, kind) => {
                if let Some(outcome) = self.pool.report_failure(&self.target_id, &id, kind) {
                    self.emit(SwarmEvent::CandidatePenalized {
                        target_id: self.target_id.clone(),
                        candidate: id,
                        kind,
                        outcome,
                    });
                }
            }
            Followup::Defer(id) => {
                self.pool
                    .defer(&self.target_id, &id, self.config.unverifiable_retry())
            }
            Followup::Release(id) => self.pool.release(&self.target_id, &id),
            Followup::Nothing => {}
        }
        self.notify.notify_one();
    }

    fn fail_current(&self, assignment: &Assignment, reason: FailureReason) -> Result<(), SegmentFault> {
        let mut table = self.table();
        let idx = self.current(&table, assignment)?;
        if table.segments[idx].is_complete() {
            return Ok(());
        }
        let followup = self.fail_locked(&mut table, idx, reason);
        drop(table);
        self.apply(followup);
        Ok(())
    }

    fn fail_assignment(&self, assignment: &Assignment, reason: FailureReason) {
        if let Err(e) = self.fail_current(assignment, reason) {
            debug!(target_id = %self.target_id, "Ignoring failure of old assignment: {}", e);
        }
    }

    /// The candidate's stream ended before the segment completed.
    ///
    /// Returns `None` when the segment is already complete. A range that arrived in
    /// full but cannot be checked against the tree yet is given up as
    /// `TreeUnavailable` without blaming the candidate; a short stream is a protocol
    /// error.
    pub fn on_stream_end(
        &self,
        assignment: &Assignment,
    ) -> Result<Option<FailureReason>, SegmentFault> {
        let mut table = self.table();
        let idx = self.current(&table, assignment)?;
        let seg = &table.segments[idx];
        if seg.is_complete() {
            return Ok(None);
        }
        let reason = if seg.received_end == seg.end {
            debug!(
                target_id = %self.target_id,
                segment = seg.id,
                candidate = %assignment.candidate.id,
                "Range received in full but not verifiable yet"
            );
            FailureReason::TreeUnavailable
        } else {
            FailureReason::Candidate(FailureKind::ProtocolError)
        };
        let followup = self.fail_locked(&mut table, idx, reason.clone());
        drop(table);
        self.apply(followup);
        Ok(Some(reason))
    }

    /// The candidate misbehaved; penalize it and make the range available again.
    pub fn on_candidate_error(&self, assignment: &Assignment, kind: FailureKind) {
        self.fail_assignment(assignment, FailureReason::Candidate(kind));
    }

    /// A local failure; the candidate is released without penalty.
    pub fn on_local_error(&self, assignment: &Assignment, error: &std::io::Error) {
        self.fail_assignment(assignment, FailureReason::Io(error.to_string()));
    }

    /// Grow the shared tree with nodes fetched from a candidate.
    pub fn merge_tree_nodes(&self, nodes: &[TreeNode]) -> Result<usize, HashError> {
        self.target.merge_nodes(nodes)
    }

    /// Stop the download. Every unfinished segment becomes `Cancelled` and workers see
    /// their token fire; later calls do nothing.
    pub fn cancel(&self) {
        let released: Vec<String> = {
            let mut table = self.table();
            if table.cancelled {
                return;
            }
            table.cancelled = true;
            table
                .segments
                .iter_mut()
                .filter(|seg| !seg.is_complete())
                .filter_map(|seg| {
                    let candidate = seg.status.candidate().map(str::to_string);
                    seg.status = SegmentStatus::Cancelled;
                    seg.reset_unverified();
                    candidate
                })
                .collect()
        };
        self.cancel.cancel();
        for id in &released {
            self.pool.release(&self.target_id, id);
        }
        info!(target_id = %self.target_id, released = released.len(), "Download cancelled");
        self.notify.notify_one();
    }

    pub fn is_cancelled(&self) -> bool {
        self.table().cancelled
    }

    pub fn is_complete(&self) -> bool {
        self.table().segments.iter().all(Segment::is_complete)
    }

    pub fn has_unclaimed(&self) -> bool {
        self.table()
            .segments
            .iter()
            .any(|seg| seg.status == SegmentStatus::Unclaimed)
    }

    pub fn active_count(&self) -> usize {
        self.table()
            .segments
            .iter()
            .filter(|seg| seg.status.is_active())
            .count()
    }

    /// Re-hash everything written to the sink and compare with the target root.
    pub async fn verify_complete_file(&self) -> Result<TigerHash, SwarmError> {
        self.sink.flush().await?;
        let digest = self
            .queue
            .compute_tree(self.sink.tree_source(), self.target.block_size())
            .await?;
        let actual = digest.tree.root();
        if actual != self.target.root() || digest.size != self.target.total_size() {
            return Err(SwarmError::FinalVerification {
                expected: self.target.root().to_urn(),
                actual: actual.to_urn(),
            });
        }
        info!(target_id = %self.target_id, root = %actual, "Whole file verified");
        Ok(actual)
    }

    pub fn progress(&self) -> DownloadProgress {
        let table = self.table();
        let mut progress = DownloadProgress {
            target_id: self.target_id.clone(),
            total_size: self.target.total_size(),
            segments_total: table.segments.len(),
            failures: table.failures,
            hash_mismatches: table.hash_mismatches,
            cancelled: table.cancelled,
            ..Default::default()
        };
        let mut sources = std::collections::HashSet::new();
        for seg in &table.segments {
            progress.bytes_verified += seg.verified_end - seg.start;
            progress.bytes_received += seg.received_end - seg.start;
            if seg.is_complete() {
                progress.segments_complete += 1;
            }
            if let Some(candidate) = seg.status.candidate() {
                progress.segments_active += 1;
                sources.insert(candidate.to_string());
            }
        }
        progress.active_sources = sources.len();
        progress.complete = progress.segments_complete == progress.segments_total;
        progress
    }

    pub fn failure_summary(&self) -> FailureSummary {
        let mut remaining: Vec<Range<u64>> = Vec::new();
        {
            let table = self.table();
            for seg in table.segments.iter().filter(|seg| !seg.is_complete()) {
                match remaining.last_mut() {
                    Some(last) if last.end == seg.start => last.end = seg.end,
                    _ => remaining.push(seg.range()),
                }
            }
        }
        FailureSummary {
            remaining_bytes: remaining.iter().map(|r| r.end - r.start).sum(),
            remaining,
            last_errors: self.pool.recent_failures(&self.target_id),
            known_candidates: self.pool.known_count(&self.target_id),
        }
    }

    pub fn segments(&self) -> Vec<SegmentInfo> {
        self.table().segments.iter().map(Segment::info).collect()
    }
}
