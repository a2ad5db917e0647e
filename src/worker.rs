//! One transfer task per assignment.
//!
//! A worker fetches tree metadata when the assigned range cannot be verified yet,
//! streams the range from its candidate into the segment manager and reports the
//! first failure it sees. It never retries: the scheduling loop decides what happens
//! to the range next.

use crate::error::{FailureKind, FailureReason, SegmentFault, TransferError, TreeFetchError};
use crate::segment_manager::{Assignment, ReceiveOutcome, SegmentManager};
use crate::thex::decode_nodes;
use crate::transport::{RangeFetcher, RangeRequest, TreeFetcher};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// How a worker ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "outcome", content = "detail")]
pub enum WorkerOutcome {
    Completed,
    Failed(FailureKind),
    Rejected(FailureReason),
    LocalError(String),
    Cancelled,
    /// The assignment was taken away while the worker was running
    Superseded,
}

pub struct SegmentWorker {
    manager: Arc<SegmentManager>,
    fetcher: Arc<dyn RangeFetcher>,
    trees: Option<Arc<dyn TreeFetcher>>,
    assignment: Assignment,
    cancel: CancellationToken,
}

impl SegmentWorker {
    pub fn new(
        manager: Arc<SegmentManager>,
        fetcher: Arc<dyn RangeFetcher>,
        trees: Option<Arc<dyn TreeFetcher>>,
        assignment: Assignment,
    ) -> Self {
        let cancel = manager.worker_token();
        Self {
            manager,
            fetcher,
            trees,
            assignment,
            cancel,
        }
    }

    pub fn assignment(&self) -> &Assignment {
        &self.assignment
    }

    pub async fn run(self) -> WorkerOutcome {
        let started = Instant::now();
        let outcome = self.transfer().await;
        debug!(
            target_id = %self.manager.target_id(),
            candidate = %self.assignment.candidate.id,
            start = self.assignment.range.start,
            end = self.assignment.range.end,
            elapsed_ms = started.elapsed().as_millis() as u64,
            outcome = ?outcome,
            "Worker finished"
        );
        outcome
    }

    fn fail(&self, kind: FailureKind) -> WorkerOutcome {
        self.manager.on_candidate_error(&self.assignment, kind);
        WorkerOutcome::Failed(kind)
    }

    fn stream_ended(&self) -> WorkerOutcome {
        match self.manager.on_stream_end(&self.assignment) {
            Ok(None) => WorkerOutcome::Completed,
            Ok(Some(FailureReason::Candidate(kind))) => WorkerOutcome::Failed(kind),
            Ok(Some(reason)) => WorkerOutcome::Rejected(reason),
            Err(SegmentFault::Cancelled) => WorkerOutcome::Cancelled,
            Err(_) => WorkerOutcome::Superseded,
        }
    }

    async fn transfer(&self) -> WorkerOutcome {
        let config = self.manager.config();
        let request_timeout = config.request_timeout();
        let read_timeout = config.read_timeout();

        if let Some(outcome) = self.grow_tree(request_timeout).await {
            return outcome;
        }

        let request = RangeRequest {
            offset: self.assignment.range.start,
            length: self.assignment.range.end - self.assignment.range.start,
            timeout: request_timeout,
        };
        let opened = tokio::select! {
            _ = self.cancel.cancelled() => return WorkerOutcome::Cancelled,
            opened = timeout(
                request_timeout,
                self.fetcher.fetch_range(&self.assignment.candidate, request),
            ) => opened,
        };
        let mut stream = match opened {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                debug!(candidate = %self.assignment.candidate.id, "Range request failed: {}", e);
                return self.fail(FailureKind::from(&e));
            }
            Err(_) => return self.fail(FailureKind::Timeout),
        };

        let mut offset = request.offset;
        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => return WorkerOutcome::Cancelled,
                next = timeout(read_timeout, stream.next()) => next,
            };
            let chunk = match next {
                Err(_) => {
                    debug!(candidate = %self.assignment.candidate.id, offset, "Transfer stalled");
                    return self.fail(FailureKind::Timeout);
                }
                Ok(None) => {
                    debug!(candidate = %self.assignment.candidate.id, offset, "Stream ended");
                    return self.stream_ended();
                }
                Ok(Some(Err(e))) => return self.fail(FailureKind::from(&e)),
                Ok(Some(Ok(chunk))) => chunk,
            };
            if chunk.is_empty() {
                continue;
            }

            let received = tokio::select! {
                _ = self.cancel.cancelled() => return WorkerOutcome::Cancelled,
                received = self.manager.on_bytes_received(&self.assignment, offset, &chunk) => received,
            };
            match received {
                Ok(ReceiveOutcome::Progress { .. }) => offset += chunk.len() as u64,
                Ok(ReceiveOutcome::Complete) => return WorkerOutcome::Completed,
                Ok(ReceiveOutcome::Rejected(reason)) => return WorkerOutcome::Rejected(reason),
                Err(SegmentFault::Cancelled) => return WorkerOutcome::Cancelled,
                Err(SegmentFault::StaleAssignment(_)) => return WorkerOutcome::Superseded,
                Err(SegmentFault::Gap { .. }) => {
                    return WorkerOutcome::Failed(FailureKind::ProtocolError)
                }
                Err(e @ (SegmentFault::Io(_) | SegmentFault::Hash(_))) => {
                    warn!(target_id = %self.manager.target_id(), "Local failure: {}", e);
                    return WorkerOutcome::LocalError(e.to_string());
                }
            }
        }
    }

    /// Fetch and merge tree nodes when the assigned range is not covered by trusted
    /// leaves. Returns an outcome only when the worker must stop.
    async fn grow_tree(&self, request_timeout: Duration) -> Option<WorkerOutcome> {
        let trees = self.trees.as_ref()?;
        let candidate = &self.assignment.candidate;
        if !candidate.capabilities.tree_exchange {
            return None;
        }
        let target = self.manager.target();
        if target.read_tree().covers(self.assignment.range.clone()) {
            return None;
        }

        let root = target.root();
        let fetched = tokio::select! {
            _ = self.cancel.cancelled() => return Some(WorkerOutcome::Cancelled),
            fetched = timeout(request_timeout, trees.fetch_tree_metadata(candidate, &root)) => fetched,
        };
        let bytes = match fetched {
            Ok(Ok(bytes)) => bytes,
            Ok(Err(TreeFetchError::Unavailable)) => {
                debug!(candidate = %candidate.id, "Candidate has no tree data");
                return None;
            }
            Ok(Err(e)) => {
                debug!(candidate = %candidate.id, "Tree request failed: {}", e);
                return Some(self.fail(FailureKind::from(&e)));
            }
            Err(_) => return Some(self.fail(FailureKind::from(&TransferError::Timeout))),
        };

        let nodes = match decode_nodes(&bytes) {
            Ok(nodes) => nodes,
            Err(e) => {
                debug!(candidate = %candidate.id, "Undecodable tree data: {}", e);
                return Some(self.fail(FailureKind::ProtocolError));
            }
        };
        match self.manager.merge_tree_nodes(&nodes) {
            Ok(gained) => {
                debug!(candidate = %candidate.id, gained, "Merged tree nodes from candidate");
                None
            }
            Err(e) if e.is_tree_mismatch() => {
                warn!(candidate = %candidate.id, "Candidate served a conflicting tree: {}", e);
                Some(self.fail(FailureKind::TreeMismatch))
            }
            Err(e) => {
                debug!(candidate = %candidate.id, "Tree merge failed: {}", e);
                Some(self.fail(FailureKind::ProtocolError))
            }
        }
    }
}
