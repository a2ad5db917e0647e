//! A contiguous byte range of the target and its download state.

use crate::error::FailureReason;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::ops::Range;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "state")]
pub enum SegmentStatus {
    Unclaimed,
    Assigned { candidate: String },
    /// Received blocks are being hashed
    Verifying { candidate: String },
    Complete,
    /// Never held by a live segment: a failure returns the segment to `Unclaimed`
    /// in the same step and is kept in `last_failure`. Present for serialized state.
    Failed { reason: FailureReason },
    Cancelled,
}

impl SegmentStatus {
    pub fn candidate(&self) -> Option<&str> {
        match self {
            SegmentStatus::Assigned { candidate } | SegmentStatus::Verifying { candidate } => {
                Some(candidate)
            }
            _ => None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.candidate().is_some()
    }
}

/// One segment of the table.
///
/// `start <= verified_end <= received_end <= end` always holds; `buffer` holds exactly
/// the bytes in `verified_end..received_end`.
#[derive(Debug, Clone)]
pub struct Segment {
    pub id: u64,
    pub start: u64,
    pub end: u64,
    pub status: SegmentStatus,
    pub received_end: u64,
    pub verified_end: u64,
    pub retry_count: u32,
    /// Candidates that already failed this range
    pub failed_candidates: HashSet<String>,
    /// Candidates this range was ever assigned to
    pub tried_candidates: HashSet<String>,
    pub last_failure: Option<FailureReason>,
    pub(crate) buffer: Vec<u8>,
    /// Generation of the current assignment
    pub(crate) assignment: Option<u64>,
    pub(crate) assigned_at: Option<Instant>,
    pub(crate) received_at_assignment: u64,
}

impl Segment {
    pub fn new(id: u64, range: Range<u64>) -> Self {
        Self {
            id,
            start: range.start,
            end: range.end,
            status: SegmentStatus::Unclaimed,
            received_end: range.start,
            verified_end: range.start,
            retry_count: 0,
            failed_candidates: HashSet::new(),
            tried_candidates: HashSet::new(),
            last_failure: None,
            buffer: Vec::new(),
            assignment: None,
            assigned_at: None,
            received_at_assignment: range.start,
        }
    }

    pub fn range(&self) -> Range<u64> {
        self.start..self.end
    }

    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn unreceived(&self) -> u64 {
        self.end - self.received_end
    }

    pub fn is_complete(&self) -> bool {
        self.status == SegmentStatus::Complete
    }

    /// Cut the segment at `at`, keeping `start..at` and returning `at..end` as a fresh
    /// unclaimed segment. `at` must not fall below the received data.
    pub(crate) fn split_off(&mut self, at: u64, id: u64) -> Segment {
        debug_assert!(at >= self.received_end && at < self.end);
        let mut tail = Segment::new(id, at..self.end);
        tail.retry_count = self.retry_count;
        tail.failed_candidates = self.failed_candidates.clone();
        tail.tried_candidates = self.tried_candidates.clone();
        self.end = at;
        tail
    }

    /// Cut off the verified prefix as its own complete segment, leaving `self` to
    /// start at `verified_end`.
    pub(crate) fn split_verified_prefix(&mut self, id: u64) -> Option<Segment> {
        if self.verified_end == self.start {
            return None;
        }
        let mut head = Segment::new(id, self.start..self.verified_end);
        head.received_end = self.verified_end;
        head.verified_end = self.verified_end;
        head.status = SegmentStatus::Complete;
        self.start = self.verified_end;
        Some(head)
    }

    /// Drop received-but-unverified data and return to the unclaimed state.
    pub(crate) fn reset_unverified(&mut self) {
        self.buffer.clear();
        self.received_end = self.verified_end;
        self.assignment = None;
        self.assigned_at = None;
    }

    pub(crate) fn assign(&mut self, candidate: &str, generation: u64, now: Instant) {
        self.tried_candidates.insert(candidate.to_string());
        self.status = SegmentStatus::Assigned {
            candidate: candidate.to_string(),
        };
        self.assignment = Some(generation);
        self.assigned_at = Some(now);
        self.received_at_assignment = self.received_end;
    }

    /// Bytes per second delivered by the current assignment, if measurable.
    pub(crate) fn live_rate(&self, now: Instant) -> Option<f64> {
        let since = self.assigned_at?;
        let secs = now.saturating_duration_since(since).as_secs_f64();
        if secs <= 0.0 {
            return None;
        }
        Some((self.received_end - self.received_at_assignment) as f64 / secs)
    }

    pub fn info(&self) -> SegmentInfo {
        SegmentInfo {
            id: self.id,
            start: self.start,
            end: self.end,
            status: self.status.clone(),
            received_end: self.received_end,
            verified_end: self.verified_end,
            retry_count: self.retry_count,
            last_failure: self.last_failure.clone(),
        }
    }
}

/// Snapshot of a segment without its buffer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentInfo {
    pub id: u64,
    pub start: u64,
    pub end: u64,
    pub status: SegmentStatus,
    pub received_end: u64,
    pub verified_end: u64,
    pub retry_count: u32,
    pub last_failure: Option<FailureReason>,
}
