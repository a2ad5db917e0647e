//! Remote sources for a download target.

use crate::error::FailureKind;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tokio::time::Instant;

/// What a source advertised about itself
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilitySet {
    /// Serves arbitrary byte ranges
    pub range_requests: bool,
    /// Behind a firewall; must be reached through a push proxy
    pub push_required: bool,
    /// Serves hash tree nodes
    pub tree_exchange: bool,
}

impl Default for CapabilitySet {
    fn default() -> Self {
        Self {
            range_requests: true,
            push_required: false,
            tree_exchange: true,
        }
    }
}

/// How a candidate can be used, derived from its capability set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CandidateClass {
    Direct,
    PushProxy,
    /// No range support; never assigned a segment
    Unusable,
}

impl CapabilitySet {
    pub fn classify(&self) -> CandidateClass {
        match (self.range_requests, self.push_required) {
            (false, _) => CandidateClass::Unusable,
            (true, false) => CandidateClass::Direct,
            (true, true) => CandidateClass::PushProxy,
        }
    }
}

/// A source known for one target
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    /// Address (host:port or push-proxy identifier)
    pub id: String,
    pub capabilities: CapabilitySet,
    pub vendor: Option<String>,
}

impl Candidate {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            capabilities: CapabilitySet::default(),
            vendor: None,
        }
    }

    pub fn with_capabilities(mut self, capabilities: CapabilitySet) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_vendor(mut self, vendor: impl Into<String>) -> Self {
        self.vendor = Some(vendor.into());
        self
    }

    pub fn class(&self) -> CandidateClass {
        self.capabilities.classify()
    }
}

/// Entry of a candidate's bounded event log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "event")]
pub enum CandidateEvent {
    Added,
    Assigned,
    Released,
    /// Released with a short pause that does not count as a failure
    Deferred { cooldown_ms: u64 },
    Succeeded { bytes: u64 },
    Failed { kind: FailureKind, cooldown_ms: u64 },
    MarkedBad,
    Removed,
}

/// Mutable ranking state the pool keeps per candidate
#[derive(Debug, Clone)]
pub struct CandidateState {
    pub candidate: Candidate,
    pub score: f64,
    pub success_count: u32,
    pub consecutive_failures: u32,
    pub hash_mismatches: u32,
    pub cooldown_until: Option<Instant>,
    /// Transfer rate estimate in bytes per second
    pub throughput: f64,
    pub assigned: bool,
    pub bad: bool,
    pub last_failure: Option<FailureKind>,
    pub added_order: u64,
    log: VecDeque<CandidateEvent>,
    log_size: usize,
}

impl CandidateState {
    pub fn new(candidate: Candidate, added_order: u64, log_size: usize) -> Self {
        let mut state = Self {
            candidate,
            score: 0.5,
            success_count: 0,
            consecutive_failures: 0,
            hash_mismatches: 0,
            cooldown_until: None,
            throughput: 0.0,
            assigned: false,
            bad: false,
            last_failure: None,
            added_order,
            log: VecDeque::new(),
            log_size,
        };
        state.record(CandidateEvent::Added);
        state
    }

    pub fn is_cooled_down(&self, now: Instant) -> bool {
        matches!(self.cooldown_until, Some(until) if now < until)
    }

    pub fn record(&mut self, event: CandidateEvent) {
        if self.log_size == 0 {
            return;
        }
        if self.log.len() == self.log_size {
            self.log.pop_front();
        }
        self.log.push_back(event);
    }

    pub fn log(&self) -> impl Iterator<Item = &CandidateEvent> {
        self.log.iter()
    }
}

/// Read-only view of a candidate for progress reporting
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateSnapshot {
    pub id: String,
    pub class: CandidateClass,
    pub score: f64,
    pub success_count: u32,
    pub consecutive_failures: u32,
    pub hash_mismatches: u32,
    pub cooldown_remaining_ms: u64,
    pub throughput: f64,
    pub assigned: bool,
    pub bad: bool,
    pub last_failure: Option<FailureKind>,
}

impl CandidateSnapshot {
    pub fn from_state(state: &CandidateState, now: Instant) -> Self {
        let cooldown_remaining_ms = state
            .cooldown_until
            .map(|until| until.saturating_duration_since(now).as_millis() as u64)
            .unwrap_or(0);
        Self {
            id: state.candidate.id.clone(),
            class: state.candidate.class(),
            score: state.score,
            success_count: state.success_count,
            consecutive_failures: state.consecutive_failures,
            hash_mismatches: state.hash_mismatches,
            cooldown_remaining_ms,
            throughput: state.throughput,
            assigned: state.assigned,
            bad: state.bad,
            last_failure: state.last_failure,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_matches_on_capabilities() {
        let direct = CapabilitySet::default();
        assert_eq!(direct.classify(), CandidateClass::Direct);

        let pushed = CapabilitySet {
            push_required: true,
            ..Default::default()
        };
        assert_eq!(pushed.classify(), CandidateClass::PushProxy);

        let no_ranges = CapabilitySet {
            range_requests: false,
            ..Default::default()
        };
        assert_eq!(no_ranges.classify(), CandidateClass::Unusable);
    }

    #[test]
    fn log_is_bounded() {
        let mut state = CandidateState::new(Candidate::new("10.0.0.1:6346"), 0, 2);
        state.record(CandidateEvent::Assigned);
        state.record(CandidateEvent::Released);
        let events: Vec<_> = state.log().cloned().collect();
        assert_eq!(events, vec![CandidateEvent::Assigned, CandidateEvent::Released]);
    }
}
