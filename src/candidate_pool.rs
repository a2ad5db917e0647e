//! Candidate tables per download target.
//!
//! The pool decides which source gets the next segment and how long a failing source
//! is left alone. Transient failures cool a candidate down for a growing step; hash
//! mismatches cool it down for hours and eventually get it removed and banned.

use crate::candidate::{
    Candidate, CandidateClass, CandidateEvent, CandidateSnapshot, CandidateState,
};
use crate::config::CandidateConfig;
use crate::error::FailureKind;
use crate::security::{AccessControl, BanBatch};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Recent failures kept per target for failure summaries
const RECENT_FAILURES: usize = 8;

/// EMA weight of the newest throughput sample
const THROUGHPUT_ALPHA: f64 = 0.2;

/// What `report_failure` did to the candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "outcome")]
pub enum FailureOutcome {
    CooledDown { cooldown_ms: u64, bad: bool },
    Removed,
    Banned,
}

#[derive(Default)]
struct TargetTable {
    candidates: HashMap<String, CandidateState>,
    banned: HashSet<String>,
    next_order: u64,
    recent_failures: VecDeque<(String, FailureKind)>,
}

impl TargetTable {
    fn eligible<'a>(
        &'a self,
        exclude: &'a HashSet<String>,
        now: Instant,
    ) -> impl Iterator<Item = &'a CandidateState> + 'a {
        self.candidates.values().filter(move |state| {
            !state.assigned
                && !state.is_cooled_down(now)
                && !exclude.contains(&state.candidate.id)
                && state.candidate.class() != CandidateClass::Unusable
        })
    }
}

/// Ranking: previously successful first, then good over bad, score, fewer consecutive
/// failures, throughput and finally the order candidates were learned.
fn rank(a: &CandidateState, b: &CandidateState) -> Ordering {
    (a.success_count > 0)
        .cmp(&(b.success_count > 0))
        .then((!a.bad).cmp(&!b.bad))
        .then(a.score.partial_cmp(&b.score).unwrap_or(Ordering::Equal))
        .then(b.consecutive_failures.cmp(&a.consecutive_failures))
        .then(
            a.throughput
                .partial_cmp(&b.throughput)
                .unwrap_or(Ordering::Equal),
        )
        .then(b.added_order.cmp(&a.added_order))
}

/// Candidate tables for all active targets
pub struct CandidatePool {
    config: CandidateConfig,
    access: Arc<dyn AccessControl>,
    bans: BanBatch,
    targets: Mutex<HashMap<String, TargetTable>>,
}

impl CandidatePool {
    pub fn new(config: CandidateConfig, access: Arc<dyn AccessControl>) -> Self {
        let bans = BanBatch::new(access.clone(), config.ban_batch_idle());
        Self {
            config,
            access,
            bans,
            targets: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &CandidateConfig {
        &self.config
    }

    pub fn ban_batch(&self) -> &BanBatch {
        &self.bans
    }

    fn tables(&self) -> MutexGuard<'_, HashMap<String, TargetTable>> {
        self.targets.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a source for `target`. Returns false when access control or an earlier
    /// ban for this target rejects it. Known candidates get their capabilities refreshed.
    pub fn add_candidate(&self, target: &str, candidate: Candidate) -> bool {
        if !self.access.is_access_granted(&candidate.id) {
            debug!(target_id = %target, candidate = %candidate.id, "Candidate denied by access control");
            return false;
        }

        let mut tables = self.tables();
        let table = tables.entry(target.to_string()).or_default();
        if table.banned.contains(&candidate.id) {
            debug!(target_id = %target, candidate = %candidate.id, "Candidate was banned for this target");
            return false;
        }

        if let Some(state) = table.candidates.get_mut(&candidate.id) {
            state.candidate.capabilities = candidate.capabilities;
            if candidate.vendor.is_some() {
                state.candidate.vendor = candidate.vendor;
            }
            return true;
        }

        let order = table.next_order;
        table.next_order += 1;
        debug!(
            target_id = %target,
            candidate = %candidate.id,
            class = ?candidate.class(),
            "Added candidate"
        );
        table.candidates.insert(
            candidate.id.clone(),
            CandidateState::new(candidate, order, self.config.candidate_log_size),
        );
        true
    }

    /// Pick and claim the best candidate that is idle, not cooling down and not in
    /// `exclude`.
    pub fn next_eligible(&self, target: &str, exclude: &HashSet<String>) -> Option<Candidate> {
        self.next_eligible_for(target, exclude, &HashSet::new())
    }

    /// Like `next_eligible`, but candidates in `tried` only win when no untried one
    /// is eligible.
    pub fn next_eligible_for(
        &self,
        target: &str,
        exclude: &HashSet<String>,
        tried: &HashSet<String>,
    ) -> Option<Candidate> {
        let now = Instant::now();
        let mut tables = self.tables();
        let table = tables.get_mut(target)?;
        let untried = |state: &CandidateState| !tried.contains(&state.candidate.id);
        let id = table
            .eligible(exclude, now)
            .max_by(|a, b| untried(*a).cmp(&untried(*b)).then_with(|| rank(a, b)))
            .map(|state| state.candidate.id.clone())?;

        let state = table.candidates.get_mut(&id)?;
        state.assigned = true;
        state.record(CandidateEvent::Assigned);
        Some(state.candidate.clone())
    }

    /// Whether `next_eligible` would return anything, without claiming.
    pub fn has_eligible(&self, target: &str, exclude: &HashSet<String>) -> bool {
        let now = Instant::now();
        self.tables()
            .get(target)
            .map(|table| table.eligible(exclude, now).next().is_some())
            .unwrap_or(false)
    }

    /// Return an assigned candidate to the eligible set.
    pub fn release(&self, target: &str, id: &str) {
        let mut tables = self.tables();
        if let Some(state) = tables
            .get_mut(target)
            .and_then(|table| table.candidates.get_mut(id))
        {
            if state.assigned {
                state.assigned = false;
                state.record(CandidateEvent::Released);
            }
        }
    }

    /// Release an assigned candidate but keep it out of rotation for `pause`. Failure
    /// counters and score are left alone.
    pub fn defer(&self, target: &str, id: &str, pause: Duration) {
        let now = Instant::now();
        let mut tables = self.tables();
        let Some(state) = tables
            .get_mut(target)
            .and_then(|table| table.candidates.get_mut(id))
        else {
            return;
        };
        state.assigned = false;
        let until = now + pause;
        if state.cooldown_until.map_or(true, |current| current < until) {
            state.cooldown_until = Some(until);
        }
        state.record(CandidateEvent::Deferred {
            cooldown_ms: pause.as_millis() as u64,
        });
        debug!(
            target_id = %target,
            candidate = %id,
            pause_ms = pause.as_millis() as u64,
            "Candidate deferred"
        );
    }

    pub fn report_success(&self, target: &str, id: &str, bytes: u64, elapsed: Duration) {
        let mut tables = self.tables();
        let Some(state) = tables
            .get_mut(target)
            .and_then(|table| table.candidates.get_mut(id))
        else {
            return;
        };

        state.success_count = state.success_count.saturating_add(1);
        state.consecutive_failures = 0;
        state.bad = false;
        state.cooldown_until = None;
        state.score = (state.score + 0.1).min(1.0);

        let secs = elapsed.as_secs_f64();
        if secs > 0.0 && bytes > 0 {
            let rate = bytes as f64 / secs;
            if rate.is_finite() {
                state.throughput = if state.throughput == 0.0 {
                    rate
                } else {
                    state.throughput * (1.0 - THROUGHPUT_ALPHA) + rate * THROUGHPUT_ALPHA
                };
            }
        }
        state.record(CandidateEvent::Succeeded { bytes });
        debug!(
            target_id = %target,
            candidate = %id,
            bytes,
            throughput = state.throughput,
            "Candidate succeeded"
        );
    }

    /// Penalize a candidate. The candidate is no longer considered assigned afterwards.
    /// Returns `None` when the candidate is unknown (already removed).
    pub fn report_failure(&self, target: &str, id: &str, kind: FailureKind) -> Option<FailureOutcome> {
        let now = Instant::now();
        let mut tables = self.tables();
        let table = tables.get_mut(target)?;

        table.recent_failures.push_back((id.to_string(), kind));
        if table.recent_failures.len() > RECENT_FAILURES {
            table.recent_failures.pop_front();
        }

        let state = table.candidates.get_mut(id)?;
        state.assigned = false;
        state.last_failure = Some(kind);
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        state.score = (state.score - 0.2).max(0.0);

        let ban = match kind {
            FailureKind::TreeMismatch => true,
            FailureKind::HashMismatch => {
                state.hash_mismatches = state.hash_mismatches.saturating_add(1);
                state.hash_mismatches >= self.config.max_hash_mismatches
            }
            _ => false,
        };
        if ban {
            state.record(CandidateEvent::Removed);
            table.candidates.remove(id);
            table.banned.insert(id.to_string());
            drop(tables);
            warn!(
                target_id = %target,
                candidate = %id,
                kind = %kind,
                "Removing and banning candidate"
            );
            self.bans.add(id, self.config.ban_duration());
            return Some(FailureOutcome::Banned);
        }

        if state.consecutive_failures >= self.config.max_consecutive_failures {
            state.record(CandidateEvent::Removed);
            table.candidates.remove(id);
            info!(
                target_id = %target,
                candidate = %id,
                failures = self.config.max_consecutive_failures,
                "Removing candidate after consecutive failures"
            );
            return Some(FailureOutcome::Removed);
        }

        let cooldown = self.cooldown_for(kind, state.consecutive_failures);
        state.cooldown_until = Some(now + cooldown);
        let cooldown_ms = cooldown.as_millis() as u64;
        state.record(CandidateEvent::Failed { kind, cooldown_ms });

        if !state.bad && state.consecutive_failures >= self.config.bad_candidate_failures {
            state.bad = true;
            state.record(CandidateEvent::MarkedBad);
            debug!(target_id = %target, candidate = %id, "Candidate marked bad");
        }

        debug!(
            target_id = %target,
            candidate = %id,
            kind = %kind,
            failures = state.consecutive_failures,
            cooldown_ms,
            "Candidate cooling down"
        );
        Some(FailureOutcome::CooledDown {
            cooldown_ms,
            bad: state.bad,
        })
    }

    /// Transient failures cool down for `step * failures` (capped), lengthened by a
    /// random jitter. Hash mismatches use the long fixed cool-down.
    fn cooldown_for(&self, kind: FailureKind, failures: u32) -> Duration {
        let step_ms = match kind {
            FailureKind::HashMismatch | FailureKind::TreeMismatch => {
                return self.config.hash_mismatch_cooldown();
            }
            FailureKind::ConnectionRefused => self.config.connection_failed_step_ms,
            FailureKind::Timeout => self.config.timeout_step_ms,
            FailureKind::ProtocolError => self.config.protocol_step_ms,
        };
        let base = step_ms.saturating_mul(u64::from(failures)) as f64;
        let jitter = if self.config.jitter_factor > 0.0 {
            rand::thread_rng().gen_range(0.0..=self.config.jitter_factor)
        } else {
            0.0
        };
        let total = (base * (1.0 + jitter)).min(self.config.max_cooldown_ms as f64);
        Duration::from_millis(total.max(0.0) as u64)
    }

    /// Measured transfer rate of a candidate in bytes per second (0 when unknown).
    pub fn throughput(&self, target: &str, id: &str) -> f64 {
        self.tables()
            .get(target)
            .and_then(|table| table.candidates.get(id))
            .map(|state| state.throughput)
            .unwrap_or(0.0)
    }

    pub fn known_count(&self, target: &str) -> usize {
        self.tables()
            .get(target)
            .map(|table| table.candidates.len())
            .unwrap_or(0)
    }

    pub fn recent_failures(&self, target: &str) -> Vec<(String, FailureKind)> {
        self.tables()
            .get(target)
            .map(|table| table.recent_failures.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn candidate_log(&self, target: &str, id: &str) -> Vec<CandidateEvent> {
        self.tables()
            .get(target)
            .and_then(|table| table.candidates.get(id))
            .map(|state| state.log().cloned().collect())
            .unwrap_or_default()
    }

    /// Drop every candidate of a finished or cancelled target.
    pub fn remove_target(&self, target: &str) -> usize {
        let removed = self
            .tables()
            .remove(target)
            .map(|table| table.candidates.len())
            .unwrap_or(0);
        debug!(target_id = %target, removed, "Removed candidate table");
        removed
    }

    pub fn snapshot(&self, target: &str) -> Vec<CandidateSnapshot> {
        let now = Instant::now();
        let mut out: Vec<CandidateSnapshot> = self
            .tables()
            .get(target)
            .map(|table| {
                table
                    .candidates
                    .values()
                    .map(|state| CandidateSnapshot::from_state(state, now))
                    .collect()
            })
            .unwrap_or_default();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidate::CapabilitySet;
    use crate::security::MemoryAccessControl;

    fn pool() -> CandidatePool {
        let config = CandidateConfig {
            jitter_factor: 0.0,
            ..Default::default()
        };
        CandidatePool::new(config, Arc::new(MemoryAccessControl::new()))
    }

    #[test]
    fn denied_candidates_are_not_added() {
        let access = Arc::new(MemoryAccessControl::new());
        access.ban("10.0.0.66:6346", Duration::from_secs(60));
        let pool = CandidatePool::new(CandidateConfig::default(), access);

        assert!(!pool.add_candidate("t", Candidate::new("10.0.0.66:6346")));
        assert!(pool.add_candidate("t", Candidate::new("10.0.0.1:6346")));
        assert_eq!(pool.known_count("t"), 1);
    }

    #[test]
    fn unusable_candidates_are_never_eligible() {
        let pool = pool();
        let no_ranges = CapabilitySet {
            range_requests: false,
            ..Default::default()
        };
        pool.add_candidate("t", Candidate::new("a").with_capabilities(no_ranges));
        assert!(pool.next_eligible("t", &HashSet::new()).is_none());
    }

    #[test]
    fn assigned_candidates_are_skipped_until_released() {
        let pool = pool();
        pool.add_candidate("t", Candidate::new("a"));

        let first = pool.next_eligible("t", &HashSet::new()).unwrap();
        assert_eq!(first.id, "a");
        assert!(pool.next_eligible("t", &HashSet::new()).is_none());

        pool.release("t", "a");
        assert!(pool.next_eligible("t", &HashSet::new()).is_some());
    }

    #[test]
    fn successful_candidates_rank_first() {
        let pool = pool();
        pool.add_candidate("t", Candidate::new("a"));
        pool.add_candidate("t", Candidate::new("b"));
        pool.report_success("t", "b", 1000, Duration::from_millis(100));

        let picked = pool.next_eligible("t", &HashSet::new()).unwrap();
        assert_eq!(picked.id, "b");
        assert_eq!(pool.throughput("t", "b"), 10_000.0);
    }

    #[test]
    fn transient_cooldown_grows_per_failure() {
        let pool = pool();
        pool.add_candidate("t", Candidate::new("a"));

        let first = pool.report_failure("t", "a", FailureKind::Timeout).unwrap();
        let second = pool.report_failure("t", "a", FailureKind::Timeout).unwrap();
        assert_eq!(
            first,
            FailureOutcome::CooledDown {
                cooldown_ms: 60_000,
                bad: false
            }
        );
        assert_eq!(
            second,
            FailureOutcome::CooledDown {
                cooldown_ms: 120_000,
                bad: false
            }
        );
        assert!(pool.next_eligible("t", &HashSet::new()).is_none());
    }

    #[test]
    fn cooldown_is_capped() {
        let config = CandidateConfig {
            jitter_factor: 0.0,
            max_cooldown_ms: 5 * 60 * 1000,
            ..Default::default()
        };
        let pool = CandidatePool::new(config, Arc::new(MemoryAccessControl::new()));
        pool.add_candidate("t", Candidate::new("a"));
        let mut last = None;
        for _ in 0..11 {
            last = pool.report_failure("t", "a", FailureKind::ConnectionRefused);
        }
        match last {
            Some(FailureOutcome::CooledDown { cooldown_ms, bad }) => {
                assert_eq!(cooldown_ms, 5 * 60 * 1000);
                assert!(bad);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(
            pool.report_failure("t", "a", FailureKind::ConnectionRefused),
            Some(FailureOutcome::Removed)
        );
        assert_eq!(pool.known_count("t"), 0);
    }

    #[tokio::test]
    async fn tree_mismatch_bans_immediately() {
        let pool = pool();
        pool.add_candidate("t", Candidate::new("evil"));
        assert_eq!(
            pool.report_failure("t", "evil", FailureKind::TreeMismatch),
            Some(FailureOutcome::Banned)
        );
        assert!(!pool.add_candidate("t", Candidate::new("evil")));
        assert_eq!(pool.report_failure("t", "evil", FailureKind::Timeout), None);
    }

    #[test]
    fn untried_candidates_win_over_tried_ones() {
        let pool = pool();
        pool.add_candidate("t", Candidate::new("a"));
        pool.add_candidate("t", Candidate::new("b"));
        pool.report_success("t", "a", 1000, Duration::from_millis(100));

        let tried: HashSet<String> = ["a".to_string()].into_iter().collect();
        let picked = pool.next_eligible_for("t", &HashSet::new(), &tried).unwrap();
        assert_eq!(picked.id, "b");

        // a tried candidate is still used when nobody else is left
        let picked = pool.next_eligible_for("t", &HashSet::new(), &tried).unwrap();
        assert_eq!(picked.id, "a");
    }

    #[tokio::test(start_paused = true)]
    async fn deferred_candidate_returns_without_penalty() {
        let pool = pool();
        pool.add_candidate("t", Candidate::new("a"));
        pool.next_eligible("t", &HashSet::new()).unwrap();

        pool.defer("t", "a", Duration::from_secs(5));
        assert!(pool.next_eligible("t", &HashSet::new()).is_none());
        let snapshot = &pool.snapshot("t")[0];
        assert_eq!(snapshot.consecutive_failures, 0);
        assert_eq!(snapshot.last_failure, None);

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(pool.next_eligible("t", &HashSet::new()).unwrap().id, "a");
    }

    #[test]
    fn remove_target_forgets_everything() {
        let pool = pool();
        pool.add_candidate("t", Candidate::new("a"));
        pool.add_candidate("t", Candidate::new("b"));
        assert_eq!(pool.remove_target("t"), 2);
        assert!(pool.snapshot("t").is_empty());
    }
}
