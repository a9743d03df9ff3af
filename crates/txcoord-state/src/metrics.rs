// Coordinator metrics
//
// Server-wide counters updated by every coordinator as it moves between
// states, plus per-coordinator timing used for currentOp and the slow
// coordination log line.
//
// INVARIANTS (checked by `TransactionsSection::check_invariants`):
// 1. currentActive + currentInactive == currentOpen
// 2. totalCommitted + totalAborted + currentOpen == totalStarted
// 3. No counter is negative

use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use txcoord_core::{CoordinatorDecision, CoordinatorKey};

use crate::coordinator::CoordinatorState;

/// How a coordinator left the open set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndOutcome {
    Committed,
    Aborted,
    /// Abandoned when this node stepped down; counted as aborted here
    SteppedDown,
}

#[derive(Default)]
pub struct CoordinatorMetrics {
    total_created: AtomicU64,
    total_started_two_phase_commit: AtomicU64,
    total_committed: AtomicU64,
    total_aborted: AtomicU64,
    total_stepped_down: AtomicU64,
    current_open: AtomicI64,
    current_in_state: [AtomicI64; CoordinatorState::NON_TERMINAL.len()],
}

impl CoordinatorMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn gauge(&self, state: CoordinatorState) -> Option<&AtomicI64> {
        state.index().map(|i| &self.current_in_state[i])
    }

    pub fn on_create(&self) {
        self.total_created.fetch_add(1, Ordering::SeqCst);
        self.current_open.fetch_add(1, Ordering::SeqCst);
        if let Some(gauge) = self.gauge(CoordinatorState::Inactive) {
            gauge.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub fn on_start_state(&self, previous: CoordinatorState, next: CoordinatorState) {
        if previous == CoordinatorState::Inactive && next != CoordinatorState::Inactive {
            self.total_started_two_phase_commit.fetch_add(1, Ordering::SeqCst);
        }
        if let Some(gauge) = self.gauge(next) {
            gauge.fetch_add(1, Ordering::SeqCst);
        }
        if let Some(gauge) = self.gauge(previous) {
            gauge.fetch_sub(1, Ordering::SeqCst);
        }
    }

    pub fn on_end(&self, last: CoordinatorState, outcome: EndOutcome) {
        match outcome {
            EndOutcome::Committed => {
                self.total_committed.fetch_add(1, Ordering::SeqCst);
            }
            EndOutcome::Aborted => {
                self.total_aborted.fetch_add(1, Ordering::SeqCst);
            }
            EndOutcome::SteppedDown => {
                self.total_stepped_down.fetch_add(1, Ordering::SeqCst);
                self.total_aborted.fetch_add(1, Ordering::SeqCst);
            }
        }
        if let Some(gauge) = self.gauge(last) {
            gauge.fetch_sub(1, Ordering::SeqCst);
        }
        self.current_open.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn current_in(&self, state: CoordinatorState) -> i64 {
        self.gauge(state).map(|g| g.load(Ordering::SeqCst)).unwrap_or(0)
    }

    pub fn snapshot(&self) -> ServerStatusSection {
        let mut current_in_state = BTreeMap::new();
        let mut active = 0;
        for state in CoordinatorState::NON_TERMINAL {
            let value = self.current_in(state);
            if state != CoordinatorState::Inactive {
                active += value;
            }
            current_in_state.insert(state.name().to_string(), value);
        }
        let inactive = self.current_in(CoordinatorState::Inactive);
        let created = self.total_created.load(Ordering::SeqCst);
        let committed = self.total_committed.load(Ordering::SeqCst);
        let aborted = self.total_aborted.load(Ordering::SeqCst);

        ServerStatusSection {
            two_phase_commit_coordinator: TwoPhaseCommitSection {
                total_created: created,
                total_started_two_phase_commit: self
                    .total_started_two_phase_commit
                    .load(Ordering::SeqCst),
                total_committed_two_phase_commit: committed,
                total_aborted_two_phase_commit: aborted,
                total_stepped_down: self.total_stepped_down.load(Ordering::SeqCst),
                current_in_state,
            },
            transactions: TransactionsSection {
                current_open: self.current_open.load(Ordering::SeqCst),
                current_active: active,
                current_inactive: inactive,
                total_started: created,
                total_committed: committed,
                total_aborted: aborted,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TwoPhaseCommitSection {
    pub total_created: u64,
    pub total_started_two_phase_commit: u64,
    pub total_committed_two_phase_commit: u64,
    pub total_aborted_two_phase_commit: u64,
    pub total_stepped_down: u64,
    pub current_in_state: BTreeMap<String, i64>,
}

/// Aggregate open/active/finished view of coordinated transactions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionsSection {
    pub current_open: i64,
    pub current_active: i64,
    pub current_inactive: i64,
    pub total_started: u64,
    pub total_committed: u64,
    pub total_aborted: u64,
}

impl TransactionsSection {
    /// Names of violated invariants; empty when the sample is consistent
    pub fn check_invariants(&self) -> Vec<String> {
        let mut violations = Vec::new();
        if self.current_active + self.current_inactive != self.current_open {
            violations.push(format!(
                "currentActive ({}) + currentInactive ({}) != currentOpen ({})",
                self.current_active, self.current_inactive, self.current_open
            ));
        }
        let finished = self.total_committed as i64 + self.total_aborted as i64;
        if finished + self.current_open != self.total_started as i64 {
            violations.push(format!(
                "totalCommitted ({}) + totalAborted ({}) + currentOpen ({}) != totalStarted ({})",
                self.total_committed, self.total_aborted, self.current_open, self.total_started
            ));
        }
        for (name, value) in [
            ("currentOpen", self.current_open),
            ("currentActive", self.current_active),
            ("currentInactive", self.current_inactive),
        ] {
            if value < 0 {
                violations.push(format!("{} is negative ({})", name, value));
            }
        }
        violations
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerStatusSection {
    pub two_phase_commit_coordinator: TwoPhaseCommitSection,
    pub transactions: TransactionsSection,
}

/// Timing of a single coordinator
#[derive(Debug, Clone)]
pub struct CoordinatorStats {
    create_time: DateTime<Utc>,
    created_at: Instant,
    current: Option<(CoordinatorState, Instant)>,
    state_start_times: BTreeMap<CoordinatorState, DateTime<Utc>>,
    state_durations: BTreeMap<CoordinatorState, Duration>,
    end_time: Option<DateTime<Utc>>,
    ended_at: Option<Instant>,
}

impl CoordinatorStats {
    pub fn new() -> Self {
        CoordinatorStats {
            create_time: Utc::now(),
            created_at: Instant::now(),
            current: None,
            state_start_times: BTreeMap::new(),
            state_durations: BTreeMap::new(),
            end_time: None,
            ended_at: None,
        }
    }

    pub fn on_start_state(&mut self, state: CoordinatorState) {
        let now = Instant::now();
        self.close_current(now);
        self.state_start_times.insert(state, Utc::now());
        self.current = Some((state, now));
    }

    pub fn on_end(&mut self) {
        if self.ended_at.is_some() {
            return;
        }
        let now = Instant::now();
        self.close_current(now);
        self.end_time = Some(Utc::now());
        self.ended_at = Some(now);
    }

    fn close_current(&mut self, now: Instant) {
        if let Some((state, started)) = self.current.take() {
            *self.state_durations.entry(state).or_default() += now.duration_since(started);
        }
    }

    pub fn create_time(&self) -> DateTime<Utc> {
        self.create_time
    }

    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        self.end_time
    }

    pub fn state_start_time(&self, state: CoordinatorState) -> Option<DateTime<Utc>> {
        self.state_start_times.get(&state).copied()
    }

    pub fn total_duration(&self) -> Duration {
        let end = self.ended_at.unwrap_or_else(Instant::now);
        end.duration_since(self.created_at)
    }

    /// Time spent in each state so far, including the running one
    pub fn state_durations(&self) -> BTreeMap<CoordinatorState, Duration> {
        let mut durations = self.state_durations.clone();
        if let (Some((state, started)), None) = (self.current, self.ended_at) {
            *durations.entry(state).or_default() += started.elapsed();
        }
        durations
    }
}

impl Default for CoordinatorStats {
    fn default() -> Self {
        Self::new()
    }
}

/// One-line summary of a finished coordination
pub fn coordination_summary(
    key: &CoordinatorKey,
    num_participants: usize,
    decision: Option<&CoordinatorDecision>,
    stats: &CoordinatorStats,
) -> String {
    let decision = match decision {
        Some(CoordinatorDecision::Committed { commit_timestamp, .. }) => {
            format!("decision: COMMIT, commitTimestamp: {}", commit_timestamp)
        }
        Some(CoordinatorDecision::Aborted { abort_reason }) => {
            format!("decision: ABORT, terminationCause: {}", abort_reason)
        }
        None => "decision: none".to_string(),
    };
    let steps: Vec<String> = stats
        .state_durations()
        .iter()
        .map(|(state, duration)| format!("{}: {}ms", state.name(), duration.as_millis()))
        .collect();

    format!(
        "two-phase commit lsid: {} txnNumber: {} numParticipants: {} {} duration: {}ms stepDurations: {{ {} }}",
        key.lsid,
        key.txn_number,
        num_participants,
        decision,
        stats.total_duration().as_millis(),
        steps.join(", ")
    )
}
