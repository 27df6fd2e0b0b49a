//! Per-entity sync bookkeeping: what to fetch, when, and how it has gone.
//!
//! Task state is transient. It is rebuilt from configuration on startup;
//! only the snapshot survives a restart.

use chrono::{DateTime, Utc};
use std::fmt;
use std::time::Duration;

use crate::types::{EntityType, FetchError, Position};

// ---------------------------------------------------------------------------
// Task kinds
// ---------------------------------------------------------------------------

/// What a task fetches.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TaskKind {
    League,
    Roster { team_id: String },
    Matchups,
    PlayerPool { position: Option<Position> },
    Transactions,
}

impl TaskKind {
    /// Lower runs first when the per-tick budget is tight.
    pub fn priority(&self) -> u8 {
        match self {
            TaskKind::League | TaskKind::Roster { .. } => 0,
            TaskKind::Matchups | TaskKind::PlayerPool { .. } => 1,
            TaskKind::Transactions => 2,
        }
    }

    /// Primary entity type written by this task.
    pub fn entity_type(&self) -> EntityType {
        match self {
            TaskKind::League => EntityType::League,
            TaskKind::Roster { .. } => EntityType::Roster,
            TaskKind::Matchups => EntityType::Matchup,
            TaskKind::PlayerPool { .. } => EntityType::Player,
            TaskKind::Transactions => EntityType::Transaction,
        }
    }

    /// Stable identifier, e.g. `roster:3` or `players:QB`.
    pub fn id(&self) -> String {
        match self {
            TaskKind::League => "league".to_string(),
            TaskKind::Roster { team_id } => format!("roster:{team_id}"),
            TaskKind::Matchups => "matchups".to_string(),
            TaskKind::PlayerPool { position: Some(p) } => format!("players:{p}"),
            TaskKind::PlayerPool { position: None } => "players:all".to_string(),
            TaskKind::Transactions => "transactions".to_string(),
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id())
    }
}

// ---------------------------------------------------------------------------
// Backoff
// ---------------------------------------------------------------------------

/// Exponential backoff: `base * 2^(failures - 1)`, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
}

impl BackoffPolicy {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
        }
    }

    pub fn delay(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let exp = failures.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << exp)
            .unwrap_or(self.max)
            .min(self.max)
    }
}

/// Limits that decide when a failing task is suspended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailurePolicy {
    pub backoff: BackoffPolicy,
    pub max_failures: u32,
    pub not_found_limit: u32,
}

// ---------------------------------------------------------------------------
// Task state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    InFlight,
    /// No automatic retries until [`SyncTask::reset`].
    Suspended,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::InFlight => write!(f, "in-flight"),
            TaskStatus::Suspended => write!(f, "suspended"),
        }
    }
}

/// What a failure did to the task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureOutcome {
    Retry { delay: Duration },
    Suspended,
}

#[derive(Debug, Clone)]
pub struct SyncTask {
    pub kind: TaskKind,
    pub interval: Duration,
    pub status: TaskStatus,
    pub next_eligible: DateTime<Utc>,
    /// Consecutive failures of any kind.
    pub failures: u32,
    /// Consecutive NotFound failures.
    pub not_found: u32,
    pub last_delay: Option<Duration>,
    pub last_attempt: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<FetchError>,
}

fn chrono_dur(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(365))
}

impl SyncTask {
    /// A new task is eligible immediately.
    pub fn new(kind: TaskKind, interval: Duration, now: DateTime<Utc>) -> Self {
        Self {
            kind,
            interval,
            status: TaskStatus::Pending,
            next_eligible: now,
            failures: 0,
            not_found: 0,
            last_delay: None,
            last_attempt: None,
            last_success: None,
            last_error: None,
        }
    }

    pub fn id(&self) -> String {
        self.kind.id()
    }

    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Pending && self.next_eligible <= now
    }

    pub fn begin(&mut self, now: DateTime<Utc>) {
        self.status = TaskStatus::InFlight;
        self.last_attempt = Some(now);
    }

    pub fn succeed(&mut self, now: DateTime<Utc>) {
        self.status = TaskStatus::Pending;
        self.failures = 0;
        self.not_found = 0;
        self.last_delay = None;
        self.last_error = None;
        self.last_success = Some(now);
        self.next_eligible = now + chrono_dur(self.interval);
    }

    /// Record a failed fetch and schedule the retry (or suspend).
    ///
    /// `next_eligible` never moves backwards on failure. A rate-limit hint
    /// from the server extends the delay but never shortens it.
    pub fn fail(
        &mut self,
        now: DateTime<Utc>,
        error: FetchError,
        policy: &FailurePolicy,
    ) -> FailureOutcome {
        self.failures += 1;
        if matches!(error, FetchError::NotFound(_)) {
            self.not_found += 1;
        } else {
            self.not_found = 0;
        }

        let suspend = matches!(error, FetchError::Auth(_))
            || self.not_found >= policy.not_found_limit.max(1)
            || self.failures >= policy.max_failures.max(1);

        let hint = match &error {
            FetchError::RateLimited { retry_after } => *retry_after,
            _ => None,
        };
        self.last_error = Some(error);

        if suspend {
            self.status = TaskStatus::Suspended;
            self.last_delay = None;
            return FailureOutcome::Suspended;
        }

        let mut delay = policy.backoff.delay(self.failures);
        if let Some(h) = hint {
            delay = delay.max(h);
        }
        self.status = TaskStatus::Pending;
        self.last_delay = Some(delay);
        self.next_eligible = self.next_eligible.max(now + chrono_dur(delay));
        FailureOutcome::Retry { delay }
    }

    /// Return an interrupted task to the queue, due immediately.
    /// Failure history is kept.
    pub fn requeue(&mut self, now: DateTime<Utc>) {
        if self.status == TaskStatus::InFlight {
            self.status = TaskStatus::Pending;
            self.next_eligible = self.next_eligible.min(now);
        }
    }

    /// Manual reset: clears failures and makes the task due now.
    pub fn reset(&mut self, now: DateTime<Utc>) {
        self.status = TaskStatus::Pending;
        self.failures = 0;
        self.not_found = 0;
        self.last_delay = None;
        self.last_error = None;
        self.next_eligible = now;
    }

    /// Make a pending task due now without touching its history.
    pub fn expedite(&mut self, now: DateTime<Utc>) {
        if self.status == TaskStatus::Pending && self.next_eligible > now {
            self.next_eligible = now;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
