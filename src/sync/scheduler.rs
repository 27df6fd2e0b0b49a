//! The sync scheduler: one tick selects due tasks, fetches them with
//! bounded fan-out and merges the results into the snapshot store.
//!
//! Results are merged in task priority order whatever order the fetches
//! finish in, so a roster and a player pool fetched in the same tick always
//! resolve a shared player the same way (the pool is merged last). Task
//! state is published on a [`watch`] channel after every change, which lets
//! readers see it without waiting on a running tick.
//!
//! Fetch errors never escape a tick. They move the task through backoff
//! or suspension and are reported in the [`TickReport`] and as
//! [`SyncEvent`]s. A store error is different: it is returned to the
//! caller after every in-flight task has been settled.

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

use super::budget::RateBudget;
use super::task::{BackoffPolicy, FailureOutcome, FailurePolicy, SyncTask, TaskKind, TaskStatus};
use crate::config::SyncConfig;
use crate::source::{LeagueData, RemoteSource};
use crate::storage::SnapshotStore;
use crate::types::{
    Entity, EntityType, FetchError, Matchup, Player, Roster, StoreError, Transaction,
};

// ---------------------------------------------------------------------------
// Events & reports
// ---------------------------------------------------------------------------

/// Status change broadcast to anyone listening (the CLI logs these).
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    Succeeded {
        task: String,
        entities: usize,
        changed: usize,
    },
    Failed {
        task: String,
        error: FetchError,
        failures: u32,
        retry_in: Duration,
    },
    Suspended {
        task: String,
        error: FetchError,
    },
}

/// Summary of one tick.
#[derive(Debug, Clone, PartialEq)]
pub struct TickReport {
    pub at: DateTime<Utc>,
    pub attempted: Vec<String>,
    pub succeeded: Vec<String>,
    pub failed: Vec<(String, FetchError)>,
    pub suspended: Vec<String>,
    /// Due, but left for a later tick by the fetch cap or rate budget.
    pub deferred: Vec<String>,
    pub cancelled: bool,
}

impl TickReport {
    fn new(at: DateTime<Utc>) -> Self {
        Self {
            at,
            attempted: Vec::new(),
            succeeded: Vec::new(),
            failed: Vec::new(),
            suspended: Vec::new(),
            deferred: Vec::new(),
            cancelled: false,
        }
    }

    /// The first authentication failure seen in this tick, if any.
    pub fn auth_failure(&self) -> Option<&FetchError> {
        self.failed
            .iter()
            .map(|(_, e)| e)
            .find(|e| matches!(e, FetchError::Auth(_)))
    }
}

// ---------------------------------------------------------------------------
// Fetch jobs
// ---------------------------------------------------------------------------

enum Fetched {
    League(LeagueData),
    Roster(Roster),
    Players(Vec<Player>),
    Matchups(Vec<Matchup>),
    Transactions(Vec<Transaction>),
}

struct Job {
    index: usize,
    kind: TaskKind,
    since: Option<DateTime<Utc>>,
}

async fn run_job(
    source: Arc<dyn RemoteSource>,
    league_id: String,
    job: Job,
) -> (usize, Result<Fetched, FetchError>) {
    let result = match &job.kind {
        TaskKind::League => source.fetch_league(&league_id).await.map(Fetched::League),
        TaskKind::Roster { team_id } => source.fetch_roster(team_id).await.map(Fetched::Roster),
        TaskKind::Matchups => source
            .fetch_matchups(&league_id, None)
            .await
            .map(Fetched::Matchups),
        TaskKind::PlayerPool { position } => source
            .fetch_player_pool(&league_id, *position)
            .await
            .map(Fetched::Players),
        TaskKind::Transactions => source
            .fetch_transactions(&league_id, job.since)
            .await
            .map(Fetched::Transactions),
    };
    (job.index, result)
}

fn entity<T: serde::Serialize>(
    entity_type: EntityType,
    key: &str,
    value: &T,
    fetched_at: DateTime<Utc>,
) -> Result<Entity, StoreError> {
    Ok(Entity {
        entity_type,
        key: key.to_string(),
        payload: serde_json::to_value(value)?,
        fetched_at,
    })
}

async fn cancelled(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow() {
        if rx.changed().await.is_err() {
            // Sender gone: nobody can cancel any more.
            std::future::pending::<()>().await;
        }
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

pub struct SyncScheduler {
    league_id: String,
    tasks: Vec<SyncTask>,
    source: Arc<dyn RemoteSource>,
    store: Arc<dyn SnapshotStore>,
    budget: RateBudget,
    policy: FailurePolicy,
    max_fetches_per_tick: usize,
    max_concurrency: usize,
    roster_interval: Duration,
    events: broadcast::Sender<SyncEvent>,
    status: watch::Sender<Vec<SyncTask>>,
}

impl SyncScheduler {
    /// Build the task set for one league and the given teams. Every task
    /// is due immediately.
    pub fn new(
        config: &SyncConfig,
        league_id: &str,
        team_ids: &[String],
        source: Arc<dyn RemoteSource>,
        store: Arc<dyn SnapshotStore>,
        now: DateTime<Utc>,
    ) -> Self {
        let secs = Duration::from_secs;
        let mut tasks = vec![SyncTask::new(TaskKind::League, secs(config.league_interval_secs), now)];
        for team_id in team_ids {
            tasks.push(SyncTask::new(
                TaskKind::Roster {
                    team_id: team_id.clone(),
                },
                secs(config.roster_interval_secs),
                now,
            ));
        }
        tasks.push(SyncTask::new(
            TaskKind::Matchups,
            secs(config.matchups_interval_secs),
            now,
        ));
        if config.player_positions.is_empty() {
            tasks.push(SyncTask::new(
                TaskKind::PlayerPool { position: None },
                secs(config.player_pool_interval_secs),
                now,
            ));
        } else {
            for position in &config.player_positions {
                tasks.push(SyncTask::new(
                    TaskKind::PlayerPool {
                        position: Some(*position),
                    },
                    secs(config.player_pool_interval_secs),
                    now,
                ));
            }
        }
        tasks.push(SyncTask::new(
            TaskKind::Transactions,
            secs(config.transactions_interval_secs),
            now,
        ));

        let (events, _) = broadcast::channel(256);
        let (status, _) = watch::channel(tasks.clone());
        info!(league = %league_id, tasks = tasks.len(), "Sync scheduler ready");
        Self {
            league_id: league_id.to_string(),
            tasks,
            source,
            store,
            budget: RateBudget::new(
                config.rate_limit_requests,
                secs(config.rate_limit_window_secs),
            ),
            policy: FailurePolicy {
                backoff: BackoffPolicy::new(
                    secs(config.base_backoff_secs),
                    secs(config.max_backoff_secs),
                ),
                max_failures: config.max_failures,
                not_found_limit: config.not_found_limit,
            },
            max_fetches_per_tick: config.max_fetches_per_tick,
            max_concurrency: config.max_concurrency.max(1),
            roster_interval: secs(config.roster_interval_secs),
            events,
            status,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Sender side of the event channel, for subscribing without holding
    /// the scheduler.
    pub fn event_sender(&self) -> broadcast::Sender<SyncEvent> {
        self.events.clone()
    }

    /// Task states, refreshed whenever a task changes.
    pub fn watch_tasks(&self) -> watch::Receiver<Vec<SyncTask>> {
        self.status.subscribe()
    }

    fn publish(&self) {
        self.status.send_replace(self.tasks.clone());
    }

    pub fn tasks(&self) -> &[SyncTask] {
        &self.tasks
    }

    pub fn task(&self, id: &str) -> Option<&SyncTask> {
        self.tasks.iter().find(|t| t.id() == id)
    }

    /// Add a roster task for `team_id` unless one exists. Returns true when
    /// a task was added.
    pub fn track_team(&mut self, team_id: &str, now: DateTime<Utc>) -> bool {
        let exists = self
            .tasks
            .iter()
            .any(|t| matches!(&t.kind, TaskKind::Roster { team_id: id } if id == team_id));
        if exists {
            return false;
        }
        let kind = TaskKind::Roster {
            team_id: team_id.to_string(),
        };
        info!(task = %kind, "Tracking roster");
        self.tasks
            .push(SyncTask::new(kind, self.roster_interval, now));
        self.publish();
        true
    }

    /// Narrow the task set, e.g. to exercise one task in isolation.
    #[cfg(test)]
    pub(crate) fn retain_tasks(&mut self, keep: impl FnMut(&SyncTask) -> bool) {
        self.tasks.retain(keep);
        self.publish();
    }

    /// Clear a task's failure history and make it due now.
    pub fn reset(&mut self, id: &str, now: DateTime<Utc>) -> bool {
        match self.tasks.iter_mut().find(|t| t.id() == id) {
            Some(task) => {
                info!(task = %id, previous = %task.status, "Task reset");
                task.reset(now);
                self.publish();
                true
            }
            None => false,
        }
    }

    /// Make a pending task due now.
    pub fn expedite(&mut self, id: &str, now: DateTime<Utc>) -> bool {
        match self.tasks.iter_mut().find(|t| t.id() == id) {
            Some(task) => {
                task.expedite(now);
                self.publish();
                true
            }
            None => false,
        }
    }

    /// Return every in-flight task to pending. Returns how many moved.
    pub fn recover_in_flight(&mut self, now: DateTime<Utc>) -> usize {
        let mut recovered = 0;
        for task in self
            .tasks
            .iter_mut()
            .filter(|t| t.status == TaskStatus::InFlight)
        {
            task.requeue(now);
            recovered += 1;
        }
        if recovered > 0 {
            warn!(recovered, "Recovered in-flight tasks");
            self.publish();
        }
        recovered
    }

    /// Run one tick at `now`.
    pub async fn tick(&mut self, now: DateTime<Utc>) -> Result<TickReport, StoreError> {
        let (_tx, rx) = watch::channel(false);
        self.run_tick(now, rx, self.max_fetches_per_tick).await
    }

    /// Run one tick that stops early once `cancel` turns true. Tasks
    /// still in flight at that point go back to pending.
    pub async fn tick_cancellable(
        &mut self,
        now: DateTime<Utc>,
        cancel: watch::Receiver<bool>,
    ) -> Result<TickReport, StoreError> {
        self.run_tick(now, cancel, self.max_fetches_per_tick).await
    }

    /// Fetch every due task, ignoring the per-tick cap. The rate budget
    /// still applies.
    pub async fn run_once(&mut self, now: DateTime<Utc>) -> Result<TickReport, StoreError> {
        let (_tx, rx) = watch::channel(false);
        self.run_tick(now, rx, usize::MAX).await
    }

    async fn run_tick(
        &mut self,
        now: DateTime<Utc>,
        mut cancel: watch::Receiver<bool>,
        max_fetches: usize,
    ) -> Result<TickReport, StoreError> {
        let mut report = TickReport::new(now);

        let mut due: Vec<usize> = (0..self.tasks.len())
            .filter(|&i| self.tasks[i].is_eligible(now))
            .collect();
        due.sort_by(|&a, &b| {
            let (ta, tb) = (&self.tasks[a], &self.tasks[b]);
            ta.kind
                .priority()
                .cmp(&tb.kind.priority())
                .then_with(|| ta.next_eligible.cmp(&tb.next_eligible))
                .then_with(|| ta.id().cmp(&tb.id()))
        });

        let mut jobs = Vec::new();
        for index in due {
            let id = self.tasks[index].id();
            if jobs.len() >= max_fetches || !self.budget.try_acquire(now) {
                report.deferred.push(id);
                continue;
            }
            let task = &mut self.tasks[index];
            task.begin(now);
            jobs.push(Job {
                index,
                kind: task.kind.clone(),
                since: task.last_success,
            });
            report.attempted.push(id);
        }

        if !report.deferred.is_empty() {
            debug!(deferred = report.deferred.len(), "Due tasks deferred to a later tick");
        }
        if jobs.is_empty() {
            return Ok(report);
        }
        self.publish();

        let source = Arc::clone(&self.source);
        let league_id = self.league_id.clone();
        let mut results = stream::iter(jobs)
            .map(move |job| run_job(Arc::clone(&source), league_id.clone(), job))
            .buffered(self.max_concurrency);

        let mut store_error: Option<StoreError> = None;
        loop {
            tokio::select! {
                biased;
                _ = cancelled(&mut cancel) => {
                    report.cancelled = true;
                    break;
                }
                next = results.next() => match next {
                    Some((index, result)) => {
                        self.complete(index, result, now, &mut report, &mut store_error);
                        self.publish();
                    }
                    None => break,
                },
            }
        }
        drop(results);

        if report.cancelled {
            let requeued = self.recover_in_flight(now);
            info!(requeued, "Sync tick cancelled");
        }

        info!(
            attempted = report.attempted.len(),
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            deferred = report.deferred.len(),
            "Sync tick complete"
        );

        match store_error {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }

    fn complete(
        &mut self,
        index: usize,
        result: Result<Fetched, FetchError>,
        now: DateTime<Utc>,
        report: &mut TickReport,
        store_error: &mut Option<StoreError>,
    ) {
        let id = self.tasks[index].id();
        match result {
            Ok(fetched) => {
                // Fresh transactions move players in and out of the pool.
                let refresh_pool = self.tasks[index].last_success.is_some()
                    && matches!(&fetched, Fetched::Transactions(txs) if !txs.is_empty());
                let touched_teams = match &fetched {
                    Fetched::Transactions(txs) => self.rosters_touched_by(txs),
                    _ => Vec::new(),
                };
                let kind = self.tasks[index].kind.clone();
                let stored = self
                    .to_entities(&kind, fetched, now)
                    .and_then(|entities| {
                        let total = entities.len();
                        self.store
                            .upsert_many(entities)
                            .map(|outcomes| (total, outcomes.iter().filter(|o| o.changed()).count()))
                    });

                match stored {
                    Ok((entities, changed)) => {
                        self.tasks[index].succeed(now);
                        debug!(task = %id, entities, changed, "Task succeeded");
                        report.succeeded.push(id.clone());
                        let _ = self.events.send(SyncEvent::Succeeded {
                            task: id,
                            entities,
                            changed,
                        });
                        for task_id in touched_teams {
                            if self.expedite(&task_id, now) {
                                info!(task = %task_id, "Roster refresh expedited by transaction");
                            }
                        }
                        if refresh_pool {
                            let pools: Vec<String> = self
                                .tasks
                                .iter()
                                .filter(|t| matches!(t.kind, TaskKind::PlayerPool { .. }))
                                .map(|t| t.id())
                                .collect();
                            for task_id in pools {
                                self.expedite(&task_id, now);
                            }
                            debug!("Player pool refresh expedited by transactions");
                        }
                    }
                    Err(e) => {
                        error!(task = %id, error = %e, "Failed to store fetched data");
                        self.tasks[index].requeue(now);
                        store_error.get_or_insert(e);
                    }
                }
            }
            Err(err) => {
                let outcome = self.tasks[index].fail(now, err.clone(), &self.policy);
                let failures = self.tasks[index].failures;
                report.failed.push((id.clone(), err.clone()));

                match outcome {
                    FailureOutcome::Retry { delay } => {
                        // Loud on the first failure, then only at milestones.
                        if failures == 1 || failures == 5 || failures == 10 {
                            warn!(task = %id, kind = err.kind(), failures, error = %err, retry_in_secs = delay.as_secs(), "Fetch failed");
                        } else {
                            debug!(task = %id, kind = err.kind(), failures, error = %err, retry_in_secs = delay.as_secs(), "Fetch still failing");
                        }
                        let _ = self.events.send(SyncEvent::Failed {
                            task: id,
                            error: err,
                            failures,
                            retry_in: delay,
                        });
                    }
                    FailureOutcome::Suspended => {
                        if matches!(err, FetchError::Auth(_)) {
                            error!(task = %id, error = %err, "Authentication failed, task suspended");
                        } else {
                            warn!(task = %id, kind = err.kind(), failures, error = %err, "Task suspended until reset");
                        }
                        report.suspended.push(id.clone());
                        let _ = self.events.send(SyncEvent::Suspended { task: id, error: err });
                    }
                }
            }
        }
    }

    /// Roster task ids for tracked teams named in `txs`.
    fn rosters_touched_by(&self, txs: &[Transaction]) -> Vec<String> {
        self.tasks
            .iter()
            .filter_map(|t| match &t.kind {
                TaskKind::Roster { team_id } => {
                    txs.iter().any(|tx| tx.involves_team(team_id)).then(|| t.id())
                }
                _ => None,
            })
            .collect()
    }

    fn to_entities(
        &self,
        kind: &TaskKind,
        fetched: Fetched,
        at: DateTime<Utc>,
    ) -> Result<Vec<Entity>, StoreError> {
        let mut out = Vec::new();
        match (kind, fetched) {
            (_, Fetched::League(data)) => {
                out.push(entity(EntityType::League, &self.league_id, &data.league, at)?);
                for team in &data.standings {
                    out.push(entity(EntityType::Team, &team.team_key, team, at)?);
                }
            }
            (TaskKind::Roster { team_id }, Fetched::Roster(roster)) => {
                for p in &roster.players {
                    out.push(entity(EntityType::Player, &p.player_id, p, at)?);
                }
                out.push(entity(EntityType::Roster, team_id, &roster, at)?);
            }
            (_, Fetched::Roster(roster)) => {
                out.push(entity(EntityType::Roster, &roster.team_key, &roster, at)?);
            }
            (_, Fetched::Players(players)) => {
                for p in &players {
                    out.push(entity(EntityType::Player, &p.player_id, p, at)?);
                }
            }
            (_, Fetched::Matchups(matchups)) => {
                for m in &matchups {
                    out.push(entity(EntityType::Matchup, &m.key(), m, at)?);
                }
            }
            (_, Fetched::Transactions(txs)) => {
                for tx in &txs {
                    out.push(entity(EntityType::Transaction, &tx.transaction_key, tx, at)?);
                }
            }
        }
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MockRemoteSource;
    use crate::storage::{MemoryStore, SnapshotStoreExt};
    use crate::types::{Availability, League, Position, TransactionMove};
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicUsize, Ordering};

    // ---- helpers -----------------------------------------------------------

    fn quiet_config() -> SyncConfig {
        SyncConfig {
            player_positions: Vec::new(),
            max_fetches_per_tick: 10,
            max_concurrency: 2,
            rate_limit_requests: 100,
            ..SyncConfig::default()
        }
    }

    fn roster(team: &str) -> Roster {
        Roster {
            team_key: format!("nfl.l.1.t.{team}"),
            week: 1,
            players: vec![Player::sample("p1", Position::QB, Some(dec!(20)))],
        }
    }

    fn league_ok(source: &mut MockRemoteSource) {
        source.expect_fetch_league().returning(|id| {
            Ok(LeagueData {
                league: League::standard(id),
                standings: Vec::new(),
            })
        });
    }

    fn rest_ok(source: &mut MockRemoteSource) {
        source.expect_fetch_roster().returning(|team| Ok(roster(team)));
        source.expect_fetch_player_pool().returning(|_, _| Ok(Vec::new()));
        source.expect_fetch_matchups().returning(|_, _| Ok(Vec::new()));
    }

    /// A source where every call succeeds with empty-ish data.
    fn happy_source() -> MockRemoteSource {
        let mut source = MockRemoteSource::new();
        league_ok(&mut source);
        rest_ok(&mut source);
        source.expect_fetch_transactions().returning(|_, _| Ok(Vec::new()));
        source
    }

    fn scheduler(config: SyncConfig, source: MockRemoteSource) -> (SyncScheduler, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let sched = SyncScheduler::new(
            &config,
            "1",
            &["3".to_string()],
            Arc::new(source),
            store.clone(),
            Utc::now(),
        );
        (sched, store)
    }

    // ---- tests -------------------------------------------------------------

    #[tokio::test]
    async fn test_first_tick_fetches_everything_in_priority_order() {
        let (mut sched, store) = scheduler(quiet_config(), happy_source());
        let report = sched.tick(Utc::now()).await.unwrap();
        assert_eq!(
            report.attempted,
            vec!["league", "roster:3", "matchups", "players:all", "transactions"]
        );
        assert_eq!(report.succeeded.len(), 5);
        assert!(report.failed.is_empty());

        let (r, _): (Roster, _) = store.get_typed(EntityType::Roster, "3").unwrap().unwrap();
        assert_eq!(r.team_key, "nfl.l.1.t.3");
        assert!(store.get(EntityType::League, "1").unwrap().is_some());
        assert!(store.get(EntityType::Player, "p1").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_nothing_due_on_second_tick() {
        let (mut sched, _) = scheduler(quiet_config(), happy_source());
        let now = Utc::now();
        sched.tick(now).await.unwrap();
        let report = sched.tick(now + chrono::Duration::seconds(1)).await.unwrap();
        assert!(report.attempted.is_empty());
    }

    #[tokio::test]
    async fn test_per_tick_cap_keeps_high_priority() {
        let config = SyncConfig {
            max_fetches_per_tick: 2,
            ..quiet_config()
        };
        let (mut sched, _) = scheduler(config, happy_source());
        let report = sched.tick(Utc::now()).await.unwrap();
        assert_eq!(report.attempted, vec!["league", "roster:3"]);
        assert_eq!(report.deferred, vec!["matchups", "players:all", "transactions"]);
    }

    #[tokio::test]
    async fn test_rate_budget_shared_across_ticks() {
        let config = SyncConfig {
            rate_limit_requests: 3,
            rate_limit_window_secs: 60,
            ..quiet_config()
        };
        let (mut sched, _) = scheduler(config, happy_source());
        let now = Utc::now();
        let first = sched.tick(now).await.unwrap();
        assert_eq!(first.attempted.len(), 3);
        let second = sched.tick(now + chrono::Duration::seconds(10)).await.unwrap();
        assert!(second.attempted.is_empty());
        assert_eq!(second.deferred.len(), 2);
        let third = sched.tick(now + chrono::Duration::seconds(61)).await.unwrap();
        assert_eq!(third.attempted, vec!["players:all", "transactions"]);
    }

    #[tokio::test]
    async fn test_rate_limited_backoff_grows_then_resets() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mut source = MockRemoteSource::new();
        source.expect_fetch_roster().returning(move |team| {
            if counter.fetch_add(1, Ordering::SeqCst) < 3 {
                Err(FetchError::RateLimited { retry_after: None })
            } else {
                Ok(roster(team))
            }
        });
        let config = SyncConfig {
            base_backoff_secs: 30,
            max_backoff_secs: 900,
            ..quiet_config()
        };
        let store = Arc::new(MemoryStore::new());
        let mut now = Utc::now();
        let mut sched = SyncScheduler::new(&config, "1", &["3".into()], Arc::new(source), store, now);
        // Only the roster task matters here.
        sched.tasks.retain(|t| matches!(t.kind, TaskKind::Roster { .. }));

        let mut delays = Vec::new();
        for _ in 0..3 {
            let report = sched.tick(now).await.unwrap();
            assert_eq!(report.failed.len(), 1);
            let task = sched.task("roster:3").unwrap();
            delays.push(task.last_delay.unwrap());
            now = task.next_eligible;
        }
        assert!(delays[0] < delays[1] && delays[1] < delays[2], "{delays:?}");

        let report = sched.tick(now).await.unwrap();
        assert_eq!(report.succeeded, vec!["roster:3"]);
        let task = sched.task("roster:3").unwrap();
        assert_eq!(task.failures, 0);
        assert_eq!(task.next_eligible, now + chrono::Duration::seconds(300));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_suspended_after_max_failures_and_not_retried() {
        let mut source = MockRemoteSource::new();
        source
            .expect_fetch_matchups()
            .times(3)
            .returning(|_, _| Err(FetchError::Transient("503".into())));
        let config = SyncConfig {
            max_failures: 3,
            ..quiet_config()
        };
        let store = Arc::new(MemoryStore::new());
        let mut now = Utc::now();
        let mut sched = SyncScheduler::new(&config, "1", &[], Arc::new(source), store, now);
        sched.tasks.retain(|t| t.kind == TaskKind::Matchups);
        let mut events = sched.subscribe();

        for _ in 0..3 {
            sched.tick(now).await.unwrap();
            now = now + chrono::Duration::hours(1);
        }
        assert_eq!(sched.task("matchups").unwrap().status, TaskStatus::Suspended);

        // Many more ticks: the mock would panic on a fourth call.
        for _ in 0..5 {
            let report = sched.tick(now).await.unwrap();
            assert!(report.attempted.is_empty());
            now = now + chrono::Duration::hours(1);
        }

        let mut saw_suspended = false;
        while let Ok(ev) = events.try_recv() {
            if matches!(ev, SyncEvent::Suspended { .. }) {
                saw_suspended = true;
            }
        }
        assert!(saw_suspended);
    }

    #[tokio::test]
    async fn test_reset_resumes_suspended_task() {
        let mut source = MockRemoteSource::new();
        let mut seq = mockall::Sequence::new();
        source
            .expect_fetch_league()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(FetchError::Auth("token revoked".into())));
        source
            .expect_fetch_league()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|id| {
                Ok(LeagueData {
                    league: League::standard(id),
                    standings: Vec::new(),
                })
            });
        let store = Arc::new(MemoryStore::new());
        let now = Utc::now();
        let mut sched = SyncScheduler::new(&quiet_config(), "1", &[], Arc::new(source), store, now);
        sched.tasks.retain(|t| t.kind == TaskKind::League);

        let report = sched.tick(now).await.unwrap();
        assert!(report.auth_failure().is_some());
        assert_eq!(report.suspended, vec!["league"]);

        assert!(sched.reset("league", now));
        let report = sched.tick(now).await.unwrap();
        assert_eq!(report.succeeded, vec!["league"]);
        assert!(!sched.reset("nope", now));
    }

    #[tokio::test]
    async fn test_failure_does_not_abort_tick_or_touch_store() {
        let mut source = MockRemoteSource::new();
        source.expect_fetch_league().returning(|_| Err(FetchError::Malformed("bad".into())));
        rest_ok(&mut source);
        source.expect_fetch_transactions().returning(|_, _| Ok(Vec::new()));

        let (mut sched, store) = scheduler(quiet_config(), source);
        let report = sched.tick(Utc::now()).await.unwrap();
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.succeeded.len(), 4);
        assert!(store.get(EntityType::League, "1").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_transactions_use_last_success_and_expedite_roster() {
        let mut source = MockRemoteSource::new();
        league_ok(&mut source);
        rest_ok(&mut source);
        source
            .expect_fetch_transactions()
            .withf(|_, since| since.is_none())
            .times(1)
            .returning(|_, _| Ok(Vec::new()));
        source
            .expect_fetch_transactions()
            .withf(|_, since| since.is_some())
            .times(1)
            .returning(|_, _| {
                Ok(vec![Transaction {
                    transaction_key: "tx.9".into(),
                    kind: "add".into(),
                    status: "successful".into(),
                    timestamp: Utc::now(),
                    moves: vec![TransactionMove {
                        player_id: "p9".into(),
                        player_name: "Waiver Guy".into(),
                        kind: "add".into(),
                        source_team: None,
                        destination_team: Some("nfl.l.1.t.3".into()),
                    }],
                }])
            });

        let (mut sched, store) = scheduler(quiet_config(), source);
        let t0 = Utc::now();
        sched.tick(t0).await.unwrap();

        // Jump past the transaction interval but not the roster interval.
        for task in sched.tasks.iter_mut() {
            if task.kind != TaskKind::Transactions {
                task.next_eligible = t0 + chrono::Duration::hours(1);
            }
        }
        let t1 = t0 + chrono::Duration::seconds(901);
        sched.tick(t1).await.unwrap();
        assert!(store.get(EntityType::Transaction, "tx.9").unwrap().is_some());
        assert!(sched.task("roster:3").unwrap().is_eligible(t1));
        assert!(sched.task("players:all").unwrap().is_eligible(t1));
        assert!(!sched.task("matchups").unwrap().is_eligible(t1));
    }

    /// Roster answers slowly, so the pool fetch finishes first.
    struct SlowRosterSource;

    #[async_trait::async_trait]
    impl RemoteSource for SlowRosterSource {
        async fn fetch_league(&self, league_id: &str) -> Result<LeagueData, FetchError> {
            Ok(LeagueData {
                league: League::standard(league_id),
                standings: Vec::new(),
            })
        }

        async fn fetch_roster(&self, team_id: &str) -> Result<Roster, FetchError> {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let mut r = roster(team_id);
            r.players[0].availability = Availability::Rostered {
                team_key: r.team_key.clone(),
            };
            Ok(r)
        }

        async fn fetch_player_pool(
            &self,
            _league_id: &str,
            _position: Option<Position>,
        ) -> Result<Vec<Player>, FetchError> {
            let mut p = Player::sample("p1", Position::QB, Some(dec!(20)));
            p.availability = Availability::Waivers;
            Ok(vec![p])
        }

        async fn fetch_transactions(
            &self,
            _league_id: &str,
            _since: Option<DateTime<Utc>>,
        ) -> Result<Vec<Transaction>, FetchError> {
            Ok(Vec::new())
        }

        async fn fetch_matchups(
            &self,
            _league_id: &str,
            _week: Option<u32>,
        ) -> Result<Vec<Matchup>, FetchError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_same_tick_player_merge_is_order_independent() {
        let store = Arc::new(MemoryStore::new());
        let now = Utc::now();
        let mut sched = SyncScheduler::new(
            &quiet_config(),
            "1",
            &["3".to_string()],
            Arc::new(SlowRosterSource),
            store.clone(),
            now,
        );
        let report = sched.tick(now).await.unwrap();
        assert_eq!(report.succeeded.len(), 5);
        // Completions are merged in priority order: roster, then pool.
        assert_eq!(&report.succeeded[..2], ["league", "roster:3"]);

        let (p, _): (Player, _) = store.get_typed(EntityType::Player, "p1").unwrap().unwrap();
        assert_eq!(p.availability, Availability::Waivers);
    }

    #[tokio::test]
    async fn test_task_watch_tracks_every_change() {
        let (mut sched, _) = scheduler(quiet_config(), happy_source());
        let rx = sched.watch_tasks();
        let now = Utc::now();
        sched.tick(now).await.unwrap();
        assert!(rx
            .borrow()
            .iter()
            .all(|t| t.status == TaskStatus::Pending && t.last_success == Some(now)));

        assert!(sched.track_team("8", now));
        assert!(rx.borrow().iter().any(|t| t.id() == "roster:8"));
    }

    #[tokio::test]
    async fn test_cancelled_tick_leaves_nothing_in_flight() {
        let mut source = MockRemoteSource::new();
        league_ok(&mut source);
        let store = Arc::new(MemoryStore::new());
        let now = Utc::now();
        let mut sched = SyncScheduler::new(&quiet_config(), "1", &[], Arc::new(source), store, now);
        sched.tasks.retain(|t| t.kind == TaskKind::League);

        let (tx, rx) = watch::channel(true);
        let report = sched.tick_cancellable(now, rx).await.unwrap();
        drop(tx);
        assert!(report.cancelled);
        assert!(sched.tasks().iter().all(|t| t.status != TaskStatus::InFlight));
        assert!(sched.task("league").unwrap().is_eligible(now));
    }

    #[tokio::test]
    async fn test_recover_in_flight() {
        let (mut sched, _) = scheduler(quiet_config(), happy_source());
        let now = Utc::now();
        sched.tasks[0].begin(now);
        sched.tasks[1].begin(now);
        assert_eq!(sched.recover_in_flight(now), 2);
        assert_eq!(sched.recover_in_flight(now), 0);
    }

    #[tokio::test]
    async fn test_track_team_adds_roster_once() {
        let (mut sched, _) = scheduler(quiet_config(), happy_source());
        let now = Utc::now();
        assert!(!sched.track_team("3", now));
        assert!(sched.track_team("5", now));
        assert!(!sched.track_team("5", now));
        let task = sched.task("roster:5").unwrap();
        assert!(task.is_eligible(now));
    }

    #[test]
    fn test_roster_touched_only_by_its_own_team() {
        let (sched, _) = scheduler(quiet_config(), happy_source());
        let tx = |dest: &str| Transaction {
            transaction_key: "tx".into(),
            kind: "add".into(),
            status: "successful".into(),
            timestamp: Utc::now(),
            moves: vec![TransactionMove {
                player_id: "p".into(),
                player_name: "P".into(),
                kind: "add".into(),
                source_team: None,
                destination_team: Some(dest.into()),
            }],
        };
        assert_eq!(sched.rosters_touched_by(&[tx("nfl.l.1.t.3")]), vec!["roster:3"]);
        assert!(sched.rosters_touched_by(&[tx("nfl.l.1.t.13")]).is_empty());
    }
}
