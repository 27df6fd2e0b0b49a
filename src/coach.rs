//! The coach facade: the one object the CLI talks to.
//!
//! Owns the snapshot store handle, the sync scheduler (and its optional
//! background driver) and the decision engine. Reads never hit the
//! network: they serve whatever the snapshot holds, wrapped in
//! [`Observed`] so callers can see how old the data is and whether the
//! last sync attempt for it failed. Task state is read from the
//! scheduler's published snapshot, so a read never waits for a tick that
//! is busy fetching.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex};
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::engine::draft::{self, DraftSuggestion};
use crate::engine::{DecisionEngine, RosterView};
use crate::source::RemoteSource;
use crate::storage::{EntityScan, SnapshotStore, SnapshotStoreExt};
use crate::sync::driver::TickResult;
use crate::sync::{SyncDriver, SyncEvent, SyncScheduler, SyncTask, TaskKind, TickReport};
use crate::types::{
    Availability, EngineError, EntityType, FetchError, League, Matchup, Player, Position,
    Recommendation, Roster, Slot, StoreError, TeamStanding, Transaction,
};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum CoachError {
    /// Credentials rejected. Fatal: no retry will fix it.
    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("No {0} in the local snapshot yet; run `fantasy-coach run` or pass --sync")]
    NotSynced(String),

    #[error("No team configured; set league.team_id or pass a team")]
    NoTeam,

    #[error("Unknown sync task: {0}")]
    UnknownTask(String),

    #[error("Scheduler is already running")]
    AlreadyRunning,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

// ---------------------------------------------------------------------------
// Observed data
// ---------------------------------------------------------------------------

/// How trustworthy a read is.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Freshness {
    /// Oldest `fetched_at` among the entities behind the read.
    pub fetched_at: DateTime<Utc>,
    pub age: Duration,
    pub stale: bool,
    /// Set when the most recent sync attempt for this data failed.
    pub last_error: Option<String>,
}

impl fmt::Display for Freshness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mins = self.age.as_secs() / 60;
        write!(f, "as of {} ({mins} min ago)", self.fetched_at.format("%Y-%m-%d %H:%M UTC"))?;
        if let Some(err) = &self.last_error {
            write!(f, " [STALE: last sync failed: {err}]")?;
        } else if self.stale {
            write!(f, " [STALE]")?;
        }
        Ok(())
    }
}

/// Data read from the snapshot together with its freshness.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Observed<T> {
    pub data: T,
    pub freshness: Freshness,
}

// ---------------------------------------------------------------------------
// Player filters
// ---------------------------------------------------------------------------

/// Player list ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlayerSort {
    /// Least owned first (waiver-wire digging), then by name.
    #[default]
    AR,
    /// Most owned first.
    POWN,
    /// Last name, then first name.
    NAME,
}

impl std::str::FromStr for PlayerSort {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "AR" => Ok(PlayerSort::AR),
            "POWN" | "OWNED" => Ok(PlayerSort::POWN),
            "NAME" => Ok(PlayerSort::NAME),
            other => anyhow::bail!("Unknown sort: {other} (expected AR, POWN or NAME)"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AvailabilityFilter {
    /// Free agents and waivers.
    #[default]
    Available,
    FreeAgents,
    Waivers,
    Rostered,
    All,
}

impl AvailabilityFilter {
    fn accepts(&self, availability: &Availability) -> bool {
        match self {
            AvailabilityFilter::Available => availability.is_available(),
            AvailabilityFilter::FreeAgents => *availability == Availability::FreeAgent,
            AvailabilityFilter::Waivers => *availability == Availability::Waivers,
            AvailabilityFilter::Rostered => !availability.is_available(),
            AvailabilityFilter::All => true,
        }
    }
}

impl std::str::FromStr for AvailabilityFilter {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "A" | "AVAILABLE" => Ok(AvailabilityFilter::Available),
            "FA" => Ok(AvailabilityFilter::FreeAgents),
            "W" => Ok(AvailabilityFilter::Waivers),
            "T" | "TAKEN" => Ok(AvailabilityFilter::Rostered),
            "ALL" => Ok(AvailabilityFilter::All),
            other => anyhow::bail!("Unknown availability: {other}"),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PlayerFilter {
    pub position: Option<Position>,
    /// Case-insensitive substring of the player's name.
    pub search: Option<String>,
    pub availability: AvailabilityFilter,
    pub sort: PlayerSort,
    pub limit: Option<usize>,
}

impl PlayerFilter {
    fn matches(&self, p: &Player) -> bool {
        if let Some(pos) = self.position {
            if !p.positions().contains(&pos) {
                return false;
            }
        }
        if let Some(q) = &self.search {
            if !p.name.to_lowercase().contains(&q.to_lowercase()) {
                return false;
            }
        }
        self.availability.accepts(&p.availability)
    }

    fn sort(&self, players: &mut [Player]) {
        let name_key = |p: &Player| (p.last_name().to_lowercase(), p.name.to_lowercase());
        match self.sort {
            PlayerSort::AR => players.sort_by(|a, b| {
                let oa = a.percent_owned.unwrap_or_default();
                let ob = b.percent_owned.unwrap_or_default();
                oa.cmp(&ob).then_with(|| name_key(a).cmp(&name_key(b)))
            }),
            PlayerSort::POWN => players.sort_by(|a, b| {
                let oa = a.percent_owned.unwrap_or_default();
                let ob = b.percent_owned.unwrap_or_default();
                ob.cmp(&oa).then_with(|| name_key(a).cmp(&name_key(b)))
            }),
            PlayerSort::NAME => players.sort_by_key(name_key),
        }
    }
}

// ---------------------------------------------------------------------------
// Facade
// ---------------------------------------------------------------------------

pub struct Coach {
    config: AppConfig,
    store: Arc<dyn SnapshotStore>,
    scheduler: Arc<Mutex<SyncScheduler>>,
    tasks: watch::Receiver<Vec<SyncTask>>,
    events: broadcast::Sender<SyncEvent>,
    driver: Mutex<Option<SyncDriver>>,
    engine: DecisionEngine,
}

impl Coach {
    pub fn new(
        config: AppConfig,
        source: Arc<dyn RemoteSource>,
        store: Arc<dyn SnapshotStore>,
    ) -> Result<Self, CoachError> {
        let engine = DecisionEngine::new(config.engine.ruleset.clone())?;
        let teams: Vec<String> = Some(config.league.team_id.clone())
            .filter(|t| !t.is_empty())
            .into_iter()
            .collect();
        let scheduler = SyncScheduler::new(
            &config.sync,
            &config.league.league_id,
            &teams,
            source,
            Arc::clone(&store),
            Utc::now(),
        );

        Ok(Self {
            config,
            store,
            tasks: scheduler.watch_tasks(),
            events: scheduler.event_sender(),
            scheduler: Arc::new(Mutex::new(scheduler)),
            driver: Mutex::new(None),
            engine,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub async fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    // -- Sync control ------------------------------------------------------

    /// One synchronous sync pass over every due task.
    pub async fn run_once(&self) -> Result<TickReport, CoachError> {
        self.run_once_at(Utc::now()).await
    }

    pub async fn run_once_at(&self, now: DateTime<Utc>) -> Result<TickReport, CoachError> {
        let report = {
            let mut sched = self.scheduler.lock().await;
            sched.recover_in_flight(now);
            sched.run_once(now).await?
        };
        if let Some(FetchError::Auth(msg)) = report.auth_failure() {
            return Err(CoachError::Auth(msg.clone()));
        }
        info!(
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            deferred = report.deferred.len(),
            "Sync pass complete"
        );
        Ok(report)
    }

    /// Start ticking in the background every `interval`.
    pub async fn start_scheduler(&self, interval: Duration) -> Result<(), CoachError> {
        let mut slot = self.driver.lock().await;
        if slot.is_some() {
            return Err(CoachError::AlreadyRunning);
        }
        *slot = Some(SyncDriver::start(Arc::clone(&self.scheduler), Some(interval)));
        Ok(())
    }

    /// Start a background worker without a clock; ticks come from
    /// [`inject_tick`](Self::inject_tick).
    pub async fn start_manual_scheduler(&self) -> Result<(), CoachError> {
        let mut slot = self.driver.lock().await;
        if slot.is_some() {
            return Err(CoachError::AlreadyRunning);
        }
        *slot = Some(SyncDriver::start(Arc::clone(&self.scheduler), None));
        Ok(())
    }

    /// Stop the background scheduler. Returns false if it was not running.
    pub async fn stop_scheduler(&self) -> bool {
        let driver = self.driver.lock().await.take();
        match driver {
            Some(d) => {
                d.stop().await;
                true
            }
            None => false,
        }
    }

    pub async fn inject_tick(&self, now: DateTime<Utc>) -> bool {
        match self.driver.lock().await.as_ref() {
            Some(d) => d.inject_tick(now).await,
            None => false,
        }
    }

    /// Wait for the background scheduler's next finished tick.
    pub async fn next_tick(&self) -> Option<TickResult> {
        match self.driver.lock().await.as_mut() {
            Some(d) => d.next_completion().await,
            None => None,
        }
    }

    /// Start syncing another team's roster.
    pub async fn track_team(&self, team_id: &str) {
        self.scheduler.lock().await.track_team(team_id, Utc::now());
    }

    pub async fn reset_task(&self, id: &str) -> Result<(), CoachError> {
        let mut sched = self.scheduler.lock().await;
        if sched.reset(id, Utc::now()) {
            Ok(())
        } else {
            Err(CoachError::UnknownTask(id.to_string()))
        }
    }

    /// Reset every suspended task. Returns their ids.
    pub async fn reset_suspended(&self) -> Vec<String> {
        let mut sched = self.scheduler.lock().await;
        let now = Utc::now();
        let ids: Vec<String> = sched
            .tasks()
            .iter()
            .filter(|t| t.status == crate::sync::TaskStatus::Suspended)
            .map(|t| t.id())
            .collect();
        for id in &ids {
            sched.reset(id, now);
        }
        ids
    }

    pub async fn task_statuses(&self) -> Vec<SyncTask> {
        self.tasks.borrow().clone()
    }

    // -- Reads -------------------------------------------------------------

    fn freshness(
        &self,
        fetched_at: DateTime<Utc>,
        relevant: impl Fn(&TaskKind) -> bool,
    ) -> Freshness {
        let now = Utc::now();
        let age = (now - fetched_at).to_std().unwrap_or(Duration::ZERO);
        let last_error = self
            .tasks
            .borrow()
            .iter()
            .filter(|t| relevant(&t.kind))
            .find_map(|t| t.last_error.as_ref().map(|e| e.to_string()));
        let stale =
            last_error.is_some() || age > Duration::from_secs(self.config.engine.stale_after_secs);
        if let Some(err) = &last_error {
            warn!(error = %err, "Serving last-known-good data after a failed sync");
        }
        Freshness {
            fetched_at,
            age,
            stale,
            last_error,
        }
    }

    fn team_id<'a>(&'a self, team_id: Option<&'a str>) -> Result<&'a str, CoachError> {
        team_id
            .filter(|t| !t.is_empty())
            .or_else(|| Some(self.config.league.team_id.as_str()).filter(|t| !t.is_empty()))
            .ok_or(CoachError::NoTeam)
    }

    fn scan(&self, entity_type: EntityType) -> Result<EntityScan, CoachError> {
        let scan = self.store.all(entity_type)?;
        if scan.is_empty() {
            return Err(CoachError::NotSynced(format!("{entity_type} data")));
        }
        Ok(scan)
    }

    fn league(&self) -> Result<(League, DateTime<Utc>), CoachError> {
        self.store
            .get_typed::<League>(EntityType::League, &self.config.league.league_id)?
            .ok_or_else(|| CoachError::NotSynced("league settings".into()))
    }

    fn roster(&self, team_id: &str) -> Result<(Roster, DateTime<Utc>), CoachError> {
        self.store
            .get_typed::<Roster>(EntityType::Roster, team_id)?
            .ok_or_else(|| CoachError::NotSynced(format!("roster for team {team_id}")))
    }

    fn available_pool(&self) -> Result<(Vec<Player>, Option<DateTime<Utc>>), CoachError> {
        let players = self.store.all(EntityType::Player)?.decode_all::<Player>()?;
        let oldest = players.iter().map(|(_, at)| *at).min();
        let pool = players
            .into_iter()
            .map(|(p, _)| p)
            .filter(|p| p.availability.is_available())
            .collect();
        Ok((pool, oldest))
    }

    pub async fn get_league(&self) -> Result<Observed<League>, CoachError> {
        let (league, at) = self.league()?;
        let freshness = self.freshness(at, |k| *k == TaskKind::League);
        Ok(Observed {
            data: league,
            freshness,
        })
    }

    /// Standings ordered by rank (unranked last), then name.
    pub async fn get_standings(&self) -> Result<Observed<Vec<TeamStanding>>, CoachError> {
        let rows = self.scan(EntityType::Team)?.decode_all::<TeamStanding>()?;
        let oldest = rows.iter().map(|(_, at)| *at).min().unwrap_or_else(Utc::now);
        let mut standings: Vec<TeamStanding> = rows.into_iter().map(|(t, _)| t).collect();
        standings.sort_by(|a, b| {
            a.rank
                .unwrap_or(u32::MAX)
                .cmp(&b.rank.unwrap_or(u32::MAX))
                .then_with(|| a.name.cmp(&b.name))
        });
        let freshness = self.freshness(oldest, |k| *k == TaskKind::League);
        Ok(Observed {
            data: standings,
            freshness,
        })
    }

    pub async fn list_players(
        &self,
        filter: &PlayerFilter,
    ) -> Result<Observed<Vec<Player>>, CoachError> {
        let rows = self.scan(EntityType::Player)?.decode_all::<Player>()?;
        let oldest = rows.iter().map(|(_, at)| *at).min().unwrap_or_else(Utc::now);
        let mut players: Vec<Player> = rows
            .into_iter()
            .map(|(p, _)| p)
            .filter(|p| filter.matches(p))
            .collect();
        filter.sort(&mut players);
        if let Some(limit) = filter.limit {
            players.truncate(limit);
        }
        let freshness = self.freshness(oldest, |k| matches!(k, TaskKind::PlayerPool { .. }));
        Ok(Observed {
            data: players,
            freshness,
        })
    }

    pub async fn get_roster(&self, team_id: Option<&str>) -> Result<Observed<Roster>, CoachError> {
        let team = self.team_id(team_id)?;
        let (roster, at) = self.roster(team)?;
        let freshness = self
            .freshness(at, |k| matches!(k, TaskKind::Roster { team_id } if team_id == team));
        Ok(Observed {
            data: roster,
            freshness,
        })
    }

    fn roster_view(&self, team: &str) -> Result<(RosterView, DateTime<Utc>), CoachError> {
        let (league, league_at) = self.league()?;
        let (roster, roster_at) = self.roster(team)?;
        let (pool, pool_at) = self.available_pool()?;
        let oldest = pool_at.map_or(league_at.min(roster_at), |p| p.min(league_at).min(roster_at));
        Ok((RosterView { league, roster, pool }, oldest))
    }

    pub async fn recommend_lineup(
        &self,
        team_id: Option<&str>,
    ) -> Result<Observed<Vec<Recommendation>>, CoachError> {
        let team = self.team_id(team_id)?;
        let (view, at) = self.roster_view(team)?;
        let recs = self.engine.evaluate(&view)?;
        let freshness = self.freshness(at, |k| match k {
            TaskKind::League => true,
            TaskKind::Roster { team_id } => team_id == team,
            _ => false,
        });
        Ok(Observed {
            data: recs,
            freshness,
        })
    }

    pub async fn recommend_waivers(
        &self,
        team_id: Option<&str>,
    ) -> Result<Observed<Vec<Recommendation>>, CoachError> {
        let team = self.team_id(team_id)?;
        let (view, at) = self.roster_view(team)?;
        let recs = self
            .engine
            .recommend_waivers(&view, self.config.engine.waiver_limit)?;
        let freshness = self.freshness(at, |k| match k {
            TaskKind::League | TaskKind::PlayerPool { .. } => true,
            TaskKind::Roster { team_id } => team_id == team,
            _ => false,
        });
        Ok(Observed {
            data: recs,
            freshness,
        })
    }

    /// Most recent transactions first.
    pub async fn list_transactions(
        &self,
        limit: usize,
    ) -> Result<Observed<Vec<Transaction>>, CoachError> {
        let rows = self.scan(EntityType::Transaction)?.decode_all::<Transaction>()?;
        let newest = rows.iter().map(|(_, at)| *at).max().unwrap_or_else(Utc::now);
        let mut txs: Vec<Transaction> = rows.into_iter().map(|(t, _)| t).collect();
        txs.sort_by(|a, b| {
            b.timestamp
                .cmp(&a.timestamp)
                .then_with(|| a.transaction_key.cmp(&b.transaction_key))
        });
        txs.truncate(limit);
        let freshness = self.freshness(newest, |k| *k == TaskKind::Transactions);
        Ok(Observed {
            data: txs,
            freshness,
        })
    }

    /// Matchups for the league's current week (or the latest week held).
    pub async fn get_matchups(&self) -> Result<Observed<Vec<Matchup>>, CoachError> {
        let rows = self.scan(EntityType::Matchup)?.decode_all::<Matchup>()?;
        let week = match self.league() {
            Ok((league, _)) => Some(league.current_week),
            Err(CoachError::NotSynced(_)) => None,
            Err(e) => return Err(e),
        };
        let week = week
            .filter(|w| rows.iter().any(|(m, _)| m.week == *w))
            .or_else(|| rows.iter().map(|(m, _)| m.week).max())
            .unwrap_or_default();

        let current: Vec<(Matchup, DateTime<Utc>)> =
            rows.into_iter().filter(|(m, _)| m.week == week).collect();
        let oldest = current.iter().map(|(_, at)| *at).min().unwrap_or_else(Utc::now);
        let freshness = self.freshness(oldest, |k| *k == TaskKind::Matchups);
        Ok(Observed {
            data: current.into_iter().map(|(m, _)| m).collect(),
            freshness,
        })
    }

    /// Draft pick suggestions from the available pool. Without explicit
    /// `needs`, open starting slots on the configured team's roster are used.
    pub async fn suggest_draft(
        &self,
        needs: Option<BTreeMap<Position, u32>>,
        picks_until_next: u32,
    ) -> Result<Observed<Vec<DraftSuggestion>>, CoachError> {
        let (pool, pool_at) = self.available_pool()?;
        let pool_at = pool_at.ok_or_else(|| CoachError::NotSynced("player data".into()))?;
        let needs = match needs {
            Some(n) => n,
            None => self.open_starting_slots()?,
        };
        let picks = draft::suggest_picks(&pool, &needs, picks_until_next, 5);
        let freshness = self.freshness(pool_at, |k| matches!(k, TaskKind::PlayerPool { .. }));
        Ok(Observed {
            data: picks,
            freshness,
        })
    }

    /// Positional tiers over the available pool.
    pub async fn draft_tiers(&self) -> Result<Observed<Vec<draft::Tier>>, CoachError> {
        let (pool, pool_at) = self.available_pool()?;
        let pool_at = pool_at.ok_or_else(|| CoachError::NotSynced("player data".into()))?;
        let freshness = self.freshness(pool_at, |k| matches!(k, TaskKind::PlayerPool { .. }));
        Ok(Observed {
            data: draft::build_tiers(&pool),
            freshness,
        })
    }

    fn open_starting_slots(&self) -> Result<BTreeMap<Position, u32>, CoachError> {
        let league = match self.league() {
            Ok((league, _)) => league,
            Err(CoachError::NotSynced(_)) => League::standard(&self.config.league.league_id),
            Err(e) => return Err(e),
        };
        let rostered: Vec<Player> = match self.team_id(None) {
            Ok(team) => match self.roster(team) {
                Ok((r, _)) => r.players,
                Err(CoachError::NotSynced(_)) => Vec::new(),
                Err(e) => return Err(e),
            },
            Err(_) => Vec::new(),
        };

        let mut needs = BTreeMap::new();
        for pos in Position::ALL {
            let slots: usize = league
                .roster_slots
                .iter()
                .filter(|r| r.slot == Slot::dedicated(*pos))
                .map(|r| r.count)
                .sum();
            let have = rostered.iter().filter(|p| p.position == *pos).count();
            let need = slots.saturating_sub(have) as u32;
            if need > 0 {
                needs.insert(*pos, need);
            }
        }
        Ok(needs)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
