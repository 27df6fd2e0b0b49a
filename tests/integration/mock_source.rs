//! Scripted league source for integration testing.
//!
//! Provides a deterministic `RemoteSource` serving a small league from
//! memory, with switches to force failures or slow responses and counters
//! to check how often each endpoint was hit.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use fantasy_coach::source::{LeagueData, RemoteSource};
use fantasy_coach::types::*;

pub const LEAGUE_ID: &str = "777";
pub const TEAM_ID: &str = "3";
pub const TEAM_KEY: &str = "nfl.l.777.t.3";

/// An in-memory league. All state is shared, so a clone handed to the
/// coach can still be steered from test code.
#[derive(Clone)]
pub struct ScriptedSource {
    league: Arc<Mutex<LeagueData>>,
    rosters: Arc<Mutex<HashMap<String, Roster>>>,
    pool: Arc<Mutex<Vec<Player>>>,
    matchups: Arc<Mutex<Vec<Matchup>>>,
    transactions: Arc<Mutex<Vec<Transaction>>>,
    /// If set, every fetch returns this error.
    force_error: Arc<Mutex<Option<FetchError>>>,
    /// Added before every response.
    delay: Arc<Mutex<Duration>>,
    calls: Arc<Mutex<HashMap<&'static str, usize>>>,
}

impl ScriptedSource {
    /// A 4-team league where team 3 rosters two QBs and one WR.
    pub fn new() -> Self {
        let mut league = League::standard("nfl.l.777");
        league.name = "Scripted League".into();
        league.num_teams = 4;
        league.current_week = 6;
        league.roster_slots = vec![
            SlotRequirement { slot: Slot::QB, count: 1 },
            SlotRequirement { slot: Slot::WR, count: 1 },
            SlotRequirement { slot: Slot::Flex, count: 1 },
        ];
        league.max_roster_size = 4;

        let standings = (1..=4)
            .map(|i| TeamStanding {
                team_key: format!("nfl.l.777.t.{i}"),
                name: format!("Team {i}"),
                manager: None,
                rank: Some(5 - i),
                wins: i,
                losses: 5 - i,
                ties: 0,
                points_for: Decimal::from(400 + i * 10),
                points_against: dec!(420),
            })
            .collect();

        let rostered = Availability::Rostered {
            team_key: TEAM_KEY.into(),
        };
        let roster = Roster {
            team_key: TEAM_KEY.into(),
            week: 6,
            players: vec![
                player("p.qb20", "Alpha Quarterback", Position::QB, Some(dec!(20)), rostered.clone()),
                player("p.qb15", "Beta Quarterback", Position::QB, Some(dec!(15)), rostered.clone()),
                player("p.wr9", "Gamma Receiver", Position::WR, Some(dec!(9)), rostered),
            ],
        };

        let pool = vec![
            player("p.wr14", "Delta Receiver", Position::WR, Some(dec!(14)), Availability::FreeAgent),
            player("p.wr4", "Epsilon Receiver", Position::WR, Some(dec!(4)), Availability::Waivers),
            player("p.rb11", "Zeta Runner", Position::RB, Some(dec!(11)), Availability::FreeAgent),
            player("p.te", "Eta End", Position::TE, None, Availability::FreeAgent),
        ];

        let matchups = vec![
            matchup(6, "nfl.l.777.t.1", "nfl.l.777.t.3"),
            matchup(6, "nfl.l.777.t.2", "nfl.l.777.t.4"),
            matchup(5, "nfl.l.777.t.1", "nfl.l.777.t.2"),
        ];

        let transactions = vec![
            transaction("tx.1", Utc.with_ymd_and_hms(2024, 10, 1, 12, 0, 0).unwrap()),
            transaction("tx.2", Utc.with_ymd_and_hms(2024, 10, 3, 12, 0, 0).unwrap()),
        ];

        Self {
            league: Arc::new(Mutex::new(LeagueData { league, standings })),
            rosters: Arc::new(Mutex::new(HashMap::from([(TEAM_ID.to_string(), roster)]))),
            pool: Arc::new(Mutex::new(pool)),
            matchups: Arc::new(Mutex::new(matchups)),
            transactions: Arc::new(Mutex::new(transactions)),
            force_error: Arc::new(Mutex::new(None)),
            delay: Arc::new(Mutex::new(Duration::ZERO)),
            calls: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Force all subsequent fetches to fail with `err`.
    pub fn set_error(&self, err: FetchError) {
        *self.force_error.lock().unwrap() = Some(err);
    }

    pub fn clear_error(&self) {
        *self.force_error.lock().unwrap() = None;
    }

    /// Make every subsequent fetch take `delay` before answering.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn calls(&self, endpoint: &str) -> usize {
        self.calls.lock().unwrap().get(endpoint).copied().unwrap_or(0)
    }

    pub fn set_max_roster(&self, size: usize) {
        self.league.lock().unwrap().league.max_roster_size = size;
    }

    async fn enter(&self, endpoint: &'static str) -> Result<(), FetchError> {
        *self.calls.lock().unwrap().entry(endpoint).or_insert(0) += 1;
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        match self.force_error.lock().unwrap().clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl RemoteSource for ScriptedSource {
    async fn fetch_league(&self, _league_id: &str) -> Result<LeagueData, FetchError> {
        self.enter("league").await?;
        Ok(self.league.lock().unwrap().clone())
    }

    async fn fetch_roster(&self, team_id: &str) -> Result<Roster, FetchError> {
        self.enter("roster").await?;
        self.rosters
            .lock()
            .unwrap()
            .get(team_id)
            .cloned()
            .ok_or_else(|| FetchError::NotFound(format!("team {team_id}")))
    }

    async fn fetch_player_pool(
        &self,
        _league_id: &str,
        position: Option<Position>,
    ) -> Result<Vec<Player>, FetchError> {
        self.enter("players").await?;
        Ok(self
            .pool
            .lock()
            .unwrap()
            .iter()
            .filter(|p| position.map_or(true, |pos| p.position == pos))
            .cloned()
            .collect())
    }

    async fn fetch_transactions(
        &self,
        _league_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Transaction>, FetchError> {
        self.enter("transactions").await?;
        Ok(self
            .transactions
            .lock()
            .unwrap()
            .iter()
            .filter(|t| since.map_or(true, |s| t.timestamp > s))
            .cloned()
            .collect())
    }

    async fn fetch_matchups(
        &self,
        _league_id: &str,
        week: Option<u32>,
    ) -> Result<Vec<Matchup>, FetchError> {
        self.enter("matchups").await?;
        let current = self.league.lock().unwrap().league.current_week;
        let week = week.unwrap_or(current);
        Ok(self
            .matchups
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.week == week)
            .cloned()
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Builders
// ---------------------------------------------------------------------------

pub fn player(
    id: &str,
    name: &str,
    position: Position,
    projected: Option<Decimal>,
    availability: Availability,
) -> Player {
    Player {
        player_id: id.to_string(),
        name: name.to_string(),
        position,
        eligible_positions: vec![position],
        nfl_team: Some("SEA".to_string()),
        status: InjuryStatus::Healthy,
        injury_note: None,
        bye_week: None,
        percent_owned: Some(dec!(50)),
        projected_points: projected,
        opponent_def_rank: None,
        snap_trend: None,
        volatility: None,
        availability,
    }
}

fn matchup(week: u32, home: &str, away: &str) -> Matchup {
    let side = |key: &str| MatchupSide {
        team_key: key.to_string(),
        name: key.to_string(),
        points: None,
        projected_points: Some(dec!(100)),
    };
    Matchup {
        week,
        teams: vec![side(home), side(away)],
    }
}

fn transaction(key: &str, at: DateTime<Utc>) -> Transaction {
    Transaction {
        transaction_key: key.to_string(),
        kind: "add".to_string(),
        status: "successful".to_string(),
        timestamp: at,
        moves: vec![TransactionMove {
            player_id: "p.other".to_string(),
            player_name: "Other Guy".to_string(),
            kind: "add".to_string(),
            source_team: None,
            destination_team: Some("nfl.l.777.t.2".to_string()),
        }],
    }
}
