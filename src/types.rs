//! Shared types for the fantasy coach.
//!
//! These types form the data model used across all modules. The remote
//! source produces them, the snapshot store persists them as JSON payloads,
//! and the decision engine reads them back.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Entities
// ---------------------------------------------------------------------------

/// Kind of league data held in the snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EntityType {
    League,
    Team,
    Roster,
    Player,
    Matchup,
    Transaction,
}

impl EntityType {
    pub const ALL: &'static [EntityType] = &[
        EntityType::League,
        EntityType::Team,
        EntityType::Roster,
        EntityType::Player,
        EntityType::Matchup,
        EntityType::Transaction,
    ];
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityType::League => write!(f, "league"),
            EntityType::Team => write!(f, "team"),
            EntityType::Roster => write!(f, "roster"),
            EntityType::Player => write!(f, "player"),
            EntityType::Matchup => write!(f, "matchup"),
            EntityType::Transaction => write!(f, "transaction"),
        }
    }
}

/// One keyed piece of league data as held by the snapshot store.
///
/// The payload is kept as raw JSON so the store stays ignorant of the
/// domain types; callers decode it with [`Entity::decode`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub entity_type: EntityType,
    pub key: String,
    pub payload: serde_json::Value,
    pub fetched_at: DateTime<Utc>,
}

impl Entity {
    /// Decode the payload into a typed domain value.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, StoreError> {
        serde_json::from_value(self.payload.clone()).map_err(|source| StoreError::Decode {
            entity_type: self.entity_type,
            key: self.key.clone(),
            source,
        })
    }

    /// Age of this entity relative to `now` (zero if fetched "in the future").
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.fetched_at).to_std().unwrap_or(Duration::ZERO)
    }
}

/// Result of [`crate::storage::SnapshotStore::staleness`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Staleness {
    /// Entity present; time elapsed since its `fetched_at`.
    Known(Duration),
    /// Entity has never been fetched.
    Unknown,
}

// ---------------------------------------------------------------------------
// Positions & roster slots
// ---------------------------------------------------------------------------

/// NFL fantasy position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Position {
    QB,
    RB,
    WR,
    TE,
    K,
    DEF,
}

impl Position {
    pub const ALL: &'static [Position] = &[
        Position::QB,
        Position::RB,
        Position::WR,
        Position::TE,
        Position::K,
        Position::DEF,
    ];
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Position::QB => "QB",
            Position::RB => "RB",
            Position::WR => "WR",
            Position::TE => "TE",
            Position::K => "K",
            Position::DEF => "DEF",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for Position {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "QB" => Ok(Position::QB),
            "RB" => Ok(Position::RB),
            "WR" => Ok(Position::WR),
            "TE" => Ok(Position::TE),
            "K" | "PK" => Ok(Position::K),
            "DEF" | "DST" | "D/ST" => Ok(Position::DEF),
            other => anyhow::bail!("Unknown position: {other}"),
        }
    }
}

/// Starting lineup slot. Bench and IR are not starting slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Slot {
    QB,
    RB,
    WR,
    TE,
    K,
    DEF,
    /// W/R/T flex.
    Flex,
}

impl Slot {
    /// Whether a player at `position` may fill this slot.
    pub fn accepts(&self, position: Position) -> bool {
        match self {
            Slot::QB => position == Position::QB,
            Slot::RB => position == Position::RB,
            Slot::WR => position == Position::WR,
            Slot::TE => position == Position::TE,
            Slot::K => position == Position::K,
            Slot::DEF => position == Position::DEF,
            Slot::Flex => matches!(position, Position::RB | Position::WR | Position::TE),
        }
    }

    /// Dedicated slot for a position.
    pub fn dedicated(position: Position) -> Slot {
        match position {
            Position::QB => Slot::QB,
            Position::RB => Slot::RB,
            Position::WR => Slot::WR,
            Position::TE => Slot::TE,
            Position::K => Slot::K,
            Position::DEF => Slot::DEF,
        }
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Slot::Flex => write!(f, "FLEX"),
            Slot::QB => write!(f, "QB"),
            Slot::RB => write!(f, "RB"),
            Slot::WR => write!(f, "WR"),
            Slot::TE => write!(f, "TE"),
            Slot::K => write!(f, "K"),
            Slot::DEF => write!(f, "DEF"),
        }
    }
}

impl std::str::FromStr for Slot {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "FLEX" | "W/R/T" | "W/R/TE" => Ok(Slot::Flex),
            other => other.parse::<Position>().map(Slot::dedicated),
        }
    }
}

/// How many of a given slot a league's starting lineup has.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotRequirement {
    pub slot: Slot,
    pub count: usize,
}

// ---------------------------------------------------------------------------
// League & teams
// ---------------------------------------------------------------------------

/// League configuration and identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct League {
    pub league_key: String,
    pub name: String,
    pub season: String,
    pub current_week: u32,
    pub num_teams: u32,
    pub scoring_type: String,
    pub roster_slots: Vec<SlotRequirement>,
    /// Maximum players on a roster, starters and bench combined.
    pub max_roster_size: usize,
}

impl League {
    /// Total number of starting slots.
    pub fn starting_slot_count(&self) -> usize {
        self.roster_slots.iter().map(|r| r.count).sum()
    }

    /// Standard ten-team layout: QB, 2 RB, 2 WR, TE, FLEX, K, DEF and 6 bench.
    pub fn standard(league_key: &str) -> Self {
        League {
            league_key: league_key.to_string(),
            name: String::new(),
            season: String::new(),
            current_week: 1,
            num_teams: 10,
            scoring_type: "head".to_string(),
            roster_slots: vec![
                SlotRequirement { slot: Slot::QB, count: 1 },
                SlotRequirement { slot: Slot::RB, count: 2 },
                SlotRequirement { slot: Slot::WR, count: 2 },
                SlotRequirement { slot: Slot::TE, count: 1 },
                SlotRequirement { slot: Slot::Flex, count: 1 },
                SlotRequirement { slot: Slot::K, count: 1 },
                SlotRequirement { slot: Slot::DEF, count: 1 },
            ],
            max_roster_size: 15,
        }
    }
}

/// One row of the league standings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TeamStanding {
    pub team_key: String,
    pub name: String,
    pub manager: Option<String>,
    pub rank: Option<u32>,
    pub wins: u32,
    pub losses: u32,
    pub ties: u32,
    pub points_for: Decimal,
    pub points_against: Decimal,
}

impl fmt::Display for TeamStanding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rank = self.rank.map(|r| r.to_string()).unwrap_or_else(|| "-".into());
        write!(
            f,
            "{rank:>2}. {} ({}-{}-{}) PF {:.2} PA {:.2}",
            self.name, self.wins, self.losses, self.ties, self.points_for, self.points_against,
        )
    }
}

// ---------------------------------------------------------------------------
// Players & rosters
// ---------------------------------------------------------------------------

/// Injury designation as reported upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum InjuryStatus {
    #[default]
    Healthy,
    Questionable,
    Doubtful,
    Out,
    InjuredReserve,
}

impl InjuryStatus {
    /// Map an upstream status code (Q, D, O, IR, ...) to a designation.
    pub fn from_code(code: Option<&str>) -> Self {
        match code.map(|c| c.trim().to_uppercase()).as_deref() {
            Some("Q") => InjuryStatus::Questionable,
            Some("D") => InjuryStatus::Doubtful,
            Some("O") | Some("NA") | Some("SUSP") => InjuryStatus::Out,
            Some("IR") | Some("IR-R") | Some("PUP-R") | Some("PUP-P") | Some("NFI-R") => {
                InjuryStatus::InjuredReserve
            }
            _ => InjuryStatus::Healthy,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            InjuryStatus::Healthy => "",
            InjuryStatus::Questionable => "Q",
            InjuryStatus::Doubtful => "D",
            InjuryStatus::Out => "O",
            InjuryStatus::InjuredReserve => "IR",
        }
    }
}

/// Where a player currently sits in the league.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Availability {
    FreeAgent,
    Waivers,
    Rostered { team_key: String },
}

impl Availability {
    pub fn is_available(&self) -> bool {
        !matches!(self, Availability::Rostered { .. })
    }

    pub fn code(&self) -> &'static str {
        match self {
            Availability::FreeAgent => "FA",
            Availability::Waivers => "W",
            Availability::Rostered { .. } => "T",
        }
    }
}

/// An NFL player as seen by the league.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Player {
    pub player_id: String,
    pub name: String,
    /// Primary position (first eligible position).
    pub position: Position,
    #[serde(default)]
    pub eligible_positions: Vec<Position>,
    pub nfl_team: Option<String>,
    #[serde(default)]
    pub status: InjuryStatus,
    pub injury_note: Option<String>,
    pub bye_week: Option<u32>,
    pub percent_owned: Option<Decimal>,
    /// Projected fantasy points for the current week; `None` when unknown.
    pub projected_points: Option<Decimal>,
    /// Opponent defense rank against this position (1 = toughest, 32 = easiest).
    pub opponent_def_rank: Option<u32>,
    /// Recent change in snap share, e.g. `0.10` for +10 points of share.
    pub snap_trend: Option<Decimal>,
    /// Week-to-week standard deviation of fantasy points.
    pub volatility: Option<Decimal>,
    pub availability: Availability,
}

impl Player {
    /// Positions this player may start at, never empty.
    pub fn positions(&self) -> Vec<Position> {
        if self.eligible_positions.is_empty() {
            vec![self.position]
        } else {
            self.eligible_positions.clone()
        }
    }

    pub fn is_eligible_for(&self, slot: Slot) -> bool {
        self.positions().into_iter().any(|p| slot.accepts(p))
    }

    /// Last name, used for alphabetical sorting.
    pub fn last_name(&self) -> &str {
        self.name.split_whitespace().last().unwrap_or(&self.name)
    }

    /// Helper to build a test player with sensible defaults.
    #[cfg(test)]
    pub fn sample(id: &str, position: Position, projected: Option<Decimal>) -> Self {
        Player {
            player_id: id.to_string(),
            name: format!("Player {id}"),
            position,
            eligible_positions: vec![position],
            nfl_team: Some("KC".to_string()),
            status: InjuryStatus::Healthy,
            injury_note: None,
            bye_week: None,
            percent_owned: None,
            projected_points: projected,
            opponent_def_rank: None,
            snap_trend: None,
            volatility: None,
            availability: Availability::Rostered {
                team_key: "t.1".to_string(),
            },
        }
    }
}

impl fmt::Display for Player {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}", self.name, self.position)?;
        if let Some(team) = &self.nfl_team {
            write!(f, ", {team}")?;
        }
        write!(f, ")")?;
        if self.status != InjuryStatus::Healthy {
            write!(f, " [{}]", self.status.code())?;
        }
        Ok(())
    }
}

/// A fantasy team's roster for one week.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Roster {
    pub team_key: String,
    pub week: u32,
    pub players: Vec<Player>,
}

// ---------------------------------------------------------------------------
// Matchups & transactions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchupSide {
    pub team_key: String,
    pub name: String,
    pub points: Option<Decimal>,
    pub projected_points: Option<Decimal>,
}

/// A head-to-head pairing for one week.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Matchup {
    pub week: u32,
    pub teams: Vec<MatchupSide>,
}

impl Matchup {
    /// Stable store key: week plus sorted team keys.
    pub fn key(&self) -> String {
        let mut teams: Vec<&str> = self.teams.iter().map(|t| t.team_key.as_str()).collect();
        teams.sort_unstable();
        format!("{}:{}", self.week, teams.join(":"))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionMove {
    pub player_id: String,
    pub player_name: String,
    /// "add", "drop", "trade".
    pub kind: String,
    pub source_team: Option<String>,
    pub destination_team: Option<String>,
}

/// A completed league transaction (add, drop, trade, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub transaction_key: String,
    pub kind: String,
    pub status: String,
    pub timestamp: DateTime<Utc>,
    pub moves: Vec<TransactionMove>,
}

impl Transaction {
    /// Whether any move in this transaction touches the team named by
    /// `team_id` (see [`team_matches`]).
    pub fn involves_team(&self, team_id: &str) -> bool {
        self.moves.iter().any(|m| {
            [&m.source_team, &m.destination_team]
                .into_iter()
                .flatten()
                .any(|key| team_matches(team_id, key))
        })
    }
}

/// Whether a configured team id ("3" or a full key) names `team_key`.
pub fn team_matches(team_id: &str, team_key: &str) -> bool {
    team_key == team_id || team_key.ends_with(&format!(".t.{team_id}"))
}

// ---------------------------------------------------------------------------
// Recommendations
// ---------------------------------------------------------------------------

/// Suggested roster action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Action {
    Start { slot: Slot },
    Bench,
    /// Pick up a player, dropping `drop` when the roster is full.
    Add { drop: Option<String> },
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Start { slot } => write!(f, "START {slot}"),
            Action::Bench => write!(f, "BENCH"),
            Action::Add { drop: Some(d) } => write!(f, "ADD (drop {d})"),
            Action::Add { drop: None } => write!(f, "ADD"),
        }
    }
}

/// A scored, ranked suggestion with the rules that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub player_id: String,
    pub player_name: String,
    pub position: Position,
    pub action: Action,
    pub score: Decimal,
    pub rationale: Vec<String>,
}

impl fmt::Display for Recommendation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:<14} {:<24} {:<4} {:>8.2}  {}",
            self.action.to_string(),
            self.player_name,
            self.position,
            self.score,
            self.rationale.join("; "),
        )
    }
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Failure of a single remote fetch.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Rate limited by remote source")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Transient remote failure: {0}")]
    Transient(String),

    #[error("Not found upstream: {0}")]
    NotFound(String),

    #[error("Malformed payload: {0}")]
    Malformed(String),
}

impl FetchError {
    /// Short label for logs and events.
    pub fn kind(&self) -> &'static str {
        match self {
            FetchError::Auth(_) => "auth",
            FetchError::RateLimited { .. } => "rate_limited",
            FetchError::Transient(_) => "transient",
            FetchError::NotFound(_) => "not_found",
            FetchError::Malformed(_) => "malformed",
        }
    }
}

/// Local persistence failure. Always surfaced to the caller.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Snapshot I/O error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Snapshot serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Failed to decode {entity_type} '{key}': {source}")]
    Decode {
        entity_type: EntityType,
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Snapshot lock poisoned")]
    Poisoned,
}

/// Decision engine failure.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The engine produced a lineup that breaks league constraints. This is
    /// a bug in lineup assembly, never a data problem.
    #[error("Illegal lineup produced (internal error): {0}")]
    IllegalLineup(String),

    #[error("Invalid ruleset: {0}")]
    InvalidRuleset(String),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
