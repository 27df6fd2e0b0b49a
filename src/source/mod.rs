//! Remote league-data sources.
//!
//! Defines the `RemoteSource` trait consumed by the sync scheduler and
//! provides the Yahoo Fantasy implementation. Credentials and token
//! refresh live entirely inside the implementation; callers only see
//! typed payloads or a [`FetchError`].

pub mod auth;
pub mod yahoo;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::types::{FetchError, League, Matchup, Player, Position, Roster, TeamStanding, Transaction};

/// League settings plus the current standings, fetched together.
#[derive(Debug, Clone, PartialEq)]
pub struct LeagueData {
    pub league: League,
    pub standings: Vec<TeamStanding>,
}

/// Abstraction over a fantasy league data provider.
///
/// Every call may fail with any [`FetchError`] variant; implementations
/// must not retry internally beyond a single token refresh, since retry
/// policy belongs to the scheduler.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RemoteSource: Send + Sync {
    /// League configuration and standings.
    async fn fetch_league(&self, league_id: &str) -> Result<LeagueData, FetchError>;

    /// A team's current roster.
    async fn fetch_roster(&self, team_id: &str) -> Result<Roster, FetchError>;

    /// Available players (free agents and waivers), optionally one position.
    async fn fetch_player_pool(
        &self,
        league_id: &str,
        position: Option<Position>,
    ) -> Result<Vec<Player>, FetchError>;

    /// Completed transactions, newest first, optionally only those after `since`.
    async fn fetch_transactions(
        &self,
        league_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Transaction>, FetchError>;

    /// Head-to-head matchups for a week (`None` = current week).
    async fn fetch_matchups(
        &self,
        league_id: &str,
        week: Option<u32>,
    ) -> Result<Vec<Matchup>, FetchError>;
}
