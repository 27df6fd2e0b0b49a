//! Yahoo Fantasy Sports integration.
//!
//! API docs: https://developer.yahoo.com/fantasysports/guide/
//! Base URL: https://fantasysports.yahooapis.com/fantasy/v2
//! Auth: OAuth2 bearer token (see [`super::auth`]).
//! Rate limit: undocumented; throttled clients get HTTP 999 or 429.
//!
//! Yahoo's JSON rendering nests metadata as arrays of single-key objects
//! and collections as objects keyed "0", "1", ... plus "count". The
//! helpers at the bottom of this file flatten both shapes.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::{Client, StatusCode};
use rust_decimal::Decimal;
use secrecy::ExposeSecret;
use serde_json::{Map, Value};
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

use super::auth::TokenManager;
use super::{LeagueData, RemoteSource};
use crate::config::YahooConfig;
use crate::types::{
    Availability, FetchError, InjuryStatus, League, Matchup, MatchupSide, Player, Position,
    Roster, Slot, SlotRequirement, TeamStanding, Transaction, TransactionMove,
};

/// Yahoo's "request denied" throttling status.
const YAHOO_THROTTLED: u16 = 999;

/// Game code prefix for NFL league keys.
const NFL_GAME: &str = "nfl";

/// Player subresources requested on every player collection. Without
/// `projected_points` Yahoo omits `player_projected_points`.
const PLAYER_OUT: &str = "projected_points";

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Yahoo Fantasy Sports client.
pub struct YahooClient {
    http: Client,
    tokens: TokenManager,
    base_url: String,
    league_key: String,
    page_size: u32,
    max_pages: u32,
}

impl YahooClient {
    /// Build a client for one league. Fails with `FetchError::Auth` when
    /// the credential file is missing or incomplete.
    pub fn new(config: &YahooConfig, league_id: &str) -> Result<Self, FetchError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(config.user_agent.as_str())
            .build()
            .map_err(|e| FetchError::Transient(format!("failed to build HTTP client: {e}")))?;

        let tokens = TokenManager::load(&config.credentials_file, &config.token_url, http.clone())?;

        Ok(Self {
            http,
            tokens,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            league_key: league_key(league_id),
            page_size: config.page_size.max(1),
            max_pages: config.max_pages.max(1),
        })
    }

    /// Normalise a team id ("3" or a full key) to a team key.
    pub fn team_key(&self, team_id: &str) -> String {
        if team_id.contains(".t.") {
            team_id.to_string()
        } else {
            format!("{}.t.{}", self.league_key, team_id)
        }
    }

    /// GET a resource path and return `fantasy_content`.
    ///
    /// A 401 triggers one token refresh and retry; every other failure is
    /// classified and returned.
    async fn get_content(&self, path: &str) -> Result<Value, FetchError> {
        let url = format!("{}/{}?format=json", self.base_url, path.trim_start_matches('/'));

        for attempt in 0..2 {
            let token = self.tokens.bearer().await?;
            debug!(url = %url, attempt, "Fetching from Yahoo");

            let resp = self
                .http
                .get(&url)
                .bearer_auth(token.expose_secret())
                .send()
                .await
                .map_err(classify_transport)?;

            let status = resp.status();
            if status == StatusCode::UNAUTHORIZED && attempt == 0 {
                self.tokens.invalidate().await;
                continue;
            }
            if !status.is_success() {
                let retry_after = resp
                    .headers()
                    .get(reqwest::header::RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.trim().parse::<u64>().ok())
                    .map(Duration::from_secs);
                let body = resp.text().await.unwrap_or_default();
                return Err(classify_status(status, retry_after, &body));
            }

            let body: Value = resp
                .json()
                .await
                .map_err(|e| FetchError::Malformed(format!("invalid JSON from {path}: {e}")))?;
            return body
                .get("fantasy_content")
                .cloned()
                .ok_or_else(|| FetchError::Malformed(format!("{path}: missing fantasy_content")));
        }

        Err(FetchError::Auth("access token rejected after refresh".into()))
    }
}

#[async_trait]
impl RemoteSource for YahooClient {
    async fn fetch_league(&self, league_id: &str) -> Result<LeagueData, FetchError> {
        let key = league_key(league_id);
        let content = self
            .get_content(&format!("league/{key};out=settings,standings"))
            .await?;
        parse_league(&content)
    }

    async fn fetch_roster(&self, team_id: &str) -> Result<Roster, FetchError> {
        let key = self.team_key(team_id);
        let content = self.get_content(&roster_path(&key)).await?;
        parse_roster(&content, &key)
    }

    async fn fetch_player_pool(
        &self,
        league_id: &str,
        position: Option<Position>,
    ) -> Result<Vec<Player>, FetchError> {
        let key = league_key(league_id);
        let mut pool = Vec::new();

        for page in 0..self.max_pages {
            let path = pool_path(&key, position, page * self.page_size, self.page_size);
            let content = self.get_content(&path).await?;
            let players = parse_players(&content, None)?;
            let exhausted = players.len() < self.page_size as usize;
            pool.extend(players);
            if exhausted {
                break;
            }
        }

        Ok(pool)
    }

    async fn fetch_transactions(
        &self,
        league_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Transaction>, FetchError> {
        let key = league_key(league_id);
        let content = self.get_content(&format!("league/{key}/transactions")).await?;
        let mut txs = parse_transactions(&content)?;
        if let Some(since) = since {
            txs.retain(|t| t.timestamp > since);
        }
        Ok(txs)
    }

    async fn fetch_matchups(
        &self,
        league_id: &str,
        week: Option<u32>,
    ) -> Result<Vec<Matchup>, FetchError> {
        let key = league_key(league_id);
        let path = match week {
            Some(w) => format!("league/{key}/scoreboard;week={w}"),
            None => format!("league/{key}/scoreboard"),
        };
        let content = self.get_content(&path).await?;
        parse_matchups(&content)
    }
}

fn roster_path(team_key: &str) -> String {
    format!("team/{team_key}/roster/players;out={PLAYER_OUT}")
}

/// One page of available players, best ranked first.
fn pool_path(key: &str, position: Option<Position>, start: u32, count: u32) -> String {
    let mut filter = format!("players;status=A;sort=AR;start={start};count={count}");
    if let Some(pos) = position {
        filter.push_str(&format!(";position={}", urlencoding::encode(&pos.to_string())));
    }
    format!("league/{key}/{filter};out=ownership,percent_owned,{PLAYER_OUT}")
}

// ---------------------------------------------------------------------------
// Error classification
// ---------------------------------------------------------------------------

/// Normalise a league id ("12345" or a full key) to a league key.
pub fn league_key(league_id: &str) -> String {
    if league_id.contains(".l.") {
        league_id.to_string()
    } else {
        format!("{NFL_GAME}.l.{league_id}")
    }
}

fn classify_transport(e: reqwest::Error) -> FetchError {
    if e.is_decode() {
        FetchError::Malformed(e.to_string())
    } else {
        FetchError::Transient(e.to_string())
    }
}

/// Map a non-success HTTP status to the fetch error taxonomy.
pub fn classify_status(status: StatusCode, retry_after: Option<Duration>, body: &str) -> FetchError {
    let snippet: String = body.chars().take(200).collect();
    match status.as_u16() {
        401 | 403 => FetchError::Auth(format!("{status}: {snippet}")),
        404 => FetchError::NotFound(format!("{status}: {snippet}")),
        429 | YAHOO_THROTTLED => FetchError::RateLimited { retry_after },
        s if s >= 500 => FetchError::Transient(format!("{status}: {snippet}")),
        _ => FetchError::Malformed(format!("unexpected status {status}: {snippet}")),
    }
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

fn malformed(what: &str) -> FetchError {
    FetchError::Malformed(format!("missing or invalid {what}"))
}

/// Merge Yahoo's nested "array of single-key objects" into one map.
/// Later keys overwrite earlier ones.
fn flatten(value: &Value) -> Map<String, Value> {
    let mut out = Map::new();
    flatten_into(value, &mut out);
    out
}

fn flatten_into(value: &Value, out: &mut Map<String, Value>) {
    match value {
        Value::Array(items) => {
            for item in items {
                flatten_into(item, out);
            }
        }
        Value::Object(map) => {
            for (k, v) in map {
                out.insert(k.clone(), v.clone());
            }
        }
        _ => {}
    }
}

/// Values of a collection object keyed "0", "1", ... in index order.
fn indexed(value: &Value) -> Vec<&Value> {
    let Some(map) = value.as_object() else {
        return match value.as_array() {
            Some(items) => items.iter().collect(),
            None => Vec::new(),
        };
    };
    let mut entries: Vec<(usize, &Value)> = map
        .iter()
        .filter_map(|(k, v)| k.parse::<usize>().ok().map(|i| (i, v)))
        .collect();
    entries.sort_by_key(|(i, _)| *i);
    entries.into_iter().map(|(_, v)| v).collect()
}

/// Depth-first search for the first value stored under `key`.
fn find_key<'a>(value: &'a Value, key: &str) -> Option<&'a Value> {
    match value {
        Value::Object(map) => {
            if let Some(v) = map.get(key) {
                return Some(v);
            }
            map.values().find_map(|v| find_key(v, key))
        }
        Value::Array(items) => items.iter().find_map(|v| find_key(v, key)),
        _ => None,
    }
}

fn as_string(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn as_u32(value: Option<&Value>) -> Option<u32> {
    as_string(value).and_then(|s| s.trim().parse().ok())
}

fn as_decimal(value: Option<&Value>) -> Option<Decimal> {
    as_string(value).and_then(|s| Decimal::from_str(s.trim()).ok())
}

/// Points totals appear as `{ "total": "12.3" }` under various wrappers.
fn points_total(map: &Map<String, Value>, key: &str) -> Option<Decimal> {
    map.get(key).and_then(|v| as_decimal(find_key(v, "total")))
}

fn parse_league(content: &Value) -> Result<LeagueData, FetchError> {
    let league = flatten(content.get("league").ok_or_else(|| malformed("league"))?);

    let league_key = as_string(league.get("league_key")).ok_or_else(|| malformed("league_key"))?;
    let settings = flatten(league.get("settings").ok_or_else(|| malformed("settings"))?);

    let mut roster_slots: Vec<SlotRequirement> = Vec::new();
    let mut max_roster_size = 0usize;
    if let Some(positions) = settings.get("roster_positions") {
        for entry in indexed(positions) {
            let rp = entry.get("roster_position").unwrap_or(entry);
            let code = as_string(rp.get("position")).unwrap_or_default();
            let count = as_u32(rp.get("count")).unwrap_or(0) as usize;
            if code == "IR" {
                continue;
            }
            max_roster_size += count;
            match code.parse::<Slot>() {
                Ok(slot) if count > 0 => roster_slots.push(SlotRequirement { slot, count }),
                Ok(_) => {}
                Err(_) => debug!(position = %code, "Skipping non-starting roster position"),
            }
        }
    }
    if roster_slots.is_empty() {
        return Err(malformed("roster_positions"));
    }

    let mut standings = Vec::new();
    if let Some(teams) = league.get("standings").and_then(|s| find_key(s, "teams")) {
        for entry in indexed(teams) {
            let team = flatten(entry.get("team").unwrap_or(entry));
            standings.push(parse_standing(&team)?);
        }
    }

    Ok(LeagueData {
        league: League {
            league_key,
            name: as_string(league.get("name")).unwrap_or_default(),
            season: as_string(league.get("season")).unwrap_or_default(),
            current_week: as_u32(league.get("current_week")).unwrap_or(1),
            num_teams: as_u32(league.get("num_teams")).unwrap_or(standings.len() as u32),
            scoring_type: as_string(league.get("scoring_type")).unwrap_or_default(),
            roster_slots,
            max_roster_size,
        },
        standings,
    })
}

fn parse_standing(team: &Map<String, Value>) -> Result<TeamStanding, FetchError> {
    let team_key = as_string(team.get("team_key")).ok_or_else(|| malformed("team_key"))?;
    let st = team.get("team_standings").cloned().unwrap_or(Value::Null);
    let totals = st.get("outcome_totals").cloned().unwrap_or(Value::Null);
    let manager = team
        .get("managers")
        .and_then(|m| find_key(m, "nickname"))
        .and_then(|n| as_string(Some(n)));

    Ok(TeamStanding {
        team_key,
        name: as_string(team.get("name")).unwrap_or_default(),
        manager,
        rank: as_u32(st.get("rank")),
        wins: as_u32(totals.get("wins")).unwrap_or(0),
        losses: as_u32(totals.get("losses")).unwrap_or(0),
        ties: as_u32(totals.get("ties")).unwrap_or(0),
        points_for: as_decimal(st.get("points_for")).unwrap_or_default(),
        points_against: as_decimal(st.get("points_against")).unwrap_or_default(),
    })
}

fn parse_roster(content: &Value, team_key: &str) -> Result<Roster, FetchError> {
    let team = content.get("team").ok_or_else(|| malformed("team"))?;
    let roster = find_key(team, "roster").ok_or_else(|| malformed("roster"))?;
    let week = as_u32(find_key(roster, "week")).unwrap_or(1);
    let owned = Availability::Rostered {
        team_key: team_key.to_string(),
    };
    Ok(Roster {
        team_key: team_key.to_string(),
        week,
        players: parse_players(roster, Some(owned))?,
    })
}

/// Parse every player in the first `players` collection under `content`.
///
/// Players without a recognised fantasy position (IDP slots and the like)
/// are skipped.
fn parse_players(content: &Value, owner: Option<Availability>) -> Result<Vec<Player>, FetchError> {
    let Some(players) = find_key(content, "players") else {
        return Ok(Vec::new());
    };
    let mut out = Vec::new();
    for entry in indexed(players) {
        let raw = flatten(entry.get("player").unwrap_or(entry));
        match parse_player(&raw, owner.clone())? {
            Some(player) => out.push(player),
            None => debug!(
                player_id = ?as_string(raw.get("player_id")),
                "Skipping player without a fantasy position"
            ),
        }
    }
    Ok(out)
}

fn parse_player(
    raw: &Map<String, Value>,
    owner: Option<Availability>,
) -> Result<Option<Player>, FetchError> {
    let player_id = as_string(raw.get("player_id")).ok_or_else(|| malformed("player_id"))?;
    let name = raw
        .get("name")
        .and_then(|n| as_string(n.get("full")).or_else(|| as_string(Some(n))))
        .unwrap_or_else(|| player_id.clone());

    let eligible_positions: Vec<Position> = raw
        .get("eligible_positions")
        .map(|ep| {
            let mut found = Vec::new();
            collect_positions(ep, &mut found);
            found
        })
        .unwrap_or_default();

    let primary = as_string(raw.get("primary_position"))
        .or_else(|| as_string(raw.get("display_position")))
        .and_then(|p| p.split(',').next().and_then(|s| s.parse::<Position>().ok()))
        .or_else(|| eligible_positions.first().copied());
    let Some(position) = primary else {
        return Ok(None);
    };

    let availability = owner.unwrap_or_else(|| ownership(raw));

    Ok(Some(Player {
        player_id,
        name,
        position,
        eligible_positions,
        nfl_team: as_string(raw.get("editorial_team_abbr")),
        status: InjuryStatus::from_code(as_string(raw.get("status")).as_deref()),
        injury_note: as_string(raw.get("injury_note")),
        bye_week: raw.get("bye_weeks").and_then(|b| as_u32(b.get("week"))),
        percent_owned: raw
            .get("percent_owned")
            .and_then(|p| as_decimal(find_key(p, "value")).or_else(|| as_decimal(Some(p)))),
        // `player_points` holds points already scored and is not a projection.
        projected_points: points_total(raw, "player_projected_points"),
        opponent_def_rank: None,
        snap_trend: None,
        volatility: None,
        availability,
    }))
}

fn collect_positions(value: &Value, out: &mut Vec<Position>) {
    match value {
        Value::String(s) => {
            if let Ok(p) = s.parse::<Position>() {
                if !out.contains(&p) {
                    out.push(p);
                }
            }
        }
        Value::Array(items) => items.iter().for_each(|v| collect_positions(v, out)),
        Value::Object(map) => map.values().for_each(|v| collect_positions(v, out)),
        _ => {}
    }
}

fn ownership(raw: &Map<String, Value>) -> Availability {
    let Some(own) = raw.get("ownership") else {
        return Availability::FreeAgent;
    };
    match as_string(own.get("ownership_type")).as_deref() {
        Some("waivers") => Availability::Waivers,
        Some("team") => Availability::Rostered {
            team_key: as_string(own.get("owner_team_key")).unwrap_or_default(),
        },
        _ => Availability::FreeAgent,
    }
}

fn parse_transactions(content: &Value) -> Result<Vec<Transaction>, FetchError> {
    let Some(txs) = find_key(content, "transactions") else {
        return Ok(Vec::new());
    };
    let mut out = Vec::new();
    for entry in indexed(txs) {
        let tx = entry.get("transaction").unwrap_or(entry);
        let meta = flatten(tx);
        let transaction_key =
            as_string(meta.get("transaction_key")).ok_or_else(|| malformed("transaction_key"))?;
        let timestamp = as_string(meta.get("timestamp"))
            .and_then(|s| s.parse::<i64>().ok())
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
            .ok_or_else(|| malformed("transaction timestamp"))?;

        let mut moves = Vec::new();
        if let Some(players) = meta.get("players") {
            for p in indexed(players) {
                let raw = flatten(p.get("player").unwrap_or(p));
                let data = raw
                    .get("transaction_data")
                    .map(flatten)
                    .unwrap_or_default();
                moves.push(TransactionMove {
                    player_id: as_string(raw.get("player_id")).unwrap_or_default(),
                    player_name: raw
                        .get("name")
                        .and_then(|n| as_string(n.get("full")))
                        .unwrap_or_default(),
                    kind: as_string(data.get("type")).unwrap_or_default(),
                    source_team: as_string(data.get("source_team_key")),
                    destination_team: as_string(data.get("destination_team_key")),
                });
            }
        }

        out.push(Transaction {
            transaction_key,
            kind: as_string(meta.get("type")).unwrap_or_default(),
            status: as_string(meta.get("status")).unwrap_or_default(),
            timestamp,
            moves,
        });
    }
    out.sort_by(|a, b| {
        b.timestamp
            .cmp(&a.timestamp)
            .then_with(|| a.transaction_key.cmp(&b.transaction_key))
    });
    Ok(out)
}

fn parse_matchups(content: &Value) -> Result<Vec<Matchup>, FetchError> {
    let Some(matchups) = find_key(content, "matchups") else {
        return Ok(Vec::new());
    };
    let mut out = Vec::new();
    for entry in indexed(matchups) {
        let m = entry.get("matchup").unwrap_or(entry);
        let week = as_u32(m.get("week")).ok_or_else(|| malformed("matchup week"))?;
        let teams = find_key(m, "teams").ok_or_else(|| malformed("matchup teams"))?;
        let mut sides = Vec::new();
        for t in indexed(teams) {
            let team = flatten(t.get("team").unwrap_or(t));
            sides.push(MatchupSide {
                team_key: as_string(team.get("team_key")).ok_or_else(|| malformed("team_key"))?,
                name: as_string(team.get("name")).unwrap_or_default(),
                points: points_total(&team, "team_points"),
                projected_points: points_total(&team, "team_projected_points"),
            });
        }
        out.push(Matchup { week, teams: sides });
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
