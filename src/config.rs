//! Configuration loading from TOML with environment variable overrides.
//!
//! Reads `config.toml` and deserializes into strongly-typed structs. Every
//! section has defaults, so an empty file is a valid configuration. A few
//! settings can be overridden from the environment (or a `.env` file):
//! `YAHOO_LEAGUE_ID`, `YAHOO_TEAM_ID`, `DB_PATH` and `POLL_INTERVAL_MIN`.
//! Credentials are never stored here, only the path to the credential file.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::engine::rules::Ruleset;
use crate::source::auth::DEFAULT_TOKEN_URL;
use crate::types::Position;

/// Top-level application configuration.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    pub coach: CoachConfig,
    pub league: LeagueConfig,
    pub yahoo: YahooConfig,
    pub sync: SyncConfig,
    pub storage: StorageConfig,
    pub engine: EngineConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CoachConfig {
    pub name: String,
}

impl Default for CoachConfig {
    fn default() -> Self {
        Self {
            name: "Fantasy Coach".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct LeagueConfig {
    /// League id ("12345") or full league key ("nfl.l.12345").
    pub league_id: String,
    /// Your team id ("3") or full team key.
    pub team_id: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct YahooConfig {
    pub base_url: String,
    pub token_url: String,
    pub credentials_file: String,
    pub timeout_secs: u64,
    pub user_agent: String,
    /// Players per page when listing the available pool.
    pub page_size: u32,
    pub max_pages: u32,
}

impl Default for YahooConfig {
    fn default() -> Self {
        Self {
            base_url: "https://fantasysports.yahooapis.com/fantasy/v2".to_string(),
            token_url: DEFAULT_TOKEN_URL.to_string(),
            credentials_file: "data/yahoo_oauth.json".to_string(),
            timeout_secs: 30,
            user_agent: "fantasy-coach/0.1.0".to_string(),
            page_size: 25,
            max_pages: 2,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SyncConfig {
    /// How often the driver emits a tick.
    pub tick_interval_secs: u64,
    /// Most fetches started in a single tick.
    pub max_fetches_per_tick: usize,
    /// Most fetches in flight at once within a tick.
    pub max_concurrency: usize,
    /// Request budget shared by all fetches over `rate_limit_window_secs`.
    pub rate_limit_requests: usize,
    pub rate_limit_window_secs: u64,
    pub base_backoff_secs: u64,
    pub max_backoff_secs: u64,
    /// Consecutive failures before a task is suspended.
    pub max_failures: u32,
    /// Consecutive NotFound failures before a task is suspended.
    pub not_found_limit: u32,
    pub league_interval_secs: u64,
    pub roster_interval_secs: u64,
    pub matchups_interval_secs: u64,
    pub player_pool_interval_secs: u64,
    pub transactions_interval_secs: u64,
    /// One player-pool task per listed position; empty means one unfiltered task.
    pub player_positions: Vec<Position>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: 60,
            max_fetches_per_tick: 4,
            max_concurrency: 2,
            rate_limit_requests: 20,
            rate_limit_window_secs: 60,
            base_backoff_secs: 30,
            max_backoff_secs: 900,
            max_failures: 8,
            not_found_limit: 2,
            league_interval_secs: 300,
            roster_interval_secs: 300,
            matchups_interval_secs: 900,
            player_pool_interval_secs: 1800,
            transactions_interval_secs: 900,
            player_positions: Position::ALL.to_vec(),
        }
    }
}

impl SyncConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs.max(1))
    }

    /// Apply a polling cadence: ticks and league/roster refreshes follow it.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        let secs = interval.as_secs().max(1);
        self.tick_interval_secs = secs;
        self.league_interval_secs = secs;
        self.roster_interval_secs = secs;
        self
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    pub snapshot_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            snapshot_path: "data/snapshot.json".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EngineConfig {
    pub ruleset: Ruleset,
    /// Maximum waiver suggestions returned.
    pub waiver_limit: usize,
    /// Data older than this is reported as stale even if the last sync succeeded.
    pub stale_after_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ruleset: Ruleset::standard(),
            waiver_limit: 5,
            stale_after_secs: 3600,
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path}"))?;
        Self::parse(&contents).with_context(|| format!("Failed to parse config file: {path}"))
    }

    /// Load from `path` if it exists, otherwise start from defaults.
    pub fn load_or_default(path: &str) -> Result<Self> {
        if Path::new(path).exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(contents)?;
        config.engine.ruleset.validate()?;
        Ok(config)
    }

    /// Apply environment overrides on top of the file values.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(v) = lookup("YAHOO_LEAGUE_ID").filter(|v| !v.is_empty()) {
            self.league.league_id = v;
        }
        if let Some(v) = lookup("YAHOO_TEAM_ID").filter(|v| !v.is_empty()) {
            self.league.team_id = v;
        }
        if let Some(v) = lookup("DB_PATH").filter(|v| !v.is_empty()) {
            self.storage.snapshot_path = v;
        }
        if let Some(v) = lookup("POLL_INTERVAL_MIN").filter(|v| !v.is_empty()) {
            let minutes: u64 = v
                .trim()
                .parse()
                .with_context(|| format!("POLL_INTERVAL_MIN is not a number: {v}"))?;
            self.sync = self
                .sync
                .clone()
                .with_poll_interval(Duration::from_secs(minutes * 60));
        }
        Ok(())
    }
}
