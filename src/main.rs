//! Fantasy Coach: league poller and lineup coach
//!
//! Entry point. Loads configuration, initialises structured logging,
//! opens the local snapshot and the Yahoo client, then either answers a
//! one-shot query from the snapshot or runs the sync scheduler until
//! Ctrl+C.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

use fantasy_coach::coach::{AvailabilityFilter, Coach, Freshness, PlayerFilter, PlayerSort};
use fantasy_coach::config::AppConfig;
use fantasy_coach::source::yahoo::YahooClient;
use fantasy_coach::storage::file::JsonFileStore;
use fantasy_coach::sync::{SyncEvent, TickReport};
use fantasy_coach::types::{FetchError, Position, Recommendation};

const BANNER: &str = r#"
  ___         _                  ___                 _
 | __|_ _ _ _| |_ __ _ ____  _  / __|___  __ _  __| |_
 | _/ _` | ' \  _/ _` (_-< || || (__/ _ \/ _` |/ _| ' \
 |_|\__,_|_||_\__\__,_/__/\_, | \___\___/\__,_|\__|_||_|
                          |__/
  League poller and lineup coach
"#;

#[derive(Parser, Debug)]
#[command(name = "fantasy-coach", version, about = "Yahoo fantasy football coach")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, global = true, default_value = "config.toml")]
    config: String,

    /// Sync due data from Yahoo before answering.
    #[arg(long, global = true)]
    sync: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// League standings.
    Standings,
    /// Players in the pool.
    Players {
        #[arg(long)]
        pos: Option<Position>,
        /// Case-insensitive name search.
        #[arg(long)]
        search: Option<String>,
        /// AR (least owned), POWN (most owned) or NAME.
        #[arg(long, default_value = "AR")]
        sort: PlayerSort,
        /// A (available), FA, W, T (taken) or ALL.
        #[arg(long, default_value = "A")]
        status: AvailabilityFilter,
        #[arg(long, default_value_t = 25)]
        limit: usize,
    },
    /// A team's roster (defaults to your team).
    Roster {
        #[arg(long)]
        team: Option<String>,
    },
    /// Recommended starting lineup.
    Lineup {
        #[arg(long)]
        team: Option<String>,
    },
    /// Waiver pickups, with the player to drop when the roster is full.
    Waivers {
        #[arg(long)]
        team: Option<String>,
    },
    /// Recent league transactions.
    Transactions {
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// This week's matchups.
    Matchups,
    /// Draft pick suggestions.
    Draft {
        /// Positional needs such as `RB=2,WR=1`. Defaults to open starting slots.
        #[arg(long, value_delimiter = ',')]
        need: Vec<String>,
        /// Picks before your next turn.
        #[arg(long, default_value_t = 10)]
        picks_until_next: u32,
        /// Show positional tiers instead of suggestions.
        #[arg(long)]
        tiers: bool,
    },
    /// Sync task status.
    Tasks,
    /// Clear a task's failures (all suspended tasks when no id is given).
    Reset { task: Option<String> },
    /// Poll Yahoo in the background until Ctrl+C.
    Scheduler {
        /// Poll interval in minutes.
        #[arg(long)]
        poll: Option<u64>,
    },
    /// One full sync pass, then exit.
    Run,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (non-fatal if missing)
    let _ = dotenv::dotenv();

    let cli = Cli::parse();

    let mut cfg = AppConfig::load_or_default(&cli.config)?;
    cfg.apply_env_overrides()?;

    init_logging();

    if cfg.league.league_id.is_empty() {
        bail!("No league configured: set league.league_id in {} or YAHOO_LEAGUE_ID", cli.config);
    }

    // -- Components --------------------------------------------------------

    let store = Arc::new(
        JsonFileStore::open(&cfg.storage.snapshot_path)
            .with_context(|| format!("Failed to open snapshot {}", cfg.storage.snapshot_path))?,
    );
    let client = YahooClient::new(&cfg.yahoo, &cfg.league.league_id)
        .context("Failed to set up the Yahoo client")?;
    let coach = Coach::new(cfg, Arc::new(client), store)?;

    if let Command::Roster { team: Some(team) } = &cli.command {
        coach.track_team(team).await;
    }

    match cli.command {
        Command::Run => {
            let report = coach.run_once().await?;
            print_tick(&report);
            return Ok(());
        }
        Command::Scheduler { poll } => return run_scheduler(&coach, poll).await,
        _ if cli.sync => {
            let report = coach.run_once().await?;
            print_tick(&report);
        }
        _ => {}
    }

    match cli.command {
        Command::Standings => {
            let standings = coach.get_standings().await?;
            print_freshness(&standings.freshness);
            println!("{:>4}  {:<28} {:>9}  {:>8}  {:>8}", "RANK", "TEAM", "W-L-T", "PF", "PA");
            for t in &standings.data {
                let rank = t.rank.map(|r| r.to_string()).unwrap_or_else(|| "-".into());
                println!(
                    "{:>4}  {:<28} {:>9}  {:>8}  {:>8}",
                    rank,
                    t.name,
                    format!("{}-{}-{}", t.wins, t.losses, t.ties),
                    t.points_for.round_dp(2),
                    t.points_against.round_dp(2)
                );
            }
        }
        Command::Players {
            pos,
            search,
            sort,
            status,
            limit,
        } => {
            let filter = PlayerFilter {
                position: pos,
                search,
                availability: status,
                sort,
                limit: Some(limit),
            };
            let players = coach.list_players(&filter).await?;
            print_freshness(&players.freshness);
            println!("{:<26} {:<4} {:<4} {:>6} {:>7}  {}", "NAME", "POS", "TEAM", "OWN%", "PROJ", "STATUS");
            for p in &players.data {
                println!(
                    "{:<26} {:<4} {:<4} {:>6} {:>7}  {}",
                    p.name,
                    p.position,
                    p.nfl_team.as_deref().unwrap_or("-"),
                    p.percent_owned.map(|v| v.round_dp(1).to_string()).unwrap_or_else(|| "-".into()),
                    p.projected_points.map(|v| v.round_dp(2).to_string()).unwrap_or_else(|| "-".into()),
                    p.status.code()
                );
            }
        }
        Command::Roster { team } => {
            let roster = coach.get_roster(team.as_deref()).await?;
            print_freshness(&roster.freshness);
            println!("{} (week {})", roster.data.team_key, roster.data.week);
            for p in &roster.data.players {
                println!(
                    "  {:<4} {:<26} {:<4} {}",
                    p.position,
                    p.name,
                    p.nfl_team.as_deref().unwrap_or("-"),
                    p.status.code()
                );
            }
        }
        Command::Lineup { team } => {
            let recs = coach.recommend_lineup(team.as_deref()).await?;
            print_freshness(&recs.freshness);
            print_recommendations(&recs.data);
        }
        Command::Waivers { team } => {
            let recs = coach.recommend_waivers(team.as_deref()).await?;
            print_freshness(&recs.freshness);
            if recs.data.is_empty() {
                println!("No waiver pickup beats your current roster.");
            }
            print_recommendations(&recs.data);
        }
        Command::Transactions { limit } => {
            let txs = coach.list_transactions(limit).await?;
            print_freshness(&txs.freshness);
            for tx in &txs.data {
                println!("{}  {:<10} {}", tx.timestamp.format("%Y-%m-%d %H:%M"), tx.kind, tx.status);
                for mv in &tx.moves {
                    println!(
                        "    {:<6} {:<26} {} -> {}",
                        mv.kind,
                        mv.player_name,
                        mv.source_team.as_deref().unwrap_or("FA"),
                        mv.destination_team.as_deref().unwrap_or("FA")
                    );
                }
            }
        }
        Command::Matchups => {
            let matchups = coach.get_matchups().await?;
            print_freshness(&matchups.freshness);
            for m in &matchups.data {
                let sides: Vec<String> = m
                    .teams
                    .iter()
                    .map(|s| {
                        let pts = s.points.map(|p| p.round_dp(2).to_string()).unwrap_or_else(|| "-".into());
                        format!("{} ({pts})", s.name)
                    })
                    .collect();
                println!("Week {}: {}", m.week, sides.join(" vs "));
            }
        }
        Command::Draft {
            need,
            picks_until_next,
            tiers,
        } => {
            if tiers {
                let tiers = coach.draft_tiers().await?;
                print_freshness(&tiers.freshness);
                for t in &tiers.data {
                    let names: Vec<&str> = t.players.iter().map(|p| p.name.as_str()).collect();
                    println!("{} tier {}: {}", t.position, t.tier, names.join(", "));
                }
            } else {
                let needs = parse_needs(&need)?;
                let picks = coach.suggest_draft(needs, picks_until_next).await?;
                print_freshness(&picks.freshness);
                for (i, s) in picks.data.iter().enumerate() {
                    println!("{}. {} ({}) score {}", i + 1, s.player.name, s.player.position, s.score);
                    for r in &s.rationale {
                        println!("     - {r}");
                    }
                }
            }
        }
        Command::Tasks => {
            println!("{:<14} {:<10} {:>8}  {:<20}  {}", "TASK", "STATUS", "FAILURES", "NEXT", "LAST ERROR");
            for t in coach.task_statuses().await {
                println!(
                    "{:<14} {:<10} {:>8}  {:<20}  {}",
                    t.id(),
                    t.status,
                    t.failures,
                    t.next_eligible.format("%Y-%m-%d %H:%M:%S"),
                    t.last_error.map(|e| e.to_string()).unwrap_or_default()
                );
            }
        }
        Command::Reset { task } => match task {
            Some(id) => {
                coach.reset_task(&id).await?;
                println!("Reset {id}");
            }
            None => {
                let ids = coach.reset_suspended().await;
                println!("Reset {} suspended task(s)", ids.len());
            }
        },
        Command::Run | Command::Scheduler { .. } => {}
    }

    Ok(())
}

/// Run the background scheduler until Ctrl+C. An authentication failure
/// stops the loop with an error so the process exits non-zero.
async fn run_scheduler(coach: &Coach, poll_minutes: Option<u64>) -> Result<()> {
    println!("{BANNER}");

    let interval = match poll_minutes {
        Some(m) if m > 0 => Duration::from_secs(m * 60),
        Some(_) => bail!("--poll must be at least 1 minute"),
        None => coach.config().sync.tick_interval(),
    };

    let mut events = coach.subscribe().await;
    coach.start_scheduler(interval).await?;

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    info!(
        name = %coach.config().coach.name,
        league = %coach.config().league.league_id,
        interval_secs = interval.as_secs(),
        "Entering scheduler loop. Press Ctrl+C to stop."
    );

    let mut fatal: Option<FetchError> = None;
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(SyncEvent::Succeeded { task, entities, changed }) => {
                    info!(task = %task, entities, changed, "Synced");
                }
                Ok(SyncEvent::Failed { .. }) => {}
                Ok(SyncEvent::Suspended { task, error }) => {
                    if matches!(error, FetchError::Auth(_)) {
                        error!(task = %task, error = %error, "Authentication failed, stopping");
                        fatal = Some(error);
                        break;
                    }
                    warn!(task = %task, "Task suspended; `fantasy-coach reset {task}` resumes it");
                }
                Err(RecvError::Lagged(missed)) => warn!(missed, "Sync event stream lagged"),
                Err(RecvError::Closed) => break,
            },
            _ = &mut shutdown => {
                info!("Shutdown signal received.");
                break;
            }
        }
    }

    coach.stop_scheduler().await;

    match fatal {
        Some(err) => Err(err).context("Scheduler stopped"),
        None => {
            info!("Fantasy Coach shut down cleanly.");
            Ok(())
        }
    }
}

/// Parse `POS=N` pairs.
fn parse_needs(raw: &[String]) -> Result<Option<BTreeMap<Position, u32>>> {
    if raw.is_empty() {
        return Ok(None);
    }
    let mut needs = BTreeMap::new();
    for item in raw {
        let (pos, count) = item
            .split_once('=')
            .with_context(|| format!("Expected POS=N, got {item}"))?;
        let pos: Position = pos.parse()?;
        let count: u32 = count
            .trim()
            .parse()
            .with_context(|| format!("Bad count in {item}"))?;
        needs.insert(pos, count);
    }
    Ok(Some(needs))
}

fn print_freshness(freshness: &Freshness) {
    println!("Data {freshness}");
    println!();
}

fn print_tick(report: &TickReport) {
    println!(
        "Synced {} task(s), {} failed, {} deferred",
        report.succeeded.len(),
        report.failed.len(),
        report.deferred.len()
    );
    for (task, err) in &report.failed {
        println!("  {task}: {err}");
    }
}

fn print_recommendations(recs: &[Recommendation]) {
    for r in recs {
        println!("{:<14} {:<26} {:<4} {:>8}", r.action.to_string(), r.player_name, r.position, r.score);
        for line in &r.rationale {
            println!("     - {line}");
        }
    }
}

/// Initialise the `tracing` subscriber.
fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("fantasy_coach=info"));

    let json_logging = std::env::var("COACH_LOG_JSON").is_ok();

    if json_logging {
        fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    } else {
        fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_writer(std::io::stderr)
            .init();
    }
}
