//! Sync → snapshot → recommendation flows through the public facade.

use chrono::{Duration, Utc};
use std::path::PathBuf;
use std::sync::Arc;

use fantasy_coach::coach::{Coach, CoachError, PlayerFilter, PlayerSort};
use fantasy_coach::config::AppConfig;
use fantasy_coach::storage::file::JsonFileStore;
use fantasy_coach::storage::MemoryStore;
use fantasy_coach::sync::TaskStatus;
use fantasy_coach::types::*;

use crate::mock_source::{ScriptedSource, LEAGUE_ID, TEAM_ID};

// ---- helpers ---------------------------------------------------------------

fn config() -> AppConfig {
    let mut cfg = AppConfig::default();
    cfg.league.league_id = LEAGUE_ID.into();
    cfg.league.team_id = TEAM_ID.into();
    cfg
}

fn coach_with(source: &ScriptedSource) -> Coach {
    Coach::new(config(), Arc::new(source.clone()), Arc::new(MemoryStore::new())).unwrap()
}

fn temp_snapshot() -> PathBuf {
    let mut p = std::env::temp_dir();
    p.push(format!("coach_it_snapshot_{}.json", uuid::Uuid::new_v4()));
    p
}

// ---- sync then recommend ---------------------------------------------------

#[tokio::test]
async fn test_full_sync_then_lineup() {
    let source = ScriptedSource::new();
    let coach = coach_with(&source);

    let report = coach.run_once().await.unwrap();
    assert!(report.failed.is_empty());
    // league, roster, matchups, six player pools, transactions
    assert_eq!(report.succeeded.len(), 10);
    assert_eq!(source.calls("players"), 6);

    let lineup = coach.recommend_lineup(None).await.unwrap();
    let plan: Vec<(&str, &Action)> = lineup
        .data
        .iter()
        .map(|r| (r.player_id.as_str(), &r.action))
        .collect();
    assert_eq!(
        plan,
        vec![
            ("p.qb20", &Action::Start { slot: Slot::QB }),
            ("p.wr9", &Action::Start { slot: Slot::WR }),
            ("p.qb15", &Action::Bench),
        ]
    );
    assert!(!lineup.freshness.stale);
}

#[tokio::test]
async fn test_reads_after_sync() {
    let source = ScriptedSource::new();
    let coach = coach_with(&source);
    coach.run_once().await.unwrap();

    let standings = coach.get_standings().await.unwrap();
    assert_eq!(standings.data.len(), 4);
    assert_eq!(standings.data[0].name, "Team 4");

    let matchups = coach.get_matchups().await.unwrap();
    assert_eq!(matchups.data.len(), 2);
    assert!(matchups.data.iter().all(|m| m.week == 6));

    let txs = coach.list_transactions(1).await.unwrap();
    assert_eq!(txs.data.len(), 1);
    assert_eq!(txs.data[0].transaction_key, "tx.2");

    let rbs = coach
        .list_players(&PlayerFilter {
            position: Some(Position::RB),
            sort: PlayerSort::NAME,
            ..PlayerFilter::default()
        })
        .await
        .unwrap();
    let ids: Vec<&str> = rbs.data.iter().map(|p| p.player_id.as_str()).collect();
    assert_eq!(ids, vec!["p.rb11"]);
}

#[tokio::test]
async fn test_waivers_fill_open_spot_with_upgrade() {
    let source = ScriptedSource::new();
    let coach = coach_with(&source);
    coach.run_once().await.unwrap();

    let recs = coach.recommend_waivers(None).await.unwrap();
    assert_eq!(recs.data.len(), 1);
    assert_eq!(recs.data[0].player_id, "p.wr14");
    assert_eq!(recs.data[0].action, Action::Add { drop: None });
}

#[tokio::test]
async fn test_waivers_name_drop_once_roster_is_full() {
    let source = ScriptedSource::new();
    source.set_max_roster(3);
    let coach = coach_with(&source);
    coach.run_once().await.unwrap();

    let recs = coach.recommend_waivers(None).await.unwrap();
    assert_eq!(recs.data.len(), 1);
    let rec = &recs.data[0];
    assert_eq!(rec.player_id, "p.wr14");
    assert_eq!(rec.action, Action::Add { drop: Some("p.wr9".into()) });
    assert!(rec
        .rationale
        .iter()
        .any(|r| r == "outscores Gamma Receiver by 5"));
}

// ---- failure handling ------------------------------------------------------

#[tokio::test]
async fn test_failed_sync_serves_last_known_good() {
    let source = ScriptedSource::new();
    let coach = coach_with(&source);
    let t0 = Utc::now();
    coach.run_once_at(t0).await.unwrap();

    source.set_error(FetchError::Transient("503".into()));
    let report = coach.run_once_at(t0 + Duration::hours(2)).await.unwrap();
    assert_eq!(report.succeeded.len(), 0);
    assert_eq!(report.failed.len(), 10);

    let roster = coach.get_roster(None).await.unwrap();
    assert_eq!(roster.data.players.len(), 3);
    assert!(roster.freshness.stale);
    assert!(roster.freshness.last_error.as_deref().unwrap().contains("503"));

    // Recovery clears the flag.
    source.clear_error();
    coach.run_once_at(t0 + Duration::hours(4)).await.unwrap();
    let roster = coach.get_roster(None).await.unwrap();
    assert!(roster.freshness.last_error.is_none());
}

#[tokio::test]
async fn test_auth_failure_is_fatal_and_suspends() {
    let source = ScriptedSource::new();
    source.set_error(FetchError::Auth("token expired".into()));
    let coach = coach_with(&source);

    let err = coach.run_once().await.unwrap_err();
    assert!(matches!(err, CoachError::Auth(_)));
    assert!(coach
        .task_statuses()
        .await
        .iter()
        .all(|t| t.status == TaskStatus::Suspended));
    assert!(matches!(
        coach.get_standings().await,
        Err(CoachError::NotSynced(_))
    ));

    // Suspended tasks are skipped until reset.
    let league_calls = source.calls("league");
    source.clear_error();
    coach.run_once().await.unwrap();
    assert_eq!(source.calls("league"), league_calls);

    let reset = coach.reset_suspended().await;
    assert_eq!(reset.len(), 10);
    let report = coach.run_once().await.unwrap();
    assert_eq!(report.succeeded.len(), 10);
}

#[tokio::test]
async fn test_unknown_team_roster_not_found() {
    let source = ScriptedSource::new();
    let coach = coach_with(&source);
    coach.track_team("9").await;
    let report = coach.run_once().await.unwrap();
    assert_eq!(report.failed.len(), 1);
    assert!(matches!(report.failed[0].1, FetchError::NotFound(_)));
    assert!(matches!(
        coach.get_roster(Some("9")).await,
        Err(CoachError::NotSynced(_))
    ));
}

// ---- persistence -----------------------------------------------------------

#[tokio::test]
async fn test_snapshot_survives_restart_without_network() {
    let path = temp_snapshot();
    {
        let source = ScriptedSource::new();
        let store = Arc::new(JsonFileStore::open(&path).unwrap());
        let coach = Coach::new(config(), Arc::new(source), store).unwrap();
        coach.run_once().await.unwrap();
    }

    let offline = ScriptedSource::new();
    offline.set_error(FetchError::Transient("offline".into()));
    let store = Arc::new(JsonFileStore::open(&path).unwrap());
    let coach = Coach::new(config(), Arc::new(offline.clone()), store).unwrap();

    let standings = coach.get_standings().await.unwrap();
    assert_eq!(standings.data.len(), 4);
    let lineup = coach.recommend_lineup(None).await.unwrap();
    assert_eq!(lineup.data[0].player_id, "p.qb20");
    assert_eq!(offline.calls("league"), 0);

    JsonFileStore::delete(&path).unwrap();
}

// ---- background scheduler --------------------------------------------------

#[tokio::test]
async fn test_background_scheduler_ticks_and_stops() {
    let source = ScriptedSource::new();
    let coach = coach_with(&source);
    let mut events = coach.subscribe().await;

    coach.start_manual_scheduler().await.unwrap();
    assert!(matches!(
        coach.start_manual_scheduler().await,
        Err(CoachError::AlreadyRunning)
    ));

    assert!(coach.inject_tick(Utc::now()).await);
    let report = coach.next_tick().await.unwrap().unwrap();
    // Per-tick cap: highest priority first.
    assert_eq!(report.attempted.len(), 4);
    assert_eq!(report.attempted[0], "league");
    assert!(events.try_recv().is_ok());

    assert!(coach.stop_scheduler().await);
    assert!(!coach.stop_scheduler().await);
    assert!(coach
        .task_statuses()
        .await
        .iter()
        .all(|t| t.status != TaskStatus::InFlight));
}

#[tokio::test]
async fn test_reads_do_not_wait_for_a_slow_tick() {
    let source = ScriptedSource::new();
    let coach = coach_with(&source);
    coach.run_once().await.unwrap();

    source.set_delay(std::time::Duration::from_secs(30));
    coach.start_manual_scheduler().await.unwrap();
    assert!(coach.inject_tick(Utc::now() + Duration::hours(2)).await);

    // Wait until the worker is stuck inside its fetches.
    let in_flight = tokio::time::timeout(std::time::Duration::from_secs(2), async {
        loop {
            let statuses = coach.task_statuses().await;
            if statuses.iter().any(|t| t.status == TaskStatus::InFlight) {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(in_flight.is_ok(), "tick never started");

    let league = tokio::time::timeout(std::time::Duration::from_secs(2), coach.get_league())
        .await
        .expect("read blocked behind the running tick")
        .unwrap();
    assert_eq!(league.data.current_week, 6);
    let lineup = tokio::time::timeout(std::time::Duration::from_secs(2), coach.recommend_lineup(None))
        .await
        .expect("read blocked behind the running tick")
        .unwrap();
    assert_eq!(lineup.data[0].player_id, "p.qb20");

    assert!(coach.stop_scheduler().await);
    assert!(coach
        .task_statuses()
        .await
        .iter()
        .all(|t| t.status != TaskStatus::InFlight));
}
