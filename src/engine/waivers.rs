//! Waiver-wire suggestions.
//!
//! A pickup is suggested when an available player outscores the weakest
//! rostered player at the same position, or when the roster has an open
//! spot. Once the roster is at its size limit every Add names a Drop, and
//! no rostered player is dropped twice.

use std::collections::HashSet;

use tracing::debug;

use super::rules::{RuleContext, Ruleset};
use super::{compare_scored, score_player, RosterView, ScoredPlayer};
use crate::types::{Action, EngineError, Recommendation};

/// Suggested pickups plus the candidates that could not be scored.
#[derive(Debug, Clone, PartialEq)]
pub struct WaiverPlan {
    pub recommendations: Vec<Recommendation>,
    /// Available players skipped for lack of projections.
    pub unscored: Vec<String>,
}

pub fn recommend(
    view: &RosterView,
    ruleset: &Ruleset,
    limit: usize,
) -> Result<WaiverPlan, EngineError> {
    let week = view.week();
    let rostered_ids: HashSet<&str> = view
        .roster
        .players
        .iter()
        .map(|p| p.player_id.as_str())
        .collect();
    let candidates: Vec<_> = view
        .pool
        .iter()
        .filter(|p| p.availability.is_available() && !rostered_ids.contains(p.player_id.as_str()))
        .cloned()
        .collect();

    let mut everyone = view.roster.players.clone();
    everyone.extend(candidates.iter().cloned());
    let ctx = RuleContext::new(week, &everyone);

    let mut rostered: Vec<ScoredPlayer> = view
        .roster
        .players
        .iter()
        .map(|p| score_player(p, ruleset, &ctx))
        .collect();
    // Weakest first, so the first match at a position is the drop.
    rostered.sort_by(|a, b| compare_scored(b, a));

    let (unscored, mut ranked): (Vec<ScoredPlayer>, Vec<ScoredPlayer>) = candidates
        .iter()
        .map(|p| score_player(p, ruleset, &ctx))
        .partition(|s| s.insufficient_data);
    ranked.sort_by(compare_scored);
    let mut unscored: Vec<String> = unscored.into_iter().map(|s| s.player.player_id).collect();
    unscored.sort();
    if !unscored.is_empty() {
        debug!(
            count = unscored.len(),
            players = ?unscored,
            "Skipping candidates without projections"
        );
    }

    let mut open_spots = view
        .league
        .max_roster_size
        .saturating_sub(view.roster.players.len());
    let mut claimed: HashSet<String> = HashSet::new();
    let mut recs = Vec::new();

    for cand in ranked {
        if recs.len() >= limit {
            break;
        }
        let weakest = rostered.iter().find(|r| {
            r.player.position == cand.player.position && !claimed.contains(&r.player.player_id)
        });
        let upgrade_over = weakest.filter(|w| cand.score > w.score);

        if open_spots > 0 && (weakest.is_none() || upgrade_over.is_some()) {
            open_spots -= 1;
            let mut rec = cand.into_recommendation(Action::Add { drop: None });
            rec.rationale.push("open roster spot".to_string());
            recs.push(rec);
        } else if let Some(w) = upgrade_over {
            let margin = (cand.score - w.score).round_dp(2).normalize();
            let reason = format!("outscores {} by {margin}", w.player.name);
            let drop_id = w.player.player_id.clone();
            claimed.insert(drop_id.clone());
            let mut rec = cand.into_recommendation(Action::Add { drop: Some(drop_id) });
            rec.rationale.push(reason);
            recs.push(rec);
        }
    }

    let adds_without_drop = recs
        .iter()
        .filter(|r| matches!(r.action, Action::Add { drop: None }))
        .count();
    let resulting = view.roster.players.len() + adds_without_drop;
    if adds_without_drop > 0 && resulting > view.league.max_roster_size {
        return Err(EngineError::IllegalLineup(format!(
            "waiver plan grows roster to {resulting} (max {})",
            view.league.max_roster_size
        )));
    }

    Ok(WaiverPlan {
        recommendations: recs,
        unscored,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Availability, League, Player, Position, Roster};
    use rust_decimal_macros::dec;

    fn free_agent(id: &str, pos: Position, proj: Option<rust_decimal::Decimal>) -> Player {
        let mut p = Player::sample(id, pos, proj);
        p.availability = Availability::FreeAgent;
        p
    }

    fn view(max_roster: usize, roster: Vec<Player>, pool: Vec<Player>) -> RosterView {
        let mut league = League::standard("l");
        league.max_roster_size = max_roster;
        RosterView {
            league,
            roster: Roster {
                team_key: "t.1".into(),
                week: 1,
                players: roster,
            },
            pool,
        }
    }

    #[test]
    fn test_full_roster_pairs_add_with_drop() {
        let v = view(
            2,
            vec![
                Player::sample("wr_weak", Position::WR, Some(dec!(4))),
                Player::sample("wr_ok", Position::WR, Some(dec!(9))),
            ],
            vec![free_agent("fa1", Position::WR, Some(dec!(12)))],
        );
        let recs = recommend(&v, &Ruleset::empty("x"), 5).unwrap().recommendations;
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].action, Action::Add { drop: Some("wr_weak".into()) });
        assert!(recs[0].rationale.last().unwrap().contains("outscores Player wr_weak by 8"));
    }

    #[test]
    fn test_each_rostered_player_dropped_once() {
        let v = view(
            2,
            vec![
                Player::sample("wr_a", Position::WR, Some(dec!(4))),
                Player::sample("wr_b", Position::WR, Some(dec!(6))),
            ],
            vec![
                free_agent("fa1", Position::WR, Some(dec!(12))),
                free_agent("fa2", Position::WR, Some(dec!(11))),
                free_agent("fa3", Position::WR, Some(dec!(10))),
            ],
        );
        let recs = recommend(&v, &Ruleset::empty("x"), 5).unwrap().recommendations;
        let drops: Vec<_> = recs
            .iter()
            .map(|r| match &r.action {
                Action::Add { drop } => drop.clone(),
                other => panic!("unexpected {other}"),
            })
            .collect();
        assert_eq!(drops, vec![Some("wr_a".into()), Some("wr_b".into())]);
    }

    #[test]
    fn test_open_spot_needs_no_drop() {
        let v = view(
            3,
            vec![Player::sample("qb1", Position::QB, Some(dec!(18)))],
            vec![
                free_agent("k1", Position::K, Some(dec!(7))),
                free_agent("qb_worse", Position::QB, Some(dec!(12))),
            ],
        );
        let recs = recommend(&v, &Ruleset::empty("x"), 5).unwrap().recommendations;
        // The worse QB is not an upgrade even with a spot open.
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].player_id, "k1");
        assert_eq!(recs[0].action, Action::Add { drop: None });
    }

    #[test]
    fn test_skips_rostered_and_unknown_candidates() {
        let mut taken = Player::sample("taken", Position::RB, Some(dec!(30)));
        taken.availability = Availability::Rostered { team_key: "t.9".into() };
        let v = view(
            1,
            vec![Player::sample("rb1", Position::RB, Some(dec!(5)))],
            vec![taken, free_agent("mystery", Position::RB, None)],
        );
        let plan = recommend(&v, &Ruleset::empty("x"), 5).unwrap();
        assert!(plan.recommendations.is_empty());
        assert_eq!(plan.unscored, vec!["mystery".to_string()]);
    }

    #[test]
    fn test_limit_respected() {
        let pool = (0..10)
            .map(|i| free_agent(&format!("fa{i}"), Position::TE, Some(dec!(20))))
            .collect();
        let v = view(20, Vec::new(), pool);
        assert_eq!(recommend(&v, &Ruleset::empty("x"), 3).unwrap().recommendations.len(), 3);
    }
}
