//! Decision engine: score players, assemble a legal lineup, rank actions.
//!
//! Everything here is a pure function of a [`RosterView`] and a
//! [`Ruleset`]. No I/O, no clocks, no hash-order dependence, so identical
//! inputs always produce identical recommendation sequences.

pub mod draft;
pub mod lineup;
pub mod rules;
pub mod waivers;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use tracing::{debug, info};

use crate::types::{Action, EngineError, League, Player, Recommendation, Roster};
use lineup::Lineup;
use rules::{RuleContext, Ruleset};

/// Score given to players without projections. Also the floor for every
/// other score, so nothing ever ranks below an unknown player.
pub const MIN_SCORE: Decimal = dec!(-999);

/// Rationale marker for players scored without projection data.
pub const INSUFFICIENT_DATA: &str = "insufficient data: no projected points";

// ---------------------------------------------------------------------------
// Inputs
// ---------------------------------------------------------------------------

/// Read-only slice of the snapshot needed for one scoring pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RosterView {
    pub league: League,
    pub roster: Roster,
    /// Available players (free agents and waivers).
    #[serde(default)]
    pub pool: Vec<Player>,
}

impl RosterView {
    pub fn week(&self) -> u32 {
        self.league.current_week.max(self.roster.week)
    }
}

// ---------------------------------------------------------------------------
// Scoring
// ---------------------------------------------------------------------------

/// A player with its total score and the reasons behind it.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredPlayer {
    pub player: Player,
    pub score: Decimal,
    pub rationale: Vec<String>,
    pub insufficient_data: bool,
    /// Players sharing this player's position in the scored pool.
    pub scarcity: usize,
}

impl ScoredPlayer {
    pub fn into_recommendation(self, action: Action) -> Recommendation {
        Recommendation {
            player_id: self.player.player_id,
            player_name: self.player.name,
            position: self.player.position,
            action,
            score: self.score,
            rationale: self.rationale,
        }
    }
}

fn signed(delta: Decimal) -> String {
    let d = delta.round_dp(2).normalize();
    if d.is_sign_negative() {
        format!("{d}")
    } else {
        format!("+{d}")
    }
}

/// Base projection plus every rule delta, floored at [`MIN_SCORE`].
pub fn score_player(player: &Player, ruleset: &Ruleset, ctx: &RuleContext) -> ScoredPlayer {
    let scarcity = ctx.count_at(player.position);
    let Some(base) = player.projected_points else {
        return ScoredPlayer {
            player: player.clone(),
            score: MIN_SCORE,
            rationale: vec![INSUFFICIENT_DATA.to_string()],
            insufficient_data: true,
            scarcity,
        };
    };

    let mut total = base;
    let mut rationale = vec![format!("projected {}", base.round_dp(2).normalize())];
    for (name, adj) in ruleset.apply(player, ctx) {
        total += adj.delta;
        rationale.push(format!("{name}: {} ({})", adj.reason, signed(adj.delta)));
    }

    ScoredPlayer {
        player: player.clone(),
        score: total.max(MIN_SCORE).round_dp(2),
        rationale,
        insufficient_data: false,
        scarcity,
    }
}

/// Total order: score descending, scarcer position first, then player id.
pub fn compare_scored(a: &ScoredPlayer, b: &ScoredPlayer) -> Ordering {
    b.score
        .cmp(&a.score)
        .then_with(|| a.scarcity.cmp(&b.scarcity))
        .then_with(|| a.player.player_id.cmp(&b.player.player_id))
}

/// Score and rank `players`; scarcity is measured within `players`.
pub fn rank_players(players: &[Player], ruleset: &Ruleset, week: u32) -> Vec<ScoredPlayer> {
    let ctx = RuleContext::new(week, players);
    let mut scored: Vec<ScoredPlayer> = players
        .iter()
        .map(|p| score_player(p, ruleset, &ctx))
        .collect();
    scored.sort_by(compare_scored);
    scored
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Runs scoring passes with one validated ruleset.
#[derive(Debug, Clone)]
pub struct DecisionEngine {
    ruleset: Ruleset,
}

impl DecisionEngine {
    pub fn new(ruleset: Ruleset) -> Result<Self, EngineError> {
        ruleset.validate()?;
        Ok(Self { ruleset })
    }

    /// Starting lineup and bench for the view's roster.
    ///
    /// Starters come first in league slot order, then the bench by rank.
    /// A lineup that fails validation is returned as
    /// [`EngineError::IllegalLineup`] and never silently repaired.
    pub fn evaluate(&self, view: &RosterView) -> Result<Vec<Recommendation>, EngineError> {
        let week = view.week();
        let ranked = rank_players(&view.roster.players, &self.ruleset, week);
        let insufficient = ranked.iter().filter(|s| s.insufficient_data).count();

        let lineup = lineup::assemble(&view.league, ranked);
        lineup::validate(&view.league, &view.roster, &lineup)?;

        debug!(
            team = %view.roster.team_key,
            week,
            starters = lineup.starters.len(),
            bench = lineup.bench.len(),
            insufficient_data = insufficient,
            ruleset = %self.ruleset.version,
            "Lineup assembled"
        );

        Ok(Self::into_recommendations(lineup))
    }

    /// Waiver pickups for the view's roster, best first.
    pub fn recommend_waivers(
        &self,
        view: &RosterView,
        limit: usize,
    ) -> Result<Vec<Recommendation>, EngineError> {
        let plan = waivers::recommend(view, &self.ruleset, limit)?;
        info!(
            team = %view.roster.team_key,
            candidates = view.pool.len(),
            unscored = plan.unscored.len(),
            suggested = plan.recommendations.len(),
            "Waiver scan complete"
        );
        Ok(plan.recommendations)
    }

    fn into_recommendations(lineup: Lineup) -> Vec<Recommendation> {
        let Lineup { starters, bench } = lineup;
        starters
            .into_iter()
            .map(|(slot, s)| s.into_recommendation(Action::Start { slot }))
            .chain(bench.into_iter().map(|s| s.into_recommendation(Action::Bench)))
            .collect()
    }
}

/// One-shot evaluation with an explicit ruleset.
pub fn evaluate(view: &RosterView, ruleset: &Ruleset) -> Result<Vec<Recommendation>, EngineError> {
    DecisionEngine::new(ruleset.clone())?.evaluate(view)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
