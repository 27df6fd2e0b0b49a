//! Draft helpers: positional tiers and pick suggestions.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;
use std::collections::BTreeMap;

use crate::types::{Player, Position};

/// A drop larger than this between consecutive players starts a new tier.
pub const TIER_BREAK: Decimal = dec!(1.8);

/// Projection at or above which a player counts toward positional depth.
pub const QUALITY_CUT: Decimal = dec!(10);

const SCARCITY_WEIGHT: Decimal = dec!(2.0);
const NEED_BONUS: Decimal = dec!(2.5);
const DEPTH_BONUS: Decimal = dec!(0.5);
const REACH_PENALTY: Decimal = dec!(0.02);
const RUN_BONUS: Decimal = dec!(1.0);

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Tier {
    pub position: Position,
    /// 1-based within the position.
    pub tier: u32,
    pub players: Vec<Player>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DraftSuggestion {
    pub player: Player,
    pub score: Decimal,
    pub rationale: Vec<String>,
}

fn by_projection_desc(a: &Player, b: &Player) -> std::cmp::Ordering {
    let pa = a.projected_points.unwrap_or(Decimal::MIN);
    let pb = b.projected_points.unwrap_or(Decimal::MIN);
    pb.cmp(&pa).then_with(|| a.player_id.cmp(&b.player_id))
}

/// Group players into tiers per position. Players without a projection
/// are left out.
pub fn build_tiers(pool: &[Player]) -> Vec<Tier> {
    let mut by_pos: BTreeMap<Position, Vec<Player>> = BTreeMap::new();
    for p in pool.iter().filter(|p| p.projected_points.is_some()) {
        by_pos.entry(p.position).or_default().push(p.clone());
    }

    let mut tiers = Vec::new();
    for (position, mut players) in by_pos {
        players.sort_by(by_projection_desc);
        let mut current: Vec<Player> = Vec::new();
        let mut last: Option<Decimal> = None;
        let mut tier = 1;
        for p in players {
            let proj = p.projected_points.unwrap_or_default();
            if let Some(prev) = last {
                if prev - proj > TIER_BREAK && !current.is_empty() {
                    tiers.push(Tier {
                        position,
                        tier,
                        players: std::mem::take(&mut current),
                    });
                    tier += 1;
                }
            }
            last = Some(proj);
            current.push(p);
        }
        if !current.is_empty() {
            tiers.push(Tier { position, tier, players: current });
        }
    }
    tiers
}

/// Best picks right now.
///
/// `needs` maps a position to how many more starters are required.
/// `picks_until_next` is how many selections happen before the user's next
/// turn: a player ranked (by ownership) beyond that point would likely
/// still be there, so taking them now counts as a reach.
pub fn suggest_picks(
    pool: &[Player],
    needs: &BTreeMap<Position, u32>,
    picks_until_next: u32,
    limit: usize,
) -> Vec<DraftSuggestion> {
    let available: Vec<&Player> = pool
        .iter()
        .filter(|p| p.availability.is_available() && p.projected_points.is_some())
        .collect();

    let mut quality: BTreeMap<Position, usize> = BTreeMap::new();
    for p in &available {
        if p.projected_points.unwrap_or_default() >= QUALITY_CUT {
            *quality.entry(p.position).or_insert(0) += 1;
        }
    }

    // Ownership rank stands in for ADP: 1 = most owned.
    let mut by_ownership = available.clone();
    by_ownership.sort_by(|a, b| {
        let oa = a.percent_owned.unwrap_or_default();
        let ob = b.percent_owned.unwrap_or_default();
        ob.cmp(&oa).then_with(|| a.player_id.cmp(&b.player_id))
    });
    let adp: BTreeMap<&str, u32> = by_ownership
        .iter()
        .enumerate()
        .map(|(i, p)| (p.player_id.as_str(), i as u32 + 1))
        .collect();

    let mut suggestions: Vec<DraftSuggestion> = available
        .iter()
        .map(|p| {
            let proj = p.projected_points.unwrap_or_default();
            let depth = quality.get(&p.position).copied().unwrap_or(0).max(1);
            let scarcity = (SCARCITY_WEIGHT / Decimal::from(depth as u64)).round_dp(2);
            let needed = needs.get(&p.position).copied().unwrap_or(0) > 0;
            let need = if needed { NEED_BONUS } else { DEPTH_BONUS };
            let rank = adp.get(p.player_id.as_str()).copied().unwrap_or(u32::MAX);
            let reach = if rank > picks_until_next {
                REACH_PENALTY * Decimal::from(rank - picks_until_next)
            } else {
                Decimal::ZERO
            };
            let run = if depth as u32 <= picks_until_next && needed {
                RUN_BONUS
            } else {
                Decimal::ZERO
            };

            let mut rationale = vec![
                format!("projected {}", proj.normalize()),
                format!("scarcity +{} ({depth} quality {})", scarcity.normalize(), p.position),
            ];
            rationale.push(if needed {
                format!("fills {} need", p.position)
            } else {
                "depth".to_string()
            });
            if !reach.is_zero() {
                rationale.push(format!("reach -{}", reach.normalize()));
            }
            if !run.is_zero() {
                rationale.push(format!("{} may run out before next pick", p.position));
            }

            DraftSuggestion {
                player: (*p).clone(),
                score: (proj + scarcity + need + run - reach).round_dp(2),
                rationale,
            }
        })
        .collect();

    suggestions.sort_by(|a, b| {
        b.score
            .cmp(&a.score)
            .then_with(|| a.player.player_id.cmp(&b.player.player_id))
    });
    suggestions.truncate(limit);
    suggestions
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
