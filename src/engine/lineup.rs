//! Lineup assembly and legality checks.
//!
//! Assembly walks players in rank order, placing each in its first open
//! dedicated slot, then in an open flex slot, then repairs the result so no
//! slot stays empty while an eligible player sits on the bench.
//! [`validate`] re-checks the result against the league independently of
//! how it was built.

use std::collections::{BTreeMap, HashSet};

use super::ScoredPlayer;
use crate::types::{EngineError, League, Roster, Slot};

/// Proposed starters (slot order) and bench (rank order).
#[derive(Debug, Clone, PartialEq)]
pub struct Lineup {
    pub starters: Vec<(Slot, ScoredPlayer)>,
    pub bench: Vec<ScoredPlayer>,
}

/// Open positions per slot for a league.
fn capacities(league: &League) -> BTreeMap<Slot, usize> {
    let mut caps = BTreeMap::new();
    for req in &league.roster_slots {
        *caps.entry(req.slot).or_insert(0) += req.count;
    }
    caps
}

/// Index of a slot in the league's declared slot order.
fn slot_order(league: &League, slot: Slot) -> usize {
    league
        .roster_slots
        .iter()
        .position(|r| r.slot == slot)
        .unwrap_or(usize::MAX)
}

/// Fill starting slots from `ranked` (best first).
///
/// A greedy pass seats each player in its first open dedicated slot, then
/// an open flex slot. Benched players are then tried again in rank order
/// along augmenting paths: a starter may move to another slot it is
/// eligible for so that a benched player can take its place. No starter is
/// ever benched by this, so every slot that some benched player could fill
/// ends up filled.
pub fn assemble(league: &League, ranked: Vec<ScoredPlayer>) -> Lineup {
    let seats: Vec<Slot> = league
        .roster_slots
        .iter()
        .flat_map(|r| std::iter::repeat(r.slot).take(r.count))
        .collect();
    let mut holder: Vec<Option<usize>> = vec![None; seats.len()];

    for (idx, scored) in ranked.iter().enumerate() {
        let dedicated = scored.player.positions().into_iter().find_map(|pos| {
            let slot = Slot::dedicated(pos);
            (0..seats.len()).find(|&k| holder[k].is_none() && seats[k] == slot)
        });
        let seat = dedicated.or_else(|| {
            (0..seats.len()).find(|&k| {
                holder[k].is_none()
                    && seats[k] == Slot::Flex
                    && scored.player.is_eligible_for(Slot::Flex)
            })
        });
        if let Some(k) = seat {
            holder[k] = Some(idx);
        }
    }

    let mut seated = vec![false; ranked.len()];
    for idx in holder.iter().flatten() {
        seated[*idx] = true;
    }
    for idx in 0..ranked.len() {
        if holder.iter().all(Option::is_some) {
            break;
        }
        if seated[idx] {
            continue;
        }
        let mut visited = vec![false; seats.len()];
        if augment(idx, &ranked, &seats, &mut holder, &mut visited) {
            seated[idx] = true;
        }
    }

    // Slot order, then rank within a slot.
    let mut placed: Vec<(usize, usize, Slot)> = holder
        .iter()
        .zip(&seats)
        .filter_map(|(h, slot)| h.map(|idx| (slot_order(league, *slot), idx, *slot)))
        .collect();
    placed.sort_unstable();

    let mut pool: Vec<Option<ScoredPlayer>> = ranked.into_iter().map(Some).collect();
    let starters = placed
        .into_iter()
        .filter_map(|(_, idx, slot)| pool[idx].take().map(|s| (slot, s)))
        .collect();
    let bench = pool.into_iter().flatten().collect();
    Lineup { starters, bench }
}

/// Try to seat `idx`, relocating starters along the way. Kuhn's matching step.
fn augment(
    idx: usize,
    ranked: &[ScoredPlayer],
    seats: &[Slot],
    holder: &mut [Option<usize>],
    visited: &mut [bool],
) -> bool {
    for k in 0..seats.len() {
        if visited[k] || !ranked[idx].player.is_eligible_for(seats[k]) {
            continue;
        }
        visited[k] = true;
        let current = holder[k];
        let free = match current {
            None => true,
            Some(current) => augment(current, ranked, seats, holder, visited),
        };
        if free {
            holder[k] = Some(idx);
            return true;
        }
    }
    false
}

/// Check a lineup against league slot and roster constraints.
pub fn validate(league: &League, roster: &Roster, lineup: &Lineup) -> Result<(), EngineError> {
    if roster.players.len() > league.max_roster_size {
        return Err(EngineError::IllegalLineup(format!(
            "roster holds {} players, league allows {}",
            roster.players.len(),
            league.max_roster_size
        )));
    }

    let caps = capacities(league);
    let roster_ids: HashSet<&str> = roster.players.iter().map(|p| p.player_id.as_str()).collect();
    let mut seen: HashSet<&str> = HashSet::new();
    let mut used: BTreeMap<Slot, usize> = BTreeMap::new();

    for (slot, scored) in &lineup.starters {
        let id = scored.player.player_id.as_str();
        if !scored.player.is_eligible_for(*slot) {
            return Err(EngineError::IllegalLineup(format!(
                "{id} ({}) is not eligible for {slot}",
                scored.player.position
            )));
        }
        let n = used.entry(*slot).or_insert(0);
        *n += 1;
        if *n > caps.get(slot).copied().unwrap_or(0) {
            return Err(EngineError::IllegalLineup(format!("too many players in {slot}")));
        }
    }

    let starting = lineup.starters.iter().map(|(_, s)| s);
    for scored in starting.chain(lineup.bench.iter()) {
        let id = scored.player.player_id.as_str();
        if !roster_ids.contains(id) {
            return Err(EngineError::IllegalLineup(format!("{id} is not on the roster")));
        }
        if !seen.insert(id) {
            return Err(EngineError::IllegalLineup(format!("{id} placed twice")));
        }
    }

    if lineup.starters.len() > league.starting_slot_count() {
        return Err(EngineError::IllegalLineup(format!(
            "{} starters for {} slots",
            lineup.starters.len(),
            league.starting_slot_count()
        )));
    }
    if seen.len() != roster_ids.len() {
        return Err(EngineError::IllegalLineup(format!(
            "lineup covers {} of {} rostered players",
            seen.len(),
            roster_ids.len()
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
