//! Turn Coordinator
//!
//! Initiative, turn budgets and round advancement. Everything here is a pure
//! function over `GameState`; callers run it inside a state commit so every
//! turn change is versioned like any other mutation.

use std::collections::BTreeMap;

use crate::core::rng::DeterministicRng;
use crate::game::action::Action;
use crate::game::rules::ActionRejection;
use crate::game::state::{
    CombatPhase, CombatState, GameState, InitiativeEntry, TurnPhase, TurnState, Unit, UnitId, UserId,
};

/// A new turn that just started.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TurnChange {
    /// Unit now acting.
    pub unit_id: UnitId,
    /// Its owner; `None` means the DM acts for it.
    pub owner: Option<UserId>,
    /// Current round.
    pub round: u32,
    /// The order wrapped and a new round began.
    pub new_round: bool,
}

/// Roll initiative for every living unit, best first.
///
/// Ties on the initiative stat are broken by a random draw rather than by
/// unit id, so no unit is systematically favoured.
pub fn roll_initiative(units: &BTreeMap<UnitId, Unit>, rng: &mut DeterministicRng) -> Vec<InitiativeEntry> {
    let mut order: Vec<InitiativeEntry> = units
        .values()
        .filter(|u| u.is_alive())
        .map(|u| InitiativeEntry {
            unit_id: u.id,
            roll: u.stats.initiative,
            tie_break: rng.next_u32(),
        })
        .collect();

    order.sort_by(|a, b| b.roll.cmp(&a.roll).then(b.tie_break.cmp(&a.tie_break)));
    order
}

/// Roll initiative and open round 1 with the first unit in order.
pub fn begin_combat(state: &mut GameState, rng: &mut DeterministicRng) -> Option<TurnChange> {
    state.combat.phase = CombatPhase::Setup;
    state.combat.initiative = roll_initiative(&state.units, rng);
    state.combat.round = 1;
    state.combat.current_turn_index = 0;

    if state.combat.initiative.is_empty() {
        state.combat.turn = None;
        return None;
    }

    state.combat.phase = CombatPhase::InProgress;
    start_turn(state, false)
}

/// Reset the turn budget for the unit at the current index.
pub fn start_turn(state: &mut GameState, new_round: bool) -> Option<TurnChange> {
    let entry = state.combat.initiative.get(state.combat.current_turn_index)?;
    let unit = state.units.get(&entry.unit_id)?;

    state.combat.turn = Some(TurnState {
        unit_id: unit.id,
        phase: TurnPhase::Move,
        movement_remaining: unit.stats.move_range,
        has_acted: false,
    });

    Some(TurnChange {
        unit_id: unit.id,
        owner: unit.owner.clone(),
        round: state.combat.round,
        new_round,
    })
}

/// Move to the next living unit in order, bumping the round on wrap.
///
/// Returns `None` when combat is not running or nobody is left standing.
pub fn advance(state: &mut GameState) -> Option<TurnChange> {
    if state.combat.phase != CombatPhase::InProgress {
        return None;
    }

    let len = state.combat.initiative.len();
    let mut wrapped = false;

    for _ in 0..len {
        let next = state.combat.current_turn_index + 1;
        if next >= len {
            state.combat.current_turn_index = 0;
            state.combat.round += 1;
            wrapped = true;
        } else {
            state.combat.current_turn_index = next;
        }

        let unit_id = state.combat.initiative[state.combat.current_turn_index].unit_id;
        if state.unit(unit_id).map_or(false, Unit::is_alive) {
            return start_turn(state, wrapped);
        }
    }

    state.combat.turn = None;
    None
}

/// The acting unit must be the one whose turn it is, and that turn must
/// still be open.
pub fn validate_acting_unit(combat: &CombatState, unit_id: UnitId) -> Result<&TurnState, ActionRejection> {
    match &combat.turn {
        Some(turn) if turn.unit_id == unit_id && turn.phase != TurnPhase::Ended => Ok(turn),
        _ => Err(ActionRejection::NotYourTurn),
    }
}

/// Charge an accepted action against the turn budget.
///
/// Returns true when the turn is over: an explicit end, or both movement
/// and action spent.
pub fn record_action(combat: &mut CombatState, action: &Action) -> bool {
    let Some(turn) = combat.turn.as_mut() else {
        return false;
    };

    match action {
        Action::Move { path, .. } => {
            turn.movement_remaining = turn.movement_remaining.saturating_sub(path.len() as u32);
        }
        Action::Attack { .. } | Action::CollectLoot { .. } => {
            turn.has_acted = true;
        }
        Action::EndTurn { .. } => {
            turn.phase = TurnPhase::Ended;
            return true;
        }
    }

    if turn.movement_remaining == 0 && turn.has_acted {
        turn.phase = TurnPhase::Ended;
        true
    } else {
        if turn.movement_remaining == 0 {
            turn.phase = TurnPhase::Action;
        }
        false
    }
}

/// Close the encounter.
pub fn finish_combat(state: &mut GameState, phase: CombatPhase) {
    state.combat.phase = phase;
    state.combat.turn = None;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::map::{GridMap, Position};
    use crate::game::state::{StatBlock, Team, UnitKind};

    fn unit(id: UnitId, initiative: i32) -> Unit {
        Unit {
            id,
            kind: UnitKind::Monster,
            team: if id % 2 == 0 { Team::Party } else { Team::Hostile },
            name: format!("u{}", id),
            position: Position::new(id as i32, 0),
            stats: StatBlock::new(10, 3, 1, initiative, 3, 1),
            owner: None,
        }
    }

    fn state_with(inits: &[(UnitId, i32)]) -> GameState {
        let mut state = GameState::new(GridMap::open("t", 10, 10));
        for &(id, init) in inits {
            state.units.insert(id, unit(id, init));
        }
        state
    }

    #[test]
    fn test_initiative_descending() {
        let state = state_with(&[(1, 2), (2, 9), (3, 5)]);
        let order = roll_initiative(&state.units, &mut DeterministicRng::new(7));
        let ids: Vec<_> = order.iter().map(|e| e.unit_id).collect();
        assert_eq!(ids, vec![2, 3, 1]);
    }

    #[test]
    fn test_ties_not_decided_by_id() {
        let state = state_with(&[(1, 4), (2, 4)]);
        let mut first_wins = 0;
        for seed in 0..200 {
            let order = roll_initiative(&state.units, &mut DeterministicRng::new(seed));
            if order[0].unit_id == 1 {
                first_wins += 1;
            }
        }
        assert!(first_wins > 40 && first_wins < 160, "biased tie-break: {}", first_wins);
    }

    #[test]
    fn test_begin_combat() {
        let mut state = state_with(&[(1, 2), (2, 9)]);
        let change = begin_combat(&mut state, &mut DeterministicRng::new(1)).unwrap();

        assert_eq!(state.combat.phase, CombatPhase::InProgress);
        assert_eq!(state.combat.round, 1);
        assert_eq!(state.combat.current_turn_index, 0);
        assert_eq!(change.unit_id, 2);
        assert_eq!(state.combat.turn.unwrap().movement_remaining, 3);
    }

    #[test]
    fn test_advance_wraps_and_skips_dead() {
        let mut state = state_with(&[(1, 9), (2, 5), (3, 1)]);
        begin_combat(&mut state, &mut DeterministicRng::new(3));
        state.units.get_mut(&2).unwrap().stats.hp = 0;

        let change = advance(&mut state).unwrap();
        assert_eq!(change.unit_id, 3);
        assert!(!change.new_round);

        let change = advance(&mut state).unwrap();
        assert_eq!(change.unit_id, 1);
        assert!(change.new_round);
        assert_eq!(state.combat.round, 2);
    }

    #[test]
    fn test_validate_acting_unit() {
        let mut state = state_with(&[(1, 9), (2, 5)]);
        begin_combat(&mut state, &mut DeterministicRng::new(3));

        assert!(validate_acting_unit(&state.combat, 1).is_ok());
        assert_eq!(validate_acting_unit(&state.combat, 2), Err(ActionRejection::NotYourTurn));

        state.combat.turn.as_mut().unwrap().phase = TurnPhase::Ended;
        assert_eq!(validate_acting_unit(&state.combat, 1), Err(ActionRejection::NotYourTurn));
    }

    #[test]
    fn test_budget_exhaustion_ends_turn() {
        let mut state = state_with(&[(1, 9)]);
        begin_combat(&mut state, &mut DeterministicRng::new(3));

        let path = vec![Position::new(1, 1), Position::new(1, 2), Position::new(1, 3)];
        assert!(!record_action(&mut state.combat, &Action::Move { unit_id: 1, path }));
        assert_eq!(state.combat.turn.unwrap().phase, TurnPhase::Action);

        assert!(record_action(&mut state.combat, &Action::Attack { unit_id: 1, target_id: 2 }));
        assert_eq!(state.combat.turn.unwrap().phase, TurnPhase::Ended);
    }
}
