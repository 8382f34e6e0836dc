//! Action Legality
//!
//! Pure checks run before an action reaches the simulation. A rejection
//! never touches state and never consumes the turn.

use serde::{Serialize, Deserialize};
use thiserror::Error;

use crate::game::action::Action;
use crate::game::state::{GameState, TurnState, UnitId, UserId};

/// Why an action was refused.
///
/// Serialized as the PascalCase variant name (e.g. `"OutOfRange"`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum ActionRejection {
    /// Acting unit is not the unit whose turn it is.
    #[error("not your turn")]
    NotYourTurn,
    /// Caller does not control the acting unit.
    #[error("unit is not controlled by you")]
    NotYourUnit,
    /// Target missing, friendly, or otherwise invalid.
    #[error("invalid target")]
    InvalidTarget,
    /// Path too long or target too far.
    #[error("out of range")]
    OutOfRange,
    /// Path crosses a wall, another unit, or is not contiguous.
    #[error("path blocked")]
    Blocked,
    /// Action already used this turn.
    #[error("action already used this turn")]
    AlreadyActed,
    /// Target is already down.
    #[error("target already defeated")]
    TargetDefeated,
    /// No such loot at the claimed location.
    #[error("loot not found")]
    LootNotFound,
    /// Session is paused.
    #[error("session is paused")]
    SessionPaused,
    /// Session is not in play.
    #[error("game is not in progress")]
    NotPlaying,
    /// Encounter already resolved.
    #[error("combat is over")]
    CombatOver,
    /// Caller is not a member of any session.
    #[error("not in a session")]
    NotInSession,
    /// The simulation failed to process a legal action.
    #[error("action could not be processed")]
    SimulationFailed,
}

/// Who may issue actions for a unit: its owner, or the DM for unowned units.
pub fn check_control(state: &GameState, unit_id: UnitId, caller: &UserId, caller_is_dm: bool) -> Result<(), ActionRejection> {
    let unit = state.unit(unit_id).ok_or(ActionRejection::InvalidTarget)?;
    match &unit.owner {
        Some(owner) if owner == caller => Ok(()),
        None if caller_is_dm => Ok(()),
        _ => Err(ActionRejection::NotYourUnit),
    }
}

/// Action-specific legality against the current state and turn budget.
pub fn validate_action(state: &GameState, turn: &TurnState, action: &Action) -> Result<(), ActionRejection> {
    let actor = state.unit(action.unit_id()).ok_or(ActionRejection::InvalidTarget)?;

    match action {
        Action::Move { path, .. } => {
            if path.is_empty() {
                return Err(ActionRejection::Blocked);
            }
            if path.len() as u32 > turn.movement_remaining {
                return Err(ActionRejection::OutOfRange);
            }

            let mut previous = actor.position;
            for &step in path {
                if !state.map.is_walkable(step) || !previous.is_adjacent(step) {
                    return Err(ActionRejection::Blocked);
                }
                if let Some(other) = state.unit_at(step) {
                    if other.id != actor.id {
                        return Err(ActionRejection::Blocked);
                    }
                }
                previous = step;
            }
            Ok(())
        }

        Action::Attack { target_id, .. } => {
            if turn.has_acted {
                return Err(ActionRejection::AlreadyActed);
            }
            let target = state.unit(*target_id).ok_or(ActionRejection::InvalidTarget)?;
            if target.id == actor.id || target.team == actor.team {
                return Err(ActionRejection::InvalidTarget);
            }
            if !target.is_alive() {
                return Err(ActionRejection::TargetDefeated);
            }
            if actor.position.distance(target.position) > actor.stats.attack_range {
                return Err(ActionRejection::OutOfRange);
            }
            Ok(())
        }

        Action::CollectLoot { loot_id, position, .. } => {
            if turn.has_acted {
                return Err(ActionRejection::AlreadyActed);
            }
            let loot = state.loot.get(loot_id).ok_or(ActionRejection::LootNotFound)?;
            if loot.position != *position {
                return Err(ActionRejection::LootNotFound);
            }
            if actor.position.distance(loot.position) > 1 {
                return Err(ActionRejection::OutOfRange);
            }
            Ok(())
        }

        Action::EndTurn { .. } => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::map::{GridMap, Position};
    use crate::game::state::{ItemStack, LootDrop, StatBlock, Team, TurnPhase, Unit, UnitKind};

    fn unit(id: UnitId, team: Team, x: i32, y: i32, owner: Option<&str>) -> Unit {
        Unit {
            id,
            kind: if owner.is_some() { UnitKind::Player } else { UnitKind::Monster },
            team,
            name: format!("u{}", id),
            position: Position::new(x, y),
            stats: StatBlock::new(10, 4, 1, 2, 3, 1),
            owner: owner.map(UserId::from),
        }
    }

    fn fixture() -> GameState {
        let map = GridMap::open("test", 8, 8).with_blocked([Position::new(3, 0)]);
        let mut state = GameState::new(map);
        state.units.insert(1, unit(1, Team::Party, 0, 0, Some("alice")));
        state.units.insert(2, unit(2, Team::Party, 0, 1, Some("bob")));
        state.units.insert(3, unit(3, Team::Hostile, 1, 1, None));
        state.loot.insert(7, LootDrop {
            id: 7,
            position: Position::new(1, 0),
            item: ItemStack { item_id: "gold".into(), quantity: 5 },
        });
        state
    }

    fn turn(unit_id: UnitId) -> TurnState {
        TurnState { unit_id, phase: TurnPhase::Move, movement_remaining: 3, has_acted: false }
    }

    #[test]
    fn test_move_too_long() {
        let state = fixture();
        let path = vec![Position::new(1, 0), Position::new(2, 0), Position::new(2, 1), Position::new(2, 2)];
        let result = validate_action(&state, &turn(1), &Action::Move { unit_id: 1, path });
        assert_eq!(result, Err(ActionRejection::OutOfRange));
    }

    #[test]
    fn test_move_through_wall_or_unit() {
        let state = fixture();
        let into_wall = vec![Position::new(1, 0), Position::new(2, 0), Position::new(3, 0)];
        assert_eq!(
            validate_action(&state, &turn(1), &Action::Move { unit_id: 1, path: into_wall }),
            Err(ActionRejection::Blocked)
        );

        let into_ally = vec![Position::new(0, 1)];
        assert_eq!(
            validate_action(&state, &turn(1), &Action::Move { unit_id: 1, path: into_ally }),
            Err(ActionRejection::Blocked)
        );

        let jump = vec![Position::new(2, 0)];
        assert_eq!(
            validate_action(&state, &turn(1), &Action::Move { unit_id: 1, path: jump }),
            Err(ActionRejection::Blocked)
        );
    }

    #[test]
    fn test_move_to_extreme_coordinates_is_blocked() {
        let state = fixture();
        for far in [Position::new(i32::MIN, i32::MIN), Position::new(i32::MAX, i32::MIN)] {
            assert_eq!(
                validate_action(&state, &turn(1), &Action::Move { unit_id: 1, path: vec![far] }),
                Err(ActionRejection::Blocked)
            );
        }
    }

    #[test]
    fn test_valid_move() {
        let state = fixture();
        let path = vec![Position::new(1, 0), Position::new(2, 0)];
        assert!(validate_action(&state, &turn(1), &Action::Move { unit_id: 1, path }).is_ok());
    }

    #[test]
    fn test_attack_rules() {
        let mut state = fixture();
        assert_eq!(
            validate_action(&state, &turn(2), &Action::Attack { unit_id: 2, target_id: 1 }),
            Err(ActionRejection::InvalidTarget)
        );
        assert!(validate_action(&state, &turn(2), &Action::Attack { unit_id: 2, target_id: 3 }).is_ok());
        assert_eq!(
            validate_action(&state, &turn(1), &Action::Attack { unit_id: 1, target_id: 3 }),
            Err(ActionRejection::OutOfRange)
        );

        let mut acted = turn(2);
        acted.has_acted = true;
        assert_eq!(
            validate_action(&state, &acted, &Action::Attack { unit_id: 2, target_id: 3 }),
            Err(ActionRejection::AlreadyActed)
        );

        state.units.get_mut(&3).unwrap().stats.hp = 0;
        assert_eq!(
            validate_action(&state, &turn(2), &Action::Attack { unit_id: 2, target_id: 3 }),
            Err(ActionRejection::TargetDefeated)
        );
    }

    #[test]
    fn test_loot_location_must_match() {
        let state = fixture();
        let wrong_spot = Action::CollectLoot { unit_id: 1, loot_id: 7, position: Position::new(5, 5) };
        assert_eq!(validate_action(&state, &turn(1), &wrong_spot), Err(ActionRejection::LootNotFound));

        let ok = Action::CollectLoot { unit_id: 1, loot_id: 7, position: Position::new(1, 0) };
        assert!(validate_action(&state, &turn(1), &ok).is_ok());
    }

    #[test]
    fn test_control() {
        let state = fixture();
        let alice = UserId::from("alice");
        let bob = UserId::from("bob");

        assert!(check_control(&state, 1, &alice, false).is_ok());
        assert_eq!(check_control(&state, 1, &bob, true), Err(ActionRejection::NotYourUnit));
        assert_eq!(check_control(&state, 3, &bob, false), Err(ActionRejection::NotYourUnit));
        assert!(check_control(&state, 3, &bob, true).is_ok());
    }

    #[test]
    fn test_rejection_wire_name() {
        assert_eq!(serde_json::to_string(&ActionRejection::OutOfRange).unwrap(), "\"OutOfRange\"");
    }
}
