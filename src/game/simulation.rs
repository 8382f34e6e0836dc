//! Simulation Contract
//!
//! The combat simulation is a pure function: given a state and a legal
//! action it produces the next state and the events that explain it. The
//! server never reaches inside; it only validates, delegates and syncs.
//!
//! `SkirmishSimulation` is a small deterministic rule set used by the binary
//! and the tests. Any other implementation of [`Simulation`] can be plugged
//! into the server.

use serde::{Serialize, Deserialize};
use thiserror::Error;

use crate::core::rng::DeterministicRng;
use crate::game::action::Action;
use crate::game::character::CharacterSheet;
use crate::game::events::GameEvent;
use crate::game::map::{GridMap, Position};
use crate::game::state::{
    CombatPhase, GameState, ItemStack, LootDrop, StatBlock, Team, Unit, UnitId, UnitKind, UserId,
};

/// Encounter difficulty chosen by the DM.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Difficulty {
    /// Fewer, weaker hostiles.
    Easy,
    /// Balanced.
    #[default]
    Normal,
    /// More, tougher hostiles.
    Hard,
}

/// A party member entering the scenario.
#[derive(Clone, Debug)]
pub struct PartyMember {
    /// Session member controlling the unit.
    pub user_id: UserId,
    /// Name shown on the unit.
    pub display_name: String,
    /// Stored character, if one was found.
    pub character: Option<CharacterSheet>,
}

/// Everything a scenario constructor needs.
#[derive(Clone, Debug)]
pub struct ScenarioRequest {
    /// Session seed for any randomness in the layout.
    pub seed: u64,
    /// Requested difficulty.
    pub difficulty: Difficulty,
    /// Party, in join order.
    pub party: Vec<PartyMember>,
}

/// Result of applying an action.
#[derive(Clone, Debug)]
pub struct SimOutcome {
    /// State after the action.
    pub state: GameState,
    /// What happened.
    pub events: Vec<GameEvent>,
}

/// Simulation failures.
#[derive(Debug, Error)]
pub enum SimulationError {
    /// No scenario could be built.
    #[error("scenario unavailable: {0}")]
    Scenario(String),
    /// The simulation disagreed with the server's legality check.
    #[error("action rejected by simulation: {0}")]
    Rejected(String),
}

/// The external combat simulation.
pub trait Simulation: Send + Sync {
    /// Build the initial state for a session entering play.
    fn create_scenario(&self, request: &ScenarioRequest) -> Result<GameState, SimulationError>;

    /// Apply a validated action.
    fn apply(&self, state: &GameState, action: &Action) -> Result<SimOutcome, SimulationError>;

    /// Victory/defeat check.
    fn evaluate(&self, state: &GameState) -> Option<CombatPhase> {
        state.outcome()
    }
}

// =============================================================================
// REFERENCE RULE SET
// =============================================================================

const MAP_WIDTH: i32 = 10;
const MAP_HEIGHT: i32 = 8;

/// Default stats for characters without a stored sheet.
pub const DEFAULT_HERO_STATS: StatBlock = StatBlock {
    max_hp: 20,
    hp: 20,
    attack: 5,
    defense: 2,
    initiative: 3,
    move_range: 4,
    attack_range: 1,
};

/// Grid skirmish: the party starts on the west edge, hostiles on the east.
#[derive(Debug, Default, Clone, Copy)]
pub struct SkirmishSimulation;

impl SkirmishSimulation {
    /// Create the rule set.
    pub fn new() -> Self {
        Self
    }

    fn monster_count(party: usize, difficulty: Difficulty) -> usize {
        let count = match difficulty {
            Difficulty::Easy => party.saturating_sub(1),
            Difficulty::Normal => party,
            Difficulty::Hard => party + 1,
        };
        count.clamp(1, (MAP_HEIGHT - 2) as usize)
    }

    fn monster_stats(rng: &mut DeterministicRng, difficulty: Difficulty) -> StatBlock {
        let bonus = match difficulty {
            Difficulty::Easy => -1,
            Difficulty::Normal => 0,
            Difficulty::Hard => 2,
        };
        StatBlock::new(
            12 + bonus * 2 + rng.next_int_range(0, 4),
            4 + bonus,
            1,
            rng.next_int_range(0, 4),
            3,
            1,
        )
    }
}

impl Simulation for SkirmishSimulation {
    fn create_scenario(&self, request: &ScenarioRequest) -> Result<GameState, SimulationError> {
        let rows = (MAP_HEIGHT - 2) as usize;
        if request.party.is_empty() {
            return Err(SimulationError::Scenario("empty party".into()));
        }
        if request.party.len() > rows * 2 {
            return Err(SimulationError::Scenario(format!(
                "party of {} does not fit the map",
                request.party.len()
            )));
        }

        let mut rng = DeterministicRng::new(request.seed);
        let map = GridMap::open("crossroads", MAP_WIDTH, MAP_HEIGHT)
            .with_blocked([Position::new(4, 2), Position::new(4, 3), Position::new(5, 5)]);
        let mut state = GameState::new(map);
        let mut next_id: UnitId = 1;

        for (i, member) in request.party.iter().enumerate() {
            let (name, stats) = match &member.character {
                Some(sheet) => (sheet.name.clone(), StatBlock { hp: sheet.stats.max_hp, ..sheet.stats }),
                None => (member.display_name.clone(), DEFAULT_HERO_STATS),
            };
            state.units.insert(next_id, Unit {
                id: next_id,
                kind: UnitKind::Player,
                team: Team::Party,
                name,
                position: Position::new(1 - (i / rows) as i32, 1 + (i % rows) as i32),
                stats,
                owner: Some(member.user_id.clone()),
            });
            next_id += 1;
        }

        for i in 0..Self::monster_count(request.party.len(), request.difficulty) {
            state.units.insert(next_id, Unit {
                id: next_id,
                kind: UnitKind::Monster,
                team: Team::Hostile,
                name: format!("Goblin {}", i + 1),
                position: Position::new(MAP_WIDTH - 2, 1 + i as i32),
                stats: Self::monster_stats(&mut rng, request.difficulty),
                owner: None,
            });
            next_id += 1;
        }

        state.loot.insert(1, LootDrop {
            id: 1,
            position: Position::new(5, 4),
            item: ItemStack { item_id: "healing_potion".into(), quantity: 1 },
        });

        Ok(state)
    }

    fn apply(&self, state: &GameState, action: &Action) -> Result<SimOutcome, SimulationError> {
        let mut next = state.clone();
        let mut events = Vec::new();

        match action {
            Action::Move { unit_id, path } => {
                let destination = *path
                    .last()
                    .ok_or_else(|| SimulationError::Rejected("empty path".into()))?;
                let unit = next
                    .units
                    .get_mut(unit_id)
                    .ok_or_else(|| SimulationError::Rejected(format!("unknown unit {}", unit_id)))?;
                let from = unit.position;
                unit.position = destination;
                events.push(GameEvent::UnitMoved {
                    unit_id: *unit_id,
                    from,
                    to: destination,
                    steps: path.len() as u32,
                });
            }

            Action::Attack { unit_id, target_id } => {
                let attack = next
                    .unit(*unit_id)
                    .map(|u| u.stats.attack)
                    .ok_or_else(|| SimulationError::Rejected(format!("unknown unit {}", unit_id)))?;
                let target = next
                    .units
                    .get_mut(target_id)
                    .ok_or_else(|| SimulationError::Rejected(format!("unknown target {}", target_id)))?;

                let damage = (attack - target.stats.defense).max(1);
                target.stats.hp = (target.stats.hp - damage).max(0);
                events.push(GameEvent::UnitAttacked {
                    attacker_id: *unit_id,
                    target_id: *target_id,
                    damage,
                    remaining_hp: target.stats.hp,
                });
                if target.stats.hp == 0 {
                    events.push(GameEvent::UnitDefeated { unit_id: *target_id, by: Some(*unit_id) });
                }
            }

            Action::CollectLoot { unit_id, loot_id, .. } => {
                let drop = next
                    .loot
                    .remove(loot_id)
                    .ok_or_else(|| SimulationError::Rejected(format!("unknown loot {}", loot_id)))?;
                let owner = next.unit(*unit_id).and_then(|u| u.owner.clone());
                if let Some(user) = &owner {
                    next.add_to_inventory(user, &drop.item);
                }
                events.push(GameEvent::LootCollected {
                    unit_id: *unit_id,
                    loot_id: *loot_id,
                    user_id: owner,
                    item: drop.item,
                });
            }

            Action::EndTurn { .. } => {}
        }

        Ok(SimOutcome { state: next, events })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn party(n: usize) -> Vec<PartyMember> {
        (0..n)
            .map(|i| PartyMember {
                user_id: UserId::new(format!("user-{}", i)),
                display_name: format!("Player {}", i),
                character: None,
            })
            .collect()
    }

    fn scenario(n: usize) -> GameState {
        SkirmishSimulation::new()
            .create_scenario(&ScenarioRequest { seed: 9, difficulty: Difficulty::Normal, party: party(n) })
            .unwrap()
    }

    #[test]
    fn test_scenario_is_deterministic() {
        assert_eq!(scenario(3), scenario(3));
    }

    #[test]
    fn test_scenario_layout() {
        let state = scenario(3);
        let party: Vec<_> = state.units.values().filter(|u| u.team == Team::Party).collect();
        let hostiles = state.units.values().filter(|u| u.team == Team::Hostile).count();

        assert_eq!(party.len(), 3);
        assert_eq!(hostiles, 3);
        for unit in state.units.values() {
            assert!(state.map.is_walkable(unit.position));
        }
        assert!(party.iter().all(|u| u.owner.is_some()));
    }

    #[test]
    fn test_empty_party_rejected() {
        let result = SkirmishSimulation::new()
            .create_scenario(&ScenarioRequest { seed: 1, difficulty: Difficulty::Easy, party: vec![] });
        assert!(matches!(result, Err(SimulationError::Scenario(_))));
    }

    #[test]
    fn test_attack_until_defeat() {
        let mut state = scenario(1);
        let hostile = state.units.values().find(|u| u.team == Team::Hostile).unwrap().id;
        state.units.get_mut(&hostile).unwrap().stats.hp = 2;

        let outcome = SkirmishSimulation::new()
            .apply(&state, &Action::Attack { unit_id: 1, target_id: hostile })
            .unwrap();

        assert_eq!(outcome.state.units[&hostile].stats.hp, 0);
        assert!(outcome.events.iter().any(|e| matches!(e, GameEvent::UnitDefeated { .. })));
        assert_eq!(SkirmishSimulation::new().evaluate(&outcome.state), Some(CombatPhase::Victory));
    }

    #[test]
    fn test_collect_loot_fills_inventory() {
        let state = scenario(1);
        let outcome = SkirmishSimulation::new()
            .apply(&state, &Action::CollectLoot { unit_id: 1, loot_id: 1, position: Position::new(5, 4) })
            .unwrap();

        assert!(outcome.state.loot.is_empty());
        assert_eq!(outcome.state.inventories[&UserId::new("user-0")]["healing_potion"], 1);
    }
}
