//! Game State Definitions
//!
//! The shape of the shared world that gets snapshotted and diffed.
//! Uses BTreeMap everywhere so serialization order (and therefore diffs and
//! state hashes) is deterministic.

use std::collections::BTreeMap;
use std::fmt;
use serde::{Serialize, Deserialize};

use crate::game::map::{GridMap, Position};

// =============================================================================
// IDENTIFIERS
// =============================================================================

/// Authenticated user identity (the session token's subject).
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
    /// Create from anything string-like.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the raw id.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Unit identifier, unique within one game state.
pub type UnitId = u32;

/// Loot drop identifier, unique within one game state.
pub type LootId = u32;

// =============================================================================
// UNITS
// =============================================================================

/// What kind of combatant a unit is.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitKind {
    /// Controlled by a session member.
    Player,
    /// Hostile creature.
    Monster,
    /// Non-player character.
    Npc,
}

/// Allegiance used for targeting and victory checks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Team {
    /// The players' side.
    Party,
    /// The opposing side.
    Hostile,
    /// Neither side; ignored by victory checks.
    Neutral,
}

/// Combat statistics.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatBlock {
    /// Maximum hit points.
    pub max_hp: i32,
    /// Current hit points.
    pub hp: i32,
    /// Attack power.
    pub attack: i32,
    /// Damage reduction.
    pub defense: i32,
    /// Initiative bonus.
    pub initiative: i32,
    /// Tiles per turn.
    pub move_range: u32,
    /// Attack reach in tiles.
    pub attack_range: u32,
}

impl StatBlock {
    /// A fresh stat block at full health.
    pub fn new(max_hp: i32, attack: i32, defense: i32, initiative: i32, move_range: u32, attack_range: u32) -> Self {
        Self {
            max_hp,
            hp: max_hp,
            attack,
            defense,
            initiative,
            move_range,
            attack_range,
        }
    }
}

/// A combatant on the map.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Unit {
    /// Unit identifier.
    pub id: UnitId,
    /// Unit kind.
    pub kind: UnitKind,
    /// Allegiance.
    pub team: Team,
    /// Display name.
    pub name: String,
    /// Current tile.
    pub position: Position,
    /// Stats, including current hp.
    pub stats: StatBlock,
    /// Owning session member; `None` for monsters, NPCs and orphaned units.
    pub owner: Option<UserId>,
}

impl Unit {
    /// Still standing?
    #[inline]
    pub fn is_alive(&self) -> bool {
        self.stats.hp > 0
    }
}

// =============================================================================
// COMBAT
// =============================================================================

/// Phase of the encounter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CombatPhase {
    /// Nothing rolled yet.
    #[default]
    NotStarted,
    /// Initiative being rolled.
    Setup,
    /// Turns are being taken.
    InProgress,
    /// All hostiles defeated.
    Victory,
    /// Whole party defeated.
    Defeat,
}

impl CombatPhase {
    /// Victory or defeat.
    pub fn is_finished(self) -> bool {
        matches!(self, CombatPhase::Victory | CombatPhase::Defeat)
    }
}

/// One slot in the initiative order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiativeEntry {
    /// Unit acting in this slot.
    pub unit_id: UnitId,
    /// Initiative score (the unit's initiative stat).
    pub roll: i32,
    /// Random tie-break drawn from the session RNG.
    pub tie_break: u32,
}

/// Step within a single turn.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnPhase {
    /// Movement still available.
    Move,
    /// Movement spent, action may still be taken.
    Action,
    /// Nothing left to do.
    Ended,
}

/// The active turn.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnState {
    /// Unit whose turn it is.
    pub unit_id: UnitId,
    /// Current step.
    pub phase: TurnPhase,
    /// Tiles left to move this turn.
    pub movement_remaining: u32,
    /// Attack or loot already used.
    pub has_acted: bool,
}

/// Encounter bookkeeping, advanced only by the turn coordinator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct CombatState {
    /// Encounter phase.
    pub phase: CombatPhase,
    /// Round counter, starting at 1.
    pub round: u32,
    /// Initiative order, best first.
    pub initiative: Vec<InitiativeEntry>,
    /// Index into `initiative` of the acting slot.
    pub current_turn_index: usize,
    /// Active turn, if combat is running.
    pub turn: Option<TurnState>,
}

// =============================================================================
// LOOT
// =============================================================================

/// A quantity of one item.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemStack {
    /// Item identifier.
    pub item_id: String,
    /// How many.
    pub quantity: u32,
}

/// Loot lying on the map.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LootDrop {
    /// Drop identifier.
    pub id: LootId,
    /// Tile the loot lies on.
    pub position: Position,
    /// Contents.
    pub item: ItemStack,
}

/// Per-player inventory: item id to quantity.
pub type Inventory = BTreeMap<String, u32>;

// =============================================================================
// GAME STATE
// =============================================================================

/// The whole shared world of a running session.
///
/// Produced by the simulation; the sync layer only reads it to snapshot and
/// diff. Changes go through `StateSynchronizer::commit`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameState {
    /// Battle map.
    pub map: GridMap,
    /// Units keyed by id.
    pub units: BTreeMap<UnitId, Unit>,
    /// Encounter state.
    pub combat: CombatState,
    /// Loot on the ground.
    pub loot: BTreeMap<LootId, LootDrop>,
    /// Items picked up or granted, per player.
    pub inventories: BTreeMap<UserId, Inventory>,
}

impl GameState {
    /// Empty state on a map.
    pub fn new(map: GridMap) -> Self {
        Self {
            map,
            units: BTreeMap::new(),
            combat: CombatState::default(),
            loot: BTreeMap::new(),
            inventories: BTreeMap::new(),
        }
    }

    /// Look up a unit.
    pub fn unit(&self, id: UnitId) -> Option<&Unit> {
        self.units.get(&id)
    }

    /// The unit owned by a user, if any.
    pub fn unit_owned_by(&self, user: &UserId) -> Option<&Unit> {
        self.units.values().find(|u| u.owner.as_ref() == Some(user))
    }

    /// Living unit standing on a tile.
    pub fn unit_at(&self, pos: Position) -> Option<&Unit> {
        self.units.values().find(|u| u.is_alive() && u.position == pos)
    }

    /// Add items to a player's inventory.
    pub fn add_to_inventory(&mut self, user: &UserId, item: &ItemStack) {
        let inventory = self.inventories.entry(user.clone()).or_default();
        let held = inventory.entry(item.item_id.clone()).or_insert(0);
        *held = held.saturating_add(item.quantity);
    }

    /// Victory when no hostile stands, defeat when no party member stands.
    pub fn outcome(&self) -> Option<CombatPhase> {
        let party_alive = self.units.values().any(|u| u.team == Team::Party && u.is_alive());
        let hostile_alive = self.units.values().any(|u| u.team == Team::Hostile && u.is_alive());

        if !party_alive {
            Some(CombatPhase::Defeat)
        } else if !hostile_alive {
            Some(CombatPhase::Victory)
        } else {
            None
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(id: UnitId, team: Team, hp: i32) -> Unit {
        let mut stats = StatBlock::new(10, 3, 1, 2, 4, 1);
        stats.hp = hp;
        Unit {
            id,
            kind: if team == Team::Party { UnitKind::Player } else { UnitKind::Monster },
            team,
            name: format!("unit-{}", id),
            position: Position::new(id as i32, 0),
            stats,
            owner: None,
        }
    }

    #[test]
    fn test_outcome() {
        let mut state = GameState::new(GridMap::open("test", 8, 8));
        state.units.insert(1, unit(1, Team::Party, 10));
        state.units.insert(2, unit(2, Team::Hostile, 10));
        assert_eq!(state.outcome(), None);

        state.units.get_mut(&2).unwrap().stats.hp = 0;
        assert_eq!(state.outcome(), Some(CombatPhase::Victory));

        state.units.get_mut(&2).unwrap().stats.hp = 5;
        state.units.get_mut(&1).unwrap().stats.hp = -2;
        assert_eq!(state.outcome(), Some(CombatPhase::Defeat));
    }

    #[test]
    fn test_inventory_accumulates() {
        let mut state = GameState::new(GridMap::open("test", 4, 4));
        let user = UserId::new("alice");
        let potion = ItemStack { item_id: "potion".into(), quantity: 2 };

        state.add_to_inventory(&user, &potion);
        state.add_to_inventory(&user, &potion);

        assert_eq!(state.inventories[&user]["potion"], 4);
    }

    #[test]
    fn test_inventory_saturates() {
        let mut state = GameState::new(GridMap::open("test", 4, 4));
        let user = UserId::new("alice");

        state.add_to_inventory(&user, &ItemStack { item_id: "gold".into(), quantity: u32::MAX });
        state.add_to_inventory(&user, &ItemStack { item_id: "gold".into(), quantity: 2 });

        assert_eq!(state.inventories[&user]["gold"], u32::MAX);
    }

    #[test]
    fn test_wire_shape() {
        let mut state = GameState::new(GridMap::open("test", 4, 4));
        state.combat.phase = CombatPhase::InProgress;
        let json = serde_json::to_value(&state).unwrap();

        assert_eq!(json["combat"]["phase"], "in_progress");
        assert_eq!(json["combat"]["currentTurnIndex"], 0);
    }
}
