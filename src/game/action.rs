//! Player Actions
//!
//! The gameplay commands a client can submit during its unit's turn.

use serde::{Serialize, Deserialize};

use crate::game::map::Position;
use crate::game::state::{LootId, UnitId};

/// A gameplay action, as carried in the `action` message payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    /// Walk along a path of orthogonally adjacent tiles (start tile excluded).
    Move {
        /// Acting unit.
        #[serde(rename = "unitId")]
        unit_id: UnitId,
        /// Tiles to step through, in order.
        path: Vec<Position>,
    },

    /// Attack another unit.
    Attack {
        /// Acting unit.
        #[serde(rename = "unitId")]
        unit_id: UnitId,
        /// Unit being attacked.
        #[serde(rename = "targetId")]
        target_id: UnitId,
    },

    /// Pick up a loot drop the client believes lies at `position`.
    CollectLoot {
        /// Acting unit.
        #[serde(rename = "unitId")]
        unit_id: UnitId,
        /// Loot being picked up.
        #[serde(rename = "lootId")]
        loot_id: LootId,
        /// Where the client sees the loot.
        position: Position,
    },

    /// Give up the rest of the turn.
    EndTurn {
        /// Acting unit.
        #[serde(rename = "unitId")]
        unit_id: UnitId,
    },
}

impl Action {
    /// The unit performing the action.
    pub fn unit_id(&self) -> UnitId {
        match self {
            Action::Move { unit_id, .. }
            | Action::Attack { unit_id, .. }
            | Action::CollectLoot { unit_id, .. }
            | Action::EndTurn { unit_id } => *unit_id,
        }
    }

    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Action::Move { .. } => "move",
            Action::Attack { .. } => "attack",
            Action::CollectLoot { .. } => "collect_loot",
            Action::EndTurn { .. } => "end_turn",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_move_wire_format() {
        let json = r#"{"type":"move","unitId":3,"path":[{"x":1,"y":0},{"x":2,"y":0}]}"#;
        let action: Action = serde_json::from_str(json).unwrap();

        assert_eq!(action.unit_id(), 3);
        match action {
            Action::Move { path, .. } => assert_eq!(path.len(), 2),
            other => panic!("unexpected action {:?}", other),
        }
    }

    #[test]
    fn test_end_turn_serializes_tag() {
        let json = serde_json::to_string(&Action::EndTurn { unit_id: 1 }).unwrap();
        assert!(json.contains(r#""type":"end_turn""#));
        assert!(json.contains(r#""unitId":1"#));
    }
}
