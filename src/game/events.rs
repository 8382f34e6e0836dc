//! Game Events
//!
//! Events produced by the simulation and the turn coordinator, broadcast to
//! session members alongside each state delta.

use serde::{Serialize, Deserialize};

use crate::game::map::Position;
use crate::game::state::{CombatPhase, ItemStack, LootId, UnitId, UserId};

/// Why a turn ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnEndReason {
    /// The player ended it explicitly.
    EndTurn,
    /// Movement and action were both used up.
    BudgetExhausted,
    /// The turn timer ran out.
    Timeout,
    /// The acting player stayed disconnected past the turn allowance.
    Disconnected,
    /// The DM forced it.
    Forced,
}

/// A single thing that happened.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum GameEvent {
    /// A unit walked.
    #[serde(rename_all = "camelCase")]
    UnitMoved {
        unit_id: UnitId,
        from: Position,
        to: Position,
        steps: u32,
    },

    /// A unit attacked another.
    #[serde(rename_all = "camelCase")]
    UnitAttacked {
        attacker_id: UnitId,
        target_id: UnitId,
        damage: i32,
        remaining_hp: i32,
    },

    /// A unit dropped to zero hp.
    #[serde(rename_all = "camelCase")]
    UnitDefeated {
        unit_id: UnitId,
        by: Option<UnitId>,
    },

    /// A unit picked up loot.
    #[serde(rename_all = "camelCase")]
    LootCollected {
        unit_id: UnitId,
        loot_id: LootId,
        user_id: Option<UserId>,
        item: ItemStack,
    },

    /// The DM granted an item.
    #[serde(rename_all = "camelCase")]
    RewardGranted {
        user_id: UserId,
        item: ItemStack,
    },

    /// A turn finished.
    #[serde(rename_all = "camelCase")]
    TurnEnded {
        unit_id: UnitId,
        reason: TurnEndReason,
    },

    /// A turn began.
    #[serde(rename_all = "camelCase")]
    TurnStarted {
        unit_id: UnitId,
        round: u32,
    },

    /// The initiative order wrapped around.
    RoundStarted {
        round: u32,
    },

    /// The encounter is over.
    CombatEnded {
        phase: CombatPhase,
    },

    /// A unit lost its controller and is now acted for by the DM.
    #[serde(rename_all = "camelCase")]
    UnitOrphaned {
        unit_id: UnitId,
        previous_owner: UserId,
    },
}
