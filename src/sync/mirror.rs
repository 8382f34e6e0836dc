//! Client Mirror
//!
//! What a well-behaved client does with `full_state` and `state_delta`
//! frames: hold one version, apply a delta only if it starts exactly there,
//! and otherwise report a desync so a fresh snapshot can be requested.
//! The server's own tests use it to check that deltas reproduce snapshots.

use serde_json::Value;

use crate::game::state::GameState;
use crate::sync::diff;
use crate::sync::snapshot::{Delta, Snapshot, StateVersion, SyncError};

/// Locally tracked copy of a session's state.
#[derive(Debug, Clone)]
pub struct ClientMirror {
    version: StateVersion,
    state: Value,
}

impl ClientMirror {
    /// Start from a full snapshot.
    pub fn from_snapshot(snapshot: &Snapshot) -> Result<Self, SyncError> {
        Ok(Self {
            version: snapshot.version,
            state: serde_json::to_value(&snapshot.game_state)?,
        })
    }

    /// Version currently held.
    pub fn version(&self) -> StateVersion {
        self.version
    }

    /// Replace everything with a fresh snapshot (resync).
    pub fn reset(&mut self, snapshot: &Snapshot) -> Result<(), SyncError> {
        *self = Self::from_snapshot(snapshot)?;
        Ok(())
    }

    /// Apply a delta. A delta that does not start at the held version is
    /// discarded and reported as `VersionMismatch`; nothing changes.
    pub fn apply_delta(&mut self, delta: &Delta) -> Result<(), SyncError> {
        if delta.from_version != self.version {
            return Err(SyncError::VersionMismatch {
                held: self.version,
                from: delta.from_version,
            });
        }

        let mut next = self.state.clone();
        diff::apply(&mut next, &delta.changes)?;

        self.state = next;
        self.version = delta.to_version;
        Ok(())
    }

    /// Decode the held state.
    pub fn game_state(&self) -> Result<GameState, SyncError> {
        Ok(serde_json::from_value(self.state.clone())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::map::{GridMap, Position};
    use crate::game::state::{ItemStack, LootDrop, StatBlock, Team, Unit, UnitKind, UserId};
    use crate::sync::snapshot::StateSynchronizer;
    use proptest::prelude::*;

    fn initial() -> GameState {
        let mut state = GameState::new(GridMap::open("mirror", 8, 8));
        for id in 1..=4u32 {
            state.units.insert(id, Unit {
                id,
                kind: if id <= 2 { UnitKind::Player } else { UnitKind::Monster },
                team: if id <= 2 { Team::Party } else { Team::Hostile },
                name: format!("u{}", id),
                position: Position::new(id as i32, 0),
                stats: StatBlock::new(10, 3, 1, id as i32, 3, 1),
                owner: if id <= 2 { Some(UserId::new(format!("p{}", id))) } else { None },
            });
        }
        for id in 1..=3u32 {
            state.loot.insert(id, LootDrop {
                id,
                position: Position::new(id as i32, 5),
                item: ItemStack { item_id: format!("item-{}", id), quantity: id },
            });
        }
        state
    }

    /// Mutations the simulation could plausibly make.
    #[derive(Clone, Debug)]
    enum Mutation {
        Damage(u32, i32),
        Step(u32, i32, i32),
        TakeLoot(u32, u32),
        NextTurn,
    }

    fn mutation() -> impl Strategy<Value = Mutation> {
        prop_oneof![
            (1..=4u32, 0..12i32).prop_map(|(u, d)| Mutation::Damage(u, d)),
            (1..=4u32, 0..8i32, 0..8i32).prop_map(|(u, x, y)| Mutation::Step(u, x, y)),
            (1..=3u32, 1..=2u32).prop_map(|(l, p)| Mutation::TakeLoot(l, p)),
            Just(Mutation::NextTurn),
        ]
    }

    fn apply_mutation(state: &GameState, m: &Mutation) -> GameState {
        let mut next = state.clone();
        match *m {
            Mutation::Damage(unit, dmg) => {
                if let Some(u) = next.units.get_mut(&unit) {
                    u.stats.hp = (u.stats.hp - dmg).max(0);
                }
            }
            Mutation::Step(unit, x, y) => {
                if let Some(u) = next.units.get_mut(&unit) {
                    u.position = Position::new(x, y);
                }
            }
            Mutation::TakeLoot(loot, player) => {
                if let Some(drop) = next.loot.remove(&loot) {
                    next.add_to_inventory(&UserId::new(format!("p{}", player)), &drop.item);
                }
            }
            Mutation::NextTurn => {
                next.combat.current_turn_index = (next.combat.current_turn_index + 1) % 4;
                if next.combat.current_turn_index == 0 {
                    next.combat.round += 1;
                }
            }
        }
        next
    }

    proptest! {
        #[test]
        fn prop_deltas_reproduce_snapshot(mutations in prop::collection::vec(mutation(), 1..40)) {
            let mut sync = StateSynchronizer::new(initial()).unwrap();
            let mut mirror = ClientMirror::from_snapshot(&sync.full_snapshot().unwrap()).unwrap();

            for m in &mutations {
                let delta = sync.commit(|s| Ok(apply_mutation(s, m))).unwrap();
                mirror.apply_delta(&delta).unwrap();
            }

            let snapshot = sync.full_snapshot().unwrap();
            prop_assert_eq!(mirror.version(), snapshot.version);
            prop_assert_eq!(mirror.game_state().unwrap(), snapshot.game_state);
        }
    }

    #[test]
    fn test_gap_is_desync() {
        let mut sync = StateSynchronizer::new(initial()).unwrap();
        let mut mirror = ClientMirror::from_snapshot(&sync.full_snapshot().unwrap()).unwrap();

        let _missed = sync.commit(|s| Ok(apply_mutation(s, &Mutation::Damage(3, 2)))).unwrap();
        let next = sync.commit(|s| Ok(apply_mutation(s, &Mutation::Damage(3, 2)))).unwrap();

        let result = mirror.apply_delta(&next);
        assert!(matches!(result, Err(SyncError::VersionMismatch { held: 1, from: 2 })));
        assert_eq!(mirror.version(), 1);

        mirror.reset(&sync.full_snapshot().unwrap()).unwrap();
        assert_eq!(mirror.version(), 3);
        assert_eq!(mirror.game_state().unwrap().units[&3].stats.hp, 6);
    }

    #[test]
    fn test_replayed_delta_rejected() {
        let mut sync = StateSynchronizer::new(initial()).unwrap();
        let mut mirror = ClientMirror::from_snapshot(&sync.full_snapshot().unwrap()).unwrap();

        let delta = sync.commit(|s| Ok(apply_mutation(s, &Mutation::NextTurn))).unwrap();
        mirror.apply_delta(&delta).unwrap();
        assert!(mirror.apply_delta(&delta).is_err());
        assert_eq!(mirror.version(), 2);
    }
}
