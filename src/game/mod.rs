//! Game Model Module
//!
//! The shared world the server synchronizes, the actions players submit,
//! and the contracts of the external collaborators.
//!
//! ## Module Structure
//!
//! - `state`: GameState, units, combat and loot
//! - `map`: grid geometry
//! - `action`: the gameplay action vocabulary
//! - `rules`: legality checks run before the simulation
//! - `events`: what the simulation reports back
//! - `simulation`: simulation contract plus the reference rule set
//! - `character`: character load/save contract

pub mod state;
pub mod map;
pub mod action;
pub mod rules;
pub mod events;
pub mod simulation;
pub mod character;

// Re-export key types
pub use state::{GameState, Unit, UnitId, UserId, CombatState, CombatPhase, TurnState, TurnPhase};
pub use map::{GridMap, Position};
pub use action::Action;
pub use rules::ActionRejection;
pub use events::{GameEvent, TurnEndReason};
pub use simulation::{Difficulty, Simulation, SkirmishSimulation};
pub use character::{CharacterSheet, CharacterStore, InMemoryCharacterStore};
