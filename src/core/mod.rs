//! Core deterministic primitives.
//!
//! Seeded randomness and state hashing shared by the game and sync layers.

pub mod rng;
pub mod hash;

pub use rng::DeterministicRng;
pub use hash::{hash_state, hash_state_hex, StateHash};
