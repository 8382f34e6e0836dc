//! State Synchronizer
//!
//! Owns the authoritative `GameState` of one session together with its
//! version counter. `commit` is the only way the state changes: it swaps in
//! the new state, bumps the version by exactly one and hands back the delta
//! to broadcast. Failed commits leave both state and version untouched.

use serde::{Serialize, Deserialize};
use serde_json::Value;
use thiserror::Error;

use crate::core::hash::hash_state_hex;
use crate::game::state::GameState;
use crate::sync::diff::{self, Change, PatchError};

/// Monotonic per-session state version.
pub type StateVersion = u64;

/// Complete state at a version.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    /// Version of `game_state`.
    pub version: StateVersion,
    /// The full state.
    pub game_state: GameState,
    /// Hex SHA-256 of version + canonical state encoding.
    pub state_hash: String,
}

/// Changes between two consecutive versions.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Delta {
    /// Version the changes apply to.
    pub from_version: StateVersion,
    /// Version after applying them (always `from_version + 1`).
    pub to_version: StateVersion,
    /// `{path, value}` changes.
    pub changes: Vec<Change>,
}

/// Synchronization failures.
#[derive(Debug, Error)]
pub enum SyncError {
    /// State could not be encoded or decoded.
    #[error("state serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
    /// The mutation refused to produce a new state.
    #[error("mutation failed: {0}")]
    Mutation(String),
    /// A delta could not be applied.
    #[error("patch failed: {0}")]
    Patch(#[from] PatchError),
    /// A delta does not start at the locally held version.
    #[error("version mismatch: holding {held}, delta starts at {from}")]
    VersionMismatch {
        /// Version held locally.
        held: StateVersion,
        /// Delta's `from_version`.
        from: StateVersion,
    },
}

/// Authoritative versioned state of one session.
#[derive(Debug, Clone)]
pub struct StateSynchronizer {
    version: StateVersion,
    state: GameState,
    encoded: Value,
}

impl StateSynchronizer {
    /// Install the initial state as version 1.
    pub fn new(initial: GameState) -> Result<Self, SyncError> {
        let encoded = serde_json::to_value(&initial)?;
        Ok(Self {
            version: 1,
            state: initial,
            encoded,
        })
    }

    /// Current version.
    pub fn version(&self) -> StateVersion {
        self.version
    }

    /// Current state.
    pub fn state(&self) -> &GameState {
        &self.state
    }

    /// Full snapshot of the current version.
    pub fn full_snapshot(&self) -> Result<Snapshot, SyncError> {
        Ok(Snapshot {
            version: self.version,
            game_state: self.state.clone(),
            state_hash: hash_state_hex(self.version, &self.state)?,
        })
    }

    /// Apply `mutate` to the current state and store the result as the next
    /// version.
    pub fn commit<F>(&mut self, mutate: F) -> Result<Delta, SyncError>
    where
        F: FnOnce(&GameState) -> Result<GameState, SyncError>,
    {
        let next = mutate(&self.state)?;
        let encoded = serde_json::to_value(&next)?;
        let changes = diff::diff(&self.encoded, &encoded);

        let delta = Delta {
            from_version: self.version,
            to_version: self.version + 1,
            changes,
        };

        self.state = next;
        self.encoded = encoded;
        self.version = delta.to_version;

        Ok(delta)
    }
}
