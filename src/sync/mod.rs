//! State Synchronization Module
//!
//! Versioned snapshots and structural deltas of a session's game state.
//!
//! ## Module Structure
//!
//! - `diff`: JSON Pointer diff/patch
//! - `snapshot`: the authoritative synchronizer (version counter + commit)
//! - `mirror`: client-side tracker that detects desync

pub mod diff;
pub mod snapshot;
pub mod mirror;

pub use diff::{Change, ChangeOp, PatchError};
pub use snapshot::{Delta, Snapshot, StateSynchronizer, StateVersion, SyncError};
pub use mirror::ClientMirror;
