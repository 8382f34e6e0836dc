//! # Skirmish Server
//!
//! Authoritative session and state synchronization server for turn-based
//! tactical combat. Clients connect over WebSocket with a signed session
//! token, gather in a lobby behind a join code, and play in turns while the
//! server validates every action, versions every state change and streams
//! deltas to the table.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    SKIRMISH SERVER                           │
//! ├─────────────────────────────────────────────────────────────┤
//! │  core/           - Deterministic primitives                  │
//! │  ├── rng.rs      - Seeded Xorshift128+ PRNG                  │
//! │  └── hash.rs     - State hashing for snapshots               │
//! │                                                              │
//! │  game/           - Data model and rules                      │
//! │  ├── state.rs    - GameState, units, combat, loot            │
//! │  ├── rules.rs    - Action legality checks                    │
//! │  ├── simulation.rs - Simulation contract + reference rules   │
//! │  └── character.rs  - Character store contract                │
//! │                                                              │
//! │  session/        - Sessions and turns                        │
//! │  ├── session.rs  - Lifecycle state machine, members          │
//! │  ├── registry.rs - Session table and join codes              │
//! │  └── turn.rs     - Initiative and turn budgets               │
//! │                                                              │
//! │  sync/           - Versioned snapshots and deltas            │
//! │                                                              │
//! │  network/        - Connections and message handling          │
//! │  ├── token.rs    - Signed session tokens                     │
//! │  ├── gateway.rs  - Identity to connection table              │
//! │  ├── pipeline.rs - Action pipeline, turn timers              │
//! │  ├── reconnect.rs- Grace windows and rebinding               │
//! │  └── server.rs   - WebSocket server and dispatcher           │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Single Writer
//!
//! Each session sits behind its own FIFO mutex. Every handler locks the
//! session first and the registry maps second, never the other way round,
//! and never waits on a client while holding the lock: outbound frames go
//! into bounded per-connection queues and are dropped when a queue is full.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod core;
pub mod game;
pub mod session;
pub mod sync;
pub mod network;
pub mod config;

// Re-export commonly used types
pub use core::rng::DeterministicRng;
pub use config::ServerConfig;
pub use game::state::{GameState, UnitId, UserId};
pub use game::{Action, ActionRejection, Simulation, SkirmishSimulation};
pub use session::{Session, SessionError, SessionId, SessionRegistry, SessionState};
pub use sync::{ClientMirror, Delta, Snapshot, StateSynchronizer, StateVersion};
pub use network::{GameServer, ServerContext};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
