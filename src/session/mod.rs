//! Session Module
//!
//! Session lifecycle, membership and turn order.
//!
//! ## Module Structure
//!
//! - `session`: Session, Player and the lifecycle state machine
//! - `registry`: sessions by id and join code, user bindings
//! - `join_code`: code generation
//! - `turn`: initiative and turn budgets

pub mod session;
pub mod registry;
pub mod join_code;
pub mod turn;

pub use session::{LobbyView, Player, Session, SessionError, SessionId, SessionSettings, SessionState};
pub use registry::{SessionRegistry, SharedSession};
pub use turn::TurnChange;
