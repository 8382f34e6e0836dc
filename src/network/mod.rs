//! Network Layer
//!
//! Authenticated WebSocket connections, the wire protocol, and the
//! handlers that turn client messages into session changes.
//! Game rules live in `game/`; sessions and turns in `session/`.

pub mod token;
pub mod auth;
pub mod protocol;
pub mod rate_limit;
pub mod gateway;
pub mod lifecycle;
pub mod pipeline;
pub mod reconnect;
pub mod server;

pub use token::{AuthError, Identity, ProviderCredentials, SessionTokenPayload, TokenSigner};
pub use auth::{AuthService, AuthStatus, IdentityProvider};
pub use protocol::{
    ActionResult, ClientEnvelope, ClientMessage, DmCommand, ErrorCode, LeaveReason,
    ServerEnvelope, ServerError, ServerMessage,
};
pub use gateway::{ConnectionGateway, ConnectionId, Outbound};
pub use server::{Connection, Flow, GameServer, GameServerError, ServerContext};
