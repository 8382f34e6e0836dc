//! Protocol Messages
//!
//! Wire format for client-server communication over WebSocket. Every frame
//! is a JSON envelope `{type, payload, seq, ts}`; replies to a request also
//! carry `{reqSeq, success, error?}`.

use serde::{Serialize, Deserialize};

use crate::game::action::Action;
use crate::game::events::GameEvent;
use crate::game::rules::ActionRejection;
use crate::game::state::{GameState, UnitId, UserId};
use crate::network::auth::AuthStatus;
use crate::network::token::Identity;
use crate::session::session::{LobbyView, SessionError, SessionId, SessionSettings};
use crate::sync::snapshot::{Delta, StateVersion};

// =============================================================================
// CLIENT -> SERVER MESSAGES
// =============================================================================

/// Messages sent from client to server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Open a new session as its DM.
    #[serde(rename_all = "camelCase")]
    CreateGame {
        #[serde(default)]
        character_id: Option<String>,
        #[serde(default)]
        settings: Option<SessionSettings>,
    },

    /// Join a lobby by code.
    #[serde(rename_all = "camelCase")]
    JoinGame {
        join_code: String,
        #[serde(default)]
        character_id: Option<String>,
    },

    /// Toggle readiness in the lobby.
    SetReady { ready: bool },

    /// DM starts the game (same as the `start_game` DM command).
    StartGame,

    /// Leave the current session.
    LeaveGame,

    /// Gameplay action.
    Action(Action),

    /// Chat to the session, or whisper to one member.
    Chat {
        text: String,
        #[serde(default)]
        to: Option<UserId>,
    },

    /// DM-only command.
    DmCommand(DmCommand),

    /// Ask for a full snapshot (after a desync).
    RequestSync,

    /// Keepalive.
    #[serde(rename_all = "camelCase")]
    Ping { client_time: i64 },

    /// Auth status for this connection.
    AuthStatus,

    /// Extend the session token.
    RefreshSession,

    /// Log out; `everywhere` also ends the provider session.
    Logout {
        #[serde(default)]
        everywhere: bool,
    },
}

impl ClientMessage {
    /// Rate-limit bucket this message counts against.
    pub fn class(&self) -> MessageClass {
        match self {
            ClientMessage::Action(_) => MessageClass::Action,
            ClientMessage::Chat { .. } => MessageClass::Chat,
            ClientMessage::DmCommand(_) | ClientMessage::StartGame => MessageClass::DmCommand,
            _ => MessageClass::Control,
        }
    }

    /// Message name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            ClientMessage::CreateGame { .. } => "create_game",
            ClientMessage::JoinGame { .. } => "join_game",
            ClientMessage::SetReady { .. } => "set_ready",
            ClientMessage::StartGame => "start_game",
            ClientMessage::LeaveGame => "leave_game",
            ClientMessage::Action(_) => "action",
            ClientMessage::Chat { .. } => "chat",
            ClientMessage::DmCommand(_) => "dm_command",
            ClientMessage::RequestSync => "request_sync",
            ClientMessage::Ping { .. } => "ping",
            ClientMessage::AuthStatus => "auth_status",
            ClientMessage::RefreshSession => "refresh_session",
            ClientMessage::Logout { .. } => "logout",
        }
    }
}

/// Rate-limit classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MessageClass {
    /// Gameplay actions.
    Action,
    /// Chat.
    Chat,
    /// DM commands.
    DmCommand,
    /// Everything else.
    Control,
}

/// DM-only commands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum DmCommand {
    /// Start the game.
    StartGame,
    /// Pause play.
    Pause,
    /// Resume play.
    Resume,
    /// End the current turn now.
    ForceEndTurn,
    /// Give a member items.
    #[serde(rename_all = "camelCase")]
    GrantReward {
        user_id: UserId,
        item_id: String,
        quantity: u32,
    },
    /// Remove a member.
    #[serde(rename_all = "camelCase")]
    KickPlayer { user_id: UserId },
    /// End the session.
    EndSession {
        #[serde(default)]
        reason: Option<String>,
    },
}

/// Envelope around every client frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientEnvelope {
    /// The message.
    #[serde(flatten)]
    pub message: ClientMessage,
    /// Client sequence number, echoed as `reqSeq`.
    #[serde(default)]
    pub seq: u64,
    /// Client send time (epoch ms).
    #[serde(default)]
    pub ts: i64,
}

// =============================================================================
// SERVER -> CLIENT MESSAGES
// =============================================================================

/// Messages sent from server to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Connection accepted.
    #[serde(rename_all = "camelCase")]
    Authenticated {
        user: Identity,
        server_version: String,
    },

    /// Session created.
    #[serde(rename_all = "camelCase")]
    GameCreated {
        session_id: SessionId,
        join_code: String,
    },

    /// Joined a session.
    #[serde(rename_all = "camelCase")]
    GameJoined {
        session_id: SessionId,
        join_code: String,
    },

    /// Generic success reply.
    Ack,

    /// Outcome of an action.
    ActionResult(ActionResult),

    /// Full snapshot.
    #[serde(rename_all = "camelCase")]
    FullState {
        version: StateVersion,
        game_state: GameState,
        state_hash: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        your_unit_id: Option<UnitId>,
    },

    /// Incremental changes.
    StateDelta(Delta),

    /// What happened in the last commit.
    Events {
        version: StateVersion,
        events: Vec<GameEvent>,
    },

    /// A new turn started.
    #[serde(rename_all = "camelCase")]
    TurnChange {
        current_user_id: Option<UserId>,
        unit_id: UnitId,
        round: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        time_limit_secs: Option<u64>,
    },

    /// Session membership and lifecycle state.
    LobbyState(LobbyView),

    /// A member's connection dropped or came back.
    #[serde(rename_all = "camelCase")]
    PlayerConnection { user_id: UserId, connected: bool },

    /// A member is gone for good.
    #[serde(rename_all = "camelCase")]
    PlayerLeft { user_id: UserId, reason: LeaveReason },

    /// Chat line.
    Chat {
        from: UserId,
        text: String,
        whisper: bool,
    },

    /// The session is over.
    SessionEnded { reason: String },

    /// Keepalive reply.
    #[serde(rename_all = "camelCase")]
    Pong { client_time: i64, server_time: i64 },

    /// Auth status.
    AuthStatus(AuthStatus),

    /// Session token extended.
    #[serde(rename_all = "camelCase")]
    SessionRefreshed { expires_at: u64 },

    /// Logged out; the connection closes next.
    #[serde(rename_all = "camelCase")]
    LoggedOut { provider_logout_url: Option<String> },

    /// Failure.
    Error(ServerError),

    /// Server going down.
    Shutdown { reason: String },
}

/// Action outcome. Rejections leave state untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionResult {
    /// Accepted?
    pub valid: bool,
    /// Why not.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<ActionRejection>,
    /// State version after the call.
    pub version: StateVersion,
}

/// Why a member left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaveReason {
    /// Left on their own.
    Left,
    /// Removed by the DM.
    Kicked,
    /// Did not reconnect in time.
    TimedOut,
}

/// Error frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerError {
    /// Machine-readable code.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
    /// Back-off hint for rate limits.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

impl ServerError {
    /// Build an error frame.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into(), retry_after_ms: None }
    }
}

impl From<&SessionError> for ServerError {
    fn from(err: &SessionError) -> Self {
        let code = match err {
            SessionError::SessionNotFound => ErrorCode::SessionNotFound,
            SessionError::SessionFull => ErrorCode::SessionFull,
            SessionError::SessionNotJoinable => ErrorCode::SessionNotJoinable,
            SessionError::NotReady => ErrorCode::NotReady,
            SessionError::NotDm => ErrorCode::NotDm,
            SessionError::NotInSession => ErrorCode::NotInSession,
            SessionError::AlreadyInSession => ErrorCode::AlreadyInSession,
            SessionError::InvalidTransition { .. } | SessionError::NotInLobby => ErrorCode::InvalidState,
            SessionError::JoinCodeExhausted => ErrorCode::ServerOverloaded,
            SessionError::Scenario(_) => ErrorCode::ScenarioFailed,
            SessionError::Sync(_) => ErrorCode::InternalError,
        };
        Self::new(code, err.to_string())
    }
}

impl From<ActionRejection> for ServerError {
    fn from(reason: ActionRejection) -> Self {
        let code = match reason {
            ActionRejection::SessionPaused => ErrorCode::SessionPaused,
            ActionRejection::NotInSession => ErrorCode::NotInSession,
            ActionRejection::SimulationFailed => ErrorCode::InternalError,
            _ => ErrorCode::InvalidState,
        };
        Self::new(code, reason.to_string())
    }
}

/// Error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Missing, expired or invalid session token.
    AuthFailed,
    /// Frame could not be decoded.
    InvalidMessage,
    /// Too many messages.
    RateLimited,
    /// Unknown session or join code.
    SessionNotFound,
    /// Session full.
    SessionFull,
    /// Session past the lobby.
    SessionNotJoinable,
    /// Not everyone is ready.
    NotReady,
    /// DM-only.
    NotDm,
    /// Not in a session.
    NotInSession,
    /// Already in a session.
    AlreadyInSession,
    /// Operation not allowed in the current lifecycle state.
    InvalidState,
    /// Scenario construction failed.
    ScenarioFailed,
    /// Session paused.
    SessionPaused,
    /// Too many sessions or connections.
    ServerOverloaded,
    /// Internal error.
    InternalError,
}

/// Envelope around every server frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerEnvelope {
    /// The message.
    #[serde(flatten)]
    pub message: ServerMessage,
    /// Server sequence number.
    pub seq: u64,
    /// Server send time (epoch ms).
    pub ts: i64,
    /// Request this replies to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub req_seq: Option<u64>,
    /// Whether the request succeeded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    /// Failure description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ServerEnvelope {
    /// Unsolicited push.
    pub fn push(message: ServerMessage, seq: u64) -> Self {
        Self { message, seq, ts: now_ms(), req_seq: None, success: None, error: None }
    }

    /// Reply to request `req_seq`.
    pub fn reply(message: ServerMessage, seq: u64, req_seq: u64) -> Self {
        let error = match &message {
            ServerMessage::Error(e) => Some(e.message.clone()),
            ServerMessage::ActionResult(r) => r.reason.map(|reason| reason.to_string()),
            _ => None,
        };
        Self {
            message,
            seq,
            ts: now_ms(),
            req_seq: Some(req_seq),
            success: Some(error.is_none()),
            error,
        }
    }
}

/// Current time as epoch milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// =============================================================================
// SERIALIZATION HELPERS
// =============================================================================

impl ClientEnvelope {
    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }

    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl ServerEnvelope {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::map::Position;
    use serde_json::json;

    #[test]
    fn test_action_envelope_shape() {
        let raw = json!({
            "type": "action",
            "payload": {"type": "move", "unitId": 3, "path": [{"x": 1, "y": 2}]},
            "seq": 7,
            "ts": 1700000000000i64
        });
        let envelope: ClientEnvelope = serde_json::from_value(raw).unwrap();

        assert_eq!(envelope.seq, 7);
        assert_eq!(
            envelope.message,
            ClientMessage::Action(Action::Move { unit_id: 3, path: vec![Position::new(1, 2)] })
        );
        assert_eq!(envelope.message.class(), MessageClass::Action);
    }

    #[test]
    fn test_unit_variant_without_payload() {
        let envelope = ClientEnvelope::from_json(r#"{"type":"request_sync","seq":1}"#).unwrap();
        assert_eq!(envelope.message, ClientMessage::RequestSync);
        assert_eq!(envelope.ts, 0);
    }

    #[test]
    fn test_dm_command_shape() {
        let envelope = ClientEnvelope::from_json(
            r#"{"type":"dm_command","payload":{"command":"grant_reward","userId":"bob","itemId":"gold","quantity":5},"seq":2}"#,
        )
        .unwrap();
        assert_eq!(
            envelope.message,
            ClientMessage::DmCommand(DmCommand::GrantReward {
                user_id: UserId::from("bob"),
                item_id: "gold".into(),
                quantity: 5,
            })
        );
    }

    #[test]
    fn test_rejection_reply_shape() {
        let reply = ServerEnvelope::reply(
            ServerMessage::ActionResult(ActionResult {
                valid: false,
                reason: Some(ActionRejection::OutOfRange),
                version: 4,
            }),
            10,
            7,
        );
        let value = serde_json::to_value(&reply).unwrap();

        assert_eq!(value["type"], "action_result");
        assert_eq!(value["payload"]["valid"], false);
        assert_eq!(value["payload"]["reason"], "OutOfRange");
        assert_eq!(value["reqSeq"], 7);
        assert_eq!(value["success"], false);
        assert!(value["error"].is_string());
    }

    #[test]
    fn test_push_has_no_reply_fields() {
        let push = ServerEnvelope::push(
            ServerMessage::TurnChange {
                current_user_id: Some(UserId::from("alice")),
                unit_id: 1,
                round: 2,
                time_limit_secs: None,
            },
            3,
        );
        let value = serde_json::to_value(&push).unwrap();

        assert_eq!(value["payload"]["currentUserId"], "alice");
        assert!(value.get("reqSeq").is_none());
        assert!(value.get("success").is_none());

        let back = ServerEnvelope::from_json(&push.to_json().unwrap()).unwrap();
        assert_eq!(back.message, push.message);
    }

    #[test]
    fn test_error_code_wire_name() {
        let error = ServerError::from(&SessionError::SessionFull);
        let value = serde_json::to_value(&error).unwrap();
        assert_eq!(value["code"], "SessionFull");
    }
}
