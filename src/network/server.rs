//! WebSocket Game Server
//!
//! Accepts WebSocket connections, authenticates them from the handshake,
//! and runs one task per connection that decodes client envelopes, rate
//! limits them and routes them to the lifecycle, pipeline and auth
//! handlers. Replies and pushes come back through the connection's
//! outbound queue.
//!
//! [`ServerContext`] holds everything the handlers share and is usable
//! without sockets: `open`, `handle_text` and `close` are exactly what a
//! connection task calls.

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tokio::time::{interval, Duration, Instant};
use tokio_tungstenite::{accept_async, accept_hdr_async};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use futures_util::{Sink, SinkExt, StreamExt};
use tracing::{debug, error, info, instrument, warn};

use crate::config::ServerConfig;
use crate::game::character::CharacterStore;
use crate::game::simulation::Simulation;
use crate::game::state::{ItemStack, UserId};
use crate::network::auth::{extract_token, AuthService, IdentityProvider};
use crate::network::gateway::{
    ConnectionGateway, ConnectionId, Outbound, CLOSE_AUTH_FAILED, CLOSE_GOING_AWAY, CLOSE_IDLE, CLOSE_NORMAL, CLOSE_TRY_AGAIN,
};
use crate::network::protocol::{
    now_ms, ClientEnvelope, ClientMessage, DmCommand, ErrorCode, ServerEnvelope, ServerError, ServerMessage,
};
use crate::network::rate_limit::RateLimiter;
use crate::network::token::{Identity, SessionTokenPayload};
use crate::network::{lifecycle, pipeline, reconnect};
use crate::session::registry::SessionRegistry;
use crate::session::session::SessionError;

/// Game server errors.
#[derive(Debug, thiserror::Error)]
pub enum GameServerError {
    /// Failed to bind to address.
    #[error("Failed to bind: {0}")]
    BindFailed(#[from] std::io::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Connection limit reached.
    #[error("Connection limit reached")]
    ConnectionLimitReached,
}

// =============================================================================
// SHARED CONTEXT
// =============================================================================

/// Everything the message handlers share.
pub struct ServerContext {
    /// Process configuration.
    pub config: Arc<ServerConfig>,
    /// Token and login operations.
    pub auth: AuthService,
    /// Sessions and memberships.
    pub registry: SessionRegistry,
    /// Identity to connection table.
    pub gateway: ConnectionGateway,
    /// Per-identity message budgets.
    pub limiter: RateLimiter,
    /// The combat simulation.
    pub simulation: Arc<dyn Simulation>,
    /// Character persistence.
    pub characters: Arc<dyn CharacterStore>,
}

/// An authenticated connection as seen by the dispatcher.
#[derive(Clone)]
pub struct Connection {
    /// Gateway connection id.
    pub id: ConnectionId,
    /// Who is connected.
    pub user: UserId,
    /// Their identity fields.
    pub identity: Identity,
    token: String,
}

/// What the connection task should do after a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Keep reading.
    Continue,
    /// Flush and close.
    Close,
}

impl ServerContext {
    /// Build the shared context.
    pub fn new(
        config: ServerConfig,
        simulation: Arc<dyn Simulation>,
        characters: Arc<dyn CharacterStore>,
        provider: Option<Arc<dyn IdentityProvider>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            auth: AuthService::new(config.auth.clone(), provider),
            registry: SessionRegistry::new(),
            gateway: ConnectionGateway::new(config.outbound_queue),
            limiter: RateLimiter::new(config.rate_limits.clone()),
            config: Arc::new(config),
            simulation,
            characters,
        })
    }

    /// Register an authenticated connection. If the identity still holds a
    /// session seat, it is rebound and brought up to date.
    pub async fn open(
        self: &Arc<Self>,
        payload: SessionTokenPayload,
        token: String,
    ) -> (Connection, mpsc::Receiver<Outbound>) {
        let user = payload.user_id();
        let identity = payload.identity();
        let (id, outbound) = self.gateway.register(&user).await;

        self.gateway
            .send(
                &user,
                ServerMessage::Authenticated { user: identity.clone(), server_version: self.config.version.clone() },
            )
            .await;
        let rebound = reconnect::on_connect(self, &user).await;
        debug!(user = %user, conn = id, rebound, "Connection opened");

        (Connection { id, user, identity, token }, outbound)
    }

    /// The connection is gone.
    pub async fn close(self: &Arc<Self>, conn: &Connection) {
        reconnect::on_disconnect(self, &conn.user, conn.id).await;
    }

    /// Decode, rate limit and dispatch one text frame.
    pub async fn handle_text(self: &Arc<Self>, conn: &mut Connection, text: &str) -> Flow {
        let envelope = match ClientEnvelope::from_json(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!(user = %conn.user, "Undecodable frame: {}", e);
                let error = ServerMessage::Error(ServerError::new(ErrorCode::InvalidMessage, e.to_string()));
                match request_seq(text) {
                    Some(seq) => self.gateway.reply(&conn.user, seq, error).await,
                    None => self.gateway.send(&conn.user, error).await,
                };
                return Flow::Continue;
            }
        };
        let ClientEnvelope { message, seq, .. } = envelope;

        if let Err(limited) = self.limiter.check(&conn.user, message.class()).await {
            debug!(user = %conn.user, message = message.name(), "Rate limited");
            let mut error = ServerError::new(ErrorCode::RateLimited, limited.to_string());
            error.retry_after_ms = Some(limited.retry_after.as_millis() as u64);
            self.gateway.reply(&conn.user, seq, ServerMessage::Error(error)).await;
            return Flow::Continue;
        }

        let name = message.name();
        let (reply, flow) = self.dispatch(conn, message).await;
        debug!(user = %conn.user, message = name, seq, "Handled");
        self.gateway.reply(&conn.user, seq, reply).await;
        flow
    }

    async fn dispatch(self: &Arc<Self>, conn: &mut Connection, message: ClientMessage) -> (ServerMessage, Flow) {
        let user = conn.user.clone();
        let reply = match message {
            ClientMessage::CreateGame { character_id, settings } => session_reply(
                lifecycle::create_game(self, &user, conn.identity.display_name.clone(), character_id, settings).await,
            ),
            ClientMessage::JoinGame { join_code, character_id } => session_reply(
                lifecycle::join_game(self, &user, conn.identity.display_name.clone(), &join_code, character_id).await,
            ),
            ClientMessage::SetReady { ready } => ack(lifecycle::set_ready(self, &user, ready).await),
            ClientMessage::StartGame => ack(lifecycle::start_game(self, &user).await),
            ClientMessage::LeaveGame => ack(lifecycle::leave_game(self, &user).await),
            ClientMessage::Action(action) => {
                ServerMessage::ActionResult(pipeline::handle_action(self, &user, action).await)
            }
            ClientMessage::Chat { text, to } => {
                if text.trim().is_empty() {
                    ServerMessage::Error(ServerError::new(ErrorCode::InvalidMessage, "empty chat line"))
                } else {
                    ack(lifecycle::chat(self, &user, &text, to.as_ref()).await)
                }
            }
            ClientMessage::DmCommand(command) => self.dm_command(&user, command).await,
            ClientMessage::RequestSync => match pipeline::request_sync(self, &user).await {
                Ok(full_state) => full_state,
                Err(e) => ServerMessage::Error(e),
            },
            ClientMessage::Ping { client_time } => ServerMessage::Pong { client_time, server_time: now_ms() },
            ClientMessage::AuthStatus => ServerMessage::AuthStatus(self.auth.status(Some(&conn.token))),
            ClientMessage::RefreshSession => match self.auth.refresh(&conn.token) {
                Ok(issued) => {
                    conn.token = issued.token;
                    info!(user = %user, "Session refreshed");
                    ServerMessage::SessionRefreshed { expires_at: issued.payload.exp }
                }
                Err(e) => ServerMessage::Error(ServerError::new(ErrorCode::AuthFailed, e.to_string())),
            },
            ClientMessage::Logout { everywhere } => {
                let logged_out = self.auth.logout(Some(&conn.token), everywhere, "/");
                info!(user = %user, everywhere, "Logged out");
                let reply = ServerMessage::LoggedOut { provider_logout_url: logged_out.provider_logout_url };
                return (reply, Flow::Close);
            }
        };
        (reply, Flow::Continue)
    }

    async fn dm_command(self: &Arc<Self>, user: &UserId, command: DmCommand) -> ServerMessage {
        let result = match command {
            DmCommand::StartGame => lifecycle::start_game(self, user).await.map_err(|e| ServerError::from(&e)),
            DmCommand::Pause => lifecycle::pause(self, user).await.map_err(|e| ServerError::from(&e)),
            DmCommand::Resume => lifecycle::resume(self, user).await.map_err(|e| ServerError::from(&e)),
            DmCommand::ForceEndTurn => pipeline::force_end_turn(self, user).await,
            DmCommand::GrantReward { user_id, item_id, quantity } => {
                pipeline::grant_reward(self, user, &user_id, ItemStack { item_id, quantity }).await
            }
            DmCommand::KickPlayer { user_id } => {
                lifecycle::kick_player(self, user, &user_id).await.map_err(|e| ServerError::from(&e))
            }
            DmCommand::EndSession { reason } => {
                lifecycle::end_by_dm(self, user, reason).await.map_err(|e| ServerError::from(&e))
            }
        };
        match result {
            Ok(()) => ServerMessage::Ack,
            Err(e) => ServerMessage::Error(e),
        }
    }
}

fn ack(result: Result<(), SessionError>) -> ServerMessage {
    match result {
        Ok(()) => ServerMessage::Ack,
        Err(e) => ServerMessage::Error(ServerError::from(&e)),
    }
}

fn session_reply(result: Result<ServerMessage, SessionError>) -> ServerMessage {
    result.unwrap_or_else(|e| ServerMessage::Error(ServerError::from(&e)))
}

/// Best-effort `seq` from a frame that failed to decode, so the error can
/// still be correlated.
fn request_seq(text: &str) -> Option<u64> {
    serde_json::from_str::<serde_json::Value>(text).ok()?.get("seq")?.as_u64()
}

// =============================================================================
// SOCKET SERVER
// =============================================================================

/// The game server.
pub struct GameServer {
    ctx: Arc<ServerContext>,
    shutdown_tx: broadcast::Sender<()>,
}

impl GameServer {
    /// Create a new game server.
    pub fn new(ctx: Arc<ServerContext>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self { ctx, shutdown_tx }
    }

    /// Shared context.
    pub fn context(&self) -> &Arc<ServerContext> {
        &self.ctx
    }

    /// Run the server until shutdown.
    #[instrument(skip(self))]
    pub async fn run(&self) -> Result<(), GameServerError> {
        let listener = TcpListener::bind(self.ctx.config.bind_addr).await?;
        info!("Game server listening on {}", self.ctx.config.bind_addr);

        let mut connections = JoinSet::new();
        let mut prune = interval(Duration::from_secs(60));
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            if connections.len() >= self.ctx.config.max_connections {
                                warn!("{}, rejecting {}", GameServerError::ConnectionLimitReached, addr);
                                tokio::spawn(async move {
                                    let rejected = tokio::time::timeout(Duration::from_secs(5), reject_connection(stream)).await;
                                    if let Ok(Err(e)) = rejected {
                                        debug!("Rejecting {} failed: {}", addr, e);
                                    }
                                });
                                continue;
                            }
                            debug!("New connection from {}", addr);
                            let ctx = Arc::clone(&self.ctx);
                            let shutdown_rx = self.shutdown_tx.subscribe();
                            connections.spawn(async move {
                                if let Err(e) = serve_connection(ctx, stream, addr, shutdown_rx).await {
                                    debug!("Connection {} ended with error: {}", addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                _ = prune.tick() => {
                    self.ctx.limiter.prune().await;
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        let drained = tokio::time::timeout(Duration::from_secs(5), async {
            while connections.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!("Connections still open after shutdown grace, aborting");
        }
        Ok(())
    }

    /// Tell every client the server is going down, then stop.
    pub async fn shutdown(&self, reason: &str) {
        self.ctx
            .gateway
            .broadcast_all(ServerMessage::Shutdown { reason: reason.to_string() })
            .await;
        let _ = self.shutdown_tx.send(());
    }
}

fn close_message(code: u16, reason: &str) -> Message {
    Message::Close(Some(CloseFrame { code: CloseCode::from(code), reason: reason.to_string().into() }))
}

/// Complete the handshake only to tell the client the server is full.
async fn reject_connection(stream: TcpStream) -> Result<(), GameServerError> {
    let mut ws = accept_async(stream).await?;
    let reason = GameServerError::ConnectionLimitReached.to_string();
    ws.send(close_message(CLOSE_TRY_AGAIN, &reason)).await?;
    while let Some(Ok(_)) = ws.next().await {}
    Ok(())
}

/// Send whatever frames are already queued.
async fn flush<S>(sink: &mut S, outbound: &mut mpsc::Receiver<Outbound>)
where
    S: Sink<Message> + Unpin,
{
    while let Ok(Outbound::Frame(json)) = outbound.try_recv() {
        if sink.send(Message::Text(json)).await.is_err() {
            return;
        }
    }
}

async fn serve_connection(
    ctx: Arc<ServerContext>,
    stream: TcpStream,
    addr: SocketAddr,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), GameServerError> {
    let cookie_name = ctx.auth.cookie_name().to_string();
    let mut presented = None;
    let capture = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        presented = extract_token(request, &cookie_name);
        Ok(response)
    };
    let ws = accept_hdr_async(stream, capture).await?;
    let (mut sink, mut incoming) = ws.split();

    let verified = match presented {
        Some(token) => ctx
            .auth
            .verify(&token)
            .map(|payload| (payload, token))
            .map_err(|e| e.to_string()),
        None => Err("no session token presented".to_string()),
    };
    let (payload, token) = match verified {
        Ok(verified) => verified,
        Err(reason) => {
            warn!(%addr, "Authentication failed: {}", reason);
            let frame = ServerEnvelope::push(ServerMessage::Error(ServerError::new(ErrorCode::AuthFailed, &reason)), 0);
            if let Ok(json) = frame.to_json() {
                let _ = sink.send(Message::Text(json)).await;
            }
            let _ = sink.send(close_message(CLOSE_AUTH_FAILED, &reason)).await;
            return Ok(());
        }
    };

    let (mut conn, mut outbound) = ctx.open(payload, token).await;
    info!(%addr, user = %conn.user, "Connection authenticated");

    let mut last_seen = Instant::now();
    let closing = loop {
        let idle_deadline = last_seen + ctx.config.idle_timeout;
        tokio::select! {
            frame = incoming.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    last_seen = Instant::now();
                    if ctx.handle_text(&mut conn, &text).await == Flow::Close {
                        break Some((CLOSE_NORMAL, "logged out"));
                    }
                }
                Some(Ok(Message::Close(_))) | None => break None,
                Some(Ok(_)) => last_seen = Instant::now(),
                Some(Err(e)) => {
                    debug!(%addr, "Read error: {}", e);
                    break None;
                }
            },
            item = outbound.recv() => match item {
                Some(Outbound::Frame(json)) => {
                    if sink.send(Message::Text(json)).await.is_err() {
                        break None;
                    }
                }
                Some(Outbound::Close { code, reason }) => {
                    let _ = sink.send(close_message(code, &reason)).await;
                    break None;
                }
                None => break None,
            },
            _ = tokio::time::sleep_until(idle_deadline) => break Some((CLOSE_IDLE, "idle timeout")),
            _ = shutdown_rx.recv() => break Some((CLOSE_GOING_AWAY, "server shutting down")),
        }
    };

    if let Some((code, reason)) = closing {
        flush(&mut sink, &mut outbound).await;
        let _ = sink.send(close_message(code, reason)).await;
    }
    info!(%addr, user = %conn.user, "Connection closed");
    ctx.close(&conn).await;
    Ok(())
}
