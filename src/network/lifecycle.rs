//! Session lifecycle operations.
//!
//! Create, join, ready, start, leave, and the DM's session-level commands.
//! Each call locks one session, applies the change through `Session`, then
//! tells the members. Member removal and session end are shared with the
//! reconnection grace path.

use std::sync::Arc;
use tracing::{info, warn};

use crate::game::events::TurnEndReason;
use crate::game::state::UserId;
use crate::network::gateway::CLOSE_SESSION_ENDED;
use crate::network::pipeline::{self, Committed};
use crate::network::protocol::{LeaveReason, ServerMessage};
use crate::network::server::ServerContext;
use crate::session::session::{Session, SessionError, SessionSettings, SessionState};
use crate::session::SharedSession;

/// Longest chat line kept; the rest is cut.
pub const MAX_CHAT_LEN: usize = 500;

async fn own_session(ctx: &ServerContext, user: &UserId) -> Result<SharedSession, SessionError> {
    ctx.registry
        .session_for(user)
        .await
        .map(|(_, shared)| shared)
        .ok_or(SessionError::NotInSession)
}

async fn broadcast_lobby(ctx: &ServerContext, session: &Session) {
    ctx.gateway
        .broadcast(session, ServerMessage::LobbyState(session.lobby_view()), None)
        .await;
}

// =============================================================================
// LOBBY
// =============================================================================

/// Open a new session with `user` as DM.
pub async fn create_game(
    ctx: &ServerContext,
    user: &UserId,
    display_name: String,
    character_id: Option<String>,
    settings: Option<SessionSettings>,
) -> Result<ServerMessage, SessionError> {
    let mut settings = settings.unwrap_or(ctx.config.default_settings);
    settings.max_players = settings.max_players.max(1);

    let created = ctx
        .registry
        .create_session(user, display_name, character_id, settings)
        .await?;
    broadcast_lobby(ctx, &*created.session.lock().await).await;

    Ok(ServerMessage::GameCreated { session_id: created.session_id, join_code: created.join_code })
}

/// Join a session by code.
pub async fn join_game(
    ctx: &ServerContext,
    user: &UserId,
    display_name: String,
    join_code: &str,
    character_id: Option<String>,
) -> Result<ServerMessage, SessionError> {
    let (session_id, shared) = ctx
        .registry
        .join_session(join_code, user, display_name, character_id)
        .await?;
    let session = shared.lock().await;
    broadcast_lobby(ctx, &session).await;

    Ok(ServerMessage::GameJoined { session_id, join_code: session.join_code.clone() })
}

/// Toggle the caller's ready flag.
pub async fn set_ready(ctx: &ServerContext, user: &UserId, ready: bool) -> Result<(), SessionError> {
    let shared = own_session(ctx, user).await?;
    let mut session = shared.lock().await;
    session.set_ready(user, ready)?;
    broadcast_lobby(ctx, &session).await;
    Ok(())
}

/// DM starts play: build the world, send everyone their snapshot, open the
/// first turn.
pub async fn start_game(ctx: &Arc<ServerContext>, user: &UserId) -> Result<(), SessionError> {
    let shared = own_session(ctx, user).await?;
    let mut session = shared.lock().await;
    let change = session.start_game(user, ctx.simulation.as_ref(), ctx.characters.as_ref())?;
    info!(session = %session.id, players = session.players().len(), "Game started");

    broadcast_lobby(ctx, &session).await;
    for member in session.member_ids() {
        pipeline::send_full_state(ctx, &session, &member).await;
    }
    if let Some(change) = change {
        pipeline::announce_turn(ctx, &mut session, &change).await;
    }
    Ok(())
}

/// Caller leaves for good.
pub async fn leave_game(ctx: &Arc<ServerContext>, user: &UserId) -> Result<(), SessionError> {
    let shared = own_session(ctx, user).await?;
    let mut session = shared.lock().await;
    remove_member(ctx, &mut session, user, LeaveReason::Left).await
}

// =============================================================================
// DM COMMANDS
// =============================================================================

/// DM pauses play. Outstanding turn timers are cancelled.
pub async fn pause(ctx: &ServerContext, user: &UserId) -> Result<(), SessionError> {
    let shared = own_session(ctx, user).await?;
    let mut session = shared.lock().await;
    session.pause(user)?;
    session.next_turn_serial();
    info!(session = %session.id, "Session paused");
    broadcast_lobby(ctx, &session).await;
    Ok(())
}

/// DM resumes play. The current turn gets a fresh timer.
pub async fn resume(ctx: &Arc<ServerContext>, user: &UserId) -> Result<(), SessionError> {
    let shared = own_session(ctx, user).await?;
    let mut session = shared.lock().await;
    session.resume(user)?;
    info!(session = %session.id, "Session resumed");
    broadcast_lobby(ctx, &session).await;
    pipeline::schedule_turn_timer(ctx, &mut session);
    Ok(())
}

/// DM removes a member.
pub async fn kick_player(ctx: &Arc<ServerContext>, user: &UserId, target: &UserId) -> Result<(), SessionError> {
    let shared = own_session(ctx, user).await?;
    let mut session = shared.lock().await;
    session.ensure_dm(user)?;
    if session.player(target).is_none() {
        return Err(SessionError::NotInSession);
    }
    info!(session = %session.id, target = %target, "Player kicked");
    remove_member(ctx, &mut session, target, LeaveReason::Kicked).await
}

/// DM ends the session.
pub async fn end_by_dm(ctx: &ServerContext, user: &UserId, reason: Option<String>) -> Result<(), SessionError> {
    let shared = own_session(ctx, user).await?;
    let mut session = shared.lock().await;
    session.ensure_dm(user)?;
    let reason = reason.unwrap_or_else(|| "ended by the DM".to_string());
    end_session(ctx, &mut session, &reason).await;
    Ok(())
}

/// Chat within the caller's session, to everyone or whispered to one
/// member. Works in every state, paused included.
pub async fn chat(ctx: &ServerContext, user: &UserId, text: &str, to: Option<&UserId>) -> Result<(), SessionError> {
    let shared = own_session(ctx, user).await?;
    let session = shared.lock().await;

    let text: String = text.trim().chars().take(MAX_CHAT_LEN).collect();
    match to {
        Some(target) => {
            if session.player(target).is_none() {
                return Err(SessionError::NotInSession);
            }
            let line = ServerMessage::Chat { from: user.clone(), text, whisper: true };
            ctx.gateway.send(target, line.clone()).await;
            if target != user {
                ctx.gateway.send(user, line).await;
            }
        }
        None => {
            let line = ServerMessage::Chat { from: user.clone(), text, whisper: false };
            ctx.gateway.broadcast(&session, line, None).await;
        }
    }
    Ok(())
}

// =============================================================================
// SHARED TEARDOWN
// =============================================================================

/// Remove a member and deal with the consequences: their unit goes to the
/// DM, an open turn of theirs ends, the DM role moves on, an empty session
/// ends.
pub(crate) async fn remove_member(
    ctx: &Arc<ServerContext>,
    session: &mut Session,
    user: &UserId,
    reason: LeaveReason,
) -> Result<(), SessionError> {
    let departure = session.remove_player(user)?;
    ctx.registry.unbind(user, session.id).await;

    let notice = ServerMessage::PlayerLeft { user_id: user.clone(), reason };
    if reason == LeaveReason::Kicked {
        ctx.gateway.send(user, notice.clone()).await;
    }
    ctx.gateway.broadcast(session, notice, None).await;

    if departure.now_empty {
        end_session(ctx, session, "all players left").await;
        return Ok(());
    }

    if let Some((delta, event)) = departure.orphaned {
        pipeline::publish(ctx, session, Committed { delta, events: vec![event], change: None }).await;
    }

    let playing = session.state == SessionState::Playing;
    if departure.was_acting && playing {
        let turn_reason = match reason {
            LeaveReason::Kicked => TurnEndReason::Forced,
            LeaveReason::Left | LeaveReason::TimedOut => TurnEndReason::Disconnected,
        };
        if let Err(e) = pipeline::end_current_turn(ctx, session, turn_reason).await {
            warn!(session = %session.id, "Departed player's turn could not end: {}", e);
        }
    } else if departure.new_dm.is_some() && playing {
        // An unowned unit may be acting; its controller just changed.
        pipeline::schedule_turn_timer(ctx, session);
    }

    broadcast_lobby(ctx, session).await;
    Ok(())
}

/// End a session: persist characters, tell and disconnect every member,
/// free the join code.
pub(crate) async fn end_session(ctx: &ServerContext, session: &mut Session, reason: &str) {
    if let Err(e) = session.end(ctx.characters.as_ref()) {
        warn!(session = %session.id, "Session end refused: {}", e);
        return;
    }
    info!(session = %session.id, reason, "Session ended");

    ctx.gateway
        .broadcast(session, ServerMessage::SessionEnded { reason: reason.to_string() }, None)
        .await;
    for member in session.member_ids() {
        ctx.gateway.close(&member, CLOSE_SESSION_ENDED, reason).await;
    }
    ctx.registry.release(session).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::game::character::InMemoryCharacterStore;
    use crate::game::simulation::SkirmishSimulation;
    use crate::network::gateway::Outbound;
    use crate::network::protocol::ServerEnvelope;
    use tokio::sync::mpsc;

    fn context() -> Arc<ServerContext> {
        ServerContext::new(
            ServerConfig::for_tests(),
            Arc::new(SkirmishSimulation::new()),
            Arc::new(InMemoryCharacterStore::new()),
            None,
        )
    }

    fn drain(rx: &mut mpsc::Receiver<Outbound>) -> Vec<Outbound> {
        let mut out = Vec::new();
        while let Ok(item) = rx.try_recv() {
            out.push(item);
        }
        out
    }

    fn messages(items: &[Outbound]) -> Vec<ServerMessage> {
        items
            .iter()
            .filter_map(|item| match item {
                Outbound::Frame(json) => Some(ServerEnvelope::from_json(json).unwrap().message),
                Outbound::Close { .. } => None,
            })
            .collect()
    }

    async fn lobby_of_two(ctx: &Arc<ServerContext>) -> (String, mpsc::Receiver<Outbound>, mpsc::Receiver<Outbound>) {
        let dm = UserId::from("dm");
        let p1 = UserId::from("p1");
        let (_, dm_rx) = ctx.gateway.register(&dm).await;
        let (_, p1_rx) = ctx.gateway.register(&p1).await;

        let code = match create_game(ctx, &dm, "DM".into(), None, None).await.unwrap() {
            ServerMessage::GameCreated { join_code, .. } => join_code,
            other => panic!("unexpected {:?}", other),
        };
        join_game(ctx, &p1, "P1".into(), &code.to_lowercase(), None).await.unwrap();
        (code, dm_rx, p1_rx)
    }

    #[tokio::test]
    async fn test_lobby_flow_and_start() {
        let ctx = context();
        let (_, mut dm_rx, mut p1_rx) = lobby_of_two(&ctx).await;
        let dm = UserId::from("dm");
        let p1 = UserId::from("p1");

        assert!(matches!(start_game(&ctx, &dm).await, Err(SessionError::NotReady)));
        set_ready(&ctx, &dm, true).await.unwrap();
        set_ready(&ctx, &p1, true).await.unwrap();
        assert!(matches!(start_game(&ctx, &p1).await, Err(SessionError::NotDm)));

        drain(&mut dm_rx);
        drain(&mut p1_rx);
        start_game(&ctx, &dm).await.unwrap();

        let received = messages(&drain(&mut p1_rx));
        assert!(matches!(&received[0], ServerMessage::LobbyState(view) if view.state == SessionState::Playing));
        assert!(matches!(&received[1], ServerMessage::FullState { version: 1, your_unit_id: Some(_), .. }));
        assert!(matches!(&received[2], ServerMessage::TurnChange { round: 1, .. }));
    }

    #[tokio::test]
    async fn test_chat_whisper_reaches_only_target_and_sender() {
        let ctx = context();
        let (_, mut dm_rx, mut p1_rx) = lobby_of_two(&ctx).await;
        let p2 = UserId::from("p2");
        let (_, mut p2_rx) = ctx.gateway.register(&p2).await;
        let code = ctx.registry.session_for(&UserId::from("dm")).await.unwrap().1.lock().await.join_code.clone();
        join_game(&ctx, &p2, "P2".into(), &code, None).await.unwrap();
        drain(&mut dm_rx);
        drain(&mut p1_rx);
        drain(&mut p2_rx);

        chat(&ctx, &UserId::from("p1"), "  psst ", Some(&UserId::from("dm"))).await.unwrap();

        assert!(matches!(&messages(&drain(&mut dm_rx))[0], ServerMessage::Chat { whisper: true, text, .. } if text == "psst"));
        assert_eq!(messages(&drain(&mut p1_rx)).len(), 1);
        assert!(drain(&mut p2_rx).is_empty());
    }

    #[tokio::test]
    async fn test_dm_leaving_hands_off_role() {
        let ctx = context();
        let (_, _dm_rx, mut p1_rx) = lobby_of_two(&ctx).await;
        drain(&mut p1_rx);

        leave_game(&ctx, &UserId::from("dm")).await.unwrap();

        let received = messages(&drain(&mut p1_rx));
        assert!(matches!(&received[0], ServerMessage::PlayerLeft { reason: LeaveReason::Left, .. }));
        match received.last() {
            Some(ServerMessage::LobbyState(view)) => {
                assert_eq!(view.players.len(), 1);
                assert!(view.players[0].is_dm);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(ctx.registry.session_for(&UserId::from("dm")).await.is_none());
    }

    #[tokio::test]
    async fn test_kick_and_end_session() {
        let ctx = context();
        let (code, mut dm_rx, mut p1_rx) = lobby_of_two(&ctx).await;
        let dm = UserId::from("dm");
        let p1 = UserId::from("p1");

        assert!(matches!(kick_player(&ctx, &p1, &dm).await, Err(SessionError::NotDm)));
        kick_player(&ctx, &dm, &p1).await.unwrap();
        assert!(messages(&drain(&mut p1_rx))
            .iter()
            .any(|m| matches!(m, ServerMessage::PlayerLeft { reason: LeaveReason::Kicked, .. })));

        drain(&mut dm_rx);
        end_by_dm(&ctx, &dm, None).await.unwrap();

        let items = drain(&mut dm_rx);
        assert!(matches!(&messages(&items)[0], ServerMessage::SessionEnded { .. }));
        assert!(matches!(items.last(), Some(Outbound::Close { code: CLOSE_SESSION_ENDED, .. })));
        assert_eq!(ctx.registry.session_count().await, 0);

        // The code is free again and the ended session cannot be joined.
        let late = join_game(&ctx, &p1, "P1".into(), &code, None).await;
        assert!(matches!(late, Err(SessionError::SessionNotFound)));
    }

    #[tokio::test]
    async fn test_last_member_leaving_ends_session() {
        let ctx = context();
        let dm = UserId::from("dm");
        create_game(&ctx, &dm, "DM".into(), None, None).await.unwrap();
        leave_game(&ctx, &dm).await.unwrap();
        assert_eq!(ctx.registry.session_count().await, 0);
    }
}
