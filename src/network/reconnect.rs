//! Reconnection Manager
//!
//! A dropped connection keeps its session slot for `reconnect_grace`. A new
//! authenticated connection for the same identity inside that window is
//! rebound to the session and brought up to date with a full snapshot.
//! Past the window the player is removed as if they had left.

use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::game::state::UserId;
use crate::network::gateway::ConnectionId;
use crate::network::lifecycle;
use crate::network::pipeline;
use crate::network::protocol::{LeaveReason, ServerMessage};
use crate::network::server::ServerContext;
use crate::session::session::{SessionId, SessionState};

/// A connection for `user` was just registered. Returns true when it was
/// rebound to an existing session.
pub async fn on_connect(ctx: &Arc<ServerContext>, user: &UserId) -> bool {
    let Some((session_id, shared)) = ctx.registry.session_for(user).await else {
        return false;
    };
    let mut session = shared.lock().await;
    if !session.mark_connected(user) {
        return false;
    }
    info!(session = %session_id, user = %user, "Player reconnected");

    ctx.gateway
        .broadcast(&session, ServerMessage::PlayerConnection { user_id: user.clone(), connected: true }, Some(user))
        .await;
    ctx.gateway.send(user, ServerMessage::LobbyState(session.lobby_view())).await;
    pipeline::send_full_state(ctx, &session, user).await;

    let current_turn = session
        .world()
        .and_then(|w| w.state().combat.turn.map(|t| (t.unit_id, w.state().combat.round)));
    if let Some((unit_id, round)) = current_turn {
        ctx.gateway.send(user, pipeline::turn_change_message(&session, unit_id, round)).await;
        let controls_turn = session.acting_controller().map_or(false, |p| &p.user_id == user);
        if controls_turn && session.state == SessionState::Playing {
            pipeline::schedule_turn_timer(ctx, &mut session);
        }
    }
    true
}

/// Connection `conn` of `user` closed. Stale connections (already replaced
/// or closed by the server) are ignored.
pub async fn on_disconnect(ctx: &Arc<ServerContext>, user: &UserId, conn: ConnectionId) {
    if !ctx.gateway.unregister(user, conn).await {
        debug!(user = %user, conn, "Stale connection closed");
        return;
    }
    let Some((session_id, shared)) = ctx.registry.session_for(user).await else {
        return;
    };
    let mut session = shared.lock().await;
    let since = Instant::now();
    if !session.mark_disconnected(user, since) {
        return;
    }
    info!(session = %session_id, user = %user, "Player disconnected, holding slot");

    ctx.gateway
        .broadcast(&session, ServerMessage::PlayerConnection { user_id: user.clone(), connected: false }, None)
        .await;

    let controls_turn = session.acting_controller().map_or(false, |p| &p.user_id == user);
    if controls_turn && session.state == SessionState::Playing {
        pipeline::schedule_turn_timer(ctx, &mut session);
    }

    let ctx = Arc::clone(ctx);
    let user = user.clone();
    let grace = ctx.config.reconnect_grace;
    tokio::spawn(async move {
        tokio::time::sleep(grace).await;
        expire(&ctx, session_id, &user, since).await;
    });
}

/// Grace window over: drop `user` unless they came back (or dropped again
/// later, which starts a new window).
pub async fn expire(ctx: &Arc<ServerContext>, session_id: SessionId, user: &UserId, since: Instant) {
    let Some(shared) = ctx.registry.get(&session_id).await else {
        return;
    };
    let mut session = shared.lock().await;
    let still_away = session
        .player(user)
        .map_or(false, |p| !p.connected && p.disconnected_at == Some(since));
    if !still_away {
        return;
    }

    info!(session = %session_id, user = %user, "Reconnect grace expired");
    if let Err(e) = lifecycle::remove_member(ctx, &mut session, user, LeaveReason::TimedOut).await {
        warn!(session = %session_id, user = %user, "Could not drop expired player: {}", e);
    }
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

    fn messages(rx: &mut mpsc::Receiver<Outbound>) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(item) = rx.try_recv() {
            if let Outbound::Frame(json) = item {
                out.push(ServerEnvelope::from_json(&json).unwrap().message);
            }
        }
        out
    }

    async fn lobby(ctx: &Arc<ServerContext>) -> (ConnectionId, mpsc::Receiver<Outbound>, mpsc::Receiver<Outbound>) {
        let dm = UserId::from("dm");
        let p1 = UserId::from("p1");
        let (_, dm_rx) = ctx.gateway.register(&dm).await;
        let (p1_conn, p1_rx) = ctx.gateway.register(&p1).await;
        let code = match lifecycle::create_game(ctx, &dm, "DM".into(), None, None).await.unwrap() {
            ServerMessage::GameCreated { join_code, .. } => join_code,
            other => panic!("unexpected {:?}", other),
        };
        lifecycle::join_game(ctx, &p1, "P1".into(), &code, None).await.unwrap();
        (p1_conn, dm_rx, p1_rx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_within_grace_keeps_slot() {
        let ctx = context();
        let p1 = UserId::from("p1");
        let (p1_conn, mut dm_rx, _p1_rx) = lobby(&ctx).await;
        messages(&mut dm_rx);

        on_disconnect(&ctx, &p1, p1_conn).await;
        assert!(messages(&mut dm_rx)
            .iter()
            .any(|m| matches!(m, ServerMessage::PlayerConnection { connected: false, .. })));

        tokio::time::sleep(ctx.config.reconnect_grace / 2).await;
        let (_, mut p1_rx) = ctx.gateway.register(&p1).await;
        assert!(on_connect(&ctx, &p1).await);
        assert!(matches!(messages(&mut p1_rx).first(), Some(ServerMessage::LobbyState(_))));

        // The original window passes without removing the player.
        tokio::time::sleep(ctx.config.reconnect_grace).await;
        let (_, shared) = ctx.registry.session_for(&p1).await.unwrap();
        assert!(shared.lock().await.player(&p1).unwrap().connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_grace_expiry_removes_player() {
        let ctx = context();
        let p1 = UserId::from("p1");
        let (p1_conn, mut dm_rx, _p1_rx) = lobby(&ctx).await;
        messages(&mut dm_rx);

        on_disconnect(&ctx, &p1, p1_conn).await;
        tokio::time::sleep(ctx.config.reconnect_grace + std::time::Duration::from_millis(10)).await;

        assert!(ctx.registry.session_for(&p1).await.is_none());
        assert!(messages(&mut dm_rx)
            .iter()
            .any(|m| matches!(m, ServerMessage::PlayerLeft { reason: LeaveReason::TimedOut, .. })));
        assert!(!on_connect(&ctx, &p1).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_replaced_connection_close_is_ignored() {
        let ctx = context();
        let p1 = UserId::from("p1");
        let (old_conn, _dm_rx, _old_rx) = lobby(&ctx).await;

        let (_, _new_rx) = ctx.gateway.register(&p1).await;
        on_disconnect(&ctx, &p1, old_conn).await;

        let (_, shared) = ctx.registry.session_for(&p1).await.unwrap();
        assert!(shared.lock().await.player(&p1).unwrap().connected);
    }
}
