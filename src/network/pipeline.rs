//! Action Pipeline
//!
//! Everything that changes a running world goes through here: player
//! actions, forced and timed-out turn ends, DM rewards. Each path validates,
//! builds the next state outside the synchronizer, commits it as one
//! version, then publishes delta, events and any turn change to the
//! session's members.
//!
//! Turn timers live here too. Every scheduling bumps the session's turn
//! serial; a timer that wakes up to a different serial is stale and does
//! nothing.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tokio::time::Duration;
use tracing::{debug, error, info, instrument, warn};

use crate::game::action::Action;
use crate::game::events::{GameEvent, TurnEndReason};
use crate::game::rules::{self, ActionRejection};
use crate::game::simulation::{SimOutcome, Simulation};
use crate::game::state::{CombatPhase, GameState, ItemStack, UnitId, UserId};
use crate::network::protocol::{ActionResult, ErrorCode, ServerError, ServerMessage};
use crate::network::server::ServerContext;
use crate::session::session::{Session, SessionError, SessionId, SessionState};
use crate::session::turn::{self, TurnChange};
use crate::sync::{Delta, StateVersion};

/// One committed version and what to tell members about it.
pub(crate) struct Committed {
    pub delta: Delta,
    pub events: Vec<GameEvent>,
    pub change: Option<TurnChange>,
}

// =============================================================================
// ACTIONS
// =============================================================================

/// Validate and apply one action from `user`.
///
/// Rejections never touch state; the reply carries the version the caller
/// should already hold.
#[instrument(skip(ctx, action), fields(action = action.name(), unit = action.unit_id()))]
pub async fn handle_action(ctx: &Arc<ServerContext>, user: &UserId, action: Action) -> ActionResult {
    let Some((_, shared)) = ctx.registry.session_for(user).await else {
        return rejected(ActionRejection::NotInSession, 0);
    };
    let mut session = shared.lock().await;
    let version = session.world().map_or(0, |w| w.version());

    match apply_action(ctx, &mut session, user, &action).await {
        Ok(version) => ActionResult { valid: true, reason: None, version },
        Err(reason) => {
            debug!(user = %user, "Action rejected: {}", reason);
            rejected(reason, version)
        }
    }
}

fn rejected(reason: ActionRejection, version: StateVersion) -> ActionResult {
    ActionResult { valid: false, reason: Some(reason), version }
}

async fn apply_action(
    ctx: &Arc<ServerContext>,
    session: &mut Session,
    user: &UserId,
    action: &Action,
) -> Result<StateVersion, ActionRejection> {
    match session.state {
        SessionState::Playing => {}
        SessionState::Paused => return Err(ActionRejection::SessionPaused),
        _ => return Err(ActionRejection::NotPlaying),
    }

    let caller_is_dm = session.is_dm(user);
    let world = session.world().ok_or(ActionRejection::NotPlaying)?;
    let state = world.state();
    if state.combat.phase != CombatPhase::InProgress {
        return Err(ActionRejection::CombatOver);
    }

    let acting = *turn::validate_acting_unit(&state.combat, action.unit_id())?;
    rules::check_control(state, action.unit_id(), user, caller_is_dm)?;
    rules::validate_action(state, &acting, action)?;

    let (outcome, verdict) = run_simulation(ctx.simulation.as_ref(), state, action)?;
    let SimOutcome { state: mut next, mut events } = outcome;

    let turn_over = turn::record_action(&mut next.combat, action);
    let mut change = None;
    if let Some(phase) = verdict {
        turn::finish_combat(&mut next, phase);
        events.push(GameEvent::CombatEnded { phase });
        info!(session = %session.id, ?phase, "Combat finished");
    } else if turn_over {
        let reason = match action {
            Action::EndTurn { .. } => TurnEndReason::EndTurn,
            _ => TurnEndReason::BudgetExhausted,
        };
        events.push(GameEvent::TurnEnded { unit_id: acting.unit_id, reason });
        change = advance_turn(&mut next, &mut events);
    }

    let delta = commit(session, next)?;
    let version = delta.to_version;
    publish(ctx, session, Committed { delta, events, change }).await;
    Ok(version)
}

/// Run the simulation with panics contained. A panicking or refusing
/// simulation is a rejected action, never a dead session.
fn run_simulation(
    simulation: &dyn Simulation,
    state: &GameState,
    action: &Action,
) -> Result<(SimOutcome, Option<CombatPhase>), ActionRejection> {
    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        simulation.apply(state, action).map(|outcome| {
            let verdict = simulation.evaluate(&outcome.state);
            (outcome, verdict)
        })
    }));

    match result {
        Ok(Ok(applied)) => Ok(applied),
        Ok(Err(e)) => {
            warn!(action = action.name(), "Simulation refused action: {}", e);
            Err(ActionRejection::SimulationFailed)
        }
        Err(_) => {
            error!(action = action.name(), "Simulation panicked");
            Err(ActionRejection::SimulationFailed)
        }
    }
}

fn commit(session: &mut Session, next: GameState) -> Result<Delta, ActionRejection> {
    let session_id = session.id;
    let world = session.world_mut().ok_or(ActionRejection::NotPlaying)?;
    world.commit(move |_| Ok(next)).map_err(|e| {
        error!(session = %session_id, "Commit failed: {}", e);
        ActionRejection::SimulationFailed
    })
}

/// Start the next turn inside `next`, recording the matching events.
fn advance_turn(next: &mut GameState, events: &mut Vec<GameEvent>) -> Option<TurnChange> {
    let change = turn::advance(next)?;
    if change.new_round {
        events.push(GameEvent::RoundStarted { round: change.round });
    }
    events.push(GameEvent::TurnStarted { unit_id: change.unit_id, round: change.round });
    Some(change)
}

// =============================================================================
// TURN ENDS AND REWARDS
// =============================================================================

/// End the acting unit's turn without an action.
pub(crate) async fn end_current_turn(
    ctx: &Arc<ServerContext>,
    session: &mut Session,
    reason: TurnEndReason,
) -> Result<StateVersion, ActionRejection> {
    let world = session.world().ok_or(ActionRejection::NotPlaying)?;
    let state = world.state();
    if state.combat.phase != CombatPhase::InProgress {
        return Err(ActionRejection::CombatOver);
    }
    let acting = state.combat.turn.ok_or(ActionRejection::CombatOver)?;

    let mut next = state.clone();
    let mut events = vec![GameEvent::TurnEnded { unit_id: acting.unit_id, reason }];
    let change = advance_turn(&mut next, &mut events);

    let delta = commit(session, next)?;
    let version = delta.to_version;
    info!(session = %session.id, unit = acting.unit_id, ?reason, "Turn ended");
    publish(ctx, session, Committed { delta, events, change }).await;
    Ok(version)
}

/// DM ends the current turn.
pub async fn force_end_turn(ctx: &Arc<ServerContext>, user: &UserId) -> Result<(), ServerError> {
    let (_, shared) = ctx
        .registry
        .session_for(user)
        .await
        .ok_or_else(|| ServerError::from(&SessionError::NotInSession))?;
    let mut session = shared.lock().await;
    session.ensure_dm(user).map_err(|e| ServerError::from(&e))?;
    if session.state == SessionState::Paused {
        return Err(ActionRejection::SessionPaused.into());
    }

    end_current_turn(ctx, &mut session, TurnEndReason::Forced).await?;
    Ok(())
}

/// DM grants an item to a member. Allowed while playing or paused.
pub async fn grant_reward(
    ctx: &Arc<ServerContext>,
    user: &UserId,
    target: &UserId,
    item: ItemStack,
) -> Result<(), ServerError> {
    if item.quantity == 0 {
        return Err(ServerError::new(ErrorCode::InvalidMessage, "reward quantity must be positive"));
    }
    let (_, shared) = ctx
        .registry
        .session_for(user)
        .await
        .ok_or_else(|| ServerError::from(&SessionError::NotInSession))?;
    let mut session = shared.lock().await;
    session.ensure_dm(user).map_err(|e| ServerError::from(&e))?;
    if session.player(target).is_none() {
        return Err(ServerError::from(&SessionError::NotInSession));
    }
    let world = session.world().ok_or(ActionRejection::NotPlaying)?;

    let mut next = world.state().clone();
    next.add_to_inventory(target, &item);
    let events = vec![GameEvent::RewardGranted { user_id: target.clone(), item }];

    let delta = commit(&mut session, next)?;
    info!(session = %session.id, target = %target, "Reward granted");
    publish(ctx, &mut session, Committed { delta, events, change: None }).await;
    Ok(())
}

// =============================================================================
// PUBLISHING
// =============================================================================

/// Broadcast one commit in order: delta, events, turn change.
pub(crate) async fn publish(ctx: &Arc<ServerContext>, session: &mut Session, committed: Committed) {
    let Committed { delta, events, change } = committed;
    let version = delta.to_version;

    ctx.gateway.broadcast(session, ServerMessage::StateDelta(delta), None).await;
    if !events.is_empty() {
        ctx.gateway.broadcast(session, ServerMessage::Events { version, events }, None).await;
    }

    let finished = session
        .world()
        .map_or(true, |w| w.state().combat.phase.is_finished());
    if finished {
        session.next_turn_serial();
        return;
    }

    if let Some(change) = change {
        announce_turn(ctx, session, &change).await;
        if change.new_round
            && session.periodic_snapshot_due(change.round, ctx.config.full_snapshot_every_rounds)
        {
            debug!(session = %session.id, round = change.round, "Periodic full snapshot");
            send_full_state_all(ctx, session).await;
        }
    }
}

/// Tell members whose turn it is and arm the timer.
pub(crate) async fn announce_turn(ctx: &Arc<ServerContext>, session: &mut Session, change: &TurnChange) {
    let message = turn_change_message(session, change.unit_id, change.round);
    ctx.gateway.broadcast(session, message, None).await;
    schedule_turn_timer(ctx, session);
}

/// `turn_change` for the current turn.
pub(crate) fn turn_change_message(session: &Session, unit_id: UnitId, round: u32) -> ServerMessage {
    ServerMessage::TurnChange {
        current_user_id: session.acting_controller().map(|p| p.user_id.clone()),
        unit_id,
        round,
        time_limit_secs: session.settings.turn_time_limit().map(|d| d.as_secs()),
    }
}

/// Full snapshot for one member, with their unit.
pub(crate) async fn send_full_state(ctx: &ServerContext, session: &Session, user: &UserId) -> bool {
    match full_state_message(session, user) {
        Some(message) => ctx.gateway.send(user, message).await,
        None => false,
    }
}

async fn send_full_state_all(ctx: &ServerContext, session: &Session) {
    for user in session.member_ids() {
        send_full_state(ctx, session, &user).await;
    }
}

fn full_state_message(session: &Session, user: &UserId) -> Option<ServerMessage> {
    let world = session.world()?;
    let snapshot = match world.full_snapshot() {
        Ok(snapshot) => snapshot,
        Err(e) => {
            error!(session = %session.id, "Snapshot failed: {}", e);
            return None;
        }
    };
    Some(ServerMessage::FullState {
        version: snapshot.version,
        game_state: snapshot.game_state,
        state_hash: snapshot.state_hash,
        your_unit_id: session.player(user).and_then(|p| p.unit_id),
    })
}

/// Explicit resync: the current snapshot for the caller.
pub async fn request_sync(ctx: &Arc<ServerContext>, user: &UserId) -> Result<ServerMessage, ServerError> {
    let (_, shared) = ctx
        .registry
        .session_for(user)
        .await
        .ok_or_else(|| ServerError::from(&SessionError::NotInSession))?;
    let session = shared.lock().await;
    info!(session = %session.id, user = %user, "Resync requested");
    full_state_message(&session, user).ok_or_else(|| ActionRejection::NotPlaying.into())
}

// =============================================================================
// TURN TIMERS
// =============================================================================

/// How long the current turn may run: the disconnect grace (capped by the
/// turn limit) when its controller is away, else the turn limit.
fn turn_deadline(ctx: &ServerContext, session: &Session) -> Option<Duration> {
    let limit = session.settings.turn_time_limit();
    let controller_connected = session.acting_controller().map_or(false, |p| p.connected);

    if controller_connected {
        limit
    } else {
        let grace = ctx.config.disconnected_turn_grace;
        Some(limit.map_or(grace, |limit| limit.min(grace)))
    }
}

/// Invalidate any running timer and arm one for the current turn.
pub(crate) fn schedule_turn_timer(ctx: &Arc<ServerContext>, session: &mut Session) {
    let serial = session.next_turn_serial();
    if session.state != SessionState::Playing {
        return;
    }
    let in_progress = session.world().map_or(false, |w| {
        let combat = &w.state().combat;
        combat.phase == CombatPhase::InProgress && combat.turn.is_some()
    });
    if !in_progress {
        return;
    }
    let Some(delay) = turn_deadline(ctx, session) else {
        return;
    };

    let ctx = Arc::clone(ctx);
    let session_id = session.id;
    debug!(session = %session_id, serial, delay_ms = delay.as_millis() as u64, "Turn timer armed");
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        on_turn_timeout(&ctx, session_id, serial).await;
    });
}

async fn on_turn_timeout(ctx: &Arc<ServerContext>, session_id: SessionId, serial: u64) {
    let Some(shared) = ctx.registry.get(&session_id).await else {
        return;
    };
    let mut session = shared.lock().await;
    if session.turn_serial() != serial || session.state != SessionState::Playing {
        return;
    }

    let reason = match session.acting_controller() {
        Some(p) if p.connected => TurnEndReason::Timeout,
        _ => TurnEndReason::Disconnected,
    };
    info!(session = %session_id, ?reason, "Turn timer fired");
    if let Err(e) = end_current_turn(ctx, &mut session, reason).await {
        warn!(session = %session_id, "Timed-out turn could not end: {}", e);
    }
}

// =============================================================================
// TESTS
// =============================================================================
