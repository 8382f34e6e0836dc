//! Game Session
//!
//! One group playing one game: membership, the lifecycle state machine and,
//! once playing, the synchronized world. A `Session` never talks to the
//! network; callers hold its lock, mutate it, then broadcast what changed.

use std::collections::BTreeMap;
use serde::{Serialize, Deserialize};
use thiserror::Error;
use tokio::time::{Duration, Instant};
use tracing::{info, warn};
use uuid::Uuid;

use crate::core::rng::DeterministicRng;
use crate::game::character::{CharacterSheet, CharacterStore};
use crate::game::events::GameEvent;
use crate::game::simulation::{Difficulty, PartyMember, ScenarioRequest, Simulation};
use crate::game::state::{UnitId, UserId};
use crate::session::turn::{self, TurnChange};
use crate::sync::snapshot::{Delta, StateSynchronizer, SyncError};

/// Unique session identifier.
pub type SessionId = Uuid;

// =============================================================================
// STATE MACHINE
// =============================================================================

/// Lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Allocated, not yet open.
    Created,
    /// Accepting players.
    Lobby,
    /// Game running.
    Playing,
    /// Game suspended by the DM.
    Paused,
    /// Terminal.
    Ended,
}

impl SessionState {
    /// Is `next` reachable from here in one step?
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Created, Lobby)
                | (Lobby, Playing)
                | (Playing, Paused)
                | (Paused, Playing)
                | (Created | Lobby | Playing | Paused, Ended)
        )
    }
}

/// Per-session settings chosen by the DM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionSettings {
    /// Member cap, DM included.
    pub max_players: usize,
    /// Encounter difficulty.
    pub difficulty: Difficulty,
    /// Seconds per turn; 0 disables the turn timer.
    pub turn_time_limit_secs: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            max_players: 6,
            difficulty: Difficulty::Normal,
            turn_time_limit_secs: 90,
        }
    }
}

impl SessionSettings {
    /// Turn limit, if any.
    pub fn turn_time_limit(&self) -> Option<Duration> {
        (self.turn_time_limit_secs > 0).then(|| Duration::from_secs(self.turn_time_limit_secs))
    }
}

// =============================================================================
// MEMBERS
// =============================================================================

/// A session member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Player {
    /// Account identity.
    pub user_id: UserId,
    /// Name shown to other members.
    pub display_name: String,
    /// Stored character to play, if any.
    pub character_id: Option<String>,
    /// Ready to start.
    pub ready: bool,
    /// Session facilitator.
    #[serde(rename = "isDM")]
    pub is_dm: bool,
    /// Has a live connection.
    pub connected: bool,
    /// Unit controlled once playing.
    pub unit_id: Option<UnitId>,
    /// When the connection dropped.
    #[serde(skip)]
    pub disconnected_at: Option<Instant>,
}

impl Player {
    fn new(user_id: UserId, display_name: String, character_id: Option<String>, is_dm: bool) -> Self {
        Self {
            user_id,
            display_name,
            character_id,
            ready: false,
            is_dm,
            connected: true,
            unit_id: None,
            disconnected_at: None,
        }
    }
}

/// Public view of a session, broadcast as `lobby_state`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LobbyView {
    /// Session id.
    pub session_id: SessionId,
    /// Join code.
    pub join_code: String,
    /// Lifecycle state.
    pub state: SessionState,
    /// Settings.
    pub settings: SessionSettings,
    /// Members in join order.
    pub players: Vec<Player>,
}

/// What removing a member changed.
#[derive(Debug)]
pub struct Departure {
    /// The removed member.
    pub player: Player,
    /// Member promoted to DM, if the DM left.
    pub new_dm: Option<UserId>,
    /// Commit that released the member's unit, with its event.
    pub orphaned: Option<(Delta, GameEvent)>,
    /// The released unit was the one acting.
    pub was_acting: bool,
    /// Nobody is left.
    pub now_empty: bool,
}

// =============================================================================
// ERRORS
// =============================================================================

/// Session errors.
#[derive(Debug, Error)]
pub enum SessionError {
    /// No session under that id or code.
    #[error("session not found")]
    SessionNotFound,

    /// Member cap reached.
    #[error("session is full")]
    SessionFull,

    /// Session is past the lobby.
    #[error("session is not accepting players")]
    SessionNotJoinable,

    /// Not every connected member is ready.
    #[error("not all players are ready")]
    NotReady,

    /// DM-only operation.
    #[error("only the DM can do that")]
    NotDm,

    /// Caller is not a member.
    #[error("not in this session")]
    NotInSession,

    /// Caller already belongs to a session.
    #[error("already in a session")]
    AlreadyInSession,

    /// Lifecycle transition not allowed.
    #[error("cannot go from {from:?} to {to:?}")]
    InvalidTransition {
        /// Current state.
        from: SessionState,
        /// Requested state.
        to: SessionState,
    },

    /// Operation only valid in the lobby.
    #[error("only allowed in the lobby")]
    NotInLobby,

    /// No free join code could be found.
    #[error("no join code available")]
    JoinCodeExhausted,

    /// The simulation could not build a scenario.
    #[error("scenario failed: {0}")]
    Scenario(String),

    /// State synchronization failed.
    #[error(transparent)]
    Sync(#[from] SyncError),
}

// =============================================================================
// SESSION
// =============================================================================

/// A game session.
#[derive(Debug)]
pub struct Session {
    /// Unique session identifier.
    pub id: SessionId,
    /// Human-typable code.
    pub join_code: String,
    /// Lifecycle state.
    pub state: SessionState,
    /// Settings.
    pub settings: SessionSettings,
    /// Members in join order.
    players: Vec<Player>,
    /// Synchronized world, once playing.
    world: Option<StateSynchronizer>,
    /// Loaded character sheets, saved back on end.
    sheets: BTreeMap<UserId, CharacterSheet>,
    /// Session RNG (initiative tie-breaks, scenario seed).
    rng: DeterministicRng,
    /// Bumped on every turn start; stale turn timers compare against it.
    turn_serial: u64,
    /// Round of the last periodic full snapshot.
    last_snapshot_round: u32,
}

impl Session {
    /// Allocate a session with its creator as DM. Starts in `Created`.
    pub fn new(
        id: SessionId,
        join_code: String,
        settings: SessionSettings,
        creator: UserId,
        display_name: String,
        character_id: Option<String>,
    ) -> Self {
        Self {
            id,
            join_code,
            state: SessionState::Created,
            settings,
            players: vec![Player::new(creator, display_name, character_id, true)],
            world: None,
            sheets: BTreeMap::new(),
            rng: DeterministicRng::for_session(id.as_bytes(), rand::random()),
            turn_serial: 0,
            last_snapshot_round: 0,
        }
    }

    /// Move to `next`, if the state machine allows it.
    pub fn transition(&mut self, next: SessionState) -> Result<(), SessionError> {
        if !self.state.can_transition_to(next) {
            return Err(SessionError::InvalidTransition { from: self.state, to: next });
        }
        info!(session = %self.id, from = ?self.state, to = ?next, "Session transition");
        self.state = next;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Membership
    // -------------------------------------------------------------------------

    /// Members in join order.
    pub fn players(&self) -> &[Player] {
        &self.players
    }

    /// Look up a member.
    pub fn player(&self, user: &UserId) -> Option<&Player> {
        self.players.iter().find(|p| &p.user_id == user)
    }

    fn player_mut(&mut self, user: &UserId) -> Option<&mut Player> {
        self.players.iter_mut().find(|p| &p.user_id == user)
    }

    /// Member ids in join order.
    pub fn member_ids(&self) -> Vec<UserId> {
        self.players.iter().map(|p| p.user_id.clone()).collect()
    }

    /// Current DM.
    pub fn dm(&self) -> Option<&Player> {
        self.players.iter().find(|p| p.is_dm)
    }

    /// Is `user` the DM?
    pub fn is_dm(&self, user: &UserId) -> bool {
        self.player(user).map_or(false, |p| p.is_dm)
    }

    /// Fail unless `user` is the DM.
    pub fn ensure_dm(&self, user: &UserId) -> Result<(), SessionError> {
        match self.player(user) {
            None => Err(SessionError::NotInSession),
            Some(p) if !p.is_dm => Err(SessionError::NotDm),
            Some(_) => Ok(()),
        }
    }

    /// Add a non-DM member.
    pub fn join(&mut self, user: UserId, display_name: String, character_id: Option<String>) -> Result<(), SessionError> {
        if self.state != SessionState::Lobby {
            return Err(SessionError::SessionNotJoinable);
        }
        if self.player(&user).is_some() {
            return Err(SessionError::AlreadyInSession);
        }
        if self.players.len() >= self.settings.max_players {
            return Err(SessionError::SessionFull);
        }

        info!(session = %self.id, user = %user, "Player joined");
        self.players.push(Player::new(user, display_name, character_id, false));
        Ok(())
    }

    /// Toggle a member's ready flag.
    pub fn set_ready(&mut self, user: &UserId, ready: bool) -> Result<(), SessionError> {
        if self.state != SessionState::Lobby {
            return Err(SessionError::NotInLobby);
        }
        let player = self.player_mut(user).ok_or(SessionError::NotInSession)?;
        player.ready = ready;
        Ok(())
    }

    /// Every connected member is ready.
    pub fn all_connected_ready(&self) -> bool {
        self.players.iter().filter(|p| p.connected).all(|p| p.ready)
    }

    /// Remove a member. Hands the DM role on, releases their unit to DM
    /// control if playing, and reports whether the session is now empty.
    pub fn remove_player(&mut self, user: &UserId) -> Result<Departure, SessionError> {
        let index = self
            .players
            .iter()
            .position(|p| &p.user_id == user)
            .ok_or(SessionError::NotInSession)?;

        let mut orphaned = None;
        let mut was_acting = false;
        if let (Some(world), Some(unit_id)) = (self.world.as_mut(), self.players[index].unit_id) {
            was_acting = world.state().combat.turn.map_or(false, |t| t.unit_id == unit_id);
            let delta = world.commit(|s| {
                let mut next = s.clone();
                if let Some(unit) = next.units.get_mut(&unit_id) {
                    unit.owner = None;
                }
                Ok(next)
            })?;
            orphaned = Some((delta, GameEvent::UnitOrphaned { unit_id, previous_owner: user.clone() }));
        }

        let player = self.players.remove(index);
        info!(session = %self.id, user = %user, "Player removed");

        let new_dm = if player.is_dm { self.hand_off_dm() } else { None };

        Ok(Departure {
            player,
            new_dm,
            orphaned,
            was_acting,
            now_empty: self.players.is_empty(),
        })
    }

    /// Promote the first connected member (else the first member) to DM.
    fn hand_off_dm(&mut self) -> Option<UserId> {
        let index = self
            .players
            .iter()
            .position(|p| p.connected)
            .or_else(|| (!self.players.is_empty()).then_some(0))?;

        let heir = &mut self.players[index];
        heir.is_dm = true;
        info!(session = %self.id, user = %heir.user_id, "DM role handed off");
        Some(heir.user_id.clone())
    }

    /// Record a dropped connection.
    pub fn mark_disconnected(&mut self, user: &UserId, now: Instant) -> bool {
        match self.player_mut(user) {
            Some(p) => {
                p.connected = false;
                p.disconnected_at = Some(now);
                true
            }
            None => false,
        }
    }

    /// Record a restored connection.
    pub fn mark_connected(&mut self, user: &UserId) -> bool {
        match self.player_mut(user) {
            Some(p) => {
                p.connected = true;
                p.disconnected_at = None;
                true
            }
            None => false,
        }
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Build the world and roll initiative. DM only, from the lobby, with
    /// every connected member ready.
    pub fn start_game(
        &mut self,
        caller: &UserId,
        simulation: &dyn Simulation,
        characters: &dyn CharacterStore,
    ) -> Result<Option<TurnChange>, SessionError> {
        self.ensure_dm(caller)?;
        if self.state != SessionState::Lobby {
            return Err(SessionError::InvalidTransition { from: self.state, to: SessionState::Playing });
        }
        if !self.all_connected_ready() {
            return Err(SessionError::NotReady);
        }

        let mut party = Vec::with_capacity(self.players.len());
        let mut sheets = BTreeMap::new();
        for player in &self.players {
            let character = player
                .character_id
                .as_deref()
                .and_then(|id| match characters.load(&player.user_id, id) {
                    Ok(sheet) => sheet,
                    Err(e) => {
                        warn!(session = %self.id, user = %player.user_id, "Character load failed: {}", e);
                        None
                    }
                });
            if let Some(sheet) = &character {
                sheets.insert(player.user_id.clone(), sheet.clone());
            }
            party.push(PartyMember {
                user_id: player.user_id.clone(),
                display_name: player.display_name.clone(),
                character,
            });
        }

        let request = ScenarioRequest {
            seed: self.rng.next_u64(),
            difficulty: self.settings.difficulty,
            party,
        };
        let mut state = simulation
            .create_scenario(&request)
            .map_err(|e| SessionError::Scenario(e.to_string()))?;

        let change = turn::begin_combat(&mut state, &mut self.rng);
        let world = StateSynchronizer::new(state)?;

        for player in &mut self.players {
            player.unit_id = world.state().unit_owned_by(&player.user_id).map(|u| u.id);
        }
        self.world = Some(world);
        self.sheets = sheets;
        self.last_snapshot_round = 1;
        self.transition(SessionState::Playing)?;

        Ok(change)
    }

    /// DM pauses play.
    pub fn pause(&mut self, caller: &UserId) -> Result<(), SessionError> {
        self.ensure_dm(caller)?;
        self.transition(SessionState::Paused)
    }

    /// DM resumes play.
    pub fn resume(&mut self, caller: &UserId) -> Result<(), SessionError> {
        self.ensure_dm(caller)?;
        if self.state != SessionState::Paused {
            return Err(SessionError::InvalidTransition { from: self.state, to: SessionState::Playing });
        }
        self.transition(SessionState::Playing)
    }

    /// End the session and write inventories back to stored characters.
    pub fn end(&mut self, characters: &dyn CharacterStore) -> Result<(), SessionError> {
        self.transition(SessionState::Ended)?;
        self.turn_serial += 1;

        let Some(world) = &self.world else {
            return Ok(());
        };
        for (user, sheet) in &self.sheets {
            let mut sheet = sheet.clone();
            if let Some(acquired) = world.state().inventories.get(user) {
                for (item, quantity) in acquired {
                    let held = sheet.inventory.entry(item.clone()).or_insert(0);
                    *held = held.saturating_add(*quantity);
                }
            }
            if let Err(e) = characters.save(&sheet) {
                warn!(session = %self.id, user = %user, "Character save failed: {}", e);
            }
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // World access
    // -------------------------------------------------------------------------

    /// The synchronized world, once playing.
    pub fn world(&self) -> Option<&StateSynchronizer> {
        self.world.as_ref()
    }

    /// Mutable world access for commits.
    pub fn world_mut(&mut self) -> Option<&mut StateSynchronizer> {
        self.world.as_mut()
    }

    /// Member controlling the acting unit: its owner, or the DM for
    /// unowned units.
    pub fn acting_controller(&self) -> Option<&Player> {
        let world = self.world.as_ref()?;
        let turn = world.state().combat.turn?;
        match &world.state().unit(turn.unit_id)?.owner {
            Some(owner) => self.player(owner),
            None => self.dm(),
        }
    }

    /// Current turn serial.
    pub fn turn_serial(&self) -> u64 {
        self.turn_serial
    }

    /// Invalidate outstanding turn timers and return the new serial.
    pub fn next_turn_serial(&mut self) -> u64 {
        self.turn_serial += 1;
        self.turn_serial
    }

    /// Should a safety-net full snapshot go out for `round`?
    pub fn periodic_snapshot_due(&mut self, round: u32, every: u32) -> bool {
        if every == 0 || round < self.last_snapshot_round + every {
            return false;
        }
        self.last_snapshot_round = round;
        true
    }

    /// Public view for `lobby_state`.
    pub fn lobby_view(&self) -> LobbyView {
        LobbyView {
            session_id: self.id,
            join_code: self.join_code.clone(),
            state: self.state,
            settings: self.settings,
            players: self.players.clone(),
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
