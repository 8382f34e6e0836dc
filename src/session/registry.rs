//! Session Registry
//!
//! Process-wide tables: sessions by id, live join codes, and which session
//! each user belongs to. Entries reference each other by key only.
//!
//! Lock order: a session's own lock may be held while touching these maps,
//! never the other way round.

use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::game::state::UserId;
use crate::session::join_code;
use crate::session::session::{Session, SessionError, SessionId, SessionSettings, SessionState};

/// A session behind its single-writer lock. `tokio::sync::Mutex` is FIFO,
/// so concurrent operations on one session run in arrival order.
pub type SharedSession = Arc<Mutex<Session>>;

/// Attempts at drawing an unused join code before giving up.
const MAX_CODE_ATTEMPTS: usize = 64;

/// Result of creating a session.
#[derive(Debug, Clone)]
pub struct CreatedSession {
    /// New session id.
    pub session_id: SessionId,
    /// Its join code.
    pub join_code: String,
    /// Handle to the session.
    pub session: SharedSession,
}

/// Session tables.
pub struct SessionRegistry {
    /// Live sessions.
    sessions: RwLock<BTreeMap<SessionId, SharedSession>>,
    /// Join codes of non-ended sessions.
    join_codes: Mutex<BTreeMap<String, SessionId>>,
    /// User to session membership.
    bindings: RwLock<BTreeMap<UserId, SessionId>>,
}

impl SessionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(BTreeMap::new()),
            join_codes: Mutex::new(BTreeMap::new()),
            bindings: RwLock::new(BTreeMap::new()),
        }
    }

    /// Open a lobby with `creator` as DM.
    pub async fn create_session(
        &self,
        creator: &UserId,
        display_name: String,
        character_id: Option<String>,
        settings: SessionSettings,
    ) -> Result<CreatedSession, SessionError> {
        let session_id = Uuid::new_v4();
        self.try_bind(creator, session_id).await?;

        let mut codes = self.join_codes.lock().await;
        let code = (0..MAX_CODE_ATTEMPTS)
            .map(|_| join_code::generate())
            .find(|code| !codes.contains_key(code));
        let Some(code) = code else {
            drop(codes);
            warn!("Join code space exhausted");
            self.unbind(creator, session_id).await;
            return Err(SessionError::JoinCodeExhausted);
        };

        let mut session = Session::new(session_id, code.clone(), settings, creator.clone(), display_name, character_id);
        if let Err(e) = session.transition(SessionState::Lobby) {
            drop(codes);
            self.unbind(creator, session_id).await;
            return Err(e);
        }
        let session = Arc::new(Mutex::new(session));

        self.sessions.write().await.insert(session_id, session.clone());
        codes.insert(code.clone(), session_id);
        drop(codes);

        info!(session = %session_id, code = %code, dm = %creator, "Session created");
        Ok(CreatedSession { session_id, join_code: code, session })
    }

    /// Add `user` to the lobby behind `code`.
    pub async fn join_session(
        &self,
        code: &str,
        user: &UserId,
        display_name: String,
        character_id: Option<String>,
    ) -> Result<(SessionId, SharedSession), SessionError> {
        let code = join_code::normalize(code).ok_or(SessionError::SessionNotFound)?;
        let session_id = self
            .join_codes
            .lock()
            .await
            .get(&code)
            .copied()
            .ok_or(SessionError::SessionNotFound)?;
        let session = self.get(&session_id).await.ok_or(SessionError::SessionNotFound)?;

        self.try_bind(user, session_id).await?;
        let joined = session.lock().await.join(user.clone(), display_name, character_id);
        if let Err(e) = joined {
            self.unbind(user, session_id).await;
            return Err(e);
        }

        Ok((session_id, session))
    }

    /// Get a session by id.
    pub async fn get(&self, id: &SessionId) -> Option<SharedSession> {
        self.sessions.read().await.get(id).cloned()
    }

    /// The session `user` belongs to.
    pub async fn session_for(&self, user: &UserId) -> Option<(SessionId, SharedSession)> {
        let id = self.bindings.read().await.get(user).copied()?;
        self.get(&id).await.map(|s| (id, s))
    }

    async fn try_bind(&self, user: &UserId, session_id: SessionId) -> Result<(), SessionError> {
        let mut bindings = self.bindings.write().await;
        if bindings.contains_key(user) {
            return Err(SessionError::AlreadyInSession);
        }
        bindings.insert(user.clone(), session_id);
        Ok(())
    }

    /// Drop `user`'s membership, if it still points at `session_id`.
    pub async fn unbind(&self, user: &UserId, session_id: SessionId) {
        let mut bindings = self.bindings.write().await;
        if bindings.get(user) == Some(&session_id) {
            bindings.remove(user);
        }
    }

    /// Forget an ended session: its table entry, join code and remaining
    /// member bindings.
    pub async fn release(&self, session: &Session) {
        self.sessions.write().await.remove(&session.id);

        {
            let mut codes = self.join_codes.lock().await;
            if codes.get(&session.join_code) == Some(&session.id) {
                codes.remove(&session.join_code);
            }
        }

        let mut bindings = self.bindings.write().await;
        for player in session.players() {
            if bindings.get(&player.user_id) == Some(&session.id) {
                bindings.remove(&player.user_id);
            }
        }
        debug!(session = %session.id, "Session released");
    }

    /// Live session count.
    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    async fn create(registry: &SessionRegistry, user: &str) -> CreatedSession {
        registry
            .create_session(&UserId::from(user), user.to_string(), None, SessionSettings::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_create_and_join() {
        let registry = SessionRegistry::new();
        let created = create(&registry, "dm").await;

        let (id, session) = registry
            .join_session(&created.join_code.to_lowercase(), &UserId::from("p1"), "p1".into(), None)
            .await
            .unwrap();
        assert_eq!(id, created.session_id);
        assert_eq!(session.lock().await.players().len(), 2);

        let (bound, _) = registry.session_for(&UserId::from("p1")).await.unwrap();
        assert_eq!(bound, created.session_id);
    }

    #[tokio::test]
    async fn test_unknown_code() {
        let registry = SessionRegistry::new();
        let result = registry.join_session("ZZZZZZ", &UserId::from("p1"), "p1".into(), None).await;
        assert!(matches!(result, Err(SessionError::SessionNotFound)));
    }

    #[tokio::test]
    async fn test_one_session_per_user() {
        let registry = SessionRegistry::new();
        let first = create(&registry, "dm").await;
        create(&registry, "dm2").await;

        let again = registry
            .create_session(&UserId::from("dm"), "dm".into(), None, SessionSettings::default())
            .await;
        assert!(matches!(again, Err(SessionError::AlreadyInSession)));

        let join = registry.join_session(&first.join_code, &UserId::from("dm2"), "dm2".into(), None).await;
        assert!(matches!(join, Err(SessionError::AlreadyInSession)));
    }

    #[tokio::test]
    async fn test_failed_join_leaves_no_binding() {
        let registry = SessionRegistry::new();
        let created = registry
            .create_session(
                &UserId::from("dm"),
                "dm".into(),
                None,
                SessionSettings { max_players: 1, ..Default::default() },
            )
            .await
            .unwrap();

        let result = registry.join_session(&created.join_code, &UserId::from("p1"), "p1".into(), None).await;
        assert!(matches!(result, Err(SessionError::SessionFull)));
        assert!(registry.session_for(&UserId::from("p1")).await.is_none());
    }

    #[tokio::test]
    async fn test_release_frees_code() {
        let registry = SessionRegistry::new();
        let created = create(&registry, "dm").await;

        {
            let session = created.session.lock().await;
            registry.release(&session).await;
        }

        assert_eq!(registry.session_count().await, 0);
        assert!(registry.session_for(&UserId::from("dm")).await.is_none());
        let result = registry.join_session(&created.join_code, &UserId::from("p1"), "p1".into(), None).await;
        assert!(matches!(result, Err(SessionError::SessionNotFound)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_join_codes_unique() {
        let registry = Arc::new(SessionRegistry::new());
        let mut handles = Vec::with_capacity(10_000);

        for i in 0..10_000 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                registry
                    .create_session(&UserId::new(format!("user-{}", i)), "u".into(), None, SessionSettings::default())
                    .await
                    .unwrap()
                    .join_code
            }));
        }

        let mut codes = HashSet::new();
        for handle in handles {
            assert!(codes.insert(handle.await.unwrap()));
        }
        assert_eq!(codes.len(), 10_000);
        assert_eq!(registry.session_count().await, 10_000);
    }
}
