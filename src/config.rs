//! Server Configuration
//!
//! Built once at startup from the environment, then shared read-only behind
//! an `Arc`. Tests construct their own value with [`ServerConfig::for_tests`].

use std::fmt::Display;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::game::simulation::Difficulty;
use crate::session::session::SessionSettings;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable could not be parsed.
    #[error("invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        /// Variable name.
        key: String,
        /// Raw value.
        value: String,
        /// Parser message.
        reason: String,
    },
}

// =============================================================================
// AUTH
// =============================================================================

/// Session token and cookie settings.
#[derive(Clone, Debug)]
pub struct AuthConfig {
    /// HS256 signing secret. Authentication is disabled without it.
    pub secret: Option<String>,
    /// Issuer written into and required from session tokens.
    pub issuer: String,
    /// Session token lifetime.
    pub token_ttl: Duration,
    /// Cookie carrying the session token.
    pub cookie_name: String,
    /// Mark the cookie `Secure`.
    pub cookie_secure: bool,
    /// Skip expiry validation (testing only).
    pub skip_expiry: bool,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            secret: None,
            issuer: "skirmish".to_string(),
            token_ttl: Duration::from_secs(7 * 24 * 3600),
            cookie_name: "skirmish_session".to_string(),
            cookie_secure: true,
            skip_expiry: false,
        }
    }
}

impl AuthConfig {
    /// Read `AUTH_*` variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            secret: std::env::var("AUTH_SECRET").ok().filter(|s| !s.is_empty()),
            issuer: std::env::var("AUTH_ISSUER").unwrap_or(defaults.issuer),
            token_ttl: Duration::from_secs(env_or("AUTH_TOKEN_TTL_SECS", defaults.token_ttl.as_secs())?),
            cookie_name: std::env::var("AUTH_COOKIE_NAME").unwrap_or(defaults.cookie_name),
            cookie_secure: env_flag("AUTH_COOKIE_SECURE", defaults.cookie_secure),
            skip_expiry: env_flag("AUTH_SKIP_EXPIRY", false),
        })
    }

    /// Is a signing secret present?
    pub fn is_configured(&self) -> bool {
        self.secret.is_some()
    }
}

// =============================================================================
// RATE LIMITS
// =============================================================================

/// Per-identity message budgets over a sliding window.
#[derive(Clone, Debug)]
pub struct RateLimitConfig {
    /// Window length.
    pub window: Duration,
    /// Gameplay actions per window.
    pub actions: u32,
    /// Chat messages per window.
    pub chat: u32,
    /// DM commands per window.
    pub dm_commands: u32,
    /// Everything else (lobby, sync, ping) per window.
    pub control: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            actions: 120,
            chat: 30,
            dm_commands: 60,
            control: 240,
        }
    }
}

// =============================================================================
// SERVER
// =============================================================================

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Close connections silent for this long.
    pub idle_timeout: Duration,
    /// Outbound frames buffered per connection before drops.
    pub outbound_queue: usize,
    /// How long a dropped player keeps their seat.
    pub reconnect_grace: Duration,
    /// How long a disconnected player's turn waits before auto-ending.
    /// Capped by the session's turn limit.
    pub disconnected_turn_grace: Duration,
    /// Broadcast a full snapshot every N rounds; 0 disables.
    pub full_snapshot_every_rounds: u32,
    /// Settings for sessions created without explicit ones.
    pub default_settings: SessionSettings,
    /// Auth settings.
    pub auth: AuthConfig,
    /// Rate limits.
    pub rate_limits: RateLimitConfig,
    /// Server version string.
    pub version: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            max_connections: 1000,
            idle_timeout: Duration::from_secs(120),
            outbound_queue: 64,
            reconnect_grace: Duration::from_secs(300),
            disconnected_turn_grace: Duration::from_secs(30),
            full_snapshot_every_rounds: 5,
            default_settings: SessionSettings::default(),
            auth: AuthConfig::default(),
            rate_limits: RateLimitConfig::default(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl ServerConfig {
    /// Read `SKIRMISH_*` and `AUTH_*` variables over the defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let d = Self::default();
        let limits = d.rate_limits.clone();

        Ok(Self {
            bind_addr: env_or("SKIRMISH_BIND_ADDR", d.bind_addr)?,
            max_connections: env_or("SKIRMISH_MAX_CONNECTIONS", d.max_connections)?,
            idle_timeout: secs("SKIRMISH_IDLE_TIMEOUT_SECS", d.idle_timeout)?,
            outbound_queue: env_or("SKIRMISH_OUTBOUND_QUEUE", d.outbound_queue)?,
            reconnect_grace: secs("SKIRMISH_RECONNECT_GRACE_SECS", d.reconnect_grace)?,
            disconnected_turn_grace: secs("SKIRMISH_DISCONNECTED_TURN_GRACE_SECS", d.disconnected_turn_grace)?,
            full_snapshot_every_rounds: env_or("SKIRMISH_SNAPSHOT_EVERY_ROUNDS", d.full_snapshot_every_rounds)?,
            default_settings: SessionSettings {
                max_players: env_or("SKIRMISH_MAX_PLAYERS", d.default_settings.max_players)?,
                difficulty: match std::env::var("SKIRMISH_DIFFICULTY").ok().as_deref() {
                    Some("easy") => Difficulty::Easy,
                    Some("hard") => Difficulty::Hard,
                    _ => d.default_settings.difficulty,
                },
                turn_time_limit_secs: env_or("SKIRMISH_TURN_TIME_LIMIT_SECS", d.default_settings.turn_time_limit_secs)?,
            },
            auth: AuthConfig::from_env()?,
            rate_limits: RateLimitConfig {
                window: secs("SKIRMISH_RATE_WINDOW_SECS", limits.window)?,
                actions: env_or("SKIRMISH_RATE_ACTIONS", limits.actions)?,
                chat: env_or("SKIRMISH_RATE_CHAT", limits.chat)?,
                dm_commands: env_or("SKIRMISH_RATE_DM_COMMANDS", limits.dm_commands)?,
                control: env_or("SKIRMISH_RATE_CONTROL", limits.control)?,
            },
            version: d.version,
        })
    }

    /// Local, fully configured settings with short timeouts.
    pub fn for_tests() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            idle_timeout: Duration::from_secs(30),
            reconnect_grace: Duration::from_secs(60),
            disconnected_turn_grace: Duration::from_secs(10),
            full_snapshot_every_rounds: 2,
            default_settings: SessionSettings {
                turn_time_limit_secs: 30,
                ..SessionSettings::default()
            },
            auth: AuthConfig {
                secret: Some("test-secret-with-enough-entropy".to_string()),
                cookie_secure: false,
                ..AuthConfig::default()
            },
            ..Self::default()
        }
    }
}

fn env_or<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    match std::env::var(key) {
        Ok(value) => {
            let parsed = value.trim().parse::<T>();
            parsed.map_err(|e| ConfigError::Invalid {
                key: key.to_string(),
                value,
                reason: e.to_string(),
            })
        }
        Err(_) => Ok(default),
    }
}

fn secs(key: &str, default: Duration) -> Result<Duration, ConfigError> {
    env_or(key, default.as_secs()).map(Duration::from_secs)
}

fn env_flag(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| v == "true" || v == "1")
        .unwrap_or(default)
}
