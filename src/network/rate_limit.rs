//! Per-identity sliding-window rate limits.
//!
//! Checked before a message reaches any session, so excess traffic costs
//! one map lookup and an error frame, never a session mutation.

use std::collections::{HashMap, VecDeque};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};

use crate::config::RateLimitConfig;
use crate::game::state::UserId;
use crate::network::protocol::MessageClass;

/// Budget exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("rate limited, retry in {}ms", retry_after.as_millis())]
pub struct RateLimited {
    /// When the oldest counted message leaves the window.
    pub retry_after: Duration,
}

/// Sliding-window limiter keyed by (identity, message class).
pub struct RateLimiter {
    config: RateLimitConfig,
    windows: Mutex<HashMap<(UserId, MessageClass), VecDeque<Instant>>>,
}

impl RateLimiter {
    /// Create a limiter.
    pub fn new(config: RateLimitConfig) -> Self {
        Self { config, windows: Mutex::new(HashMap::new()) }
    }

    fn budget(&self, class: MessageClass) -> u32 {
        match class {
            MessageClass::Action => self.config.actions,
            MessageClass::Chat => self.config.chat,
            MessageClass::DmCommand => self.config.dm_commands,
            MessageClass::Control => self.config.control,
        }
    }

    /// Count one message, or refuse it.
    pub async fn check(&self, user: &UserId, class: MessageClass) -> Result<(), RateLimited> {
        let now = Instant::now();
        let window = self.config.window;
        let budget = self.budget(class) as usize;

        let mut windows = self.windows.lock().await;
        let hits = windows.entry((user.clone(), class)).or_default();

        while hits.front().map_or(false, |&t| now.duration_since(t) >= window) {
            hits.pop_front();
        }

        if hits.len() >= budget {
            let retry_after = hits
                .front()
                .map(|&t| window.saturating_sub(now.duration_since(t)))
                .unwrap_or(window);
            return Err(RateLimited { retry_after });
        }

        hits.push_back(now);
        Ok(())
    }

    /// Forget windows with no recent hits.
    pub async fn prune(&self) {
        let now = Instant::now();
        let window = self.config.window;
        self.windows
            .lock()
            .await
            .retain(|_, hits| hits.back().map_or(false, |&t| now.duration_since(t) < window));
    }
}
