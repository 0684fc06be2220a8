//! In-memory runtime state, rebuilt from the store at process start.
//!
//! These maps are caches for the timer loop and command handlers; the store
//! stays the source of truth. The whole struct is owned by the process entry
//! point and passed by reference to everything that needs it.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};

use crate::store::{GuildStore, PendingKidnap};

#[derive(Debug, Default)]
pub struct BotState {
    /// Next scheduled visit per guild; `None` means the timer is disarmed.
    pub guild_timers: HashMap<u64, Option<DateTime<Utc>>>,
    /// Deferred kidnaps keyed by `(guild_id, target_id)`.
    pub pending_kidnaps: HashMap<(u64, u64), PendingKidnap>,
    /// Kidnap immunity expiry per `(guild_id, user_id)`. Not persisted:
    /// immunity is short-lived and resets on restart.
    pub kidnap_immunity: HashMap<(u64, u64), DateTime<Utc>>,
}

impl BotState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Repopulate timers and pending kidnaps from durable state.
    pub fn load(store: &dyn GuildStore) -> Self {
        BotState {
            guild_timers: store.load_guild_timers(),
            pending_kidnaps: store.load_pending_kidnaps(),
            kidnap_immunity: HashMap::new(),
        }
    }

    pub fn grant_immunity(&mut self, guild_id: u64, user_id: u64, minutes: u32) {
        let until = Utc::now() + Duration::minutes(i64::from(minutes));
        self.kidnap_immunity.insert((guild_id, user_id), until);
    }

    /// Time left on a user's immunity, if any. Expired entries are dropped.
    pub fn immunity_remaining(&mut self, guild_id: u64, user_id: u64) -> Option<Duration> {
        let key = (guild_id, user_id);
        let until = *self.kidnap_immunity.get(&key)?;
        let now = Utc::now();
        if until > now {
            Some(until - now)
        } else {
            self.kidnap_immunity.remove(&key);
            None
        }
    }
}
