//! Guild configuration, stats, and scheduling persistence.
//!
//! Two backends implement the [`GuildStore`] contract: [`JsonGuildStore`]
//! keeps the whole configuration graph in one pretty-printed JSON document
//! (the legacy flat-file format), and [`SqliteGuildStore`] keeps it in a
//! four-table SQLite schema. Callers hold a `&dyn GuildStore` and never
//! branch on which backend is active.
//!
//! Read paths never fail: a missing record yields defaults or `None`, and
//! I/O or parse problems are logged and degrade to empty results. Mutating
//! calls return `Result` so a dropped write is visible to the caller.

pub mod coerce;
pub mod json;
pub mod sqlite;

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

pub use json::JsonGuildStore;
pub use sqlite::SqliteGuildStore;

pub const DEFAULT_PREFIX: &str = "*";
pub const DEFAULT_TIMER_MIN_MINUTES: u32 = 2;
pub const DEFAULT_TIMER_MAX_MINUTES: u32 = 30;
pub const DEFAULT_KIDNAP_IMMUNITY_MINUTES: u32 = 30;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("storage i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Per-guild configuration. A record with these defaults is returned for
/// guilds that have never been written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuildConfig {
    #[serde(default, deserialize_with = "coerce::de_opt_id")]
    pub default_text_channel_id: Option<u64>,
    #[serde(default, deserialize_with = "coerce::de_opt_id")]
    pub temp_channel_id: Option<u64>,
    #[serde(default, deserialize_with = "coerce::de_opt_id")]
    pub afk_channel_id: Option<u64>,
    #[serde(default, deserialize_with = "coerce::de_opt_id")]
    pub kidnap_channel_id: Option<u64>,
    #[serde(default = "default_prefix")]
    pub prefix: String,
    #[serde(default = "default_true", deserialize_with = "coerce::de_flag_true")]
    pub auto_move_enabled: bool,
    #[serde(default = "default_timer_min")]
    pub timer_min_minutes: u32,
    #[serde(default = "default_timer_max")]
    pub timer_max_minutes: u32,
    #[serde(default = "default_immunity")]
    pub kidnap_immunity_minutes: u32,
}

fn default_prefix() -> String {
    DEFAULT_PREFIX.to_string()
}

fn default_true() -> bool {
    true
}

fn default_timer_min() -> u32 {
    DEFAULT_TIMER_MIN_MINUTES
}

fn default_timer_max() -> u32 {
    DEFAULT_TIMER_MAX_MINUTES
}

fn default_immunity() -> u32 {
    DEFAULT_KIDNAP_IMMUNITY_MINUTES
}

impl Default for GuildConfig {
    fn default() -> Self {
        GuildConfig {
            default_text_channel_id: None,
            temp_channel_id: None,
            afk_channel_id: None,
            kidnap_channel_id: None,
            prefix: default_prefix(),
            auto_move_enabled: true,
            timer_min_minutes: DEFAULT_TIMER_MIN_MINUTES,
            timer_max_minutes: DEFAULT_TIMER_MAX_MINUTES,
            kidnap_immunity_minutes: DEFAULT_KIDNAP_IMMUNITY_MINUTES,
        }
    }
}

/// Partial update for [`GuildConfig`]. `None` leaves a field untouched; the
/// channel fields nest a second `Option` so `Some(None)` clears the value.
#[derive(Debug, Clone, Default)]
pub struct GuildConfigPatch {
    pub default_text_channel_id: Option<Option<u64>>,
    pub temp_channel_id: Option<Option<u64>>,
    pub afk_channel_id: Option<Option<u64>>,
    pub kidnap_channel_id: Option<Option<u64>>,
    pub prefix: Option<String>,
    pub auto_move_enabled: Option<bool>,
    pub timer_min_minutes: Option<u32>,
    pub timer_max_minutes: Option<u32>,
    pub kidnap_immunity_minutes: Option<u32>,
}

impl GuildConfigPatch {
    pub fn is_empty(&self) -> bool {
        self.default_text_channel_id.is_none()
            && self.temp_channel_id.is_none()
            && self.afk_channel_id.is_none()
            && self.kidnap_channel_id.is_none()
            && self.prefix.is_none()
            && self.auto_move_enabled.is_none()
            && self.timer_min_minutes.is_none()
            && self.timer_max_minutes.is_none()
            && self.kidnap_immunity_minutes.is_none()
    }

    /// Ingest loosely-typed external input (command arguments and the like).
    /// Unknown keys are logged and dropped rather than rejected so older
    /// callers keep working; values are coerced like the persisted document.
    pub fn from_json(fields: &Value) -> Self {
        let mut patch = GuildConfigPatch::default();
        let Some(map) = fields.as_object() else {
            warn!("Store: guild config update is not an object, ignoring");
            return patch;
        };
        for (key, value) in map {
            match key.as_str() {
                "default_text_channel_id" => {
                    patch.default_text_channel_id = Some(coerce::id_from_value(value));
                }
                "temp_channel_id" => patch.temp_channel_id = Some(coerce::id_from_value(value)),
                "afk_channel_id" => patch.afk_channel_id = Some(coerce::id_from_value(value)),
                "kidnap_channel_id" => {
                    patch.kidnap_channel_id = Some(coerce::id_from_value(value));
                }
                "prefix" => {
                    if let Some(text) = value.as_str() {
                        patch.prefix = Some(text.to_string());
                    }
                }
                "auto_move_enabled" => patch.auto_move_enabled = coerce::flag_from_value(value),
                "timer_min_minutes" => patch.timer_min_minutes = coerce::minutes_from_value(value),
                "timer_max_minutes" => patch.timer_max_minutes = coerce::minutes_from_value(value),
                "kidnap_immunity_minutes" => {
                    patch.kidnap_immunity_minutes = coerce::minutes_from_value(value);
                }
                other => warn!("Store: unknown guild config field '{other}' ignored"),
            }
        }
        patch
    }

    pub fn apply(&self, config: &mut GuildConfig) {
        if let Some(value) = self.default_text_channel_id {
            config.default_text_channel_id = value;
        }
        if let Some(value) = self.temp_channel_id {
            config.temp_channel_id = value;
        }
        if let Some(value) = self.afk_channel_id {
            config.afk_channel_id = value;
        }
        if let Some(value) = self.kidnap_channel_id {
            config.kidnap_channel_id = value;
        }
        if let Some(prefix) = &self.prefix {
            config.prefix = prefix.clone();
        }
        if let Some(enabled) = self.auto_move_enabled {
            config.auto_move_enabled = enabled;
        }
        if let Some(minutes) = self.timer_min_minutes {
            config.timer_min_minutes = minutes;
        }
        if let Some(minutes) = self.timer_max_minutes {
            config.timer_max_minutes = minutes;
        }
        if let Some(minutes) = self.kidnap_immunity_minutes {
            config.kidnap_immunity_minutes = minutes;
        }
    }
}

/// Tracked per-user counters plus the opt-out preference and the last
/// display name seen for the user (kept so leaderboards can still label
/// members who have left the guild).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserStat {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default)]
    pub visits: u64,
    #[serde(default, alias = "kidnaps")]
    pub kidnapped: u64,
    #[serde(default)]
    pub kidnap_attempts: u64,
    #[serde(default)]
    pub kidnap_successes: u64,
    #[serde(default)]
    pub kidnap_failures: u64,
    #[serde(default, deserialize_with = "coerce::de_flag_false")]
    pub kidnap_opt_out: bool,
}

impl UserStat {
    pub fn counter(&self, stat: StatKind) -> u64 {
        match stat {
            StatKind::Visits => self.visits,
            StatKind::Kidnapped => self.kidnapped,
            StatKind::KidnapAttempts => self.kidnap_attempts,
            StatKind::KidnapSuccesses => self.kidnap_successes,
            StatKind::KidnapFailures => self.kidnap_failures,
        }
    }

    /// Apply a signed delta to one counter, flooring at zero.
    pub fn apply(&mut self, stat: StatKind, amount: i64) {
        let counter = match stat {
            StatKind::Visits => &mut self.visits,
            StatKind::Kidnapped => &mut self.kidnapped,
            StatKind::KidnapAttempts => &mut self.kidnap_attempts,
            StatKind::KidnapSuccesses => &mut self.kidnap_successes,
            StatKind::KidnapFailures => &mut self.kidnap_failures,
        };
        *counter = counter.saturating_add_signed(amount);
    }
}

/// The five tracked counters. [`StatKind::resolve`] accepts the historical
/// aliases so older callers (and imported documents) keep working.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatKind {
    Visits,
    Kidnapped,
    KidnapAttempts,
    KidnapSuccesses,
    KidnapFailures,
}

impl StatKind {
    pub fn resolve(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "visits" => Some(StatKind::Visits),
            "kidnapped" | "kidnaps" | "kidnap" => Some(StatKind::Kidnapped),
            "kidnap_attempts" => Some(StatKind::KidnapAttempts),
            "kidnap_successes" | "kidnap_success" => Some(StatKind::KidnapSuccesses),
            "kidnap_failures" | "kidnap_failure" => Some(StatKind::KidnapFailures),
            _ => None,
        }
    }

    /// Canonical name, which is also the database column and document key.
    pub fn column(self) -> &'static str {
        match self {
            StatKind::Visits => "visits",
            StatKind::Kidnapped => "kidnapped",
            StatKind::KidnapAttempts => "kidnap_attempts",
            StatKind::KidnapSuccesses => "kidnap_successes",
            StatKind::KidnapFailures => "kidnap_failures",
        }
    }
}

/// Preference flags, stored alongside stats but never treated as counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UserPreferences {
    pub kidnap_opt_out: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct UserPreferencesPatch {
    pub kidnap_opt_out: Option<bool>,
}

impl UserPreferencesPatch {
    pub fn opt_out(value: bool) -> Self {
        UserPreferencesPatch {
            kidnap_opt_out: Some(value),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.kidnap_opt_out.is_none()
    }

    /// Same ingest policy as [`GuildConfigPatch::from_json`].
    pub fn from_json(fields: &Value) -> Self {
        let mut patch = UserPreferencesPatch::default();
        let Some(map) = fields.as_object() else {
            warn!("Store: user preference update is not an object, ignoring");
            return patch;
        };
        for (key, value) in map {
            match key.as_str() {
                "kidnap_opt_out" => patch.kidnap_opt_out = coerce::flag_from_value(value),
                other => warn!("Store: unknown user preference '{other}' ignored"),
            }
        }
        patch
    }
}

/// A deferred kidnap waiting for its trigger (a due time, or the next visit
/// when `due_at` is `None`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingKidnap {
    #[serde(default, deserialize_with = "coerce::de_id_or_zero")]
    pub initiator_id: u64,
    #[serde(default, with = "coerce::opt_timestamp")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, with = "coerce::opt_timestamp")]
    pub due_at: Option<DateTime<Utc>>,
}

/// Scheduling state for the periodic guild visit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuildTimer {
    #[serde(default, with = "coerce::opt_timestamp")]
    pub next_visit_at: Option<DateTime<Utc>>,
    #[serde(default, with = "coerce::opt_timestamp")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// One guild's full state in the backend-agnostic nested shape shared by
/// `load_all`/`save_all`. Serializes to exactly the legacy document format:
/// flat config fields plus `stats`, `pending_kidnaps`, and `timer` sections.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GuildPayload {
    #[serde(flatten)]
    pub config: GuildConfig,
    #[serde(default)]
    pub stats: BTreeMap<String, UserStat>,
    #[serde(default)]
    pub pending_kidnaps: BTreeMap<String, PendingKidnap>,
    #[serde(default)]
    pub timer: GuildTimer,
}

/// Every guild's payload, keyed by guild-id-as-string.
pub type GuildMap = BTreeMap<String, GuildPayload>;

/// The capability contract every backend exposes. Command handlers, the
/// timer loop, and event hooks depend only on this trait.
pub trait GuildStore: Send + Sync {
    /// Raw export of every guild payload (diagnostics and migration).
    /// Degrades to an empty map on I/O failure.
    fn load_all(&self) -> GuildMap;

    /// Destructive bulk replace: wipes all existing state, then loads
    /// `data`. Used by the one-shot migration, never by runtime code.
    fn save_all(&self, data: &GuildMap) -> Result<(), StoreError>;

    /// Current config values; defaults for a guild that was never written.
    fn get_guild_config(&self, guild_id: u64) -> GuildConfig;

    /// Upsert only the fields supplied in `patch`. An empty patch is a no-op.
    fn set_guild_config(&self, guild_id: u64, patch: &GuildConfigPatch) -> Result<(), StoreError>;

    /// Apply a signed delta to one named counter (after alias resolution),
    /// flooring the result at zero. Unknown stat names are warned about and
    /// ignored. A supplied `display_name` is recorded even when `amount` is
    /// zero; `amount == 0` with no display name does nothing.
    fn increment_user_stat(
        &self,
        guild_id: u64,
        user_id: u64,
        stat: &str,
        amount: i64,
        display_name: Option<&str>,
    ) -> Result<(), StoreError>;

    /// Full per-user breakdown for the guild, keyed by user-id-as-string.
    fn get_guild_stats(&self, guild_id: u64) -> BTreeMap<String, UserStat>;

    fn set_user_preferences(
        &self,
        guild_id: u64,
        user_id: u64,
        prefs: &UserPreferencesPatch,
    ) -> Result<(), StoreError>;

    fn get_user_preferences(&self, guild_id: u64, user_id: u64) -> UserPreferences;

    /// Record a deferred kidnap; overwrites any existing entry for the pair.
    fn set_pending_kidnap(
        &self,
        guild_id: u64,
        target_id: u64,
        initiator_id: u64,
        due_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError>;

    fn clear_pending_kidnap(&self, guild_id: u64, target_id: u64) -> Result<(), StoreError>;

    fn get_pending_kidnap(&self, guild_id: u64, target_id: u64) -> Option<PendingKidnap>;

    /// All pending entries keyed by `(guild_id, target_id)`, for rebuilding
    /// the in-memory index at boot.
    fn load_pending_kidnaps(&self) -> HashMap<(u64, u64), PendingKidnap>;

    fn set_guild_timer(
        &self,
        guild_id: u64,
        next_visit_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError>;

    fn get_guild_timer(&self, guild_id: u64) -> Option<DateTime<Utc>>;

    fn load_guild_timers(&self) -> HashMap<u64, Option<DateTime<Utc>>>;
}
