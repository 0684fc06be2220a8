use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, ToSql};
use tracing::{debug, error, info, warn};

use super::{
    coerce, GuildConfig, GuildConfigPatch, GuildMap, GuildPayload, GuildStore, GuildTimer,
    JsonGuildStore, PendingKidnap, StatKind, StoreError, UserPreferences, UserPreferencesPatch,
    UserStat,
};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS guilds (
        guild_id TEXT PRIMARY KEY,
        default_text_channel_id TEXT,
        temp_channel_id TEXT,
        afk_channel_id TEXT,
        kidnap_channel_id TEXT,
        prefix TEXT NOT NULL DEFAULT '*',
        auto_move_enabled INTEGER NOT NULL DEFAULT 1,
        timer_min_minutes INTEGER NOT NULL DEFAULT 2,
        timer_max_minutes INTEGER NOT NULL DEFAULT 30,
        kidnap_immunity_minutes INTEGER NOT NULL DEFAULT 30,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS user_stats (
        guild_id TEXT NOT NULL REFERENCES guilds(guild_id) ON DELETE CASCADE,
        user_id TEXT NOT NULL,
        display_name TEXT,
        visits INTEGER NOT NULL DEFAULT 0,
        kidnapped INTEGER NOT NULL DEFAULT 0,
        kidnap_attempts INTEGER NOT NULL DEFAULT 0,
        kidnap_successes INTEGER NOT NULL DEFAULT 0,
        kidnap_failures INTEGER NOT NULL DEFAULT 0,
        kidnap_opt_out INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (guild_id, user_id)
    );

    CREATE TABLE IF NOT EXISTS pending_kidnaps (
        guild_id TEXT NOT NULL REFERENCES guilds(guild_id) ON DELETE CASCADE,
        user_id TEXT NOT NULL,
        initiator_id TEXT NOT NULL,
        created_at TEXT,
        due_at TEXT,
        PRIMARY KEY (guild_id, user_id)
    );

    CREATE TABLE IF NOT EXISTS guild_timers (
        guild_id TEXT PRIMARY KEY REFERENCES guilds(guild_id) ON DELETE CASCADE,
        next_visit_at TEXT,
        updated_at TEXT NOT NULL
    );
";

/// SQLite-backed guild store. Ids are stored as TEXT to avoid precision loss
/// on very large platform-assigned ids; timestamps are ISO-8601 UTC text.
#[derive(Clone)]
pub struct SqliteGuildStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteGuildStore {
    /// Open (or create) the database at `path` and initialize the schema.
    /// Schema failure is fatal: without it the store is unusable.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        Self::from_connection(Connection::open(path)?)
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch("PRAGMA foreign_keys = ON")?;
        info!("Store: initializing sqlite schema");
        conn.execute_batch(SCHEMA)?;
        // Databases created before the display_name column existed get it
        // here; the error when it is already present is expected.
        if let Err(err) = conn.execute("ALTER TABLE user_stats ADD COLUMN display_name TEXT", []) {
            debug!("Store: display_name column migration skipped: {err}");
        }
        Ok(SqliteGuildStore {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// One-shot legacy import: if `json_path` exists and no guild row has
    /// ever been written, load the document and replace the (empty) database
    /// contents with it. Returns whether an import happened. A no-op on
    /// every start after the first, since guild rows then exist.
    pub fn bootstrap_from_json<P: AsRef<Path>>(&self, json_path: P) -> Result<bool, StoreError> {
        let json_path = json_path.as_ref();
        if !json_path.exists() {
            return Ok(false);
        }
        if self.has_guilds()? {
            return Ok(false);
        }
        let data = JsonGuildStore::new(json_path).load_all();
        if data.is_empty() {
            return Ok(false);
        }
        info!(
            "Store: importing {} legacy guilds from {}",
            data.len(),
            json_path.display()
        );
        self.save_all(&data)?;
        Ok(true)
    }

    fn has_guilds(&self) -> rusqlite::Result<bool> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT 1 FROM guilds LIMIT 1")?;
        stmt.exists([])
    }

    // Dependent tables reference guilds(guild_id), so every mutating call
    // upserts the owning row first.
    fn ensure_guild_row(conn: &Connection, guild_id: u64) -> rusqlite::Result<()> {
        let now = coerce::format_timestamp(&Utc::now());
        conn.execute(
            "INSERT INTO guilds (guild_id, created_at, updated_at) VALUES (?1, ?2, ?2)
             ON CONFLICT(guild_id) DO NOTHING",
            (guild_id.to_string(), now),
        )?;
        Ok(())
    }

    fn config_from_row(row: &Row<'_>) -> rusqlite::Result<GuildConfig> {
        Ok(GuildConfig {
            default_text_channel_id: id_column(row, 0)?,
            temp_channel_id: id_column(row, 1)?,
            afk_channel_id: id_column(row, 2)?,
            kidnap_channel_id: id_column(row, 3)?,
            prefix: row.get(4)?,
            auto_move_enabled: row.get(5)?,
            timer_min_minutes: row.get(6)?,
            timer_max_minutes: row.get(7)?,
            kidnap_immunity_minutes: row.get(8)?,
        })
    }

    fn query_guild_config(&self, guild_id: u64) -> rusqlite::Result<Option<GuildConfig>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT default_text_channel_id, temp_channel_id, afk_channel_id,
                    kidnap_channel_id, prefix, auto_move_enabled, timer_min_minutes,
                    timer_max_minutes, kidnap_immunity_minutes
             FROM guilds WHERE guild_id = ?1",
            [guild_id.to_string()],
            Self::config_from_row,
        )
        .optional()
    }

    fn query_guild_stats(&self, guild_id: u64) -> rusqlite::Result<BTreeMap<String, UserStat>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT user_id, display_name, visits, kidnapped, kidnap_attempts,
                    kidnap_successes, kidnap_failures, kidnap_opt_out
             FROM user_stats WHERE guild_id = ?1",
        )?;
        let rows = stmt.query_map([guild_id.to_string()], |row| {
            Ok((row.get::<_, String>(0)?, stat_from_row(row)?))
        })?;

        let mut stats = BTreeMap::new();
        for row in rows {
            let (user_id, stat) = row?;
            stats.insert(user_id, stat);
        }
        Ok(stats)
    }

    fn query_all(&self) -> rusqlite::Result<GuildMap> {
        let conn = self.conn.lock().unwrap();
        let mut payload = GuildMap::new();

        let mut stmt = conn.prepare(
            "SELECT guild_id, default_text_channel_id, temp_channel_id, afk_channel_id,
                    kidnap_channel_id, prefix, auto_move_enabled, timer_min_minutes,
                    timer_max_minutes, kidnap_immunity_minutes
             FROM guilds",
        )?;
        let guild_rows = stmt.query_map([], |row| {
            let guild_id: String = row.get(0)?;
            let config = GuildConfig {
                default_text_channel_id: id_column(row, 1)?,
                temp_channel_id: id_column(row, 2)?,
                afk_channel_id: id_column(row, 3)?,
                kidnap_channel_id: id_column(row, 4)?,
                prefix: row.get(5)?,
                auto_move_enabled: row.get(6)?,
                timer_min_minutes: row.get(7)?,
                timer_max_minutes: row.get(8)?,
                kidnap_immunity_minutes: row.get(9)?,
            };
            Ok((guild_id, config))
        })?;
        for row in guild_rows {
            let (guild_id, config) = row?;
            payload.insert(
                guild_id,
                GuildPayload {
                    config,
                    ..GuildPayload::default()
                },
            );
        }

        let mut stmt = conn.prepare(
            "SELECT guild_id, user_id, display_name, visits, kidnapped, kidnap_attempts,
                    kidnap_successes, kidnap_failures, kidnap_opt_out
             FROM user_stats",
        )?;
        let stat_rows = stmt.query_map([], |row| {
            let guild_id: String = row.get(0)?;
            let user_id: String = row.get(1)?;
            let stat = UserStat {
                display_name: row.get(2)?,
                visits: row.get(3)?,
                kidnapped: row.get(4)?,
                kidnap_attempts: row.get(5)?,
                kidnap_successes: row.get(6)?,
                kidnap_failures: row.get(7)?,
                kidnap_opt_out: row.get(8)?,
            };
            Ok((guild_id, user_id, stat))
        })?;
        for row in stat_rows {
            let (guild_id, user_id, stat) = row?;
            payload.entry(guild_id).or_default().stats.insert(user_id, stat);
        }

        let mut stmt = conn.prepare(
            "SELECT guild_id, user_id, initiator_id, created_at, due_at FROM pending_kidnaps",
        )?;
        let pending_rows = stmt.query_map([], |row| {
            let guild_id: String = row.get(0)?;
            let user_id: String = row.get(1)?;
            Ok((guild_id, user_id, pending_from_row(row, 2)?))
        })?;
        for row in pending_rows {
            let (guild_id, user_id, entry) = row?;
            payload
                .entry(guild_id)
                .or_default()
                .pending_kidnaps
                .insert(user_id, entry);
        }

        let mut stmt =
            conn.prepare("SELECT guild_id, next_visit_at, updated_at FROM guild_timers")?;
        let timer_rows = stmt.query_map([], |row| {
            let guild_id: String = row.get(0)?;
            let timer = GuildTimer {
                next_visit_at: timestamp_column(row, 1)?,
                updated_at: timestamp_column(row, 2)?,
            };
            Ok((guild_id, timer))
        })?;
        for row in timer_rows {
            let (guild_id, timer) = row?;
            payload.entry(guild_id).or_default().timer = timer;
        }

        Ok(payload)
    }
}

impl GuildStore for SqliteGuildStore {
    fn load_all(&self) -> GuildMap {
        match self.query_all() {
            Ok(payload) => payload,
            Err(err) => {
                error!("Store: failed to export guild payloads: {err}");
                GuildMap::new()
            }
        }
    }

    fn save_all(&self, data: &GuildMap) -> Result<(), StoreError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        tx.execute("DELETE FROM pending_kidnaps", [])?;
        tx.execute("DELETE FROM user_stats", [])?;
        tx.execute("DELETE FROM guild_timers", [])?;
        tx.execute("DELETE FROM guilds", [])?;

        let now = coerce::format_timestamp(&Utc::now());
        for (guild_key, payload) in data {
            let config = &payload.config;
            tx.execute(
                "INSERT INTO guilds (
                    guild_id, default_text_channel_id, temp_channel_id, afk_channel_id,
                    kidnap_channel_id, prefix, auto_move_enabled, timer_min_minutes,
                    timer_max_minutes, kidnap_immunity_minutes, created_at, updated_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11)",
                params![
                    guild_key,
                    config.default_text_channel_id.map(|id| id.to_string()),
                    config.temp_channel_id.map(|id| id.to_string()),
                    config.afk_channel_id.map(|id| id.to_string()),
                    config.kidnap_channel_id.map(|id| id.to_string()),
                    config.prefix,
                    config.auto_move_enabled,
                    config.timer_min_minutes,
                    config.timer_max_minutes,
                    config.kidnap_immunity_minutes,
                    now,
                ],
            )?;

            for (user_key, stat) in &payload.stats {
                tx.execute(
                    "INSERT INTO user_stats (
                        guild_id, user_id, display_name, visits, kidnapped, kidnap_attempts,
                        kidnap_successes, kidnap_failures, kidnap_opt_out
                     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                    params![
                        guild_key,
                        user_key,
                        stat.display_name,
                        stat.visits,
                        stat.kidnapped,
                        stat.kidnap_attempts,
                        stat.kidnap_successes,
                        stat.kidnap_failures,
                        stat.kidnap_opt_out,
                    ],
                )?;
            }

            for (user_key, entry) in &payload.pending_kidnaps {
                tx.execute(
                    "INSERT INTO pending_kidnaps (guild_id, user_id, initiator_id, created_at, due_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        guild_key,
                        user_key,
                        entry.initiator_id.to_string(),
                        entry.created_at.as_ref().map(coerce::format_timestamp),
                        entry.due_at.as_ref().map(coerce::format_timestamp),
                    ],
                )?;
            }

            if payload.timer.next_visit_at.is_some() {
                // Keep the imported audit stamp when the document carries one.
                let timer_updated = payload
                    .timer
                    .updated_at
                    .as_ref()
                    .map(coerce::format_timestamp)
                    .unwrap_or_else(|| now.clone());
                tx.execute(
                    "INSERT INTO guild_timers (guild_id, next_visit_at, updated_at)
                     VALUES (?1, ?2, ?3)",
                    params![
                        guild_key,
                        payload.timer.next_visit_at.as_ref().map(coerce::format_timestamp),
                        timer_updated,
                    ],
                )?;
            }
        }

        tx.commit()?;
        info!("Store: bulk import of {} guilds complete", data.len());
        Ok(())
    }

    fn get_guild_config(&self, guild_id: u64) -> GuildConfig {
        match self.query_guild_config(guild_id) {
            Ok(Some(config)) => config,
            Ok(None) => GuildConfig::default(),
            Err(err) => {
                error!("Store: failed to read config for guild {guild_id}: {err}");
                GuildConfig::default()
            }
        }
    }

    fn set_guild_config(&self, guild_id: u64, patch: &GuildConfigPatch) -> Result<(), StoreError> {
        if patch.is_empty() {
            return Ok(());
        }

        let mut columns: Vec<&str> = Vec::new();
        let mut values: Vec<Box<dyn ToSql>> = Vec::new();
        if let Some(value) = patch.default_text_channel_id {
            columns.push("default_text_channel_id");
            values.push(Box::new(value.map(|id| id.to_string())));
        }
        if let Some(value) = patch.temp_channel_id {
            columns.push("temp_channel_id");
            values.push(Box::new(value.map(|id| id.to_string())));
        }
        if let Some(value) = patch.afk_channel_id {
            columns.push("afk_channel_id");
            values.push(Box::new(value.map(|id| id.to_string())));
        }
        if let Some(value) = patch.kidnap_channel_id {
            columns.push("kidnap_channel_id");
            values.push(Box::new(value.map(|id| id.to_string())));
        }
        if let Some(prefix) = &patch.prefix {
            columns.push("prefix");
            values.push(Box::new(prefix.clone()));
        }
        if let Some(enabled) = patch.auto_move_enabled {
            columns.push("auto_move_enabled");
            values.push(Box::new(enabled));
        }
        if let Some(minutes) = patch.timer_min_minutes {
            columns.push("timer_min_minutes");
            values.push(Box::new(minutes));
        }
        if let Some(minutes) = patch.timer_max_minutes {
            columns.push("timer_max_minutes");
            values.push(Box::new(minutes));
        }
        if let Some(minutes) = patch.kidnap_immunity_minutes {
            columns.push("kidnap_immunity_minutes");
            values.push(Box::new(minutes));
        }

        let set_clause = columns
            .iter()
            .enumerate()
            .map(|(index, column)| format!("{column} = ?{}", index + 1))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "UPDATE guilds SET {set_clause}, updated_at = ?{} WHERE guild_id = ?{}",
            columns.len() + 1,
            columns.len() + 2,
        );
        values.push(Box::new(coerce::format_timestamp(&Utc::now())));
        values.push(Box::new(guild_id.to_string()));

        let conn = self.conn.lock().unwrap();
        Self::ensure_guild_row(&conn, guild_id)?;
        let params_slice: Vec<&dyn ToSql> = values.iter().map(|value| value.as_ref()).collect();
        conn.execute(&sql, &params_slice[..])?;
        Ok(())
    }

    fn increment_user_stat(
        &self,
        guild_id: u64,
        user_id: u64,
        stat: &str,
        amount: i64,
        display_name: Option<&str>,
    ) -> Result<(), StoreError> {
        let Some(kind) = StatKind::resolve(stat) else {
            warn!("Store: unknown stat type '{stat}' ignored");
            return Ok(());
        };
        if amount == 0 && display_name.is_none() {
            return Ok(());
        }

        // One statement, clamped server-side: the insert path floors the
        // initial value at zero, the conflict path floors the sum.
        let column = kind.column();
        let sql = format!(
            "INSERT INTO user_stats (guild_id, user_id, display_name, {column})
             VALUES (?1, ?2, ?3, MAX(0, ?4))
             ON CONFLICT(guild_id, user_id) DO UPDATE SET
                 display_name = COALESCE(excluded.display_name, user_stats.display_name),
                 {column} = CASE
                     WHEN user_stats.{column} + ?4 < 0 THEN 0
                     ELSE user_stats.{column} + ?4
                 END"
        );

        let conn = self.conn.lock().unwrap();
        Self::ensure_guild_row(&conn, guild_id)?;
        conn.execute(
            &sql,
            params![guild_id.to_string(), user_id.to_string(), display_name, amount],
        )?;
        Ok(())
    }

    fn get_guild_stats(&self, guild_id: u64) -> BTreeMap<String, UserStat> {
        match self.query_guild_stats(guild_id) {
            Ok(stats) => stats,
            Err(err) => {
                error!("Store: failed to read stats for guild {guild_id}: {err}");
                BTreeMap::new()
            }
        }
    }

    fn set_user_preferences(
        &self,
        guild_id: u64,
        user_id: u64,
        prefs: &UserPreferencesPatch,
    ) -> Result<(), StoreError> {
        let Some(opt_out) = prefs.kidnap_opt_out else {
            return Ok(());
        };
        let conn = self.conn.lock().unwrap();
        Self::ensure_guild_row(&conn, guild_id)?;
        conn.execute(
            "INSERT INTO user_stats (guild_id, user_id, kidnap_opt_out) VALUES (?1, ?2, ?3)
             ON CONFLICT(guild_id, user_id) DO UPDATE SET
                 kidnap_opt_out = excluded.kidnap_opt_out",
            params![guild_id.to_string(), user_id.to_string(), opt_out],
        )?;
        Ok(())
    }

    fn get_user_preferences(&self, guild_id: u64, user_id: u64) -> UserPreferences {
        let conn = self.conn.lock().unwrap();
        let result = conn
            .query_row(
                "SELECT kidnap_opt_out FROM user_stats WHERE guild_id = ?1 AND user_id = ?2",
                params![guild_id.to_string(), user_id.to_string()],
                |row| row.get::<_, bool>(0),
            )
            .optional();
        match result {
            Ok(opt_out) => UserPreferences {
                kidnap_opt_out: opt_out.unwrap_or(false),
            },
            Err(err) => {
                error!("Store: failed to read preferences for user {user_id}: {err}");
                UserPreferences::default()
            }
        }
    }

    fn set_pending_kidnap(
        &self,
        guild_id: u64,
        target_id: u64,
        initiator_id: u64,
        due_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        Self::ensure_guild_row(&conn, guild_id)?;
        conn.execute(
            "INSERT INTO pending_kidnaps (guild_id, user_id, initiator_id, created_at, due_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(guild_id, user_id) DO UPDATE SET
                 initiator_id = excluded.initiator_id,
                 created_at = excluded.created_at,
                 due_at = excluded.due_at",
            params![
                guild_id.to_string(),
                target_id.to_string(),
                initiator_id.to_string(),
                coerce::format_timestamp(&Utc::now()),
                due_at.as_ref().map(coerce::format_timestamp),
            ],
        )?;
        Ok(())
    }

    fn clear_pending_kidnap(&self, guild_id: u64, target_id: u64) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM pending_kidnaps WHERE guild_id = ?1 AND user_id = ?2",
            params![guild_id.to_string(), target_id.to_string()],
        )?;
        Ok(())
    }

    fn get_pending_kidnap(&self, guild_id: u64, target_id: u64) -> Option<PendingKidnap> {
        let conn = self.conn.lock().unwrap();
        let result = conn
            .query_row(
                "SELECT initiator_id, created_at, due_at FROM pending_kidnaps
                 WHERE guild_id = ?1 AND user_id = ?2",
                params![guild_id.to_string(), target_id.to_string()],
                |row| pending_from_row(row, 0),
            )
            .optional();
        match result {
            Ok(entry) => entry,
            Err(err) => {
                error!("Store: failed to read pending kidnap for target {target_id}: {err}");
                None
            }
        }
    }

    fn load_pending_kidnaps(&self) -> HashMap<(u64, u64), PendingKidnap> {
        let conn = self.conn.lock().unwrap();
        let mut pending = HashMap::new();
        let mut stmt = match conn.prepare(
            "SELECT guild_id, user_id, initiator_id, created_at, due_at FROM pending_kidnaps",
        ) {
            Ok(stmt) => stmt,
            Err(err) => {
                error!("Store: failed to load pending kidnaps: {err}");
                return pending;
            }
        };
        let rows = stmt.query_map([], |row| {
            let guild_id: String = row.get(0)?;
            let user_id: String = row.get(1)?;
            Ok((guild_id, user_id, pending_from_row(row, 2)?))
        });
        match rows {
            Ok(rows) => {
                for row in rows.flatten() {
                    let (guild_key, user_key, entry) = row;
                    let (Some(guild_id), Some(user_id)) =
                        (coerce::id_from_text(&guild_key), coerce::id_from_text(&user_key))
                    else {
                        continue;
                    };
                    pending.insert((guild_id, user_id), entry);
                }
            }
            Err(err) => error!("Store: failed to load pending kidnaps: {err}"),
        }
        pending
    }

    fn set_guild_timer(
        &self,
        guild_id: u64,
        next_visit_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        Self::ensure_guild_row(&conn, guild_id)?;
        conn.execute(
            "INSERT INTO guild_timers (guild_id, next_visit_at, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(guild_id) DO UPDATE SET
                 next_visit_at = excluded.next_visit_at,
                 updated_at = excluded.updated_at",
            params![
                guild_id.to_string(),
                next_visit_at.as_ref().map(coerce::format_timestamp),
                coerce::format_timestamp(&Utc::now()),
            ],
        )?;
        Ok(())
    }

    fn get_guild_timer(&self, guild_id: u64) -> Option<DateTime<Utc>> {
        let conn = self.conn.lock().unwrap();
        let result = conn
            .query_row(
                "SELECT next_visit_at FROM guild_timers WHERE guild_id = ?1",
                [guild_id.to_string()],
                |row| timestamp_column(row, 0),
            )
            .optional();
        match result {
            Ok(next) => next.flatten(),
            Err(err) => {
                error!("Store: failed to read timer for guild {guild_id}: {err}");
                None
            }
        }
    }

    fn load_guild_timers(&self) -> HashMap<u64, Option<DateTime<Utc>>> {
        let conn = self.conn.lock().unwrap();
        let mut timers = HashMap::new();
        // LEFT JOIN so guilds without a timer row still report None.
        let mut stmt = match conn.prepare(
            "SELECT g.guild_id, t.next_visit_at
             FROM guilds g LEFT JOIN guild_timers t ON g.guild_id = t.guild_id",
        ) {
            Ok(stmt) => stmt,
            Err(err) => {
                error!("Store: failed to load guild timers: {err}");
                return timers;
            }
        };
        let rows = stmt.query_map([], |row| {
            let guild_id: String = row.get(0)?;
            Ok((guild_id, timestamp_column(row, 1)?))
        });
        match rows {
            Ok(rows) => {
                for (guild_key, next) in rows.flatten() {
                    if let Some(guild_id) = coerce::id_from_text(&guild_key) {
                        timers.insert(guild_id, next);
                    }
                }
            }
            Err(err) => error!("Store: failed to load guild timers: {err}"),
        }
        timers
    }
}

fn id_column(row: &Row<'_>, index: usize) -> rusqlite::Result<Option<u64>> {
    Ok(row
        .get::<_, Option<String>>(index)?
        .as_deref()
        .and_then(coerce::id_from_text))
}

fn timestamp_column(row: &Row<'_>, index: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    Ok(row
        .get::<_, Option<String>>(index)?
        .as_deref()
        .and_then(coerce::parse_timestamp))
}

fn stat_from_row(row: &Row<'_>) -> rusqlite::Result<UserStat> {
    Ok(UserStat {
        display_name: row.get(1)?,
        visits: row.get(2)?,
        kidnapped: row.get(3)?,
        kidnap_attempts: row.get(4)?,
        kidnap_successes: row.get(5)?,
        kidnap_failures: row.get(6)?,
        kidnap_opt_out: row.get(7)?,
    })
}

fn pending_from_row(row: &Row<'_>, offset: usize) -> rusqlite::Result<PendingKidnap> {
    let initiator: String = row.get(offset)?;
    Ok(PendingKidnap {
        initiator_id: coerce::id_from_text(&initiator).unwrap_or_default(),
        created_at: timestamp_column(row, offset + 1)?,
        due_at: timestamp_column(row, offset + 2)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_for_unwritten_guild() {
        let store = SqliteGuildStore::in_memory().unwrap();
        let config = store.get_guild_config(12345);
        assert_eq!(config, GuildConfig::default());
        assert_eq!(config.prefix, "*");
        assert!(config.auto_move_enabled);
        assert_eq!(config.timer_min_minutes, 2);
        assert_eq!(config.timer_max_minutes, 30);
        assert_eq!(config.kidnap_immunity_minutes, 30);
        assert_eq!(config.kidnap_channel_id, None);
    }

    #[test]
    fn test_schema_init_is_idempotent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("lizard.db");
        let first = SqliteGuildStore::open(&path).unwrap();
        first
            .set_guild_config(
                1,
                &GuildConfigPatch {
                    prefix: Some("!".to_string()),
                    ..GuildConfigPatch::default()
                },
            )
            .unwrap();
        drop(first);

        // Reopening runs schema creation again and must not lose anything.
        let second = SqliteGuildStore::open(&path).unwrap();
        assert_eq!(second.get_guild_config(1).prefix, "!");
    }

    #[test]
    fn test_config_upsert_keeps_unspecified_fields() {
        let store = SqliteGuildStore::in_memory().unwrap();
        store
            .set_guild_config(
                100,
                &GuildConfigPatch {
                    afk_channel_id: Some(Some(777)),
                    temp_channel_id: Some(Some(888)),
                    ..GuildConfigPatch::default()
                },
            )
            .unwrap();
        store
            .set_guild_config(
                100,
                &GuildConfigPatch {
                    prefix: Some("!!".to_string()),
                    ..GuildConfigPatch::default()
                },
            )
            .unwrap();

        let config = store.get_guild_config(100);
        assert_eq!(config.prefix, "!!");
        assert_eq!(config.afk_channel_id, Some(777));
        assert_eq!(config.temp_channel_id, Some(888));

        // Clearing uses an explicit null.
        store
            .set_guild_config(
                100,
                &GuildConfigPatch {
                    afk_channel_id: Some(None),
                    ..GuildConfigPatch::default()
                },
            )
            .unwrap();
        assert_eq!(store.get_guild_config(100).afk_channel_id, None);
    }

    #[test]
    fn test_increment_scenario_breakdown() {
        let store = SqliteGuildStore::in_memory().unwrap();
        for _ in 0..3 {
            store.increment_user_stat(100, 7, "visits", 1, None).unwrap();
        }
        store.increment_user_stat(100, 7, "kidnapped", 1, None).unwrap();

        let stats = store.get_guild_stats(100);
        let user = &stats["7"];
        assert_eq!(user.visits, 3);
        assert_eq!(user.kidnapped, 1);
        assert_eq!(user.kidnap_attempts, 0);
        assert_eq!(user.kidnap_successes, 0);
        assert_eq!(user.kidnap_failures, 0);
        assert!(!user.kidnap_opt_out);
        assert_eq!(user.display_name, None);
    }

    #[test]
    fn test_increment_clamps_at_zero() {
        let store = SqliteGuildStore::in_memory().unwrap();
        store.increment_user_stat(1, 2, "visits", -5, None).unwrap();
        assert_eq!(store.get_guild_stats(1)["2"].visits, 0);

        store.increment_user_stat(1, 2, "visits", 3, None).unwrap();
        store.increment_user_stat(1, 2, "visits", -10, None).unwrap();
        assert_eq!(store.get_guild_stats(1)["2"].visits, 0);
    }

    #[test]
    fn test_alias_and_unknown_stat() {
        let store = SqliteGuildStore::in_memory().unwrap();
        store.increment_user_stat(1, 2, "kidnaps", 1, None).unwrap();
        store.increment_user_stat(1, 2, "kidnapped", 1, None).unwrap();
        assert_eq!(store.get_guild_stats(1)["2"].kidnapped, 2);

        store.increment_user_stat(1, 2, "scales", 1, None).unwrap();
        let user = &store.get_guild_stats(1)["2"];
        assert_eq!(user.visits + user.kidnap_attempts + user.kidnap_successes, 0);
    }

    #[test]
    fn test_display_name_recorded_and_touched() {
        let store = SqliteGuildStore::in_memory().unwrap();
        store
            .increment_user_stat(5, 6, "visits", 1, Some("Old Name"))
            .unwrap();
        assert_eq!(
            store.get_guild_stats(5)["6"].display_name.as_deref(),
            Some("Old Name")
        );

        // Zero-amount touch updates only the name.
        store
            .increment_user_stat(5, 6, "visits", 0, Some("New Name"))
            .unwrap();
        let user = store.get_guild_stats(5)["6"].clone();
        assert_eq!(user.display_name.as_deref(), Some("New Name"));
        assert_eq!(user.visits, 1);

        // A plain increment leaves the cached name in place.
        store.increment_user_stat(5, 6, "visits", 1, None).unwrap();
        assert_eq!(
            store.get_guild_stats(5)["6"].display_name.as_deref(),
            Some("New Name")
        );
    }

    #[test]
    fn test_preferences_are_distinct_from_counters() {
        let store = SqliteGuildStore::in_memory().unwrap();
        store.increment_user_stat(9, 4, "visits", 2, None).unwrap();
        store
            .set_user_preferences(9, 4, &UserPreferencesPatch::opt_out(true))
            .unwrap();

        assert!(store.get_user_preferences(9, 4).kidnap_opt_out);
        assert_eq!(store.get_guild_stats(9)["4"].visits, 2);

        // Opting out before any stat exists creates the row with zeroes.
        store
            .set_user_preferences(9, 5, &UserPreferencesPatch::opt_out(true))
            .unwrap();
        let user = &store.get_guild_stats(9)["5"];
        assert!(user.kidnap_opt_out);
        assert_eq!(user.visits, 0);
    }

    #[test]
    fn test_pending_kidnap_lifecycle() {
        let store = SqliteGuildStore::in_memory().unwrap();
        let due = Utc.with_ymd_and_hms(2026, 9, 1, 10, 0, 0).unwrap();
        store.set_pending_kidnap(10, 20, 30, Some(due)).unwrap();

        let pending = store.get_pending_kidnap(10, 20).unwrap();
        assert_eq!(pending.initiator_id, 30);
        assert_eq!(pending.due_at, Some(due));
        assert!(pending.created_at.is_some());

        // Overwrite semantics: one active entry per pair.
        store.set_pending_kidnap(10, 20, 99, None).unwrap();
        let pending = store.get_pending_kidnap(10, 20).unwrap();
        assert_eq!(pending.initiator_id, 99);
        assert_eq!(pending.due_at, None);

        let all = store.load_pending_kidnaps();
        assert_eq!(all.len(), 1);
        assert_eq!(all[&(10, 20)].initiator_id, 99);

        store.clear_pending_kidnap(10, 20).unwrap();
        assert!(store.get_pending_kidnap(10, 20).is_none());
        assert!(store.load_pending_kidnaps().is_empty());
    }

    #[test]
    fn test_timer_set_get_and_reload() {
        let store = SqliteGuildStore::in_memory().unwrap();
        let next = Utc.with_ymd_and_hms(2026, 8, 8, 12, 30, 0).unwrap();
        store.set_guild_timer(100, Some(next)).unwrap();
        assert_eq!(store.get_guild_timer(100), Some(next));

        let timers = store.load_guild_timers();
        assert_eq!(timers.get(&100), Some(&Some(next)));

        // Disarming keeps the row but clears the time; guilds without any
        // timer row still show up as None.
        store.set_guild_timer(100, None).unwrap();
        store
            .set_guild_config(
                200,
                &GuildConfigPatch {
                    prefix: Some("x".to_string()),
                    ..GuildConfigPatch::default()
                },
            )
            .unwrap();
        let timers = store.load_guild_timers();
        assert_eq!(timers.get(&100), Some(&None));
        assert_eq!(timers.get(&200), Some(&None));
    }

    #[test]
    fn test_save_all_then_load_all_round_trips() {
        let store = SqliteGuildStore::in_memory().unwrap();
        store
            .set_guild_config(
                1,
                &GuildConfigPatch {
                    prefix: Some("!".to_string()),
                    kidnap_channel_id: Some(Some(555)),
                    ..GuildConfigPatch::default()
                },
            )
            .unwrap();
        store
            .increment_user_stat(1, 7, "visits", 4, Some("Liz"))
            .unwrap();
        store.set_pending_kidnap(1, 8, 9, None).unwrap();
        let next = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        store.set_guild_timer(1, Some(next)).unwrap();

        let exported = store.load_all();

        let replica = SqliteGuildStore::in_memory().unwrap();
        replica.save_all(&exported).unwrap();
        assert_eq!(replica.load_all(), exported);
        assert_eq!(replica.get_guild_config(1).kidnap_channel_id, Some(555));
        assert_eq!(replica.get_guild_stats(1)["7"].visits, 4);
        assert_eq!(replica.get_guild_timer(1), Some(next));
    }

    #[test]
    fn test_bootstrap_runs_once() {
        let dir = tempdir().unwrap();
        let json_path = dir.path().join("guild_configs.json");
        std::fs::write(
            &json_path,
            serde_json::to_string_pretty(&json!({
                "100": {
                    "prefix": "!",
                    "stats": { "7": { "visits": 5 } }
                }
            }))
            .unwrap(),
        )
        .unwrap();

        let store = SqliteGuildStore::open(dir.path().join("lizard.db")).unwrap();
        assert!(store.bootstrap_from_json(&json_path).unwrap());
        assert_eq!(store.get_guild_config(100).prefix, "!");
        assert_eq!(store.get_guild_stats(100)["7"].visits, 5);

        // Relational writes after the import must survive a second attempt.
        store.increment_user_stat(100, 7, "visits", 1, None).unwrap();
        assert!(!store.bootstrap_from_json(&json_path).unwrap());
        assert_eq!(store.get_guild_stats(100)["7"].visits, 6);

        // Simulated restart: rows exist, so the import stays skipped.
        drop(store);
        let reopened = SqliteGuildStore::open(dir.path().join("lizard.db")).unwrap();
        assert!(!reopened.bootstrap_from_json(&json_path).unwrap());
        assert_eq!(reopened.get_guild_stats(100)["7"].visits, 6);
    }

    #[test]
    fn test_bootstrap_reads_document_written_by_json_backend() {
        let dir = tempdir().unwrap();
        let json_path = dir.path().join("guild_configs.json");

        let legacy = JsonGuildStore::new(&json_path);
        legacy
            .set_guild_config(
                100,
                &GuildConfigPatch {
                    prefix: Some("~".to_string()),
                    ..GuildConfigPatch::default()
                },
            )
            .unwrap();
        legacy
            .increment_user_stat(100, 7, "visits", 3, Some("Liz"))
            .unwrap();
        let due = Utc.with_ymd_and_hms(2026, 10, 1, 9, 0, 0).unwrap();
        legacy.set_pending_kidnap(100, 8, 42, Some(due)).unwrap();
        legacy.set_guild_timer(100, Some(due)).unwrap();

        let store = SqliteGuildStore::in_memory().unwrap();
        assert!(store.bootstrap_from_json(&json_path).unwrap());

        assert_eq!(store.get_guild_config(100).prefix, "~");
        let user = &store.get_guild_stats(100)["7"];
        assert_eq!(user.visits, 3);
        assert_eq!(user.display_name.as_deref(), Some("Liz"));
        let pending = store.get_pending_kidnap(100, 8).unwrap();
        assert_eq!(pending.initiator_id, 42);
        assert_eq!(pending.due_at, Some(due));
        assert_eq!(store.get_guild_timer(100), Some(due));
    }

    #[test]
    fn test_bootstrap_without_legacy_file() {
        let dir = tempdir().unwrap();
        let store = SqliteGuildStore::in_memory().unwrap();
        assert!(!store
            .bootstrap_from_json(dir.path().join("missing.json"))
            .unwrap());
    }
}
