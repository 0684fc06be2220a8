use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use super::{
    GuildConfig, GuildConfigPatch, GuildMap, GuildPayload, GuildStore, PendingKidnap, StatKind,
    StoreError, UserPreferences, UserPreferencesPatch, UserStat,
};

/// File-backed store keeping the whole configuration graph in one JSON
/// document. Every write re-reads the document, mutates it in memory, and
/// rewrites it wholesale; acceptable for this workload's call volume, kept
/// as the compatibility fallback and the source format for the one-shot
/// SQLite import.
pub struct JsonGuildStore {
    path: PathBuf,
}

impl JsonGuildStore {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        JsonGuildStore { path: path.into() }
    }

    fn read_document(&self) -> GuildMap {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return GuildMap::new(),
            Err(err) => {
                error!("Store: failed to read {}: {err}", self.path.display());
                return GuildMap::new();
            }
        };
        match serde_json::from_str(&raw) {
            Ok(data) => data,
            Err(err) => {
                warn!("Store: corrupt guild document {}: {err}", self.path.display());
                GuildMap::new()
            }
        }
    }

    // The original rewrote the target in place; writing a sibling temp file
    // and renaming keeps a crash mid-write from corrupting the document.
    fn write_document(&self, data: &GuildMap) -> Result<(), StoreError> {
        let body = serde_json::to_vec_pretty(data)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, &body)?;
        fs::rename(&tmp, &self.path)?;
        debug!("Store: guild document saved ({} guilds)", data.len());
        Ok(())
    }

    fn guild_entry<'a>(data: &'a mut GuildMap, guild_id: u64) -> &'a mut GuildPayload {
        data.entry(guild_id.to_string()).or_default()
    }
}

impl GuildStore for JsonGuildStore {
    fn load_all(&self) -> GuildMap {
        self.read_document()
    }

    fn save_all(&self, data: &GuildMap) -> Result<(), StoreError> {
        self.write_document(data)?;
        info!("Store: guild configurations saved");
        Ok(())
    }

    fn get_guild_config(&self, guild_id: u64) -> GuildConfig {
        let data = self.read_document();
        data.get(&guild_id.to_string())
            .map(|payload| payload.config.clone())
            .unwrap_or_default()
    }

    fn set_guild_config(&self, guild_id: u64, patch: &GuildConfigPatch) -> Result<(), StoreError> {
        if patch.is_empty() {
            return Ok(());
        }
        let mut data = self.read_document();
        patch.apply(&mut Self::guild_entry(&mut data, guild_id).config);
        self.write_document(&data)
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
        let mut data = self.read_document();
        let user = Self::guild_entry(&mut data, guild_id)
            .stats
            .entry(user_id.to_string())
            .or_default();
        user.apply(kind, amount);
        if let Some(name) = display_name {
            user.display_name = Some(name.to_string());
        }
        self.write_document(&data)
    }

    fn get_guild_stats(&self, guild_id: u64) -> BTreeMap<String, UserStat> {
        let data = self.read_document();
        data.get(&guild_id.to_string())
            .map(|payload| payload.stats.clone())
            .unwrap_or_default()
    }

    fn set_user_preferences(
        &self,
        guild_id: u64,
        user_id: u64,
        prefs: &UserPreferencesPatch,
    ) -> Result<(), StoreError> {
        if prefs.is_empty() {
            return Ok(());
        }
        let mut data = self.read_document();
        let user = Self::guild_entry(&mut data, guild_id)
            .stats
            .entry(user_id.to_string())
            .or_default();
        if let Some(opt_out) = prefs.kidnap_opt_out {
            user.kidnap_opt_out = opt_out;
        }
        self.write_document(&data)
    }

    fn get_user_preferences(&self, guild_id: u64, user_id: u64) -> UserPreferences {
        let data = self.read_document();
        let opt_out = data
            .get(&guild_id.to_string())
            .and_then(|payload| payload.stats.get(&user_id.to_string()))
            .map(|user| user.kidnap_opt_out)
            .unwrap_or(false);
        UserPreferences {
            kidnap_opt_out: opt_out,
        }
    }

    fn set_pending_kidnap(
        &self,
        guild_id: u64,
        target_id: u64,
        initiator_id: u64,
        due_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let mut data = self.read_document();
        Self::guild_entry(&mut data, guild_id).pending_kidnaps.insert(
            target_id.to_string(),
            PendingKidnap {
                initiator_id,
                created_at: Some(Utc::now()),
                due_at,
            },
        );
        self.write_document(&data)
    }

    fn clear_pending_kidnap(&self, guild_id: u64, target_id: u64) -> Result<(), StoreError> {
        let mut data = self.read_document();
        let removed = data
            .get_mut(&guild_id.to_string())
            .and_then(|payload| payload.pending_kidnaps.remove(&target_id.to_string()));
        if removed.is_some() {
            self.write_document(&data)?;
        }
        Ok(())
    }

    fn get_pending_kidnap(&self, guild_id: u64, target_id: u64) -> Option<PendingKidnap> {
        let data = self.read_document();
        data.get(&guild_id.to_string())
            .and_then(|payload| payload.pending_kidnaps.get(&target_id.to_string()))
            .cloned()
    }

    fn load_pending_kidnaps(&self) -> HashMap<(u64, u64), PendingKidnap> {
        let data = self.read_document();
        let mut pending = HashMap::new();
        for (guild_key, payload) in &data {
            let Some(guild_id) = parse_key(guild_key) else {
                continue;
            };
            for (user_key, entry) in &payload.pending_kidnaps {
                let Some(user_id) = parse_key(user_key) else {
                    continue;
                };
                pending.insert((guild_id, user_id), entry.clone());
            }
        }
        pending
    }

    fn set_guild_timer(
        &self,
        guild_id: u64,
        next_visit_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let mut data = self.read_document();
        let timer = &mut Self::guild_entry(&mut data, guild_id).timer;
        timer.next_visit_at = next_visit_at;
        timer.updated_at = Some(Utc::now());
        self.write_document(&data)
    }

    fn get_guild_timer(&self, guild_id: u64) -> Option<DateTime<Utc>> {
        let data = self.read_document();
        data.get(&guild_id.to_string())
            .and_then(|payload| payload.timer.next_visit_at)
    }

    fn load_guild_timers(&self) -> HashMap<u64, Option<DateTime<Utc>>> {
        let data = self.read_document();
        data.iter()
            .filter_map(|(guild_key, payload)| {
                parse_key(guild_key).map(|guild_id| (guild_id, payload.timer.next_visit_at))
            })
            .collect()
    }
}

fn parse_key(key: &str) -> Option<u64> {
    match key.parse() {
        Ok(id) => Some(id),
        Err(_) => {
            warn!("Store: skipping non-numeric guild document key '{key}'");
            None
        }
    }
}
