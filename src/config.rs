use dotenvy::dotenv;
use std::env;
use std::fs;
use std::path::PathBuf;
use tracing::{info, warn};

use crate::store::{GuildStore, JsonGuildStore, SqliteGuildStore, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Sqlite,
    Json,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub database_file: PathBuf,
    pub legacy_config_file: PathBuf,
    pub store_backend: StoreBackend,
}

impl Settings {
    pub fn from_env() -> Self {
        dotenv().ok();
        Self::build()
    }

    fn build() -> Self {
        let store_backend = match env::var("LIZARD_STORE_BACKEND") {
            Ok(value) if value.eq_ignore_ascii_case("json") => StoreBackend::Json,
            Ok(value) if value.eq_ignore_ascii_case("sqlite") => StoreBackend::Sqlite,
            Ok(other) => {
                warn!("Unknown LIZARD_STORE_BACKEND '{other}', using sqlite");
                StoreBackend::Sqlite
            }
            Err(_) => StoreBackend::Sqlite,
        };

        Settings {
            database_file: env::var("LIZARD_DATABASE_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("data/lizard.db")),
            legacy_config_file: env::var("LIZARD_CONFIG_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("guild_configs.json")),
            store_backend,
        }
    }

    /// Open the configured backend. For SQLite this also runs the one-shot
    /// legacy import when the database has no guild rows yet.
    pub fn open_store(&self) -> Result<Box<dyn GuildStore>, StoreError> {
        match self.store_backend {
            StoreBackend::Json => Ok(Box::new(JsonGuildStore::new(&self.legacy_config_file))),
            StoreBackend::Sqlite => {
                if let Some(parent) = self.database_file.parent() {
                    if !parent.as_os_str().is_empty() {
                        fs::create_dir_all(parent)?;
                    }
                }
                let store = SqliteGuildStore::open(&self.database_file)?;
                if store.bootstrap_from_json(&self.legacy_config_file)? {
                    info!(
                        "Imported legacy guild configuration from {}",
                        self.legacy_config_file.display()
                    );
                }
                Ok(Box::new(store))
            }
        }
    }
}
