pub mod config;
pub mod state;
pub mod store;

pub use state::BotState;
pub use store::{GuildStore, JsonGuildStore, SqliteGuildStore, StoreError};
