use lizard_store::config::Settings;
use lizard_store::state::BotState;
use tracing::info;

fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    let settings = Settings::from_env();
    let store = settings.open_store()?;

    // Rebuild the runtime caches the way the bot does at startup, then
    // report what the store holds.
    let state = BotState::load(store.as_ref());
    let guilds = store.load_all();
    let armed_timers = state
        .guild_timers
        .values()
        .filter(|next| next.is_some())
        .count();

    info!(
        "Store ready: {} guilds, {} pending kidnaps, {} armed timers",
        guilds.len(),
        state.pending_kidnaps.len(),
        armed_timers
    );

    Ok(())
}
