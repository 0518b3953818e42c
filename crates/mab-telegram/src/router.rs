use std::sync::Arc;

use teloxide::{dispatching::Dispatcher as TgDispatcher, dptree, prelude::*};

use mab_core::{
    config::Config,
    dispatcher::Dispatcher,
    fetch::HttpFetcher,
    machine::Machine,
    messaging::{
        port::MessagingPort,
        throttled::{ThrottleConfig, ThrottledMessenger},
    },
    session::SessionStore,
    staging::Staging,
    tool::MediaToolPort,
};

use crate::handlers;
use crate::TelegramMessenger;

#[derive(Clone)]
pub struct AppState {
    pub machine: Arc<Machine>,
}

/// Wire the core behind the Telegram transport and run long polling.
///
/// The tool collaborator is injected so the binary decides the ffmpeg
/// implementation while this crate stays transport-only.
pub async fn run_polling(cfg: Arc<Config>, tool: Arc<dyn MediaToolPort>) -> anyhow::Result<()> {
    let bot = Bot::new(cfg.bot_token.clone());

    if let Ok(me) = bot.get_me().await {
        tracing::info!(username = %me.username(), "bot started");
    }
    tracing::info!(temp_dir = %cfg.temp_dir.display(), "staging area");

    // Wrap the raw messenger with a throttling decorator: progress edits
    // are the main 429 hazard. The adapter still retries RetryAfter once.
    let raw: Arc<dyn MessagingPort> = Arc::new(TelegramMessenger::new(bot.clone()));
    let messenger: Arc<dyn MessagingPort> =
        Arc::new(ThrottledMessenger::new(raw, ThrottleConfig::default()));

    let staging = Staging::new(cfg.temp_dir.clone());
    let store = SessionStore::new();
    let fetcher = Arc::new(HttpFetcher::new(cfg.download_timeout)?);
    let dispatcher = Arc::new(Dispatcher::new(
        cfg.clone(),
        tool,
        fetcher,
        messenger.clone(),
    ));
    let machine = Arc::new(Machine::new(store, staging, dispatcher, messenger));

    let state = Arc::new(AppState { machine });

    let handler = dptree::entry()
        .branch(Update::filter_callback_query().endpoint(handlers::handle_callback))
        .branch(Update::filter_message().endpoint(handlers::handle_message));

    TgDispatcher::builder(bot, handler)
        .dependencies(dptree::deps![state])
        .build()
        .dispatch()
        .await;

    Ok(())
}
