//! Telegram update handlers.
//!
//! Handlers are thin: they normalize the update (who, where, what) and
//! hand it to the state machine. Anything the machine did not consume is
//! a programming failure: logged with context and turned into a generic
//! user message so the event loop never dies.

use std::sync::Arc;

use teloxide::{
    prelude::*,
    types::{CallbackQuery, Message},
};

use crate::router::AppState;

mod callback;
mod commands;
mod text;
mod upload;

pub async fn handle_callback(
    bot: Bot,
    q: CallbackQuery,
    state: Arc<AppState>,
) -> ResponseResult<()> {
    callback::handle_callback(bot, q, state).await
}

pub async fn handle_message(bot: Bot, msg: Message, state: Arc<AppState>) -> ResponseResult<()> {
    if msg.from().is_none() {
        return Ok(());
    }

    if let Some(text) = msg.text() {
        if text.starts_with('/') {
            return commands::handle_command(bot, msg, state).await;
        }
        return text::handle_text(bot, msg, state).await;
    }

    if msg.video().is_some() || msg.audio().is_some() || msg.document().is_some() {
        return upload::handle_upload(bot, msg, state).await;
    }

    let _ = bot
        .send_message(
            msg.chat.id,
            "Send me a video, audio file, document, or URL to get started.",
        )
        .await;
    Ok(())
}

/// Top-level catch for failures the machine did not consume.
pub(crate) async fn report_failure(bot: &Bot, chat: teloxide::types::ChatId, err: mab_core::Error) {
    tracing::error!(error = %err, "update handling failed");
    let _ = bot
        .send_message(chat, "❌ An error occurred. Please try again.")
        .await;
}
