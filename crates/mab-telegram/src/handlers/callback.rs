use std::sync::Arc;

use teloxide::prelude::*;

use mab_core::domain::{ChatId, UserId};

use crate::handlers::report_failure;
use crate::router::AppState;

pub async fn handle_callback(
    bot: Bot,
    q: CallbackQuery,
    state: Arc<AppState>,
) -> ResponseResult<()> {
    let data = q.data.clone().unwrap_or_default();
    let chat = q.message.as_ref().map(|m| m.chat.id);

    // A button press with no chat or payload cannot be routed; just ack it
    // so the client stops spinning.
    let Some(chat) = chat else {
        let _ = bot.answer_callback_query(q.id).await;
        return Ok(());
    };
    if data.is_empty() {
        let _ = bot.answer_callback_query(q.id).await;
        return Ok(());
    }

    let user_id = UserId(q.from.id.0 as i64);

    if let Err(e) = state
        .machine
        .on_callback(user_id, ChatId(chat.0), &q.id, &data)
        .await
    {
        report_failure(&bot, chat, e).await;
    }
    Ok(())
}
