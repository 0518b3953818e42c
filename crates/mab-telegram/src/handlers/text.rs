use std::sync::Arc;

use teloxide::prelude::*;

use mab_core::domain::{ChatId, UserId};

use crate::handlers::report_failure;
use crate::router::AppState;

pub async fn handle_text(bot: Bot, msg: Message, state: Arc<AppState>) -> ResponseResult<()> {
    let Some(user) = msg.from() else {
        return Ok(());
    };
    let Some(text) = msg.text() else {
        return Ok(());
    };

    let user_id = UserId(user.id.0 as i64);
    let chat = ChatId(msg.chat.id.0);

    if let Err(e) = state.machine.on_text(user_id, chat, text).await {
        report_failure(&bot, msg.chat.id, e).await;
    }
    Ok(())
}
