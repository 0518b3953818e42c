use std::sync::Arc;

use teloxide::prelude::*;

use mab_core::domain::{ChatId, UserId};

use crate::handlers::report_failure;
use crate::router::AppState;

const HELP: &str = "Available commands:\n\
/start - Start the bot\n\
/help - Show this help message\n\
/cancel - Cancel the current operation\n\
\n\
Send me a video, audio file, document, or URL to process it.\n\
Documents are collected into one session:\n\
1. Send files one by one\n\
2. Click 'Make Archive' (or 'Done' to review)\n\
3. Choose the format (ZIP/TAR/TAR.GZ)\n\
4. Add a password if you picked ZIP\n\
5. Receive your archive!";

pub async fn handle_command(bot: Bot, msg: Message, state: Arc<AppState>) -> ResponseResult<()> {
    let Some(user) = msg.from() else {
        return Ok(());
    };
    let text = msg.text().unwrap_or_default();

    // "/start@SomeBot arg" -> "start"
    let name = text
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .trim_start_matches('/')
        .split('@')
        .next()
        .unwrap_or_default()
        .to_lowercase();

    let user_id = UserId(user.id.0 as i64);
    let chat = ChatId(msg.chat.id.0);

    let result = match name.as_str() {
        "start" => state.machine.on_start(user_id, chat).await,
        "cancel" => state.machine.on_cancel(user_id, chat).await,
        "help" => {
            let _ = bot.send_message(msg.chat.id, HELP).await;
            Ok(())
        }
        _ => {
            let _ = bot
                .send_message(msg.chat.id, "Unknown command. Try /help.")
                .await;
            Ok(())
        }
    };

    if let Err(e) = result {
        report_failure(&bot, msg.chat.id, e).await;
    }
    Ok(())
}
