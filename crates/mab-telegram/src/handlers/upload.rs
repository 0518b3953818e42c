use std::sync::Arc;

use teloxide::prelude::*;

use mab_core::{
    domain::{ChatId, MediaCategory, UserId},
    machine::FileUpload,
};

use crate::handlers::report_failure;
use crate::router::AppState;

/// Normalize a media message into a `FileUpload` and hand it to the
/// machine. Generic documents are re-categorized by their mime type so a
/// video sent "as file" still gets the video menu.
pub async fn handle_upload(bot: Bot, msg: Message, state: Arc<AppState>) -> ResponseResult<()> {
    let Some(user) = msg.from() else {
        return Ok(());
    };

    let upload = if let Some(v) = msg.video() {
        FileUpload {
            file_id: v.file.id.clone(),
            name: v.file_name.clone(),
            size: v.file.size as u64,
            category: MediaCategory::Video,
        }
    } else if let Some(a) = msg.audio() {
        FileUpload {
            file_id: a.file.id.clone(),
            name: a.file_name.clone(),
            size: a.file.size as u64,
            category: MediaCategory::Audio,
        }
    } else if let Some(d) = msg.document() {
        let mime = d.mime_type.as_ref().map(|m| m.essence_str().to_string());
        let category = match mime.as_deref() {
            Some(m) if m.starts_with("video/") => MediaCategory::Video,
            Some(m) if m.starts_with("audio/") => MediaCategory::Audio,
            _ => MediaCategory::Document,
        };
        FileUpload {
            file_id: d.file.id.clone(),
            name: d.file_name.clone(),
            size: d.file.size as u64,
            category,
        }
    } else {
        return Ok(());
    };

    let user_id = UserId(user.id.0 as i64);
    let chat = ChatId(msg.chat.id.0);

    if let Err(e) = state.machine.on_file(user_id, chat, upload).await {
        report_failure(&bot, msg.chat.id, e).await;
    }
    Ok(())
}
