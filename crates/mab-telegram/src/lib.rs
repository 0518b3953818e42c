//! Telegram adapter (teloxide).
//!
//! This crate implements the `mab-core` MessagingPort over the Telegram
//! Bot API and hosts the update handlers + polling router.

use std::path::Path;

use async_trait::async_trait;

use teloxide::{
    net::Download,
    prelude::*,
    types::{
        InlineKeyboardButton, InlineKeyboardMarkup, InputFile, InputMedia, InputMediaAudio,
        InputMediaDocument, InputMediaPhoto, InputMediaVideo,
    },
};

use tokio::time::sleep;

pub mod handlers;
pub mod router;

use mab_core::{
    domain::{ChatId, MessageId, MessageRef},
    errors::Error,
    messaging::{
        port::MessagingPort,
        types::{Artifact, ArtifactKind, InlineKeyboard, MessagingCapabilities},
    },
    Result,
};

#[derive(Clone)]
pub struct TelegramMessenger {
    bot: Bot,
}

impl TelegramMessenger {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }

    pub fn bot(&self) -> Bot {
        self.bot.clone()
    }

    fn tg_chat(chat_id: ChatId) -> teloxide::types::ChatId {
        teloxide::types::ChatId(chat_id.0)
    }

    fn tg_msg_id(message_id: MessageId) -> teloxide::types::MessageId {
        teloxide::types::MessageId(message_id.0)
    }

    fn map_err(e: teloxide::RequestError) -> Error {
        Error::External(format!("telegram error: {e}"))
    }

    async fn with_retry<T, Fut>(&self, mut op: impl FnMut() -> Fut) -> Result<T>
    where
        Fut: std::future::IntoFuture<Output = std::result::Result<T, teloxide::RequestError>>,
        Fut::IntoFuture: Send,
    {
        const MAX_RETRIES: usize = 1;
        let mut attempts = 0usize;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) => match e {
                    teloxide::RequestError::RetryAfter(d) if attempts < MAX_RETRIES => {
                        attempts += 1;
                        sleep(d).await;
                        continue;
                    }
                    other => return Err(Self::map_err(other)),
                },
            }
        }
    }

    fn msg_ref(chat_id: ChatId, msg: &Message) -> MessageRef {
        MessageRef {
            chat_id,
            message_id: MessageId(msg.id.0),
        }
    }
}

#[async_trait]
impl MessagingPort for TelegramMessenger {
    fn capabilities(&self) -> MessagingCapabilities {
        MessagingCapabilities {
            supports_edit: true,
            supports_inline_keyboards: true,
            max_batch_len: 10,
            max_message_len: 4096,
        }
    }

    async fn send_text(&self, chat_id: ChatId, text: &str) -> Result<MessageRef> {
        let msg = self
            .with_retry(|| self.bot.send_message(Self::tg_chat(chat_id), text.to_string()))
            .await?;
        Ok(Self::msg_ref(chat_id, &msg))
    }

    async fn edit_text(&self, msg: MessageRef, text: &str) -> Result<()> {
        self.with_retry(|| {
            self.bot.edit_message_text(
                Self::tg_chat(msg.chat_id),
                Self::tg_msg_id(msg.message_id),
                text.to_string(),
            )
        })
        .await?;
        Ok(())
    }

    async fn delete_message(&self, msg: MessageRef) -> Result<()> {
        self.with_retry(|| {
            self.bot
                .delete_message(Self::tg_chat(msg.chat_id), Self::tg_msg_id(msg.message_id))
        })
        .await?;
        Ok(())
    }

    async fn send_menu(
        &self,
        chat_id: ChatId,
        text: &str,
        keyboard: InlineKeyboard,
    ) -> Result<MessageRef> {
        let rows: Vec<Vec<InlineKeyboardButton>> = keyboard
            .buttons
            .into_iter()
            .map(|b| vec![InlineKeyboardButton::callback(b.label, b.callback_data)])
            .collect();
        let markup = InlineKeyboardMarkup::new(rows);

        let msg = self
            .with_retry(|| {
                self.bot
                    .send_message(Self::tg_chat(chat_id), text.to_string())
                    .reply_markup(markup.clone())
            })
            .await?;
        Ok(Self::msg_ref(chat_id, &msg))
    }

    async fn answer_callback(&self, callback_id: &str, text: Option<&str>) -> Result<()> {
        self.with_retry(|| {
            let mut req = self.bot.answer_callback_query(callback_id.to_string());
            if let Some(t) = text {
                req = req.text(t.to_string());
            }
            req
        })
        .await?;
        Ok(())
    }

    async fn download_file(&self, file_id: &str, dest: &Path) -> Result<()> {
        let file = self
            .with_retry(|| self.bot.get_file(file_id.to_string()))
            .await
            .map_err(|e| Error::Download(e.to_string()))?;

        let mut dst = tokio::fs::File::create(dest).await?;
        self.bot
            .download_file(&file.path, &mut dst)
            .await
            .map_err(|e| Error::Download(format!("telegram download failed: {e}")))?;
        Ok(())
    }

    async fn send_artifact(&self, chat_id: ChatId, artifact: &Artifact) -> Result<MessageRef> {
        let chat = Self::tg_chat(chat_id);
        let input = InputFile::file(artifact.path.clone());
        let caption = artifact.caption.clone();

        let msg = match artifact.kind {
            ArtifactKind::Video => {
                self.with_retry(|| {
                    self.bot
                        .send_video(chat, input.clone())
                        .caption(caption.clone())
                })
                .await?
            }
            ArtifactKind::Audio => {
                self.with_retry(|| {
                    self.bot
                        .send_audio(chat, input.clone())
                        .caption(caption.clone())
                })
                .await?
            }
            ArtifactKind::Animation => {
                self.with_retry(|| {
                    self.bot
                        .send_animation(chat, input.clone())
                        .caption(caption.clone())
                })
                .await?
            }
            ArtifactKind::Photo => {
                self.with_retry(|| {
                    self.bot
                        .send_photo(chat, input.clone())
                        .caption(caption.clone())
                })
                .await?
            }
            ArtifactKind::Document => {
                self.with_retry(|| {
                    self.bot
                        .send_document(chat, input.clone())
                        .caption(caption.clone())
                })
                .await?
            }
        };

        Ok(Self::msg_ref(chat_id, &msg))
    }

    async fn send_artifact_batch(&self, chat_id: ChatId, artifacts: &[Artifact]) -> Result<()> {
        let media: Vec<InputMedia> = artifacts
            .iter()
            .map(|a| {
                let input = InputFile::file(a.path.clone());
                match a.kind {
                    ArtifactKind::Photo => {
                        InputMedia::Photo(InputMediaPhoto::new(input).caption(a.caption.clone()))
                    }
                    ArtifactKind::Video => {
                        InputMedia::Video(InputMediaVideo::new(input).caption(a.caption.clone()))
                    }
                    ArtifactKind::Audio => {
                        InputMedia::Audio(InputMediaAudio::new(input).caption(a.caption.clone()))
                    }
                    // Animations cannot ride in a media group; documents can.
                    ArtifactKind::Animation | ArtifactKind::Document => InputMedia::Document(
                        InputMediaDocument::new(input).caption(a.caption.clone()),
                    ),
                }
            })
            .collect();

        self.with_retry(|| {
            self.bot
                .send_media_group(Self::tg_chat(chat_id), media.clone())
        })
        .await?;
        Ok(())
    }
}
