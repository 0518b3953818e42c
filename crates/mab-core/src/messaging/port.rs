use std::path::Path;

use async_trait::async_trait;

use crate::{
    domain::{ChatId, MessageRef},
    messaging::types::{Artifact, InlineKeyboard, MessagingCapabilities},
    Result,
};

/// Cross-messenger port.
///
/// Telegram is the first implementation; the shape is designed so future
/// adapters can fit behind the same interface with capability flags.
#[async_trait]
pub trait MessagingPort: Send + Sync {
    fn capabilities(&self) -> MessagingCapabilities;

    async fn send_text(&self, chat_id: ChatId, text: &str) -> Result<MessageRef>;
    async fn edit_text(&self, msg: MessageRef, text: &str) -> Result<()>;
    async fn delete_message(&self, msg: MessageRef) -> Result<()>;

    async fn send_menu(
        &self,
        chat_id: ChatId,
        text: &str,
        keyboard: InlineKeyboard,
    ) -> Result<MessageRef>;

    async fn answer_callback(&self, callback_id: &str, text: Option<&str>) -> Result<()>;

    /// Stream a transport-side file (by its transport handle) to `dest`.
    async fn download_file(&self, file_id: &str, dest: &Path) -> Result<()>;

    async fn send_artifact(&self, chat_id: ChatId, artifact: &Artifact) -> Result<MessageRef>;

    /// Deliver a bounded batch of artifacts in one transport call. Callers
    /// chunk to `capabilities().max_batch_len`.
    async fn send_artifact_batch(&self, chat_id: ChatId, artifacts: &[Artifact]) -> Result<()>;
}
