//! Conversation state machine.
//!
//! Validates inbound events against the session's current state, advances
//! it, and drives the dispatcher. Illegal events are rejected locally with
//! a user-facing message and leave the session untouched; operation
//! failures release every staged resource before they surface.
//!
//! Locking discipline: each entry point locks the user's session only to
//! validate and mutate. Slow work (the transport download, the dispatcher
//! call) runs with the lock released; a captured `OperationRequest`
//! carries everything it needs, and the lock is re-acquired to commit or
//! discard the result. One user's long-running operation therefore never
//! blocks other users, and a second event from the same user cannot
//! interleave with the mutation.

use std::sync::Arc;

use regex::Regex;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::{
    dispatcher::{Dispatcher, OperationRequest},
    domain::{ChatId, MediaCategory, UserId},
    errors::Error,
    messaging::{port::MessagingPort, types::InlineKeyboard},
    registry::{self, CallbackAction, DocOp, OperationId},
    session::{AwaitingInput, ConvState, Session, SessionStore},
    staging::{StagedFile, Staging},
    Result,
};

const WELCOME: &str = "📁 Welcome to the media archive bot!\n\
Send me a video, audio file, document, or URL to get started.\n\
Documents are collected; click 'Make Archive' when finished.";

const PLEASE_WAIT: &str = "⏳ Still working on your previous request, please wait.";

const START_OVER: &str = "Session expired. Please start over and send your file(s) again.";

/// A normalized file-upload event from the transport.
#[derive(Clone, Debug)]
pub struct FileUpload {
    /// Transport-side file handle, resolvable by the messenger.
    pub file_id: String,
    pub name: Option<String>,
    pub size: u64,
    pub category: MediaCategory,
}

pub struct Machine {
    store: Arc<SessionStore>,
    staging: Arc<Staging>,
    dispatcher: Arc<Dispatcher>,
    messenger: Arc<dyn MessagingPort>,
    url_re: Regex,
}

impl Machine {
    pub fn new(
        store: Arc<SessionStore>,
        staging: Arc<Staging>,
        dispatcher: Arc<Dispatcher>,
        messenger: Arc<dyn MessagingPort>,
    ) -> Self {
        Self {
            store,
            staging,
            dispatcher,
            messenger,
            url_re: Regex::new(r"(?i)^https?://\S+$").expect("valid regex"),
        }
    }

    /// `/start`: reset from any state, release whatever was staged, greet.
    pub async fn on_start(&self, user: UserId, chat: ChatId) -> Result<()> {
        self.discard_session(user).await;
        self.messenger.send_text(chat, WELCOME).await?;
        Ok(())
    }

    /// `/cancel`: drop the session and everything staged for it. An
    /// operation already in flight keeps running but its result is
    /// discarded and released instead of delivered.
    pub async fn on_cancel(&self, user: UserId, chat: ChatId) -> Result<()> {
        if self.discard_session(user).await {
            self.messenger
                .send_text(chat, "🚫 Operation cancelled.")
                .await?;
        } else {
            self.messenger.send_text(chat, "Nothing to cancel.").await?;
        }
        Ok(())
    }

    /// A file attachment arrived. Stages the download and records it.
    pub async fn on_file(&self, user: UserId, chat: ChatId, upload: FileUpload) -> Result<()> {
        let session = self.store.entry(user).await;

        // Validate before paying for the download.
        {
            let guard = session.lock().await;
            if let Some(rejection) = upload_rejection(&guard, upload.category) {
                drop(guard);
                self.messenger.send_text(chat, rejection).await?;
                return Ok(());
            }
        }

        let display = sanitize_filename(upload.name.as_deref().unwrap_or("file"));
        let suffix = display
            .rsplit_once('.')
            .map(|(_, ext)| format!(".{ext}"))
            .unwrap_or_default();

        // The download is slow; run it without holding the per-user lock.
        let path = self.staging.allocate(&suffix);
        if let Err(e) = self.messenger.download_file(&upload.file_id, &path).await {
            self.staging.release(&path);
            tracing::warn!(user = user.0, error = %e, "file download failed");
            self.messenger
                .send_text(chat, &user_error_text(&Error::Download(e.to_string())))
                .await?;
            return Ok(());
        }

        // Re-acquire and re-validate: the session may have been cancelled
        // or replaced while the download ran.
        let current = self.store.get(user).await;
        if !current.map(|c| Arc::ptr_eq(&c, &session)).unwrap_or(false) {
            self.staging.release(&path);
            return Ok(());
        }
        let mut guard = session.clone().lock_owned().await;
        if let Some(rejection) = upload_rejection(&guard, upload.category) {
            drop(guard);
            self.staging.release(&path);
            self.messenger.send_text(chat, rejection).await?;
            return Ok(());
        }

        guard.files.push(StagedFile {
            name: display.clone(),
            path,
            size: upload.size,
        });

        match upload.category {
            MediaCategory::Document => {
                guard.state = ConvState::CollectingFiles;
                let text = format!(
                    "✅ Received: {display}\n📦 Total files: {}\n📊 Total size: {}",
                    guard.files.len(),
                    format_size(guard.total_size()),
                );
                drop(guard);
                self.messenger
                    .send_menu(chat, &text, registry::collecting_menu())
                    .await?;
            }
            category @ (MediaCategory::Video | MediaCategory::Audio) => {
                guard.state = ConvState::AwaitingOperationChoice(category);
                let count = guard.files.len();
                drop(guard);
                let text = if count == 1 {
                    format!("Select a {} processing option:", category.label())
                } else {
                    format!(
                        "Select a {} processing option ({count} files):",
                        category.label()
                    )
                };
                self.messenger
                    .send_menu(chat, &text, registry::category_menu(category))
                    .await?;
            }
            MediaCategory::Url => unreachable!("URLs arrive as text"),
        }

        Ok(())
    }

    /// Free text: a pending password reply, a URL, or noise.
    pub async fn on_text(&self, user: UserId, chat: ChatId, text: &str) -> Result<()> {
        let session = self.store.entry(user).await;
        let mut guard = session.clone().lock_owned().await;

        if guard.state == ConvState::Executing {
            drop(guard);
            self.messenger.send_text(chat, PLEASE_WAIT).await?;
            return Ok(());
        }

        // An expected reply consumes the text; it is never re-interpreted.
        if guard.awaiting_input == Some(AwaitingInput::Password) {
            guard.password = Some(text.to_string());
            guard.awaiting_input = None;
            return self.execute(user, chat, session, guard).await;
        }

        let trimmed = text.trim();
        if self.url_re.is_match(trimmed) {
            if guard.state != ConvState::Idle {
                drop(guard);
                self.messenger
                    .send_text(
                        chat,
                        "⚠️ Finish the current flow first, or /cancel to start over.",
                    )
                    .await?;
                return Ok(());
            }
            guard.url = Some(trimmed.to_string());
            guard.state = ConvState::AwaitingOperationChoice(MediaCategory::Url);
            drop(guard);
            self.messenger
                .send_menu(
                    chat,
                    "Select a URL processing option:",
                    registry::category_menu(MediaCategory::Url),
                )
                .await?;
            return Ok(());
        }

        drop(guard);
        self.messenger
            .send_text(
                chat,
                "Send me a video, audio file, document, or URL to get started.",
            )
            .await?;
        Ok(())
    }

    /// An inline-keyboard button press.
    pub async fn on_callback(
        &self,
        user: UserId,
        chat: ChatId,
        callback_id: &str,
        data: &str,
    ) -> Result<()> {
        let Some(action) = registry::parse_callback(data) else {
            // Contract violation (stale keyboard, foreign button): never
            // guess at a different operation.
            tracing::warn!(user = user.0, data, "unknown callback data");
            self.messenger
                .answer_callback(callback_id, Some("Unknown action"))
                .await?;
            return Ok(());
        };

        self.messenger.answer_callback(callback_id, None).await?;

        let Some(session) = self.store.get(user).await else {
            self.messenger.send_text(chat, START_OVER).await?;
            return Ok(());
        };
        let mut guard = session.clone().lock_owned().await;

        if guard.state == ConvState::Executing {
            drop(guard);
            self.messenger.send_text(chat, PLEASE_WAIT).await?;
            return Ok(());
        }

        match action {
            CallbackAction::Operation(op) => {
                self.handle_operation_choice(user, chat, session, guard, op)
                    .await
            }
            CallbackAction::ArchiveType(format) => {
                if guard.state != ConvState::AwaitingArchiveType {
                    drop(guard);
                    return self.reject(chat).await;
                }
                guard.archive_format = Some(format);
                if format.supports_password() {
                    guard.state = ConvState::AwaitingPasswordDecision;
                    drop(guard);
                    self.messenger
                        .send_menu(chat, "Add password protection?", registry::password_menu())
                        .await?;
                    Ok(())
                } else {
                    // No encryption for tar containers; run directly.
                    guard.password = None;
                    self.execute(user, chat, session, guard).await
                }
            }
            CallbackAction::SetPassword => {
                if guard.state != ConvState::AwaitingPasswordDecision {
                    drop(guard);
                    return self.reject(chat).await;
                }
                guard.state = ConvState::AwaitingPasswordInput;
                guard.awaiting_input = Some(AwaitingInput::Password);
                drop(guard);
                self.messenger
                    .send_text(chat, "🔐 Enter password for archive:")
                    .await?;
                Ok(())
            }
            CallbackAction::SkipPassword => {
                if guard.state != ConvState::AwaitingPasswordDecision {
                    drop(guard);
                    return self.reject(chat).await;
                }
                guard.password = None;
                self.execute(user, chat, session, guard).await
            }
            CallbackAction::Done => {
                if guard.files.is_empty() {
                    drop(guard);
                    self.messenger
                        .send_text(chat, "No files received yet!")
                        .await?;
                    return Ok(());
                }
                let text = format!(
                    "✅ Ready to archive {} files\n📊 Total size: {}",
                    guard.files.len(),
                    format_size(guard.total_size()),
                );
                drop(guard);
                self.messenger
                    .send_menu(
                        chat,
                        &text,
                        InlineKeyboard::one_per_row(&[(
                            "📦 Make Archive",
                            "doc:archive".to_string(),
                        )]),
                    )
                    .await?;
                Ok(())
            }
        }
    }

    async fn handle_operation_choice(
        &self,
        user: UserId,
        chat: ChatId,
        session: Arc<Mutex<Session>>,
        mut guard: OwnedMutexGuard<Session>,
        op: OperationId,
    ) -> Result<()> {
        match op {
            OperationId::Document(DocOp::MakeArchive) => {
                if guard.state != ConvState::CollectingFiles || guard.files.is_empty() {
                    drop(guard);
                    self.messenger
                        .send_text(chat, "❌ No files to archive!")
                        .await?;
                    return Ok(());
                }
                guard.pending_operation = Some(op);
                guard.state = ConvState::AwaitingArchiveType;
                drop(guard);
                self.messenger
                    .send_menu(chat, "Select archive type:", registry::archive_type_menu())
                    .await?;
                Ok(())
            }
            OperationId::Document(DocOp::Extract) => {
                if guard.state != ConvState::CollectingFiles {
                    drop(guard);
                    return self.reject(chat).await;
                }
                let archive_like = guard.files.len() == 1
                    && crate::archive::detect_format(&guard.files[0].name).is_some();
                if !archive_like {
                    drop(guard);
                    self.messenger
                        .send_text(
                            chat,
                            "⚠️ Send exactly one archive (.zip, .tar, .tar.gz) to extract.",
                        )
                        .await?;
                    return Ok(());
                }
                guard.pending_operation = Some(op);
                self.execute(user, chat, session, guard).await
            }
            OperationId::Video(_) | OperationId::Audio(_) => {
                let expected = ConvState::AwaitingOperationChoice(op.category());
                if guard.state != expected || guard.files.is_empty() {
                    drop(guard);
                    return self.reject(chat).await;
                }
                guard.pending_operation = Some(op);
                self.execute(user, chat, session, guard).await
            }
            OperationId::Url(_) => {
                let expected = ConvState::AwaitingOperationChoice(MediaCategory::Url);
                if guard.state != expected || guard.url.is_none() {
                    drop(guard);
                    return self.reject(chat).await;
                }
                guard.pending_operation = Some(op);
                self.execute(user, chat, session, guard).await
            }
        }
    }

    /// Run the captured operation with the session lock released, then
    /// re-acquire it to commit or discard. All staged resources for the
    /// session are released afterwards on every path.
    async fn execute(
        &self,
        user: UserId,
        chat: ChatId,
        session: Arc<Mutex<Session>>,
        mut guard: OwnedMutexGuard<Session>,
    ) -> Result<()> {
        let Some(op) = guard.pending_operation else {
            drop(guard);
            return self.reject(chat).await;
        };

        // Files must be staged before any archive/transform dispatch.
        let needs_files = !matches!(op, OperationId::Url(_));
        if needs_files && guard.files.is_empty() {
            drop(guard);
            self.messenger
                .send_text(chat, "⚠️ No files staged. Send the file(s) again.")
                .await?;
            return Ok(());
        }

        let req = OperationRequest {
            op,
            inputs: guard.files.clone(),
            url: guard.url.clone(),
            archive_format: guard.archive_format,
            password: guard.password.clone(),
        };
        let cancel = guard.cancel.clone();
        guard.state = ConvState::Executing;
        drop(guard);

        let mut scope = self.staging.scope();
        let outcome = self.dispatcher.execute(chat, req, &mut scope).await;

        // Commit under the lock.
        let mut guard = session.lock().await;
        if cancel.is_cancelled() {
            // Cancelled while running: the session (and its inputs) are
            // already gone; the scope drop below releases the outputs.
            tracing::info!(user = user.0, "discarding result of cancelled operation");
            return Ok(());
        }

        match outcome {
            Ok(result) => {
                guard.state = ConvState::Done;
                drop(guard);

                let delivery = self.dispatcher.deliver(chat, &result.artifacts).await;
                self.finish_session(user).await;
                match delivery {
                    Ok(()) => {
                        self.messenger
                            .send_text(chat, "✅ Processing complete!")
                            .await?;
                    }
                    Err(e) => {
                        tracing::error!(user = user.0, error = %e, "artifact delivery failed");
                        self.messenger.send_text(chat, &user_error_text(&e)).await?;
                    }
                }
                Ok(())
            }
            Err(e) => {
                guard.state = ConvState::Done;
                drop(guard);
                self.finish_session(user).await;

                if matches!(e, Error::Io(_) | Error::External(_) | Error::Config(_)) {
                    tracing::error!(user = user.0, error = %e, "operation failed unexpectedly");
                } else {
                    tracing::warn!(user = user.0, error = %e, "operation failed");
                }
                self.messenger.send_text(chat, &user_error_text(&e)).await?;
                Ok(())
            }
        }
    }

    /// Remove the session and release everything it staged. Returns whether
    /// a session existed.
    async fn discard_session(&self, user: UserId) -> bool {
        let Some(session) = self.store.remove(user).await else {
            return false;
        };
        let mut guard = session.lock().await;
        guard.cancel.cancel();
        guard.state = ConvState::Cancelled;
        for f in guard.files.drain(..) {
            self.staging.release(&f.path);
        }
        true
    }

    /// Post-completion cleanup: same release path, terminal `Done`.
    async fn finish_session(&self, user: UserId) {
        if let Some(session) = self.store.remove(user).await {
            let mut guard = session.lock().await;
            guard.state = ConvState::Done;
            for f in guard.files.drain(..) {
                self.staging.release(&f.path);
            }
        }
    }

    async fn reject(&self, chat: ChatId) -> Result<()> {
        self.messenger
            .send_text(
                chat,
                "⚠️ That button isn't valid right now. Send a file to begin.",
            )
            .await?;
        Ok(())
    }
}

/// Guard for the upload transition. `None` means the upload is legal in
/// the session's current state.
fn upload_rejection(session: &Session, category: MediaCategory) -> Option<&'static str> {
    match session.state {
        ConvState::Executing => Some(PLEASE_WAIT),
        ConvState::Idle | ConvState::CollectingFiles => None,
        // More files of the same kind extend a pending menu (video merge).
        ConvState::AwaitingOperationChoice(current) if current == category => None,
        _ => Some("⚠️ Finish the current selection first, or /cancel to start over."),
    }
}

fn user_error_text(e: &Error) -> String {
    match e {
        Error::Validation(s) => format!("⚠️ {s}"),
        Error::SessionNotFound => START_OVER.to_string(),
        Error::LimitExceeded(s) => format!("❌ Limit exceeded: {s}"),
        Error::Download(s) => format!("❌ Download failed: {}", truncate(s, 200)),
        Error::Processing(s) => format!("❌ Processing failed: {}", truncate(s, 200)),
        Error::Archive(s) => format!("❌ Archive error: {}", truncate(s, 200)),
        _ => "❌ An error occurred. Please try again.".to_string(),
    }
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        return s.to_string();
    }
    let mut out = s.chars().take(max_len).collect::<String>();
    out.push_str("...");
    out
}

fn sanitize_filename(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for ch in name.chars() {
        if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-') {
            out.push(ch);
        } else {
            out.push('_');
        }
    }
    if out.trim_matches(|c| c == '.' || c == '_').is_empty() {
        "file".to_string()
    } else {
        out
    }
}

fn format_size(bytes: u64) -> String {
    const MIB: f64 = 1024.0 * 1024.0;
    if bytes < 1024 * 1024 {
        format!("{bytes} bytes")
    } else {
        format!("{:.2} MB", bytes as f64 / MIB)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::{FetchedFile, UrlFetcher};
    use crate::messaging::types::{Artifact, MessagingCapabilities};
    use crate::tool::{MediaToolPort, TransformRequest};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::path::{Path, PathBuf};
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct FakeMessenger {
        next_id: StdMutex<i32>,
        /// Transport-side files, keyed by file_id.
        remote_files: StdMutex<HashMap<String, Vec<u8>>>,
        texts: StdMutex<Vec<String>>,
        menus: StdMutex<Vec<(String, InlineKeyboard)>>,
        /// Delivered artifacts, content captured at send time (the machine
        /// releases the path right after delivery).
        delivered: StdMutex<Vec<(String, Vec<u8>)>>,
    }

    impl FakeMessenger {
        fn put_remote(&self, file_id: &str, bytes: Vec<u8>) {
            self.remote_files
                .lock()
                .unwrap()
                .insert(file_id.to_string(), bytes);
        }

        fn alloc(&self, chat_id: ChatId) -> crate::domain::MessageRef {
            let mut guard = self.next_id.lock().unwrap();
            *guard += 1;
            crate::domain::MessageRef {
                chat_id,
                message_id: crate::domain::MessageId(*guard),
            }
        }

        fn texts(&self) -> Vec<String> {
            self.texts.lock().unwrap().clone()
        }

        fn last_text(&self) -> String {
            self.texts().last().cloned().unwrap_or_default()
        }

        fn menus(&self) -> Vec<(String, InlineKeyboard)> {
            self.menus.lock().unwrap().clone()
        }

        fn delivered(&self) -> Vec<(String, Vec<u8>)> {
            self.delivered.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl MessagingPort for FakeMessenger {
        fn capabilities(&self) -> MessagingCapabilities {
            MessagingCapabilities {
                supports_edit: true,
                supports_inline_keyboards: true,
                max_batch_len: 10,
                max_message_len: 4096,
            }
        }

        async fn send_text(
            &self,
            chat_id: ChatId,
            text: &str,
        ) -> Result<crate::domain::MessageRef> {
            self.texts.lock().unwrap().push(text.to_string());
            Ok(self.alloc(chat_id))
        }

        async fn edit_text(&self, _msg: crate::domain::MessageRef, _text: &str) -> Result<()> {
            Ok(())
        }

        async fn delete_message(&self, _msg: crate::domain::MessageRef) -> Result<()> {
            Ok(())
        }

        async fn send_menu(
            &self,
            chat_id: ChatId,
            text: &str,
            keyboard: InlineKeyboard,
        ) -> Result<crate::domain::MessageRef> {
            self.menus
                .lock()
                .unwrap()
                .push((text.to_string(), keyboard));
            Ok(self.alloc(chat_id))
        }

        async fn answer_callback(&self, _callback_id: &str, _text: Option<&str>) -> Result<()> {
            Ok(())
        }

        async fn download_file(&self, file_id: &str, dest: &Path) -> Result<()> {
            let bytes = self
                .remote_files
                .lock()
                .unwrap()
                .get(file_id)
                .cloned()
                .ok_or_else(|| Error::Download(format!("no such transport file: {file_id}")))?;
            std::fs::write(dest, bytes)?;
            Ok(())
        }

        async fn send_artifact(
            &self,
            chat_id: ChatId,
            artifact: &Artifact,
        ) -> Result<crate::domain::MessageRef> {
            let bytes = std::fs::read(&artifact.path)?;
            self.delivered
                .lock()
                .unwrap()
                .push((artifact.caption.clone(), bytes));
            Ok(self.alloc(chat_id))
        }

        async fn send_artifact_batch(
            &self,
            _chat_id: ChatId,
            artifacts: &[Artifact],
        ) -> Result<()> {
            for a in artifacts {
                let bytes = std::fs::read(&a.path)?;
                self.delivered
                    .lock()
                    .unwrap()
                    .push((a.caption.clone(), bytes));
            }
            Ok(())
        }
    }

    /// Tool that writes a marker output; can be gated to simulate a slow run.
    struct FakeTool {
        gate: Option<Arc<tokio::sync::Semaphore>>,
    }

    #[async_trait]
    impl MediaToolPort for FakeTool {
        async fn transform(&self, req: TransformRequest) -> Result<()> {
            if let Some(gate) = &self.gate {
                let _permit = gate.acquire().await.unwrap();
            }
            std::fs::write(&req.output, b"transformed")?;
            Ok(())
        }

        async fn probe_duration(&self, _input: &Path) -> Result<f64> {
            Ok(40.0)
        }
    }

    struct FailingFetcher;

    #[async_trait]
    impl UrlFetcher for FailingFetcher {
        async fn fetch(&self, _url: &str, _dest: &Path) -> Result<FetchedFile> {
            Err(Error::Download("connection refused".to_string()))
        }
    }

    struct Harness {
        machine: Arc<Machine>,
        messenger: Arc<FakeMessenger>,
        store: Arc<SessionStore>,
        root: PathBuf,
    }

    fn tmp_root(prefix: &str) -> PathBuf {
        let ts = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let dir = PathBuf::from(format!("/tmp/{prefix}-{}-{ts}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn harness_with(prefix: &str, gate: Option<Arc<tokio::sync::Semaphore>>) -> Harness {
        let root = tmp_root(prefix);
        let cfg = Arc::new(crate::config::test_config(root.clone()));
        let messenger = Arc::new(FakeMessenger::default());
        let store = SessionStore::new();
        let staging = Staging::new(root.clone());
        let dispatcher = Arc::new(Dispatcher::new(
            cfg,
            Arc::new(FakeTool { gate }),
            Arc::new(FailingFetcher),
            messenger.clone(),
        ));
        let machine = Arc::new(Machine::new(
            store.clone(),
            staging,
            dispatcher,
            messenger.clone(),
        ));
        Harness {
            machine,
            messenger,
            store,
            root,
        }
    }

    fn harness(prefix: &str) -> Harness {
        harness_with(prefix, None)
    }

    const USER: UserId = UserId(1);
    const CHAT: ChatId = ChatId(10);

    async fn upload(h: &Harness, name: &str, bytes: &[u8], category: MediaCategory) {
        let file_id = format!("remote:{name}");
        h.messenger.put_remote(&file_id, bytes.to_vec());
        h.machine
            .on_file(
                USER,
                CHAT,
                FileUpload {
                    file_id,
                    name: Some(name.to_string()),
                    size: bytes.len() as u64,
                    category,
                },
            )
            .await
            .unwrap();
    }

    fn staged_paths_on_disk(root: &Path) -> Vec<PathBuf> {
        std::fs::read_dir(root)
            .unwrap()
            .flatten()
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .map(|n| n.to_string_lossy().starts_with("stage_"))
                    .unwrap_or(false)
            })
            .collect()
    }

    #[tokio::test]
    async fn uploads_report_running_totals() {
        let h = harness("mab-m-totals");
        upload(&h, "a.txt", &[b'a'; 100], MediaCategory::Document).await;
        upload(&h, "b.txt", &[b'b'; 200], MediaCategory::Document).await;
        upload(&h, "c.txt", &[b'c'; 50], MediaCategory::Document).await;

        let menus = h.messenger.menus();
        assert_eq!(menus.len(), 3);
        let last = &menus[2].0;
        assert!(last.contains("Total files: 3"), "got: {last}");
        assert!(last.contains("350 bytes"), "got: {last}");

        // "Done" repeats the summary with the exact totals.
        h.machine
            .on_callback(USER, CHAT, "cb", "done")
            .await
            .unwrap();
        let summary = h.messenger.menus().last().unwrap().0.clone();
        assert!(summary.contains("3 files"), "got: {summary}");
        assert!(summary.contains("350 bytes"), "got: {summary}");
    }

    #[tokio::test]
    async fn zip_skip_password_round_trip_and_cleanup() {
        let h = harness("mab-m-zip");
        upload(&h, "a.txt", &[b'a'; 100], MediaCategory::Document).await;
        upload(&h, "b.txt", &[b'b'; 200], MediaCategory::Document).await;

        // Remember what's on disk before executing.
        let staged_before = staged_paths_on_disk(&h.root);
        assert_eq!(staged_before.len(), 2);

        h.machine
            .on_callback(USER, CHAT, "cb", "doc:archive")
            .await
            .unwrap();
        assert!(h
            .messenger
            .menus()
            .last()
            .unwrap()
            .0
            .contains("archive type"));

        h.machine
            .on_callback(USER, CHAT, "cb", "arch:zip")
            .await
            .unwrap();
        assert!(h
            .messenger
            .menus()
            .last()
            .unwrap()
            .0
            .contains("password protection"));

        h.machine
            .on_callback(USER, CHAT, "cb", "pw:skip")
            .await
            .unwrap();

        // One zip artifact delivered, containing exactly a.txt and b.txt.
        let delivered = h.messenger.delivered();
        assert_eq!(delivered.len(), 1);
        let (caption, zip_bytes) = &delivered[0];
        assert!(caption.contains("2 files archived"), "got: {caption}");

        let check = h.root.join("delivered.zip");
        std::fs::write(&check, zip_bytes).unwrap();
        let out_dir = h.root.join("check-out");
        let report = crate::archive::extract_archive(
            &check,
            "delivered.zip",
            &out_dir,
            None,
            crate::archive::ExtractLimits::default(),
        )
        .unwrap();
        let mut names: Vec<String> = report
            .extracted_files
            .iter()
            .map(|p| p.to_string_lossy().to_string())
            .collect();
        names.sort();
        assert_eq!(names, vec!["a.txt", "b.txt"]);
        assert_eq!(std::fs::read(out_dir.join("a.txt")).unwrap().len(), 100);
        assert_eq!(std::fs::read(out_dir.join("b.txt")).unwrap().len(), 200);

        // Both staged originals are gone from disk, session removed.
        for p in staged_before {
            assert!(!p.exists(), "staged input left behind: {}", p.display());
        }
        assert!(staged_paths_on_disk(&h.root).is_empty());
        assert!(h.store.get(USER).await.is_none());
        assert_eq!(h.messenger.last_text(), "✅ Processing complete!");
    }

    #[tokio::test]
    async fn password_flow_consumes_text_and_encrypts() {
        let h = harness("mab-m-pw");
        upload(&h, "secret.txt", &[b's'; 64], MediaCategory::Document).await;

        h.machine
            .on_callback(USER, CHAT, "cb", "doc:archive")
            .await
            .unwrap();
        h.machine
            .on_callback(USER, CHAT, "cb", "arch:zip")
            .await
            .unwrap();
        h.machine
            .on_callback(USER, CHAT, "cb", "pw:set")
            .await
            .unwrap();
        assert!(h.messenger.last_text().contains("Enter password"));

        // The next text is consumed as the password, not as a URL.
        h.machine.on_text(USER, CHAT, "hunter2").await.unwrap();

        let delivered = h.messenger.delivered();
        assert_eq!(delivered.len(), 1);
        assert!(delivered[0].0.contains("password protected"));

        let check = h.root.join("protected.zip");
        std::fs::write(&check, &delivered[0].1).unwrap();

        let no_pw = crate::archive::extract_archive(
            &check,
            "protected.zip",
            &h.root.join("no-pw"),
            None,
            crate::archive::ExtractLimits::default(),
        );
        assert!(no_pw.is_err());

        let ok = crate::archive::extract_archive(
            &check,
            "protected.zip",
            &h.root.join("with-pw"),
            Some("hunter2"),
            crate::archive::ExtractLimits::default(),
        )
        .unwrap();
        assert_eq!(ok.extracted_files.len(), 1);
    }

    #[tokio::test]
    async fn text_without_pending_input_is_never_a_password() {
        let h = harness("mab-m-text");

        h.machine.on_text(USER, CHAT, "hello there").await.unwrap();
        assert!(h.messenger.last_text().contains("to get started"));

        h.machine
            .on_text(USER, CHAT, "https://example.com/files/data.zip")
            .await
            .unwrap();
        let menus = h.messenger.menus();
        assert!(menus.last().unwrap().0.contains("URL processing"));

        let session = h.store.get(USER).await.unwrap();
        let guard = session.lock().await;
        assert_eq!(
            guard.state,
            ConvState::AwaitingOperationChoice(MediaCategory::Url)
        );
        assert!(guard.password.is_none());
        assert!(guard.awaiting_input.is_none());
    }

    #[tokio::test]
    async fn cancel_mid_password_input_releases_and_restarts_fresh() {
        let h = harness("mab-m-cancel");
        upload(&h, "a.txt", &[b'a'; 10], MediaCategory::Document).await;
        h.machine
            .on_callback(USER, CHAT, "cb", "doc:archive")
            .await
            .unwrap();
        h.machine
            .on_callback(USER, CHAT, "cb", "arch:zip")
            .await
            .unwrap();
        h.machine
            .on_callback(USER, CHAT, "cb", "pw:set")
            .await
            .unwrap();

        h.machine.on_cancel(USER, CHAT).await.unwrap();
        assert!(h.store.get(USER).await.is_none());
        assert!(staged_paths_on_disk(&h.root).is_empty());

        // A subsequent upload starts a brand-new collecting session.
        upload(&h, "b.txt", &[b'b'; 10], MediaCategory::Document).await;
        let session = h.store.get(USER).await.unwrap();
        let guard = session.lock().await;
        assert_eq!(guard.state, ConvState::CollectingFiles);
        assert_eq!(guard.files.len(), 1);
        assert_eq!(guard.files[0].name, "b.txt");
    }

    #[tokio::test]
    async fn limit_exceeded_releases_everything_and_user_can_act() {
        let h = harness("mab-m-limit");
        for i in 0..21 {
            upload(&h, &format!("f{i}.txt"), b"x", MediaCategory::Document).await;
        }
        h.machine
            .on_callback(USER, CHAT, "cb", "doc:archive")
            .await
            .unwrap();
        h.machine
            .on_callback(USER, CHAT, "cb", "arch:tar")
            .await
            .unwrap();

        let last = h.messenger.last_text();
        assert!(last.contains("Limit exceeded"), "got: {last}");
        assert!(h.messenger.delivered().is_empty());

        // Nothing staged left behind; the user is not stuck.
        assert!(staged_paths_on_disk(&h.root).is_empty());
        assert!(h.store.get(USER).await.is_none());
        upload(&h, "fresh.txt", b"y", MediaCategory::Document).await;
        assert!(h.store.get(USER).await.is_some());
    }

    #[tokio::test]
    async fn unreachable_url_surfaces_download_error_without_residue() {
        let h = harness("mab-m-url");
        h.machine
            .on_text(USER, CHAT, "https://unreachable.invalid/file.bin")
            .await
            .unwrap();
        h.machine
            .on_callback(USER, CHAT, "cb", "url:download")
            .await
            .unwrap();

        let last = h.messenger.last_text();
        assert!(last.contains("Download failed"), "got: {last}");
        assert!(h.messenger.delivered().is_empty());
        assert!(staged_paths_on_disk(&h.root).is_empty());
    }

    #[tokio::test]
    async fn stale_callback_asks_to_start_over() {
        let h = harness("mab-m-stale");
        h.machine
            .on_callback(USER, CHAT, "cb", "video:gif")
            .await
            .unwrap();
        assert!(h.messenger.last_text().contains("start over"));
    }

    #[tokio::test]
    async fn illegal_callback_leaves_session_unchanged() {
        let h = harness("mab-m-illegal");
        upload(&h, "a.txt", &[b'a'; 10], MediaCategory::Document).await;

        h.machine
            .on_callback(USER, CHAT, "cb", "pw:skip")
            .await
            .unwrap();
        assert!(h.messenger.last_text().contains("isn't valid right now"));

        let session = h.store.get(USER).await.unwrap();
        let guard = session.lock().await;
        assert_eq!(guard.state, ConvState::CollectingFiles);
        assert_eq!(guard.files.len(), 1);
        assert!(guard.files[0].path.exists());
    }

    #[tokio::test]
    async fn unknown_callback_data_is_ignored() {
        let h = harness("mab-m-unknown");
        upload(&h, "a.txt", &[b'a'; 10], MediaCategory::Document).await;
        h.machine
            .on_callback(USER, CHAT, "cb", "bulk_archive")
            .await
            .unwrap();

        let session = h.store.get(USER).await.unwrap();
        assert_eq!(session.lock().await.state, ConvState::CollectingFiles);
    }

    #[tokio::test]
    async fn video_menu_flow_delivers_an_animation() {
        let h = harness("mab-m-gif");
        upload(&h, "clip.mp4", b"fake-video", MediaCategory::Video).await;
        let menus = h.messenger.menus();
        assert!(menus.last().unwrap().0.contains("video processing"));

        h.machine
            .on_callback(USER, CHAT, "cb", "video:gif")
            .await
            .unwrap();
        let delivered = h.messenger.delivered();
        assert_eq!(delivered.len(), 1);
        assert!(delivered[0].0.contains("GIF created"));
        assert!(h.store.get(USER).await.is_none());
    }

    #[tokio::test]
    async fn more_videos_extend_a_pending_menu_for_merging() {
        let h = harness("mab-m-merge");
        upload(&h, "one.mp4", b"v1", MediaCategory::Video).await;
        upload(&h, "two.mp4", b"v2", MediaCategory::Video).await;

        let menus = h.messenger.menus();
        assert!(menus.last().unwrap().0.contains("2 files"));

        h.machine
            .on_callback(USER, CHAT, "cb", "video:merge")
            .await
            .unwrap();
        let delivered = h.messenger.delivered();
        assert_eq!(delivered.len(), 1);
        assert!(delivered[0].0.contains("merged"));
    }

    #[tokio::test]
    async fn second_event_while_executing_gets_please_wait() {
        let gate = Arc::new(tokio::sync::Semaphore::new(0));
        let h = harness_with("mab-m-busy", Some(gate.clone()));
        upload(&h, "clip.mp4", b"fake-video", MediaCategory::Video).await;

        let machine = h.machine.clone();
        let exec = tokio::spawn(async move {
            machine
                .on_callback(USER, CHAT, "cb", "video:remove_audio")
                .await
                .unwrap();
        });

        // Let the execution reach the gated tool call.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        h.machine
            .on_text(USER, CHAT, "are you done yet?")
            .await
            .unwrap();
        assert_eq!(h.messenger.last_text(), PLEASE_WAIT);

        gate.add_permits(1);
        exec.await.unwrap();
        assert_eq!(h.messenger.last_text(), "✅ Processing complete!");
    }

    #[tokio::test]
    async fn cancel_during_execution_discards_the_result() {
        let gate = Arc::new(tokio::sync::Semaphore::new(0));
        let h = harness_with("mab-m-cancel-exec", Some(gate.clone()));
        upload(&h, "clip.mp4", b"fake-video", MediaCategory::Video).await;

        let machine = h.machine.clone();
        let exec = tokio::spawn(async move {
            machine
                .on_callback(USER, CHAT, "cb", "video:remove_audio")
                .await
                .unwrap();
        });

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        h.machine.on_cancel(USER, CHAT).await.unwrap();
        assert!(h.store.get(USER).await.is_none());

        gate.add_permits(1);
        exec.await.unwrap();

        // No artifact delivered; nothing staged survives.
        assert!(h.messenger.delivered().is_empty());
        assert!(staged_paths_on_disk(&h.root).is_empty());
    }

    #[tokio::test]
    async fn independent_users_do_not_share_sessions() {
        let h = harness("mab-m-two-users");
        upload(&h, "a.txt", &[b'a'; 10], MediaCategory::Document).await;

        let other = UserId(2);
        h.messenger.put_remote("remote:other", b"zz".to_vec());
        h.machine
            .on_file(
                other,
                ChatId(20),
                FileUpload {
                    file_id: "remote:other".to_string(),
                    name: Some("other.txt".to_string()),
                    size: 2,
                    category: MediaCategory::Document,
                },
            )
            .await
            .unwrap();

        let a = h.store.get(USER).await.unwrap();
        let b = h.store.get(other).await.unwrap();
        assert_eq!(a.lock().await.files[0].name, "a.txt");
        assert_eq!(b.lock().await.files[0].name, "other.txt");
    }

    #[test]
    fn sanitizes_display_names() {
        assert_eq!(sanitize_filename("my report.pdf"), "my_report.pdf");
        assert_eq!(sanitize_filename("../../etc/passwd"), ".._.._etc_passwd");
        assert_eq!(sanitize_filename("..."), "file");
        assert_eq!(sanitize_filename("clean-name_1.txt"), "clean-name_1.txt");
    }

    #[test]
    fn formats_sizes_in_bytes_then_megabytes() {
        assert_eq!(format_size(300), "300 bytes");
        assert_eq!(format_size(3 * 1024 * 1024), "3.00 MB");
    }
}
