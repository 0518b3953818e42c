//! Per-user session state and the store that owns it.
//!
//! The store replaces the ambient global map of the usual bot layout with
//! an injected object, so tests can run several isolated stores. The
//! per-user `Arc<Mutex<Session>>` doubles as the exclusive per-user lock:
//! events for one user serialize on it in arrival order, while different
//! users never contend.

use std::{collections::HashMap, sync::Arc};

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::{
    domain::{MediaCategory, UserId},
    registry::{ArchiveFormat, OperationId},
    staging::StagedFile,
};

/// Conversational state of one user's interaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConvState {
    Idle,
    CollectingFiles,
    AwaitingOperationChoice(MediaCategory),
    AwaitingArchiveType,
    AwaitingPasswordDecision,
    AwaitingPasswordInput,
    Executing,
    Done,
    Cancelled,
}

impl ConvState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ConvState::Done | ConvState::Cancelled)
    }
}

/// What free-text reply the session expects next, if any.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AwaitingInput {
    Password,
}

/// Full mutable state of one user's in-progress interaction.
///
/// Mutated only by the state machine in response to validated events.
#[derive(Debug)]
pub struct Session {
    pub state: ConvState,
    /// Insertion order = upload order.
    pub files: Vec<StagedFile>,
    /// Pending URL (recorded, not yet staged).
    pub url: Option<String>,
    pub pending_operation: Option<OperationId>,
    pub archive_format: Option<ArchiveFormat>,
    /// Present only while building a protected archive.
    pub password: Option<String>,
    pub awaiting_input: Option<AwaitingInput>,
    /// Tripped by a cancel that lands while an operation is executing; the
    /// eventual result is then discarded instead of delivered.
    pub cancel: CancellationToken,
}

impl Session {
    fn new() -> Self {
        Self {
            state: ConvState::Idle,
            files: Vec::new(),
            url: None,
            pending_operation: None,
            archive_format: None,
            password: None,
            awaiting_input: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn total_size(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }
}

/// Process-lifetime store of sessions, keyed by user.
#[derive(Default)]
pub struct SessionStore {
    inner: Mutex<HashMap<UserId, Arc<Mutex<Session>>>>,
}

impl SessionStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The user's session, created lazily on first contact.
    pub async fn entry(&self, user: UserId) -> Arc<Mutex<Session>> {
        let mut map = self.inner.lock().await;
        map.entry(user)
            .or_insert_with(|| Arc::new(Mutex::new(Session::new())))
            .clone()
    }

    /// The user's session if one exists. Absence at a point where one is
    /// required is `Error::SessionNotFound` at the caller.
    pub async fn get(&self, user: UserId) -> Option<Arc<Mutex<Session>>> {
        self.inner.lock().await.get(&user).cloned()
    }

    /// Drop the session record. Staged files are the caller's to release
    /// before (or while) removing.
    pub async fn remove(&self, user: UserId) -> Option<Arc<Mutex<Session>>> {
        self.inner.lock().await.remove(&user)
    }

    pub async fn contains(&self, user: UserId) -> bool {
        self.inner.lock().await.contains_key(&user)
    }
}
