use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::Result;
use async_trait::async_trait;
use reqwest::Client;
use shared::{
    domain::{ConversationSummary, Identity, InboundMessage},
    protocol::{ConversationListRequest, ConversationListResponse},
};
use tokio::sync::watch;
use tracing::{debug, info, warn};

#[async_trait]
pub trait ConversationSource: Send + Sync {
    async fn list_conversations(
        &self,
        request: &ConversationListRequest,
    ) -> Result<ConversationListResponse>;
}

pub struct RestConversationSource {
    http: Client,
    url: String,
}

impl RestConversationSource {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl ConversationSource for RestConversationSource {
    async fn list_conversations(
        &self,
        request: &ConversationListRequest,
    ) -> Result<ConversationListResponse> {
        let response = self
            .http
            .post(&self.url)
            .json(request)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(response)
    }
}

/// Process-wide view of the conversation list shared by every screen.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConversationCache {
    pub conversations: Vec<ConversationSummary>,
    pub unread: u32,
    /// Bumped on every local send; the list itself is only changed by a resync.
    pub local_sends: u64,
    pub refreshes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Refreshed { unread: u32 },
    /// The fetch failed and the previous cache was kept.
    Failed,
    /// Another resync was in flight and will fetch again on our behalf.
    Coalesced,
}

#[derive(Default)]
struct RefreshState {
    running: bool,
    dirty: bool,
}

pub struct ConversationSynchronizer {
    source: Arc<dyn ConversationSource>,
    identity: Identity,
    token: String,
    page_size: u32,
    cache: Arc<watch::Sender<ConversationCache>>,
    refresh: Mutex<RefreshState>,
    /// `true` while no resync is running; written under `refresh`.
    idle: watch::Sender<bool>,
}

impl ConversationSynchronizer {
    pub fn new(
        source: Arc<dyn ConversationSource>,
        identity: Identity,
        token: impl Into<String>,
        page_size: u32,
        cache: Arc<watch::Sender<ConversationCache>>,
    ) -> Self {
        Self {
            source,
            identity,
            token: token.into(),
            page_size,
            cache,
            refresh: Mutex::new(RefreshState::default()),
            idle: watch::channel(true).0,
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn snapshot(&self) -> ConversationCache {
        self.cache.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<ConversationCache> {
        self.cache.subscribe()
    }

    pub fn triggers_resync(&self, message: &InboundMessage) -> bool {
        !message.is_authored_by(&self.identity)
    }

    /// Resyncs for messages written by someone else; echoes of our own
    /// messages are ignored.
    pub async fn observe(&self, message: &InboundMessage) -> Option<SyncOutcome> {
        if !self.triggers_resync(message) {
            debug!(message_id = message.id.0, "chat: own message; no resync");
            return None;
        }
        Some(self.resync().await)
    }

    pub fn note_local_send(&self) {
        self.cache.send_modify(|cache| cache.local_sends += 1);
    }

    /// Replaces the cache with the server's first page. Concurrent callers
    /// do not fetch in parallel: they mark the running resync dirty, and it
    /// fetches once more before returning.
    pub async fn resync(&self) -> SyncOutcome {
        if !self.begin_refresh() {
            debug!(identity = %self.identity, "chat: resync already running; coalesced");
            return SyncOutcome::Coalesced;
        }
        let mut guard = RefreshGuard {
            sync: self,
            released: false,
        };
        loop {
            let outcome = self.fetch_once().await;
            if !self.rerun_requested() {
                guard.released = true;
                return outcome;
            }
        }
    }

    /// Resolves once no resync is running, including any trailing fetch
    /// owed to coalesced callers.
    pub async fn wait_idle(&self) {
        let mut idle = self.idle.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = idle.wait_for(|idle| *idle).await;
    }

    async fn fetch_once(&self) -> SyncOutcome {
        let request = ConversationListRequest {
            token: self.token.clone(),
            index: 0,
            count: self.page_size,
        };
        let response = match self.source.list_conversations(&request).await {
            Ok(response) => response,
            Err(err) => {
                warn!(identity = %self.identity, "chat: conversation resync failed: {err}");
                return SyncOutcome::Failed;
            }
        };

        let unread = response.unread_count().unwrap_or_else(|| {
            warn!(
                raw = %response.num_new_message,
                "chat: unread counter is not a number; treating as 0"
            );
            0
        });
        let conversations = response.conversations;
        let count = conversations.len();
        self.cache.send_modify(move |cache| {
            cache.conversations = conversations;
            cache.unread = unread;
            cache.refreshes += 1;
        });
        info!(identity = %self.identity, conversations = count, unread, "chat: conversations refreshed");
        SyncOutcome::Refreshed { unread }
    }

    fn state(&self) -> MutexGuard<'_, RefreshState> {
        self.refresh.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn begin_refresh(&self) -> bool {
        let mut state = self.state();
        if state.running {
            state.dirty = true;
            return false;
        }
        state.running = true;
        self.idle.send_replace(false);
        true
    }

    // Checked and cleared under one lock so a trigger is never lost between
    // the last fetch and releasing the running flag.
    fn rerun_requested(&self) -> bool {
        let mut state = self.state();
        if state.dirty {
            state.dirty = false;
            return true;
        }
        state.running = false;
        self.idle.send_replace(true);
        false
    }
}

/// Clears the running flag if a resync future is dropped mid-fetch.
struct RefreshGuard<'a> {
    sync: &'a ConversationSynchronizer,
    released: bool,
}

impl Drop for RefreshGuard<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let mut state = self.sync.state();
        state.running = false;
        state.dirty = false;
        self.sync.idle.send_replace(true);
    }
}

#[cfg(test)]
#[path = "tests/sync_tests.rs"]
mod tests;
