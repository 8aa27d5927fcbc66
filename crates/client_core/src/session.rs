//! The chat service for one signed-in user.
//!
//! A [`ChatSession`] owns the broker connection, the listener registry and
//! the conversation synchronizer, and wires them together: every inbound
//! message is dispatched to the registered listeners (or to the fallback
//! when nobody received it) and, when written by someone else, refreshes
//! the conversation list in the background.

use std::{
    future::Future,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use shared::domain::{Identity, InboundMessage, OutboundMessage, Recipient};
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, info};

use crate::{
    connection::{ConnectionManager, ConnectionOptions, ConnectionState, MessageHandler},
    error::SettingsError,
    listeners::{Listener, ListenerGuard, ListenerHandle, ListenerRegistry},
    settings::ClientSettings,
    sync::{
        ConversationCache, ConversationSource, ConversationSynchronizer, RestConversationSource,
        SyncOutcome,
    },
    transport::{BrokerConnector, WsConnector},
};

/// The outside world a session talks to.
pub struct SessionDeps {
    pub connector: Arc<dyn BrokerConnector>,
    pub conversations: Arc<dyn ConversationSource>,
}

impl SessionDeps {
    /// WebSocket broker and REST conversation listing at the configured server.
    pub fn from_settings(settings: &ClientSettings) -> Result<Self, SettingsError> {
        Ok(Self {
            connector: Arc::new(WsConnector),
            conversations: Arc::new(RestConversationSource::new(settings.conversations_url()?)),
        })
    }
}

pub struct ChatSession {
    manager: ConnectionManager,
    listeners: Arc<ListenerRegistry>,
    conversations: Arc<dyn ConversationSource>,
    cache: Arc<watch::Sender<ConversationCache>>,
    synchronizer: Option<Arc<ConversationSynchronizer>>,
    resyncs: Arc<ResyncTasks>,
    fallback: Option<Listener>,
    token: String,
    page_size: u32,
}

impl ChatSession {
    /// Builds the session and starts connecting for `identity` in the
    /// background. Only configuration problems are reported here; broker
    /// failures are retried and surface through [`ChatSession::state`].
    pub fn connect(
        settings: &ClientSettings,
        deps: SessionDeps,
        identity: Option<Identity>,
        token: impl Into<String>,
        fallback: Option<Listener>,
    ) -> Result<Self, SettingsError> {
        let options = ConnectionOptions {
            endpoint: settings.broker_endpoint()?,
            reconnect_interval: settings.reconnect_interval(),
            publish_destination: settings.publish_destination.clone(),
        };
        let (cache, _) = watch::channel(ConversationCache::default());
        let mut session = Self {
            manager: ConnectionManager::new(deps.connector, options),
            listeners: Arc::new(ListenerRegistry::new()),
            conversations: deps.conversations,
            cache: Arc::new(cache),
            synchronizer: None,
            resyncs: Arc::new(ResyncTasks::default()),
            fallback,
            token: token.into(),
            page_size: settings.page_size,
        };
        session.open(identity);
        Ok(session)
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.synchronizer.as_ref().map(|sync| sync.identity())
    }

    pub fn is_connected(&self) -> bool {
        self.manager.is_connected()
    }

    pub fn state(&self) -> ConnectionState {
        self.manager.state()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.manager.watch_state()
    }

    /// Publishes `message`; returns whether it went out on the link.
    pub fn send(&self, message: &OutboundMessage) -> bool {
        let sent = self.manager.send(message);
        if sent {
            if let Some(sync) = &self.synchronizer {
                sync.note_local_send();
            }
        }
        sent
    }

    /// Sends `content` to `receiver` as the current identity.
    pub fn send_to(&self, receiver: Recipient, content: impl Into<String>) -> bool {
        let Some(sender) = self.identity().cloned() else {
            debug!("chat: no identity; nothing to send as");
            return false;
        };
        self.send(&OutboundMessage {
            token: self.token.clone(),
            sender,
            receiver,
            content: content.into(),
        })
    }

    pub fn add_listener(&self, listener: Listener) -> ListenerHandle {
        self.listeners.add_listener(listener)
    }

    pub fn remove_listener(&self, handle: ListenerHandle) -> bool {
        self.listeners.remove_listener(handle)
    }

    pub fn remove_callback(&self, listener: &Listener) -> usize {
        self.listeners.remove_callback(listener)
    }

    pub fn scoped_listener(&self, listener: Listener) -> ListenerGuard {
        self.listeners.scoped(listener)
    }

    pub fn conversations(&self) -> watch::Receiver<ConversationCache> {
        self.cache.subscribe()
    }

    /// Refreshes the conversation list now. `None` without an identity.
    ///
    /// When a refresh is already running this returns `Coalesced` only after
    /// that refresh, and the fetch it owes us, have finished, so the cache is
    /// current either way.
    pub async fn resync(&self) -> Option<SyncOutcome> {
        let sync = self.synchronizer.clone()?;
        let outcome = sync.resync().await;
        if outcome == SyncOutcome::Coalesced {
            sync.wait_idle().await;
        }
        Some(outcome)
    }

    /// Ends the current identity's connection and starts over for
    /// `identity`. Listeners stay registered.
    pub fn switch_identity(&mut self, identity: Option<Identity>, token: impl Into<String>) {
        self.token = token.into();
        self.open(identity);
    }

    /// Disconnects and stops all background work. Listeners stay registered.
    pub fn close(&mut self) {
        self.manager.stop();
        self.resyncs.abort_all();
        self.synchronizer = None;
    }

    fn open(&mut self, identity: Option<Identity>) {
        self.close();
        self.cache.send_replace(ConversationCache::default());
        let Some(identity) = identity else {
            self.manager.start(None, Arc::new(|_: InboundMessage| {}));
            return;
        };

        let sync = Arc::new(ConversationSynchronizer::new(
            Arc::clone(&self.conversations),
            identity.clone(),
            self.token.clone(),
            self.page_size,
            Arc::clone(&self.cache),
        ));
        self.synchronizer = Some(Arc::clone(&sync));
        let handler = self.inbound_handler(Arc::clone(&sync));
        self.manager.start(Some(identity.clone()), handler);
        info!(identity = %identity, "chat: session opened");

        self.resyncs.spawn(async move {
            sync.resync().await;
        });
    }

    fn inbound_handler(&self, sync: Arc<ConversationSynchronizer>) -> MessageHandler {
        let listeners = Arc::clone(&self.listeners);
        let fallback = self.fallback.clone();
        let resyncs = Arc::clone(&self.resyncs);
        Arc::new(move |message: InboundMessage| {
            let report = listeners.dispatch(&message);
            if report.delivered == 0 {
                if let Some(fallback) = &fallback {
                    fallback(&message);
                }
            }
            if sync.triggers_resync(&message) {
                let sync = Arc::clone(&sync);
                resyncs.spawn(async move {
                    sync.observe(&message).await;
                });
            }
        })
    }
}

impl Drop for ChatSession {
    fn drop(&mut self) {
        self.close();
    }
}

#[derive(Default)]
struct ResyncTasks {
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl ResyncTasks {
    fn spawn(&self, task: impl Future<Output = ()> + Send + 'static) {
        let mut handles = self.handles();
        handles.retain(|handle| !handle.is_finished());
        handles.push(tokio::spawn(task));
    }

    fn abort_all(&self) {
        for handle in self.handles().drain(..) {
            handle.abort();
        }
    }

    fn handles(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.handles.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
