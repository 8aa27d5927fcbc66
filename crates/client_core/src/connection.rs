//! One resilient broker subscription per identity.
//!
//! ```text
//! start ──▶ Connecting ──ok──▶ Connected ──error──▶ Reconnecting ──tick──▶ Connected
//!              │                                        ▲      │
//!              └──────────────error─────────────────────┘      └─fail─▶ (next tick)
//! stop (any state) ──▶ Disconnected
//! ```
//!
//! Every `start` opens a new epoch. Tasks spawned for an older epoch (the
//! initial attempt, the reconnect timer, the frame reader) check it under the
//! lock and turn into no-ops once `stop` or a newer `start` has run.
//!
//! The message handler lives behind its own dispatch gate, held for the
//! whole handler call. `stop` clears the gate, so once it returns no handler
//! is running and none will run again for that epoch.

use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use shared::{
    domain::{Identity, InboundMessage, OutboundMessage},
    protocol::inbox_destination,
};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::{interval_at, Instant, MissedTickBehavior},
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    error::TransportError,
    stomp::{Command, Frame},
    transport::{error_summary, BrokerConnector, BrokerEndpoint, BrokerLink, InboundFrames},
};

pub type MessageHandler = Arc<dyn Fn(InboundMessage) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub endpoint: BrokerEndpoint,
    pub reconnect_interval: Duration,
    pub publish_destination: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    pub connect_attempts: u64,
    pub reconnect_timers_armed: u64,
}

pub struct ConnectionManager {
    shared: Arc<Shared>,
}

struct Shared {
    connector: Arc<dyn BrokerConnector>,
    options: ConnectionOptions,
    state: watch::Sender<ConnectionState>,
    // Lock order: `dispatch` before `inner`.
    dispatch: Mutex<Option<LiveHandler>>,
    inner: Mutex<Inner>,
}

struct LiveHandler {
    epoch: u64,
    on_message: MessageHandler,
}

#[derive(Default)]
struct Inner {
    epoch: u64,
    target: Option<Target>,
    link: Option<ActiveLink>,
    attempt_task: Option<JoinHandle<()>>,
    reconnect_task: Option<JoinHandle<()>>,
    stats: ConnectionStats,
}

struct Target {
    identity: Identity,
}

struct ActiveLink {
    outbound: mpsc::UnboundedSender<Frame>,
    reader: JoinHandle<()>,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn BrokerConnector>, options: ConnectionOptions) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            shared: Arc::new(Shared {
                connector,
                options,
                state,
                dispatch: Mutex::new(None),
                inner: Mutex::new(Inner::default()),
            }),
        }
    }

    /// Tears down any previous session and starts connecting for `identity`
    /// in the background. Without an identity the manager stays
    /// disconnected. Must be called from within a tokio runtime.
    pub fn start(&self, identity: Option<Identity>, on_message: MessageHandler) {
        self.stop();
        let Some(identity) = identity else {
            info!("chat: no identity; connection stays down");
            return;
        };

        let mut dispatch = self.shared.dispatch();
        let mut inner = self.shared.lock();
        inner.epoch += 1;
        let epoch = inner.epoch;
        info!(identity = %identity, epoch, "chat: starting inbox connection");
        *dispatch = Some(LiveHandler { epoch, on_message });
        drop(dispatch);
        inner.target = Some(Target { identity });
        self.shared.state.send_replace(ConnectionState::Connecting);
        let shared = Arc::clone(&self.shared);
        inner.attempt_task = Some(tokio::spawn(async move {
            shared.connect_once(epoch).await;
        }));
    }

    /// Releases the link, cancels pending reconnects and detaches the
    /// message handler, waiting for a delivery already in progress. Must not
    /// be called from inside the message handler. Idempotent.
    pub fn stop(&self) {
        self.shared.stop();
    }

    /// Publishes `message` to the chat destination and reports whether it was
    /// queued on the link. Messages sent while not connected are dropped;
    /// there is no outbound queue.
    pub fn send(&self, message: &OutboundMessage) -> bool {
        let inner = self.shared.lock();
        let link = match (&inner.link, *self.shared.state.borrow()) {
            (Some(link), ConnectionState::Connected) => link,
            (_, state) => {
                warn!(?state, "chat: not connected; outbound message dropped");
                return false;
            }
        };
        let body = match serde_json::to_string(message) {
            Ok(body) => body,
            Err(err) => {
                warn!("chat: failed to encode outbound message: {err}");
                return false;
            }
        };
        let frame = Frame::send_json(&self.shared.options.publish_destination, body);
        if link.outbound.send(frame).is_err() {
            warn!("chat: link closed before outbound message could be queued");
            return false;
        }
        true
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    #[cfg(test)]
    pub(crate) fn reconnect_pending(&self) -> bool {
        self.shared.lock().reconnect_task.is_some()
    }

    #[cfg(test)]
    pub(crate) fn stats(&self) -> ConnectionStats {
        self.shared.lock().stats
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.shared.stop();
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn dispatch(&self) -> MutexGuard<'_, Option<LiveHandler>> {
        self.dispatch.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn stop(&self) {
        // Blocks until an in-flight handler call has returned.
        self.dispatch().take();
        let mut inner = self.lock();
        inner.epoch += 1;
        let had_target = inner.target.take().is_some();
        if let Some(task) = inner.attempt_task.take() {
            task.abort();
        }
        if let Some(task) = inner.reconnect_task.take() {
            task.abort();
        }
        if let Some(link) = inner.link.take() {
            link.reader.abort();
            let _ = link.outbound.send(Frame::disconnect());
        }
        self.state.send_replace(ConnectionState::Disconnected);
        if had_target {
            info!(epoch = inner.epoch, "chat: inbox connection stopped");
        }
    }

    /// One full connect + subscribe sequence. Returns whether the link is up.
    async fn connect_once(self: &Arc<Self>, epoch: u64) -> bool {
        let (identity, attempt) = {
            let mut inner = self.lock();
            if inner.epoch != epoch {
                return false;
            }
            let Some(target) = inner.target.as_ref() else {
                return false;
            };
            let identity = target.identity.clone();
            inner.stats.connect_attempts += 1;
            (identity, inner.stats.connect_attempts)
        };
        debug!(identity = %identity, attempt, "chat: connecting to broker");

        let BrokerLink { outbound, inbound } =
            match self.connector.connect(&self.options.endpoint).await {
                Ok(link) => link,
                Err(err) => {
                    self.handle_transport_failure(epoch, &err);
                    return false;
                }
            };

        let destination = inbox_destination(&identity);
        let subscription_id = format!("sub-{}", Uuid::new_v4().simple());
        if outbound
            .send(Frame::subscribe(&subscription_id, &destination))
            .is_err()
        {
            self.handle_transport_failure(epoch, &TransportError::Closed);
            return false;
        }

        let mut inner = self.lock();
        if inner.epoch != epoch {
            let _ = outbound.send(Frame::disconnect());
            return false;
        }
        let reader = tokio::spawn(Arc::clone(self).read_frames(epoch, inbound));
        inner.link = Some(ActiveLink { outbound, reader });
        // The timer that drove this attempt (if any) ends on its own.
        inner.reconnect_task = None;
        self.state.send_replace(ConnectionState::Connected);
        info!(
            identity = %identity,
            destination = %destination,
            attempt,
            "chat: subscribed to inbox"
        );
        true
    }

    fn handle_transport_failure(self: &Arc<Self>, epoch: u64, err: &TransportError) {
        let mut inner = self.lock();
        if inner.epoch != epoch || inner.target.is_none() {
            return;
        }
        warn!(epoch, "chat: broker connection failed: {err}");
        if let Some(link) = inner.link.take() {
            link.reader.abort();
        }
        self.state.send_replace(ConnectionState::Reconnecting);
        self.arm_reconnect(&mut inner, epoch);
    }

    fn arm_reconnect(self: &Arc<Self>, inner: &mut Inner, epoch: u64) {
        if inner.reconnect_task.is_some() {
            debug!(epoch, "chat: reconnect already scheduled");
            return;
        }
        let period = self.options.reconnect_interval;
        inner.stats.reconnect_timers_armed += 1;
        info!(
            epoch,
            interval_ms = period.as_millis() as u64,
            "chat: scheduling reconnect"
        );
        let shared = Arc::clone(self);
        inner.reconnect_task = Some(tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if shared.connect_once(epoch).await {
                    return;
                }
                if shared.lock().epoch != epoch {
                    return;
                }
            }
        }));
    }

    async fn read_frames(self: Arc<Self>, epoch: u64, mut inbound: InboundFrames) {
        while let Some(event) = inbound.recv().await {
            let frame = match event {
                Ok(frame) => frame,
                Err(err) => {
                    self.handle_transport_failure(epoch, &err);
                    return;
                }
            };
            match frame.command {
                Command::Message => self.deliver(epoch, &frame),
                Command::Error => {
                    let err = TransportError::Rejected(error_summary(&frame));
                    self.handle_transport_failure(epoch, &err);
                    return;
                }
                other => debug!(command = %other, "chat: ignoring broker frame"),
            }
        }
        self.handle_transport_failure(epoch, &TransportError::Closed);
    }

    fn deliver(&self, epoch: u64, frame: &Frame) {
        let message = match serde_json::from_str::<InboundMessage>(&frame.body) {
            Ok(message) => message,
            Err(err) => {
                warn!(
                    destination = frame.header("destination").unwrap_or(""),
                    "chat: dropping malformed inbound message: {err}"
                );
                return;
            }
        };
        let dispatch = self.dispatch();
        match dispatch.as_ref() {
            Some(live) if live.epoch == epoch => (live.on_message)(message),
            _ => debug!(epoch, message_id = message.id.0, "chat: stale delivery dropped"),
        }
    }
}

#[cfg(test)]
#[path = "tests/connection_tests.rs"]
mod tests;
