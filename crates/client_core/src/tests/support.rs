use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use shared::{
    domain::{ConversationSummary, Identity, InboundMessage, MessageId, Peer},
    protocol::{ConversationListRequest, ConversationListResponse},
};
use tokio::sync::{mpsc, Notify};

use crate::{
    error::TransportError,
    stomp::{Command, Frame},
    sync::ConversationSource,
    transport::{BrokerConnector, BrokerEndpoint, BrokerLink},
};

pub(crate) fn identity(raw: &str) -> Identity {
    Identity::parse(raw).expect("identity")
}

pub(crate) fn sample_message(id: i64, sender_id: &str) -> InboundMessage {
    InboundMessage {
        id: MessageId(id),
        sender: Peer {
            id: sender_id.to_string(),
            name: format!("user-{sender_id}"),
            avatar: String::new(),
        },
        content: format!("message {id}"),
        created_at: "2024-01-01T00:00:00Z".parse().expect("timestamp"),
    }
}

pub(crate) fn message_frame(body: impl Into<String>) -> Frame {
    Frame::new(Command::Message)
        .with_header("destination", "/user/42/inbox")
        .with_header("subscription", "sub-0")
        .with_body(body)
}

pub(crate) fn test_endpoint() -> BrokerEndpoint {
    BrokerEndpoint {
        url: url::Url::parse("ws://127.0.0.1:9/ws").expect("url"),
        host: "127.0.0.1".into(),
        heartbeat: Duration::ZERO,
        connect_timeout: Duration::from_secs(1),
    }
}

/// Lets spawned tasks run; under a paused clock this also auto-advances.
pub(crate) async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Script {
    Accept,
    Refuse,
}

/// The test's end of a link handed out by [`ScriptedConnector`].
pub(crate) struct LinkProbe {
    pub inbound: mpsc::UnboundedSender<Result<Frame, TransportError>>,
    pub outbound: mpsc::UnboundedReceiver<Frame>,
}

impl LinkProbe {
    pub fn deliver(&self, body: impl Into<String>) -> bool {
        self.inbound.send(Ok(message_frame(body))).is_ok()
    }

    pub fn deliver_message(&self, message: &InboundMessage) -> bool {
        self.deliver(serde_json::to_string(message).expect("encode"))
    }

    pub fn fail(&self) {
        let _ = self.inbound.send(Err(TransportError::Io("connection reset".into())));
    }

    pub fn drain_outbound(&mut self) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.outbound.try_recv() {
            frames.push(frame);
        }
        frames
    }
}

/// Connector whose outcomes are scripted; refuses once the script runs out.
pub(crate) struct ScriptedConnector {
    script: Mutex<VecDeque<Script>>,
    attempts: AtomicUsize,
    probes: mpsc::UnboundedSender<LinkProbe>,
}

impl ScriptedConnector {
    pub fn new(
        script: impl IntoIterator<Item = Script>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<LinkProbe>) {
        let (probes, probes_rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            script: Mutex::new(script.into_iter().collect()),
            attempts: AtomicUsize::new(0),
            probes,
        });
        (connector, probes_rx)
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BrokerConnector for ScriptedConnector {
    async fn connect(&self, endpoint: &BrokerEndpoint) -> Result<BrokerLink, TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let next = self
            .script
            .lock()
            .expect("script lock")
            .pop_front()
            .unwrap_or(Script::Refuse);
        match next {
            Script::Refuse => Err(TransportError::Connect {
                url: endpoint.url.to_string(),
                reason: "connection refused".into(),
            }),
            Script::Accept => {
                let (outbound, outbound_rx) = mpsc::unbounded_channel();
                let (inbound_tx, inbound) = mpsc::unbounded_channel();
                let _ = self.probes.send(LinkProbe {
                    inbound: inbound_tx,
                    outbound: outbound_rx,
                });
                Ok(BrokerLink { outbound, inbound })
            }
        }
    }
}

/// Conversation listing backed by canned responses.
pub(crate) struct FakeConversationSource {
    responses: Mutex<VecDeque<Result<ConversationListResponse>>>,
    pub requests: Mutex<Vec<ConversationListRequest>>,
    /// When set, each call waits for one notification before answering.
    pub gate: Option<Arc<Notify>>,
}

impl FakeConversationSource {
    pub fn new(responses: impl IntoIterator<Item = Result<ConversationListResponse>>) -> Self {
        Self {
            responses: Mutex::new(responses.into_iter().collect()),
            requests: Mutex::new(Vec::new()),
            gate: None,
        }
    }

    pub fn gated(mut self, gate: Arc<Notify>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().expect("requests lock").len()
    }
}

#[async_trait]
impl ConversationSource for FakeConversationSource {
    async fn list_conversations(
        &self,
        request: &ConversationListRequest,
    ) -> Result<ConversationListResponse> {
        self.requests
            .lock()
            .expect("requests lock")
            .push(request.clone());
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        self.responses
            .lock()
            .expect("responses lock")
            .pop_front()
            .unwrap_or_else(|| Err(anyhow!("no canned response left")))
    }
}

pub(crate) fn listing(peers: &[&str], unread: &str) -> ConversationListResponse {
    ConversationListResponse {
        conversations: peers
            .iter()
            .map(|peer| ConversationSummary {
                peer: Peer {
                    id: peer.to_string(),
                    name: format!("user-{peer}"),
                    avatar: String::new(),
                },
                last_message: None,
                last_message_at: None,
                unread: 0,
            })
            .collect(),
        num_new_message: unread.to_string(),
    }
}
