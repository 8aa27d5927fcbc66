use std::time::Duration;

use async_trait::async_trait;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::{
    sync::mpsc,
    time::{interval_at, timeout, Instant, Interval, MissedTickBehavior},
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{self, Message},
};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    error::TransportError,
    stomp::{decode_all, negotiate_outgoing_heartbeat, Command, Frame},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerEndpoint {
    pub url: Url,
    /// Virtual host announced in the CONNECT frame.
    pub host: String,
    /// Outgoing heart-beat offered to the broker; zero disables it.
    pub heartbeat: Duration,
    pub connect_timeout: Duration,
}

pub type InboundFrames = mpsc::UnboundedReceiver<Result<Frame, TransportError>>;

/// An established STOMP session.
///
/// Dropping `outbound` closes the socket. The inbound side yields an error
/// (or ends) once the link is unusable.
pub struct BrokerLink {
    pub outbound: mpsc::UnboundedSender<Frame>,
    pub inbound: InboundFrames,
}

#[async_trait]
pub trait BrokerConnector: Send + Sync {
    /// Opens the socket and completes the CONNECT/CONNECTED exchange.
    async fn connect(&self, endpoint: &BrokerEndpoint) -> Result<BrokerLink, TransportError>;
}

/// STOMP over a tungstenite WebSocket.
pub struct WsConnector;

#[async_trait]
impl BrokerConnector for WsConnector {
    async fn connect(&self, endpoint: &BrokerEndpoint) -> Result<BrokerLink, TransportError> {
        let (ws_stream, _) = timeout(endpoint.connect_timeout, connect_async(endpoint.url.as_str()))
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|err| TransportError::Connect {
                url: endpoint.url.to_string(),
                reason: err.to_string(),
            })?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let connect = Frame::connect(&endpoint.host, endpoint.heartbeat);
        ws_writer
            .send(Message::Text(connect.encode()))
            .await
            .map_err(|err| TransportError::Io(err.to_string()))?;

        let connected = timeout(endpoint.connect_timeout, await_connected(&mut ws_reader))
            .await
            .map_err(|_| TransportError::Timeout)??;
        let heartbeat =
            negotiate_outgoing_heartbeat(endpoint.heartbeat, connected.header("heart-beat"));
        info!(
            url = %endpoint.url,
            version = connected.header("version").unwrap_or("unknown"),
            heartbeat_ms = heartbeat.map(|d| d.as_millis() as u64).unwrap_or(0),
            "chat: stomp session established"
        );

        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound) = mpsc::unbounded_channel();
        tokio::spawn(write_frames(ws_writer, outbound_rx, heartbeat));
        tokio::spawn(read_frames(ws_reader, inbound_tx));

        Ok(BrokerLink { outbound, inbound })
    }
}

async fn await_connected<S>(reader: &mut S) -> Result<Frame, TransportError>
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    while let Some(msg) = reader.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                for frame in decode_all(&text)? {
                    match frame.command {
                        Command::Connected => return Ok(frame),
                        Command::Error => {
                            return Err(TransportError::Rejected(error_summary(&frame)))
                        }
                        other => debug!(command = %other, "chat: frame before CONNECTED ignored"),
                    }
                }
            }
            Ok(Message::Close(_)) => return Err(TransportError::Closed),
            Ok(_) => {}
            Err(err) => return Err(TransportError::Io(err.to_string())),
        }
    }
    Err(TransportError::Closed)
}

async fn write_frames<S>(
    mut writer: S,
    mut frames: mpsc::UnboundedReceiver<Frame>,
    heartbeat: Option<Duration>,
) where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    let mut ticker = heartbeat.map(|period| {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    });

    loop {
        let next = tokio::select! {
            frame = frames.recv() => match frame {
                Some(frame) => Message::Text(frame.encode()),
                None => break,
            },
            _ = next_tick(&mut ticker) => Message::Text("\n".to_string()),
        };
        if let Err(err) = writer.send(next).await {
            warn!("chat: websocket write failed: {err}");
            return;
        }
    }

    let _ = writer.close().await;
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn read_frames<S>(
    mut reader: S,
    inbound: mpsc::UnboundedSender<Result<Frame, TransportError>>,
) where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    while let Some(msg) = reader.next().await {
        let text = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(_) => {
                    let _ = inbound.send(Err(TransportError::Protocol(
                        crate::error::StompError::InvalidUtf8,
                    )));
                    return;
                }
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(err) => {
                let _ = inbound.send(Err(TransportError::Io(err.to_string())));
                return;
            }
        };

        match decode_all(&text) {
            Ok(frames) => {
                for frame in frames {
                    if inbound.send(Ok(frame)).is_err() {
                        return;
                    }
                }
            }
            Err(err) => {
                let _ = inbound.send(Err(err.into()));
                return;
            }
        }
    }
    let _ = inbound.send(Err(TransportError::Closed));
}

pub(crate) fn error_summary(frame: &Frame) -> String {
    match frame.header("message") {
        Some(message) if !message.is_empty() => message.to_string(),
        _ => frame.body.trim().to_string(),
    }
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
