//! Real-time inbox client: a STOMP-over-WebSocket subscription per identity,
//! listener fan-out for inbound messages and a conversation list that is
//! refreshed whenever someone else writes.

pub mod connection;
pub mod error;
pub mod listeners;
pub mod session;
pub mod settings;
pub mod stomp;
pub mod sync;
pub mod transport;

pub use connection::{ConnectionManager, ConnectionOptions, ConnectionState, MessageHandler};
pub use error::{SettingsError, StompError, TransportError};
pub use listeners::{DispatchReport, Listener, ListenerGuard, ListenerHandle, ListenerRegistry};
pub use session::{ChatSession, SessionDeps};
pub use settings::{load_settings, ClientSettings};
pub use sync::{
    ConversationCache, ConversationSource, ConversationSynchronizer, RestConversationSource,
    SyncOutcome,
};
pub use transport::{BrokerConnector, BrokerEndpoint, BrokerLink, WsConnector};

#[cfg(test)]
#[path = "tests/support.rs"]
mod test_support;
