use serde::{Deserialize, Serialize};

use crate::domain::{ConversationSummary, Identity};

/// Destination chat messages are published to.
pub const PUBLISH_DESTINATION: &str = "/chat/message";

/// Per-identity inbox the broker delivers to.
pub fn inbox_destination(identity: &Identity) -> String {
    format!("/user/{identity}/inbox")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationListRequest {
    pub token: String,
    pub index: u32,
    pub count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationListResponse {
    #[serde(default)]
    pub conversations: Vec<ConversationSummary>,
    /// Decimal string on the wire.
    #[serde(default)]
    pub num_new_message: String,
}

impl ConversationListResponse {
    /// `None` when the server sent something that is not a count.
    pub fn unread_count(&self) -> Option<u32> {
        let raw = self.num_new_message.trim();
        if raw.is_empty() {
            return Some(0);
        }
        raw.parse().ok()
    }
}
