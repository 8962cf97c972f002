//! Chat transport capability.
//!
//! Delivery, authentication, and deduplication of inbound events happen
//! upstream; the engine only consumes `InboundEvent`s and calls back through
//! `ChatTransport`.

pub mod slack;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use slack::SlackClient;

/// A message event in a conversation thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundEvent {
    pub channel: String,
    /// Root timestamp of the thread the message belongs to.
    pub thread: String,
    #[serde(default)]
    pub user: String,
    pub text: String,
}

/// Reference to a posted message, used to edit it in place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHandle {
    pub channel: String,
    pub ts: String,
}

impl MessageHandle {
    pub fn new(channel: &str, ts: &str) -> Self {
        Self {
            channel: channel.to_string(),
            ts: ts.to_string(),
        }
    }
}

/// Outbound chat operations.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn post_message(&self, channel: &str, thread: &str, text: &str) -> Result<()>;

    async fn post_message_returning_handle(
        &self,
        channel: &str,
        thread: &str,
        text: &str,
    ) -> Result<MessageHandle>;

    async fn update_message(&self, handle: &MessageHandle, text: &str) -> Result<()>;

    async fn add_reaction(&self, channel: &str, ts: &str, emoji: &str) -> Result<()>;
}
