//! Messaging channel abstractions shared by alerting and command handling.
//!
//! The transport itself lives in [`crate::telegram`]; everything else talks to
//! it through [`Notifier`] (outbound) and a stream of [`InboundCommand`]s.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Outbound side of the messaging channel.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Send an HTML message to the operator chat.
    async fn send(&self, text: &str) -> anyhow::Result<()>;

    /// Reply in the conversation a command arrived from.
    async fn reply(&self, conversation: &str, text: &str) -> anyhow::Result<()>;
}

/// A raw inbound message from the command channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundCommand {
    /// Identity of the sender, compared against the allow-set.
    pub sender: String,
    /// Where replies go (chat id for Telegram).
    pub conversation: String,
    /// Raw message text, e.g. `/mute 15`.
    pub text: String,
    /// When the transport received the message.
    pub received_at: DateTime<Utc>,
}
