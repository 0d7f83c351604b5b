use crate::types::{InboundMessage, OutboundMessage};
use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    /// Unique channel identifier: "whatsapp-bridge", "whatsapp".
    fn channel_id(&self) -> &str;

    /// Start receiving messages. Push to tx for each inbound message.
    async fn start(&self, tx: mpsc::Sender<InboundMessage>) -> Result<()>;

    /// Send a message to a specific chat on this platform.
    async fn send(&self, chat_id: &str, message: OutboundMessage) -> Result<()>;

    /// Reply to `message` in the chat it arrived in.
    async fn reply(&self, message: &InboundMessage, text: &str) -> Result<()> {
        self.send(
            message.chat_id.as_str(),
            OutboundMessage::reply_to(message, text),
        )
        .await
    }

    /// Set or clear the typing indicator in the chat `message` arrived in, where supported.
    async fn send_typing(&self, _message: &InboundMessage, _active: bool) -> Result<()> {
        Err(anyhow::anyhow!(
            "send_typing is not supported by this channel"
        ))
    }

    /// The bot's own account identifier, when the platform can report it.
    async fn self_id(&self) -> Result<Option<String>> {
        Ok(None)
    }

    /// Tear down the platform session during graceful shutdown.
    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}
