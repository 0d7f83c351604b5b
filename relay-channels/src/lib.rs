//! WhatsApp transport adapters for the relay.
//!
//! Adapters are pure I/O: they convert platform events to/from the relay's
//! `InboundMessage` / `OutboundMessage` and expose typing indicators.

mod bridge;
mod dedupe;
mod traits;
mod types;
mod whatsapp;

pub use bridge::{BridgeSessionStatus, WhatsAppBridgeAdapter};
pub use dedupe::RecentIds;
pub use traits::ChannelAdapter;
pub use types::{ChannelId, ChatContext, ChatId, InboundMessage, MessageId, OutboundMessage, SenderId};
pub use whatsapp::{WhatsAppCloudAdapter, parse_cloud_webhook, verify_cloud_signature};
