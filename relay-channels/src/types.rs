use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::ops::Deref;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self::new(value)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self::new(value)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                self.as_str()
            }
        }

        impl Deref for $name {
            type Target = str;

            fn deref(&self) -> &Self::Target {
                self.as_str()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

id_newtype!(MessageId);
id_newtype!(ChannelId);
id_newtype!(SenderId);
id_newtype!(ChatId);

/// Read-only view of the conversation a message arrived in.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatContext {
    pub is_group: bool,
    #[serde(default)]
    pub mentioned_ids: HashSet<SenderId>,
}

impl ChatContext {
    pub fn direct() -> Self {
        Self::default()
    }

    pub fn group<I, S>(mentioned_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<SenderId>,
    {
        Self {
            is_group: true,
            mentioned_ids: mentioned_ids.into_iter().map(Into::into).collect(),
        }
    }

    pub fn mentions(&self, id: &str) -> bool {
        self.mentioned_ids.iter().any(|m| m.as_str() == id)
    }
}

/// Immutable snapshot of one inbound text event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub message_id: MessageId,
    pub channel_id: ChannelId,
    /// Conversation the reply and typing indicator target.
    pub chat_id: ChatId,
    pub sender_id: SenderId,
    pub body: String,
    /// Status/broadcast updates are never actionable.
    #[serde(default)]
    pub is_status: bool,
    #[serde(default)]
    pub chat: ChatContext,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub content: String,
    #[serde(default)]
    pub reply_to_message_id: Option<MessageId>,
}

impl OutboundMessage {
    pub fn reply_to(message: &InboundMessage, content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            reply_to_message_id: Some(message.message_id.clone()),
        }
    }
}
