//! Prompt admission: decides whether an inbound message gets a reply and
//! extracts the prompt text.

use relay_channels::InboundMessage;

/// Process-wide bot identity, fixed at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BotIdentity {
    /// The bot's own WhatsApp id, matched against group mentions.
    pub self_id: String,
    /// Prefix a message must start with. Empty disables prefix gating.
    pub address_prefix: String,
}

impl BotIdentity {
    pub fn new(self_id: impl Into<String>, address_prefix: impl Into<String>) -> Self {
        Self {
            self_id: self_id.into(),
            address_prefix: address_prefix.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    StatusUpdate,
    EmptyBody,
    NotMentioned,
    MissingPrefix,
    EmptyPrompt,
}

impl RejectReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::StatusUpdate => "status_update",
            Self::EmptyBody => "empty_body",
            Self::NotMentioned => "not_mentioned",
            Self::MissingPrefix => "missing_prefix",
            Self::EmptyPrompt => "empty_prompt",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Rejected(RejectReason),
    Admitted(String),
}

/// Decide admission for `msg`. Pure: the same message and identity always
/// yield the same result.
///
/// Group chats need a mention of the bot *and* the prefix (when one is set).
/// Direct chats need only the prefix; with an empty prefix every non-blank
/// body is admitted unchanged.
pub fn decide(msg: &InboundMessage, identity: &BotIdentity) -> Admission {
    if msg.is_status {
        return Admission::Rejected(RejectReason::StatusUpdate);
    }
    if msg.body.trim().is_empty() {
        return Admission::Rejected(RejectReason::EmptyBody);
    }

    if msg.chat.is_group {
        let self_id = identity.self_id.trim();
        if self_id.is_empty() || !msg.chat.mentions(self_id) {
            return Admission::Rejected(RejectReason::NotMentioned);
        }
    }

    let prefix = identity.address_prefix.as_str();
    if prefix.is_empty() {
        return Admission::Admitted(msg.body.clone());
    }

    let Some(rest) = strip_prefix_ignore_case(&msg.body, prefix) else {
        return Admission::Rejected(RejectReason::MissingPrefix);
    };
    let prompt = rest.trim();
    if prompt.is_empty() {
        return Admission::Rejected(RejectReason::EmptyPrompt);
    }
    Admission::Admitted(prompt.to_string())
}

/// Case-insensitive `strip_prefix` that compares char by char, so the split
/// always lands on a char boundary. The remainder keeps its original casing.
fn strip_prefix_ignore_case<'a>(body: &'a str, prefix: &str) -> Option<&'a str> {
    let mut chars = body.chars();
    for expected in prefix.chars() {
        let actual = chars.next()?;
        if !chars_eq_ignore_case(actual, expected) {
            return None;
        }
    }
    Some(chars.as_str())
}

fn chars_eq_ignore_case(a: char, b: char) -> bool {
    a == b || a.to_lowercase().eq(b.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use relay_channels::ChatContext;

    const BOT: &str = "628111@c.us";

    fn identity(prefix: &str) -> BotIdentity {
        BotIdentity::new(BOT, prefix)
    }

    fn direct(body: &str) -> InboundMessage {
        InboundMessage {
            message_id: "m1".into(),
            channel_id: "whatsapp-bridge".into(),
            chat_id: "628222@c.us".into(),
            sender_id: "628222@c.us".into(),
            body: body.to_string(),
            is_status: false,
            chat: ChatContext::direct(),
            metadata: serde_json::Value::Null,
            received_at: Utc::now(),
        }
    }

    fn group(body: &str, mentioned: &[&str]) -> InboundMessage {
        InboundMessage {
            chat_id: "1203630@g.us".into(),
            chat: ChatContext::group(mentioned.iter().copied()),
            ..direct(body)
        }
    }

    #[test]
    fn status_updates_are_always_rejected() {
        for prefix in ["", "!gemini"] {
            let mut msg = direct("!gemini halo");
            msg.is_status = true;
            assert_eq!(
                decide(&msg, &identity(prefix)),
                Admission::Rejected(RejectReason::StatusUpdate)
            );

            let mut msg = group("!gemini halo", &[BOT]);
            msg.is_status = true;
            assert_eq!(
                decide(&msg, &identity(prefix)),
                Admission::Rejected(RejectReason::StatusUpdate)
            );
        }
    }

    #[test]
    fn blank_bodies_are_rejected() {
        for body in ["", "   ", "\n\t"] {
            assert_eq!(
                decide(&direct(body), &identity("")),
                Admission::Rejected(RejectReason::EmptyBody)
            );
        }
    }

    #[test]
    fn empty_prefix_passes_direct_body_through_unchanged() {
        for body in ["halo", "  spasi di depan ", "!gemini tetap utuh"] {
            assert_eq!(
                decide(&direct(body), &identity("")),
                Admission::Admitted(body.to_string())
            );
        }
    }

    #[test]
    fn direct_message_with_prefix_is_admitted_and_stripped() {
        assert_eq!(
            decide(&direct("!gemini Apa kabar?"), &identity("!gemini")),
            Admission::Admitted("Apa kabar?".to_string())
        );
    }

    #[test]
    fn prefix_match_ignores_case_but_keeps_prompt_casing() {
        assert_eq!(
            decide(&direct("!GEMINI  Tulis Puisi  "), &identity("!gemini")),
            Admission::Admitted("Tulis Puisi".to_string())
        );
    }

    #[test]
    fn direct_message_without_prefix_is_rejected() {
        for body in ["halo", "tolong !gemini", "!gemin"] {
            assert_eq!(
                decide(&direct(body), &identity("!gemini")),
                Admission::Rejected(RejectReason::MissingPrefix)
            );
        }
    }

    #[test]
    fn body_equal_to_prefix_is_rejected() {
        for body in ["!gemini", "!Gemini   "] {
            assert_eq!(
                decide(&direct(body), &identity("!gemini")),
                Admission::Rejected(RejectReason::EmptyPrompt)
            );
        }
    }

    #[test]
    fn group_requires_mention_and_prefix() {
        let id = identity("!gemini");
        assert_eq!(
            decide(&group("!gemini hi", &[BOT]), &id),
            Admission::Admitted("hi".to_string())
        );
        assert_eq!(
            decide(&group("!gemini hi", &[]), &id),
            Admission::Rejected(RejectReason::NotMentioned)
        );
        assert_eq!(
            decide(&group("!gemini hi", &["628999@c.us"]), &id),
            Admission::Rejected(RejectReason::NotMentioned)
        );
        assert_eq!(
            decide(&group("hi bot", &[BOT]), &id),
            Admission::Rejected(RejectReason::MissingPrefix)
        );
    }

    #[test]
    fn group_with_empty_prefix_needs_only_a_mention() {
        let id = identity("");
        assert_eq!(
            decide(&group("@628111 halo", &[BOT]), &id),
            Admission::Admitted("@628111 halo".to_string())
        );
        assert_eq!(
            decide(&group("halo semua", &[]), &id),
            Admission::Rejected(RejectReason::NotMentioned)
        );
    }

    #[test]
    fn group_is_rejected_when_self_id_is_unknown() {
        let id = BotIdentity::new("", "!gemini");
        assert_eq!(
            decide(&group("!gemini hi", &[""]), &id),
            Admission::Rejected(RejectReason::NotMentioned)
        );
    }

    #[test]
    fn decision_is_idempotent() {
        let id = identity("!gemini");
        for msg in [
            direct("!gemini satu"),
            direct("dua"),
            group("!gemini tiga", &[BOT]),
            group("!gemini empat", &[]),
        ] {
            assert_eq!(decide(&msg, &id), decide(&msg, &id));
        }
    }

    #[test]
    fn multibyte_bodies_never_split_inside_a_char() {
        let id = identity("!gemini");
        assert_eq!(
            decide(&direct("ééé"), &id),
            Admission::Rejected(RejectReason::MissingPrefix)
        );
        assert_eq!(
            decide(&direct("!gemini 日本語で"), &id),
            Admission::Admitted("日本語で".to_string())
        );
        assert_eq!(
            decide(&direct("!ÄI frage"), &identity("!äi")),
            Admission::Admitted("frage".to_string())
        );
    }
}
