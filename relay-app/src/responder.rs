//! Completion orchestration for one admitted prompt: typing indicator on,
//! a single backend call, exactly one reply, typing indicator off.

use crate::classify::{FailureClass, classify_failure};
use anyhow::Result;
use futures_util::FutureExt;
use relay_channels::{ChannelAdapter, InboundMessage};
use relay_llm::{CompletionBackend, CompletionRequest, CompletionResponse};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

pub const REPLY_EMPTY: &str = "Maaf, saya tidak mendapatkan respons yang valid saat ini.";
pub const REPLY_FILTERED: &str = "Maaf, respons diblokir karena alasan keamanan konten.";
pub const REPLY_QUOTA: &str = "Maaf, kuota penggunaan API telah tercapai.";
pub const REPLY_FAILED: &str = "Maaf, terjadi kesalahan saat memproses permintaan Anda ke AI.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionOutcome {
    Success(String),
    /// The backend answered with no candidates at all.
    Empty,
    Filtered,
    QuotaExceeded,
    Failed(String),
}

impl CompletionOutcome {
    pub fn from_response(response: &CompletionResponse) -> Self {
        if response.candidates.is_empty() {
            return Self::Empty;
        }
        if let Some(text) = response.first_text() {
            return Self::Success(text.to_string());
        }
        // Candidates exist but none carries text: the finish reason says why.
        let finish_reason = response
            .candidates
            .iter()
            .find_map(|c| c.finish_reason.as_deref())
            .unwrap_or("UNSPECIFIED");
        Self::from_failure(format!(
            "candidate carried no text: finish_reason={finish_reason}"
        ))
    }

    pub fn from_failure(detail: impl Into<String>) -> Self {
        let detail = detail.into();
        match classify_failure(&detail) {
            FailureClass::SafetyBlock => Self::Filtered,
            FailureClass::QuotaExceeded => Self::QuotaExceeded,
            FailureClass::Generic => Self::Failed(detail),
        }
    }

    /// The exact text sent back to the chat.
    pub fn reply_text(&self) -> &str {
        match self {
            Self::Success(text) => text,
            Self::Empty => REPLY_EMPTY,
            Self::Filtered => REPLY_FILTERED,
            Self::QuotaExceeded => REPLY_QUOTA,
            Self::Failed(_) => REPLY_FAILED,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Success(_) => "success",
            Self::Empty => "empty",
            Self::Filtered => "filtered",
            Self::QuotaExceeded => "quota_exceeded",
            Self::Failed(_) => "failed",
        }
    }
}

#[derive(Clone)]
pub struct Responder {
    backend: Arc<dyn CompletionBackend>,
}

impl Responder {
    pub fn new(backend: Arc<dyn CompletionBackend>) -> Self {
        Self { backend }
    }

    pub fn model(&self) -> &str {
        self.backend.model()
    }

    /// Run one completion and classify it. Never fails: backend errors and
    /// panics become outcomes.
    #[tracing::instrument(level = "debug", skip_all, fields(model = %self.backend.model(), prompt_chars = prompt.chars().count()))]
    pub async fn complete(&self, prompt: &str) -> CompletionOutcome {
        let request = CompletionRequest::new(prompt);
        let call = AssertUnwindSafe(self.backend.generate(&request)).catch_unwind();
        match call.await {
            Ok(Ok(response)) => {
                tracing::debug!(
                    candidates = response.candidates.len(),
                    prompt_block_reason = ?response.prompt_block_reason,
                    prompt_tokens = response.usage.prompt_tokens,
                    completion_tokens = response.usage.completion_tokens,
                    "completion received"
                );
                CompletionOutcome::from_response(&response)
            }
            Ok(Err(error)) => {
                tracing::warn!(%error, "completion request failed");
                CompletionOutcome::from_failure(error.to_string())
            }
            Err(payload) => {
                let detail = format!(
                    "backend panicked: {}",
                    crate::panic_payload_to_string(payload.as_ref())
                );
                tracing::error!(%detail, "completion backend panicked");
                CompletionOutcome::Failed(detail)
            }
        }
    }

    /// Answer `message` with the completion for `prompt`.
    ///
    /// The typing indicator is cleared exactly once on every path. A failed
    /// reply send is returned after the clear.
    #[tracing::instrument(
        level = "info",
        skip_all,
        fields(
            channel = %channel.channel_id(),
            chat_id = %message.chat_id,
            message_id = %message.message_id,
        )
    )]
    pub async fn respond(
        &self,
        channel: &Arc<dyn ChannelAdapter>,
        message: &InboundMessage,
        prompt: &str,
    ) -> Result<CompletionOutcome> {
        let typing = TypingGuard::start(channel.clone(), message.clone()).await;

        let outcome = self.complete(prompt).await;
        tracing::info!(outcome = outcome.label(), "completion classified");

        let sent = channel.reply(message, outcome.reply_text()).await;
        typing.release().await;

        sent.map_err(|e| e.context(format!("send reply to chat {}", message.chat_id)))?;
        Ok(outcome)
    }
}

/// Holds the typing indicator for one message. `release` clears it; if the
/// guard is dropped unreleased (task aborted), `Drop` schedules the clear.
struct TypingGuard {
    channel: Arc<dyn ChannelAdapter>,
    message: InboundMessage,
    released: bool,
}

impl TypingGuard {
    async fn start(channel: Arc<dyn ChannelAdapter>, message: InboundMessage) -> Self {
        if let Err(error) = channel.send_typing(&message, true).await {
            tracing::debug!(%error, chat_id = %message.chat_id, "typing indicator not set");
        }
        Self {
            channel,
            message,
            released: false,
        }
    }

    async fn release(mut self) {
        self.released = true;
        clear_typing(self.channel.as_ref(), &self.message).await;
    }
}

impl Drop for TypingGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(chat_id = %self.message.chat_id, "no runtime to clear typing indicator");
            return;
        };
        let channel = self.channel.clone();
        let message = self.message.clone();
        handle.spawn(async move {
            clear_typing(channel.as_ref(), &message).await;
        });
    }
}

async fn clear_typing(channel: &dyn ChannelAdapter, message: &InboundMessage) {
    if let Err(error) = channel.send_typing(message, false).await {
        tracing::debug!(%error, chat_id = %message.chat_id, "typing indicator not cleared");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use relay_channels::{ChatContext, OutboundMessage};
    use relay_llm::{Candidate, LlmError};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Event {
        TypingOn(String),
        TypingOff(String),
        Reply {
            chat_id: String,
            text: String,
            reply_to: Option<String>,
        },
    }

    #[derive(Default)]
    struct FakeChannel {
        events: Mutex<Vec<Event>>,
        fail_send: bool,
        typing_unsupported: bool,
    }

    impl FakeChannel {
        fn events(&self) -> Vec<Event> {
            self.events.lock().expect("events lock").clone()
        }

        fn typing_off_count(&self) -> usize {
            self.events()
                .iter()
                .filter(|e| matches!(e, Event::TypingOff(_)))
                .count()
        }
    }

    #[async_trait]
    impl ChannelAdapter for FakeChannel {
        fn channel_id(&self) -> &str {
            "fake"
        }

        async fn start(&self, _tx: mpsc::Sender<InboundMessage>) -> anyhow::Result<()> {
            Ok(())
        }

        async fn send(&self, chat_id: &str, message: OutboundMessage) -> anyhow::Result<()> {
            self.events.lock().expect("events lock").push(Event::Reply {
                chat_id: chat_id.to_string(),
                text: message.content,
                reply_to: message.reply_to_message_id.map(|id| id.to_string()),
            });
            if self.fail_send {
                return Err(anyhow::anyhow!("transport down"));
            }
            Ok(())
        }

        async fn send_typing(&self, message: &InboundMessage, active: bool) -> anyhow::Result<()> {
            let chat = message.chat_id.to_string();
            self.events.lock().expect("events lock").push(if active {
                Event::TypingOn(chat)
            } else {
                Event::TypingOff(chat)
            });
            if self.typing_unsupported {
                return Err(anyhow::anyhow!("send_typing is not supported"));
            }
            Ok(())
        }
    }

    enum Behavior {
        Respond(CompletionResponse),
        Fail { status: u16, detail: String },
        Panic,
        Hang,
    }

    struct FakeBackend {
        behavior: Behavior,
        calls: AtomicUsize,
        last_request: Mutex<Option<CompletionRequest>>,
    }

    impl FakeBackend {
        fn new(behavior: Behavior) -> Arc<Self> {
            Arc::new(Self {
                behavior,
                calls: AtomicUsize::new(0),
                last_request: Mutex::new(None),
            })
        }
    }

    #[async_trait]
    impl CompletionBackend for FakeBackend {
        fn model(&self) -> &str {
            "fake-model"
        }

        async fn generate(&self, request: &CompletionRequest) -> relay_llm::Result<CompletionResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last_request.lock().expect("request lock") = Some(request.clone());
            match &self.behavior {
                Behavior::Respond(response) => Ok(response.clone()),
                Behavior::Fail { status, detail } => Err(LlmError::Api {
                    status: *status,
                    detail: detail.clone(),
                }),
                Behavior::Panic => panic!("backend exploded"),
                Behavior::Hang => std::future::pending().await,
            }
        }
    }

    fn text_response(text: &str) -> CompletionResponse {
        CompletionResponse {
            candidates: vec![Candidate {
                text: Some(text.to_string()),
                finish_reason: Some("STOP".to_string()),
            }],
            ..CompletionResponse::default()
        }
    }

    fn inbound() -> InboundMessage {
        InboundMessage {
            message_id: "msg-1".into(),
            channel_id: "fake".into(),
            chat_id: "628222@c.us".into(),
            sender_id: "628222@c.us".into(),
            body: "!gemini Apa kabar?".to_string(),
            is_status: false,
            chat: ChatContext::direct(),
            metadata: serde_json::Value::Null,
            received_at: Utc::now(),
        }
    }

    async fn run(
        behavior: Behavior,
        channel: FakeChannel,
    ) -> (Arc<FakeChannel>, Arc<FakeBackend>, Result<CompletionOutcome>) {
        let channel = Arc::new(channel);
        let backend = FakeBackend::new(behavior);
        let responder = Responder::new(backend.clone());
        let dyn_channel: Arc<dyn ChannelAdapter> = channel.clone();
        let result = responder
            .respond(&dyn_channel, &inbound(), "Apa kabar?")
            .await;
        (channel, backend, result)
    }

    fn reply_texts(channel: &FakeChannel) -> Vec<String> {
        channel
            .events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Reply { text, .. } => Some(text),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn success_sequence_is_typing_reply_clear() {
        let (channel, backend, result) =
            run(Behavior::Respond(text_response("Baik!")), FakeChannel::default()).await;

        assert_eq!(
            result.expect("respond succeeds"),
            CompletionOutcome::Success("Baik!".to_string())
        );
        assert_eq!(
            channel.events(),
            vec![
                Event::TypingOn("628222@c.us".to_string()),
                Event::Reply {
                    chat_id: "628222@c.us".to_string(),
                    text: "Baik!".to_string(),
                    reply_to: Some("msg-1".to_string()),
                },
                Event::TypingOff("628222@c.us".to_string()),
            ]
        );
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn backend_receives_fixed_generation_and_safety_config() {
        let (_, backend, _) =
            run(Behavior::Respond(text_response("ok")), FakeChannel::default()).await;

        let request = backend
            .last_request
            .lock()
            .expect("request lock")
            .clone()
            .expect("backend was called");
        assert_eq!(request.prompt, "Apa kabar?");
        assert_eq!(request.generation_config.temperature, 0.7);
        assert_eq!(request.generation_config.top_k, 1);
        assert_eq!(request.generation_config.top_p, 1.0);
        assert_eq!(request.generation_config.max_output_tokens, 2048);
        assert_eq!(request.safety_settings.len(), 4);
    }

    #[tokio::test]
    async fn quota_failure_replies_with_quota_notice() {
        let (channel, _, result) = run(
            Behavior::Fail {
                status: 429,
                detail: "You exceeded your current quota".to_string(),
            },
            FakeChannel::default(),
        )
        .await;

        assert_eq!(result.expect("respond succeeds"), CompletionOutcome::QuotaExceeded);
        assert_eq!(reply_texts(&channel), vec![REPLY_QUOTA.to_string()]);
        assert_eq!(channel.typing_off_count(), 1);
    }

    #[tokio::test]
    async fn zero_candidates_reply_with_empty_notice() {
        let blocked = CompletionResponse {
            prompt_block_reason: Some("SAFETY".to_string()),
            ..CompletionResponse::default()
        };
        let (channel, _, result) = run(Behavior::Respond(blocked), FakeChannel::default()).await;

        assert_eq!(result.expect("respond succeeds"), CompletionOutcome::Empty);
        assert_eq!(reply_texts(&channel), vec![REPLY_EMPTY.to_string()]);
        assert_eq!(channel.typing_off_count(), 1);
    }

    #[tokio::test]
    async fn safety_failure_replies_with_filtered_notice() {
        let (channel, _, result) = run(
            Behavior::Fail {
                status: 400,
                detail: "Response was blocked due to SAFETY".to_string(),
            },
            FakeChannel::default(),
        )
        .await;

        assert_eq!(result.expect("respond succeeds"), CompletionOutcome::Filtered);
        assert_eq!(reply_texts(&channel), vec![REPLY_FILTERED.to_string()]);
    }

    #[tokio::test]
    async fn textless_candidate_is_classified_by_finish_reason() {
        let response = CompletionResponse {
            candidates: vec![Candidate {
                text: None,
                finish_reason: Some("SAFETY".to_string()),
            }],
            ..CompletionResponse::default()
        };
        let (channel, _, result) = run(Behavior::Respond(response), FakeChannel::default()).await;

        assert_eq!(result.expect("respond succeeds"), CompletionOutcome::Filtered);
        assert_eq!(reply_texts(&channel), vec![REPLY_FILTERED.to_string()]);
    }

    #[tokio::test]
    async fn generic_failure_replies_with_generic_notice() {
        let (channel, _, result) = run(
            Behavior::Fail {
                status: 500,
                detail: "Internal error encountered. (INTERNAL)".to_string(),
            },
            FakeChannel::default(),
        )
        .await;

        let outcome = result.expect("respond succeeds");
        match &outcome {
            CompletionOutcome::Failed(detail) => assert!(detail.contains("INTERNAL")),
            other => panic!("expected Failed, got {other:?}"),
        }
        assert_eq!(reply_texts(&channel), vec![REPLY_FAILED.to_string()]);
        assert_eq!(channel.typing_off_count(), 1);
    }

    #[tokio::test]
    async fn backend_panic_still_replies_and_clears_typing_once() {
        let (channel, _, result) = run(Behavior::Panic, FakeChannel::default()).await;

        match result.expect("respond succeeds") {
            CompletionOutcome::Failed(detail) => assert!(detail.contains("backend exploded")),
            other => panic!("expected Failed, got {other:?}"),
        }
        assert_eq!(reply_texts(&channel), vec![REPLY_FAILED.to_string()]);
        assert_eq!(channel.typing_off_count(), 1);
        assert!(matches!(channel.events().last(), Some(Event::TypingOff(_))));
    }

    #[tokio::test]
    async fn failed_reply_send_is_returned_after_typing_clear() {
        let channel = FakeChannel {
            fail_send: true,
            ..FakeChannel::default()
        };
        let (channel, _, result) = run(Behavior::Respond(text_response("hi")), channel).await;

        let err = result.expect_err("send failure surfaces");
        assert!(format!("{err:#}").contains("transport down"));
        assert_eq!(channel.typing_off_count(), 1);
        assert!(matches!(channel.events().last(), Some(Event::TypingOff(_))));
    }

    #[tokio::test]
    async fn unsupported_typing_does_not_block_the_reply() {
        let channel = FakeChannel {
            typing_unsupported: true,
            ..FakeChannel::default()
        };
        let (channel, _, result) = run(Behavior::Respond(text_response("hi")), channel).await;

        assert_eq!(
            result.expect("respond succeeds"),
            CompletionOutcome::Success("hi".to_string())
        );
        assert_eq!(reply_texts(&channel), vec!["hi".to_string()]);
        assert_eq!(channel.typing_off_count(), 1);
    }

    #[tokio::test]
    async fn aborted_task_still_clears_typing() {
        let channel = Arc::new(FakeChannel::default());
        let responder = Responder::new(FakeBackend::new(Behavior::Hang));
        let dyn_channel: Arc<dyn ChannelAdapter> = channel.clone();

        let task = tokio::spawn(async move {
            let _ = responder.respond(&dyn_channel, &inbound(), "halo").await;
        });
        while !channel.events().contains(&Event::TypingOn("628222@c.us".to_string())) {
            tokio::task::yield_now().await;
        }
        task.abort();
        assert!(task.await.expect_err("task was aborted").is_cancelled());
        for _ in 0..10 {
            if channel.typing_off_count() > 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }

        assert_eq!(channel.typing_off_count(), 1);
        assert!(reply_texts(&channel).is_empty());
    }

    #[test]
    fn reply_strings_are_exact() {
        assert_eq!(
            CompletionOutcome::Empty.reply_text(),
            "Maaf, saya tidak mendapatkan respons yang valid saat ini."
        );
        assert_eq!(
            CompletionOutcome::Filtered.reply_text(),
            "Maaf, respons diblokir karena alasan keamanan konten."
        );
        assert_eq!(
            CompletionOutcome::QuotaExceeded.reply_text(),
            "Maaf, kuota penggunaan API telah tercapai."
        );
        assert_eq!(
            CompletionOutcome::Failed("x".to_string()).reply_text(),
            "Maaf, terjadi kesalahan saat memproses permintaan Anda ke AI."
        );
    }
}
