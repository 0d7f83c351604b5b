//! Dispatch loop: every inbound message is admitted or dropped, and each
//! admitted prompt is answered on its own task.

use crate::admission::{Admission, BotIdentity, decide};
use crate::responder::Responder;
use relay_channels::{ChannelAdapter, InboundMessage};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub struct Gateway {
    identity: Arc<BotIdentity>,
    responder: Responder,
    channel: Arc<dyn ChannelAdapter>,
}

impl Gateway {
    pub fn new(
        identity: Arc<BotIdentity>,
        responder: Responder,
        channel: Arc<dyn ChannelAdapter>,
    ) -> Self {
        Self {
            identity,
            responder,
            channel,
        }
    }

    /// Run the dispatch loop until `shutdown` fires or the inbound queue closes.
    /// In-flight replies are not awaited.
    pub fn start(
        self: Arc<Self>,
        inbound_rx: mpsc::Receiver<InboundMessage>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move { self.run_loop(inbound_rx, shutdown).await })
    }

    #[tracing::instrument(level = "info", skip_all)]
    async fn run_loop(
        &self,
        mut inbound_rx: mpsc::Receiver<InboundMessage>,
        shutdown: CancellationToken,
    ) {
        loop {
            let inbound = tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("gateway loop stopping on shutdown");
                    return;
                }
                msg = inbound_rx.recv() => msg,
            };
            let Some(inbound) = inbound else {
                tracing::info!("inbound queue closed; gateway loop exiting");
                return;
            };
            self.dispatch(inbound);
        }
    }

    /// Spawn the reply task for `inbound` if it is admitted.
    pub fn dispatch(&self, inbound: InboundMessage) -> Option<JoinHandle<()>> {
        let prompt = match decide(&inbound, &self.identity) {
            Admission::Admitted(prompt) => prompt,
            Admission::Rejected(reason) => {
                tracing::debug!(
                    message_id = %inbound.message_id,
                    chat_id = %inbound.chat_id,
                    reason = reason.as_str(),
                    "message not admitted"
                );
                return None;
            }
        };

        tracing::info!(
            message_id = %inbound.message_id,
            chat_id = %inbound.chat_id,
            sender_id = %inbound.sender_id,
            sender_name = inbound.metadata.get("notify_name").and_then(|v| v.as_str()).unwrap_or(""),
            is_group = inbound.chat.is_group,
            prompt_chars = prompt.chars().count(),
            "message admitted"
        );

        let responder = self.responder.clone();
        let channel = self.channel.clone();
        Some(tokio::spawn(async move {
            if let Err(error) = responder.respond(&channel, &inbound, &prompt).await {
                tracing::error!(
                    error = %format!("{error:#}"),
                    message_id = %inbound.message_id,
                    "reply delivery failed"
                );
            }
        }))
    }
}
