//! The Slack frontend (C6, §4.5), adapted from the Socket Mode adapter this
//! repository used to ship: a `slack-morphism` push-event listener that
//! turns triggered messages into envelopes and a [`Worker`] that renders
//! replies back onto the channel that asked for them.

use crate::address::WorkerAddress;
use crate::config::Triggers;
use crate::envelope::{Context, Envelope, Reply};
use crate::error::{Error, Result};
use crate::worker::{Readiness, SendFn, Worker};
use anyhow::Context as _;
use async_trait::async_trait;
use slack_morphism::prelude::*;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};

/// Split `text` into chunks under Slack's message-length budget.
fn split_message(text: &str, max_len: usize) -> Vec<String> {
    if text.len() <= max_len {
        return vec![text.to_string()];
    }
    let mut chunks = Vec::new();
    let mut remaining = text;
    while !remaining.is_empty() {
        if remaining.len() <= max_len {
            chunks.push(remaining.to_string());
            break;
        }
        let mut safe_max = max_len.min(remaining.len());
        while !remaining.is_char_boundary(safe_max) {
            safe_max -= 1;
        }
        let split_at = remaining[..safe_max]
            .rfind('\n')
            .or_else(|| remaining[..safe_max].rfind(' '))
            .unwrap_or(safe_max);
        chunks.push(remaining[..split_at].to_string());
        remaining = remaining[split_at..].trim_start();
    }
    chunks
}

/// Identical trigger-matching rule as IRC (§4.5).
fn match_trigger(triggers: &Triggers, text: &str) -> Option<(String, String, String)> {
    for trigger in triggers.as_list() {
        let needle = if trigger.ends_with(' ') { trigger.clone() } else { format!("{trigger} ") };
        if let Some(prompt) = text.strip_prefix(needle.as_str()) {
            let key = trigger.trim_end();
            let backend = triggers.route_for(key).or_else(|| triggers.route_for(trigger.as_str()))?;
            return Some((key.to_string(), backend, prompt.to_string()));
        }
    }
    None
}

/// State shared with socket-mode callbacks via `SlackClientEventsUserState`.
struct SlackAdapterState {
    triggers: Triggers,
    address: WorkerAddress,
    send: SendFn,
    bot_user_id: String,
}

fn slack_error_handler(
    error: Box<dyn std::error::Error + Send + Sync>,
    _client: Arc<SlackHyperClient>,
    _states: SlackClientEventsUserState,
) -> HttpStatusCode {
    tracing::error!(error = %error, "slack socket-mode error");
    HttpStatusCode::OK
}

/// Callbacks passed to the socket-mode listener must be plain async fn
/// pointers (slack-morphism requirement); per-call state comes from
/// `SlackClientEventsUserState`, not a captured closure environment.
async fn handle_push_event(
    event: SlackPushEventCallback,
    _client: Arc<SlackHyperClient>,
    states: SlackClientEventsUserState,
) -> UserCallbackResult<()> {
    let SlackEventCallbackBody::Message(message_event) = event.event else {
        return Ok(());
    };
    if message_event.subtype.is_some() {
        return Ok(());
    }

    let state_guard = states.read().await;
    let adapter_state = state_guard
        .get_user_state::<Arc<SlackAdapterState>>()
        .expect("SlackAdapterState must be in user_state");

    let Some(user) = message_event.sender.user.as_ref().map(|u| u.0.clone()) else {
        return Ok(());
    };
    if user == adapter_state.bot_user_id {
        return Ok(());
    }

    let text = message_event
        .content
        .as_ref()
        .and_then(|c| c.text.clone())
        .unwrap_or_default();

    let Some((trigger, backend, prompt)) = match_trigger(&adapter_state.triggers, &text) else {
        return Ok(());
    };

    let channel = message_event.origin.channel.as_ref().map(|c| c.0.clone()).unwrap_or_default();
    let channel_name = if channel.starts_with('D') { "DM".to_string() } else { channel.clone() };
    let team_id = event.team_id.0.clone();

    let context = Context {
        server: Some(team_id.clone()),
        channel: Some(channel),
        user: Some(user),
        channel_name: Some(channel_name),
        server_name: Some(team_id),
        user_name: None,
        origin_message: Some(message_event.origin.ts.0.clone()),
        image_url: None,
    };

    let envelope = Envelope::request(backend, adapter_state.address.subject(), trigger, prompt, "slack", context);
    if let Err(e) = (adapter_state.send)(envelope).await {
        tracing::error!(error = %e, "failed to dispatch slack-triggered request");
    }

    Ok(())
}

pub struct SlackFrontend {
    bot_token: String,
    app_token: String,
    triggers: Triggers,
    client: Arc<RwLock<Option<Arc<SlackHyperClient>>>>,
    shutdown_tx: Arc<RwLock<Option<mpsc::Sender<()>>>>,
}

impl SlackFrontend {
    pub fn new(bot_token: impl Into<String>, app_token: impl Into<String>, triggers: Triggers) -> Self {
        Self {
            bot_token: bot_token.into(),
            app_token: app_token.into(),
            triggers,
            client: Arc::new(RwLock::new(None)),
            shutdown_tx: Arc::new(RwLock::new(None)),
        }
    }

    async fn session_client(&self) -> Result<Arc<SlackHyperClient>> {
        self.client
            .read()
            .await
            .clone()
            .ok_or_else(|| Error::Other(anyhow::anyhow!("slack client not connected")))
    }

    fn bot_token(&self) -> SlackApiToken {
        SlackApiToken::new(SlackApiTokenValue(self.bot_token.clone()))
    }
}

#[async_trait]
impl Worker for SlackFrontend {
    fn name(&self) -> &str {
        "slack"
    }

    async fn boot(&self, address: WorkerAddress, readiness: Readiness, send: SendFn) -> Result<()> {
        let client = Arc::new(SlackClient::new(
            SlackClientHyperConnector::new().context("failed to create slack http connector")?,
        ));
        *self.client.write().await = Some(client.clone());

        let token = self.bot_token();
        let auth_response = client
            .open_session(&token)
            .auth_test()
            .await
            .context("failed to call auth.test for slack bot user id")?;
        let bot_user_id = auth_response.user_id.0.clone();

        let adapter_state = Arc::new(SlackAdapterState {
            triggers: self.triggers.clone(),
            address,
            send,
            bot_user_id,
        });

        let callbacks = SlackSocketModeListenerCallbacks::new().with_push_events(handle_push_event);

        let listener_client = Arc::new(SlackClient::new(
            SlackClientHyperConnector::new().context("failed to create slack socket-mode connector")?,
        ));

        let listener_environment = Arc::new(
            SlackClientEventsListenerEnvironment::new(listener_client)
                .with_error_handler(slack_error_handler)
                .with_user_state(adapter_state),
        );

        let listener = SlackClientSocketModeListener::new(
            &SlackClientSocketModeConfig::new(),
            listener_environment,
            callbacks,
        );

        let app_token = SlackApiToken::new(SlackApiTokenValue(self.app_token.clone()));
        listener
            .listen_for(&app_token)
            .await
            .context("failed to start slack socket-mode listener")?;

        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
        *self.shutdown_tx.write().await = Some(shutdown_tx);

        readiness.set_ready();
        tokio::select! {
            exit_code = listener.serve() => {
                tracing::info!(exit_code, "slack socket-mode listener stopped");
            }
            _ = shutdown_rx.recv() => {
                tracing::info!("slack socket-mode shutting down");
                listener.shutdown().await;
            }
        }
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        if let Some(tx) = self.shutdown_tx.write().await.take() {
            let _ = tx.send(()).await;
        }
        Ok(())
    }

    /// Render a backend's reply as a Slack message (§4.5: images are
    /// uploaded as attachments, not saved-and-linked).
    async fn receive(&self, _subject: &str, envelope: Envelope) -> Result<bool> {
        let client = self.session_client().await?;
        let token = self.bot_token();
        let session = client.open_session(&token);

        let Some(channel) = envelope.context.channel.clone() else {
            tracing::warn!("reply envelope missing channel context, dropping");
            return Ok(true);
        };
        let channel_id = SlackChannelId(channel.clone());
        let user = envelope.context.user.clone().unwrap_or_default();
        let mention = format!("<@{user}>");

        match &envelope.reply {
            Reply::Text(text) => {
                for chunk in split_message(&format!("{mention}: {text}"), 12_000) {
                    let request = SlackApiChatPostMessageRequest::new(
                        channel_id.clone(),
                        SlackMessageContent::new().with_text(chunk),
                    );
                    session
                        .chat_post_message(&request)
                        .await
                        .map_err(|e| Error::Other(anyhow::anyhow!("failed to send slack message: {e}")))?;
                }
            }
            Reply::Image(bytes) => {
                let upload_url_response = session
                    .get_upload_url_external(&SlackApiFilesGetUploadUrlExternalRequest::new(
                        "dream.png".to_string(),
                        bytes.len(),
                    ))
                    .await
                    .map_err(|e| Error::Other(anyhow::anyhow!("failed to get slack upload url: {e}")))?;

                session
                    .files_upload_via_url(&SlackApiFilesUploadViaUrlRequest::new(
                        upload_url_response.upload_url,
                        bytes.clone(),
                        "image/png".to_string(),
                    ))
                    .await
                    .map_err(|e| Error::Other(anyhow::anyhow!("failed to upload slack attachment: {e}")))?;

                let file_complete =
                    SlackApiFilesComplete::new(upload_url_response.file_id).with_title("dream.png".to_string());
                let mut complete_request =
                    SlackApiFilesCompleteUploadExternalRequest::new(vec![file_complete]).with_channel_id(channel_id.clone());
                complete_request = complete_request.opt_initial_comment(Some(format!("{mention}: I dreamed this")));
                session
                    .files_complete_upload_external(&complete_request)
                    .await
                    .map_err(|e| Error::Other(anyhow::anyhow!("failed to complete slack upload: {e}")))?;
            }
            Reply::Pending(msg) => {
                tracing::info!(channel = %channel, msg = %msg, "backend reply pending, no message sent");
            }
            Reply::Error(err) => {
                let request = SlackApiChatPostMessageRequest::new(
                    channel_id,
                    SlackMessageContent::new().with_text(format!("{mention}: Dream sequence collapsed: {err}")),
                );
                session
                    .chat_post_message(&request)
                    .await
                    .map_err(|e| Error::Other(anyhow::anyhow!("failed to send slack error message: {e}")))?;
            }
            Reply::Usage(usage) => {
                let request = SlackApiChatPostMessageRequest::new(
                    channel_id,
                    SlackMessageContent::new().with_text(format!("{mention}: {usage}")),
                );
                session
                    .chat_post_message(&request)
                    .await
                    .map_err(|e| Error::Other(anyhow::anyhow!("failed to send slack usage message: {e}")))?;
            }
            Reply::None => {
                let request = SlackApiChatPostMessageRequest::new(
                    channel_id,
                    SlackMessageContent::new()
                        .with_text(format!("{mention}: Dream sequence collapsed, unknown reason.")),
                );
                session
                    .chat_post_message(&request)
                    .await
                    .map_err(|e| Error::Other(anyhow::anyhow!("failed to send slack message: {e}")))?;
            }
        }

        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn trigger_matching_mirrors_irc_rule() {
        let mut map = HashMap::new();
        map.insert("!gpt".to_string(), "backend.gpt".to_string());
        let triggers = Triggers::Map(map);

        assert!(match_trigger(&triggers, "!gptastic").is_none());
        let (trigger, backend, prompt) = match_trigger(&triggers, "!gpt hello there").unwrap();
        assert_eq!(trigger, "!gpt");
        assert_eq!(backend, "backend.gpt");
        assert_eq!(prompt, "hello there");
    }

    #[test]
    fn long_message_is_split_under_the_slack_limit() {
        let text = "x".repeat(25_000);
        let chunks = split_message(&text, 12_000);
        assert!(chunks.len() >= 3);
        for chunk in &chunks {
            assert!(chunk.len() <= 12_000);
        }
    }
}
