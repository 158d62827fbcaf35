//! The Discord frontend (C6, §4.5), adapted from the messaging adapter this
//! repository used to ship: a serenity `EventHandler` that turns triggered
//! messages into envelopes and a [`Worker`] that renders replies back onto
//! the channel that asked for them.

use crate::address::WorkerAddress;
use crate::config::Triggers;
use crate::envelope::{Context, Envelope, Reply};
use crate::error::{Error, Result};
use crate::worker::{Readiness, SendFn, Worker};
use async_trait::async_trait;
use serenity::all::{
    ChannelId, Context as SerenityContext, CreateAttachment, CreateMessage, EventHandler,
    GatewayIntents, Http, Message, Ready, ShardManager, UserId,
};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Split `text` into chunks under Discord's 2000-character message limit,
/// preferring to break on a newline or space.
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

/// Find a configured trigger that prefixes `text`, and the backend address
/// it routes to. Mirrors the IRC frontend's matching rule exactly (§4.5:
/// "identical trigger-matching rule as IRC").
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

pub struct DiscordFrontend {
    token: String,
    triggers: Triggers,
    http: Arc<RwLock<Option<Arc<Http>>>>,
    shard_manager: Arc<RwLock<Option<Arc<ShardManager>>>>,
}

impl DiscordFrontend {
    pub fn new(token: impl Into<String>, triggers: Triggers) -> Self {
        Self {
            token: token.into(),
            triggers,
            http: Arc::new(RwLock::new(None)),
            shard_manager: Arc::new(RwLock::new(None)),
        }
    }

    async fn http(&self) -> Result<Arc<Http>> {
        self.http
            .read()
            .await
            .clone()
            .ok_or_else(|| Error::Other(anyhow::anyhow!("discord client not connected")))
    }
}

struct Handler {
    triggers: Triggers,
    address: WorkerAddress,
    send: SendFn,
    readiness: Readiness,
    http_slot: Arc<RwLock<Option<Arc<Http>>>>,
    bot_user_id: Arc<RwLock<Option<UserId>>>,
}

#[async_trait]
impl EventHandler for Handler {
    async fn ready(&self, ctx: SerenityContext, ready: Ready) {
        tracing::info!(bot_name = %ready.user.name, "discord connected");
        *self.http_slot.write().await = Some(ctx.http.clone());
        *self.bot_user_id.write().await = Some(ready.user.id);
        self.readiness.set_ready();
    }

    async fn message(&self, _ctx: SerenityContext, message: Message) {
        let bot_user_id = *self.bot_user_id.read().await;
        if bot_user_id.is_some_and(|id| message.author.id == id) {
            return;
        }

        let Some((trigger, backend, prompt)) = match_trigger(&self.triggers, &message.content) else {
            return;
        };

        let channel_name = if message.guild_id.is_none() { "DM".to_string() } else { message.channel_id.to_string() };
        let image_url = message.attachments.first().map(|a| a.url.clone());

        let context = Context {
            server: message.guild_id.map(|g| g.to_string()),
            channel: Some(message.channel_id.to_string()),
            user: Some(message.author.id.to_string()),
            channel_name: Some(channel_name),
            server_name: message.guild_id.map(|g| g.to_string()),
            user_name: Some(message.author.name.clone()),
            origin_message: Some(message.id.to_string()),
            image_url,
        };

        let envelope = Envelope::request(backend, self.address.subject(), trigger, prompt, "discord", context);
        if let Err(e) = (self.send)(envelope).await {
            tracing::error!(error = %e, "failed to dispatch discord-triggered request");
        }
    }
}

#[async_trait]
impl Worker for DiscordFrontend {
    fn name(&self) -> &str {
        "discord"
    }

    async fn boot(&self, address: WorkerAddress, readiness: Readiness, send: SendFn) -> Result<()> {
        let handler = Handler {
            triggers: self.triggers.clone(),
            address,
            send,
            readiness,
            http_slot: self.http.clone(),
            bot_user_id: Arc::new(RwLock::new(None)),
        };

        let intents = GatewayIntents::GUILD_MESSAGES | GatewayIntents::DIRECT_MESSAGES | GatewayIntents::MESSAGE_CONTENT;

        let mut client = serenity::Client::builder(&self.token, intents)
            .event_handler(handler)
            .await
            .map_err(|e| Error::Other(anyhow::anyhow!("failed to build discord client: {e}")))?;

        *self.shard_manager.write().await = Some(client.shard_manager.clone());

        client
            .start()
            .await
            .map_err(|e| Error::Other(anyhow::anyhow!("discord gateway error: {e}")))
    }

    async fn shutdown(&self) -> Result<()> {
        if let Some(shard_manager) = self.shard_manager.read().await.as_ref() {
            shard_manager.shutdown_all().await;
        }
        Ok(())
    }

    /// Render a backend's reply as a Discord message (§4.5: images are
    /// uploaded as attachments, not saved-and-linked).
    async fn receive(&self, _subject: &str, envelope: Envelope) -> Result<bool> {
        let http = self.http().await?;
        let Some(channel) = envelope.context.channel.as_deref() else {
            tracing::warn!("reply envelope missing channel context, dropping");
            return Ok(true);
        };
        let channel_id: ChannelId = channel
            .parse::<u64>()
            .map(ChannelId::new)
            .map_err(|e| Error::Other(anyhow::anyhow!("invalid discord channel id '{channel}': {e}")))?;

        let user = envelope.context.user.clone().unwrap_or_default();
        let mention = format!("<@{user}>");

        match &envelope.reply {
            Reply::Text(text) => {
                for chunk in split_message(&format!("{mention}: {text}"), 2000) {
                    channel_id
                        .say(&*http, &chunk)
                        .await
                        .map_err(|e| Error::Other(anyhow::anyhow!("failed to send discord message: {e}")))?;
                }
            }
            Reply::Image(bytes) => {
                let attachment = CreateAttachment::bytes(bytes.clone(), "dream.png");
                let builder = CreateMessage::new().content(format!("{mention}: I dreamed this")).add_file(attachment);
                channel_id
                    .send_message(&*http, builder)
                    .await
                    .map_err(|e| Error::Other(anyhow::anyhow!("failed to send discord attachment: {e}")))?;
            }
            Reply::Pending(msg) => {
                tracing::info!(channel = %channel, msg = %msg, "backend reply pending, no message sent");
            }
            Reply::Error(err) => {
                channel_id
                    .say(&*http, format!("{mention}: Dream sequence collapsed: {err}"))
                    .await
                    .map_err(|e| Error::Other(anyhow::anyhow!("failed to send discord error message: {e}")))?;
            }
            Reply::Usage(usage) => {
                channel_id
                    .say(&*http, format!("{mention}: {usage}"))
                    .await
                    .map_err(|e| Error::Other(anyhow::anyhow!("failed to send discord usage message: {e}")))?;
            }
            Reply::None => {
                channel_id
                    .say(&*http, format!("{mention}: Dream sequence collapsed, unknown reason."))
                    .await
                    .map_err(|e| Error::Other(anyhow::anyhow!("failed to send discord message: {e}")))?;
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
        map.insert("!dream".to_string(), "backend.image".to_string());
        let triggers = Triggers::Map(map);

        assert!(match_trigger(&triggers, "!dreamy thing").is_none());
        let (trigger, backend, prompt) = match_trigger(&triggers, "!dream a cat").unwrap();
        assert_eq!(trigger, "!dream");
        assert_eq!(backend, "backend.image");
        assert_eq!(prompt, "a cat");
    }

    #[test]
    fn long_message_is_split_under_the_discord_limit() {
        let text = "x".repeat(4500);
        let chunks = split_message(&text, 2000);
        assert!(chunks.len() >= 3);
        for chunk in &chunks {
            assert!(chunk.len() <= 2000);
        }
    }
}
