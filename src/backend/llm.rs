//! Synchronous LLM chat backend (C8, §4.7).
//!
//! Grounded on `backend/gpt.py`: a per-conversation message cache keyed by
//! `(reply-to, channel, user)` with a fixed system turn, reset unless
//! `--followup` is given, one chat-completion call per request. The HTTP
//! call itself follows the teacher's `llm/model.rs` OpenAI-compatible
//! request shape (Bearer auth, `{model, messages}` body, `chat.completions`).

use crate::argparse::{parse_prompt, PromptArgSpec};
use crate::config::GptConfig;
use crate::envelope::{Envelope, Reply};
use crate::error::{ArgError, Result, UpstreamError};
use crate::worker::{Readiness, SendFn, Worker};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

const SYSTEM_PROMPT: &str = "You are a helpful assistant. Make your answers as brief as possible.";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct ChatTurn {
    role: String,
    content: String,
}

impl ChatTurn {
    fn system() -> Self {
        Self { role: "system".to_string(), content: SYSTEM_PROMPT.to_string() }
    }
    fn user(content: impl Into<String>) -> Self {
        Self { role: "user".to_string(), content: content.into() }
    }
    fn assistant(content: impl Into<String>) -> Self {
        Self { role: "assistant".to_string(), content: content.into() }
    }
}

/// Per-conversation chat cache, keyed `(reply-to, channel, user)` (§3).
type ChatCache = Arc<Mutex<HashMap<String, Vec<ChatTurn>>>>;

pub struct LlmBackend {
    config: GptConfig,
    http: reqwest::Client,
    cache: ChatCache,
    send: Arc<RwLock<Option<SendFn>>>,
}

impl LlmBackend {
    pub fn new(config: GptConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
            cache: Arc::new(Mutex::new(HashMap::new())),
            send: Arc::new(RwLock::new(None)),
        }
    }

    fn cache_key(envelope: &Envelope) -> String {
        format!(
            "{}_{}_{}",
            envelope.reply_to,
            envelope.context.channel.as_deref().unwrap_or(""),
            envelope.context.user.as_deref().unwrap_or(""),
        )
    }

    async fn send_reply(&self, mut envelope: Envelope, reply: Reply) {
        envelope.route_reply();
        envelope.reply = reply;
        if let Some(send) = self.send.read().await.clone() {
            if let Err(e) = send(envelope).await {
                tracing::error!(error = %e, "failed to send llm backend reply");
            }
        }
    }

    /// Call the configured provider's `chat/completions` endpoint with the
    /// full cached conversation as context.
    async fn complete(&self, messages: &[ChatTurn]) -> std::result::Result<String, UpstreamError> {
        let url = format!("{}/chat/completions", self.config_base_url());
        let body = serde_json::json!({
            "model": self.config.model,
            "messages": messages,
        });

        let mut request = self.http.post(&url).header("content-type", "application/json");
        if let Some(org) = &self.config.organization {
            request = request.header("openai-organization", org);
        }
        let response = request
            .header("authorization", format!("Bearer {}", self.config.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|_| UpstreamError::Unavailable)?;

        let status = response.status();
        let text = response.text().await.map_err(|_| UpstreamError::Unknown)?;

        if status.as_u16() == 429 || status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(UpstreamError::RateLimitOrAuth);
        }
        if status.as_u16() == 400 || status.as_u16() == 404 {
            return Err(UpstreamError::InvalidRequest);
        }
        if status.as_u16() >= 500 || status.as_u16() == 408 {
            return Err(UpstreamError::Unavailable);
        }
        if !status.is_success() {
            return Err(UpstreamError::Unknown);
        }

        let value: serde_json::Value = serde_json::from_str(&text).map_err(|_| UpstreamError::Unknown)?;
        value["choices"][0]["message"]["content"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or(UpstreamError::Unknown)
    }

    fn config_base_url(&self) -> &str {
        "https://api.openai.com/v1"
    }
}

#[async_trait]
impl Worker for LlmBackend {
    fn name(&self) -> &str {
        "gpt"
    }

    async fn boot(&self, _address: crate::address::WorkerAddress, readiness: Readiness, send: SendFn) -> Result<()> {
        *self.send.write().await = Some(send);
        readiness.set_ready();
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }

    async fn receive(&self, _subject: &str, envelope: Envelope) -> Result<bool> {
        let args = match parse_prompt(&envelope.trigger, &envelope.prompt, &PromptArgSpec::llm()) {
            Ok(args) => args,
            Err(ArgError::Usage(text)) => {
                self.send_reply(envelope, Reply::Usage(text)).await;
                return Ok(true);
            }
            Err(ArgError::Invalid(msg)) => {
                let trigger = envelope.trigger.clone();
                self.send_reply(envelope, Reply::Error(format!("Something is wrong with your arguments, try {trigger} --help ({msg})"))).await;
                return Ok(true);
            }
        };

        if args.list_models {
            let mut names = self.config.models.clone();
            if names.is_empty() {
                names.push(self.config.model.clone());
            }
            self.send_reply(envelope, Reply::Text(format!("Available models: {}", names.join(", ")))).await;
            return Ok(true);
        }

        let key = Self::cache_key(&envelope);
        let messages = {
            let mut cache = self.cache.lock().await;
            let line = cache.entry(key.clone()).or_insert_with(|| vec![ChatTurn::system()]);
            if !args.followup {
                *line = vec![ChatTurn::system()];
            }
            line.push(ChatTurn::user(args.prompt.clone()));
            line.clone()
        };

        match self.complete(&messages).await {
            Ok(reply) => {
                self.cache.lock().await.entry(key).or_default().push(ChatTurn::assistant(reply.clone()));
                self.send_reply(envelope, Reply::Text(reply)).await;
            }
            Err(category) => {
                // Don't let a failed call poison the cache with a dangling user turn.
                if let Some(line) = self.cache.lock().await.get_mut(&key) {
                    line.pop();
                }
                self.send_reply(envelope, Reply::Error(format!("GPT {category}"))).await;
            }
        }

        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Context;

    fn config() -> GptConfig {
        GptConfig { api_key: "sk-test".into(), organization: None, model: "gpt-4o-mini".into(), models: vec![] }
    }

    fn envelope() -> Envelope {
        Envelope::request(
            "backend.gpt",
            "frontend.irc.x",
            "!gpt",
            "hello",
            "irc",
            Context { channel: Some("#room".into()), user: Some("alice".into()), ..Default::default() },
        )
    }

    #[test]
    fn cache_key_is_reply_to_channel_user() {
        assert_eq!(LlmBackend::cache_key(&envelope()), "frontend.irc.x_#room_alice");
    }

    #[tokio::test]
    async fn fresh_conversation_resets_cache_unless_followup() {
        let backend = LlmBackend::new(config());
        let key = LlmBackend::cache_key(&envelope());
        {
            let mut cache = backend.cache.lock().await;
            cache.insert(key.clone(), vec![ChatTurn::system(), ChatTurn::user("old"), ChatTurn::assistant("reply")]);
        }

        let args = parse_prompt("!gpt", "new question", &PromptArgSpec::llm()).unwrap();
        assert!(!args.followup);

        let mut cache = backend.cache.lock().await;
        let line = cache.entry(key).or_insert_with(|| vec![ChatTurn::system()]);
        if !args.followup {
            *line = vec![ChatTurn::system()];
        }
        line.push(ChatTurn::user(args.prompt.clone()));
        assert_eq!(line.len(), 2);
        assert_eq!(line[1].content, "new question");
    }
}
