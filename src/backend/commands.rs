//! Small utility-command backend (C9, §4.8).
//!
//! Grounded on `backend/commands.py`: dispatch on the trigger itself (this
//! backend has no per-command flags), compute a reply, done.

use crate::argparse::{parse_prompt, PromptArgSpec};
use crate::envelope::{Envelope, Reply};
use crate::error::{ArgError, Result};
use crate::worker::{Readiness, SendFn, Worker};
use async_trait::async_trait;
use rand::Rng;
use std::sync::Arc;
use tokio::sync::RwLock;

pub struct CommandsBackend {
    send: Arc<RwLock<Option<SendFn>>>,
}

impl CommandsBackend {
    pub fn new() -> Self {
        Self { send: Arc::new(RwLock::new(None)) }
    }

    fn respond_to(trigger: &str, prompt: &str) -> String {
        match trigger {
            "!chance" => {
                let n = rand::rng().random_range(1..=100);
                format!("{n}% chance {prompt}")
            }
            _ => "Unknown command".to_string(),
        }
    }

    async fn send_reply(&self, mut envelope: Envelope, reply: Reply) {
        envelope.route_reply();
        envelope.reply = reply;
        if let Some(send) = self.send.read().await.clone() {
            if let Err(e) = send(envelope).await {
                tracing::error!(error = %e, "failed to send commands backend reply");
            }
        }
    }
}

impl Default for CommandsBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Worker for CommandsBackend {
    fn name(&self) -> &str {
        "commands"
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
        let args = match parse_prompt(&envelope.trigger, &envelope.prompt, &PromptArgSpec::commands()) {
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

        let trigger = envelope.trigger.clone();
        let reply = Self::respond_to(&trigger, &args.prompt);
        self.send_reply(envelope, Reply::Text(reply)).await;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chance_reply_has_a_percentage_prefix_and_echoes_prompt() {
        let reply = CommandsBackend::respond_to("!chance", "it rains tomorrow");
        assert!(reply.ends_with("% chance it rains tomorrow"));
        let pct: u32 = reply.split('%').next().unwrap().parse().unwrap();
        assert!((1..=100).contains(&pct));
    }

    #[test]
    fn unknown_trigger_falls_back() {
        assert_eq!(CommandsBackend::respond_to("!bogus", "whatever"), "Unknown command");
    }
}
