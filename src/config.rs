//! Configuration loading and validation (§6 "Config JSON").

use crate::error::{ConfigError, Result};
use anyhow::Context as _;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

/// Top-level config JSON, as loaded by every launcher binary.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Bus endpoint(s). Required.
    pub nats_uri: NatsUri,

    /// Either a flat list of trigger phrases (frontend config) or a mapping
    /// trigger → backend address (routing config).
    #[serde(default)]
    pub triggers: Triggers,

    /// Directory to persist generated images (IRC frontend).
    pub output_dir: Option<String>,

    /// Public URL prefix under which `output_dir` is served.
    pub uri_base: Option<String>,

    /// One entry per configured IRC server.
    #[serde(default)]
    pub irc: Vec<IrcServerConfig>,

    pub discord: Option<DiscordConfig>,
    pub slack: Option<SlackConfig>,
    pub gpt: Option<GptConfig>,
    pub image: Option<ImageConfig>,
}

/// `nats_uri` may be a single string or a list of strings.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum NatsUri {
    Single(String),
    Many(Vec<String>),
}

impl NatsUri {
    pub fn as_vec(&self) -> Vec<String> {
        match self {
            NatsUri::Single(s) => vec![s.clone()],
            NatsUri::Many(v) => v.clone(),
        }
    }
}

/// `triggers` may be a flat list (frontend) or a trigger→address map.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Triggers {
    List(Vec<String>),
    Map(HashMap<String, String>),
}

impl Default for Triggers {
    fn default() -> Self {
        Triggers::List(Vec::new())
    }
}

impl Triggers {
    pub fn as_list(&self) -> Vec<String> {
        match self {
            Triggers::List(v) => v.clone(),
            Triggers::Map(m) => m.keys().cloned().collect(),
        }
    }

    /// Resolve the backend address a trigger routes to, if `triggers` is a
    /// mapping.
    pub fn route_for(&self, trigger: &str) -> Option<String> {
        match self {
            Triggers::List(_) => None,
            Triggers::Map(m) => m.get(trigger).cloned(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct IrcServerConfig {
    pub nickname: String,
    pub ident: String,
    pub realname: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub ssl: bool,
    pub channels: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiscordConfig {
    pub token: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SlackConfig {
    pub bot_token: String,
    pub app_token: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GptConfig {
    pub api_key: String,
    #[serde(default)]
    pub organization: Option<String>,
    pub model: String,
    #[serde(default)]
    pub models: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImageModelConfig {
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImageConfig {
    pub host: String,
    pub port: u16,
    pub default_model: String,
    #[serde(default)]
    pub models: HashMap<String, ImageModelConfig>,
}

impl Config {
    /// Load configuration from a JSON file at `path`, per §6's CLI surface
    /// ("one required option: path to a JSON config").
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Load {
            path: path.display().to_string(),
            source: Arc::new(e),
        })?;
        let config: Config = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse config JSON at {}", path.display()))
            .map_err(ConfigError::Other)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.nats_uri.as_vec().iter().all(|s| s.is_empty()) {
            return Err(ConfigError::MissingKey("nats_uri".to_string()).into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_nats_uri_is_rejected() {
        let json = r#"{"nats_uri": ""}"#;
        let cfg: Config = serde_json::from_str(json).unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn triggers_list_and_map_both_parse() {
        let list: Triggers = serde_json::from_str(r#"["!dream ", "!gpt "]"#).unwrap();
        assert_eq!(list.as_list(), vec!["!dream ", "!gpt "]);

        let map: Triggers = serde_json::from_str(r#"{"!dream": "backend.image"}"#).unwrap();
        assert_eq!(map.route_for("!dream").as_deref(), Some("backend.image"));
    }

    #[test]
    fn loads_a_full_config_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{
                "nats_uri": ["nats://localhost:4222"],
                "triggers": ["!dream "],
                "output_dir": "/data",
                "uri_base": "http://localhost:8080/dreams",
                "irc": [
                    {
                        "nickname": "dreambot",
                        "ident": "dreambot",
                        "realname": "a dreaming bot",
                        "host": "irc.example.org",
                        "port": 6697,
                        "ssl": true,
                        "channels": ["#bots"]
                    }
                ]
            }"#,
        )
        .unwrap();

        let cfg = Config::load_from_path(&path).unwrap();
        assert_eq!(cfg.irc.len(), 1);
        assert_eq!(cfg.irc[0].host, "irc.example.org");
    }
}
