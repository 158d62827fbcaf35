//! The request/reply envelope (§3) and its wire encoding (§6).

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The reply a backend attaches to an envelope before sending it back.
///
/// At most one variant is ever carried at once (§3 invariant); `Reply::None`
/// means no reply field is set yet (a fresh request) or, on the wire, that
/// the collapse case applies.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// No reply field set.
    None,
    /// `reply-text`.
    Text(String),
    /// `reply-image`, raw decoded bytes (base64 on the wire).
    Image(Vec<u8>),
    /// `reply-none`: informational, work started, no user-visible reply.
    Pending(String),
    /// `error`.
    Error(String),
    /// `usage`: help text in response to `--help`.
    Usage(String),
}

impl Reply {
    pub fn is_none(&self) -> bool {
        matches!(self, Reply::None)
    }
}

/// Context fields, opaque to the bus, carried end-to-end (§3).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Context {
    pub server: Option<String>,
    pub channel: Option<String>,
    pub user: Option<String>,
    pub channel_name: Option<String>,
    pub server_name: Option<String>,
    pub user_name: Option<String>,
    pub origin_message: Option<String>,
    pub image_url: Option<String>,
}

/// A request/reply envelope.
///
/// Internally this is a tagged struct (context + sum-typed reply), per the
/// "Envelope typing" design note in §9; it (de)serializes to/from the flat
/// wire layout in §6 via [`Envelope::to_wire`] / [`Envelope::from_wire`].
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub to: String,
    pub reply_to: String,
    pub trigger: String,
    pub prompt: String,
    pub frontend: String,
    pub context: Context,
    pub reply: Reply,
    /// Unknown keys, preserved verbatim (§6 "unknown keys MUST be preserved").
    pub extra: Map<String, Value>,
}

impl Envelope {
    /// Build a fresh outbound request envelope (used by frontends).
    pub fn request(
        to: impl Into<String>,
        reply_to: impl Into<String>,
        trigger: impl Into<String>,
        prompt: impl Into<String>,
        frontend: impl Into<String>,
        context: Context,
    ) -> Self {
        Self {
            to: to.into(),
            reply_to: reply_to.into(),
            trigger: trigger.into(),
            prompt: prompt.into(),
            frontend: frontend.into(),
            context,
            reply: Reply::None,
            extra: Map::new(),
        }
    }

    /// Swap `to`/`reply-to` so the envelope routes back to its originator,
    /// per §4.1's `send` contract ("auto-swaps to/reply-to if the envelope
    /// is being sent back to its originator").
    pub fn route_reply(&mut self) {
        std::mem::swap(&mut self.to, &mut self.reply_to);
    }

    pub fn to_wire(&self) -> Value {
        let mut map = self.extra.clone();
        map.insert("to".into(), Value::String(self.to.clone()));
        map.insert("reply-to".into(), Value::String(self.reply_to.clone()));
        map.insert("trigger".into(), Value::String(self.trigger.clone()));
        map.insert("prompt".into(), Value::String(self.prompt.clone()));
        map.insert("frontend".into(), Value::String(self.frontend.clone()));

        macro_rules! opt {
            ($key:expr, $val:expr) => {
                if let Some(v) = $val {
                    map.insert($key.into(), Value::String(v.clone()));
                }
            };
        }
        opt!("server", &self.context.server);
        opt!("channel", &self.context.channel);
        opt!("user", &self.context.user);
        opt!("channel_name", &self.context.channel_name);
        opt!("server_name", &self.context.server_name);
        opt!("user_name", &self.context.user_name);
        opt!("origin_message", &self.context.origin_message);
        opt!("image_url", &self.context.image_url);

        match &self.reply {
            Reply::None => {}
            Reply::Text(t) => {
                map.insert("reply-text".into(), Value::String(t.clone()));
            }
            Reply::Image(bytes) => {
                use base64::Engine;
                let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
                map.insert("reply-image".into(), Value::String(encoded));
            }
            Reply::Pending(msg) => {
                map.insert("reply-none".into(), Value::String(msg.clone()));
            }
            Reply::Error(e) => {
                map.insert("error".into(), Value::String(e.clone()));
            }
            Reply::Usage(u) => {
                map.insert("usage".into(), Value::String(u.clone()));
            }
        }

        Value::Object(map)
    }

    pub fn from_wire(mut map: Map<String, Value>) -> crate::Result<Self> {
        fn take_string(map: &mut Map<String, Value>, key: &str) -> Option<String> {
            map.remove(key).and_then(|v| match v {
                Value::String(s) => Some(s),
                other => Some(other.to_string()),
            })
        }

        let to = take_string(&mut map, "to").unwrap_or_default();
        let reply_to = take_string(&mut map, "reply-to").unwrap_or_default();
        let trigger = take_string(&mut map, "trigger").unwrap_or_default();
        let prompt = take_string(&mut map, "prompt").unwrap_or_default();
        let frontend = take_string(&mut map, "frontend").unwrap_or_default();

        let context = Context {
            server: take_string(&mut map, "server"),
            channel: take_string(&mut map, "channel"),
            user: take_string(&mut map, "user"),
            channel_name: take_string(&mut map, "channel_name"),
            server_name: take_string(&mut map, "server_name"),
            user_name: take_string(&mut map, "user_name"),
            origin_message: take_string(&mut map, "origin_message"),
            image_url: take_string(&mut map, "image_url"),
        };

        let reply = if let Some(text) = take_string(&mut map, "reply-text") {
            Reply::Text(text)
        } else if let Some(b64) = take_string(&mut map, "reply-image") {
            use base64::Engine;
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(b64)
                .map_err(|e| crate::Error::Other(anyhow::anyhow!("bad reply-image base64: {e}")))?;
            Reply::Image(bytes)
        } else if let Some(msg) = take_string(&mut map, "reply-none") {
            Reply::Pending(msg)
        } else if let Some(err) = take_string(&mut map, "error") {
            Reply::Error(err)
        } else if let Some(usage) = take_string(&mut map, "usage") {
            Reply::Usage(usage)
        } else {
            Reply::None
        };

        Ok(Self {
            to,
            reply_to,
            trigger,
            prompt,
            frontend,
            context,
            reply,
            extra: map,
        })
    }

    pub fn to_json_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(&self.to_wire()).expect("envelope serializes")
    }

    pub fn from_json_bytes(bytes: &[u8]) -> crate::Result<Self> {
        let value: Value = serde_json::from_slice(bytes)
            .map_err(|e| crate::Error::Other(anyhow::anyhow!("bad envelope JSON: {e}")))?;
        match value {
            Value::Object(map) => Self::from_wire(map),
            _ => Err(crate::Error::Other(anyhow::anyhow!(
                "envelope JSON must be an object"
            ))),
        }
    }

    /// A redacted view of the envelope, suitable for logging (§4.3 "Log
    /// censoring MUST replace any reply-image field contents with a
    /// placeholder before logging").
    pub fn redacted_debug(&self) -> String {
        let mut wire = self.to_wire();
        if let Value::Object(map) = &mut wire {
            if map.contains_key("reply-image") {
                map.insert(
                    "reply-image".into(),
                    Value::String("<redacted>".to_string()),
                );
            }
        }
        wire.to_string()
    }
}

/// Minimal serde-only mirror, used where a derive-based Serialize/Deserialize
/// is more convenient than hand-rolled wire conversion (e.g. config fixtures
/// in tests). Not used on the hot envelope path.
#[derive(Debug, Serialize, Deserialize)]
pub struct RawEnvelope(pub Value);

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine as _;

    fn sample() -> Envelope {
        Envelope::request(
            "backend.image",
            "frontend.irc.irc_libera_chat",
            "!dream",
            "a cat",
            "irc",
            Context {
                server: Some("irc.libera.chat".into()),
                channel: Some("#room".into()),
                user: Some("alice".into()),
                origin_message: None,
                ..Default::default()
            },
        )
    }

    #[test]
    fn round_trips_through_wire_json() {
        let env = sample();
        let bytes = env.to_json_bytes();
        let back = Envelope::from_json_bytes(&bytes).unwrap();
        assert_eq!(env, back);
    }

    #[test]
    fn unknown_keys_are_preserved() {
        let mut map = Map::new();
        map.insert("to".into(), Value::String("backend.gpt".into()));
        map.insert("reply-to".into(), Value::String("frontend.irc.x".into()));
        map.insert("trigger".into(), Value::String("!gpt".into()));
        map.insert("prompt".into(), Value::String("hi".into()));
        map.insert("frontend".into(), Value::String("irc".into()));
        map.insert("some_future_field".into(), Value::Bool(true));

        let env = Envelope::from_wire(map).unwrap();
        assert_eq!(env.extra.get("some_future_field"), Some(&Value::Bool(true)));

        let wire = env.to_wire();
        assert_eq!(wire.get("some_future_field"), Some(&Value::Bool(true)));
    }

    #[test]
    fn route_reply_swaps_to_and_reply_to() {
        let mut env = sample();
        let (to, reply_to) = (env.to.clone(), env.reply_to.clone());
        env.route_reply();
        assert_eq!(env.to, reply_to);
        assert_eq!(env.reply_to, to);
    }

    #[test]
    fn redacted_debug_hides_image_bytes() {
        let mut env = sample();
        env.reply = Reply::Image(vec![1, 2, 3, 4]);
        let redacted = env.redacted_debug();
        assert!(!redacted.contains(&base64::engine::general_purpose::STANDARD.encode([1, 2, 3, 4])));
        assert!(redacted.contains("<redacted>"));
    }

    /// Testable property 2: envelope round-trip preserves context fields
    /// through a to/reply-to swap.
    #[test]
    fn context_fields_survive_a_reply_round_trip() {
        let mut req = sample();
        req.context.origin_message = Some("msg-123".into());
        let mut reply = req.clone();
        reply.route_reply();
        reply.reply = Reply::Text("ok".into());

        assert_eq!(req.reply_to, reply.to);
        assert_eq!(req.context.server, reply.context.server);
        assert_eq!(req.context.channel, reply.context.channel);
        assert_eq!(req.context.user, reply.context.user);
        assert_eq!(req.context.origin_message, reply.context.origin_message);
    }
}
