//! HTTP + push-channel image backend (C7, §4.6).
//!
//! Grounded on `backend/invokeai.py`'s architecture (POST a session, PUT
//! invoke, wait for an asynchronous completion event on a persistent
//! connection) and `backend/a1111.py`'s model-resolution/init-image rules.
//! The original speaks socket.io over a raw websocket; this rewrite speaks a
//! small JSON protocol directly over `tokio-tungstenite` (the crate this
//! workspace already carries for the push channel) rather than reimplementing
//! socket.io's framing.

use crate::argparse::{parse_prompt, PromptArgSpec};
use crate::config::ImageConfig;
use crate::envelope::{Envelope, Reply};
use crate::error::{ArgError, Error, Result};
use crate::worker::{Readiness, SendFn, Worker};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use image::imageops::FilterType;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message as WsMessage;

const MAX_FETCH_BYTES: usize = 20 * 1024 * 1024;
const THUMBNAIL_SIDE: u32 = 512;

/// One entry per in-flight generation, keyed by the service's session id
/// (§4.6 "Correlation invariants": at most one entry per session id, removed
/// by either completion or error).
type CorrelationTable = Arc<Mutex<HashMap<String, Envelope>>>;

pub struct ImageBackend {
    config: ImageConfig,
    http: reqwest::Client,
    ws_write: Arc<Mutex<Option<futures::stream::SplitSink<WsStream, WsMessage>>>>,
    connected: Arc<AtomicBool>,
    correlation: CorrelationTable,
    send: Arc<RwLock<Option<SendFn>>>,
}

type WsStream = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

impl ImageBackend {
    pub fn new(config: ImageConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
            ws_write: Arc::new(Mutex::new(None)),
            connected: Arc::new(AtomicBool::new(false)),
            correlation: Arc::new(Mutex::new(HashMap::new())),
            send: Arc::new(RwLock::new(None)),
        }
    }

    fn api_uri(&self) -> String {
        format!("http://{}:{}/api/v1", self.config.host, self.config.port)
    }

    fn push_channel_uri(&self) -> String {
        format!("ws://{}:{}/ws/queue", self.config.host, self.config.port)
    }

    /// Resolve the model to use, per §4.6/`a1111.py`: explicit `--model`
    /// wins, else the trigger word (if it names a configured model), else
    /// the configured default.
    fn resolve_model(&self, explicit: Option<&str>, trigger: &str) -> Result<String> {
        if let Some(name) = explicit {
            if !self.config.models.contains_key(name) {
                return Err(Error::Argument(ArgError::Invalid(format!("unknown model '{name}'"))));
            }
            return Ok(name.to_string());
        }
        let trigger_name = trigger.trim_start_matches(|c: char| !c.is_alphanumeric());
        if self.config.models.contains_key(trigger_name) {
            return Ok(trigger_name.to_string());
        }
        Ok(self.config.default_model.clone())
    }

    /// Fetch `url`, bound its size, verify it's an image, and re-encode as a
    /// ≤512×512 JPEG (§4.6 step 3 / `a1111.py::fetch_image`).
    async fn fetch_init_image(&self, url: &str) -> Result<Vec<u8>> {
        let resp = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| Error::InputFetch(format!("unable to fetch {url}: {e}")))?;

        if !resp.status().is_success() {
            return Err(Error::InputFetch(format!("unable to fetch {url}: HTTP {}", resp.status())));
        }
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        if !content_type.starts_with("image/") {
            return Err(Error::InputFetch(format!("url was not an image: {content_type}")));
        }

        let bytes = resp
            .bytes()
            .await
            .map_err(|e| Error::InputFetch(format!("failed to read image body: {e}")))?;
        if bytes.len() > MAX_FETCH_BYTES {
            return Err(Error::InputFetch(format!("image too large: {} bytes", bytes.len())));
        }

        let decoded = image::load_from_memory(&bytes)
            .map_err(|e| Error::InputFetch(format!("failed to decode image: {e}")))?;
        let thumbnail = image::DynamicImage::ImageRgb8(
            decoded.resize(THUMBNAIL_SIDE, THUMBNAIL_SIDE, FilterType::Lanczos3).into_rgb8(),
        );

        let mut encoded = Vec::new();
        let mut cursor = std::io::Cursor::new(&mut encoded);
        thumbnail
            .write_to(&mut cursor, image::ImageFormat::Jpeg)
            .map_err(|e| Error::InputFetch(format!("failed to re-encode image: {e}")))?;
        Ok(encoded)
    }

    async fn send_reply(&self, mut envelope: Envelope, reply: Reply) {
        envelope.route_reply();
        envelope.reply = reply;
        if let Some(send) = self.send.read().await.clone() {
            if let Err(e) = send(envelope).await {
                tracing::error!(error = %e, "failed to send image backend reply");
            }
        }
    }

    async fn submit_session(&self, payload: serde_json::Value) -> Result<String> {
        let resp = self
            .http
            .post(format!("{}/sessions", self.api_uri()))
            .json(&payload)
            .send()
            .await
            .map_err(|e| Error::Other(anyhow::anyhow!("failed to POST image session: {e}")))?;
        if !resp.status().is_success() {
            return Err(Error::Other(anyhow::anyhow!("error from image service: HTTP {}", resp.status())));
        }
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| Error::Other(anyhow::anyhow!("bad session response from image service: {e}")))?;
        body.get("id")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| Error::Other(anyhow::anyhow!("image service session response missing 'id'")))
    }

    async fn invoke_session(&self, session_id: &str) -> Result<()> {
        let resp = self
            .http
            .put(format!("{}/sessions/{session_id}/invoke", self.api_uri()))
            .send()
            .await
            .map_err(|e| Error::Other(anyhow::anyhow!("failed to invoke image session: {e}")))?;
        if !resp.status().is_success() {
            return Err(Error::Other(anyhow::anyhow!("error invoking image session: HTTP {}", resp.status())));
        }
        Ok(())
    }

    async fn ws_send(&self, value: serde_json::Value) {
        if let Some(write) = self.ws_write.lock().await.as_mut() {
            let _ = write.send(WsMessage::Text(value.to_string().into())).await;
        }
    }

    async fn fetch_result_image(&self, image_name: &str) -> Result<Vec<u8>> {
        let resp = self
            .http
            .get(format!("{}/images/{image_name}/full", self.api_uri()))
            .send()
            .await
            .map_err(|e| Error::Other(anyhow::anyhow!("failed to fetch result image: {e}")))?;
        if !resp.status().is_success() {
            return Err(Error::Other(anyhow::anyhow!("error fetching result image: HTTP {}", resp.status())));
        }
        resp.bytes()
            .await
            .map(|b| b.to_vec())
            .map_err(|e| Error::Other(anyhow::anyhow!("failed to read result image bytes: {e}")))
    }

    /// Run the push-channel reader loop (§4.6 step 7). Spawned from `boot`;
    /// reconnects with the same constant backoff as everything else in this
    /// crate (§5 "Backoff").
    async fn run_push_channel(self: Arc<Self>) {
        loop {
            match tokio_tungstenite::connect_async(self.push_channel_uri()).await {
                Ok((stream, _)) => {
                    let (write, mut read) = stream.split();
                    *self.ws_write.lock().await = Some(write);
                    self.connected.store(true, Ordering::SeqCst);
                    tracing::info!(uri = %self.push_channel_uri(), "connected to image service push channel");

                    while let Some(message) = read.next().await {
                        match message {
                            Ok(WsMessage::Text(text)) => self.handle_push_message(&text).await,
                            Ok(WsMessage::Close(_)) => break,
                            Ok(_) => {}
                            Err(e) => {
                                tracing::warn!(error = %e, "push channel read error");
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to connect to image service push channel, retrying");
                }
            }

            self.connected.store(false, Ordering::SeqCst);
            *self.ws_write.lock().await = None;
            tokio::time::sleep(crate::bus::client::RETRY_BACKOFF).await;
        }
    }

    async fn handle_push_message(&self, text: &str) {
        let Ok(value) = serde_json::from_str::<serde_json::Value>(text) else {
            tracing::warn!(raw = %text, "unparseable push channel message");
            return;
        };
        let Some(kind) = value.get("type").and_then(|v| v.as_str()) else { return };
        let Some(session_id) = value.get("session_id").and_then(|v| v.as_str()) else { return };

        let envelope = {
            let mut table = self.correlation.lock().await;
            table.remove(session_id)
        };
        let Some(envelope) = envelope else {
            tracing::warn!(session_id, "push event for unknown session, ignoring");
            return;
        };

        self.ws_send(serde_json::json!({"type": "unsubscribe", "session_id": session_id})).await;

        match kind {
            "invocation_complete" => {
                let Some(image_name) = value.get("image_name").and_then(|v| v.as_str()) else {
                    self.send_reply(envelope, Reply::Error("image service completed with no image".to_string())).await;
                    return;
                };
                match self.fetch_result_image(image_name).await {
                    Ok(bytes) => self.send_reply(envelope, Reply::Image(bytes)).await,
                    Err(e) => self.send_reply(envelope, Reply::Error(format!("error from image service: {e}"))).await,
                }
            }
            "invocation_error" => {
                let message = value.get("error").and_then(|v| v.as_str()).unwrap_or("unknown error");
                self.send_reply(envelope, Reply::Error(format!("error from image service: {message}"))).await;
            }
            _ => {}
        }
    }
}

#[async_trait]
impl Worker for ImageBackend {
    fn name(&self) -> &str {
        "image"
    }

    async fn boot(&self, _address: crate::address::WorkerAddress, readiness: Readiness, send: SendFn) -> Result<()> {
        *self.send.write().await = Some(send);
        tracing::info!(api_uri = %self.api_uri(), "image backend booted");
        readiness.set_ready();
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        if let Some(mut write) = self.ws_write.lock().await.take() {
            let _ = write.close().await;
        }
        Ok(())
    }

    async fn receive(&self, _subject: &str, envelope: Envelope) -> Result<bool> {
        let mut args = match parse_prompt(&envelope.trigger, &envelope.prompt, &PromptArgSpec::image()) {
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
        if args.imgurl.is_none() {
            args.imgurl = envelope.context.image_url.clone();
        }

        if args.list_models {
            let names: Vec<&str> = self.config.models.keys().map(|s| s.as_str()).collect();
            self.send_reply(envelope, Reply::Text(format!("Available models: {}", names.join(", ")))).await;
            return Ok(true);
        }

        let model_name = match self.resolve_model(args.model.as_deref(), &envelope.trigger) {
            Ok(name) => name,
            Err(e) => {
                self.send_reply(envelope, Reply::Error(e.to_string())).await;
                return Ok(true);
            }
        };

        if !self.connected.load(Ordering::SeqCst) {
            self.send_reply(envelope, Reply::Error("Not connected to the image service, I'll try again later".to_string())).await;
            return Ok(false);
        }

        let mut payload = self
            .config
            .models
            .get(&model_name)
            .map(|m| m.payload.clone())
            .unwrap_or(serde_json::json!({}));
        if let Some(obj) = payload.as_object_mut() {
            obj.insert("prompt".to_string(), serde_json::Value::String(args.prompt.clone()));
        }

        if let Some(url) = &args.imgurl {
            match self.fetch_init_image(url).await {
                Ok(bytes) => {
                    use base64::Engine;
                    let encoded = base64::engine::general_purpose::STANDARD.encode(&bytes);
                    if let Some(obj) = payload.as_object_mut() {
                        obj.insert("init_images".to_string(), serde_json::json!([encoded]));
                    }
                }
                Err(e) => {
                    self.send_reply(envelope, Reply::Error(e.to_string())).await;
                    return Ok(true);
                }
            }
        }

        let session_id = match self.submit_session(payload).await {
            Ok(id) => id,
            Err(e) => {
                self.send_reply(envelope, Reply::Error(format!("Error from image service: {e}"))).await;
                return Ok(true);
            }
        };

        self.correlation.lock().await.insert(session_id.clone(), envelope.clone());
        self.ws_send(serde_json::json!({"type": "subscribe", "session_id": session_id})).await;

        if let Err(e) = self.invoke_session(&session_id).await {
            self.correlation.lock().await.remove(&session_id);
            self.send_reply(envelope, Reply::Error(format!("Error from image service: {e}"))).await;
            return Ok(true);
        }

        self.send_reply(envelope, Reply::Pending("Waiting for the image service to generate a response…".to_string())).await;
        Ok(true)
    }
}

/// Spawn the push-channel reader loop. Called once from the launcher after
/// the worker has been constructed and registered (kept out of `boot` so the
/// bus manager's `boot` future, which is awaited for readiness timing, isn't
/// tied to the push channel's own reconnect loop).
pub fn spawn_push_channel(backend: Arc<ImageBackend>) {
    tokio::spawn(async move { backend.run_push_channel().await });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ImageModelConfig;

    fn config() -> ImageConfig {
        let mut models = HashMap::new();
        models.insert(
            "dreamlike".to_string(),
            ImageModelConfig { payload: serde_json::json!({"steps": 20}) },
        );
        ImageConfig { host: "localhost".into(), port: 9090, default_model: "dreamlike".into(), models }
    }

    #[test]
    fn explicit_model_must_be_known() {
        let backend = ImageBackend::new(config());
        assert!(backend.resolve_model(Some("nonexistent"), "!dream").is_err());
        assert_eq!(backend.resolve_model(Some("dreamlike"), "!dream").unwrap(), "dreamlike");
    }

    #[test]
    fn trigger_name_resolves_to_matching_model() {
        let backend = ImageBackend::new(config());
        assert_eq!(backend.resolve_model(None, "!dreamlike").unwrap(), "dreamlike");
    }

    #[test]
    fn unmatched_trigger_falls_back_to_default() {
        let backend = ImageBackend::new(config());
        assert_eq!(backend.resolve_model(None, "!dream").unwrap(), "dreamlike");
    }
}
