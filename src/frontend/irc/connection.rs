//! IRC connection state machine and [`Worker`] implementation (§4.4, C5).
//!
//! DISCONNECTED -> HANDSHAKE -> REGISTERED -> ACTIVE, with reconnect-with-
//! backoff on any read error, EOF, or idle timeout. Grounded on the original
//! implementation's `FrontendIRC` class: `irc_join`/`irc_renick` for the
//! handshake, `irc_received_privmsg` for trigger dispatch, and
//! `cb_handle_response` for the reply-rendering table.

use crate::address::WorkerAddress;
use crate::config::{IrcServerConfig, Triggers};
use crate::envelope::{Context, Envelope, Reply};
use crate::error::{Error, IrcError, Result};
use crate::frontend::irc::chunk::{chunk_message, payload_budget};
use crate::frontend::irc::filename::sanitise;
use crate::frontend::irc::line::{parse_line, Message, Prefix};
use crate::worker::{Readiness, SendFn, Worker};
use async_trait::async_trait;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadBuf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_rustls::TlsConnector;

/// How long a connection may sit with no inbound line before it's considered
/// dead and reconnected.
const IDLE_TIMEOUT: Duration = Duration::from_secs(300);
/// Delay between reconnect attempts (constant, no exponential backoff).
const RECONNECT_BACKOFF: Duration = Duration::from_secs(5);
/// Filename length budget for saved images, matching the original's
/// `clean_filename` default.
const FILENAME_CHAR_LIMIT: usize = 64;

/// Either side of a plaintext or TLS IRC socket, behind one `AsyncRead` +
/// `AsyncWrite` impl so the rest of this module doesn't care which.
enum IrcStream {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl AsyncRead for IrcStream {
    fn poll_read(self: Pin<&mut Self>, cx: &mut TaskContext<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            IrcStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            IrcStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for IrcStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut TaskContext<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            IrcStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            IrcStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }
    fn poll_flush(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            IrcStream::Plain(s) => Pin::new(s).poll_flush(cx),
            IrcStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }
    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            IrcStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            IrcStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

async fn dial(server: &IrcServerConfig) -> Result<IrcStream> {
    let tcp = TcpStream::connect((server.host.as_str(), server.port))
        .await
        .map_err(|e| IrcError::Connection(format!("connect to {}:{} failed: {e}", server.host, server.port)))?;
    if !server.ssl {
        return Ok(IrcStream::Plain(tcp));
    }

    let mut roots = tokio_rustls::rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let tls_config = tokio_rustls::rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(tls_config));
    let server_name = tokio_rustls::rustls::pki_types::ServerName::try_from(server.host.clone())
        .map_err(|e| IrcError::Connection(format!("invalid TLS server name '{}': {e}", server.host)))?;
    let tls = connector
        .connect(server_name, tcp)
        .await
        .map_err(|e| IrcError::Connection(format!("TLS handshake with {} failed: {e}", server.host)))?;
    Ok(IrcStream::Tls(Box::new(tls)))
}

async fn send_line(writer: &mut (impl AsyncWrite + Unpin), line: &str) -> Result<()> {
    let mut bytes = line.as_bytes().to_vec();
    bytes.extend_from_slice(b"\r\n");
    writer
        .write_all(&bytes)
        .await
        .map_err(|e| IrcError::Connection(format!("write failed: {e}")).into())
}

/// UTF-8 first, Latin-1 as a lossless fallback for legacy servers that don't
/// enforce an encoding (the original's `decode('utf-8', errors='replace')`
/// equivalent, but lossless rather than lossy where possible).
fn decode_line(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        Err(_) => bytes.iter().map(|&b| b as char).collect(),
    }
}

/// The next nickname to try after a 443 (ERR_NICKNAMEINUSE), matching the
/// original's `irc_renick`: append `_`, monotonically.
fn next_nick(current: &str) -> String {
    format!("{current}_")
}

#[derive(Clone, Default)]
struct IdentState {
    current_nick: String,
    /// `:<nick>!<ident>@<host> ` ready to be prefixed onto the chunk-budget
    /// overhead calculation. Seeded with a best-effort value at connect time
    /// and replaced with the server's own echo once our JOIN comes back.
    full_ident: String,
}

/// An IRC server connection, running as one frontend worker per configured
/// server (§3 "Worker identity": `frontend.irc.<host>`).
pub struct IrcFrontend {
    server: IrcServerConfig,
    triggers: Triggers,
    output_dir: Option<String>,
    uri_base: Option<String>,
    writer: Arc<Mutex<Option<WriteHalf<IrcStream>>>>,
    ident: Arc<Mutex<IdentState>>,
    shutting_down: Arc<AtomicBool>,
}

impl IrcFrontend {
    pub fn new(
        server: IrcServerConfig,
        triggers: Triggers,
        output_dir: Option<String>,
        uri_base: Option<String>,
    ) -> Self {
        Self {
            server,
            triggers,
            output_dir,
            uri_base,
            writer: Arc::new(Mutex::new(None)),
            ident: Arc::new(Mutex::new(IdentState::default())),
            shutting_down: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Find a configured trigger that prefixes `text` (with its trailing
    /// space), and the backend address it routes to.
    fn match_trigger(&self, text: &str) -> Option<(String, String, String)> {
        for trigger in self.triggers.as_list() {
            let needle = if trigger.ends_with(' ') { trigger.clone() } else { format!("{trigger} ") };
            if let Some(prompt) = text.strip_prefix(needle.as_str()) {
                let key = trigger.trim_end();
                let backend = self
                    .triggers
                    .route_for(key)
                    .or_else(|| self.triggers.route_for(trigger.as_str()))?;
                return Some((key.to_string(), backend, prompt.to_string()));
            }
        }
        None
    }

    async fn handle_line(&self, line: &str, address: &WorkerAddress, send: &SendFn) {
        let message = match parse_line(line) {
            Ok(m) => m,
            Err(e) => {
                tracing::debug!(line, error = %e, "unparseable IRC line, ignoring");
                return;
            }
        };

        match message.command.as_str() {
            "PING" => {
                if let Some(writer) = self.writer.lock().await.as_mut() {
                    let token = message.params.first().cloned().unwrap_or_default();
                    if let Err(e) = send_line(writer, &format!("PONG :{token}")).await {
                        tracing::warn!(error = %e, "failed to send PONG");
                    }
                }
            }
            "001" => {
                tracing::info!(host = %self.server.host, "registered with IRC server");
                if let Some(writer) = self.writer.lock().await.as_mut() {
                    for channel in &self.server.channels {
                        if let Err(e) = send_line(writer, &format!("JOIN {channel}")).await {
                            tracing::warn!(channel, error = %e, "failed to join channel");
                        }
                    }
                }
            }
            "443" => {
                // ERR_NICKNAMEINUSE: our candidate nick is taken; retry with
                // a monotonically mangled variant.
                let mut ident = self.ident.lock().await;
                let retry_nick = next_nick(&ident.current_nick);
                tracing::warn!(old = %ident.current_nick, new = %retry_nick, "nickname in use, retrying");
                ident.current_nick = retry_nick.clone();
                drop(ident);
                if let Some(writer) = self.writer.lock().await.as_mut() {
                    if let Err(e) = send_line(writer, &format!("NICK {retry_nick}")).await {
                        tracing::warn!(error = %e, "failed to send retry NICK");
                    }
                }
            }
            "JOIN" => {
                self.handle_join(&message).await;
            }
            "PRIVMSG" => {
                self.handle_privmsg(&message, address, send).await;
            }
            _ => {}
        }
    }

    async fn handle_join(&self, message: &Message) {
        let Some(prefix) = &message.prefix else { return };
        let current_nick = self.ident.lock().await.current_nick.clone();
        if prefix.nick != current_nick {
            return;
        }
        let mut ident = self.ident.lock().await;
        ident.full_ident = format_full_ident(prefix);
        tracing::debug!(full_ident = %ident.full_ident, "captured full ident from JOIN echo");
    }

    async fn handle_privmsg(&self, message: &Message, address: &WorkerAddress, send: &SendFn) {
        let Some(prefix) = &message.prefix else { return };
        let [target, text]: [String; 2] = match message.params.as_slice() {
            [t, txt] => [t.clone(), txt.clone()],
            _ => return,
        };

        let Some((trigger, backend, prompt)) = self.match_trigger(&text) else {
            return;
        };

        let channel_name = if target == self.ident.lock().await.current_nick {
            "DM".to_string()
        } else {
            target.clone()
        };

        let context = Context {
            server: Some(self.server.host.clone()),
            channel: Some(target.clone()),
            user: Some(prefix.nick.clone()),
            channel_name: Some(channel_name),
            server_name: Some(self.server.host.clone()),
            user_name: Some(prefix.nick.clone()),
            origin_message: Some(message_text(message)),
            image_url: None,
        };

        let envelope = Envelope::request(backend, address.subject(), trigger, prompt, "irc", context);

        if let Err(e) = send(envelope).await {
            tracing::error!(error = %e, "failed to dispatch triggered request");
        }
    }

    async fn send_chunks(&self, writer: &mut WriteHalf<IrcStream>, target: &str, text: &str, budget: usize) -> Result<()> {
        for chunk in chunk_message(text, budget) {
            if chunk.is_empty() {
                continue;
            }
            send_line(writer, &format!("PRIVMSG {target} :{chunk}")).await?;
        }
        Ok(())
    }

    async fn save_and_announce_image(
        &self,
        writer: &mut WriteHalf<IrcStream>,
        target: &str,
        user: &str,
        bytes: &[u8],
        prompt: &str,
        budget: usize,
    ) -> Result<()> {
        let (Some(output_dir), Some(uri_base)) = (&self.output_dir, &self.uri_base) else {
            let rendered = format!("{user}: Dream sequence collapsed: no output directory configured");
            return self.send_chunks(writer, target, &rendered, budget).await;
        };

        let filename = sanitise(prompt, FILENAME_CHAR_LIMIT, ".png");
        let path = std::path::Path::new(output_dir).join(&filename);
        tokio::fs::write(&path, bytes).await.map_err(Error::Io)?;
        let uri = format!("{}/{}", uri_base.trim_end_matches('/'), filename);
        let rendered = format!("{user}: I dreamed this: {uri}");
        self.send_chunks(writer, target, &rendered, budget).await
    }
}

fn format_full_ident(prefix: &Prefix) -> String {
    let ident = prefix.ident.as_deref().unwrap_or("");
    let host = prefix.host.as_deref().unwrap_or("");
    format!(":{}!{}@{} ", prefix.nick, ident, host)
}

fn message_text(message: &Message) -> String {
    message.params.last().cloned().unwrap_or_default()
}

#[async_trait]
impl Worker for IrcFrontend {
    fn name(&self) -> &str {
        "irc"
    }

    fn subname(&self) -> Option<String> {
        Some(self.server.host.clone())
    }

    async fn boot(&self, address: WorkerAddress, readiness: Readiness, send: SendFn) -> Result<()> {
        loop {
            if self.shutting_down.load(Ordering::SeqCst) {
                return Ok(());
            }

            let stream = match dial(&self.server).await {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::warn!(host = %self.server.host, error = %e, "connect failed, retrying");
                    tokio::time::sleep(RECONNECT_BACKOFF).await;
                    continue;
                }
            };

            let (read_half, mut write_half) = tokio::io::split(stream);

            {
                let mut ident = self.ident.lock().await;
                ident.current_nick = self.server.nickname.clone();
                ident.full_ident = format!(":{}!{}@{} ", self.server.nickname, self.server.ident, self.server.host);
            }

            if let Err(e) = send_line(&mut write_half, &format!("NICK {}", self.server.nickname)).await {
                tracing::warn!(error = %e, "failed to send NICK, reconnecting");
                tokio::time::sleep(RECONNECT_BACKOFF).await;
                continue;
            }
            if let Err(e) = send_line(
                &mut write_half,
                &format!("USER {} 0 * :{}", self.server.ident, self.server.realname),
            )
            .await
            {
                tracing::warn!(error = %e, "failed to send USER, reconnecting");
                tokio::time::sleep(RECONNECT_BACKOFF).await;
                continue;
            }

            *self.writer.lock().await = Some(write_half);
            readiness.set_ready();

            let mut reader = BufReader::new(read_half);
            let mut buf: Vec<u8> = Vec::new();
            loop {
                if self.shutting_down.load(Ordering::SeqCst) {
                    *self.writer.lock().await = None;
                    return Ok(());
                }

                buf.clear();
                let read = tokio::time::timeout(IDLE_TIMEOUT, reader.read_until(b'\n', &mut buf)).await;
                let n = match read {
                    Ok(Ok(n)) => n,
                    Ok(Err(e)) => {
                        tracing::warn!(host = %self.server.host, error = %e, "read error, reconnecting");
                        break;
                    }
                    Err(_) => {
                        tracing::warn!(host = %self.server.host, "idle timeout, reconnecting");
                        break;
                    }
                };
                if n == 0 {
                    tracing::warn!(host = %self.server.host, "connection closed by peer, reconnecting");
                    break;
                }
                while matches!(buf.last(), Some(b'\n') | Some(b'\r')) {
                    buf.pop();
                }
                if buf.is_empty() {
                    continue;
                }
                let line = decode_line(&buf);
                self.handle_line(&line, &address, &send).await;
            }

            *self.writer.lock().await = None;
            if self.shutting_down.load(Ordering::SeqCst) {
                return Ok(());
            }
            tokio::time::sleep(RECONNECT_BACKOFF).await;
        }
    }

    async fn shutdown(&self) -> Result<()> {
        self.shutting_down.store(true, Ordering::SeqCst);
        if let Some(writer) = self.writer.lock().await.as_mut() {
            let _ = send_line(writer, "QUIT :shutting down").await;
        }
        Ok(())
    }

    /// Render a backend's reply as IRC `PRIVMSG`s per the §4.4 reply table.
    /// Returns `false` (defer, don't ack) if there's no live connection to
    /// render onto.
    async fn receive(&self, _subject: &str, envelope: Envelope) -> Result<bool> {
        let mut writer_guard = self.writer.lock().await;
        let writer = match writer_guard.as_mut() {
            Some(w) => w,
            None => {
                tracing::warn!(host = %self.server.host, "no active IRC connection, deferring reply");
                return Ok(false);
            }
        };

        let channel = envelope.context.channel.clone().unwrap_or_default();
        let user = envelope.context.user.clone().unwrap_or_default();
        let full_ident = self.ident.lock().await.full_ident.clone();
        let budget = payload_budget(&full_ident, &channel);

        match &envelope.reply {
            Reply::Text(text) => {
                let rendered = format!("{user}: {text}");
                self.send_chunks(writer, &channel, &rendered, budget).await?;
            }
            Reply::Image(bytes) => {
                self.save_and_announce_image(writer, &channel, &user, bytes, &envelope.prompt, budget)
                    .await?;
            }
            Reply::Pending(msg) => {
                tracing::info!(channel = %channel, user = %user, msg = %msg, "backend reply pending, no IRC message sent");
            }
            Reply::Error(err) => {
                let rendered = format!("{user}: Dream sequence collapsed: {err}");
                self.send_chunks(writer, &channel, &rendered, budget).await?;
            }
            Reply::Usage(usage) => {
                let rendered = format!("{user}: {usage}");
                self.send_chunks(writer, &channel, &rendered, budget).await?;
            }
            Reply::None => {
                let rendered = format!("{user}: Dream sequence collapsed, unknown reason.");
                self.send_chunks(writer, &channel, &rendered, budget).await?;
            }
        }

        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IrcServerConfig;
    use std::collections::HashMap;

    fn server() -> IrcServerConfig {
        IrcServerConfig {
            nickname: "dreambot".to_string(),
            ident: "dreambot".to_string(),
            realname: "a dreaming bot".to_string(),
            host: "irc.example.org".to_string(),
            port: 6697,
            ssl: true,
            channels: vec!["#bots".to_string()],
        }
    }

    /// Testable property 5: nick-collision retries are monotonic and never
    /// reuse a previously tried nick.
    #[test]
    fn nick_collision_progression_is_monotonic() {
        let mut nick = "dreambot".to_string();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..5 {
            assert!(seen.insert(nick.clone()));
            nick = next_nick(&nick);
        }
        assert_eq!(nick, "dreambot_____");
    }

    #[test]
    fn trigger_matching_requires_trailing_space() {
        let mut map = HashMap::new();
        map.insert("!dream".to_string(), "backend.image".to_string());
        let frontend = IrcFrontend::new(server(), Triggers::Map(map), None, None);

        assert!(frontend.match_trigger("!dreamless text").is_none());
        let (trigger, backend, prompt) = frontend.match_trigger("!dream a cat in a hat").unwrap();
        assert_eq!(trigger, "!dream");
        assert_eq!(backend, "backend.image");
        assert_eq!(prompt, "a cat in a hat");
    }

    #[test]
    fn unrouted_trigger_is_ignored() {
        let frontend = IrcFrontend::new(server(), Triggers::List(vec!["!dream".to_string()]), None, None);
        assert!(frontend.match_trigger("!dream a cat").is_none());
    }

    #[test]
    fn full_ident_formats_from_prefix() {
        let prefix = Prefix {
            nick: "dreambot".to_string(),
            ident: Some("dreambot".to_string()),
            host: Some("user/dreambot".to_string()),
        };
        assert_eq!(format_full_ident(&prefix), ":dreambot!dreambot@user/dreambot ");
    }
}
