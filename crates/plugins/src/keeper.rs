// WebSocket Session Keeper: holds the duplex channel some sites use to mint
// short-lived playlist URLs.
//
// States run CONNECTING -> OPEN -> READY -> KEEPING -> CLOSING -> CLOSED.
// READY is reached when the server sends a `stream` message; KEEPING once a
// reader asks for the playlist URL. The HLS engine only sees the keeper
// through `KeeperPlaylistSource`, which holds a weak reference, so the plugin
// owning the `SessionKeeper` decides how long the socket lives.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{Value, json};
use slink_engine::hls::{HlsError, parse_variant_playlist};
use slink_engine::{CookieRecord, HttpSession, PlaylistSource, WatchToken};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use url::Url;

use crate::error::KeeperError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Open,
    Ready,
    Keeping,
    Closing,
    Closed,
}

#[derive(Debug, Clone)]
pub struct KeeperConfig {
    pub ws_url: Url,
    /// Sent on open and again whenever a fresh URL is needed.
    pub start_message: Value,
    pub headers: Vec<(String, String)>,
    /// How long to wait for the first `stream` message.
    pub ready_timeout: Duration,
    /// How long a READY session waits for a reader before closing.
    pub attach_timeout: Duration,
    /// Used until the server announces its own interval.
    pub keep_seat_interval: Duration,
}

impl KeeperConfig {
    pub fn new(ws_url: Url, start_message: Value) -> Self {
        Self {
            ws_url,
            start_message,
            headers: Vec::new(),
            ready_timeout: Duration::from_secs(6),
            attach_timeout: Duration::from_secs(6),
            keep_seat_interval: Duration::from_secs(30),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

#[derive(Debug, Deserialize)]
struct ServerMessage {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Deserialize)]
struct StreamData {
    uri: String,
    #[serde(default)]
    protocol: Option<String>,
    #[serde(default)]
    cookies: Vec<StreamCookie>,
}

#[derive(Debug, Deserialize)]
struct StreamCookie {
    name: String,
    value: String,
    domain: String,
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    secure: bool,
    #[serde(default)]
    expires: Option<String>,
}

impl StreamCookie {
    fn into_record(self) -> CookieRecord {
        let max_age = self
            .expires
            .as_deref()
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|at| (at.with_timezone(&Utc) - Utc::now()).num_seconds().max(0) as u64);
        CookieRecord {
            name: self.name,
            value: self.value,
            domain: self.domain,
            path: self.path.unwrap_or_else(|| "/".to_string()),
            secure: self.secure,
            max_age,
        }
    }
}

enum Action {
    Reply(Vec<Value>),
    Seat(Duration),
    Stream(StreamData),
    Disconnect(String),
    Error(String),
    Ignore,
}

fn parse_action(text: &str) -> Action {
    let message: ServerMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(e) => {
            debug!(error = %e, "Ignoring malformed session message");
            return Action::Ignore;
        }
    };

    match message.kind.as_str() {
        "ping" => Action::Reply(vec![json!({"type": "pong"}), json!({"type": "keepSeat"})]),
        "seat" => message
            .data
            .get("keepIntervalSec")
            .and_then(Value::as_u64)
            .filter(|secs| *secs > 0)
            .map(|secs| Action::Seat(Duration::from_secs(secs)))
            .unwrap_or(Action::Ignore),
        "stream" => match serde_json::from_value::<StreamData>(message.data) {
            Ok(data) => Action::Stream(data),
            Err(e) => Action::Error(format!("invalid stream message: {e}")),
        },
        "disconnect" => Action::Disconnect(
            message
                .data
                .get("reason")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string(),
        ),
        "error" => Action::Error(message.data.to_string()),
        other => {
            trace!(kind = other, "Unhandled session message");
            Action::Ignore
        }
    }
}

enum Command {
    Remint,
}

enum UrlWait {
    Url(Url),
    Ended,
    Closed,
    TimedOut,
}

struct KeeperShared {
    session: Arc<HttpSession>,
    config: KeeperConfig,
    state: watch::Sender<SessionState>,
    token: Mutex<Option<WatchToken>>,
    ended: AtomicBool,
    attached: AtomicBool,
    cancel: CancellationToken,
    commands: Mutex<Option<mpsc::UnboundedSender<Command>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl KeeperShared {
    fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    fn set_state(&self, state: SessionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(from = ?previous, to = ?state, "Session state changed");
        }
    }

    fn spawn(self: &Arc<Self>) {
        if self.cancel.is_cancelled() || self.ended.load(Ordering::SeqCst) {
            return;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        *self.commands.lock() = Some(tx);
        self.set_state(SessionState::Connecting);

        let handle = tokio::spawn(run_connection(self.clone(), rx));
        if let Some(previous) = self.task.lock().replace(handle) {
            previous.abort();
        }
    }

    fn install_stream(&self, data: StreamData) -> Result<(), KeeperError> {
        if let Some(protocol) = data.protocol.as_deref()
            && protocol != "hls"
        {
            return Err(KeeperError::Protocol {
                reason: format!("unsupported stream protocol {protocol}"),
            });
        }
        let url = Url::parse(&data.uri).map_err(|e| KeeperError::Protocol {
            reason: format!("invalid stream URL: {e}"),
        })?;

        for cookie in data.cookies {
            let record = cookie.into_record();
            if let Err(e) = self.session.set_cookie(&record) {
                warn!(name = %record.name, error = %e, "Failed to install session cookie");
            }
        }

        info!(%url, "Received stream URL");
        *self.token.lock() = Some(WatchToken::new(url));
        self.set_state(if self.attached.load(Ordering::SeqCst) {
            SessionState::Keeping
        } else {
            SessionState::Ready
        });
        Ok(())
    }

    fn attach(&self) {
        if !self.attached.swap(true, Ordering::SeqCst) {
            debug!("Reader attached to session");
        }
        if self.state() == SessionState::Ready {
            self.set_state(SessionState::Keeping);
        }
    }

    fn has_future_expiry(&self) -> bool {
        self.token
            .lock()
            .as_ref()
            .is_some_and(WatchToken::has_future_expiry)
    }

    fn request_remint(self: &Arc<Self>) {
        if let Some(token) = self.token.lock().as_mut() {
            token.expire();
        }
        let sent = self
            .commands
            .lock()
            .as_ref()
            .is_some_and(|tx| tx.send(Command::Remint).is_ok());
        if !sent && self.state() == SessionState::Closed {
            debug!("Session closed, reconnecting for a fresh URL");
            self.spawn();
        }
    }

    async fn wait_for_url(&self, timeout: Duration) -> UrlWait {
        let mut rx = self.state.subscribe();
        let wait = async {
            loop {
                let state = *rx.borrow_and_update();
                if self.ended.load(Ordering::SeqCst) {
                    return UrlWait::Ended;
                }
                if state == SessionState::Closed {
                    return if self.has_future_expiry() {
                        UrlWait::Ended
                    } else {
                        UrlWait::Closed
                    };
                }
                let current = self
                    .token
                    .lock()
                    .as_ref()
                    .filter(|token| !token.is_expired())
                    .map(|token| token.url.clone());
                if let Some(url) = current {
                    return UrlWait::Url(url);
                }
                if rx.changed().await.is_err() {
                    return UrlWait::Closed;
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .unwrap_or(UrlWait::TimedOut)
    }
}

async fn run_connection(shared: Arc<KeeperShared>, mut commands: mpsc::UnboundedReceiver<Command>) {
    if let Err(e) = connection_loop(&shared, &mut commands).await {
        warn!(error = %e, "Session keeper stopped");
    }
    shared.commands.lock().take();
    shared.set_state(SessionState::Closed);
}

fn text(value: &Value) -> Message {
    Message::Text(value.to_string().into())
}

async fn connection_loop(
    shared: &Arc<KeeperShared>,
    commands: &mut mpsc::UnboundedReceiver<Command>,
) -> Result<(), KeeperError> {
    let config = &shared.config;
    let mut request = config.ws_url.as_str().into_client_request()?;
    for (name, value) in &config.headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                request.headers_mut().insert(name, value);
            }
            _ => warn!(header = %name, "Skipping invalid websocket header"),
        }
    }

    debug!(url = %config.ws_url, "Connecting to session websocket");
    let (mut ws, _) = tokio::select! {
        _ = shared.cancel.cancelled() => return Ok(()),
        result = connect_async(request) => result?,
    };
    shared.set_state(SessionState::Open);
    ws.send(text(&config.start_message)).await?;

    let mut keep_seat = tokio::time::interval(config.keep_seat_interval);
    keep_seat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    keep_seat.reset();
    let mut seat_enabled = false;
    let mut attach_deadline: Option<Instant> = None;

    loop {
        let waiting_for_reader =
            attach_deadline.is_some() && !shared.attached.load(Ordering::SeqCst);

        tokio::select! {
            _ = shared.cancel.cancelled() => {
                shared.set_state(SessionState::Closing);
                let _ = ws.close(None).await;
                return Ok(());
            }
            Some(command) = commands.recv() => match command {
                Command::Remint => {
                    debug!("Requesting a fresh stream URL");
                    ws.send(text(&config.start_message)).await?;
                }
            },
            _ = keep_seat.tick(), if seat_enabled => {
                trace!("Sending keepSeat");
                ws.send(text(&json!({"type": "keepSeat"}))).await?;
            }
            _ = tokio::time::sleep_until(attach_deadline.unwrap_or_else(Instant::now)), if waiting_for_reader => {
                warn!(timeout = ?config.attach_timeout, "No reader attached, closing session");
                shared.set_state(SessionState::Closing);
                let _ = ws.close(None).await;
                return Ok(());
            }
            message = ws.next() => {
                let Some(message) = message else {
                    debug!("Session websocket closed by server");
                    return Ok(());
                };
                let raw = match message? {
                    Message::Text(raw) => raw,
                    Message::Close(frame) => {
                        debug!(?frame, "Session websocket received close frame");
                        return Ok(());
                    }
                    _ => continue,
                };

                match parse_action(raw.as_str()) {
                    Action::Reply(replies) => {
                        for reply in &replies {
                            ws.send(text(reply)).await?;
                        }
                    }
                    Action::Seat(interval) => {
                        debug!(?interval, "Server set keep-seat interval");
                        keep_seat = tokio::time::interval_at(Instant::now() + interval, interval);
                        keep_seat.set_missed_tick_behavior(MissedTickBehavior::Delay);
                        seat_enabled = true;
                    }
                    Action::Stream(data) => {
                        shared.install_stream(data)?;
                        if !shared.attached.load(Ordering::SeqCst) {
                            attach_deadline = Some(Instant::now() + config.attach_timeout);
                        }
                    }
                    Action::Disconnect(reason) => {
                        info!(%reason, "Session ended by server");
                        shared.ended.store(true, Ordering::SeqCst);
                        shared.set_state(SessionState::Closing);
                        let _ = ws.close(None).await;
                        return Ok(());
                    }
                    Action::Error(reason) => {
                        if shared.token.lock().is_none() {
                            return Err(KeeperError::Protocol { reason });
                        }
                        warn!(%reason, "Session reported an error");
                    }
                    Action::Ignore => {}
                }
            }
        }
    }
}

/// Owns the session socket. Dropping it closes the session.
pub struct SessionKeeper {
    shared: Arc<KeeperShared>,
}

impl fmt::Debug for SessionKeeper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionKeeper")
            .field("url", &self.shared.config.ws_url.as_str())
            .field("state", &self.state())
            .finish()
    }
}

impl SessionKeeper {
    pub fn new(session: Arc<HttpSession>, config: KeeperConfig) -> Self {
        let (state, _) = watch::channel(SessionState::Closed);
        Self {
            shared: Arc::new(KeeperShared {
                session,
                config,
                state,
                token: Mutex::new(None),
                ended: AtomicBool::new(false),
                attached: AtomicBool::new(false),
                cancel: CancellationToken::new(),
                commands: Mutex::new(None),
                task: Mutex::new(None),
            }),
        }
    }

    /// Opens the socket in a background task.
    pub fn start(&self) {
        self.shared.spawn();
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.shared.state.subscribe()
    }

    /// Waits for the first stream URL, closing the session on timeout.
    pub async fn wait_ready(&self) -> Result<Url, KeeperError> {
        let timeout = self.shared.config.ready_timeout;
        match self.shared.wait_for_url(timeout).await {
            UrlWait::Url(url) => Ok(url),
            UrlWait::TimedOut => {
                self.close();
                Err(KeeperError::ReadyTimeout(timeout))
            }
            UrlWait::Ended => Err(KeeperError::Closed {
                reason: "stream ended".to_string(),
            }),
            UrlWait::Closed => Err(KeeperError::Closed {
                reason: "session closed before a stream URL was received".to_string(),
            }),
        }
    }

    /// A playlist source for the engine. `variant` picks a named variant of
    /// the minted multivariant playlist; `None` uses the minted URL as is.
    pub fn playlist_source(&self, variant: Option<String>) -> Arc<KeeperPlaylistSource> {
        Arc::new(KeeperPlaylistSource {
            keeper: Arc::downgrade(&self.shared),
            variant,
            resolved: Mutex::new(None),
        })
    }

    pub fn close(&self) {
        self.shared.cancel.cancel();
    }
}

impl Drop for SessionKeeper {
    fn drop(&mut self) {
        self.close();
    }
}

pub struct KeeperPlaylistSource {
    keeper: Weak<KeeperShared>,
    variant: Option<String>,
    /// (minted URL, media playlist URL) of the last variant lookup.
    resolved: Mutex<Option<(Url, Url)>>,
}

impl KeeperPlaylistSource {
    async fn resolve_variant(&self, shared: &KeeperShared, minted: Url) -> Result<Url, HlsError> {
        let Some(name) = &self.variant else {
            return Ok(minted);
        };
        let cached = self
            .resolved
            .lock()
            .as_ref()
            .filter(|(cached, _)| *cached == minted)
            .map(|(_, media)| media.clone());
        if let Some(media) = cached {
            return Ok(media);
        }

        let media = parse_variant_playlist(&shared.session, &minted)
            .await?
            .into_iter()
            .find(|variant| variant.name == *name)
            .map(|variant| variant.url)
            .ok_or_else(|| HlsError::playlist(format!("variant {name} is no longer offered")))?;
        *self.resolved.lock() = Some((minted, media.clone()));
        Ok(media)
    }
}

#[async_trait]
impl PlaylistSource for KeeperPlaylistSource {
    async fn playlist_url(&self) -> Result<Url, HlsError> {
        let Some(shared) = self.keeper.upgrade() else {
            return Err(HlsError::SourceEnded);
        };

        let minted = match shared.wait_for_url(shared.config.ready_timeout).await {
            UrlWait::Url(url) => url,
            UrlWait::Ended => return Err(HlsError::SourceEnded),
            UrlWait::Closed => return Err(HlsError::RefreshRequired),
            UrlWait::TimedOut => {
                return Err(HlsError::timeout(format!(
                    "no stream URL from the session within {:?}",
                    shared.config.ready_timeout
                )));
            }
        };
        shared.attach();
        self.resolve_variant(&shared, minted).await
    }

    fn invalidate(&self) {
        if let Some(shared) = self.keeper.upgrade() {
            shared.request_remint();
        }
    }

    fn current_url(&self) -> Option<Url> {
        if let Some((_, media)) = self.resolved.lock().as_ref() {
            return Some(media.clone());
        }
        let shared = self.keeper.upgrade()?;
        let token = shared.token.lock();
        token.as_ref().map(|t| t.url.clone())
    }

    fn close(&self) {
        if let Some(shared) = self.keeper.upgrade() {
            debug!("Reader closed, closing session");
            shared.cancel.cancel();
        }
    }
}
