//! Websocket protocol client
//!
//! One [`ProtocolClient`] owns the connection to the conversation endpoint.
//! After the `hello` handshake three tasks run per connection: a writer that
//! drains the outgoing queue into the socket, a reader that turns incoming
//! frames into [`ProtocolEvent`]s, and an advisory heartbeat.
//!
//! An unexpected close starts the reconnect loop, which retries with linear
//! backoff and reports a terminal `NetworkError` once attempts run out. A
//! caller-initiated `disconnect()` suppresses all of that.

use super::messages::{ClientMessage, ListenState, ServerMessage};
use super::{ProtocolError, Result};
use crate::config::ProtocolConfig;
use crate::events::{ConnectionStatus, ListeningMode, ProtocolEvent};
use futures_util::future::BoxFuture;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// Tasks and outgoing queue of one live connection
struct Link {
    outgoing: mpsc::UnboundedSender<Message>,
    reader: JoinHandle<()>,
    heartbeat: JoinHandle<()>,
}

struct Inner {
    cfg: ProtocolConfig,
    codec_format: &'static str,
    status: watch::Sender<ConnectionStatus>,
    events: broadcast::Sender<ProtocolEvent>,
    session_id: Mutex<Option<String>>,
    link: Mutex<Option<Link>>,
    reconnect: Mutex<Option<JoinHandle<()>>>,
    closing: AtomicBool,
    reconnect_attempts: AtomicU32,
    last_inbound: Mutex<Instant>,
}

/// Client side of the conversation protocol. Cheap to clone.
#[derive(Clone)]
pub struct ProtocolClient {
    inner: Arc<Inner>,
}

impl ProtocolClient {
    /// `codec_format` is announced as `audio_params.format` in the handshake.
    pub fn new(cfg: ProtocolConfig, codec_format: &'static str) -> Self {
        let (status, _) = watch::channel(ConnectionStatus::Disconnected);
        let (events, _) = broadcast::channel(cfg.event_capacity);
        Self {
            inner: Arc::new(Inner {
                cfg,
                codec_format,
                status,
                events,
                session_id: Mutex::new(None),
                link: Mutex::new(None),
                reconnect: Mutex::new(None),
                closing: AtomicBool::new(false),
                reconnect_attempts: AtomicU32::new(0),
                last_inbound: Mutex::new(Instant::now()),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProtocolEvent> {
        self.inner.events.subscribe()
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.inner.status.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status.subscribe()
    }

    /// Identifier assigned by the server, present while connected.
    pub fn session_id(&self) -> Option<String> {
        self.inner.session_id.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    /// Reconnect attempts made in the current reconnect cycle.
    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.reconnect_attempts.load(Ordering::SeqCst)
    }

    /// Open the connection and complete the handshake, returning the session
    /// id. Returns the current session id if already connected.
    pub async fn connect(&self) -> Result<String> {
        if let Some(session_id) = self.session_id() {
            if self.is_connected() {
                return Ok(session_id);
            }
        }
        // A manual connect takes over from a pending reconnect cycle
        if let Some(task) = self.inner.reconnect.lock().unwrap_or_else(|e| e.into_inner()).take() {
            debug!("Cancelling pending reconnect");
            task.abort();
        }
        self.inner.closing.store(false, Ordering::SeqCst);
        self.inner.reconnect_attempts.store(0, Ordering::SeqCst);
        self.inner.status.send_replace(ConnectionStatus::Connecting);

        match Inner::open_link(&self.inner, false).await {
            Ok(session_id) => Ok(session_id),
            Err(e) => {
                error!("Connection failed: {}", e);
                let status = match e {
                    ProtocolError::ProtocolViolation(_) => ConnectionStatus::Error,
                    _ => ConnectionStatus::Disconnected,
                };
                self.inner.status.send_replace(status);
                Err(e)
            }
        }
    }

    /// Close the connection and stop any reconnection. Idempotent.
    pub fn disconnect(&self) {
        self.inner.closing.store(true, Ordering::SeqCst);
        if let Some(task) = self.inner.reconnect.lock().unwrap_or_else(|e| e.into_inner()).take() {
            task.abort();
        }
        let link = self.inner.link.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(link) = link {
            link.heartbeat.abort();
            link.reader.abort();
            // The writer sends the close frame and exits
            let _ = link.outgoing.send(Message::Close(None));
            info!("Disconnected");
        }
        self.inner.session_id.lock().unwrap_or_else(|e| e.into_inner()).take();
        self.inner.status.send_replace(ConnectionStatus::Disconnected);
    }

    pub fn send_start_listening(&self, mode: ListeningMode) -> Result<()> {
        self.send_listen(ListenState::Start, Some(mode), None)
    }

    pub fn send_stop_listening(&self) -> Result<()> {
        self.send_listen(ListenState::Stop, None, None)
    }

    /// Report a locally detected wake word.
    pub fn send_wake_word_detected(&self, text: &str) -> Result<()> {
        self.send_listen(ListenState::Detect, None, Some(text.to_string()))
    }

    /// Send typed user text in place of speech.
    pub fn send_text(&self, text: &str) -> Result<()> {
        self.send_listen(ListenState::Detect, None, Some(text.to_string()))
    }

    pub fn send_abort(&self, reason: Option<&str>) -> Result<()> {
        let session_id = self.require_session()?;
        self.send_control(ClientMessage::Abort {
            session_id,
            reason: reason.map(str::to_string),
        })
    }

    /// Push an update of device states.
    pub fn send_device_state(&self, states: Value) -> Result<()> {
        let session_id = self.require_session()?;
        self.send_control(ClientMessage::Iot {
            session_id,
            update: true,
            descriptors: None,
            states: Some(states),
        })
    }

    /// Describe the controllable things on this device.
    pub fn send_iot_descriptors(&self, descriptors: Value) -> Result<()> {
        let session_id = self.require_session()?;
        self.send_control(ClientMessage::Iot {
            session_id,
            update: true,
            descriptors: Some(descriptors),
            states: None,
        })
    }

    pub fn send_mcp(&self, payload: Value) -> Result<()> {
        let session_id = self.require_session()?;
        self.send_control(ClientMessage::Mcp { session_id, payload })
    }

    /// Send one encoded audio frame.
    pub fn send_audio(&self, packet: Vec<u8>) -> Result<()> {
        self.send_raw(Message::binary(packet))
    }

    fn send_listen(&self, state: ListenState, mode: Option<ListeningMode>, text: Option<String>) -> Result<()> {
        let session_id = self.require_session()?;
        debug!("Sending listen {:?} mode={:?}", state, mode);
        self.send_control(ClientMessage::Listen {
            session_id,
            state,
            mode,
            text,
        })
    }

    fn require_session(&self) -> Result<String> {
        self.session_id().ok_or(ProtocolError::NotConnected)
    }

    fn send_control(&self, msg: ClientMessage) -> Result<()> {
        let json = msg.to_json()?;
        self.send_raw(Message::text(json))
    }

    fn send_raw(&self, msg: Message) -> Result<()> {
        let link = self.inner.link.lock().unwrap_or_else(|e| e.into_inner());
        let link = link.as_ref().ok_or(ProtocolError::NotConnected)?;
        link.outgoing.send(msg).map_err(|_| ProtocolError::ConnectionClosed)
    }
}

impl Inner {
    fn request(&self) -> Result<Request> {
        let mut request = self.cfg.url.as_str().into_client_request()?;
        let headers = request.headers_mut();
        if let Some(token) = &self.cfg.access_token {
            headers.insert("Authorization", header(&format!("Bearer {}", token))?);
        }
        headers.insert("Protocol-Version", header(&self.cfg.protocol_version.to_string())?);
        headers.insert("Device-Id", header(&self.cfg.device_id)?);
        headers.insert("Client-Id", header(&self.cfg.client_id)?);
        Ok(request)
    }

    /// Connect, handshake and start the per-connection tasks.
    async fn open_link(inner: &Arc<Inner>, reconnected: bool) -> Result<String> {
        let request = inner.request()?;
        info!("Connecting to {}", inner.cfg.url);

        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        let handshake = tokio::time::timeout(
            inner.cfg.handshake_timeout(),
            Inner::handshake(inner, request, outgoing.clone(), outgoing_rx),
        )
        .await;

        let (session_id, source) = match handshake {
            Ok(Ok(done)) => done,
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                warn!("No handshake reply within {:?}", inner.cfg.handshake_timeout());
                return Err(ProtocolError::HandshakeTimeout);
            }
        };

        if inner.closing.load(Ordering::SeqCst) {
            let _ = outgoing.send(Message::Close(None));
            return Err(ProtocolError::ConnectionClosed);
        }

        *inner.last_inbound.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
        *inner.session_id.lock().unwrap_or_else(|e| e.into_inner()) = Some(session_id.clone());

        let reader = tokio::spawn(Inner::read_loop(inner.clone(), source));
        let heartbeat = tokio::spawn(Inner::heartbeat(inner.clone(), outgoing.clone()));
        let previous = inner
            .link
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(Link {
                outgoing,
                reader,
                heartbeat,
            });
        if let Some(previous) = previous {
            previous.reader.abort();
            previous.heartbeat.abort();
        }

        inner.reconnect_attempts.store(0, Ordering::SeqCst);
        inner.status.send_replace(ConnectionStatus::Connected);
        info!("Session {} established", session_id);
        let _ = inner.events.send(ProtocolEvent::Connected {
            session_id: session_id.clone(),
            reconnected,
        });
        Ok(session_id)
    }

    /// Open the socket, start the writer, send `hello` and wait for the ack.
    async fn handshake(
        inner: &Arc<Inner>,
        request: Request,
        outgoing: mpsc::UnboundedSender<Message>,
        outgoing_rx: mpsc::UnboundedReceiver<Message>,
    ) -> Result<(String, WsSource)> {
        let (ws, response) = connect_async(request).await?;
        debug!("Websocket upgrade response: {:?}", response.status());
        let (sink, mut source) = ws.split();
        tokio::spawn(write_loop(sink, outgoing_rx));

        let hello = ClientMessage::hello(inner.cfg.protocol_version, inner.codec_format);
        outgoing
            .send(Message::text(hello.to_json()?))
            .map_err(|_| ProtocolError::ConnectionClosed)?;

        loop {
            let msg = match source.next().await {
                Some(Ok(msg)) => msg,
                Some(Err(e)) => return Err(e.into()),
                None => return Err(ProtocolError::ConnectionClosed),
            };
            match msg {
                Message::Text(text) => {
                    let parsed = ServerMessage::parse(text.as_str())
                        .map_err(|e| ProtocolError::ProtocolViolation(format!("malformed message: {}", e)))?;
                    let ServerMessage::Hello(ack) = parsed else {
                        debug!("Ignoring message before handshake: {}", text.as_str());
                        continue;
                    };
                    if ack.transport.as_deref() != Some("websocket") {
                        let _ = outgoing.send(Message::Close(None));
                        return Err(ProtocolError::ProtocolViolation(format!(
                            "unexpected transport {:?}",
                            ack.transport
                        )));
                    }
                    let Some(session_id) = ack.session_id.filter(|s| !s.is_empty()) else {
                        let _ = outgoing.send(Message::Close(None));
                        return Err(ProtocolError::ProtocolViolation("hello without session_id".to_string()));
                    };
                    if let Some(params) = ack.audio_params {
                        debug!("Server audio params: {:?}", params);
                    }
                    return Ok((session_id, source));
                }
                Message::Close(frame) => {
                    debug!("Closed during handshake: {:?}", frame);
                    return Err(ProtocolError::ConnectionClosed);
                }
                _ => {}
            }
        }
    }

    async fn read_loop(inner: Arc<Inner>, mut source: WsSource) {
        loop {
            let msg = match source.next().await {
                Some(Ok(msg)) => msg,
                Some(Err(e)) => {
                    warn!("Websocket error: {}", e);
                    break;
                }
                None => break,
            };
            *inner.last_inbound.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();

            match msg {
                Message::Text(text) => match ServerMessage::parse(text.as_str()) {
                    Ok(parsed) => {
                        if let Some(event) = parsed.into_event() {
                            debug!("Received {:?}", event);
                            let _ = inner.events.send(event);
                        }
                    }
                    Err(e) => warn!("Dropping malformed control message: {}", e),
                },
                Message::Binary(data) => {
                    let _ = inner.events.send(ProtocolEvent::Audio(data.to_vec()));
                }
                Message::Close(frame) => {
                    info!("Server closed the connection: {:?}", frame);
                    break;
                }
                _ => {}
            }
        }

        if inner.closing.load(Ordering::SeqCst) {
            return;
        }
        Inner::connection_lost(&inner);
    }

    fn connection_lost(inner: &Arc<Inner>) {
        warn!("Connection lost, reconnecting");
        if let Some(link) = inner.link.lock().unwrap_or_else(|e| e.into_inner()).take() {
            link.heartbeat.abort();
            // Dropping the sender ends the writer
        }
        inner.session_id.lock().unwrap_or_else(|e| e.into_inner()).take();
        inner.status.send_replace(ConnectionStatus::Reconnecting);
        let _ = inner.events.send(ProtocolEvent::ConnectionLost);

        let task = tokio::spawn(reconnect_loop(inner.clone()));
        if let Some(old) = inner.reconnect.lock().unwrap_or_else(|e| e.into_inner()).replace(task) {
            old.abort();
        }
    }

    async fn heartbeat(inner: Arc<Inner>, outgoing: mpsc::UnboundedSender<Message>) {
        let mut ticker = tokio::time::interval(inner.cfg.heartbeat_interval());
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if outgoing.send(Message::Ping(Vec::new().into())).is_err() {
                break;
            }
            let silent = inner.last_inbound.lock().unwrap_or_else(|e| e.into_inner()).elapsed();
            if silent > inner.cfg.heartbeat_silence() {
                warn!("Nothing received from the server for {:?}", silent);
            }
        }
    }
}

/// Retry the connection with linear backoff. Boxed to break the type cycle
/// through `open_link` and the reader task.
fn reconnect_loop(inner: Arc<Inner>) -> BoxFuture<'static, ()> {
    Box::pin(async move {
        let max = inner.cfg.max_reconnect_attempts;
        for attempt in 1..=max {
            if inner.closing.load(Ordering::SeqCst) {
                return;
            }
            inner.reconnect_attempts.store(attempt, Ordering::SeqCst);
            let delay = inner.cfg.reconnect_delay(attempt);
            info!("Reconnect attempt {}/{} in {:?}", attempt, max, delay);
            tokio::time::sleep(delay).await;
            if inner.closing.load(Ordering::SeqCst) {
                return;
            }

            inner.status.send_replace(ConnectionStatus::Connecting);
            match Inner::open_link(&inner, true).await {
                Ok(_) => return,
                Err(ProtocolError::ProtocolViolation(reason)) => {
                    error!("Server rejected the handshake, not retrying: {}", reason);
                    give_up(&inner, format!("protocol violation: {}", reason));
                    return;
                }
                Err(e) => {
                    warn!("Reconnect attempt {} failed: {}", attempt, e);
                    inner.status.send_replace(ConnectionStatus::Reconnecting);
                }
            }
        }
        if !inner.closing.load(Ordering::SeqCst) {
            give_up(&inner, format!("gave up after {} reconnect attempts", max));
        }
    })
}

fn give_up(inner: &Inner, reason: String) {
    error!("Network error: {}", reason);
    inner.session_id.lock().unwrap_or_else(|e| e.into_inner()).take();
    inner.status.send_replace(ConnectionStatus::Error);
    let _ = inner.events.send(ProtocolEvent::NetworkError(reason));
}

async fn write_loop(mut sink: WsSink, mut outgoing: mpsc::UnboundedReceiver<Message>) {
    while let Some(msg) = outgoing.recv().await {
        let closing = matches!(msg, Message::Close(_));
        if let Err(e) = sink.send(msg).await {
            debug!("Websocket write failed: {}", e);
            break;
        }
        if closing {
            break;
        }
    }
    let _ = sink.close().await;
}

fn header(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value).map_err(|e| ProtocolError::InvalidRequest(e.to_string()))
}
