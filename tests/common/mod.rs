//! Shared fixtures: an in-memory audio backend, a raw PCM codec and a
//! loopback websocket server speaking the server side of the handshake.
#![allow(dead_code)]

use futures_util::{SinkExt, StreamExt};
use rhotalk::audio::{AudioBackend, AudioError, PcmSink, PcmSource};
use rhotalk::codec::{self, FrameCodec};
use rhotalk::pcm::{i16_slice_to_u8, u8_to_i16_slice, PcmFrame, FRAME_SAMPLES};
use rhotalk::EngineConfig;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;

pub const WAIT: Duration = Duration::from_secs(5);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Await `fut`, failing the test after [`WAIT`].
pub async fn within<F: Future>(what: &str, fut: F) -> F::Output {
    match tokio::time::timeout(WAIT, fut).await {
        Ok(output) => output,
        Err(_) => panic!("Timed out waiting for {}", what),
    }
}

/// Engine config pointed at `url` with timings short enough for tests.
pub fn test_config(url: &str) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.protocol.url = url.to_string();
    config.protocol.handshake_timeout_ms = 500;
    config.protocol.reconnect_base_delay_ms = 50;
    config.protocol.max_reconnect_attempts = 3;
    config.session.speech_end_grace_ms = 300;
    config.session.speaking_timeout_ms = 5_000;
    config.session.stop_flush_delay_ms = 50;
    config.playback.flush_timeout_ms = 100;
    config
}

pub fn frame(level: i16) -> PcmFrame {
    vec![level; FRAME_SAMPLES]
}

/// Carries PCM unchanged as little-endian bytes.
pub struct RawPcmCodec;

impl FrameCodec for RawPcmCodec {
    fn format(&self) -> &'static str {
        "pcm"
    }

    fn encode(&self, pcm: &[i16]) -> codec::Result<Vec<u8>> {
        Ok(i16_slice_to_u8(pcm))
    }

    fn decode(&self, packet: &[u8]) -> codec::Result<Vec<i16>> {
        Ok(u8_to_i16_slice(packet))
    }
}

/// Microphone fed from the test, speaker recorded into memory.
pub struct MemoryBackend {
    mic: Arc<Mutex<std_mpsc::Receiver<PcmFrame>>>,
    played: Arc<Mutex<Vec<i16>>>,
    open_delay: Duration,
    input_opens: AtomicUsize,
}

/// Test side of a [`MemoryBackend`].
pub struct MemoryAudio {
    pub mic: std_mpsc::Sender<PcmFrame>,
    played: Arc<Mutex<Vec<i16>>>,
}

impl MemoryAudio {
    pub fn speak(&self, level: i16, frames: usize) {
        for _ in 0..frames {
            let _ = self.mic.send(frame(level));
        }
    }

    pub fn played(&self) -> Vec<i16> {
        self.played.lock().unwrap().clone()
    }
}

impl MemoryBackend {
    pub fn new() -> (Arc<Self>, MemoryAudio) {
        Self::with_open_delay(Duration::ZERO)
    }

    /// Opening the microphone blocks for `open_delay`.
    pub fn with_open_delay(open_delay: Duration) -> (Arc<Self>, MemoryAudio) {
        let (tx, rx) = std_mpsc::channel();
        let played = Arc::new(Mutex::new(Vec::new()));
        let backend = Arc::new(Self {
            mic: Arc::new(Mutex::new(rx)),
            played: played.clone(),
            open_delay,
            input_opens: AtomicUsize::new(0),
        });
        (backend, MemoryAudio { mic: tx, played })
    }

    /// How many times the microphone was opened.
    pub fn input_opens(&self) -> usize {
        self.input_opens.load(Ordering::SeqCst)
    }
}

struct MemorySource(Arc<Mutex<std_mpsc::Receiver<PcmFrame>>>);

impl PcmSource for MemorySource {
    fn read_frame(&mut self) -> rhotalk::audio::Result<Option<PcmFrame>> {
        let rx = self.0.lock().unwrap_or_else(|e| e.into_inner());
        match rx.recv_timeout(Duration::from_millis(10)) {
            Ok(frame) => Ok(Some(frame)),
            Err(std_mpsc::RecvTimeoutError::Timeout) => Ok(None),
            Err(std_mpsc::RecvTimeoutError::Disconnected) => Err(AudioError::Closed),
        }
    }
}

struct MemorySink(Arc<Mutex<Vec<i16>>>);

impl PcmSink for MemorySink {
    fn write(&mut self, pcm: &[i16]) -> rhotalk::audio::Result<()> {
        self.0.lock().unwrap().extend_from_slice(pcm);
        Ok(())
    }

    fn drain(&mut self) -> rhotalk::audio::Result<()> {
        Ok(())
    }

    fn discard(&mut self) -> rhotalk::audio::Result<()> {
        Ok(())
    }
}

impl AudioBackend for MemoryBackend {
    fn open_input(&self) -> rhotalk::audio::Result<Box<dyn PcmSource>> {
        self.input_opens.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(self.open_delay);
        Ok(Box::new(MemorySource(self.mic.clone())))
    }

    fn open_output(&self) -> rhotalk::audio::Result<Box<dyn PcmSink>> {
        Ok(Box::new(MemorySink(self.played.clone())))
    }
}

/// How the server answers the client's hello.
#[derive(Debug, Clone)]
pub enum HelloReply {
    Ack(String),
    Raw(String),
    Silent,
}

impl HelloReply {
    pub fn ack(session_id: &str) -> Self {
        HelloReply::Ack(session_id.to_string())
    }
}

/// Loopback websocket server. Connection `n` is answered with `script[n]`,
/// or the last entry once the script runs out.
pub struct MockServer {
    pub url: String,
    connections: mpsc::UnboundedReceiver<ServerConn>,
    accept: JoinHandle<()>,
}

impl MockServer {
    pub async fn start(script: Vec<HelloReply>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let (tx, connections) = mpsc::unbounded_channel();
        let accept = tokio::spawn(async move {
            let mut n = 0;
            while let Ok((tcp, _)) = listener.accept().await {
                let reply = script.get(n).or(script.last()).cloned().unwrap_or(HelloReply::Silent);
                n += 1;
                tokio::spawn(serve(tcp, reply, tx.clone()));
            }
        });
        Self {
            url,
            connections,
            accept,
        }
    }

    pub async fn next_connection(&mut self) -> ServerConn {
        within("a connection", self.connections.recv())
            .await
            .expect("server stopped")
    }

    /// True if no client connects within `wait`.
    pub async fn no_connection_within(&mut self, wait: Duration) -> bool {
        tokio::time::timeout(wait, self.connections.recv()).await.is_err()
    }

    /// Close the listening socket; later connection attempts are refused.
    pub fn stop_accepting(&self) {
        self.accept.abort();
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.accept.abort();
    }
}

/// Server side of one accepted connection. Dropping it closes the socket.
pub struct ServerConn {
    /// The client's hello
    pub hello: Value,
    /// Upgrade request headers, names lowercased
    pub headers: HashMap<String, String>,
    incoming: mpsc::UnboundedReceiver<Message>,
    outgoing: mpsc::UnboundedSender<Message>,
}

impl ServerConn {
    pub fn send_json(&self, value: Value) {
        let _ = self.outgoing.send(Message::text(value.to_string()));
    }

    pub fn send_binary(&self, data: Vec<u8>) {
        let _ = self.outgoing.send(Message::binary(data));
    }

    /// Send a close frame and drop the socket.
    pub fn close(&self) {
        let _ = self.outgoing.send(Message::Close(None));
    }

    /// Next control message, skipping audio.
    pub async fn next_json(&mut self) -> Value {
        within("a control message", async {
            loop {
                match self.incoming.recv().await {
                    Some(Message::Text(text)) => return serde_json::from_str(text.as_str()).unwrap(),
                    Some(_) => continue,
                    None => panic!("connection closed"),
                }
            }
        })
        .await
    }

    /// Next control message of the given type.
    pub async fn next_of_type(&mut self, kind: &str) -> Value {
        loop {
            let value = self.next_json().await;
            if value["type"] == kind {
                return value;
            }
        }
    }

    /// Next audio frame sent by the client.
    pub async fn next_binary(&mut self) -> Vec<u8> {
        within("an audio frame", async {
            loop {
                match self.incoming.recv().await {
                    Some(Message::Binary(data)) => return data.to_vec(),
                    Some(_) => continue,
                    None => panic!("connection closed"),
                }
            }
        })
        .await
    }

    /// Control messages received so far, without waiting.
    pub fn received_json(&mut self) -> Vec<Value> {
        self.received().0
    }

    /// Control messages and audio frames received so far, without waiting.
    pub fn received(&mut self) -> (Vec<Value>, Vec<Vec<u8>>) {
        let mut messages = Vec::new();
        let mut audio = Vec::new();
        while let Ok(msg) = self.incoming.try_recv() {
            match msg {
                Message::Text(text) => messages.push(serde_json::from_str(text.as_str()).unwrap()),
                Message::Binary(data) => audio.push(data.to_vec()),
                _ => {}
            }
        }
        (messages, audio)
    }
}

async fn serve(tcp: TcpStream, reply: HelloReply, connections: mpsc::UnboundedSender<ServerConn>) {
    let seen = Arc::new(Mutex::new(HashMap::new()));
    let record = seen.clone();
    let callback = move |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        let mut record = record.lock().unwrap();
        for (name, value) in request.headers() {
            record.insert(
                name.as_str().to_ascii_lowercase(),
                value.to_str().unwrap_or_default().to_string(),
            );
        }
        Ok(response)
    };
    let Ok(ws) = accept_hdr_async(tcp, callback).await else {
        return;
    };
    let (mut sink, mut source) = ws.split();

    let hello = loop {
        match source.next().await {
            Some(Ok(Message::Text(text))) => break serde_json::from_str::<Value>(text.as_str()).unwrap(),
            Some(Ok(_)) => continue,
            _ => return,
        }
    };

    let answer = match reply {
        HelloReply::Ack(session_id) => Some(
            json!({
                "type": "hello",
                "transport": "websocket",
                "session_id": session_id,
                "audio_params": {"format": "pcm", "sample_rate": 16000, "channels": 1, "frame_duration": 60}
            })
            .to_string(),
        ),
        HelloReply::Raw(text) => Some(text),
        HelloReply::Silent => None,
    };
    if let Some(answer) = answer {
        if sink.send(Message::text(answer)).await.is_err() {
            return;
        }
    }

    let (in_tx, incoming) = mpsc::unbounded_channel();
    let (outgoing, mut out_rx) = mpsc::unbounded_channel();
    let headers = seen.lock().unwrap().clone();
    let _ = connections.send(ServerConn {
        hello,
        headers,
        incoming,
        outgoing,
    });

    loop {
        tokio::select! {
            msg = source.next() => match msg {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(msg)) => {
                    let _ = in_tx.send(msg);
                }
            },
            out = out_rx.recv() => match out {
                Some(Message::Close(frame)) => {
                    let _ = sink.send(Message::Close(frame)).await;
                    break;
                }
                Some(msg) => {
                    if sink.send(msg).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
        }
    }
}
