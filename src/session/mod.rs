//! Conversation session state machine
//!
//! [`VoiceSession`] owns the capture pipeline, the VAD worker, the streaming
//! player and the protocol client, and derives the observable
//! [`DeviceState`] and [`Emotion`] from their events.
//!
//! ```text
//! idle -> listening -> thinking -> speaking -> idle
//!   \__________\___________\__________\____> error (recovered on reconnect)
//! ```
//!
//! `start_listening`/`stop_listening` go through a transition lock that
//! rejects rather than queues a concurrent call. Everything else is driven
//! by a single event loop task, so its transitions never interleave with
//! each other.
//!
//! Speaking ends when playback drains after the server's `tts stop`. A
//! drained queue before that is an underrun and the session keeps speaking,
//! bounded by the speaking timeout.
//!
//! In auto voice mode capture runs continuously and VAD boundaries start
//! and stop turns. Capture is paused while the reply plays and the VAD is
//! reset afterwards.

mod activation;
mod chat;

pub use activation::{ActivationGate, ActivationStatus, AlreadyActivated};
pub use chat::ChatLog;

use crate::audio::{AudioBackend, AudioError};
use crate::capture::CapturePipeline;
use crate::codec::{CodecError, FrameCodec};
use crate::config::{EngineConfig, SessionConfig};
use crate::events::{ChatMessage, DeviceState, Emotion, ListeningMode, ProtocolEvent, VadEvent};
use crate::playback::StreamingPlayer;
use crate::protocol::{ProtocolClient, ProtocolError};
use crate::vad::{VadHandle, VadWorker};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Error type for session operations
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Device is not activated")]
    NotActivated,

    #[error("Session has been shut down")]
    ShutDown,

    #[error(transparent)]
    Activation(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, SessionError>;

/// A cancellable one-shot timer slot. Re-arming cancels the previous timer.
#[derive(Default)]
struct TimerSlot {
    seq: u64,
    handle: Option<JoinHandle<()>>,
}

impl TimerSlot {
    fn cancel(&mut self) {
        self.seq += 1;
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    fn arm(&mut self, spawn: impl FnOnce(u64) -> JoinHandle<()>) {
        self.cancel();
        self.handle = Some(spawn(self.seq));
    }

    /// Called by the timer task when it fires. False if it was cancelled or
    /// re-armed in the meantime. Afterwards the slot no longer aborts it.
    fn fire(&mut self, seq: u64) -> bool {
        if self.seq != seq {
            return false;
        }
        self.seq += 1;
        self.handle.take();
        true
    }
}

struct Fields {
    listening_mode: ListeningMode,
    auto_voice: bool,
    /// State when the connection dropped, restored on reconnect
    state_before_loss: Option<DeviceState>,
    /// The server has sent `tts stop` for the reply being played
    reply_ended: bool,
    grace: TimerSlot,
    speaking_timeout: TimerSlot,
    stop_flush: TimerSlot,
}

struct Inner {
    cfg: SessionConfig,
    protocol: ProtocolClient,
    capture: CapturePipeline,
    player: StreamingPlayer,
    vad: VadHandle,
    codec: Arc<dyn FrameCodec>,
    activation: Arc<dyn ActivationGate>,
    chat: ChatLog,

    /// Held for the whole of a start/stop listening transition
    transition: tokio::sync::Mutex<()>,
    state: watch::Sender<DeviceState>,
    emotion: watch::Sender<Emotion>,
    fields: Mutex<Fields>,
    event_loop: Mutex<Option<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

/// The voice conversation session. Cheap to clone.
///
/// Must be created inside a tokio runtime. Call [`shutdown`](Self::shutdown)
/// to release the devices and the connection.
#[derive(Clone)]
pub struct VoiceSession {
    inner: Arc<Inner>,
}

impl VoiceSession {
    pub fn new(cfg: EngineConfig, backend: Arc<dyn AudioBackend>, codec: Arc<dyn FrameCodec>) -> Result<Self> {
        Self::with_activation(cfg, backend, codec, Arc::new(AlreadyActivated))
    }

    pub fn with_activation(
        cfg: EngineConfig,
        backend: Arc<dyn AudioBackend>,
        codec: Arc<dyn FrameCodec>,
        activation: Arc<dyn ActivationGate>,
    ) -> Result<Self> {
        let EngineConfig {
            protocol,
            vad,
            playback,
            session,
            audio: _,
        } = cfg;

        let capacity = session.event_capacity;
        let protocol = ProtocolClient::new(protocol, codec.format());
        let capture = CapturePipeline::new(backend.clone(), codec.clone(), capacity);
        let vad = VadWorker::spawn(vad, capture.subscribe_pcm(), capacity);
        let player = StreamingPlayer::new(backend, playback)?;

        // Subscribe before anything can be emitted
        let channels = LoopChannels {
            vad: vad.subscribe(),
            protocol: protocol.subscribe(),
            playing: player.watch_playing(),
            recording: capture.watch_recording(),
            encoded: capture.subscribe_encoded(),
        };

        let (state, _) = watch::channel(DeviceState::Idle);
        let (emotion, _) = watch::channel(Emotion::Neutral);
        let inner = Arc::new(Inner {
            chat: ChatLog::new(session.chat_capacity),
            fields: Mutex::new(Fields {
                listening_mode: ListeningMode::default(),
                auto_voice: false,
                state_before_loss: None,
                reply_ended: false,
                grace: TimerSlot::default(),
                speaking_timeout: TimerSlot::default(),
                stop_flush: TimerSlot::default(),
            }),
            cfg: session,
            protocol,
            capture,
            player,
            vad,
            codec,
            activation,
            transition: tokio::sync::Mutex::new(()),
            state,
            emotion,
            event_loop: Mutex::new(None),
            shut_down: AtomicBool::new(false),
        });

        let task = tokio::spawn(Inner::run(inner.clone(), channels));
        *inner.event_loop.lock().unwrap_or_else(|e| e.into_inner()) = Some(task);
        Ok(Self { inner })
    }

    /// Pass the activation gate, then connect and complete the handshake.
    /// Returns the session id assigned by the server.
    pub async fn connect(&self) -> Result<String> {
        self.ensure_running()?;
        let status = self.inner.activation.check_status().await?;
        if status.needs_activation {
            info!(
                "Device needs activation, verification code: {}",
                status.verification_code.as_deref().unwrap_or("(none)")
            );
            if !self.inner.activation.activate().await? {
                return Err(SessionError::NotActivated);
            }
            info!("Device activated");
        }

        let session_id = self.inner.protocol.connect().await?;
        if self.state() == DeviceState::Error {
            self.inner.set_state(DeviceState::Idle);
        }
        Ok(session_id)
    }

    /// Begin a listening turn. Ignored while another transition is running.
    pub async fn start_listening(&self, mode: ListeningMode) -> Result<()> {
        self.ensure_running()?;
        let Ok(_guard) = self.inner.transition.try_lock() else {
            warn!("Transition in progress, ignoring start_listening");
            return Ok(());
        };
        self.inner.start_listening_locked(mode, true).await
    }

    /// End the listening turn and wait for the reply. Ignored while another
    /// transition is running.
    pub async fn stop_listening(&self) -> Result<()> {
        self.ensure_running()?;
        let Ok(_guard) = self.inner.transition.try_lock() else {
            warn!("Transition in progress, ignoring stop_listening");
            return Ok(());
        };
        self.inner.stop_listening_locked().await
    }

    /// Cut the reply short and return to idle.
    pub async fn abort_speaking(&self, reason: Option<&str>) -> Result<()> {
        self.ensure_running()?;
        let Ok(_guard) = self.inner.transition.try_lock() else {
            warn!("Transition in progress, ignoring abort_speaking");
            return Ok(());
        };
        info!("Aborting speech ({})", reason.unwrap_or("no reason"));
        if self.inner.protocol.session_id().is_some() {
            self.inner.protocol.send_abort(reason)?;
        }
        self.inner.player.start_new_session();
        if self.state() == DeviceState::Speaking {
            self.inner.finish_speaking();
        }
        Ok(())
    }

    /// Send typed text as the user's turn.
    pub async fn send_text(&self, text: &str) -> Result<()> {
        self.ensure_running()?;
        let Ok(_guard) = self.inner.transition.try_lock() else {
            warn!("Transition in progress, ignoring send_text");
            return Ok(());
        };
        self.inner.protocol.send_text(text)?;
        self.inner.chat.push(ChatMessage::user(text));
        if self.state() == DeviceState::Idle {
            self.inner.player.start_new_session();
            self.inner.set_state(DeviceState::Thinking);
        }
        Ok(())
    }

    /// Report the wake word that opened this turn.
    pub fn send_wake_word_detected(&self, text: &str) -> Result<()> {
        Ok(self.inner.protocol.send_wake_word_detected(text)?)
    }

    /// Push device state (volume and so on) to the server.
    pub fn send_device_state(&self, states: Value) -> Result<()> {
        Ok(self.inner.protocol.send_device_state(states)?)
    }

    pub fn send_mcp(&self, payload: Value) -> Result<()> {
        Ok(self.inner.protocol.send_mcp(payload)?)
    }

    /// Switch hands-free turn taking on or off.
    pub async fn set_auto_voice_mode(&self, enabled: bool) -> Result<()> {
        self.ensure_running()?;
        if enabled {
            self.inner.capture.start().await?;
            if self.state() != DeviceState::Speaking {
                self.inner.capture.resume();
            }
            self.inner.vad.hard_reset();
        }
        self.inner.fields().auto_voice = enabled;
        info!("Auto voice mode {}", if enabled { "on" } else { "off" });

        if !enabled && self.state() != DeviceState::Listening {
            self.inner.capture.stop();
        }
        Ok(())
    }

    /// Tear everything down: timers and tasks first, then the devices, then
    /// the connection. Idempotent.
    pub fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down voice session");
        {
            let mut fields = self.inner.fields();
            fields.grace.cancel();
            fields.speaking_timeout.cancel();
            fields.stop_flush.cancel();
        }
        if let Some(task) = self.inner.event_loop.lock().unwrap_or_else(|e| e.into_inner()).take() {
            task.abort();
        }
        self.inner.vad.stop();

        self.inner.capture.stop();
        self.inner.player.stop();

        self.inner.protocol.disconnect();
        self.inner.set_state(DeviceState::Idle);
    }

    pub fn state(&self) -> DeviceState {
        *self.inner.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<DeviceState> {
        self.inner.state.subscribe()
    }

    pub fn emotion(&self) -> Emotion {
        *self.inner.emotion.borrow()
    }

    pub fn watch_emotion(&self) -> watch::Receiver<Emotion> {
        self.inner.emotion.subscribe()
    }

    /// Mode of the current or most recent listening turn.
    pub fn listening_mode(&self) -> ListeningMode {
        self.inner.fields().listening_mode
    }

    pub fn is_auto_voice_mode(&self) -> bool {
        self.inner.fields().auto_voice
    }

    pub fn is_recording(&self) -> bool {
        self.inner.capture.is_recording()
    }

    pub fn is_playing(&self) -> bool {
        self.inner.player.is_playing()
    }

    pub fn chat_messages(&self) -> Vec<ChatMessage> {
        self.inner.chat.messages()
    }

    pub fn subscribe_chat(&self) -> broadcast::Receiver<ChatMessage> {
        self.inner.chat.subscribe()
    }

    pub fn protocol(&self) -> &ProtocolClient {
        &self.inner.protocol
    }

    fn ensure_running(&self) -> Result<()> {
        if self.inner.shut_down.load(Ordering::SeqCst) {
            return Err(SessionError::ShutDown);
        }
        Ok(())
    }
}

struct LoopChannels {
    vad: broadcast::Receiver<VadEvent>,
    protocol: broadcast::Receiver<ProtocolEvent>,
    playing: watch::Receiver<bool>,
    recording: watch::Receiver<bool>,
    encoded: broadcast::Receiver<Vec<u8>>,
}

impl Inner {
    fn fields(&self) -> std::sync::MutexGuard<'_, Fields> {
        self.fields.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn state(&self) -> DeviceState {
        *self.state.borrow()
    }

    fn set_state(&self, next: DeviceState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            info!("State {:?} -> {:?}", previous, next);
            self.emotion.send_replace(Emotion::for_state(next));
        }
    }

    fn set_emotion(&self, emotion: Emotion) {
        self.emotion.send_if_modified(|current| {
            if *current != emotion {
                *current = emotion;
                true
            } else {
                false
            }
        });
    }

    /// `reset_vad` is false when the turn was opened by the VAD itself, whose
    /// segment is still running.
    async fn start_listening_locked(self: &Arc<Self>, mode: ListeningMode, reset_vad: bool) -> Result<()> {
        let state = self.state();
        if state == DeviceState::Listening {
            debug!("Already listening");
            return Ok(());
        }
        if self.protocol.session_id().is_none() {
            return Err(ProtocolError::NotConnected.into());
        }
        if state == DeviceState::Speaking {
            // Barge in on the reply
            self.protocol.send_abort(None)?;
            self.fields().speaking_timeout.cancel();
        }

        {
            let mut fields = self.fields();
            fields.grace.cancel();
            fields.stop_flush.cancel();
        }
        self.player.start_new_session();

        if let Err(e) = self.capture.start().await {
            error!("Cannot start listening, capture failed: {}", e);
            self.set_state(DeviceState::Error);
            return Err(e.into());
        }
        self.capture.resume();
        if reset_vad {
            self.vad.reset();
        }

        self.protocol.send_start_listening(mode)?;
        self.fields().listening_mode = mode;
        self.set_state(DeviceState::Listening);
        Ok(())
    }

    async fn stop_listening_locked(self: &Arc<Self>) -> Result<()> {
        if self.state() != DeviceState::Listening {
            debug!("Not listening, nothing to stop");
            return Ok(());
        }
        self.fields().grace.cancel();
        self.protocol.send_stop_listening()?;
        self.set_state(DeviceState::Thinking);

        let (auto_voice, mode) = {
            let fields = self.fields();
            (fields.auto_voice, fields.listening_mode)
        };
        if !auto_voice && mode != ListeningMode::Realtime {
            self.capture.stop();
        }

        // Let the reply start streaming before flushing what has arrived
        let inner = self.clone();
        let delay = self.cfg.stop_flush_delay();
        self.fields().stop_flush.arm(|seq| {
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if inner.fields().stop_flush.fire(seq) {
                    inner.player.flush_remaining();
                }
            })
        });
        Ok(())
    }

    fn enter_speaking(self: &Arc<Self>) {
        self.fields().reply_ended = false;
        self.set_state(DeviceState::Speaking);

        let (auto_voice, mode) = {
            let fields = self.fields();
            (fields.auto_voice, fields.listening_mode)
        };
        if mode != ListeningMode::Realtime {
            if auto_voice {
                // Keep the device open but do not hear our own reply
                self.capture.pause();
            } else {
                self.capture.stop();
            }
        }

        let inner = self.clone();
        let timeout = self.cfg.speaking_timeout();
        self.fields().speaking_timeout.arm(|seq| {
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                if !inner.fields().speaking_timeout.fire(seq) {
                    return;
                }
                if inner.state() == DeviceState::Speaking {
                    warn!("Still speaking after {:?}, forcing idle", timeout);
                    inner.player.start_new_session();
                    inner.finish_speaking();
                }
            })
        });
    }

    fn finish_speaking(&self) {
        let auto_voice = {
            let mut fields = self.fields();
            fields.speaking_timeout.cancel();
            fields.auto_voice
        };
        self.set_state(DeviceState::Idle);
        if auto_voice {
            self.capture.resume();
            self.vad.hard_reset();
        }
    }

    /// Whether captured audio should go out right now.
    fn forwarding_audio(&self) -> bool {
        match self.state() {
            DeviceState::Listening => true,
            DeviceState::Speaking => self.fields().listening_mode == ListeningMode::Realtime,
            _ => false,
        }
    }

    async fn run(inner: Arc<Inner>, mut ch: LoopChannels) {
        info!("Session event loop started");
        loop {
            tokio::select! {
                event = ch.vad.recv() => match event {
                    Ok(event) => inner.on_vad(event).await,
                    Err(broadcast::error::RecvError::Lagged(n)) => warn!("Missed {} VAD events", n),
                    Err(broadcast::error::RecvError::Closed) => break,
                },

                event = ch.protocol.recv() => match event {
                    Ok(event) => inner.on_protocol(event).await,
                    Err(broadcast::error::RecvError::Lagged(n)) => warn!("Missed {} protocol events", n),
                    Err(broadcast::error::RecvError::Closed) => break,
                },

                changed = ch.playing.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let playing = *ch.playing.borrow_and_update();
                    inner.on_playing(playing);
                },

                changed = ch.recording.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let recording = *ch.recording.borrow_and_update();
                    inner.on_recording(recording);
                },

                packet = ch.encoded.recv() => match packet {
                    Ok(packet) => {
                        if inner.forwarding_audio() {
                            if let Err(e) = inner.protocol.send_audio(packet) {
                                debug!("Dropping outgoing frame: {}", e);
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => warn!("Dropped {} outgoing frames", n),
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
        info!("Session event loop stopped");
    }

    async fn on_vad(self: &Arc<Self>, event: VadEvent) {
        let state = self.state();
        if state == DeviceState::Speaking {
            debug!("Ignoring {:?} while speaking", event);
            return;
        }
        let auto_voice = self.fields().auto_voice;

        match event {
            VadEvent::SpeechStart => {
                if matches!(state, DeviceState::Idle | DeviceState::Listening) {
                    self.set_emotion(Emotion::Listening);
                }
                if state == DeviceState::Listening {
                    // Speech resumed inside the grace period
                    self.fields().grace.cancel();
                } else if auto_voice && state == DeviceState::Idle {
                    let Ok(_guard) = self.transition.try_lock() else {
                        warn!("Transition in progress, ignoring speech start");
                        return;
                    };
                    let mode = self.cfg.auto_listening_mode;
                    match self.start_listening_locked(mode, false).await {
                        // Entering listening resets the tag, the user is still talking
                        Ok(()) => self.set_emotion(Emotion::Listening),
                        Err(e) => error!("Auto start listening failed: {}", e),
                    }
                }
            }
            VadEvent::SpeechEnd => {
                if matches!(state, DeviceState::Idle | DeviceState::Listening) {
                    self.set_emotion(Emotion::Neutral);
                }
                if state != DeviceState::Listening {
                    return;
                }
                let mode = self.fields().listening_mode;
                if auto_voice {
                    let Ok(_guard) = self.transition.try_lock() else {
                        warn!("Transition in progress, ignoring speech end");
                        return;
                    };
                    if let Err(e) = self.stop_listening_locked().await {
                        error!("Auto stop listening failed: {}", e);
                    }
                } else if mode == ListeningMode::AutoStop {
                    self.arm_grace_timer();
                }
            }
        }
    }

    fn arm_grace_timer(self: &Arc<Self>) {
        let grace = self.cfg.speech_end_grace();
        debug!("Speech ended, stopping in {:?} unless it resumes", grace);
        let inner = self.clone();
        self.fields().grace.arm(|seq| {
            tokio::spawn(async move {
                tokio::time::sleep(grace).await;
                if !inner.fields().grace.fire(seq) {
                    return;
                }
                let Ok(_guard) = inner.transition.try_lock() else {
                    warn!("Transition in progress, ignoring grace timer");
                    return;
                };
                if let Err(e) = inner.stop_listening_locked().await {
                    error!("Stop listening after grace period failed: {}", e);
                }
            })
        });
    }

    async fn on_protocol(self: &Arc<Self>, event: ProtocolEvent) {
        match event {
            ProtocolEvent::Connected { session_id, reconnected } => {
                if reconnected {
                    self.on_reconnected(&session_id).await;
                }
            }
            ProtocolEvent::Audio(packet) => self.on_reply_audio(&packet),
            ProtocolEvent::TtsStarted => self.reply_started(),
            ProtocolEvent::AssistantText(text) => {
                info!("Assistant: {}", text);
                self.chat.push(ChatMessage::assistant(text));
                self.reply_started();
            }
            ProtocolEvent::TtsStopped => {
                if self.state() == DeviceState::Speaking {
                    self.fields().reply_ended = true;
                    self.player.flush_remaining();
                    if !self.player.is_playing() {
                        self.finish_speaking();
                    }
                }
            }
            ProtocolEvent::UserText(text) => {
                info!("User: {}", text);
                self.chat.push(ChatMessage::user(text));
            }
            ProtocolEvent::Emotion(hint) => self.set_emotion(Emotion::from_remote_hint(&hint)),
            ProtocolEvent::Vendor(value) => debug!("Unhandled control message: {}", value),
            ProtocolEvent::ConnectionLost => self.on_connection_lost(),
            ProtocolEvent::NetworkError(reason) => {
                error!("Network error: {}", reason);
                {
                    let mut fields = self.fields();
                    fields.state_before_loss = None;
                    fields.grace.cancel();
                    fields.speaking_timeout.cancel();
                }
                self.player.start_new_session();
                self.set_state(DeviceState::Error);
            }
        }
    }

    /// First sign of the reply, text or audio.
    fn reply_started(self: &Arc<Self>) {
        let mode = self.fields().listening_mode;
        match self.state() {
            DeviceState::Thinking => self.enter_speaking(),
            DeviceState::Listening if mode != ListeningMode::Manual => self.enter_speaking(),
            _ => {}
        }
    }

    fn on_reply_audio(self: &Arc<Self>, packet: &[u8]) {
        self.reply_started();
        if self.state() != DeviceState::Speaking {
            debug!("Dropping reply audio in state {:?}", self.state());
            return;
        }
        match self.codec.decode(packet) {
            Ok(pcm) => self.player.add_frame(&pcm),
            Err(e) => warn!("Dropping reply frame, decode failed: {}", e),
        }
    }

    fn on_playing(&self, playing: bool) {
        if playing || self.state() != DeviceState::Speaking {
            return;
        }
        // An underrun between sentences is not the end of the reply
        if !self.fields().reply_ended {
            debug!("Playback drained, waiting for more of the reply");
            return;
        }
        debug!("Playback complete");
        self.finish_speaking();
    }

    fn on_recording(&self, recording: bool) {
        if !recording && self.state() == DeviceState::Listening {
            error!("Recording stopped in the middle of a turn");
            self.fields().grace.cancel();
            self.set_state(DeviceState::Error);
        }
    }

    fn on_connection_lost(&self) {
        let state = self.state();
        {
            let mut fields = self.fields();
            if fields.state_before_loss.is_none() {
                fields.state_before_loss = Some(state);
            }
            fields.grace.cancel();
            fields.speaking_timeout.cancel();
            fields.stop_flush.cancel();
        }
        warn!("Connection lost while {:?}", state);
        if state == DeviceState::Speaking {
            self.player.start_new_session();
        }
        self.set_state(DeviceState::Error);
    }

    async fn on_reconnected(self: &Arc<Self>, session_id: &str) {
        let (before, mode, auto_voice) = {
            let mut fields = self.fields();
            (fields.state_before_loss.take(), fields.listening_mode, fields.auto_voice)
        };
        info!("Reconnected as {}, state before loss {:?}", session_id, before);

        let _guard = self.transition.lock().await;
        if before == Some(DeviceState::Listening) {
            match self.start_listening_locked(mode, true).await {
                Ok(()) => return,
                Err(e) => error!("Could not resume listening: {}", e),
            }
        }
        self.set_state(DeviceState::Idle);
        if auto_voice {
            self.capture.resume();
            self.vad.hard_reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_timer_slot_rearm_cancels_previous() {
        let fired = Arc::new(AtomicBool::new(false));
        let mut slot = TimerSlot::default();

        let flag = fired.clone();
        slot.arm(|_| {
            tokio::spawn(async move {
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                flag.store(true, Ordering::SeqCst);
            })
        });
        slot.arm(|_| tokio::spawn(async {}));

        tokio::time::sleep(std::time::Duration::from_millis(60)).await;
        assert!(!fired.load(Ordering::SeqCst));
    }

    #[test]
    fn test_timer_slot_fire_only_once_for_current_seq() {
        let mut slot = TimerSlot::default();
        let seq = slot.seq;
        assert!(slot.fire(seq));
        assert!(!slot.fire(seq));

        let stale = slot.seq;
        slot.cancel();
        assert!(!slot.fire(stale));
    }
}
