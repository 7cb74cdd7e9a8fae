//! Streaming playback of the synthesized reply
//!
//! Decoded frames are gathered into chunks which are queued to a sink thread
//! that owns the speaker. A chunk is cut when it reaches `chunk_frames`, when
//! playback is idle and `start_frames` have arrived, or when no frame has
//! arrived for `flush_timeout`. The sink thread writes chunks back to back so
//! output stays continuous across chunk boundaries.
//!
//! Every chunk carries the generation it was cut in. `start_new_session`
//! bumps the generation, so chunks still queued from the previous reply are
//! dropped by the sink thread instead of played.

use crate::audio::{AudioBackend, PcmSink};
use crate::config::PlaybackConfig;
use crate::pcm::{CHANNELS, SAMPLE_RATE};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

enum SinkCommand {
    Chunk { generation: u64, pcm: Vec<i16> },
    Reset,
    Shutdown,
}

#[derive(Default)]
struct Assembly {
    pcm: Vec<i16>,
    frames: usize,
    flush_timer: Option<JoinHandle<()>>,
}

struct Shared {
    cfg: PlaybackConfig,
    generation: AtomicU64,
    assembly: Mutex<Assembly>,
    commands: Mutex<Option<mpsc::Sender<SinkCommand>>>,

    /// Chunks handed to the sink thread and not yet taken by it
    queued: AtomicUsize,
    /// Frames in the chunk under assembly
    pending_frames: AtomicUsize,
    /// The device still has audio to play
    sink_busy: AtomicBool,

    playing: watch::Sender<bool>,
    /// Serializes recomputing and publishing `playing`
    status: Mutex<()>,
}

impl Shared {
    fn refresh_playing(&self) {
        let _guard = self.status.lock().unwrap_or_else(|e| e.into_inner());
        let now = self.sink_busy.load(Ordering::SeqCst)
            || self.queued.load(Ordering::SeqCst) > 0
            || self.pending_frames.load(Ordering::SeqCst) > 0;
        self.playing.send_if_modified(|playing| {
            if *playing != now {
                trace!("is_playing -> {}", now);
                *playing = now;
                true
            } else {
                false
            }
        });
    }

    fn output_idle(&self) -> bool {
        !self.sink_busy.load(Ordering::SeqCst) && self.queued.load(Ordering::SeqCst) == 0
    }

    fn send(&self, cmd: SinkCommand) -> bool {
        match self.commands.lock().unwrap_or_else(|e| e.into_inner()).as_ref() {
            Some(tx) => tx.send(cmd).is_ok(),
            None => false,
        }
    }

    /// Turn the chunk under assembly into a queued chunk.
    fn materialize(&self, assembly: &mut Assembly) {
        if let Some(timer) = assembly.flush_timer.take() {
            timer.abort();
        }
        if assembly.frames == 0 {
            return;
        }
        let pcm = std::mem::take(&mut assembly.pcm);
        let frames = std::mem::replace(&mut assembly.frames, 0);
        let generation = self.generation.load(Ordering::SeqCst);

        self.queued.fetch_add(1, Ordering::SeqCst);
        self.pending_frames.store(0, Ordering::SeqCst);
        if self.send(SinkCommand::Chunk { generation, pcm }) {
            debug!("Queued chunk of {} frames (generation {})", frames, generation);
        } else {
            self.queued.fetch_sub(1, Ordering::SeqCst);
            warn!("Playback stopped, dropping chunk of {} frames", frames);
        }
    }
}

/// Chunked streaming player with an observable `is_playing` flag.
pub struct StreamingPlayer {
    shared: Arc<Shared>,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl StreamingPlayer {
    /// Create the player and its sink thread. The output device is opened on
    /// the first chunk.
    pub fn new(backend: Arc<dyn AudioBackend>, cfg: PlaybackConfig) -> std::io::Result<Self> {
        let (tx, rx) = mpsc::channel();
        let (playing, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            cfg,
            generation: AtomicU64::new(0),
            assembly: Mutex::new(Assembly::default()),
            commands: Mutex::new(Some(tx)),
            queued: AtomicUsize::new(0),
            pending_frames: AtomicUsize::new(0),
            sink_busy: AtomicBool::new(false),
            playing,
            status: Mutex::new(()),
        });

        let thread_shared = shared.clone();
        let handle = thread::Builder::new()
            .name("rhotalk-playback".to_string())
            .spawn(move || run_sink(backend, thread_shared, rx))?;

        Ok(Self {
            shared,
            thread: Mutex::new(Some(handle)),
        })
    }

    pub fn is_playing(&self) -> bool {
        *self.shared.playing.borrow()
    }

    /// Observe the playing flag. It is true while the device has audio left,
    /// chunks are queued, or a chunk is being assembled.
    pub fn watch_playing(&self) -> watch::Receiver<bool> {
        self.shared.playing.subscribe()
    }

    /// Drop everything buffered or queued from the previous reply.
    pub fn start_new_session(&self) {
        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        {
            let mut assembly = self.shared.assembly.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(timer) = assembly.flush_timer.take() {
                timer.abort();
            }
            assembly.pcm.clear();
            assembly.frames = 0;
            self.shared.pending_frames.store(0, Ordering::SeqCst);
        }
        self.shared.send(SinkCommand::Reset);
        self.shared.refresh_playing();
        debug!("Playback session {} started", generation);
    }

    /// Add one decoded frame of the reply.
    ///
    /// Must be called from within a tokio runtime, which drives the
    /// inactivity flush.
    pub fn add_frame(&self, pcm: &[i16]) {
        let mut assembly = self.shared.assembly.lock().unwrap_or_else(|e| e.into_inner());
        assembly.pcm.extend_from_slice(pcm);
        assembly.frames += 1;
        self.shared.pending_frames.store(assembly.frames, Ordering::SeqCst);

        let cfg = &self.shared.cfg;
        if assembly.frames >= cfg.chunk_frames
            || (assembly.frames >= cfg.start_frames && self.shared.output_idle())
        {
            self.shared.materialize(&mut assembly);
        } else {
            self.arm_flush_timer(&mut assembly);
        }
        drop(assembly);
        self.shared.refresh_playing();
    }

    /// Queue whatever is still being assembled. Call once no more frames of
    /// the current reply are coming.
    pub fn flush_remaining(&self) {
        let mut assembly = self.shared.assembly.lock().unwrap_or_else(|e| e.into_inner());
        if assembly.frames > 0 {
            debug!("Flushing {} remaining frames", assembly.frames);
        }
        self.shared.materialize(&mut assembly);
        drop(assembly);
        self.shared.refresh_playing();
    }

    /// Stop the sink thread and release the device. Idempotent.
    pub fn stop(&self) {
        {
            let mut assembly = self.shared.assembly.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(timer) = assembly.flush_timer.take() {
                timer.abort();
            }
        }
        self.shared.send(SinkCommand::Shutdown);
        self.shared.commands.lock().unwrap_or_else(|e| e.into_inner()).take();
        // The sink thread exits on its own; joining could block on a device write
        self.thread.lock().unwrap_or_else(|e| e.into_inner()).take();
    }

    fn arm_flush_timer(&self, assembly: &mut Assembly) {
        if let Some(timer) = assembly.flush_timer.take() {
            timer.abort();
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("No runtime for the playback flush timer");
            return;
        };
        let shared = self.shared.clone();
        let generation = shared.generation.load(Ordering::SeqCst);
        let timeout = shared.cfg.flush_timeout();
        assembly.flush_timer = Some(runtime.spawn(async move {
            tokio::time::sleep(timeout).await;
            if shared.generation.load(Ordering::SeqCst) != generation {
                return;
            }
            let mut assembly = shared.assembly.lock().unwrap_or_else(|e| e.into_inner());
            // Our own handle is about to be dropped, not aborted
            assembly.flush_timer.take();
            if assembly.frames > 0 {
                debug!("Inactivity flush of {} frames", assembly.frames);
                shared.materialize(&mut assembly);
            }
            drop(assembly);
            shared.refresh_playing();
        }));
    }
}

impl Drop for StreamingPlayer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn chunk_duration(samples: usize) -> Duration {
    let per_second = SAMPLE_RATE as u64 * CHANNELS as u64;
    Duration::from_micros(samples as u64 * 1_000_000 / per_second)
}

/// Sink thread: owns the speaker and plays chunks back to back.
fn run_sink(backend: Arc<dyn AudioBackend>, shared: Arc<Shared>, rx: mpsc::Receiver<SinkCommand>) {
    let mut sink: Option<Box<dyn PcmSink>> = None;
    // When the audio written so far will have finished playing
    let mut busy_until: Option<Instant> = None;

    loop {
        let cmd = match busy_until {
            Some(deadline) => match rx.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
                Ok(cmd) => cmd,
                Err(RecvTimeoutError::Timeout) => {
                    if let Some(device) = sink.as_mut() {
                        if let Err(e) = device.drain() {
                            warn!("Drain failed: {}", e);
                        }
                    }
                    busy_until = None;
                    shared.sink_busy.store(false, Ordering::SeqCst);
                    shared.refresh_playing();
                    debug!("Playback finished");
                    continue;
                }
                Err(RecvTimeoutError::Disconnected) => break,
            },
            None => match rx.recv() {
                Ok(cmd) => cmd,
                Err(_) => break,
            },
        };

        match cmd {
            SinkCommand::Chunk { generation, pcm } => {
                if generation != shared.generation.load(Ordering::SeqCst) {
                    shared.queued.fetch_sub(1, Ordering::SeqCst);
                    shared.refresh_playing();
                    debug!("Dropping stale chunk from generation {}", generation);
                    continue;
                }
                shared.sink_busy.store(true, Ordering::SeqCst);
                shared.queued.fetch_sub(1, Ordering::SeqCst);

                if sink.is_none() {
                    match backend.open_output() {
                        Ok(opened) => sink = Some(opened),
                        Err(e) => {
                            error!("Failed to open playback device: {}", e);
                            if busy_until.is_none() {
                                shared.sink_busy.store(false, Ordering::SeqCst);
                            }
                            shared.refresh_playing();
                            continue;
                        }
                    }
                }
                let Some(device) = sink.as_mut() else { continue };

                if let Err(e) = device.write(&pcm) {
                    // Reopen on the next chunk
                    warn!("Playback write failed: {}", e);
                    sink = None;
                }
                let start = match busy_until {
                    Some(until) if until > Instant::now() => until,
                    _ => Instant::now(),
                };
                busy_until = Some(start + chunk_duration(pcm.len()));
                shared.refresh_playing();
            }
            SinkCommand::Reset => {
                if let Some(device) = sink.as_mut() {
                    if let Err(e) = device.discard() {
                        warn!("Discarding buffered audio failed: {}", e);
                    }
                }
                busy_until = None;
                shared.sink_busy.store(false, Ordering::SeqCst);
                shared.refresh_playing();
            }
            SinkCommand::Shutdown => break,
        }
    }

    if let Some(device) = sink.as_mut() {
        let _ = device.discard();
    }
    shared.sink_busy.store(false, Ordering::SeqCst);
    shared.refresh_playing();
    info!("Playback thread stopped");
}
