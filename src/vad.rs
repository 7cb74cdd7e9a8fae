//! Energy-based voice activity detection
//!
//! [`EnergyVad`] classifies each frame by comparing its RMS energy with an
//! adaptive threshold derived from the recent noise floor, and turns the
//! per-frame decisions into debounced speech boundaries.
//!
//! [`VadWorker`] runs the detector as a task fed from the capture fan-out and
//! publishes [`VadEvent`]s on a broadcast channel. [`VadHandle`] is the
//! caller's side of it.

use crate::config::VadConfig;
use crate::events::VadEvent;
use crate::pcm::{rms_energy, PcmFrame};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, span, trace, warn, Instrument, Level};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Silent,
    Speaking,
}

/// Adaptive energy VAD with hysteresis.
///
/// While silent, `min_speech_frames` loud frames open speech. Up to
/// `tolerance_frames` quiet frames interleaved in that run are absorbed
/// rather than restarting it. Speaking is symmetric with
/// `min_silence_frames` quiet frames and the same tolerance for loud ones.
#[derive(Debug)]
pub struct EnergyVad {
    cfg: VadConfig,
    phase: Phase,

    /// Recent frame energies, newest last
    history: VecDeque<f32>,

    /// Frames counted toward the transition out of the current phase
    run: u32,

    /// Contradicting frames absorbed inside the current run
    absorbed: u32,
}

impl EnergyVad {
    pub fn new(cfg: VadConfig) -> Self {
        let history = VecDeque::with_capacity(cfg.window_frames);
        Self {
            cfg,
            phase: Phase::Silent,
            history,
            run: 0,
            absorbed: 0,
        }
    }

    /// Feed one frame, returning a boundary if this frame completes one.
    pub fn process(&mut self, frame: &[i16]) -> Option<VadEvent> {
        let energy = rms_energy(frame);
        let loud = self.is_speech_energy(energy);
        self.remember(energy);
        trace!("VAD energy {:.5} loud={} phase={:?}", energy, loud, self.phase);
        self.step(loud)
    }

    /// Whether a frame of the given energy counts as speech under the current
    /// threshold. The comparison is exclusive.
    pub fn is_speech_energy(&self, energy: f32) -> bool {
        energy > self.threshold()
    }

    /// Current noise floor estimate, `None` until enough frames were seen.
    pub fn noise_floor(&self) -> Option<f32> {
        if self.history.len() < self.cfg.min_noise_samples {
            return None;
        }
        let mut sorted: Vec<f32> = self.history.iter().copied().collect();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let idx = ((sorted.len() as f32 * self.cfg.noise_percentile) as usize).min(sorted.len() - 1);
        Some(sorted[idx].max(self.cfg.min_noise_floor))
    }

    /// Energy a frame has to exceed to count as speech.
    pub fn threshold(&self) -> f32 {
        match self.noise_floor() {
            Some(floor) => floor * self.cfg.threshold_multiplier,
            None => self.cfg.fallback_threshold,
        }
    }

    pub fn is_speaking(&self) -> bool {
        self.phase == Phase::Speaking
    }

    /// Clear the hysteresis counters and return to silence. The learned noise
    /// floor is kept.
    pub fn reset(&mut self) {
        self.phase = Phase::Silent;
        self.run = 0;
        self.absorbed = 0;
    }

    /// Like [`reset`](Self::reset), but also forget the noise floor.
    pub fn hard_reset(&mut self) {
        self.reset();
        self.history.clear();
    }

    fn remember(&mut self, energy: f32) {
        if self.history.len() == self.cfg.window_frames {
            self.history.pop_front();
        }
        self.history.push_back(energy);
    }

    fn step(&mut self, loud: bool) -> Option<VadEvent> {
        // A frame "agrees" when it pushes toward leaving the current phase
        let (agrees, needed) = match self.phase {
            Phase::Silent => (loud, self.cfg.min_speech_frames),
            Phase::Speaking => (!loud, self.cfg.min_silence_frames),
        };

        if agrees {
            self.run += 1;
            if self.run >= needed {
                self.run = 0;
                self.absorbed = 0;
                return Some(match self.phase {
                    Phase::Silent => {
                        debug!("VAD: speech start");
                        self.phase = Phase::Speaking;
                        VadEvent::SpeechStart
                    }
                    Phase::Speaking => {
                        debug!("VAD: speech end");
                        self.phase = Phase::Silent;
                        VadEvent::SpeechEnd
                    }
                });
            }
        } else if self.run > 0 {
            if self.absorbed < self.cfg.tolerance_frames {
                self.absorbed += 1;
            } else {
                self.run = 0;
                self.absorbed = 0;
            }
        }
        None
    }
}

/// Commands accepted by a running [`VadWorker`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadCommand {
    Reset,
    HardReset,
}

/// Runs an [`EnergyVad`] over a stream of captured frames.
pub struct VadWorker {
    vad: EnergyVad,
    frames: broadcast::Receiver<Arc<PcmFrame>>,
    commands: mpsc::UnboundedReceiver<VadCommand>,
    events: broadcast::Sender<VadEvent>,
}

impl VadWorker {
    /// Spawn the worker on the current runtime.
    ///
    /// The task ends when the frame channel closes or the handle is dropped.
    pub fn spawn(cfg: VadConfig, frames: broadcast::Receiver<Arc<PcmFrame>>, capacity: usize) -> VadHandle {
        let (events, _) = broadcast::channel(capacity);
        let (cmd_tx, commands) = mpsc::unbounded_channel();
        let worker = VadWorker {
            vad: EnergyVad::new(cfg),
            frames,
            commands,
            events: events.clone(),
        };
        let task = tokio::spawn(worker.run().instrument(span!(Level::DEBUG, "vad.worker")));
        VadHandle {
            commands: cmd_tx,
            events,
            task,
        }
    }

    async fn run(mut self) {
        loop {
            tokio::select! {
                biased;

                cmd = self.commands.recv() => match cmd {
                    Some(VadCommand::Reset) => self.vad.reset(),
                    Some(VadCommand::HardReset) => self.vad.hard_reset(),
                    None => break,
                },

                frame = self.frames.recv() => match frame {
                    Ok(frame) => {
                        if let Some(event) = self.vad.process(&frame) {
                            // No subscribers is fine, nobody is listening yet
                            let _ = self.events.send(event);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("VAD fell behind, skipped {} frames", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
        debug!("VAD worker stopped");
    }
}

/// Caller side of a running [`VadWorker`]
pub struct VadHandle {
    commands: mpsc::UnboundedSender<VadCommand>,
    events: broadcast::Sender<VadEvent>,
    task: JoinHandle<()>,
}

impl VadHandle {
    /// Receive speech boundaries emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<VadEvent> {
        self.events.subscribe()
    }

    pub fn reset(&self) {
        let _ = self.commands.send(VadCommand::Reset);
    }

    pub fn hard_reset(&self) {
        let _ = self.commands.send(VadCommand::HardReset);
    }

    /// Stop the worker. Idempotent.
    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for VadHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
