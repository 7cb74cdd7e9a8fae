//! Audio device access
//!
//! The engine talks to the sound hardware through two small traits:
//! [`PcmSource`] yields whole capture frames and [`PcmSink`] accepts PCM for
//! playback. An [`AudioBackend`] opens them. Devices are opened and used on
//! the thread that owns them, so the source and sink themselves need not be
//! `Send`.
//!
//! [`PulseBackend`] uses PulseAudio's simple API with 16-bit little-endian
//! PCM at 16 kHz mono, the format the rest of the engine works in.

use crate::pcm::{i16_slice_to_u8, u8_to_i16_slice, PcmFrame, CHANNELS, FRAME_SAMPLES, SAMPLE_RATE};
use libpulse_binding::callbacks::ListResult;
use libpulse_binding::context::{Context, FlagSet as ContextFlagSet, State as ContextState};
use libpulse_binding::def::Retval;
use libpulse_binding::mainloop::standard::{IterateResult, Mainloop};
use libpulse_binding::proplist::{properties, Proplist};
use libpulse_binding::sample::{Format, Spec};
use libpulse_binding::stream::Direction;
use libpulse_simple_binding::Simple;
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info};

/// Error type for audio device operations
#[derive(Debug, thiserror::Error)]
pub enum AudioError {
    #[error("No audio devices found")]
    NoDevicesFound,

    #[error("PulseAudio context error: {0}")]
    PulseContext(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("Audio device closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, AudioError>;

/// A capture device yielding whole frames.
pub trait PcmSource {
    /// Block until the next frame is available.
    ///
    /// `Ok(None)` means no data arrived within the source's own poll window;
    /// callers loop. An error means the stream is gone.
    fn read_frame(&mut self) -> Result<Option<PcmFrame>>;
}

/// A playback device.
pub trait PcmSink {
    /// Queue samples for playback, blocking while the device buffer is full.
    fn write(&mut self, pcm: &[i16]) -> Result<()>;

    /// Block until everything written so far has been played.
    fn drain(&mut self) -> Result<()>;

    /// Drop everything written but not yet played.
    fn discard(&mut self) -> Result<()>;
}

/// Opens capture and playback devices.
pub trait AudioBackend: Send + Sync {
    fn open_input(&self) -> Result<Box<dyn PcmSource>>;
    fn open_output(&self) -> Result<Box<dyn PcmSink>>;
}

fn pcm_spec() -> Spec {
    Spec {
        format: Format::S16le,
        channels: CHANNELS,
        rate: SAMPLE_RATE,
    }
}

/// PulseAudio backend using the simple API.
#[derive(Debug, Clone)]
pub struct PulseBackend {
    app_name: String,
    input_device: Option<String>,
    output_device: Option<String>,
}

impl PulseBackend {
    pub fn new(app_name: &str) -> Self {
        Self {
            app_name: app_name.to_string(),
            input_device: None,
            output_device: None,
        }
    }

    pub fn with_devices(app_name: &str, input_device: Option<String>, output_device: Option<String>) -> Self {
        Self {
            app_name: app_name.to_string(),
            input_device,
            output_device,
        }
    }
}

impl AudioBackend for PulseBackend {
    fn open_input(&self) -> Result<Box<dyn PcmSource>> {
        let spec = pcm_spec();
        let simple = Simple::new(
            None,
            &self.app_name,
            Direction::Record,
            self.input_device.as_deref(),
            "voice capture",
            &spec,
            None,
            None,
        )
        .map_err(|e| AudioError::Connection(format!("record stream: {}", e)))?;

        info!(
            "Opened capture device {}",
            self.input_device.as_deref().unwrap_or("(default)")
        );
        Ok(Box::new(PulseSource {
            simple,
            bytes: vec![0u8; FRAME_SAMPLES * 2],
        }))
    }

    fn open_output(&self) -> Result<Box<dyn PcmSink>> {
        let spec = pcm_spec();
        let simple = Simple::new(
            None,
            &self.app_name,
            Direction::Playback,
            self.output_device.as_deref(),
            "voice playback",
            &spec,
            None,
            None,
        )
        .map_err(|e| AudioError::Connection(format!("playback stream: {}", e)))?;

        info!(
            "Opened playback device {}",
            self.output_device.as_deref().unwrap_or("(default)")
        );
        Ok(Box::new(PulseSink { simple }))
    }
}

struct PulseSource {
    simple: Simple,
    bytes: Vec<u8>,
}

impl PcmSource for PulseSource {
    fn read_frame(&mut self) -> Result<Option<PcmFrame>> {
        self.simple
            .read(&mut self.bytes)
            .map_err(|e| AudioError::Stream(format!("read: {}", e)))?;
        Ok(Some(u8_to_i16_slice(&self.bytes)))
    }
}

struct PulseSink {
    simple: Simple,
}

impl PcmSink for PulseSink {
    fn write(&mut self, pcm: &[i16]) -> Result<()> {
        self.simple
            .write(&i16_slice_to_u8(pcm))
            .map_err(|e| AudioError::Stream(format!("write: {}", e)))
    }

    fn drain(&mut self) -> Result<()> {
        self.simple
            .drain()
            .map_err(|e| AudioError::Stream(format!("drain: {}", e)))
    }

    fn discard(&mut self) -> Result<()> {
        self.simple
            .flush()
            .map_err(|e| AudioError::Stream(format!("flush: {}", e)))
    }
}

/// Which side of the sound server to enumerate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    /// Microphones and other capture sources, monitors excluded
    Input,
    /// Speakers and other playback sinks
    Output,
}

/// A PulseAudio source or sink
#[derive(Debug, Clone)]
pub struct AudioDevice {
    /// PulseAudio name, usable as `input_device`/`output_device`
    pub name: String,
    /// Human-readable description
    pub description: String,
    pub sample_rate: u32,
    pub channels: u8,
}

/// List the devices of one kind known to the sound server.
pub fn list_devices(kind: DeviceKind) -> Result<Vec<AudioDevice>> {
    let devices = Arc::new(Mutex::new(Vec::new()));
    let done = Arc::new(Mutex::new(false));

    let mut proplist =
        Proplist::new().ok_or_else(|| AudioError::PulseContext("Failed to create proplist".to_string()))?;
    proplist
        .set_str(properties::APPLICATION_NAME, "rhotalk-device-lister")
        .map_err(|_| AudioError::PulseContext("Failed to set application name".to_string()))?;

    let mut mainloop =
        Mainloop::new().ok_or_else(|| AudioError::PulseContext("Failed to create mainloop".to_string()))?;
    let mut context = Context::new_with_proplist(&mainloop, "rhotalk-context", &proplist)
        .ok_or_else(|| AudioError::PulseContext("Failed to create context".to_string()))?;

    context
        .connect(None, ContextFlagSet::NOFLAGS, None)
        .map_err(|e| AudioError::Connection(format!("{:?}", e)))?;

    loop {
        iterate(&mut mainloop)?;
        match context.get_state() {
            ContextState::Ready => break,
            ContextState::Failed | ContextState::Terminated => {
                return Err(AudioError::Connection("Connection failed".to_string()));
            }
            _ => {}
        }
    }

    let introspector = context.introspect();
    let (devices_cb, done_cb) = (devices.clone(), done.clone());
    match kind {
        DeviceKind::Input => {
            let _op = introspector.get_source_info_list(move |result| match result {
                ListResult::Item(info) => {
                    if info.monitor_of_sink.is_some() {
                        return;
                    }
                    if let (Some(name), Some(description)) = (info.name.as_ref(), info.description.as_ref()) {
                        push_device(&devices_cb, name, description, info.sample_spec.rate, info.sample_spec.channels);
                    }
                }
                ListResult::End => mark_done(&done_cb),
                ListResult::Error => {
                    error!("Error listing capture devices");
                    mark_done(&done_cb);
                }
            });
            wait_done(&mut mainloop, &done)?;
        }
        DeviceKind::Output => {
            let _op = introspector.get_sink_info_list(move |result| match result {
                ListResult::Item(info) => {
                    if let (Some(name), Some(description)) = (info.name.as_ref(), info.description.as_ref()) {
                        push_device(&devices_cb, name, description, info.sample_spec.rate, info.sample_spec.channels);
                    }
                }
                ListResult::End => mark_done(&done_cb),
                ListResult::Error => {
                    error!("Error listing playback devices");
                    mark_done(&done_cb);
                }
            });
            wait_done(&mut mainloop, &done)?;
        }
    }

    context.disconnect();
    mainloop.quit(Retval(0));

    let devices = devices.lock().unwrap_or_else(|e| e.into_inner()).clone();
    debug!("Found {} {:?} devices", devices.len(), kind);
    if devices.is_empty() {
        return Err(AudioError::NoDevicesFound);
    }
    Ok(devices)
}

fn iterate(mainloop: &mut Mainloop) -> Result<()> {
    match mainloop.iterate(false) {
        IterateResult::Quit(_) | IterateResult::Err(_) => {
            Err(AudioError::PulseContext("Mainloop iterate failed".to_string()))
        }
        IterateResult::Success(_) => Ok(()),
    }
}

fn wait_done(mainloop: &mut Mainloop, done: &Arc<Mutex<bool>>) -> Result<()> {
    loop {
        iterate(mainloop)?;
        if *done.lock().unwrap_or_else(|e| e.into_inner()) {
            return Ok(());
        }
    }
}

fn push_device(devices: &Arc<Mutex<Vec<AudioDevice>>>, name: &str, description: &str, rate: u32, channels: u8) {
    devices.lock().unwrap_or_else(|e| e.into_inner()).push(AudioDevice {
        name: name.to_string(),
        description: description.to_string(),
        sample_rate: rate,
        channels,
    });
}

fn mark_done(done: &Arc<Mutex<bool>>) {
    *done.lock().unwrap_or_else(|e| e.into_inner()) = true;
}
