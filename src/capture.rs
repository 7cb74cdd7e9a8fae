//! Microphone capture pipeline
//!
//! The capture device is owned by a dedicated OS thread between `start()` and
//! `stop()`. Every frame read is fanned out twice: the raw PCM goes to the VAD
//! channel and the encoded frame goes to the outgoing audio channel.

use crate::audio::{AudioBackend, AudioError, Result};
use crate::codec::FrameCodec;
use crate::pcm::PcmFrame;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use tokio::sync::{broadcast, oneshot, watch};
use tracing::{debug, error, info, warn};

struct Running {
    stop: Arc<AtomicBool>,
    thread: thread::JoinHandle<()>,
}

/// Owns the microphone while recording.
pub struct CapturePipeline {
    backend: Arc<dyn AudioBackend>,
    codec: Arc<dyn FrameCodec>,
    pcm_tx: broadcast::Sender<Arc<PcmFrame>>,
    encoded_tx: broadcast::Sender<Vec<u8>>,
    recording: watch::Sender<bool>,
    paused: Arc<AtomicBool>,
    run_id: Arc<AtomicU64>,
    running: Mutex<Option<Running>>,
    /// Held for the whole of `start()`, so one caller opens the device
    starting: tokio::sync::Mutex<()>,
    /// Thread of a stopped run that may still be finishing its last read
    stale: Mutex<Option<thread::JoinHandle<()>>>,
}

impl CapturePipeline {
    pub fn new(backend: Arc<dyn AudioBackend>, codec: Arc<dyn FrameCodec>, capacity: usize) -> Self {
        let (pcm_tx, _) = broadcast::channel(capacity);
        let (encoded_tx, _) = broadcast::channel(capacity);
        let (recording, _) = watch::channel(false);
        Self {
            backend,
            codec,
            pcm_tx,
            encoded_tx,
            recording,
            paused: Arc::new(AtomicBool::new(false)),
            run_id: Arc::new(AtomicU64::new(0)),
            running: Mutex::new(None),
            starting: tokio::sync::Mutex::new(()),
            stale: Mutex::new(None),
        }
    }

    /// Raw PCM frames, for the VAD.
    pub fn subscribe_pcm(&self) -> broadcast::Receiver<Arc<PcmFrame>> {
        self.pcm_tx.subscribe()
    }

    /// Encoded frames, for the protocol client.
    pub fn subscribe_encoded(&self) -> broadcast::Receiver<Vec<u8>> {
        self.encoded_tx.subscribe()
    }

    pub fn is_recording(&self) -> bool {
        *self.recording.borrow()
    }

    /// Observe the recording flag. It drops to `false` on `stop()` and also
    /// when the device stream ends on its own.
    pub fn watch_recording(&self) -> watch::Receiver<bool> {
        self.recording.subscribe()
    }

    /// Open the capture device and start reading. Succeeds immediately if
    /// already recording.
    pub async fn start(&self) -> Result<()> {
        let _starting = self.starting.lock().await;
        {
            let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(current) = running.as_ref() {
                if !current.thread.is_finished() {
                    debug!("Capture already running");
                    return Ok(());
                }
            }
            // A run whose device stream ended on its own
            if let Some(ended) = running.take() {
                *self.stale.lock().unwrap_or_else(|e| e.into_inner()) = Some(ended.thread);
            }
        }

        let stale = self.stale.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(stale) = stale {
            // The previous thread releases the device after at most one read
            let _ = tokio::task::spawn_blocking(move || stale.join()).await;
        }

        self.paused.store(false, Ordering::SeqCst);
        let id = self.run_id.fetch_add(1, Ordering::SeqCst) + 1;
        let stop = Arc::new(AtomicBool::new(false));
        let (opened_tx, opened_rx) = oneshot::channel();

        let ctx = CaptureThread {
            id,
            backend: self.backend.clone(),
            codec: self.codec.clone(),
            pcm_tx: self.pcm_tx.clone(),
            encoded_tx: self.encoded_tx.clone(),
            recording: self.recording.clone(),
            paused: self.paused.clone(),
            run_id: self.run_id.clone(),
            stop: stop.clone(),
        };

        let handle = thread::Builder::new()
            .name("rhotalk-capture".to_string())
            .spawn(move || ctx.run(opened_tx))
            .map_err(|e| AudioError::Stream(format!("spawn capture thread: {}", e)))?;

        match opened_rx.await {
            Ok(Ok(())) => {
                *self.running.lock().unwrap_or_else(|e| e.into_inner()) = Some(Running { stop, thread: handle });
                info!("Recording started");
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(_) => Err(AudioError::Closed),
        }
    }

    /// Stop recording and release the device. Idempotent.
    pub fn stop(&self) {
        let running = self.running.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(running) = running {
            // Invalidate the run first so the exiting thread leaves the flag alone
            self.run_id.fetch_add(1, Ordering::SeqCst);
            running.stop.store(true, Ordering::SeqCst);
            *self.stale.lock().unwrap_or_else(|e| e.into_inner()) = Some(running.thread);
            self.recording.send_replace(false);
            info!("Recording stopped");
        }
    }

    /// Keep the device open but drop everything it captures.
    pub fn pause(&self) {
        if !self.paused.swap(true, Ordering::SeqCst) {
            debug!("Capture paused");
        }
    }

    pub fn resume(&self) {
        if self.paused.swap(false, Ordering::SeqCst) {
            debug!("Capture resumed");
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }
}

impl Drop for CapturePipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

struct CaptureThread {
    id: u64,
    backend: Arc<dyn AudioBackend>,
    codec: Arc<dyn FrameCodec>,
    pcm_tx: broadcast::Sender<Arc<PcmFrame>>,
    encoded_tx: broadcast::Sender<Vec<u8>>,
    recording: watch::Sender<bool>,
    paused: Arc<AtomicBool>,
    run_id: Arc<AtomicU64>,
    stop: Arc<AtomicBool>,
}

impl CaptureThread {
    fn run(self, opened: oneshot::Sender<Result<()>>) {
        let mut source = match self.backend.open_input() {
            Ok(source) => source,
            Err(e) => {
                error!("Failed to open capture device: {}", e);
                let _ = opened.send(Err(e));
                return;
            }
        };
        self.recording.send_replace(true);
        if opened.send(Ok(())).is_err() {
            self.recording.send_replace(false);
            return;
        }

        let mut frames = 0u64;
        while !self.stop.load(Ordering::SeqCst) {
            let frame = match source.read_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => continue,
                Err(e) => {
                    if !self.stop.load(Ordering::SeqCst) {
                        error!("Capture stream ended: {}", e);
                    }
                    break;
                }
            };
            if self.paused.load(Ordering::SeqCst) {
                continue;
            }
            frames += 1;

            // Receivers come and go, an empty fan-out is not an error
            let frame = Arc::new(frame);
            let _ = self.pcm_tx.send(frame.clone());
            match self.codec.encode(&frame) {
                Ok(packet) => {
                    let _ = self.encoded_tx.send(packet);
                }
                Err(e) => warn!("Dropping frame {}, encode failed: {}", frames, e),
            }
        }

        debug!("Capture thread {} exiting after {} frames", self.id, frames);
        if self.run_id.load(Ordering::SeqCst) == self.id {
            self.recording.send_replace(false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{PcmSink, PcmSource};
    use crate::codec::CodecError;
    use crate::pcm::FRAME_SAMPLES;
    use std::sync::mpsc as std_mpsc;
    use std::time::Duration;

    /// Source fed frame by frame from the test; closing the sender ends the stream.
    struct ChannelSource(std_mpsc::Receiver<PcmFrame>);

    impl PcmSource for ChannelSource {
        fn read_frame(&mut self) -> Result<Option<PcmFrame>> {
            match self.0.recv_timeout(Duration::from_millis(10)) {
                Ok(frame) => Ok(Some(frame)),
                Err(std_mpsc::RecvTimeoutError::Timeout) => Ok(None),
                Err(std_mpsc::RecvTimeoutError::Disconnected) => Err(AudioError::Closed),
            }
        }
    }

    struct OneShotBackend(Mutex<Option<std_mpsc::Receiver<PcmFrame>>>);

    impl AudioBackend for OneShotBackend {
        fn open_input(&self) -> Result<Box<dyn PcmSource>> {
            let rx = self.0.lock().unwrap().take().ok_or(AudioError::NoDevicesFound)?;
            Ok(Box::new(ChannelSource(rx)))
        }

        fn open_output(&self) -> Result<Box<dyn PcmSink>> {
            Err(AudioError::NoDevicesFound)
        }
    }

    /// Packs the first sample of each frame; fails on negative first samples.
    struct FirstSampleCodec;

    impl FrameCodec for FirstSampleCodec {
        fn format(&self) -> &'static str {
            "test"
        }

        fn encode(&self, pcm: &[i16]) -> crate::codec::Result<Vec<u8>> {
            if pcm[0] < 0 {
                return Err(CodecError::EmptyPacket);
            }
            Ok(pcm[0].to_le_bytes().to_vec())
        }

        fn decode(&self, packet: &[u8]) -> crate::codec::Result<Vec<i16>> {
            Ok(vec![i16::from_le_bytes([packet[0], packet[1]]); FRAME_SAMPLES])
        }
    }

    fn pipeline() -> (CapturePipeline, std_mpsc::Sender<PcmFrame>) {
        let (tx, rx) = std_mpsc::channel();
        let backend = Arc::new(OneShotBackend(Mutex::new(Some(rx))));
        (CapturePipeline::new(backend, Arc::new(FirstSampleCodec), 32), tx)
    }

    async fn recv<T: Clone>(rx: &mut broadcast::Receiver<T>) -> T {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out")
            .unwrap()
    }

    #[tokio::test]
    async fn test_frames_fan_out_and_encode_failures_are_dropped() {
        let (capture, tx) = pipeline();
        let mut pcm = capture.subscribe_pcm();
        let mut encoded = capture.subscribe_encoded();

        capture.start().await.unwrap();
        assert!(capture.is_recording());

        tx.send(vec![7; FRAME_SAMPLES]).unwrap();
        tx.send(vec![-1; FRAME_SAMPLES]).unwrap();
        tx.send(vec![9; FRAME_SAMPLES]).unwrap();

        assert_eq!(recv(&mut pcm).await[0], 7);
        assert_eq!(recv(&mut pcm).await[0], -1);
        assert_eq!(recv(&mut pcm).await[0], 9);

        // The frame that failed to encode never reaches the outgoing channel
        assert_eq!(recv(&mut encoded).await, vec![7, 0]);
        assert_eq!(recv(&mut encoded).await, vec![9, 0]);

        capture.stop();
        assert!(!capture.is_recording());
        capture.stop();
    }

    #[tokio::test]
    async fn test_paused_frames_are_dropped() {
        let (capture, tx) = pipeline();
        let mut pcm = capture.subscribe_pcm();
        capture.start().await.unwrap();

        capture.pause();
        tx.send(vec![1; FRAME_SAMPLES]).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        capture.resume();
        tx.send(vec![2; FRAME_SAMPLES]).unwrap();

        assert_eq!(recv(&mut pcm).await[0], 2);
        capture.stop();
    }

    #[tokio::test]
    async fn test_device_loss_clears_recording_flag() {
        let (capture, tx) = pipeline();
        let mut recording = capture.watch_recording();
        capture.start().await.unwrap();
        assert!(*recording.borrow_and_update());

        drop(tx);
        tokio::time::timeout(Duration::from_secs(2), recording.wait_for(|r| !*r))
            .await
            .expect("flag never dropped")
            .unwrap();
        assert!(!capture.is_recording());
    }

    /// Takes a while to open and counts how often it was asked to.
    #[derive(Default)]
    struct SlowBackend {
        opens: std::sync::atomic::AtomicUsize,
        feeds: Mutex<Vec<std_mpsc::Sender<PcmFrame>>>,
    }

    impl AudioBackend for SlowBackend {
        fn open_input(&self) -> Result<Box<dyn PcmSource>> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(100));
            let (tx, rx) = std_mpsc::channel();
            self.feeds.lock().unwrap().push(tx);
            Ok(Box::new(ChannelSource(rx)))
        }

        fn open_output(&self) -> Result<Box<dyn PcmSink>> {
            Err(AudioError::NoDevicesFound)
        }
    }

    #[tokio::test]
    async fn test_concurrent_starts_open_the_device_once() {
        let backend = Arc::new(SlowBackend::default());
        let capture = CapturePipeline::new(backend.clone(), Arc::new(FirstSampleCodec), 32);

        let (first, second) = tokio::join!(capture.start(), capture.start());
        first.unwrap();
        second.unwrap();
        assert_eq!(backend.opens.load(Ordering::SeqCst), 1);
        assert!(capture.is_recording());

        capture.stop();
        assert!(!capture.is_recording());
        capture.start().await.unwrap();
        assert_eq!(backend.opens.load(Ordering::SeqCst), 2);
        capture.stop();
    }

    #[tokio::test]
    async fn test_start_fails_without_device() {
        let (capture, _tx) = pipeline();
        capture.start().await.unwrap();
        capture.stop();

        // The one-shot backend has no second device to hand out
        assert!(matches!(capture.start().await, Err(AudioError::NoDevicesFound)));
        assert!(!capture.is_recording());
    }
}
