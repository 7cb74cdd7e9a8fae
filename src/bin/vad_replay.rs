/// Replays a WAV file through the energy VAD and prints speech boundaries.
///
/// The file must be 16 kHz mono 16-bit PCM. Thresholds come from the
/// `[vad]` table of the file named by `RHOTALK_CONFIG`, or the defaults.
use rhotalk::events::VadEvent;
use rhotalk::pcm::{frames_duration, FRAME_SAMPLES, SAMPLE_RATE};
use rhotalk::vad::EnergyVad;
use rhotalk::EngineConfig;
use std::error::Error;
use std::path::PathBuf;

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let path = std::env::args()
        .nth(1)
        .ok_or("usage: vad_replay <file.wav>")?;

    let config_path = std::env::var_os("RHOTALK_CONFIG").map(PathBuf::from);
    let config = EngineConfig::load(config_path.as_deref())?;

    let mut reader = hound::WavReader::open(&path)?;
    let spec = reader.spec();
    if spec.sample_rate != SAMPLE_RATE || spec.channels != 1 || spec.bits_per_sample != 16 {
        return Err(format!(
            "expected {} Hz mono 16-bit, got {} Hz {} channel(s) {}-bit",
            SAMPLE_RATE, spec.sample_rate, spec.channels, spec.bits_per_sample
        )
        .into());
    }
    let samples = reader.samples::<i16>().collect::<Result<Vec<_>, _>>()?;

    let mut vad = EnergyVad::new(config.vad);
    let mut started_at = None;
    let mut segments = 0;
    for (index, frame) in samples.chunks_exact(FRAME_SAMPLES).enumerate() {
        let at_ms = frames_duration(index).as_millis() as u64;
        match vad.process(frame) {
            Some(VadEvent::SpeechStart) => {
                println!("{:>8} ms  speech start (threshold {:.4})", at_ms, vad.threshold());
                started_at = Some(at_ms);
            }
            Some(VadEvent::SpeechEnd) => {
                let length = started_at.take().map(|start| at_ms - start).unwrap_or(0);
                println!("{:>8} ms  speech end ({} ms)", at_ms, length);
                segments += 1;
            }
            None => {}
        }
    }
    if let Some(start) = started_at {
        println!("Speech still open at end of file (started at {} ms)", start);
    }

    println!(
        "{} segment(s) in {} ms of audio, final noise floor {:?}",
        segments,
        samples.len() as u64 * 1000 / SAMPLE_RATE as u64,
        vad.noise_floor()
    );
    Ok(())
}
