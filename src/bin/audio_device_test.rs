//! Lists audio devices and checks that the default ones can be opened.
use rhotalk::audio::{list_devices, AudioBackend, DeviceKind, PulseBackend};
use std::error::Error;

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt::init();

    for (kind, label) in [(DeviceKind::Input, "input"), (DeviceKind::Output, "output")] {
        println!("Available audio {} devices:", label);
        match list_devices(kind) {
            Ok(devices) => {
                for (i, device) in devices.iter().enumerate() {
                    println!("{}: {}", i + 1, device.description);
                    println!("   Name: {}", device.name);
                    println!("   Rate: {} Hz, Channels: {}", device.sample_rate, device.channels);
                }
            }
            Err(e) => println!("Error listing devices: {}", e),
        }
        println!();
    }

    let backend = PulseBackend::new("rhotalk-device-test");
    println!("Opening default input...");
    match backend.open_input() {
        Ok(mut source) => match source.read_frame() {
            Ok(Some(frame)) => println!("Read a frame of {} samples", frame.len()),
            Ok(None) => println!("Input opened, no data yet"),
            Err(e) => println!("Read failed: {}", e),
        },
        Err(e) => println!("Failed to open input: {}", e),
    }

    println!("Opening default output...");
    match backend.open_output() {
        Ok(_) => println!("Output opened"),
        Err(e) => println!("Failed to open output: {}", e),
    }

    Ok(())
}
