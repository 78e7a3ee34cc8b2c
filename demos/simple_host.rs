//! Play a sine plugin through the default output device.
//!
//! Run with: cargo run --example simple_host --features cpal_sink
//!
//! The main thread sweeps the plugin's frequency control and prints the
//! output level while the audio thread renders.

use std::f32::consts::TAU;
use std::thread::sleep;
use std::time::{Duration, Instant};

use stagerack::{
    ActivePlugin, CpalDevice, DataBuilder, Instance, InstanceId, Plugin, PluginHandle, Port, PortBuffer,
    PortDirection, PortRef, Processor, ProcessorConfig,
};

const BLOCK: usize = 256;
const SINE: InstanceId = InstanceId(1);

/// Port 0 is the frequency control, ports 1 and 2 the stereo output.
struct Sine {
    phase: f32,
    sample_rate: f32,
}

impl Instance for Sine {
    fn run(&mut self, frames: usize, ports: &mut [Port]) {
        let frequency = match &ports[0].buffer {
            PortBuffer::Control(control) => control.value,
            _ => return,
        };
        let step = frequency / self.sample_rate;
        let start = self.phase;
        for port in ports[1..].iter_mut() {
            if let PortBuffer::Audio(out) = &mut port.buffer {
                let mut phase = start;
                for sample in out[..frames].iter_mut() {
                    *sample = 0.25 * (phase * TAU).sin();
                    phase = (phase + step).fract();
                }
                self.phase = phase;
            }
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().with_max_level(tracing::Level::DEBUG).init();

    let device = CpalDevice::default_output().ok_or("no default output device")?;
    println!("Using: {} @ {}Hz", device.name(), device.sample_rate());

    let config = ProcessorConfig::new(device.sample_rate()).with_max_block_size(BLOCK);
    let (mut main, audio) = Processor::new(config)?;

    let sine = Sine {
        phase: 0.0,
        sample_rate: device.sample_rate() as f32,
    };
    let ports = vec![
        Port::control(PortDirection::Input, 440.0),
        Port::audio(PortDirection::Output, BLOCK),
        Port::audio(PortDirection::Output, BLOCK),
    ];
    let data = DataBuilder::new()
        .add_plugin(ActivePlugin::new(PluginHandle::new(SINE, Plugin::new(sine, ports))))
        .build()?;
    main.set_data(data)?;

    let _stream = device.start(audio, BLOCK)?;
    println!("Playing, press Ctrl+C to stop");

    let frequency = PortRef::new(SINE, 0);
    let started = Instant::now();
    let mut last_print = started;
    loop {
        main.process_main_thread_messages();

        let elapsed = started.elapsed().as_secs_f32();
        main.send_control_value(frequency, 440.0 + 220.0 * (elapsed * 0.5 * TAU).sin());

        if last_print.elapsed() >= Duration::from_secs(1) {
            let level = main.output_level();
            println!("level {:6.1} dB (peak {:6.1} dB)", level.db, level.peak_db);
            last_print = Instant::now();
        }
        sleep(Duration::from_millis(10));
    }
}
