use approx::assert_relative_eq;
use stagerack::{
    memory_midi_input, memory_midi_output, ActivePlugin, AtomEvent, DataBuilder, Instance, InstanceId,
    MemoryAudioPort, MidiCallback, OutputLevel, Plugin, PluginHandle, Port, PortBuffer, PortDirection,
    PortId, PortRef, Processor, ProcessorConfig, ProcessorListener, Shared, MIN_DB,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

const BLOCK: usize = 64;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

fn config() -> ProcessorConfig {
    ProcessorConfig::new(48_000).with_max_block_size(BLOCK)
}

/// Writes a constant into every audio output.
struct Dc(f32);

impl Instance for Dc {
    fn run(&mut self, frames: usize, ports: &mut [Port]) {
        for port in ports.iter_mut() {
            if let (PortDirection::Output, PortBuffer::Audio(buf)) = (port.direction, &mut port.buffer) {
                buf[..frames].fill(self.0);
            }
        }
    }
}

/// Copies the n-th audio input to the n-th audio output.
struct Passthrough;

impl Instance for Passthrough {
    fn run(&mut self, frames: usize, ports: &mut [Port]) {
        let audio = |direction: PortDirection| {
            ports
                .iter()
                .enumerate()
                .filter(move |(_, port)| port.direction == direction && matches!(port.buffer, PortBuffer::Audio(_)))
                .map(|(i, _)| i)
                .collect::<Vec<_>>()
        };
        let (inputs, outputs) = (audio(PortDirection::Input), audio(PortDirection::Output));
        for (&i, &o) in inputs.iter().zip(&outputs) {
            let input = match &ports[i].buffer {
                PortBuffer::Audio(buf) => buf[..frames].to_vec(),
                _ => unreachable!(),
            };
            if let PortBuffer::Audio(out) = &mut ports[o].buffer {
                out[..frames].copy_from_slice(&input);
            }
        }
    }
}

type Received = Arc<Mutex<Vec<(u32, u32, Vec<u8>)>>>;

/// Records every event arriving on its input atom ports.
struct Recorder(Received);

impl Instance for Recorder {
    fn run(&mut self, _frames: usize, ports: &mut [Port]) {
        let mut received = self.0.lock().unwrap();
        for port in ports.iter() {
            if let (PortDirection::Input, PortBuffer::Atom(events)) = (port.direction, &port.buffer) {
                received.extend(events.iter().map(|e| (e.frame, e.type_id, e.data.to_vec())));
            }
        }
    }
}

/// Sets control port 1 to twice control port 0.
struct Doubler;

impl Instance for Doubler {
    fn run(&mut self, _frames: usize, ports: &mut [Port]) {
        let input = match &ports[0].buffer {
            PortBuffer::Control(control) => control.value,
            _ => return,
        };
        if let PortBuffer::Control(output) = &mut ports[1].buffer {
            output.value = input * 2.0;
        }
    }
}

/// Emits one event per block on its output atom port.
struct Emitter;

impl Instance for Emitter {
    fn run(&mut self, _frames: usize, ports: &mut [Port]) {
        if let PortBuffer::Atom(events) = &mut ports[0].buffer {
            events.push(5, 42, b"hi");
        }
    }
}

/// Raises a flag when dropped.
struct Flagged(Arc<AtomicBool>);

impl Instance for Flagged {
    fn run(&mut self, _frames: usize, _ports: &mut [Port]) {}
}

impl Drop for Flagged {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

fn stereo_out() -> Vec<Port> {
    vec![
        Port::audio(PortDirection::Output, BLOCK),
        Port::audio(PortDirection::Output, BLOCK),
    ]
}

fn handle(id: u32, instance: impl Instance, ports: Vec<Port>) -> PluginHandle {
    PluginHandle::new(InstanceId(id), Plugin::new(instance, ports))
}

#[derive(Clone, Default)]
struct Listener {
    controls: Arc<Mutex<Vec<(PortRef, f32)>>>,
    atoms: Arc<Mutex<Vec<(PortRef, u32, u32, Vec<u8>)>>>,
    levels: Arc<Mutex<Vec<OutputLevel>>>,
}

impl ProcessorListener for Listener {
    fn control_value_changed(&mut self, port: PortRef, value: f32) {
        self.controls.lock().unwrap().push((port, value));
    }

    fn atom_output(&mut self, port: PortRef, event: AtomEvent<'_>) {
        self.atoms
            .lock()
            .unwrap()
            .push((port, event.frame, event.type_id, event.data.to_vec()));
    }

    fn output_level_changed(&mut self, level: OutputLevel) {
        self.levels.lock().unwrap().push(level);
    }
}

#[test]
fn plugins_are_mixed_with_their_amplitudes() {
    init_tracing();
    let (mut main, mut audio) = Processor::new(config()).unwrap();

    let left = Shared::new(MemoryAudioPort::new(BLOCK));
    let right = Shared::new(MemoryAudioPort::new(BLOCK));
    let data = DataBuilder::new()
        .add_plugin(ActivePlugin::new(handle(1, Dc(0.5), stereo_out())).with_amplitude(2.0))
        // mono plugin, duplicated to both channels
        .add_plugin(
            ActivePlugin::new(handle(2, Dc(1.0), vec![Port::audio(PortDirection::Output, BLOCK)]))
                .with_amplitude(3.0),
        )
        .with_outputs(Some(left.clone().into()), Some(right.clone().into()))
        .build()
        .unwrap();
    assert!(main.set_data(data).unwrap());

    audio.process(BLOCK);
    let (l, r) = audio.output();
    assert_eq!(l.len(), BLOCK);
    assert!(l.iter().chain(r).all(|&s| s == 4.0));

    // SAFETY: no block is running.
    let (left, right) = unsafe { (left.get(), right.get()) };
    assert!(left.samples().iter().all(|&s| s == 4.0));
    assert!(right.samples().iter().all(|&s| s == 4.0));
}

#[test]
fn short_output_ports_receive_the_head_of_the_block() {
    init_tracing();
    let (mut main, mut audio) = Processor::new(config()).unwrap();

    let left = Shared::new(MemoryAudioPort::new(BLOCK / 2));
    let right = Shared::new(MemoryAudioPort::new(BLOCK));
    let data = DataBuilder::new()
        .add_plugin(ActivePlugin::new(handle(1, Dc(0.5), stereo_out())))
        .with_outputs(Some(left.clone().into()), Some(right.clone().into()))
        .build()
        .unwrap();
    assert!(main.set_data(data).unwrap());

    audio.process(BLOCK);
    let (l, r) = audio.output();
    assert_eq!(l.len(), BLOCK);
    assert!(l.iter().chain(r).all(|&s| s == 0.5));

    // SAFETY: no block is running.
    let (left, right) = unsafe { (left.get(), right.get()) };
    assert_eq!(left.samples().len(), BLOCK / 2);
    assert!(left.samples().iter().all(|&s| s == 0.5));
    assert!(right.samples().iter().all(|&s| s == 0.5));
}

#[test]
fn deferred_functions_run_after_a_round_trip() {
    init_tracing();
    let (mut main, mut audio) = Processor::new(config()).unwrap();
    let ran = Arc::new(AtomicBool::new(false));
    let flag = ran.clone();
    main.defer_execute_after_round_trip(move || flag.store(true, Ordering::SeqCst));

    main.process_main_thread_messages();
    assert!(!ran.load(Ordering::SeqCst));

    audio.process(BLOCK);
    assert!(!ran.load(Ordering::SeqCst));

    main.process_main_thread_messages();
    assert!(ran.load(Ordering::SeqCst));
}

#[test]
fn replaced_snapshots_are_freed_on_the_main_thread_after_a_block() {
    init_tracing();
    let (mut main, mut audio) = Processor::new(config()).unwrap();
    let dropped = Arc::new(AtomicBool::new(false));

    let old = DataBuilder::new()
        .add_plugin(ActivePlugin::new(handle(1, Flagged(dropped.clone()), stereo_out())))
        .build()
        .unwrap();
    main.set_data(old).unwrap();
    audio.process(BLOCK);
    main.process_main_thread_messages();

    main.set_data(DataBuilder::new().build().unwrap()).unwrap();
    main.process_main_thread_messages();
    assert!(!dropped.load(Ordering::SeqCst));

    audio.process(BLOCK);
    assert!(!dropped.load(Ordering::SeqCst));
    assert!(!audio.output().0.is_empty());

    main.process_main_thread_messages();
    assert!(dropped.load(Ordering::SeqCst));
}

#[test]
#[should_panic(expected = "invalid block size")]
fn misaligned_block_sizes_abort() {
    let (_main, mut audio) = Processor::new(config()).unwrap();
    audio.process(60);
}

#[test]
fn zero_frame_blocks_are_allowed() {
    let (mut main, mut audio) = Processor::new(config()).unwrap();
    let ran = Arc::new(AtomicBool::new(false));
    let flag = ran.clone();
    main.defer_execute_after_round_trip(move || flag.store(true, Ordering::SeqCst));

    audio.process(0);
    assert!(audio.output().0.is_empty());
    main.process_main_thread_messages();
    assert!(ran.load(Ordering::SeqCst));
}

#[test]
fn control_changes_are_echoed_once() {
    init_tracing();
    let listener = Listener::default();
    let (main, mut audio) = Processor::new(config()).unwrap();
    let mut main = main.with_listener(listener.clone());

    let ports = vec![
        Port::control(PortDirection::Input, 1.0),
        Port::control(PortDirection::Output, 0.0),
    ];
    let data = DataBuilder::new()
        .add_plugin(ActivePlugin::new(handle(7, Doubler, ports)))
        .build()
        .unwrap();
    main.set_data(data).unwrap();

    let input = PortRef::new(InstanceId(7), 0);
    let output = PortRef::new(InstanceId(7), 1);

    audio.process(BLOCK);
    main.process_main_thread_messages();
    assert_eq!(main.control_value(output), Some(2.0));

    // unchanged values are not reported again
    audio.process(BLOCK);
    main.process_main_thread_messages();

    assert!(main.send_control_value(input, 3.0));
    assert_eq!(main.control_value(input), Some(3.0));
    audio.process(BLOCK);
    main.process_main_thread_messages();

    assert_eq!(*listener.controls.lock().unwrap(), vec![(output, 2.0), (output, 6.0)]);
    assert_eq!(audio.dropped_packets(), 0);
}

#[test]
fn controls_of_unknown_instances_are_dropped() {
    let (mut main, mut audio) = Processor::new(config()).unwrap();
    main.set_data(DataBuilder::new().build().unwrap()).unwrap();
    assert!(main.send_control_value(PortRef::new(InstanceId(99), 0), 1.0));
    audio.process(BLOCK);
    assert_eq!(audio.dropped_packets(), 1);
}

#[test]
fn meter_holds_the_peak_then_decays() {
    init_tracing();
    let listener = Listener::default();
    let (main, mut audio) = Processor::new(config()).unwrap();
    let mut main = main.with_listener(listener.clone());
    // 48 kHz at 30 updates per second: one update every 25 blocks
    let blocks_per_update = 1600 / BLOCK;

    let loud = DataBuilder::new()
        .add_plugin(ActivePlugin::new(handle(1, Dc(0.5), stereo_out())))
        .with_meter_coefficient(0.0)
        .build()
        .unwrap();
    main.set_data(loud).unwrap();
    for _ in 0..blocks_per_update {
        audio.process(BLOCK);
    }
    main.process_main_thread_messages();
    // (0.5 + 0.5)² = 1.0, i.e. 0 dB
    assert_relative_eq!(main.output_level().db, 0.0);
    assert_relative_eq!(main.output_level().peak_db, 0.0);

    main.set_data(DataBuilder::new().with_meter_coefficient(0.0).build().unwrap())
        .unwrap();
    for update in 1..=30 {
        for _ in 0..blocks_per_update {
            audio.process(BLOCK);
        }
        main.process_main_thread_messages();
        let level = main.output_level();
        assert_eq!(level.db, MIN_DB);
        if update < 30 {
            assert_relative_eq!(level.peak_db, 0.0);
        } else {
            assert_eq!(level.peak_db, MIN_DB);
        }
    }
    assert_eq!(listener.levels.lock().unwrap().len(), 31);
}

#[test]
fn keyboard_midi_is_routed_to_its_plugin() {
    init_tracing();
    let (mut main, mut audio) = Processor::new(config()).unwrap();
    let received = Received::default();
    let (mut keys, port) = memory_midi_input(1024).unwrap();

    let ports = vec![
        Port::atom(PortDirection::Input, 256),
        Port::audio(PortDirection::Output, BLOCK),
    ];
    let synth = ActivePlugin::new(handle(1, Recorder(received.clone()), ports))
        .with_override_midi_channel(true)
        .with_transpose(12);
    let data = DataBuilder::new()
        .add_plugin(synth)
        .add_keyboard(Shared::new(port).into(), Some(0), 5)
        .build()
        .unwrap();
    main.set_data(data).unwrap();

    assert!(keys.send(3, &[0x90, 60, 100]));
    // transposed out of range
    assert!(keys.send(4, &[0x90, 120, 100]));
    // system messages keep their status
    assert!(keys.send(9, &[0xF8]));
    audio.process(BLOCK);

    assert_eq!(
        *received.lock().unwrap(),
        vec![(3, 1, vec![0x95, 72, 100]), (9, 1, vec![0xF8])]
    );
}

#[test]
fn main_thread_events_start_the_next_block() {
    let (mut main, mut audio) = Processor::new(config()).unwrap();
    let received = Received::default();
    let ports = vec![Port::atom(PortDirection::Input, 256)];
    let data = DataBuilder::new()
        .add_plugin(ActivePlugin::new(handle(4, Recorder(received.clone()), ports)))
        .build()
        .unwrap();
    main.set_data(data).unwrap();

    assert!(main.send_midi_to_plugin(&[0x80, 60, 0], InstanceId(4)));
    assert!(main.send_atom_event(PortRef::new(InstanceId(4), 0), 17, 77, b"xyz"));
    audio.process(BLOCK);

    assert_eq!(
        *received.lock().unwrap(),
        vec![(0, 1, vec![0x80, 60, 0]), (0, 77, b"xyz".to_vec())]
    );

    // event buffers start empty again
    audio.process(BLOCK);
    assert_eq!(received.lock().unwrap().len(), 2);
}

#[test]
fn aux_input_callbacks_run_on_the_main_thread() {
    init_tracing();
    let (mut main, mut audio) = Processor::new(config()).unwrap();
    let (mut feeder, port) = memory_midi_input(1024).unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let callback = MidiCallback::new(move |frame, message| sink.lock().unwrap().push((frame, message.to_vec())));

    let data = DataBuilder::new()
        .add_aux_midi_input(PortId(2), Shared::new(port).into(), callback)
        .build()
        .unwrap();
    main.set_data(data).unwrap();

    assert!(feeder.send(7, &[0xB0, 1, 64]));
    audio.process(BLOCK);
    assert!(seen.lock().unwrap().is_empty());

    main.process_main_thread_messages();
    assert_eq!(*seen.lock().unwrap(), vec![(7, vec![0xB0, 1, 64])]);
}

#[test]
fn equal_snapshots_are_not_republished() {
    let (mut main, _audio) = Processor::new(config()).unwrap();
    let synth = handle(1, Dc(0.1), stereo_out());
    let data = DataBuilder::new()
        .add_plugin(ActivePlugin::new(synth).with_amplitude(0.5))
        .build()
        .unwrap();

    assert!(main.set_data(data.clone()).unwrap());
    assert!(!main.set_data(data.clone()).unwrap());
    assert!(!main.set_data(DataBuilder::from_data(&data).build().unwrap()).unwrap());

    let mut louder = DataBuilder::from_data(&data);
    louder.plugins_mut()[0].amplitude = 1.0;
    assert!(main.set_data(louder.build().unwrap()).unwrap());
}

#[test]
fn snapshots_with_short_buffers_are_rejected() {
    let (mut main, _audio) = Processor::new(config()).unwrap();
    let short = DataBuilder::new()
        .add_plugin(ActivePlugin::new(handle(
            1,
            Dc(0.1),
            vec![Port::audio(PortDirection::Output, BLOCK / 2)],
        )))
        .build()
        .unwrap();
    assert!(main.set_data(short).is_err());
    assert!(main.data().is_none());
}

#[test]
fn reverb_send_adds_the_wet_signal() {
    init_tracing();
    let (mut main, mut audio) = Processor::new(config()).unwrap();
    let stereo_reverb = vec![
        Port::audio(PortDirection::Input, BLOCK),
        Port::audio(PortDirection::Input, BLOCK),
        Port::audio(PortDirection::Output, BLOCK),
        Port::audio(PortDirection::Output, BLOCK),
    ];
    let data = DataBuilder::new()
        .add_plugin(ActivePlugin::new(handle(1, Dc(0.5), stereo_out())))
        .with_reverb(handle(2, Passthrough, stereo_reverb), 0.5)
        .build()
        .unwrap();
    main.set_data(data.clone()).unwrap();
    audio.process(BLOCK);
    for &s in audio.output().0.iter().chain(audio.output().1) {
        assert_relative_eq!(s, 0.75);
    }

    // mono reverb input gets the average of both channels
    let mono_reverb = vec![
        Port::audio(PortDirection::Input, BLOCK),
        Port::audio(PortDirection::Output, BLOCK),
    ];
    let data = DataBuilder::from_data(&data)
        .with_reverb(handle(3, Passthrough, mono_reverb), 1.0)
        .build()
        .unwrap();
    main.set_data(data.clone()).unwrap();
    audio.process(BLOCK);
    for &s in audio.output().0.iter() {
        assert_relative_eq!(s, 1.0);
    }

    // a zero level runs the reverb but skips the sum
    let dry = DataBuilder::from_data(&data)
        .with_reverb(data.reverb().unwrap().plugin.clone(), 0.0)
        .build()
        .unwrap();
    main.set_data(dry).unwrap();
    audio.process(BLOCK);
    for &s in audio.output().1.iter() {
        assert_relative_eq!(s, 0.5);
    }
}

#[test]
fn side_chain_feeds_vocoder_plugins() {
    let (mut main, mut audio) = Processor::new(config()).unwrap();
    let side_chain = Shared::new(MemoryAudioPort::with_samples(vec![0.25; BLOCK / 2]));
    let passthrough = |id| {
        handle(
            id,
            Passthrough,
            vec![
                Port::audio(PortDirection::Input, BLOCK),
                Port::audio(PortDirection::Output, BLOCK),
            ],
        )
    };
    let data = DataBuilder::new()
        .add_plugin(ActivePlugin::new(passthrough(1)).with_vocoder_input(true))
        .add_plugin(ActivePlugin::new(passthrough(2)))
        .with_side_chain(Some(side_chain.into()))
        .build()
        .unwrap();
    main.set_data(data).unwrap();
    audio.process(BLOCK);

    let (left, _) = audio.output();
    // the source ran dry halfway through the block
    assert!(left[..BLOCK / 2].iter().all(|&s| s == 0.25));
    assert!(left[BLOCK / 2..].iter().all(|&s| s == 0.0));
}

#[test]
fn atom_output_events_reach_the_listener() {
    let listener = Listener::default();
    let (main, mut audio) = Processor::new(config()).unwrap();
    let mut main = main.with_listener(listener.clone());
    let data = DataBuilder::new()
        .add_plugin(ActivePlugin::new(handle(3, Emitter, vec![Port::atom(PortDirection::Output, 64)])))
        .build()
        .unwrap();
    main.set_data(data).unwrap();

    audio.process(BLOCK);
    audio.process(BLOCK);
    main.process_main_thread_messages();

    let port = PortRef::new(InstanceId(3), 0);
    assert_eq!(
        *listener.atoms.lock().unwrap(),
        vec![(port, 5, 42, b"hi".to_vec()), (port, 5, 42, b"hi".to_vec())]
    );
}

#[test]
fn async_midi_reaches_aux_outputs() {
    init_tracing();
    let (mut main, mut audio) = Processor::new(config()).unwrap();
    let (port, mut drain) = memory_midi_output(1024).unwrap();
    let data = DataBuilder::new()
        .add_aux_midi_output(PortId(1), Shared::new(port).into())
        .build()
        .unwrap();
    main.set_data(data).unwrap();
    audio.process(BLOCK);

    assert!(main.send_midi_async(&[0x90, 60, 1], PortId(1)));
    assert!(main.send_midi_async(&[0x90, 61, 1], PortId(9)));
    audio.process(BLOCK);

    let mut written = Vec::new();
    drain
        .drain(|frame, message| written.push((frame, message.to_vec())))
        .unwrap();
    assert_eq!(written, vec![(0, vec![0x90, 60, 1])]);
    assert_eq!(audio.dropped_packets(), 1);
}
