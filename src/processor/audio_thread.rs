//! The audio-thread half: the fixed-order block pipeline.

use std::sync::Arc;

use itertools::izip;

use crate::config::ProcessorConfig;
use crate::data::Data;
use crate::deferred::DeferredQueue;
use crate::error::{fatal, Error, Result};
use crate::meter::LevelFilter;
use crate::midi;
use crate::packet::{Packet, PacketReader, PacketWriter};
use crate::plugin::{PortBuffer, PortDirection, PortRef};

/// Runs inside the audio callback. Never locks, allocates or blocks.
pub struct AudioProcessor {
    from_main: PacketReader,
    to_main: PacketWriter,
    state: AudioState,
}

struct AudioState {
    data: Option<Arc<Data>>,
    deferred: DeferredQueue,
    max_block_size: usize,
    mix: Mix,
    last_frames: usize,
    dropped_packets: u64,
}

/// Buffers and filter state of the mixing stage.
struct Mix {
    meter: LevelFilter,
    bus: [Box<[f32]>; 2],
}

impl AudioProcessor {
    pub(crate) fn new(from_main: PacketReader, to_main: PacketWriter, config: &ProcessorConfig) -> Self {
        let bus = || vec![0.0; config.max_block_size].into_boxed_slice();
        Self {
            from_main,
            to_main,
            state: AudioState {
                data: None,
                deferred: DeferredQueue::with_capacity(config.deferred_capacity),
                max_block_size: config.max_block_size,
                mix: Mix {
                    meter: LevelFilter::new(config.samples_per_meter_update()),
                    bus: [bus(), bus()],
                },
                last_frames: 0,
                dropped_packets: 0,
            },
        }
    }

    /// Process one block of `nframes` samples.
    ///
    /// `nframes` must be a multiple of 8 no larger than the configured
    /// maximum block size. Anything that leaves the two threads out of step
    /// (a bad block size, a corrupted ring, too many deferred tokens) aborts.
    pub fn process(&mut self, nframes: usize) {
        if let Err(err) = self.try_process(nframes) {
            fatal(err);
        }
    }

    /// Like [`process`](Self::process) but returns the fatal error instead of
    /// aborting. The processor must not be used again after an error.
    pub fn try_process(&mut self, nframes: usize) -> Result<()> {
        let Self {
            from_main,
            to_main,
            state,
        } = self;

        if nframes % 8 != 0 || nframes > state.max_block_size {
            return Err(Error::InvalidBlockSize {
                frames: nframes,
                max: state.max_block_size,
            });
        }
        state.last_frames = nframes;

        // 1. output MIDI buffers start empty
        if let Some(data) = state.data.as_deref() {
            for output in data.aux_midi_outputs() {
                // SAFETY: ports in a published snapshot are only touched here.
                unsafe { output.port.rt_mut() }.clear(nframes);
            }
        }

        // 2. apply everything the main thread sent since the last block
        while let Some(packet) = from_main.recv()? {
            state.apply(packet, nframes)?;
        }

        if let Some(data) = state.data.as_deref() {
            state.mix.run(data, to_main, &mut state.dropped_packets, nframes);
        } else {
            for channel in &mut state.mix.bus {
                channel[..nframes].fill(0.0);
            }
        }

        // 12. send every token back, completing its round trip
        while let Some(token) = state.deferred.pop_front() {
            if let Err(err) = to_main.send(Packet::AsyncFunction(token)) {
                if let Packet::AsyncFunction(token) = err.into_packet() {
                    state.deferred.push_front(token);
                }
                break;
            }
        }
        Ok(())
    }

    /// The stereo bus of the last block.
    pub fn output(&self) -> (&[f32], &[f32]) {
        let n = self.state.last_frames;
        let [left, right] = &self.state.mix.bus;
        (&left[..n], &right[..n])
    }

    /// Best-effort messages lost to a full ring or a stale target.
    pub fn dropped_packets(&self) -> u64 {
        self.state.dropped_packets
    }

    /// Tokens received and not yet sent back.
    pub fn pending_tokens(&self) -> usize {
        self.state.deferred.len()
    }

    pub fn max_block_size(&self) -> usize {
        self.state.max_block_size
    }

    pub fn has_data(&self) -> bool {
        self.state.data.is_some()
    }
}

impl AudioState {
    fn apply(&mut self, packet: Packet<'_>, nframes: usize) -> Result<()> {
        match packet {
            Packet::SetData(data) => {
                clear_new_aux_outputs(self.data.as_deref(), &data, nframes);
                // The main thread still holds the old snapshot in a deferred
                // token, so this never frees it here.
                self.data = Some(data);
            }
            Packet::AsyncFunction(token) => self.deferred.push(token)?,
            Packet::ControlValueChanged { port, value } => {
                let applied = self.with_port(port, |buffer| match buffer {
                    PortBuffer::Control(control) => {
                        control.apply(value);
                        true
                    }
                    _ => false,
                });
                self.count(applied);
            }
            Packet::AtomPortEvent {
                port,
                type_id,
                data,
                ..
            } => {
                let applied = self.with_data(|snapshot| {
                    let handle = snapshot.plugin(port.instance)?;
                    // SAFETY: audio thread, inside a block.
                    let plugin = unsafe { handle.rt_mut() };
                    Some(plugin.event_input_mut(port.port as usize)?.push(0, type_id, data))
                });
                self.count(applied == Some(true));
            }
            Packet::AuxMidiOut { port, data } => {
                let written = self.with_data(|snapshot| {
                    let output = snapshot.aux_midi_output(port)?;
                    // SAFETY: audio thread, inside a block.
                    Some(unsafe { output.port.rt_mut() }.write_event(0, data))
                });
                self.count(written == Some(true));
            }
            Packet::MidiToPlugin { instance, data } => {
                let delivered = self.with_data(|snapshot| {
                    let handle = snapshot.plugin(instance)?;
                    let input = snapshot
                        .plugins()
                        .iter()
                        .find(|active| active.plugin.id() == instance)
                        .and_then(|active| active.midi_input);
                    // SAFETY: audio thread, inside a block.
                    let plugin = unsafe { handle.rt_mut() };
                    let input = input.or(plugin.midi_input())?;
                    Some(plugin.event_input_mut(input)?.push_midi(0, data))
                });
                self.count(delivered == Some(true));
            }
            Packet::AuxMidiIn { .. } | Packet::OutputLevelUpdate { .. } => self.count(false),
        }
        Ok(())
    }

    fn with_data<R>(&self, f: impl FnOnce(&Data) -> Option<R>) -> Option<R> {
        self.data.as_deref().and_then(f)
    }

    fn with_port(&self, port: PortRef, f: impl FnOnce(&mut PortBuffer) -> bool) -> bool {
        self.with_data(|data| {
            let handle = data.plugin(port.instance)?;
            // SAFETY: audio thread, inside a block.
            let plugin = unsafe { handle.rt_mut() };
            Some(f(&mut plugin.port_mut(port.port as usize)?.buffer))
        })
        .unwrap_or(false)
    }

    fn count(&mut self, delivered: bool) {
        if !delivered {
            self.dropped_packets += 1;
        }
    }
}

impl Mix {
    /// Steps 3 to 11 of a block, for a received snapshot.
    ///
    /// SAFETY (all `rt_mut` calls below): the audio thread is the only one
    /// touching plugins and ports of a published snapshot, and no two of the
    /// mutable borrows taken here overlap.
    fn run(&mut self, data: &Data, to_main: &mut PacketWriter, dropped: &mut u64, nframes: usize) {
        // 3. keyboards feed their plugins, aux inputs go to the main thread
        for keyboard in data.keyboards() {
            let target = keyboard.plugin.and_then(|index| data.plugins().get(index));
            let port = unsafe { keyboard.port.rt_mut() };
            port.read_events(nframes, &mut |frame, message| {
                let Some(active) = target else {
                    return;
                };
                let channel = active.override_midi_channel.then_some(keyboard.channel);
                let routed = midi::route(message, channel, active.transpose);
                let Some(bytes) = routed.bytes() else {
                    return;
                };
                let plugin = unsafe { active.plugin.rt_mut() };
                let input = active.midi_input.or(plugin.midi_input());
                let pushed = input
                    .and_then(|index| plugin.event_input_mut(index))
                    .map_or(false, |events| events.push_midi(frame, bytes));
                if !pushed {
                    *dropped += 1;
                }
            });
        }
        for aux in data.aux_midi_inputs() {
            let port = unsafe { aux.port.rt_mut() };
            port.read_events(nframes, &mut |frame, message| {
                let packet = Packet::AuxMidiIn {
                    port: aux.id,
                    frame,
                    data: message,
                };
                if to_main.send(packet).is_err() {
                    *dropped += 1;
                }
            });
        }

        // 4. side-chain audio for plugins that want it
        let side_chain = data
            .side_chain()
            .map(|port| unsafe { port.rt_mut() }.buffer(nframes));
        for active in data.plugins().iter().filter(|active| active.vocoder_input) {
            let plugin = unsafe { active.plugin.rt_mut() };
            let Some(input) = plugin.audio_input_mut(0) else {
                continue;
            };
            let input = &mut input[..nframes];
            let copied = side_chain.map_or(0, |source| {
                let n = source.len().min(nframes);
                input[..n].copy_from_slice(&source[..n]);
                n
            });
            input[copied..].fill(0.0);
        }

        // 5. run every plugin
        for active in data.plugins() {
            unsafe { active.plugin.rt_mut() }.run(nframes);
        }

        // 6. mix to the bus
        let [left, right] = &mut self.bus;
        let (left, right) = (&mut left[..nframes], &mut right[..nframes]);
        left.fill(0.0);
        right.fill(0.0);
        for active in data.plugins() {
            let plugin = unsafe { active.plugin.rt_mut() };
            if let Some((l, r)) = plugin.stereo_output(nframes) {
                let amplitude = active.amplitude;
                for (out_l, out_r, l, r) in izip!(left.iter_mut(), right.iter_mut(), l, r) {
                    *out_l += amplitude * l;
                    *out_r += amplitude * r;
                }
            }
        }

        // 7. + 8. reverb send
        if let Some(reverb) = data.reverb() {
            let plugin = unsafe { reverb.plugin.rt_mut() };
            if plugin.audio_input_mut(1).is_some() {
                if let Some(input) = plugin.audio_input_mut(0) {
                    input[..nframes].copy_from_slice(left);
                }
                if let Some(input) = plugin.audio_input_mut(1) {
                    input[..nframes].copy_from_slice(right);
                }
            } else if let Some(input) = plugin.audio_input_mut(0) {
                for (input, l, r) in izip!(input[..nframes].iter_mut(), left.iter(), right.iter()) {
                    *input = 0.5 * (l + r);
                }
            }
            plugin.run(nframes);

            if reverb.level != 0.0 {
                if let Some((l, r)) = plugin.stereo_output(nframes) {
                    for (out_l, out_r, l, r) in izip!(left.iter_mut(), right.iter_mut(), l, r) {
                        *out_l += reverb.level * l;
                        *out_r += reverb.level * r;
                    }
                }
            }
        }

        for (port, bus) in data.outputs().iter().zip([&*left, &*right]) {
            if let Some(port) = port {
                let out = unsafe { port.rt_mut() }.buffer_mut(nframes);
                let n = out.len().min(bus.len());
                out[..n].copy_from_slice(&bus[..n]);
            }
        }

        // 9. level meter
        if let Some(level) = self.meter.process(left, right, data.meter_coefficient()) {
            if to_main.send(Packet::OutputLevelUpdate { level }).is_err() {
                *dropped += 1;
            }
        }

        // 10. + 11. report output-side changes, then reset event buffers
        let reverb = data.reverb().map(|send| &send.plugin);
        for handle in data.plugins().iter().map(|active| &active.plugin).chain(reverb) {
            let id = handle.id();
            let plugin = unsafe { handle.rt_mut() };
            for (index, port) in plugin.ports_mut().iter_mut().enumerate() {
                let port_ref = PortRef::new(id, index as u32);
                match (port.direction, &mut port.buffer) {
                    (_, PortBuffer::Control(control)) => {
                        let Some(value) = control.changed() else {
                            continue;
                        };
                        let packet = Packet::ControlValueChanged {
                            port: port_ref,
                            value,
                        };
                        match to_main.send(packet) {
                            Ok(()) => control.observe(),
                            // retried next block
                            Err(_) => *dropped += 1,
                        }
                    }
                    (PortDirection::Output, PortBuffer::Atom(events)) => {
                        for event in events.iter() {
                            let packet = Packet::AtomPortEvent {
                                port: port_ref,
                                frame: event.frame,
                                type_id: event.type_id,
                                data: event.data,
                            };
                            if to_main.send(packet).is_err() {
                                *dropped += 1;
                            }
                        }
                    }
                    (PortDirection::Input, PortBuffer::Atom(_))
                    | (_, PortBuffer::Audio(_))
                    | (_, PortBuffer::Cv(_)) => {}
                }
            }
            plugin.reset_event_buffers();
        }
    }
}

/// Start a block on output ports that appeared with a snapshot mid-drain.
fn clear_new_aux_outputs(old: Option<&Data>, new: &Data, nframes: usize) {
    for output in new.aux_midi_outputs() {
        let known = old.map_or(false, |old| {
            old.aux_midi_outputs()
                .iter()
                .any(|previous| previous.port == output.port)
        });
        if !known {
            // SAFETY: audio thread, inside a block.
            unsafe { output.port.rt_mut() }.clear(nframes);
        }
    }
}
