//! The main-thread half: snapshot publication, sends and the message pump.

use std::collections::VecDeque;
use std::sync::Arc;

use hashbrown::HashMap;
use tracing::{debug, trace, warn};

use super::{AudioProcessor, ProcessorListener};
use crate::config::ProcessorConfig;
use crate::data::{Data, PortId};
use crate::deferred::DeferredFn;
use crate::error::{fatal, Error, Result};
use crate::event::AtomEvent;
use crate::meter::{OutputLevel, OutputMeter};
use crate::packet::{packet_channel, Packet, PacketReader, PacketWriter, SendError};
use crate::plugin::{InstanceId, PortRef};

/// Owns all dynamic state; talks to the [`AudioProcessor`] only through rings.
///
/// Stop the audio callback before dropping this half: on drop, tokens still
/// waiting to be sent run immediately.
pub struct Processor {
    to_audio: PacketWriter,
    from_audio: PacketReader,
    /// Critical packets that found the ring full, oldest first
    backlog: VecDeque<Packet<'static>>,
    max_block_size: usize,
    state: MainState,
}

struct MainState {
    current: Option<Arc<Data>>,
    control_values: HashMap<PortRef, f32>,
    meter: OutputMeter,
    listener: Box<dyn ProcessorListener>,
}

impl Processor {
    /// Create a connected main/audio pair.
    pub fn new(config: ProcessorConfig) -> Result<(Processor, AudioProcessor)> {
        config.validate()?;
        let (to_audio, from_main) = packet_channel(config.ring_capacity, config.max_packet_size)?;
        let (to_main, from_audio) = packet_channel(config.ring_capacity, config.max_packet_size)?;

        let main = Processor {
            to_audio,
            from_audio,
            backlog: VecDeque::new(),
            max_block_size: config.max_block_size,
            state: MainState {
                current: None,
                control_values: HashMap::new(),
                meter: OutputMeter::new(config.meter_update_hz as usize),
                listener: Box::new(()),
            },
        };
        let audio = AudioProcessor::new(from_main, to_main, &config);
        debug!(
            sample_rate = config.sample_rate,
            max_block_size = config.max_block_size,
            ring_capacity = config.ring_capacity,
            "processor created"
        );
        Ok((main, audio))
    }

    pub fn with_listener(mut self, listener: impl ProcessorListener + 'static) -> Self {
        self.set_listener(listener);
        self
    }

    pub fn set_listener(&mut self, listener: impl ProcessorListener + 'static) {
        self.state.listener = Box::new(listener);
    }

    /// Hand a new snapshot to the audio thread.
    ///
    /// Returns `Ok(false)` if it equals the current one. The replaced snapshot
    /// is released only after the audio thread has run a full block under the
    /// new one.
    pub fn set_data(&mut self, data: impl Into<Arc<Data>>) -> Result<bool> {
        let data = data.into();
        if data.max_frames() < self.max_block_size {
            return Err(Error::InvalidData(format!(
                "plugin buffers hold {} frames, blocks may have {}",
                data.max_frames(),
                self.max_block_size
            )));
        }
        if self.state.current.as_deref() == Some(&*data) {
            trace!("snapshot unchanged, not published");
            return Ok(false);
        }

        let old = self.state.current.replace(data.clone());
        debug!(
            plugins = data.plugins().len(),
            keyboards = data.keyboards().len(),
            "publishing snapshot"
        );
        self.send_critical(Packet::SetData(data));
        if let Some(old) = old {
            self.send_critical(Packet::AsyncFunction(DeferredFn::drop_later(old)));
        }
        Ok(true)
    }

    /// The most recently published snapshot.
    pub fn data(&self) -> Option<&Arc<Data>> {
        self.state.current.as_ref()
    }

    /// Set a control port. Returns `false` if the message was dropped.
    pub fn send_control_value(&mut self, port: PortRef, value: f32) -> bool {
        let sent = self.send_best_effort(Packet::ControlValueChanged { port, value });
        if sent {
            self.state.control_values.insert(port, value);
        }
        sent
    }

    /// Queue an event for an input atom port. It is delivered at the start of
    /// the next block.
    pub fn send_atom_event(&mut self, port: PortRef, frame: u32, type_id: u32, data: &[u8]) -> bool {
        self.send_best_effort(Packet::AtomPortEvent {
            port,
            frame,
            type_id,
            data,
        })
    }

    /// Deliver raw MIDI to a plugin's MIDI input.
    pub fn send_midi_to_plugin(&mut self, data: &[u8], instance: InstanceId) -> bool {
        self.send_best_effort(Packet::MidiToPlugin { instance, data })
    }

    /// Write raw MIDI to an auxiliary output port.
    pub fn send_midi_async(&mut self, data: &[u8], port: PortId) -> bool {
        self.send_best_effort(Packet::AuxMidiOut { port, data })
    }

    /// Run `f` on this thread once the audio thread has completed a block
    /// after this call.
    pub fn defer_execute_after_round_trip(&mut self, f: impl FnOnce() + Send + 'static) {
        self.send_critical(Packet::AsyncFunction(DeferredFn::new(f)));
    }

    /// Drop `value` on this thread once the audio thread can no longer see it.
    pub fn defer_drop<T: Send + 'static>(&mut self, value: T) {
        self.send_critical(Packet::AsyncFunction(DeferredFn::drop_later(value)));
    }

    /// Drain and dispatch everything the audio thread sent. Call this often,
    /// e.g. from a UI timer. Returns the number of packets handled.
    pub fn process_main_thread_messages(&mut self) -> usize {
        self.flush_backlog();

        let Self {
            from_audio, state, ..
        } = self;
        let mut count = 0;
        loop {
            let packet = match from_audio.recv() {
                Ok(Some(packet)) => packet,
                Ok(None) => break,
                Err(err) => fatal(err),
            };
            state.dispatch(packet);
            count += 1;
        }
        if count > 0 {
            trace!(count, "pumped messages from the audio thread");
        }
        count
    }

    /// Last known value of a control port, sent or echoed.
    pub fn control_value(&self, port: PortRef) -> Option<f32> {
        self.state.control_values.get(&port).copied()
    }

    pub fn output_level(&self) -> OutputLevel {
        self.state.meter.level()
    }

    /// Critical packets waiting for ring space.
    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    fn send_critical(&mut self, packet: Packet<'static>) {
        debug_assert!(packet.is_critical());
        self.flush_backlog();
        if !self.backlog.is_empty() {
            self.backlog.push_back(packet);
            return;
        }
        match self.to_audio.send(packet) {
            Ok(()) => {}
            Err(SendError::Full(packet)) => {
                warn!(packet = packet.name(), "ring to audio thread full, holding packet back");
                self.backlog.push_back(packet);
            }
            Err(SendError::Rejected(err, _)) => fatal(err),
        }
    }

    fn send_best_effort(&mut self, packet: Packet<'_>) -> bool {
        debug_assert!(!packet.is_critical());
        self.flush_backlog();
        if !self.backlog.is_empty() {
            warn!(packet = packet.name(), "backlog pending, dropping message");
            return false;
        }
        match self.to_audio.send(packet) {
            Ok(()) => true,
            Err(SendError::Full(packet)) => {
                warn!(packet = packet.name(), "ring to audio thread full, dropping message");
                false
            }
            Err(SendError::Rejected(err, packet)) => {
                warn!(packet = packet.name(), error = %err, "message rejected");
                false
            }
        }
    }

    fn flush_backlog(&mut self) {
        while let Some(packet) = self.backlog.pop_front() {
            match self.to_audio.send(packet) {
                Ok(()) => {}
                Err(SendError::Full(packet)) => {
                    self.backlog.push_front(packet);
                    break;
                }
                Err(SendError::Rejected(err, _)) => fatal(err),
            }
        }
    }
}

impl MainState {
    fn dispatch(&mut self, packet: Packet<'_>) {
        match packet {
            Packet::AsyncFunction(token) => token.invoke(),
            Packet::ControlValueChanged { port, value } => {
                self.control_values.insert(port, value);
                self.listener.control_value_changed(port, value);
            }
            Packet::AtomPortEvent {
                port,
                frame,
                type_id,
                data,
            } => self.listener.atom_output(
                port,
                AtomEvent {
                    frame,
                    type_id,
                    data,
                },
            ),
            Packet::AuxMidiIn { port, frame, data } => {
                match self.current.as_deref().and_then(|d| d.aux_midi_input(port)) {
                    Some(input) => input.callback.call(frame, data),
                    None => trace!(?port, "aux MIDI input no longer connected"),
                }
            }
            Packet::OutputLevelUpdate { level } => {
                let level = self.meter.update(level);
                self.listener.output_level_changed(level);
            }
            other @ (Packet::SetData(_) | Packet::AuxMidiOut { .. } | Packet::MidiToPlugin { .. }) => {
                warn!(packet = other.name(), "unexpected packet from the audio thread");
            }
        }
    }
}

impl Drop for Processor {
    fn drop(&mut self) {
        self.process_main_thread_messages();
        if !self.backlog.is_empty() {
            debug!(count = self.backlog.len(), "releasing unsent packets");
        }
        self.backlog.clear();
    }
}
