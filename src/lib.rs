//! Real-time audio core of a live plugin host.
//!
//! - The main thread owns all dynamic state and publishes immutable [`Data`]
//!   snapshots; the audio thread only ever reads the latest one
//! - Threads talk through framed SPSC byte rings, never through locks
//! - Nothing is freed on the audio thread: replaced snapshots and other
//!   garbage travel back to the main thread as [`DeferredFn`] tokens
//! - Each block runs a fixed pipeline: MIDI routing, plugins, mix, reverb,
//!   output, metering and control echo
//!
//! See [`processor`] for the entry point.

pub mod cell;
pub mod config;
pub mod data;
pub mod deferred;
mod error;
pub mod event;
pub mod meter;
pub mod midi;
pub mod packet;
pub mod plugin;
pub mod processor;
pub mod ring;
pub mod transport;
pub mod worker;

#[cfg(feature = "cpal_sink")]
mod device;

pub use cell::{RtCell, Shared};
pub use config::{ProcessorConfig, WorkerConfig};
pub use data::{
    meter_coefficient_for, ActivePlugin, AuxMidiInput, AuxMidiOutput, Data, DataBuilder, KeyboardInput,
    MidiCallback, PortId, ReverbSend,
};
pub use deferred::DeferredFn;
pub use error::{Error, Result};
pub use event::{AtomEvent, EventBuffer, MIDI_EVENT};
pub use meter::{OutputLevel, MIN_DB};
pub use packet::{packet_channel, Packet, SendError};
pub use plugin::{
    ControlValue, Instance, InstanceId, Plugin, PluginHandle, Port, PortBuffer, PortDirection, PortRef,
};
pub use processor::{AudioProcessor, Processor, ProcessorListener};
pub use ring::frame_ring;
pub use transport::{
    memory_midi_input, memory_midi_output, AudioInputPort, AudioOutputPort, MemoryAudioPort,
    MemoryMidiInput, MemoryMidiOutput, MidiInputFeeder, MidiInputPort, MidiOutputDrain, MidiOutputPort,
    MIN_MIDI_RING_CAPACITY,
};
pub use worker::{spawn_worker, Responder, WorkHandler, WorkScheduler, WorkStatus, WorkerThread};

#[cfg(feature = "cpal_sink")]
pub use device::{CpalDevice, CpalStream};
