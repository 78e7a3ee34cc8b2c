//! The two halves of the real-time core.
//!
//! [`Processor::new`] creates a connected pair:
//!
//! - [`Processor`] lives on the main thread. It publishes snapshots, sends
//!   control and MIDI messages and runs the message pump.
//! - [`AudioProcessor`] moves into the audio callback and runs the block
//!   pipeline.
//!
//! The halves share nothing but two framed rings, one per direction.
//!
//! ```
//! use stagerack::{DataBuilder, Processor, ProcessorConfig};
//!
//! let (mut main, mut audio) = Processor::new(ProcessorConfig::new(48_000)).unwrap();
//! main.set_data(DataBuilder::new().build().unwrap()).unwrap();
//!
//! // inside the audio callback
//! audio.process(256);
//!
//! // on a main-thread timer
//! main.process_main_thread_messages();
//! ```

mod audio_thread;
mod main_thread;

pub use audio_thread::AudioProcessor;
pub use main_thread::Processor;

use crate::event::AtomEvent;
use crate::meter::OutputLevel;
use crate::plugin::PortRef;

/// Main-thread observer of what the audio thread reports back.
///
/// All methods default to doing nothing.
pub trait ProcessorListener: Send {
    /// A plugin changed one of its control ports, or a sent value was echoed.
    fn control_value_changed(&mut self, _port: PortRef, _value: f32) {}

    /// A plugin emitted an event on an output atom port.
    fn atom_output(&mut self, _port: PortRef, _event: AtomEvent<'_>) {}

    /// A new meter reading arrived, roughly every `1 / meter_update_hz` s.
    fn output_level_changed(&mut self, _level: OutputLevel) {}
}

impl ProcessorListener for () {}
