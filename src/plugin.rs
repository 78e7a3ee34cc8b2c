//! The plugin side of the pipeline: instances and their port buffers.
//!
//! A hosted plugin is anything implementing [`Instance`]. The host owns the
//! port buffers, the instance only reads and writes them during
//! [`Instance::run`]. Port kinds are fixed when a [`Port`] is created, so every
//! kind-specific step of the pipeline is an exhaustive match on [`PortBuffer`].
//!
//! ```
//! use stagerack::{Instance, Plugin, Port, PortBuffer, PortDirection};
//!
//! /// Writes a constant into every audio output.
//! struct Dc(f32);
//!
//! impl Instance for Dc {
//!     fn run(&mut self, frames: usize, ports: &mut [Port]) {
//!         for port in ports.iter_mut() {
//!             if let (PortDirection::Output, PortBuffer::Audio(buf)) = (port.direction, &mut port.buffer) {
//!                 buf[..frames].fill(self.0);
//!             }
//!         }
//!     }
//! }
//!
//! let mut plugin = Plugin::new(
//!     Dc(0.25),
//!     vec![Port::audio(PortDirection::Output, 64), Port::audio(PortDirection::Output, 64)],
//! );
//! plugin.run(64);
//! let (left, right) = plugin.stereo_output(64).unwrap();
//! assert_eq!(left[0], 0.25);
//! assert_eq!(right[63], 0.25);
//! ```

use std::fmt;

use crate::cell::Shared;
use crate::event::EventBuffer;

/// Identifies a plugin instance across snapshots.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceId(pub u32);

/// One port of one plugin instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PortRef {
    pub instance: InstanceId,
    /// Index into the plugin's port list
    pub port: u32,
}

impl PortRef {
    pub fn new(instance: InstanceId, port: u32) -> Self {
        Self { instance, port }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PortDirection {
    Input,
    Output,
}

/// A control port's current value and the value last reported to the main
/// thread.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ControlValue {
    pub value: f32,
    observed: f32,
}

impl ControlValue {
    pub fn new(value: f32) -> Self {
        Self {
            value,
            observed: value,
        }
    }

    /// Set from the main thread's side; does not count as a change.
    pub(crate) fn apply(&mut self, value: f32) {
        self.value = value;
        self.observed = value;
    }

    /// The new value if it differs from the last observed one.
    pub(crate) fn changed(&self) -> Option<f32> {
        // Bitwise so a NaN written by a plugin is reported once, not every block
        if self.value.to_bits() == self.observed.to_bits() {
            None
        } else {
            Some(self.value)
        }
    }

    /// Mark the current value as reported.
    pub(crate) fn observe(&mut self) {
        self.observed = self.value;
    }
}

/// Host-owned buffer behind a port, tagged with its kind.
#[derive(Clone, Debug, PartialEq)]
pub enum PortBuffer {
    Audio(Box<[f32]>),
    Control(ControlValue),
    Atom(EventBuffer),
    Cv(Box<[f32]>),
}

#[derive(Clone, Debug, PartialEq)]
pub struct Port {
    pub direction: PortDirection,
    pub buffer: PortBuffer,
}

impl Port {
    /// An audio port able to hold `max_frames` samples.
    pub fn audio(direction: PortDirection, max_frames: usize) -> Self {
        Self {
            direction,
            buffer: PortBuffer::Audio(vec![0.0; max_frames].into_boxed_slice()),
        }
    }

    pub fn control(direction: PortDirection, value: f32) -> Self {
        Self {
            direction,
            buffer: PortBuffer::Control(ControlValue::new(value)),
        }
    }

    /// An event port with an arena of `capacity` bytes.
    pub fn atom(direction: PortDirection, capacity: usize) -> Self {
        Self {
            direction,
            buffer: PortBuffer::Atom(EventBuffer::with_capacity(capacity)),
        }
    }

    pub fn cv(direction: PortDirection, max_frames: usize) -> Self {
        Self {
            direction,
            buffer: PortBuffer::Cv(vec![0.0; max_frames].into_boxed_slice()),
        }
    }

    fn is(&self, direction: PortDirection) -> bool {
        self.direction == direction
    }
}

/// A hosted plugin instance.
pub trait Instance: Send + 'static {
    /// Process `frames` samples. Buffers in `ports` hold at least that many.
    fn run(&mut self, frames: usize, ports: &mut [Port]);
}

/// An instance together with the buffers connected to its ports.
pub struct Plugin {
    instance: Box<dyn Instance>,
    ports: Vec<Port>,
    audio_outputs: [Option<usize>; 2],
    audio_inputs: [Option<usize>; 2],
    midi_input: Option<usize>,
}

impl Plugin {
    pub fn new(instance: impl Instance, ports: Vec<Port>) -> Self {
        let find = |direction: PortDirection, audio: bool| {
            let mut found = ports.iter().enumerate().filter(move |(_, port)| {
                port.is(direction)
                    && match port.buffer {
                        PortBuffer::Audio(_) => audio,
                        PortBuffer::Atom(_) => !audio,
                        _ => false,
                    }
            });
            [found.next().map(|(i, _)| i), found.next().map(|(i, _)| i)]
        };
        let audio_outputs = find(PortDirection::Output, true);
        let audio_inputs = find(PortDirection::Input, true);
        let midi_input = find(PortDirection::Input, false)[0];

        Self {
            instance: Box::new(instance),
            ports,
            audio_outputs,
            audio_inputs,
            midi_input,
        }
    }

    pub fn run(&mut self, frames: usize) {
        self.instance.run(frames, &mut self.ports);
    }

    pub fn ports(&self) -> &[Port] {
        &self.ports
    }

    pub fn port_mut(&mut self, index: usize) -> Option<&mut Port> {
        self.ports.get_mut(index)
    }

    pub(crate) fn ports_mut(&mut self) -> &mut [Port] {
        &mut self.ports
    }

    /// Shortest audio or CV buffer, i.e. the largest block this plugin can run.
    pub fn max_frames(&self) -> usize {
        self.ports
            .iter()
            .filter_map(|port| match &port.buffer {
                PortBuffer::Audio(buf) | PortBuffer::Cv(buf) => Some(buf.len()),
                _ => None,
            })
            .min()
            .unwrap_or(usize::MAX)
    }

    /// The left/right output pair. A mono plugin's only output is returned
    /// for both channels; `None` if the plugin has no audio output.
    pub fn stereo_output(&self, frames: usize) -> Option<(&[f32], &[f32])> {
        let left = self.audio_buffer(self.audio_outputs[0]?)?;
        let right = match self.audio_outputs[1] {
            Some(index) => self.audio_buffer(index)?,
            None => left,
        };
        Some((&left[..frames], &right[..frames]))
    }

    /// Audio input `channel` (0 or 1), if connected.
    pub fn audio_input_mut(&mut self, channel: usize) -> Option<&mut [f32]> {
        let index = (*self.audio_inputs.get(channel)?)?;
        match &mut self.ports[index].buffer {
            PortBuffer::Audio(buf) => Some(&mut buf[..]),
            _ => None,
        }
    }

    /// Index of the port keyboard MIDI is delivered to by default.
    pub fn midi_input(&self) -> Option<usize> {
        self.midi_input
    }

    /// Event buffer of an input atom port.
    pub fn event_input_mut(&mut self, index: usize) -> Option<&mut EventBuffer> {
        match self.ports.get_mut(index) {
            Some(Port {
                direction: PortDirection::Input,
                buffer: PortBuffer::Atom(events),
            }) => Some(events),
            _ => None,
        }
    }

    pub fn reset_event_buffers(&mut self) {
        for port in &mut self.ports {
            if let PortBuffer::Atom(events) = &mut port.buffer {
                events.clear();
            }
        }
    }

    fn audio_buffer(&self, index: usize) -> Option<&[f32]> {
        match &self.ports[index].buffer {
            PortBuffer::Audio(buf) => Some(&buf[..]),
            _ => None,
        }
    }
}

impl fmt::Debug for Plugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Plugin")
            .field("ports", &self.ports.len())
            .field("audio_outputs", &self.audio_outputs)
            .field("audio_inputs", &self.audio_inputs)
            .field("midi_input", &self.midi_input)
            .finish()
    }
}

/// A plugin as referenced from snapshots.
///
/// Cloning is cheap and equality is identity, so two snapshots naming the
/// same instance compare equal.
#[derive(Clone, Debug)]
pub struct PluginHandle {
    id: InstanceId,
    plugin: Shared<Plugin>,
    max_frames: usize,
}

impl PluginHandle {
    pub fn new(id: InstanceId, plugin: Plugin) -> Self {
        Self {
            id,
            max_frames: plugin.max_frames(),
            plugin: Shared::new(plugin),
        }
    }

    pub fn id(&self) -> InstanceId {
        self.id
    }

    /// Largest block the plugin's buffers can hold.
    pub fn max_frames(&self) -> usize {
        self.max_frames
    }

    /// Modify the plugin while nothing else holds it, e.g. before the first
    /// snapshot referencing it is published.
    pub fn with_mut<R>(&mut self, f: impl FnOnce(&mut Plugin) -> R) -> Option<R> {
        let plugin = self.plugin.get_mut()?;
        let result = f(plugin);
        self.max_frames = plugin.max_frames();
        Some(result)
    }

    /// Read the plugin from outside the audio callback.
    ///
    /// # Safety
    ///
    /// No block referencing this plugin may be processed while the borrow
    /// lives.
    pub unsafe fn get(&self) -> &Plugin {
        self.plugin.get()
    }

    /// # Safety
    ///
    /// Audio thread only, while processing a block.
    #[inline]
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn rt_mut(&self) -> &mut Plugin {
        self.plugin.rt_mut()
    }
}

impl PartialEq for PluginHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.plugin == other.plugin
    }
}

impl Eq for PluginHandle {}
