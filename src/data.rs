//! The processing snapshot.
//!
//! A [`Data`] describes everything the audio thread needs for a block. It is
//! immutable once built: topology changes build a new snapshot and swap it in
//! whole, and two snapshots are compared by value so redundant swaps can be
//! skipped.
//!
//! ```
//! use stagerack::{ActivePlugin, DataBuilder, InstanceId, Plugin, PluginHandle};
//! # use stagerack::{Instance, Port};
//! # struct Silent;
//! # impl Instance for Silent { fn run(&mut self, _: usize, _: &mut [Port]) {} }
//!
//! let synth = PluginHandle::new(InstanceId(1), Plugin::new(Silent, vec![]));
//! let data = DataBuilder::new()
//!     .add_plugin(ActivePlugin::new(synth.clone()).with_amplitude(0.5))
//!     .build()
//!     .unwrap();
//!
//! assert_eq!(data.plugins().len(), 1);
//! assert_eq!(data.plugin(InstanceId(1)), Some(&synth));
//! ```

use std::fmt;
use std::sync::Arc;

use hashbrown::HashMap;

use crate::cell::Shared;
use crate::error::{Error, Result};
use crate::plugin::{InstanceId, PluginHandle};
use crate::transport::{AudioInputPort, AudioOutputPort, MidiInputPort, MidiOutputPort};

/// Identifies an auxiliary MIDI port.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PortId(pub u32);

/// Time constant used when no meter coefficient is given.
pub const DEFAULT_METER_TIME_CONSTANT: f32 = 0.1;

/// Per-sample coefficient of a one-pole smoother with time constant
/// `seconds`.
pub fn meter_coefficient_for(sample_rate: u32, seconds: f32) -> f32 {
    if seconds <= 0.0 {
        return 0.0;
    }
    (-1.0 / (seconds * sample_rate as f32)).exp()
}

/// Main-thread handler for an auxiliary MIDI input. Compared by identity.
#[derive(Clone)]
pub struct MidiCallback(Arc<dyn Fn(u32, &[u8]) + Send + Sync>);

impl MidiCallback {
    pub fn new(f: impl Fn(u32, &[u8]) + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    pub fn call(&self, frame: u32, message: &[u8]) {
        (self.0)(frame, message)
    }
}

impl PartialEq for MidiCallback {
    fn eq(&self, other: &Self) -> bool {
        Arc::as_ptr(&self.0) as *const () == Arc::as_ptr(&other.0) as *const ()
    }
}

impl fmt::Debug for MidiCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("MidiCallback")
            .field(&(Arc::as_ptr(&self.0) as *const ()))
            .finish()
    }
}

/// One plugin in the mix.
#[derive(Clone, Debug, PartialEq)]
pub struct ActivePlugin {
    pub plugin: PluginHandle,
    /// Gain applied when summing into the bus
    pub amplitude: f32,
    /// Rewrite keyboard MIDI to the keyboard's channel
    pub override_midi_channel: bool,
    /// Port receiving keyboard MIDI; the plugin's first event input if unset
    pub midi_input: Option<usize>,
    /// Semitones added to incoming notes
    pub transpose: i8,
    /// Feed the side-chain input into the plugin's audio input
    pub vocoder_input: bool,
}

impl ActivePlugin {
    pub fn new(plugin: PluginHandle) -> Self {
        Self {
            plugin,
            amplitude: 1.0,
            override_midi_channel: false,
            midi_input: None,
            transpose: 0,
            vocoder_input: false,
        }
    }

    pub fn with_amplitude(mut self, amplitude: f32) -> Self {
        self.amplitude = amplitude;
        self
    }

    pub fn with_override_midi_channel(mut self, enabled: bool) -> Self {
        self.override_midi_channel = enabled;
        self
    }

    pub fn with_midi_input(mut self, port: usize) -> Self {
        self.midi_input = Some(port);
        self
    }

    pub fn with_transpose(mut self, semitones: i8) -> Self {
        self.transpose = semitones;
        self
    }

    pub fn with_vocoder_input(mut self, enabled: bool) -> Self {
        self.vocoder_input = enabled;
        self
    }
}

/// A keyboard and the plugin it plays.
#[derive(Clone, Debug, PartialEq)]
pub struct KeyboardInput {
    pub port: Shared<dyn MidiInputPort>,
    /// Index into [`Data::plugins`]; events are discarded when `None`
    pub plugin: Option<usize>,
    /// Channel (0-15) forced onto events for plugins that ask for it
    pub channel: u8,
}

#[derive(Clone, Debug, PartialEq)]
pub struct AuxMidiInput {
    pub id: PortId,
    pub port: Shared<dyn MidiInputPort>,
    /// Invoked on the main thread for every received event
    pub callback: MidiCallback,
}

#[derive(Clone, Debug, PartialEq)]
pub struct AuxMidiOutput {
    pub id: PortId,
    pub port: Shared<dyn MidiOutputPort>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ReverbSend {
    pub plugin: PluginHandle,
    /// Wet gain into the bus; `0.0` skips the sum
    pub level: f32,
}

/// Immutable processing snapshot. Build one with [`DataBuilder`].
#[derive(Clone, Debug, PartialEq)]
pub struct Data {
    plugins: Vec<ActivePlugin>,
    keyboards: Vec<KeyboardInput>,
    aux_inputs: Vec<AuxMidiInput>,
    aux_outputs: Vec<AuxMidiOutput>,
    outputs: [Option<Shared<dyn AudioOutputPort>>; 2],
    side_chain: Option<Shared<dyn AudioInputPort>>,
    reverb: Option<ReverbSend>,
    meter_coefficient: f32,
    /// Every instance the snapshot references, reverb included
    handles: HashMap<InstanceId, PluginHandle>,
}

impl Data {
    pub fn plugins(&self) -> &[ActivePlugin] {
        &self.plugins
    }

    pub fn keyboards(&self) -> &[KeyboardInput] {
        &self.keyboards
    }

    pub fn aux_midi_inputs(&self) -> &[AuxMidiInput] {
        &self.aux_inputs
    }

    pub fn aux_midi_outputs(&self) -> &[AuxMidiOutput] {
        &self.aux_outputs
    }

    pub fn outputs(&self) -> &[Option<Shared<dyn AudioOutputPort>>; 2] {
        &self.outputs
    }

    pub fn side_chain(&self) -> Option<&Shared<dyn AudioInputPort>> {
        self.side_chain.as_ref()
    }

    pub fn reverb(&self) -> Option<&ReverbSend> {
        self.reverb.as_ref()
    }

    pub fn meter_coefficient(&self) -> f32 {
        self.meter_coefficient
    }

    /// Look up any instance the snapshot references, reverb included.
    pub fn plugin(&self, id: InstanceId) -> Option<&PluginHandle> {
        self.handles.get(&id)
    }

    pub fn aux_midi_input(&self, id: PortId) -> Option<&AuxMidiInput> {
        self.aux_inputs.iter().find(|input| input.id == id)
    }

    pub fn aux_midi_output(&self, id: PortId) -> Option<&AuxMidiOutput> {
        self.aux_outputs.iter().find(|output| output.id == id)
    }

    /// Largest block every referenced plugin can run.
    pub fn max_frames(&self) -> usize {
        self.handles
            .values()
            .map(PluginHandle::max_frames)
            .min()
            .unwrap_or(usize::MAX)
    }
}

impl Default for Data {
    fn default() -> Self {
        Self {
            plugins: Vec::new(),
            keyboards: Vec::new(),
            aux_inputs: Vec::new(),
            aux_outputs: Vec::new(),
            outputs: [None, None],
            side_chain: None,
            reverb: None,
            meter_coefficient: meter_coefficient_for(48_000, DEFAULT_METER_TIME_CONSTANT),
            handles: HashMap::new(),
        }
    }
}

/// Collects the parts of a [`Data`] and validates them on [`build`](Self::build).
#[derive(Clone, Debug, Default)]
pub struct DataBuilder {
    data: Data,
}

impl DataBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing snapshot, e.g. to change one amplitude.
    pub fn from_data(data: &Data) -> Self {
        Self { data: data.clone() }
    }

    pub fn add_plugin(mut self, plugin: ActivePlugin) -> Self {
        self.data.plugins.push(plugin);
        self
    }

    pub fn plugins_mut(&mut self) -> &mut Vec<ActivePlugin> {
        &mut self.data.plugins
    }

    pub fn add_keyboard(
        mut self,
        port: Shared<dyn MidiInputPort>,
        plugin: Option<usize>,
        channel: u8,
    ) -> Self {
        self.data.keyboards.push(KeyboardInput {
            port,
            plugin,
            channel,
        });
        self
    }

    pub fn add_aux_midi_input(
        mut self,
        id: PortId,
        port: Shared<dyn MidiInputPort>,
        callback: MidiCallback,
    ) -> Self {
        self.data.aux_inputs.push(AuxMidiInput { id, port, callback });
        self
    }

    pub fn add_aux_midi_output(mut self, id: PortId, port: Shared<dyn MidiOutputPort>) -> Self {
        self.data.aux_outputs.push(AuxMidiOutput { id, port });
        self
    }

    /// Connect both bus channels at once; `None` leaves a channel unconnected.
    pub fn with_outputs(
        mut self,
        left: Option<Shared<dyn AudioOutputPort>>,
        right: Option<Shared<dyn AudioOutputPort>>,
    ) -> Self {
        self.data.outputs = [left, right];
        self
    }

    pub fn with_side_chain(mut self, port: Option<Shared<dyn AudioInputPort>>) -> Self {
        self.data.side_chain = port;
        self
    }

    pub fn with_reverb(mut self, plugin: PluginHandle, level: f32) -> Self {
        self.data.reverb = Some(ReverbSend { plugin, level });
        self
    }

    pub fn without_reverb(mut self) -> Self {
        self.data.reverb = None;
        self
    }

    pub fn with_meter_coefficient(mut self, coefficient: f32) -> Self {
        self.data.meter_coefficient = coefficient;
        self
    }

    pub fn build(self) -> Result<Data> {
        let mut data = self.data;
        let invalid = |msg: String| Err(Error::InvalidData(msg));

        let mut handles = HashMap::with_capacity(data.plugins.len() + 1);
        let reverb = data.reverb.iter().map(|send| &send.plugin);
        for handle in data.plugins.iter().map(|p| &p.plugin).chain(reverb) {
            if handles.insert(handle.id(), handle.clone()).is_some() {
                return invalid(format!("instance {:?} appears twice", handle.id()));
            }
        }

        for (i, plugin) in data.plugins.iter().enumerate() {
            if !plugin.amplitude.is_finite() {
                return invalid(format!("plugin {} has amplitude {}", i, plugin.amplitude));
            }
        }
        for (i, keyboard) in data.keyboards.iter().enumerate() {
            if let Some(index) = keyboard.plugin {
                if index >= data.plugins.len() {
                    return invalid(format!(
                        "keyboard {} routes to plugin {} of {}",
                        i,
                        index,
                        data.plugins.len()
                    ));
                }
            }
            if keyboard.channel > 15 {
                return invalid(format!("keyboard {} has channel {}", i, keyboard.channel));
            }
        }
        for (i, input) in data.aux_inputs.iter().enumerate() {
            if data.aux_inputs[..i].iter().any(|other| other.id == input.id) {
                return invalid(format!("aux MIDI input {:?} appears twice", input.id));
            }
        }
        for (i, output) in data.aux_outputs.iter().enumerate() {
            if data.aux_outputs[..i].iter().any(|other| other.id == output.id) {
                return invalid(format!("aux MIDI output {:?} appears twice", output.id));
            }
        }
        if let Some(reverb) = &data.reverb {
            if !reverb.level.is_finite() {
                return invalid(format!("reverb send level {}", reverb.level));
            }
        }
        if !(0.0..1.0).contains(&data.meter_coefficient) {
            return invalid(format!("meter coefficient {}", data.meter_coefficient));
        }

        data.handles = handles;
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::{Instance, Plugin, Port, PortDirection};
    use crate::transport::memory_midi_input;

    struct Silent;

    impl Instance for Silent {
        fn run(&mut self, _frames: usize, _ports: &mut [Port]) {}
    }

    fn handle(id: u32, frames: usize) -> PluginHandle {
        PluginHandle::new(
            InstanceId(id),
            Plugin::new(Silent, vec![Port::audio(PortDirection::Output, frames)]),
        )
    }

    #[test]
    fn equal_contents_compare_equal() {
        let synth = handle(1, 64);
        let build = || {
            DataBuilder::new()
                .add_plugin(ActivePlugin::new(synth.clone()).with_amplitude(0.5))
                .build()
                .unwrap()
        };
        assert_eq!(build(), build());

        let mut louder = DataBuilder::from_data(&build());
        louder.plugins_mut()[0].amplitude = 0.75;
        assert_ne!(louder.build().unwrap(), build());
    }

    #[test]
    fn same_id_different_instance_is_not_equal() {
        let a = DataBuilder::new().add_plugin(ActivePlugin::new(handle(1, 64))).build();
        let b = DataBuilder::new().add_plugin(ActivePlugin::new(handle(1, 64))).build();
        assert_ne!(a.unwrap(), b.unwrap());
    }

    #[test]
    fn duplicate_instances_are_rejected() {
        let synth = handle(1, 64);
        let result = DataBuilder::new()
            .add_plugin(ActivePlugin::new(synth.clone()))
            .with_reverb(synth, 0.3)
            .build();
        assert!(matches!(result, Err(Error::InvalidData(_))));
    }

    #[test]
    fn keyboard_must_route_inside_the_plugin_list() {
        let (_feeder, port) = memory_midi_input(1024).unwrap();
        let port: Shared<dyn MidiInputPort> = Shared::new(port).into();

        let result = DataBuilder::new()
            .add_plugin(ActivePlugin::new(handle(1, 64)))
            .add_keyboard(port.clone(), Some(1), 0)
            .build();
        assert!(matches!(result, Err(Error::InvalidData(_))));

        let result = DataBuilder::new()
            .add_plugin(ActivePlugin::new(handle(1, 64)))
            .add_keyboard(port, Some(0), 16)
            .build();
        assert!(matches!(result, Err(Error::InvalidData(_))));
    }

    #[test]
    fn amplitude_and_coefficient_are_checked() {
        let result = DataBuilder::new()
            .add_plugin(ActivePlugin::new(handle(1, 64)).with_amplitude(f32::NAN))
            .build();
        assert!(result.is_err());
        assert!(DataBuilder::new().with_meter_coefficient(1.0).build().is_err());
        assert!(DataBuilder::new().with_meter_coefficient(0.0).build().is_ok());
    }

    #[test]
    fn lookups_include_the_reverb() {
        let data = DataBuilder::new()
            .add_plugin(ActivePlugin::new(handle(1, 64)))
            .with_reverb(handle(2, 32), 0.25)
            .build()
            .unwrap();
        assert!(data.plugin(InstanceId(2)).is_some());
        assert!(data.plugin(InstanceId(3)).is_none());
        assert_eq!(data.max_frames(), 32);
    }

    #[test]
    fn coefficient_matches_time_constant() {
        let a = meter_coefficient_for(48_000, 0.1);
        approx::assert_relative_eq!(a, (-1.0f32 / 4800.0).exp(), max_relative = 1e-6);
        assert_eq!(meter_coefficient_for(48_000, 0.0), 0.0);
    }
}
