//! Physical audio and MIDI ports, as seen from the audio thread.
//!
//! The pipeline only needs a block-sized buffer per audio port and an event
//! read/write per MIDI port. Backends implement these traits; the in-memory
//! ports here serve offline rendering, the cpal driver and tests.

use std::sync::Arc;

use crate::cell::{RtCell, Shared};
use crate::error::fatal;
use crate::event::MIDI_EVENT;
use crate::ring::{frame_ring, FrameReader, FrameWriter, HEADER_SIZE};
use crate::Result;

pub trait MidiInputPort: Send + 'static {
    /// Hand every event received for this block to `sink` as
    /// `(frame_offset, bytes)`, in time order.
    fn read_events(&mut self, frames: usize, sink: &mut dyn FnMut(u32, &[u8]));
}

pub trait MidiOutputPort: Send + 'static {
    /// Start a new block of `frames` samples. Called before any write.
    fn clear(&mut self, frames: usize);

    /// Queue one event. Returns `false` if the port dropped it.
    fn write_event(&mut self, frame: u32, message: &[u8]) -> bool;
}

pub trait AudioInputPort: Send + 'static {
    /// Samples for this block. May be shorter than `frames` if the source ran
    /// dry; the rest is treated as silence.
    fn buffer(&mut self, frames: usize) -> &[f32];
}

pub trait AudioOutputPort: Send + 'static {
    /// A writable buffer for this block. May be shorter than `frames` if the
    /// port holds fewer samples; the tail of the block is not written.
    fn buffer_mut(&mut self, frames: usize) -> &mut [f32];
}

macro_rules! impl_into_dyn {
    ($($port:ident),*) => {$(
        impl<P: $port> From<Shared<P>> for Shared<dyn $port> {
            fn from(port: Shared<P>) -> Self {
                let inner: Arc<RtCell<dyn $port>> = port.into_arc();
                Shared::from_arc(inner)
            }
        }
    )*};
}

impl_into_dyn!(MidiInputPort, MidiOutputPort, AudioInputPort, AudioOutputPort);

/// A fixed sample buffer usable as audio input or output.
#[derive(Clone, Debug, PartialEq)]
pub struct MemoryAudioPort {
    samples: Box<[f32]>,
}

impl MemoryAudioPort {
    /// A silent port holding up to `max_frames` samples.
    pub fn new(max_frames: usize) -> Self {
        Self {
            samples: vec![0.0; max_frames].into_boxed_slice(),
        }
    }

    pub fn with_samples(samples: impl Into<Box<[f32]>>) -> Self {
        Self {
            samples: samples.into(),
        }
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn samples_mut(&mut self) -> &mut [f32] {
        &mut self.samples
    }
}

impl AudioInputPort for MemoryAudioPort {
    fn buffer(&mut self, frames: usize) -> &[f32] {
        &self.samples[..frames.min(self.samples.len())]
    }
}

impl AudioOutputPort for MemoryAudioPort {
    fn buffer_mut(&mut self, frames: usize) -> &mut [f32] {
        let n = frames.min(self.samples.len());
        &mut self.samples[..n]
    }
}

/// Create an in-memory MIDI input: the feeder is driven from any single
/// thread, the port is read by the audio thread.
///
/// `capacity` must be at least [`MIN_MIDI_RING_CAPACITY`] bytes.
pub fn memory_midi_input(capacity: usize) -> Result<(MidiInputFeeder, MemoryMidiInput)> {
    let (writer, reader) = frame_ring(capacity, MAX_MIDI_FRAME)?;
    Ok((MidiInputFeeder { writer }, MemoryMidiInput { reader }))
}

/// Create an in-memory MIDI output: the audio thread writes to the port, a
/// single other thread drains it.
///
/// `capacity` must be at least [`MIN_MIDI_RING_CAPACITY`] bytes.
pub fn memory_midi_output(capacity: usize) -> Result<(MemoryMidiOutput, MidiOutputDrain)> {
    let (writer, reader) = frame_ring(capacity, MAX_MIDI_FRAME)?;
    Ok((
        MemoryMidiOutput {
            writer,
            block_frames: 0,
        },
        MidiOutputDrain { reader },
    ))
}

// frame offset word plus a sysex-sized message
const MAX_MIDI_FRAME: usize = 4 + 4 + 256;

/// Smallest ring an in-memory MIDI port accepts: one maximal event.
pub const MIN_MIDI_RING_CAPACITY: usize = MAX_MIDI_FRAME + HEADER_SIZE;

pub struct MidiInputFeeder {
    writer: FrameWriter,
}

impl MidiInputFeeder {
    /// Queue an event for the next block. Returns `false` if the ring is full
    /// or the message is too long.
    pub fn send(&mut self, frame: u32, message: &[u8]) -> bool {
        self.writer
            .write(MIDI_EVENT, &frame.to_ne_bytes(), message)
            .is_ok()
    }
}

pub struct MemoryMidiInput {
    reader: FrameReader,
}

impl MidiInputPort for MemoryMidiInput {
    fn read_events(&mut self, frames: usize, sink: &mut dyn FnMut(u32, &[u8])) {
        if frames == 0 {
            return;
        }
        let last = (frames - 1) as u32;
        loop {
            match self.reader.read() {
                Ok(Some(frame)) => sink(frame_offset(frame.payload).min(last), frame.blob),
                Ok(None) => break,
                Err(err) => fatal(err),
            }
        }
    }
}

pub struct MemoryMidiOutput {
    writer: FrameWriter,
    block_frames: usize,
}

impl MidiOutputPort for MemoryMidiOutput {
    fn clear(&mut self, frames: usize) {
        self.block_frames = frames;
    }

    fn write_event(&mut self, frame: u32, message: &[u8]) -> bool {
        if frame as usize >= self.block_frames {
            return false;
        }
        self.writer
            .write(MIDI_EVENT, &frame.to_ne_bytes(), message)
            .is_ok()
    }
}

pub struct MidiOutputDrain {
    reader: FrameReader,
}

impl MidiOutputDrain {
    /// Pass every event written so far to `f`. Returns how many there were.
    pub fn drain(&mut self, mut f: impl FnMut(u32, &[u8])) -> Result<usize> {
        let mut count = 0;
        while let Some(frame) = self.reader.read()? {
            f(frame_offset(frame.payload), frame.blob);
            count += 1;
        }
        Ok(count)
    }
}

fn frame_offset(payload: &[u8]) -> u32 {
    let mut bytes = [0u8; 4];
    let n = payload.len().min(4);
    bytes[..n].copy_from_slice(&payload[..n]);
    u32::from_ne_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_input_delivers_events_clamped_to_the_block() {
        let (mut feeder, mut port) = memory_midi_input(1024).unwrap();
        assert!(feeder.send(3, &[0x90, 60, 100]));
        assert!(feeder.send(500, &[0x80, 60, 0]));

        let mut seen = Vec::new();
        port.read_events(64, &mut |frame, bytes| seen.push((frame, bytes.to_vec())));
        assert_eq!(seen, vec![(3, vec![0x90, 60, 100]), (63, vec![0x80, 60, 0])]);

        seen.clear();
        port.read_events(64, &mut |frame, bytes| seen.push((frame, bytes.to_vec())));
        assert!(seen.is_empty());
    }

    #[test]
    fn memory_output_rejects_events_past_the_block() {
        let (mut port, mut drain) = memory_midi_output(1024).unwrap();
        port.clear(32);
        assert!(port.write_event(0, &[0xB0, 7, 100]));
        assert!(!port.write_event(32, &[0xB0, 7, 0]));

        let mut seen = Vec::new();
        let count = drain.drain(|frame, bytes| seen.push((frame, bytes.to_vec()))).unwrap();
        assert_eq!(count, 1);
        assert_eq!(seen, vec![(0, vec![0xB0, 7, 100])]);
    }

    #[test]
    fn short_audio_input_is_truncated() {
        let mut port = MemoryAudioPort::with_samples(vec![1.0; 16]);
        assert_eq!(AudioInputPort::buffer(&mut port, 8).len(), 8);
        assert_eq!(AudioInputPort::buffer(&mut port, 64).len(), 16);
    }

    #[test]
    fn short_audio_output_only_exposes_its_samples() {
        let mut port = MemoryAudioPort::new(32);
        let out = AudioOutputPort::buffer_mut(&mut port, 64);
        assert_eq!(out.len(), 32);
        out.fill(0.25);
        assert!(port.samples().iter().all(|&s| s == 0.25));
    }

    #[test]
    fn midi_rings_must_hold_one_maximal_event() {
        assert!(memory_midi_input(MIN_MIDI_RING_CAPACITY - 1).is_err());
        assert!(memory_midi_output(MIN_MIDI_RING_CAPACITY - 1).is_err());

        let (mut feeder, mut port) = memory_midi_input(MIN_MIDI_RING_CAPACITY).unwrap();
        let sysex = vec![0xF0; 256];
        assert!(feeder.send(0, &sysex));
        let mut sizes = Vec::new();
        port.read_events(64, &mut |_, bytes| sizes.push(bytes.len()));
        assert_eq!(sizes, vec![sysex.len()]);
    }

    #[test]
    fn ports_coerce_to_trait_objects() {
        let port = Shared::new(MemoryAudioPort::new(8));
        let out: Shared<dyn AudioOutputPort> = port.clone().into();
        let out_again: Shared<dyn AudioOutputPort> = port.into();
        assert_eq!(out, out_again);
    }
}
