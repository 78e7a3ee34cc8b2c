//! The message set exchanged between the main and the audio thread.
//!
//! Every [`Packet`] travels as one ring frame: the frame kind is the packet
//! tag, the typed payload holds the fixed fields and the blob carries MIDI or
//! atom bytes. Packets owning heap objects ([`Packet::SetData`] and
//! [`Packet::AsyncFunction`]) move that ownership through the ring as a raw
//! pointer; only a [`PacketWriter`] can produce such a frame and only the
//! paired [`PacketReader`] can turn it back into an owned value.

use std::fmt;
use std::sync::Arc;

use crate::data::{Data, PortId};
use crate::deferred::{DeferredFn, Pending};
use crate::error::{Error, Result};
use crate::plugin::{InstanceId, PortRef};
use crate::ring::{frame_ring, FrameReader, FrameWriter};

const SET_DATA: u32 = 1;
const CONTROL_VALUE_CHANGED: u32 = 2;
const ATOM_PORT_EVENT: u32 = 3;
const AUX_MIDI_OUT: u32 = 4;
const AUX_MIDI_IN: u32 = 5;
const MIDI_TO_PLUGIN: u32 = 6;
const ASYNC_FUNCTION: u32 = 7;
const OUTPUT_LEVEL_UPDATE: u32 = 8;

/// A message between the two threads.
///
/// Blob-carrying variants borrow their bytes: from the caller when sending,
/// from the reader's scratch buffer when receiving.
pub enum Packet<'a> {
    /// main → audio: start using this snapshot with the next block.
    SetData(Arc<Data>),
    /// both ways: a control port's value.
    ControlValueChanged { port: PortRef, value: f32 },
    /// both ways: one event for or from an atom port.
    AtomPortEvent {
        port: PortRef,
        frame: u32,
        type_id: u32,
        data: &'a [u8],
    },
    /// main → audio: raw MIDI for an auxiliary output port.
    AuxMidiOut { port: PortId, data: &'a [u8] },
    /// audio → main: raw MIDI received on an auxiliary input port.
    AuxMidiIn {
        port: PortId,
        frame: u32,
        data: &'a [u8],
    },
    /// main → audio: raw MIDI for a plugin's MIDI input.
    MidiToPlugin { instance: InstanceId, data: &'a [u8] },
    /// both ways: a deferred-destruction token on its round trip.
    AsyncFunction(DeferredFn),
    /// audio → main: filtered output power.
    OutputLevelUpdate { level: f32 },
}

impl<'a> Packet<'a> {
    pub fn name(&self) -> &'static str {
        match self {
            Packet::SetData(_) => "SetData",
            Packet::ControlValueChanged { .. } => "ControlValueChanged",
            Packet::AtomPortEvent { .. } => "AtomPortEvent",
            Packet::AuxMidiOut { .. } => "AuxMidiOut",
            Packet::AuxMidiIn { .. } => "AuxMidiIn",
            Packet::MidiToPlugin { .. } => "MidiToPlugin",
            Packet::AsyncFunction(_) => "AsyncFunction",
            Packet::OutputLevelUpdate { .. } => "OutputLevelUpdate",
        }
    }

    /// Whether losing this packet would break an ownership or ordering
    /// guarantee, as opposed to dropping a best-effort message.
    pub fn is_critical(&self) -> bool {
        matches!(self, Packet::SetData(_) | Packet::AsyncFunction(_))
    }

    fn blob(&self) -> &[u8] {
        match self {
            Packet::AtomPortEvent { data, .. }
            | Packet::AuxMidiOut { data, .. }
            | Packet::AuxMidiIn { data, .. }
            | Packet::MidiToPlugin { data, .. } => *data,
            _ => &[],
        }
    }

    fn encode(&self) -> (u32, Payload) {
        let payload = Payload::default();
        match self {
            Packet::SetData(data) => (SET_DATA, payload.ptr(Arc::as_ptr(data))),
            Packet::ControlValueChanged { port, value } => (
                CONTROL_VALUE_CHANGED,
                payload.port(*port).f32(*value),
            ),
            Packet::AtomPortEvent {
                port,
                frame,
                type_id,
                ..
            } => (
                ATOM_PORT_EVENT,
                payload.port(*port).u32(*frame).u32(*type_id),
            ),
            Packet::AuxMidiOut { port, .. } => (AUX_MIDI_OUT, payload.u32(port.0)),
            Packet::AuxMidiIn { port, frame, .. } => {
                (AUX_MIDI_IN, payload.u32(port.0).u32(*frame))
            }
            Packet::MidiToPlugin { instance, .. } => (MIDI_TO_PLUGIN, payload.u32(instance.0)),
            Packet::AsyncFunction(token) => (ASYNC_FUNCTION, payload.ptr(token.as_ptr())),
            Packet::OutputLevelUpdate { level } => (OUTPUT_LEVEL_UPDATE, payload.f32(*level)),
        }
    }

    /// The frame now owns whatever this packet owned.
    fn release(self) {
        match self {
            Packet::SetData(data) => {
                let _ = Arc::into_raw(data);
            }
            Packet::AsyncFunction(token) => {
                let _ = token.into_raw();
            }
            _ => {}
        }
    }

    /// # Safety
    ///
    /// The frame holding `payload` must have been written by
    /// [`PacketWriter::send`] and must be decoded at most once.
    unsafe fn decode(kind: u32, payload: &[u8], blob: &'a [u8]) -> Result<Self> {
        Ok(match kind {
            SET_DATA => {
                let mut fields = Fields::new("SetData", payload, 8)?;
                Packet::SetData(Arc::from_raw(fields.u64() as usize as *const Data))
            }
            CONTROL_VALUE_CHANGED => {
                let mut fields = Fields::new("ControlValueChanged", payload, 12)?;
                Packet::ControlValueChanged {
                    port: fields.port(),
                    value: fields.f32(),
                }
            }
            ATOM_PORT_EVENT => {
                let mut fields = Fields::new("AtomPortEvent", payload, 16)?;
                Packet::AtomPortEvent {
                    port: fields.port(),
                    frame: fields.u32(),
                    type_id: fields.u32(),
                    data: blob,
                }
            }
            AUX_MIDI_OUT => {
                let mut fields = Fields::new("AuxMidiOut", payload, 4)?;
                Packet::AuxMidiOut {
                    port: PortId(fields.u32()),
                    data: blob,
                }
            }
            AUX_MIDI_IN => {
                let mut fields = Fields::new("AuxMidiIn", payload, 8)?;
                Packet::AuxMidiIn {
                    port: PortId(fields.u32()),
                    frame: fields.u32(),
                    data: blob,
                }
            }
            MIDI_TO_PLUGIN => {
                let mut fields = Fields::new("MidiToPlugin", payload, 4)?;
                Packet::MidiToPlugin {
                    instance: InstanceId(fields.u32()),
                    data: blob,
                }
            }
            ASYNC_FUNCTION => {
                let mut fields = Fields::new("AsyncFunction", payload, 8)?;
                Packet::AsyncFunction(DeferredFn::from_raw(fields.u64() as usize as *mut Pending))
            }
            OUTPUT_LEVEL_UPDATE => {
                let mut fields = Fields::new("OutputLevelUpdate", payload, 4)?;
                Packet::OutputLevelUpdate {
                    level: fields.f32(),
                }
            }
            other => return Err(Error::UnknownPacket(other)),
        })
    }
}

impl fmt::Debug for Packet<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Packet::SetData(data) => f.debug_tuple("SetData").field(&Arc::as_ptr(data)).finish(),
            Packet::ControlValueChanged { port, value } => f
                .debug_struct("ControlValueChanged")
                .field("port", port)
                .field("value", value)
                .finish(),
            Packet::AtomPortEvent {
                port,
                frame,
                type_id,
                data,
            } => f
                .debug_struct("AtomPortEvent")
                .field("port", port)
                .field("frame", frame)
                .field("type_id", type_id)
                .field("len", &data.len())
                .finish(),
            Packet::AuxMidiOut { port, data } => f
                .debug_struct("AuxMidiOut")
                .field("port", port)
                .field("data", data)
                .finish(),
            Packet::AuxMidiIn { port, frame, data } => f
                .debug_struct("AuxMidiIn")
                .field("port", port)
                .field("frame", frame)
                .field("data", data)
                .finish(),
            Packet::MidiToPlugin { instance, data } => f
                .debug_struct("MidiToPlugin")
                .field("instance", instance)
                .field("data", data)
                .finish(),
            Packet::AsyncFunction(token) => f.debug_tuple("AsyncFunction").field(token).finish(),
            Packet::OutputLevelUpdate { level } => f
                .debug_struct("OutputLevelUpdate")
                .field("level", level)
                .finish(),
        }
    }
}

/// Why [`PacketWriter::send`] gave a packet back.
#[derive(Debug)]
pub enum SendError<'a> {
    /// Not enough free space right now; retry later or drop it.
    Full(Packet<'a>),
    /// The packet can never be sent, e.g. its blob exceeds the packet size.
    Rejected(Error, Packet<'a>),
}

impl<'a> SendError<'a> {
    pub fn into_packet(self) -> Packet<'a> {
        match self {
            SendError::Full(packet) | SendError::Rejected(_, packet) => packet,
        }
    }
}

/// Create the two ends of one direction of the protocol.
pub fn packet_channel(capacity: usize, max_packet_size: usize) -> Result<(PacketWriter, PacketReader)> {
    let (writer, reader) = frame_ring(capacity, max_packet_size)?;
    Ok((PacketWriter { frames: writer }, PacketReader { frames: reader }))
}

/// Sending end. Never blocks and never allocates.
pub struct PacketWriter {
    frames: FrameWriter,
}

impl PacketWriter {
    /// Send `packet`, or hand it back untouched.
    pub fn send<'a>(&mut self, packet: Packet<'a>) -> core::result::Result<(), SendError<'a>> {
        let (kind, payload) = packet.encode();
        match self.frames.write(kind, payload.as_slice(), packet.blob()) {
            Ok(()) => {
                packet.release();
                Ok(())
            }
            Err(Error::RingFull { .. }) => Err(SendError::Full(packet)),
            Err(err) => Err(SendError::Rejected(err, packet)),
        }
    }

    pub fn free_space(&self) -> usize {
        self.frames.free_space()
    }
}

/// Receiving end.
pub struct PacketReader {
    frames: FrameReader,
}

impl PacketReader {
    /// Next packet, `Ok(None)` when the ring is drained.
    ///
    /// Errors mean the ring can no longer be trusted and are always fatal.
    pub fn recv(&mut self) -> Result<Option<Packet<'_>>> {
        let Some(frame) = self.frames.read()? else {
            return Ok(None);
        };
        // SAFETY: frames only come from the paired `PacketWriter::send`, and
        // `read` advances past this frame so it is decoded exactly once.
        unsafe { Packet::decode(frame.kind, frame.payload, frame.blob).map(Some) }
    }

    pub fn is_empty(&self) -> bool {
        self.frames.pending() == 0
    }
}

impl Drop for PacketReader {
    fn drop(&mut self) {
        // Reclaim anything still owned by in-flight frames.
        while let Ok(Some(packet)) = self.recv() {
            drop(packet);
        }
    }
}

const MAX_PAYLOAD: usize = 16;

#[derive(Default)]
struct Payload {
    bytes: [u8; MAX_PAYLOAD],
    len: usize,
}

impl Payload {
    fn put(mut self, bytes: &[u8]) -> Self {
        self.bytes[self.len..self.len + bytes.len()].copy_from_slice(bytes);
        self.len += bytes.len();
        self
    }

    fn u32(self, value: u32) -> Self {
        self.put(&value.to_ne_bytes())
    }

    fn f32(self, value: f32) -> Self {
        self.put(&value.to_ne_bytes())
    }

    fn ptr<T>(self, ptr: *const T) -> Self {
        self.put(&(ptr as usize as u64).to_ne_bytes())
    }

    fn port(self, port: PortRef) -> Self {
        self.u32(port.instance.0).u32(port.port)
    }

    fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.len]
    }
}

struct Fields<'a> {
    rest: &'a [u8],
}

impl<'a> Fields<'a> {
    fn new(kind: &'static str, payload: &'a [u8], expected: usize) -> Result<Self> {
        if payload.len() != expected {
            return Err(Error::MalformedPacket {
                kind,
                expected,
                found: payload.len(),
            });
        }
        Ok(Self { rest: payload })
    }

    fn take<const N: usize>(&mut self) -> [u8; N] {
        let (head, rest) = self.rest.split_at(N);
        self.rest = rest;
        let mut bytes = [0u8; N];
        bytes.copy_from_slice(head);
        bytes
    }

    fn u32(&mut self) -> u32 {
        u32::from_ne_bytes(self.take())
    }

    fn u64(&mut self) -> u64 {
        u64::from_ne_bytes(self.take())
    }

    fn f32(&mut self) -> f32 {
        f32::from_ne_bytes(self.take())
    }

    fn port(&mut self) -> PortRef {
        PortRef::new(InstanceId(self.u32()), self.u32())
    }
}
