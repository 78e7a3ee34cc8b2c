//! Timestamped event sequences for atom/event ports.

/// Type id of a raw MIDI message inside an [`EventBuffer`].
pub const MIDI_EVENT: u32 = 1;

const EVENT_HEADER: usize = 3 * core::mem::size_of::<u32>();

/// One event as stored in an [`EventBuffer`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AtomEvent<'a> {
    /// Frame offset inside the current block
    pub frame: u32,
    pub type_id: u32,
    pub data: &'a [u8],
}

/// A byte arena of `(frame, type_id, size, bytes)` records.
///
/// The arena is allocated once; [`push`](Self::push) refuses events that do
/// not fit instead of growing, so it is safe to fill from the audio thread.
/// Events are kept in insertion order.
#[derive(Debug, PartialEq)]
pub struct EventBuffer {
    bytes: Vec<u8>,
    capacity: usize,
}

impl EventBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            bytes: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Append an event. Returns `false` if the arena has no room left.
    pub fn push(&mut self, frame: u32, type_id: u32, data: &[u8]) -> bool {
        let needed = EVENT_HEADER + data.len();
        if self.bytes.len() + needed > self.capacity {
            return false;
        }
        self.bytes.extend_from_slice(&frame.to_ne_bytes());
        self.bytes.extend_from_slice(&type_id.to_ne_bytes());
        self.bytes.extend_from_slice(&(data.len() as u32).to_ne_bytes());
        self.bytes.extend_from_slice(data);
        true
    }

    pub fn push_midi(&mut self, frame: u32, message: &[u8]) -> bool {
        self.push(frame, MIDI_EVENT, message)
    }

    pub fn iter(&self) -> Events<'_> {
        Events { rest: &self.bytes }
    }

    pub fn clear(&mut self) {
        self.bytes.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Arena size in bytes, headers included.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

// A clone reserves the whole arena, so it stays allocation free too.
impl Clone for EventBuffer {
    fn clone(&self) -> Self {
        let mut bytes = Vec::with_capacity(self.capacity);
        bytes.extend_from_slice(&self.bytes);
        Self {
            bytes,
            capacity: self.capacity,
        }
    }
}

/// Iterator over the events of an [`EventBuffer`].
pub struct Events<'a> {
    rest: &'a [u8],
}

impl<'a> Iterator for Events<'a> {
    type Item = AtomEvent<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let bytes = self.rest;
        if bytes.len() < EVENT_HEADER {
            return None;
        }
        let word = |i: usize| {
            let mut b = [0u8; 4];
            b.copy_from_slice(&bytes[i * 4..i * 4 + 4]);
            u32::from_ne_bytes(b)
        };
        let frame = word(0);
        let type_id = word(1);
        let size = word(2) as usize;
        let (data, rest) = bytes[EVENT_HEADER..].split_at(size);
        self.rest = rest;
        Some(AtomEvent {
            frame,
            type_id,
            data,
        })
    }
}
