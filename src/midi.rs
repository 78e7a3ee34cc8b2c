//! Keyboard-to-plugin MIDI rewriting.

/// Result of routing one incoming MIDI message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Routed<'a> {
    /// Forward the original bytes.
    Unchanged(&'a [u8]),
    /// Forward the first `len` bytes of the rewritten message.
    Rewritten([u8; 3], usize),
    /// Transposed note fell outside `0..=127`.
    Dropped,
}

impl<'a> Routed<'a> {
    pub fn bytes(&self) -> Option<&[u8]> {
        match self {
            Routed::Unchanged(bytes) => Some(*bytes),
            Routed::Rewritten(bytes, len) => Some(&bytes[..*len]),
            Routed::Dropped => None,
        }
    }
}

const NOTE_OFF: u8 = 0x80;
const NOTE_ON: u8 = 0x90;
const POLY_PRESSURE: u8 = 0xA0;

/// Rewrite a keyboard message for its destination plugin.
///
/// Channel voice messages (`0x80..=0xEF`) get their channel replaced when
/// `channel` is set. Note-off, note-on and polyphonic pressure are shifted
/// by `transpose` semitones; a note that would leave the MIDI range is
/// dropped, never clamped. Everything else passes through.
pub fn route(message: &[u8], channel: Option<u8>, transpose: i8) -> Routed<'_> {
    let Some(&status) = message.first() else {
        return Routed::Unchanged(message);
    };
    if !(0x80..=0xEF).contains(&status) || message.len() > 3 {
        return Routed::Unchanged(message);
    }

    let kind = status & 0xF0;
    let shifts_note = matches!(kind, NOTE_OFF | NOTE_ON | POLY_PRESSURE) && message.len() >= 2;
    if channel.is_none() && (transpose == 0 || !shifts_note) {
        return Routed::Unchanged(message);
    }

    let mut out = [0u8; 3];
    out[..message.len()].copy_from_slice(message);
    if let Some(channel) = channel {
        out[0] = kind | (channel & 0x0F);
    }
    if shifts_note && transpose != 0 {
        let note = i16::from(out[1]) + i16::from(transpose);
        if !(0..=127).contains(&note) {
            return Routed::Dropped;
        }
        out[1] = note as u8;
    }
    Routed::Rewritten(out, message.len())
}
