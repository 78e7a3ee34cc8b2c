//! Framed single-producer/single-consumer byte ring.
//!
//! Frames are variable-length and laid out as
//!
//! ```text
//! [u32 payload_size][u32 kind][u32 blob_len][payload ...][blob ...]
//!                   \_ hdr _/ \_________ payload_size __________/
//! ```
//!
//! `payload_size` counts the `blob_len` word plus the typed payload, the blob
//! follows it. A frame becomes visible to the reader in a single commit, so the
//! reader never observes half a frame. Anything else is a desynchronized pair
//! and is reported as [`Error::RingCorrupted`].

use rtrb::{Consumer, Producer, RingBuffer};

use crate::error::{Error, Result};

/// Size of the two leading header words.
pub const HEADER_SIZE: usize = 2 * core::mem::size_of::<u32>();

const BLOB_LEN_SIZE: usize = core::mem::size_of::<u32>();

/// Create a ring of `capacity` bytes whose frames carry at most
/// `max_frame` bytes of payload plus blob.
pub fn frame_ring(capacity: usize, max_frame: usize) -> Result<(FrameWriter, FrameReader)> {
    let required = max_frame.max(BLOB_LEN_SIZE) + HEADER_SIZE;
    if capacity < required {
        return Err(Error::CapacityTooSmall { capacity, required });
    }

    let (producer, consumer) = RingBuffer::new(capacity);
    let writer = FrameWriter {
        producer,
        max_frame,
    };
    let reader = FrameReader {
        consumer,
        max_frame,
        scratch: vec![0; max_frame.max(BLOB_LEN_SIZE)].into_boxed_slice(),
    };
    Ok((writer, reader))
}

/// One frame as seen by the reader. Borrows the reader's scratch buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Frame<'a> {
    pub kind: u32,
    pub payload: &'a [u8],
    pub blob: &'a [u8],
}

/// The producing half of a frame ring.
pub struct FrameWriter {
    producer: Producer<u8>,
    max_frame: usize,
}

impl FrameWriter {
    /// Append one frame, or nothing at all.
    ///
    /// Fails with [`Error::FrameTooLarge`] if the body can never fit and with
    /// [`Error::RingFull`] if it does not fit right now. Neither failure
    /// touches the ring.
    pub fn write(&mut self, kind: u32, payload: &[u8], blob: &[u8]) -> Result<()> {
        let payload_size = BLOB_LEN_SIZE + payload.len();
        let body = payload_size + blob.len();
        if body > self.max_frame {
            return Err(Error::FrameTooLarge {
                size: body,
                max: self.max_frame,
            });
        }

        let total = HEADER_SIZE + body;
        let available = self.producer.slots();
        let mut chunk = self
            .producer
            .write_chunk(total)
            .map_err(|_| Error::RingFull {
                needed: total,
                available,
            })?;

        {
            let (first, second) = chunk.as_mut_slices();
            let mut out = SplitWriter::new(first, second);
            out.put(&(payload_size as u32).to_ne_bytes());
            out.put(&kind.to_ne_bytes());
            out.put(&(blob.len() as u32).to_ne_bytes());
            out.put(payload);
            out.put(blob);
        }
        chunk.commit_all();
        Ok(())
    }

    /// Bytes currently free for writing.
    #[inline]
    pub fn free_space(&self) -> usize {
        self.producer.slots()
    }

    #[inline]
    pub fn max_frame(&self) -> usize {
        self.max_frame
    }

    /// Bytes a frame with the given payload and blob occupies in the ring.
    #[inline]
    pub fn frame_size(payload_len: usize, blob_len: usize) -> usize {
        HEADER_SIZE + BLOB_LEN_SIZE + payload_len + blob_len
    }
}

/// The consuming half of a frame ring.
pub struct FrameReader {
    consumer: Consumer<u8>,
    max_frame: usize,
    /// Sized once at construction, frames are copied here before parsing
    scratch: Box<[u8]>,
}

impl FrameReader {
    /// Take the next frame off the ring.
    ///
    /// Returns `Ok(None)` when fewer than a header's worth of bytes are
    /// available. Any inconsistency between header and available bytes is a
    /// corruption error, there is no way to resynchronize a byte stream.
    pub fn read(&mut self) -> Result<Option<Frame<'_>>> {
        let available = self.consumer.slots();
        if available < HEADER_SIZE {
            return Ok(None);
        }

        let chunk = self
            .consumer
            .read_chunk(available)
            .map_err(|_| Error::RingCorrupted("readable bytes vanished"))?;

        let (first, second) = chunk.as_slices();
        let payload_size = read_u32(first, second, 0) as usize;
        let kind = read_u32(first, second, BLOB_LEN_SIZE);

        if payload_size < BLOB_LEN_SIZE || payload_size > self.max_frame {
            return Err(Error::RingCorrupted("payload size out of range"));
        }
        if available < HEADER_SIZE + payload_size {
            return Err(Error::RingCorrupted("frame header without payload"));
        }

        let blob_len = read_u32(first, second, HEADER_SIZE) as usize;
        let body = payload_size + blob_len;
        if body > self.max_frame {
            return Err(Error::RingCorrupted("blob size exceeds maximum packet size"));
        }
        if available < HEADER_SIZE + body {
            return Err(Error::RingCorrupted("declared blob size overruns the ring"));
        }

        copy_out(first, second, HEADER_SIZE, &mut self.scratch[..body]);
        chunk.commit(HEADER_SIZE + body);

        Ok(Some(Frame {
            kind,
            payload: &self.scratch[BLOB_LEN_SIZE..payload_size],
            blob: &self.scratch[payload_size..body],
        }))
    }

    /// Bytes waiting to be read.
    #[inline]
    pub fn pending(&self) -> usize {
        self.consumer.slots()
    }

    #[inline]
    pub fn max_frame(&self) -> usize {
        self.max_frame
    }
}

/// Writes a contiguous byte stream across the two halves of a wrapped chunk.
struct SplitWriter<'a> {
    first: &'a mut [u8],
    second: &'a mut [u8],
    pos: usize,
}

impl<'a> SplitWriter<'a> {
    fn new(first: &'a mut [u8], second: &'a mut [u8]) -> Self {
        Self { first, second, pos: 0 }
    }

    fn put(&mut self, mut bytes: &[u8]) {
        if self.pos < self.first.len() {
            let n = bytes.len().min(self.first.len() - self.pos);
            self.first[self.pos..self.pos + n].copy_from_slice(&bytes[..n]);
            self.pos += n;
            bytes = &bytes[n..];
        }
        if !bytes.is_empty() {
            let start = self.pos - self.first.len();
            self.second[start..start + bytes.len()].copy_from_slice(bytes);
            self.pos += bytes.len();
        }
    }
}

fn copy_out(first: &[u8], second: &[u8], offset: usize, dst: &mut [u8]) {
    let mut copied = 0;
    if offset < first.len() {
        copied = dst.len().min(first.len() - offset);
        dst[..copied].copy_from_slice(&first[offset..offset + copied]);
    }
    if copied < dst.len() {
        let start = offset + copied - first.len();
        let rest = dst.len() - copied;
        dst[copied..].copy_from_slice(&second[start..start + rest]);
    }
}

fn read_u32(first: &[u8], second: &[u8], offset: usize) -> u32 {
    let mut bytes = [0u8; 4];
    copy_out(first, second, offset, &mut bytes);
    u32::from_ne_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn capacity_must_hold_header_and_maximal_body() {
        assert!(matches!(
            frame_ring(63, 56),
            Err(Error::CapacityTooSmall { capacity: 63, required: 64 })
        ));
        assert!(frame_ring(64, 56).is_ok());
    }

    #[test]
    fn frame_round_trip_keeps_payload_and_blob() {
        let (mut writer, mut reader) = frame_ring(256, 64).unwrap();
        writer.write(7, &[1, 2, 3, 4], &[0x90, 60, 100]).unwrap();

        let frame = reader.read().unwrap().unwrap();
        assert_eq!(frame.kind, 7);
        assert_eq!(frame.payload, &[1, 2, 3, 4]);
        assert_eq!(frame.blob, &[0x90, 60, 100]);
        assert!(reader.read().unwrap().is_none());
    }

    #[test]
    fn oversized_frame_is_rejected_before_touching_the_ring() {
        let (mut writer, reader) = frame_ring(256, 16).unwrap();
        let free = writer.free_space();

        let err = writer.write(1, &[0; 8], &[0; 8]).unwrap_err();
        assert!(matches!(err, Error::FrameTooLarge { size: 20, max: 16 }));
        assert_eq!(writer.free_space(), free);
        assert_eq!(reader.pending(), 0);
    }

    #[test]
    fn full_ring_rejects_the_whole_frame() {
        let (mut writer, mut reader) = frame_ring(40, 24).unwrap();
        writer.write(1, &[], &[0xAA; 20]).unwrap();
        assert!(matches!(
            writer.write(2, &[], &[0xBB; 4]),
            Err(Error::RingFull { needed: 16, available: 8 })
        ));

        // Only the first frame is visible, intact.
        let frame = reader.read().unwrap().unwrap();
        assert_eq!(frame.kind, 1);
        assert_eq!(frame.blob.len(), 20);
        assert!(reader.read().unwrap().is_none());

        writer.write(2, &[], &[0xBB; 4]).unwrap();
        assert_eq!(reader.read().unwrap().unwrap().blob, &[0xBB; 4]);
    }

    #[test]
    fn frames_survive_wrap_around() {
        let (mut writer, mut reader) = frame_ring(50, 32).unwrap();
        for round in 0..100u32 {
            let blob: Vec<u8> = (0..(round % 13) as u8).collect();
            writer.write(round, &round.to_ne_bytes(), &blob).unwrap();
            let frame = reader.read().unwrap().unwrap();
            assert_eq!(frame.kind, round);
            assert_eq!(frame.payload, &round.to_ne_bytes());
            assert_eq!(frame.blob, blob.as_slice());
        }
    }

    #[test]
    fn short_read_is_empty() {
        let (mut producer, consumer) = RingBuffer::new(64);
        let mut reader = FrameReader {
            consumer,
            max_frame: 32,
            scratch: vec![0; 32].into_boxed_slice(),
        };
        for byte in [1u8, 0, 0, 0] {
            producer.push(byte).unwrap();
        }
        assert!(reader.read().unwrap().is_none());
    }

    #[test]
    fn blob_size_mismatch_is_corruption() {
        let (mut producer, consumer) = RingBuffer::new(64);
        let mut reader = FrameReader {
            consumer,
            max_frame: 32,
            scratch: vec![0; 32].into_boxed_slice(),
        };
        // Header claims a 10 byte blob that was never written.
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&4u32.to_ne_bytes());
        bytes.extend_from_slice(&1u32.to_ne_bytes());
        bytes.extend_from_slice(&10u32.to_ne_bytes());
        for byte in bytes {
            producer.push(byte).unwrap();
        }
        assert!(matches!(reader.read(), Err(Error::RingCorrupted(_))));
    }

    #[test]
    fn oversized_header_is_corruption() {
        let (mut producer, consumer) = RingBuffer::new(64);
        let mut reader = FrameReader {
            consumer,
            max_frame: 16,
            scratch: vec![0; 16].into_boxed_slice(),
        };
        for byte in 40u32.to_ne_bytes().iter().chain(&1u32.to_ne_bytes()) {
            producer.push(*byte).unwrap();
        }
        assert!(matches!(reader.read(), Err(Error::RingCorrupted(_))));
    }

    proptest! {
        #[test]
        fn frames_come_out_in_write_order(blobs in prop::collection::vec(
            prop::collection::vec(any::<u8>(), 0..40), 1..30)
        ) {
            let (mut writer, mut reader) = frame_ring(4096, 64).unwrap();
            for (i, blob) in blobs.iter().enumerate() {
                writer.write(i as u32, &[], blob).unwrap();
            }
            for (i, blob) in blobs.iter().enumerate() {
                let frame = reader.read().unwrap().unwrap();
                prop_assert_eq!(frame.kind, i as u32);
                prop_assert_eq!(frame.blob, blob.as_slice());
            }
            prop_assert!(reader.read().unwrap().is_none());
        }
    }
}
