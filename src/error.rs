//! Error types for the real-time core.

use thiserror::Error;

/// Error type for ring, protocol and pipeline operations.
#[derive(Error, Debug)]
pub enum Error {
    #[error("ring capacity {capacity} is smaller than the required {required} bytes")]
    CapacityTooSmall { capacity: usize, required: usize },

    #[error("frame body of {size} bytes exceeds the maximum packet size of {max} bytes")]
    FrameTooLarge { size: usize, max: usize },

    #[error("ring buffer full: {needed} bytes needed, {available} free")]
    RingFull { needed: usize, available: usize },

    #[error("ring buffer corrupted: {0}")]
    RingCorrupted(&'static str),

    #[error("unknown packet kind {0}")]
    UnknownPacket(u32),

    #[error("malformed {kind} packet: expected {expected} payload bytes, found {found}")]
    MalformedPacket {
        kind: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("invalid block size {frames}: must be a multiple of 8 and at most {max}")]
    InvalidBlockSize { frames: usize, max: usize },

    #[error("deferred function buffer exhausted ({capacity} tokens in flight)")]
    DeferredOverflow { capacity: usize },

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("invalid snapshot: {0}")]
    InvalidData(String),

    #[error("failed to spawn worker thread")]
    WorkerSpawn(#[source] std::io::Error),

    #[cfg(feature = "cpal_sink")]
    #[error("audio device not available")]
    DeviceNotAvailable(#[from] cpal::DefaultStreamConfigError),

    #[cfg(feature = "cpal_sink")]
    #[error("failed to build audio stream")]
    BuildStream(#[from] cpal::BuildStreamError),

    #[cfg(feature = "cpal_sink")]
    #[error("failed to play audio stream")]
    PlayStream(#[from] cpal::PlayStreamError),

    #[cfg(feature = "cpal_sink")]
    #[error("unsupported sample format {0}")]
    UnsupportedSampleFormat(String),
}

impl Error {
    /// Whether this error means the two threads can no longer trust each other.
    ///
    /// Fatal errors terminate the audio path; everything else is reported to
    /// the caller, which may drop the affected message and carry on.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::CapacityTooSmall { .. }
                | Error::FrameTooLarge { .. }
                | Error::RingCorrupted(_)
                | Error::UnknownPacket(_)
                | Error::MalformedPacket { .. }
                | Error::InvalidBlockSize { .. }
                | Error::DeferredOverflow { .. }
        )
    }
}

/// Result type alias.
pub type Result<T> = core::result::Result<T, Error>;

/// Terminates the audio path.
///
/// The release profile aborts on panic, so this never unwinds through a
/// device callback in production builds.
#[cold]
#[inline(never)]
pub(crate) fn fatal(err: Error) -> ! {
    tracing::error!(error = %err, "unrecoverable real-time failure");
    panic!("{}", err);
}
