//! Processor and worker configuration.

use std::time::Duration;

use crate::error::{Error, Result};
use crate::ring::HEADER_SIZE;

/// Blob length word plus the widest typed payload.
const MIN_PACKET_SIZE: usize = 4 + 16;

/// Sizing and timing for a [`Processor`](crate::Processor) pair.
///
/// Built with the `with_*` methods:
///
/// ```
/// use stagerack::ProcessorConfig;
///
/// let config = ProcessorConfig::new(48_000)
///     .with_max_block_size(256)
///     .with_deferred_capacity(64);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Clone, Debug, PartialEq)]
pub struct ProcessorConfig {
    /// Sample rate of the audio callback in Hz
    pub sample_rate: u32,
    /// Largest `nframes` the audio callback will ever pass (multiple of 8)
    pub max_block_size: usize,
    /// Byte capacity of each of the two rings
    pub ring_capacity: usize,
    /// Largest frame body (payload + blob) either ring accepts
    pub max_packet_size: usize,
    /// Deferred-destruction tokens the audio thread can hold in one block
    pub deferred_capacity: usize,
    /// Level meter updates per second
    pub meter_update_hz: u32,
}

impl ProcessorConfig {
    /// Defaults sized for a handful of plugins at typical block sizes.
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            max_block_size: 1024,
            ring_capacity: 64 * 1024,
            max_packet_size: 4096,
            deferred_capacity: 400,
            meter_update_hz: 30,
        }
    }

    pub fn with_max_block_size(mut self, frames: usize) -> Self {
        self.max_block_size = frames;
        self
    }

    pub fn with_ring_capacity(mut self, bytes: usize) -> Self {
        self.ring_capacity = bytes;
        self
    }

    pub fn with_max_packet_size(mut self, bytes: usize) -> Self {
        self.max_packet_size = bytes;
        self
    }

    /// Size this from the expected churn: topology swaps per second times
    /// the round-trip latency in blocks, with generous headroom.
    pub fn with_deferred_capacity(mut self, tokens: usize) -> Self {
        self.deferred_capacity = tokens;
        self
    }

    pub fn with_meter_update_hz(mut self, hz: u32) -> Self {
        self.meter_update_hz = hz;
        self
    }

    /// Samples between two `OutputLevelUpdate` packets.
    pub fn samples_per_meter_update(&self) -> usize {
        (self.sample_rate / self.meter_update_hz.max(1)).max(1) as usize
    }

    pub fn validate(&self) -> Result<()> {
        if self.sample_rate == 0 {
            return Err(Error::InvalidConfig("sample rate must be non-zero".into()));
        }
        if self.max_block_size == 0 || self.max_block_size % 8 != 0 {
            return Err(Error::InvalidConfig(format!(
                "max block size {} must be a non-zero multiple of 8",
                self.max_block_size
            )));
        }
        if self.max_packet_size < MIN_PACKET_SIZE {
            return Err(Error::InvalidConfig(format!(
                "max packet size {} cannot hold the largest fixed payload ({} bytes)",
                self.max_packet_size, MIN_PACKET_SIZE
            )));
        }
        if self.ring_capacity < self.max_packet_size + HEADER_SIZE {
            return Err(Error::CapacityTooSmall {
                capacity: self.ring_capacity,
                required: self.max_packet_size + HEADER_SIZE,
            });
        }
        if self.deferred_capacity == 0 {
            return Err(Error::InvalidConfig("deferred capacity must be non-zero".into()));
        }
        if self.meter_update_hz == 0 || self.meter_update_hz > self.sample_rate {
            return Err(Error::InvalidConfig(format!(
                "meter update rate {} Hz is out of range",
                self.meter_update_hz
            )));
        }
        Ok(())
    }
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self::new(48_000)
    }
}

/// Sizing for a background worker bridge.
#[derive(Clone, Debug, PartialEq)]
pub struct WorkerConfig {
    /// Thread name shown in debuggers and profilers
    pub name: String,
    /// Byte capacity of the request ring (audio → worker)
    pub request_capacity: usize,
    /// Byte capacity of the response ring (worker → audio)
    pub response_capacity: usize,
    /// Largest single request or response
    pub max_message_size: usize,
    /// How long an idle worker sleeps before re-checking its ring
    pub idle_timeout: Duration,
}

impl WorkerConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            request_capacity: 16 * 1024,
            response_capacity: 16 * 1024,
            max_message_size: 1024,
            idle_timeout: Duration::from_millis(50),
        }
    }

    pub fn with_request_capacity(mut self, bytes: usize) -> Self {
        self.request_capacity = bytes;
        self
    }

    pub fn with_response_capacity(mut self, bytes: usize) -> Self {
        self.response_capacity = bytes;
        self
    }

    pub fn with_max_message_size(mut self, bytes: usize) -> Self {
        self.max_message_size = bytes;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self::new("stagerack-worker")
    }
}
