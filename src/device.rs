//! cpal output driver.
//!
//! [`CpalDevice`] discovers output devices; [`CpalDevice::start`] moves an
//! [`AudioProcessor`] into the device callback, runs it in fixed-size blocks
//! and interleaves the stereo bus into whatever buffer length the backend asks
//! for.
//!
//! ```no_run
//! use stagerack::{CpalDevice, Processor, ProcessorConfig};
//!
//! let device = CpalDevice::default_output().expect("no output device");
//! let config = ProcessorConfig::new(device.sample_rate());
//! let (mut main, audio) = Processor::new(config).unwrap();
//! let _stream = device.start(audio, 256).unwrap();
//!
//! loop {
//!     main.process_main_thread_messages();
//!     std::thread::sleep(std::time::Duration::from_millis(10));
//! }
//! ```

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, SupportedStreamConfig};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::processor::AudioProcessor;

/// A discovered audio output device.
pub struct CpalDevice {
    device: cpal::Device,
    config: SupportedStreamConfig,
    name: String,
}

impl CpalDevice {
    /// The system's default output device, if there is one.
    pub fn default_output() -> Option<Self> {
        let host = cpal::default_host();
        let device = host.default_output_device()?;
        Self::from_device(device).ok()
    }

    /// All output devices that report a default configuration.
    pub fn list_outputs() -> Vec<Self> {
        let host = cpal::default_host();
        host.output_devices()
            .map(|devices| {
                devices
                    .filter_map(|device| Self::from_device(device).ok())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn from_device(device: cpal::Device) -> Result<Self> {
        let config = device.default_output_config()?;
        let name = device.name().unwrap_or_else(|_| "Unknown".into());
        Ok(Self {
            device,
            config,
            name,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sample_rate(&self) -> u32 {
        self.config.sample_rate().0
    }

    pub fn channels(&self) -> u16 {
        self.config.channels()
    }

    /// Start playback, running `audio` in blocks of `block_size` frames.
    ///
    /// Audio stops when the returned stream is dropped.
    pub fn start(&self, audio: AudioProcessor, block_size: usize) -> Result<CpalStream> {
        let format = self.config.sample_format();
        if format != SampleFormat::F32 {
            return Err(Error::UnsupportedSampleFormat(format!("{format:?}")));
        }
        if block_size == 0 || block_size % 8 != 0 || block_size > audio.max_block_size() {
            return Err(Error::InvalidBlockSize {
                frames: block_size,
                max: audio.max_block_size(),
            });
        }

        let channels = self.config.channels() as usize;
        let stream_config = self.config.config();
        let mut blocks = BlockAdapter::new(audio, block_size);

        let stream = self.device.build_output_stream(
            &stream_config,
            move |data: &mut [f32], _| blocks.fill(data, channels),
            |err| warn!(error = %err, "cpal stream error"),
            None,
        )?;
        stream.play()?;
        debug!(
            device = %self.name,
            sample_rate = stream_config.sample_rate.0,
            channels,
            block_size,
            "output stream started"
        );
        Ok(CpalStream { _stream: stream })
    }
}

/// A running output stream.
pub struct CpalStream {
    _stream: cpal::Stream,
}

/// Runs the processor in fixed blocks regardless of the callback size.
struct BlockAdapter {
    audio: AudioProcessor,
    block_size: usize,
    position: usize,
}

impl BlockAdapter {
    fn new(audio: AudioProcessor, block_size: usize) -> Self {
        Self {
            audio,
            block_size,
            // forces a block on the first callback
            position: block_size,
        }
    }

    fn fill(&mut self, data: &mut [f32], channels: usize) {
        if channels == 0 {
            return;
        }
        for frame in data.chunks_mut(channels) {
            if self.position == self.block_size {
                self.audio.process(self.block_size);
                self.position = 0;
            }
            let (left, right) = self.audio.output();
            let (l, r) = (left[self.position], right[self.position]);
            match frame {
                [mono] => *mono = 0.5 * (l + r),
                [first, second, rest @ ..] => {
                    *first = l;
                    *second = r;
                    rest.fill(0.0);
                }
                [] => {}
            }
            self.position += 1;
        }
    }
}
