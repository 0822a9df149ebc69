//! # PCM Format
//!
//! The bridge moves one audio format end to end, in both directions:
//! - **Sample Rate**: 48kHz (48,000 Hz)
//! - **Channels**: Mono (1 channel)
//! - **Encoding**: 16-bit signed little-endian integers, raw (no container)
//!
//! Nothing is negotiated per session. The browser client and both external
//! processes are configured for this format at startup.

use serde::Serialize;
use std::fmt;
use std::time::Duration;

/// Fixed sample rate of every stream the bridge handles.
pub const SAMPLE_RATE: u32 = 48_000;

/// Fixed channel count (mono).
pub const CHANNELS: u16 = 1;

/// Description of a raw PCM byte stream.
///
/// ## Rust Concepts:
/// - **Copy**: The struct is a few integers, so it is passed by value everywhere
/// - **const**: `BRIDGE` is built at compile time and never changes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PcmFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
}

impl PcmFormat {
    /// The process-wide format: 48kHz, mono, s16le.
    pub const BRIDGE: PcmFormat = PcmFormat {
        sample_rate: SAMPLE_RATE,
        channels: CHANNELS,
        bits_per_sample: 16,
    };

    /// Sample encoding name as understood by the PipeWire command line tools.
    pub fn sample_format_arg(&self) -> &'static str {
        match self.bits_per_sample {
            8 => "u8",
            24 => "s24",
            32 => "s32",
            _ => "s16",
        }
    }

    /// Bytes occupied by one sample frame (one sample per channel).
    pub fn bytes_per_frame(&self) -> usize {
        self.channels as usize * (self.bits_per_sample as usize / 8)
    }

    /// Playback duration represented by `bytes` of audio.
    ///
    /// Only used for logging; a chunk is not required to hold whole frames.
    pub fn duration_of(&self, bytes: usize) -> Duration {
        let bytes_per_second = self.sample_rate as u64 * self.bytes_per_frame() as u64;
        if bytes_per_second == 0 {
            return Duration::ZERO;
        }
        Duration::from_micros(bytes as u64 * 1_000_000 / bytes_per_second)
    }
}

impl fmt::Display for PcmFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}Hz/{}ch/{}le",
            self.sample_rate,
            self.channels,
            self.sample_format_arg()
        )
    }
}
