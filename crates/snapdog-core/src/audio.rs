//! Global audio output format and the transcode chain handed to decoders.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub bit_depth: u8,
    pub channels: u8,
    /// Codec name Snapcast is configured with (informational here).
    pub codec: String,
    pub buffer_ms: u32,
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            bit_depth: 16,
            channels: 2,
            codec: "flac".to_string(),
            buffer_ms: 1000,
        }
    }
}

impl AudioFormat {
    /// PCM codec name for the transcode stage: bit depth 8 → `u8`, otherwise
    /// `s{depth}l` (signed little-endian).
    pub fn pcm_codec(&self) -> Result<&'static str> {
        match self.bit_depth {
            8 => Ok("u8"),
            16 => Ok("s16l"),
            24 => Ok("s24l"),
            32 => Ok("s32l"),
            other => Err(Error::config(
                "AUDIO_BIT_DEPTH",
                format!("unsupported bit depth {other} (8, 16, 24, 32)"),
            )),
        }
    }

    /// Stream-output chain for a decoder writing raw PCM into `sink`.
    /// `sout-all` keeps the pipe fed even when no reader is attached.
    pub fn sout_chain(&self, sink: &str) -> Result<String> {
        let codec = self.pcm_codec()?;
        Ok(format!(
            "#transcode{{acodec={codec},samplerate={rate},channels={ch}}}:std{{access=file,mux=raw,dst={sink}}}",
            rate = self.sample_rate,
            ch = self.channels,
        ))
    }
}
