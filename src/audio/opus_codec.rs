//! Opus packet decoder for `audio/opus` payloads.
//!
//! Each payload is one raw Opus packet. libopus decodes directly at any of
//! its native rates, so no resampling happens here; the playback sink opens
//! the device at the decoded rate.

use anyhow::Result;

use super::stream_decoder::{DecodeError, DecodedAudio, StreamDecoder};

// ======================== Opus Decoder ========================

pub struct OpusDecoder {
    decoder: opus::Decoder,
    sample_rate: u32,
    channels: u16,
}

impl OpusDecoder {
    /// * `sample_rate` - 8000, 12000, 16000, 24000 or 48000
    /// * `channels`    - 1 or 2
    pub fn new(sample_rate: u32, channels: u16) -> Result<Self> {
        let opus_channels = match channels {
            1 => opus::Channels::Mono,
            2 => opus::Channels::Stereo,
            other => anyhow::bail!("Opus supports 1 or 2 channels, got {}", other),
        };
        let decoder = opus::Decoder::new(sample_rate, opus_channels)?;
        Ok(Self {
            decoder,
            sample_rate,
            channels,
        })
    }
}

impl StreamDecoder for OpusDecoder {
    fn decode(&mut self, data: &[u8]) -> Result<DecodedAudio, DecodeError> {
        let malformed = |reason: String| DecodeError::Malformed {
            mime_type: "audio/opus".to_string(),
            reason,
        };

        // max 120ms @ 48kHz = 5760 samples/channel, use 6000 for safety
        let max_frame_size = 6000;
        let mut pcm_buf = vec![0i16; max_frame_size * self.channels as usize];
        let decoded_per_ch = self
            .decoder
            .decode(data, &mut pcm_buf, false)
            .map_err(|e| malformed(e.to_string()))?;
        if decoded_per_ch == 0 {
            return Err(malformed("empty packet".to_string()));
        }

        pcm_buf.truncate(decoded_per_ch * self.channels as usize);
        Ok(DecodedAudio {
            samples: pcm_buf,
            sample_rate: self.sample_rate,
            channels: self.channels,
        })
    }
}
