//! Generic stream decoder trait for multi-format audio playback support.
//!
//! Decoders are picked by MIME essence; parameters such as `rate=` and
//! `channels=` configure raw PCM.

use std::io::Cursor;

use thiserror::Error;

/// Interleaved i16 PCM ready for the playback sink.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedAudio {
    pub samples: Vec<i16>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl DecodedAudio {
    pub fn duration_ms(&self) -> u64 {
        if self.sample_rate == 0 || self.channels == 0 {
            return 0;
        }
        let frames = self.samples.len() as u64 / self.channels as u64;
        frames * 1000 / self.sample_rate as u64
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("unsupported media type: {0}")]
    Unsupported(String),

    #[error("cannot decode {mime_type}: {reason}")]
    Malformed { mime_type: String, reason: String },
}

/// A trait for audio stream decoders that convert encoded audio data
/// into interleaved i16 PCM samples ready for playback.
pub trait StreamDecoder: Send {
    fn decode(&mut self, data: &[u8]) -> Result<DecodedAudio, DecodeError>;
}

/// Parsed `type/subtype;key=value` media type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaType {
    pub essence: String,
    pub params: Vec<(String, String)>,
}

impl MediaType {
    pub fn parse(raw: &str) -> Self {
        let mut pieces = raw.split(';');
        let essence = pieces.next().unwrap_or_default().trim().to_ascii_lowercase();
        let params = pieces
            .filter_map(|p| {
                let (k, v) = p.split_once('=')?;
                Some((
                    k.trim().to_ascii_lowercase(),
                    v.trim().trim_matches('"').to_string(),
                ))
            })
            .collect();
        Self { essence, params }
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

const DEFAULT_PCM_RATE: u32 = 24000;

/// Factory function: create a decoder for the given MIME type.
pub fn decoder_for(mime_type: &str) -> Result<Box<dyn StreamDecoder>, DecodeError> {
    let media = MediaType::parse(mime_type);
    let malformed = |reason: &str| DecodeError::Malformed {
        mime_type: mime_type.to_string(),
        reason: reason.to_string(),
    };

    match media.essence.as_str() {
        "audio/pcm" | "audio/l16" | "audio/raw" => {
            let sample_rate = match media.param("rate") {
                Some(r) => r.parse().map_err(|_| malformed("bad rate parameter"))?,
                None => DEFAULT_PCM_RATE,
            };
            let channels = match media.param("channels") {
                Some(c) => c.parse().map_err(|_| malformed("bad channels parameter"))?,
                None => 1,
            };
            if sample_rate == 0 || channels == 0 {
                return Err(malformed("zero rate or channels"));
            }
            Ok(Box::new(PcmDecoder {
                mime_type: mime_type.to_string(),
                sample_rate,
                channels,
            }))
        }
        "audio/wav" | "audio/wave" | "audio/x-wav" => Ok(Box::new(WavDecoder {
            mime_type: mime_type.to_string(),
        })),
        #[cfg(feature = "opus-codec")]
        "audio/opus" => {
            let sample_rate = match media.param("rate") {
                Some(r) => r.parse().map_err(|_| malformed("bad rate parameter"))?,
                None => 48000,
            };
            let channels = match media.param("channels") {
                Some(c) => c.parse().map_err(|_| malformed("bad channels parameter"))?,
                None => 1,
            };
            let decoder = super::opus_codec::OpusDecoder::new(sample_rate, channels)
                .map_err(|e| malformed(&e.to_string()))?;
            Ok(Box::new(decoder))
        }
        _ => Err(DecodeError::Unsupported(mime_type.to_string())),
    }
}

/// One-shot decode of a complete buffer.
pub fn decode(data: &[u8], mime_type: &str) -> Result<DecodedAudio, DecodeError> {
    decoder_for(mime_type)?.decode(data)
}

// ======================== PCM ========================

/// Signed 16-bit little-endian samples.
struct PcmDecoder {
    mime_type: String,
    sample_rate: u32,
    channels: u16,
}

impl StreamDecoder for PcmDecoder {
    fn decode(&mut self, data: &[u8]) -> Result<DecodedAudio, DecodeError> {
        let frame_bytes = 2 * self.channels as usize;
        if data.is_empty() || data.len() % frame_bytes != 0 {
            return Err(DecodeError::Malformed {
                mime_type: self.mime_type.clone(),
                reason: format!("{} bytes is not a whole number of frames", data.len()),
            });
        }
        let samples = data
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect();
        Ok(DecodedAudio {
            samples,
            sample_rate: self.sample_rate,
            channels: self.channels,
        })
    }
}

// ======================== WAV ========================

struct WavDecoder {
    mime_type: String,
}

impl WavDecoder {
    fn malformed(&self, reason: impl ToString) -> DecodeError {
        DecodeError::Malformed {
            mime_type: self.mime_type.clone(),
            reason: reason.to_string(),
        }
    }
}

impl StreamDecoder for WavDecoder {
    fn decode(&mut self, data: &[u8]) -> Result<DecodedAudio, DecodeError> {
        let mut reader = hound::WavReader::new(Cursor::new(data)).map_err(|e| self.malformed(e))?;
        let spec = reader.spec();

        let samples: Vec<i16> = match (spec.sample_format, spec.bits_per_sample) {
            (hound::SampleFormat::Int, 16) => reader
                .samples::<i16>()
                .collect::<Result<_, _>>()
                .map_err(|e| self.malformed(e))?,
            (hound::SampleFormat::Int, bits) if bits <= 32 => {
                // scale 8/24/32-bit samples into the i16 range
                let to_i16 = |v: i32| -> i16 {
                    if bits > 16 {
                        (v >> (bits - 16)) as i16
                    } else {
                        (v << (16 - bits)) as i16
                    }
                };
                reader
                    .samples::<i32>()
                    .map(|s| s.map(to_i16))
                    .collect::<Result<_, _>>()
                    .map_err(|e| self.malformed(e))?
            }
            (hound::SampleFormat::Float, 32) => reader
                .samples::<f32>()
                .map(|s| s.map(|v| (v.clamp(-1.0, 1.0) * i16::MAX as f32) as i16))
                .collect::<Result<_, _>>()
                .map_err(|e| self.malformed(e))?,
            (format, bits) => {
                return Err(self.malformed(format!("{:?} {}-bit samples", format, bits)));
            }
        };

        if samples.is_empty() {
            return Err(self.malformed("no samples"));
        }

        Ok(DecodedAudio {
            samples,
            sample_rate: spec.sample_rate,
            channels: spec.channels,
        })
    }
}
