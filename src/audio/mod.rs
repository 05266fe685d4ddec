//! audio - capture and playback pipelines for a live call
//!
//! The pipelines are hardware-agnostic and talk to the device through the
//! traits in [`device`]. With the `alsa-backend` feature the ALSA capture
//! device and playback sink are compiled in; `opus-codec` adds the Opus
//! packet decoder.

pub mod capture;
pub mod device;
pub mod playback;
pub mod stream_decoder;

#[cfg(feature = "alsa-backend")]
mod alsa_device;
#[cfg(feature = "opus-codec")]
mod opus_codec;
#[cfg(feature = "alsa-backend")]
mod play;
#[cfg(feature = "alsa-backend")]
mod record;
mod sink;

pub use capture::{AudioChunk, CapturePipeline};
pub use device::{CaptureDevice, DeviceAcquirer, DeviceError, PlaybackFacility};
pub use playback::{InboundAudio, PlaybackPipeline};
pub use stream_decoder::{DecodeError, DecodedAudio, StreamDecoder};

#[cfg(feature = "alsa-backend")]
pub use play::AlsaPlayback;
#[cfg(feature = "alsa-backend")]
pub use record::{AlsaAcquirer, AlsaCaptureDevice};
