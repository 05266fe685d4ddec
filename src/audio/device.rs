//! Seams between the call engine and the audio hardware.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use super::stream_decoder::{self, DecodeError, DecodedAudio};

/// Why a capture device could not be acquired.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error("microphone permission denied: {0}")]
    PermissionDenied(String),

    #[error("microphone unavailable: {0}")]
    Unavailable(String),

    #[error("microphone error: {0}")]
    Unknown(String),
}

impl DeviceError {
    /// Classify an OS error number from the audio stack.
    pub fn from_errno(errno: i32, detail: impl Into<String>) -> Self {
        use std::io::ErrorKind;

        // Linux ENODEV, which std leaves uncategorized
        const ENODEV: i32 = 19;

        let detail = detail.into();
        let errno = errno.abs();
        if errno == ENODEV {
            return DeviceError::Unavailable(detail);
        }
        match std::io::Error::from_raw_os_error(errno).kind() {
            ErrorKind::PermissionDenied => DeviceError::PermissionDenied(detail),
            ErrorKind::ResourceBusy | ErrorKind::NotFound => DeviceError::Unavailable(detail),
            _ => DeviceError::Unknown(detail),
        }
    }
}

/// An acquired microphone.
///
/// `set_enabled` is the hardware track flag (a disabled track records
/// silence); forwarding is gated separately by the capture pipeline.
pub trait CaptureDevice: Send {
    /// MIME type of the bytes this device records.
    fn mime_type(&self) -> &str;

    /// Begin producing one chunk per `timeslice` on `chunks`, in order.
    fn start_recording(
        &mut self,
        timeslice: Duration,
        chunks: mpsc::UnboundedSender<Vec<u8>>,
    ) -> anyhow::Result<()>;

    /// Stop the recorder. No-op if it never started.
    fn stop_recording(&mut self);

    fn set_enabled(&mut self, enabled: bool);

    /// Release the hardware. The device is unusable afterwards.
    fn stop_tracks(&mut self);
}

#[async_trait]
pub trait DeviceAcquirer: Send + Sync {
    async fn acquire(&self) -> Result<Box<dyn CaptureDevice>, DeviceError>;
}

/// Decodes and renders audio buffers.
#[async_trait]
pub trait PlaybackFacility: Send + Sync {
    /// Decode `data` as `mime_type`. Rejection is reported as a
    /// [`DecodeError`] so the caller can try another type.
    fn decode(&self, data: &[u8], mime_type: &str) -> Result<DecodedAudio, DecodeError> {
        stream_decoder::decode(data, mime_type)
    }

    /// Resolves when the buffer has finished playing.
    async fn render(&self, audio: DecodedAudio) -> anyhow::Result<()>;
}

/// Wait for an audio thread to exit without stalling the async runtime.
/// Inside a runtime the join moves to the blocking pool; outside one it
/// happens inline.
#[cfg_attr(not(feature = "alsa-backend"), allow(dead_code))]
pub(crate) fn join_off_loop(handle: std::thread::JoinHandle<()>, what: &'static str) {
    let join = move || {
        if handle.join().is_err() {
            log::error!("{} thread panicked", what);
        }
    };
    match tokio::runtime::Handle::try_current() {
        Ok(runtime) => {
            runtime.spawn_blocking(join);
        }
        Err(_) => join(),
    }
}
