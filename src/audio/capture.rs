//! Outbound audio: device chunks → gate → base64 → `realtimeInput`.
//!
//! Best effort, no backpressure. A chunk that fails the gate at submission
//! time is dropped, never queued for later.

use std::time::{Duration, Instant};

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use bytes::Bytes;
use tokio::sync::mpsc;

use super::device::CaptureDevice;
use crate::net_link::ReadyState;
use crate::protocol::RealtimeInputMessage;

/// One timeslice of recorded audio.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioChunk {
    pub seq: u64,
    pub data: Bytes,
    pub captured_at: Instant,
}

/// The per-chunk gate: open transport with a completed handshake, and not
/// muted.
pub fn should_forward(ready_state: ReadyState, handshake_complete: bool, muted: bool) -> bool {
    ready_state == ReadyState::Open && handshake_complete && !muted
}

/// Wrap raw chunk bytes in the wire envelope.
pub fn encode_chunk(mime_type: &str, data: &[u8]) -> anyhow::Result<String> {
    let msg = RealtimeInputMessage::single(mime_type, BASE64.encode(data));
    Ok(serde_json::to_string(&msg)?)
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CaptureStats {
    pub produced: u64,
    pub forwarded: u64,
    pub dropped: u64,
}

pub struct CapturePipeline {
    timeslice: Duration,
    mime_type: Option<String>,
    recording: bool,
    next_seq: u64,
    stats: CaptureStats,
}

impl CapturePipeline {
    pub fn new(timeslice: Duration) -> Self {
        Self {
            timeslice,
            mime_type: None,
            recording: false,
            next_seq: 0,
            stats: CaptureStats::default(),
        }
    }

    /// Start fixed-cadence recording on `device`. Raw chunks arrive on
    /// `chunks` in capture order.
    pub fn start(
        &mut self,
        device: &mut dyn CaptureDevice,
        chunks: mpsc::UnboundedSender<Vec<u8>>,
    ) -> anyhow::Result<()> {
        if self.recording {
            log::warn!("Capture already running");
            return Ok(());
        }
        device.start_recording(self.timeslice, chunks)?;
        self.mime_type = Some(device.mime_type().to_string());
        self.recording = true;
        log::info!(
            "Capture started: timeslice={}ms, mime={}",
            self.timeslice.as_millis(),
            device.mime_type()
        );
        Ok(())
    }

    /// Stamp a raw chunk from the recorder.
    pub fn chunk(&mut self, data: Vec<u8>) -> AudioChunk {
        let chunk = AudioChunk {
            seq: self.next_seq,
            data: Bytes::from(data),
            captured_at: Instant::now(),
        };
        self.next_seq += 1;
        self.stats.produced += 1;
        chunk
    }

    /// Evaluate the gate and, if it passes, return the encoded envelope to
    /// send. `None` means the chunk was dropped.
    pub fn submit(
        &mut self,
        chunk: &AudioChunk,
        ready_state: ReadyState,
        handshake_complete: bool,
        muted: bool,
    ) -> Option<String> {
        let Some(mime_type) = self.mime_type.as_deref().filter(|_| self.recording) else {
            self.stats.dropped += 1;
            return None;
        };

        if !should_forward(ready_state, handshake_complete, muted) {
            log::debug!(
                "Dropping chunk #{} (state={:?}, handshake={}, muted={})",
                chunk.seq,
                ready_state,
                handshake_complete,
                muted
            );
            self.stats.dropped += 1;
            return None;
        }

        match encode_chunk(mime_type, &chunk.data) {
            Ok(envelope) => {
                self.stats.forwarded += 1;
                Some(envelope)
            }
            Err(e) => {
                log::error!("Failed to encode chunk #{}: {}", chunk.seq, e);
                self.stats.dropped += 1;
                None
            }
        }
    }

    /// Stop the recorder. Safe when capture never started.
    pub fn stop<D: CaptureDevice + ?Sized>(&mut self, device: Option<&mut D>) {
        if self.recording {
            if let Some(device) = device {
                device.stop_recording();
            }
            log::info!(
                "Capture stopped: produced={}, forwarded={}, dropped={}",
                self.stats.produced,
                self.stats.forwarded,
                self.stats.dropped
            );
        }
        self.recording = false;
        self.mime_type = None;
        self.next_seq = 0;
        self.stats = CaptureStats::default();
    }

    pub fn is_recording(&self) -> bool {
        self.recording
    }

    pub fn stats(&self) -> CaptureStats {
        self.stats
    }
}
