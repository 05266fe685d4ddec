//! Inbound audio: normalize → speaker gate → decode with fallback → render.
//!
//! Every accepted payload gets its own [`PlaybackContext`] and task. The
//! context's release callback runs exactly once on every exit path,
//! including abort on teardown.

use std::collections::HashMap;
use std::sync::Arc;

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use bytes::Bytes;
use tokio::task::JoinHandle;

use super::device::PlaybackFacility;

/// The two inbound shapes the peer uses for audio.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundAudio {
    /// Raw binary WebSocket frame.
    Binary(Bytes),
    /// base64 `inlineData` part of a `serverContent` message.
    Inline { mime_type: String, data: String },
}

/// Normalized payload: raw bytes plus the declared type.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    pub bytes: Bytes,
    pub mime_type: String,
}

impl InboundAudio {
    pub fn normalize(self, binary_mime_type: &str) -> Result<AudioBuffer, base64::DecodeError> {
        match self {
            InboundAudio::Binary(bytes) => {
                // 二进制帧没有类型声明，带 RIFF/WAVE 头的按 WAV 处理
                let mime_type = if is_wav(&bytes) {
                    "audio/wav".to_string()
                } else {
                    binary_mime_type.to_string()
                };
                Ok(AudioBuffer { bytes, mime_type })
            }
            InboundAudio::Inline { mime_type, data } => Ok(AudioBuffer {
                bytes: Bytes::from(BASE64.decode(data.trim())?),
                mime_type,
            }),
        }
    }
}

fn is_wav(bytes: &[u8]) -> bool {
    bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WAVE"
}

/// Declared type first, then the fallbacks in order, without repeats.
pub fn candidate_types(declared: &str, fallbacks: &[String]) -> Vec<String> {
    let mut candidates: Vec<String> = Vec::with_capacity(fallbacks.len() + 1);
    for mime in std::iter::once(declared).chain(fallbacks.iter().map(String::as_str)) {
        let mime = mime.trim();
        if mime.is_empty() || candidates.iter().any(|c| c.eq_ignore_ascii_case(mime)) {
            continue;
        }
        candidates.push(mime.to_string());
    }
    candidates
}

#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackOutcome {
    Played { mime_type: String },
    /// Every candidate type was rejected by the decoder.
    Exhausted { attempted: Vec<String> },
    RenderFailed { mime_type: String, reason: String },
}

type ReleaseFn = Box<dyn FnOnce(u64) + Send + 'static>;

/// Scoped per-payload playback context. Dropping it releases it.
pub struct PlaybackContext {
    id: u64,
    on_release: Option<ReleaseFn>,
}

impl PlaybackContext {
    pub fn open(id: u64, on_release: impl FnOnce(u64) + Send + 'static) -> Self {
        Self {
            id,
            on_release: Some(Box::new(on_release)),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for PlaybackContext {
    fn drop(&mut self) {
        if let Some(release) = self.on_release.take() {
            release(self.id);
        }
    }
}

/// Decode `buffer` trying each candidate type in order, then render the
/// first successful decode.
pub async fn play_buffer(
    facility: &dyn PlaybackFacility,
    buffer: &AudioBuffer,
    fallbacks: &[String],
) -> PlaybackOutcome {
    let candidates = candidate_types(&buffer.mime_type, fallbacks);
    let mut attempted = Vec::with_capacity(candidates.len());

    for mime_type in candidates {
        let decoded = facility.decode(&buffer.bytes, &mime_type);
        attempted.push(mime_type.clone());
        match decoded {
            Ok(audio) => {
                log::debug!(
                    "Decoded {} bytes as {} (~{} ms)",
                    buffer.bytes.len(),
                    mime_type,
                    audio.duration_ms()
                );
                return match facility.render(audio).await {
                    Ok(()) => PlaybackOutcome::Played { mime_type },
                    Err(e) => {
                        log::warn!("Playback of {} failed: {}", mime_type, e);
                        PlaybackOutcome::RenderFailed {
                            mime_type,
                            reason: e.to_string(),
                        }
                    }
                };
            }
            Err(e) => log::debug!("Decode as {} rejected: {}", mime_type, e),
        }
    }

    log::warn!(
        "Audio decode failed ({} bytes, declared {}); tried {:?}",
        buffer.bytes.len(),
        buffer.mime_type,
        attempted
    );
    PlaybackOutcome::Exhausted { attempted }
}

pub struct PlaybackPipeline {
    facility: Arc<dyn PlaybackFacility>,
    binary_mime_type: String,
    fallbacks: Arc<Vec<String>>,
    in_flight: HashMap<u64, JoinHandle<()>>,
    next_id: u64,
}

impl PlaybackPipeline {
    pub fn new(
        facility: Arc<dyn PlaybackFacility>,
        binary_mime_type: impl Into<String>,
        fallbacks: Vec<String>,
    ) -> Self {
        Self {
            facility,
            binary_mime_type: binary_mime_type.into(),
            fallbacks: Arc::new(fallbacks),
            in_flight: HashMap::new(),
            next_id: 0,
        }
    }

    /// Start playback of one payload. `speaker_enabled` is the flag at the
    /// moment of processing. Returns the context id, or `None` when the
    /// payload was suppressed or could not be normalized.
    pub fn process(
        &mut self,
        payload: InboundAudio,
        speaker_enabled: bool,
        on_release: impl FnOnce(u64) + Send + 'static,
    ) -> Option<u64> {
        if !speaker_enabled {
            log::debug!("Speaker disabled, skipping inbound audio");
            return None;
        }

        let buffer = match payload.normalize(&self.binary_mime_type) {
            Ok(buffer) => buffer,
            Err(e) => {
                log::warn!("Dropping inline audio with invalid base64: {}", e);
                return None;
            }
        };

        let id = self.next_id;
        self.next_id += 1;
        let context = PlaybackContext::open(id, on_release);
        let facility = self.facility.clone();
        let fallbacks = self.fallbacks.clone();

        let handle = tokio::spawn(async move {
            let context = context;
            let outcome = play_buffer(facility.as_ref(), &buffer, &fallbacks).await;
            log::debug!("Playback #{} finished: {:?}", context.id(), outcome);
        });
        self.in_flight.insert(id, handle);
        Some(id)
    }

    /// Forget a finished playback task.
    pub fn finished(&mut self, id: u64) {
        self.in_flight.remove(&id);
    }

    /// Abort all in-flight playback. Their contexts release as the tasks
    /// are dropped.
    pub fn cancel_all(&mut self) -> usize {
        let count = self.in_flight.len();
        for (_, handle) in self.in_flight.drain() {
            handle.abort();
        }
        count
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }
}
