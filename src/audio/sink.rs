//! Output side of the speaker thread: the request loop and cancellable
//! buffer writes, independent of the audio backend.
//!
//! A request whose requester has gone away (its task was aborted on
//! teardown) is skipped, and a write in progress stops at the next period
//! boundary once that happens.

#![cfg_attr(not(feature = "alsa-backend"), allow(dead_code))]

use anyhow::{Result, anyhow};
use tokio::sync::{mpsc, oneshot};

use super::stream_decoder::DecodedAudio;

/// 熔断：连续恢复失败的最大次数
const MAX_RECOVERY_RETRIES: u32 = 3;

pub(crate) struct PlayRequest {
    pub audio: DecodedAudio,
    pub done: oneshot::Sender<Result<()>>,
}

/// An open output stream with a fixed format.
pub(crate) trait AudioSink {
    fn channels(&self) -> usize;

    /// Frames per hardware period; writes are sliced to this size.
    fn period_frames(&self) -> usize;

    /// Write interleaved samples, returning the number of frames accepted.
    fn write(&mut self, samples: &[i16]) -> Result<usize>;

    /// Bring the stream back after an underrun or write error.
    fn recover(&mut self) -> Result<()>;

    /// Throw away whatever the device still has queued.
    fn discard(&mut self);
}

/// Opens a sink for a given buffer format.
pub(crate) trait SinkOpener {
    type Sink: AudioSink;

    fn open(&mut self, sample_rate: u32, channels: u16) -> Result<Self::Sink>;
}

/// Serve play requests until every sender is dropped. Blocking; runs on the
/// speaker thread.
pub(crate) fn serve<O: SinkOpener>(opener: &mut O, rx: &mut mpsc::UnboundedReceiver<PlayRequest>) {
    let mut current: Option<(O::Sink, (u32, u16))> = None;

    while let Some(PlayRequest { audio, done }) = rx.blocking_recv() {
        if done.is_closed() {
            log::debug!("Skipping cancelled playback ({} ms)", audio.duration_ms());
            continue;
        }

        let wanted = (audio.sample_rate, audio.channels);
        if current.as_ref().map(|(_, format)| *format) != Some(wanted) {
            // Close the old handle before reopening the same device
            current = None;
            match opener.open(audio.sample_rate, audio.channels) {
                Ok(sink) => current = Some((sink, wanted)),
                Err(e) => {
                    let _ = done.send(Err(e));
                    continue;
                }
            }
        }

        let result = match current.as_mut() {
            Some((sink, _)) => write_buffer(sink, &audio, &done),
            None => Err(anyhow!("no playback device")),
        };
        // The requester may have been cancelled; nothing to report to.
        let _ = done.send(result);
    }

    log::info!("Playback channel closed");
}

/// Write `audio` period by period, stopping early if `done` has no
/// receiver any more.
fn write_buffer<S: AudioSink>(
    sink: &mut S,
    audio: &DecodedAudio,
    done: &oneshot::Sender<Result<()>>,
) -> Result<()> {
    let out_channels = sink.channels();
    let pcm_data = convert_channels(&audio.samples, audio.channels as usize, out_channels);
    if pcm_data.is_empty() || out_channels == 0 {
        return Ok(());
    }

    let total_frames = pcm_data.len() / out_channels;
    let period = sink.period_frames().max(1);
    let mut frames_written = 0;
    let mut retry_count = 0u32;

    while frames_written < total_frames {
        if done.is_closed() {
            log::debug!(
                "Playback cancelled with {} frames unwritten",
                total_frames - frames_written
            );
            sink.discard();
            return Ok(());
        }

        let end = (frames_written + period).min(total_frames);
        let slice = &pcm_data[frames_written * out_channels..end * out_channels];
        match sink.write(slice) {
            Ok(n) => {
                frames_written += n;
                retry_count = 0;
            }
            Err(e) => {
                log::warn!("Output XRUN or error: {}, recovering...", e);
                retry_count += 1;
                sink.recover()?;

                if retry_count >= MAX_RECOVERY_RETRIES {
                    anyhow::bail!(
                        "giving up after {} recoveries, {} frames unwritten",
                        retry_count,
                        total_frames - frames_written
                    );
                }
            }
        }
    }
    Ok(())
}

/// Convert interleaved samples between channel counts.
fn convert_channels(samples: &[i16], input_channels: usize, output_channels: usize) -> Vec<i16> {
    if input_channels == output_channels || input_channels == 0 || output_channels == 0 {
        return samples.to_vec();
    }
    let frames = samples.len() / input_channels;
    let mut out = Vec::with_capacity(frames * output_channels);
    for frame in samples.chunks_exact(input_channels) {
        if output_channels == 1 {
            // Multi-channel → mono: average
            let sum: i32 = frame.iter().map(|s| *s as i32).sum();
            out.push((sum / input_channels as i32) as i16);
        } else {
            // Upmix / general mapping (e.g. mono → stereo: duplicate)
            for c in 0..output_channels {
                out.push(frame[c % input_channels]);
            }
        }
    }
    out
}
