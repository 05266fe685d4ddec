//! ALSA microphone: acquisition plus the recording thread.
//!
//! Uses std::thread (NOT tokio tasks) for real-time audio I/O; chunks cross
//! into the async side over an unbounded channel.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use alsa::pcm::PCM;
use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

use super::alsa_device::{self, AlsaParams};
use super::device::{CaptureDevice, DeviceAcquirer, DeviceError, join_off_loop};
use crate::config::AudioSettings;

pub struct AlsaAcquirer {
    device: String,
    sample_rate: u32,
    channels: u32,
}

impl AlsaAcquirer {
    pub fn new(settings: &AudioSettings) -> Self {
        Self {
            device: settings.capture_device.clone(),
            sample_rate: settings.capture_sample_rate,
            channels: settings.capture_channels,
        }
    }
}

#[async_trait]
impl DeviceAcquirer for AlsaAcquirer {
    async fn acquire(&self) -> Result<Box<dyn CaptureDevice>, DeviceError> {
        let (device, rate, channels) = (self.device.clone(), self.sample_rate, self.channels);
        // snd_pcm_open may block while another client holds the device
        let opened = tokio::task::spawn_blocking(move || {
            alsa_device::open_capture(&device, rate, channels)
        })
        .await
        .map_err(|e| DeviceError::Unknown(e.to_string()))?;

        match opened {
            Ok((pcm, params)) => Ok(Box::new(AlsaCaptureDevice::new(pcm, params))),
            Err(e) => {
                log::error!("Capture device open failed: {:#}", e);
                Err(alsa_device::classify_open_error(&e))
            }
        }
    }
}

pub struct AlsaCaptureDevice {
    pcm: Option<PCM>,
    params: AlsaParams,
    mime_type: String,
    enabled: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    record_handle: Option<JoinHandle<()>>,
}

impl AlsaCaptureDevice {
    fn new(pcm: PCM, params: AlsaParams) -> Self {
        let mime_type = if params.channels == 1 {
            format!("audio/pcm;rate={}", params.sample_rate)
        } else {
            format!(
                "audio/pcm;rate={};channels={}",
                params.sample_rate, params.channels
            )
        };
        Self {
            pcm: Some(pcm),
            params,
            mime_type,
            enabled: Arc::new(AtomicBool::new(true)),
            running: Arc::new(AtomicBool::new(false)),
            record_handle: None,
        }
    }
}

impl CaptureDevice for AlsaCaptureDevice {
    fn mime_type(&self) -> &str {
        &self.mime_type
    }

    fn start_recording(
        &mut self,
        timeslice: Duration,
        chunks: mpsc::UnboundedSender<Vec<u8>>,
    ) -> Result<()> {
        let Some(pcm) = self.pcm.take() else {
            anyhow::bail!("capture device already recording or released");
        };
        self.running.store(true, Ordering::SeqCst);

        let params = self.params;
        let enabled = self.enabled.clone();
        let running = self.running.clone();
        let handle = thread::Builder::new()
            .name("audio-record".into())
            .spawn(move || {
                if let Err(e) = record_thread(pcm, params, timeslice, &enabled, &running, chunks) {
                    log::error!("Recording thread error: {}", e);
                }
            })?;
        self.record_handle = Some(handle);
        Ok(())
    }

    fn stop_recording(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(h) = self.record_handle.take() {
            join_off_loop(h, "recording");
        }
    }

    fn set_enabled(&mut self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn stop_tracks(&mut self) {
        self.stop_recording();
        if self.pcm.take().is_some() {
            log::info!("Capture device released before recording started");
        }
    }
}

impl Drop for AlsaCaptureDevice {
    fn drop(&mut self) {
        self.stop_tracks();
    }
}

// ======================== Recording thread ========================

fn record_thread(
    pcm: PCM,
    params: AlsaParams,
    timeslice: Duration,
    enabled: &AtomicBool,
    running: &AtomicBool,
    chunks: mpsc::UnboundedSender<Vec<u8>>,
) -> Result<()> {
    let channels = params.channels as usize;
    let frames_per_chunk =
        (params.sample_rate as u128 * timeslice.as_millis() / 1000).max(1) as usize;
    let samples_per_chunk = frames_per_chunk * channels;

    // Accumulation buffer for PCM samples (i16)
    let mut accum_buf: Vec<i16> = Vec::with_capacity(samples_per_chunk * 2);

    // ALSA read buffer (interleaved i16, one period)
    let mut read_buf = vec![0i16; params.period_size * channels];

    let io = pcm.io_i16()?;

    log::info!(
        "Recording started: rate={}, ch={}, period={}, chunk_frames={}",
        params.sample_rate,
        channels,
        params.period_size,
        frames_per_chunk,
    );

    while running.load(Ordering::Relaxed) {
        match io.readi(&mut read_buf) {
            Ok(frames) => {
                let samples = &mut read_buf[..frames * channels];
                // 轨道被禁用时录制静音
                if !enabled.load(Ordering::Relaxed) {
                    samples.fill(0);
                }
                accum_buf.extend_from_slice(samples);

                while accum_buf.len() >= samples_per_chunk {
                    let bytes: Vec<u8> = accum_buf[..samples_per_chunk]
                        .iter()
                        .flat_map(|s| s.to_le_bytes())
                        .collect();
                    accum_buf.drain(..samples_per_chunk);
                    if chunks.send(bytes).is_err() {
                        log::warn!("Chunk receiver dropped, stopping recorder");
                        return Ok(());
                    }
                }
            }
            Err(e) => {
                log::warn!("ALSA capture error: {}, recovering...", e);
                if let Err(e2) = pcm.prepare() {
                    log::error!("Failed to recover PCM capture: {}", e2);
                    break;
                }
            }
        }
    }

    log::info!("Recording stopped");
    Ok(())
}
