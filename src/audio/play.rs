//! ALSA speaker: the playback facility used by the binary.
//!
//! A dedicated OS thread owns the PCM. Each render request carries a
//! completion channel that fires once the buffer has been written; dropping
//! the render future cancels the request on the thread.

use std::thread::{self, JoinHandle};

use alsa::pcm::PCM;
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use super::alsa_device::{self, AlsaParams};
use super::device::PlaybackFacility;
use super::sink::{self, AudioSink, PlayRequest, SinkOpener};
use super::stream_decoder::DecodedAudio;

pub struct AlsaPlayback {
    tx: mpsc::UnboundedSender<PlayRequest>,
    _play_handle: JoinHandle<()>,
}

impl AlsaPlayback {
    pub fn start(device: &str) -> Result<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut opener = AlsaOpener {
            device: device.to_string(),
        };
        let play_handle = thread::Builder::new()
            .name("audio-play".into())
            .spawn(move || sink::serve(&mut opener, &mut rx))?;
        Ok(Self {
            tx,
            _play_handle: play_handle,
        })
    }
}

#[async_trait]
impl PlaybackFacility for AlsaPlayback {
    async fn render(&self, audio: DecodedAudio) -> Result<()> {
        let (done, finished) = oneshot::channel();
        self.tx
            .send(PlayRequest { audio, done })
            .map_err(|_| anyhow!("playback thread is gone"))?;
        finished
            .await
            .map_err(|_| anyhow!("playback thread dropped the request"))?
    }
}

struct AlsaOpener {
    device: String,
}

impl SinkOpener for AlsaOpener {
    type Sink = AlsaSink;

    fn open(&mut self, sample_rate: u32, channels: u16) -> Result<AlsaSink> {
        let (pcm, params) = alsa_device::open_playback(&self.device, sample_rate, channels as u32)?;
        if params.sample_rate != sample_rate {
            log::warn!(
                "Playback rate negotiated to {} Hz (wanted {} Hz)",
                params.sample_rate,
                sample_rate
            );
        }
        Ok(AlsaSink { pcm, params })
    }
}

struct AlsaSink {
    pcm: PCM,
    params: AlsaParams,
}

impl AudioSink for AlsaSink {
    fn channels(&self) -> usize {
        self.params.channels as usize
    }

    fn period_frames(&self) -> usize {
        self.params.period_size
    }

    fn write(&mut self, samples: &[i16]) -> Result<usize> {
        Ok(self.pcm.io_i16()?.writei(samples)?)
    }

    fn recover(&mut self) -> Result<()> {
        self.pcm.prepare()?;
        Ok(())
    }

    fn discard(&mut self) {
        // drop 清空硬件缓冲，之后需要 prepare 才能继续写
        if let Err(e) = self.pcm.drop() {
            log::warn!("Failed to drop queued playback: {}", e);
        }
        if let Err(e) = self.pcm.prepare() {
            log::warn!("Failed to re-prepare playback PCM: {}", e);
        }
    }
}
