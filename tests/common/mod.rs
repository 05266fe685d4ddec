#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Notify, mpsc};
use url::Url;

use live_call_rs::audio::device::{CaptureDevice, DeviceAcquirer, DeviceError, PlaybackFacility};
use live_call_rs::audio::stream_decoder::DecodedAudio;
use live_call_rs::config::SessionSettings;
use live_call_rs::controller::{CallController, CallDeps, SessionEvents};
use live_call_rs::gui_bridge::UiUpdate;
use live_call_rs::net_link::{ConnectRequest, Connector, NetCommand, NetEvent, TransportHandle};

// ======================== Capture device ========================

#[derive(Default)]
pub struct DeviceState {
    pub recording: bool,
    pub tracks_stopped: bool,
    pub enabled: Option<bool>,
    pub chunks: Option<mpsc::UnboundedSender<Vec<u8>>>,
}

#[derive(Clone, Default)]
pub struct DeviceProbe(Arc<Mutex<DeviceState>>);

impl DeviceProbe {
    pub fn state(&self) -> std::sync::MutexGuard<'_, DeviceState> {
        self.0.lock().unwrap()
    }

    /// Emit one recorded chunk, as the recorder would at the end of a slice.
    pub fn emit(&self, data: Vec<u8>) -> bool {
        match &self.state().chunks {
            Some(tx) => tx.send(data).is_ok(),
            None => false,
        }
    }
}

pub struct FakeDevice {
    probe: DeviceProbe,
}

impl CaptureDevice for FakeDevice {
    fn mime_type(&self) -> &str {
        "audio/pcm;rate=16000"
    }

    fn start_recording(
        &mut self,
        _timeslice: Duration,
        chunks: mpsc::UnboundedSender<Vec<u8>>,
    ) -> anyhow::Result<()> {
        let mut state = self.probe.state();
        state.recording = true;
        state.chunks = Some(chunks);
        Ok(())
    }

    fn stop_recording(&mut self) {
        let mut state = self.probe.state();
        state.recording = false;
        state.chunks = None;
    }

    fn set_enabled(&mut self, enabled: bool) {
        self.probe.state().enabled = Some(enabled);
    }

    fn stop_tracks(&mut self) {
        let mut state = self.probe.state();
        state.tracks_stopped = true;
        state.chunks = None;
    }
}

pub struct FakeAcquirer {
    pub probe: DeviceProbe,
    fail_with: Option<DeviceError>,
    gate: Option<Arc<Notify>>,
}

impl FakeAcquirer {
    pub fn granting() -> Self {
        Self {
            probe: DeviceProbe::default(),
            fail_with: None,
            gate: None,
        }
    }

    pub fn failing(error: DeviceError) -> Self {
        Self {
            fail_with: Some(error),
            ..Self::granting()
        }
    }

    /// Acquisition completes only once `gate` is notified.
    pub fn gated(gate: Arc<Notify>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::granting()
        }
    }
}

#[async_trait]
impl DeviceAcquirer for FakeAcquirer {
    async fn acquire(&self) -> Result<Box<dyn CaptureDevice>, DeviceError> {
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        match &self.fail_with {
            Some(e) => Err(e.clone()),
            None => Ok(Box::new(FakeDevice {
                probe: self.probe.clone(),
            })),
        }
    }
}

// ======================== Transport ========================

pub struct OpenedLink {
    pub request: ConnectRequest,
    pub events: mpsc::UnboundedSender<NetEvent>,
    pub commands: mpsc::UnboundedReceiver<NetCommand>,
}

impl OpenedLink {
    pub fn push(&self, event: NetEvent) {
        let _ = self.events.send(event);
    }

    pub fn drain(&mut self) -> Vec<NetCommand> {
        let mut out = Vec::new();
        while let Ok(cmd) = self.commands.try_recv() {
            out.push(cmd);
        }
        out
    }
}

#[derive(Clone, Default)]
pub struct FakeConnector {
    pub links: Arc<Mutex<Vec<OpenedLink>>>,
}

impl FakeConnector {
    pub fn opened(&self) -> usize {
        self.links.lock().unwrap().len()
    }

    pub fn with_link<R>(&self, index: usize, f: impl FnOnce(&mut OpenedLink) -> R) -> R {
        let mut links = self.links.lock().unwrap();
        f(&mut links[index])
    }
}

impl Connector for FakeConnector {
    fn open(
        &self,
        request: ConnectRequest,
        events: mpsc::UnboundedSender<NetEvent>,
    ) -> TransportHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        self.links.lock().unwrap().push(OpenedLink {
            request,
            events,
            commands: rx,
        });
        TransportHandle::new(tx, None)
    }
}

// ======================== Speaker ========================

#[derive(Default)]
pub struct FakeSpeaker {
    pub rendered: Mutex<Vec<DecodedAudio>>,
    pub hold: Option<Arc<Notify>>,
}

impl FakeSpeaker {
    pub fn holding(hold: Arc<Notify>) -> Self {
        Self {
            hold: Some(hold),
            ..Self::default()
        }
    }

    pub fn render_count(&self) -> usize {
        self.rendered.lock().unwrap().len()
    }
}

#[async_trait]
impl PlaybackFacility for FakeSpeaker {
    async fn render(&self, audio: DecodedAudio) -> anyhow::Result<()> {
        if let Some(hold) = &self.hold {
            hold.notified().await;
        }
        self.rendered.lock().unwrap().push(audio);
        Ok(())
    }
}

// ======================== Harness ========================

pub struct Harness {
    pub controller: CallController,
    pub events: SessionEvents,
    pub ui: mpsc::UnboundedReceiver<UiUpdate>,
    pub probe: DeviceProbe,
    pub connector: FakeConnector,
    pub speaker: Arc<FakeSpeaker>,
}

pub fn settings() -> SessionSettings {
    SessionSettings {
        greeting: "Hello there".to_string(),
        ..SessionSettings::default()
    }
}

impl Harness {
    pub fn new(acquirer: FakeAcquirer) -> Self {
        Self::with_speaker(acquirer, FakeSpeaker::default())
    }

    pub fn with_speaker(acquirer: FakeAcquirer, speaker: FakeSpeaker) -> Self {
        let probe = acquirer.probe.clone();
        let connector = FakeConnector::default();
        let speaker = Arc::new(speaker);
        let (ui_tx, ui) = mpsc::unbounded_channel();
        let deps = CallDeps {
            acquirer: Arc::new(acquirer),
            connector: Arc::new(connector.clone()),
            playback: speaker.clone(),
        };
        let endpoint = Url::parse("wss://voice.test/ws?key=k").unwrap();
        let (controller, events) = CallController::new(settings(), endpoint, deps, ui_tx);
        Self {
            controller,
            events,
            ui,
            probe,
            connector,
            speaker,
        }
    }

    /// Let spawned tasks run and feed every pending completion back into
    /// the controller.
    pub async fn settle(&mut self) {
        for _ in 0..32 {
            tokio::task::yield_now().await;
            while let Some(envelope) = self.events.try_recv() {
                self.controller.handle_event(envelope);
            }
        }
    }

    pub fn push(&self, event: NetEvent) {
        let index = self.connector.opened() - 1;
        self.connector.with_link(index, |link| link.push(event));
    }

    /// Commands sent on the most recent link.
    pub fn sent(&self) -> Vec<NetCommand> {
        let index = self.connector.opened() - 1;
        self.connector.with_link(index, |link| link.drain())
    }

    pub fn ui_updates(&mut self) -> Vec<UiUpdate> {
        let mut out = Vec::new();
        while let Ok(update) = self.ui.try_recv() {
            out.push(update);
        }
        out
    }

    /// Start a call and complete the handshake.
    pub async fn connect(&mut self) {
        self.controller.start_call();
        self.settle().await;
        self.push(NetEvent::Opened);
        self.push(NetEvent::SetupComplete);
        self.settle().await;
    }
}

/// 16-bit mono PCM, `samples` frames of silence.
pub fn pcm(samples: usize) -> Vec<u8> {
    vec![0u8; samples * 2]
}

/// A complete 16-bit mono WAV file.
pub fn wav(sample_rate: u32, samples: &[i16]) -> Vec<u8> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = std::io::Cursor::new(Vec::new());
    let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
    for s in samples {
        writer.write_sample(*s).unwrap();
    }
    writer.finalize().unwrap();
    cursor.into_inner()
}
