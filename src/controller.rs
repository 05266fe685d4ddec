use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use url::Url;

use crate::audio::capture::CapturePipeline;
use crate::audio::device::{CaptureDevice, DeviceAcquirer, DeviceError, PlaybackFacility};
use crate::audio::playback::{InboundAudio, PlaybackPipeline};
use crate::config::SessionSettings;
use crate::gui_bridge::{NoticeKind, UiCommand, UiUpdate};
use crate::net_link::{ConnectRequest, Connector, NetEvent, ReadyState, TransportHandle};
use crate::protocol::{ServerContent, SetupMessage};
use crate::state_machine::{CallSession, CallStatus, Effect, Trigger, transition};
use crate::transcript::{Speaker, Transcript};

/// Completions fed back into the controller loop.
pub enum SessionEvent {
    DeviceAcquired(Result<Box<dyn CaptureDevice>, DeviceError>),
    Net(NetEvent),
    Captured(Vec<u8>),
    PlaybackReleased(u64),
}

/// A [`SessionEvent`] tagged with the resource epoch it was produced in.
/// Events from an older epoch belong to a torn-down session.
pub struct Envelope {
    epoch: u64,
    event: SessionEvent,
}

pub struct SessionEvents(mpsc::UnboundedReceiver<Envelope>);

impl SessionEvents {
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.0.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Envelope> {
        self.0.try_recv().ok()
    }
}

#[derive(Clone)]
struct EventSender {
    epoch: u64,
    tx: mpsc::UnboundedSender<Envelope>,
}

impl EventSender {
    fn send(&self, event: SessionEvent) -> bool {
        self.tx
            .send(Envelope {
                epoch: self.epoch,
                event,
            })
            .is_ok()
    }
}

struct TransportLink {
    handle: TransportHandle,
    ready_state: ReadyState,
    handshake_complete: bool,
}

/// External collaborators of a call.
pub struct CallDeps {
    pub acquirer: Arc<dyn DeviceAcquirer>,
    pub connector: Arc<dyn Connector>,
    pub playback: Arc<dyn PlaybackFacility>,
}

pub struct CallController {
    settings: SessionSettings,
    endpoint: Url,
    session: CallSession,
    transcript: Transcript,
    acquirer: Arc<dyn DeviceAcquirer>,
    connector: Arc<dyn Connector>,
    capture: CapturePipeline,
    playback: PlaybackPipeline,
    transport: Option<TransportLink>,
    device: Option<Box<dyn CaptureDevice>>,
    forwarders: Vec<JoinHandle<()>>,
    speaking: HashSet<u64>,
    // 每次释放资源后递增，旧会话的回调据此丢弃
    epoch: u64,
    events_tx: mpsc::UnboundedSender<Envelope>,
    ui: mpsc::UnboundedSender<UiUpdate>,
}

impl CallController {
    pub fn new(
        settings: SessionSettings,
        endpoint: Url,
        deps: CallDeps,
        ui: mpsc::UnboundedSender<UiUpdate>,
    ) -> (Self, SessionEvents) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let capture = CapturePipeline::new(settings.chunk_duration);
        let playback = PlaybackPipeline::new(
            deps.playback,
            settings.binary_mime_type.clone(),
            settings.fallback_mime_types.clone(),
        );
        let controller = Self {
            settings,
            endpoint,
            session: CallSession::default(),
            transcript: Transcript::new(),
            acquirer: deps.acquirer,
            connector: deps.connector,
            capture,
            playback,
            transport: None,
            device: None,
            forwarders: Vec::new(),
            speaking: HashSet::new(),
            epoch: 0,
            events_tx,
            ui,
        };
        (controller, SessionEvents(events_rx))
    }

    pub fn status(&self) -> CallStatus {
        self.session.status
    }

    pub fn session(&self) -> &CallSession {
        &self.session
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    /// True while at least one playback context is open.
    pub fn is_speaking(&self) -> bool {
        !self.speaking.is_empty()
    }

    pub fn has_device(&self) -> bool {
        self.device.is_some()
    }

    pub fn has_transport(&self) -> bool {
        self.transport.is_some()
    }

    pub fn is_capturing(&self) -> bool {
        self.capture.is_recording()
    }

    pub fn handle_ui_command(&mut self, command: UiCommand) {
        log::debug!("UI command: {:?}", command);
        match command {
            UiCommand::StartCall => self.start_call(),
            UiCommand::EndCall => self.end_call(),
            UiCommand::ToggleMute => self.toggle_mute(),
            UiCommand::ToggleSpeaker => self.toggle_speaker(),
        }
    }

    pub fn start_call(&mut self) {
        if !self.fire(Trigger::StartRequested) {
            log::warn!("Call already active ({:?}), start ignored", self.session.status);
        }
    }

    /// End the call and reset to idle. Safe from any state.
    pub fn end_call(&mut self) {
        if matches!(
            self.session.status,
            CallStatus::Connecting | CallStatus::Connected
        ) {
            self.fire(Trigger::EndRequested);
        }
        self.teardown();
    }

    pub fn teardown(&mut self) {
        self.fire(Trigger::Teardown);
    }

    pub fn toggle_mute(&mut self) {
        self.session.muted = !self.session.muted;
        if let Some(device) = self.device.as_mut() {
            device.set_enabled(!self.session.muted);
        }
        log::info!("Microphone {}", if self.session.muted { "muted" } else { "unmuted" });
        self.publish(UiUpdate::Muted {
            muted: self.session.muted,
        });
    }

    pub fn toggle_speaker(&mut self) {
        self.session.speaker_enabled = !self.session.speaker_enabled;
        log::info!(
            "Speaker {}",
            if self.session.speaker_enabled { "enabled" } else { "disabled" }
        );
        self.publish(UiUpdate::Speaker {
            enabled: self.session.speaker_enabled,
        });
    }

    pub fn handle_event(&mut self, envelope: Envelope) {
        if envelope.epoch != self.epoch {
            match envelope.event {
                SessionEvent::DeviceAcquired(Ok(mut device)) => {
                    log::info!("Releasing capture device acquired after teardown");
                    device.stop_tracks();
                }
                _ => log::debug!(
                    "Ignoring event from epoch {} (current {})",
                    envelope.epoch,
                    self.epoch
                ),
            }
            return;
        }

        match envelope.event {
            SessionEvent::DeviceAcquired(Ok(device)) => self.on_device_ready(device),
            SessionEvent::DeviceAcquired(Err(e)) => self.on_device_failed(e),
            SessionEvent::Net(event) => self.on_net_event(event),
            SessionEvent::Captured(data) => self.on_captured(data),
            SessionEvent::PlaybackReleased(id) => self.on_playback_released(id),
        }
    }

    // ======================== Transitions ========================

    fn fire(&mut self, trigger: Trigger) -> bool {
        let from = self.session.status;
        let Some(t) = transition(from, trigger) else {
            log::debug!("{:?} ignored in {:?}", trigger, from);
            return false;
        };
        log::info!("Call {:?} -> {:?} ({:?})", from, t.to, trigger);
        self.session.status = t.to;
        for effect in t.effects {
            self.run_effect(effect);
        }
        self.publish(UiUpdate::Status {
            status: self.session.status,
            started_at: self.session.started_at,
        });
        true
    }

    fn run_effect(&mut self, effect: Effect) {
        match effect {
            Effect::ResetTranscript => {
                self.transcript.clear();
                self.publish(UiUpdate::TranscriptCleared);
            }
            Effect::SeedGreeting => {
                let greeting = self.settings.greeting.clone();
                self.append(Speaker::Ai, greeting);
            }
            Effect::RecordStart => {
                self.session.begin(Utc::now());
                log::info!("Call session {:?} started", self.session.id);
            }
            Effect::AcquireDevice => self.acquire_device(),
            Effect::StartCapture => self.start_capture(),
            Effect::ReleaseResources => self.release_resources(),
            Effect::NotifyConnectionError => self.notify(NoticeKind::ConnectionError),
            Effect::Teardown => {
                self.release_resources();
                self.session.reset();
                self.transcript.clear();
                self.publish(UiUpdate::TranscriptCleared);
                self.publish(UiUpdate::Muted { muted: false });
                self.publish(UiUpdate::Speaker { enabled: true });
            }
        }
    }

    // ======================== Resources ========================

    fn sender(&self) -> EventSender {
        EventSender {
            epoch: self.epoch,
            tx: self.events_tx.clone(),
        }
    }

    fn acquire_device(&mut self) {
        let acquirer = self.acquirer.clone();
        let sender = self.sender();
        // 不保存句柄：取消由 epoch 处理，迟到的设备在 handle_event 中释放
        tokio::spawn(async move {
            let result = acquirer.acquire().await;
            sender.send(SessionEvent::DeviceAcquired(result));
        });
    }

    fn on_device_ready(&mut self, mut device: Box<dyn CaptureDevice>) {
        if self.session.status != CallStatus::Connecting {
            log::warn!("Capture device arrived in {:?}, releasing", self.session.status);
            device.stop_tracks();
            return;
        }
        log::info!("Capture device ready ({})", device.mime_type());
        device.set_enabled(!self.session.muted);
        self.device = Some(device);

        let (net_tx, mut net_rx) = mpsc::unbounded_channel();
        let request = ConnectRequest {
            endpoint: self.endpoint.clone(),
            setup: SetupMessage::new(
                &self.settings.model,
                &self.settings.voice,
                &self.settings.system_instruction,
            ),
        };
        let handle = self.connector.open(request, net_tx);
        self.transport = Some(TransportLink {
            handle,
            ready_state: ReadyState::Connecting,
            handshake_complete: false,
        });

        let sender = self.sender();
        self.forwarders.push(tokio::spawn(async move {
            while let Some(event) = net_rx.recv().await {
                if !sender.send(SessionEvent::Net(event)) {
                    break;
                }
            }
        }));
    }

    fn on_device_failed(&mut self, error: DeviceError) {
        log::error!("Capture device acquisition failed: {}", error);
        let kind = match error {
            DeviceError::PermissionDenied(_) => NoticeKind::PermissionDenied,
            DeviceError::Unavailable(_) => NoticeKind::DeviceUnavailable,
            DeviceError::Unknown(_) => NoticeKind::DeviceError,
        };
        self.notify(kind);
        self.teardown();
    }

    fn start_capture(&mut self) {
        let Some(device) = self.device.as_mut() else {
            log::warn!("No capture device to start");
            return;
        };
        let (chunk_tx, mut chunk_rx) = mpsc::unbounded_channel();
        if let Err(e) = self.capture.start(device.as_mut(), chunk_tx) {
            // 录音失败不终止通话，只是不会上行音频
            log::error!("Failed to start capture: {:#}", e);
            return;
        }
        let sender = self.sender();
        self.forwarders.push(tokio::spawn(async move {
            while let Some(data) = chunk_rx.recv().await {
                if !sender.send(SessionEvent::Captured(data)) {
                    break;
                }
            }
        }));
    }

    /// Close the transport, stop capture, release the device and cancel
    /// playback. Idempotent; the status is left alone.
    fn release_resources(&mut self) {
        self.epoch += 1;

        if let Some(link) = self.transport.take() {
            log::info!("Closing transport");
            link.handle.close();
        }
        for forwarder in self.forwarders.drain(..) {
            forwarder.abort();
        }

        self.capture.stop(self.device.as_deref_mut());
        if let Some(mut device) = self.device.take() {
            device.stop_tracks();
            log::info!("Capture device released");
        }

        let cancelled = self.playback.cancel_all();
        if cancelled > 0 {
            log::info!("Cancelled {} playback(s)", cancelled);
        }
        if !self.speaking.is_empty() {
            self.speaking.clear();
            self.publish(UiUpdate::Speaking { active: false });
        }
    }

    // ======================== Inbound ========================

    fn on_net_event(&mut self, event: NetEvent) {
        match event {
            NetEvent::Opened => {
                if let Some(link) = self.transport.as_mut() {
                    link.ready_state = ReadyState::Open;
                }
            }
            NetEvent::SetupComplete => {
                if let Some(link) = self.transport.as_mut() {
                    link.handshake_complete = true;
                }
                self.fire(Trigger::HandshakeAcknowledged);
            }
            NetEvent::Content(content) => self.on_server_content(content),
            NetEvent::Audio(data) => self.play(InboundAudio::Binary(data)),
            NetEvent::Error(reason) => {
                log::error!("Transport error: {}", reason);
                if let Some(link) = self.transport.as_mut() {
                    link.ready_state = ReadyState::Closing;
                }
                self.fire(Trigger::TransportErrored);
            }
            NetEvent::Closed => {
                if let Some(link) = self.transport.as_mut() {
                    link.ready_state = ReadyState::Closed;
                }
                self.fire(Trigger::TransportClosed);
            }
        }
    }

    fn on_server_content(&mut self, content: ServerContent) {
        if let Some(heard) = content.input_transcription {
            let text = heard.text.trim();
            if !text.is_empty() {
                self.append(Speaker::User, text.to_string());
            }
        }

        for part in content.model_turn.map(|turn| turn.parts).unwrap_or_default() {
            if let Some(text) = part.text {
                self.append(Speaker::Ai, text);
            }
            if let Some(inline) = part.inline_data {
                self.play(InboundAudio::Inline {
                    mime_type: inline.mime_type,
                    data: inline.data,
                });
            }
        }

        if content.interrupted {
            log::info!("Model turn interrupted");
        }
        if content.turn_complete {
            log::debug!("Model turn complete");
        }
    }

    fn play(&mut self, payload: InboundAudio) {
        let sender = self.sender();
        let started = self.playback.process(payload, self.session.speaker_enabled, move |id| {
            sender.send(SessionEvent::PlaybackReleased(id));
        });
        if let Some(id) = started {
            let was_idle = self.speaking.is_empty();
            self.speaking.insert(id);
            if was_idle {
                self.publish(UiUpdate::Speaking { active: true });
            }
        }
    }

    fn on_playback_released(&mut self, id: u64) {
        self.playback.finished(id);
        if self.speaking.remove(&id) && self.speaking.is_empty() {
            self.publish(UiUpdate::Speaking { active: false });
        }
    }

    // ======================== Outbound ========================

    fn on_captured(&mut self, data: Vec<u8>) {
        let chunk = self.capture.chunk(data);
        let (ready_state, handshake_complete) = self
            .transport
            .as_ref()
            .map(|link| (link.ready_state, link.handshake_complete))
            .unwrap_or((ReadyState::Closed, false));

        let Some(envelope) =
            self.capture
                .submit(&chunk, ready_state, handshake_complete, self.session.muted)
        else {
            return;
        };
        if let Some(link) = self.transport.as_ref() {
            if !link.handle.send_audio(envelope) {
                log::warn!("Transport gone, chunk #{} lost", chunk.seq);
            }
        }
    }

    // ======================== UI ========================

    fn append(&mut self, speaker: Speaker, message: String) {
        let entry = self.transcript.append(speaker, message).clone();
        self.publish(UiUpdate::Transcript(entry));
    }

    fn notify(&self, kind: NoticeKind) {
        log::warn!("Notify user: {}", kind.text());
        self.publish(UiUpdate::notice(kind));
    }

    fn publish(&self, update: UiUpdate) {
        // UI 通道关闭时静默丢弃
        let _ = self.ui.send(update);
    }
}

impl Drop for CallController {
    fn drop(&mut self) {
        self.release_resources();
    }
}
