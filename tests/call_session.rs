mod common;

use std::sync::Arc;

use bytes::Bytes;
use serde_json::Value;
use tokio::sync::Notify;

use common::{FakeAcquirer, FakeSpeaker, Harness, pcm, wav};
use live_call_rs::audio::device::DeviceError;
use live_call_rs::gui_bridge::{NoticeKind, UiUpdate};
use live_call_rs::net_link::{NetCommand, NetEvent};
use live_call_rs::protocol::{ControlMessage, classify_text};
use live_call_rs::state_machine::{CallSession, CallStatus};
use live_call_rs::transcript::Speaker;

fn content(json: &str) -> NetEvent {
    match classify_text(json).unwrap() {
        ControlMessage::ServerContent(content) => NetEvent::Content(content),
        other => panic!("not server content: {:?}", other),
    }
}

fn audio_envelopes(commands: &[NetCommand]) -> Vec<Value> {
    commands
        .iter()
        .filter_map(|cmd| match cmd {
            NetCommand::SendAudio(json) => Some(serde_json::from_str(json).unwrap()),
            NetCommand::Close => None,
        })
        .collect()
}

fn notices(updates: &[UiUpdate]) -> Vec<NoticeKind> {
    updates
        .iter()
        .filter_map(|u| match u {
            UiUpdate::Notification { kind, .. } => Some(*kind),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn call_connects_and_streams_microphone_audio() {
    let mut h = Harness::new(FakeAcquirer::granting());

    h.controller.start_call();
    assert_eq!(h.controller.status(), CallStatus::Connecting);
    assert!(h.controller.session().started_at.is_some());
    let entries = h.controller.transcript().entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].speaker, Speaker::Ai);
    assert_eq!(entries[0].message, "Hello there");

    h.settle().await;
    assert_eq!(h.connector.opened(), 1);
    h.connector.with_link(0, |link| {
        assert_eq!(link.request.setup.setup.model, common::settings().model);
        assert_eq!(link.request.endpoint.host_str(), Some("voice.test"));
    });

    // No recording until the service acknowledges the setup
    h.push(NetEvent::Opened);
    h.settle().await;
    assert_eq!(h.controller.status(), CallStatus::Connecting);
    assert!(!h.probe.emit(pcm(4)));

    h.push(NetEvent::SetupComplete);
    h.settle().await;
    assert_eq!(h.controller.status(), CallStatus::Connected);
    assert!(h.controller.is_capturing());

    assert!(h.probe.emit(vec![0x00, 0x01, 0x02, 0x03]));
    assert!(h.probe.emit(pcm(2)));
    h.settle().await;

    let sent = audio_envelopes(&h.sent());
    assert_eq!(sent.len(), 2);
    let media = &sent[0]["realtimeInput"]["mediaChunks"][0];
    assert_eq!(media["mimeType"], "audio/pcm;rate=16000");
    assert_eq!(media["data"], "AAECAw==");

    let statuses: Vec<CallStatus> = h
        .ui_updates()
        .into_iter()
        .filter_map(|u| match u {
            UiUpdate::Status { status, .. } => Some(status),
            _ => None,
        })
        .collect();
    assert_eq!(statuses, vec![CallStatus::Connecting, CallStatus::Connected]);
}

#[tokio::test]
async fn muted_chunks_are_dropped_not_buffered() {
    let mut h = Harness::new(FakeAcquirer::granting());
    h.connect().await;
    assert_eq!(h.probe.state().enabled, Some(true));

    h.controller.toggle_mute();
    assert!(h.controller.session().muted);
    assert_eq!(h.probe.state().enabled, Some(false));
    h.probe.emit(pcm(2));
    h.probe.emit(pcm(2));
    h.settle().await;
    assert!(audio_envelopes(&h.sent()).is_empty());

    h.controller.toggle_mute();
    h.probe.emit(pcm(2));
    h.settle().await;
    assert_eq!(audio_envelopes(&h.sent()).len(), 1);
}

#[tokio::test]
async fn permission_denied_returns_to_idle_with_one_notice() {
    let mut h = Harness::new(FakeAcquirer::failing(DeviceError::PermissionDenied(
        "EACCES".to_string(),
    )));

    h.controller.start_call();
    h.settle().await;

    assert_eq!(h.controller.status(), CallStatus::Idle);
    assert_eq!(h.connector.opened(), 0);
    assert!(h.controller.transcript().is_empty());
    let updates = h.ui_updates();
    assert_eq!(notices(&updates), vec![NoticeKind::PermissionDenied]);
}

#[tokio::test]
async fn busy_device_is_reported_as_unavailable() {
    let mut h = Harness::new(FakeAcquirer::failing(DeviceError::Unavailable(
        "EBUSY".to_string(),
    )));
    h.controller.start_call();
    h.settle().await;
    assert_eq!(h.controller.status(), CallStatus::Idle);
    assert_eq!(notices(&h.ui_updates()), vec![NoticeKind::DeviceUnavailable]);
}

#[tokio::test]
async fn model_turn_parts_are_routed_in_order() {
    let mut h = Harness::new(FakeAcquirer::granting());
    h.connect().await;

    h.push(content(
        r#"{"serverContent":{"inputTranscription":{"text":"what time is it"}}}"#,
    ));
    h.push(content(
        r#"{"serverContent":{"modelTurn":{"parts":[
            {"text":"It is noon."},
            {"inlineData":{"mimeType":"audio/pcm;rate=24000","data":"AAAAAA=="}}
        ]}}}"#,
    ));
    h.settle().await;

    let entries = h.controller.transcript().entries();
    let lines: Vec<(Speaker, &str)> = entries
        .iter()
        .map(|e| (e.speaker, e.message.as_str()))
        .collect();
    assert_eq!(
        lines,
        vec![
            (Speaker::Ai, "Hello there"),
            (Speaker::User, "what time is it"),
            (Speaker::Ai, "It is noon."),
        ]
    );
    assert_eq!(h.speaker.render_count(), 1);
    assert_eq!(h.speaker.rendered.lock().unwrap()[0].sample_rate, 24000);
}

#[tokio::test]
async fn binary_frames_play_and_toggle_speaking() {
    let mut h = Harness::new(FakeAcquirer::granting());
    h.connect().await;
    h.ui_updates();

    h.push(NetEvent::Audio(Bytes::from(pcm(240))));
    h.settle().await;

    assert_eq!(h.speaker.render_count(), 1);
    assert!(!h.controller.is_speaking());
    let speaking: Vec<bool> = h
        .ui_updates()
        .into_iter()
        .filter_map(|u| match u {
            UiUpdate::Speaking { active } => Some(active),
            _ => None,
        })
        .collect();
    assert_eq!(speaking, vec![true, false]);
}

fn speaking_updates(updates: Vec<UiUpdate>) -> Vec<bool> {
    updates
        .into_iter()
        .filter_map(|u| match u {
            UiUpdate::Speaking { active } => Some(active),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn binary_wav_frame_plays_at_its_own_rate() {
    let mut h = Harness::new(FakeAcquirer::granting());
    h.connect().await;

    h.push(NetEvent::Audio(Bytes::from(wav(16000, &[100; 160]))));
    h.settle().await;

    let rendered = h.speaker.rendered.lock().unwrap();
    assert_eq!(rendered.len(), 1);
    assert_eq!(rendered[0].sample_rate, 16000);
    assert_eq!(rendered[0].samples, vec![100; 160]);
}

#[tokio::test]
async fn blank_text_parts_still_become_entries() {
    let mut h = Harness::new(FakeAcquirer::granting());
    h.connect().await;

    h.push(content(
        r#"{"serverContent":{"modelTurn":{"parts":[{"text":" "},{"text":"ok"}]}}}"#,
    ));
    h.settle().await;

    let messages: Vec<&str> = h
        .controller
        .transcript()
        .entries()
        .iter()
        .map(|e| e.message.as_str())
        .collect();
    assert_eq!(messages, vec!["Hello there", " ", "ok"]);
}

#[tokio::test]
async fn ending_during_playback_cancels_it() {
    let hold = Arc::new(Notify::new());
    let mut h = Harness::with_speaker(FakeAcquirer::granting(), FakeSpeaker::holding(hold.clone()));
    h.connect().await;
    h.ui_updates();

    h.push(NetEvent::Audio(Bytes::from(pcm(240))));
    h.settle().await;
    assert!(h.controller.is_speaking());

    h.controller.end_call();
    assert_eq!(h.controller.status(), CallStatus::Idle);
    assert!(!h.controller.is_speaking());

    // The aborted render never completes and its release is from the old call
    hold.notify_one();
    h.settle().await;

    assert_eq!(h.controller.status(), CallStatus::Idle);
    assert!(!h.controller.is_speaking());
    assert_eq!(h.speaker.render_count(), 0);
    assert_eq!(speaking_updates(h.ui_updates()), vec![true, false]);
}

#[tokio::test]
async fn undecodable_audio_is_skipped() {
    let mut h = Harness::new(FakeAcquirer::granting());
    h.connect().await;

    // Three bytes is not whole PCM frames, and not WAV either
    h.push(NetEvent::Audio(Bytes::from_static(&[1, 2, 3])));
    h.settle().await;

    assert_eq!(h.speaker.render_count(), 0);
    assert!(!h.controller.is_speaking());
    assert_eq!(h.controller.status(), CallStatus::Connected);
}

#[tokio::test]
async fn speaker_toggle_applies_to_later_payloads_only() {
    let hold = Arc::new(Notify::new());
    let mut h = Harness::with_speaker(FakeAcquirer::granting(), FakeSpeaker::holding(hold.clone()));
    h.connect().await;

    h.push(NetEvent::Audio(Bytes::from(pcm(240))));
    h.settle().await;
    assert!(h.controller.is_speaking());

    h.controller.toggle_speaker();
    assert!(!h.controller.session().speaker_enabled);
    h.push(NetEvent::Audio(Bytes::from(pcm(240))));
    h.settle().await;

    hold.notify_one();
    h.settle().await;
    assert_eq!(h.speaker.render_count(), 1);
    assert!(!h.controller.is_speaking());

    h.controller.toggle_speaker();
    h.push(NetEvent::Audio(Bytes::from(pcm(240))));
    h.settle().await;
    hold.notify_one();
    h.settle().await;
    assert_eq!(h.speaker.render_count(), 2);
}

#[tokio::test]
async fn transport_error_disconnects_and_releases_device() {
    let mut h = Harness::new(FakeAcquirer::granting());
    h.connect().await;
    h.ui_updates();

    h.push(NetEvent::Error("connection reset".to_string()));
    h.push(NetEvent::Closed);
    h.settle().await;

    assert_eq!(h.controller.status(), CallStatus::Disconnected);
    assert!(!h.controller.has_transport());
    assert!(!h.controller.has_device());
    assert!(h.probe.state().tracks_stopped);
    assert!(!h.probe.emit(pcm(2)));
    // Transcript survives until the call is ended
    assert_eq!(h.controller.transcript().len(), 1);
    assert_eq!(notices(&h.ui_updates()), vec![NoticeKind::ConnectionError]);

    h.controller.end_call();
    assert_eq!(h.controller.status(), CallStatus::Idle);
    assert!(h.controller.transcript().is_empty());
}

#[tokio::test]
async fn server_close_without_error_is_silent() {
    let mut h = Harness::new(FakeAcquirer::granting());
    h.connect().await;
    h.ui_updates();

    h.push(NetEvent::Closed);
    h.settle().await;

    assert_eq!(h.controller.status(), CallStatus::Disconnected);
    assert!(notices(&h.ui_updates()).is_empty());
}

#[tokio::test]
async fn end_call_is_idempotent_from_every_state() {
    // idle
    let mut h = Harness::new(FakeAcquirer::granting());
    h.controller.end_call();
    h.controller.end_call();
    assert_eq!(h.controller.status(), CallStatus::Idle);

    // connected
    h.connect().await;
    h.controller.end_call();
    h.controller.end_call();
    assert_eq!(h.controller.status(), CallStatus::Idle);
    assert_eq!(*h.controller.session(), CallSession::default());
    assert!(h.probe.state().tracks_stopped);
    assert!(h.sent().iter().any(|cmd| matches!(cmd, NetCommand::Close)));

    // disconnected
    let mut h = Harness::new(FakeAcquirer::granting());
    h.connect().await;
    h.push(NetEvent::Closed);
    h.settle().await;
    assert_eq!(h.controller.status(), CallStatus::Disconnected);
    h.controller.end_call();
    h.controller.end_call();
    assert_eq!(h.controller.status(), CallStatus::Idle);
}

#[tokio::test]
async fn device_granted_after_end_is_released() {
    let gate = Arc::new(Notify::new());
    let mut h = Harness::new(FakeAcquirer::gated(gate.clone()));

    h.controller.start_call();
    h.settle().await;
    assert_eq!(h.controller.status(), CallStatus::Connecting);

    h.controller.end_call();
    assert_eq!(h.controller.status(), CallStatus::Idle);

    gate.notify_one();
    h.settle().await;

    assert_eq!(h.controller.status(), CallStatus::Idle);
    assert!(h.probe.state().tracks_stopped);
    assert!(!h.controller.has_device());
    assert_eq!(h.connector.opened(), 0);
}

#[tokio::test]
async fn new_call_after_end_starts_fresh() {
    let mut h = Harness::new(FakeAcquirer::granting());
    h.connect().await;
    h.push(content(
        r#"{"serverContent":{"modelTurn":{"parts":[{"text":"First call"}]}}}"#,
    ));
    h.settle().await;
    h.controller.toggle_mute();
    h.controller.end_call();

    h.controller.start_call();
    h.settle().await;
    assert_eq!(h.connector.opened(), 2);
    assert!(!h.controller.session().muted);
    assert_eq!(h.controller.transcript().len(), 1);
    assert_eq!(h.controller.transcript().entries()[0].message, "Hello there");
}
