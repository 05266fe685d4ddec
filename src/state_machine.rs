//! Call lifecycle as a pure transition table.
//!
//! The controller feeds [`Trigger`]s in and executes the returned [`Effect`]s;
//! nothing here touches I/O.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    Idle,
    Connecting,
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    StartRequested,
    HandshakeAcknowledged,
    TransportClosed,
    TransportErrored,
    EndRequested,
    Teardown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    ResetTranscript,
    SeedGreeting,
    RecordStart,
    AcquireDevice,
    StartCapture,
    /// Close transport, release device, drop pipelines. Status is kept.
    ReleaseResources,
    NotifyConnectionError,
    /// Release resources, reset the session, clear the transcript.
    Teardown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub to: CallStatus,
    pub effects: Vec<Effect>,
}

/// Next status and side effects, or `None` when `trigger` is not valid in
/// `from`.
pub fn transition(from: CallStatus, trigger: Trigger) -> Option<Transition> {
    use CallStatus::*;
    use Effect::*;

    let (to, effects) = match (from, trigger) {
        (Idle, Trigger::StartRequested) => (
            Connecting,
            vec![ResetTranscript, SeedGreeting, RecordStart, AcquireDevice],
        ),
        (Connecting, Trigger::HandshakeAcknowledged) => (Connected, vec![StartCapture]),
        (Connecting | Connected, Trigger::TransportClosed) => {
            (Disconnected, vec![ReleaseResources])
        }
        (Connecting | Connected, Trigger::TransportErrored) => {
            (Disconnected, vec![ReleaseResources, NotifyConnectionError])
        }
        (Connecting | Connected, Trigger::EndRequested) => (Disconnected, vec![ReleaseResources]),
        (_, Trigger::Teardown) => (Idle, vec![Effect::Teardown]),
        _ => return None,
    };

    Some(Transition { to, effects })
}

/// The aggregate root of one call.
#[derive(Debug, Clone, PartialEq)]
pub struct CallSession {
    pub id: Option<Uuid>,
    pub status: CallStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub muted: bool,
    pub speaker_enabled: bool,
}

impl Default for CallSession {
    fn default() -> Self {
        Self {
            id: None,
            status: CallStatus::Idle,
            started_at: None,
            muted: false,
            speaker_enabled: true,
        }
    }
}

impl CallSession {
    /// Stamp a new call. `started_at` is only written if unset.
    pub fn begin(&mut self, now: DateTime<Utc>) {
        if self.started_at.is_none() {
            self.started_at = Some(now);
            self.id = Some(Uuid::new_v4());
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn is_idle(&self) -> bool {
        self.status == CallStatus::Idle
    }
}
