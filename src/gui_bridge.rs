use crate::config::Config;
use crate::state_machine::CallStatus;
use crate::transcript::TranscriptEntry;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

/// Commands from the UI process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UiCommand {
    StartCall,
    EndCall,
    ToggleMute,
    ToggleSpeaker,
}

/// Classified, user-facing reason for a session-fatal error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeKind {
    PermissionDenied,
    DeviceUnavailable,
    DeviceError,
    ConnectionError,
}

impl NoticeKind {
    pub fn text(self) -> &'static str {
        match self {
            NoticeKind::PermissionDenied => {
                "Microphone access was denied. Allow microphone access and try again."
            }
            NoticeKind::DeviceUnavailable => {
                "The microphone is busy or missing. Close other apps using it and try again."
            }
            NoticeKind::DeviceError => "Could not start the microphone.",
            NoticeKind::ConnectionError => "The connection to the voice service was lost.",
        }
    }
}

/// State pushed to the UI process.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UiUpdate {
    Status {
        status: CallStatus,
        started_at: Option<DateTime<Utc>>,
    },
    Transcript(TranscriptEntry),
    TranscriptCleared,
    Speaking {
        active: bool,
    },
    Muted {
        muted: bool,
    },
    Speaker {
        enabled: bool,
    },
    Notification {
        kind: NoticeKind,
        text: &'static str,
    },
}

impl UiUpdate {
    pub fn notice(kind: NoticeKind) -> Self {
        UiUpdate::Notification {
            kind,
            text: kind.text(),
        }
    }
}

pub enum GuiEvent {
    Command(UiCommand),
}

pub struct GuiBridge {
    socket: Arc<UdpSocket>,
    target_addr: String,
    tx: mpsc::Sender<GuiEvent>,
    buffer_size: usize,
}

// GUI进程和Core进程通过本地UDP通信，端口在配置中指定
impl GuiBridge {
    pub async fn new(config: &Config, tx: mpsc::Sender<GuiEvent>) -> anyhow::Result<Self> {
        // 绑定本地UDP端口
        let socket =
            UdpSocket::bind(format!("{}:{}", config.gui_local_ip, config.gui_local_port)).await?;
        let target_addr = format!("{}:{}", config.gui_remote_ip, config.gui_remote_port);

        Ok(Self {
            socket: Arc::new(socket),
            target_addr,
            tx,
            buffer_size: config.gui_buffer_size,
        })
    }

    pub async fn run(&self) -> anyhow::Result<()> {
        let mut buf = vec![0u8; self.buffer_size];
        loop {
            // 通过UDP socket接收消息
            let (len, _) = self.socket.recv_from(&mut buf).await?;
            if len == 0 {
                continue;
            }
            match serde_json::from_slice::<UiCommand>(&buf[..len]) {
                Ok(cmd) => {
                    if self.tx.send(GuiEvent::Command(cmd)).await.is_err() {
                        log::warn!("GUI event receiver dropped");
                        break;
                    }
                }
                Err(e) => log::warn!("Ignoring GUI datagram: {}", e),
            }
        }
        Ok(())
    }

    pub async fn send_update(&self, update: &UiUpdate) -> anyhow::Result<()> {
        let msg = serde_json::to_string(update)?;
        self.socket
            .send_to(msg.as_bytes(), &self.target_addr)
            .await?;
        Ok(())
    }
}
