use anyhow::Context;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use url::Url;

use crate::protocol::{ControlMessage, ServerContent, SetupMessage, classify_text};

/// What the transport reports to the controller. `Error` is always
/// followed by `Closed`.
#[derive(Debug)]
pub enum NetEvent {
    Opened,
    SetupComplete,
    Content(ServerContent),
    Audio(Bytes),
    Error(String),
    Closed,
}

#[derive(Debug)]
pub enum NetCommand {
    /// A serialized `realtimeInput` envelope.
    SendAudio(String),
    Close,
}

#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub endpoint: Url,
    pub setup: SetupMessage,
}

/// Embed the credential in the service URL as the `key` query parameter.
pub fn build_endpoint(ws_url: &str, credential: &str) -> anyhow::Result<Url> {
    let mut url = Url::parse(ws_url).with_context(|| format!("invalid ws_url '{}'", ws_url))?;
    match url.scheme() {
        "ws" | "wss" => {}
        other => anyhow::bail!("unsupported scheme '{}', expected ws or wss", other),
    }
    url.query_pairs_mut().append_pair("key", credential);
    Ok(url)
}

/// Opens duplex connections. The production implementation is
/// [`WsConnector`]; tests substitute their own.
pub trait Connector: Send + Sync {
    fn open(&self, request: ConnectRequest, events: mpsc::UnboundedSender<NetEvent>)
    -> TransportHandle;
}

/// Connection readiness as tracked by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// The controller's side of an open connection.
pub struct TransportHandle {
    commands: mpsc::UnboundedSender<NetCommand>,
    task: Option<JoinHandle<()>>,
}

impl TransportHandle {
    pub fn new(commands: mpsc::UnboundedSender<NetCommand>, task: Option<JoinHandle<()>>) -> Self {
        Self { commands, task }
    }

    /// Queue an audio envelope. Order of accepted envelopes is kept.
    pub fn send_audio(&self, envelope: String) -> bool {
        self.commands.send(NetCommand::SendAudio(envelope)).is_ok()
    }

    /// Ask the link to close gracefully and let go of it.
    pub fn close(mut self) {
        let _ = self.commands.send(NetCommand::Close);
        // The link finishes its close handshake on its own.
        self.task.take();
    }
}

pub struct WsConnector;

impl Connector for WsConnector {
    fn open(
        &self,
        request: ConnectRequest,
        events: mpsc::UnboundedSender<NetEvent>,
    ) -> TransportHandle {
        let (tx_cmd, rx_cmd) = mpsc::unbounded_channel();
        let link = NetLink::new(request, events, rx_cmd);
        let task = tokio::spawn(link.run());
        TransportHandle::new(tx_cmd, Some(task))
    }
}

pub struct NetLink {
    request: ConnectRequest,
    tx: mpsc::UnboundedSender<NetEvent>,
    rx_cmd: mpsc::UnboundedReceiver<NetCommand>,
    handshake_complete: bool,
}

impl NetLink {
    pub fn new(
        request: ConnectRequest,
        tx: mpsc::UnboundedSender<NetEvent>,
        rx_cmd: mpsc::UnboundedReceiver<NetCommand>,
    ) -> Self {
        Self {
            request,
            tx,
            rx_cmd,
            handshake_complete: false,
        }
    }

    // 单次连接，不自动重连
    pub async fn run(mut self) {
        if let Err(e) = self.connect_and_loop().await {
            log::error!("Connection error: {:#}", e);
            let _ = self.tx.send(NetEvent::Error(format!("{:#}", e)));
        }
        let _ = self.tx.send(NetEvent::Closed);
    }

    // 进入连接和主循环，处理WebSocket消息和发送命令
    async fn connect_and_loop(&mut self) -> anyhow::Result<()> {
        let host = self.request.endpoint.host_str().unwrap_or("?").to_string();
        log::info!("Connecting to {}...", host);

        // The key is part of the URL, so only the host is logged.
        let connect = connect_async(self.request.endpoint.to_string());
        tokio::pin!(connect);
        let ws_stream = loop {
            tokio::select! {
                res = &mut connect => break res?.0,
                cmd = self.rx_cmd.recv() => match cmd {
                    Some(NetCommand::SendAudio(_)) => {
                        log::warn!("Dropping audio: connection not open yet");
                    }
                    Some(NetCommand::Close) | None => {
                        log::info!("Close requested while connecting");
                        return Ok(());
                    }
                },
            }
        };
        log::info!("Connected to {}", host);

        let (mut write, mut read) = ws_stream.split();
        self.tx.send(NetEvent::Opened)?;

        // 连接建立后立即发送 setup 消息，且只发送一次
        let setup_json = serde_json::to_string(&self.request.setup)?;
        log::debug!("Sending setup: {}", setup_json);
        write.send(Message::Text(setup_json.into())).await?;

        loop {
            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => self.dispatch_text(text.as_str())?,
                        Some(Ok(Message::Binary(data))) => {
                            self.tx.send(NetEvent::Audio(data))?;
                        }
                        Some(Ok(Message::Close(frame))) => {
                            log::info!("Server closed connection: {:?}", frame);
                            return Ok(());
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return Err(e.into()),
                        None => {
                            log::info!("Connection stream ended");
                            return Ok(());
                        }
                    }
                }
                cmd = self.rx_cmd.recv() => {
                    match cmd {
                        Some(NetCommand::SendAudio(envelope)) => {
                            // 握手完成前发送音频是协议违规
                            if !self.handshake_complete {
                                log::warn!("Dropping audio sent before setupComplete");
                                continue;
                            }
                            write.send(Message::Text(envelope.into())).await?;
                        }
                        Some(NetCommand::Close) | None => {
                            log::info!("Closing connection");
                            let _ = write.send(Message::Close(None)).await;
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    fn dispatch_text(&mut self, text: &str) -> anyhow::Result<()> {
        match classify_text(text) {
            Ok(ControlMessage::SetupComplete) => {
                if self.handshake_complete {
                    log::warn!("Duplicate setupComplete ignored");
                } else {
                    log::info!("Setup acknowledged by server");
                    self.handshake_complete = true;
                    self.tx.send(NetEvent::SetupComplete)?;
                }
            }
            Ok(ControlMessage::ServerContent(content)) => {
                self.tx.send(NetEvent::Content(content))?;
            }
            Ok(ControlMessage::Unrecognized) => {
                log::debug!("Ignoring unrecognized message ({} bytes)", text.len());
            }
            Err(e) => {
                log::warn!("Dropping malformed control message: {}", e);
            }
        }
        Ok(())
    }
}
