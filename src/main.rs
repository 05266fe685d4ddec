use std::sync::Arc;

use anyhow::anyhow;
use tokio::signal;
use tokio::sync::mpsc;

use live_call_rs::audio::{AlsaAcquirer, AlsaPlayback};
use live_call_rs::config::Config;
use live_call_rs::controller::{CallController, CallDeps};
use live_call_rs::gui_bridge::{GuiBridge, GuiEvent, UiUpdate};
use live_call_rs::net_link::{WsConnector, build_endpoint};

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    // 初始化日志
    env_logger::init();

    // 加载配置
    let config = Config::new().map_err(|e| anyhow!(e))?;
    if config.api_key.is_empty() {
        log::warn!("No API key configured; the service will reject the connection");
    }
    let endpoint = build_endpoint(config.ws_url, &config.api_key)?;

    // GUI进程通道
    let (tx_gui_event, mut rx_gui_event) = mpsc::channel::<GuiEvent>(100);
    // 发往GUI的状态更新
    let (tx_ui, mut rx_ui) = mpsc::unbounded_channel::<UiUpdate>();

    // 启动GUI桥，接收通话命令，推送状态
    let gui_bridge = Arc::new(GuiBridge::new(&config, tx_gui_event).await?);
    let gui_bridge_clone = gui_bridge.clone();
    tokio::spawn(async move {
        if let Err(e) = gui_bridge_clone.run().await {
            log::error!("GuiBridge error: {}", e);
        }
    });

    // 播放线程常驻，麦克风在每次通话开始时才打开
    let deps = CallDeps {
        acquirer: Arc::new(AlsaAcquirer::new(&config.audio)),
        connector: Arc::new(WsConnector),
        playback: Arc::new(AlsaPlayback::start(&config.audio.playback_device)?),
    };
    let (mut controller, mut session_events) =
        CallController::new(config.session.clone(), endpoint, deps, tx_ui);

    log::info!(
        "{} {} started. Status: {:?}",
        Config::app_name(),
        Config::app_version(),
        controller.status()
    );

    loop {
        tokio::select! {
            // 监听 Ctrl+C 信号
            _ = signal::ctrl_c() => {
                log::info!("Received Ctrl+C, shutting down...");
                controller.end_call();
                break;
            }

            Some(GuiEvent::Command(cmd)) = rx_gui_event.recv() => {
                controller.handle_ui_command(cmd);
            }

            Some(envelope) = session_events.recv() => {
                controller.handle_event(envelope);
            }

            Some(update) = rx_ui.recv() => {
                if let Err(e) = gui_bridge.send_update(&update).await {
                    log::warn!("Failed to send to GUI: {}", e);
                }
            }
        }
    }

    // 把关闭前的最后状态推给GUI
    while let Ok(update) = rx_ui.try_recv() {
        if let Err(e) = gui_bridge.send_update(&update).await {
            log::warn!("Failed to send to GUI: {}", e);
        }
    }
    Ok(())
}
