use std::time::Duration;

/// Environment variable that overrides the compiled-in credential.
pub const API_KEY_ENV: &str = "LIVE_CALL_API_KEY";

#[derive(Debug, Clone)]
pub struct Config {
    // 网络配置
    pub ws_url: &'static str,
    pub api_key: String,

    // 会话与音频参数
    pub session: SessionSettings,
    pub audio: AudioSettings,

    // GUI进程配置
    pub gui_local_port: u16,
    pub gui_remote_port: u16,
    pub gui_local_ip: &'static str,
    pub gui_remote_ip: &'static str,
    pub gui_buffer_size: usize,
}

/// Parameters the call controller needs for each session.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub model: String,
    pub voice: String,
    pub system_instruction: String,
    /// First AI entry seeded into the transcript when a call starts.
    pub greeting: String,
    /// Capture timeslice; one outbound chunk per slice.
    pub chunk_duration: Duration,
    /// MIME type assumed for raw binary frames from the peer.
    pub binary_mime_type: String,
    /// Tried in order after the declared type is rejected.
    pub fallback_mime_types: Vec<String>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            model: "models/gemini-2.0-flash-exp".to_string(),
            voice: "Puck".to_string(),
            system_instruction: "You are a friendly voice assistant.".to_string(),
            greeting: "Hi! I'm listening.".to_string(),
            chunk_duration: Duration::from_millis(250),
            binary_mime_type: "audio/pcm;rate=24000".to_string(),
            fallback_mime_types: vec![
                "audio/pcm;rate=24000".to_string(),
                "audio/wav".to_string(),
                "audio/opus".to_string(),
            ],
        }
    }
}

/// ALSA device selection.
#[derive(Debug, Clone)]
pub struct AudioSettings {
    pub capture_device: String,
    pub playback_device: String,
    pub capture_sample_rate: u32,
    pub capture_channels: u32,
}

impl Config {
    /// 从编译时设置的环境变量创建配置
    /// 所有参数都在编译时从 config.toml 中读取，只有凭据可以在运行时覆盖
    pub fn new() -> Result<Self, &'static str> {
        let api_key = std::env::var(API_KEY_ENV)
            .ok()
            .filter(|k| !k.trim().is_empty())
            .unwrap_or_else(|| env!("API_KEY").to_string());

        let chunk_ms: u64 = env!("AUDIO_CHUNK_DURATION_MS")
            .parse()
            .map_err(|_| "Failed to parse AUDIO_CHUNK_DURATION_MS")?;
        if chunk_ms == 0 {
            return Err("AUDIO_CHUNK_DURATION_MS must be positive");
        }

        Ok(Self {
            ws_url: env!("WS_URL"),
            api_key,

            session: SessionSettings {
                model: env!("SESSION_MODEL").to_string(),
                voice: env!("SESSION_VOICE").to_string(),
                system_instruction: env!("SESSION_SYSTEM_INSTRUCTION").to_string(),
                greeting: env!("SESSION_GREETING").to_string(),
                chunk_duration: Duration::from_millis(chunk_ms),
                binary_mime_type: env!("AUDIO_BINARY_MIME_TYPE").to_string(),
                fallback_mime_types: split_list(env!("AUDIO_FALLBACK_MIME_TYPES")),
            },
            audio: AudioSettings {
                capture_device: env!("AUDIO_CAPTURE_DEVICE").to_string(),
                playback_device: env!("AUDIO_PLAYBACK_DEVICE").to_string(),
                capture_sample_rate: env!("AUDIO_CAPTURE_SAMPLE_RATE")
                    .parse()
                    .map_err(|_| "Failed to parse AUDIO_CAPTURE_SAMPLE_RATE")?,
                capture_channels: env!("AUDIO_CAPTURE_CHANNELS")
                    .parse()
                    .map_err(|_| "Failed to parse AUDIO_CAPTURE_CHANNELS")?,
            },

            gui_local_port: env!("GUI_LOCAL_PORT")
                .parse()
                .map_err(|_| "Failed to parse GUI_LOCAL_PORT")?,
            gui_remote_port: env!("GUI_REMOTE_PORT")
                .parse()
                .map_err(|_| "Failed to parse GUI_REMOTE_PORT")?,
            gui_local_ip: env!("GUI_LOCAL_IP"),
            gui_remote_ip: env!("GUI_REMOTE_IP"),
            gui_buffer_size: env!("GUI_BUFFER_SIZE")
                .parse()
                .map_err(|_| "Failed to parse GUI_BUFFER_SIZE")?,
        })
    }

    pub fn app_name() -> &'static str {
        env!("APP_NAME")
    }

    pub fn app_version() -> &'static str {
        env!("APP_VERSION")
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
