//! Wire types for the live speech service.
//!
//! Outbound: one `setup` message per connection, then `realtimeInput`
//! envelopes carrying base64 audio. Inbound text frames are classified into
//! [`ControlMessage`]; binary frames never reach this module.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

// ======================== Outbound ========================

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct SetupMessage {
    pub setup: Setup,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Setup {
    pub model: String,
    pub generation_config: GenerationConfig,
    pub system_instruction: Content,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<String>,
    pub speech_config: SpeechConfig,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct Content {
    pub parts: Vec<TextPart>,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct TextPart {
    pub text: String,
}

impl SetupMessage {
    /// Audio-only response with a prebuilt voice.
    pub fn new(model: &str, voice: &str, system_instruction: &str) -> Self {
        Self {
            setup: Setup {
                model: model.to_string(),
                generation_config: GenerationConfig {
                    response_modalities: vec!["AUDIO".to_string()],
                    speech_config: SpeechConfig {
                        voice_config: VoiceConfig {
                            prebuilt_voice_config: PrebuiltVoiceConfig {
                                voice_name: voice.to_string(),
                            },
                        },
                    },
                },
                system_instruction: Content {
                    parts: vec![TextPart {
                        text: system_instruction.to_string(),
                    }],
                },
            },
        }
    }
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInputMessage {
    pub realtime_input: RealtimeInput,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    pub media_chunks: Vec<MediaChunk>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MediaChunk {
    pub mime_type: String,
    /// base64
    pub data: String,
}

impl RealtimeInputMessage {
    pub fn single(mime_type: &str, data: String) -> Self {
        Self {
            realtime_input: RealtimeInput {
                media_chunks: vec![MediaChunk {
                    mime_type: mime_type.to_string(),
                    data,
                }],
            },
        }
    }
}

// ======================== Inbound ========================

#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServerContent {
    #[serde(default)]
    pub model_turn: Option<ModelTurn>,
    #[serde(default)]
    pub turn_complete: bool,
    #[serde(default)]
    pub interrupted: bool,
    #[serde(default)]
    pub input_transcription: Option<Transcription>,
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
pub struct ModelTurn {
    #[serde(default, deserialize_with = "lenient_parts")]
    pub parts: Vec<Part>,
}

// 单个 part 格式错误只丢弃该 part，同一消息里的其它 part 照常处理
fn lenient_parts<'de, D>(deserializer: D) -> Result<Vec<Part>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Vec::<Value>::deserialize(deserializer)?;
    Ok(raw
        .into_iter()
        .filter_map(|value| match serde_json::from_value::<Part>(value) {
            Ok(part) => Some(part),
            Err(e) => {
                log::warn!("Dropping malformed response part: {}", e);
                None
            }
        })
        .collect())
}

/// A response part; the service sets one of the two fields.
#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub inline_data: Option<InlineData>,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InlineData {
    pub mime_type: String,
    pub data: String,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct Transcription {
    #[serde(default)]
    pub text: String,
}

impl ServerContent {
    pub fn parts(&self) -> &[Part] {
        self.model_turn
            .as_ref()
            .map(|turn| turn.parts.as_slice())
            .unwrap_or(&[])
    }
}

/// Classified text frame.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlMessage {
    SetupComplete,
    ServerContent(ServerContent),
    /// Valid JSON the engine has no use for.
    Unrecognized,
}

/// Classify a text frame. Only structurally invalid JSON is an error;
/// unknown shapes come back as [`ControlMessage::Unrecognized`].
pub fn classify_text(text: &str) -> Result<ControlMessage, serde_json::Error> {
    let value: Value = serde_json::from_str(text)?;
    let Some(object) = value.as_object() else {
        return Ok(ControlMessage::Unrecognized);
    };

    if object.contains_key("setupComplete") {
        return Ok(ControlMessage::SetupComplete);
    }

    match object.get("serverContent") {
        Some(content) => {
            let content: ServerContent = serde_json::from_value(content.clone())?;
            Ok(ControlMessage::ServerContent(content))
        }
        None => Ok(ControlMessage::Unrecognized),
    }
}
