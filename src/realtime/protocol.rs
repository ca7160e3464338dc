//! JSON messages exchanged with the realtime service.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::RealtimeConfig;
use crate::error::RemoteError;

const AUDIO_FORMAT: &str = "pcm16";

/// Client → server.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    #[serde(rename = "session.update")]
    SessionUpdate { session: SessionSettings },
    #[serde(rename = "input_audio_buffer.append")]
    InputAudioBufferAppend { audio: String },
    #[serde(rename = "input_audio_buffer.commit")]
    InputAudioBufferCommit,
    #[serde(rename = "input_audio_buffer.clear")]
    InputAudioBufferClear,
    #[serde(rename = "response.create")]
    ResponseCreate,
}

impl ClientEvent {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::SessionUpdate { .. } => "session.update",
            ClientEvent::InputAudioBufferAppend { .. } => "input_audio_buffer.append",
            ClientEvent::InputAudioBufferCommit => "input_audio_buffer.commit",
            ClientEvent::InputAudioBufferClear => "input_audio_buffer.clear",
            ClientEvent::ResponseCreate => "response.create",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSettings {
    pub modalities: Vec<String>,
    pub instructions: String,
    pub voice: String,
    pub input_audio_format: String,
    pub output_audio_format: String,
    /// `null` hands segmentation and commits to the client.
    pub turn_detection: Option<TurnDetection>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TurnDetection {
    #[serde(rename = "type")]
    pub kind: String,
    pub threshold: f32,
    pub prefix_padding_ms: u32,
    pub silence_duration_ms: u32,
}

impl SessionSettings {
    pub fn from_config(config: &RealtimeConfig) -> Self {
        let turn_detection = config.server_vad.then(|| TurnDetection {
            kind: "server_vad".into(),
            threshold: 0.5,
            prefix_padding_ms: 100,
            silence_duration_ms: 500,
        });
        Self {
            modalities: vec!["text".into(), "audio".into()],
            instructions: config.instructions.clone(),
            voice: config.voice.clone(),
            input_audio_format: AUDIO_FORMAT.into(),
            output_audio_format: AUDIO_FORMAT.into(),
            turn_detection,
        }
    }
}

/// Server → client. Anything not listed lands in `Unknown`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "session.created")]
    SessionCreated {
        #[serde(default)]
        session: Value,
    },
    #[serde(rename = "session.updated")]
    SessionUpdated {
        #[serde(default)]
        session: Value,
    },
    #[serde(rename = "response.created")]
    ResponseCreated {
        #[serde(default)]
        response: Value,
    },
    #[serde(rename = "response.done")]
    ResponseDone {
        #[serde(default)]
        response: Value,
    },
    #[serde(rename = "input_audio_buffer.speech_started")]
    SpeechStarted {
        #[serde(default)]
        audio_start_ms: Option<u64>,
        #[serde(default)]
        item_id: Option<String>,
    },
    #[serde(rename = "input_audio_buffer.speech_stopped")]
    SpeechStopped {
        #[serde(default)]
        audio_end_ms: Option<u64>,
        #[serde(default)]
        item_id: Option<String>,
    },
    #[serde(rename = "input_audio_buffer.committed")]
    InputAudioBufferCommitted {
        #[serde(default)]
        item_id: Option<String>,
    },
    #[serde(
        rename = "response.output_audio.delta",
        alias = "response.audio.delta"
    )]
    OutputAudioDelta {
        delta: String,
        #[serde(default)]
        response_id: Option<String>,
    },
    #[serde(
        rename = "response.output_audio_transcript.delta",
        alias = "response.audio_transcript.delta"
    )]
    OutputAudioTranscriptDelta { delta: String },
    #[serde(rename = "response.output_text.delta", alias = "response.text.delta")]
    OutputTextDelta { delta: String },
    #[serde(rename = "conversation.item.input_audio_transcription.completed")]
    InputTranscriptionCompleted {
        #[serde(default)]
        transcript: String,
    },
    #[serde(rename = "conversation.item.created")]
    ConversationItemCreated {
        #[serde(default)]
        item: Value,
    },
    #[serde(rename = "error")]
    Error { error: RemoteError },
    #[serde(other)]
    Unknown,
}

impl ServerEvent {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Skip the chatty per-delta events in debug logs.
    pub fn is_delta(&self) -> bool {
        matches!(
            self,
            ServerEvent::OutputAudioDelta { .. }
                | ServerEvent::OutputAudioTranscriptDelta { .. }
                | ServerEvent::OutputTextDelta { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn unit_client_events_carry_only_type() {
        let json: Value = serde_json::from_str(&ClientEvent::InputAudioBufferCommit.to_json().unwrap()).unwrap();
        assert_eq!(json, json!({"type": "input_audio_buffer.commit"}));

        let json: Value = serde_json::from_str(&ClientEvent::ResponseCreate.to_json().unwrap()).unwrap();
        assert_eq!(json, json!({"type": "response.create"}));
    }

    #[test]
    fn append_carries_audio() {
        let event = ClientEvent::InputAudioBufferAppend {
            audio: "AAD/fw==".into(),
        };
        let json: Value = serde_json::from_str(&event.to_json().unwrap()).unwrap();
        assert_eq!(
            json,
            json!({"type": "input_audio_buffer.append", "audio": "AAD/fw=="})
        );
    }

    #[test]
    fn client_side_commits_send_null_turn_detection() {
        let config = RealtimeConfig::default();
        assert!(!config.server_vad);
        let event = ClientEvent::SessionUpdate {
            session: SessionSettings::from_config(&config),
        };
        let json: Value = serde_json::from_str(&event.to_json().unwrap()).unwrap();
        assert_eq!(json["type"], "session.update");
        assert!(json["session"]["turn_detection"].is_null());
        assert_eq!(json["session"]["input_audio_format"], "pcm16");
        assert_eq!(json["session"]["voice"], "alloy");
    }

    #[test]
    fn server_vad_settings() {
        let config = RealtimeConfig {
            server_vad: true,
            ..RealtimeConfig::default()
        };
        let json = serde_json::to_value(SessionSettings::from_config(&config)).unwrap();
        assert_eq!(json["turn_detection"]["type"], "server_vad");
        assert_eq!(json["turn_detection"]["prefix_padding_ms"], 100);
    }

    #[test]
    fn parses_both_audio_delta_names() {
        let new = ServerEvent::parse(r#"{"type":"response.output_audio.delta","delta":"AAA="}"#).unwrap();
        let old = ServerEvent::parse(r#"{"type":"response.audio.delta","delta":"AAA=","response_id":"r1"}"#).unwrap();
        assert!(matches!(new, ServerEvent::OutputAudioDelta { ref delta, .. } if delta == "AAA="));
        assert!(matches!(old, ServerEvent::OutputAudioDelta { response_id: Some(ref id), .. } if id == "r1"));
        assert!(new.is_delta());
    }

    #[test]
    fn error_event_keeps_all_fields() {
        let event = ServerEvent::parse(
            r#"{"type":"error","event_id":"e1","error":{"type":"invalid_request_error","code":"bad_audio","message":"Audio too short","param":null}}"#,
        )
        .unwrap();
        match event {
            ServerEvent::Error { error } => {
                assert_eq!(error.kind.as_deref(), Some("invalid_request_error"));
                assert_eq!(error.code.as_deref(), Some("bad_audio"));
                assert_eq!(error.message, "Audio too short");
                assert_eq!(error.param, None);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn unknown_types_are_tolerated() {
        let event = ServerEvent::parse(r#"{"type":"rate_limits.updated","rate_limits":[]}"#).unwrap();
        assert_eq!(event, ServerEvent::Unknown);
    }

    #[test]
    fn lifecycle_events_ignore_extra_fields() {
        let event = ServerEvent::parse(
            r#"{"type":"response.created","event_id":"x","response":{"id":"resp_1","status":"in_progress"}}"#,
        )
        .unwrap();
        assert!(matches!(event, ServerEvent::ResponseCreated { .. }));

        let event = ServerEvent::parse(r#"{"type":"session.created"}"#).unwrap();
        assert_eq!(event, ServerEvent::SessionCreated { session: Value::Null });
    }

    #[test]
    fn malformed_json_is_an_error() {
        assert!(ServerEvent::parse("{not json").is_err());
        assert!(ServerEvent::parse(r#"{"no_type":1}"#).is_err());
    }
}
