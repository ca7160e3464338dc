use thiserror::Error;

/// Coarse classification the UI layer branches on to pick its messaging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceErrorKind {
    /// "Grant microphone access."
    Permission,
    /// "Check your audio devices."
    Device,
    /// "Check your connection."
    Connection,
    /// Error reported by the remote service, shown verbatim.
    Remote,
    /// Local misconfiguration or encoding bug.
    Internal,
}

/// Error reported by the remote service in an `error` event.
#[derive(Debug, Clone, PartialEq, Eq, Default, serde::Deserialize)]
pub struct RemoteError {
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub param: Option<String>,
}

#[derive(Debug, Error)]
pub enum VoiceError {
    #[error("microphone access denied: {0}")]
    MicrophonePermissionDenied(String),

    #[error("audio device error: {0}")]
    AudioDevice(String),

    #[error("capture fault: {0}")]
    CaptureFault(String),

    #[error("websocket error: {0}")]
    WebSocket(String),

    #[error("connection timed out after {0}ms")]
    ConnectTimeout(u64),

    #[error("failed to connect after {attempts} attempts: {last_error}")]
    ReconnectExhausted { attempts: u32, last_error: String },

    #[error("remote error: {}", .0.message)]
    Remote(RemoteError),

    #[error("invalid audio payload: {0}")]
    InvalidAudio(String),

    #[error("resampler error: {0}")]
    Resample(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

impl VoiceError {
    pub fn kind(&self) -> VoiceErrorKind {
        match self {
            VoiceError::MicrophonePermissionDenied(_) => VoiceErrorKind::Permission,
            VoiceError::AudioDevice(_) | VoiceError::CaptureFault(_) => VoiceErrorKind::Device,
            VoiceError::WebSocket(_)
            | VoiceError::ConnectTimeout(_)
            | VoiceError::ReconnectExhausted { .. } => VoiceErrorKind::Connection,
            VoiceError::Remote(_) => VoiceErrorKind::Remote,
            VoiceError::InvalidAudio(_)
            | VoiceError::Resample(_)
            | VoiceError::Config(_)
            | VoiceError::Encode(_) => VoiceErrorKind::Internal,
        }
    }

    /// Whether the session cannot continue after this error.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.kind(),
            VoiceErrorKind::Permission | VoiceErrorKind::Device
        ) || matches!(self, VoiceError::ReconnectExhausted { .. })
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for VoiceError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        VoiceError::WebSocket(e.to_string())
    }
}

impl From<cpal::BuildStreamError> for VoiceError {
    fn from(e: cpal::BuildStreamError) -> Self {
        match e {
            cpal::BuildStreamError::BackendSpecific { err }
                if looks_like_permission_error(&err.description) =>
            {
                VoiceError::MicrophonePermissionDenied(err.description)
            }
            other => VoiceError::AudioDevice(other.to_string()),
        }
    }
}

impl From<cpal::DefaultStreamConfigError> for VoiceError {
    fn from(e: cpal::DefaultStreamConfigError) -> Self {
        VoiceError::AudioDevice(e.to_string())
    }
}

impl From<cpal::DevicesError> for VoiceError {
    fn from(e: cpal::DevicesError) -> Self {
        VoiceError::AudioDevice(e.to_string())
    }
}

impl From<cpal::PlayStreamError> for VoiceError {
    fn from(e: cpal::PlayStreamError) -> Self {
        VoiceError::AudioDevice(e.to_string())
    }
}

/// Backends report denied capture access as free-form text.
fn looks_like_permission_error(description: &str) -> bool {
    let lower = description.to_lowercase();
    lower.contains("permission") || lower.contains("denied") || lower.contains("not authorized")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_separate_permission_from_connection() {
        assert_eq!(
            VoiceError::MicrophonePermissionDenied("x".into()).kind(),
            VoiceErrorKind::Permission
        );
        assert_eq!(
            VoiceError::ReconnectExhausted {
                attempts: 3,
                last_error: "refused".into()
            }
            .kind(),
            VoiceErrorKind::Connection
        );
        assert_eq!(
            VoiceError::Remote(RemoteError::default()).kind(),
            VoiceErrorKind::Remote
        );
    }

    #[test]
    fn terminal_errors() {
        assert!(VoiceError::AudioDevice("gone".into()).is_terminal());
        assert!(VoiceError::ReconnectExhausted {
            attempts: 3,
            last_error: String::new()
        }
        .is_terminal());
        assert!(!VoiceError::WebSocket("reset".into()).is_terminal());
        assert!(!VoiceError::Remote(RemoteError::default()).is_terminal());
    }

    #[test]
    fn permission_text_is_recognised() {
        let err = cpal::BuildStreamError::BackendSpecific {
            err: cpal::BackendSpecificError {
                description: "Permission denied by the system".into(),
            },
        };
        assert!(matches!(
            VoiceError::from(err),
            VoiceError::MicrophonePermissionDenied(_)
        ));

        let err = cpal::BuildStreamError::DeviceNotAvailable;
        assert!(matches!(VoiceError::from(err), VoiceError::AudioDevice(_)));
    }

    #[test]
    fn remote_error_displays_message() {
        let err = VoiceError::Remote(RemoteError {
            kind: Some("invalid_request_error".into()),
            code: None,
            message: "bad audio".into(),
            param: None,
        });
        assert_eq!(err.to_string(), "remote error: bad audio");
    }
}
