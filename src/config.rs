use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::VoiceError;

// ── Realtime session ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeConfig {
    #[serde(default = "default_url")]
    pub url: String,
    /// Name of the environment variable holding the bearer token. When the
    /// variable is unset the connection is made without `Authorization`
    /// (e.g. through a backend proxy).
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_voice")]
    pub voice: String,
    #[serde(default = "default_instructions")]
    pub instructions: String,
    /// Let the remote service detect turns itself. Off by default because the
    /// client commits speech segments explicitly.
    #[serde(default)]
    pub server_vad: bool,
    /// Ask the AI to speak first once the session is ready.
    #[serde(default = "default_true")]
    pub greet_on_connect: bool,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_reconnect_backoff_ms")]
    pub reconnect_backoff_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            api_key_env: default_api_key_env(),
            voice: default_voice(),
            instructions: default_instructions(),
            server_vad: false,
            greet_on_connect: true,
            max_reconnect_attempts: default_max_reconnect_attempts(),
            reconnect_backoff_ms: default_reconnect_backoff_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl RealtimeConfig {
    pub fn api_key(&self) -> Option<String> {
        std::env::var(&self.api_key_env)
            .ok()
            .filter(|k| !k.trim().is_empty())
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

// ── Audio devices ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    #[serde(default)]
    pub input_device: Option<String>,
    #[serde(default)]
    pub output_device: Option<String>,
    /// Sample rate of the PCM16 stream exchanged with the remote service.
    #[serde(default = "default_wire_sample_rate")]
    pub wire_sample_rate: u32,
    #[serde(default = "default_true")]
    pub play_responses: bool,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            input_device: None,
            output_device: None,
            wire_sample_rate: default_wire_sample_rate(),
            play_responses: true,
        }
    }
}

// ── Voice activity detection ───────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VadConfig {
    #[serde(default = "default_noise_gate_threshold")]
    pub noise_gate_threshold: f32,
    #[serde(default = "default_speech_start_threshold")]
    pub speech_start_threshold: f32,
    #[serde(default = "default_speech_end_threshold")]
    pub speech_end_threshold: f32,
    #[serde(default = "default_min_speech_frames")]
    pub min_speech_frames: u32,
    #[serde(default = "default_min_silence_frames")]
    pub min_silence_frames: u32,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            noise_gate_threshold: default_noise_gate_threshold(),
            speech_start_threshold: default_speech_start_threshold(),
            speech_end_threshold: default_speech_end_threshold(),
            min_speech_frames: default_min_speech_frames(),
            min_silence_frames: default_min_silence_frames(),
        }
    }
}

// ── Turn taking ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnConfig {
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
    #[serde(default = "default_min_commit_duration_ms")]
    pub min_commit_duration_ms: f64,
    /// Frames kept from before speech onset and sent when speech starts.
    #[serde(default = "default_preroll_frames")]
    pub preroll_frames: usize,
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            settle_delay_ms: default_settle_delay_ms(),
            min_commit_duration_ms: default_min_commit_duration_ms(),
            preroll_frames: default_preroll_frames(),
        }
    }
}

impl TurnConfig {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}

// ── Noise suppression ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuppressionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// 0..=3, scales the noise estimate before subtraction.
    #[serde(default = "default_aggressiveness")]
    pub aggressiveness: u8,
    #[serde(default = "default_suppression_factor")]
    pub suppression_factor: f32,
    /// Lowest per-bin gain; keeps suppressed audio from going fully silent.
    #[serde(default = "default_minimum_mask")]
    pub minimum_mask: f32,
    #[serde(default = "default_min_voice_db")]
    pub min_voice_db: f32,
    #[serde(default = "default_voice_snr_db")]
    pub voice_snr_db: f32,
    #[serde(default = "default_true")]
    pub enable_bandpass_filter: bool,
    #[serde(default = "default_true")]
    pub enable_spectral_subtraction: bool,
    #[serde(default = "default_true")]
    pub enable_adaptive_noise: bool,
    #[serde(default = "default_bandpass_low_hz")]
    pub bandpass_low_hz: f32,
    #[serde(default = "default_bandpass_high_hz")]
    pub bandpass_high_hz: f32,
    #[serde(default = "default_calibration_ms")]
    pub calibration_ms: u64,
}

impl Default for SuppressionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            aggressiveness: default_aggressiveness(),
            suppression_factor: default_suppression_factor(),
            minimum_mask: default_minimum_mask(),
            min_voice_db: default_min_voice_db(),
            voice_snr_db: default_voice_snr_db(),
            enable_bandpass_filter: true,
            enable_spectral_subtraction: true,
            enable_adaptive_noise: true,
            bandpass_low_hz: default_bandpass_low_hz(),
            bandpass_high_hz: default_bandpass_high_hz(),
            calibration_ms: default_calibration_ms(),
        }
    }
}

// ── Top-level config ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub realtime: RealtimeConfig,
    #[serde(default)]
    pub audio: AudioConfig,
    #[serde(default)]
    pub vad: VadConfig,
    #[serde(default)]
    pub turn: TurnConfig,
    #[serde(default)]
    pub suppression: SuppressionConfig,
}

impl Config {
    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), VoiceError> {
        if self.vad.speech_end_threshold > self.vad.speech_start_threshold {
            return Err(VoiceError::Config(format!(
                "vad.speech_end_threshold ({}) must not exceed vad.speech_start_threshold ({})",
                self.vad.speech_end_threshold, self.vad.speech_start_threshold
            )));
        }
        if self.vad.min_speech_frames == 0 || self.vad.min_silence_frames == 0 {
            return Err(VoiceError::Config(
                "vad frame counts must be at least 1".into(),
            ));
        }
        if self.suppression.aggressiveness > 3 {
            return Err(VoiceError::Config(format!(
                "suppression.aggressiveness must be 0..=3, got {}",
                self.suppression.aggressiveness
            )));
        }
        if !(0.0..=1.0).contains(&self.suppression.minimum_mask) {
            return Err(VoiceError::Config(format!(
                "suppression.minimum_mask must be within 0..=1, got {}",
                self.suppression.minimum_mask
            )));
        }
        if self.audio.wire_sample_rate == 0 {
            return Err(VoiceError::Config("audio.wire_sample_rate must be > 0".into()));
        }
        Ok(())
    }
}

fn default_url() -> String {
    "wss://api.openai.com/v1/realtime?model=gpt-4o-realtime-preview".into()
}
fn default_api_key_env() -> String {
    "OPENAI_API_KEY".into()
}
fn default_voice() -> String {
    "alloy".into()
}
fn default_instructions() -> String {
    "You are a helpful AI assistant in a conversational interview.".into()
}
fn default_true() -> bool {
    true
}
fn default_max_reconnect_attempts() -> u32 {
    3
}
fn default_reconnect_backoff_ms() -> u64 {
    1000
}
fn default_connect_timeout_ms() -> u64 {
    15_000
}
fn default_wire_sample_rate() -> u32 {
    24_000
}
fn default_noise_gate_threshold() -> f32 {
    0.001
}
fn default_speech_start_threshold() -> f32 {
    0.02
}
fn default_speech_end_threshold() -> f32 {
    0.01
}
fn default_min_speech_frames() -> u32 {
    2
}
fn default_min_silence_frames() -> u32 {
    10
}
fn default_settle_delay_ms() -> u64 {
    1200
}
fn default_min_commit_duration_ms() -> f64 {
    100.0
}
fn default_preroll_frames() -> usize {
    10
}
fn default_aggressiveness() -> u8 {
    2
}
fn default_suppression_factor() -> f32 {
    0.8
}
fn default_minimum_mask() -> f32 {
    0.1
}
fn default_min_voice_db() -> f32 {
    -30.0
}
fn default_voice_snr_db() -> f32 {
    6.0
}
fn default_bandpass_low_hz() -> f32 {
    80.0
}
fn default_bandpass_high_hz() -> f32 {
    8000.0
}
fn default_calibration_ms() -> u64 {
    2000
}

/// Config file path: `$INTERVIEW_VOICE_CONFIG` or `./config.json`.
pub fn config_path() -> PathBuf {
    std::env::var_os("INTERVIEW_VOICE_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.json"))
}

/// Load config from `path`. A missing file yields defaults; an unreadable or
/// malformed one is an error.
pub fn load_config(path: &Path) -> Result<Config, VoiceError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            log::info!("No config at {:?}, using defaults", path);
            return Ok(Config::default());
        }
        Err(e) => {
            return Err(VoiceError::Config(format!("failed to read {:?}: {}", path, e)));
        }
    };
    parse_config(&contents)
}

pub fn parse_config(contents: &str) -> Result<Config, VoiceError> {
    let cfg: Config = serde_json::from_str(contents)
        .map_err(|e| VoiceError::Config(format!("invalid config: {}", e)))?;
    cfg.validate()?;
    Ok(cfg)
}
