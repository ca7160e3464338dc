use serde::Serialize;

use super::energy::EnergyReading;
use super::vad::VadDecision;
use crate::error::VoiceError;
use crate::realtime::protocol::ServerEvent;
use crate::realtime::turn::TurnState;

/// Samples per analysis frame (~10.7ms at 48kHz).
pub const FRAME_SIZE: usize = 512;

/// One completed capture frame. The samples are a copy of the processor's
/// reused buffer.
#[derive(Debug, Clone)]
pub struct FrameEvent {
    pub frame: [f32; FRAME_SIZE],
    pub frame_number: u64,
    pub energy: EnergyReading,
    pub vad: VadDecision,
}

#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct CalibrationProgress {
    /// 0..=100
    pub progress: u8,
    pub message: String,
}

/// Events from the voice engine to the UI layer.
#[derive(Debug)]
pub enum EngineEvent {
    Frame(Box<FrameEvent>),
    CalibrationProgress(CalibrationProgress),
    CalibrationComplete,
    Turn(TurnState),
    /// Inbound protocol event, payload untouched.
    Server(ServerEvent),
    /// The remote service started a response nobody asked for.
    UnpromptedResponse,
    Error(VoiceError),
    /// The engine reached its terminal state; no further events follow.
    Stopped,
}
