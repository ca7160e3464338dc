use crate::config::VadConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeechTransition {
    Started,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VadDecision {
    pub is_speaking: bool,
    pub energy: f32,
    /// In speech: not currently trending toward silence. In silence: this
    /// frame completed a speech confirmation. Kept asymmetric on purpose.
    pub confirmed: bool,
    pub transition: Option<SpeechTransition>,
}

/// Two thresholds and consecutive-frame counts debounce speech/silence.
#[derive(Debug, Clone)]
pub struct VoiceActivityDetector {
    start_threshold: f32,
    end_threshold: f32,
    min_speech_frames: u32,
    min_silence_frames: u32,
    is_speaking: bool,
    speech_frame_count: u32,
    silence_frame_count: u32,
}

impl VoiceActivityDetector {
    pub fn new(config: &VadConfig) -> Self {
        Self {
            start_threshold: config.speech_start_threshold,
            end_threshold: config.speech_end_threshold,
            min_speech_frames: config.min_speech_frames.max(1),
            min_silence_frames: config.min_silence_frames.max(1),
            is_speaking: false,
            speech_frame_count: 0,
            silence_frame_count: 0,
        }
    }

    /// Advance the state machine by one frame of smoothed energy.
    pub fn process(&mut self, energy: f32) -> VadDecision {
        let mut transition = None;

        let confirmed = if !self.is_speaking {
            if energy > self.start_threshold {
                self.speech_frame_count += 1;
                if self.speech_frame_count >= self.min_speech_frames {
                    self.is_speaking = true;
                    self.speech_frame_count = 0;
                    self.silence_frame_count = 0;
                    transition = Some(SpeechTransition::Started);
                    log::debug!("VAD: speech started (energy {:.4})", energy);
                    true
                } else {
                    false
                }
            } else {
                self.speech_frame_count = 0;
                false
            }
        } else {
            if energy < self.end_threshold {
                self.silence_frame_count += 1;
                if self.silence_frame_count >= self.min_silence_frames {
                    self.is_speaking = false;
                    self.speech_frame_count = 0;
                    self.silence_frame_count = 0;
                    transition = Some(SpeechTransition::Stopped);
                    log::debug!("VAD: speech stopped (energy {:.4})", energy);
                }
            } else {
                self.silence_frame_count = 0;
            }
            // Evaluated in the branch taken, so a Speech -> Silence frame is
            // unconfirmed.
            self.is_speaking && self.silence_frame_count == 0
        };

        VadDecision {
            is_speaking: self.is_speaking,
            energy,
            confirmed,
            transition,
        }
    }

    pub fn is_speaking(&self) -> bool {
        self.is_speaking
    }

    pub fn speech_frame_count(&self) -> u32 {
        self.speech_frame_count
    }

    pub fn silence_frame_count(&self) -> u32 {
        self.silence_frame_count
    }

    pub fn reset(&mut self) {
        self.is_speaking = false;
        self.speech_frame_count = 0;
        self.silence_frame_count = 0;
    }
}
