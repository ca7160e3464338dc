use ringbuf::traits::Producer;
use thiserror::Error;

use super::energy::EnergyCalculator;
use super::types::{FrameEvent, FRAME_SIZE};
use super::vad::VoiceActivityDetector;
use crate::config::VadConfig;

/// Commands from the control thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkletCommand {
    Start,
    Stop,
}

/// Hard failure inside the processor. Once raised the processor stops
/// processing until the next `Start`.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum WorkletFault {
    /// The consumer did not drain frames fast enough.
    #[error("frame queue full, frame {frame_number} could not be delivered")]
    Overrun { frame_number: u64 },
}

/// Destination for completed frames. Returns the frame back when full.
pub trait FrameSink {
    fn emit(&mut self, event: FrameEvent) -> Result<(), FrameEvent>;
}

impl FrameSink for ringbuf::HeapProd<FrameEvent> {
    fn emit(&mut self, event: FrameEvent) -> Result<(), FrameEvent> {
        self.try_push(event)
    }
}

/// Runs inside the capture callback: gate, 512-sample framing, energy and
/// VAD. Never blocks or allocates.
pub struct FrameProcessor {
    running: bool,
    faulted: bool,
    noise_gate_threshold: f32,
    buffer: [f32; FRAME_SIZE],
    buffer_index: usize,
    frame_number: u64,
    energy: EnergyCalculator,
    vad: VoiceActivityDetector,
}

impl FrameProcessor {
    /// Created stopped; send `Start` to begin.
    pub fn new(config: &VadConfig) -> Self {
        Self {
            running: false,
            faulted: false,
            noise_gate_threshold: config.noise_gate_threshold,
            buffer: [0.0; FRAME_SIZE],
            buffer_index: 0,
            frame_number: 0,
            energy: EnergyCalculator::new(),
            vad: VoiceActivityDetector::new(config),
        }
    }

    pub fn handle_command(&mut self, command: WorkletCommand) {
        match command {
            WorkletCommand::Start => {
                self.running = true;
                self.faulted = false;
                self.buffer_index = 0;
                self.frame_number = 0;
                self.energy.reset();
                self.vad.reset();
            }
            WorkletCommand::Stop => {
                self.running = false;
                self.buffer_index = 0;
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.running && !self.faulted
    }

    /// Feed mono samples. Returns the number of frames emitted.
    pub fn process<S: FrameSink>(
        &mut self,
        samples: &[f32],
        sink: &mut S,
    ) -> Result<usize, WorkletFault> {
        if !self.is_running() {
            return Ok(0);
        }

        let mut emitted = 0;
        for &sample in samples {
            self.buffer[self.buffer_index] = noise_gate(sample, self.noise_gate_threshold);
            self.buffer_index += 1;

            if self.buffer_index == FRAME_SIZE {
                self.buffer_index = 0;
                self.emit_frame(sink)?;
                emitted += 1;
            }
        }
        Ok(emitted)
    }

    fn emit_frame<S: FrameSink>(&mut self, sink: &mut S) -> Result<(), WorkletFault> {
        let energy = self.energy.calculate(&self.buffer);
        let vad = self.vad.process(energy.smoothed);
        let event = FrameEvent {
            frame: self.buffer,
            frame_number: self.frame_number,
            energy,
            vad,
        };

        if sink.emit(event).is_err() {
            self.faulted = true;
            return Err(WorkletFault::Overrun {
                frame_number: self.frame_number,
            });
        }
        self.frame_number += 1;
        Ok(())
    }
}

/// Zero samples below the gate threshold; pass everything else unchanged.
#[inline]
pub fn noise_gate(sample: f32, threshold: f32) -> f32 {
    if sample.abs() < threshold {
        0.0
    } else {
        sample
    }
}
