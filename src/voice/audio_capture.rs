use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, StreamConfig};
use ringbuf::{HeapRb, traits::{Consumer, Split}};
use tokio::sync::mpsc;

use super::frame_processor::{FrameProcessor, WorkletCommand};
use super::types::FrameEvent;
use crate::config::VadConfig;
use crate::error::VoiceError;

/// Completed frames buffered between the callback and the control task
/// (~680ms at 48kHz).
const FRAME_RING_CAPACITY: usize = 64;
const COMMAND_RING_CAPACITY: usize = 8;
/// Mono samples down-mixed per pass; larger callbacks are processed in pieces.
const SCRATCH_FRAMES: usize = 4096;

/// Wrapper around cpal::Stream to make it Send+Sync.
/// The stream handle never leaves the engine; cpal marks it !Send as a
/// cross-platform precaution.
struct SendStream(#[allow(dead_code)] cpal::Stream);
unsafe impl Send for SendStream {}
unsafe impl Sync for SendStream {}

/// Ring ends handed to the control task on start.
pub struct CaptureOutput {
    pub frames: ringbuf::HeapCons<FrameEvent>,
    pub commands: ringbuf::HeapProd<WorkletCommand>,
    pub faults: mpsc::UnboundedReceiver<VoiceError>,
    pub sample_rate: u32,
}

pub struct AudioCapture {
    stream: Option<SendStream>,
    sample_rate: u32,
}

impl AudioCapture {
    pub fn new() -> Self {
        Self {
            stream: None,
            sample_rate: 0,
        }
    }

    /// Open the given device (or default) and move a fresh frame processor
    /// into its callback. The processor starts stopped; send
    /// [`WorkletCommand::Start`] once the consumer is ready.
    pub fn start(
        &mut self,
        device_name: Option<&str>,
        vad: &VadConfig,
    ) -> Result<CaptureOutput, VoiceError> {
        let host = cpal::default_host();
        let device = match device_name {
            Some(name) => host
                .input_devices()?
                .find(|d| d.name().map(|n| n == name).unwrap_or(false))
                .ok_or_else(|| {
                    VoiceError::AudioDevice(format!(
                        "input device '{}' not found (available: {})",
                        name,
                        list_input_devices().join(", ")
                    ))
                })?,
            None => host
                .default_input_device()
                .ok_or_else(|| VoiceError::AudioDevice("no default input device".into()))?,
        };

        let supported = device.default_input_config()?;
        let device_rate = supported.sample_rate().0;
        let device_channels = supported.channels() as usize;

        log::info!(
            "Capture device: {} ({}Hz, {}ch)",
            device.name().unwrap_or_default(),
            device_rate,
            device_channels,
        );

        let (mut frame_prod, frame_cons) = HeapRb::<FrameEvent>::new(FRAME_RING_CAPACITY).split();
        let (command_prod, mut command_cons) =
            HeapRb::<WorkletCommand>::new(COMMAND_RING_CAPACITY).split();
        let (fault_tx, fault_rx) = mpsc::unbounded_channel();

        let mut processor = FrameProcessor::new(vad);
        let mut scratch = vec![0.0f32; SCRATCH_FRAMES];

        let config = StreamConfig {
            channels: device_channels as u16,
            sample_rate: SampleRate(device_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let callback_faults = fault_tx.clone();
        let stream = device.build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                while let Some(command) = command_cons.try_pop() {
                    processor.handle_command(command);
                }
                if !processor.is_running() {
                    return;
                }
                for chunk in data.chunks(SCRATCH_FRAMES * device_channels) {
                    let n = downmix_into(chunk, device_channels, &mut scratch);
                    if let Err(fault) = processor.process(&scratch[..n], &mut frame_prod) {
                        let _ = callback_faults.send(VoiceError::CaptureFault(fault.to_string()));
                        return;
                    }
                }
            },
            move |err| {
                log::error!("cpal input error: {}", err);
                let mapped = match err {
                    cpal::StreamError::DeviceNotAvailable => {
                        VoiceError::AudioDevice("input device disconnected".into())
                    }
                    other => VoiceError::CaptureFault(other.to_string()),
                };
                let _ = fault_tx.send(mapped);
            },
            None,
        )?;
        stream.play()?;

        self.stream = Some(SendStream(stream));
        self.sample_rate = device_rate;

        Ok(CaptureOutput {
            frames: frame_cons,
            commands: command_prod,
            faults: fault_rx,
            sample_rate: device_rate,
        })
    }

    /// Drop the device stream; the processor goes with its callback.
    pub fn stop(&mut self) {
        if self.stream.take().is_some() {
            log::info!("Capture stopped");
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn is_running(&self) -> bool {
        self.stream.is_some()
    }
}

impl Default for AudioCapture {
    fn default() -> Self {
        Self::new()
    }
}

/// Average interleaved channels into `out`. Returns the number of mono
/// samples written; input beyond `out`'s capacity is ignored.
pub fn downmix_into(interleaved: &[f32], channels: usize, out: &mut [f32]) -> usize {
    if channels <= 1 {
        let n = interleaved.len().min(out.len());
        out[..n].copy_from_slice(&interleaved[..n]);
        return n;
    }
    let frames = (interleaved.len() / channels).min(out.len());
    let scale = 1.0 / channels as f32;
    for (i, slot) in out[..frames].iter_mut().enumerate() {
        let base = i * channels;
        *slot = interleaved[base..base + channels].iter().sum::<f32>() * scale;
    }
    frames
}

/// List available input devices.
pub fn list_input_devices() -> Vec<String> {
    let host = cpal::default_host();
    host.input_devices()
        .map(|devices| devices.filter_map(|d| d.name().ok()).collect())
        .unwrap_or_default()
}
