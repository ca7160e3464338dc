use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, StreamConfig};
use ringbuf::{HeapRb, traits::{Consumer, Producer, Split}};

use super::pcm::decode_pcm16_base64;
use super::resampler::AudioResampler;
use crate::error::VoiceError;

/// Resampler chunk at the wire rate (20ms at 24kHz).
const WIRE_CHUNK_FRAMES: usize = 480;

/// Wrapper around cpal::Stream to make it Send+Sync.
struct SendStream(#[allow(dead_code)] cpal::Stream);
unsafe impl Send for SendStream {}
unsafe impl Sync for SendStream {}

/// Turns base64 PCM16 mono deltas at the wire rate into interleaved samples
/// at the device rate and channel count.
pub struct ResponseDecoder {
    resampler: AudioResampler,
    device_channels: usize,
}

impl ResponseDecoder {
    pub fn new(wire_rate: u32, device_rate: u32, device_channels: usize) -> Result<Self, VoiceError> {
        Ok(Self {
            resampler: AudioResampler::new(wire_rate, device_rate, WIRE_CHUNK_FRAMES, 1)?,
            device_channels: device_channels.max(1),
        })
    }

    pub fn decode(&mut self, delta: &str) -> Result<Vec<f32>, VoiceError> {
        let mono = decode_pcm16_base64(delta)?;
        let resampled = self.resampler.process(&mono)?;
        Ok(adapt_channels(&resampled, 1, self.device_channels))
    }
}

/// Writer end of the output ring, owned by the control task.
pub struct PlaybackSink {
    producer: ringbuf::HeapProd<f32>,
    decoder: ResponseDecoder,
}

impl PlaybackSink {
    pub fn new(producer: ringbuf::HeapProd<f32>, decoder: ResponseDecoder) -> Self {
        Self { producer, decoder }
    }

    /// Queue one response audio delta. Returns the number of device samples
    /// queued; samples that do not fit are dropped.
    pub fn play_delta(&mut self, delta: &str) -> Result<usize, VoiceError> {
        let samples = self.decoder.decode(delta)?;
        let pushed = self.producer.push_slice(&samples);
        if pushed < samples.len() {
            log::warn!("Playback buffer full, dropped {} samples", samples.len() - pushed);
        }
        Ok(pushed)
    }
}

pub struct AudioPlayback {
    stream: Option<SendStream>,
    pub device_rate: u32,
    pub device_channels: usize,
}

impl AudioPlayback {
    pub fn new() -> Self {
        Self {
            stream: None,
            device_rate: 0,
            device_channels: 0,
        }
    }

    /// Start the output stream on the given device (or default).
    pub fn start(
        &mut self,
        device_name: Option<&str>,
        wire_rate: u32,
    ) -> Result<PlaybackSink, VoiceError> {
        let host = cpal::default_host();
        let device = match device_name {
            Some(name) => host
                .output_devices()?
                .find(|d| d.name().map(|n| n == name).unwrap_or(false))
                .ok_or_else(|| {
                    VoiceError::AudioDevice(format!(
                        "output device '{}' not found (available: {})",
                        name,
                        list_output_devices().join(", ")
                    ))
                })?,
            None => host
                .default_output_device()
                .ok_or_else(|| VoiceError::AudioDevice("no default output device".into()))?,
        };

        let supported = device.default_output_config()?;
        self.device_rate = supported.sample_rate().0;
        self.device_channels = supported.channels() as usize;

        log::info!(
            "Playback device: {} ({}Hz, {}ch)",
            device.name().unwrap_or_default(),
            self.device_rate,
            self.device_channels,
        );

        // Responses arrive faster than real time: hold up to 30s.
        let buf_size = self.device_rate as usize * self.device_channels * 30;
        let (producer, mut consumer) = HeapRb::<f32>::new(buf_size.max(16384)).split();

        let config = StreamConfig {
            channels: self.device_channels as u16,
            sample_rate: SampleRate(self.device_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let stream = device.build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                for sample in data.iter_mut() {
                    *sample = consumer.try_pop().unwrap_or(0.0);
                }
            },
            |err| log::error!("cpal output error: {}", err),
            None,
        )?;
        stream.play()?;

        let decoder = ResponseDecoder::new(wire_rate, self.device_rate, self.device_channels)?;
        self.stream = Some(SendStream(stream));
        Ok(PlaybackSink::new(producer, decoder))
    }

    pub fn stop(&mut self) {
        if self.stream.take().is_some() {
            log::info!("Playback stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.stream.is_some()
    }
}

impl Default for AudioPlayback {
    fn default() -> Self {
        Self::new()
    }
}

/// Adapt between different channel counts.
pub fn adapt_channels(samples: &[f32], from_ch: usize, to_ch: usize) -> Vec<f32> {
    if from_ch == to_ch {
        return samples.to_vec();
    }
    let frames = samples.len() / from_ch;
    let mut out = Vec::with_capacity(frames * to_ch);
    for i in 0..frames {
        if to_ch == 1 {
            let mut sum = 0.0;
            for c in 0..from_ch {
                sum += samples[i * from_ch + c];
            }
            out.push(sum / from_ch as f32);
        } else {
            for c in 0..to_ch {
                if c < from_ch {
                    out.push(samples[i * from_ch + c]);
                } else {
                    out.push(samples[i * from_ch]);
                }
            }
        }
    }
    out
}

/// List available output devices.
pub fn list_output_devices() -> Vec<String> {
    let host = cpal::default_host();
    host.output_devices()
        .map(|devices| devices.filter_map(|d| d.name().ok()).collect())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::voice::pcm::encode_pcm16_base64;

    #[test]
    fn mono_fans_out_to_every_channel() {
        assert_eq!(adapt_channels(&[0.1, 0.2], 1, 2), vec![0.1, 0.1, 0.2, 0.2]);
    }

    #[test]
    fn stereo_folds_to_mono() {
        let out = adapt_channels(&[0.2, 0.4, -1.0, 1.0], 2, 1);
        assert_eq!(out.len(), 2);
        assert!((out[0] - 0.3).abs() < 1e-6);
        assert_eq!(out[1], 0.0);
    }

    #[test]
    fn decoder_matches_device_format() {
        let mut decoder = ResponseDecoder::new(24_000, 48_000, 2).unwrap();
        let delta = encode_pcm16_base64(&[0.25; 480]);
        let out = decoder.decode(&delta).unwrap();
        // 480 mono samples at 24kHz -> 960 frames at 48kHz -> 1920 interleaved.
        assert_eq!(out.len(), 1920);
    }

    #[test]
    fn same_rate_decoder_only_adapts_channels() {
        let mut decoder = ResponseDecoder::new(24_000, 24_000, 1).unwrap();
        let out = decoder.decode(&encode_pcm16_base64(&[0.5, -0.5])).unwrap();
        assert_eq!(out.len(), 2);
        assert!((out[0] - 0.5).abs() < 1e-3);
    }

    #[test]
    fn bad_delta_is_an_error() {
        let mut decoder = ResponseDecoder::new(24_000, 24_000, 1).unwrap();
        assert!(matches!(
            decoder.decode("###"),
            Err(VoiceError::InvalidAudio(_))
        ));
    }

    #[test]
    fn sink_queues_until_the_ring_is_full() {
        use ringbuf::traits::Observer;

        let (producer, consumer) = HeapRb::<f32>::new(1000).split();
        let decoder = ResponseDecoder::new(24_000, 24_000, 2).unwrap();
        let mut sink = PlaybackSink::new(producer, decoder);

        let delta = encode_pcm16_base64(&[0.1; 400]);
        assert_eq!(sink.play_delta(&delta).unwrap(), 800);
        assert_eq!(sink.play_delta(&delta).unwrap(), 200);
        assert_eq!(consumer.occupied_len(), 1000);
    }
}
