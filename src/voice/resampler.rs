use rubato::{FftFixedIn, Resampler};

use crate::error::VoiceError;

/// Wraps rubato to convert between the device sample rate and the wire rate.
/// Accepts input of any length: samples are buffered until a full chunk is
/// available, so the filter state stays continuous across calls.
pub struct AudioResampler {
    resampler: Option<FftFixedIn<f32>>,
    input_frames: usize,
    channels: usize,
    pending: Vec<f32>,
}

impl AudioResampler {
    /// Create a resampler that converts `from_rate` → `to_rate`.
    /// `chunk_size` is the number of frames per input chunk. Equal rates
    /// produce a pass-through.
    pub fn new(
        from_rate: u32,
        to_rate: u32,
        chunk_size: usize,
        channels: usize,
    ) -> Result<Self, VoiceError> {
        let channels = channels.max(1);
        let resampler = if from_rate == to_rate {
            None
        } else {
            Some(
                FftFixedIn::new(
                    from_rate as usize,
                    to_rate as usize,
                    chunk_size,
                    1, // sub_chunks
                    channels,
                )
                .map_err(|e| VoiceError::Resample(e.to_string()))?,
            )
        };

        Ok(Self {
            resampler,
            input_frames: chunk_size,
            channels,
            pending: Vec::with_capacity(chunk_size * channels * 2),
        })
    }

    /// Resample interleaved f32 samples. Returns whatever complete output
    /// chunks became available; the remainder waits for the next call.
    pub fn process(&mut self, interleaved: &[f32]) -> Result<Vec<f32>, VoiceError> {
        let Some(resampler) = self.resampler.as_mut() else {
            return Ok(interleaved.to_vec());
        };

        self.pending.extend_from_slice(interleaved);
        let chunk_len = self.input_frames * self.channels;
        let mut result = Vec::new();

        while self.pending.len() >= chunk_len {
            // De-interleave into per-channel vecs
            let mut channels: Vec<Vec<f32>> = (0..self.channels)
                .map(|_| Vec::with_capacity(self.input_frames))
                .collect();
            for (i, sample) in self.pending.drain(..chunk_len).enumerate() {
                channels[i % self.channels].push(sample);
            }

            let output = resampler
                .process(&channels, None)
                .map_err(|e| VoiceError::Resample(e.to_string()))?;

            // Re-interleave
            let out_frames = output[0].len();
            result.reserve(out_frames * self.channels);
            for i in 0..out_frames {
                for ch in &output {
                    result.push(ch[i]);
                }
            }
        }
        Ok(result)
    }

    pub fn is_passthrough(&self) -> bool {
        self.resampler.is_none()
    }
}
