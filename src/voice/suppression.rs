use std::f32::consts::PI;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use serde::Serialize;

use super::energy::rms;
use crate::config::SuppressionConfig;

const DB_FLOOR: f32 = 1e-6;
/// Minimum-tracking coefficient: the floor falls instantly and rises slowly.
const FLOOR_RISE: f32 = 0.998;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct NoiseMetrics {
    pub snr_db: f32,
    pub volume_db: f32,
    pub noise_level_db: f32,
    pub is_voice_detected: bool,
    pub noise_reduction_db: f32,
}

#[derive(Debug, Clone)]
pub struct ProcessedAudio {
    pub audio: Vec<f32>,
    pub metrics: NoiseMetrics,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CalibrationStatus {
    pub is_calibrated: bool,
    /// 0..=100
    pub progress: u8,
}

/// Calibrated background spectrum. Built during the initial silence window,
/// then read-only until reset.
#[derive(Debug, Clone)]
pub struct NoiseProfile {
    baseline: Vec<f32>,
    frames: u32,
    target_frames: u32,
    budget: Duration,
    started_at: Option<Instant>,
    calibrated: bool,
}

impl NoiseProfile {
    fn new(bins: usize, target_frames: u32, budget: Duration) -> Self {
        Self {
            baseline: vec![0.0; bins],
            frames: 0,
            target_frames: target_frames.max(1),
            budget,
            started_at: None,
            calibrated: false,
        }
    }

    /// Fold one silent spectrum into the running mean.
    fn accumulate(&mut self, spectrum: &[f32], now: Instant) {
        if self.calibrated {
            return;
        }
        let started = *self.started_at.get_or_insert(now);

        self.frames += 1;
        let n = self.frames as f32;
        for (b, &s) in self.baseline.iter_mut().zip(spectrum) {
            *b += (s - *b) / n;
        }

        if self.frames >= self.target_frames || now.duration_since(started) >= self.budget {
            self.calibrated = true;
        }
    }

    pub fn is_calibrated(&self) -> bool {
        self.calibrated
    }

    pub fn baseline(&self) -> &[f32] {
        &self.baseline
    }

    fn status(&self) -> CalibrationStatus {
        let progress = if self.calibrated {
            100
        } else {
            ((self.frames as f32 / self.target_frames as f32) * 100.0).min(99.0) as u8
        };
        CalibrationStatus {
            is_calibrated: self.calibrated,
            progress,
        }
    }
}

/// RBJ biquad, transposed direct form II.
#[derive(Debug, Clone)]
struct Biquad {
    b0: f32,
    b1: f32,
    b2: f32,
    a1: f32,
    a2: f32,
    z1: f32,
    z2: f32,
}

impl Biquad {
    fn high_pass(sample_rate: f32, cutoff: f32) -> Self {
        let (cos_w, alpha) = Self::prewarp(sample_rate, cutoff);
        let a0 = 1.0 + alpha;
        Self::normalized(
            (1.0 + cos_w) / 2.0,
            -(1.0 + cos_w),
            (1.0 + cos_w) / 2.0,
            a0,
            -2.0 * cos_w,
            1.0 - alpha,
        )
    }

    fn low_pass(sample_rate: f32, cutoff: f32) -> Self {
        let (cos_w, alpha) = Self::prewarp(sample_rate, cutoff);
        let a0 = 1.0 + alpha;
        Self::normalized(
            (1.0 - cos_w) / 2.0,
            1.0 - cos_w,
            (1.0 - cos_w) / 2.0,
            a0,
            -2.0 * cos_w,
            1.0 - alpha,
        )
    }

    fn prewarp(sample_rate: f32, cutoff: f32) -> (f32, f32) {
        let w0 = 2.0 * PI * cutoff / sample_rate;
        let q = std::f32::consts::FRAC_1_SQRT_2;
        (w0.cos(), w0.sin() / (2.0 * q))
    }

    fn normalized(b0: f32, b1: f32, b2: f32, a0: f32, a1: f32, a2: f32) -> Self {
        Self {
            b0: b0 / a0,
            b1: b1 / a0,
            b2: b2 / a0,
            a1: a1 / a0,
            a2: a2 / a0,
            z1: 0.0,
            z2: 0.0,
        }
    }

    #[inline]
    fn process(&mut self, x: f32) -> f32 {
        let y = self.b0 * x + self.z1;
        self.z1 = self.b1 * x - self.a1 * y + self.z2;
        self.z2 = self.b2 * x - self.a2 * y;
        y
    }

    fn reset(&mut self) {
        self.z1 = 0.0;
        self.z2 = 0.0;
    }
}

#[derive(Debug, Clone)]
struct BandPass {
    high_pass: Biquad,
    low_pass: Biquad,
}

impl BandPass {
    fn new(sample_rate: u32, low_hz: f32, high_hz: f32) -> Self {
        let sr = sample_rate as f32;
        // Keep the low-pass corner safely below Nyquist.
        let high = high_hz.min(sr * 0.45);
        let low = low_hz.clamp(1.0, high * 0.5);
        Self {
            high_pass: Biquad::high_pass(sr, low),
            low_pass: Biquad::low_pass(sr, high),
        }
    }

    fn process(&mut self, samples: &mut [f32]) {
        for s in samples.iter_mut() {
            *s = self.low_pass.process(self.high_pass.process(*s));
        }
    }

    fn reset(&mut self) {
        self.high_pass.reset();
        self.low_pass.reset();
    }
}

/// Square-root periodic Hann. Used for both analysis and synthesis, so the
/// squared window overlap-adds to exactly 1 at 50% overlap.
fn sqrt_hann(size: usize) -> Vec<f32> {
    (0..size)
        .map(|i| (PI * i as f32 / size as f32).sin())
        .collect()
}

/// Band-pass, then STFT spectral subtraction (50% overlap-add, one hop of
/// latency), then adaptive floor tracking. Gains stay within
/// `[minimum_mask, 1]`. The metrics are advisory and never gate sending.
pub struct NoiseSuppressor {
    config: SuppressionConfig,
    sample_rate: u32,
    fft_size: usize,
    hop: usize,
    forward: Arc<dyn Fft<f32>>,
    inverse: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
    window_rms: f32,
    spectrum: Vec<Complex<f32>>,
    scratch: Vec<Complex<f32>>,
    magnitudes: Vec<f32>,
    /// Last `fft_size` band-passed samples: the current analysis block.
    history: Vec<f32>,
    /// Windowed tail of the previous block, added to the next hop.
    overlap: Vec<f32>,
    bandpass: BandPass,
    profile: NoiseProfile,
    /// Working noise estimate; seeded from the frozen baseline.
    adaptive_floor: Vec<f32>,
}

impl NoiseSuppressor {
    pub fn new(config: SuppressionConfig, sample_rate: u32, fft_size: usize) -> Self {
        let mut planner = FftPlanner::new();
        let forward = planner.plan_fft_forward(fft_size);
        let inverse = planner.plan_fft_inverse(fft_size);
        let scratch_len = forward
            .get_inplace_scratch_len()
            .max(inverse.get_inplace_scratch_len());
        let bins = fft_size / 2 + 1;
        let hop = (fft_size / 2).max(1);
        let window = sqrt_hann(fft_size);
        let window_rms = (window.iter().map(|w| w * w).sum::<f32>() / fft_size.max(1) as f32)
            .sqrt()
            .max(DB_FLOOR);

        let frame_ms = fft_size as f64 * 1000.0 / sample_rate.max(1) as f64;
        let target_frames = (config.calibration_ms as f64 / frame_ms).ceil() as u32;
        let budget = Duration::from_millis(config.calibration_ms);
        let bandpass = BandPass::new(sample_rate, config.bandpass_low_hz, config.bandpass_high_hz);

        Self {
            config,
            sample_rate,
            fft_size,
            hop,
            forward,
            inverse,
            window,
            window_rms,
            spectrum: vec![Complex::new(0.0, 0.0); fft_size],
            scratch: vec![Complex::new(0.0, 0.0); scratch_len],
            magnitudes: vec![0.0; bins],
            history: vec![0.0; fft_size],
            overlap: vec![0.0; hop],
            bandpass,
            profile: NoiseProfile::new(bins, target_frames, budget),
            adaptive_floor: vec![0.0; bins],
        }
    }

    /// Feed a frame known to contain only background noise. Safe to call
    /// repeatedly; does nothing once calibrated.
    pub fn calibrate_from_silence(&mut self, frame: &[f32]) -> CalibrationStatus {
        self.calibrate_from_silence_at(frame, Instant::now())
    }

    pub fn calibrate_from_silence_at(&mut self, frame: &[f32], now: Instant) -> CalibrationStatus {
        if self.profile.is_calibrated() || frame.len() != self.fft_size {
            return self.profile.status();
        }

        self.analyze(frame);
        self.profile.accumulate(&self.magnitudes, now);

        if self.profile.is_calibrated() {
            self.adaptive_floor.copy_from_slice(self.profile.baseline());
            log::info!(
                "Noise profile calibrated from {} frames",
                self.profile.frames
            );
        }
        self.profile.status()
    }

    pub fn calibration_status(&self) -> CalibrationStatus {
        self.profile.status()
    }

    pub fn is_calibrated(&self) -> bool {
        self.profile.is_calibrated()
    }

    pub fn profile(&self) -> &NoiseProfile {
        &self.profile
    }

    pub fn reset_calibration(&mut self) {
        self.profile = NoiseProfile::new(
            self.magnitudes.len(),
            self.profile.target_frames,
            self.profile.budget,
        );
        self.adaptive_floor.iter_mut().for_each(|v| *v = 0.0);
        self.history.iter_mut().for_each(|v| *v = 0.0);
        self.overlap.iter_mut().for_each(|v| *v = 0.0);
        self.bandpass.reset();
        log::info!("Noise calibration reset");
    }

    pub fn update_config(&mut self, config: SuppressionConfig) {
        self.bandpass = BandPass::new(
            self.sample_rate,
            config.bandpass_low_hz,
            config.bandpass_high_hz,
        );
        self.config = config;
        log::debug!("Noise suppression config updated: {:?}", self.config);
    }

    pub fn config(&self) -> &SuppressionConfig {
        &self.config
    }

    pub fn process_audio(&mut self, frame: &[f32]) -> ProcessedAudio {
        let mut audio = frame.to_vec();

        if self.config.enable_bandpass_filter {
            self.bandpass.process(&mut audio);
        }

        // Runs before calibration too (unit gains) so the output latency
        // never changes mid-stream.
        let spectral = self.config.enable_spectral_subtraction
            && !audio.is_empty()
            && audio.len() % self.hop == 0;

        let noise_rms = if self.profile.is_calibrated() {
            self.noise_rms()
        } else {
            0.0
        };

        if spectral {
            self.subtract(&mut audio);
        }

        for s in audio.iter_mut() {
            *s = s.clamp(-1.0, 1.0);
        }

        let input_rms = rms(frame);
        let output_rms = rms(&audio);
        let volume_db = to_db(input_rms);
        let noise_level_db = to_db(noise_rms);
        let snr_db = volume_db - noise_level_db;
        let is_voice_detected =
            volume_db > self.config.min_voice_db && snr_db > self.config.voice_snr_db;
        let noise_reduction_db = if input_rms > DB_FLOOR {
            (volume_db - to_db(output_rms)).max(0.0)
        } else {
            0.0
        };

        if self.config.enable_adaptive_noise
            && self.profile.is_calibrated()
            && !is_voice_detected
            && frame.len() == self.fft_size
        {
            self.track_floor(frame);
        }

        ProcessedAudio {
            audio,
            metrics: NoiseMetrics {
                snr_db,
                volume_db,
                noise_level_db,
                is_voice_detected,
                noise_reduction_db,
            },
        }
    }

    /// Windowed forward FFT of `samples` into `self.spectrum`, magnitudes
    /// into `self.magnitudes`.
    fn analyze(&mut self, samples: &[f32]) {
        for ((c, &s), &w) in self.spectrum.iter_mut().zip(samples).zip(&self.window) {
            *c = Complex::new(s * w, 0.0);
        }
        self.forward
            .process_with_scratch(&mut self.spectrum, &mut self.scratch);
        for (m, c) in self.magnitudes.iter_mut().zip(&self.spectrum) {
            *m = c.norm();
        }
    }

    fn noise_estimate(&self, bin: usize) -> f32 {
        let floor = if self.config.enable_adaptive_noise {
            self.adaptive_floor[bin]
        } else {
            self.profile.baseline()[bin]
        };
        floor * (1.0 + 0.1 * self.config.aggressiveness as f32)
    }

    /// Process `audio` in place one hop at a time. Each hop slides the
    /// analysis block, and the output is the overlap-add of the previous
    /// block's tail and the current block's head, delayed by one hop.
    fn subtract(&mut self, audio: &mut [f32]) {
        let n = self.fft_size;
        let hop = self.hop;
        let scale = 1.0 / n as f32;

        for chunk in audio.chunks_mut(hop) {
            self.history.copy_within(hop.., 0);
            self.history[n - hop..].copy_from_slice(chunk);

            let block = std::mem::take(&mut self.history);
            self.analyze(&block);
            self.history = block;

            if self.profile.is_calibrated() {
                self.apply_gains();
            }
            self.inverse
                .process_with_scratch(&mut self.spectrum, &mut self.scratch);

            for (i, out) in chunk.iter_mut().enumerate() {
                *out = self.overlap[i] + self.spectrum[i].re * scale * self.window[i];
                self.overlap[i] =
                    self.spectrum[hop + i].re * scale * self.window[hop + i];
            }
        }
    }

    fn apply_gains(&mut self) {
        let n = self.fft_size;
        let factor = self.config.suppression_factor;
        let mask_floor = self.config.minimum_mask.clamp(0.0, 1.0);
        for k in 0..self.magnitudes.len() {
            let mag = self.magnitudes[k];
            let gain = if mag > f32::EPSILON {
                (1.0 - factor * self.noise_estimate(k) / mag).clamp(mask_floor, 1.0)
            } else {
                1.0
            };
            self.spectrum[k] *= gain;
            // Mirror bin keeps the inverse transform real.
            if k != 0 && k != n - k {
                self.spectrum[n - k] *= gain;
            }
        }
    }

    fn track_floor(&mut self, frame: &[f32]) {
        self.analyze(frame);
        for (floor, &mag) in self.adaptive_floor.iter_mut().zip(&self.magnitudes) {
            *floor = mag.min(FLOOR_RISE * *floor + (1.0 - FLOOR_RISE) * mag);
        }
    }

    /// Time-domain RMS implied by the current noise estimate (Parseval,
    /// corrected for the analysis window).
    fn noise_rms(&self) -> f32 {
        let sum_sq: f32 = (0..self.magnitudes.len())
            .map(|k| {
                let v = self.noise_estimate(k);
                v * v
            })
            .sum();
        (2.0 * sum_sq).sqrt() / self.fft_size as f32 / self.window_rms
    }
}

fn to_db(amplitude: f32) -> f32 {
    20.0 * amplitude.max(DB_FLOOR).log10()
}
