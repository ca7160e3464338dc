use base64::Engine;

use crate::error::VoiceError;

/// Float samples to little-endian signed 16-bit PCM. Values are clamped to
/// [-1, 1]; negatives scale by 32768, positives by 32767.
pub fn float_to_pcm16(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for &s in samples {
        let s = s.clamp(-1.0, 1.0);
        let v = if s < 0.0 { s * 32768.0 } else { s * 32767.0 } as i16;
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

pub fn encode_pcm16_base64(samples: &[f32]) -> String {
    base64::engine::general_purpose::STANDARD.encode(float_to_pcm16(samples))
}

pub fn decode_pcm16_base64(encoded: &str) -> Result<Vec<f32>, VoiceError> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .map_err(|e| VoiceError::InvalidAudio(format!("bad base64 audio: {}", e)))?;
    if bytes.len() % 2 != 0 {
        return Err(VoiceError::InvalidAudio(format!(
            "odd PCM16 payload length {}",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]) as f32 / 32768.0)
        .collect())
}

/// Duration in milliseconds of `samples` mono samples at `sample_rate`.
pub fn duration_ms(samples: usize, sample_rate: u32) -> f64 {
    samples as f64 * 1000.0 / sample_rate.max(1) as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_vector_encodes_with_asymmetric_scaling() {
        assert_eq!(encode_pcm16_base64(&[0.0, 1.0, -1.0, 2.0]), "AAD/fwCA/38=");
    }

    #[test]
    fn out_of_range_is_clamped() {
        let bytes = float_to_pcm16(&[-3.0, 3.0]);
        assert_eq!(i16::from_le_bytes([bytes[0], bytes[1]]), i16::MIN);
        assert_eq!(i16::from_le_bytes([bytes[2], bytes[3]]), i16::MAX);
    }

    #[test]
    fn decode_inverts_encode_within_one_step() {
        let input = [0.5, -0.25, 0.0, -1.0];
        let decoded = decode_pcm16_base64(&encode_pcm16_base64(&input)).unwrap();
        for (a, b) in input.iter().zip(&decoded) {
            assert!((a - b).abs() < 1.0 / 16384.0, "{} vs {}", a, b);
        }
    }

    #[test]
    fn malformed_payloads_are_rejected() {
        assert!(matches!(
            decode_pcm16_base64("not base64!!"),
            Err(VoiceError::InvalidAudio(_))
        ));
        // Three bytes: not a whole number of samples.
        assert!(matches!(
            decode_pcm16_base64("AAAA"),
            Err(VoiceError::InvalidAudio(_))
        ));
    }

    #[test]
    fn duration_of_one_frame_at_wire_rate() {
        assert!((duration_ms(2400, 24_000) - 100.0).abs() < 1e-9);
    }
}
