//! Synthetic capture source. This binary has no microphone path; the tone
//! generator stands in for the audio I/O subsystem so the encode/send side
//! can be exercised end to end.

pub struct ToneSource {
    phase: f32,
    step: f32,
    frame_samples: usize,
}

impl ToneSource {
    pub fn new(sample_rate: u32, frame_ms: u32, freq_hz: f32) -> Self {
        let frame_samples = sample_rate as usize * frame_ms as usize / 1000;
        Self {
            phase: 0.0,
            step: std::f32::consts::TAU * freq_hz / sample_rate as f32,
            frame_samples,
        }
    }

    pub fn next_frame(&mut self) -> Vec<i16> {
        let mut out = Vec::with_capacity(self.frame_samples);
        for _ in 0..self.frame_samples {
            out.push((self.phase.sin() * 8000.0) as i16);
            self.phase = (self.phase + self.step) % std::f32::consts::TAU;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_has_nominal_length() {
        let mut src = ToneSource::new(48_000, 20, 440.0);
        assert_eq!(src.next_frame().len(), 960);
    }

    #[test]
    fn signal_is_not_silence() {
        let mut src = ToneSource::new(48_000, 20, 440.0);
        let frame = src.next_frame();
        assert!(frame.iter().any(|s| s.abs() > 1000));
    }
}
