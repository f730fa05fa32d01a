use crate::{Error, Result};
use std::f32::consts::PI;
use std::time::Duration;

/// Velocity profile `center + amplitude * sin(2π f t)`, in turns/s.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SineWave {
    amplitude: f32,
    frequency_hz: f32,
    center: f32,
}

impl SineWave {
    pub fn new(amplitude: f32, frequency_hz: f32, center: f32) -> Result<SineWave> {
        for (name, value) in [
            ("amplitude", amplitude),
            ("frequency", frequency_hz),
            ("center velocity", center),
        ] {
            if !value.is_finite() {
                return Err(Error::InvalidParameter(format!(
                    "{name} must be finite, got {value}"
                )));
            }
        }
        if frequency_hz < 0. {
            return Err(Error::InvalidParameter(format!(
                "frequency must not be negative, got {frequency_hz}"
            )));
        }
        Ok(SineWave {
            amplitude,
            frequency_hz,
            center,
        })
    }

    pub fn amplitude(&self) -> f32 {
        self.amplitude
    }

    pub fn frequency_hz(&self) -> f32 {
        self.frequency_hz
    }

    pub fn center(&self) -> f32 {
        self.center
    }

    /// Largest speed the profile ever commands.
    pub fn peak(&self) -> f32 {
        self.center.abs() + self.amplitude.abs()
    }

    pub fn setpoint(&self, elapsed: Duration) -> f32 {
        let omega = 2. * PI * self.frequency_hz;
        // f64 for the phase keeps long runs from losing precision.
        let phase = f64::from(omega) * elapsed.as_secs_f64();
        self.center + self.amplitude * phase.sin() as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f32, b: f32) -> bool {
        (a - b).abs() < 1e-4
    }

    #[test]
    fn follows_the_sine() {
        let wave = SineWave::new(2., 0.5, 0.).unwrap();
        assert!(close(wave.setpoint(Duration::ZERO), 0.));
        // Quarter period of a 0.5 Hz wave is 0.5 s.
        assert!(close(wave.setpoint(Duration::from_millis(500)), 2.));
        assert!(close(wave.setpoint(Duration::from_millis(1000)), 0.));
        assert!(close(wave.setpoint(Duration::from_millis(1500)), -2.));
    }

    #[test]
    fn center_offsets_the_wave() {
        let wave = SineWave::new(1., 1., 0.5).unwrap();
        assert!(close(wave.setpoint(Duration::ZERO), 0.5));
        assert!(close(wave.setpoint(Duration::from_millis(250)), 1.5));
        assert!(close(wave.peak(), 1.5));
    }

    #[test]
    fn zero_frequency_holds_center() {
        let wave = SineWave::new(3., 0., 1.).unwrap();
        assert!(close(wave.setpoint(Duration::from_secs(42)), 1.));
    }

    #[test]
    fn rejects_bad_parameters() {
        assert!(SineWave::new(f32::NAN, 1., 0.).is_err());
        assert!(SineWave::new(1., f32::INFINITY, 0.).is_err());
        assert!(SineWave::new(1., -1., 0.).is_err());
    }
}
