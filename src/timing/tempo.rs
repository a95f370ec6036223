use super::{SequencerError, Tics};

/// Playback speed expressed as tics per millisecond.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tempo {
    tics_per_milli: f64,
}

impl Tempo {
    pub const DEFAULT: Tempo = Tempo {
        tics_per_milli: 1.0,
    };

    pub fn new(tics_per_milli: f64) -> Result<Self, SequencerError> {
        if !tics_per_milli.is_finite() || tics_per_milli <= 0.0 {
            return Err(SequencerError::InvalidSpeedFactor(tics_per_milli));
        }
        Ok(Self { tics_per_milli })
    }

    /// One tic per beat.
    pub fn from_bpm(bpm: f64) -> Result<Self, SequencerError> {
        Self::new(bpm / 60_000.0)
    }

    pub fn tics_per_milli(self) -> f64 {
        self.tics_per_milli
    }

    pub fn bpm(self) -> f64 {
        self.tics_per_milli * 60_000.0
    }

    /// Truncates toward zero, so an event may fire up to a millisecond before
    /// `tics / tics_per_milli`. Saturates at `u64::MAX` for tiny factors.
    pub fn tics_to_millis(self, tics: Tics) -> u64 {
        (tics as f64 / self.tics_per_milli) as u64
    }

    pub fn millis_to_tics(self, millis: u64) -> f64 {
        millis as f64 * self.tics_per_milli
    }
}

impl Default for Tempo {
    fn default() -> Self {
        Self::DEFAULT
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_one_tic_per_millisecond() {
        let tempo = Tempo::default();
        assert_eq!(tempo.tics_to_millis(250), 250);
        assert_eq!(tempo.millis_to_tics(250), 250.0);
    }

    #[test]
    fn rejects_non_positive_and_non_finite_factors() {
        assert!(Tempo::new(0.0).is_err());
        assert!(Tempo::new(-2.0).is_err());
        assert!(Tempo::new(f64::NAN).is_err());
        assert!(Tempo::new(f64::INFINITY).is_err());
        assert!(Tempo::from_bpm(0.0).is_err());
    }

    #[test]
    fn bpm_maps_one_beat_to_one_tic() {
        let tempo = Tempo::from_bpm(120.0).unwrap();
        assert_eq!(tempo.tics_to_millis(1), 500);
        assert_eq!(tempo.tics_to_millis(4), 2000);
        assert!((tempo.bpm() - 120.0).abs() < 1e-9);
    }

    #[test]
    fn tics_to_millis_truncates() {
        let tempo = Tempo::new(3.0).unwrap();
        assert_eq!(tempo.tics_to_millis(10), 3);
        assert_eq!(tempo.tics_to_millis(2), 0);
    }

    #[test]
    fn tiny_factor_saturates() {
        let tempo = Tempo::new(1e-300).unwrap();
        assert_eq!(tempo.tics_to_millis(4), u64::MAX);
        assert_eq!(tempo.tics_to_millis(0), 0);
    }

    #[test]
    fn conversions_round_trip_within_truncation() {
        for factor in [0.25, 0.5, 1.0, 2.0, 4.0] {
            let tempo = Tempo::new(factor).unwrap();
            let tolerance = (1.0 / factor).ceil() as u64;
            for millis in 0..200u64 {
                let tics = tempo.millis_to_tics(millis).floor() as Tics;
                let back = tempo.tics_to_millis(tics);
                assert!(back <= millis, "factor {factor}: {back} > {millis}");
                assert!(millis - back <= tolerance, "factor {factor}: {millis} -> {back}");
            }
        }
    }
}
