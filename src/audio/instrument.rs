use super::ADSRConfig;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Wave {
    Sine,
    Square,
    Saw,
    Triangle,
}

impl Wave {
    /// `phase` is in 0.0..1.0.
    pub fn sample(self, phase: f32) -> f32 {
        match self {
            Wave::Sine => (phase * std::f32::consts::TAU).sin(),
            Wave::Square => {
                if phase < 0.5 {
                    -1.0
                } else {
                    1.0
                }
            }
            Wave::Saw => phase * 2.0 - 1.0,
            Wave::Triangle => 1.0 - 4.0 * (phase - 0.5).abs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OscConfig {
    pub wave: Wave,
    pub gain: f32,
    pub semitone: i8,
}

impl OscConfig {
    const fn new(wave: Wave, gain: f32, semitone: i8) -> Self {
        Self {
            wave,
            gain,
            semitone,
        }
    }
}

/// A named oscillator stack with its envelope. Channels of the built-in
/// synthesizer pick one of [`Instrument::presets`] by index.
#[derive(Debug, Clone, PartialEq)]
pub struct Instrument {
    pub name: String,
    pub oscillators: Vec<OscConfig>,
    pub adsr: ADSRConfig,
}

impl Instrument {
    fn new(name: &str, oscillators: Vec<OscConfig>, adsr: ADSRConfig) -> Self {
        Self {
            name: name.to_string(),
            oscillators,
            adsr,
        }
    }

    pub fn presets() -> Vec<Instrument> {
        vec![
            Self::new(
                "Piano",
                vec![
                    OscConfig::new(Wave::Triangle, 0.6, 0),
                    OscConfig::new(Wave::Sine, 0.3, 12),
                ],
                ADSRConfig {
                    attack: 0.005,
                    decay: 0.4,
                    sustain: 0.3,
                    release: 0.3,
                },
            ),
            Self::new(
                "Organ",
                vec![
                    OscConfig::new(Wave::Sine, 0.5, 0),
                    OscConfig::new(Wave::Sine, 0.3, 12),
                    OscConfig::new(Wave::Sine, 0.2, 19),
                ],
                ADSRConfig {
                    attack: 0.01,
                    decay: 0.05,
                    sustain: 0.9,
                    release: 0.05,
                },
            ),
            Self::new(
                "Square Lead",
                vec![OscConfig::new(Wave::Square, 0.4, 0)],
                ADSRConfig {
                    attack: 0.01,
                    decay: 0.1,
                    sustain: 0.7,
                    release: 0.1,
                },
            ),
            Self::new(
                "Saw Pad",
                vec![
                    OscConfig::new(Wave::Saw, 0.3, 0),
                    OscConfig::new(Wave::Saw, 0.2, -12),
                ],
                ADSRConfig {
                    attack: 0.3,
                    decay: 0.5,
                    sustain: 0.6,
                    release: 0.8,
                },
            ),
            Self::new(
                "Bass",
                vec![
                    OscConfig::new(Wave::Saw, 0.5, -12),
                    OscConfig::new(Wave::Square, 0.2, -24),
                ],
                ADSRConfig {
                    attack: 0.005,
                    decay: 0.2,
                    sustain: 0.5,
                    release: 0.1,
                },
            ),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn waves_stay_within_unit_range() {
        for wave in [Wave::Sine, Wave::Square, Wave::Saw, Wave::Triangle] {
            for step in 0..100 {
                let s = wave.sample(step as f32 / 100.0);
                assert!((-1.0..=1.0).contains(&s), "{wave:?} gave {s}");
            }
        }
    }

    #[test]
    fn presets_have_unique_names_and_oscillators() {
        let presets = Instrument::presets();
        assert!(!presets.is_empty());
        for (i, preset) in presets.iter().enumerate() {
            assert!(!preset.oscillators.is_empty());
            assert!(presets[i + 1..].iter().all(|p| p.name != preset.name));
        }
    }
}
