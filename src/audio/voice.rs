#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ADSRConfig {
    /// Seconds
    pub attack: f32,
    /// Seconds
    pub decay: f32,
    /// 0.0 -> 1.0
    pub sustain: f32,
    /// Seconds
    pub release: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EnvelopeState {
    Attack { time: f32 },
    Decay { time: f32 },
    Sustain,
    Release { time: f32, from: f32 },
    Done,
}

/// One sounding pitch inside a channel.
#[derive(Debug, Clone)]
pub struct NoteState {
    pub velocity: u8,
    pub envelope: EnvelopeState,
    pub level: f32,
    pub oscillator_phases: Vec<f32>,
}

fn progress(time: f32, span: f32) -> f32 {
    if span <= 0.0 {
        1.0
    } else {
        (time / span).min(1.0)
    }
}

impl NoteState {
    pub fn new(velocity: u8, num_oscillators: usize) -> Self {
        Self {
            velocity,
            envelope: EnvelopeState::Attack { time: 0.0 },
            level: 0.0,
            oscillator_phases: vec![0.0; num_oscillators],
        }
    }

    /// Starts the release stage from wherever the envelope currently is.
    pub fn release(&mut self) {
        if !matches!(
            self.envelope,
            EnvelopeState::Release { .. } | EnvelopeState::Done
        ) {
            self.envelope = EnvelopeState::Release {
                time: 0.0,
                from: self.level,
            };
        }
    }

    pub fn is_finished(&self) -> bool {
        self.envelope == EnvelopeState::Done
    }

    pub fn envelope_level(&self, adsr: &ADSRConfig) -> f32 {
        match self.envelope {
            EnvelopeState::Attack { time } => progress(time, adsr.attack),
            EnvelopeState::Decay { time } => {
                1.0 - (1.0 - adsr.sustain) * progress(time, adsr.decay)
            }
            EnvelopeState::Sustain => adsr.sustain,
            EnvelopeState::Release { time, from } => from * (1.0 - progress(time, adsr.release)),
            EnvelopeState::Done => 0.0,
        }
    }

    /// Moves the envelope forward by `dt` seconds.
    pub fn advance(&mut self, adsr: &ADSRConfig, dt: f32) {
        self.envelope = match self.envelope {
            EnvelopeState::Attack { time } if time + dt >= adsr.attack => {
                EnvelopeState::Decay { time: 0.0 }
            }
            EnvelopeState::Attack { time } => EnvelopeState::Attack { time: time + dt },
            EnvelopeState::Decay { time } if time + dt >= adsr.decay => EnvelopeState::Sustain,
            EnvelopeState::Decay { time } => EnvelopeState::Decay { time: time + dt },
            EnvelopeState::Release { time, .. } if time + dt >= adsr.release => {
                EnvelopeState::Done
            }
            EnvelopeState::Release { time, from } => EnvelopeState::Release {
                time: time + dt,
                from,
            },
            other => other,
        };
        self.level = self.envelope_level(adsr);
    }
}
