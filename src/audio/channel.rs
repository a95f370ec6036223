use std::collections::HashMap;

use super::{Instrument, NoteState};

/// Per-channel settings shared with the audio callback.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelConfig {
    pub instrument: Instrument,
    /// 0.0 -> 1.0
    pub volume: f32,
    pub muted: bool,
    pub bend_semitones: f32,
}

impl ChannelConfig {
    pub fn new(instrument: Instrument) -> Self {
        Self {
            instrument,
            volume: 1.0,
            muted: false,
            bend_semitones: 0.0,
        }
    }
}

fn pitch_to_freq(pitch: f32) -> f32 {
    440.0 * 2.0_f32.powf((pitch - 69.0) / 12.0)
}

/// The voices currently sounding on one channel, keyed by pitch.
#[derive(Debug, Default)]
pub struct ChannelVoices {
    active_notes: HashMap<u8, NoteState>,
}

impl ChannelVoices {
    pub fn new() -> Self {
        Self::default()
    }

    /// Retriggers the pitch if it is already sounding.
    pub fn note_on(&mut self, pitch: u8, velocity: u8, config: &ChannelConfig) {
        let num_oscs = config.instrument.oscillators.len();
        self.active_notes
            .insert(pitch, NoteState::new(velocity, num_oscs));
    }

    pub fn note_off(&mut self, pitch: u8) {
        if let Some(state) = self.active_notes.get_mut(&pitch) {
            state.release();
        }
    }

    pub fn release_all(&mut self) {
        self.active_notes.values_mut().for_each(NoteState::release);
    }

    pub fn active_count(&self) -> usize {
        self.active_notes.len()
    }

    /// Mixes one sample of every voice and advances their envelopes.
    pub fn render_sample(&mut self, config: &ChannelConfig, sample_rate: f32) -> f32 {
        if self.active_notes.is_empty() {
            return 0.0;
        }

        let adsr = &config.instrument.adsr;
        let mut out = 0.0;

        for (pitch, state) in &mut self.active_notes {
            let envelope = state.envelope_level(adsr);
            let velocity_scale = state.velocity as f32 / 127.0;

            for (osc, phase) in config
                .instrument
                .oscillators
                .iter()
                .zip(state.oscillator_phases.iter_mut())
            {
                let freq = pitch_to_freq(
                    *pitch as f32 + osc.semitone as f32 + config.bend_semitones,
                );
                out += osc.wave.sample(*phase) * envelope * velocity_scale * osc.gain;

                *phase += freq / sample_rate;
                if *phase >= 1.0 {
                    *phase -= 1.0;
                }
            }

            state.advance(adsr, 1.0 / sample_rate);
        }

        self.active_notes.retain(|_, state| !state.is_finished());

        if config.muted { 0.0 } else { out * config.volume }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn organ() -> ChannelConfig {
        ChannelConfig::new(Instrument::presets()[1].clone())
    }

    #[test]
    fn silent_without_notes() {
        let mut voices = ChannelVoices::new();
        assert_eq!(voices.render_sample(&organ(), 44_100.0), 0.0);
    }

    #[test]
    fn note_sounds_then_fades_out_after_release() {
        let config = organ();
        let mut voices = ChannelVoices::new();
        voices.note_on(69, 100, &config);

        let peak = (0..2_000)
            .map(|_| voices.render_sample(&config, 44_100.0).abs())
            .fold(0.0_f32, f32::max);
        assert!(peak > 0.0);

        voices.note_off(69);
        for _ in 0..44_100 {
            voices.render_sample(&config, 44_100.0);
        }
        assert_eq!(voices.active_count(), 0);
    }

    #[test]
    fn muted_channel_renders_silence_but_keeps_voices() {
        let mut config = organ();
        config.muted = true;
        let mut voices = ChannelVoices::new();
        voices.note_on(60, 100, &config);
        for _ in 0..500 {
            assert_eq!(voices.render_sample(&config, 44_100.0), 0.0);
        }
        assert_eq!(voices.active_count(), 1);
    }

    #[test]
    fn retriggering_a_pitch_keeps_one_voice() {
        let config = organ();
        let mut voices = ChannelVoices::new();
        voices.note_on(60, 100, &config);
        voices.note_on(60, 80, &config);
        voices.note_on(64, 80, &config);
        assert_eq!(voices.active_count(), 2);
    }
}
