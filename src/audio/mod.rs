mod channel;
mod instrument;
mod midi;
mod recording;
mod synth;
mod voice;

use std::sync::Arc;
use thiserror::Error;

use crate::config::{OutputKind, Settings};
use crate::events::Channel;

pub use channel::{ChannelConfig, ChannelVoices};
pub use instrument::{Instrument, OscConfig, Wave};
pub use midi::MidiDevice;
pub use recording::{DeviceCall, RecordingDevice};
pub use synth::SynthDevice;
pub use voice::{ADSRConfig, EnvelopeState, NoteState};

pub const CHANNEL_COUNT: usize = 16;
pub const NOTE_VELOCITY: u8 = 100;
pub const PITCH_BEND_MIN: i32 = -8192;
pub const PITCH_BEND_MAX: i32 = 8191;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum DeviceError {
    #[error("invalid channel {0}")]
    InvalidChannel(Channel),
    #[error("{what} {value} is out of range")]
    ValueOutOfRange { what: &'static str, value: i32 },
    #[error("sound device unavailable: {0}")]
    Unavailable(String),
    #[error("sound device error: {0}")]
    Backend(String),
}

/// Something that makes noise when told to. Channel and pitch validity is
/// the device's business; the sequencer passes values through untouched.
///
/// Only the note calls are required. The control calls default to no-ops
/// for devices that have nothing to control.
pub trait SoundDevice: Send + Sync {
    fn name(&self) -> &str;

    fn note_on(&self, channel: Channel, pitch: i32) -> Result<(), DeviceError>;

    fn note_off(&self, channel: Channel, pitch: i32) -> Result<(), DeviceError>;

    /// Clamped to 0..=127.
    fn set_volume(&self, _channel: Channel, _volume: i32) -> Result<(), DeviceError> {
        Ok(())
    }

    /// Index into [`SoundDevice::instrument_names`].
    fn set_instrument(&self, _channel: Channel, _instrument: i32) -> Result<(), DeviceError> {
        Ok(())
    }

    /// Clamped to -8192..=8191, 0 is centre.
    fn set_pitch_bend(&self, _channel: Channel, _amount: i32) -> Result<(), DeviceError> {
        Ok(())
    }

    fn set_mute(&self, _channel: Channel, _mute: bool) -> Result<(), DeviceError> {
        Ok(())
    }

    fn all_notes_off(&self) -> Result<(), DeviceError> {
        Ok(())
    }

    fn instrument_names(&self) -> Vec<String> {
        vec!["DEFAULT".to_string()]
    }

    fn channel_count(&self) -> usize {
        CHANNEL_COUNT
    }
}

/// Silent device used when no backend could be opened. Timing and state
/// transitions behave exactly as with a real device.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullDevice;

impl SoundDevice for NullDevice {
    fn name(&self) -> &str {
        "silent"
    }

    fn note_on(&self, _channel: Channel, _pitch: i32) -> Result<(), DeviceError> {
        Ok(())
    }

    fn note_off(&self, _channel: Channel, _pitch: i32) -> Result<(), DeviceError> {
        Ok(())
    }
}

/// Opens the backend named in the settings, falling back to silence.
pub fn open_device(settings: &Settings) -> Arc<dyn SoundDevice> {
    let opened: Result<Arc<dyn SoundDevice>, DeviceError> = match settings.output {
        OutputKind::Silent => return Arc::new(NullDevice),
        OutputKind::Midi => MidiDevice::connect(settings.midi_port.as_deref())
            .map(|d| Arc::new(d) as Arc<dyn SoundDevice>),
        OutputKind::Synth => {
            SynthDevice::open(settings.sample_rate).map(|d| Arc::new(d) as Arc<dyn SoundDevice>)
        }
    };

    match opened {
        Ok(device) => {
            tracing::info!(device = device.name(), "sound device ready");
            device
        }
        Err(e) => {
            tracing::warn!(error = %e, "no sound device, playing silently");
            Arc::new(NullDevice)
        }
    }
}

pub fn midi_to_freq(note: u8) -> f32 {
    440.0 * 2.0_f32.powf((note as f32 - 69.0) / 12.0)
}

pub(crate) fn midi_channel(channel: Channel) -> Result<u8, DeviceError> {
    if (0..CHANNEL_COUNT as Channel).contains(&channel) {
        Ok(channel as u8)
    } else {
        Err(DeviceError::InvalidChannel(channel))
    }
}

pub(crate) fn midi_pitch(pitch: i32) -> Result<u8, DeviceError> {
    u8::try_from(pitch)
        .ok()
        .filter(|p| *p < 128)
        .ok_or(DeviceError::ValueOutOfRange {
            what: "pitch",
            value: pitch,
        })
}

pub(crate) fn clamp_volume(volume: i32) -> u8 {
    volume.clamp(0, 127) as u8
}

pub(crate) fn clamp_bend(amount: i32) -> i32 {
    amount.clamp(PITCH_BEND_MIN, PITCH_BEND_MAX)
}
