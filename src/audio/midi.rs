use std::sync::atomic::{AtomicU16, Ordering};

use midir::{MidiOutput, MidiOutputConnection};
use parking_lot::Mutex;

use super::{
    DeviceError, NOTE_VELOCITY, SoundDevice, clamp_bend, clamp_volume, midi_channel, midi_pitch,
};
use crate::events::Channel;

const CLIENT_NAME: &str = "sketchseq";
const CC_VOLUME: u8 = 7;
const CC_ALL_NOTES_OFF: u8 = 123;

pub fn note_on_message(channel: u8, pitch: u8, velocity: u8) -> [u8; 3] {
    [0x90 | channel, pitch, velocity]
}

pub fn note_off_message(channel: u8, pitch: u8) -> [u8; 3] {
    [0x80 | channel, pitch, 0]
}

pub fn control_change_message(channel: u8, controller: u8, value: u8) -> [u8; 3] {
    [0xB0 | channel, controller, value]
}

pub fn program_change_message(channel: u8, program: u8) -> [u8; 2] {
    [0xC0 | channel, program]
}

/// `amount` is signed, 0 is centre. Sent as 14 bits, LSB first.
pub fn pitch_bend_message(channel: u8, amount: i32) -> [u8; 3] {
    let raw = (clamp_bend(amount) + 8192) as u16;
    [0xE0 | channel, (raw & 0x7F) as u8, (raw >> 7) as u8]
}

/// Sends to an external synthesizer over a midir output port.
pub struct MidiDevice {
    port_name: String,
    connection: Mutex<MidiOutputConnection>,
    muted: AtomicU16,
}

impl MidiDevice {
    pub fn available_ports() -> Vec<String> {
        match MidiOutput::new(CLIENT_NAME) {
            Ok(midi_out) => midi_out
                .ports()
                .iter()
                .filter_map(|p| midi_out.port_name(p).ok())
                .collect(),
            Err(_) => vec![],
        }
    }

    /// Connects to the first port whose name contains `port`, or to the
    /// first port at all when no name is given.
    pub fn connect(port: Option<&str>) -> Result<Self, DeviceError> {
        let midi_out =
            MidiOutput::new(CLIENT_NAME).map_err(|e| DeviceError::Unavailable(e.to_string()))?;

        let ports = midi_out.ports();
        let chosen = match port {
            Some(wanted) => ports
                .iter()
                .find(|p| midi_out.port_name(p).unwrap_or_default().contains(wanted)),
            None => ports.first(),
        }
        .ok_or_else(|| {
            DeviceError::Unavailable(match port {
                Some(wanted) => format!("no MIDI output matching {wanted:?}"),
                None => "no MIDI output ports".to_string(),
            })
        })?;

        let port_name = midi_out.port_name(chosen).unwrap_or_default();
        let connection = midi_out
            .connect(chosen, "sketchseq-out")
            .map_err(|e| DeviceError::Unavailable(e.to_string()))?;

        tracing::info!(port = %port_name, "MIDI output connected");

        Ok(Self {
            port_name,
            connection: Mutex::new(connection),
            muted: AtomicU16::new(0),
        })
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    fn send(&self, message: &[u8]) -> Result<(), DeviceError> {
        self.connection
            .lock()
            .send(message)
            .map_err(|e| DeviceError::Backend(e.to_string()))
    }

    fn is_muted(&self, channel: u8) -> bool {
        self.muted.load(Ordering::Relaxed) & (1 << channel) != 0
    }
}

impl SoundDevice for MidiDevice {
    fn name(&self) -> &str {
        "midi"
    }

    fn note_on(&self, channel: Channel, pitch: i32) -> Result<(), DeviceError> {
        let ch = midi_channel(channel)?;
        let pitch = midi_pitch(pitch)?;
        if self.is_muted(ch) {
            return Ok(());
        }
        self.send(&note_on_message(ch, pitch, NOTE_VELOCITY))
    }

    fn note_off(&self, channel: Channel, pitch: i32) -> Result<(), DeviceError> {
        let ch = midi_channel(channel)?;
        self.send(&note_off_message(ch, midi_pitch(pitch)?))
    }

    fn set_volume(&self, channel: Channel, volume: i32) -> Result<(), DeviceError> {
        let ch = midi_channel(channel)?;
        self.send(&control_change_message(ch, CC_VOLUME, clamp_volume(volume)))
    }

    fn set_instrument(&self, channel: Channel, instrument: i32) -> Result<(), DeviceError> {
        let ch = midi_channel(channel)?;
        let program = u8::try_from(instrument)
            .ok()
            .filter(|p| *p < 128)
            .ok_or(DeviceError::ValueOutOfRange {
                what: "instrument",
                value: instrument,
            })?;
        self.send(&program_change_message(ch, program))
    }

    fn set_pitch_bend(&self, channel: Channel, amount: i32) -> Result<(), DeviceError> {
        let ch = midi_channel(channel)?;
        self.send(&pitch_bend_message(ch, amount))
    }

    fn set_mute(&self, channel: Channel, mute: bool) -> Result<(), DeviceError> {
        let ch = midi_channel(channel)?;
        if mute {
            self.muted.fetch_or(1 << ch, Ordering::Relaxed);
            self.send(&control_change_message(ch, CC_ALL_NOTES_OFF, 0))
        } else {
            self.muted.fetch_and(!(1 << ch), Ordering::Relaxed);
            Ok(())
        }
    }

    fn all_notes_off(&self) -> Result<(), DeviceError> {
        for ch in 0..self.channel_count() as u8 {
            self.send(&control_change_message(ch, CC_ALL_NOTES_OFF, 0))?;
        }
        Ok(())
    }

    fn instrument_names(&self) -> Vec<String> {
        (0..128).map(|p| format!("Program {p}")).collect()
    }
}
