use parking_lot::Mutex;

use super::{DeviceError, SoundDevice};
use crate::events::Channel;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceCall {
    NoteOn { channel: Channel, pitch: i32 },
    NoteOff { channel: Channel, pitch: i32 },
    Volume { channel: Channel, volume: i32 },
    Instrument { channel: Channel, instrument: i32 },
    PitchBend { channel: Channel, amount: i32 },
    Mute { channel: Channel, mute: bool },
    AllNotesOff,
}

/// Device that makes no sound and remembers every call, in order.
#[derive(Debug, Default)]
pub struct RecordingDevice {
    calls: Mutex<Vec<DeviceCall>>,
    echo: bool,
}

impl RecordingDevice {
    pub fn new() -> Self {
        Self::default()
    }

    /// Also logs each call as it arrives.
    pub fn echoing() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            echo: true,
        }
    }

    pub fn calls(&self) -> Vec<DeviceCall> {
        self.calls.lock().clone()
    }

    pub fn take_calls(&self) -> Vec<DeviceCall> {
        std::mem::take(&mut *self.calls.lock())
    }

    fn record(&self, call: DeviceCall) -> Result<(), DeviceError> {
        if self.echo {
            tracing::info!(?call, "device");
        }
        self.calls.lock().push(call);
        Ok(())
    }
}

impl SoundDevice for RecordingDevice {
    fn name(&self) -> &str {
        "recording"
    }

    fn note_on(&self, channel: Channel, pitch: i32) -> Result<(), DeviceError> {
        self.record(DeviceCall::NoteOn { channel, pitch })
    }

    fn note_off(&self, channel: Channel, pitch: i32) -> Result<(), DeviceError> {
        self.record(DeviceCall::NoteOff { channel, pitch })
    }

    fn set_volume(&self, channel: Channel, volume: i32) -> Result<(), DeviceError> {
        self.record(DeviceCall::Volume { channel, volume })
    }

    fn set_instrument(&self, channel: Channel, instrument: i32) -> Result<(), DeviceError> {
        self.record(DeviceCall::Instrument {
            channel,
            instrument,
        })
    }

    fn set_pitch_bend(&self, channel: Channel, amount: i32) -> Result<(), DeviceError> {
        self.record(DeviceCall::PitchBend { channel, amount })
    }

    fn set_mute(&self, channel: Channel, mute: bool) -> Result<(), DeviceError> {
        self.record(DeviceCall::Mute { channel, mute })
    }

    fn all_notes_off(&self) -> Result<(), DeviceError> {
        self.record(DeviceCall::AllNotesOff)
    }
}
