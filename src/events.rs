use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

use crate::audio::SoundDevice;
use crate::timing::{Sequencer, Tics};

/// Logical output channel. Passed through to the device unvalidated.
pub type Channel = i32;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum EventError {
    #[error("event time must be non-negative, got {0}")]
    NegativeTime(i64),
    #[error("event duration must be non-negative, got {0}")]
    NegativeDuration(i64),
    #[error("unrecognized event kind `{0}`")]
    UnknownKind(String),
}

/// The closed set of event kinds. Declaration order is the dispatch order
/// for events sharing a tic: notes, then tracks, then changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Note,
    Track,
    Change,
}

impl EventKind {
    pub fn tag(self) -> &'static str {
        match self {
            EventKind::Note => "note",
            EventKind::Track => "track",
            EventKind::Change => "change",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for EventKind {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "note" => Ok(EventKind::Note),
            "track" => Ok(EventKind::Track),
            "change" => Ok(EventKind::Change),
            other => Err(EventError::UnknownKind(other.to_string())),
        }
    }
}

fn checked_time(time: i64) -> Result<Tics, EventError> {
    Tics::try_from(time).map_err(|_| EventError::NegativeTime(time))
}

fn checked_duration(duration: i64) -> Result<Tics, EventError> {
    Tics::try_from(duration).map_err(|_| EventError::NegativeDuration(duration))
}

/// A pitched note held on a channel for `duration` tics.
#[derive(Clone)]
pub struct NoteEvent {
    time: Tics,
    label: String,
    channel: Channel,
    duration: Tics,
    pitch: i32,
    device: Arc<dyn SoundDevice>,
}

impl NoteEvent {
    pub fn new(
        time: i64,
        label: impl Into<String>,
        channel: Channel,
        duration: i64,
        pitch: i32,
        device: Arc<dyn SoundDevice>,
    ) -> Result<Self, EventError> {
        Ok(Self {
            time: checked_time(time)?,
            label: label.into(),
            channel,
            duration: checked_duration(duration)?,
            pitch,
            device,
        })
    }

    pub fn duration(&self) -> Tics {
        self.duration
    }

    pub fn pitch(&self) -> i32 {
        self.pitch
    }

    fn execute(&self) {
        if let Err(e) = self.device.note_on(self.channel, self.pitch) {
            tracing::warn!(channel = self.channel, pitch = self.pitch, error = %e, "note on failed");
        }
    }

    fn release(&self) {
        if let Err(e) = self.device.note_off(self.channel, self.pitch) {
            tracing::warn!(channel = self.channel, pitch = self.pitch, error = %e, "note off failed");
        }
    }
}

/// Device parameter a change event can drive, picked by its label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Volume,
    Instrument,
    PitchBend,
    Mute,
}

impl Control {
    pub fn from_label(label: &str) -> Option<Self> {
        match label.to_ascii_lowercase().as_str() {
            "volume" => Some(Control::Volume),
            "instrument" | "program" => Some(Control::Instrument),
            "pitchbend" | "pitch_bend" | "bend" => Some(Control::PitchBend),
            "mute" => Some(Control::Mute),
            _ => None,
        }
    }
}

/// A parameter change. Always reported; applied to the device when the
/// label names a [`Control`].
#[derive(Clone)]
pub struct ChangeEvent {
    time: Tics,
    label: String,
    channel: Channel,
    value: i32,
    device: Arc<dyn SoundDevice>,
}

impl ChangeEvent {
    pub fn new(
        time: i64,
        label: impl Into<String>,
        channel: Channel,
        value: i32,
        device: Arc<dyn SoundDevice>,
    ) -> Result<Self, EventError> {
        Ok(Self {
            time: checked_time(time)?,
            label: label.into(),
            channel,
            value,
            device,
        })
    }

    pub fn value(&self) -> i32 {
        self.value
    }

    pub fn control(&self) -> Option<Control> {
        Control::from_label(&self.label)
    }

    fn execute(&self) {
        tracing::info!(target: "sketchseq::change", "{}", self);
        let Some(control) = self.control() else {
            return;
        };
        let result = match control {
            Control::Volume => self.device.set_volume(self.channel, self.value),
            Control::Instrument => self.device.set_instrument(self.channel, self.value),
            Control::PitchBend => self.device.set_pitch_bend(self.channel, self.value),
            Control::Mute => self.device.set_mute(self.channel, self.value != 0),
        };
        if let Err(e) = result {
            tracing::warn!(channel = self.channel, ?control, error = %e, "change failed");
        }
    }
}

/// A window in which a nested sequencer plays. The nested sequencer keeps
/// its own tempo, length and loop flag.
#[derive(Clone)]
pub struct TrackEvent {
    time: Tics,
    label: String,
    channel: Channel,
    duration: Tics,
    sequence: Sequencer,
}

impl TrackEvent {
    pub fn new(
        time: i64,
        label: impl Into<String>,
        channel: Channel,
        duration: i64,
        sequence: Sequencer,
    ) -> Result<Self, EventError> {
        Ok(Self {
            time: checked_time(time)?,
            label: label.into(),
            channel,
            duration: checked_duration(duration)?,
            sequence,
        })
    }

    pub fn duration(&self) -> Tics {
        self.duration
    }

    pub fn sequence(&self) -> &Sequencer {
        &self.sequence
    }
}

#[derive(Clone)]
pub enum AudioEvent {
    Note(NoteEvent),
    Change(ChangeEvent),
    Track(TrackEvent),
}

impl AudioEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            AudioEvent::Note(_) => EventKind::Note,
            AudioEvent::Change(_) => EventKind::Change,
            AudioEvent::Track(_) => EventKind::Track,
        }
    }

    pub fn time(&self) -> Tics {
        match self {
            AudioEvent::Note(e) => e.time,
            AudioEvent::Change(e) => e.time,
            AudioEvent::Track(e) => e.time,
        }
    }

    pub fn label(&self) -> &str {
        match self {
            AudioEvent::Note(e) => &e.label,
            AudioEvent::Change(e) => &e.label,
            AudioEvent::Track(e) => &e.label,
        }
    }

    pub fn channel(&self) -> Channel {
        match self {
            AudioEvent::Note(e) => e.channel,
            AudioEvent::Change(e) => e.channel,
            AudioEvent::Track(e) => e.channel,
        }
    }

    /// `None` for kinds without a duration.
    pub fn duration(&self) -> Option<Tics> {
        match self {
            AudioEvent::Note(e) => Some(e.duration),
            AudioEvent::Track(e) => Some(e.duration),
            AudioEvent::Change(_) => None,
        }
    }

    /// Tic at which `complete` is due, for kinds that have one.
    pub fn end_time(&self) -> Option<Tics> {
        self.duration().map(|d| self.time().saturating_add(d))
    }

    pub fn execute(&self) {
        match self {
            AudioEvent::Note(e) => e.execute(),
            AudioEvent::Change(e) => e.execute(),
            AudioEvent::Track(e) => e.sequence.start(),
        }
    }

    pub fn complete(&self) {
        match self {
            AudioEvent::Note(e) => e.release(),
            // The nested sequence ends on its own cycle.
            AudioEvent::Track(_) => {}
            AudioEvent::Change(_) => {}
        }
    }

    /// Safe in any lifecycle state, including before `execute`.
    pub fn cancel(&self) {
        match self {
            AudioEvent::Note(e) => e.release(),
            AudioEvent::Track(e) => e.sequence.stop(),
            AudioEvent::Change(_) => {}
        }
    }

    /// Ascending time, then Note < Track < Change. Events of the same kind
    /// at the same tic compare equal.
    pub fn compare(&self, other: &AudioEvent) -> Ordering {
        self.time()
            .cmp(&other.time())
            .then_with(|| self.kind().cmp(&other.kind()))
    }
}

impl From<NoteEvent> for AudioEvent {
    fn from(event: NoteEvent) -> Self {
        AudioEvent::Note(event)
    }
}

impl From<ChangeEvent> for AudioEvent {
    fn from(event: ChangeEvent) -> Self {
        AudioEvent::Change(event)
    }
}

impl From<TrackEvent> for AudioEvent {
    fn from(event: TrackEvent) -> Self {
        AudioEvent::Track(event)
    }
}

// Equality is on event data. Devices are not compared; nested sequencers
// are compared by identity.
impl PartialEq for NoteEvent {
    fn eq(&self, other: &Self) -> bool {
        self.time == other.time
            && self.label == other.label
            && self.channel == other.channel
            && self.duration == other.duration
            && self.pitch == other.pitch
    }
}

impl PartialEq for ChangeEvent {
    fn eq(&self, other: &Self) -> bool {
        self.time == other.time
            && self.label == other.label
            && self.channel == other.channel
            && self.value == other.value
    }
}

impl PartialEq for TrackEvent {
    fn eq(&self, other: &Self) -> bool {
        self.time == other.time
            && self.label == other.label
            && self.channel == other.channel
            && self.duration == other.duration
            && self.sequence.ptr_eq(&other.sequence)
    }
}

impl PartialEq for AudioEvent {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (AudioEvent::Note(a), AudioEvent::Note(b)) => a == b,
            (AudioEvent::Change(a), AudioEvent::Change(b)) => a == b,
            (AudioEvent::Track(a), AudioEvent::Track(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for NoteEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}[{}, {}, {}, {}]",
            self.label, self.channel, self.time, self.duration, self.pitch
        )
    }
}

impl fmt::Display for ChangeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}[{}, {}, {}]",
            self.label, self.channel, self.time, self.value
        )
    }
}

impl fmt::Display for TrackEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}[{}, {}, {}, {}]",
            self.label,
            self.channel,
            self.time,
            self.duration,
            self.sequence.length()
        )
    }
}

impl fmt::Display for AudioEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AudioEvent::Note(e) => e.fmt(f),
            AudioEvent::Change(e) => e.fmt(f),
            AudioEvent::Track(e) => e.fmt(f),
        }
    }
}

impl fmt::Debug for NoteEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NoteEvent")
            .field("time", &self.time)
            .field("label", &self.label)
            .field("channel", &self.channel)
            .field("duration", &self.duration)
            .field("pitch", &self.pitch)
            .field("device", &self.device.name())
            .finish()
    }
}

impl fmt::Debug for ChangeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeEvent")
            .field("time", &self.time)
            .field("label", &self.label)
            .field("channel", &self.channel)
            .field("value", &self.value)
            .field("device", &self.device.name())
            .finish()
    }
}

impl fmt::Debug for TrackEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackEvent")
            .field("time", &self.time)
            .field("label", &self.label)
            .field("channel", &self.channel)
            .field("duration", &self.duration)
            .field("sequence", &self.sequence)
            .finish()
    }
}

impl fmt::Debug for AudioEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AudioEvent::Note(e) => e.fmt(f),
            AudioEvent::Change(e) => e.fmt(f),
            AudioEvent::Track(e) => e.fmt(f),
        }
    }
}
