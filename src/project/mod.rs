mod text;

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

use crate::audio::SoundDevice;
use crate::events::{AudioEvent, Channel, ChangeEvent, EventError, EventKind, NoteEvent, TrackEvent};
use crate::timing::{Sequencer, SequencerError, Tempo, Tics, TimeSource};

#[derive(Debug, Error)]
pub enum ProjectError {
    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("malformed song file at token {position}: expected {expected}, found {found}")]
    Malformed {
        position: usize,
        expected: &'static str,
        found: String,
    },
    #[error("invalid RON song file: {0}")]
    Ron(String),
    #[error("label {0:?} must be a single non-empty word")]
    InvalidLabel(String),
    #[error("track event refers to unknown track {0}")]
    UnknownTrack(Channel),
    #[error(transparent)]
    Event(#[from] EventError),
    #[error(transparent)]
    Sequencer(#[from] SequencerError),
    #[error("failed to format song file")]
    Format(#[from] std::fmt::Error),
}

/// One stored event. `value` is the pitch of a note or the value of a
/// change; `duration` is unused by changes. Track events name their
/// track by `channel`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    pub kind: EventKind,
    pub label: String,
    pub time: i64,
    pub channel: Channel,
    pub value: i32,
    pub duration: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackRecord {
    pub label: String,
    /// Also the device channel the track's instrument and volume apply to.
    pub number: Channel,
    pub instrument: i32,
    pub volume: i32,
    pub length: Tics,
    pub events: Vec<EventRecord>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SongRecord {
    pub length: Tics,
    pub events: Vec<EventRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    /// Beats per minute; one beat is one tic.
    pub tempo: u32,
    pub tracks: Vec<TrackRecord>,
    pub song: SongRecord,
}

fn is_ron(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("ron"))
}

impl EventRecord {
    fn from_event(event: &AudioEvent) -> Self {
        let (value, duration) = match event {
            AudioEvent::Note(note) => (note.pitch(), note.duration() as i64),
            AudioEvent::Change(change) => (change.value(), 0),
            AudioEvent::Track(track) => (0, track.duration() as i64),
        };
        Self {
            kind: event.kind(),
            label: event.label().to_string(),
            time: event.time() as i64,
            channel: event.channel(),
            value,
            duration,
        }
    }

    /// `tracks` are the engines a track event may refer to.
    fn to_event(
        &self,
        device: &Arc<dyn SoundDevice>,
        tracks: &[ArrangedTrack],
    ) -> Result<AudioEvent, ProjectError> {
        let event: AudioEvent = match self.kind {
            EventKind::Note => NoteEvent::new(
                self.time,
                self.label.clone(),
                self.channel,
                self.duration,
                self.value,
                device.clone(),
            )?
            .into(),
            EventKind::Change => ChangeEvent::new(
                self.time,
                self.label.clone(),
                self.channel,
                self.value,
                device.clone(),
            )?
            .into(),
            EventKind::Track => {
                let track = usize::try_from(self.channel)
                    .ok()
                    .and_then(|index| tracks.get(index))
                    .ok_or(ProjectError::UnknownTrack(self.channel))?;
                TrackEvent::new(
                    self.time,
                    self.label.clone(),
                    self.channel,
                    self.duration,
                    track.sequencer.clone(),
                )?
                .into()
            }
        };
        Ok(event)
    }
}

impl Project {
    pub fn new(tempo: u32) -> Self {
        Self {
            tempo,
            tracks: Vec::new(),
            song: SongRecord::default(),
        }
    }

    pub fn from_text(source: &str) -> Result<Self, ProjectError> {
        text::parse(source)
    }

    pub fn to_text(&self) -> Result<String, ProjectError> {
        text::write(self)
    }

    pub fn from_ron(source: &str) -> Result<Self, ProjectError> {
        ron::from_str(source).map_err(|e| ProjectError::Ron(e.to_string()))
    }

    pub fn to_ron(&self) -> Result<String, ProjectError> {
        ron::ser::to_string_pretty(self, ron::ser::PrettyConfig::default())
            .map_err(|e| ProjectError::Ron(e.to_string()))
    }

    /// `.ron` files are RON, anything else is the plain song format.
    pub fn load(path: &Path) -> Result<Self, ProjectError> {
        let source = fs::read_to_string(path).map_err(|source| ProjectError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        if is_ron(path) {
            Self::from_ron(&source)
        } else {
            Self::from_text(&source)
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), ProjectError> {
        let contents = if is_ron(path) {
            self.to_ron()?
        } else {
            self.to_text()?
        };
        fs::write(path, contents).map_err(|source| ProjectError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Creates one sequencer per track, then the song sequencer. A track
    /// event inside a track may only refer to an earlier track; song
    /// events may refer to any. Any bad record fails the whole build and
    /// nothing is touched on the device.
    pub fn build(
        &self,
        device: Arc<dyn SoundDevice>,
        clock: Arc<dyn TimeSource>,
    ) -> Result<Arrangement, ProjectError> {
        let tempo = Tempo::from_bpm(self.tempo as f64)?;

        let mut tracks: Vec<ArrangedTrack> = Vec::with_capacity(self.tracks.len());
        for record in &self.tracks {
            let sequencer = Sequencer::labelled(record.label.clone(), record.length, clock.clone());
            sequencer.set_tempo(tempo);
            let events = record
                .events
                .iter()
                .map(|e| e.to_event(&device, &tracks))
                .collect::<Result<Vec<_>, _>>()?;
            sequencer.update_sequence(events);
            tracks.push(ArrangedTrack {
                number: record.number,
                instrument: record.instrument,
                volume: record.volume,
                sequencer,
            });
        }

        let song = Sequencer::labelled("song", self.song.length, clock);
        song.set_tempo(tempo);
        let events = self
            .song
            .events
            .iter()
            .map(|e| e.to_event(&device, &tracks))
            .collect::<Result<Vec<_>, _>>()?;
        song.update_sequence(events);

        tracing::info!(
            tracks = tracks.len(),
            song_events = self.song.events.len(),
            bpm = self.tempo,
            "project built"
        );

        Ok(Arrangement {
            tempo_bpm: self.tempo,
            tracks,
            song,
            device,
        })
    }

    /// Records the current contents of live sequencers.
    pub fn capture(arrangement: &Arrangement) -> Self {
        let records = |sequencer: &Sequencer| {
            sequencer
                .iter()
                .map(|event| EventRecord::from_event(&event))
                .collect::<Vec<_>>()
        };

        Self {
            tempo: arrangement.tempo_bpm,
            tracks: arrangement
                .tracks
                .iter()
                .map(|track| TrackRecord {
                    label: track.sequencer.label().to_string(),
                    number: track.number,
                    instrument: track.instrument,
                    volume: track.volume,
                    length: track.sequencer.length(),
                    events: records(&track.sequencer),
                })
                .collect(),
            song: SongRecord {
                length: arrangement.song.length(),
                events: records(&arrangement.song),
            },
        }
    }
}

/// A track's engine and the channel settings it brings along.
#[derive(Debug, Clone)]
pub struct ArrangedTrack {
    pub number: Channel,
    pub instrument: i32,
    pub volume: i32,
    pub sequencer: Sequencer,
}

/// Live engines built from a [`Project`].
pub struct Arrangement {
    tempo_bpm: u32,
    tracks: Vec<ArrangedTrack>,
    song: Sequencer,
    device: Arc<dyn SoundDevice>,
}

impl std::fmt::Debug for Arrangement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Arrangement")
            .field("tempo_bpm", &self.tempo_bpm)
            .field("tracks", &self.tracks)
            .field("song", &self.song)
            .finish_non_exhaustive()
    }
}

impl Arrangement {
    pub fn tempo_bpm(&self) -> u32 {
        self.tempo_bpm
    }

    pub fn tracks(&self) -> &[ArrangedTrack] {
        &self.tracks
    }

    pub fn song(&self) -> &Sequencer {
        &self.song
    }

    pub fn device(&self) -> &Arc<dyn SoundDevice> {
        &self.device
    }

    /// Applies to every engine from its next cycle on.
    pub fn set_tempo(&mut self, bpm: u32) -> Result<(), SequencerError> {
        let tempo = Tempo::from_bpm(bpm as f64)?;
        self.song.set_tempo(tempo);
        for track in &self.tracks {
            track.sequencer.set_tempo(tempo);
        }
        self.tempo_bpm = bpm;
        Ok(())
    }

    pub fn is_looping(&self) -> bool {
        self.song.is_looping()
    }

    /// Loops the song, or a single track played on its own. Tracks
    /// nested in the song always play once per window.
    pub fn set_loop(&self, looping: bool) {
        self.song.set_loop(looping);
    }

    pub fn is_playing(&self) -> bool {
        self.song.is_running() || self.tracks.iter().any(|t| t.sequencer.is_running())
    }

    pub fn play_song(&self) {
        self.stop_all();
        for track in &self.tracks {
            track.sequencer.set_loop(false);
        }
        self.song.start();
    }

    pub fn play_track(&self, index: usize) -> Result<(), ProjectError> {
        let track = self
            .tracks
            .get(index)
            .ok_or(ProjectError::UnknownTrack(index as Channel))?;
        self.stop_all();
        track.sequencer.set_loop(self.is_looping());
        track.sequencer.start();
        Ok(())
    }

    pub fn stop_all(&self) {
        self.song.stop();
        for track in &self.tracks {
            track.sequencer.stop();
        }
        if let Err(e) = self.device.all_notes_off() {
            tracing::warn!(error = %e, "all notes off failed");
        }
    }

    pub fn set_volume(&mut self, index: usize, volume: i32) -> Result<(), ProjectError> {
        let track = self
            .tracks
            .get_mut(index)
            .ok_or(ProjectError::UnknownTrack(index as Channel))?;
        track.volume = volume.clamp(0, 127);
        if let Err(e) = self.device.set_volume(track.number, track.volume) {
            tracing::warn!(track = index, error = %e, "set volume failed");
        }
        Ok(())
    }

    pub fn set_instrument(&mut self, index: usize, instrument: i32) -> Result<(), ProjectError> {
        let track = self
            .tracks
            .get_mut(index)
            .ok_or(ProjectError::UnknownTrack(index as Channel))?;
        track.instrument = instrument;
        if let Err(e) = self.device.set_instrument(track.number, instrument) {
            tracing::warn!(track = index, error = %e, "set instrument failed");
        }
        Ok(())
    }

    /// Sends every track's instrument and volume to its channel.
    pub fn apply_channel_settings(&self) {
        for track in &self.tracks {
            if let Err(e) = self.device.set_instrument(track.number, track.instrument) {
                tracing::warn!(channel = track.number, error = %e, "set instrument failed");
            }
            if let Err(e) = self.device.set_volume(track.number, track.volume) {
                tracing::warn!(channel = track.number, error = %e, "set volume failed");
            }
        }
    }
}

impl Drop for Arrangement {
    fn drop(&mut self) {
        if self.is_playing() {
            self.stop_all();
        }
    }
}
