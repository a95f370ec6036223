pub mod audio;
pub mod config;
pub mod engine;
pub mod events;
pub mod project;
pub mod timing;

pub use audio::{DeviceError, NullDevice, RecordingDevice, SoundDevice, open_device};
pub use config::{CliArgs, OutputKind, Settings};
pub use engine::{EngineCommand, EngineHandle, EngineUpdate, spawn_engine};
pub use events::{AudioEvent, Channel, ChangeEvent, EventError, EventKind, NoteEvent, TrackEvent};
pub use project::{Arrangement, Project, ProjectError};
pub use timing::{
    EventStore, ManualClock, Sequencer, SequencerError, Tempo, Tics, TimeSource, Timer, WallClock,
};
