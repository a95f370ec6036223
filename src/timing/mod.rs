mod clock;
mod manual;
mod sequencer;
mod store;
mod tempo;

pub use clock::{Task, ThreadTimer, TimeSource, Timer, WallClock};
pub use manual::{ManualClock, ManualTimer};
pub use sequencer::{Sequencer, SequencerError};
pub use store::{EventStore, StoreError};
pub use tempo::Tempo;

/// Abstract time unit for event positions and cycle lengths.
pub type Tics = u64;
