use parking_lot::Mutex;
use std::cell::RefCell;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use thiserror::Error;

use super::clock::{Task, TimeSource, Timer, WallClock};
use super::store::{EventStore, StoreError};
use super::tempo::Tempo;
use super::Tics;
use crate::events::AudioEvent;

#[derive(Debug, Error, Clone, Copy, PartialEq)]
pub enum SequencerError {
    #[error("speed factor must be a positive, finite number of tics per millisecond, got {0}")]
    InvalidSpeedFactor(f64),
}

struct State {
    events: EventStore,
    length: Tics,
    tempo: Tempo,
    looping: bool,
    running: bool,
    started_at: Option<u64>,
    timer: Box<dyn Timer>,
}

struct Inner {
    label: String,
    clock: Arc<dyn TimeSource>,
    /// Advanced by every stop. Callbacks from an older epoch do nothing.
    epoch: AtomicU64,
    state: Mutex<State>,
}

#[derive(Clone, Copy, Debug)]
enum Phase {
    Execute,
    Complete,
}

/// Plays a sorted set of events against a timer.
///
/// `start` walks the events once and hands the timer one callback per
/// `execute`, one per `complete` for events with a duration, and a final
/// end-of-cycle callback at `length`. That last callback either starts the
/// next cycle (when looping) or marks the sequencer idle.
///
/// `stop` is the only cancellation: it throws the timer away, installs a
/// fresh one, and calls `cancel` on every stored event.
///
/// Cloning gives another handle to the same sequencer.
#[derive(Clone)]
pub struct Sequencer {
    inner: Arc<Inner>,
}

impl Sequencer {
    pub fn new(length: Tics) -> Self {
        Self::with_clock(length, Arc::new(WallClock::new()))
    }

    pub fn with_clock(length: Tics, clock: Arc<dyn TimeSource>) -> Self {
        Self::labelled("sequence", length, clock)
    }

    pub fn labelled(label: impl Into<String>, length: Tics, clock: Arc<dyn TimeSource>) -> Self {
        let timer = clock.new_timer();
        Self {
            inner: Arc::new(Inner {
                label: label.into(),
                clock,
                epoch: AtomicU64::new(0),
                state: Mutex::new(State {
                    events: EventStore::new(),
                    length,
                    tempo: Tempo::DEFAULT,
                    looping: false,
                    running: false,
                    started_at: None,
                    timer,
                }),
            }),
        }
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn clock(&self) -> Arc<dyn TimeSource> {
        self.inner.clock.clone()
    }

    /// True when both handles control the same sequencer.
    pub fn ptr_eq(&self, other: &Sequencer) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn event_count(&self) -> usize {
        self.inner.state.lock().events.len()
    }

    pub fn add(&self, event: impl Into<AudioEvent>) {
        self.inner.state.lock().events.add(event.into());
    }

    pub fn add_all(&self, events: impl IntoIterator<Item = AudioEvent>) {
        self.inner.state.lock().events.extend(events);
    }

    /// Removes the first stored event equal to `event`.
    pub fn remove(&self, event: &AudioEvent) -> Option<AudioEvent> {
        self.inner.state.lock().events.remove(event)
    }

    pub fn remove_at(&self, index: usize) -> Result<AudioEvent, StoreError> {
        self.inner.state.lock().events.remove_at(index)
    }

    pub fn get(&self, index: usize) -> Result<AudioEvent, StoreError> {
        self.inner.state.lock().events.get(index).cloned()
    }

    pub fn update_sequence(&self, events: Vec<AudioEvent>) {
        self.inner.state.lock().events.replace_all(events);
    }

    /// Does not cancel callbacks that are already scheduled; stop first for
    /// that.
    pub fn clear(&self) {
        self.inner.state.lock().events.clear();
    }

    /// Snapshot of the events in playback order.
    pub fn events(&self) -> Vec<AudioEvent> {
        self.inner.state.lock().events.to_vec()
    }

    pub fn iter(&self) -> std::vec::IntoIter<AudioEvent> {
        self.events().into_iter()
    }

    pub fn length(&self) -> Tics {
        self.inner.state.lock().length
    }

    /// Stops playback first if running.
    pub fn set_length(&self, length: Tics) {
        if self.is_running() {
            self.stop();
        }
        self.inner.state.lock().length = length;
    }

    pub fn tempo(&self) -> Tempo {
        self.inner.state.lock().tempo
    }

    pub fn speed_factor(&self) -> f64 {
        self.tempo().tics_per_milli()
    }

    /// Only affects cycles started afterwards.
    pub fn set_tempo(&self, tempo: Tempo) {
        self.inner.state.lock().tempo = tempo;
    }

    pub fn set_speed_factor(&self, tics_per_milli: f64) -> Result<(), SequencerError> {
        self.set_tempo(Tempo::new(tics_per_milli)?);
        Ok(())
    }

    pub fn set_tempo_bpm(&self, bpm: f64) -> Result<(), SequencerError> {
        self.set_tempo(Tempo::from_bpm(bpm)?);
        Ok(())
    }

    pub fn tics_to_millis(&self, tics: Tics) -> u64 {
        self.tempo().tics_to_millis(tics)
    }

    pub fn millis_to_tics(&self, millis: u64) -> f64 {
        self.tempo().millis_to_tics(millis)
    }

    pub fn is_looping(&self) -> bool {
        self.inner.state.lock().looping
    }

    pub fn set_loop(&self, looping: bool) {
        self.inner.state.lock().looping = looping;
    }

    pub fn is_running(&self) -> bool {
        self.inner.state.lock().running
    }

    /// Tics since the current cycle started, or 0 when idle.
    pub fn elapsed_tics(&self) -> f64 {
        let state = self.inner.state.lock();
        match (state.running, state.started_at) {
            (true, Some(started_at)) => {
                let now = self.inner.clock.now_millis();
                state.tempo.millis_to_tics(now.saturating_sub(started_at))
            }
            _ => 0.0,
        }
    }

    /// Plays from the beginning. A running sequencer is stopped first.
    pub fn start(&self) {
        if self.is_running() {
            self.stop();
        }
        let epoch = self.inner.epoch.load(Ordering::Acquire);
        self.inner.begin_cycle(epoch, false);
    }

    /// Drops every pending callback, then cancels every stored event whatever
    /// state it is in. Callbacks already running finish undisturbed.
    pub fn stop(&self) {
        // A nested track can lead back here while we are cancelling.
        let Some(_guard) = StopGuard::enter(&self.inner) else {
            return;
        };

        let (discarded, events) = {
            let mut state = self.inner.state.lock();
            state.running = false;
            state.started_at = None;
            self.inner.epoch.fetch_add(1, Ordering::AcqRel);
            let fresh = self.inner.clock.new_timer();
            (
                std::mem::replace(&mut state.timer, fresh),
                state.events.to_vec(),
            )
        };
        discarded.cancel_all_pending();
        drop(discarded);

        tracing::debug!(sequence = %self.inner.label, events = events.len(), "stopped");
        for event in &events {
            event.cancel();
        }
    }
}

thread_local! {
    /// Sequencers being stopped further up this thread's stack.
    static STOPPING: RefCell<Vec<usize>> = const { RefCell::new(Vec::new()) };
}

/// Marks a sequencer as stopping on the current thread only. Other threads
/// calling `stop` meanwhile run a full stop of their own.
struct StopGuard(usize);

impl StopGuard {
    fn enter(inner: &Arc<Inner>) -> Option<Self> {
        let key = Arc::as_ptr(inner) as usize;
        STOPPING.with_borrow_mut(|stopping| {
            if stopping.contains(&key) {
                None
            } else {
                stopping.push(key);
                Some(StopGuard(key))
            }
        })
    }
}

impl Drop for StopGuard {
    fn drop(&mut self) {
        STOPPING.with_borrow_mut(|stopping| stopping.retain(|key| *key != self.0));
    }
}

impl Inner {
    /// `restart` is set for loop restarts. A fresh start that finds the
    /// epoch already running lost a race with a concurrent `start`.
    fn begin_cycle(self: &Arc<Self>, epoch: u64, restart: bool) {
        let mut guard = self.state.lock();
        if self.epoch.load(Ordering::Acquire) != epoch || (guard.running && !restart) {
            return;
        }
        let state = &mut *guard;
        state.started_at = Some(self.clock.now_millis());
        state.running = true;

        // The lock stays held while scheduling so the event set cannot
        // change under the loop.
        let tempo = state.tempo;
        let weak = Arc::downgrade(self);
        for event in state.events.iter() {
            state.timer.schedule_once_after(
                tempo.tics_to_millis(event.time()),
                dispatch(weak.clone(), epoch, event.clone(), Phase::Execute),
            );
            if let Some(end) = event.end_time() {
                state.timer.schedule_once_after(
                    tempo.tics_to_millis(end),
                    dispatch(weak.clone(), epoch, event.clone(), Phase::Complete),
                );
            }
        }
        state.timer.schedule_once_after(
            tempo.tics_to_millis(state.length),
            Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.end_cycle(epoch);
                }
            }),
        );

        tracing::debug!(
            sequence = %self.label,
            events = state.events.len(),
            length = state.length,
            tics_per_ms = tempo.tics_per_milli(),
            looping = state.looping,
            "cycle started"
        );
    }

    fn end_cycle(self: &Arc<Self>, epoch: u64) {
        let restart = {
            let mut state = self.state.lock();
            if self.epoch.load(Ordering::Acquire) != epoch {
                return;
            }
            if !state.looping {
                state.running = false;
                state.started_at = None;
            }
            state.looping
        };

        if restart {
            self.begin_cycle(epoch, true);
        } else {
            tracing::debug!(sequence = %self.label, "cycle finished");
        }
    }
}

fn dispatch(inner: Weak<Inner>, epoch: u64, event: AudioEvent, phase: Phase) -> Task {
    Box::new(move || {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        if inner.epoch.load(Ordering::Acquire) != epoch {
            return;
        }
        tracing::trace!(sequence = %inner.label, ?phase, event = %event, "dispatch");
        drop(inner);
        match phase {
            Phase::Execute => event.execute(),
            Phase::Complete => event.complete(),
        }
    })
}

impl<'a> IntoIterator for &'a Sequencer {
    type Item = AudioEvent;
    type IntoIter = std::vec::IntoIter<AudioEvent>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl fmt::Debug for Sequencer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Sequencer");
        s.field("label", &self.inner.label);
        match self.inner.state.try_lock() {
            Some(state) => s
                .field("events", &state.events.len())
                .field("length", &state.length)
                .field("tempo", &state.tempo)
                .field("looping", &state.looping)
                .field("running", &state.running),
            None => s.field("state", &"<locked>"),
        };
        s.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{DeviceCall, DeviceError, RecordingDevice, SoundDevice};
    use crate::events::{Channel, ChangeEvent, NoteEvent, TrackEvent};
    use crate::timing::ManualClock;
    use std::sync::Barrier;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::thread;
    use std::time::Duration;

    fn setup(length: Tics) -> (ManualClock, Arc<RecordingDevice>, Sequencer) {
        let clock = ManualClock::new();
        let device = Arc::new(RecordingDevice::new());
        let seq = Sequencer::with_clock(length, Arc::new(clock.clone()));
        (clock, device, seq)
    }

    fn note(device: &Arc<RecordingDevice>, time: i64, duration: i64, pitch: i32) -> AudioEvent {
        let device: Arc<dyn SoundDevice> = device.clone();
        NoteEvent::new(time, "piano", 0, duration, pitch, device)
            .unwrap()
            .into()
    }

    fn on(pitch: i32) -> DeviceCall {
        DeviceCall::NoteOn { channel: 0, pitch }
    }

    fn off(pitch: i32) -> DeviceCall {
        DeviceCall::NoteOff { channel: 0, pitch }
    }

    #[test]
    fn two_note_cycle_fires_on_schedule() {
        let (clock, device, seq) = setup(4);
        seq.add(note(&device, 0, 2, 60));
        seq.add(note(&device, 2, 2, 64));

        seq.start();
        assert!(seq.is_running());

        clock.advance(0);
        assert_eq!(device.take_calls(), vec![on(60)]);

        clock.advance(1);
        assert!(device.take_calls().is_empty());

        clock.advance(1);
        let at_two = device.take_calls();
        assert_eq!(at_two.len(), 2);
        assert!(at_two.contains(&off(60)));
        assert!(at_two.contains(&on(64)));

        clock.advance(2);
        assert_eq!(device.take_calls(), vec![off(64)]);
        assert!(!seq.is_running());
        assert_eq!(clock.pending(), 0);
    }

    #[test]
    fn looping_restarts_every_length() {
        let (clock, device, seq) = setup(4);
        seq.add(note(&device, 0, 1, 60));
        seq.set_loop(true);

        seq.start();
        clock.advance(0);
        assert_eq!(device.take_calls(), vec![on(60)]);

        for _ in 0..3 {
            clock.advance(3);
            assert_eq!(device.take_calls(), vec![off(60)]);
            assert!(seq.is_running());

            clock.advance(1);
            assert_eq!(device.take_calls(), vec![on(60)]);
            assert!(seq.is_running());
            assert_eq!(seq.elapsed_tics(), 0.0);
        }
        assert_eq!(clock.now(), 12);
    }

    #[test]
    fn stop_cancels_each_event_once_and_silences_the_rest() {
        let (clock, device, seq) = setup(20);
        seq.add(note(&device, 0, 10, 60));
        seq.add(note(&device, 5, 2, 62));
        seq.add(ChangeEvent::new(3, "volume", 0, 90, device.clone()).unwrap());

        seq.start();
        clock.advance(4);
        assert_eq!(
            device.take_calls(),
            vec![on(60), DeviceCall::Volume { channel: 0, volume: 90 }]
        );

        seq.stop();
        assert!(!seq.is_running());
        assert_eq!(seq.elapsed_tics(), 0.0);
        assert_eq!(device.take_calls(), vec![off(60), off(62)]);

        clock.advance(100);
        assert!(device.take_calls().is_empty());
        assert_eq!(clock.pending(), 0);
    }

    #[test]
    fn stop_on_an_idle_sequencer_still_cancels() {
        let (_clock, device, seq) = setup(8);
        seq.add(note(&device, 2, 2, 67));
        seq.stop();
        assert_eq!(device.take_calls(), vec![off(67)]);
    }

    #[test]
    fn non_looping_cycle_goes_idle() {
        let (clock, device, seq) = setup(6);
        seq.add(note(&device, 1, 1, 60));
        seq.start();

        clock.advance(3);
        assert!(seq.is_running());
        assert_eq!(seq.elapsed_tics(), 3.0);

        clock.advance(3);
        assert!(!seq.is_running());
        assert_eq!(seq.elapsed_tics(), 0.0);
    }

    #[test]
    fn speed_factor_scales_fire_times() {
        let (clock, device, seq) = setup(40);
        seq.add(note(&device, 10, 10, 60));
        seq.set_speed_factor(2.0).unwrap();

        seq.start();
        clock.advance(4);
        assert!(device.calls().is_empty());
        clock.advance(1);
        assert_eq!(device.take_calls(), vec![on(60)]);
        assert_eq!(seq.elapsed_tics(), 10.0);

        clock.advance(5);
        assert_eq!(device.take_calls(), vec![off(60)]);
        clock.advance(10);
        assert!(!seq.is_running());
    }

    #[test]
    fn tempo_change_does_not_reschedule_a_running_cycle() {
        let (clock, device, seq) = setup(20);
        seq.add(note(&device, 10, 0, 60));
        seq.start();
        seq.set_speed_factor(0.5).unwrap();

        clock.advance(10);
        assert_eq!(device.take_calls(), vec![on(60), off(60)]);

        clock.advance(10);
        assert!(!seq.is_running());

        seq.start();
        clock.advance(19);
        assert!(device.calls().is_empty());
        clock.advance(1);
        assert_eq!(device.take_calls(), vec![on(60), off(60)]);
    }

    #[test]
    fn rejects_invalid_speed_factor() {
        let (_clock, _device, seq) = setup(4);
        assert_eq!(
            seq.set_speed_factor(0.0),
            Err(SequencerError::InvalidSpeedFactor(0.0))
        );
        assert_eq!(seq.speed_factor(), 1.0);
        seq.set_tempo_bpm(120.0).unwrap();
        assert_eq!(seq.tics_to_millis(1), 500);
    }

    #[test]
    fn zero_duration_note_gets_execute_and_complete() {
        let (clock, device, seq) = setup(4);
        seq.add(note(&device, 1, 0, 72));
        seq.start();
        clock.advance(1);
        assert_eq!(device.take_calls(), vec![on(72), off(72)]);
    }

    #[test]
    fn set_length_stops_a_running_sequencer() {
        let (clock, device, seq) = setup(10);
        seq.add(note(&device, 5, 1, 60));
        seq.start();
        seq.set_length(3);
        assert!(!seq.is_running());
        assert_eq!(seq.length(), 3);
        device.take_calls();

        clock.advance(20);
        assert!(device.calls().is_empty());
    }

    #[test]
    fn set_length_while_idle_keeps_it_idle() {
        let (_clock, _device, seq) = setup(10);
        seq.set_length(12);
        assert_eq!(seq.length(), 12);
        assert!(!seq.is_running());
    }

    #[test]
    fn restarting_a_running_sequencer_does_not_double_notes() {
        let (clock, device, seq) = setup(10);
        seq.add(note(&device, 2, 1, 60));
        seq.start();
        clock.advance(1);
        seq.start();
        device.take_calls();

        clock.advance(10);
        assert_eq!(device.take_calls(), vec![on(60), off(60)]);
    }

    #[test]
    fn mutations_after_start_do_not_touch_the_running_cycle() {
        let (clock, device, seq) = setup(10);
        seq.add(note(&device, 4, 1, 60));
        seq.start();
        seq.add(note(&device, 2, 1, 61));
        seq.clear();
        assert_eq!(seq.event_count(), 0);

        clock.advance(10);
        assert_eq!(device.take_calls(), vec![on(60), off(60)]);
    }

    #[test]
    fn same_tic_dispatches_notes_then_tracks_then_changes() {
        let (clock, device, seq) = setup(4);
        let nested = Sequencer::with_clock(1, seq.clock());
        seq.add(ChangeEvent::new(1, "volume", 0, 10, device.clone()).unwrap());
        seq.add(TrackEvent::new(1, "track0", 0, 1, nested.clone()).unwrap());
        seq.add(note(&device, 1, 1, 60));

        let events = seq.events();
        assert!(matches!(events[0], AudioEvent::Note(_)));
        assert!(matches!(events[1], AudioEvent::Track(_)));
        assert!(matches!(events[2], AudioEvent::Change(_)));

        seq.start();
        clock.advance(1);
        assert_eq!(
            device.take_calls(),
            vec![on(60), DeviceCall::Volume { channel: 0, volume: 10 }]
        );
        assert!(nested.is_running());
    }

    #[test]
    fn track_event_runs_the_nested_sequencer_in_its_window() {
        let (clock, device, outer) = setup(16);
        let nested = Sequencer::labelled("track0", 4, outer.clock());
        nested.add(note(&device, 0, 4, 70));
        nested.add(note(&device, 1, 1, 71));
        outer.add(TrackEvent::new(2, "track0", 0, 8, nested.clone()).unwrap());

        outer.start();
        clock.advance(2);
        assert!(nested.is_running());
        assert_eq!(device.take_calls(), vec![on(70)]);

        clock.advance(1);
        assert_eq!(device.take_calls(), vec![on(71)]);

        outer.stop();
        assert!(!nested.is_running());
        assert_eq!(device.take_calls(), vec![off(70), off(71)]);

        clock.advance(50);
        assert!(device.calls().is_empty());
    }

    #[test]
    fn nested_sequencer_ends_on_its_own_cycle() {
        let (clock, device, outer) = setup(16);
        let nested = Sequencer::with_clock(4, outer.clock());
        nested.add(note(&device, 0, 1, 70));
        outer.add(TrackEvent::new(0, "track0", 0, 8, nested.clone()).unwrap());

        outer.start();
        clock.advance(3);
        assert!(nested.is_running());
        clock.advance(1);
        assert!(!nested.is_running());
        assert!(outer.is_running());
    }

    #[test]
    fn nested_tempo_is_independent() {
        let (clock, device, outer) = setup(100);
        let nested = Sequencer::with_clock(10, outer.clock());
        nested.set_speed_factor(0.5).unwrap();
        nested.add(note(&device, 2, 0, 80));
        outer.add(TrackEvent::new(1, "t", 0, 10, nested).unwrap());

        outer.start();
        clock.advance(4);
        assert!(device.calls().is_empty());
        clock.advance(1);
        assert_eq!(device.take_calls(), vec![on(80), off(80)]);
    }

    #[test]
    fn self_referencing_track_stops_without_recursing() {
        let (_clock, _device, seq) = setup(4);
        seq.add(TrackEvent::new(0, "loop", 0, 4, seq.clone()).unwrap());
        seq.stop();
        assert!(!seq.is_running());
        seq.clear();
    }

    #[test]
    fn index_access_reports_out_of_range() {
        let (_clock, device, seq) = setup(4);
        seq.add(note(&device, 0, 1, 60));
        assert!(seq.get(0).is_ok());
        assert_eq!(
            seq.get(3).err(),
            Some(StoreError::OutOfRange { index: 3, len: 1 })
        );
        assert!(seq.remove_at(1).is_err());
        assert!(seq.remove_at(0).is_ok());
    }

    #[test]
    fn iteration_is_a_snapshot_in_playback_order() {
        let (_clock, device, seq) = setup(8);
        seq.update_sequence(vec![note(&device, 5, 1, 65), note(&device, 1, 1, 61)]);

        let mut seen = Vec::new();
        for event in &seq {
            seq.add(note(&device, 0, 1, 50));
            seen.push(event.time());
        }
        assert_eq!(seen, vec![1, 5]);
        assert_eq!(seq.event_count(), 4);
        assert_eq!(seq.iter().count(), 4);
    }

    #[test]
    fn removing_an_event_keeps_the_rest() {
        let (_clock, device, seq) = setup(8);
        let target = note(&device, 3, 1, 63);
        seq.add_all(vec![note(&device, 1, 1, 61), target.clone(), target.clone()]);
        assert_eq!(seq.remove(&target), Some(target.clone()));
        assert_eq!(seq.event_count(), 2);
        assert!(seq.events().contains(&target));
    }

    /// Holds the first `note_off` until the test lets it go.
    struct GateDevice {
        entered: Barrier,
        release: Barrier,
        gated: AtomicBool,
        note_ons: AtomicUsize,
    }

    impl GateDevice {
        fn new() -> Self {
            Self {
                entered: Barrier::new(2),
                release: Barrier::new(2),
                gated: AtomicBool::new(false),
                note_ons: AtomicUsize::new(0),
            }
        }
    }

    impl SoundDevice for GateDevice {
        fn name(&self) -> &str {
            "gate"
        }

        fn note_on(&self, _channel: Channel, _pitch: i32) -> Result<(), DeviceError> {
            self.note_ons.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn note_off(&self, _channel: Channel, _pitch: i32) -> Result<(), DeviceError> {
            if !self.gated.swap(true, Ordering::SeqCst) {
                self.entered.wait();
                self.release.wait();
            }
            Ok(())
        }
    }

    #[test]
    fn stop_on_another_thread_does_not_swallow_this_stop() {
        let clock = ManualClock::new();
        let gate = Arc::new(GateDevice::new());
        let device: Arc<dyn SoundDevice> = gate.clone();
        let seq = Sequencer::with_clock(10, Arc::new(clock.clone()));
        seq.add(NoteEvent::new(2, "piano", 0, 1, 60, device).unwrap());

        let first = seq.clone();
        let stopper = thread::spawn(move || first.stop());
        gate.entered.wait();

        // The other thread is parked inside its cancel loop.
        seq.start();
        assert!(seq.is_running());
        seq.stop();
        assert!(!seq.is_running());
        assert_eq!(clock.pending(), 0);

        clock.advance(20);
        assert_eq!(gate.note_ons.load(Ordering::SeqCst), 0);

        gate.release.wait();
        stopper.join().unwrap();
        assert!(!seq.is_running());
    }

    #[test]
    fn concurrent_starts_run_a_single_cycle() {
        let (clock, device, seq) = setup(10);
        seq.add(note(&device, 0, 5, 60));
        let barrier = Arc::new(Barrier::new(2));
        let other = {
            let seq = seq.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                seq.start();
            })
        };
        barrier.wait();
        seq.start();
        other.join().unwrap();

        clock.advance(0);
        let ons = device.take_calls().into_iter().filter(|c| *c == on(60)).count();
        assert_eq!(ons, 1);
        assert!(seq.is_running());
    }

    #[test]
    fn mutation_from_another_thread_while_cycling() {
        let (clock, device, seq) = setup(10);
        seq.add(note(&device, 1, 1, 60));
        let writer = {
            let seq = seq.clone();
            let device = device.clone();
            thread::spawn(move || {
                for i in 0..200i64 {
                    seq.add(note(&device, i % 10, 1, 61));
                }
            })
        };
        for _ in 0..50 {
            seq.start();
            clock.advance(1);
            seq.stop();
        }
        writer.join().unwrap();

        assert_eq!(seq.event_count(), 201);
        assert!(!seq.is_running());
        device.take_calls();
        clock.advance(100);
        assert!(device.calls().is_empty());
        assert_eq!(clock.pending(), 0);
    }

    #[test]
    fn tiny_speed_factor_starts_on_the_manual_clock() {
        let (clock, device, seq) = setup(4);
        seq.add(note(&device, 0, 0, 60));
        clock.advance(5);
        seq.set_speed_factor(1e-300).unwrap();

        seq.start();
        clock.advance(10);
        assert_eq!(device.take_calls(), vec![on(60), off(60)]);
        assert!(seq.is_running());
        seq.stop();
        assert_eq!(clock.pending(), 0);
    }

    #[test]
    fn tiny_speed_factor_starts_on_the_wall_clock() {
        let device = Arc::new(RecordingDevice::new());
        let seq = Sequencer::with_clock(4, Arc::new(WallClock::new()));
        seq.add(note(&device, 0, 0, 60));
        seq.set_speed_factor(1e-300).unwrap();

        seq.start();
        thread::sleep(Duration::from_millis(100));
        assert!(seq.is_running());
        seq.stop();
        assert!(device.calls().starts_with(&[on(60), off(60)]));
    }
}
