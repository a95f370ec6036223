use std::cmp::Ordering;
use thiserror::Error;

use crate::events::AudioEvent;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum StoreError {
    #[error("index {index} out of range for {len} events")]
    OutOfRange { index: usize, len: usize },
}

/// Events kept sorted by [`AudioEvent::compare`] after every mutation.
/// Events that compare equal stay in insertion order.
#[derive(Debug, Clone, Default)]
pub struct EventStore {
    events: Vec<AudioEvent>,
}

impl EventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_events(events: Vec<AudioEvent>) -> Self {
        let mut store = Self { events };
        store.sort();
        store
    }

    /// Inserts after every event that does not compare greater.
    pub fn add(&mut self, event: AudioEvent) {
        let index = self
            .events
            .partition_point(|e| e.compare(&event) != Ordering::Greater);
        self.events.insert(index, event);
    }

    pub fn extend(&mut self, events: impl IntoIterator<Item = AudioEvent>) {
        self.events.extend(events);
        self.sort();
    }

    /// Removes the first event equal to `event`.
    pub fn remove(&mut self, event: &AudioEvent) -> Option<AudioEvent> {
        let index = self.events.iter().position(|e| e == event)?;
        Some(self.events.remove(index))
    }

    pub fn remove_at(&mut self, index: usize) -> Result<AudioEvent, StoreError> {
        self.check(index)?;
        Ok(self.events.remove(index))
    }

    pub fn get(&self, index: usize) -> Result<&AudioEvent, StoreError> {
        self.check(index)?;
        Ok(&self.events[index])
    }

    pub fn replace_all(&mut self, events: Vec<AudioEvent>) {
        self.events = events;
        self.sort();
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, AudioEvent> {
        self.events.iter()
    }

    pub fn to_vec(&self) -> Vec<AudioEvent> {
        self.events.clone()
    }

    fn check(&self, index: usize) -> Result<(), StoreError> {
        if index < self.events.len() {
            Ok(())
        } else {
            Err(StoreError::OutOfRange {
                index,
                len: self.events.len(),
            })
        }
    }

    // Stable, so ties keep their relative order.
    fn sort(&mut self) {
        self.events.sort_by(|a, b| a.compare(b));
    }
}

impl<'a> IntoIterator for &'a EventStore {
    type Item = &'a AudioEvent;
    type IntoIter = std::slice::Iter<'a, AudioEvent>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
