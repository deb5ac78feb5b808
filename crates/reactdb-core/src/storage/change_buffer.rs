use std::collections::{HashSet, VecDeque};

use parking_lot::Mutex;
use thiserror::Error;

use crate::types::{ChangeEvent, EventBulk};

/// The requested position was already evicted. Callers fall back to a full
/// re-execution; this never reaches users.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("change event {requested} is no longer buffered (oldest is {oldest})")]
pub struct OutOfBounds {
    pub requested: u64,
    pub oldest: u64,
}

/// Events returned by [`ChangeEventBuffer::get_since`] together with the
/// counter they were read at.
#[derive(Debug, Clone, Default)]
pub struct EventsSince {
    pub events: Vec<ChangeEvent>,
    pub counter: u64,
}

struct BufferState {
    /// Number of events ever appended. The first event has number 1.
    counter: u64,
    events: VecDeque<ChangeEvent>,
}

/// Bounded history of recent change events of one collection.
pub struct ChangeEventBuffer {
    limit: usize,
    state: Mutex<BufferState>,
}

impl ChangeEventBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            state: Mutex::new(BufferState {
                counter: 0,
                events: VecDeque::with_capacity(limit),
            }),
        }
    }

    /// Append every event of a bulk. Returns the number of the last one.
    pub fn append(&self, bulk: &EventBulk) -> u64 {
        let mut state = self.state.lock();
        for event in &bulk.events {
            state.counter += 1;
            state.events.push_back(event.clone());
        }
        while state.events.len() > self.limit {
            state.events.pop_front();
        }
        state.counter
    }

    pub fn counter(&self) -> u64 {
        self.state.lock().counter
    }

    /// Events numbered `from` and later, oldest first.
    pub fn get_since(&self, from: u64) -> Result<EventsSince, OutOfBounds> {
        let state = self.state.lock();
        let counter = state.counter;
        let from = from.max(1);
        if from > counter {
            return Ok(EventsSince {
                events: Vec::new(),
                counter,
            });
        }
        let oldest = counter + 1 - state.events.len() as u64;
        if from < oldest {
            return Err(OutOfBounds {
                requested: from,
                oldest,
            });
        }
        let skip = (from - oldest) as usize;
        Ok(EventsSince {
            events: state.events.iter().skip(skip).cloned().collect(),
            counter,
        })
    }

    /// Keep only the last event of each document, in the order of those
    /// last events.
    pub fn reduce_to_last_per_document(events: Vec<ChangeEvent>) -> Vec<ChangeEvent> {
        let mut seen = HashSet::new();
        let mut reduced: Vec<ChangeEvent> = events
            .into_iter()
            .rev()
            .filter(|e| seen.insert(e.document_id.clone()))
            .collect();
        reduced.reverse();
        reduced
    }
}
