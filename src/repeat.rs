//! Periodic method calls on a voice (`every`, `often`, `sometimes`, ...).
//!
//! Each voice owns a [`Repeater`]: a list of pending calls, each with its own
//! period pattern and next beat. The engine schedules a task for each call
//! and asks the repeater for the following beat after running it.

use crate::beat::Beat;
use crate::generator::prand;
use crate::pattern::{Element, Pattern};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Something a voice can be told to do periodically.
#[derive(Debug, Clone, PartialEq)]
pub enum VoiceMethod {
    /// Play the current event `n` times within its duration.
    Stutter(usize),
    /// Play the event `n` steps ahead right now.
    Jump(i64),
    /// Mirror every attribute around the current position.
    Reverse,
    /// Rotate the degree pattern.
    Rotate(i64),
    /// Shuffle the degree pattern.
    Shuffle,
    /// Move the voice's position by `n` events.
    Shift(i64),
}

/// One pending periodic call.
#[derive(Debug, Clone)]
pub struct PeriodicCall {
    pub method: VoiceMethod,
    /// Beats between calls, read cyclically.
    pub period: Pattern,
    /// Number of times the call has run.
    pub calls: i64,
    pub next_beat: Beat,
}

/// The periodic calls owned by one voice.
#[derive(Debug, Clone, Default)]
pub struct Repeater {
    calls: BTreeMap<u64, PeriodicCall>,
    next_id: u64,
}

impl Repeater {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a call first due at `first_beat`. Returns its id.
    pub fn add(&mut self, method: VoiceMethod, period: Pattern, first_beat: Beat) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.calls.insert(
            id,
            PeriodicCall {
                method,
                period,
                calls: 0,
                next_beat: first_beat,
            },
        );
        id
    }

    pub fn get(&self, id: u64) -> Option<&PeriodicCall> {
        self.calls.get(&id)
    }

    /// Record that call `id` ran and move it `step` beats on. Returns the new
    /// due beat, or `None` if the call no longer exists.
    pub fn advance(&mut self, id: u64, step: Beat) -> Option<Beat> {
        let call = self.calls.get_mut(&id)?;
        call.calls += 1;
        call.next_beat += step;
        Some(call.next_beat)
    }

    /// Cancel one call.
    pub fn stop(&mut self, id: u64) -> bool {
        self.calls.remove(&id).is_some()
    }

    /// Cancel every call whose method matches.
    pub fn stop_method(&mut self, method: &VoiceMethod) -> usize {
        let before = self.calls.len();
        self.calls.retain(|_, call| &call.method != method);
        before - self.calls.len()
    }

    pub fn clear(&mut self) {
        self.calls.clear();
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, &PeriodicCall)> {
        self.calls.iter().map(|(id, call)| (*id, call))
    }
}

/// Random periods between `lo / 2` and `hi / 2` beats, in half-beat steps.
fn random_period(lo: i64, hi: i64) -> Pattern {
    Pattern::from(Element::from(prand(lo, hi)).map(Arc::new(|x: f64| x / 2.0)))
}

/// Every half beat to four beats.
pub fn often() -> Pattern {
    random_period(1, 8)
}

/// Every four to sixteen beats.
pub fn sometimes() -> Pattern {
    random_period(8, 32)
}

/// Every sixteen to thirty two beats.
pub fn rarely() -> Pattern {
    random_period(32, 64)
}
