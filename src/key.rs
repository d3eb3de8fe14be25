//! Cross-voice references.
//!
//! A [`PlayerKey`] names one attribute of one voice, e.g. `p1.degree`. It is a
//! weak reference: it stores the voice's id, never the voice, so a key can
//! outlive the voice it points at (reads then fail and are substituted).
//!
//! The most recent resolved value of every key that has been handed out lives
//! in the [`KeyCache`], refreshed each time the referenced voice fires.

use crate::beat::Beat;
use crate::event::Value;
use std::collections::HashMap;
use std::fmt;

/// Name of a voice, e.g. `p1`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VoiceId(String);

impl VoiceId {
    pub fn new(name: impl Into<String>) -> Self {
        VoiceId(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VoiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for VoiceId {
    fn from(name: &str) -> Self {
        VoiceId(name.to_string())
    }
}

impl From<String> for VoiceId {
    fn from(name: String) -> Self {
        VoiceId(name)
    }
}

impl From<&VoiceId> for VoiceId {
    fn from(id: &VoiceId) -> Self {
        id.clone()
    }
}

/// Reference to attribute `attr` of voice `voice`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PlayerKey {
    voice: VoiceId,
    attr: String,
}

impl PlayerKey {
    pub fn new(voice: impl Into<VoiceId>, attr: impl Into<String>) -> Self {
        PlayerKey {
            voice: voice.into(),
            attr: attr.into(),
        }
    }

    pub fn voice(&self) -> &VoiceId {
        &self.voice
    }

    pub fn attr(&self) -> &str {
        &self.attr
    }

    pub fn refers_to(&self, voice: &VoiceId, attr: &str) -> bool {
        &self.voice == voice && self.attr == attr
    }

    /// Dotted name, e.g. `p1.dur`.
    pub fn name(&self) -> String {
        format!("{}.{}", self.voice, self.attr)
    }
}

impl fmt::Display for PlayerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.voice, self.attr)
    }
}

/// Last known value of a key, and the beat it was written at.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyCell {
    pub value: Value,
    pub beat: Beat,
}

/// Cached values for every accessed `(voice, attribute)` pair.
#[derive(Debug, Default)]
pub struct KeyCache {
    cells: HashMap<(VoiceId, String), KeyCell>,
}

impl KeyCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, voice: &VoiceId, attr: &str) -> Option<&KeyCell> {
        self.cells.get(&(voice.clone(), attr.to_string()))
    }

    pub fn set(&mut self, voice: &VoiceId, attr: &str, value: Value, beat: Beat) {
        self.cells
            .insert((voice.clone(), attr.to_string()), KeyCell { value, beat });
    }

    /// Forget one cached value so the next read recomputes it.
    pub fn invalidate(&mut self, voice: &VoiceId, attr: &str) {
        self.cells.remove(&(voice.clone(), attr.to_string()));
    }

    /// Forget every cached value of `voice`.
    pub fn invalidate_voice(&mut self, voice: &VoiceId) {
        self.cells.retain(|(v, _), _| v != voice);
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}
