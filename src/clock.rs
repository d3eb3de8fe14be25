//! The tempo clock: musical time, tempo, and the scheduling queue.
//!
//! Beats advance from wall-clock time read through a [`TimeSource`]. With a
//! fixed tempo the current beat is computed from an anchor (the beat and time
//! of the last tempo change); with a time-varying tempo it is integrated in
//! small steps at the rate sampled at the previous reading. Either way the
//! reported beat never goes backwards, even if the time source does.

use crate::beat::Beat;
use crate::config::Settings;
use crate::error::PerformanceError;
use crate::key::VoiceId;
use crate::queue::SchedulingQueue;
use crate::timevar::TimeVar;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Tempo must lie strictly between zero and this.
pub const MAX_BPM: f64 = 10_000.0;

/// Where the clock reads the time from.
pub trait TimeSource: Send {
    /// Seconds since an arbitrary fixed point.
    fn seconds(&self) -> f64;
}

/// Wall-clock time from [`Instant`].
#[derive(Debug, Clone)]
pub struct MonotonicTime {
    start: Instant,
}

impl MonotonicTime {
    pub fn new() -> Self {
        MonotonicTime {
            start: Instant::now(),
        }
    }
}

impl Default for MonotonicTime {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSource for MonotonicTime {
    fn seconds(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }
}

/// Time that only moves when told to. Clones share the same reading.
#[derive(Debug, Clone, Default)]
pub struct ManualTime(Arc<Mutex<f64>>);

impl ManualTime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, seconds: f64) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = seconds;
    }

    pub fn advance(&self, seconds: f64) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) += seconds;
    }
}

impl TimeSource for ManualTime {
    fn seconds(&self) -> f64 {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Current Unix time in seconds.
pub fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

/// A fixed or time-varying tempo in beats per minute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Tempo {
    Fixed(f64),
    Var(TimeVar),
}

impl Tempo {
    /// Tempo at `beat`.
    pub fn bpm_at(&self, beat: f64) -> f64 {
        match self {
            Tempo::Fixed(bpm) => *bpm,
            Tempo::Var(var) => var.now(beat),
        }
    }

    pub(crate) fn validate(&self) -> Result<(), PerformanceError> {
        let values: Vec<f64> = match self {
            Tempo::Fixed(bpm) => vec![*bpm],
            Tempo::Var(var) => var.values().to_vec(),
        };
        match values.into_iter().find(|bpm| !(*bpm > 0.0 && *bpm < MAX_BPM)) {
            Some(bad) => Err(PerformanceError::InvalidTempo(bad)),
            None => Ok(()),
        }
    }
}

impl From<f64> for Tempo {
    fn from(bpm: f64) -> Self {
        Tempo::Fixed(bpm)
    }
}

impl From<TimeVar> for Tempo {
    fn from(var: TimeVar) -> Self {
        Tempo::Var(var)
    }
}

/// How a solo request changes the solo selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SoloMode {
    /// Clear the selection: every voice plays.
    Off,
    /// Only this voice plays.
    Only,
    /// Add this voice to the selection.
    Add,
}

/// The voices allowed to emit messages. Empty means everyone.
#[derive(Debug, Clone, Default)]
pub struct Solo {
    voices: BTreeSet<VoiceId>,
}

impl Solo {
    pub fn set(&mut self, voice: &VoiceId, mode: SoloMode) {
        match mode {
            SoloMode::Off => self.voices.clear(),
            SoloMode::Only => {
                self.voices.clear();
                self.voices.insert(voice.clone());
            }
            SoloMode::Add => {
                self.voices.insert(voice.clone());
            }
        }
    }

    pub fn add(&mut self, voice: &VoiceId) {
        self.voices.insert(voice.clone());
    }

    pub fn remove(&mut self, voice: &VoiceId) {
        self.voices.remove(voice);
    }

    pub fn clear(&mut self) {
        self.voices.clear();
    }

    pub fn is_active(&self) -> bool {
        !self.voices.is_empty()
    }

    pub fn contains(&self, voice: &VoiceId) -> bool {
        self.voices.contains(voice)
    }

    /// Whether `voice` may emit messages.
    pub fn allows(&self, voice: &VoiceId) -> bool {
        !self.is_active() || self.contains(voice)
    }

    pub fn voices(&self) -> &BTreeSet<VoiceId> {
        &self.voices
    }
}

pub struct TempoClock {
    source: Box<dyn TimeSource>,
    /// Unix time at source time zero.
    epoch: f64,
    tempo: Tempo,
    meter: [u32; 2],
    latency: f64,
    nudge: f64,
    anchor_beat: f64,
    anchor_time: f64,
    last_beat: f64,
    last_time: f64,
    queue: SchedulingQueue,
    playing: Vec<VoiceId>,
    solo: Solo,
}

impl TempoClock {
    /// A clock at beat zero, with tempo, meter and latency from `settings`.
    pub fn new(settings: &Settings, source: Box<dyn TimeSource>) -> Result<Self, PerformanceError> {
        let tempo = Tempo::Fixed(settings.bpm);
        tempo.validate()?;
        let start = source.seconds();
        Ok(TempoClock {
            epoch: unix_now() - start,
            source,
            tempo,
            meter: settings.meter,
            latency: settings.latency,
            nudge: settings.nudge,
            anchor_beat: 0.0,
            anchor_time: start,
            last_beat: 0.0,
            last_time: start,
            queue: SchedulingQueue::new(),
            playing: Vec::new(),
            solo: Solo::default(),
        })
    }

    /// Current beat. Never decreases.
    pub fn now(&mut self) -> f64 {
        let t = self.source.seconds().max(self.last_time);
        let beat = match &self.tempo {
            Tempo::Fixed(bpm) => self.anchor_beat + (t - self.anchor_time) * bpm / 60.0,
            Tempo::Var(var) => self.last_beat + (t - self.last_time) * var.now(self.last_beat) / 60.0,
        };
        self.last_beat = beat.max(self.last_beat);
        self.last_time = t;
        self.last_beat
    }

    pub fn tempo(&self) -> &Tempo {
        &self.tempo
    }

    /// Tempo at the last reading.
    pub fn bpm(&self) -> f64 {
        self.tempo.bpm_at(self.last_beat)
    }

    /// Change tempo now. Beats already queued keep their beat numbers.
    pub fn set_tempo(&mut self, tempo: Tempo) -> Result<(), PerformanceError> {
        tempo.validate()?;
        self.anchor_beat = self.now();
        self.anchor_time = self.last_time;
        self.tempo = tempo;
        Ok(())
    }

    /// Take on a tempo anchored elsewhere: `beat` fell at Unix time `time`.
    pub fn set_anchor(&mut self, time: f64, beat: f64, tempo: Tempo) -> Result<(), PerformanceError> {
        tempo.validate()?;
        let t = self.source.seconds().max(self.last_time);
        self.anchor_time = time - self.epoch;
        self.anchor_beat = beat;
        let current = beat + (t - self.anchor_time) * tempo.bpm_at(beat) / 60.0;
        self.tempo = tempo;
        self.last_beat = current.max(self.last_beat);
        self.last_time = t;
        Ok(())
    }

    /// Unix time and beat of the current tempo anchor.
    pub fn anchor(&self) -> (f64, f64) {
        match self.tempo {
            Tempo::Fixed(_) => (self.epoch + self.anchor_time, self.anchor_beat),
            Tempo::Var(_) => (self.epoch + self.last_time, self.last_beat),
        }
    }

    pub fn meter(&self) -> [u32; 2] {
        self.meter
    }

    pub fn set_meter(&mut self, meter: [u32; 2]) {
        self.meter = meter;
    }

    pub fn bar_length(&self) -> Beat {
        let [beats, unit] = self.meter;
        if unit == 0 {
            return Beat::from_integer(4);
        }
        Beat::new(4 * beats as i64, unit as i64)
    }

    /// Length of `n` bars in beats.
    pub fn bars(&self, n: i64) -> Beat {
        self.bar_length() * Beat::from_integer(n)
    }

    /// The first bar line strictly after now.
    pub fn next_bar(&mut self) -> Beat {
        Beat::from_f64(self.now()).next_multiple(self.bar_length())
    }

    /// Seconds taken by `beats` at the current tempo.
    pub fn beat_dur(&self, beats: f64) -> f64 {
        if beats == 0.0 {
            return 0.0;
        }
        beats * 60.0 / self.bpm()
    }

    pub fn seconds_to_beats(&self, seconds: f64) -> f64 {
        seconds * self.bpm() / 60.0
    }

    /// Time-source seconds at which `beat` falls.
    pub fn time_at_beat(&self, beat: Beat) -> f64 {
        match &self.tempo {
            Tempo::Fixed(bpm) => self.anchor_time + (beat.to_f64() - self.anchor_beat) * 60.0 / bpm,
            Tempo::Var(_) => self.last_time + self.beat_dur(beat.to_f64() - self.last_beat),
        }
    }

    /// Unix timestamp for a bundle due at `beat`, including latency.
    pub fn message_time(&self, beat: Beat) -> f64 {
        self.epoch + self.time_at_beat(beat) + self.latency + self.nudge
    }

    /// Current Unix time according to the time source.
    pub fn unix_time(&self) -> f64 {
        self.epoch + self.source.seconds()
    }

    /// Seconds until `beat` (negative if it has passed).
    pub fn seconds_until(&self, beat: Beat) -> f64 {
        self.time_at_beat(beat) - self.source.seconds()
    }

    pub fn latency(&self) -> f64 {
        self.latency
    }

    pub fn set_latency(&mut self, latency: f64) {
        self.latency = latency;
    }

    pub fn nudge(&self) -> f64 {
        self.nudge
    }

    pub fn set_nudge(&mut self, nudge: f64) {
        self.nudge = nudge;
    }

    pub fn queue(&self) -> &SchedulingQueue {
        &self.queue
    }

    pub fn queue_mut(&mut self) -> &mut SchedulingQueue {
        &mut self.queue
    }

    pub fn playing(&self) -> &[VoiceId] {
        &self.playing
    }

    pub fn add_playing(&mut self, voice: &VoiceId) {
        if !self.playing.contains(voice) {
            self.playing.push(voice.clone());
        }
    }

    pub fn remove_playing(&mut self, voice: &VoiceId) {
        self.playing.retain(|v| v != voice);
    }

    pub fn solo(&self) -> &Solo {
        &self.solo
    }

    pub fn solo_mut(&mut self) -> &mut Solo {
        &mut self.solo
    }
}
