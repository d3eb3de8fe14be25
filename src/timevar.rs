//! Time-dependent values.
//!
//! A [`TimeVar`] is a list of values, each held for a number of beats. The
//! value at a beat depends on which segment the beat falls in and on the
//! interpolation kind. Segment lists cycle; an infinite segment length clamps
//! the var to that segment once it is reached.
//!
//! ```
//! use cadenza::timevar::TimeVar;
//!
//! // 0 for four beats, then 2 for four beats, then around again.
//! let v = TimeVar::var(vec![0.0, 2.0], vec![4.0]);
//! assert_eq!(v.now(1.0), 0.0);
//! assert_eq!(v.now(5.0), 2.0);
//! assert_eq!(v.now(9.0), 0.0);
//!
//! // Ramp from 0 to 1 over four beats, then hold 1 forever.
//! let ramp = TimeVar::linvar(vec![0.0, 1.0], vec![4.0, f64::INFINITY]);
//! assert_eq!(ramp.now(2.0), 0.5);
//! assert_eq!(ramp.now(100.0), 1.0);
//! ```

use crate::error::TimeVarError;
use crate::rng::Rng;
use num_integer::Integer;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

/// Segment length used when none is given.
const DEFAULT_SEGMENT: f64 = 4.0;

/// How a var moves from one segment's value to the next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Interpolation {
    /// Hold each value for its whole segment.
    #[serde(rename = "var")]
    Step,
    /// Straight line towards the next value.
    #[serde(rename = "linvar")]
    Linear,
    /// Slow start, fast finish.
    #[serde(rename = "expvar")]
    Exponential,
    /// Half-cosine ease in and out.
    #[serde(rename = "sinvar")]
    Sine,
    /// A fresh random value between this and the next value on every read.
    #[serde(rename = "randvar")]
    Random,
}

/// Where a beat falls within a var's segments.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Segment {
    pub index: usize,
    pub value: f64,
    pub next: f64,
    /// Fraction of the segment already elapsed, in `[0, 1)`.
    pub progress: f64,
}

/// A value that changes with musical time.
#[derive(Clone, Serialize, Deserialize)]
#[serde(try_from = "TimeVarWire", into = "TimeVarWire")]
pub struct TimeVar {
    interpolation: Interpolation,
    values: Vec<f64>,
    durations: Vec<f64>,
    start: f64,
    rng: Arc<Mutex<Rng>>,
}

impl TimeVar {
    /// A var with the given interpolation. An empty `values` list reads as 0;
    /// an empty `durations` list uses four-beat segments.
    pub fn new(interpolation: Interpolation, values: Vec<f64>, durations: Vec<f64>) -> Self {
        let durations = if durations.is_empty() {
            vec![DEFAULT_SEGMENT]
        } else {
            durations
        };
        TimeVar {
            interpolation,
            values,
            durations,
            start: 0.0,
            rng: Arc::new(Mutex::new(Rng::default())),
        }
    }

    pub fn var(values: Vec<f64>, durations: Vec<f64>) -> Self {
        Self::new(Interpolation::Step, values, durations)
    }

    pub fn linvar(values: Vec<f64>, durations: Vec<f64>) -> Self {
        Self::new(Interpolation::Linear, values, durations)
    }

    pub fn expvar(values: Vec<f64>, durations: Vec<f64>) -> Self {
        Self::new(Interpolation::Exponential, values, durations)
    }

    pub fn sinvar(values: Vec<f64>, durations: Vec<f64>) -> Self {
        Self::new(Interpolation::Sine, values, durations)
    }

    pub fn randvar(values: Vec<f64>, durations: Vec<f64>) -> Self {
        Self::new(Interpolation::Random, values, durations)
    }

    /// Shift the var so its first segment begins at `beat`.
    pub fn with_start(mut self, beat: f64) -> Self {
        self.start = beat;
        self
    }

    /// Seed the generator used by [`Interpolation::Random`].
    pub fn with_seed(self, seed: u128) -> Self {
        TimeVar {
            rng: Arc::new(Mutex::new(Rng::new_with_seed(seed))),
            ..self
        }
    }

    pub fn interpolation(&self) -> Interpolation {
        self.interpolation
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn durations(&self) -> &[f64] {
        &self.durations
    }

    pub fn start(&self) -> f64 {
        self.start
    }

    /// Number of segments in one cycle: values and durations cycle
    /// independently, so the full cycle is their least common multiple.
    fn segment_count(&self) -> usize {
        self.values.len().lcm(&self.durations.len())
    }

    fn segment_length(&self, index: usize) -> f64 {
        let d = self.durations[index % self.durations.len()];
        if d.is_nan() || d < 0.0 {
            0.0
        } else {
            d
        }
    }

    fn segment_value(&self, index: usize) -> f64 {
        self.values[index % self.values.len()]
    }

    /// Locate `beat` within the segments.
    ///
    /// Returns `None` only for a var with no values.
    pub fn segment_at(&self, beat: f64) -> Option<Segment> {
        if self.values.is_empty() {
            return None;
        }
        let count = self.segment_count();
        let elapsed = (beat - self.start).max(0.0);

        let hold = (0..count).find(|i| self.segment_length(*i).is_infinite());
        let position = match hold {
            Some(index) => {
                let before: f64 = (0..index).map(|i| self.segment_length(i)).sum();
                if elapsed >= before {
                    return Some(self.segment(index, 0.0));
                }
                elapsed
            }
            None => {
                let total: f64 = (0..count).map(|i| self.segment_length(i)).sum();
                if total <= 0.0 {
                    return Some(self.segment(0, 0.0));
                }
                elapsed.rem_euclid(total)
            }
        };

        let mut acc = 0.0;
        for index in 0..count {
            let length = self.segment_length(index);
            if length > 0.0 && position < acc + length {
                return Some(self.segment(index, (position - acc) / length));
            }
            acc += length;
        }
        Some(self.segment(count - 1, 0.0))
    }

    fn segment(&self, index: usize, progress: f64) -> Segment {
        let next_index = if self.segment_length(index).is_infinite() {
            index
        } else {
            index + 1
        };
        Segment {
            index,
            value: self.segment_value(index),
            next: self.segment_value(next_index),
            progress,
        }
    }

    /// Value at `beat`. Reads a plain number, never another lazy value.
    pub fn now(&self, beat: f64) -> f64 {
        let Some(segment) = self.segment_at(beat) else {
            return 0.0;
        };
        let Segment {
            value,
            next,
            progress,
            ..
        } = segment;
        match self.interpolation {
            Interpolation::Step => value,
            Interpolation::Linear => value + (next - value) * progress,
            Interpolation::Exponential => value + (next - value) * (progress.exp2() - 1.0),
            Interpolation::Sine => value + (next - value) * (1.0 - (progress * PI).cos()) / 2.0,
            Interpolation::Random => {
                let (lo, hi) = if value <= next {
                    (value, next)
                } else {
                    (next, value)
                };
                if lo == hi {
                    return lo;
                }
                self.rng
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .rand_between(lo, hi)
            }
        }
    }

    /// JSON form: `{"type": "linvar", "values": [...], "dur": [...], "start": 0}`.
    pub fn to_json(&self) -> Result<String, TimeVarError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Rebuild a var from its JSON form; the `type` tag picks the
    /// interpolation.
    pub fn from_json(json: &str) -> Result<Self, TimeVarError> {
        let wire: TimeVarWire = serde_json::from_str(json)?;
        TimeVar::try_from(wire)
    }
}

impl fmt::Debug for TimeVar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimeVar")
            .field("interpolation", &self.interpolation)
            .field("values", &self.values)
            .field("durations", &self.durations)
            .field("start", &self.start)
            .finish()
    }
}

impl PartialEq for TimeVar {
    fn eq(&self, other: &Self) -> bool {
        self.interpolation == other.interpolation
            && self.values == other.values
            && self.durations == other.durations
            && self.start == other.start
    }
}

// ============================================================================
// Wire form
// ============================================================================

/// A segment length on the wire: a number, or `"inf"` for a held segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
enum WireLength {
    Beats(f64),
    Label(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TimeVarWire {
    #[serde(rename = "type")]
    interpolation: Interpolation,
    values: Vec<f64>,
    dur: Vec<WireLength>,
    #[serde(default)]
    start: f64,
}

impl From<TimeVar> for TimeVarWire {
    fn from(var: TimeVar) -> Self {
        let dur = var
            .durations
            .iter()
            .map(|d| {
                if d.is_infinite() {
                    WireLength::Label("inf".to_string())
                } else {
                    WireLength::Beats(*d)
                }
            })
            .collect();
        TimeVarWire {
            interpolation: var.interpolation,
            values: var.values,
            dur,
            start: var.start,
        }
    }
}

impl TryFrom<TimeVarWire> for TimeVar {
    type Error = TimeVarError;

    fn try_from(wire: TimeVarWire) -> Result<Self, Self::Error> {
        if wire.values.is_empty() {
            return Err(TimeVarError::NoValues);
        }
        let durations = wire
            .dur
            .into_iter()
            .map(|d| match d {
                WireLength::Beats(b) => Ok(b),
                WireLength::Label(label) if label == "inf" => Ok(f64::INFINITY),
                WireLength::Label(label) => Err(TimeVarError::InvalidDuration(label)),
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(TimeVar::new(wire.interpolation, wire.values, durations).with_start(wire.start))
    }
}
