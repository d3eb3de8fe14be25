//! Stateful generator patterns.
//!
//! A generator produces a new value every time it is unpacked. Clones share
//! state, so the same generator placed in two patterns advances for both.

use crate::rng::Rng;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

/// What a generator produces.
#[derive(Debug, Clone, PartialEq)]
pub enum GeneratorKind {
    /// Random integer in `[lo, hi)`.
    RandInt { lo: i64, hi: i64 },
    /// Random float in `[lo, hi)`.
    White { lo: f64, hi: f64 },
    /// Random element of a list.
    Choice(Vec<f64>),
    /// Random element of a list, drawn with the given relative weights.
    Weighted { values: Vec<f64>, weights: Vec<f64> },
    /// Random element of a list, never the same twice in a row.
    NoRepeat(Vec<f64>),
    /// Random walk of `step`-sized moves, bounced inside `[-max, max]`.
    Walk { max: f64, step: f64, start: f64 },
    /// The list in order, forever.
    Cycle(Vec<f64>),
}

#[derive(Debug)]
struct GeneratorState {
    kind: GeneratorKind,
    seed: u128,
    rng: Rng,
    position: usize,
    walk: f64,
    last: Option<f64>,
    /// A value drawn by `peek` and not yet popped.
    pending: Option<f64>,
}

impl GeneratorState {
    fn produce(&mut self) -> f64 {
        let value = match &self.kind {
            GeneratorKind::RandInt { lo, hi } => self.rng.rand_int(*lo, *hi) as f64,
            GeneratorKind::White { lo, hi } => self.rng.rand_between(*lo, *hi),
            GeneratorKind::Choice(values) => {
                if values.is_empty() {
                    0.0
                } else {
                    values[self.rng.rand_index(values.len())]
                }
            }
            GeneratorKind::Weighted { values, weights } => {
                pick_weighted(&mut self.rng, values, weights)
            }
            GeneratorKind::NoRepeat(values) => match values.len() {
                0 => 0.0,
                1 => values[0],
                len => {
                    let mut index = self.rng.rand_index(len);
                    if Some(values[index]) == self.last {
                        index = (index + 1 + self.rng.rand_index(len - 1)) % len;
                    }
                    values[index]
                }
            },
            GeneratorKind::Walk { max, step, .. } => {
                let direction = if self.rng.rand_float() < 0.5 { -1.0 } else { 1.0 };
                let mut next = self.walk + direction * step;
                if next > *max || next < -*max {
                    next = self.walk - direction * step;
                }
                self.walk = next;
                next
            }
            GeneratorKind::Cycle(values) => {
                if values.is_empty() {
                    0.0
                } else {
                    values[self.position % values.len()]
                }
            }
        };
        self.position += 1;
        self.last = Some(value);
        value
    }

    fn restart(&mut self) {
        self.rng = Rng::new_with_seed(self.seed);
        self.position = 0;
        self.walk = match self.kind {
            GeneratorKind::Walk { start, .. } => start,
            _ => 0.0,
        };
        self.last = None;
        self.pending = None;
    }

    fn pop(&mut self) -> f64 {
        match self.pending.take() {
            Some(value) => value,
            None => self.produce(),
        }
    }

    fn peek(&mut self) -> f64 {
        match self.pending {
            Some(value) => value,
            None => {
                let value = self.produce();
                self.pending = Some(value);
                value
            }
        }
    }
}

fn pick_weighted(rng: &mut Rng, values: &[f64], weights: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let weight = |i: usize| weights.get(i).copied().unwrap_or(1.0).max(0.0);
    let total: f64 = (0..values.len()).map(weight).sum();
    if total <= 0.0 {
        return values[rng.rand_index(values.len())];
    }
    let mut target = rng.rand_float() * total;
    for (i, value) in values.iter().enumerate() {
        target -= weight(i);
        if target < 0.0 {
            return *value;
        }
    }
    values[values.len() - 1]
}

/// A shared, stateful producer of numbers.
#[derive(Clone)]
pub struct GeneratorPattern {
    state: Arc<Mutex<GeneratorState>>,
}

impl GeneratorPattern {
    /// A generator with a fresh random seed.
    pub fn new(kind: GeneratorKind) -> Self {
        Self::with_seed(kind, Rng::generate_seed())
    }

    /// A generator whose stream is reproducible.
    pub fn with_seed(kind: GeneratorKind, seed: u128) -> Self {
        let mut state = GeneratorState {
            kind,
            seed,
            rng: Rng::new_with_seed(seed),
            position: 0,
            walk: 0.0,
            last: None,
            pending: None,
        };
        state.restart();
        GeneratorPattern {
            state: Arc::new(Mutex::new(state)),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, GeneratorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Produce the next value. This is the one logical pop per unpack.
    pub fn next_value(&self) -> f64 {
        self.lock().pop()
    }

    /// The value the next pop will return. Peeking never moves the stream.
    pub fn peek(&self) -> f64 {
        self.lock().peek()
    }

    /// Restart the stream from its seed.
    pub fn reset(&self) {
        self.lock().restart();
    }

    pub fn kind(&self) -> GeneratorKind {
        self.lock().kind.clone()
    }

    /// True if both handles share the same state.
    pub fn same_as(&self, other: &GeneratorPattern) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }
}

impl fmt::Debug for GeneratorPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("GeneratorPattern").field(&self.kind()).finish()
    }
}

// ============================================================================
// Constructors
// ============================================================================

/// Random integers in `[lo, hi)`.
pub fn prand(lo: i64, hi: i64) -> GeneratorPattern {
    GeneratorPattern::new(GeneratorKind::RandInt { lo, hi })
}

/// Random floats in `[lo, hi)`.
pub fn pwhite(lo: f64, hi: f64) -> GeneratorPattern {
    GeneratorPattern::new(GeneratorKind::White { lo, hi })
}

/// Random picks from `values`.
pub fn pchoice(values: Vec<f64>) -> GeneratorPattern {
    GeneratorPattern::new(GeneratorKind::Choice(values))
}

/// Weighted random picks from `values`.
pub fn pwrand(values: Vec<f64>, weights: Vec<f64>) -> GeneratorPattern {
    GeneratorPattern::new(GeneratorKind::Weighted { values, weights })
}

/// Random picks from `values` without immediate repeats.
pub fn pxrand(values: Vec<f64>) -> GeneratorPattern {
    GeneratorPattern::new(GeneratorKind::NoRepeat(values))
}

/// A random walk starting at zero.
pub fn pwalk(max: f64, step: f64) -> GeneratorPattern {
    GeneratorPattern::new(GeneratorKind::Walk {
        max,
        step,
        start: 0.0,
    })
}

/// `values` in order, repeating.
pub fn pcycle(values: Vec<f64>) -> GeneratorPattern {
    GeneratorPattern::new(GeneratorKind::Cycle(values))
}
