//! Scales and pitch conversion.
//!
//! A degree is an index into a scale; the scale wraps every `len` degrees
//! into the next octave. Fractional degrees sit between two scale steps.

/// A named list of semitone steps within one octave.
#[derive(Debug, Clone, PartialEq)]
pub struct Scale {
    name: String,
    steps: Vec<f64>,
}

const NAMED: &[(&str, &[f64])] = &[
    ("major", &[0.0, 2.0, 4.0, 5.0, 7.0, 9.0, 11.0]),
    ("minor", &[0.0, 2.0, 3.0, 5.0, 7.0, 8.0, 10.0]),
    ("dorian", &[0.0, 2.0, 3.0, 5.0, 7.0, 9.0, 10.0]),
    ("phrygian", &[0.0, 1.0, 3.0, 5.0, 7.0, 8.0, 10.0]),
    ("lydian", &[0.0, 2.0, 4.0, 6.0, 7.0, 9.0, 11.0]),
    ("mixolydian", &[0.0, 2.0, 4.0, 5.0, 7.0, 9.0, 10.0]),
    ("locrian", &[0.0, 1.0, 3.0, 5.0, 6.0, 8.0, 10.0]),
    (
        "chromatic",
        &[0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 10.0, 11.0],
    ),
    ("majorPentatonic", &[0.0, 2.0, 4.0, 7.0, 9.0]),
    ("minorPentatonic", &[0.0, 3.0, 5.0, 7.0, 10.0]),
    ("blues", &[0.0, 3.0, 5.0, 6.0, 7.0, 10.0]),
];

/// Semitones per octave.
pub const OCTAVE: f64 = 12.0;

impl Scale {
    /// Look up a built-in scale.
    pub fn by_name(name: &str) -> Option<Scale> {
        NAMED
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(n, steps)| Scale::new(*n, steps.to_vec()))
    }

    /// Names of all built-in scales.
    pub fn names() -> impl Iterator<Item = &'static str> {
        NAMED.iter().map(|(n, _)| *n)
    }

    /// A custom scale. An empty step list behaves like the chromatic scale.
    pub fn new(name: impl Into<String>, steps: Vec<f64>) -> Self {
        let steps = if steps.is_empty() {
            (0..12).map(f64::from).collect()
        } else {
            steps
        };
        Scale {
            name: name.into(),
            steps,
        }
    }

    pub fn major() -> Self {
        Scale::new("major", vec![0.0, 2.0, 4.0, 5.0, 7.0, 9.0, 11.0])
    }

    pub fn chromatic() -> Self {
        Scale::new("chromatic", (0..12).map(f64::from).collect())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn steps(&self) -> &[f64] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Semitone offset of `degree` from the scale root.
    pub fn semitones(&self, degree: f64) -> f64 {
        let len = self.steps.len() as i64;
        let whole = degree.floor();
        let frac = degree - whole;
        let index = whole as i64;

        let step = |i: i64| -> f64 {
            let octave = i.div_euclid(len) as f64;
            self.steps[i.rem_euclid(len) as usize] + octave * OCTAVE
        };

        let low = step(index);
        if frac == 0.0 {
            return low;
        }
        let high = step(index + 1);
        low + (high - low) * frac
    }

    /// MIDI note number for `degree` in octave `oct`, transposed by `root`.
    pub fn midi(&self, degree: f64, oct: f64, root: f64) -> f64 {
        self.semitones(degree) + root + oct * OCTAVE
    }
}

impl Default for Scale {
    fn default() -> Self {
        Scale::major()
    }
}

/// Frequency in Hz of a (possibly fractional) MIDI note.
pub fn midi_to_freq(midi: f64) -> f64 {
    440.0 * 2f64.powf((midi - 69.0) / OCTAVE)
}
