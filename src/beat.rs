//! Exact musical time.
//!
//! Every scheduled timestamp in the engine is a [`Beat`], a rational number of
//! beats. Two voices that land on "the same beat" must compare equal exactly,
//! which floating point cannot promise after a few additions of `1/3`.

use num_rational::Rational64;
use num_traits::{One, Signed, Zero};
use std::iter::Sum;
use std::ops::{Add, AddAssign, Div, Mul, Neg, Sub};

/// Largest denominator produced when converting from `f64`, and kept after
/// arithmetic.
const MAX_DENOMINATOR: i64 = 1 << 16;

/// A point in time or a duration, measured in beats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Beat(Rational64);

impl Beat {
    /// Create a beat from numerator and denominator.
    ///
    /// Panics if `denom` is zero.
    pub fn new(numer: i64, denom: i64) -> Self {
        Beat(Rational64::new(numer, denom))
    }

    /// Create a whole number of beats.
    pub fn from_integer(n: i64) -> Self {
        Beat(Rational64::from_integer(n))
    }

    pub fn zero() -> Self {
        Beat(Rational64::zero())
    }

    pub fn one() -> Self {
        Beat(Rational64::one())
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    pub fn is_negative(&self) -> bool {
        self.0.is_negative()
    }

    /// Floor to a whole beat.
    pub fn floor(&self) -> Self {
        Beat(self.0.floor())
    }

    /// Floor to an integer.
    pub fn to_integer(&self) -> i64 {
        self.0.floor().to_integer()
    }

    /// Convert to f64 for wall-clock arithmetic.
    pub fn to_f64(&self) -> f64 {
        *self.0.numer() as f64 / *self.0.denom() as f64
    }

    pub fn numer(&self) -> i64 {
        *self.0.numer()
    }

    pub fn denom(&self) -> i64 {
        *self.0.denom()
    }

    /// Floored modulo: the result has the sign of `modulus`.
    ///
    /// A zero modulus returns `self` unchanged.
    pub fn rem(&self, modulus: Beat) -> Self {
        if modulus.is_zero() {
            return *self;
        }
        *self - (*self / modulus).floor() * modulus
    }

    /// The first multiple of `step` strictly after this beat.
    ///
    /// Used for bar quantisation: at beat 4 with a four beat bar the next bar
    /// starts at 8, not 4.
    pub fn next_multiple(&self, step: Beat) -> Self {
        if step.is_zero() {
            return *self;
        }
        ((*self / step).floor() + Beat::one()) * step
    }

    pub fn min(self, other: Self) -> Self {
        if self < other {
            self
        } else {
            other
        }
    }

    pub fn max(self, other: Self) -> Self {
        if self > other {
            self
        } else {
            other
        }
    }

    pub fn abs(&self) -> Self {
        Beat(self.0.abs())
    }

    /// Snap to the nearest beat with a bounded denominator. Exact results of
    /// musical fractions are left alone; sums of arbitrary `f64` durations
    /// would otherwise grow their denominators until they overflow.
    fn bounded(self) -> Self {
        if self.denom() <= MAX_DENOMINATOR {
            return self;
        }
        let whole = self.0.floor();
        let fraction = Beat(self.0 - whole).to_f64();
        Beat(whole + Beat::from_f64(fraction).0)
    }

    /// Best rational approximation of `value` with a bounded denominator.
    ///
    /// Walks the continued fraction expansion of the fractional part and stops
    /// at the last convergent whose denominator fits. Non-finite input maps to
    /// zero.
    pub fn from_f64(value: f64) -> Self {
        if !value.is_finite() {
            return Beat::zero();
        }

        let sign = if value < 0.0 { -1 } else { 1 };
        let magnitude = value.abs();
        if magnitude >= (i64::MAX / MAX_DENOMINATOR) as f64 {
            return Beat::from_integer(sign * magnitude.round() as i64);
        }

        let whole = magnitude.floor() as i64;
        let target = magnitude - whole as f64;
        if target < 1e-12 {
            return Beat::from_integer(sign * whole);
        }

        // Convergents h/k, seeded with h(-2)/k(-2) = 0/1 and h(-1)/k(-1) = 1/0.
        let (mut h_prev, mut h) = (0_i64, 1_i64);
        let (mut k_prev, mut k) = (1_i64, 0_i64);
        let mut rest = target;
        for _ in 0..64 {
            let term = rest.floor();
            let a = term as i64;
            let h_next = a * h + h_prev;
            let k_next = a * k + k_prev;
            if k_next > MAX_DENOMINATOR {
                break;
            }
            h_prev = h;
            h = h_next;
            k_prev = k;
            k = k_next;

            if (h as f64 / k as f64 - target).abs() < 1e-12 {
                break;
            }
            let remainder = rest - term;
            if remainder < 1e-12 {
                break;
            }
            rest = 1.0 / remainder;
        }

        if k == 0 {
            return Beat::from_integer(sign * whole);
        }
        Beat::new(sign * (whole * k + h), k)
    }
}

impl Default for Beat {
    fn default() -> Self {
        Beat::zero()
    }
}

impl From<i64> for Beat {
    fn from(n: i64) -> Self {
        Beat::from_integer(n)
    }
}

impl From<i32> for Beat {
    fn from(n: i32) -> Self {
        Beat::from_integer(n as i64)
    }
}

impl From<f64> for Beat {
    fn from(value: f64) -> Self {
        Beat::from_f64(value)
    }
}

impl From<Rational64> for Beat {
    fn from(r: Rational64) -> Self {
        Beat(r)
    }
}

impl Add for Beat {
    type Output = Self;

    fn add(self, other: Self) -> Self {
        Beat(self.0 + other.0).bounded()
    }
}

impl AddAssign for Beat {
    fn add_assign(&mut self, other: Self) {
        *self = *self + other;
    }
}

impl Sub for Beat {
    type Output = Self;

    fn sub(self, other: Self) -> Self {
        Beat(self.0 - other.0).bounded()
    }
}

impl Mul for Beat {
    type Output = Self;

    fn mul(self, other: Self) -> Self {
        Beat(self.0 * other.0).bounded()
    }
}

impl Div for Beat {
    type Output = Self;

    fn div(self, other: Self) -> Self {
        Beat(self.0 / other.0).bounded()
    }
}

impl Neg for Beat {
    type Output = Self;

    fn neg(self) -> Self {
        Beat(-self.0)
    }
}

impl Sum for Beat {
    fn sum<I: Iterator<Item = Beat>>(iter: I) -> Self {
        iter.fold(Beat::zero(), |acc, b| acc + b)
    }
}

impl std::fmt::Display for Beat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.denom() == 1 {
            write!(f, "{}", self.numer())
        } else {
            write!(f, "{}/{}", self.numer(), self.denom())
        }
    }
}
