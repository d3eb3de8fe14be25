//! Patterns: the values voices are programmed with.
//!
//! A [`Pattern`] is an immutable, cyclic sequence of [`Element`]s. Indexing
//! wraps, so a voice at event 7 of a three element pattern reads element 1.
//! Elements may be lazy (generators, time vars, keys to other voices); they
//! are only turned into numbers by the [`Resolver`](crate::resolve::Resolver).
//!
//! ```
//! use cadenza::pattern::{Element, PGroup, Pattern};
//!
//! let melody = Pattern::from(vec![0.0, 2.0, 4.0]);
//! assert_eq!(melody.get(4).as_number(), Some(2.0));
//!
//! // A chord on the last step.
//! let chords = Pattern::new(vec![
//!     Element::from(0.0),
//!     Element::from(PGroup::chord(vec![4.0, 2.0, 4.0])),
//! ]);
//! assert_eq!(chords.len(), 2);
//! ```

use crate::event::Behaviour;
use crate::generator::GeneratorPattern;
use crate::key::PlayerKey;
use crate::rng::Rng;
use crate::timevar::TimeVar;
use std::fmt;
use std::sync::Arc;

/// Numeric function applied to a lazy element once it is resolved.
pub type MapFn = Arc<dyn Fn(f64) -> f64 + Send + Sync>;

/// One entry of a pattern.
#[derive(Clone)]
pub enum Element {
    Number(f64),
    /// Silence for the given number of beats.
    Rest(f64),
    Group(PGroup),
    Generator(GeneratorPattern),
    Var(TimeVar),
    Key(PlayerKey),
    /// A lazy element with a function applied to its resolved numbers.
    Mapped(Box<Element>, MapFn),
}

impl Element {
    pub fn rest(beats: f64) -> Element {
        Element::Rest(beats)
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Element::Number(x) => Some(*x),
            _ => None,
        }
    }

    /// True for elements that need the resolver to produce a value.
    pub fn is_lazy(&self) -> bool {
        match self {
            Element::Number(_) | Element::Rest(_) => false,
            Element::Group(g) => g.items.iter().any(Element::is_lazy),
            _ => true,
        }
    }

    /// Apply `f` to every number. Plain numbers are mapped now; lazy elements
    /// are wrapped and mapped when resolved. Rests are left alone.
    pub fn map(&self, f: MapFn) -> Element {
        match self {
            Element::Number(x) => Element::Number(f(*x)),
            Element::Rest(d) => Element::Rest(*d),
            Element::Group(g) => Element::Group(g.map(f)),
            lazy => Element::Mapped(Box::new(lazy.clone()), f),
        }
    }

    /// Every player key reachable from this element.
    pub fn keys(&self) -> Vec<&PlayerKey> {
        let mut keys = Vec::new();
        self.collect_keys(&mut keys);
        keys
    }

    fn collect_keys<'a>(&'a self, out: &mut Vec<&'a PlayerKey>) {
        match self {
            Element::Key(k) => out.push(k),
            Element::Group(g) => g.items.iter().for_each(|e| e.collect_keys(out)),
            Element::Mapped(inner, _) => inner.collect_keys(out),
            _ => {}
        }
    }
}

impl fmt::Debug for Element {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Element::Number(x) => write!(f, "{x}"),
            Element::Rest(d) => write!(f, "rest({d})"),
            Element::Group(g) => write!(f, "{g:?}"),
            Element::Generator(g) => write!(f, "{g:?}"),
            Element::Var(v) => write!(f, "{v:?}"),
            Element::Key(k) => write!(f, "key({k})"),
            Element::Mapped(inner, _) => write!(f, "map({inner:?})"),
        }
    }
}

impl From<f64> for Element {
    fn from(x: f64) -> Self {
        Element::Number(x)
    }
}

impl From<i32> for Element {
    fn from(x: i32) -> Self {
        Element::Number(x as f64)
    }
}

impl From<PGroup> for Element {
    fn from(g: PGroup) -> Self {
        Element::Group(g)
    }
}

impl From<GeneratorPattern> for Element {
    fn from(g: GeneratorPattern) -> Self {
        Element::Generator(g)
    }
}

impl From<TimeVar> for Element {
    fn from(v: TimeVar) -> Self {
        Element::Var(v)
    }
}

impl From<PlayerKey> for Element {
    fn from(k: PlayerKey) -> Self {
        Element::Key(k)
    }
}

// ============================================================================
// PGroup
// ============================================================================

/// Values played at the same time, optionally reshaped by a [`Behaviour`].
#[derive(Clone, Debug)]
pub struct PGroup {
    items: Vec<Element>,
    behaviour: Option<Behaviour>,
}

impl PGroup {
    pub fn new(items: Vec<Element>) -> Self {
        PGroup {
            items,
            behaviour: None,
        }
    }

    pub fn with_behaviour(mut self, behaviour: Behaviour) -> Self {
        self.behaviour = Some(behaviour);
        self
    }

    /// First value is the root, the rest are offsets from it.
    pub fn chord(values: Vec<f64>) -> Self {
        PGroup::from(values).with_behaviour(Behaviour::Offset)
    }

    /// Values arpeggiated across the event duration.
    pub fn spread(values: Vec<f64>) -> Self {
        PGroup::from(values).with_behaviour(Behaviour::Spread)
    }

    /// Values strummed across the event sustain.
    pub fn strum(values: Vec<f64>) -> Self {
        PGroup::from(values).with_behaviour(Behaviour::Strum)
    }

    pub fn items(&self) -> &[Element] {
        &self.items
    }

    pub fn behaviour(&self) -> Option<Behaviour> {
        self.behaviour
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn map(&self, f: MapFn) -> PGroup {
        PGroup {
            items: self.items.iter().map(|e| e.map(f.clone())).collect(),
            behaviour: self.behaviour,
        }
    }
}

impl From<Vec<f64>> for PGroup {
    fn from(values: Vec<f64>) -> Self {
        PGroup::new(values.into_iter().map(Element::Number).collect())
    }
}

// ============================================================================
// Pattern
// ============================================================================

/// An immutable cyclic sequence of elements.
///
/// Clones share storage; [`Pattern::same_as`] tells whether two handles are
/// the same pattern rather than merely equal ones.
#[derive(Clone)]
pub struct Pattern {
    data: Arc<Vec<Element>>,
}

impl Pattern {
    pub fn new(elements: Vec<Element>) -> Self {
        Pattern {
            data: Arc::new(elements),
        }
    }

    pub fn empty() -> Self {
        Pattern::new(Vec::new())
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn elements(&self) -> &[Element] {
        &self.data
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Element> {
        self.data.iter()
    }

    /// Element at `index`, wrapping in both directions. An empty pattern
    /// reads as zero.
    pub fn get(&self, index: i64) -> Element {
        if self.data.is_empty() {
            return Element::Number(0.0);
        }
        let len = self.data.len() as i64;
        self.data[index.rem_euclid(len) as usize].clone()
    }

    /// True if both handles share storage.
    pub fn same_as(&self, other: &Pattern) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }

    /// All elements as plain numbers, or `None` if any element is not one.
    pub fn numbers(&self) -> Option<Vec<f64>> {
        self.data.iter().map(Element::as_number).collect()
    }

    /// Every player key referenced anywhere in the pattern.
    pub fn keys(&self) -> Vec<&PlayerKey> {
        self.data.iter().flat_map(Element::keys).collect()
    }

    pub fn map<F>(&self, f: F) -> Pattern
    where
        F: Fn(f64) -> f64 + Send + Sync + 'static,
    {
        let f: MapFn = Arc::new(f);
        Pattern::new(self.data.iter().map(|e| e.map(f.clone())).collect())
    }

    /// Add `x` to every number.
    pub fn offset(&self, x: f64) -> Pattern {
        self.map(move |v| v + x)
    }

    /// Multiply every number by `x`.
    pub fn scale_by(&self, x: f64) -> Pattern {
        self.map(move |v| v * x)
    }

    /// Shift left by `n` places, so `[0, 1, 2].rotate(1)` is `[1, 2, 0]`.
    pub fn rotate(&self, n: i64) -> Pattern {
        let len = self.len() as i64;
        if len == 0 {
            return self.clone();
        }
        Pattern::new((0..len).map(|i| self.get(i + n)).collect())
    }

    pub fn reverse(&self) -> Pattern {
        Pattern::new(self.data.iter().rev().cloned().collect())
    }

    /// Mirror the pattern around `index`: the element at `index` stays put
    /// and the rest read backwards from there.
    pub fn pivot(&self, index: i64) -> Pattern {
        let len = self.len() as i64;
        if len == 0 {
            return self.clone();
        }
        Pattern::new((0..len).map(|j| self.get(2 * index - j)).collect())
    }

    /// Random permutation.
    pub fn shuffle(&self, rng: &mut Rng) -> Pattern {
        let mut elements: Vec<Element> = self.data.to_vec();
        for i in (1..elements.len()).rev() {
            let j = rng.rand_index(i + 1);
            elements.swap(i, j);
        }
        Pattern::new(elements)
    }

    /// Repeat each element `n` times.
    pub fn stutter(&self, n: usize) -> Pattern {
        Pattern::new(
            self.data
                .iter()
                .flat_map(|e| std::iter::repeat(e.clone()).take(n.max(1)))
                .collect(),
        )
    }
}

impl Default for Pattern {
    fn default() -> Self {
        Pattern::empty()
    }
}

impl fmt::Debug for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.data.iter()).finish()
    }
}

impl From<Vec<Element>> for Pattern {
    fn from(elements: Vec<Element>) -> Self {
        Pattern::new(elements)
    }
}

impl From<Vec<f64>> for Pattern {
    fn from(values: Vec<f64>) -> Self {
        Pattern::new(values.into_iter().map(Element::Number).collect())
    }
}

impl From<f64> for Pattern {
    fn from(x: f64) -> Self {
        Pattern::new(vec![Element::Number(x)])
    }
}

impl From<i32> for Pattern {
    fn from(x: i32) -> Self {
        Pattern::from(x as f64)
    }
}

impl From<Element> for Pattern {
    fn from(e: Element) -> Self {
        Pattern::new(vec![e])
    }
}

impl From<PGroup> for Pattern {
    fn from(g: PGroup) -> Self {
        Pattern::from(Element::Group(g))
    }
}

impl From<GeneratorPattern> for Pattern {
    fn from(g: GeneratorPattern) -> Self {
        Pattern::from(Element::Generator(g))
    }
}

impl From<TimeVar> for Pattern {
    fn from(v: TimeVar) -> Self {
        Pattern::from(Element::Var(v))
    }
}

impl From<PlayerKey> for Pattern {
    fn from(k: PlayerKey) -> Self {
        Pattern::from(Element::Key(k))
    }
}

impl FromIterator<Element> for Pattern {
    fn from_iter<I: IntoIterator<Item = Element>>(iter: I) -> Self {
        Pattern::new(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::pcycle;

    fn numbers(p: &Pattern) -> Vec<f64> {
        p.numbers().unwrap()
    }

    #[test]
    fn test_index_wraps_both_ways() {
        let p = Pattern::from(vec![10.0, 20.0, 30.0]);
        assert_eq!(p.get(0).as_number(), Some(10.0));
        assert_eq!(p.get(4).as_number(), Some(20.0));
        assert_eq!(p.get(-1).as_number(), Some(30.0));
    }

    #[test]
    fn test_empty_pattern_reads_zero() {
        assert_eq!(Pattern::empty().get(5).as_number(), Some(0.0));
    }

    #[test]
    fn test_rotate_and_reverse() {
        let p = Pattern::from(vec![0.0, 1.0, 2.0, 3.0]);
        assert_eq!(numbers(&p.rotate(1)), vec![1.0, 2.0, 3.0, 0.0]);
        assert_eq!(numbers(&p.rotate(-1)), vec![3.0, 0.0, 1.0, 2.0]);
        assert_eq!(numbers(&p.reverse()), vec![3.0, 2.0, 1.0, 0.0]);
    }

    #[test]
    fn test_pivot_keeps_index_in_place() {
        let p = Pattern::from(vec![0.0, 1.0, 2.0, 3.0, 4.0]);
        let q = p.pivot(1);
        assert_eq!(numbers(&q), vec![2.0, 1.0, 0.0, 4.0, 3.0]);
        assert_eq!(q.get(1).as_number(), p.get(1).as_number());
    }

    #[test]
    fn test_shuffle_is_a_permutation() {
        let p = Pattern::from(vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0]);
        let mut rng = Rng::new_with_seed(4);
        let mut shuffled = numbers(&p.shuffle(&mut rng));
        shuffled.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert_eq!(shuffled, numbers(&p));
    }

    #[test]
    fn test_map_defers_lazy_elements() {
        let p = Pattern::new(vec![Element::from(1.0), Element::from(pcycle(vec![5.0]))]);
        let q = p.offset(1.0);
        assert_eq!(q.get(0).as_number(), Some(2.0));
        assert!(matches!(q.get(1), Element::Mapped(..)));
    }

    #[test]
    fn test_identity_survives_clone_only() {
        let p = Pattern::from(vec![1.0]);
        let q = p.clone();
        let r = Pattern::from(vec![1.0]);
        assert!(p.same_as(&q));
        assert!(!p.same_as(&r));
        assert!(!p.same_as(&p.rotate(0)));
    }

    #[test]
    fn test_keys_are_found_in_groups_and_maps() {
        let key = PlayerKey::new("p1", "degree");
        let p = Pattern::new(vec![
            Element::from(PGroup::new(vec![Element::from(0.0), Element::from(key.clone())])),
            Element::from(key.clone()).map(Arc::new(|x: f64| x * 2.0)),
        ]);
        assert_eq!(p.keys(), vec![&key, &key]);
        assert!(p.get(0).is_lazy());
    }

    #[test]
    fn test_stutter_repeats() {
        let p = Pattern::from(vec![1.0, 2.0]).stutter(2);
        assert_eq!(numbers(&p), vec![1.0, 1.0, 2.0, 2.0]);
    }
}
