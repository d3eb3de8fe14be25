//! Resolved events.
//!
//! An [`Event`] is what a voice's attribute patterns look like at one index
//! once every lazy element has been unpacked: plain numbers, rests, and
//! (possibly nested) groups of parallel values. The functions here reshape an
//! event before it is split into one message per parallel value.

use std::collections::BTreeMap;

/// Attributes whose group behaviours run before everyone else's.
const PRIME_KEYS: [&str; 2] = ["degree", "sample"];

/// A resolved attribute value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Number(f64),
    /// A silent step lasting the given number of beats.
    Rest(f64),
    /// Parallel values, with the behaviour of the group they came from.
    Group(Vec<Value>, Option<Behaviour>),
}

/// A resolved attribute map.
pub type Event = BTreeMap<String, Value>;

/// A fully split message: one number per attribute.
pub type Packet = BTreeMap<String, f64>;

impl Value {
    /// A plain group with no behaviour.
    pub fn group(items: Vec<Value>) -> Value {
        Value::Group(items, None)
    }

    pub fn is_rest(&self) -> bool {
        matches!(self, Value::Rest(_))
    }

    pub fn is_group(&self) -> bool {
        matches!(self, Value::Group(..))
    }

    /// Number of parallel values; scalars count as one.
    pub fn len(&self) -> usize {
        match self {
            Value::Group(items, _) => items.len(),
            _ => 1,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Value::Group(items, _) if items.is_empty())
    }

    /// Item `index` of a group (wrapping); scalars return themselves.
    /// An empty group reads as zero.
    pub fn at(&self, index: usize) -> Value {
        match self {
            Value::Group(items, _) if items.is_empty() => Value::Number(0.0),
            Value::Group(items, _) => items[index % items.len()].clone(),
            other => other.clone(),
        }
    }

    /// The first numeric leaf. A rest yields its length.
    pub fn first_number(&self) -> f64 {
        match self {
            Value::Number(x) | Value::Rest(x) => *x,
            Value::Group(items, _) => items.first().map(Value::first_number).unwrap_or(0.0),
        }
    }

    /// The number, if this is a plain number.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(x) => Some(*x),
            _ => None,
        }
    }

    pub fn behaviour(&self) -> Option<Behaviour> {
        match self {
            Value::Group(_, behaviour) => *behaviour,
            _ => None,
        }
    }

    /// The same value with any group behaviour removed.
    pub fn without_behaviour(self) -> Value {
        match self {
            Value::Group(items, _) => Value::Group(items, None),
            other => other,
        }
    }

    /// Apply `f` to every numeric leaf, keeping the shape.
    pub fn map_numbers(&self, f: &dyn Fn(f64) -> f64) -> Value {
        match self {
            Value::Number(x) => Value::Number(f(*x)),
            Value::Rest(x) => Value::Rest(*x),
            Value::Group(items, behaviour) => Value::Group(
                items.iter().map(|v| v.map_numbers(f)).collect(),
                *behaviour,
            ),
        }
    }

    /// Combine two values leaf by leaf. Groups broadcast against scalars and
    /// against each other (the shorter one wraps).
    pub fn zip_with(&self, other: &Value, f: &dyn Fn(f64, f64) -> f64) -> Value {
        match (self, other) {
            (Value::Group(a, behaviour), Value::Group(b, _)) => {
                let len = a.len().max(b.len());
                Value::Group(
                    (0..len)
                        .map(|i| self.at(i).zip_with(&other.at(i), f))
                        .collect(),
                    if a.is_empty() { None } else { *behaviour },
                )
            }
            (Value::Group(items, behaviour), scalar) => Value::Group(
                items.iter().map(|v| v.zip_with(scalar, f)).collect(),
                *behaviour,
            ),
            (scalar, Value::Group(items, behaviour)) => Value::Group(
                items.iter().map(|v| scalar.zip_with(v, f)).collect(),
                *behaviour,
            ),
            (Value::Rest(a), b) => Value::Rest(f(*a, b.first_number())),
            (a, Value::Rest(b)) => Value::Number(f(a.first_number(), *b)),
            (Value::Number(a), Value::Number(b)) => Value::Number(f(*a, *b)),
        }
    }

    pub fn add(&self, other: &Value) -> Value {
        self.zip_with(other, &|a, b| a + b)
    }

    pub fn mul(&self, other: &Value) -> Value {
        self.zip_with(other, &|a, b| a * b)
    }

    pub fn div(&self, other: &Value) -> Value {
        self.zip_with(other, &|a, b| if b == 0.0 { 0.0 } else { a / b })
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Number(x)
    }
}

impl From<Vec<f64>> for Value {
    fn from(items: Vec<f64>) -> Self {
        Value::group(items.into_iter().map(Value::Number).collect())
    }
}

/// Post-resolution rewrite attached to a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behaviour {
    /// The first item is a base value; the others are offsets added to it.
    Offset,
    /// Items are spread evenly across the event's duration.
    Spread,
    /// Items are spread evenly across the event's sustain.
    Strum,
}

impl Behaviour {
    /// Rewrite `event` around the group stored under `key`.
    pub fn apply(self, event: &mut Event, key: &str) {
        let Some(Value::Group(items, _)) = event.get(key).cloned() else {
            return;
        };
        match self {
            Behaviour::Offset => {
                let Some(base) = items.first().cloned() else {
                    return;
                };
                let mut chord = vec![base.clone()];
                chord.extend(items.iter().skip(1).map(|offset| base.add(offset)));
                event.insert(key.to_string(), Value::group(chord));
            }
            Behaviour::Spread | Behaviour::Strum => {
                let span_key = if self == Behaviour::Spread { "dur" } else { "sus" };
                let span = event.get(span_key).map(Value::first_number).unwrap_or(1.0);
                let n = items.len().max(1);
                let offsets = Value::group(
                    (0..n)
                        .map(|i| Value::Number(i as f64 * span / n as f64))
                        .collect(),
                );
                let delay = event.get("delay").cloned().unwrap_or(Value::Number(0.0));
                event.insert("delay".to_string(), delay.add(&offsets));
                event.insert(key.to_string(), Value::group(items));
            }
        }
    }
}

/// Run group behaviours: prime keys first, then the rest in key order.
pub fn apply_behaviours(event: &mut Event) {
    let mut keys: Vec<String> = PRIME_KEYS
        .iter()
        .filter(|k| event.contains_key(**k))
        .map(|k| k.to_string())
        .collect();
    keys.extend(
        event
            .keys()
            .filter(|k| !PRIME_KEYS.contains(&k.as_str()))
            .cloned(),
    );

    for key in keys {
        if let Some(behaviour) = event.get(&key).and_then(Value::behaviour) {
            behaviour.apply(event, &key);
        }
    }
}

/// Flatten grouped `dur` and `sus` values.
///
/// A grouped duration plays its first value and moves the rest into `delay`
/// offsets (`0 | dur[1:]`). A grouped sustain keeps its smallest value and
/// scales `blur` by each item's ratio to it.
pub fn unduplicate_durs(event: &mut Event) {
    if let Some(Value::Group(items, _)) = event.get("dur").cloned() {
        match items.len() {
            0 => {
                event.insert("dur".to_string(), Value::Number(0.0));
            }
            1 => {
                event.insert("dur".to_string(), flatten_first(&items[0]));
            }
            _ => {
                let mut offsets = vec![Value::Number(0.0)];
                offsets.extend(items[1..].iter().cloned());
                let delay = event.get("delay").cloned().unwrap_or(Value::Number(0.0));
                event.insert("delay".to_string(), delay.add(&Value::group(offsets)));
                event.insert("dur".to_string(), flatten_first(&items[0]));
            }
        }
    }

    if let Some(Value::Group(items, _)) = event.get("sus").cloned() {
        if items.len() > 1 {
            let lengths: Vec<f64> = items.iter().map(Value::first_number).collect();
            let shortest = lengths.iter().copied().fold(f64::INFINITY, f64::min);
            let shortest = if shortest == 0.0 { 1.0 } else { shortest };
            let ratios = Value::from(lengths.iter().map(|s| s / shortest).collect::<Vec<_>>());
            let blur = event.get("blur").cloned().unwrap_or(Value::Number(1.0));
            event.insert("blur".to_string(), blur.mul(&ratios));
            event.insert("sus".to_string(), Value::Number(shortest));
        } else if let Some(only) = items.first() {
            event.insert("sus".to_string(), flatten_first(only));
        }
    }
}

fn flatten_first(value: &Value) -> Value {
    match value {
        Value::Rest(d) => Value::Rest(*d),
        other => Value::Number(other.first_number()),
    }
}

/// Largest group size in the event.
pub fn event_length(event: &Event) -> usize {
    event.values().map(Value::len).max().unwrap_or(1).max(1)
}

/// Split an event into one packet per parallel value.
///
/// Every group is indexed (wrapping) at each position; nested groups split
/// again. A rest anywhere in a packet silences that packet.
pub fn split_event(event: &Event) -> Vec<Packet> {
    let mut packets = Vec::new();
    split_into(event, &mut packets);
    packets
}

fn split_into(event: &Event, out: &mut Vec<Packet>) {
    if !event.values().any(Value::is_group) {
        if event.values().any(Value::is_rest) {
            return;
        }
        out.push(
            event
                .iter()
                .map(|(k, v)| (k.clone(), v.first_number()))
                .collect(),
        );
        return;
    }
    for i in 0..event_length(event) {
        let sub: Event = event.iter().map(|(k, v)| (k.clone(), v.at(i))).collect();
        split_into(&sub, out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn event(pairs: &[(&str, Value)]) -> Event {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_broadcast_arithmetic() {
        let g = Value::from(vec![1.0, 2.0, 3.0]);
        assert_eq!(g.add(&Value::Number(1.0)), Value::from(vec![2.0, 3.0, 4.0]));
        assert_eq!(
            g.mul(&Value::from(vec![10.0, 100.0])),
            Value::from(vec![10.0, 200.0, 30.0])
        );
        assert_eq!(Value::Number(1.0).div(&Value::Number(0.0)), Value::Number(0.0));
    }

    #[test]
    fn test_grouped_duration_becomes_delays() {
        let mut e = event(&[
            ("dur", Value::from(vec![1.0, 0.5, 0.25])),
            ("delay", Value::Number(0.0)),
        ]);
        unduplicate_durs(&mut e);
        assert_eq!(e["dur"], Value::Number(1.0));
        assert_eq!(e["delay"], Value::from(vec![0.0, 0.5, 0.25]));
    }

    #[test]
    fn test_grouped_sustain_scales_blur() {
        let mut e = event(&[
            ("sus", Value::from(vec![2.0, 1.0])),
            ("blur", Value::Number(1.0)),
        ]);
        unduplicate_durs(&mut e);
        assert_eq!(e["sus"], Value::Number(1.0));
        assert_eq!(e["blur"], Value::from(vec![2.0, 1.0]));
    }

    #[test]
    fn test_zero_sustain_ratio_uses_one() {
        let mut e = event(&[("sus", Value::from(vec![0.0, 2.0]))]);
        unduplicate_durs(&mut e);
        assert_eq!(e["sus"], Value::Number(1.0));
        assert_eq!(e["blur"], Value::from(vec![0.0, 2.0]));
    }

    #[test]
    fn test_rest_duration_is_kept() {
        let mut e = event(&[("dur", Value::group(vec![Value::Rest(2.0)]))]);
        unduplicate_durs(&mut e);
        assert_eq!(e["dur"], Value::Rest(2.0));
    }

    #[test]
    fn test_offset_behaviour_builds_chord() {
        let mut e = event(&[(
            "degree",
            Value::Group(
                vec![Value::Number(2.0), Value::Number(2.0), Value::Number(4.0)],
                Some(Behaviour::Offset),
            ),
        )]);
        apply_behaviours(&mut e);
        assert_eq!(e["degree"], Value::from(vec![2.0, 4.0, 6.0]));
    }

    #[test]
    fn test_spread_behaviour_staggers_delays() {
        let mut e = event(&[
            (
                "degree",
                Value::Group(
                    vec![Value::Number(0.0), Value::Number(2.0), Value::Number(4.0), Value::Number(6.0)],
                    Some(Behaviour::Spread),
                ),
            ),
            ("dur", Value::Number(2.0)),
            ("delay", Value::Number(0.0)),
        ]);
        apply_behaviours(&mut e);
        assert_eq!(e["delay"], Value::from(vec![0.0, 0.5, 1.0, 1.5]));
        assert_eq!(e["degree"].behaviour(), None);
    }

    #[test]
    fn test_strum_uses_sustain() {
        let mut e = event(&[
            (
                "degree",
                Value::Group(vec![Value::Number(0.0), Value::Number(1.0)], Some(Behaviour::Strum)),
            ),
            ("dur", Value::Number(4.0)),
            ("sus", Value::Number(1.0)),
        ]);
        apply_behaviours(&mut e);
        assert_eq!(e["delay"], Value::from(vec![0.0, 0.5]));
    }

    #[test]
    fn test_split_counts_every_leaf() {
        let e = event(&[
            ("degree", Value::from(vec![0.0, 2.0])),
            ("amp", Value::Number(1.0)),
            (
                "pan",
                Value::group(vec![Value::Number(-1.0), Value::from(vec![0.0, 1.0])]),
            ),
        ]);
        let packets = split_event(&e);
        // Index 0: degree 0, pan -1. Index 1: degree 2, pan (0, 1) splits in two.
        assert_eq!(packets.len(), 3);
        assert_eq!(packets[0]["pan"], -1.0);
        assert_eq!(packets[1]["degree"], 2.0);
        assert_eq!(packets[1]["pan"], 0.0);
        assert_eq!(packets[2]["pan"], 1.0);
        assert!(packets.iter().all(|p| p["amp"] == 1.0));
    }

    #[test]
    fn test_rest_silences_packet() {
        let e = event(&[("degree", Value::group(vec![Value::Number(0.0), Value::Rest(1.0)]))]);
        assert_eq!(split_event(&e).len(), 1);
    }

    #[test]
    fn test_scalar_event_is_one_packet() {
        let e = event(&[("degree", Value::Number(3.0))]);
        let packets = split_event(&e);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0]["degree"], 3.0);
    }
}
