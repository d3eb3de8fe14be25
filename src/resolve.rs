//! Turning patterns into events.
//!
//! The [`Resolver`] unpacks lazy elements against a snapshot of the voice
//! registry: generators pop, time vars are sampled at the beat being
//! dispatched, and player keys read (and refresh) the key cache.

use crate::beat::Beat;
use crate::error::{PerformanceError, ResolveError};
use crate::event::{apply_behaviours, unduplicate_durs, Event, Value};
use crate::key::{KeyCache, PlayerKey, VoiceId};
use crate::pattern::{Element, Pattern};
use crate::voice::Voice;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use tracing::warn;

/// Every voice of a performance, by id.
pub type VoiceMap = BTreeMap<VoiceId, Voice>;

/// Resolves patterns for one dispatch pass.
pub struct Resolver<'a> {
    voices: &'a VoiceMap,
    keys: &'a mut KeyCache,
    /// Voices due in the block being executed that have not fired yet.
    pending: &'a BTreeSet<VoiceId>,
    /// The voice whose event is being built, if any.
    owner: Option<VoiceId>,
    beat: Beat,
    /// When set, generators are peeked instead of popped.
    peek: bool,
    stack: Vec<(VoiceId, String)>,
}

impl<'a> Resolver<'a> {
    pub fn new(
        voices: &'a VoiceMap,
        keys: &'a mut KeyCache,
        pending: &'a BTreeSet<VoiceId>,
        beat: Beat,
    ) -> Self {
        Resolver {
            voices,
            keys,
            pending,
            owner: None,
            beat,
            peek: false,
            stack: Vec::new(),
        }
    }

    /// Resolve on behalf of `owner`: its own keys always read fresh values.
    pub fn for_voice(mut self, owner: &VoiceId) -> Self {
        self.owner = Some(owner.clone());
        self
    }

    pub fn beat(&self) -> Beat {
        self.beat
    }

    /// Unpack one element into a value.
    pub fn unpack(&mut self, element: &Element) -> Result<Value, ResolveError> {
        match element {
            Element::Number(x) => Ok(Value::Number(*x)),
            Element::Rest(d) => Ok(Value::Rest(*d)),
            Element::Generator(g) => Ok(Value::Number(if self.peek {
                g.peek()
            } else {
                g.next_value()
            })),
            Element::Var(v) => Ok(Value::Number(v.now(self.beat.to_f64()))),
            Element::Key(k) => self.key_value(k),
            Element::Group(g) => {
                let items = g
                    .items()
                    .iter()
                    .map(|e| self.unpack(e))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Value::Group(items, g.behaviour()))
            }
            Element::Mapped(inner, f) => {
                let value = self.unpack(inner)?;
                Ok(value.map_numbers(&|x| f(x)))
            }
        }
    }

    /// Value of `voice.attr` at the voice's current index plus `ahead`.
    pub fn attr_value(
        &mut self,
        voice: &Voice,
        attr: &str,
        ahead: i64,
    ) -> Result<Value, ResolveError> {
        let pattern = voice
            .attr(attr)
            .ok_or_else(|| ResolveError::MissingAttribute {
                voice: voice.id().clone(),
                attr: attr.to_string(),
            })?;
        let frame = (voice.id().clone(), attr.to_string());
        if self.stack.contains(&frame) {
            return Err(ResolveError::Circular {
                voice: frame.0,
                attr: frame.1,
            });
        }
        let element = pattern.get(voice.event_n() + ahead);
        self.stack.push(frame);
        let value = self.unpack(&element);
        self.stack.pop();
        value
    }

    /// Read a player key, refreshing the cache when the cached value is
    /// stale for this dispatch pass.
    fn key_value(&mut self, key: &PlayerKey) -> Result<Value, ResolveError> {
        let id = key.voice();
        let voices = self.voices;
        let voice = voices
            .get(id)
            .ok_or_else(|| ResolveError::UnknownVoice(id.clone()))?;

        let cached = self.keys.get(id, key.attr()).map(|cell| cell.value.clone());
        let fresh = self.owner.as_ref() == Some(id) || self.pending.contains(id);
        match cached {
            Some(value) if !fresh => Ok(value),
            _ => {
                let value = self.attr_value(voice, key.attr(), 0)?;
                self.keys.set(id, key.attr(), value.clone(), self.beat);
                Ok(value)
            }
        }
    }

    /// Resolve every attribute of `voice` at its current index plus `ahead`,
    /// then flatten durations and run group behaviours.
    pub fn event(&mut self, voice: &Voice, ahead: i64) -> Event {
        let mut event = self.attributes(voice, ahead);
        unduplicate_durs(&mut event);
        apply_behaviours(&mut event);
        event
    }

    /// Resolve every attribute of `voice` without reshaping the result.
    ///
    /// Attributes that fail to resolve are logged and read as 0 (`dur` as 1).
    /// Attributes sharing one pattern (`sus` following `dur`) resolve it
    /// once, so a shared generator is popped once per event.
    pub fn attributes(&mut self, voice: &Voice, ahead: i64) -> Event {
        let mut event = Event::new();
        let mut resolved: Vec<(&Pattern, &str)> = Vec::new();
        for (name, pattern) in voice.attrs() {
            let shared = resolved
                .iter()
                .find(|(seen, _)| seen.same_as(pattern))
                .and_then(|(_, first)| event.get(*first).cloned());
            if let Some(value) = shared {
                event.insert(name.clone(), value);
                continue;
            }
            resolved.push((pattern, name.as_str()));
            let value = match self.attr_value(voice, name, ahead) {
                Ok(value) => value,
                Err(e) => {
                    warn!(voice = %voice.id(), attr = %name, "failed to resolve attribute: {e}");
                    Value::Number(if name == "dur" { 1.0 } else { 0.0 })
                }
            };
            event.insert(name.clone(), value);
        }
        event
    }

    /// First numeric item of every `dur` element, without consuming
    /// generator values.
    pub fn rhythm(&mut self, voice: &Voice) -> Vec<f64> {
        let Some(pattern) = voice.attr("dur") else {
            return Vec::new();
        };
        self.peek = true;
        let rhythm = pattern
            .iter()
            .map(|element| match self.unpack(element) {
                Ok(value) => value.first_number(),
                Err(e) => {
                    warn!(voice = %voice.id(), "failed to resolve duration: {e}");
                    1.0
                }
            })
            .collect();
        self.peek = false;
        rhythm
    }

    /// Number at `index` of `pattern` (wrapping), or `fallback` on error.
    pub fn number_at(&mut self, pattern: &Pattern, index: i64, fallback: f64) -> f64 {
        match self.unpack(&pattern.get(index)) {
            Ok(value) => value.first_number(),
            Err(e) => {
                warn!("failed to resolve pattern value: {e}");
                fallback
            }
        }
    }
}

/// Reject an assignment of `pattern` to `voice.attr` that would create a
/// reference cycle.
///
/// `staged` holds the voice's attributes as they will be after the
/// assignment, so several attributes assigned together are checked against
/// each other.
pub fn check_references(
    voices: &VoiceMap,
    voice: &VoiceId,
    staged: &BTreeMap<String, Pattern>,
    attr: &str,
    pattern: &Pattern,
) -> Result<(), PerformanceError> {
    let mut visited = HashSet::new();
    for element in pattern.iter() {
        visit(voices, voice, staged, (voice, attr), element, None, &mut visited)?;
    }
    Ok(())
}

fn visit(
    voices: &VoiceMap,
    staged_voice: &VoiceId,
    staged: &BTreeMap<String, Pattern>,
    target: (&VoiceId, &str),
    element: &Element,
    last: Option<&PlayerKey>,
    visited: &mut HashSet<(VoiceId, String)>,
) -> Result<(), PerformanceError> {
    for key in element.keys() {
        if key.refers_to(target.0, target.1) {
            let target_name = format!("{}.{}", target.0, target.1);
            return Err(PerformanceError::CircularReference {
                via: last.map(PlayerKey::name).unwrap_or_else(|| target_name.clone()),
                target: target_name,
            });
        }
        if !visited.insert((key.voice().clone(), key.attr().to_string())) {
            continue;
        }
        let referenced = if key.voice() == staged_voice {
            staged.get(key.attr())
        } else {
            voices.get(key.voice()).and_then(|v| v.attr(key.attr()))
        };
        if let Some(pattern) = referenced {
            for inner in pattern.iter() {
                visit(voices, staged_voice, staged, target, inner, Some(key), visited)?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::generator::pcycle;
    use crate::pattern::PGroup;
    use crate::timevar::TimeVar;

    fn voice_with(id: &str, attrs: &[(&str, Pattern)]) -> Voice {
        let mut voice = Voice::new(VoiceId::from(id), &Settings::default());
        for (name, pattern) in attrs {
            voice.set_attr(name, pattern.clone());
        }
        voice
    }

    fn registry(voices: Vec<Voice>) -> VoiceMap {
        voices.into_iter().map(|v| (v.id().clone(), v)).collect()
    }

    #[test]
    fn test_plain_unpack_is_idempotent() {
        let voices = VoiceMap::new();
        let mut keys = KeyCache::new();
        let pending = BTreeSet::new();
        let mut resolver = Resolver::new(&voices, &mut keys, &pending, Beat::zero());
        let element = Element::from(PGroup::from(vec![1.0, 2.0]));
        let first = resolver.unpack(&element).unwrap();
        let second = resolver.unpack(&element).unwrap();
        assert_eq!(first, second);
        assert_eq!(first, Value::from(vec![1.0, 2.0]));
    }

    #[test]
    fn test_generator_pops_once_per_unpack() {
        let voices = VoiceMap::new();
        let mut keys = KeyCache::new();
        let pending = BTreeSet::new();
        let mut resolver = Resolver::new(&voices, &mut keys, &pending, Beat::zero());
        let element = Element::from(pcycle(vec![1.0, 2.0, 3.0]));
        let values: Vec<Value> = (0..3).map(|_| resolver.unpack(&element).unwrap()).collect();
        assert_eq!(values, vec![Value::Number(1.0), Value::Number(2.0), Value::Number(3.0)]);
    }

    #[test]
    fn test_time_var_reads_dispatch_beat() {
        let voices = VoiceMap::new();
        let mut keys = KeyCache::new();
        let pending = BTreeSet::new();
        let element = Element::from(TimeVar::var(vec![0.0, 7.0], vec![4.0]));
        let mut resolver = Resolver::new(&voices, &mut keys, &pending, Beat::from(5));
        assert_eq!(resolver.unpack(&element).unwrap(), Value::Number(7.0));
    }

    #[test]
    fn test_mapped_key_applies_function() {
        let voices = registry(vec![voice_with("p1", &[("degree", Pattern::from(3.0))])]);
        let mut keys = KeyCache::new();
        let pending = BTreeSet::new();
        let mut resolver = Resolver::new(&voices, &mut keys, &pending, Beat::zero());
        let element = Element::from(PlayerKey::new("p1", "degree")).map(std::sync::Arc::new(|x: f64| x + 2.0));
        assert_eq!(resolver.unpack(&element).unwrap(), Value::Number(5.0));
    }

    #[test]
    fn test_cached_key_is_used_unless_pending() {
        let voices = registry(vec![voice_with("p1", &[("degree", Pattern::from(3.0))])]);
        let p1 = VoiceId::from("p1");
        let mut keys = KeyCache::new();
        keys.set(&p1, "degree", Value::Number(9.0), Beat::zero());
        let key = Element::from(PlayerKey::new("p1", "degree"));

        let idle = BTreeSet::new();
        let mut resolver = Resolver::new(&voices, &mut keys, &idle, Beat::zero());
        assert_eq!(resolver.unpack(&key).unwrap(), Value::Number(9.0));

        let pending: BTreeSet<VoiceId> = [p1.clone()].into_iter().collect();
        let mut resolver = Resolver::new(&voices, &mut keys, &pending, Beat::zero());
        assert_eq!(resolver.unpack(&key).unwrap(), Value::Number(3.0));
        assert_eq!(keys.get(&p1, "degree").unwrap().value, Value::Number(3.0));
    }

    #[test]
    fn test_unknown_voice_is_an_error() {
        let voices = VoiceMap::new();
        let mut keys = KeyCache::new();
        let pending = BTreeSet::new();
        let mut resolver = Resolver::new(&voices, &mut keys, &pending, Beat::zero());
        let err = resolver
            .unpack(&Element::from(PlayerKey::new("ghost", "dur")))
            .unwrap_err();
        assert_eq!(err, ResolveError::UnknownVoice(VoiceId::from("ghost")));
    }

    #[test]
    fn test_runtime_cycle_is_caught() {
        // A cycle smuggled past assignment checks still terminates.
        let voices = registry(vec![voice_with(
            "p1",
            &[("degree", Pattern::from(PlayerKey::new("p1", "degree")))],
        )]);
        let mut keys = KeyCache::new();
        let pending = BTreeSet::new();
        let p1 = VoiceId::from("p1");
        let mut resolver = Resolver::new(&voices, &mut keys, &pending, Beat::zero()).for_voice(&p1);
        let err = resolver.attr_value(&voices[&p1], "degree", 0).unwrap_err();
        assert!(matches!(err, ResolveError::Circular { .. }));
    }

    #[test]
    fn test_rhythm_peeks_generators() {
        let g = pcycle(vec![0.5, 1.5]);
        let voices = registry(vec![voice_with(
            "p1",
            &[("dur", Pattern::new(vec![Element::from(1.0), Element::from(g.clone())]))],
        )]);
        let mut keys = KeyCache::new();
        let pending = BTreeSet::new();
        let mut resolver = Resolver::new(&voices, &mut keys, &pending, Beat::zero());
        let p1 = &voices[&VoiceId::from("p1")];
        assert_eq!(resolver.rhythm(p1), vec![1.0, 0.5]);
        assert_eq!(resolver.rhythm(p1), vec![1.0, 0.5]);
        assert_eq!(g.next_value(), 0.5);
        assert_eq!(g.next_value(), 1.5);
    }

    #[test]
    fn test_sustain_sharing_dur_pops_once() {
        let g = pcycle(vec![0.5, 0.75]);
        let dur = Pattern::from(g.clone());
        let voices = registry(vec![voice_with("p1", &[("dur", dur.clone()), ("sus", dur)])]);
        let mut keys = KeyCache::new();
        let pending = BTreeSet::new();
        let mut resolver = Resolver::new(&voices, &mut keys, &pending, Beat::zero());
        let event = resolver.attributes(&voices[&VoiceId::from("p1")], 0);
        assert_eq!(event["dur"], Value::Number(0.5));
        assert_eq!(event["sus"], Value::Number(0.5));
        assert_eq!(g.next_value(), 0.75);
    }

    #[test]
    fn test_direct_cycle_rejected() {
        let voices = registry(vec![voice_with("p1", &[])]);
        let p1 = VoiceId::from("p1");
        let pattern = Pattern::from(PlayerKey::new("p1", "dur"));
        let mut staged = voices[&p1].attrs().clone();
        staged.insert("dur".to_string(), pattern.clone());
        let err = check_references(&voices, &p1, &staged, "dur", &pattern).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Circular reference found: p1.dur to itself via p1.dur"
        );
    }

    #[test]
    fn test_transitive_cycle_rejected() {
        let voices = registry(vec![
            voice_with("p1", &[]),
            voice_with("p2", &[("dur", Pattern::from(PlayerKey::new("p1", "dur")))]),
        ]);
        let p1 = VoiceId::from("p1");
        let pattern = Pattern::from(PlayerKey::new("p2", "dur"));
        let staged = voices[&p1].attrs().clone();
        let err = check_references(&voices, &p1, &staged, "dur", &pattern).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Circular reference found: p1.dur to itself via p2.dur"
        );
    }

    #[test]
    fn test_unrelated_reference_allowed() {
        let voices = registry(vec![
            voice_with("p1", &[]),
            voice_with("p2", &[("degree", Pattern::from(PlayerKey::new("p1", "amp")))]),
        ]);
        let p1 = VoiceId::from("p1");
        let pattern = Pattern::from(PlayerKey::new("p2", "degree"));
        let staged = voices[&p1].attrs().clone();
        assert!(check_references(&voices, &p1, &staged, "degree", &pattern).is_ok());
    }
}
