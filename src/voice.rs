//! A single voice (player) and its state machine.
//!
//! A voice owns a map of attribute patterns and a position in them
//! (`event_n`), plus the beat of its current firing (`event_index`). The
//! engine drives it through `Idle -> Playing -> Stopping -> Idle`; the voice
//! itself never touches the clock or the queue.

use crate::beat::Beat;
use crate::config::{InstrumentKind, Settings};
use crate::error::PerformanceError;
use crate::event::{event_length, split_event, Event, Packet, Value};
use crate::key::VoiceId;
use crate::osc::Message;
use crate::pattern::Pattern;
use crate::repeat::Repeater;
use crate::rng::Rng;
use crate::scale::{midi_to_freq, Scale};
use std::collections::{BTreeMap, BTreeSet};
use tracing::warn;

/// Attributes a reset sets to zero.
const ZERO_ATTRS: [&str; 9] = [
    "freq", "delay", "buf", "sample", "fmod", "pan", "rate", "midinote", "channel",
];

/// Attributes a reset sets to one.
const UNIT_ATTRS: [&str; 3] = ["blur", "amp", "amplify"];

/// Lifecycle of a voice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceState {
    Idle,
    Playing,
    /// Still playing, but finishes at the first firing at or after
    /// `stop_point`.
    Stopping { stop_point: Beat },
}

/// Attribute names handled before the generic attribute path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Special {
    Scale,
    Root,
    Dur,
}

impl Special {
    pub fn from_name(name: &str) -> Option<Special> {
        match name {
            "scale" => Some(Special::Scale),
            "root" => Some(Special::Root),
            "dur" => Some(Special::Dur),
            _ => None,
        }
    }
}

/// Canonical attribute name for `name`.
pub fn canonical_attr(name: &str) -> &str {
    match name {
        "pitch" | "char" => "degree",
        other => other,
    }
}

/// A synth assignment: `p1 >> pads([0, 2, 4], dur=0.5, amp=0.8)`.
#[derive(Debug, Clone)]
pub struct Assignment {
    synth: String,
    degree: Option<Pattern>,
    attrs: Vec<(String, Pattern)>,
    scale: Option<Scale>,
    quantise: bool,
}

impl Assignment {
    pub fn new(synth: impl Into<String>) -> Self {
        Assignment {
            synth: synth.into(),
            degree: None,
            attrs: Vec::new(),
            scale: None,
            quantise: true,
        }
    }

    /// The primary pattern (degrees for synths, buffers for samplers).
    pub fn degree(mut self, pattern: impl Into<Pattern>) -> Self {
        self.degree = Some(pattern.into());
        self
    }

    pub fn with(mut self, name: impl Into<String>, pattern: impl Into<Pattern>) -> Self {
        self.attrs.push((name.into(), pattern.into()));
        self
    }

    pub fn scale(mut self, scale: Scale) -> Self {
        self.scale = Some(scale);
        self
    }

    /// When false, a voice that is not playing starts now instead of at the
    /// next bar.
    pub fn quantise(mut self, quantise: bool) -> Self {
        self.quantise = quantise;
        self
    }

    pub fn synth(&self) -> &str {
        &self.synth
    }

    pub fn is_quantised(&self) -> bool {
        self.quantise
    }

    pub fn attrs(&self) -> &[(String, Pattern)] {
        &self.attrs
    }
}

/// Result of counting events up to a beat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Count {
    /// Index of the event at `beat`.
    pub n: i64,
    /// Beat at which event `n` starts.
    pub beat: Beat,
    /// The rhythm summed to zero (or was empty) and was read as `[1]`.
    pub zero_total: bool,
}

/// Count the events of `rhythm` (cycled from beat 0) that start before
/// `time`.
///
/// The returned beat is `time` itself when an event starts exactly there,
/// otherwise the start of the event in progress at `time`. With
/// `event_after`, an event in progress is skipped and the next one returned
/// instead. An event ending exactly on `time` counts as played.
pub fn count(rhythm: &[f64], time: Beat, event_after: bool) -> Count {
    let durs: Vec<Beat> = rhythm.iter().map(|d| Beat::from_f64(*d)).collect();
    let total: Beat = durs.iter().copied().sum();
    let zero_total = durs.is_empty() || total <= Beat::zero();
    let (durs, total) = if zero_total {
        (vec![Beat::one()], Beat::one())
    } else {
        (durs, total)
    };

    let len = durs.len() as i64;
    let mut acc = time - time.rem(total);
    let mut n = (acc / total).to_integer() * len;

    // One full cycle always reaches `time`; the bound only matters for
    // rhythms with negative steps.
    let mut steps = 0;
    while acc != time && steps <= 4 * len + 4 {
        let d = durs[n.rem_euclid(len) as usize];
        if acc + d == time {
            acc = time;
            n += 1;
            break;
        }
        if acc + d > time {
            if event_after {
                acc += d;
                n += 1;
            }
            break;
        }
        acc += d;
        n += 1;
        steps += 1;
    }

    Count {
        n,
        beat: acc,
        zero_total,
    }
}

/// Rewrite `event` to play `n` times within its duration.
///
/// The duration is divided by `n` and every copy is delayed by one more
/// step than the last. Groups longer than `n` get one delay per item.
pub fn stutter_event(event: &mut Event, n: usize) {
    let n = n.max(1);
    let dur = event.get("dur").map(Value::first_number).unwrap_or(1.0) / n as f64;
    event.insert("dur".to_string(), Value::Number(dur));
    let len = n.max(event_length(event));
    event.insert(
        "delay".to_string(),
        Value::group(
            (0..len)
                .map(|i| Value::Number((i + 1) as f64 * dur))
                .collect(),
        ),
    );
}

#[derive(Debug, Clone)]
pub struct Voice {
    id: VoiceId,
    synth: Option<String>,
    kind: InstrumentKind,
    attrs: BTreeMap<String, Pattern>,
    scale: Scale,
    state: VoiceState,
    generation: u64,
    event_index: Beat,
    event_n: i64,
    notes_played: u64,
    event: Event,
    accessed: BTreeSet<String>,
    last_dur: Option<Pattern>,
    repeat: Repeater,
}

impl Voice {
    /// An idle voice with default attributes and no synth.
    pub fn new(id: VoiceId, settings: &Settings) -> Self {
        let mut voice = Voice {
            id,
            synth: None,
            kind: InstrumentKind::Synth,
            attrs: BTreeMap::new(),
            scale: Scale::default(),
            state: VoiceState::Idle,
            generation: 0,
            event_index: Beat::zero(),
            event_n: 0,
            notes_played: 0,
            event: Event::new(),
            accessed: BTreeSet::new(),
            last_dur: None,
            repeat: Repeater::new(),
        };
        voice.reset(settings);
        voice
    }

    pub fn id(&self) -> &VoiceId {
        &self.id
    }

    pub fn synth(&self) -> Option<&str> {
        self.synth.as_deref()
    }

    pub fn kind(&self) -> InstrumentKind {
        self.kind
    }

    pub fn scale(&self) -> &Scale {
        &self.scale
    }

    pub fn state(&self) -> VoiceState {
        self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// True while playing or stopping.
    pub fn is_playing(&self) -> bool {
        !matches!(self.state, VoiceState::Idle)
    }

    pub fn event_index(&self) -> Beat {
        self.event_index
    }

    pub fn event_n(&self) -> i64 {
        self.event_n
    }

    pub fn notes_played(&self) -> u64 {
        self.notes_played
    }

    /// The event resolved at the last firing.
    pub fn event(&self) -> &Event {
        &self.event
    }

    pub fn attr(&self, name: &str) -> Option<&Pattern> {
        self.attrs.get(canonical_attr(name))
    }

    pub fn attrs(&self) -> &BTreeMap<String, Pattern> {
        &self.attrs
    }

    /// Replace one attribute's pattern. Returns the canonical name.
    pub fn set_attr(&mut self, name: &str, pattern: Pattern) -> String {
        let name = canonical_attr(name).to_string();
        self.attrs.insert(name.clone(), pattern);
        name
    }

    /// Set one attribute, handling special names. Returns the attributes
    /// whose patterns changed.
    pub fn set(&mut self, name: &str, pattern: Pattern) -> Result<Vec<String>, PerformanceError> {
        if Special::from_name(name) == Some(Special::Scale) {
            self.scale = self.scale_from(&pattern)?;
            return Ok(Vec::new());
        }
        Ok(vec![self.set_attr(name, pattern)])
    }

    fn scale_from(&self, pattern: &Pattern) -> Result<Scale, PerformanceError> {
        let steps = pattern.numbers().ok_or_else(|| PerformanceError::InvalidScale {
            voice: self.id.clone(),
        })?;
        Ok(Scale::new("custom", steps))
    }

    /// Mark `attr` as read by another voice, so its value is published to
    /// the key cache after every firing.
    pub fn mark_accessed(&mut self, attr: &str) {
        self.accessed.insert(canonical_attr(attr).to_string());
    }

    pub fn accessed(&self) -> &BTreeSet<String> {
        &self.accessed
    }

    pub fn repeat(&self) -> &Repeater {
        &self.repeat
    }

    pub fn repeat_mut(&mut self) -> &mut Repeater {
        &mut self.repeat
    }

    /// Apply a synth assignment. Returns the attributes whose patterns
    /// changed.
    ///
    /// A voice that is not playing is reset first. On error the voice may be
    /// half updated, so callers apply to a copy.
    pub fn apply(
        &mut self,
        assignment: &Assignment,
        settings: &Settings,
    ) -> Result<Vec<String>, PerformanceError> {
        self.synth = Some(assignment.synth.clone());
        self.kind = settings.instrument(&assignment.synth).kind;
        if !self.is_playing() {
            self.reset(settings);
        }

        let mut touched = Vec::new();
        let degree = assignment.degree.clone().unwrap_or_else(|| Pattern::from(0.0));
        touched.push(self.set_attr("degree", degree));

        let mut scale = assignment.scale.clone();
        let mut root = None;
        let mut dur = None;
        let mut sus_given = false;
        for (name, pattern) in &assignment.attrs {
            match Special::from_name(name) {
                Some(Special::Scale) => scale = Some(self.scale_from(pattern)?),
                Some(Special::Root) => root = Some(pattern.clone()),
                Some(Special::Dur) => dur = Some(pattern.clone()),
                None => {
                    sus_given |= name == "sus";
                    touched.push(self.set_attr(name, pattern.clone()));
                }
            }
        }

        self.scale = match scale {
            Some(scale) => scale,
            None => Scale::by_name(&settings.scale)
                .ok_or_else(|| PerformanceError::UnknownScale(settings.scale.clone()))?,
        };
        let root = root.unwrap_or_else(|| Pattern::from(settings.root));
        touched.push(self.set_attr("root", root));

        if let Some(dur) = dur {
            if !sus_given {
                touched.push(self.set_attr("sus", dur.clone()));
            }
            touched.push(self.set_attr("dur", dur));
        }
        Ok(touched)
    }

    /// Put every attribute back to its default.
    pub fn reset(&mut self, settings: &Settings) {
        for pattern in self.attrs.values_mut() {
            *pattern = Pattern::from(0.0);
        }
        self.attrs.remove("bpm");

        for name in ZERO_ATTRS {
            self.set_attr(name, Pattern::from(0.0));
        }
        for (name, value) in &settings.effects {
            self.set_attr(name, Pattern::from(*value));
        }
        let instrument = self
            .synth
            .as_deref()
            .map(|s| settings.instrument(s))
            .unwrap_or_default();
        self.set_attr("atk", Pattern::from(instrument.attack));
        self.set_attr("decay", Pattern::from(instrument.decay));
        self.set_attr("rel", Pattern::from(instrument.release));
        for name in UNIT_ATTRS {
            self.set_attr(name, Pattern::from(1.0));
        }

        self.set_attr("degree", Pattern::from(0.0));
        self.set_attr("oct", Pattern::from(5.0));
        self.set_attr("root", Pattern::from(settings.root));
        let step = match self.kind {
            InstrumentKind::Sampler => 0.5,
            InstrumentKind::Synth => 1.0,
        };
        self.set_attr("dur", Pattern::from(step));
        self.set_attr("sus", Pattern::from(step));
        if self.kind == InstrumentKind::Sampler {
            self.set_attr("rate", Pattern::from(1.0));
        }

        self.scale = Scale::by_name(&settings.scale).unwrap_or_default();
        self.repeat.clear();
        self.last_dur = None;
    }

    /// Start playing at the first event at or after `start_point`. Returns
    /// the beat of the first firing.
    pub fn start(&mut self, rhythm: &[f64], start_point: Beat) -> Beat {
        let counted = count(rhythm, start_point, true);
        self.event_n = counted.n;
        self.event_index = counted.beat;
        self.state = VoiceState::Playing;
        self.generation += 1;
        self.record_rhythm(counted.zero_total);
        counted.beat
    }

    /// Whether `dur` was reassigned since the last count. Lazy durations
    /// resolving to new values do not count as a change.
    pub fn duration_changed(&self) -> bool {
        match (&self.last_dur, self.attrs.get("dur")) {
            (Some(last), Some(current)) => !last.same_as(current),
            (None, None) => false,
            _ => true,
        }
    }

    /// Recount the position after a duration change so the voice lands where
    /// it would have been had it always played this rhythm.
    pub fn realign(&mut self, rhythm: &[f64], beat: Beat) -> Count {
        let counted = count(rhythm, beat, false);
        self.event_n = counted.n;
        self.record_rhythm(counted.zero_total);
        counted
    }

    fn record_rhythm(&mut self, zero_total: bool) {
        if zero_total {
            warn!(voice = %self.id, "durations sum to zero, setting dur to 1");
            self.set_attr("dur", Pattern::from(1.0));
        }
        self.last_dur = self.attrs.get("dur").cloned();
    }

    /// Finish playing at the first firing at or after `stop_point`.
    pub fn stop(&mut self, stop_point: Beat) {
        if self.is_playing() {
            self.state = VoiceState::Stopping { stop_point };
        }
    }

    pub fn should_finish(&self, beat: Beat) -> bool {
        matches!(self.state, VoiceState::Stopping { stop_point } if beat >= stop_point)
    }

    /// Stop immediately and reset. Fire tasks already queued for this voice
    /// become stale.
    pub fn kill(&mut self, settings: &Settings) {
        self.state = VoiceState::Idle;
        self.generation += 1;
        self.reset(settings);
    }

    pub fn commit(&mut self, event: Event) {
        self.event = event;
    }

    /// Move to the next event, `step` beats after `origin`. The event index
    /// never moves backwards. Returns the beat of the next firing.
    pub fn advance(&mut self, origin: Beat, step: Beat) -> Beat {
        self.event_index = self.event_index.max(origin + step);
        self.event_n += 1;
        self.notes_played += 1;
        self.event_index
    }

    /// Play the events from the back: mirror every attribute around the
    /// current position.
    pub fn reverse(&mut self) {
        let n = self.event_n;
        for pattern in self.attrs.values_mut() {
            *pattern = pattern.pivot(n);
        }
    }

    pub fn rotate(&mut self, n: i64) {
        if let Some(degree) = self.attrs.get("degree") {
            let rotated = degree.rotate(n);
            self.attrs.insert("degree".to_string(), rotated);
        }
    }

    pub fn shuffle(&mut self, rng: &mut Rng) {
        if let Some(degree) = self.attrs.get("degree") {
            let shuffled = degree.shuffle(rng);
            self.attrs.insert("degree".to_string(), shuffled);
        }
    }

    /// Move the position `n` events on (or back, for negative `n`).
    pub fn shift(&mut self, n: i64) {
        self.event_n += n;
    }

    /// Compile a resolved event into messages, one per parallel value.
    ///
    /// A rest duration yields nothing. Messages with no amplitude (or no
    /// frequency, or no buffer for samplers) are dropped.
    pub fn compile(&self, event: &Event, beat_dur: f64) -> Vec<Message> {
        let Some(synth) = &self.synth else {
            return Vec::new();
        };
        if event.get("dur").is_some_and(Value::is_rest) {
            return Vec::new();
        }
        split_event(event)
            .into_iter()
            .filter_map(|packet| self.message(synth, packet, beat_dur))
            .collect()
    }

    fn message(&self, synth: &str, mut packet: Packet, beat_dur: f64) -> Option<Message> {
        let get = |p: &Packet, name: &str| p.get(name).copied().unwrap_or(0.0);

        let amp = get(&packet, "amp") * packet.get("amplify").copied().unwrap_or(1.0);
        packet.insert("amp".to_string(), amp);
        packet.remove("bpm");
        packet.insert("beat_dur".to_string(), beat_dur);
        let sus = get(&packet, "sus") * beat_dur;
        packet.insert("sus".to_string(), sus);

        let audible = match self.kind {
            InstrumentKind::Synth => {
                let oct = packet.get("oct").copied().unwrap_or(5.0);
                let midi = self
                    .scale
                    .midi(get(&packet, "degree"), oct, get(&packet, "root"));
                let given = get(&packet, "freq");
                let freq = if given > 0.0 { given } else { midi_to_freq(midi) };
                packet.insert("freq".to_string(), freq);
                packet.insert("midinote".to_string(), midi);
                freq > 0.0
            }
            InstrumentKind::Sampler => {
                let given = get(&packet, "buf");
                let buf = if given > 0.0 { given } else { get(&packet, "degree") };
                let pos = if get(&packet, "rate") < 0.0 { sus } else { 0.0 };
                packet.insert("buf".to_string(), buf);
                packet.insert("pos".to_string(), pos);
                buf > 0.0
            }
        };

        (audible && amp > 0.0).then(|| Message {
            synth: synth.to_string(),
            params: packet,
        })
    }

    /// Values of the accessed attributes to publish after a firing, grouped
    /// by their delay in beats. A grouped delay publishes each item's values
    /// at that item's delay.
    pub fn key_updates(&self, event: &Event) -> Vec<(f64, Vec<(String, Value)>)> {
        if self.accessed.is_empty() {
            return Vec::new();
        }
        let values_at = |index: Option<usize>| -> Vec<(String, Value)> {
            self.accessed
                .iter()
                .map(|attr| {
                    let value = event.get(attr).cloned().unwrap_or(Value::Number(0.0));
                    let value = match index {
                        Some(i) => value.at(i),
                        None => value,
                    };
                    (attr.clone(), value)
                })
                .collect()
        };

        match event.get("delay") {
            Some(delay @ Value::Group(..)) => (0..event_length(event))
                .map(|i| (delay.at(i).first_number(), values_at(Some(i))))
                .collect(),
            Some(delay) => vec![(delay.first_number(), values_at(None))],
            None => vec![(0.0, values_at(None))],
        }
    }
}
