//! The performance context: clock, voices, key cache and output.
//!
//! Everything mutable about a performance lives in one [`Engine`]. The
//! threaded [`Performance`](crate::performance::Performance) handle keeps it
//! behind a single mutex; tests drive it directly with a manual time source.
//!
//! Firing a voice happens in two phases. Resolution reads the whole voice
//! registry (other voices' patterns may be referenced through player keys)
//! while writing only to the key cache; the voice is then updated on its own.

use crate::beat::Beat;
use crate::clock::{MonotonicTime, SoloMode, Tempo, TempoClock, TimeSource};
use crate::config::Settings;
use crate::error::PerformanceError;
use crate::event::{apply_behaviours, unduplicate_durs, Value};
use crate::key::{KeyCache, PlayerKey, VoiceId};
use crate::osc::{BundleEncoder, EncodedMessage, Message, ScsynthEncoder, Transport, UdpTransport};
use crate::pattern::Pattern;
use crate::queue::{QueueBlock, Task};
use crate::repeat::{self, VoiceMethod};
use crate::resolve::{check_references, Resolver, VoiceMap};
use crate::rng::Rng;
use crate::sync::SyncInfo;
use crate::voice::{stutter_event, Assignment, Voice};
use std::any::Any;
use std::collections::BTreeSet;
use std::panic::{self, AssertUnwindSafe};
use tracing::{debug, error, info, warn};

/// Consecutive zero-length events a voice may play in one block before a
/// one-beat step is forced.
const MAX_ZERO_STEPS: usize = 64;

/// Seconds a message may be behind the wall clock and still be sent. The
/// server plays it as soon as it arrives.
const LATE_TOLERANCE: f64 = 0.05;

pub struct Engine {
    settings: Settings,
    clock: TempoClock,
    voices: VoiceMap,
    keys: KeyCache,
    encoder: Box<dyn BundleEncoder>,
    transport: Box<dyn Transport>,
    rng: Rng,
    /// The block being executed, if any.
    running: Option<QueueBlock>,
    /// Messages collected for the block being executed.
    outbox: Vec<EncodedMessage>,
}

impl Engine {
    pub fn new(
        settings: Settings,
        source: Box<dyn TimeSource>,
        transport: Box<dyn Transport>,
    ) -> Result<Self, PerformanceError> {
        let clock = TempoClock::new(&settings, source)?;
        Ok(Engine {
            settings,
            clock,
            voices: VoiceMap::new(),
            keys: KeyCache::new(),
            encoder: Box::new(ScsynthEncoder::new()),
            transport,
            rng: Rng::default(),
            running: None,
            outbox: Vec::new(),
        })
    }

    /// An engine on wall-clock time sending to the server in `settings`.
    pub fn connect(settings: Settings) -> Result<Self, PerformanceError> {
        let transport = UdpTransport::new(&settings.server.address())?;
        info!(server = %transport.target(), "sending to server");
        Self::new(settings, Box::new(MonotonicTime::new()), Box::new(transport))
    }

    pub fn with_encoder(mut self, encoder: Box<dyn BundleEncoder>) -> Self {
        self.encoder = encoder;
        self
    }

    pub fn with_seed(mut self, seed: u128) -> Self {
        self.rng = Rng::new_with_seed(seed);
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn clock(&self) -> &TempoClock {
        &self.clock
    }

    pub fn keys(&self) -> &KeyCache {
        &self.keys
    }

    pub fn voice(&self, id: &VoiceId) -> Option<&Voice> {
        self.voices.get(id)
    }

    pub fn voices(&self) -> &VoiceMap {
        &self.voices
    }

    /// Voices currently playing, in the order they started.
    pub fn playing(&self) -> Vec<VoiceId> {
        self.clock.playing().to_vec()
    }

    pub fn now(&mut self) -> f64 {
        self.clock.now()
    }

    pub fn next_bar(&mut self) -> Beat {
        self.clock.next_bar()
    }

    pub fn bar_length(&self) -> Beat {
        self.clock.bar_length()
    }

    pub fn beat_dur(&self, beats: f64) -> f64 {
        self.clock.beat_dur(beats)
    }

    fn now_beat(&mut self) -> Beat {
        Beat::from_f64(self.clock.now())
    }

    /// Queue `task` at `beat`. A task for the beat being executed joins the
    /// running block.
    fn push_task(&mut self, beat: Beat, task: Task) -> bool {
        if let Some(block) = self.running.as_mut() {
            if block.beat() == beat {
                return block.add(task);
            }
        }
        self.clock.queue_mut().schedule(beat, task)
    }

    // ------------------------------------------------------------------
    // Assignment
    // ------------------------------------------------------------------

    /// `voice >> synth(primary, **kwargs)`.
    pub fn assign(
        &mut self,
        voice: impl Into<VoiceId>,
        synth: &str,
        primary: impl Into<Pattern>,
        kwargs: &[(&str, Pattern)],
    ) -> Result<(), PerformanceError> {
        let assignment = kwargs
            .iter()
            .fold(Assignment::new(synth).degree(primary), |a, (name, pattern)| {
                a.with(*name, pattern.clone())
            });
        self.apply(voice, assignment)
    }

    /// Apply a synth assignment, starting the voice if it is not playing.
    ///
    /// Nothing changes if the assignment would create a reference cycle.
    pub fn apply(
        &mut self,
        voice: impl Into<VoiceId>,
        assignment: Assignment,
    ) -> Result<(), PerformanceError> {
        let id = voice.into();
        let mut staged = self
            .voices
            .get(&id)
            .cloned()
            .unwrap_or_else(|| Voice::new(id.clone(), &self.settings));
        let was_playing = staged.is_playing();
        let touched = staged.apply(&assignment, &self.settings)?;
        self.check_staged(&staged, &touched)?;

        let solo = self.clock.solo();
        if solo.is_active() && !solo.contains(&id) {
            let bar = self.clock.next_bar();
            let joining = id.clone();
            self.push_task(
                bar,
                Task::Call(Box::new(move |engine: &mut Engine| {
                    engine.clock.solo_mut().add(&joining)
                })),
            );
        }

        let start = if was_playing {
            None
        } else {
            let point = if assignment.is_quantised() {
                self.clock.next_bar()
            } else {
                self.now_beat()
            };
            let pending = BTreeSet::new();
            let rhythm = Resolver::new(&self.voices, &mut self.keys, &pending, point).rhythm(&staged);
            Some(staged.start(&rhythm, point))
        };

        let generation = staged.generation();
        for attr in &touched {
            self.keys.invalidate(&id, attr);
        }
        self.voices.insert(id.clone(), staged);

        if let Some(beat) = start {
            self.clock.add_playing(&id);
            info!(voice = %id, synth = assignment.synth(), %beat, "voice started");
            self.push_task(beat, Task::Fire { voice: id, generation });
        }
        Ok(())
    }

    /// Replace one attribute of an existing voice.
    pub fn set(
        &mut self,
        voice: impl Into<VoiceId>,
        attr: &str,
        pattern: impl Into<Pattern>,
    ) -> Result<(), PerformanceError> {
        let id = voice.into();
        let mut staged = self
            .voices
            .get(&id)
            .cloned()
            .ok_or_else(|| PerformanceError::UnknownVoice(id.clone()))?;
        let touched = staged.set(attr, pattern.into())?;
        self.check_staged(&staged, &touched)?;
        for attr in &touched {
            self.keys.invalidate(&id, attr);
        }
        self.voices.insert(id, staged);
        Ok(())
    }

    fn check_staged(&self, staged: &Voice, touched: &[String]) -> Result<(), PerformanceError> {
        for attr in touched {
            if let Some(pattern) = staged.attr(attr) {
                check_references(&self.voices, staged.id(), staged.attrs(), attr, pattern)?;
            }
        }
        Ok(())
    }

    /// A reference to `voice.attr` for use in other voices' patterns.
    ///
    /// The attribute's value is published after every firing of `voice`. An
    /// unknown voice is created idle.
    pub fn key(&mut self, voice: impl Into<VoiceId>, attr: &str) -> PlayerKey {
        let id = voice.into();
        let settings = &self.settings;
        self.voices
            .entry(id.clone())
            .or_insert_with(|| Voice::new(id.clone(), settings))
            .mark_accessed(attr);
        PlayerKey::new(id, crate::voice::canonical_attr(attr))
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Stop `voice` at the end of `bars` bars from the next bar line; zero
    /// stops it now.
    pub fn stop(&mut self, voice: impl Into<VoiceId>, bars: u32) -> Result<(), PerformanceError> {
        let id = voice.into();
        if bars == 0 {
            return self.kill(id);
        }
        let point = self.clock.next_bar() + self.clock.bars(bars as i64 - 1);
        let voice = self
            .voices
            .get_mut(&id)
            .ok_or_else(|| PerformanceError::UnknownVoice(id.clone()))?;
        voice.stop(point);
        info!(voice = %id, beat = %point, "voice stopping");
        Ok(())
    }

    /// Stop `voice` immediately and reset it.
    pub fn kill(&mut self, voice: impl Into<VoiceId>) -> Result<(), PerformanceError> {
        let id = voice.into();
        if !self.voices.contains_key(&id) {
            return Err(PerformanceError::UnknownVoice(id));
        }
        self.remove_voice(&id);
        info!(voice = %id, "voice stopped");
        Ok(())
    }

    pub fn solo(&mut self, voice: impl Into<VoiceId>, mode: SoloMode) {
        let id = voice.into();
        self.clock.solo_mut().set(&id, mode);
        debug!(voice = %id, ?mode, "solo changed");
    }

    /// Stop every voice except `voice`.
    pub fn only(&mut self, voice: impl Into<VoiceId>) {
        let keep = voice.into();
        for id in self.playing() {
            if id != keep {
                self.remove_voice(&id);
            }
        }
        debug!(voice = %keep, "only voice left playing");
    }

    /// Stop every voice, drop everything queued and clear the solo.
    pub fn clear(&mut self) {
        let playing: Vec<VoiceId> = self
            .voices
            .values()
            .filter(|voice| voice.is_playing())
            .map(|voice| voice.id().clone())
            .chain(self.playing())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        for id in &playing {
            self.remove_voice(id);
        }
        self.clock.queue_mut().clear();
        self.clock.solo_mut().clear();
        info!("performance cleared");
    }

    /// Kill `id` and forget its published key values. Refreshes already
    /// queued for it go stale with the new generation.
    fn remove_voice(&mut self, id: &VoiceId) {
        if let Some(voice) = self.voices.get_mut(id) {
            voice.kill(&self.settings);
        }
        self.clock.remove_playing(id);
        self.keys.invalidate_voice(id);
    }

    // ------------------------------------------------------------------
    // Voice methods
    // ------------------------------------------------------------------

    /// Call `method` on `voice` every `period` beats (read cyclically).
    /// Returns an id for the call.
    pub fn every(
        &mut self,
        voice: impl Into<VoiceId>,
        period: impl Into<Pattern>,
        method: VoiceMethod,
    ) -> Result<u64, PerformanceError> {
        let id = voice.into();
        let period = period.into();
        let now = self.now_beat();
        let step = self.period_step(&period, 0);
        let first = now.next_multiple(step);
        let voice = self
            .voices
            .get_mut(&id)
            .ok_or_else(|| PerformanceError::UnknownVoice(id.clone()))?;
        let generation = voice.generation();
        let call = voice.repeat_mut().add(method, period, first);
        self.push_task(
            first,
            Task::Method {
                voice: id,
                generation,
                call,
            },
        );
        Ok(call)
    }

    pub fn often(&mut self, voice: impl Into<VoiceId>, method: VoiceMethod) -> Result<u64, PerformanceError> {
        self.every(voice, repeat::often(), method)
    }

    pub fn sometimes(&mut self, voice: impl Into<VoiceId>, method: VoiceMethod) -> Result<u64, PerformanceError> {
        self.every(voice, repeat::sometimes(), method)
    }

    pub fn rarely(&mut self, voice: impl Into<VoiceId>, method: VoiceMethod) -> Result<u64, PerformanceError> {
        self.every(voice, repeat::rarely(), method)
    }

    /// Cancel every periodic call of `method` on `voice`.
    pub fn never(&mut self, voice: impl Into<VoiceId>, method: &VoiceMethod) -> Result<usize, PerformanceError> {
        let id = voice.into();
        let voice = self
            .voices
            .get_mut(&id)
            .ok_or_else(|| PerformanceError::UnknownVoice(id.clone()))?;
        Ok(voice.repeat_mut().stop_method(method))
    }

    /// Play `voice`'s current event `n` times within its duration, now.
    pub fn stutter(&mut self, voice: impl Into<VoiceId>, n: usize) -> Result<(), PerformanceError> {
        let id = voice.into();
        let beat = self.now_beat();
        self.stutter_at(&id, n, beat)
    }

    /// Play the event `ahead` steps in front of `voice`'s position, now.
    pub fn jump(&mut self, voice: impl Into<VoiceId>, ahead: i64) -> Result<(), PerformanceError> {
        let id = voice.into();
        let beat = self.now_beat();
        self.jump_at(&id, ahead, beat)
    }

    fn stutter_at(&mut self, id: &VoiceId, n: usize, beat: Beat) -> Result<(), PerformanceError> {
        let voice = self
            .voices
            .get(id)
            .ok_or_else(|| PerformanceError::UnknownVoice(id.clone()))?;
        if n < 2 || !voice.is_playing() || !self.clock.solo().allows(id) {
            return Ok(());
        }
        let pending = BTreeSet::new();
        let mut event = Resolver::new(&self.voices, &mut self.keys, &pending, beat)
            .for_voice(id)
            .attributes(voice, 0);
        unduplicate_durs(&mut event);
        stutter_event(&mut event, n);
        apply_behaviours(&mut event);
        let messages = voice.compile(&event, self.clock.beat_dur(1.0));
        self.emit(beat, messages);
        Ok(())
    }

    fn jump_at(&mut self, id: &VoiceId, ahead: i64, beat: Beat) -> Result<(), PerformanceError> {
        let voice = self
            .voices
            .get(id)
            .ok_or_else(|| PerformanceError::UnknownVoice(id.clone()))?;
        if !voice.is_playing() || !self.clock.solo().allows(id) {
            return Ok(());
        }
        let pending = BTreeSet::new();
        let event = Resolver::new(&self.voices, &mut self.keys, &pending, beat)
            .for_voice(id)
            .event(voice, ahead);
        let messages = voice.compile(&event, self.clock.beat_dur(1.0));
        self.emit(beat, messages);
        Ok(())
    }

    /// Length in beats of the `index`th period. Non-positive periods read
    /// as one beat.
    fn period_step(&mut self, period: &Pattern, index: i64) -> Beat {
        let pending = BTreeSet::new();
        let beat = self.now_beat();
        let value = Resolver::new(&self.voices, &mut self.keys, &pending, beat).number_at(period, index, 1.0);
        let step = Beat::from_f64(value);
        if step > Beat::zero() {
            step
        } else {
            warn!(period = value, "period must be positive, using one beat");
            Beat::one()
        }
    }

    fn run_method(&mut self, beat: Beat, id: &VoiceId, generation: u64, call: u64) {
        let Some(voice) = self.voices.get(id) else {
            return;
        };
        if voice.generation() != generation || !voice.is_playing() {
            debug!(voice = %id, call, "dropping stale periodic call");
            return;
        }
        let Some(periodic) = voice.repeat().get(call).cloned() else {
            return;
        };

        let result = match &periodic.method {
            VoiceMethod::Stutter(n) => self.stutter_at(id, *n, beat),
            VoiceMethod::Jump(ahead) => self.jump_at(id, *ahead, beat),
            method => {
                if let Some(voice) = self.voices.get_mut(id) {
                    match method {
                        VoiceMethod::Reverse => voice.reverse(),
                        VoiceMethod::Rotate(n) => voice.rotate(*n),
                        VoiceMethod::Shuffle => voice.shuffle(&mut self.rng),
                        VoiceMethod::Shift(n) => voice.shift(*n),
                        VoiceMethod::Stutter(_) | VoiceMethod::Jump(_) => {}
                    }
                }
                Ok(())
            }
        };
        if let Err(e) = result {
            warn!(voice = %id, "periodic call failed: {e}");
        }

        let step = self.period_step(&periodic.period, periodic.calls + 1);
        let next = self
            .voices
            .get_mut(id)
            .and_then(|voice| voice.repeat_mut().advance(call, step));
        if let Some(next) = next {
            self.push_task(
                next,
                Task::Method {
                    voice: id.clone(),
                    generation,
                    call,
                },
            );
        }
    }

    // ------------------------------------------------------------------
    // Scheduling and tempo
    // ------------------------------------------------------------------

    /// Run `f` at `beat`.
    pub fn schedule<F>(&mut self, beat: Beat, f: F)
    where
        F: FnOnce(&mut Engine) + Send + 'static,
    {
        self.push_task(beat, Task::Call(Box::new(f)));
    }

    /// Run `f` `beats` from now.
    pub fn future<F>(&mut self, beats: Beat, f: F)
    where
        F: FnOnce(&mut Engine) + Send + 'static,
    {
        let beat = self.now_beat() + beats;
        self.schedule(beat, f);
    }

    /// Change tempo immediately.
    pub fn set_tempo(&mut self, tempo: impl Into<Tempo>) -> Result<(), PerformanceError> {
        let tempo = tempo.into();
        self.clock.set_tempo(tempo.clone())?;
        info!(?tempo, "tempo changed");
        Ok(())
    }

    /// Change tempo at the next bar line.
    pub fn update_tempo(&mut self, tempo: impl Into<Tempo>) -> Result<(), PerformanceError> {
        let tempo = tempo.into();
        tempo.validate()?;
        let bar = self.clock.next_bar();
        self.push_task(bar, Task::SetTempo(tempo));
        Ok(())
    }

    /// The current tempo and its anchor, for sharing with other machines.
    pub fn sync_info(&self) -> SyncInfo {
        let (time, beat) = self.clock.anchor();
        SyncInfo {
            bpm_start_time: time,
            bpm_start_beat: beat,
            bpm: self.clock.tempo().clone(),
        }
    }

    /// Follow a tempo shared by another machine.
    pub fn apply_sync(&mut self, info: &SyncInfo) -> Result<(), PerformanceError> {
        self.clock
            .set_anchor(info.bpm_start_time, info.bpm_start_beat, info.bpm.clone())?;
        info!(bpm = ?info.bpm, beat = info.bpm_start_beat, "tempo synced");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    /// Execute every block that is due. Returns how many ran.
    pub fn dispatch_due(&mut self) -> usize {
        let mut executed = 0;
        loop {
            let now = self.clock.now();
            let Some(block) = self.clock.queue_mut().pop_due(now) else {
                break;
            };
            self.execute_block(block);
            executed += 1;
        }
        executed
    }

    /// Seconds until the next block is due, if any is queued.
    pub fn seconds_until_next(&self) -> Option<f64> {
        let beat = self.clock.queue().next_beat()?;
        Some(self.clock.seconds_until(beat).max(0.0))
    }

    fn execute_block(&mut self, block: QueueBlock) {
        let beat = block.beat();
        self.running = Some(block);
        while let Some(task) = self.running.as_mut().and_then(QueueBlock::next_task) {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.run_task(beat, task)));
            if let Err(payload) = outcome {
                error!(%beat, "task panicked: {}", panic_message(payload.as_ref()));
            }
        }
        self.running = None;
        let timestamp = self.clock.message_time(beat);
        self.flush(timestamp);
    }

    fn run_task(&mut self, beat: Beat, task: Task) {
        match task {
            Task::Fire { voice, generation } => self.fire_voice(beat, &voice, generation),
            Task::Method {
                voice,
                generation,
                call,
            } => self.run_method(beat, &voice, generation, call),
            Task::RefreshKeys {
                voice,
                generation,
                values,
            } => {
                if self.voices.get(&voice).map(Voice::generation) != Some(generation) {
                    debug!(voice = %voice, %beat, "dropping stale key refresh");
                    return;
                }
                for (attr, value) in values {
                    self.keys.set(&voice, &attr, value, beat);
                }
            }
            Task::SetTempo(tempo) => {
                if let Err(e) = self.set_tempo(tempo) {
                    warn!("scheduled tempo change failed: {e}");
                }
            }
            Task::Call(f) => f(self),
        }
    }

    fn fire_voice(&mut self, beat: Beat, id: &VoiceId, generation: u64) {
        let Some(voice) = self.voices.get(id) else {
            debug!(voice = %id, "fire for unknown voice");
            return;
        };
        if voice.generation() != generation || !voice.is_playing() {
            debug!(voice = %id, %beat, "dropping stale fire");
            return;
        }
        if voice.should_finish(beat) {
            self.remove_voice(id);
            info!(voice = %id, %beat, "voice stopped");
            return;
        }

        for attempt in 0..=MAX_ZERO_STEPS {
            let pending = self
                .running
                .as_ref()
                .map(QueueBlock::pending_voices)
                .unwrap_or_default();

            // Recount if dur was reassigned.
            let Some(voice) = self.voices.get(id) else {
                return;
            };
            let origin = if voice.duration_changed() {
                let rhythm = Resolver::new(&self.voices, &mut self.keys, &pending, beat).rhythm(voice);
                let Some(voice) = self.voices.get_mut(id) else {
                    return;
                };
                let index = voice.event_index();
                voice.realign(&rhythm, index).beat
            } else {
                voice.event_index()
            };

            // Resolve and compile.
            let Some(voice) = self.voices.get(id) else {
                return;
            };
            let event = Resolver::new(&self.voices, &mut self.keys, &pending, beat)
                .for_voice(id)
                .event(voice, 0);
            let messages = if self.clock.solo().allows(id) {
                voice.compile(&event, self.clock.beat_dur(1.0))
            } else {
                Vec::new()
            };
            let updates = voice.key_updates(&event);

            let mut step = event.get("dur").map(Value::first_number).unwrap_or(1.0);
            if let Some(bpm) = event.get("bpm").map(Value::first_number).filter(|b| *b > 0.0) {
                step *= self.clock.bpm() / bpm;
            }
            let mut step = if step.is_finite() && step > 0.0 {
                Beat::from_f64(step)
            } else {
                Beat::zero()
            };
            if step.is_zero() && attempt == MAX_ZERO_STEPS {
                warn!(voice = %id, %beat, "too many zero-length events, stepping one beat");
                step = Beat::one();
            }

            self.emit(beat, messages);
            for (delay, values) in updates {
                let delay = Beat::from_f64(delay);
                if delay > Beat::zero() {
                    self.push_task(
                        beat + delay,
                        Task::RefreshKeys {
                            voice: id.clone(),
                            generation,
                            values,
                        },
                    );
                } else {
                    for (attr, value) in values {
                        self.keys.set(id, &attr, value, beat);
                    }
                }
            }

            let Some(voice) = self.voices.get_mut(id) else {
                return;
            };
            voice.commit(event);
            // A positive step always lands after the beat being played.
            let origin = if step.is_zero() || origin + step > beat {
                origin
            } else {
                beat
            };
            let next = voice.advance(origin, step);
            if next > beat {
                self.push_task(
                    next,
                    Task::Fire {
                        voice: id.clone(),
                        generation,
                    },
                );
                return;
            }
        }
    }

    /// Encode messages due at `beat` (plus each message's delay). Outside a
    /// block they are sent straight away as one bundle.
    fn emit(&mut self, beat: Beat, messages: Vec<Message>) {
        if messages.is_empty() {
            return;
        }
        let base = self.clock.message_time(beat);
        let now = self.clock.unix_time();
        for message in messages {
            let timestamp = base + self.clock.beat_dur(message.delay());
            let late = now - timestamp;
            if late > LATE_TOLERANCE {
                warn!(synth = %message.synth, %beat, late, "dropping late message");
                continue;
            }
            match self.encoder.encode(&message, timestamp) {
                Ok(encoded) => self.outbox.push(encoded),
                Err(e) => error!(synth = %message.synth, "failed to encode message: {e}"),
            }
        }
        if self.running.is_none() {
            self.flush(base);
        }
    }

    fn flush(&mut self, timestamp: f64) {
        if self.outbox.is_empty() {
            return;
        }
        let messages = std::mem::take(&mut self.outbox);
        debug!(count = messages.len(), timestamp, "sending bundle");
        let bytes = match self.encoder.bundle(timestamp, messages) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("failed to encode bundle: {e}");
                return;
            }
        };
        if let Err(e) = self.transport.send(&bytes) {
            error!("failed to send bundle: {e}");
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualTime;
    use crate::generator::{pcycle, GeneratorKind, GeneratorPattern};
    use crate::osc::{decode_bundle, DecodedBundle, MemoryTransport};
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    struct Rig {
        engine: Engine,
        time: ManualTime,
        transport: MemoryTransport,
        t: f64,
    }

    impl Rig {
        fn new() -> Self {
            Self::with_settings(Settings {
                bpm: 60.0,
                latency: 0.25,
                ..Settings::default()
            })
        }

        fn with_settings(settings: Settings) -> Self {
            let time = ManualTime::new();
            let transport = MemoryTransport::new();
            let engine = Engine::new(settings, Box::new(time.clone()), Box::new(transport.clone()))
                .unwrap()
                .with_seed(7);
            Rig {
                engine,
                time,
                transport,
                t: 0.0,
            }
        }

        /// Step time in quarter beats up to and including `beat`.
        fn run_to(&mut self, beat: f64) {
            while self.t <= beat {
                self.time.set(self.t);
                self.engine.dispatch_due();
                self.t += 0.25;
            }
            self.t -= 0.25;
        }

        fn bundles(&self) -> Vec<DecodedBundle> {
            self.transport
                .sent()
                .iter()
                .map(|bytes| decode_bundle(bytes).unwrap())
                .collect()
        }

        /// Beat of every bundle sent, at one second per beat.
        fn onsets(&self) -> Vec<f64> {
            let origin = self.engine.clock().message_time(Beat::zero());
            self.bundles().iter().map(|b| b.timestamp - origin).collect()
        }
    }

    fn dur(x: f64) -> (&'static str, Pattern) {
        ("dur", Pattern::from(x))
    }

    #[test]
    fn test_voice_starts_at_next_bar() {
        let mut rig = Rig::new();
        rig.engine.assign("p1", "pads", vec![0.0, 2.0], &[dur(1.0)]).unwrap();
        rig.run_to(3.75);
        assert!(rig.transport.is_empty());
        rig.run_to(5.0);
        let bundles = rig.bundles();
        assert_eq!(bundles.len(), 2);
        assert_eq!(bundles[0].messages[0].params["midinote"], 60.0);
        assert_eq!(bundles[1].messages[0].params["midinote"], 64.0);
        let start = rig.engine.clock().message_time(Beat::from(4));
        assert!((bundles[0].timestamp - start).abs() < 1e-6);
        assert_eq!(rig.engine.voice(&VoiceId::from("p1")).unwrap().event_index(), Beat::from(6));
    }

    #[test]
    fn test_one_bundle_per_beat_in_schedule_order() {
        let mut rig = Rig::new();
        rig.engine.assign("p1", "lead", 0.0, &[dur(1.0)]).unwrap();
        rig.engine.assign("p2", "bass", 0.0, &[dur(1.0)]).unwrap();
        rig.run_to(4.0);
        let bundles = rig.bundles();
        assert_eq!(bundles.len(), 1);
        let synths: Vec<&str> = bundles[0].messages.iter().map(|m| m.synth.as_str()).collect();
        assert_eq!(synths, vec!["lead", "bass"]);
    }

    #[test]
    fn test_cycle_rejected_and_prior_value_kept() {
        let mut rig = Rig::new();
        rig.engine.assign("p1", "pads", 0.0, &[dur(1.0)]).unwrap();
        let own = rig.engine.key("p1", "dur");
        let err = rig.engine.set("p1", "dur", own).unwrap_err();
        assert_eq!(err.to_string(), "Circular reference found: p1.dur to itself via p1.dur");

        let p1_dur = rig.engine.key("p1", "dur");
        rig.engine.assign("p2", "pads", 0.0, &[("dur", Pattern::from(p1_dur))]).unwrap();
        let p2_dur = rig.engine.key("p2", "dur");
        let err = rig
            .engine
            .assign("p1", "pads", 0.0, &[("dur", Pattern::from(p2_dur))])
            .unwrap_err();
        assert!(matches!(err, PerformanceError::CircularReference { .. }));
        let p1 = rig.engine.voice(&VoiceId::from("p1")).unwrap();
        assert_eq!(p1.attr("dur").unwrap().numbers(), Some(vec![1.0]));
    }

    #[test]
    fn test_zero_duration_keeps_scheduling() {
        let mut rig = Rig::new();
        rig.engine.assign("p1", "pads", 0.0, &[dur(0.0)]).unwrap();
        rig.run_to(6.0);
        assert_eq!(rig.bundles().len(), 3);
        let p1 = rig.engine.voice(&VoiceId::from("p1")).unwrap();
        assert_eq!(p1.attr("dur").unwrap().numbers(), Some(vec![1.0]));
    }

    #[test]
    fn test_zero_length_event_fires_in_same_block() {
        let mut rig = Rig::new();
        rig.engine
            .assign("p1", "pads", vec![0.0, 2.0], &[("dur", Pattern::from(vec![1.0, 0.0]))])
            .unwrap();
        rig.run_to(5.0);
        let bundles = rig.bundles();
        assert_eq!(bundles.len(), 2);
        assert_eq!(bundles[0].messages.len(), 1);
        assert_eq!(bundles[1].messages.len(), 2);
    }

    #[test]
    fn test_stutter_splits_duration() {
        let mut rig = Rig::new();
        rig.engine.assign("p1", "pads", 0.0, &[dur(1.0)]).unwrap();
        rig.run_to(4.5);
        rig.transport.take();
        rig.engine.stutter("p1", 4).unwrap();
        let bundles = rig.bundles();
        assert_eq!(bundles.len(), 1);
        let messages = &bundles[0].messages;
        assert_eq!(messages.len(), 4);
        let delays: Vec<f32> = messages.iter().map(|m| m.params["delay"]).collect();
        assert_eq!(delays, vec![0.25, 0.5, 0.75, 1.0]);
        assert!(messages.iter().all(|m| m.params["dur"] == 0.25));
        assert!((messages[3].timestamp - bundles[0].timestamp - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_periodic_stutter_joins_block() {
        let mut rig = Rig::new();
        rig.engine.assign("p1", "pads", 0.0, &[dur(1.0)]).unwrap();
        rig.engine.every("p1", 4.0, VoiceMethod::Stutter(2)).unwrap();
        rig.run_to(8.0);
        let bundles = rig.bundles();
        assert_eq!(bundles.len(), 5);
        assert_eq!(bundles[0].messages.len(), 3);
        assert_eq!(bundles[1].messages.len(), 1);
        assert_eq!(bundles[4].messages.len(), 3);
    }

    #[test]
    fn test_solo_gates_output_but_keys_stay_fresh() {
        let mut rig = Rig::new();
        rig.engine
            .assign("p2", "bass", vec![0.0, 1.0, 2.0, 3.0], &[dur(1.0)])
            .unwrap();
        let key = rig.engine.key("p2", "degree");
        rig.engine.assign("p1", "lead", key, &[dur(1.0)]).unwrap();
        rig.engine.solo("p1", SoloMode::Only);
        rig.run_to(5.0);
        let bundles = rig.bundles();
        assert_eq!(bundles.len(), 2);
        for bundle in &bundles {
            assert!(bundle.messages.iter().all(|m| m.synth == "lead"));
        }
        assert_eq!(bundles[1].messages[0].params["midinote"], 62.0);
        let cached = rig.engine.keys().get(&VoiceId::from("p2"), "degree").unwrap();
        assert_eq!(cached.value, Value::Number(1.0));
    }

    #[test]
    fn test_key_read_before_owner_fires_is_fresh() {
        let mut rig = Rig::new();
        let key = rig.engine.key("p2", "degree");
        rig.engine.assign("p1", "lead", key, &[dur(1.0)]).unwrap();
        rig.engine
            .assign("p2", "bass", vec![0.0, 1.0, 2.0, 3.0], &[dur(1.0)])
            .unwrap();
        rig.run_to(6.0);
        let lead: Vec<f32> = rig
            .bundles()
            .iter()
            .flat_map(|b| b.messages.iter())
            .filter(|m| m.synth == "lead")
            .map(|m| m.params["midinote"])
            .collect();
        assert_eq!(lead, vec![60.0, 62.0, 64.0]);
    }

    #[test]
    fn test_kill_makes_queued_fire_stale() {
        let mut rig = Rig::new();
        rig.engine.assign("p1", "pads", 0.0, &[dur(1.0)]).unwrap();
        rig.run_to(4.0);
        rig.engine.kill("p1").unwrap();
        rig.run_to(8.0);
        assert_eq!(rig.bundles().len(), 1);
        assert!(rig.engine.playing().is_empty());
    }

    #[test]
    fn test_stop_at_bar() {
        let mut rig = Rig::new();
        rig.engine.assign("p1", "pads", 0.0, &[dur(1.0)]).unwrap();
        rig.engine.key("p1", "degree");
        rig.run_to(4.5);
        assert!(rig.engine.keys().get(&VoiceId::from("p1"), "degree").is_some());
        rig.engine.stop("p1", 1).unwrap();
        rig.run_to(10.0);
        assert_eq!(rig.bundles().len(), 4);
        assert!(rig.engine.playing().is_empty());
        assert!(rig.engine.keys().is_empty());
    }

    #[test]
    fn test_live_duration_edit_realigns() {
        let mut rig = Rig::new();
        rig.engine.assign("p1", "pads", 0.0, &[dur(1.0)]).unwrap();
        rig.run_to(5.5);
        rig.engine.set("p1", "dur", vec![0.5, 1.5]).unwrap();
        rig.run_to(7.0);
        assert_eq!(rig.bundles().len(), 4);
        let p1 = rig.engine.voice(&VoiceId::from("p1")).unwrap();
        assert_eq!(p1.event_index(), Beat::from(8));
    }

    #[test]
    fn test_generator_durations_play_in_order() {
        let mut rig = Rig::new();
        let durs = Pattern::from(pcycle(vec![0.5, 0.75]));
        rig.engine.assign("p1", "pads", 0.0, &[("dur", durs)]).unwrap();
        rig.run_to(7.0);
        let onsets = rig.onsets();
        let expected = [4.0, 4.5, 5.25, 5.75, 6.5, 7.0];
        assert_eq!(onsets.len(), expected.len(), "{onsets:?}");
        for (onset, want) in onsets.iter().zip(expected) {
            assert!((onset - want).abs() < 1e-6, "{onsets:?}");
        }
    }

    #[test]
    fn test_random_durations_keep_their_average_rate() {
        let mut rig = Rig::new();
        let durs = GeneratorPattern::with_seed(GeneratorKind::White { lo: 0.1, hi: 1.0 }, 3);
        rig.engine
            .assign("p1", "pads", 0.0, &[("dur", Pattern::from(durs))])
            .unwrap();
        rig.run_to(504.0);
        // 500 beats at a mean step of 0.55.
        let played = rig.transport.len();
        assert!((850..=970).contains(&played), "{played} bundles");
        let p1 = rig.engine.voice(&VoiceId::from("p1")).unwrap();
        assert_eq!(p1.notes_played(), played as u64);
    }

    #[test]
    fn test_zero_latency_sends_on_time() {
        let mut rig = Rig::with_settings(Settings {
            bpm: 60.0,
            latency: 0.0,
            ..Settings::default()
        });
        rig.engine.assign("p1", "pads", 0.0, &[dur(1.0)]).unwrap();
        rig.run_to(7.0);
        let onsets = rig.onsets();
        assert_eq!(onsets.len(), 4, "{onsets:?}");
        assert!((onsets[0] - 4.0).abs() < 1e-6);
    }

    #[test]
    fn test_scaled_realign_moves_past_current_beat() {
        let mut rig = Rig::new();
        rig.engine
            .assign("p1", "pads", 0.0, &[dur(1.0), ("bpm", Pattern::from(120.0))])
            .unwrap();
        rig.run_to(5.75);
        assert_eq!(rig.bundles().len(), 4);
        // Recounting [4] at beat 6 lands on 4; half of 4 beats reaches 6 again.
        rig.engine.set("p1", "dur", 4.0).unwrap();
        rig.run_to(6.0);
        let bundles = rig.bundles();
        assert_eq!(bundles.len(), 5);
        assert_eq!(bundles[4].messages.len(), 1);
        let p1 = rig.engine.voice(&VoiceId::from("p1")).unwrap();
        assert_eq!(p1.event_index(), Beat::from(8));
    }

    #[test]
    fn test_only_and_clear_forget_cached_keys() {
        let mut rig = Rig::new();
        let (p1, p2) = (VoiceId::from("p1"), VoiceId::from("p2"));
        rig.engine.assign("p1", "lead", vec![0.0, 1.0], &[dur(1.0)]).unwrap();
        rig.engine.assign("p2", "bass", vec![3.0, 4.0], &[dur(1.0)]).unwrap();
        rig.engine.key("p1", "degree");
        rig.engine.key("p2", "degree");
        rig.run_to(4.0);
        assert!(rig.engine.keys().get(&p1, "degree").is_some());
        assert!(rig.engine.keys().get(&p2, "degree").is_some());

        rig.engine.only("p2");
        assert!(rig.engine.keys().get(&p1, "degree").is_none());
        assert!(rig.engine.keys().get(&p2, "degree").is_some());
        assert_eq!(rig.engine.playing(), vec![p2.clone()]);

        rig.engine.clear();
        assert!(rig.engine.keys().get(&p2, "degree").is_none());
        assert!(rig.engine.playing().is_empty());
        rig.run_to(6.0);
        assert!(rig.engine.keys().is_empty());
    }

    #[test]
    fn test_key_refresh_queued_before_kill_is_dropped() {
        let mut rig = Rig::new();
        let p1 = VoiceId::from("p1");
        rig.engine
            .assign("p1", "lead", vec![0.0, 1.0], &[dur(1.0), ("delay", Pattern::from(0.5))])
            .unwrap();
        rig.engine.key("p1", "degree");
        rig.run_to(4.0);
        rig.engine.kill("p1").unwrap();
        rig.run_to(5.0);
        assert!(rig.engine.keys().get(&p1, "degree").is_none());
    }

    #[test]
    fn test_update_tempo_waits_for_bar() {
        let mut rig = Rig::new();
        rig.run_to(1.0);
        rig.engine.update_tempo(120.0).unwrap();
        assert!(rig.engine.update_tempo(0.0).is_err());
        rig.run_to(3.75);
        assert_eq!(rig.engine.clock().bpm(), 60.0);
        rig.run_to(4.0);
        assert_eq!(rig.engine.clock().bpm(), 120.0);
    }

    #[test]
    fn test_panicking_task_does_not_stop_block() {
        let mut rig = Rig::new();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        rig.engine.schedule(Beat::one(), |_| panic!("boom"));
        rig.engine.schedule(Beat::one(), move |_| flag.store(true, Ordering::SeqCst));
        rig.run_to(1.0);
        assert!(ran.load(Ordering::SeqCst));
        assert!(rig.engine.clock().queue().is_empty());
    }

    #[test]
    fn test_late_messages_dropped() {
        let mut rig = Rig::new();
        rig.engine.assign("p1", "pads", 0.0, &[dur(1.0)]).unwrap();
        rig.time.set(10.0);
        rig.engine.dispatch_due();
        let bundles = rig.bundles();
        assert_eq!(bundles.len(), 1);
        assert_eq!(rig.engine.voice(&VoiceId::from("p1")).unwrap().event_index(), Beat::from(11));
    }

    #[test]
    fn test_assignment_during_solo_joins_at_next_bar() {
        let mut rig = Rig::new();
        rig.engine.assign("p1", "lead", 0.0, &[dur(1.0)]).unwrap();
        rig.engine.solo("p1", SoloMode::Only);
        rig.engine.assign("p2", "bass", 0.0, &[dur(1.0)]).unwrap();
        rig.run_to(4.0);
        assert!(rig.engine.clock().solo().contains(&VoiceId::from("p2")));
    }

    #[test]
    fn test_sync_round_trip() {
        let mut rig = Rig::new();
        rig.time.set(2.0);
        rig.engine.set_tempo(90.0).unwrap();
        let info = rig.engine.sync_info();
        assert_eq!(info.bpm, Tempo::Fixed(90.0));
        assert_eq!(info.bpm_start_beat, 2.0);

        let mut other = Rig::new();
        other.time.set(2.0);
        other.engine.apply_sync(&info).unwrap();
        assert!((other.engine.now() - 2.0).abs() < 0.05);
        assert_eq!(other.engine.clock().bpm(), 90.0);
    }
}
