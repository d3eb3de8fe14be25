//! The live-coding front end: an [`Engine`] behind a mutex plus the driver
//! thread that plays it.
//!
//! Every method takes the lock for the whole operation, so the driver never
//! sees a voice half way through an update, then wakes the driver in case a
//! nearer block was queued.
//!
//! ```rust,no_run
//! use cadenza::prelude::*;
//!
//! let perf = Performance::new(Settings::load()?)?;
//! perf.assign("p1", "pluck", vec![0.0, 2.0, 4.0], &[("dur", Pattern::from(vec![1.0, 0.5, 0.5]))])?;
//! let bass = perf.key("p1", "degree");
//! perf.assign("b1", "bass", bass, &[("dur", Pattern::from(4.0))])?;
//! perf.every("p1", 8.0, VoiceMethod::Stutter(4))?;
//! # Ok::<(), cadenza::PerformanceError>(())
//! ```

use crate::beat::Beat;
use crate::clock::{MonotonicTime, SoloMode, Tempo, TimeSource};
use crate::config::Settings;
use crate::engine::Engine;
use crate::error::PerformanceError;
use crate::key::{PlayerKey, VoiceId};
use crate::osc::Transport;
use crate::pattern::Pattern;
use crate::repeat::VoiceMethod;
use crate::scheduler::{lock_engine, start_driver, DriverHandle};
use crate::sync::{send_sync, TempoListener};
use crate::voice::Assignment;
use std::sync::{Arc, Mutex};
use tracing::info;

pub struct Performance {
    engine: Arc<Mutex<Engine>>,
    driver: DriverHandle,
    listener: Option<TempoListener>,
}

impl Performance {
    /// A performance on wall-clock time, sending to the server in `settings`.
    pub fn new(settings: Settings) -> Result<Self, PerformanceError> {
        Ok(Self::from_engine(Engine::connect(settings)?))
    }

    /// A performance on wall-clock time with a custom transport.
    pub fn with_transport(
        settings: Settings,
        transport: Box<dyn Transport>,
    ) -> Result<Self, PerformanceError> {
        Self::with_time_source(settings, Box::new(MonotonicTime::new()), transport)
    }

    pub fn with_time_source(
        settings: Settings,
        source: Box<dyn TimeSource>,
        transport: Box<dyn Transport>,
    ) -> Result<Self, PerformanceError> {
        Ok(Self::from_engine(Engine::new(settings, source, transport)?))
    }

    /// Start a driver thread for `engine`.
    pub fn from_engine(engine: Engine) -> Self {
        let max_wait = engine.settings().max_wait;
        let engine = Arc::new(Mutex::new(engine));
        let driver = start_driver(engine.clone(), max_wait);
        Performance {
            engine,
            driver,
            listener: None,
        }
    }

    /// Run `f` with the engine locked, then wake the driver.
    pub fn with_engine<R>(&self, f: impl FnOnce(&mut Engine) -> R) -> R {
        let result = f(&mut lock_engine(&self.engine));
        self.driver.wake();
        result
    }

    pub fn engine(&self) -> &Arc<Mutex<Engine>> {
        &self.engine
    }

    pub fn assign(
        &self,
        voice: impl Into<VoiceId>,
        synth: &str,
        primary: impl Into<Pattern>,
        kwargs: &[(&str, Pattern)],
    ) -> Result<(), PerformanceError> {
        self.with_engine(|e| e.assign(voice, synth, primary, kwargs))
    }

    pub fn apply(&self, voice: impl Into<VoiceId>, assignment: Assignment) -> Result<(), PerformanceError> {
        self.with_engine(|e| e.apply(voice, assignment))
    }

    pub fn set(
        &self,
        voice: impl Into<VoiceId>,
        attr: &str,
        pattern: impl Into<Pattern>,
    ) -> Result<(), PerformanceError> {
        self.with_engine(|e| e.set(voice, attr, pattern))
    }

    pub fn key(&self, voice: impl Into<VoiceId>, attr: &str) -> PlayerKey {
        self.with_engine(|e| e.key(voice, attr))
    }

    pub fn stop(&self, voice: impl Into<VoiceId>, bars: u32) -> Result<(), PerformanceError> {
        self.with_engine(|e| e.stop(voice, bars))
    }

    pub fn kill(&self, voice: impl Into<VoiceId>) -> Result<(), PerformanceError> {
        self.with_engine(|e| e.kill(voice))
    }

    pub fn solo(&self, voice: impl Into<VoiceId>, mode: SoloMode) {
        self.with_engine(|e| e.solo(voice, mode))
    }

    pub fn only(&self, voice: impl Into<VoiceId>) {
        self.with_engine(|e| e.only(voice))
    }

    pub fn clear(&self) {
        self.with_engine(Engine::clear)
    }

    pub fn every(
        &self,
        voice: impl Into<VoiceId>,
        period: impl Into<Pattern>,
        method: VoiceMethod,
    ) -> Result<u64, PerformanceError> {
        self.with_engine(|e| e.every(voice, period, method))
    }

    pub fn often(&self, voice: impl Into<VoiceId>, method: VoiceMethod) -> Result<u64, PerformanceError> {
        self.with_engine(|e| e.often(voice, method))
    }

    pub fn sometimes(&self, voice: impl Into<VoiceId>, method: VoiceMethod) -> Result<u64, PerformanceError> {
        self.with_engine(|e| e.sometimes(voice, method))
    }

    pub fn rarely(&self, voice: impl Into<VoiceId>, method: VoiceMethod) -> Result<u64, PerformanceError> {
        self.with_engine(|e| e.rarely(voice, method))
    }

    pub fn never(&self, voice: impl Into<VoiceId>, method: &VoiceMethod) -> Result<usize, PerformanceError> {
        self.with_engine(|e| e.never(voice, method))
    }

    pub fn stutter(&self, voice: impl Into<VoiceId>, n: usize) -> Result<(), PerformanceError> {
        self.with_engine(|e| e.stutter(voice, n))
    }

    pub fn jump(&self, voice: impl Into<VoiceId>, ahead: i64) -> Result<(), PerformanceError> {
        self.with_engine(|e| e.jump(voice, ahead))
    }

    pub fn schedule<F>(&self, beat: Beat, f: F)
    where
        F: FnOnce(&mut Engine) + Send + 'static,
    {
        self.with_engine(|e| e.schedule(beat, f))
    }

    pub fn future<F>(&self, beats: Beat, f: F)
    where
        F: FnOnce(&mut Engine) + Send + 'static,
    {
        self.with_engine(|e| e.future(beats, f))
    }

    pub fn set_tempo(&self, tempo: impl Into<Tempo>) -> Result<(), PerformanceError> {
        self.with_engine(|e| e.set_tempo(tempo))
    }

    pub fn update_tempo(&self, tempo: impl Into<Tempo>) -> Result<(), PerformanceError> {
        self.with_engine(|e| e.update_tempo(tempo))
    }

    pub fn now(&self) -> f64 {
        lock_engine(&self.engine).now()
    }

    pub fn next_bar(&self) -> Beat {
        lock_engine(&self.engine).next_bar()
    }

    pub fn bar_length(&self) -> Beat {
        lock_engine(&self.engine).bar_length()
    }

    pub fn beat_dur(&self, beats: f64) -> f64 {
        lock_engine(&self.engine).beat_dur(beats)
    }

    pub fn playing(&self) -> Vec<VoiceId> {
        lock_engine(&self.engine).playing()
    }

    /// Listen for shared tempos on `port`, replacing any open listener.
    pub fn open_listener(&mut self, port: u16) -> Result<(), PerformanceError> {
        self.close_listener();
        let listener = TempoListener::open(port, self.engine.clone(), Some(self.driver.waker()))?;
        self.listener = Some(listener);
        Ok(())
    }

    pub fn close_listener(&mut self) {
        if let Some(mut listener) = self.listener.take() {
            listener.close();
        }
    }

    pub fn listener(&self) -> Option<&TempoListener> {
        self.listener.as_ref()
    }

    /// Send the current tempo to another machine's listener.
    pub fn share_tempo(&self, target: &str) -> Result<(), PerformanceError> {
        let info = lock_engine(&self.engine).sync_info();
        send_sync(&info, target)?;
        Ok(())
    }

    /// Stop every voice and the driver thread.
    pub fn shutdown(&mut self) {
        if !self.driver.is_running() {
            return;
        }
        self.close_listener();
        lock_engine(&self.engine).clear();
        self.driver.stop();
        info!("performance shut down");
    }
}

impl Drop for Performance {
    fn drop(&mut self) {
        self.shutdown();
    }
}
