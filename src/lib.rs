//! # cadenza
//!
//! A beat-synchronized voice scheduler for live coding, driving a
//! SuperCollider server over OSC.
//!
//! ## Core Concepts
//!
//! - **Pattern**: A cyclic sequence of elements. Elements may be numbers,
//!   rests, parallel groups or lazy values (generators, time vars and keys
//!   to other voices' attributes) resolved when a voice fires.
//! - **Voice**: A named player bound to a synth. Each attribute is a
//!   pattern; each firing reads every attribute at the voice's position.
//! - **Beat**: Exact rational musical time. All scheduling happens on beats;
//!   seconds only appear when bundles are timestamped.
//! - **Engine**: The tempo clock, its queue, the voices and the output. One
//!   bundle is sent per beat that produced messages.
//!
//! ## Example
//!
//! ```rust
//! use cadenza::prelude::*;
//! use cadenza::osc::{decode_bundle, MemoryTransport};
//!
//! let time = ManualTime::new();
//! let out = MemoryTransport::new();
//! let mut engine = Engine::new(
//!     Settings::default(),
//!     Box::new(time.clone()),
//!     Box::new(out.clone()),
//! )?;
//!
//! engine.assign("p1", "pluck", vec![0.0, 2.0, 4.0], &[])?;
//! time.set(2.0); // beat 4 at 120 bpm
//! engine.dispatch_due();
//!
//! let bundle = decode_bundle(&out.sent()[0])?;
//! assert_eq!(bundle.messages[0].synth, "pluck");
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ## Playing Live
//!
//! [`Performance`] runs an engine on a driver thread and can be shared with
//! a REPL or editor:
//!
//! ```rust,ignore
//! let perf = Performance::new(Settings::load()?)?;
//! perf.assign("d1", "play", 0.0, &[("dur", Pattern::from(vec![1.0, 0.5, 0.5]))])?;
//! perf.update_tempo(140.0)?;
//! ```

// Time and patterns
pub mod beat;
pub mod generator;
pub mod key;
pub mod pattern;
pub mod scale;
pub mod timevar;

// Resolution and voices
pub mod event;
pub mod repeat;
pub mod resolve;
pub mod voice;

// Scheduling
pub mod clock;
pub mod engine;
pub mod queue;
pub mod scheduler;

// Output
pub mod osc;
pub mod performance;
pub mod sync;

pub mod config;
pub mod error;
pub mod rng;

// Re-export core types
pub use beat::Beat;
pub use clock::{ManualTime, MonotonicTime, SoloMode, Tempo, TempoClock, TimeSource};
pub use config::{ConfigError, InstrumentKind, Settings};
pub use engine::Engine;
pub use error::{PerformanceError, ResolveError, TimeVarError, TransportError};
pub use event::{Behaviour, Event, Value};
pub use generator::{pcycle, prand, pwhite, GeneratorPattern};
pub use key::{PlayerKey, VoiceId};
pub use osc::{BundleEncoder, MemoryTransport, Message, ScsynthEncoder, Transport, UdpTransport};
pub use pattern::{Element, PGroup, Pattern};
pub use performance::Performance;
pub use repeat::VoiceMethod;
pub use scale::Scale;
pub use sync::{SyncInfo, TempoListener};
pub use timevar::{Interpolation, TimeVar};
pub use voice::{Assignment, Voice};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::beat::Beat;
    pub use crate::clock::{ManualTime, SoloMode, Tempo};
    pub use crate::config::Settings;
    pub use crate::engine::Engine;
    pub use crate::generator::{pcycle, prand, pwhite};
    pub use crate::pattern::{PGroup, Pattern};
    pub use crate::performance::Performance;
    pub use crate::repeat::VoiceMethod;
    pub use crate::scale::Scale;
    pub use crate::timevar::TimeVar;
    pub use crate::voice::Assignment;
}
