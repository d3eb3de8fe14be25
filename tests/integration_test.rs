//! Integration tests for cadenza.

use cadenza::osc::{decode_bundle, DecodedBundle};
use cadenza::*;
use std::thread;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

/// Log to the test output, filtered by `RUST_LOG`.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn fast_settings(bpm: f64) -> Settings {
    Settings {
        bpm,
        latency: 0.2,
        max_wait: 0.005,
        ..Settings::default()
    }
}

fn decoded(out: &MemoryTransport) -> Vec<DecodedBundle> {
    out.sent().iter().map(|b| decode_bundle(b).unwrap()).collect()
}

/// Poll until `cond` holds or two seconds pass.
fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < Duration::from_secs(2) {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}

/// An engine on a manual clock: returns the engine, its time and its output.
fn offline(settings: Settings) -> (Engine, ManualTime, MemoryTransport) {
    let time = ManualTime::new();
    let out = MemoryTransport::new();
    let engine = Engine::new(settings, Box::new(time.clone()), Box::new(out.clone())).unwrap();
    (engine, time, out)
}

/// Move a manual clock to `seconds` in small steps, dispatching as it goes.
fn play_until(engine: &mut Engine, time: &ManualTime, seconds: f64) {
    let mut t = 0.0;
    while t <= seconds {
        time.set(t);
        engine.dispatch_due();
        t += 0.125;
    }
}

/// The driver thread plays a voice in real time, one bundle per beat.
#[test]
fn test_driver_plays_voice() {
    init_tracing();
    let out = MemoryTransport::new();
    let perf = Performance::with_transport(fast_settings(1200.0), Box::new(out.clone())).unwrap();
    perf.assign("p1", "pluck", vec![0.0, 2.0, 4.0], &[]).unwrap();

    assert!(wait_for(|| out.len() >= 6), "only {} bundles", out.len());
    let bundles = decoded(&out);
    let mut notes: Vec<f32> = bundles[..3].iter().map(|b| b.messages[0].params["midinote"]).collect();
    notes.sort_by(f32::total_cmp);
    assert_eq!(notes, vec![60.0, 64.0, 67.0]);

    // Consecutive bundles are one beat (0.05 s) apart.
    for pair in bundles.windows(2) {
        let gap = pair[1].timestamp - pair[0].timestamp;
        assert!((gap - 0.05).abs() < 1e-3, "gap {gap}");
    }
}

/// Killing a voice from another thread stops its output straight away.
#[test]
fn test_kill_across_threads() {
    init_tracing();
    let out = MemoryTransport::new();
    let perf = Performance::with_transport(fast_settings(1200.0), Box::new(out.clone())).unwrap();
    perf.assign("p1", "pluck", 0.0, &[]).unwrap();
    assert!(wait_for(|| out.len() >= 2));

    perf.kill("p1").unwrap();
    let after_kill = out.len();
    thread::sleep(Duration::from_millis(200));
    assert_eq!(out.len(), after_kill);
    assert!(perf.playing().is_empty());
}

/// A voice told to stop plays to the end of the bar and is then removed.
#[test]
fn test_stop_at_bar_across_threads() {
    let out = MemoryTransport::new();
    let perf = Performance::with_transport(fast_settings(1200.0), Box::new(out.clone())).unwrap();
    perf.assign("p1", "pluck", 0.0, &[]).unwrap();
    assert!(wait_for(|| out.len() >= 1));
    perf.stop("p1", 1).unwrap();
    assert!(wait_for(|| perf.playing().is_empty()));
}

/// Ad-hoc calls run on their beats, in beat order.
#[test]
fn test_scheduled_calls_run_in_order() {
    let out = MemoryTransport::new();
    let perf = Performance::with_transport(fast_settings(1200.0), Box::new(out)).unwrap();
    let (tx, rx) = std::sync::mpsc::channel();
    let tx2 = tx.clone();
    perf.schedule(Beat::from(6), move |_| tx2.send("second").unwrap());
    perf.schedule(Beat::from(5), move |_| tx.send("first").unwrap());

    let first = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    let second = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!((first, second), ("first", "second"));
}

/// Tempo shared over UDP is picked up by another performance.
#[test]
fn test_tempo_sync_between_performances() {
    init_tracing();
    let leader = Performance::with_transport(fast_settings(120.0), Box::new(MemoryTransport::new())).unwrap();
    let mut follower =
        Performance::with_transport(fast_settings(120.0), Box::new(MemoryTransport::new())).unwrap();
    follower.open_listener(0).unwrap();
    let port = follower.listener().unwrap().local_addr().port();

    leader.set_tempo(133.0).unwrap();
    leader.share_tempo(&format!("127.0.0.1:{port}")).unwrap();

    assert!(wait_for(|| follower.with_engine(|e| e.clock().tempo() == &Tempo::Fixed(133.0))));
    let drift = (leader.now() - follower.now()).abs();
    assert!(drift < 0.1, "drift {drift}");
    follower.close_listener();
    assert!(follower.listener().is_none());
}

/// Settings loaded from TOML shape the bar length and the first beat.
#[test]
fn test_meter_from_toml() {
    let settings = Settings::from_toml_str(
        r#"
        bpm = 60.0
        meter = [3, 4]
        latency = 0.5
        "#,
    )
    .unwrap();
    let (mut engine, time, out) = offline(settings);
    assert_eq!(engine.bar_length(), Beat::from(3));
    engine.assign("p1", "pluck", 0.0, &[]).unwrap();
    play_until(&mut engine, &time, 3.0);

    let bundles = decoded(&out);
    assert_eq!(bundles.len(), 1);
    let expected = engine.clock().message_time(Beat::from(3));
    assert!((bundles[0].timestamp - expected).abs() < 1e-6);
}

/// Chords play together, rests play nothing, time vars are read at the
/// beat being played.
#[test]
fn test_groups_rests_and_time_vars() {
    let (mut engine, time, out) = offline(fast_settings(60.0));
    let degrees = Pattern::new(vec![
        Element::from(PGroup::chord(vec![0.0, 2.0, 4.0])),
        Element::rest(1.0),
        Element::from(7.0),
    ]);
    let amp = TimeVar::var(vec![0.5, 1.0], vec![6.0, 6.0]);
    engine
        .assign("p1", "pluck", degrees, &[("amp", Pattern::from(amp))])
        .unwrap();
    play_until(&mut engine, &time, 6.0);

    // Beat 4 lands on the rest.
    let bundles = decoded(&out);
    assert_eq!(bundles.len(), 2);
    assert_eq!(bundles[0].messages.len(), 1);
    assert_eq!(bundles[0].messages[0].params["midinote"], 72.0);
    assert_eq!(bundles[0].messages[0].params["amp"], 0.5);

    let chord: Vec<f32> = bundles[1].messages.iter().map(|m| m.params["midinote"]).collect();
    assert_eq!(chord, vec![60.0, 64.0, 67.0]);
    assert!(bundles[1].messages.iter().all(|m| m.params["amp"] == 1.0));
}

/// Samplers play buffers chosen by degree, backwards from the end for a
/// negative rate.
#[test]
fn test_sampler_voice() {
    let (mut engine, time, out) = offline(fast_settings(60.0));
    engine
        .assign("d1", "play", 3.0, &[("rate", Pattern::from(-1.0)), ("dur", Pattern::from(1.0))])
        .unwrap();
    play_until(&mut engine, &time, 4.0);

    let bundles = decoded(&out);
    assert_eq!(bundles.len(), 1);
    let params = &bundles[0].messages[0].params;
    assert_eq!(params["buf"], 3.0);
    assert_eq!(params["rate"], -1.0);
    assert_eq!(params["pos"], params["sus"]);
}

/// A generator used as `dur` is read at the voice's position: every value
/// it produces becomes one step, in order.
#[test]
fn test_generator_rhythm() {
    let (mut engine, time, out) = offline(fast_settings(60.0));
    engine
        .assign("p1", "pluck", 0.0, &[("dur", Pattern::from(pcycle(vec![0.5, 0.75])))])
        .unwrap();
    play_until(&mut engine, &time, 7.0);

    let origin = engine.clock().message_time(Beat::zero());
    let onsets: Vec<f64> = decoded(&out).iter().map(|b| b.timestamp - origin).collect();
    let expected = [4.0, 4.5, 5.25, 5.75, 6.5, 7.0];
    assert_eq!(onsets.len(), expected.len(), "{onsets:?}");
    for (onset, want) in onsets.iter().zip(expected) {
        assert!((onset - want).abs() < 1e-6, "{onsets:?}");
    }
}

/// With no latency, bundles are stamped with the beat's own time and still
/// sent.
#[test]
fn test_zero_latency() {
    let settings = Settings {
        latency: 0.0,
        ..fast_settings(60.0)
    };
    let (mut engine, time, out) = offline(settings);
    engine.assign("p1", "pluck", vec![0.0, 2.0], &[]).unwrap();
    play_until(&mut engine, &time, 6.0);

    let bundles = decoded(&out);
    assert_eq!(bundles.len(), 3);
    let expected = engine.clock().message_time(Beat::from(4));
    assert!((bundles[0].timestamp - expected).abs() < 1e-6);
}

/// Configuring one instrument leaves the built-in sampler in place.
#[test]
fn test_configured_instrument_keeps_sampler() {
    let settings = Settings::from_toml_str(
        r#"
        bpm = 60.0

        [instruments.pads]
        attack = 0.5
        "#,
    )
    .unwrap();
    let (mut engine, time, out) = offline(settings);
    engine.assign("d1", "play", 2.0, &[("dur", Pattern::from(1.0))]).unwrap();
    play_until(&mut engine, &time, 4.0);

    let bundles = decoded(&out);
    assert_eq!(bundles.len(), 1);
    assert_eq!(bundles[0].messages[0].params["buf"], 2.0);
}
