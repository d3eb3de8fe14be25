//! The driver thread that executes queue blocks in real time.
//!
//! The thread locks the engine, runs every due block, then sleeps until the
//! next block is due (capped at `max_wait`). Anything that changes the
//! queue from another thread wakes it so a nearer block is not missed.

use crate::engine::{panic_message, Engine};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Messages sent to the driver thread.
enum DriverMessage {
    /// Recompute the sleep: the queue changed.
    Wake,
    Stop,
}

/// Wakes a driver thread from anywhere. Cheap to clone.
#[derive(Clone)]
pub struct Waker(Sender<DriverMessage>);

impl Waker {
    pub fn wake(&self) {
        // A full channel already holds a wake-up.
        let _ = self.0.try_send(DriverMessage::Wake);
    }
}

/// Handle to control a running driver thread.
pub struct DriverHandle {
    sender: Sender<DriverMessage>,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl DriverHandle {
    /// Make the driver look at the queue again.
    pub fn wake(&self) {
        self.waker().wake();
    }

    pub fn waker(&self) -> Waker {
        Waker(self.sender.clone())
    }

    /// Stop the driver and wait for it to exit.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        let _ = self.sender.try_send(DriverMessage::Stop);
        if let Some(thread) = self.thread.take() {
            join_logged(thread, "driver");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl Drop for DriverHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Wait for `thread` to exit. Returns false, after logging, if it panicked.
pub(crate) fn join_logged(thread: JoinHandle<()>, name: &str) -> bool {
    match thread.join() {
        Ok(()) => true,
        Err(payload) => {
            warn!(thread = name, "thread panicked: {}", panic_message(payload.as_ref()));
            false
        }
    }
}

/// Lock the engine, recovering it if a previous holder panicked.
pub fn lock_engine(engine: &Mutex<Engine>) -> MutexGuard<'_, Engine> {
    engine.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Start a driver thread for `engine`. It never sleeps longer than
/// `max_wait` seconds at a time.
pub fn start_driver(engine: Arc<Mutex<Engine>>, max_wait: f64) -> DriverHandle {
    let (tx, rx) = bounded::<DriverMessage>(16);
    let running = Arc::new(AtomicBool::new(true));
    let running_clone = running.clone();
    let max_wait = Duration::from_secs_f64(max_wait.max(0.001));

    let thread = thread::spawn(move || {
        driver_loop(engine, rx, running_clone, max_wait);
    });

    DriverHandle {
        sender: tx,
        running,
        thread: Some(thread),
    }
}

fn driver_loop(
    engine: Arc<Mutex<Engine>>,
    rx: Receiver<DriverMessage>,
    running: Arc<AtomicBool>,
    max_wait: Duration,
) {
    info!("driver started");
    while running.load(Ordering::SeqCst) {
        let wait = {
            let mut engine = lock_engine(&engine);
            let executed = engine.dispatch_due();
            if executed > 0 {
                debug!(blocks = executed, "dispatched");
            }
            engine.seconds_until_next()
        };

        let wait = match wait {
            Some(seconds) => Duration::from_secs_f64(seconds).min(max_wait),
            None => max_wait,
        };
        match rx.recv_timeout(wait) {
            Ok(DriverMessage::Wake) | Err(RecvTimeoutError::Timeout) => {}
            Ok(DriverMessage::Stop) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    running.store(false, Ordering::SeqCst);
    info!("driver stopped");
}
