//! Tempo sharing between machines.
//!
//! A sync message is a JSON object with a `"sync"` header:
//!
//! ```json
//! {"sync": {"bpm_start_time": 1700000000.5, "bpm_start_beat": 16.0, "bpm": 120.0}}
//! ```
//!
//! `bpm_start_time` is the Unix time at which `bpm_start_beat` fell. `bpm` is
//! a number or a time var in its JSON form.

use crate::clock::Tempo;
use crate::engine::Engine;
use crate::error::TransportError;
use crate::scheduler::{join_logged, lock_engine, Waker};
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

/// How often the listener checks whether it should close.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A tempo and the point it is anchored to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncInfo {
    pub bpm_start_time: f64,
    pub bpm_start_beat: f64,
    pub bpm: Tempo,
}

#[derive(Serialize, Deserialize)]
struct SyncMessage {
    sync: SyncInfo,
}

pub fn encode_sync(info: &SyncInfo) -> Result<Vec<u8>, TransportError> {
    Ok(serde_json::to_vec(&SyncMessage { sync: info.clone() })?)
}

pub fn decode_sync(bytes: &[u8]) -> Result<SyncInfo, TransportError> {
    let message: SyncMessage = serde_json::from_slice(bytes)?;
    Ok(message.sync)
}

/// Send `info` to `target` from an ephemeral socket.
pub fn send_sync(info: &SyncInfo, target: &str) -> Result<(), TransportError> {
    let socket = UdpSocket::bind("0.0.0.0:0")?;
    socket.send_to(&encode_sync(info)?, target)?;
    debug!(target_addr = target, "tempo shared");
    Ok(())
}

/// Listens for sync messages and applies them to an engine.
pub struct TempoListener {
    addr: SocketAddr,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl TempoListener {
    /// Listen on `port` (0 picks a free one). `waker`, if given, is woken
    /// after every applied message.
    pub fn open(
        port: u16,
        engine: Arc<Mutex<Engine>>,
        waker: Option<Waker>,
    ) -> Result<Self, TransportError> {
        let socket = UdpSocket::bind(("0.0.0.0", port))?;
        socket.set_read_timeout(Some(POLL_INTERVAL))?;
        let addr = socket.local_addr()?;
        let running = Arc::new(AtomicBool::new(true));
        let running_clone = running.clone();

        let thread = thread::spawn(move || {
            listen(socket, engine, waker, running_clone);
        });
        info!(%addr, "tempo listener open");

        Ok(TempoListener {
            addr,
            running,
            thread: Some(thread),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn is_open(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stop listening and wait for the thread to exit.
    pub fn close(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            if join_logged(thread, "tempo listener") {
                info!(addr = %self.addr, "tempo listener closed");
            }
        }
    }
}

impl Drop for TempoListener {
    fn drop(&mut self) {
        self.close();
    }
}

fn listen(
    socket: UdpSocket,
    engine: Arc<Mutex<Engine>>,
    waker: Option<Waker>,
    running: Arc<AtomicBool>,
) {
    let mut buf = [0u8; 4096];
    while running.load(Ordering::SeqCst) {
        let (len, from) = match socket.recv_from(&mut buf) {
            Ok(received) => received,
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => continue,
            Err(e) => {
                warn!("tempo listener failed: {e}");
                break;
            }
        };
        let info = match decode_sync(&buf[..len]) {
            Ok(info) => info,
            Err(e) => {
                warn!(%from, "ignoring message: {e}");
                continue;
            }
        };
        if let Err(e) = lock_engine(&engine).apply_sync(&info) {
            warn!(%from, "rejected shared tempo: {e}");
            continue;
        }
        if let Some(waker) = &waker {
            waker.wake();
        }
    }
    running.store(false, Ordering::SeqCst);
}
