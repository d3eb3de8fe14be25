//! OSC output to a SuperCollider server.
//!
//! The engine never looks at wire bytes. It hands each compiled [`Message`]
//! to a [`BundleEncoder`] together with the message's timestamp, collects the
//! opaque results for one beat, asks the encoder to wrap them in a single
//! bundle and passes the bytes to a [`Transport`].

use crate::error::TransportError;
use rosc::{encoder, OscBundle, OscMessage, OscPacket, OscTime, OscType};
use std::collections::BTreeMap;
use std::net::UdpSocket;
use std::sync::{Arc, Mutex, PoisonError};

/// Seconds between the NTP epoch (1900) and the Unix epoch (1970).
const NTP_UNIX_OFFSET: f64 = 2_208_988_800.0;

/// One synth event ready for encoding.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub synth: String,
    pub params: BTreeMap<String, f64>,
}

impl Message {
    /// Offset from the block's timestamp, in beats.
    pub fn delay(&self) -> f64 {
        self.params.get("delay").copied().unwrap_or(0.0)
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.params.get(name).copied()
    }
}

/// An encoded message, opaque to everything but its encoder.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedMessage(OscPacket);

impl EncodedMessage {
    pub fn new(packet: OscPacket) -> Self {
        EncodedMessage(packet)
    }

    pub fn packet(&self) -> &OscPacket {
        &self.0
    }

    pub fn into_packet(self) -> OscPacket {
        self.0
    }
}

/// Turns messages into timestamped packets and packets into bundles.
pub trait BundleEncoder: Send {
    /// Encode one message due at `timestamp` (Unix seconds).
    fn encode(&self, message: &Message, timestamp: f64) -> Result<EncodedMessage, TransportError>;

    /// Wrap messages in one bundle due at `timestamp` and produce wire bytes.
    fn bundle(
        &self,
        timestamp: f64,
        messages: Vec<EncodedMessage>,
    ) -> Result<Vec<u8>, TransportError> {
        let packet = OscPacket::Bundle(OscBundle {
            timetag: osc_time(timestamp),
            content: messages.into_iter().map(EncodedMessage::into_packet).collect(),
        });
        encoder::encode(&packet).map_err(|e| TransportError::Encode(format!("{e:?}")))
    }
}

/// Encodes messages as scsynth `/s_new` commands.
///
/// Each message becomes a bundle of its own carrying its exact timestamp, so
/// delayed notes inside a beat's bundle still play late.
#[derive(Debug, Clone, Default)]
pub struct ScsynthEncoder;

impl ScsynthEncoder {
    pub fn new() -> Self {
        ScsynthEncoder
    }
}

impl BundleEncoder for ScsynthEncoder {
    fn encode(&self, message: &Message, timestamp: f64) -> Result<EncodedMessage, TransportError> {
        // synth name, node id (-1 = server picks), add action (head), target group
        let mut args = vec![
            OscType::String(message.synth.clone()),
            OscType::Int(-1),
            OscType::Int(0),
            OscType::Int(1),
        ];
        for (name, value) in &message.params {
            args.push(OscType::String(name.clone()));
            args.push(OscType::Float(*value as f32));
        }
        Ok(EncodedMessage(OscPacket::Bundle(OscBundle {
            timetag: osc_time(timestamp),
            content: vec![OscPacket::Message(OscMessage {
                addr: "/s_new".to_string(),
                args,
            })],
        })))
    }
}

/// Convert Unix seconds to an OSC (NTP) time tag.
pub fn osc_time(unix_seconds: f64) -> OscTime {
    let ntp = unix_seconds.max(0.0) + NTP_UNIX_OFFSET;
    let seconds = ntp.floor();
    let fractional = ((ntp - seconds) * 4_294_967_296.0) as u32;
    OscTime {
        seconds: seconds as u32,
        fractional,
    }
}

/// Convert an OSC time tag back to Unix seconds.
pub fn unix_time(time: OscTime) -> f64 {
    time.seconds as f64 + time.fractional as f64 / 4_294_967_296.0 - NTP_UNIX_OFFSET
}

// ============================================================================
// Transports
// ============================================================================

/// Delivers encoded bundles.
pub trait Transport: Send {
    fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError>;
}

/// Sends bundles over UDP.
pub struct UdpTransport {
    socket: UdpSocket,
    target: String,
}

impl UdpTransport {
    /// Bind an ephemeral local port and target `target` (`host:port`).
    pub fn new(target: &str) -> Result<Self, TransportError> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        Ok(UdpTransport {
            socket,
            target: target.to_string(),
        })
    }

    /// Target a local scsynth on its default port.
    pub fn scsynth() -> Result<Self, TransportError> {
        Self::new(&format!("127.0.0.1:{}", crate::config::SCSYNTH_PORT))
    }

    pub fn target(&self) -> &str {
        &self.target
    }
}

impl Transport for UdpTransport {
    fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.socket.send_to(bytes, &self.target)?;
        Ok(())
    }
}

/// Keeps every bundle in memory. Clones share the same buffer.
#[derive(Debug, Clone, Default)]
pub struct MemoryTransport {
    sent: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// All bundles sent so far.
    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Remove and return all bundles sent so far.
    pub fn take(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut *self.sent.lock().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn len(&self) -> usize {
        self.sent.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Transport for MemoryTransport {
    fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(bytes.to_vec());
        Ok(())
    }
}

/// A decoded `/s_new` message: synth name, parameters and timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedMessage {
    pub synth: String,
    pub params: BTreeMap<String, f32>,
    pub timestamp: f64,
}

/// A decoded bundle as produced by [`ScsynthEncoder`].
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedBundle {
    pub timestamp: f64,
    pub messages: Vec<DecodedMessage>,
}

/// Decode bytes produced by [`ScsynthEncoder`] and [`BundleEncoder::bundle`].
pub fn decode_bundle(bytes: &[u8]) -> Result<DecodedBundle, TransportError> {
    let (_, packet) =
        rosc::decoder::decode_udp(bytes).map_err(|e| TransportError::Encode(format!("{e:?}")))?;
    let OscPacket::Bundle(outer) = packet else {
        return Err(TransportError::Encode("expected a bundle".to_string()));
    };
    let mut messages = Vec::new();
    for inner in outer.content {
        let (timestamp, message) = match inner {
            OscPacket::Bundle(b) => {
                let ts = unix_time(b.timetag);
                match b.content.into_iter().next() {
                    Some(OscPacket::Message(m)) => (ts, m),
                    _ => continue,
                }
            }
            OscPacket::Message(m) => (unix_time(outer.timetag), m),
        };
        messages.push(decode_s_new(message, timestamp));
    }
    Ok(DecodedBundle {
        timestamp: unix_time(outer.timetag),
        messages,
    })
}

fn decode_s_new(message: OscMessage, timestamp: f64) -> DecodedMessage {
    let mut args = message.args.into_iter();
    let synth = match args.next() {
        Some(OscType::String(s)) => s,
        _ => String::new(),
    };
    let mut params = BTreeMap::new();
    let rest: Vec<OscType> = args.skip(3).collect();
    for pair in rest.chunks(2) {
        if let [OscType::String(name), OscType::Float(value)] = pair {
            params.insert(name.clone(), *value);
        }
    }
    DecodedMessage {
        synth,
        params,
        timestamp,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(synth: &str, pairs: &[(&str, f64)]) -> Message {
        Message {
            synth: synth.to_string(),
            params: pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
        }
    }

    #[test]
    fn test_osc_time_round_trip() {
        let t = 1_700_000_000.25;
        let tag = osc_time(t);
        assert_eq!(tag.seconds, (1_700_000_000.0 + NTP_UNIX_OFFSET) as u32);
        assert_eq!(tag.fractional, 1 << 30);
        assert!((unix_time(tag) - t).abs() < 1e-6);
    }

    #[test]
    fn test_s_new_arguments() {
        let encoded = ScsynthEncoder
            .encode(&message("pads", &[("amp", 0.5), ("freq", 440.0)]), 10.0)
            .unwrap();
        let OscPacket::Bundle(bundle) = encoded.packet() else {
            panic!("expected bundle");
        };
        let OscPacket::Message(m) = &bundle.content[0] else {
            panic!("expected message");
        };
        assert_eq!(m.addr, "/s_new");
        assert_eq!(m.args[0], OscType::String("pads".to_string()));
        assert_eq!(m.args[1], OscType::Int(-1));
        assert_eq!(m.args[4], OscType::String("amp".to_string()));
        assert_eq!(m.args[5], OscType::Float(0.5));
    }

    #[test]
    fn test_bundle_decodes() {
        let encoder = ScsynthEncoder::new();
        let messages = vec![
            encoder.encode(&message("a", &[("amp", 1.0)]), 100.0).unwrap(),
            encoder.encode(&message("b", &[("amp", 0.5)]), 100.5).unwrap(),
        ];
        let bytes = encoder.bundle(100.0, messages).unwrap();
        let decoded = decode_bundle(&bytes).unwrap();
        assert!((decoded.timestamp - 100.0).abs() < 1e-6);
        assert_eq!(decoded.messages.len(), 2);
        assert_eq!(decoded.messages[0].synth, "a");
        assert_eq!(decoded.messages[1].params["amp"], 0.5);
        assert!((decoded.messages[1].timestamp - 100.5).abs() < 1e-6);
    }

    #[test]
    fn test_memory_transport_shares_buffer() {
        let transport = MemoryTransport::new();
        let mut handle = transport.clone();
        handle.send(&[1, 2, 3]).unwrap();
        assert_eq!(transport.len(), 1);
        assert_eq!(transport.take(), vec![vec![1, 2, 3]]);
        assert!(transport.is_empty());
    }

    #[test]
    fn test_message_delay_defaults_to_zero() {
        assert_eq!(message("a", &[]).delay(), 0.0);
        assert_eq!(message("a", &[("delay", 0.5)]).delay(), 0.5);
    }
}
