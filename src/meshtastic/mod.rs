//! # Meshtastic Transport Seam
//!
//! The radio itself (serial bring-up, protobuf framing, reconnection) lives outside this
//! crate. What the delivery and transfer layers need from it is small:
//!
//! - a way to name nodes and destinations ([`Destination`], [`parse_node_id`], [`format_node_id`])
//! - one primitive to put text on the air ([`Transmitter::transmit`])
//! - a description of what arrived ([`InboundPacket`]) so presence can be tracked
//! - a control path for active reachability probes ([`ControlMessage::SendPing`])
//!
//! ## Queue-backed transmitter
//!
//! [`QueueTransmitter`] hands every text to a writer task over an unbounded channel, the
//! same way the device writer consumes [`OutgoingMessage`]s:
//!
//! ```rust,no_run
//! use meshrelay::meshtastic::{Destination, QueueTransmitter, Transmitter};
//!
//! let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
//! let transmitter = QueueTransmitter::new(tx);
//! transmitter.transmit("hello", 0, Destination::Node(0xa1b2c3d4), 1).unwrap();
//! let queued = rx.try_recv().unwrap();
//! assert_eq!(queued.to_node, Some(0xa1b2c3d4));
//! ```

use std::fmt;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

/// Broadcast address used by Meshtastic for channel traffic.
pub const BROADCAST_ADDR: u32 = 0xffff_ffff;

/// Where a text goes: a channel broadcast or a single node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Destination {
    Broadcast,
    Node(u32),
}

impl Destination {
    pub fn from_raw(raw: u32) -> Self {
        if raw == 0 || raw == BROADCAST_ADDR {
            Destination::Broadcast
        } else {
            Destination::Node(raw)
        }
    }

    pub fn node(&self) -> Option<u32> {
        match self {
            Destination::Broadcast => None,
            Destination::Node(id) => Some(*id),
        }
    }

    pub fn is_broadcast(&self) -> bool {
        matches!(self, Destination::Broadcast)
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Destination::Broadcast => write!(f, "^all"),
            Destination::Node(id) => write!(f, "{}", format_node_id(*id)),
        }
    }
}

/// Format a node number the way Meshtastic clients display it (`!a1b2c3d4`).
pub fn format_node_id(id: u32) -> String {
    format!("!{:08x}", id)
}

/// Parse a node id that is always hex: `!a1b2c3d4`, `0xa1b2c3d4`, or bare `a1b2c3d4`.
///
/// Filenames and config ids are written in hex, so an all-digit `1000` means `0x1000`.
pub fn parse_hex_node_id(s: &str) -> Option<u32> {
    let trimmed = s.trim();
    let hex = trimmed
        .strip_prefix('!')
        .or_else(|| trimmed.strip_prefix("0x"))
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    if hex.is_empty() || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    u32::from_str_radix(hex, 16).ok()
}

/// Parse a node id written as `!a1b2c3d4`, `0xA1B2C3D4`, bare hex, or decimal.
///
/// Bare strings are treated as hex when they contain a hex letter or are exactly
/// eight characters long (the width used in filenames and node labels).
pub fn parse_node_id(s: &str) -> Option<u32> {
    let trimmed = s.trim();
    if let Some(hex) = trimmed.strip_prefix('!') {
        return u32::from_str_radix(hex, 16).ok();
    }
    if let Some(hex) = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
    {
        return u32::from_str_radix(hex, 16).ok();
    }
    if trimmed.is_empty() || !trimmed.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    let looks_hex = trimmed.len() == 8 || trimmed.chars().any(|c| c.is_ascii_alphabetic());
    if looks_hex {
        u32::from_str_radix(trimmed, 16).ok()
    } else {
        trimmed.parse::<u32>().ok()
    }
}

/// Priority level for outgoing messages
#[derive(Debug, Clone)]
pub enum MessagePriority {
    High,   // Direct messages with want_ack for immediate transmission
    Normal, // Regular broadcasts
}

/// Outgoing message structure for the writer task
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    pub to_node: Option<u32>, // None for broadcast, Some(node_id) for direct
    pub channel: u32,         // Channel index (0 = primary)
    pub content: String,
    pub priority: MessagePriority,
    /// Radio interface index the message should leave on (1-based, as configured)
    pub interface: u8,
}

/// Failure of a single transmit call. Every variant is treated as transient by the
/// delivery layer; only the retry budget decides when to give up.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransmitError {
    #[error("radio link disconnected")]
    Disconnected,
    #[error("broken pipe: {0}")]
    BrokenPipe(String),
    #[error("transmit timed out")]
    Timeout,
    #[error("radio rejected packet: {0}")]
    Rejected(String),
}

impl TransmitError {
    /// Link-level failures that should prompt the interface owner to reconnect.
    pub fn needs_reconnect(&self) -> bool {
        matches!(self, TransmitError::Disconnected | TransmitError::BrokenPipe(_))
    }
}

/// The single "put text on the air" capability shared by chat replies, broadcasts
/// and FiMesh frames.
pub trait Transmitter: Send + Sync {
    fn transmit(
        &self,
        text: &str,
        channel: u32,
        destination: Destination,
        interface: u8,
    ) -> Result<(), TransmitError>;
}

/// Transmitter that enqueues onto the writer task's outgoing channel.
#[derive(Debug, Clone)]
pub struct QueueTransmitter {
    outgoing_tx: mpsc::UnboundedSender<OutgoingMessage>,
}

impl QueueTransmitter {
    pub fn new(outgoing_tx: mpsc::UnboundedSender<OutgoingMessage>) -> Self {
        Self { outgoing_tx }
    }
}

impl Transmitter for QueueTransmitter {
    fn transmit(
        &self,
        text: &str,
        channel: u32,
        destination: Destination,
        interface: u8,
    ) -> Result<(), TransmitError> {
        let priority = if destination.is_broadcast() {
            MessagePriority::Normal
        } else {
            MessagePriority::High
        };
        let msg = OutgoingMessage {
            to_node: destination.node(),
            channel,
            content: text.to_string(),
            priority,
            interface,
        };
        self.outgoing_tx
            .send(msg)
            .map_err(|_| TransmitError::Disconnected)
    }
}

/// What kind of packet was heard. Every kind counts as evidence that the sender is alive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacketKind {
    Text {
        channel: u32,
        to: Destination,
        text: String,
    },
    Telemetry,
    Position,
    Routing,
    NodeInfo,
}

impl PacketKind {
    pub fn label(&self) -> &'static str {
        match self {
            PacketKind::Text { .. } => "text",
            PacketKind::Telemetry => "telemetry",
            PacketKind::Position => "position",
            PacketKind::Routing => "routing",
            PacketKind::NodeInfo => "nodeinfo",
        }
    }
}

/// A decoded packet handed up by the radio reader.
#[derive(Debug, Clone)]
pub struct InboundPacket {
    pub from: u32,
    pub interface: u8,
    pub kind: PacketKind,
}

/// Control messages for coordinating with the radio writer
#[derive(Debug)]
pub enum ControlMessage {
    Shutdown,
    /// Send a ping to a node and notify on ACK/failure via response channel
    SendPing {
        to: u32,
        channel: u32,
        response_tx: oneshot::Sender<bool>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_common_node_id_spellings() {
        assert_eq!(parse_node_id("!a1b2c3d4"), Some(0xa1b2c3d4));
        assert_eq!(parse_node_id("0xA1B2C3D4"), Some(0xa1b2c3d4));
        assert_eq!(parse_node_id("a1b2c3d4"), Some(0xa1b2c3d4));
        assert_eq!(parse_node_id("0000beef"), Some(0xbeef));
        assert_eq!(parse_node_id("12345"), Some(12345));
        assert_eq!(parse_node_id("zzz"), None);
        assert_eq!(parse_node_id(""), None);
    }

    #[test]
    fn hex_only_parse_never_falls_back_to_decimal() {
        assert_eq!(parse_hex_node_id("1000"), Some(0x1000));
        assert_eq!(parse_hex_node_id("12345"), Some(0x12345));
        assert_eq!(parse_hex_node_id("!a1b2c3d4"), Some(0xa1b2c3d4));
        assert_eq!(parse_hex_node_id("0x00beef"), Some(0xbeef));
        assert_eq!(parse_hex_node_id("+12"), None);
        assert_eq!(parse_hex_node_id("!"), None);
        assert_eq!(parse_hex_node_id("123456789"), None);
    }

    #[test]
    fn formats_with_bang_prefix() {
        assert_eq!(format_node_id(0xbeef), "!0000beef");
        assert_eq!(Destination::Node(0xbeef).to_string(), "!0000beef");
        assert_eq!(Destination::from_raw(BROADCAST_ADDR), Destination::Broadcast);
        assert_eq!(Destination::from_raw(0), Destination::Broadcast);
    }

    #[test]
    fn queue_transmitter_reports_closed_channel() {
        let (tx, rx) = mpsc::unbounded_channel();
        let t = QueueTransmitter::new(tx);
        assert!(t.transmit("hi", 0, Destination::Broadcast, 1).is_ok());
        drop(rx);
        assert_eq!(
            t.transmit("hi", 0, Destination::Broadcast, 1),
            Err(TransmitError::Disconnected)
        );
    }
}
