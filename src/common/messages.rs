//! # Message Protocol
//!
//! Defines every payload exchanged in the tank ring:
//! - Broker membership (register, renew, deregister, neighbor updates)
//! - Ring traffic between tanks (fish handoff, token circulation)
//! - Distributed snapshot markers and the running-total token
//! - Best-effort fish location requests
//!
//! Messages are serialized to JSON and carried in a single UDP datagram. The
//! sender address is never part of the payload: the transport supplies it
//! and hands the pair up as an [`Envelope`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use uuid::Uuid;

use super::fish::FishModel;

// ============================================================================
// RING DIRECTIONS
// ============================================================================

/// One side of a tank in the ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Left,
    Right,
}

impl Direction {
    /// The opposite side.
    pub fn reverse(self) -> Self {
        match self {
            Direction::Left => Direction::Right,
            Direction::Right => Direction::Left,
        }
    }

    /// Horizontal step of one simulation tick.
    pub fn vector(self) -> i32 {
        match self {
            Direction::Left => -1,
            Direction::Right => 1,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Left => write!(f, "LEFT"),
            Direction::Right => write!(f, "RIGHT"),
        }
    }
}

/// Last known whereabouts of a fish, as seen by one tank.
///
/// This is a forwarding hint only. It is never removed and may point at a
/// neighbor the fish has long since left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FishLocation {
    Here,
    Left,
    Right,
}

impl From<Direction> for FishLocation {
    fn from(direction: Direction) -> Self {
        match direction {
            Direction::Left => FishLocation::Left,
            Direction::Right => FishLocation::Right,
        }
    }
}

// ============================================================================
// MESSAGE TYPES
// ============================================================================

/// Closed set of protocol payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    // ========== BROKER MEMBERSHIP ==========
    /// **Register Request**
    ///
    /// Sent by a tank to the broker on startup and again every half lease to
    /// renew. A request from an address the broker already knows is a renewal.
    RegisterRequest,

    /// **Register Response**
    ///
    /// Broker's answer to a registration or renewal.
    ///
    /// # Fields
    /// - `id`: Identifier assigned to the tank (`tank<n>`)
    /// - `left_neighbor` / `right_neighbor`: Current ring neighbors (the tank
    ///   itself when it is alone in the ring)
    /// - `lease_duration_ms`: How long the registration stays fresh
    RegisterResponse {
        id: String,
        left_neighbor: SocketAddr,
        right_neighbor: SocketAddr,
        lease_duration_ms: u64,
    },

    /// **Deregister Request**
    ///
    /// Graceful leave. Unknown ids are ignored.
    DeregisterRequest { id: String },

    /// **Neighbor Update**
    ///
    /// Pushed by the broker when the ring changes around a tank.
    ///
    /// # Fields
    /// - `address`: The new neighbor
    /// - `direction`: Which side of the receiving tank it sits on
    NeighborUpdate {
        address: SocketAddr,
        direction: Direction,
    },

    // ========== RING TRAFFIC ==========
    /// **Handoff Request**
    ///
    /// Transfers ownership of a fish to the receiving tank. Sent directly to a
    /// neighbor, or to the broker when the neighbor address is unknown.
    HandoffRequest { fish: FishModel },

    /// **Token**
    ///
    /// The single circulating capability that allows a tank to push fish
    /// across its boundary.
    Token,

    // ========== DISTRIBUTED SNAPSHOT ==========
    /// **Snapshot Marker**
    ///
    /// # Fields
    /// - `round`: Identifier chosen by the initiator
    /// - `direction`: Direction of travel (a marker travelling `Right`
    ///   arrives on the receiver's left channel)
    SnapshotMarker { round: Uuid, direction: Direction },

    /// **Snapshot Token**
    ///
    /// Running total that travels leftward once recording is done.
    ///
    /// # Fields
    /// - `round`: Identifier of the round being summed up
    /// - `count`: Sum of the contributions collected so far
    /// - `is_initiator`: Set on the hop launched by the round's initiator
    SnapshotToken {
        round: Uuid,
        count: u64,
        is_initiator: bool,
    },

    // ========== LOCATION ==========
    /// **Location Request**
    ///
    /// Asks the receiver to resolve a fish id, chasing its own forwarding
    /// reference if the fish is not here.
    LocationRequest { fish_id: String },

    // ========== CONTROL ==========
    /// **Shutdown**
    ///
    /// Stops the receiving process' main loop.
    Shutdown,
}

impl Message {
    // Convert a message to bytes so we can send it over the network
    pub fn to_bytes(&self) -> anyhow::Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    // Convert bytes received from network back into a Message
    pub fn from_bytes(bytes: &[u8]) -> anyhow::Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Short name used in log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::RegisterRequest => "RegisterRequest",
            Message::RegisterResponse { .. } => "RegisterResponse",
            Message::DeregisterRequest { .. } => "DeregisterRequest",
            Message::NeighborUpdate { .. } => "NeighborUpdate",
            Message::HandoffRequest { .. } => "HandoffRequest",
            Message::Token => "Token",
            Message::SnapshotMarker { .. } => "SnapshotMarker",
            Message::SnapshotToken { .. } => "SnapshotToken",
            Message::LocationRequest { .. } => "LocationRequest",
            Message::Shutdown => "Shutdown",
        }
    }
}

/// A received payload together with the address it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub payload: Message,
    pub sender: SocketAddr,
}

impl Envelope {
    pub fn new(payload: Message, sender: SocketAddr) -> Self {
        Self { payload, sender }
    }
}
