//! # Tank Ring
//!
//! A ring of peer "tanks" coordinated by a central broker. The broker keeps
//! the ring topology, evicts tanks that stop renewing their lease and relays
//! handoffs for tanks that do not know a neighbor yet. On top of the ring,
//! tanks pass a token that gates moving fish across tank boundaries, chase
//! fish through forwarding references, and count every fish in the ring
//! with a Chandy-Lamport snapshot.
//!
//! ## Modules
//!
//! - [`common`]: Messages, fish model, configuration, logging
//! - [`transport`]: Datagram transport, optional encryption, in-memory network
//! - [`broker`]: Client registry and the broker service
//! - [`tank`]: Node-side ring protocol, snapshot state machine, middleware

pub mod broker;
pub mod common;
pub mod tank;
pub mod transport;

pub use broker::Broker;
pub use common::messages::Message;
pub use tank::{TankMiddleware, TankModel};
