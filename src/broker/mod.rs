//! # Broker Components
//!
//! - [`registry`]: Ordered ring of registered tanks (no internal locking)
//! - [`middleware`]: The broker service: worker pool, liveness sweep,
//!   topology edits and handoff relaying

pub mod middleware;
pub mod registry;

pub use middleware::Broker;
pub use registry::{ClientRegistry, Departure, PeerRecord};
