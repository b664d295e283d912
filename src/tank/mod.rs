//! # Tank Components
//!
//! ## Ring Protocol ([`model`])
//! Neighbor tracking, token circulation, fish handoff, forwarding references
//! and the snapshot wiring, all under one lock.
//!
//! ## Snapshot ([`snapshot`])
//! Pure Chandy-Lamport state machine for the two ring channels.
//!
//! ## Tank Middleware ([`middleware`])
//! Receiver loop, simulation ticks and registration retries.

pub mod middleware;
pub mod model;
pub mod snapshot;

// Re-export for convenience
pub use middleware::TankMiddleware;
pub use model::{TankEvent, TankModel};
pub use snapshot::{RecordingMode, SnapshotAction, SnapshotState};
