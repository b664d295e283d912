//! # Transport
//!
//! Addressed, unreliable datagram messaging with no knowledge of ring
//! semantics.
//!
//! ## Modules
//!
//! - [`frame`]: JSON wire frames
//! - [`endpoint`]: Plain UDP endpoint
//! - [`secure`]: Key-exchange + AEAD wrapper around the UDP endpoint
//! - [`memory`]: In-process network used by tests and simulations
//!
//! ## Delivery
//!
//! `send` is fire-and-forget. The secure transport may answer
//! [`SendOutcome::Deferred`] when no key is agreed with the receiver yet; the
//! payload was not sent. Callers that need the payload to arrive use
//! [`deliver`], which retries a bounded number of times. Everything else in
//! the ring protocol self-heals through periodic traffic (registration
//! renewal, token circulation).

pub mod endpoint;
pub mod frame;
pub mod memory;
pub mod secure;

use anyhow::Result;
use async_trait::async_trait;
use log::warn;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::common::messages::{Envelope, Message};

pub use endpoint::Endpoint;
pub use memory::{MemoryEndpoint, MemoryNetwork};
pub use secure::SecureEndpoint;

/// Retries performed by [`deliver`] after a deferred first attempt.
pub const DELIVERY_ATTEMPTS: usize = 10;
/// Pause between [`deliver`] retries.
pub const DELIVERY_BACKOFF: Duration = Duration::from_millis(100);
/// Pause after a transient receive error before receiving again.
pub const RECEIVE_BACKOFF: Duration = Duration::from_millis(50);

/// Result of a single send attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// The payload went out (no delivery guarantee).
    Sent,
    /// The payload was held back; a key exchange went out instead.
    Deferred,
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Address peers see as our sender address.
    fn local_addr(&self) -> SocketAddr;

    async fn send(&self, receiver: SocketAddr, payload: &Message) -> Result<SendOutcome>;

    /// Wait until one application message arrives.
    async fn blocking_receive(&self) -> Result<Envelope>;

    /// Next queued application message, or `None` immediately.
    fn non_blocking_receive(&self) -> Result<Option<Envelope>>;

    /// True when a payload to `peer` would go out immediately.
    fn is_ready(&self, _peer: SocketAddr) -> bool {
        true
    }

    /// Start whatever handshake `peer` needs ahead of traffic.
    async fn prepare(&self, _peer: SocketAddr) -> Result<()> {
        Ok(())
    }

    /// True once receiving can never succeed again. Receive loops treat any
    /// other receive error as transient.
    fn is_closed(&self) -> bool {
        false
    }
}

/// Bind a UDP transport, optionally wrapped in the secure layer.
///
/// # Example
/// ```ignore
/// let transport = transport::bind(config.tank.bind_address, config.tank.secure).await?;
/// ```
pub async fn bind(addr: SocketAddr, secure: bool) -> Result<Arc<dyn Transport>> {
    let endpoint = Endpoint::bind(addr).await?;
    if secure {
        Ok(Arc::new(SecureEndpoint::new(endpoint)))
    } else {
        Ok(Arc::new(endpoint))
    }
}

/// Send `payload`, retrying in the background while the transport defers it.
///
/// Failures are logged and dropped.
pub async fn deliver(transport: &Arc<dyn Transport>, receiver: SocketAddr, payload: Message) {
    match transport.send(receiver, &payload).await {
        Ok(SendOutcome::Sent) => {}
        Ok(SendOutcome::Deferred) => {
            let transport = Arc::clone(transport);
            tokio::spawn(async move {
                for _ in 0..DELIVERY_ATTEMPTS {
                    tokio::time::sleep(DELIVERY_BACKOFF).await;
                    match transport.send(receiver, &payload).await {
                        Ok(SendOutcome::Sent) => return,
                        Ok(SendOutcome::Deferred) => continue,
                        Err(e) => {
                            warn!("⚠️  Failed to send {} to {}: {}", payload.kind(), receiver, e);
                            return;
                        }
                    }
                }
                warn!(
                    "⚠️  Gave up on {} to {}: no key agreed after {} attempts",
                    payload.kind(),
                    receiver,
                    DELIVERY_ATTEMPTS
                );
            });
        }
        Err(e) => warn!("⚠️  Failed to send {} to {}: {}", payload.kind(), receiver, e),
    }
}
