//! # Broker Middleware - Ring Directory Service
//!
//! The broker is the only component that edits the ring topology.
//!
//! ## Core Responsibilities
//!
//! ### 1. Registration
//! - Assigns ids (`tank<n>`, counter never reset) and appends new tanks at
//!   the ring tail
//! - Tells the two tanks around the insertion point about their new neighbor
//! - Grants the token to the first tank of an empty ring
//! - Treats a repeated RegisterRequest from a known address as lease renewal
//!
//! ### 2. Failure Detection
//! - A periodic sweep evicts at most one tank per tick whose last renewal is
//!   older than the liveness threshold, and relinks its former neighbors
//!
//! ### 3. Handoff Fallback
//! - Forwards a fish to the left or right neighbor of the sending tank when
//!   the tank does not know its neighbor's address
//!
//! ## Concurrency
//!
//! Incoming messages are handled concurrently by a bounded worker pool.
//! Registration, deregistration and eviction take the registry write lock;
//! handoff routing takes the read lock. Outbound messages caused by a
//! topology edit are sent while the write lock is still held, so two edits
//! never interleave their neighbor updates.
//!
//! ```text
//! Tank -> Broker  RegisterRequest
//! Broker -> Tank  RegisterResponse { id, left, right, lease }
//! Broker -> Left  NeighborUpdate { tank, Right }
//! Broker -> Right NeighborUpdate { tank, Left }
//! ```

use anyhow::Result;
use log::{debug, error, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{RwLock, Semaphore};
use tokio::task::JoinSet;

use super::registry::{ClientRegistry, Departure, PeerRecord};
use crate::common::config::BrokerConfig;
use crate::common::fish::FishModel;
use crate::common::messages::{Direction, Envelope, Message};
use crate::transport::{self, Transport};

/// Registry plus the id counter, guarded together.
#[derive(Debug, Default)]
struct BrokerState {
    clients: ClientRegistry,
    next_id: u64,
}

pub struct Broker {
    /// Configuration loaded from TOML file
    config: BrokerConfig,

    /// Datagram transport the broker listens on
    transport: Arc<dyn Transport>,

    /// The ring. Writers: register, deregister, sweep. Readers: handoff routing.
    state: Arc<RwLock<BrokerState>>,

    /// Bounds the number of messages handled at once
    workers: Arc<Semaphore>,
}

impl Broker {
    /// Create a broker serving on `transport`.
    ///
    /// # Example
    /// ```ignore
    /// let transport = transport::bind(config.address, config.secure).await?;
    /// let broker = Broker::new(config, transport);
    /// broker.run().await?;
    /// ```
    pub fn new(config: BrokerConfig, transport: Arc<dyn Transport>) -> Self {
        let workers = Arc::new(Semaphore::new(config.worker_pool_size.max(1)));
        Self {
            config,
            transport,
            state: Arc::new(RwLock::new(BrokerState::default())),
            workers,
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.transport.local_addr()
    }

    /// Receive and dispatch messages until a Shutdown payload arrives.
    ///
    /// Receive errors are logged and skipped; only a closed transport stops
    /// the loop, and then `run` returns that error. On exit the sweep stops,
    /// in-flight workers get `shutdown_grace_ms` to finish and are aborted
    /// after that.
    pub async fn run(&self) -> Result<()> {
        info!(
            "🚀 Broker listening on {} (lease {:?})",
            self.local_addr(),
            self.config.lease_duration()
        );

        let sweeper = {
            let broker = self.clone_arc();
            tokio::spawn(async move { broker.sweep_loop().await })
        };

        let mut in_flight = JoinSet::new();
        let outcome = loop {
            let envelope = match self.transport.blocking_receive().await {
                Ok(envelope) => envelope,
                Err(e) if self.transport.is_closed() => {
                    error!("❌ Transport closed, stopping: {}", e);
                    break Err(e);
                }
                Err(e) => {
                    warn!("⚠️  Receive failed: {}", e);
                    tokio::time::sleep(transport::RECEIVE_BACKOFF).await;
                    continue;
                }
            };

            if envelope.payload == Message::Shutdown {
                info!("🛑 Shutdown requested by {}", envelope.sender);
                break Ok(());
            }

            let permit = match Arc::clone(&self.workers).acquire_owned().await {
                Ok(permit) => permit,
                Err(e) => break Err(e.into()),
            };
            let broker = self.clone_arc();
            in_flight.spawn(async move {
                broker.handle_message(envelope).await;
                drop(permit);
            });

            // Reap finished workers so the set does not grow without bound
            while let Some(result) = in_flight.try_join_next() {
                if let Err(e) = result {
                    error!("❌ Worker task failed: {}", e);
                }
            }
        };

        sweeper.abort();

        let grace = self.config.shutdown_grace();
        let drained = tokio::time::timeout(grace, async {
            while in_flight.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                "⚠️  {} workers still busy after {:?}, aborting them",
                in_flight.len(),
                grace
            );
            in_flight.abort_all();
            while in_flight.join_next().await.is_some() {}
        }

        info!("👋 Broker stopped");
        outcome
    }

    // ========================================================================
    // MESSAGE HANDLING
    // ========================================================================

    /// Handle one incoming message.
    ///
    /// ## Message Types
    ///
    /// - **RegisterRequest**: register a new tank or renew a known one
    /// - **DeregisterRequest**: remove the tank and relink its neighbors
    /// - **HandoffRequest**: forward the fish to the sender's neighbor
    ///
    /// Everything else is tank-to-tank traffic and is ignored here.
    pub async fn handle_message(&self, envelope: Envelope) {
        let Envelope { payload, sender } = envelope;
        match payload {
            Message::RegisterRequest => self.register(sender).await,
            Message::DeregisterRequest { id } => self.deregister(&id).await,
            Message::HandoffRequest { fish } => self.route_handoff(sender, fish).await,
            Message::Shutdown => debug!("Shutdown from {} reached a worker, ignoring", sender),
            other @ (Message::RegisterResponse { .. }
            | Message::NeighborUpdate { .. }
            | Message::Token
            | Message::SnapshotMarker { .. }
            | Message::SnapshotToken { .. }
            | Message::LocationRequest { .. }) => {
                debug!("Ignoring {} from {}", other.kind(), sender)
            }
        }
    }

    async fn register(&self, sender: SocketAddr) {
        let lease_duration_ms = self.config.lease_duration_ms;
        let mut state = self.state.write().await;

        if let Some(index) = state.clients.index_of_address(sender) {
            state.clients.touch(index);
            let id = state
                .clients
                .get(index)
                .map(|record| record.id.clone())
                .unwrap_or_default();
            debug!("🔁 Lease of {} ({}) renewed", id, sender);

            let response = Message::RegisterResponse {
                id,
                left_neighbor: state.clients.left_neighbor_of(index),
                right_neighbor: state.clients.right_neighbor_of(index),
                lease_duration_ms,
            };
            self.send(sender, response).await;
            return;
        }

        let was_empty = state.clients.is_empty();
        let id = format!("tank{}", state.next_id);
        state.next_id += 1;

        let index = state.clients.add(id.clone(), sender);
        let left = state.clients.left_neighbor_of(index);
        let right = state.clients.right_neighbor_of(index);

        info!(
            "✅ Registered {} at {} (ring size {})",
            id,
            sender,
            state.clients.size()
        );

        self.send(
            sender,
            Message::RegisterResponse {
                id: id.clone(),
                left_neighbor: left,
                right_neighbor: right,
                lease_duration_ms,
            },
        )
        .await;

        if was_empty {
            info!("🎟️  Granting the token to {}", id);
            self.send(sender, Message::Token).await;
        } else {
            self.send(
                left,
                Message::NeighborUpdate {
                    address: sender,
                    direction: Direction::Right,
                },
            )
            .await;
            self.send(
                right,
                Message::NeighborUpdate {
                    address: sender,
                    direction: Direction::Left,
                },
            )
            .await;
        }
    }

    async fn deregister(&self, id: &str) {
        let mut state = self.state.write().await;
        let Some(index) = state.clients.index_of_id(id) else {
            debug!("Deregister for unknown id {}, ignoring", id);
            return;
        };

        let departure = state.clients.remove(index);
        info!(
            "👋 {} left the ring (ring size {})",
            departure.record.id,
            state.clients.size()
        );
        self.relink(&departure).await;
    }

    async fn route_handoff(&self, sender: SocketAddr, fish: FishModel) {
        let state = self.state.read().await;
        let Some(index) = state.clients.index_of_address(sender) else {
            debug!("Handoff from unregistered {}, dropping {}", sender, fish.id);
            return;
        };

        let target = match fish.direction {
            Direction::Left => state.clients.left_neighbor_of(index),
            Direction::Right => state.clients.right_neighbor_of(index),
        };
        debug!("🐟 Relaying {} from {} to {}", fish.id, sender, target);
        self.send(target, Message::HandoffRequest { fish }).await;
    }

    /// Point the two former neighbors of a departed tank at each other.
    /// Caller holds the write lock.
    async fn relink(&self, departure: &Departure) {
        let (Some(left), Some(right)) = (departure.left, departure.right) else {
            info!("🫙 Ring is empty");
            return;
        };

        self.send(
            left,
            Message::NeighborUpdate {
                address: right,
                direction: Direction::Right,
            },
        )
        .await;
        self.send(
            right,
            Message::NeighborUpdate {
                address: left,
                direction: Direction::Left,
            },
        )
        .await;
    }

    async fn send(&self, receiver: SocketAddr, payload: Message) {
        transport::deliver(&self.transport, receiver, payload).await;
    }

    // ========================================================================
    // LIVENESS SWEEP
    // ========================================================================

    async fn sweep_loop(&self) {
        let mut ticker = tokio::time::interval(self.config.sweep_interval());
        loop {
            ticker.tick().await;
            self.sweep_once().await;
        }
    }

    /// Evict at most one stale tank. Returns the evicted record.
    pub async fn sweep_once(&self) -> Option<PeerRecord> {
        let mut state = self.state.write().await;
        let departure = state
            .clients
            .evict_stale_since(self.config.liveness_threshold())?;

        warn!(
            "💀 Evicted {} ({}): no renewal within {:?}",
            departure.record.id,
            departure.record.address,
            self.config.liveness_threshold()
        );
        self.relink(&departure).await;
        Some(departure.record)
    }

    /// Snapshot of the ring in order.
    pub async fn ring_view(&self) -> Vec<PeerRecord> {
        self.state.read().await.clients.iter().cloned().collect()
    }

    /// Helper to clone Arc references for spawning tasks.
    fn clone_arc(&self) -> Arc<Self> {
        Arc::new(Self {
            config: self.config.clone(),
            transport: Arc::clone(&self.transport),
            state: Arc::clone(&self.state),
            workers: Arc::clone(&self.workers),
        })
    }
}
