//! # Tank Model - Node-side Ring Protocol
//!
//! One tank's view of the ring and everything it owns:
//!
//! - **Registration**: id, neighbors and lease from the broker; periodic
//!   renewal at half the lease
//! - **Neighbors**: left/right addresses pushed by the broker
//! - **Token**: held for a fixed dwell time, then passed to the right
//! - **Handoff**: a fish touching an edge crosses to the neighbor while the
//!   token is held, and turns around otherwise
//! - **Forwarding references**: last known direction of every fish this tank
//!   ever hosted, used by [`TankModel::locate_fish_globally`]
//! - **Snapshot**: the [`SnapshotState`] machine plus the sends it asks for
//!
//! All state sits behind one `tokio::sync::Mutex`. Messages caused by a state
//! change are sent while the lock is held, so what this tank sends to one
//! neighbor leaves in the order the changes happened (a handoff sent before a
//! marker is never overtaken by it).
//!
//! ## Location is best effort
//!
//! A location query follows forwarding references from tank to tank. The
//! references are hints that are never cleaned up; a fish that keeps moving
//! can be chased indefinitely and a query may end at a tank that reports
//! "not found" although the fish exists elsewhere.

use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::snapshot::{SnapshotAction, SnapshotState};
use crate::common::config::TankConfig;
use crate::common::fish::{FishModel, FISH_HEIGHT, FISH_WIDTH, HEIGHT, WIDTH};
use crate::common::messages::{Direction, Envelope, FishLocation, Message};
use crate::transport::{self, SendOutcome, Transport, DELIVERY_BACKOFF};

/// Capacity of the observer channel. Slow observers skip events.
const EVENT_CAPACITY: usize = 256;

/// Notifications for the rendering layer.
#[derive(Debug, Clone, PartialEq)]
pub enum TankEvent {
    /// First RegisterResponse received
    Registered { id: String },
    /// Fish moved, arrived or left
    Updated,
    /// Token acquired (`true`) or passed on (`false`)
    TokenChanged(bool),
    /// A location query ended here
    FishLocated { fish_id: String, found: bool },
    /// This tank initiated a snapshot and the total came back
    SnapshotCompleted { total: u64 },
}

// ============================================================================
// TANK STATE
// ============================================================================

struct TankState {
    id: Option<String>,
    left: Option<SocketAddr>,
    right: Option<SocketAddr>,
    lease: Option<Duration>,

    has_token: bool,
    /// Bumped on every token receipt; a dwell timer only passes the token
    /// if the epoch it was armed with is still current.
    token_epoch: u64,

    fishies: Vec<FishModel>,
    fish_counter: u64,
    forwarding: HashMap<String, FishLocation>,

    snapshot: SnapshotState,

    renewal: Option<JoinHandle<()>>,
    closed: bool,
    rng: StdRng,
}

impl TankState {
    fn new() -> Self {
        Self {
            id: None,
            left: None,
            right: None,
            lease: None,
            has_token: false,
            token_epoch: 0,
            fishies: Vec::new(),
            fish_counter: 0,
            forwarding: HashMap::new(),
            snapshot: SnapshotState::new(),
            renewal: None,
            closed: false,
            rng: StdRng::from_entropy(),
        }
    }

    fn neighbor(&self, side: Direction) -> Option<SocketAddr> {
        match side {
            Direction::Left => self.left,
            Direction::Right => self.right,
        }
    }

    /// Side a message came in on. The sender address decides unless both
    /// neighbors are the same tank (rings of one or two) or the sender is not
    /// a neighbor at all (broker relay); then the travel direction decides.
    fn channel_of(&self, sender: SocketAddr, travel: Direction) -> Direction {
        let from_left = self.left == Some(sender);
        let from_right = self.right == Some(sender);
        match (from_left, from_right) {
            (true, false) => Direction::Left,
            (false, true) => Direction::Right,
            _ => travel.reverse(),
        }
    }

    /// Fish currently owned here. Departing fish are in flight.
    fn local_count(&self) -> u64 {
        self.fishies.iter().filter(|f| f.is_swimming()).count() as u64
    }
}

// ============================================================================
// TANK MODEL
// ============================================================================

pub struct TankModel {
    config: TankConfig,
    broker: SocketAddr,
    transport: Arc<dyn Transport>,
    state: Arc<Mutex<TankState>>,
    events: broadcast::Sender<TankEvent>,
}

impl TankModel {
    /// Create a tank talking to the broker at `config.broker_address`.
    ///
    /// # Example
    /// ```ignore
    /// let transport = transport::bind(config.bind_address, config.secure).await?;
    /// let model = Arc::new(TankModel::new(config, transport));
    /// ```
    pub fn new(config: TankConfig, transport: Arc<dyn Transport>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            broker: config.broker_address,
            config,
            transport,
            state: Arc::new(Mutex::new(TankState::new())),
            events,
        }
    }

    pub fn transport(&self) -> Arc<dyn Transport> {
        Arc::clone(&self.transport)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.transport.local_addr()
    }

    /// Subscribe to state changes.
    pub fn subscribe(&self) -> broadcast::Receiver<TankEvent> {
        self.events.subscribe()
    }

    fn notify(&self, event: TankEvent) {
        // No observers is fine.
        let _ = self.events.send(event);
    }

    // ========================================================================
    // READERS
    // ========================================================================

    pub async fn id(&self) -> Option<String> {
        self.state.lock().await.id.clone()
    }

    pub async fn is_registered(&self) -> bool {
        self.state.lock().await.id.is_some()
    }

    pub async fn has_token(&self) -> bool {
        self.state.lock().await.has_token
    }

    pub async fn fishies(&self) -> Vec<FishModel> {
        self.state.lock().await.fishies.clone()
    }

    /// `(left, right)` neighbor addresses.
    pub async fn neighbors(&self) -> (Option<SocketAddr>, Option<SocketAddr>) {
        let state = self.state.lock().await;
        (state.left, state.right)
    }

    pub async fn forwarding_reference(&self, fish_id: &str) -> Option<FishLocation> {
        self.state.lock().await.forwarding.get(fish_id).copied()
    }

    // ========================================================================
    // DISPATCH
    // ========================================================================

    /// Apply one incoming message. Returns `false` on Shutdown.
    pub async fn dispatch(&self, envelope: Envelope) -> bool {
        let Envelope { payload, sender } = envelope;
        match payload {
            Message::RegisterResponse {
                id,
                left_neighbor,
                right_neighbor,
                lease_duration_ms,
            } => {
                self.on_registration(id, left_neighbor, right_neighbor, lease_duration_ms)
                    .await
            }
            Message::NeighborUpdate { address, direction } => {
                self.on_neighbor_update(address, direction).await
            }
            Message::HandoffRequest { fish } => self.receive_fish(sender, fish).await,
            Message::Token => self.receive_token().await,
            Message::SnapshotMarker { round, direction } => {
                self.on_snapshot_marker(sender, round, direction).await
            }
            Message::SnapshotToken {
                round,
                count,
                is_initiator,
            } => self.on_snapshot_token(round, count, is_initiator).await,
            Message::LocationRequest { fish_id } => self.resolve_location(&fish_id).await,
            Message::Shutdown => {
                info!("🛑 Shutdown requested by {}", sender);
                return false;
            }
            other @ (Message::RegisterRequest | Message::DeregisterRequest { .. }) => {
                debug!("Ignoring broker-bound {} from {}", other.kind(), sender)
            }
        }
        true
    }

    // ========================================================================
    // REGISTRATION & NEIGHBORS
    // ========================================================================

    /// Ask the broker to register (or renew) this tank.
    pub async fn request_registration(&self) {
        transport::deliver(&self.transport, self.broker, Message::RegisterRequest).await;
    }

    async fn on_registration(
        &self,
        id: String,
        left: SocketAddr,
        right: SocketAddr,
        lease_duration_ms: u64,
    ) {
        let mut state = self.state.lock().await;
        let first = state.id.is_none();

        if let Some(previous) = state.id.as_deref() {
            if previous != id {
                warn!("⚠️  Broker re-registered us as {} (was {})", id, previous);
            }
        }

        state.id = Some(id.clone());
        state.left = Some(left);
        state.right = Some(right);
        state.lease = Some(Duration::from_millis(lease_duration_ms));

        if !first {
            debug!("🔁 Lease renewed for {}", id);
            return;
        }

        info!(
            "✅ Registered as {} (left {}, right {}, lease {} ms)",
            id, left, right, lease_duration_ms
        );

        let y = state.rng.gen_range(0..=HEIGHT - FISH_HEIGHT);
        self.new_fish_locked(&mut state, WIDTH - FISH_WIDTH, y);

        let period = Duration::from_millis((lease_duration_ms / 2).max(1));
        state.renewal = Some(self.spawn_renewal(period));
        drop(state);

        for neighbor in [left, right] {
            self.prepare(neighbor).await;
        }
        self.notify(TankEvent::Registered { id });
        self.notify(TankEvent::Updated);
    }

    fn spawn_renewal(&self, period: Duration) -> JoinHandle<()> {
        let model = self.clone_arc();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The first tick completes immediately; registration just happened.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                model.request_registration().await;
            }
        })
    }

    async fn on_neighbor_update(&self, address: SocketAddr, direction: Direction) {
        {
            let mut state = self.state.lock().await;
            match direction {
                Direction::Left => state.left = Some(address),
                Direction::Right => state.right = Some(address),
            }
        }
        info!("🔗 New {} neighbor: {}", direction, address);
        self.prepare(address).await;
        self.notify(TankEvent::Updated);
    }

    /// Start a key exchange with `peer` ahead of ring traffic.
    async fn prepare(&self, peer: SocketAddr) {
        if peer == self.local_addr() {
            return;
        }
        if let Err(e) = self.transport.prepare(peer).await {
            warn!("⚠️  Could not prepare transport to {}: {}", peer, e);
        }
    }

    // ========================================================================
    // FISH
    // ========================================================================

    /// Create a fish at `(x, y)` with a random heading.
    ///
    /// # Returns
    /// - `Some(fish_id)`: The fish now swims here
    /// - `None`: Not registered yet, or the tank is full
    pub async fn new_fish(&self, x: i32, y: i32) -> Option<String> {
        let mut state = self.state.lock().await;
        let fish_id = self.new_fish_locked(&mut state, x, y)?;
        drop(state);
        self.notify(TankEvent::Updated);
        Some(fish_id)
    }

    fn new_fish_locked(&self, state: &mut TankState, x: i32, y: i32) -> Option<String> {
        let tank_id = state.id.clone()?;
        if state.local_count() as usize >= self.config.max_fishies {
            debug!("Tank {} is full, not creating a fish", tank_id);
            return None;
        }

        let fish_id = format!("fish{}@{}", state.fish_counter, tank_id);
        state.fish_counter += 1;

        let fish = FishModel::spawn(fish_id.clone(), x, y);
        info!("🐠 New {} heading {}", fish_id, fish.direction);
        state.fishies.push(fish);
        state.forwarding.insert(fish_id.clone(), FishLocation::Here);
        Some(fish_id)
    }

    async fn receive_fish(&self, sender: SocketAddr, mut fish: FishModel) {
        let mut state = self.state.lock().await;
        let channel = state.channel_of(sender, fish.direction);
        state.snapshot.record_arrival(channel);

        debug!("🐟 {} arrived from the {}", fish.id, channel);
        fish.set_to_start();
        state.forwarding.insert(fish.id.clone(), FishLocation::Here);
        state.fishies.push(fish);
        drop(state);
        self.notify(TankEvent::Updated);
    }

    /// Advance the simulation by one tick.
    ///
    /// A fish that reaches an edge crosses to the neighbor on that side when
    /// the token is held; otherwise it turns around.
    pub async fn update(&self) {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        if state.closed {
            return;
        }

        for fish in state.fishies.iter_mut() {
            fish.update(&mut state.rng);
        }

        let at_edge: Vec<usize> = state
            .fishies
            .iter()
            .enumerate()
            .filter(|(_, fish)| fish.hits_edge())
            .map(|(index, _)| index)
            .collect();

        for index in at_edge {
            if state.has_token {
                self.hand_off(state, index).await;
            } else {
                state.fishies[index].reverse();
            }
        }

        state.fishies.retain(|fish| !fish.disappeared());
        drop(guard);
        self.notify(TankEvent::Updated);
    }

    async fn hand_off(&self, state: &mut TankState, index: usize) {
        let fish = state.fishies[index].clone();
        let direction = fish.direction;
        let fish_id = fish.id.clone();
        let handoff = Message::HandoffRequest { fish };

        match state.neighbor(direction) {
            None => {
                debug!("No {} neighbor known, relaying {} via the broker", direction, fish_id);
                transport::deliver(&self.transport, self.broker, handoff).await;
            }
            Some(neighbor) if !self.transport.is_ready(neighbor) => {
                debug!("Transport to {} not ready, {} turns around", neighbor, fish_id);
                state.fishies[index].reverse();
                self.prepare(neighbor).await;
                return;
            }
            Some(neighbor) => match self.transport.send(neighbor, &handoff).await {
                Ok(SendOutcome::Sent) => {}
                Ok(SendOutcome::Deferred) => {
                    state.fishies[index].reverse();
                    return;
                }
                Err(e) => {
                    warn!("⚠️  Handoff of {} to {} failed: {}", fish_id, neighbor, e);
                    state.fishies[index].reverse();
                    return;
                }
            },
        }

        info!("➡️  {} handed off to the {}", fish_id, direction);
        state.fishies[index].depart();
        state.forwarding.insert(fish_id, direction.into());
    }

    // ========================================================================
    // TOKEN
    // ========================================================================

    async fn receive_token(&self) {
        let epoch = {
            let mut state = self.state.lock().await;
            if state.closed {
                let right = state.right;
                match right {
                    Some(right) if right != self.local_addr() => {
                        info!("🎟️  Token arrived after leaving, forwarding to {}", right);
                        transport::deliver(&self.transport, right, Message::Token).await;
                    }
                    _ => warn!("⚠️  Token arrived after leaving and nobody is left to take it"),
                }
                return;
            }
            if state.has_token {
                warn!("⚠️  Received a token while already holding one");
            }
            state.has_token = true;
            state.token_epoch += 1;
            state.token_epoch
        };

        debug!("🎟️  Token received");
        self.notify(TankEvent::TokenChanged(true));
        self.schedule_pass(epoch, self.config.token_dwell());
    }

    fn schedule_pass(&self, epoch: u64, delay: Duration) {
        let model = self.clone_arc();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            model.pass_token(epoch).await;
        });
    }

    async fn pass_token(&self, epoch: u64) {
        let mut state = self.state.lock().await;
        if state.closed || !state.has_token || state.token_epoch != epoch {
            return;
        }

        let right = state.right;
        let Some(right) = right else {
            warn!("⚠️  No right neighbor known, token stays here for now");
            drop(state);
            self.schedule_pass(epoch, self.config.token_dwell());
            return;
        };

        // Released before the send so the receiver never overlaps with us.
        state.has_token = false;
        match self.transport.send(right, &Message::Token).await {
            Ok(SendOutcome::Sent) => {
                drop(state);
                debug!("🎟️  Token passed to {}", right);
                self.notify(TankEvent::TokenChanged(false));
            }
            Ok(SendOutcome::Deferred) => {
                state.has_token = true;
                drop(state);
                self.schedule_pass(epoch, DELIVERY_BACKOFF);
            }
            Err(e) => {
                warn!("⚠️  Passing the token to {} failed: {}", right, e);
                state.has_token = true;
                drop(state);
                self.schedule_pass(epoch, self.config.token_dwell());
            }
        }
    }

    // ========================================================================
    // LOCATION
    // ========================================================================

    /// Look for a fish anywhere in the ring, starting here.
    ///
    /// The query is resolved by whichever tank the forwarding references
    /// lead to; that tank publishes [`TankEvent::FishLocated`].
    pub async fn locate_fish_globally(&self, fish_id: &str) {
        self.resolve_location(fish_id).await;
    }

    async fn resolve_location(&self, fish_id: &str) {
        let mut state = self.state.lock().await;
        let hint = state.forwarding.get(fish_id).copied();

        let side = match hint {
            None | Some(FishLocation::Here) => {
                let found = match state
                    .fishies
                    .iter_mut()
                    .find(|fish| fish.id == fish_id && fish.is_swimming())
                {
                    Some(fish) => {
                        fish.toggle();
                        true
                    }
                    None => false,
                };
                drop(state);

                info!("🔎 Location of {}: {}", fish_id, if found { "here" } else { "not found" });
                self.notify(TankEvent::FishLocated {
                    fish_id: fish_id.to_string(),
                    found,
                });
                return;
            }
            Some(FishLocation::Left) => Direction::Left,
            Some(FishLocation::Right) => Direction::Right,
        };

        match state.neighbor(side) {
            Some(neighbor) => {
                debug!("🔎 Chasing {} to the {}", fish_id, side);
                let request = Message::LocationRequest {
                    fish_id: fish_id.to_string(),
                };
                transport::deliver(&self.transport, neighbor, request).await;
            }
            None => warn!("⚠️  {} went {} but that neighbor is unknown", fish_id, side),
        }
    }

    // ========================================================================
    // SNAPSHOT
    // ========================================================================

    /// Start a snapshot round here.
    ///
    /// Rounds have no timeout. A round whose markers are dropped never
    /// reports, and this tank refuses new rounds from then on. That happens
    /// when another tank's round already holds a neighbor (only one round
    /// runs in the ring at a time) or when the ring changes mid-round.
    ///
    /// # Returns
    /// - `Some(round)`: Markers are on their way
    /// - `None`: A round is already running here, or a neighbor is unknown
    pub async fn initiate_snapshot(&self) -> Option<Uuid> {
        let mut state = self.state.lock().await;
        if state.left.is_none() || state.right.is_none() {
            warn!("⚠️  Neighbors unknown, not starting a snapshot");
            return None;
        }
        let round = Uuid::new_v4();
        let count = state.local_count();
        let actions = state.snapshot.initiate(count, round);
        if actions.is_empty() {
            return None;
        }
        self.perform(&mut state, actions).await;
        Some(round)
    }

    async fn on_snapshot_marker(&self, sender: SocketAddr, round: Uuid, direction: Direction) {
        let mut state = self.state.lock().await;
        let channel = state.channel_of(sender, direction);
        let count = state.local_count();
        let actions = state.snapshot.on_marker(channel, round, count);
        self.perform(&mut state, actions).await;
    }

    async fn on_snapshot_token(&self, round: Uuid, count: u64, is_initiator: bool) {
        let mut state = self.state.lock().await;
        let actions = state.snapshot.on_token(round, count, is_initiator);
        self.perform(&mut state, actions).await;
    }

    async fn perform(&self, state: &mut TankState, actions: Vec<SnapshotAction>) {
        for action in actions {
            match action {
                SnapshotAction::SendMarkers { round } => {
                    for side in [Direction::Left, Direction::Right] {
                        let Some(neighbor) = state.neighbor(side) else {
                            warn!("⚠️  No {} neighbor for snapshot {}", side, round);
                            continue;
                        };
                        let marker = Message::SnapshotMarker {
                            round,
                            direction: side,
                        };
                        transport::deliver(&self.transport, neighbor, marker).await;
                    }
                }
                SnapshotAction::SendToken {
                    round,
                    count,
                    is_initiator,
                } => match state.neighbor(Direction::Left) {
                    Some(left) => {
                        let token = Message::SnapshotToken {
                            round,
                            count,
                            is_initiator,
                        };
                        transport::deliver(&self.transport, left, token).await;
                    }
                    None => warn!("⚠️  No left neighbor, snapshot {} is stuck", round),
                },
                SnapshotAction::Report { total, .. } => {
                    self.notify(TankEvent::SnapshotCompleted { total });
                }
            }
        }
    }

    // ========================================================================
    // LEAVE
    // ========================================================================

    /// Leave the ring gracefully: hand the token on if held, stop renewing
    /// and deregister. A token that still arrives afterwards is forwarded to
    /// the last known right neighbor.
    pub async fn finish(&self) {
        let mut state = self.state.lock().await;
        let mut gave_up_token = false;
        state.closed = true;
        if let Some(renewal) = state.renewal.take() {
            renewal.abort();
        }

        if state.has_token {
            let right = state.right;
            match right {
                Some(right) if right != self.local_addr() => {
                    info!("🎟️  Handing the token to {} before leaving", right);
                    transport::deliver(&self.transport, right, Message::Token).await;
                }
                _ => debug!("Last tank in the ring, the token leaves with us"),
            }
            state.has_token = false;
            gave_up_token = true;
        }

        if let Some(id) = state.id.clone() {
            info!("👋 {} deregistering", id);
            transport::deliver(&self.transport, self.broker, Message::DeregisterRequest { id })
                .await;
        }
        drop(state);

        if gave_up_token {
            self.notify(TankEvent::TokenChanged(false));
        }
    }

    /// Helper to clone Arc references for spawning tasks.
    fn clone_arc(&self) -> Arc<Self> {
        Arc::new(Self {
            config: self.config.clone(),
            broker: self.broker,
            transport: Arc::clone(&self.transport),
            state: Arc::clone(&self.state),
            events: self.events.clone(),
        })
    }
}
