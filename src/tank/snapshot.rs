//! # Distributed Snapshot
//!
//! Chandy-Lamport marker algorithm specialised to a ring: every tank has
//! exactly two incoming channels (left and right) and the recorded quantity
//! is a single fish count.
//!
//! ## Round
//!
//! 1. The initiator records its local count and sends a marker both ways.
//! 2. A tank seeing its first marker records its local count, closes the
//!    channel the marker came from, keeps recording the other one and sends
//!    markers both ways.
//! 3. Fish arriving on a channel that is still being recorded are counted as
//!    in transit on that channel.
//! 4. A marker on the second channel closes it; the tank is finished.
//! 5. The finished initiator launches a running-total token leftward with
//!    `count = 0`. Each finished tank adds its contribution
//!    (`local + in transit left + in transit right`) and passes it on; an
//!    unfinished tank holds the token until it is finished.
//! 6. The token returns to the initiator, which adds its own contribution
//!    and reports the total.
//!
//! Every contribution is added exactly once, so the reported total equals
//! the number of fish in the ring, including those mid-handoff when the
//! round started. There is no timeout: a round broken by a topology change
//! never reports.
//!
//! [`SnapshotState`] does no I/O. It returns [`SnapshotAction`]s that the
//! tank performs while still holding its lock.

use log::{debug, info, warn};
use uuid::Uuid;

use crate::common::messages::Direction;

/// Which incoming channels are still being recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecordingMode {
    #[default]
    Idle,
    Left,
    Right,
    Both,
}

/// Side effects requested by the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotAction {
    /// Send a marker to both neighbors.
    SendMarkers { round: Uuid },
    /// Send the running total to the left neighbor.
    SendToken {
        round: Uuid,
        count: u64,
        is_initiator: bool,
    },
    /// The round finished at its initiator.
    Report { round: Uuid, total: u64 },
}

#[derive(Debug, Clone, Default)]
pub struct SnapshotState {
    mode: RecordingMode,
    local_count: u64,
    is_initiator: bool,
    left_marker_seen: bool,
    right_marker_seen: bool,
    in_transit_left: u64,
    in_transit_right: u64,
    round: Option<Uuid>,
    /// Running total received before this tank finished recording.
    held_token: Option<u64>,
}

impl SnapshotState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mode(&self) -> RecordingMode {
        self.mode
    }

    pub fn round(&self) -> Option<Uuid> {
        self.round
    }

    pub fn is_initiator(&self) -> bool {
        self.is_initiator
    }

    pub fn is_active(&self) -> bool {
        self.round.is_some()
    }

    pub fn in_transit(&self, channel: Direction) -> u64 {
        match channel {
            Direction::Left => self.in_transit_left,
            Direction::Right => self.in_transit_right,
        }
    }

    /// Both channels closed.
    pub fn is_finished(&self) -> bool {
        self.is_active() && self.left_marker_seen && self.right_marker_seen
    }

    /// What this tank adds to the running total.
    pub fn contribution(&self) -> u64 {
        self.local_count + self.in_transit_left + self.in_transit_right
    }

    fn is_recording(&self, channel: Direction) -> bool {
        matches!(
            (self.mode, channel),
            (RecordingMode::Both, _)
                | (RecordingMode::Left, Direction::Left)
                | (RecordingMode::Right, Direction::Right)
        )
    }

    /// Start a round here. No-op while any round is in progress.
    pub fn initiate(&mut self, local_count: u64, round: Uuid) -> Vec<SnapshotAction> {
        if let Some(current) = self.round {
            debug!("Snapshot {} already in progress, not starting another", current);
            return Vec::new();
        }

        info!("📸 Starting snapshot {} with {} local fish", round, local_count);
        self.begin(round, local_count, true);
        vec![SnapshotAction::SendMarkers { round }]
    }

    /// A marker arrived on `channel`.
    pub fn on_marker(
        &mut self,
        channel: Direction,
        round: Uuid,
        local_count: u64,
    ) -> Vec<SnapshotAction> {
        let mut actions = Vec::new();

        match self.round {
            None => {
                debug!(
                    "📸 First marker of {} from {}, recording {} local fish",
                    round, channel, local_count
                );
                self.begin(round, local_count, false);
                actions.push(SnapshotAction::SendMarkers { round });
            }
            Some(current) if current != round => {
                warn!(
                    "⚠️  Marker for snapshot {} while {} is running, dropping",
                    round, current
                );
                return actions;
            }
            Some(_) => {}
        }

        let seen = match channel {
            Direction::Left => &mut self.left_marker_seen,
            Direction::Right => &mut self.right_marker_seen,
        };
        if *seen {
            warn!("⚠️  Duplicate marker on {} channel for {}", channel, round);
            return actions;
        }
        *seen = true;

        self.mode = match (self.left_marker_seen, self.right_marker_seen) {
            (true, true) => RecordingMode::Idle,
            (true, false) => RecordingMode::Right,
            (false, true) => RecordingMode::Left,
            (false, false) => RecordingMode::Both,
        };

        if self.is_finished() {
            actions.extend(self.on_finished(round));
        }
        actions
    }

    /// A fish arrived on `channel`.
    pub fn record_arrival(&mut self, channel: Direction) {
        if !self.is_recording(channel) {
            return;
        }
        match channel {
            Direction::Left => self.in_transit_left += 1,
            Direction::Right => self.in_transit_right += 1,
        }
    }

    /// The running-total token arrived.
    pub fn on_token(&mut self, round: Uuid, count: u64, is_initiator: bool) -> Vec<SnapshotAction> {
        if self.round != Some(round) {
            warn!("⚠️  Snapshot token for unknown round {}, dropping", round);
            return Vec::new();
        }

        if self.is_initiator {
            let total = count + self.contribution();
            info!("📸 Snapshot {} complete: {} fish in the ring", round, total);
            self.reset();
            return vec![SnapshotAction::Report { round, total }];
        }

        debug!(
            "Snapshot token for {} (count {}, from initiator: {})",
            round, count, is_initiator
        );
        if self.is_finished() {
            let forward = self.forward(round, count);
            self.reset();
            vec![forward]
        } else {
            self.held_token = Some(count);
            Vec::new()
        }
    }

    fn on_finished(&mut self, round: Uuid) -> Vec<SnapshotAction> {
        if self.is_initiator {
            return vec![SnapshotAction::SendToken {
                round,
                count: 0,
                is_initiator: true,
            }];
        }

        match self.held_token.take() {
            Some(count) => {
                let forward = self.forward(round, count);
                self.reset();
                vec![forward]
            }
            None => Vec::new(),
        }
    }

    fn forward(&self, round: Uuid, count: u64) -> SnapshotAction {
        SnapshotAction::SendToken {
            round,
            count: count + self.contribution(),
            is_initiator: false,
        }
    }

    fn begin(&mut self, round: Uuid, local_count: u64, is_initiator: bool) {
        *self = Self {
            mode: RecordingMode::Both,
            local_count,
            is_initiator,
            round: Some(round),
            ..Self::default()
        };
    }

    fn reset(&mut self) {
        *self = Self::default();
    }
}
