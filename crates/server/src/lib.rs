//! Seatsync Session Server
//!
//! The authoritative side of the session protocol. It owns:
//! - The connection table (every accepted connection is implicitly
//!   authenticated; deploy only on closed, trusted networks)
//! - Seat allocation
//! - The participant registry
//! - Relay of join, leave and pose messages
//!
//! # Architecture
//!
//! The server performs no I/O. The surrounding control loop feeds it
//! transport events (`on_connect`, `handle_datagram`, `on_disconnect`) one
//! at a time and drains [`Outbound`] messages with
//! [`Server::drain_outbox`], handing each to the transport on the channel
//! its kind dictates. Broadcasts are expanded into one [`Outbound`] per
//! recipient in ascending participant order.

#![deny(unsafe_code)]

pub mod seats;
pub mod session;
pub mod validation;

use std::collections::BTreeMap;

use seatsync_core::{LifecycleState, ParticipantId, SeatIndex};
use seatsync_wire::{
    Channel, ClientMessage, ConversionError, JoinRequest, LeaveRelay, PoseUpdate, SeatAssignment,
    ServerMessage,
};
use tracing::{debug, info, trace, warn};

use seats::{SeatAllocator, SeatError};
use session::ParticipantRecord;
use validation::{PoseRejection, validate_pose};

// ============================================================================
// Parameters
// ============================================================================

/// Default number of seats in the reference-point table.
pub const DEFAULT_SEAT_COUNT: SeatIndex = 4;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub seat_count: SeatIndex,
    /// Drop pose updates with missing/non-finite fields or out-of-range
    /// expression before relaying.
    pub validate_poses: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            seat_count: DEFAULT_SEAT_COUNT,
            validate_poses: true,
        }
    }
}

// ============================================================================
// Outcomes
// ============================================================================

/// Result of handling a join request.
#[derive(Debug, Clone, PartialEq)]
pub enum JoinOutcome {
    Accepted { seat: SeatIndex },
    /// Sender is already registered; nothing was sent.
    DuplicateJoin,
    /// No seat free; the request was dropped without a reply.
    SeatExhausted,
    /// Sender has no open connection.
    NotConnected,
    /// Message names a participant other than its sender.
    IdentityMismatch { claimed: ParticipantId },
    Malformed(ConversionError),
}

/// Result of handling a pose update.
#[derive(Debug, Clone, PartialEq)]
pub enum PoseOutcome {
    Relayed { recipients: usize },
    /// Sender is not registered (join not yet accepted, or already gone).
    UnknownSender,
    IdentityMismatch { claimed: ParticipantId },
    Rejected(PoseRejection),
}

/// Running counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub joins_accepted: u64,
    pub joins_duplicate: u64,
    pub joins_exhausted: u64,
    pub poses_relayed: u64,
    pub poses_dropped: u64,
    pub leaves: u64,
}

/// A message addressed to one participant.
#[derive(Debug, Clone, PartialEq)]
pub struct Outbound {
    pub to: ParticipantId,
    pub message: ServerMessage,
}

impl Outbound {
    pub fn channel(&self) -> Channel {
        self.message.channel()
    }
}

// ============================================================================
// Server State
// ============================================================================

/// Session registry and relay.
pub struct Server {
    config: ServerConfig,
    listening: bool,
    seats: SeatAllocator,
    /// Every open connection and its lifecycle state.
    connections: BTreeMap<ParticipantId, LifecycleState>,
    /// Registered participants.
    records: BTreeMap<ParticipantId, ParticipantRecord>,
    outbox: Vec<Outbound>,
    stats: ServerStats,
}

impl Server {
    /// Create a new server with the given configuration.
    pub fn new(config: ServerConfig) -> Self {
        Self {
            seats: SeatAllocator::new(config.seat_count),
            listening: false,
            connections: BTreeMap::new(),
            records: BTreeMap::new(),
            outbox: Vec::new(),
            stats: ServerStats::default(),
            config,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    // ========================================================================
    // Server Lifecycle
    // ========================================================================

    /// Begin accepting connections.
    pub fn start(&mut self) {
        if !self.listening {
            info!(seats = self.seats.capacity(), "server listening");
        }
        self.listening = true;
    }

    pub fn is_listening(&self) -> bool {
        self.listening
    }

    /// Stop accepting connections and tear down every session.
    ///
    /// Returns the connections dropped. No leave relays are produced since no
    /// participant remains to receive them.
    pub fn stop(&mut self) -> Vec<ParticipantId> {
        let dropped: Vec<_> = self.connections.keys().copied().collect();

        self.listening = false;
        self.connections.clear();
        self.records.clear();
        self.seats.reset();
        self.outbox.clear();

        info!(dropped = dropped.len(), "server stopped");
        dropped
    }

    // ========================================================================
    // Transport Events
    // ========================================================================

    /// Accept a new connection.
    ///
    /// Returns false if the server is not listening.
    pub fn on_connect(&mut self, id: ParticipantId) -> bool {
        if !self.listening {
            debug!(%id, "connection refused, server not listening");
            return false;
        }
        if self.connections.contains_key(&id) {
            debug!(%id, "connection already open");
            return true;
        }
        self.connections.insert(id, LifecycleState::Authenticated);
        info!(%id, "connection accepted");
        true
    }

    /// Handle a connection drop.
    ///
    /// Returns the seat freed, if the participant was registered.
    pub fn on_disconnect(&mut self, id: ParticipantId) -> Option<SeatIndex> {
        self.connections.remove(&id);

        let Some(record) = self.records.remove(&id) else {
            debug!(%id, "unregistered connection closed");
            return None;
        };

        if let Err(err) = self.seats.release(record.seat) {
            warn!(%id, %err, "seat release failed");
        }

        let leave = LeaveRelay::new(id);
        let recipients: Vec<_> = self.records.keys().copied().collect();
        for to in recipients {
            self.push(to, ServerMessage::LeaveRelay(leave.clone()));
        }

        self.stats.leaves += 1;
        info!(%id, seat = record.seat, "participant left");
        Some(record.seat)
    }

    /// Decode and dispatch one datagram from `from`.
    ///
    /// Undecodable datagrams are dropped.
    pub fn handle_datagram(&mut self, from: ParticipantId, bytes: &[u8]) {
        match ClientMessage::decode(bytes) {
            Ok(ClientMessage::JoinRequest(msg)) => {
                self.on_join_request(from, &msg);
            }
            Ok(ClientMessage::PoseUpdate(msg)) => {
                self.on_pose_update(from, &msg);
            }
            Err(err) => debug!(%from, %err, "dropping undecodable datagram"),
        }
    }

    // ========================================================================
    // Message Handlers
    // ========================================================================

    /// Seat and register a participant.
    ///
    /// On success the joiner is announced to every other registered
    /// participant, receives one JoinRelay per participant already present,
    /// then receives its SeatAssignment.
    pub fn on_join_request(&mut self, from: ParticipantId, msg: &JoinRequest) -> JoinOutcome {
        if !self.connections.contains_key(&from) {
            debug!(%from, "join from unknown connection");
            return JoinOutcome::NotConnected;
        }

        let claimed = msg.id();
        if claimed != from {
            warn!(%from, %claimed, "join names another participant");
            return JoinOutcome::IdentityMismatch { claimed };
        }

        if self.records.contains_key(&from) {
            self.stats.joins_duplicate += 1;
            debug!(%from, "duplicate join ignored");
            return JoinOutcome::DuplicateJoin;
        }

        let (position, orientation) = match msg.root() {
            Ok(root) => root,
            Err(err) => {
                debug!(%from, %err, "malformed join");
                return JoinOutcome::Malformed(err);
            }
        };

        let seat = match self.seats.acquire() {
            Ok(seat) => seat,
            Err(SeatError::Exhausted { capacity }) => {
                self.stats.joins_exhausted += 1;
                warn!(%from, capacity, "no seat free, join dropped");
                return JoinOutcome::SeatExhausted;
            }
            Err(err) => {
                warn!(%from, %err, "seat acquisition failed");
                return JoinOutcome::SeatExhausted;
            }
        };

        let record = ParticipantRecord::new(from, seat, position, orientation);
        let announce = record.to_join_relay();

        let others: Vec<_> = self.records.values().cloned().collect();
        for other in &others {
            self.push(other.id, ServerMessage::JoinRelay(announce.clone()));
        }
        for other in &others {
            self.push(from, ServerMessage::JoinRelay(other.to_join_relay()));
        }
        self.push(
            from,
            ServerMessage::SeatAssignment(SeatAssignment { seat_index: seat }),
        );

        self.records.insert(from, record);
        self.connections.insert(from, LifecycleState::Active);
        self.stats.joins_accepted += 1;
        info!(%from, seat, present = others.len(), "participant joined");

        JoinOutcome::Accepted { seat }
    }

    /// Record the sender's coarse transform and relay the update unmodified
    /// to every other registered participant.
    pub fn on_pose_update(&mut self, from: ParticipantId, msg: &PoseUpdate) -> PoseOutcome {
        if !self.records.contains_key(&from) {
            self.stats.poses_dropped += 1;
            trace!(%from, "pose from unregistered sender");
            return PoseOutcome::UnknownSender;
        }

        let claimed = msg.id();
        if claimed != from {
            self.stats.poses_dropped += 1;
            warn!(%from, %claimed, "pose names another participant");
            return PoseOutcome::IdentityMismatch { claimed };
        }

        if self.config.validate_poses {
            if let Err(rejection) = validate_pose(msg) {
                self.stats.poses_dropped += 1;
                debug!(%from, %rejection, "pose rejected");
                return PoseOutcome::Rejected(rejection);
            }
        }

        if let (Some(record), Ok((position, orientation))) = (self.records.get_mut(&from), msg.root())
        {
            record.update_root(position, orientation);
        }

        let recipients: Vec<_> = self
            .records
            .keys()
            .copied()
            .filter(|id| *id != from)
            .collect();
        for to in &recipients {
            self.push(*to, ServerMessage::PoseUpdate(msg.clone()));
        }

        self.stats.poses_relayed += 1;
        trace!(%from, recipients = recipients.len(), "pose relayed");
        PoseOutcome::Relayed {
            recipients: recipients.len(),
        }
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// Take every message queued since the last drain.
    pub fn drain_outbox(&mut self) -> Vec<Outbound> {
        std::mem::take(&mut self.outbox)
    }

    pub fn connection_state(&self, id: ParticipantId) -> LifecycleState {
        self.connections
            .get(&id)
            .copied()
            .unwrap_or(LifecycleState::Disconnected)
    }

    pub fn is_registered(&self, id: ParticipantId) -> bool {
        self.records.contains_key(&id)
    }

    pub fn record(&self, id: ParticipantId) -> Option<&ParticipantRecord> {
        self.records.get(&id)
    }

    /// Registered participants in ascending id order.
    pub fn participants(&self) -> impl Iterator<Item = &ParticipantRecord> {
        self.records.values()
    }

    pub fn participant_count(&self) -> usize {
        self.records.len()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn seats(&self) -> &SeatAllocator {
        &self.seats
    }

    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }

    fn push(&mut self, to: ParticipantId, message: ServerMessage) {
        self.outbox.push(Outbound { to, message });
    }
}

// ============================================================================
// Tests
// ============================================================================
