//! Seatsync Client
//!
//! The client half of the session protocol:
//! - Connection lifecycle: connect, join, seat, teardown and retry
//! - Remote-entity reconciliation: one mirror per other participant
//!
//! # Architecture
//!
//! Like the server, the client performs no I/O. Its control loop reports
//! transport events (`on_connection_started`, `on_connection_stopped`,
//! `handle_datagram`), advances deferred work with [`Client::poll`], and
//! drains [`ClientAction`]s for the transport to execute. Mirror changes are
//! pushed synchronously into the [`Embodiment`] registered at construction.
//!
//! Reconnection is unconditional and indefinite with a fixed backoff. This
//! suits trusted LAN deployments; it is not a general-purpose retry policy.

#![deny(unsafe_code)]

pub mod embodiment;
pub mod reconciler;

use std::time::{Duration, Instant};

use seatsync_core::{AvatarPose, LifecycleState, ParticipantId, SeatIndex, TimerId, TimerQueue};
use seatsync_wire::{ClientMessage, JoinRequest, PoseUpdate, ServerMessage};
use tracing::{debug, info};

pub use embodiment::Embodiment;
pub use reconciler::{EntityMirror, MirrorOutcome, Reconciler};

// ============================================================================
// Parameters
// ============================================================================

/// Delay between a lost connection and the next attempt.
pub const RECONNECT_BACKOFF_MS: u64 = 2000;

/// Delay between a leave relay and destruction of the mirrored avatar.
pub const LEAVE_GRACE_MS: u64 = 500;

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub reconnect_backoff: Duration,
    pub leave_grace: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            reconnect_backoff: Duration::from_millis(RECONNECT_BACKOFF_MS),
            leave_grace: Duration::from_millis(LEAVE_GRACE_MS),
        }
    }
}

/// Work the transport must perform on the client's behalf.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientAction {
    /// Open a connection to the server.
    Connect,
    /// Close the current connection.
    Disconnect,
    /// Send a message on the channel its kind dictates.
    Send(ClientMessage),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Deferred {
    Reconnect,
    Despawn { id: ParticipantId, incarnation: u64 },
}

// ============================================================================
// Client State
// ============================================================================

/// Lifecycle controller owning the local mirror table.
pub struct Client<E: Embodiment> {
    config: ClientConfig,
    state: LifecycleState,
    local_id: Option<ParticipantId>,
    seat: Option<SeatIndex>,
    /// Latest local pose; its root seeds the join request.
    local_pose: AvatarPose,
    reconciler: Reconciler,
    timers: TimerQueue<Deferred>,
    reconnect: Option<TimerId>,
    actions: Vec<ClientAction>,
    /// Cleared by `shutdown`; no retries afterwards.
    running: bool,
    embodiment: E,
}

impl<E: Embodiment> Client<E> {
    /// Create a client and register its embodiment collaborator.
    pub fn new(config: ClientConfig, embodiment: E) -> Self {
        Self {
            config,
            state: LifecycleState::Disconnected,
            local_id: None,
            seat: None,
            local_pose: AvatarPose::default(),
            reconciler: Reconciler::new(),
            timers: TimerQueue::new(),
            reconnect: None,
            actions: Vec::new(),
            running: true,
            embodiment,
        }
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Start a connection attempt if idle.
    pub fn connect(&mut self) {
        if self.state != LifecycleState::Disconnected || !self.running {
            return;
        }
        if let Some(id) = self.reconnect.take() {
            self.timers.cancel(id);
        }
        self.transition(LifecycleState::Connecting);
        self.actions.push(ClientAction::Connect);
    }

    /// Transport reports the connection is up.
    ///
    /// Every accepted connection counts as authenticated, so the join request
    /// goes out immediately.
    pub fn on_connection_started(&mut self, local_id: ParticipantId) {
        if self.state != LifecycleState::Connecting {
            debug!(state = %self.state, "unexpected connection start ignored");
            return;
        }

        self.local_id = Some(local_id);
        self.transition(LifecycleState::Authenticated);

        let position = self.local_pose.position;
        let orientation = self.local_pose.orientation;
        self.actions.push(ClientAction::Send(ClientMessage::JoinRequest(
            JoinRequest::new(local_id, position, orientation),
        )));
        info!(%local_id, "join requested");
    }

    /// Transport reports the connection is gone.
    ///
    /// Tears down all session state synchronously, then schedules a retry.
    pub fn on_connection_stopped(&mut self, now: Instant) {
        if self.state == LifecycleState::Disconnected && self.reconnect.is_some() {
            return;
        }

        self.teardown();

        if self.running {
            let deadline = now + self.config.reconnect_backoff;
            self.reconnect = Some(self.timers.schedule(deadline, Deferred::Reconnect));
            info!(backoff_ms = self.config.reconnect_backoff.as_millis() as u64, "reconnect scheduled");
        }
    }

    /// Close the session for good and stop retrying.
    ///
    /// This is the single deregistration point for the embodiment: every
    /// mirror is destroyed and no callback follows except the final
    /// lifecycle notifications.
    pub fn shutdown(&mut self) {
        if !self.running {
            return;
        }
        self.running = false;

        if self.state.is_connected() || self.state == LifecycleState::Connecting {
            self.transition(LifecycleState::Disconnecting);
            self.actions.push(ClientAction::Disconnect);
        }
        self.teardown();
        info!("client shut down");
    }

    /// Run deferred work due at `now`.
    pub fn poll(&mut self, now: Instant) {
        for deferred in self.timers.pop_due(now) {
            match deferred {
                Deferred::Reconnect => {
                    self.reconnect = None;
                    debug!("retrying connection");
                    self.connect();
                }
                Deferred::Despawn { id, incarnation } => {
                    self.reconciler
                        .finalize_departure(id, incarnation, &mut self.embodiment);
                }
            }
        }
    }

    // ========================================================================
    // Inbound Messages
    // ========================================================================

    /// Decode and dispatch one datagram from the server.
    pub fn handle_datagram(&mut self, bytes: &[u8], now: Instant) {
        match ServerMessage::decode(bytes) {
            Ok(msg) => self.on_server_message(&msg, now),
            Err(err) => debug!(%err, "dropping undecodable datagram"),
        }
    }

    pub fn on_server_message(&mut self, msg: &ServerMessage, now: Instant) {
        if !self.state.is_connected() {
            debug!(kind = %msg.kind(), state = %self.state, "message outside a session dropped");
            return;
        }

        match msg {
            ServerMessage::SeatAssignment(assignment) => self.on_seat_assignment(assignment.seat_index),
            ServerMessage::JoinRelay(relay) => {
                self.reconciler
                    .on_join_relay(relay, self.local_id, &mut self.embodiment);
            }
            ServerMessage::PoseUpdate(update) => {
                self.reconciler
                    .on_pose_update(update, self.local_id, &mut self.embodiment);
            }
            ServerMessage::LeaveRelay(leave) => {
                if let MirrorOutcome::Departing { incarnation } = self.reconciler.on_leave_relay(leave)
                {
                    let id = leave.id();
                    self.timers.schedule(
                        now + self.config.leave_grace,
                        Deferred::Despawn { id, incarnation },
                    );
                }
            }
        }
    }

    fn on_seat_assignment(&mut self, seat: SeatIndex) {
        match self.state {
            LifecycleState::Authenticated => {
                self.seat = Some(seat);
                self.transition(LifecycleState::Active);
                self.embodiment.seat_assigned(seat);
                info!(seat, "seated");
            }
            _ => debug!(seat, state = %self.state, "seat assignment ignored"),
        }
    }

    // ========================================================================
    // Outbound Pose
    // ========================================================================

    /// Record the local pose and stream it if seated.
    ///
    /// Returns true if a pose update was queued.
    pub fn send_pose(&mut self, pose: AvatarPose) -> bool {
        self.local_pose = pose;

        let (LifecycleState::Active, Some(id)) = (self.state, self.local_id) else {
            return false;
        };
        self.actions
            .push(ClientAction::Send(ClientMessage::PoseUpdate(PoseUpdate::new(id, &pose))));
        true
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// Take every action queued since the last drain.
    pub fn drain_actions(&mut self) -> Vec<ClientAction> {
        std::mem::take(&mut self.actions)
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == LifecycleState::Active
    }

    pub fn local_id(&self) -> Option<ParticipantId> {
        self.local_id
    }

    pub fn seat(&self) -> Option<SeatIndex> {
        self.seat
    }

    pub fn mirror(&self, id: ParticipantId) -> Option<&EntityMirror> {
        self.reconciler.get(id)
    }

    pub fn mirror_count(&self) -> usize {
        self.reconciler.len()
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    /// Earliest pending deferred deadline, for loop sleeping.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    pub fn embodiment(&self) -> &E {
        &self.embodiment
    }

    pub fn embodiment_mut(&mut self) -> &mut E {
        &mut self.embodiment
    }

    /// Shut down and hand back the embodiment.
    pub fn into_embodiment(mut self) -> E {
        self.shutdown();
        self.embodiment
    }

    // ========================================================================
    // Internal
    // ========================================================================

    fn teardown(&mut self) {
        self.reconciler.clear(&mut self.embodiment);
        self.timers.clear();
        self.reconnect = None;
        self.seat = None;
        self.local_id = None;
        self.transition(LifecycleState::Disconnected);
    }

    fn transition(&mut self, next: LifecycleState) {
        if self.state == next {
            return;
        }
        info!(from = %self.state, to = %next, "lifecycle transition");
        self.state = next;
        self.embodiment.lifecycle_changed(next);
    }
}

// ============================================================================
// Tests
// ============================================================================
