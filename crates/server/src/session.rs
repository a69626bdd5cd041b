//! Authoritative per-participant state.

use seatsync_core::{ParticipantId, Quat, SeatIndex, Vec3};
use seatsync_wire::JoinRelay;

/// Server-owned record of a seated participant.
///
/// Only the coarse body transform is persisted; head, eyes and expression
/// pass through the relay without being stored.
#[derive(Debug, Clone, PartialEq)]
pub struct ParticipantRecord {
    pub id: ParticipantId,
    pub seat: SeatIndex,
    pub position: Vec3,
    pub orientation: Quat,
}

impl ParticipantRecord {
    pub fn new(id: ParticipantId, seat: SeatIndex, position: Vec3, orientation: Quat) -> Self {
        Self {
            id,
            seat,
            position,
            orientation,
        }
    }

    /// Overwrite the last-known body transform.
    pub fn update_root(&mut self, position: Vec3, orientation: Quat) {
        self.position = position;
        self.orientation = orientation;
    }

    /// Announcement of this participant for another client's mirror table.
    pub fn to_join_relay(&self) -> JoinRelay {
        JoinRelay::new(self.id, self.position, self.orientation)
    }
}
