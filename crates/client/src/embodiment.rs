//! Boundary to the rendering/IK/voice side of the application.

use seatsync_core::{AvatarPose, LifecycleState, ParticipantId, SeatIndex};

/// Consumer of mirrored participant state.
///
/// Registered once when the [`Client`](crate::Client) is constructed and
/// handed back by [`Client::into_embodiment`](crate::Client::into_embodiment).
/// Calls arrive from the client's control loop, one at a time.
pub trait Embodiment {
    /// Instantiate an avatar for a newly mirrored participant.
    fn spawn(&mut self, id: ParticipantId, pose: &AvatarPose);

    /// Apply a new pose to a mirrored avatar.
    fn update(&mut self, id: ParticipantId, pose: &AvatarPose);

    /// Destroy a mirrored avatar.
    fn despawn(&mut self, id: ParticipantId);

    /// The local participant has been seated.
    fn seat_assigned(&mut self, _seat: SeatIndex) {}

    /// The local connection changed state.
    fn lifecycle_changed(&mut self, _state: LifecycleState) {}
}
