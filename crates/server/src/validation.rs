//! Pose validation for the relay.
//!
//! - Missing vector/quaternion field: DROP
//! - NaN/Inf in any component: DROP
//! - Expression intensity outside [0, 1]: DROP
//!
//! Accepted messages are relayed byte-for-byte; nothing here rewrites them.

use seatsync_core::AvatarPose;
use seatsync_wire::{ConversionError, PoseUpdate};
use thiserror::Error;

/// Why a pose was refused.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PoseRejection {
    #[error(transparent)]
    Malformed(#[from] ConversionError),

    #[error("expression intensity {0} outside [0, 1]")]
    ExpressionOutOfRange(f32),
}

/// Validate a pose update, returning the decoded pose if it may be relayed.
pub fn validate_pose(msg: &PoseUpdate) -> Result<AvatarPose, PoseRejection> {
    let pose = AvatarPose::try_from(msg)?;

    if !(0.0..=1.0).contains(&pose.expression) {
        return Err(PoseRejection::ExpressionOutOfRange(pose.expression));
    }

    Ok(pose)
}
