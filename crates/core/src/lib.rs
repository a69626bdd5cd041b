//! Seatsync Core
//!
//! Domain types shared by the session server and its clients.
//!
//! This crate performs no I/O and never reads the clock. Callers supply
//! time explicitly (see [`timer::TimerQueue`]) so that both sides of the
//! protocol can be driven deterministically from a single control loop.

#![deny(unsafe_code)]

pub mod timer;

use std::fmt;
use std::num::ParseIntError;
use std::str::FromStr;

pub use timer::{TimerId, TimerQueue};

// ============================================================================
// Identifiers
// ============================================================================

/// Transport-assigned participant identifier.
///
/// Unique for the lifetime of the process and stable until the owning
/// connection drops. The same value is the lookup key handed to identity
/// collaborators (voice chat and similar), so it round-trips through its
/// string form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParticipantId(u64);

impl ParticipantId {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn value(self) -> u64 {
        self.0
    }
}

impl From<u64> for ParticipantId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ParticipantId {
    type Err = ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<u64>().map(Self)
    }
}

/// Index into the deployment's ordered seat table.
pub type SeatIndex = u32;

// ============================================================================
// Math Types
// ============================================================================

/// World-space position.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    pub const ZERO: Self = Self::new(0.0, 0.0, 0.0);

    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }
}

/// Orientation quaternion (x, y, z, w).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quat {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub w: f32,
}

impl Quat {
    pub const IDENTITY: Self = Self::new(0.0, 0.0, 0.0, 1.0);

    pub const fn new(x: f32, y: f32, z: f32, w: f32) -> Self {
        Self { x, y, z, w }
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite() && self.w.is_finite()
    }
}

impl Default for Quat {
    fn default() -> Self {
        Self::IDENTITY
    }
}

// ============================================================================
// Avatar Pose
// ============================================================================

/// Full per-entity pose consumed by the embodiment collaborator.
///
/// The core never interprets these fields beyond finiteness checks and
/// clamping `expression` into `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct AvatarPose {
    pub position: Vec3,
    pub orientation: Quat,
    pub head_position: Vec3,
    pub head_orientation: Quat,
    pub left_eye: Quat,
    pub right_eye: Quat,
    /// Facial expression intensity in `[0, 1]`.
    pub expression: f32,
}

impl AvatarPose {
    /// Pose seeded from the coarse fields carried by a join message.
    ///
    /// Head and eyes start at the body transform with identity gaze.
    pub fn from_root(position: Vec3, orientation: Quat) -> Self {
        Self {
            position,
            orientation,
            head_position: position,
            head_orientation: orientation,
            left_eye: Quat::IDENTITY,
            right_eye: Quat::IDENTITY,
            expression: 0.0,
        }
    }

    pub fn is_finite(&self) -> bool {
        self.position.is_finite()
            && self.orientation.is_finite()
            && self.head_position.is_finite()
            && self.head_orientation.is_finite()
            && self.left_eye.is_finite()
            && self.right_eye.is_finite()
            && self.expression.is_finite()
    }

    /// Returns a copy with `expression` clamped into `[0, 1]`.
    ///
    /// NaN collapses to 0.
    pub fn clamped(mut self) -> Self {
        self.expression = if self.expression.is_nan() {
            0.0
        } else {
            self.expression.clamp(0.0, 1.0)
        };
        self
    }
}

// ============================================================================
// Connection Lifecycle
// ============================================================================

/// Per-connection lifecycle state, tracked on both sides.
///
/// A client reaches `Active` only after the transport handshake and its
/// seat assignment have both completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum LifecycleState {
    #[default]
    Disconnected,
    Connecting,
    Authenticated,
    Active,
    Disconnecting,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Authenticated => "authenticated",
            Self::Active => "active",
            Self::Disconnecting => "disconnecting",
        }
    }

    /// True while the underlying transport connection is up.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Authenticated | Self::Active)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Tests
// ============================================================================
