//! Seatsync Wire Protocol Types
//!
//! This crate defines the shared Protobuf message types exchanged between the
//! session server and its clients. Both sides MUST depend on this crate so the
//! schema cannot drift.
//!
//! # Channels
//!
//! - **Reliable** (ordered, at-least-once): JoinRequest, SeatAssignment,
//!   JoinRelay, LeaveRelay
//! - **Unreliable** (best effort, unordered): PoseUpdate
//!
//! Every datagram is an [`Envelope`] whose body kind fixes its channel.
//! Receivers decode through [`ClientMessage::decode`] (server side) or
//! [`ServerMessage::decode`] (client side), which reject kinds travelling in
//! the wrong direction.

#![deny(unsafe_code)]

use std::fmt;

use prost::Message;
use seatsync_core::{AvatarPose, ParticipantId, Quat, SeatIndex, Vec3};
use thiserror::Error;

// ============================================================================
// Errors
// ============================================================================

/// Failure to turn bytes into a protocol message.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("malformed envelope: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("envelope carries no message body")]
    EmptyEnvelope,

    #[error("{kind} is not a {direction} message")]
    UnexpectedKind {
        kind: MessageKind,
        direction: Direction,
    },
}

/// Failure to turn a decoded message into domain values.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConversionError {
    #[error("missing field `{0}`")]
    MissingField(&'static str),

    #[error("non-finite value in field `{0}`")]
    NonFinite(&'static str),
}

// ============================================================================
// Channel Discipline
// ============================================================================

/// Delivery path a message travels on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Ordered, at-least-once. Receivers must tolerate duplicates.
    Reliable,
    /// No ordering or delivery guarantee.
    Unreliable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    ClientToServer,
    ServerToClient,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::ClientToServer => "client-to-server",
            Self::ServerToClient => "server-to-client",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    JoinRequest,
    SeatAssignment,
    JoinRelay,
    PoseUpdate,
    LeaveRelay,
}

impl MessageKind {
    pub fn channel(&self) -> Channel {
        match self {
            Self::PoseUpdate => Channel::Unreliable,
            Self::JoinRequest | Self::SeatAssignment | Self::JoinRelay | Self::LeaveRelay => {
                Channel::Reliable
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::JoinRequest => "JoinRequest",
            Self::SeatAssignment => "SeatAssignment",
            Self::JoinRelay => "JoinRelay",
            Self::PoseUpdate => "PoseUpdate",
            Self::LeaveRelay => "LeaveRelay",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Geometry
// ============================================================================

#[derive(Clone, Copy, PartialEq, Message)]
pub struct Vec3Proto {
    #[prost(float, tag = "1")]
    pub x: f32,
    #[prost(float, tag = "2")]
    pub y: f32,
    #[prost(float, tag = "3")]
    pub z: f32,
}

#[derive(Clone, Copy, PartialEq, Message)]
pub struct QuatProto {
    #[prost(float, tag = "1")]
    pub x: f32,
    #[prost(float, tag = "2")]
    pub y: f32,
    #[prost(float, tag = "3")]
    pub z: f32,
    #[prost(float, tag = "4")]
    pub w: f32,
}

// ============================================================================
// Reliable Channel Messages
// ============================================================================

/// Client asks to be seated. Sent once the transport reports the
/// connection as started.
#[derive(Clone, PartialEq, Message)]
pub struct JoinRequest {
    #[prost(uint64, tag = "1")]
    pub participant_id: u64,

    #[prost(message, optional, tag = "2")]
    pub position: Option<Vec3Proto>,

    #[prost(message, optional, tag = "3")]
    pub orientation: Option<QuatProto>,
}

/// Server tells a newly joined client which seat it occupies.
#[derive(Clone, PartialEq, Message)]
pub struct SeatAssignment {
    #[prost(uint32, tag = "1")]
    pub seat_index: SeatIndex,
}

/// Server announces a participant to a client that should mirror it.
///
/// Broadcast to existing participants when someone joins, and unicast to the
/// joiner once per participant already present.
#[derive(Clone, PartialEq, Message)]
pub struct JoinRelay {
    #[prost(uint64, tag = "1")]
    pub participant_id: u64,

    #[prost(message, optional, tag = "2")]
    pub position: Option<Vec3Proto>,

    #[prost(message, optional, tag = "3")]
    pub orientation: Option<QuatProto>,
}

/// Server announces that a participant's connection dropped.
#[derive(Clone, PartialEq, Message)]
pub struct LeaveRelay {
    #[prost(uint64, tag = "1")]
    pub participant_id: u64,
}

// ============================================================================
// Unreliable Channel Messages
// ============================================================================

/// Full pose of one participant. Sent client → server and relayed unmodified
/// to every other participant.
///
/// Carries no sequence number: a late datagram overwrites newer state.
#[derive(Clone, PartialEq, Message)]
pub struct PoseUpdate {
    #[prost(uint64, tag = "1")]
    pub participant_id: u64,

    #[prost(message, optional, tag = "2")]
    pub position: Option<Vec3Proto>,

    #[prost(message, optional, tag = "3")]
    pub orientation: Option<QuatProto>,

    #[prost(message, optional, tag = "4")]
    pub head_position: Option<Vec3Proto>,

    #[prost(message, optional, tag = "5")]
    pub head_orientation: Option<QuatProto>,

    #[prost(message, optional, tag = "6")]
    pub left_eye_orientation: Option<QuatProto>,

    #[prost(message, optional, tag = "7")]
    pub right_eye_orientation: Option<QuatProto>,

    /// Expression intensity, expected in `[0, 1]`.
    #[prost(float, tag = "8")]
    pub expression_intensity: f32,
}

// ============================================================================
// Envelope
// ============================================================================

pub mod envelope {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Body {
        #[prost(message, tag = "1")]
        JoinRequest(super::JoinRequest),
        #[prost(message, tag = "2")]
        SeatAssignment(super::SeatAssignment),
        #[prost(message, tag = "3")]
        JoinRelay(super::JoinRelay),
        #[prost(message, tag = "4")]
        PoseUpdate(super::PoseUpdate),
        #[prost(message, tag = "5")]
        LeaveRelay(super::LeaveRelay),
    }

    impl Body {
        pub fn kind(&self) -> super::MessageKind {
            use super::MessageKind;
            match self {
                Self::JoinRequest(_) => MessageKind::JoinRequest,
                Self::SeatAssignment(_) => MessageKind::SeatAssignment,
                Self::JoinRelay(_) => MessageKind::JoinRelay,
                Self::PoseUpdate(_) => MessageKind::PoseUpdate,
                Self::LeaveRelay(_) => MessageKind::LeaveRelay,
            }
        }
    }
}

/// Outer datagram for both channels.
#[derive(Clone, PartialEq, Message)]
pub struct Envelope {
    #[prost(oneof = "envelope::Body", tags = "1, 2, 3, 4, 5")]
    pub body: Option<envelope::Body>,
}

fn open(bytes: &[u8]) -> Result<envelope::Body, WireError> {
    Envelope::decode(bytes)?
        .body
        .ok_or(WireError::EmptyEnvelope)
}

fn seal(body: envelope::Body) -> Vec<u8> {
    Envelope { body: Some(body) }.encode_to_vec()
}

/// Messages a client sends to the server.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    JoinRequest(JoinRequest),
    PoseUpdate(PoseUpdate),
}

impl ClientMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::JoinRequest(_) => MessageKind::JoinRequest,
            Self::PoseUpdate(_) => MessageKind::PoseUpdate,
        }
    }

    pub fn channel(&self) -> Channel {
        self.kind().channel()
    }

    /// Participant id the sender claims to be.
    pub fn claimed_id(&self) -> ParticipantId {
        match self {
            Self::JoinRequest(msg) => ParticipantId::new(msg.participant_id),
            Self::PoseUpdate(msg) => ParticipantId::new(msg.participant_id),
        }
    }

    pub fn encode_to_vec(&self) -> Vec<u8> {
        seal(match self.clone() {
            Self::JoinRequest(msg) => envelope::Body::JoinRequest(msg),
            Self::PoseUpdate(msg) => envelope::Body::PoseUpdate(msg),
        })
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        match open(bytes)? {
            envelope::Body::JoinRequest(msg) => Ok(Self::JoinRequest(msg)),
            envelope::Body::PoseUpdate(msg) => Ok(Self::PoseUpdate(msg)),
            other => Err(WireError::UnexpectedKind {
                kind: other.kind(),
                direction: Direction::ClientToServer,
            }),
        }
    }
}

/// Messages the server sends to clients.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    SeatAssignment(SeatAssignment),
    JoinRelay(JoinRelay),
    PoseUpdate(PoseUpdate),
    LeaveRelay(LeaveRelay),
}

impl ServerMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::SeatAssignment(_) => MessageKind::SeatAssignment,
            Self::JoinRelay(_) => MessageKind::JoinRelay,
            Self::PoseUpdate(_) => MessageKind::PoseUpdate,
            Self::LeaveRelay(_) => MessageKind::LeaveRelay,
        }
    }

    pub fn channel(&self) -> Channel {
        self.kind().channel()
    }

    pub fn encode_to_vec(&self) -> Vec<u8> {
        seal(match self.clone() {
            Self::SeatAssignment(msg) => envelope::Body::SeatAssignment(msg),
            Self::JoinRelay(msg) => envelope::Body::JoinRelay(msg),
            Self::PoseUpdate(msg) => envelope::Body::PoseUpdate(msg),
            Self::LeaveRelay(msg) => envelope::Body::LeaveRelay(msg),
        })
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        match open(bytes)? {
            envelope::Body::SeatAssignment(msg) => Ok(Self::SeatAssignment(msg)),
            envelope::Body::JoinRelay(msg) => Ok(Self::JoinRelay(msg)),
            envelope::Body::PoseUpdate(msg) => Ok(Self::PoseUpdate(msg)),
            envelope::Body::LeaveRelay(msg) => Ok(Self::LeaveRelay(msg)),
            other => Err(WireError::UnexpectedKind {
                kind: other.kind(),
                direction: Direction::ServerToClient,
            }),
        }
    }
}

// ============================================================================
// Conversion Traits
// ============================================================================

impl From<Vec3> for Vec3Proto {
    fn from(v: Vec3) -> Self {
        Self {
            x: v.x,
            y: v.y,
            z: v.z,
        }
    }
}

impl From<Quat> for QuatProto {
    fn from(q: Quat) -> Self {
        Self {
            x: q.x,
            y: q.y,
            z: q.z,
            w: q.w,
        }
    }
}

fn vec3(field: Option<Vec3Proto>, name: &'static str) -> Result<Vec3, ConversionError> {
    let v = field.ok_or(ConversionError::MissingField(name))?;
    let v = Vec3::new(v.x, v.y, v.z);
    if !v.is_finite() {
        return Err(ConversionError::NonFinite(name));
    }
    Ok(v)
}

fn quat(field: Option<QuatProto>, name: &'static str) -> Result<Quat, ConversionError> {
    let q = field.ok_or(ConversionError::MissingField(name))?;
    let q = Quat::new(q.x, q.y, q.z, q.w);
    if !q.is_finite() {
        return Err(ConversionError::NonFinite(name));
    }
    Ok(q)
}

impl JoinRequest {
    pub fn new(id: ParticipantId, position: Vec3, orientation: Quat) -> Self {
        Self {
            participant_id: id.value(),
            position: Some(position.into()),
            orientation: Some(orientation.into()),
        }
    }

    pub fn id(&self) -> ParticipantId {
        ParticipantId::new(self.participant_id)
    }

    /// Body position and orientation.
    pub fn root(&self) -> Result<(Vec3, Quat), ConversionError> {
        Ok((
            vec3(self.position, "position")?,
            quat(self.orientation, "orientation")?,
        ))
    }
}

impl JoinRelay {
    pub fn new(id: ParticipantId, position: Vec3, orientation: Quat) -> Self {
        Self {
            participant_id: id.value(),
            position: Some(position.into()),
            orientation: Some(orientation.into()),
        }
    }

    pub fn id(&self) -> ParticipantId {
        ParticipantId::new(self.participant_id)
    }

    pub fn root(&self) -> Result<(Vec3, Quat), ConversionError> {
        Ok((
            vec3(self.position, "position")?,
            quat(self.orientation, "orientation")?,
        ))
    }
}

impl LeaveRelay {
    pub fn new(id: ParticipantId) -> Self {
        Self {
            participant_id: id.value(),
        }
    }

    pub fn id(&self) -> ParticipantId {
        ParticipantId::new(self.participant_id)
    }
}

impl PoseUpdate {
    pub fn new(id: ParticipantId, pose: &AvatarPose) -> Self {
        Self {
            participant_id: id.value(),
            position: Some(pose.position.into()),
            orientation: Some(pose.orientation.into()),
            head_position: Some(pose.head_position.into()),
            head_orientation: Some(pose.head_orientation.into()),
            left_eye_orientation: Some(pose.left_eye.into()),
            right_eye_orientation: Some(pose.right_eye.into()),
            expression_intensity: pose.expression,
        }
    }

    pub fn id(&self) -> ParticipantId {
        ParticipantId::new(self.participant_id)
    }

    /// Coarse body fields only.
    pub fn root(&self) -> Result<(Vec3, Quat), ConversionError> {
        Ok((
            vec3(self.position, "position")?,
            quat(self.orientation, "orientation")?,
        ))
    }

    /// Full pose. Expression intensity is passed through unclamped.
    pub fn pose(&self) -> Result<AvatarPose, ConversionError> {
        if !self.expression_intensity.is_finite() {
            return Err(ConversionError::NonFinite("expression_intensity"));
        }
        Ok(AvatarPose {
            position: vec3(self.position, "position")?,
            orientation: quat(self.orientation, "orientation")?,
            head_position: vec3(self.head_position, "head_position")?,
            head_orientation: quat(self.head_orientation, "head_orientation")?,
            left_eye: quat(self.left_eye_orientation, "left_eye_orientation")?,
            right_eye: quat(self.right_eye_orientation, "right_eye_orientation")?,
            expression: self.expression_intensity,
        })
    }
}

impl TryFrom<&PoseUpdate> for AvatarPose {
    type Error = ConversionError;

    fn try_from(msg: &PoseUpdate) -> Result<Self, Self::Error> {
        msg.pose()
    }
}

// ============================================================================
// Tests
// ============================================================================
