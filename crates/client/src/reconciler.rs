//! Local mirror table of remote participants.
//!
//! - Join relays create mirrors; duplicates are ignored
//! - Pose relays overwrite a live mirror unconditionally (last write wins)
//! - Pose relays for unknown or departing ids are dropped
//! - Leave relays stop pose application at once; the avatar is destroyed
//!   when the caller finalizes the departure after its grace delay
//! - The local participant is never mirrored

use std::collections::BTreeMap;

use seatsync_core::{AvatarPose, ParticipantId};
use seatsync_wire::{ConversionError, JoinRelay, LeaveRelay, PoseUpdate};
use tracing::{debug, info, trace};

use crate::embodiment::Embodiment;

/// One remote participant as seen locally.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityMirror {
    pub id: ParticipantId,
    pub pose: AvatarPose,
    /// Distinguishes successive mirrors of the same id.
    incarnation: u64,
    departing: bool,
}

impl EntityMirror {
    pub fn is_departing(&self) -> bool {
        self.departing
    }
}

/// Result of applying one relay message.
#[derive(Debug, Clone, PartialEq)]
pub enum MirrorOutcome {
    Spawned,
    Updated,
    /// Leave accepted; finalize with this incarnation after the grace delay.
    Departing { incarnation: u64 },
    Duplicate,
    /// No live mirror for the id.
    Unknown,
    /// Message names the local participant.
    SelfReference,
    Malformed(ConversionError),
}

/// Mirror table keyed by participant id.
#[derive(Debug, Default)]
pub struct Reconciler {
    mirrors: BTreeMap<ParticipantId, EntityMirror>,
    next_incarnation: u64,
}

impl Reconciler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_join_relay<E: Embodiment>(
        &mut self,
        msg: &JoinRelay,
        local: Option<ParticipantId>,
        embodiment: &mut E,
    ) -> MirrorOutcome {
        let id = msg.id();
        if Some(id) == local {
            return MirrorOutcome::SelfReference;
        }

        match self.mirrors.get(&id).map(|m| m.departing) {
            Some(false) => {
                debug!(%id, "duplicate join relay ignored");
                return MirrorOutcome::Duplicate;
            }
            Some(true) => {
                // Rejoined inside the grace window: retire the old avatar now.
                self.mirrors.remove(&id);
                embodiment.despawn(id);
            }
            None => {}
        }

        let (position, orientation) = match msg.root() {
            Ok(root) => root,
            Err(err) => {
                debug!(%id, %err, "malformed join relay");
                return MirrorOutcome::Malformed(err);
            }
        };

        let pose = AvatarPose::from_root(position, orientation);
        let incarnation = self.next_incarnation;
        self.next_incarnation += 1;

        self.mirrors.insert(
            id,
            EntityMirror {
                id,
                pose,
                incarnation,
                departing: false,
            },
        );
        embodiment.spawn(id, &pose);
        info!(%id, "remote participant mirrored");
        MirrorOutcome::Spawned
    }

    pub fn on_pose_update<E: Embodiment>(
        &mut self,
        msg: &PoseUpdate,
        local: Option<ParticipantId>,
        embodiment: &mut E,
    ) -> MirrorOutcome {
        let id = msg.id();
        if Some(id) == local {
            return MirrorOutcome::SelfReference;
        }

        let Some(mirror) = self.mirrors.get_mut(&id).filter(|m| !m.departing) else {
            trace!(%id, "pose for unmirrored participant dropped");
            return MirrorOutcome::Unknown;
        };

        let pose = match msg.pose() {
            Ok(pose) => pose.clamped(),
            Err(err) => {
                debug!(%id, %err, "malformed pose dropped");
                return MirrorOutcome::Malformed(err);
            }
        };

        mirror.pose = pose;
        embodiment.update(id, &pose);
        MirrorOutcome::Updated
    }

    /// Mark a mirror as departing. It stops accepting poses immediately.
    pub fn on_leave_relay(&mut self, msg: &LeaveRelay) -> MirrorOutcome {
        let id = msg.id();
        match self.mirrors.get_mut(&id) {
            Some(mirror) if !mirror.departing => {
                mirror.departing = true;
                debug!(%id, "remote participant departing");
                MirrorOutcome::Departing {
                    incarnation: mirror.incarnation,
                }
            }
            Some(_) => MirrorOutcome::Duplicate,
            None => {
                debug!(%id, "leave for unmirrored participant dropped");
                MirrorOutcome::Unknown
            }
        }
    }

    /// Destroy a departing mirror once its grace delay has elapsed.
    ///
    /// Returns false if the mirror was already removed or replaced.
    pub fn finalize_departure<E: Embodiment>(
        &mut self,
        id: ParticipantId,
        incarnation: u64,
        embodiment: &mut E,
    ) -> bool {
        let matches = self
            .mirrors
            .get(&id)
            .is_some_and(|m| m.departing && m.incarnation == incarnation);
        if !matches {
            return false;
        }

        self.mirrors.remove(&id);
        embodiment.despawn(id);
        info!(%id, "remote participant removed");
        true
    }

    /// Destroy every mirror at once.
    pub fn clear<E: Embodiment>(&mut self, embodiment: &mut E) -> usize {
        let mirrors = std::mem::take(&mut self.mirrors);
        for id in mirrors.keys() {
            embodiment.despawn(*id);
        }
        if !mirrors.is_empty() {
            info!(count = mirrors.len(), "mirror table cleared");
        }
        mirrors.len()
    }

    pub fn get(&self, id: ParticipantId) -> Option<&EntityMirror> {
        self.mirrors.get(&id)
    }

    /// True if poses for `id` are currently applied.
    pub fn is_live(&self, id: ParticipantId) -> bool {
        self.mirrors.get(&id).is_some_and(|m| !m.departing)
    }

    pub fn len(&self) -> usize {
        self.mirrors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mirrors.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = ParticipantId> + '_ {
        self.mirrors.keys().copied()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use proptest::prelude::*;
    use seatsync_core::{Quat, Vec3};

    use super::*;

    #[derive(Debug, Default)]
    struct Log {
        spawned: Vec<ParticipantId>,
        updated: Vec<(ParticipantId, AvatarPose)>,
        despawned: Vec<ParticipantId>,
    }

    impl Embodiment for Log {
        fn spawn(&mut self, id: ParticipantId, _pose: &AvatarPose) {
            self.spawned.push(id);
        }

        fn update(&mut self, id: ParticipantId, pose: &AvatarPose) {
            self.updated.push((id, *pose));
        }

        fn despawn(&mut self, id: ParticipantId) {
            self.despawned.push(id);
        }
    }

    fn pid(n: u64) -> ParticipantId {
        ParticipantId::new(n)
    }

    fn join(id: ParticipantId) -> JoinRelay {
        JoinRelay::new(id, Vec3::new(1.0, 0.0, 0.0), Quat::IDENTITY)
    }

    fn pose(id: ParticipantId, x: f32) -> PoseUpdate {
        PoseUpdate::new(
            id,
            &AvatarPose {
                expression: 0.5,
                ..AvatarPose::from_root(Vec3::new(x, 0.0, 0.0), Quat::IDENTITY)
            },
        )
    }

    #[test]
    fn test_join_creates_mirror_once() {
        let mut rec = Reconciler::new();
        let mut log = Log::default();

        assert_eq!(rec.on_join_relay(&join(pid(2)), Some(pid(1)), &mut log), MirrorOutcome::Spawned);
        assert_eq!(rec.on_join_relay(&join(pid(2)), Some(pid(1)), &mut log), MirrorOutcome::Duplicate);

        assert_eq!(log.spawned, vec![pid(2)]);
        assert_eq!(rec.len(), 1);
        assert_eq!(rec.get(pid(2)).unwrap().pose.position, Vec3::new(1.0, 0.0, 0.0));
    }

    #[test]
    fn test_never_mirrors_self() {
        let mut rec = Reconciler::new();
        let mut log = Log::default();

        assert_eq!(
            rec.on_join_relay(&join(pid(1)), Some(pid(1)), &mut log),
            MirrorOutcome::SelfReference
        );
        assert!(rec.is_empty());
        assert!(log.spawned.is_empty());
    }

    #[test]
    fn test_pose_before_join_dropped() {
        let mut rec = Reconciler::new();
        let mut log = Log::default();

        assert_eq!(rec.on_pose_update(&pose(pid(2), 3.0), None, &mut log), MirrorOutcome::Unknown);
        assert!(log.updated.is_empty());
    }

    #[test]
    fn test_pose_last_write_wins() {
        let mut rec = Reconciler::new();
        let mut log = Log::default();
        rec.on_join_relay(&join(pid(2)), None, &mut log);

        rec.on_pose_update(&pose(pid(2), 5.0), None, &mut log);
        // Older datagram arriving late still overwrites.
        rec.on_pose_update(&pose(pid(2), 4.0), None, &mut log);

        assert_eq!(rec.get(pid(2)).unwrap().pose.position.x, 4.0);
        assert_eq!(log.updated.len(), 2);
    }

    #[test]
    fn test_pose_expression_clamped() {
        let mut rec = Reconciler::new();
        let mut log = Log::default();
        rec.on_join_relay(&join(pid(2)), None, &mut log);

        let mut msg = pose(pid(2), 0.0);
        msg.expression_intensity = 3.0;
        assert_eq!(rec.on_pose_update(&msg, None, &mut log), MirrorOutcome::Updated);
        assert_eq!(rec.get(pid(2)).unwrap().pose.expression, 1.0);
    }

    #[test]
    fn test_malformed_pose_leaves_mirror_unchanged() {
        let mut rec = Reconciler::new();
        let mut log = Log::default();
        rec.on_join_relay(&join(pid(2)), None, &mut log);

        let mut msg = pose(pid(2), 9.0);
        msg.head_position = None;
        assert!(matches!(
            rec.on_pose_update(&msg, None, &mut log),
            MirrorOutcome::Malformed(_)
        ));
        assert_eq!(rec.get(pid(2)).unwrap().pose.position.x, 1.0);
    }

    #[test]
    fn test_leave_stops_poses_then_finalizes() {
        let mut rec = Reconciler::new();
        let mut log = Log::default();
        rec.on_join_relay(&join(pid(2)), None, &mut log);

        let MirrorOutcome::Departing { incarnation } = rec.on_leave_relay(&LeaveRelay::new(pid(2)))
        else {
            panic!("expected departure");
        };
        assert!(!rec.is_live(pid(2)));
        assert_eq!(rec.on_pose_update(&pose(pid(2), 7.0), None, &mut log), MirrorOutcome::Unknown);
        assert_eq!(rec.on_leave_relay(&LeaveRelay::new(pid(2))), MirrorOutcome::Duplicate);
        assert!(log.despawned.is_empty());

        assert!(rec.finalize_departure(pid(2), incarnation, &mut log));
        assert!(!rec.finalize_departure(pid(2), incarnation, &mut log));
        assert_eq!(log.despawned, vec![pid(2)]);
        assert!(rec.is_empty());
    }

    #[test]
    fn test_leave_for_unknown_dropped() {
        let mut rec = Reconciler::new();
        assert_eq!(rec.on_leave_relay(&LeaveRelay::new(pid(4))), MirrorOutcome::Unknown);
    }

    #[test]
    fn test_rejoin_during_grace_replaces_mirror() {
        let mut rec = Reconciler::new();
        let mut log = Log::default();
        rec.on_join_relay(&join(pid(2)), None, &mut log);
        let MirrorOutcome::Departing { incarnation } = rec.on_leave_relay(&LeaveRelay::new(pid(2)))
        else {
            panic!("expected departure");
        };

        assert_eq!(rec.on_join_relay(&join(pid(2)), None, &mut log), MirrorOutcome::Spawned);
        assert_eq!(log.despawned, vec![pid(2)]);
        assert!(rec.is_live(pid(2)));

        // The stale grace timer must not remove the new mirror.
        assert!(!rec.finalize_departure(pid(2), incarnation, &mut log));
        assert!(rec.is_live(pid(2)));
    }

    #[test]
    fn test_clear_destroys_all() {
        let mut rec = Reconciler::new();
        let mut log = Log::default();
        for n in 2..5 {
            rec.on_join_relay(&join(pid(n)), None, &mut log);
        }
        rec.on_leave_relay(&LeaveRelay::new(pid(3)));

        assert_eq!(rec.clear(&mut log), 3);
        assert!(rec.is_empty());
        assert_eq!(log.despawned, vec![pid(2), pid(3), pid(4)]);
    }

    #[derive(Debug, Clone)]
    enum Relay {
        Join(u64),
        Pose(u64),
        Leave(u64),
    }

    fn relay_strategy() -> impl Strategy<Value = Relay> {
        prop_oneof![
            (0u64..4).prop_map(Relay::Join),
            (0u64..4).prop_map(Relay::Pose),
            (0u64..4).prop_map(Relay::Leave),
        ]
    }

    proptest! {
        /// A pose is applied iff a join was seen and no leave since.
        #[test]
        fn prop_pose_applied_iff_joined(relays in prop::collection::vec(relay_strategy(), 0..64)) {
            let mut rec = Reconciler::new();
            let mut log = Log::default();
            let mut joined: HashSet<u64> = HashSet::new();

            for relay in relays {
                match relay {
                    Relay::Join(n) => {
                        rec.on_join_relay(&join(pid(n)), None, &mut log);
                        joined.insert(n);
                    }
                    Relay::Leave(n) => {
                        if let MirrorOutcome::Departing { incarnation } =
                            rec.on_leave_relay(&LeaveRelay::new(pid(n)))
                        {
                            rec.finalize_departure(pid(n), incarnation, &mut log);
                        }
                        joined.remove(&n);
                    }
                    Relay::Pose(n) => {
                        let applied = rec.on_pose_update(&pose(pid(n), 1.0), None, &mut log)
                            == MirrorOutcome::Updated;
                        prop_assert_eq!(applied, joined.contains(&n));
                    }
                }
            }
        }
    }
}
