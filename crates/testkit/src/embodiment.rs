//! Embodiment that records every call it receives.

use std::collections::BTreeMap;

use seatsync_client::Embodiment;
use seatsync_core::{AvatarPose, LifecycleState, ParticipantId, SeatIndex};

#[derive(Debug, Clone, PartialEq)]
pub enum EmbodimentEvent {
    Spawn(ParticipantId),
    Update(ParticipantId),
    Despawn(ParticipantId),
    Seat(SeatIndex),
    Lifecycle(LifecycleState),
}

/// Records calls and tracks which avatars are currently instantiated.
#[derive(Debug, Default)]
pub struct RecordingEmbodiment {
    pub events: Vec<EmbodimentEvent>,
    /// Instantiated avatars and their last applied pose.
    pub live: BTreeMap<ParticipantId, AvatarPose>,
    /// Spawn calls for an id that was already instantiated.
    pub duplicate_spawns: usize,
    /// Update calls for an id that was never spawned or already despawned.
    pub orphan_updates: usize,
    /// Despawn calls for an id that is not instantiated.
    pub orphan_despawns: usize,
}

impl RecordingEmbodiment {
    pub fn live_ids(&self) -> Vec<ParticipantId> {
        self.live.keys().copied().collect()
    }

    pub fn seats(&self) -> Vec<SeatIndex> {
        self.events
            .iter()
            .filter_map(|e| match e {
                EmbodimentEvent::Seat(seat) => Some(*seat),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, wanted: &EmbodimentEvent) -> usize {
        self.events.iter().filter(|e| *e == wanted).count()
    }

    /// Index of the first occurrence of `wanted`.
    pub fn position(&self, wanted: &EmbodimentEvent) -> Option<usize> {
        self.events.iter().position(|e| e == wanted)
    }
}

impl Embodiment for RecordingEmbodiment {
    fn spawn(&mut self, id: ParticipantId, pose: &AvatarPose) {
        if self.live.insert(id, *pose).is_some() {
            self.duplicate_spawns += 1;
        }
        self.events.push(EmbodimentEvent::Spawn(id));
    }

    fn update(&mut self, id: ParticipantId, pose: &AvatarPose) {
        match self.live.get_mut(&id) {
            Some(live) => *live = *pose,
            None => self.orphan_updates += 1,
        }
        self.events.push(EmbodimentEvent::Update(id));
    }

    fn despawn(&mut self, id: ParticipantId) {
        if self.live.remove(&id).is_none() {
            self.orphan_despawns += 1;
        }
        self.events.push(EmbodimentEvent::Despawn(id));
    }

    fn seat_assigned(&mut self, seat: SeatIndex) {
        self.events.push(EmbodimentEvent::Seat(seat));
    }

    fn lifecycle_changed(&mut self, state: LifecycleState) {
        self.events.push(EmbodimentEvent::Lifecycle(state));
    }
}
