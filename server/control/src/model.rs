use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{GroupId, ParticipantId};
use pv_wire::ShortId;

/// Public view of a registered participant. The registry owns the canonical
/// record; everything here is a copy handed out per lookup.
#[derive(Clone, Debug)]
pub struct Participant {
    pub id: ParticipantId,
    pub short: ShortId,
    pub name: String,
    pub muted: bool,
    pub speaking: bool,
    pub voice_connected: bool,
    pub joined_at: DateTime<Utc>,
}

/// Latest world placement of a participant, written by the game adapter.
/// Replaced wholesale on every update so readers never see a torn tuple.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PlayerWorldState {
    pub position: [f32; 3],
    pub yaw: f32,
    pub pitch: f32,
    pub world: String,
}

/// Group creation input.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GroupCreate {
    pub name: String,
    pub permanent: bool,
    pub isolated: bool,
    /// 0 means unlimited.
    pub max_members: u16,
}

/// Snapshot of one group for list pushes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GroupSummary {
    pub id: GroupId,
    pub name: String,
    pub permanent: bool,
    pub isolated: bool,
    pub member_count: u16,
    pub max_members: u16,
}

/// Routing-facing view of the sender's group.
#[derive(Clone, Debug, PartialEq)]
pub struct GroupView {
    pub id: GroupId,
    pub isolated: bool,
    pub members: Vec<ParticipantId>,
}

/// Full state of one group, pushed to its members on every change.
#[derive(Clone, Debug, PartialEq)]
pub struct GroupState {
    pub id: GroupId,
    pub name: String,
    pub creator: ParticipantId,
    pub permanent: bool,
    pub isolated: bool,
    pub max_members: u16,
    pub members: Vec<ParticipantId>,
}
