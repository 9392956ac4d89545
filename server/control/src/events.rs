//! Typed control events. Stores return these from mutating calls; the gateway
//! drains them in order and fans them out. No callback registration anywhere.

use crate::ids::ParticipantId;
use crate::model::{GroupState, GroupSummary};
use pv_wire::ShortId;

#[derive(Clone, Debug)]
pub enum ControlEvent {
    /// Announce (or re-announce) a stable id <-> short id <-> name mapping to
    /// every connected participant.
    NameAnnounced {
        player: ParticipantId,
        short: ShortId,
        name: String,
    },
    /// Status deltas, broadcast to everyone but the subject.
    MuteChanged { player: ParticipantId, muted: bool },
    SpeakingChanged { player: ParticipantId, speaking: bool },
    /// Full state of one group, addressed to its current members (plus anyone
    /// who just left it).
    GroupStateChanged {
        state: GroupState,
        recipients: Vec<ParticipantId>,
    },
    /// Group roster changed in a way everyone should see.
    GroupListChanged { groups: Vec<GroupSummary> },
    PlayerLeft { player: ParticipantId },
}
