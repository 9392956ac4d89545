//! Proximity resolver: who hears a frame, how far away they are, and how
//! loud it arrives.
//!
//! Rules, in order:
//! - sender not placed in the world: nobody (the caller handles TEST_AUDIO,
//!   which bypasses proximity entirely);
//! - sender in an isolated group: exactly the other members, full volume,
//!   distance reported as zero;
//! - otherwise every placed participant in the sender's world inside range R
//!   with quadratic roll-off, and group members beyond R at full volume
//!   (membership adds recipients, it never subtracts);
//! - anyone without a live voice transport is excluded.
//!
//! Math is f64 internally; wire positions stay f32.

use std::collections::HashSet;

use pv_control::{GroupView, ParticipantId, WorldSnapshot};

pub const DEFAULT_PROXIMITY_RANGE: f32 = 30.0;

/// Below this distance the direction is meaningless; pan is centered.
const ORIGIN_EPSILON: f64 = 1e-4;

#[derive(Clone, Debug, PartialEq)]
pub struct RouteDecision {
    pub recipient: ParticipantId,
    pub distance: f32,
    /// Attenuation in [0, 1]; 1 means no distance roll-off.
    pub gain: f32,
    /// Sender position in the listener's frame (`P_s - P_p`); zero when the
    /// distance is below epsilon or the gain override applies.
    pub relative: [f32; 3],
}

pub fn resolve_recipients(
    sender: ParticipantId,
    snapshot: &WorldSnapshot,
    group: Option<&GroupView>,
    range: f32,
    voice_connected: &HashSet<ParticipantId>,
) -> Vec<RouteDecision> {
    let Some(sender_state) = snapshot.get(sender) else {
        return Vec::new();
    };

    if let Some(g) = group.filter(|g| g.isolated) {
        let mut out: Vec<RouteDecision> = g
            .members
            .iter()
            .filter(|m| **m != sender && voice_connected.contains(m))
            .map(|m| RouteDecision {
                recipient: *m,
                distance: 0.0,
                gain: 1.0,
                relative: [0.0; 3],
            })
            .collect();
        out.sort_by_key(|d| d.recipient.0);
        return out;
    }

    let range_f = range as f64;
    let sp = sender_state.position;
    let mut out = Vec::new();

    for (&p, state) in snapshot.iter() {
        if p == sender || state.world != sender_state.world {
            continue;
        }
        if !voice_connected.contains(&p) {
            continue;
        }

        let dx = sp[0] as f64 - state.position[0] as f64;
        let dy = sp[1] as f64 - state.position[1] as f64;
        let dz = sp[2] as f64 - state.position[2] as f64;
        let d = (dx * dx + dy * dy + dz * dz).sqrt();
        let in_group = group.map(|g| g.members.contains(&p)).unwrap_or(false);

        let gain = if d < range_f {
            let a = 1.0 - d / range_f;
            (a * a) as f32
        } else if in_group {
            // Group overrides distance: audible at full volume, non-spatial.
            1.0
        } else {
            continue;
        };

        let relative = if d < ORIGIN_EPSILON || gain >= 1.0 {
            [0.0; 3]
        } else {
            [dx as f32, dy as f32, dz as f32]
        };

        out.push(RouteDecision { recipient: p, distance: d as f32, gain, relative });
    }

    out.sort_by(|a, b| {
        a.distance
            .partial_cmp(&b.distance)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.recipient.0.cmp(&b.recipient.0))
    });
    out
}
