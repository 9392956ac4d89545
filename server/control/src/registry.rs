//! Session registry: stable id <-> short id <-> transport handle.
//!
//! The registry owns participant records; other components refer to
//! participants by id and look them up per call. `H` is the transport handle
//! type, kept generic so this crate stays below the transport layer.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::errors::{ControlError, ControlResult};
use crate::events::ControlEvent;
use crate::ids::ParticipantId;
use crate::model::Participant;
use pv_wire::{short_id_for, ShortId};

/// How long a released short id stays unassignable, so a stale media frame
/// cannot cross-wire into a new session.
pub const SHORT_ID_QUARANTINE: Duration = Duration::from_secs(10);

const MAX_COLLISION_ATTEMPTS: u32 = 64;

struct Record<H> {
    participant: Participant,
    handle: H,
}

struct Inner<H> {
    by_id: HashMap<ParticipantId, Record<H>>,
    by_short: HashMap<u32, ParticipantId>,
    quarantine: HashMap<u32, Instant>,
}

pub struct SessionRegistry<H> {
    salt: u32,
    inner: RwLock<Inner<H>>,
}

impl<H: Clone + Send + Sync> SessionRegistry<H> {
    pub fn new() -> Self {
        // Any per-process value works; the salt only has to differ between
        // runs so short ids are not globally stable.
        let salt = uuid::Uuid::new_v4().as_u128() as u32;
        Self::with_salt(salt)
    }

    pub fn with_salt(salt: u32) -> Self {
        Self {
            salt,
            inner: RwLock::new(Inner {
                by_id: HashMap::new(),
                by_short: HashMap::new(),
                quarantine: HashMap::new(),
            }),
        }
    }

    /// Register a participant and assign its short id, retrying past hash
    /// collisions and quarantined ids.
    pub async fn register(
        &self,
        id: ParticipantId,
        name: String,
        handle: H,
    ) -> ControlResult<(ShortId, Vec<ControlEvent>)> {
        let mut g = self.inner.write().await;
        if g.by_id.contains_key(&id) {
            return Err(ControlError::AlreadyExists("participant"));
        }

        let now = Instant::now();
        g.quarantine.retain(|_, released| now.duration_since(*released) < SHORT_ID_QUARANTINE);

        let mut short = None;
        for attempt in 0..MAX_COLLISION_ATTEMPTS {
            let candidate = short_id_for(&id.0, self.salt, attempt);
            if g.by_short.contains_key(&candidate.0) || g.quarantine.contains_key(&candidate.0) {
                debug!(%id, attempt, "short id collision, retrying");
                continue;
            }
            short = Some(candidate);
            break;
        }
        let short = short.ok_or(ControlError::ResourceExhausted("short id space"))?;

        let participant = Participant {
            id,
            short,
            name: name.clone(),
            muted: false,
            speaking: false,
            voice_connected: false,
            joined_at: Utc::now(),
        };
        g.by_short.insert(short.0, id);
        g.by_id.insert(id, Record { participant, handle });

        Ok((short, vec![ControlEvent::NameAnnounced { player: id, short, name }]))
    }

    /// Remove a participant; its short id enters quarantine.
    pub async fn drop_participant(&self, id: ParticipantId) -> Option<Participant> {
        let mut g = self.inner.write().await;
        let rec = g.by_id.remove(&id)?;
        g.by_short.remove(&rec.participant.short.0);
        g.quarantine.insert(rec.participant.short.0, Instant::now());
        Some(rec.participant)
    }

    pub async fn get(&self, id: ParticipantId) -> Option<Participant> {
        self.inner.read().await.by_id.get(&id).map(|r| r.participant.clone())
    }

    pub async fn resolve_by_short(&self, short: ShortId) -> Option<Participant> {
        let g = self.inner.read().await;
        let id = g.by_short.get(&short.0)?;
        g.by_id.get(id).map(|r| r.participant.clone())
    }

    pub async fn handle_of(&self, id: ParticipantId) -> Option<H> {
        self.inner.read().await.by_id.get(&id).map(|r| r.handle.clone())
    }

    /// Replace the transport handle, fixed at session-ready time.
    pub async fn set_handle(&self, id: ParticipantId, handle: H) -> ControlResult<()> {
        let mut g = self.inner.write().await;
        let rec = g.by_id.get_mut(&id).ok_or(ControlError::NotFound("participant"))?;
        rec.handle = handle;
        Ok(())
    }

    pub async fn list(&self) -> Vec<Participant> {
        self.inner.read().await.by_id.values().map(|r| r.participant.clone()).collect()
    }

    pub async fn set_muted(
        &self,
        id: ParticipantId,
        muted: bool,
    ) -> ControlResult<Vec<ControlEvent>> {
        let mut g = self.inner.write().await;
        let rec = g.by_id.get_mut(&id).ok_or(ControlError::NotFound("participant"))?;
        if rec.participant.muted == muted {
            return Ok(vec![]);
        }
        rec.participant.muted = muted;
        Ok(vec![ControlEvent::MuteChanged { player: id, muted }])
    }

    pub async fn set_speaking(
        &self,
        id: ParticipantId,
        speaking: bool,
    ) -> ControlResult<Vec<ControlEvent>> {
        let mut g = self.inner.write().await;
        let rec = g.by_id.get_mut(&id).ok_or(ControlError::NotFound("participant"))?;
        if rec.participant.speaking == speaking {
            return Ok(vec![]);
        }
        rec.participant.speaking = speaking;
        Ok(vec![ControlEvent::SpeakingChanged { player: id, speaking }])
    }

    pub async fn set_voice_connected(&self, id: ParticipantId, connected: bool) -> ControlResult<()> {
        let mut g = self.inner.write().await;
        let rec = g.by_id.get_mut(&id).ok_or(ControlError::NotFound("participant"))?;
        if rec.participant.voice_connected && !connected {
            warn!(%id, "voice transport lost");
        }
        rec.participant.voice_connected = connected;
        Ok(())
    }
}

impl<H: Clone + Send + Sync> Default for SessionRegistry<H> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Reg = SessionRegistry<u8>;

    #[tokio::test]
    async fn register_assigns_unique_short_ids() {
        let reg = Reg::with_salt(42);
        let mut seen = std::collections::HashSet::new();
        for i in 0..64 {
            let id = ParticipantId::new();
            let (short, _) = reg.register(id, format!("p{i}"), 0).await.unwrap();
            assert!(seen.insert(short.0), "duplicate short id");
        }
    }

    #[tokio::test]
    async fn double_register_rejected() {
        let reg = Reg::with_salt(1);
        let id = ParticipantId::new();
        reg.register(id, "a".into(), 0).await.unwrap();
        assert_eq!(
            reg.register(id, "a".into(), 0).await.unwrap_err(),
            ControlError::AlreadyExists("participant")
        );
    }

    #[tokio::test]
    async fn resolve_round_trip() {
        let reg = Reg::with_salt(1);
        let id = ParticipantId::new();
        let (short, events) = reg.register(id, "alice".into(), 7).await.unwrap();
        assert!(matches!(events[0], ControlEvent::NameAnnounced { .. }));

        let p = reg.resolve_by_short(short).await.unwrap();
        assert_eq!(p.id, id);
        assert_eq!(p.name, "alice");
        assert_eq!(reg.handle_of(id).await, Some(7));
    }

    #[tokio::test]
    async fn dropped_short_id_is_quarantined() {
        let reg = Reg::with_salt(9);
        let id = ParticipantId::new();
        let (short, _) = reg.register(id, "a".into(), 0).await.unwrap();
        reg.drop_participant(id).await.unwrap();

        assert!(reg.resolve_by_short(short).await.is_none());

        // Re-registering the same stable id during the grace period must not
        // receive the quarantined short id back.
        let (short2, _) = reg.register(id, "a".into(), 0).await.unwrap();
        assert_ne!(short.0, short2.0);
    }

    #[tokio::test]
    async fn status_deltas_only_on_change() {
        let reg = Reg::with_salt(3);
        let id = ParticipantId::new();
        reg.register(id, "a".into(), 0).await.unwrap();

        assert_eq!(reg.set_muted(id, true).await.unwrap().len(), 1);
        assert!(reg.set_muted(id, true).await.unwrap().is_empty());
        assert_eq!(reg.set_speaking(id, true).await.unwrap().len(), 1);
        assert!(reg.get(id).await.unwrap().muted);
        assert!(reg.get(id).await.unwrap().speaking);
    }

    #[tokio::test]
    async fn unknown_participant_errors() {
        let reg = Reg::with_salt(3);
        assert!(reg.set_muted(ParticipantId::new(), true).await.is_err());
        assert!(reg.set_voice_connected(ParticipantId::new(), true).await.is_err());
    }
}
