//! World-state cache: the latest placement per participant, fed by the game
//! adapter. Records are replaced wholesale under the write lock, and the
//! routing engine takes a point-in-time snapshot per inbound frame so a
//! concurrent move cannot change a routing decision mid-fanout.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::ids::ParticipantId;
use crate::model::PlayerWorldState;

#[derive(Default)]
pub struct WorldCache {
    inner: RwLock<HashMap<ParticipantId, PlayerWorldState>>,
}

/// Immutable copy of the cache at one instant.
#[derive(Clone, Debug, Default)]
pub struct WorldSnapshot {
    entries: Arc<HashMap<ParticipantId, PlayerWorldState>>,
}

impl WorldSnapshot {
    pub fn get(&self, id: ParticipantId) -> Option<&PlayerWorldState> {
        self.entries.get(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ParticipantId, &PlayerWorldState)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl WorldCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn update(&self, id: ParticipantId, state: PlayerWorldState) {
        self.inner.write().await.insert(id, state);
    }

    /// Absence afterwards is distinguishable from "at origin": the entry is
    /// gone, not zeroed.
    pub async fn remove(&self, id: ParticipantId) {
        self.inner.write().await.remove(&id);
    }

    pub async fn get(&self, id: ParticipantId) -> Option<PlayerWorldState> {
        self.inner.read().await.get(&id).cloned()
    }

    pub async fn snapshot(&self) -> WorldSnapshot {
        let g = self.inner.read().await;
        WorldSnapshot { entries: Arc::new(g.clone()) }
    }
}
