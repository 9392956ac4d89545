//! Game-integration boundary. The adapter on the game side owns the sender
//! half of an mpsc channel and reports joins, moves, leaves and
//! session-ready; this side folds those into the world cache and republishes
//! them on a broadcast bus that pending session tasks subscribe to.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tracing::debug;

use pv_control::{ParticipantId, PlayerWorldState, WorldCache};

use pv_wire::envelope::ServerEnvelope;
use crate::state::PushHub;

#[derive(Clone, Debug)]
pub enum WorldEvent {
    PlayerJoined { player: ParticipantId, state: PlayerWorldState },
    PlayerMoved { player: ParticipantId, state: PlayerWorldState },
    PlayerLeft { player: ParticipantId },
    /// The game session backing a pending voice session is ready.
    SessionReady { player: ParticipantId },
}

impl WorldEvent {
    pub fn player(&self) -> ParticipantId {
        match self {
            Self::PlayerJoined { player, .. }
            | Self::PlayerMoved { player, .. }
            | Self::PlayerLeft { player }
            | Self::SessionReady { player } => *player,
        }
    }
}

pub async fn run_world_feed(
    mut rx: mpsc::Receiver<WorldEvent>,
    world: Arc<WorldCache>,
    bus: broadcast::Sender<WorldEvent>,
    pushes: Arc<PushHub>,
) {
    while let Some(event) = rx.recv().await {
        match &event {
            WorldEvent::PlayerJoined { player, state }
            | WorldEvent::PlayerMoved { player, state } => {
                world.update(*player, state.clone()).await;
                pushes
                    .send_to(
                        *player,
                        ServerEnvelope::PositionUpdate {
                            position: state.position,
                            world: state.world.clone(),
                        },
                    )
                    .await;
            }
            WorldEvent::PlayerLeft { player } => {
                world.remove(*player).await;
            }
            WorldEvent::SessionReady { .. } => {}
        }
        // Only pending sessions listen; a lagging receiver just re-checks the
        // cache.
        if bus.send(event.clone()).is_err() {
            debug!("no world event subscribers");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn feed_updates_world_cache() {
        let world = Arc::new(WorldCache::new());
        let pushes = Arc::new(PushHub::default());
        let (tx, rx) = mpsc::channel(16);
        let (bus, mut bus_rx) = broadcast::channel(16);

        let feed = tokio::spawn(run_world_feed(rx, world.clone(), bus, pushes));

        let p = ParticipantId::new();
        let state = PlayerWorldState {
            position: [1.0, 2.0, 3.0],
            yaw: 0.0,
            pitch: 0.0,
            world: "overworld".into(),
        };
        tx.send(WorldEvent::PlayerJoined { player: p, state }).await.unwrap();

        let ev = bus_rx.recv().await.unwrap();
        assert_eq!(ev.player(), p);
        assert_eq!(world.get(p).await.unwrap().position, [1.0, 2.0, 3.0]);

        tx.send(WorldEvent::PlayerLeft { player: p }).await.unwrap();
        bus_rx.recv().await.unwrap();
        assert!(world.get(p).await.is_none());

        drop(tx);
        feed.await.unwrap();
    }
}
