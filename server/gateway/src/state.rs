//! Top-level gateway state. One `GatewayState` value owns the registry, the
//! world cache, the group manager, the router and the push hub; session tasks
//! and transport listeners get an `Arc` and nothing owns anything else's
//! storage. Cross-component notification is queues, not callbacks.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};

use pv_control::{
    ControlEvent, GroupManager, GroupState, GroupSummary, ParticipantId, SessionRegistry,
    WorldCache,
};
use pv_media::{RecipientHandle, RouterMetrics, VoiceRouter};
use pv_wire::Packet;

use crate::adapter::WorldEvent;
use crate::auth::AuthProvider;
use crate::config::Config;
use crate::datagram::DatagramTx;
use pv_wire::envelope::{GroupStateJson, GroupSummaryJson, PlayerEntry, ServerEnvelope};
use crate::peerlink::PeerConnector;

/// Per-connection push sender. One writer task per connection owns the
/// socket sink; everyone else enqueues through here.
#[derive(Default)]
pub struct PushHub {
    inner: DashMap<ParticipantId, mpsc::Sender<ServerEnvelope>>,
}

impl PushHub {
    pub fn register(&self, player: ParticipantId, tx: mpsc::Sender<ServerEnvelope>) {
        self.inner.insert(player, tx);
    }

    pub fn unregister(&self, player: ParticipantId) {
        self.inner.remove(&player);
    }

    pub async fn send_to(&self, player: ParticipantId, msg: ServerEnvelope) {
        if let Some(tx) = self.inner.get(&player).map(|e| e.value().clone()) {
            // Drop on backpressure; the control channel must never block the
            // caller.
            let _ = tx.try_send(msg);
        }
    }

    pub async fn broadcast(&self, msg: ServerEnvelope, except: Option<ParticipantId>) {
        let targets: Vec<_> =
            self.inner.iter().map(|e| (*e.key(), e.value().clone())).collect();
        for (player, tx) in targets {
            if Some(player) == except {
                continue;
            }
            let _ = tx.try_send(msg.clone());
        }
    }
}

/// Media-wire credentials issued at control-channel auth, checked when the
/// binary AUTH arrives on the datagram socket.
#[derive(Clone, Debug)]
pub struct MediaAuth {
    pub secret: String,
    pub sample_rate: u32,
}

/// Live datagram binding for one participant. Presence means the send worker
/// is running on that participant's queue.
pub struct MediaBinding {
    pub tx: Arc<DatagramTx>,
}

pub struct GatewayState {
    pub cfg: Config,
    pub auth: Arc<dyn AuthProvider>,
    pub registry: Arc<SessionRegistry<RecipientHandle>>,
    pub world: Arc<WorldCache>,
    pub groups: Arc<GroupManager>,
    pub router: Arc<VoiceRouter>,
    pub pushes: Arc<PushHub>,
    pub router_metrics: Arc<dyn RouterMetrics>,
    pub session_metrics: pv_metrics::SessionMetrics,
    pub udp: Arc<UdpSocket>,
    pub peer_connector: Arc<dyn PeerConnector>,

    /// Game adapter event bus; pending sessions subscribe.
    pub world_bus: broadcast::Sender<WorldEvent>,
    /// Sender side of the adapter feed; dev mode injects through it.
    pub world_feed: mpsc::Sender<WorldEvent>,

    pub media_auth: DashMap<ParticipantId, MediaAuth>,
    pub media_bindings: DashMap<ParticipantId, MediaBinding>,
    pub addr_sessions: DashMap<SocketAddr, ParticipantId>,
    /// Close signal per session task; carries a human-readable reason.
    pub close_txs: DashMap<ParticipantId, mpsc::Sender<String>>,
    pub degraded_tx: mpsc::Sender<ParticipantId>,

    shutting_down: AtomicBool,
}

impl GatewayState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: Config,
        auth: Arc<dyn AuthProvider>,
        registry: Arc<SessionRegistry<RecipientHandle>>,
        world: Arc<WorldCache>,
        groups: Arc<GroupManager>,
        router: Arc<VoiceRouter>,
        router_metrics: Arc<dyn RouterMetrics>,
        udp: Arc<UdpSocket>,
        peer_connector: Arc<dyn PeerConnector>,
        world_bus: broadcast::Sender<WorldEvent>,
        world_feed: mpsc::Sender<WorldEvent>,
        degraded_tx: mpsc::Sender<ParticipantId>,
    ) -> Self {
        Self {
            cfg,
            auth,
            registry,
            world,
            groups,
            router,
            pushes: Arc::new(PushHub::default()),
            router_metrics,
            session_metrics: pv_metrics::SessionMetrics::new("pv"),
            udp,
            peer_connector,
            world_bus,
            world_feed,
            media_auth: DashMap::new(),
            media_bindings: DashMap::new(),
            addr_sessions: DashMap::new(),
            close_txs: DashMap::new(),
            degraded_tx,
            shutting_down: AtomicBool::new(false),
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Fan out control events from the registry / group manager.
    pub async fn apply_events(&self, events: Vec<ControlEvent>) {
        for event in events {
            match event {
                ControlEvent::NameAnnounced { player, short, name } => {
                    info!(%player, %short, name = %name, "participant announced");
                    self.broadcast_player_list().await;
                    self.push_binary_to_media_peers(
                        &Packet::PlayerName { player: player.0, short, name },
                        None,
                    )
                    .await;
                }
                ControlEvent::MuteChanged { player, muted } => {
                    self.pushes
                        .broadcast(
                            ServerEnvelope::UserMuteStatus { player_id: player.0, muted },
                            Some(player),
                        )
                        .await;
                    self.pushes.send_to(player, ServerEnvelope::SetMicMute { muted }).await;
                }
                ControlEvent::SpeakingChanged { player, speaking } => {
                    self.pushes
                        .broadcast(
                            ServerEnvelope::UserSpeakingStatus { player_id: player.0, speaking },
                            Some(player),
                        )
                        .await;
                }
                ControlEvent::GroupStateChanged { state, recipients } => {
                    let json = group_state_json(&state);
                    for r in recipients {
                        self.pushes
                            .send_to(
                                r,
                                ServerEnvelope::GroupMembersUpdated { group: json.clone() },
                            )
                            .await;
                    }
                }
                ControlEvent::GroupListChanged { groups } => {
                    self.pushes
                        .broadcast(
                            ServerEnvelope::GroupList {
                                groups: groups.iter().map(group_summary_json).collect(),
                            },
                            None,
                        )
                        .await;
                }
                ControlEvent::PlayerLeft { player } => {
                    let _ = player;
                    self.broadcast_player_list().await;
                }
            }
        }
    }

    pub async fn player_list(&self) -> Vec<PlayerEntry> {
        let mut players: Vec<PlayerEntry> = self
            .registry
            .list()
            .await
            .into_iter()
            .map(|p| PlayerEntry {
                player_id: p.id.0,
                short_id: p.short.0,
                name: p.name,
                muted: p.muted,
                speaking: p.speaking,
            })
            .collect();
        players.sort_by(|a, b| a.name.cmp(&b.name));
        players
    }

    pub async fn broadcast_player_list(&self) {
        let players = self.player_list().await;
        self.pushes.broadcast(ServerEnvelope::PlayerList { players }, None).await;
    }

    /// Push one binary control packet onto every datagram-bound peer's queue
    /// (it multiplexes with media on the same socket).
    pub async fn push_binary_to_media_peers(&self, packet: &Packet, except: Option<ParticipantId>) {
        let encoded = packet.encode();
        let targets: Vec<ParticipantId> =
            self.media_bindings.iter().map(|e| *e.key()).collect();
        for player in targets {
            if Some(player) == except {
                continue;
            }
            if let Some(handle) = self.registry.handle_of(player).await {
                handle.queue.push(encoded.clone());
            }
        }
    }

    /// Ask a session task to tear itself down.
    pub async fn request_close(&self, player: ParticipantId, reason: &str) {
        if let Some(tx) = self.close_txs.get(&player).map(|e| e.value().clone()) {
            let _ = tx.send(reason.to_string()).await;
        }
    }

    /// Release everything a session held. Called exactly once by the session
    /// task on its way out; must never leave a registry entry dangling.
    pub async fn teardown_session(&self, player: ParticipantId, reason: &str) {
        let departure = self.groups.handle_departure(player).await;
        self.apply_events(departure).await;

        if let Some(handle) = self.registry.handle_of(player).await {
            handle.queue.close();
        }
        let dropped = self.registry.drop_participant(player).await;
        self.world.remove(player).await;
        self.router.forget_stream(player).await;
        self.media_auth.remove(&player);

        if let Some((_, binding)) = self.media_bindings.remove(&player) {
            let addr = binding.tx.peer();
            self.addr_sessions.remove(&addr);
            // Best effort; the peer may already be gone.
            let ack = Packet::DisconnectAck { reason: reason.to_string() }.encode();
            let _ = self.udp.send_to(&ack, addr).await;
        }

        self.pushes
            .send_to(player, ServerEnvelope::Disconnected { reason: reason.to_string() })
            .await;
        self.pushes.unregister(player);
        self.close_txs.remove(&player);

        if dropped.is_some() {
            info!(%player, reason, "session closed");
            self.broadcast_player_list().await;
        }
    }

    /// Broadcast SERVER_SHUTDOWN / `disconnected` and close every session.
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        warn!("gateway shutting down, disconnecting all sessions");
        self.push_binary_to_media_peers(&Packet::ServerShutdown, None).await;
        self.pushes
            .broadcast(
                ServerEnvelope::Disconnected { reason: "server shutting down".into() },
                None,
            )
            .await;
        let players: Vec<ParticipantId> =
            self.close_txs.iter().map(|e| *e.key()).collect();
        for player in players {
            self.request_close(player, "server shutting down").await;
        }
    }

    pub async fn group_list_json(&self) -> Vec<GroupSummaryJson> {
        self.groups.list().await.iter().map(group_summary_json).collect()
    }
}

/// Assemble the full gateway: stores, router, media socket, background
/// tasks. Returns the shared state; the caller runs the signaling loop.
pub async fn bootstrap(
    cfg: Config,
    auth: Arc<dyn AuthProvider>,
    peer_connector: Arc<dyn PeerConnector>,
    router_metrics: Arc<dyn RouterMetrics>,
) -> anyhow::Result<Arc<GatewayState>> {
    use anyhow::Context as _;

    let registry = Arc::new(SessionRegistry::new());
    let world = Arc::new(WorldCache::new());
    let groups = Arc::new(GroupManager::new());

    let router = Arc::new(VoiceRouter::new(
        pv_media::RouterConfig {
            proximity_range: cfg.proximity_range,
            max_frame_bytes: crate::datagram::MAX_DATAGRAM_BYTES,
            per_recipient_queue: 64,
        },
        registry.clone(),
        world.clone(),
        groups.clone(),
        router_metrics.clone(),
    ));

    let media_addr = SocketAddr::from(([0, 0, 0, 0], cfg.media_port));
    let udp = Arc::new(UdpSocket::bind(media_addr).await.context("bind media port")?);

    let (world_feed_tx, world_feed_rx) = mpsc::channel(1024);
    let (world_bus, _) = broadcast::channel(1024);
    let (degraded_tx, mut degraded_rx) = mpsc::channel::<ParticipantId>(64);

    let state = Arc::new(GatewayState::new(
        cfg,
        auth,
        registry,
        world.clone(),
        groups,
        router,
        router_metrics,
        udp,
        peer_connector,
        world_bus.clone(),
        world_feed_tx,
        degraded_tx,
    ));

    tokio::spawn(crate::adapter::run_world_feed(
        world_feed_rx,
        world,
        world_bus,
        state.pushes.clone(),
    ));

    let dg_state = state.clone();
    tokio::spawn(async move {
        if let Err(e) = crate::datagram::run_datagram_listener(dg_state).await {
            tracing::error!("datagram listener failed: {e:#}");
        }
    });

    let reap_state = state.clone();
    tokio::spawn(async move {
        while let Some(player) = degraded_rx.recv().await {
            reap_state.request_close(player, "transport degraded").await;
        }
    });

    Ok(state)
}

pub fn group_state_json(state: &GroupState) -> GroupStateJson {
    GroupStateJson {
        group_id: state.id.0,
        name: state.name.clone(),
        creator_id: state.creator.0,
        permanent: state.permanent,
        isolated: state.isolated,
        max_members: state.max_members,
        members: state.members.iter().map(|m| m.0).collect(),
    }
}

pub fn group_summary_json(summary: &GroupSummary) -> GroupSummaryJson {
    GroupSummaryJson {
        group_id: summary.id.0,
        name: summary.name.clone(),
        permanent: summary.permanent,
        isolated: summary.isolated,
        member_count: summary.member_count,
        max_members: summary.max_members,
    }
}
