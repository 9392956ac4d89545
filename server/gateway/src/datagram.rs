//! UDP media transport. One socket serves every session; the binary AUTH
//! packet binds a remote address to an authenticated participant, and bound
//! addresses feed the router. Control packets on this path are single-datagram
//! and idempotent, so client-side retries are harmless.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use pv_control::ParticipantId;
use pv_media::{router::spawn_send_worker, FrameTx, TransportKind};
use pv_wire::{AuthCode, Packet};

use crate::state::{GatewayState, MediaBinding};

/// Datagram MTU; inbound frames above this never reach the router.
pub const MAX_DATAGRAM_BYTES: usize = 1400;

pub struct DatagramTx {
    socket: Arc<UdpSocket>,
    /// NAT rebinding moves a session to a new remote address mid-flight.
    peer: std::sync::RwLock<SocketAddr>,
}

impl DatagramTx {
    pub fn new(socket: Arc<UdpSocket>, peer: SocketAddr) -> Self {
        Self { socket, peer: std::sync::RwLock::new(peer) }
    }

    pub fn peer(&self) -> SocketAddr {
        *self.peer.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn rebind(&self, peer: SocketAddr) {
        *self.peer.write().unwrap_or_else(|e| e.into_inner()) = peer;
    }
}

#[async_trait]
impl FrameTx for DatagramTx {
    async fn send(&self, frame: Bytes) -> Result<()> {
        let peer = self.peer();
        self.socket.send_to(&frame, peer).await?;
        Ok(())
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Datagram
    }

    async fn close(&self) {}
}

pub async fn run_datagram_listener(state: Arc<GatewayState>) -> Result<()> {
    let socket = state.udp.clone();
    info!(addr = %socket.local_addr()?, "datagram transport listening");

    let mut buf = vec![0u8; 2048];
    loop {
        let (n, addr) = socket.recv_from(&mut buf).await?;
        if n > MAX_DATAGRAM_BYTES {
            debug!(%addr, len = n, "oversized datagram dropped");
            continue;
        }
        let data = Bytes::copy_from_slice(&buf[..n]);

        match Packet::decode(&data) {
            Ok(Packet::Auth { player, secret }) => {
                handle_media_auth(&state, addr, ParticipantId(player), &secret).await;
            }
            Ok(Packet::Audio(_)) | Ok(Packet::TestAudio(_)) => {
                let Some(player) = state.addr_sessions.get(&addr).map(|e| *e.value()) else {
                    debug!(%addr, "media from unbound address dropped");
                    continue;
                };
                state.router.handle_incoming(player, data).await;
            }
            Ok(Packet::Disconnect { reason }) => {
                if let Some(player) = state.addr_sessions.get(&addr).map(|e| *e.value()) {
                    info!(%player, reason = %reason, "datagram disconnect");
                    state.request_close(player, "client disconnect").await;
                }
            }
            Ok(other) => {
                debug!(%addr, packet = ?other, "unexpected control packet on media wire");
            }
            Err(e) => {
                debug!(%addr, error = %e, "undecodable datagram dropped");
            }
        }
    }
}

/// Verify the media secret issued over the control channel and bind the
/// address. Idempotent: a retried AUTH re-acks without side effects.
async fn handle_media_auth(
    state: &Arc<GatewayState>,
    addr: SocketAddr,
    player: ParticipantId,
    secret: &str,
) {
    let reply = |code: AuthCode, rate: u32| Packet::AuthAck { code, sample_rate: rate }.encode();

    if state.is_shutting_down() {
        let _ = state.udp.send_to(&reply(AuthCode::ServerNotReady, 0), addr).await;
        return;
    }

    let Some(auth) = state.media_auth.get(&player).map(|e| e.value().clone()) else {
        warn!(%player, %addr, "media auth for unknown session");
        let _ = state.udp.send_to(&reply(AuthCode::PlayerNotFound, 0), addr).await;
        return;
    };
    if auth.secret != secret {
        warn!(%player, %addr, "media auth with bad secret");
        let _ = state.udp.send_to(&reply(AuthCode::InvalidCredentials, 0), addr).await;
        return;
    }

    let Some(handle) = state.registry.handle_of(player).await else {
        let _ = state.udp.send_to(&reply(AuthCode::PlayerNotFound, 0), addr).await;
        return;
    };

    let already_bound = match state.media_bindings.get_mut(&player) {
        Some(mut entry) => {
            let old = entry.tx.peer();
            if old != addr {
                info!(%player, %old, %addr, "media address rebound");
                state.addr_sessions.remove(&old);
                entry.tx.rebind(addr);
            }
            true
        }
        None => false,
    };

    if !already_bound {
        let tx = Arc::new(DatagramTx::new(state.udp.clone(), addr));
        spawn_send_worker(
            player,
            handle.queue.clone(),
            tx.clone(),
            state.router_metrics.clone(),
            state.degraded_tx.clone(),
        );
        state.media_bindings.insert(player, MediaBinding { tx });
        info!(%player, %addr, "media transport bound");
    }
    state.addr_sessions.insert(addr, player);

    let _ = state.udp.send_to(&reply(AuthCode::Accepted, auth.sample_rate), addr).await;

    // Announce every known mapping so the peer can resolve short ids, then
    // start encoding toward it in the short form.
    for p in state.registry.list().await {
        let announce =
            Packet::PlayerName { player: p.id.0, short: p.short, name: p.name.clone() }.encode();
        handle.queue.push(announce);
    }
    handle.mark_announced();

    if let Err(e) = state.registry.set_voice_connected(player, true).await {
        warn!(%player, error = %e, "voice-connected flag");
    }
}
