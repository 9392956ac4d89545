//! Per-connection session driver and the authentication state machine.
//!
//! Unauthenticated -> Authenticating -> PendingGameSession -> Ready ->
//! Disconnecting -> Closed. Each connection is one task; its failure is its
//! own. Teardown releases every registry/world/group reference so nothing
//! dangles after cancellation.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc};
use tokio::time::{sleep, timeout, Instant};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

use pv_control::{ControlError, GroupCreate, GroupId, ParticipantId, PlayerWorldState};
use pv_media::{router::spawn_send_worker, RecipientHandle, SendQueue, TransportKind};
use pv_wire::AuthCode;

use crate::adapter::WorldEvent;
use crate::config::coerce_sample_rate;
use pv_wire::envelope::{
    encode_server, parse_client, ClientEnvelope, Inbound, MediaMode, ServerEnvelope,
};
use crate::peerlink::{DataChannelRx, DataChannelTx};
use crate::signaling::FramedTx;
use crate::state::{group_state_json, GatewayState, MediaAuth};

pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
pub const PENDING_GAME_SESSION_TIMEOUT: Duration = Duration::from_secs(30);

const FRAME_MS: u32 = 20;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionPhase {
    Unauthenticated,
    Authenticating,
    PendingGameSession,
    Ready,
    Disconnecting,
    Closed,
}

pub async fn run_connection<S>(
    state: Arc<GatewayState>,
    ws: WebSocketStream<S>,
    remote: SocketAddr,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    state.session_metrics.conn_opened();
    let (sink, stream) = ws.split();

    // Single writer task owns the sink; everything else enqueues.
    let (tx_out, rx_out) = mpsc::channel::<ServerEnvelope>(256);
    let writer = tokio::spawn(writer_task(sink, rx_out));

    let result = drive(&state, stream, &tx_out, remote).await;

    drop(tx_out);
    let _ = writer.await;
    state.session_metrics.conn_closed();
    result
}

async fn writer_task<S>(
    mut sink: SplitSink<WebSocketStream<S>, Message>,
    mut rx: mpsc::Receiver<ServerEnvelope>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(msg) = rx.recv().await {
        let text = encode_server(&msg);
        if let Err(e) = sink.send(Message::Text(text.into())).await {
            debug!(error = %e, "control writer ended");
            break;
        }
    }
    let _ = sink.close().await;
}

async fn drive<S>(
    state: &Arc<GatewayState>,
    mut stream: SplitStream<WebSocketStream<S>>,
    tx_out: &mpsc::Sender<ServerEnvelope>,
    remote: SocketAddr,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut phase = SessionPhase::Unauthenticated;
    info!(%remote, ?phase, "control connection");

    let _ = tx_out
        .send(ServerEnvelope::Hello {
            server_name: state.cfg.server_name.clone(),
            proximity_range: state.cfg.proximity_range,
            frame_ms: FRAME_MS,
            jitter_buffer_ms: state.cfg.jitter_buffer_ms,
        })
        .await;

    // First message must be auth, within the handshake window.
    let first = match timeout(HANDSHAKE_TIMEOUT, next_text(&mut stream)).await {
        Ok(Some(text)) => text,
        Ok(None) => return Ok(()),
        Err(_) => {
            let _ = tx_out
                .send(error_envelope("handshake_timeout", "no auth within handshake window"))
                .await;
            return Ok(());
        }
    };

    phase = SessionPhase::Authenticating;
    debug!(%remote, ?phase, "auth received");
    let auth = match parse_client(&first) {
        Ok(Inbound::Msg(ClientEnvelope::Auth { player_id, name, token, sample_rate, media })) => {
            (player_id, name, token, sample_rate, media)
        }
        _ => {
            let _ = tx_out.send(error_envelope("protocol", "expected auth first")).await;
            return Ok(());
        }
    };
    let (player_id, name, token, requested_rate, media) = auth;

    if state.is_shutting_down() {
        state.session_metrics.auth_result("server_not_ready");
        let _ = tx_out.send(auth_rejection(AuthCode::ServerNotReady)).await;
        return Ok(());
    }

    let identity = match state.auth.authenticate(player_id, &name, token.as_deref()) {
        Ok(id) => id,
        Err(code) => {
            state.session_metrics.auth_result("rejected");
            let _ = tx_out.send(auth_rejection(code)).await;
            return Ok(());
        }
    };
    let player = ParticipantId(identity.player);

    // One session per stable id; a lingering duplicate must fully tear down
    // first.
    if state.registry.get(player).await.is_some() {
        state.session_metrics.auth_result("duplicate");
        let _ = tx_out
            .send(error_envelope("already_connected", "another session is active for this id"))
            .await;
        return Ok(());
    }

    let sample_rate = coerce_sample_rate(requested_rate, state.cfg.sample_rate);
    let media_secret = Uuid::new_v4().to_string();

    let queue = SendQueue::new(state.router.config().per_recipient_queue);
    let handle = RecipientHandle::new(queue.clone(), transport_kind(media));
    let (short, events) = match state
        .registry
        .register(player, identity.name.clone(), handle.clone())
        .await
    {
        Ok(v) => v,
        Err(e) => {
            state.session_metrics.auth_result("error");
            let _ = tx_out.send(control_error_envelope(&e)).await;
            return Ok(());
        }
    };
    state.session_metrics.auth_result("accepted");
    state.pushes.register(player, tx_out.clone());
    state
        .media_auth
        .insert(player, MediaAuth { secret: media_secret.clone(), sample_rate });

    let (close_tx, mut close_rx) = mpsc::channel::<String>(4);
    state.close_txs.insert(player, close_tx);

    let _ = tx_out
        .send(ServerEnvelope::Authenticated {
            sample_rate,
            media_port: state.cfg.media_port,
            short_id: short.0,
            media_secret,
            fec_percent: state.cfg.fec_percent,
        })
        .await;
    state.apply_events(events).await;

    // Framed fallback is server->client only: the peer can hear as soon as
    // the session is ready, without a media handshake.
    if media == MediaMode::Framed {
        let framed = Arc::new(FramedTx::new(tx_out.clone()));
        spawn_send_worker(
            player,
            queue.clone(),
            framed,
            state.router_metrics.clone(),
            state.degraded_tx.clone(),
        );
        handle.mark_announced();
    }

    // PendingGameSession: wait for the adapter to report the player.
    phase = SessionPhase::PendingGameSession;
    debug!(%player, ?phase, "awaiting game session");
    let _ = tx_out.send(ServerEnvelope::PendingGameSession).await;
    let mut bus = state.world_bus.subscribe();

    if state.cfg.dev_mode {
        let spawn_state = PlayerWorldState {
            position: [0.0; 3],
            yaw: 0.0,
            pitch: 0.0,
            world: "dev".into(),
        };
        let _ = state
            .world_feed
            .send(WorldEvent::PlayerJoined { player, state: spawn_state })
            .await;
    }

    let reason = match await_game_session(state, player, &mut bus, &mut stream).await {
        PendingOutcome::Ready => {
            phase = SessionPhase::Ready;
            if media == MediaMode::Framed {
                let _ = state.registry.set_voice_connected(player, true).await;
            }
            let _ = tx_out.send(ServerEnvelope::GameSessionReady).await;
            let _ = tx_out
                .send(ServerEnvelope::PlayerList { players: state.player_list().await })
                .await;
            let _ = tx_out
                .send(ServerEnvelope::GroupList { groups: state.group_list_json().await })
                .await;
            info!(%player, name = %identity.name, %short, ?phase, "session ready");

            run_ready(state, player, &mut stream, tx_out, &mut close_rx, media).await
        }
        PendingOutcome::Timeout => {
            state.session_metrics.session_timeout();
            let _ = tx_out
                .send(error_envelope("session_timeout", "game session never became ready"))
                .await;
            "session timeout".to_string()
        }
        PendingOutcome::PeerGone => "connection closed".to_string(),
    };

    phase = SessionPhase::Disconnecting;
    debug!(%player, ?phase, reason = %reason, "tearing down");
    state.teardown_session(player, &reason).await;
    phase = SessionPhase::Closed;
    debug!(%player, ?phase, "session finished");
    Ok(())
}

enum PendingOutcome {
    Ready,
    Timeout,
    PeerGone,
}

/// Wait for the game adapter to report this player, with the 30 s window.
/// An already-cached placement short-circuits.
async fn await_game_session<S>(
    state: &Arc<GatewayState>,
    player: ParticipantId,
    bus: &mut broadcast::Receiver<WorldEvent>,
    stream: &mut SplitStream<WebSocketStream<S>>,
) -> PendingOutcome
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if state.world.get(player).await.is_some() {
        return PendingOutcome::Ready;
    }
    let deadline = Instant::now() + PENDING_GAME_SESSION_TIMEOUT;
    loop {
        tokio::select! {
            _ = sleep_until(deadline) => return PendingOutcome::Timeout,
            event = bus.recv() => match event {
                Ok(WorldEvent::PlayerJoined { player: p, .. })
                | Ok(WorldEvent::PlayerMoved { player: p, .. })
                | Ok(WorldEvent::SessionReady { player: p }) if p == player => {
                    return PendingOutcome::Ready;
                }
                Ok(_) => {}
                // Lagged or closed: fall back to polling the cache.
                Err(_) => {
                    if state.world.get(player).await.is_some() {
                        return PendingOutcome::Ready;
                    }
                }
            },
            msg = stream.next() => match msg {
                None => return PendingOutcome::PeerGone,
                Some(Err(_)) => return PendingOutcome::PeerGone,
                Some(Ok(Message::Text(text))) => {
                    if let Ok(Inbound::Msg(ClientEnvelope::Disconnect)) = parse_client(&text) {
                        return PendingOutcome::PeerGone;
                    }
                }
                Some(Ok(_)) => {}
            },
        }
    }
}

async fn sleep_until(deadline: Instant) {
    sleep(deadline.saturating_duration_since(Instant::now())).await;
}

/// Ready-phase loop: control ops until disconnect, transport loss, or a close
/// signal (degradation, shutdown, datagram DISCONNECT). Returns the close
/// reason.
async fn run_ready<S>(
    state: &Arc<GatewayState>,
    player: ParticipantId,
    stream: &mut SplitStream<WebSocketStream<S>>,
    tx_out: &mpsc::Sender<ServerEnvelope>,
    close_rx: &mut mpsc::Receiver<String>,
    media: MediaMode,
) -> String
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            reason = close_rx.recv() => {
                return reason.unwrap_or_else(|| "session closed".into());
            }
            msg = stream.next() => {
                let text = match msg {
                    None => return "connection closed".into(),
                    Some(Err(e)) => {
                        debug!(%player, error = %e, "control read failed");
                        return "transport error".into();
                    }
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) => return "connection closed".into(),
                    Some(Ok(_)) => continue,
                };
                match parse_client(&text) {
                    Ok(Inbound::Msg(ClientEnvelope::Disconnect)) => {
                        return "client disconnect".into();
                    }
                    Ok(Inbound::Msg(msg)) => {
                        handle_op(state, player, tx_out, media, msg).await;
                    }
                    Ok(Inbound::Ignored { ty }) => {
                        debug!(%player, ty = %ty, "ignored unknown control message");
                    }
                    Err(e) => {
                        debug!(%player, error = %e, "malformed control message");
                        let _ = tx_out
                            .send(error_envelope("malformed", "unparseable control message"))
                            .await;
                    }
                }
            }
        }
    }
}

async fn handle_op(
    state: &Arc<GatewayState>,
    player: ParticipantId,
    tx_out: &mpsc::Sender<ServerEnvelope>,
    media: MediaMode,
    msg: ClientEnvelope,
) {
    match msg {
        ClientEnvelope::Auth { .. } => {
            let _ = tx_out.send(error_envelope("already_authenticated", "session is ready")).await;
        }
        // Intercepted by the ready loop before dispatch.
        ClientEnvelope::Disconnect => {}
        ClientEnvelope::ListGroups => {
            let _ = tx_out
                .send(ServerEnvelope::GroupList { groups: state.group_list_json().await })
                .await;
        }
        ClientEnvelope::ListPlayers => {
            let _ = tx_out
                .send(ServerEnvelope::PlayerList { players: state.player_list().await })
                .await;
        }
        ClientEnvelope::CreateGroup { name, permanent, isolated, max_members } => {
            let create = GroupCreate { name, permanent, isolated, max_members };
            match state.groups.create(player, create).await {
                Ok((group_id, events)) => {
                    if let Some(st) = state.groups.state_of(group_id).await {
                        let _ = tx_out
                            .send(ServerEnvelope::GroupCreated { group: group_state_json(&st) })
                            .await;
                    }
                    state.apply_events(events).await;
                }
                Err(e) => {
                    let _ = tx_out.send(control_error_envelope(&e)).await;
                }
            }
        }
        ClientEnvelope::JoinGroup { group_id } => {
            let gid = GroupId(group_id);
            match state.groups.join(player, gid).await {
                Ok(events) => {
                    if let Some(st) = state.groups.state_of(gid).await {
                        let _ = tx_out
                            .send(ServerEnvelope::GroupJoined { group: group_state_json(&st) })
                            .await;
                    }
                    state.apply_events(events).await;
                }
                Err(e) => {
                    let _ = tx_out.send(control_error_envelope(&e)).await;
                }
            }
        }
        ClientEnvelope::LeaveGroup => {
            let left = state.groups.group_of(player).await.map(|g| g.id);
            match state.groups.leave(player).await {
                Ok(events) => {
                    if let Some(gid) = left {
                        let _ =
                            tx_out.send(ServerEnvelope::GroupLeft { group_id: gid.0 }).await;
                    }
                    state.apply_events(events).await;
                }
                Err(e) => {
                    let _ = tx_out.send(control_error_envelope(&e)).await;
                }
            }
        }
        ClientEnvelope::GroupSettings { group_id, isolated } => {
            match state.groups.update_settings(player, GroupId(group_id), isolated).await {
                Ok(events) => state.apply_events(events).await,
                Err(e) => {
                    let _ = tx_out.send(control_error_envelope(&e)).await;
                }
            }
        }
        ClientEnvelope::UpdateMute { muted } => {
            match state.registry.set_muted(player, muted).await {
                Ok(events) => state.apply_events(events).await,
                Err(e) => {
                    let _ = tx_out.send(control_error_envelope(&e)).await;
                }
            }
        }
        ClientEnvelope::UpdateSpeaking { speaking } => {
            match state.registry.set_speaking(player, speaking).await {
                Ok(events) => state.apply_events(events).await,
                Err(e) => {
                    let _ = tx_out.send(control_error_envelope(&e)).await;
                }
            }
        }
        ClientEnvelope::SdpOffer { sdp } => {
            match state.peer_connector.negotiate(&sdp).await {
                Ok(negotiated) => {
                    let _ = tx_out
                        .send(ServerEnvelope::SdpAnswer { sdp: negotiated.answer })
                        .await;
                    if media == MediaMode::DataChannel {
                        attach_data_channel(state, player, negotiated.channel).await;
                    }
                }
                Err(e) => {
                    warn!(%player, error = %e, "sdp negotiation failed");
                    let _ = tx_out
                        .send(error_envelope("sdp_failed", "data channel negotiation failed"))
                        .await;
                }
            }
        }
        ClientEnvelope::IceCandidate { candidate } => {
            if let Err(e) = state.peer_connector.add_remote_candidate(&candidate).await {
                debug!(%player, error = %e, "ice candidate rejected");
            }
        }
        ClientEnvelope::Resume => {
            // Nothing to replay beyond current state: the server is
            // authoritative, the client reconciles from these pushes.
            let _ = tx_out.send(ServerEnvelope::GameSessionReady).await;
            let _ = tx_out
                .send(ServerEnvelope::PlayerList { players: state.player_list().await })
                .await;
            let _ = tx_out
                .send(ServerEnvelope::GroupList { groups: state.group_list_json().await })
                .await;
        }
        ClientEnvelope::Ping { nonce } => {
            let _ = tx_out
                .send(ServerEnvelope::Latency { nonce, server_time_ms: unix_ms() })
                .await;
        }
    }
}

/// Wire an opened data channel as this session's media transport.
async fn attach_data_channel(
    state: &Arc<GatewayState>,
    player: ParticipantId,
    channel: Arc<dyn crate::peerlink::ByteChannel>,
) {
    let Some(handle) = state.registry.handle_of(player).await else {
        return;
    };
    let tx = Arc::new(DataChannelTx::new(channel.clone()));
    spawn_send_worker(
        player,
        handle.queue.clone(),
        tx,
        state.router_metrics.clone(),
        state.degraded_tx.clone(),
    );
    handle.mark_announced();
    let _ = state.registry.set_voice_connected(player, true).await;

    // Inbound side: frames off the channel go straight to the router.
    let rx = DataChannelRx::new(channel);
    let router = state.router.clone();
    let registry = state.registry.clone();
    tokio::spawn(async move {
        use pv_media::FrameRx;
        while let Some(frame) = rx.recv().await {
            router.handle_incoming(player, frame).await;
        }
        let _ = registry.set_voice_connected(player, false).await;
    });
    info!(%player, "data channel media attached");
}

async fn next_text<S>(stream: &mut SplitStream<WebSocketStream<S>>) -> Option<String>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Text(text)) => return Some(text.to_string()),
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => {}
        }
    }
    None
}

fn transport_kind(media: MediaMode) -> TransportKind {
    match media {
        MediaMode::Datagram => TransportKind::Datagram,
        MediaMode::Framed => TransportKind::Framed,
        MediaMode::DataChannel => TransportKind::DataChannel,
    }
}

fn error_envelope(code: &str, message: &str) -> ServerEnvelope {
    ServerEnvelope::Error { code: code.into(), message: message.into() }
}

fn auth_rejection(code: AuthCode) -> ServerEnvelope {
    let (code, message) = match code {
        AuthCode::Accepted => ("accepted", "accepted"),
        AuthCode::PlayerNotFound => ("player_not_found", "player is not in the game"),
        AuthCode::ServerNotReady => ("server_not_ready", "server is not accepting sessions"),
        AuthCode::InvalidCredentials => ("invalid_credentials", "authentication rejected"),
    };
    error_envelope(code, message)
}

fn control_error_envelope(e: &ControlError) -> ServerEnvelope {
    let code = match e {
        ControlError::NotFound(_) => "not_found",
        ControlError::AlreadyExists(_) => "already_exists",
        ControlError::PermissionDenied(_) => "permission_denied",
        ControlError::InvalidArgument(_) => "invalid_argument",
        ControlError::FailedPrecondition(_) => "failed_precondition",
        ControlError::ResourceExhausted(_) => "resource_exhausted",
    };
    error_envelope(code, &e.to_string())
}

fn unix_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
