//! Session lifecycle tests driven through a real WebSocket handshake over an
//! in-memory duplex stream, plus a datagram round trip over a real socket.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::io::DuplexStream;
use tokio::net::UdpSocket;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use pv_gateway::auth::DevAuthProvider;
use pv_gateway::config::Config;
use pv_gateway::peerlink::NullPeerConnector;
use pv_gateway::session;
use pv_gateway::state::{bootstrap, GatewayState};
use pv_media::NoopMetrics;
use pv_wire::{AuthCode, CodecTag, MediaFrame, Packet, SenderRef, ShortId};

fn test_config(dev_mode: bool) -> Config {
    use clap::Parser;
    let cfg = Config::try_parse_from([
        "pv-gateway",
        "--signaling-port",
        "0",
        "--media-port",
        "0",
        "--metrics-listen",
        "127.0.0.1:0",
    ])
    .unwrap();
    Config { dev_mode, ..cfg }
}

async fn start_gateway(dev_mode: bool) -> Arc<GatewayState> {
    bootstrap(
        test_config(dev_mode),
        Arc::new(DevAuthProvider),
        Arc::new(NullPeerConnector),
        Arc::new(NoopMetrics),
    )
    .await
    .expect("bootstrap")
}

type ClientWs = WebSocketStream<DuplexStream>;

async fn connect(state: &Arc<GatewayState>) -> ClientWs {
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let server_ws = WebSocketStream::from_raw_socket(server_io, Role::Server, None).await;
    let st = state.clone();
    tokio::spawn(async move {
        let addr: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let _ = session::run_connection(st, server_ws, addr).await;
    });
    WebSocketStream::from_raw_socket(client_io, Role::Client, None).await
}

async fn send_json(ws: &mut ClientWs, v: Value) {
    ws.send(Message::Text(v.to_string().into())).await.expect("ws send");
}

async fn recv_json(ws: &mut ClientWs) -> Value {
    loop {
        match ws.next().await.expect("ws closed").expect("ws error") {
            Message::Text(text) => return serde_json::from_str(&text).expect("bad json"),
            _ => continue,
        }
    }
}

/// Read envelopes until one of the wanted type arrives.
async fn recv_type(ws: &mut ClientWs, ty: &str) -> Value {
    for _ in 0..32 {
        let v = recv_json(ws).await;
        if v["type"] == ty {
            return v;
        }
    }
    panic!("never received {ty}");
}

fn auth_msg(player: Uuid, name: &str) -> Value {
    json!({"type": "auth", "player_id": player, "name": name})
}

#[tokio::test]
async fn dev_mode_session_reaches_ready() {
    let state = start_gateway(true).await;
    let mut ws = connect(&state).await;

    let hello = recv_json(&mut ws).await;
    assert_eq!(hello["type"], "hello");
    assert_eq!(hello["proximity_range"].as_f64().unwrap(), 30.0);

    send_json(&mut ws, auth_msg(Uuid::new_v4(), "alice")).await;

    let authed = recv_type(&mut ws, "authenticated").await;
    assert_eq!(authed["sample_rate"].as_u64().unwrap(), 48_000);
    assert!(authed["media_secret"].as_str().unwrap().len() > 10);

    recv_type(&mut ws, "pending_game_session").await;
    recv_type(&mut ws, "game_session_ready").await;

    let players = recv_type(&mut ws, "player_list").await;
    assert_eq!(players["players"].as_array().unwrap().len(), 1);
    assert_eq!(players["players"][0]["name"], "alice");
}

#[tokio::test]
async fn group_ops_round_trip() {
    let state = start_gateway(true).await;
    let mut ws = connect(&state).await;

    send_json(&mut ws, auth_msg(Uuid::new_v4(), "alice")).await;
    recv_type(&mut ws, "game_session_ready").await;

    send_json(&mut ws, json!({"type": "create_group", "name": "raid", "isolated": true})).await;
    let created = recv_type(&mut ws, "group_created").await;
    assert_eq!(created["group"]["name"], "raid");
    assert_eq!(created["group"]["isolated"], true);
    assert_eq!(created["group"]["members"].as_array().unwrap().len(), 1);

    // Second create must fail: one group per participant.
    send_json(&mut ws, json!({"type": "create_group", "name": "other"})).await;
    let err = recv_type(&mut ws, "error").await;
    assert_eq!(err["code"], "failed_precondition");

    send_json(&mut ws, json!({"type": "leave_group"})).await;
    recv_type(&mut ws, "group_left").await;

    let list = recv_type(&mut ws, "group_list").await;
    assert!(list["groups"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn mute_and_ping() {
    let state = start_gateway(true).await;
    let mut ws = connect(&state).await;
    send_json(&mut ws, auth_msg(Uuid::new_v4(), "alice")).await;
    recv_type(&mut ws, "game_session_ready").await;

    send_json(&mut ws, json!({"type": "update_mute", "muted": true})).await;
    let echo = recv_type(&mut ws, "set_mic_mute").await;
    assert_eq!(echo["muted"], true);

    send_json(&mut ws, json!({"type": "ping", "nonce": 77})).await;
    let latency = recv_type(&mut ws, "latency").await;
    assert_eq!(latency["nonce"].as_u64().unwrap(), 77);
}

#[tokio::test]
async fn empty_name_is_rejected() {
    let state = start_gateway(true).await;
    let mut ws = connect(&state).await;
    send_json(&mut ws, auth_msg(Uuid::new_v4(), "   ")).await;
    let err = recv_type(&mut ws, "error").await;
    assert_eq!(err["code"], "invalid_credentials");
}

#[tokio::test]
async fn unknown_control_type_is_ignored() {
    let state = start_gateway(true).await;
    let mut ws = connect(&state).await;
    send_json(&mut ws, auth_msg(Uuid::new_v4(), "alice")).await;
    recv_type(&mut ws, "game_session_ready").await;

    send_json(&mut ws, json!({"type": "dance_emote", "intensity": 11})).await;
    // Session stays healthy.
    send_json(&mut ws, json!({"type": "ping", "nonce": 1})).await;
    recv_type(&mut ws, "latency").await;
}

#[tokio::test(start_paused = true)]
async fn pending_session_times_out_without_game_adapter() {
    let state = start_gateway(false).await;
    let mut ws = connect(&state).await;

    send_json(&mut ws, auth_msg(Uuid::new_v4(), "alice")).await;
    recv_type(&mut ws, "pending_game_session").await;

    // No adapter event ever arrives; the 30 s window elapses under paused
    // time and the peer gets a session_timeout error, then disconnected.
    let err = recv_type(&mut ws, "error").await;
    assert_eq!(err["code"], "session_timeout");
    let bye = recv_type(&mut ws, "disconnected").await;
    assert!(bye["reason"].as_str().unwrap().contains("timeout"));
}

#[tokio::test]
async fn datagram_media_end_to_end() {
    let state = start_gateway(true).await;
    let server_media = state.udp.local_addr().unwrap();

    // Two ready sessions.
    let a_id = Uuid::new_v4();
    let b_id = Uuid::new_v4();
    let mut ws_a = connect(&state).await;
    send_json(&mut ws_a, auth_msg(a_id, "alice")).await;
    let authed_a = recv_type(&mut ws_a, "authenticated").await;
    recv_type(&mut ws_a, "game_session_ready").await;

    let mut ws_b = connect(&state).await;
    send_json(&mut ws_b, auth_msg(b_id, "bob")).await;
    let authed_b = recv_type(&mut ws_b, "authenticated").await;
    recv_type(&mut ws_b, "game_session_ready").await;

    let short_a = ShortId(authed_a["short_id"].as_u64().unwrap() as u32);
    let secret_a = authed_a["media_secret"].as_str().unwrap().to_string();
    let secret_b = authed_b["media_secret"].as_str().unwrap().to_string();

    // Bind both media sockets with the binary AUTH handshake.
    let udp_a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let udp_b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    media_auth(&udp_a, server_media, a_id, &secret_a).await;
    media_auth(&udp_b, server_media, b_id, &secret_b).await;

    // A speaks; dev mode placed both at the origin, so B hears at full gain.
    let frame = Packet::Audio(MediaFrame {
        codec: CodecTag::Opus,
        sender: SenderRef::Short(short_a),
        seq: 7,
        payload: Bytes::from_static(&[0xAB; 60]),
        position: None,
    })
    .encode();
    udp_a.send_to(&frame, server_media).await.unwrap();

    let forwarded = recv_media(&udp_b).await;
    match forwarded {
        Packet::Audio(out) => {
            assert_eq!(out.sender, SenderRef::Short(short_a));
            assert_eq!(out.seq, 7);
            assert_eq!(out.payload.as_ref(), &[0xAB; 60]);
            assert_eq!(out.position, Some([0.0, 0.0, 0.0]));
        }
        other => panic!("unexpected {other:?}"),
    }
}

async fn media_auth(socket: &UdpSocket, server: SocketAddr, player: Uuid, secret: &str) {
    let auth = Packet::Auth { player, secret: secret.to_string() }.encode();
    socket.send_to(&auth, server).await.unwrap();
    let mut buf = vec![0u8; 2048];
    loop {
        let (n, _) = tokio::time::timeout(Duration::from_secs(5), socket.recv_from(&mut buf))
            .await
            .expect("auth ack timeout")
            .unwrap();
        if let Ok(Packet::AuthAck { code, sample_rate }) = Packet::decode(&buf[..n]) {
            assert_eq!(code, AuthCode::Accepted);
            assert_eq!(sample_rate, 48_000);
            return;
        }
    }
}

/// Receive until a media packet shows up, skipping PLAYER_NAME announcements.
async fn recv_media(socket: &UdpSocket) -> Packet {
    let mut buf = vec![0u8; 2048];
    loop {
        let (n, _) = tokio::time::timeout(Duration::from_secs(5), socket.recv_from(&mut buf))
            .await
            .expect("media timeout")
            .unwrap();
        match Packet::decode(&buf[..n]) {
            Ok(p @ Packet::Audio(_)) | Ok(p @ Packet::TestAudio(_)) => return p,
            _ => continue,
        }
    }
}
