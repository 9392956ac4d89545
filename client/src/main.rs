//! pv-client main.
//!
//! What this does:
//! - Connects to the gateway, runs hello/auth, waits for game-session-ready
//! - Binds the datagram media socket and authenticates it (with backoff)
//! - Runs the receive path: datagram -> jitter buffer -> Opus decode (PLC on
//!   gaps) -> gain -> PCM sink
//! - Optionally transmits a synthetic tone so the send path can be exercised
//!   without capture hardware
//! - Keeps the control channel alive with pings and reconnects with jittered
//!   backoff

mod audio;
mod config;
mod net;

use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use clap::Parser;
use tokio::sync::Mutex;
use tokio::time::{interval, sleep, Duration};
use tracing::{debug, info, warn, Level};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use pv_voice::VoiceCodec;
use pv_wire::envelope::{ClientEnvelope, ServerEnvelope};
use pv_wire::{CodecTag, MediaFrame, Packet, SenderRef, ShortId};

use audio::opus::OpusVoiceCodec;
use audio::playback::{PcmSink, Playback};
use audio::source::ToneSource;
use config::Config;
use net::control::ControlClient;
use net::voice::VoiceSocket;

const FRAME_MS: u32 = 20;
const PING_INTERVAL: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .init();

    let cfg = Config::parse();
    let player = cfg.player_id.unwrap_or_else(Uuid::new_v4);
    info!(%player, name = %cfg.name, server = %cfg.server, "starting");

    let mut backoff = Backoff::new(Duration::from_millis(250), Duration::from_secs(10));
    loop {
        match run_session(&cfg, player).await {
            Ok(()) => {
                info!("session ended cleanly");
                return Ok(());
            }
            Err(e) => {
                warn!("session ended: {e:#}");
                backoff.sleep().await;
            }
        }
    }
}

async fn run_session(cfg: &Config, player: Uuid) -> Result<()> {
    let mut ctl = ControlClient::connect(&cfg.server).await?;
    let grant = ctl
        .authenticate(player, &cfg.name, cfg.token.as_deref(), cfg.sample_rate)
        .await?;
    info!(
        sample_rate = grant.sample_rate,
        short_id = format_args!("{:08x}", grant.short_id),
        "authenticated"
    );
    ctl.wait_ready().await?;
    info!("game session ready");

    // Media socket: same host as signaling, server-announced port.
    let media_addr = media_addr(&cfg.server, grant.media_port).await?;
    let voice = Arc::new(VoiceSocket::connect(media_addr).await?);
    let rate = voice.authenticate(player, &grant.media_secret).await?;
    info!(%media_addr, rate, "media transport bound");

    // Receive pipeline. One decoder per remote stream, created on demand.
    let depth_ms = cfg.jitter_buffer_ms.clamp(20, 200);
    debug!(depth_ms, server_hint = grant.jitter_buffer_ms, "jitter depth");
    let range = grant.proximity_range;
    let codec_rate = rate;
    let playback = Arc::new(Mutex::new(Playback::new(
        TraceSink::default(),
        Box::new(move || {
            Box::new(
                OpusVoiceCodec::new(codec_rate, 1, FRAME_MS)
                    .expect("decoder construction cannot fail for validated rates"),
            ) as Box<dyn VoiceCodec>
        }),
        depth_ms,
        FRAME_MS as u64,
        range,
    )));

    // Datagram receive loop.
    let recv_playback = playback.clone();
    let recv_voice = voice.clone();
    let recv_task = tokio::spawn(async move {
        loop {
            let frame = match recv_voice.recv_frame().await {
                Ok(f) => f,
                Err(e) => return Err::<(), anyhow::Error>(e),
            };
            match Packet::decode(&frame) {
                Ok(Packet::Audio(media)) | Ok(Packet::TestAudio(media)) => {
                    recv_playback.lock().await.ingest(&media, Instant::now());
                }
                Ok(Packet::ServerShutdown) => {
                    return Err(anyhow!("server shutdown"));
                }
                Ok(other) => debug!(packet = ?other, "control packet on media socket"),
                Err(e) => debug!(error = %e, "undecodable media datagram"),
            }
        }
    });

    // Playback cadence.
    let tick_playback = playback.clone();
    let tick_task = tokio::spawn(async move {
        let mut tick = interval(Duration::from_millis(FRAME_MS as u64));
        loop {
            tick.tick().await;
            tick_playback.lock().await.tick(Instant::now());
        }
    });

    // Optional synthetic send path.
    let send_task = cfg.synthetic_tone.then(|| {
        let voice = voice.clone();
        let short = ShortId(grant.short_id);
        let fec = grant.fec_percent;
        tokio::spawn(async move {
            if let Err(e) = send_tone(voice, short, rate, fec).await {
                warn!("send loop ended: {e:#}");
            }
        })
    });

    // Control loop: pushes, latency pings, ctrl-c.
    let mut ping = interval(PING_INTERVAL);
    ping.tick().await; // immediate first tick
    let mut nonce: u64 = 1;
    let result = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("ctrl-c");
                ctl.close().await;
                break Ok(());
            }
            _ = ping.tick() => {
                nonce += 1;
                if let Err(e) = ctl.send(ClientEnvelope::Ping { nonce }).await {
                    break Err(e);
                }
            }
            msg = ctl.next() => match msg {
                Err(e) => break Err(e),
                Ok(None) => break Err(anyhow!("control connection closed")),
                Ok(Some(env)) => {
                    if let Some(stop) = handle_push(env, &playback).await {
                        break stop;
                    }
                }
            },
        }
    };

    recv_task.abort();
    tick_task.abort();
    if let Some(t) = send_task {
        t.abort();
    }
    result
}

/// Returns `Some` when the session should end.
async fn handle_push(
    env: ServerEnvelope,
    playback: &Arc<Mutex<Playback<TraceSink>>>,
) -> Option<Result<()>> {
    match env {
        ServerEnvelope::Disconnected { reason } => {
            info!(reason = %reason, "server closed the session");
            Some(Ok(()))
        }
        ServerEnvelope::Error { code, message } => {
            warn!(code = %code, message = %message, "server error");
            None
        }
        ServerEnvelope::PlayerList { players } => {
            info!(count = players.len(), "player list updated");
            None
        }
        ServerEnvelope::GroupList { groups } => {
            info!(count = groups.len(), "group list updated");
            None
        }
        ServerEnvelope::UserSpeakingStatus { player_id, speaking } => {
            debug!(%player_id, speaking, "speaking status");
            None
        }
        ServerEnvelope::UserMuteStatus { player_id, muted } => {
            debug!(%player_id, muted, "mute status");
            None
        }
        ServerEnvelope::Latency { nonce, .. } => {
            debug!(nonce, "latency reply");
            None
        }
        ServerEnvelope::PositionUpdate { position, .. } => {
            debug!(?position, "position update");
            None
        }
        // Media fallback: unwrap the JSON envelope into the same pipeline.
        ServerEnvelope::Audio { short_id, player_id, seq, data, position, .. } => {
            use base64::Engine as _;
            let Ok(payload) = base64::engine::general_purpose::STANDARD.decode(data) else {
                debug!("bad base64 in audio fallback");
                return None;
            };
            let sender = match (short_id, player_id) {
                (Some(s), _) => SenderRef::Short(ShortId(s)),
                (None, Some(p)) => SenderRef::Full(p),
                (None, None) => return None,
            };
            let media = MediaFrame {
                codec: CodecTag::Opus,
                sender,
                seq,
                payload: Bytes::from(payload),
                position,
            };
            playback.lock().await.ingest(&media, Instant::now());
            None
        }
        other => {
            debug!(push = ?other, "unhandled push");
            None
        }
    }
}

async fn send_tone(
    voice: Arc<VoiceSocket>,
    short: ShortId,
    sample_rate: u32,
    fec_percent: u32,
) -> Result<()> {
    let mut codec = OpusVoiceCodec::new(sample_rate, 1, FRAME_MS)?;
    codec.set_fec_percent(fec_percent)?;
    let mut source = ToneSource::new(sample_rate, FRAME_MS, 440.0);
    let mut seq: u32 = rand::random();
    let mut tick = interval(Duration::from_millis(FRAME_MS as u64));

    loop {
        tick.tick().await;
        let pcm = source.next_frame();
        let payload = match codec.encode(&pcm) {
            Ok(p) => p,
            Err(e) => {
                debug!(error = %e, "encode failed, skipping frame");
                continue;
            }
        };
        let frame = Packet::Audio(MediaFrame {
            codec: CodecTag::Opus,
            sender: SenderRef::Short(short),
            seq,
            payload: Bytes::from(payload),
            position: None,
        })
        .encode();
        seq = seq.wrapping_add(1);
        voice.send_frame(frame).await?;
    }
}

/// Resolve the media address: signaling host, media port.
async fn media_addr(server_url: &str, port: u16) -> Result<std::net::SocketAddr> {
    let rest = server_url
        .strip_prefix("wss://")
        .or_else(|| server_url.strip_prefix("ws://"))
        .unwrap_or(server_url);
    let host = rest.split(['/', ':']).next().filter(|h| !h.is_empty())
        .ok_or_else(|| anyhow!("cannot extract host from {server_url}"))?;
    tokio::net::lookup_host((host, port))
        .await
        .context("resolve media host")?
        .next()
        .ok_or_else(|| anyhow!("no address for {host}"))
}

/// Stand-in for the speaker boundary: counts samples and logs occasionally.
#[derive(Default)]
struct TraceSink {
    frames: u64,
}

impl PcmSink for TraceSink {
    fn play(&mut self, pcm: &[i16]) {
        self.frames += 1;
        if self.frames % 250 == 0 {
            debug!(frames = self.frames, samples = pcm.len(), "playback running");
        }
    }
}

/// Jittered exponential backoff for reconnects.
struct Backoff {
    min: Duration,
    max: Duration,
    cur: Duration,
}

impl Backoff {
    fn new(min: Duration, max: Duration) -> Self {
        Self { min, max, cur: min }
    }

    async fn sleep(&mut self) {
        let jitter = rand::random::<u64>() % 150;
        sleep(self.cur + Duration::from_millis(jitter)).await;
        self.cur = (self.cur * 2).min(self.max);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn media_addr_parses_ws_urls() {
        let addr = media_addr("ws://127.0.0.1:24455", 24454).await.unwrap();
        assert_eq!(addr.port(), 24454);
        assert_eq!(addr.ip().to_string(), "127.0.0.1");

        let addr = media_addr("wss://localhost:1234/path", 9).await.unwrap();
        assert_eq!(addr.port(), 9);
    }
}
