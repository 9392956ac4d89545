//! Framed reliable transport: WebSocket signaling with origin checks, plus
//! the base64 media fallback that rides the same connection.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::Engine as _;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tracing::{info, warn};

use pv_media::{FrameTx, TransportKind};
use pv_wire::{CodecTag, Packet, SenderRef};

use pv_wire::envelope::ServerEnvelope;
use crate::session;
use crate::state::GatewayState;
use crate::tls::load_or_generate_tls;

/// `*` accepts anything. A request without an Origin header is a native
/// client, not a browser, and passes; a present header must match.
pub fn origin_allowed(allowed: &[String], origin: Option<&str>) -> bool {
    if allowed.iter().any(|a| a == "*") {
        return true;
    }
    match origin {
        None => true,
        Some(o) => allowed.iter().any(|a| a.eq_ignore_ascii_case(o)),
    }
}

pub async fn bind_signaling(state: &GatewayState) -> Result<TcpListener> {
    let addr = SocketAddr::from(([0, 0, 0, 0], state.cfg.signaling_port));
    TcpListener::bind(addr).await.context("bind signaling port")
}

pub async fn run_signaling(state: Arc<GatewayState>, listener: TcpListener) -> Result<()> {
    let acceptor = if state.cfg.enable_tls {
        let (certs, key) = load_or_generate_tls(
            state.cfg.tls_cert_path.as_deref(),
            state.cfg.tls_key_path.as_deref(),
        )?;
        let tls = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .context("build tls config")?;
        Some(TlsAcceptor::from(Arc::new(tls)))
    } else {
        None
    };

    info!(addr = %listener.local_addr()?, tls = acceptor.is_some(), "signaling transport listening");

    loop {
        let (stream, remote) = listener.accept().await?;
        let state = state.clone();
        let acceptor = acceptor.clone();
        tokio::spawn(async move {
            let result = match acceptor {
                Some(acceptor) => match acceptor.accept(stream).await {
                    Ok(tls_stream) => accept_ws(state, tls_stream, remote).await,
                    Err(e) => Err(anyhow::anyhow!("tls accept: {e}")),
                },
                None => accept_ws(state, stream, remote).await,
            };
            if let Err(e) = result {
                warn!(%remote, "connection ended with error: {e:#}");
            }
        });
    }
}

async fn accept_ws<S>(state: Arc<GatewayState>, stream: S, remote: SocketAddr) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let allowed = state.cfg.allowed_origins.clone();
    let check_state = state.clone();
    let callback = move |req: &Request, response: Response| {
        let origin = req.headers().get("origin").and_then(|v| v.to_str().ok());
        if origin_allowed(&allowed, origin) {
            Ok(response)
        } else {
            check_state.session_metrics.origin_rejected();
            warn!(%remote, origin = origin.unwrap_or("<none>"), "origin rejected");
            let mut resp = ErrorResponse::new(Some("origin not allowed".to_string()));
            *resp.status_mut() = StatusCode::FORBIDDEN;
            Err(resp)
        }
    };

    let ws = tokio_tungstenite::accept_hdr_async(stream, callback)
        .await
        .context("websocket upgrade")?;
    session::run_connection(state, ws, remote).await
}

/// Media fallback over the framed transport: the encoded binary frame is
/// unwrapped into an `audio` envelope on the session's control writer. This
/// path is server-to-client only.
pub struct FramedTx {
    tx: mpsc::Sender<ServerEnvelope>,
}

impl FramedTx {
    pub fn new(tx: mpsc::Sender<ServerEnvelope>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl FrameTx for FramedTx {
    async fn send(&self, frame: Bytes) -> Result<()> {
        let (media, test) = match Packet::decode(&frame) {
            Ok(Packet::Audio(f)) => (f, false),
            Ok(Packet::TestAudio(f)) => (f, true),
            // Binary control has JSON counterparts on this transport.
            Ok(_) => return Ok(()),
            Err(e) => return Err(anyhow::anyhow!("undecodable outbound frame: {e}")),
        };

        let (short_id, player_id) = match media.sender {
            SenderRef::Short(s) => (Some(s.0), None),
            SenderRef::Full(u) => (None, Some(u)),
        };
        let envelope = ServerEnvelope::Audio {
            short_id,
            player_id,
            seq: media.seq,
            codec: match media.codec {
                CodecTag::Opus => "opus".to_string(),
                CodecTag::Pcm => "pcm".to_string(),
            },
            data: base64::engine::general_purpose::STANDARD.encode(&media.payload),
            position: media.position,
            test,
        };
        self.tx
            .send(envelope)
            .await
            .map_err(|_| anyhow::anyhow!("control writer closed"))
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Framed
    }

    async fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use pv_wire::{MediaFrame, ShortId};

    fn allowed(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn wildcard_accepts_everything() {
        let a = allowed(&["*"]);
        assert!(origin_allowed(&a, Some("https://evil.example")));
        assert!(origin_allowed(&a, None));
    }

    #[test]
    fn allow_list_matches_case_insensitively() {
        let a = allowed(&["https://game.example"]);
        assert!(origin_allowed(&a, Some("https://game.example")));
        assert!(origin_allowed(&a, Some("HTTPS://GAME.EXAMPLE")));
        assert!(!origin_allowed(&a, Some("https://other.example")));
    }

    #[test]
    fn absent_origin_is_native_client() {
        let a = allowed(&["https://game.example"]);
        assert!(origin_allowed(&a, None));
    }

    #[tokio::test]
    async fn framed_tx_wraps_frame_as_audio_envelope() {
        let (tx, mut rx) = mpsc::channel(4);
        let framed = FramedTx::new(tx);

        let frame = Packet::Audio(MediaFrame {
            codec: CodecTag::Opus,
            sender: SenderRef::Short(ShortId(9)),
            seq: 42,
            payload: Bytes::from_static(&[1, 2, 3]),
            position: Some([0.0, 1.0, 2.0]),
        })
        .encode();
        framed.send(frame).await.unwrap();

        match rx.recv().await.unwrap() {
            ServerEnvelope::Audio { short_id, seq, codec, data, position, test, .. } => {
                assert_eq!(short_id, Some(9));
                assert_eq!(seq, 42);
                assert_eq!(codec, "opus");
                assert_eq!(data, base64::engine::general_purpose::STANDARD.encode([1u8, 2, 3]));
                assert_eq!(position, Some([0.0, 1.0, 2.0]));
                assert!(!test);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
