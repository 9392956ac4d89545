use anyhow::{anyhow, bail, Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;
use uuid::Uuid;

use pv_wire::envelope::{ClientEnvelope, MediaMode, ServerEnvelope};

/// Everything the server granted at auth time, merged with the hello fields
/// the client needs for rendering.
#[derive(Clone, Debug)]
pub struct SessionGrant {
    pub sample_rate: u32,
    pub media_port: u16,
    pub short_id: u32,
    pub media_secret: String,
    pub fec_percent: u32,
    pub proximity_range: f32,
    pub jitter_buffer_ms: u32,
}

pub struct ControlClient {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl ControlClient {
    pub async fn connect(url: &str) -> Result<Self> {
        let (ws, _) = connect_async(url).await.context("signaling connect")?;
        Ok(Self { ws })
    }

    /// Hello/auth exchange; returns once the server accepts.
    pub async fn authenticate(
        &mut self,
        player: Uuid,
        name: &str,
        token: Option<&str>,
        sample_rate: u32,
    ) -> Result<SessionGrant> {
        let hello = match self.next().await? {
            Some(ServerEnvelope::Hello { proximity_range, jitter_buffer_ms, .. }) => {
                (proximity_range, jitter_buffer_ms)
            }
            other => bail!("expected hello, got {other:?}"),
        };

        self.send(ClientEnvelope::Auth {
            player_id: player,
            name: name.to_string(),
            token: token.map(str::to_string),
            sample_rate,
            media: MediaMode::Datagram,
        })
        .await?;

        loop {
            match self.next().await? {
                Some(ServerEnvelope::Authenticated {
                    sample_rate,
                    media_port,
                    short_id,
                    media_secret,
                    fec_percent,
                }) => {
                    return Ok(SessionGrant {
                        sample_rate,
                        media_port,
                        short_id,
                        media_secret,
                        fec_percent,
                        proximity_range: hello.0,
                        jitter_buffer_ms: hello.1,
                    });
                }
                Some(ServerEnvelope::Error { code, message }) => {
                    bail!("auth rejected: {code}: {message}")
                }
                Some(_) => continue,
                None => bail!("connection closed during auth"),
            }
        }
    }

    /// Block until the game session is ready (or the server gives up).
    pub async fn wait_ready(&mut self) -> Result<()> {
        loop {
            match self.next().await? {
                Some(ServerEnvelope::GameSessionReady) => return Ok(()),
                Some(ServerEnvelope::Error { code, message }) => {
                    bail!("session failed: {code}: {message}")
                }
                Some(ServerEnvelope::Disconnected { reason }) => {
                    bail!("disconnected: {reason}")
                }
                Some(_) => continue,
                None => bail!("connection closed while pending"),
            }
        }
    }

    pub async fn send(&mut self, msg: ClientEnvelope) -> Result<()> {
        let text = serde_json::to_string(&msg).context("encode control message")?;
        self.ws.send(Message::Text(text.into())).await.context("control send")
    }

    /// Next server envelope; `None` when the connection closes. Unparseable
    /// pushes are skipped, not fatal.
    pub async fn next(&mut self) -> Result<Option<ServerEnvelope>> {
        while let Some(msg) = self.ws.next().await {
            match msg.map_err(|e| anyhow!("control read: {e}"))? {
                Message::Text(text) => match serde_json::from_str(&text) {
                    Ok(env) => return Ok(Some(env)),
                    Err(e) => debug!(error = %e, "skipping unparseable push"),
                },
                Message::Close(_) => return Ok(None),
                _ => {}
            }
        }
        Ok(None)
    }

    pub async fn close(&mut self) {
        let _ = self.send(ClientEnvelope::Disconnect).await;
        let _ = self.ws.close(None).await;
    }
}
