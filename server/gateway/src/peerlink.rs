//! Peer data-channel adapter.
//!
//! The SDP exchange rides the signaling channel and its payloads are opaque
//! here; the actual DTLS/SCTP stack lives behind `PeerConnector`, which hands
//! back an unreliable ordered byte transport once the channel opens. This
//! module turns that byte transport into a `FrameTx`/`FrameRx` pair, keeping
//! every outbound chunk at or below the SCTP message ceiling.
//!
//! Chunk framing: one leading byte per chunk, high bit set on the final chunk
//! of a frame. The channel is ordered, so reassembly is a plain accumulator.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};

use pv_media::{FrameRx, FrameTx, TransportKind};

/// SCTP message ceiling observed in practice; chunks never exceed this.
pub const MAX_CHUNK_BYTES: usize = 900;
const CHUNK_BODY_BYTES: usize = MAX_CHUNK_BYTES - 1;
const CHUNK_FINAL: u8 = 0x80;

/// Unreliable ordered byte transport produced by the external WebRTC stack.
#[async_trait]
pub trait ByteChannel: Send + Sync {
    async fn send(&self, chunk: Bytes) -> Result<()>;
    async fn recv(&self) -> Option<Bytes>;
    async fn close(&self);
}

pub struct NegotiatedChannel {
    pub answer: String,
    pub channel: Arc<dyn ByteChannel>,
}

/// Seam to the external peer-connection stack. The routing core only relays
/// offer/answer/candidate payloads and consumes the resulting byte channel.
#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn negotiate(&self, offer: &str) -> Result<NegotiatedChannel>;
    async fn add_remote_candidate(&self, candidate: &Value) -> Result<()>;
}

/// Deployment without a peer stack: sdp_offer is answered with an error.
pub struct NullPeerConnector;

#[async_trait]
impl PeerConnector for NullPeerConnector {
    async fn negotiate(&self, _offer: &str) -> Result<NegotiatedChannel> {
        Err(anyhow::anyhow!("no peer data-channel stack configured"))
    }

    async fn add_remote_candidate(&self, _candidate: &Value) -> Result<()> {
        Err(anyhow::anyhow!("no peer data-channel stack configured"))
    }
}

pub struct DataChannelTx {
    channel: Arc<dyn ByteChannel>,
}

impl DataChannelTx {
    pub fn new(channel: Arc<dyn ByteChannel>) -> Self {
        Self { channel }
    }
}

#[async_trait]
impl FrameTx for DataChannelTx {
    async fn send(&self, frame: Bytes) -> Result<()> {
        let mut rest = frame;
        loop {
            let take = rest.len().min(CHUNK_BODY_BYTES);
            let body = rest.split_to(take);
            let last = rest.is_empty();
            let mut chunk = BytesMut::with_capacity(1 + body.len());
            chunk.put_u8(if last { CHUNK_FINAL } else { 0 });
            chunk.put_slice(&body);
            self.channel.send(chunk.freeze()).await?;
            if last {
                return Ok(());
            }
        }
    }

    fn kind(&self) -> TransportKind {
        TransportKind::DataChannel
    }

    async fn close(&self) {
        self.channel.close().await;
    }
}

pub struct DataChannelRx {
    channel: Arc<dyn ByteChannel>,
    partial: Mutex<BytesMut>,
}

impl DataChannelRx {
    pub fn new(channel: Arc<dyn ByteChannel>) -> Self {
        Self { channel, partial: Mutex::new(BytesMut::new()) }
    }
}

#[async_trait]
impl FrameRx for DataChannelRx {
    async fn recv(&self) -> Option<Bytes> {
        loop {
            let chunk = self.channel.recv().await?;
            if chunk.is_empty() {
                continue;
            }
            let mut partial = self.partial.lock().await;
            partial.extend_from_slice(&chunk[1..]);
            if chunk[0] & CHUNK_FINAL != 0 {
                return Some(partial.split().freeze());
            }
        }
    }
}

/// In-process byte channel, used in tests and by loopback tooling. Each end
/// sends into the other's inbox; capacity overflow drops, like the real
/// unreliable channel.
pub struct InMemoryChannel {
    tx: mpsc::Sender<Bytes>,
    rx: Mutex<mpsc::Receiver<Bytes>>,
}

pub fn byte_channel_pair(capacity: usize) -> (Arc<InMemoryChannel>, Arc<InMemoryChannel>) {
    let (a_tx, a_rx) = mpsc::channel(capacity);
    let (b_tx, b_rx) = mpsc::channel(capacity);
    let a = Arc::new(InMemoryChannel { tx: b_tx, rx: Mutex::new(a_rx) });
    let b = Arc::new(InMemoryChannel { tx: a_tx, rx: Mutex::new(b_rx) });
    (a, b)
}

#[async_trait]
impl ByteChannel for InMemoryChannel {
    async fn send(&self, chunk: Bytes) -> Result<()> {
        // Unreliable: full inbox means the chunk is lost, not an error.
        let _ = self.tx.try_send(chunk);
        Ok(())
    }

    async fn recv(&self) -> Option<Bytes> {
        self.rx.lock().await.recv().await
    }

    async fn close(&self) {}
}
