//! Voice routing engine: receive, decode, resolve, attenuate, fan out.
//!
//! Responsibilities:
//! - Parse and validate inbound media packets (both header variants).
//! - Enforce sender state (known, not muted, placed in the world).
//! - Resolve the recipient set through the proximity rules and group state.
//! - Re-encode per recipient with the identifier scheme that peer knows and
//!   the listener-relative position, then enqueue on its bounded queue.
//!
//! The router holds references to the registry, world cache, and group
//! manager; those three never reference each other. Payloads are opaque: no
//! decode, no mixing, per-recipient gain is rendered by the listener.
//!
//! Failure semantics: every drop is counted, nothing here is fatal, and one
//! recipient's transport trouble never blocks the rest of the fan-out.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use pv_control::{GroupManager, ParticipantId, SessionRegistry, WorldCache};
use pv_voice::{Quality, StreamStats};
use pv_wire::{MediaFrame, Packet, SenderRef};

use crate::proximity::{resolve_recipients, RouteDecision, DEFAULT_PROXIMITY_RANGE};
use crate::transport::{FailureWindow, FrameTx, SendQueue, TransportKind};

pub const FAILURE_THRESHOLD: usize = 3;
pub const FAILURE_WINDOW: Duration = Duration::from_secs(1);

/// Per-recipient fan-out target stored in the session registry.
#[derive(Clone)]
pub struct RecipientHandle {
    pub queue: Arc<SendQueue>,
    pub kind: TransportKind,
    /// Whether this peer has received the PLAYER_NAME announcements; decides
    /// short-id vs legacy full-id headers on frames we forward to it.
    pub announced: Arc<AtomicBool>,
}

impl RecipientHandle {
    pub fn new(queue: Arc<SendQueue>, kind: TransportKind) -> Self {
        Self { queue, kind, announced: Arc::new(AtomicBool::new(false)) }
    }

    pub fn mark_announced(&self) {
        self.announced.store(true, Ordering::Release);
    }
}

/// Metrics hook; the gateway wires this to the Prometheus recorder.
pub trait RouterMetrics: Send + Sync {
    fn inc_rx_packets(&self);
    fn inc_rx_bytes(&self, n: usize);
    fn inc_drop_malformed(&self);
    fn inc_drop_unknown_sender(&self);
    fn inc_drop_muted(&self);
    fn inc_drop_not_in_world(&self);
    fn inc_drop_queue_full(&self);
    fn inc_send_failed(&self);
    fn inc_forwarded(&self, fanout: usize);
}

pub struct NoopMetrics;

impl RouterMetrics for NoopMetrics {
    fn inc_rx_packets(&self) {}
    fn inc_rx_bytes(&self, _n: usize) {}
    fn inc_drop_malformed(&self) {}
    fn inc_drop_unknown_sender(&self) {}
    fn inc_drop_muted(&self) {}
    fn inc_drop_not_in_world(&self) {}
    fn inc_drop_queue_full(&self) {}
    fn inc_send_failed(&self) {}
    fn inc_forwarded(&self, _fanout: usize) {}
}

#[derive(Clone, Debug)]
pub struct RouterConfig {
    pub proximity_range: f32,
    /// Inbound frames larger than this are dropped before decode.
    pub max_frame_bytes: usize,
    pub per_recipient_queue: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            proximity_range: DEFAULT_PROXIMITY_RANGE,
            max_frame_bytes: 1400,
            per_recipient_queue: 64,
        }
    }
}

pub struct VoiceRouter {
    cfg: RouterConfig,
    registry: Arc<SessionRegistry<RecipientHandle>>,
    world: Arc<WorldCache>,
    groups: Arc<GroupManager>,
    metrics: Arc<dyn RouterMetrics>,
    streams: Mutex<HashMap<ParticipantId, StreamStats>>,
}

impl VoiceRouter {
    pub fn new(
        cfg: RouterConfig,
        registry: Arc<SessionRegistry<RecipientHandle>>,
        world: Arc<WorldCache>,
        groups: Arc<GroupManager>,
        metrics: Arc<dyn RouterMetrics>,
    ) -> Self {
        Self { cfg, registry, world, groups, metrics, streams: Mutex::new(HashMap::new()) }
    }

    pub fn config(&self) -> &RouterConfig {
        &self.cfg
    }

    /// Handle one inbound media datagram from an authenticated participant.
    /// `from` is the session the transport bound this traffic to; the packet
    /// sender must resolve to the same participant.
    pub async fn handle_incoming(&self, from: ParticipantId, raw: Bytes) {
        self.metrics.inc_rx_packets();
        self.metrics.inc_rx_bytes(raw.len());

        if raw.len() > self.cfg.max_frame_bytes {
            self.metrics.inc_drop_malformed();
            return;
        }

        let (frame, test) = match Packet::decode(&raw) {
            Ok(Packet::Audio(f)) => (f, false),
            Ok(Packet::TestAudio(f)) => (f, true),
            Ok(_) => {
                debug!(%from, "non-media packet on media path");
                self.metrics.inc_drop_malformed();
                return;
            }
            Err(e) => {
                debug!(%from, error = %e, "malformed media packet");
                self.metrics.inc_drop_malformed();
                return;
            }
        };

        let sender = match frame.sender {
            SenderRef::Short(s) => self.registry.resolve_by_short(s).await,
            SenderRef::Full(u) => self.registry.get(ParticipantId(u)).await,
        };
        let Some(sender) = sender else {
            // A PLAYER_NAME mapping that has not arrived yet, or a stale
            // frame from a torn-down session.
            self.metrics.inc_drop_unknown_sender();
            return;
        };
        if sender.id != from {
            warn!(%from, claimed = %sender.id, "sender id mismatch on media frame");
            self.metrics.inc_drop_unknown_sender();
            return;
        }

        {
            let mut streams = self.streams.lock().await;
            streams.entry(sender.id).or_default().record_arrival(frame.seq, Instant::now());
        }

        if sender.muted {
            self.metrics.inc_drop_muted();
            return;
        }

        let decisions = if test {
            self.broadcast_decisions(sender.id).await
        } else {
            let snapshot = self.world.snapshot().await;
            if snapshot.get(sender.id).is_none() {
                self.metrics.inc_drop_not_in_world();
                return;
            }
            let group = self.groups.group_of(sender.id).await;
            let connected: HashSet<ParticipantId> = self
                .registry
                .list()
                .await
                .into_iter()
                .filter(|p| p.voice_connected)
                .map(|p| p.id)
                .collect();
            resolve_recipients(
                sender.id,
                &snapshot,
                group.as_ref(),
                self.cfg.proximity_range,
                &connected,
            )
        };

        if decisions.is_empty() {
            return;
        }

        let mut fanout = 0usize;
        for decision in &decisions {
            let Some(handle) = self.registry.handle_of(decision.recipient).await else {
                continue;
            };
            let sender_ref = if handle.announced.load(Ordering::Acquire) {
                SenderRef::Short(sender.short)
            } else {
                SenderRef::Full(sender.id.0)
            };
            let out = MediaFrame {
                codec: frame.codec,
                sender: sender_ref,
                seq: frame.seq,
                payload: frame.payload.clone(),
                position: (!test).then_some(decision.relative),
            };
            let packet = if test { Packet::TestAudio(out) } else { Packet::Audio(out) };
            if handle.queue.push(packet.encode()) {
                self.metrics.inc_drop_queue_full();
            }
            fanout += 1;
        }
        self.metrics.inc_forwarded(fanout);
    }

    /// TEST_AUDIO bypasses proximity: every other voice-connected participant.
    async fn broadcast_decisions(&self, sender: ParticipantId) -> Vec<RouteDecision> {
        let mut out: Vec<RouteDecision> = self
            .registry
            .list()
            .await
            .into_iter()
            .filter(|p| p.id != sender && p.voice_connected)
            .map(|p| RouteDecision {
                recipient: p.id,
                distance: 0.0,
                gain: 1.0,
                relative: [0.0; 3],
            })
            .collect();
        out.sort_by_key(|d| d.recipient.0);
        out
    }

    /// Inbound stream health for one sender, if any frames arrived.
    pub async fn stream_report(&self, sender: ParticipantId) -> Option<StreamReport> {
        let streams = self.streams.lock().await;
        streams.get(&sender).map(|s| StreamReport {
            loss_percent: s.loss_percent(),
            jitter_ms: s.jitter_ms(),
            out_of_order: s.out_of_order(),
            quality: s.quality(),
        })
    }

    pub async fn forget_stream(&self, sender: ParticipantId) {
        self.streams.lock().await.remove(&sender);
    }
}

#[derive(Clone, Copy, Debug)]
pub struct StreamReport {
    pub loss_percent: f64,
    pub jitter_ms: f64,
    pub out_of_order: u64,
    pub quality: Quality,
}

/// Per-recipient send loop: drains the bounded queue into the transport.
/// Three send failures inside one second marks the recipient degraded; the
/// session owner gets told and tears the session down. Other recipients are
/// unaffected.
pub fn spawn_send_worker(
    recipient: ParticipantId,
    queue: Arc<SendQueue>,
    tx: Arc<dyn FrameTx>,
    metrics: Arc<dyn RouterMetrics>,
    degraded_tx: mpsc::Sender<ParticipantId>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut failures = FailureWindow::new(FAILURE_THRESHOLD, FAILURE_WINDOW);
        while let Some(frame) = queue.pop().await {
            match tx.send(frame).await {
                Ok(()) => failures.record_success(),
                Err(e) => {
                    metrics.inc_send_failed();
                    warn!(%recipient, transport = tx.kind().as_str(), error = %e, "frame send failed");
                    if failures.record_failure(Instant::now()) {
                        let _ = degraded_tx.send(recipient).await;
                        break;
                    }
                }
            }
        }
        queue.close();
    })
}
