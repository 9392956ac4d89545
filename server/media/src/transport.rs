//! Uniform frame-transport abstraction over the three concrete transports,
//! plus the bounded per-recipient outbound queue.
//!
//! The routing engine never branches on the transport kind: it writes frames
//! through `FrameTx` and the adapters deal with their own wire realities
//! (datagram MTU, JSON/base64 envelope, data-channel chunking).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Notify;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportKind {
    Datagram,
    Framed,
    DataChannel,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Datagram => "datagram",
            Self::Framed => "framed",
            Self::DataChannel => "data_channel",
        }
    }
}

/// Outbound half of a transport.
#[async_trait]
pub trait FrameTx: Send + Sync {
    async fn send(&self, frame: Bytes) -> Result<()>;
    fn kind(&self) -> TransportKind;
    async fn close(&self);
}

/// Inbound half. Returns `None` once the transport is closed.
#[async_trait]
pub trait FrameRx: Send + Sync {
    async fn recv(&self) -> Option<Bytes>;
}

/// Bounded outbound frame queue. When full, the OLDEST queued frame is shed:
/// a recipient behind on reading gets fresh audio and its jitter buffer
/// conceals the hole, instead of drifting further behind.
pub struct SendQueue {
    frames: Mutex<VecDeque<Bytes>>,
    notify: Notify,
    capacity: usize,
    closed: AtomicBool,
    shed: AtomicU64,
}

impl SendQueue {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            frames: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            capacity: capacity.max(1),
            closed: AtomicBool::new(false),
            shed: AtomicU64::new(0),
        })
    }

    /// Enqueue a frame. Returns true if an older frame was shed to make room.
    pub fn push(&self, frame: Bytes) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        let dropped = {
            let mut q = self.frames.lock().unwrap_or_else(|e| e.into_inner());
            let dropped = if q.len() >= self.capacity {
                q.pop_front();
                true
            } else {
                false
            };
            q.push_back(frame);
            dropped
        };
        if dropped {
            self.shed.fetch_add(1, Ordering::Relaxed);
        }
        self.notify.notify_one();
        dropped
    }

    /// Await the next frame; `None` once closed and drained.
    pub async fn pop(&self) -> Option<Bytes> {
        loop {
            {
                let mut q = self.frames.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(f) = q.pop_front() {
                    return Some(f);
                }
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            self.notify.notified().await;
        }
    }

    /// Non-blocking pop, used by tests and drain paths.
    pub fn try_pop(&self) -> Option<Bytes> {
        self.frames.lock().unwrap_or_else(|e| e.into_inner()).pop_front()
    }

    pub fn len(&self) -> usize {
        self.frames.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn shed_count(&self) -> u64 {
        self.shed.load(Ordering::Relaxed)
    }

    /// Close the queue. In-flight frames are discarded, not drained.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.frames.lock().unwrap_or_else(|e| e.into_inner()).clear();
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Consecutive-failure tracker: `threshold` failures inside `window` marks the
/// transport degraded. Any success resets the run.
pub struct FailureWindow {
    failures: VecDeque<Instant>,
    threshold: usize,
    window: Duration,
}

impl FailureWindow {
    pub fn new(threshold: usize, window: Duration) -> Self {
        Self { failures: VecDeque::with_capacity(threshold), threshold, window }
    }

    pub fn record_success(&mut self) {
        self.failures.clear();
    }

    /// Record one failure; true when the degradation threshold is crossed.
    pub fn record_failure(&mut self, now: Instant) -> bool {
        while let Some(&front) = self.failures.front() {
            if now.duration_since(front) > self.window {
                self.failures.pop_front();
            } else {
                break;
            }
        }
        self.failures.push_back(now);
        self.failures.len() >= self.threshold
    }
}
