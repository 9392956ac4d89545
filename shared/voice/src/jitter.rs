//! Per-(sender, listener) jitter buffer with packet-loss concealment hooks.
//!
//! The buffer reorders frames by circular sequence number and releases them on
//! a fixed playback cadence. It never decodes: `tick` returns instructions
//! (`Frame` / `Conceal`) and the caller drives the codec, so the concealment
//! state stays with the per-stream decoder.
//!
//! Playback rules, evaluated once per frame interval:
//! 1. head == last_played + 1 and held >= depth: release it.
//! 2. head is further ahead and has waited >= 2 * depth: conceal the gap
//!    (at most MAX_CONSECUTIVE_PLC frames), then release the head.
//! 3. buffer empty: one concealment frame, sequence advances.
//! 4. arrivals at or before last_played are dropped at push time.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::trace;

use crate::seq::{seq_distance, seq_less, seq_next};

/// Gap concealment never synthesizes more than this many frames in a row;
/// anything longer is skipped, not padded.
pub const MAX_CONSECUTIVE_PLC: usize = 5;

pub const MIN_DEPTH_MS: u64 = 20;
pub const MAX_DEPTH_MS: u64 = 200;
pub const DEFAULT_DEPTH_MS: u64 = 80;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Playout {
    /// Decode and render this buffered frame.
    Frame { seq: u32, payload: Bytes },
    /// Frame `seq` is missing; invoke the codec with no input.
    Conceal { seq: u32 },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PushOutcome {
    Buffered,
    /// Sequence already buffered or already played.
    Duplicate,
    /// Arrived after its slot was played or concealed.
    Late,
    /// Buffer full; the farthest-future frame (possibly this one) was shed.
    Shed,
}

struct Entry {
    seq: u32,
    arrived: Instant,
    payload: Bytes,
}

// Ordering is circular, which is consistent as long as buffered sequences
// stay within a half-range window; the stale-drop on push guarantees that.
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed: BinaryHeap is a max-heap, we want the lowest seq on top.
        0.cmp(&(self.seq.wrapping_sub(other.seq) as i32))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for Entry {}

pub struct JitterBuffer {
    heap: BinaryHeap<Entry>,
    depth: Duration,
    max_frames: usize,
    last_played: Option<u32>,
}

impl JitterBuffer {
    /// `depth_ms` is clamped to [20, 200]. `frame_ms` is the nominal frame
    /// duration (20 ms everywhere in this system).
    pub fn new(depth_ms: u64, frame_ms: u64) -> Self {
        let depth_ms = depth_ms.clamp(MIN_DEPTH_MS, MAX_DEPTH_MS);
        let depth_frames = depth_ms.div_ceil(frame_ms.max(1)) as usize;
        Self {
            heap: BinaryHeap::new(),
            depth: Duration::from_millis(depth_ms),
            // Room for the hold depth plus reordering slack.
            max_frames: depth_frames + 16,
            last_played: None,
        }
    }

    pub fn depth(&self) -> Duration {
        self.depth
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn push(&mut self, seq: u32, payload: Bytes, now: Instant) -> PushOutcome {
        if let Some(last) = self.last_played {
            if !seq_less(last, seq) {
                return PushOutcome::Late;
            }
        } else {
            // First frame of the stream anchors the sequence space.
            self.last_played = Some(seq.wrapping_sub(1));
        }
        if self.heap.iter().any(|e| e.seq == seq) {
            return PushOutcome::Duplicate;
        }
        if self.heap.len() >= self.max_frames {
            // Bounded delay: shed whichever frame sits farthest in the future.
            let mut entries = std::mem::take(&mut self.heap).into_vec();
            entries.sort_by(|a, b| a.cmp(b).reverse()); // ascending sequence
            let farthest = entries.last().map(|e| e.seq).unwrap_or(seq);
            trace!(seq, farthest, "jitter buffer full, shedding");
            if seq_less(farthest, seq) {
                self.heap = entries.into();
                return PushOutcome::Shed;
            }
            entries.pop();
            self.heap = entries.into();
            self.heap.push(Entry { seq, arrived: now, payload });
            return PushOutcome::Shed;
        }
        self.heap.push(Entry { seq, arrived: now, payload });
        PushOutcome::Buffered
    }

    /// Evaluate the playback rules. Empty result means "not warmed up yet":
    /// the head frame exists but has not been held for the configured depth.
    pub fn tick(&mut self, now: Instant) -> Vec<Playout> {
        let mut out = Vec::new();
        let Some(last) = self.last_played else {
            // Nothing ever arrived; there is no stream to conceal.
            return out;
        };
        let next = seq_next(last);

        // Discard entries the sequence cursor has already passed (possible
        // after an empty-buffer concealment advanced it).
        while let Some(head) = self.heap.peek() {
            if seq_less(last, head.seq) {
                break;
            }
            self.heap.pop();
        }

        let Some(head) = self.heap.peek() else {
            self.last_played = Some(next);
            out.push(Playout::Conceal { seq: next });
            return out;
        };

        let head_seq = head.seq;
        let held = now.saturating_duration_since(head.arrived);
        if head_seq == next {
            if held >= self.depth {
                if let Some(e) = self.heap.pop() {
                    self.last_played = Some(e.seq);
                    out.push(Playout::Frame { seq: e.seq, payload: e.payload });
                }
            }
        } else if held >= self.depth * 2 {
            let gap = seq_distance(next, head_seq) as usize;
            for i in 0..gap.min(MAX_CONSECUTIVE_PLC) {
                out.push(Playout::Conceal { seq: next.wrapping_add(i as u32) });
            }
            if let Some(e) = self.heap.pop() {
                self.last_played = Some(e.seq);
                out.push(Playout::Frame { seq: e.seq, payload: e.payload });
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FRAME_MS: u64 = 20;

    fn pl(n: u8) -> Bytes {
        Bytes::from(vec![n; 10])
    }

    fn seqs(events: &[Playout]) -> Vec<(u32, bool)> {
        events
            .iter()
            .map(|e| match e {
                Playout::Frame { seq, .. } => (*seq, false),
                Playout::Conceal { seq } => (*seq, true),
            })
            .collect()
    }

    #[test]
    fn in_order_release_after_hold() {
        let mut jb = JitterBuffer::new(40, FRAME_MS);
        let t0 = Instant::now();
        jb.push(100, pl(1), t0);

        // Not held long enough yet.
        assert!(jb.tick(t0 + Duration::from_millis(10)).is_empty());

        let out = jb.tick(t0 + Duration::from_millis(40));
        assert_eq!(seqs(&out), vec![(100, false)]);
    }

    #[test]
    fn lost_frame_concealed_once() {
        // Scenario: 100, 101, 103, 104 arrive; 102 is lost; depth 40 ms.
        let mut jb = JitterBuffer::new(40, FRAME_MS);
        let t0 = Instant::now();
        jb.push(100, pl(0), t0);
        jb.push(101, pl(1), t0 + Duration::from_millis(20));
        jb.push(103, pl(3), t0 + Duration::from_millis(60));
        jb.push(104, pl(4), t0 + Duration::from_millis(80));

        let mut played = Vec::new();
        let mut t = t0 + Duration::from_millis(40);
        for _ in 0..10 {
            played.extend(jb.tick(t));
            t += Duration::from_millis(20);
            if played.len() >= 5 {
                break;
            }
        }

        let got = seqs(&played);
        assert_eq!(
            got,
            vec![(100, false), (101, false), (102, true), (103, false), (104, false)]
        );
        let plc_total = got.iter().filter(|(_, c)| *c).count();
        assert_eq!(plc_total, 1);
    }

    #[test]
    fn long_gap_caps_at_five_plc() {
        let mut jb = JitterBuffer::new(20, FRAME_MS);
        let t0 = Instant::now();
        jb.push(10, pl(0), t0);
        assert_eq!(seqs(&jb.tick(t0 + Duration::from_millis(20))), vec![(10, false)]);

        // Next arrival jumps 20 sequences ahead.
        jb.push(31, pl(1), t0 + Duration::from_millis(40));
        let out = jb.tick(t0 + Duration::from_millis(90));
        let got = seqs(&out);
        assert_eq!(got.len(), MAX_CONSECUTIVE_PLC + 1);
        assert_eq!(got[..5], [(11, true), (12, true), (13, true), (14, true), (15, true)]);
        assert_eq!(got[5], (31, false));
    }

    #[test]
    fn gap_not_concealed_before_double_depth() {
        let mut jb = JitterBuffer::new(40, FRAME_MS);
        let t0 = Instant::now();
        jb.push(5, pl(0), t0);
        assert_eq!(seqs(&jb.tick(t0 + Duration::from_millis(40))), vec![(5, false)]);

        jb.push(7, pl(2), t0 + Duration::from_millis(60));
        // 2*depth = 80 ms hold required before giving up on 6.
        assert!(jb.tick(t0 + Duration::from_millis(100)).is_empty());
        let out = jb.tick(t0 + Duration::from_millis(140));
        assert_eq!(seqs(&out), vec![(6, true), (7, false)]);
    }

    #[test]
    fn empty_buffer_emits_one_plc_and_advances() {
        let mut jb = JitterBuffer::new(20, FRAME_MS);
        let t0 = Instant::now();
        jb.push(50, pl(0), t0);
        assert_eq!(seqs(&jb.tick(t0 + Duration::from_millis(20))), vec![(50, false)]);

        let out = jb.tick(t0 + Duration::from_millis(40));
        assert_eq!(seqs(&out), vec![(51, true)]);
        let out = jb.tick(t0 + Duration::from_millis(60));
        assert_eq!(seqs(&out), vec![(52, true)]);

        // 53 arriving now is still playable.
        jb.push(53, pl(3), t0 + Duration::from_millis(60));
        let out = jb.tick(t0 + Duration::from_millis(80));
        assert_eq!(seqs(&out), vec![(53, false)]);
    }

    #[test]
    fn duplicates_and_late_arrivals_dropped() {
        let mut jb = JitterBuffer::new(20, FRAME_MS);
        let t0 = Instant::now();
        assert_eq!(jb.push(9, pl(0), t0), PushOutcome::Buffered);
        assert_eq!(jb.push(9, pl(0), t0), PushOutcome::Duplicate);
        assert_eq!(seqs(&jb.tick(t0 + Duration::from_millis(20))), vec![(9, false)]);
        assert_eq!(jb.push(9, pl(0), t0 + Duration::from_millis(21)), PushOutcome::Late);
        assert_eq!(jb.push(8, pl(0), t0 + Duration::from_millis(21)), PushOutcome::Late);
    }

    #[test]
    fn sequence_wraps_across_u32_boundary() {
        let mut jb = JitterBuffer::new(20, FRAME_MS);
        let t0 = Instant::now();
        jb.push(u32::MAX, pl(0), t0);
        jb.push(0, pl(1), t0);
        jb.push(1, pl(2), t0);

        let mut got = Vec::new();
        let mut t = t0 + Duration::from_millis(20);
        for _ in 0..3 {
            got.extend(jb.tick(t));
            t += Duration::from_millis(20);
        }
        assert_eq!(seqs(&got), vec![(u32::MAX, false), (0, false), (1, false)]);
    }

    #[test]
    fn idle_stream_emits_nothing() {
        let mut jb = JitterBuffer::new(80, FRAME_MS);
        assert!(jb.tick(Instant::now()).is_empty());
    }

    #[test]
    fn overflow_sheds_farthest_future() {
        let mut jb = JitterBuffer::new(20, FRAME_MS);
        let t0 = Instant::now();
        let cap = jb.max_frames;
        for i in 0..cap as u32 {
            assert_eq!(jb.push(100 + i, pl(0), t0), PushOutcome::Buffered);
        }
        // An even-further-future arrival is the one shed.
        assert_eq!(jb.push(100 + cap as u32, pl(0), t0), PushOutcome::Shed);
        assert_eq!(jb.len(), cap);
        assert!(jb.heap.iter().all(|e| e.seq != 100 + cap as u32));
        // A nearer frame displaces the current farthest instead.
        let out = jb.tick(t0 + Duration::from_millis(20));
        assert_eq!(seqs(&out), vec![(100, false)]);
        assert_eq!(jb.push(100, pl(0), t0), PushOutcome::Late);
    }
}
