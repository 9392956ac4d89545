//! Playback scheduler: one jitter buffer and one decoder per remote stream,
//! driven by a 20 ms tick. Decoded PCM is scaled by the forwarded gain and
//! handed to a `PcmSink`; the hardware boundary stays outside this crate.

use std::collections::HashMap;
use std::time::Instant;

use tracing::{debug, warn};
use uuid::Uuid;

use pv_voice::{JitterBuffer, Playout, PushOutcome, StreamStats, VoiceCodec};
use pv_wire::{MediaFrame, SenderRef};

/// Streams with nothing buffered for this many ticks (~1 s at 20 ms) are
/// torn down, decoder state included.
const STREAM_IDLE_TICKS: u32 = 50;

pub trait PcmSink: Send {
    fn play(&mut self, pcm: &[i16]);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StreamKey {
    Short(u32),
    Full(Uuid),
}

impl From<SenderRef> for StreamKey {
    fn from(s: SenderRef) -> Self {
        match s {
            SenderRef::Short(id) => Self::Short(id.0),
            SenderRef::Full(u) => Self::Full(u),
        }
    }
}

struct Stream {
    jitter: JitterBuffer,
    codec: Box<dyn VoiceCodec>,
    stats: StreamStats,
    /// Gain per buffered sequence, derived from the forwarded position.
    gains: HashMap<u32, f32>,
    last_gain: f32,
    idle_ticks: u32,
}

pub struct Playback<S: PcmSink> {
    sink: S,
    codec_factory: Box<dyn Fn() -> Box<dyn VoiceCodec> + Send>,
    streams: HashMap<StreamKey, Stream>,
    depth_ms: u64,
    frame_ms: u64,
    max_range: f32,
}

impl<S: PcmSink> Playback<S> {
    pub fn new(
        sink: S,
        codec_factory: Box<dyn Fn() -> Box<dyn VoiceCodec> + Send>,
        depth_ms: u64,
        frame_ms: u64,
        max_range: f32,
    ) -> Self {
        Self {
            sink,
            codec_factory,
            streams: HashMap::new(),
            depth_ms,
            frame_ms,
            max_range,
        }
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    /// Buffer one forwarded media frame.
    pub fn ingest(&mut self, frame: &MediaFrame, now: Instant) {
        let key = StreamKey::from(frame.sender);
        let depth = self.depth_ms;
        let frame_ms = self.frame_ms;
        let factory = &self.codec_factory;
        let stream = self.streams.entry(key).or_insert_with(|| Stream {
            jitter: JitterBuffer::new(depth, frame_ms),
            codec: factory(),
            stats: StreamStats::default(),
            gains: HashMap::new(),
            last_gain: 1.0,
            idle_ticks: 0,
        });

        stream.stats.record_arrival(frame.seq, now);
        stream.idle_ticks = 0;

        let gain = gain_from_position(frame.position, self.max_range);
        match stream.jitter.push(frame.seq, frame.payload.clone(), now) {
            PushOutcome::Buffered => {
                stream.gains.insert(frame.seq, gain);
            }
            PushOutcome::Shed => {
                stream.gains.insert(frame.seq, gain);
            }
            PushOutcome::Duplicate | PushOutcome::Late => {}
        }
    }

    /// One playback interval: release or conceal per stream, decode, scale,
    /// and hand PCM to the sink.
    pub fn tick(&mut self, now: Instant) {
        let mut dead = Vec::new();
        for (key, stream) in self.streams.iter_mut() {
            let events = stream.jitter.tick(now);
            // Concealment-only ticks count toward idle; a real frame resets.
            if events.iter().any(|e| matches!(e, Playout::Frame { .. })) {
                stream.idle_ticks = 0;
            } else {
                stream.idle_ticks += 1;
                if stream.idle_ticks >= STREAM_IDLE_TICKS {
                    dead.push(*key);
                }
            }
            for event in events {
                let (pcm, gain) = match event {
                    Playout::Frame { seq, payload } => {
                        let gain = stream.gains.remove(&seq).unwrap_or(stream.last_gain);
                        match stream.codec.decode(Some(&payload)) {
                            Ok(pcm) => (pcm, gain),
                            Err(e) => {
                                debug!(?key, error = %e, "decode failed, concealing");
                                stream.stats.record_decode_failure();
                                match stream.codec.decode(None) {
                                    Ok(pcm) => (pcm, gain),
                                    Err(_) => continue,
                                }
                            }
                        }
                    }
                    Playout::Conceal { seq } => {
                        stream.gains.remove(&seq);
                        match stream.codec.decode(None) {
                            Ok(pcm) => (pcm, stream.last_gain),
                            Err(e) => {
                                warn!(?key, error = %e, "concealment failed");
                                continue;
                            }
                        }
                    }
                };
                stream.last_gain = gain;
                if (gain - 1.0).abs() < f32::EPSILON {
                    self.sink.play(&pcm);
                } else {
                    let scaled: Vec<i16> =
                        pcm.iter().map(|s| (*s as f32 * gain) as i16).collect();
                    self.sink.play(&scaled);
                }
            }
        }
        for key in dead {
            debug!(?key, "stream idle, dropping decoder");
            self.streams.remove(&key);
        }
    }

    pub fn quality_of(&self, key: StreamKey) -> Option<pv_voice::Quality> {
        self.streams.get(&key).map(|s| s.stats.quality())
    }
}

/// The forwarded position triple carries the spatial metadata: its magnitude
/// is the effective distance (zero for group/isolated full-volume routes),
/// and quadratic roll-off reconstructs the server-computed attenuation.
pub fn gain_from_position(position: Option<[f32; 3]>, max_range: f32) -> f32 {
    let Some([x, y, z]) = position else {
        return 1.0;
    };
    let d = ((x as f64).powi(2) + (y as f64).powi(2) + (z as f64).powi(2)).sqrt();
    let r = max_range as f64;
    if r <= 0.0 || d >= r {
        return 0.0;
    }
    let a = 1.0 - d / r;
    (a * a) as f32
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use bytes::Bytes;
    use pv_voice::CodecError;
    use pv_wire::{CodecTag, ShortId};

    /// Codec stub: "decoding" echoes the payload bytes widened to i16; PLC
    /// yields a recognizable constant frame.
    struct StubCodec;

    impl VoiceCodec for StubCodec {
        fn encode(&mut self, pcm: &[i16]) -> Result<Vec<u8>, CodecError> {
            Ok(pcm.iter().map(|s| *s as u8).collect())
        }

        fn decode(&mut self, packet: Option<&[u8]>) -> Result<Vec<i16>, CodecError> {
            match packet {
                Some(p) => Ok(p.iter().map(|b| *b as i16).collect()),
                None => Ok(vec![-1; 4]),
            }
        }
    }

    #[derive(Clone, Default)]
    struct MemorySink {
        frames: Arc<Mutex<Vec<Vec<i16>>>>,
    }

    impl PcmSink for MemorySink {
        fn play(&mut self, pcm: &[i16]) {
            self.frames.lock().unwrap().push(pcm.to_vec());
        }
    }

    fn playback(sink: MemorySink) -> Playback<MemorySink> {
        Playback::new(sink, Box::new(|| Box::new(StubCodec)), 40, 20, 30.0)
    }

    fn frame(sender: u32, seq: u32, byte: u8, position: Option<[f32; 3]>) -> MediaFrame {
        MediaFrame {
            codec: CodecTag::Opus,
            sender: SenderRef::Short(ShortId(sender)),
            seq,
            payload: Bytes::from(vec![byte; 4]),
            position,
        }
    }

    #[test]
    fn gain_reconstruction() {
        assert_eq!(gain_from_position(None, 30.0), 1.0);
        assert_eq!(gain_from_position(Some([0.0; 3]), 30.0), 1.0);
        let g = gain_from_position(Some([0.0, 0.0, 25.0]), 30.0);
        assert!((g - 0.0278).abs() < 1e-3, "g={g}");
        assert_eq!(gain_from_position(Some([0.0, 0.0, 35.0]), 30.0), 0.0);
    }

    #[test]
    fn plays_in_order_with_gap_concealment() {
        let sink = MemorySink::default();
        let frames = sink.frames.clone();
        let mut pb = playback(sink);
        let t0 = Instant::now();

        for (i, seq) in [0u32, 1, 3].iter().enumerate() {
            pb.ingest(&frame(1, *seq, *seq as u8 + 10, None), t0 + Duration::from_millis(20 * i as u64));
        }

        let mut t = t0 + Duration::from_millis(40);
        for _ in 0..8 {
            pb.tick(t);
            t += Duration::from_millis(20);
        }

        let played = frames.lock().unwrap();
        // 0, 1, PLC for 2, then 3.
        assert_eq!(played[0], vec![10; 4]);
        assert_eq!(played[1], vec![11; 4]);
        assert_eq!(played[2], vec![-1; 4]);
        assert_eq!(played[3], vec![13; 4]);
    }

    #[test]
    fn separate_senders_get_separate_streams() {
        let sink = MemorySink::default();
        let mut pb = playback(sink);
        let t0 = Instant::now();
        pb.ingest(&frame(1, 5, 1, None), t0);
        pb.ingest(&frame(2, 900, 2, None), t0);
        assert_eq!(pb.stream_count(), 2);
    }

    #[test]
    fn gain_scales_samples() {
        let sink = MemorySink::default();
        let frames = sink.frames.clone();
        let mut pb = playback(sink);
        let t0 = Instant::now();

        // Distance 15 of 30: gain 0.25.
        pb.ingest(&frame(1, 0, 100, Some([0.0, 0.0, 15.0])), t0);
        pb.tick(t0 + Duration::from_millis(40));

        let played = frames.lock().unwrap();
        assert_eq!(played[0], vec![25; 4]);
    }

    #[test]
    fn idle_stream_is_reaped() {
        let sink = MemorySink::default();
        let mut pb = playback(sink);
        let t0 = Instant::now();
        pb.ingest(&frame(1, 0, 1, None), t0);

        let mut t = t0 + Duration::from_millis(40);
        for _ in 0..(STREAM_IDLE_TICKS + 60) {
            pb.tick(t);
            t += Duration::from_millis(20);
        }
        assert_eq!(pb.stream_count(), 0);
    }
}
