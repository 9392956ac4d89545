pub mod codec;
pub mod jitter;
pub mod seq;
pub mod stats;

pub use codec::{CodecError, VoiceCodec};
pub use jitter::{JitterBuffer, Playout, PushOutcome};
pub use stats::{Quality, StreamStats};
