use thiserror::Error;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("encode failed: {0}")]
    Encode(String),
    #[error("decode failed: {0}")]
    Decode(String),
}

/// Frame codec boundary. One instance per direction per stream; decoders keep
/// prediction state, so they must be per-(sender, listener).
///
/// `decode(None)` asks the codec to conceal a lost frame from its internal
/// state and return the synthesized PCM.
pub trait VoiceCodec: Send {
    fn encode(&mut self, pcm: &[i16]) -> Result<Vec<u8>, CodecError>;
    fn decode(&mut self, packet: Option<&[u8]>) -> Result<Vec<i16>, CodecError>;
}
