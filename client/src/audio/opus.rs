use anyhow::Result;

use pv_voice::{CodecError, VoiceCodec};

const MAX_PACKET_BYTES: usize = 4000;

/// Opus codec bound to one stream. Decoders carry prediction state, so every
/// (sender, listener) stream gets its own instance; sharing one decoder
/// corrupts concealment.
pub struct OpusVoiceCodec {
    enc: opus::Encoder,
    dec: opus::Decoder,
    channels: usize,
    frame_samples: usize,
}

impl OpusVoiceCodec {
    pub fn new(sample_rate: u32, channels: u8, frame_ms: u32) -> Result<Self> {
        let ch = if channels == 2 { opus::Channels::Stereo } else { opus::Channels::Mono };
        let enc = opus::Encoder::new(sample_rate, ch, opus::Application::Voip)?;
        let dec = opus::Decoder::new(sample_rate, ch)?;
        let frame_samples = (sample_rate as usize * frame_ms as usize / 1000) * channels as usize;
        Ok(Self { enc, dec, channels: channels as usize, frame_samples })
    }

    /// Encoder-side FEC hint from the server configuration.
    pub fn set_fec_percent(&mut self, percent: u32) -> Result<()> {
        self.enc.set_inband_fec(percent > 0)?;
        if percent > 0 {
            self.enc.set_packet_loss_perc(percent.min(20) as i32)?;
        }
        Ok(())
    }
}

impl VoiceCodec for OpusVoiceCodec {
    fn encode(&mut self, pcm: &[i16]) -> Result<Vec<u8>, CodecError> {
        let mut out = vec![0u8; MAX_PACKET_BYTES];
        let n = self
            .enc
            .encode(pcm, &mut out)
            .map_err(|e| CodecError::Encode(e.to_string()))?;
        out.truncate(n);
        Ok(out)
    }

    fn decode(&mut self, packet: Option<&[u8]>) -> Result<Vec<i16>, CodecError> {
        let mut out = vec![0i16; self.frame_samples];
        // An empty input asks libopus for packet-loss concealment.
        let input = packet.unwrap_or(&[]);
        let n = self
            .dec
            .decode(input, &mut out, false)
            .map_err(|e| CodecError::Decode(e.to_string()))?;
        out.truncate(n * self.channels);
        Ok(out)
    }
}
