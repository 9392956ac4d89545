use clap::Parser;
use tracing::warn;

pub const VALID_SAMPLE_RATES: [u32; 5] = [8000, 12000, 16000, 24000, 48000];

#[derive(Parser, Debug, Clone)]
#[command(name = "pv-gateway", about = "Proximity voice routing gateway")]
pub struct Config {
    /// Bind port for the framed (WebSocket) signaling transport.
    #[arg(long, default_value_t = 24455, env = "PV_SIGNALING_PORT")]
    pub signaling_port: u16,

    /// Bind port for the datagram (UDP) media transport.
    #[arg(long, default_value_t = 24454, env = "PV_MEDIA_PORT")]
    pub media_port: u16,

    #[arg(long, default_value_t = false, env = "PV_ENABLE_TLS")]
    pub enable_tls: bool,

    #[arg(long, env = "PV_TLS_CERT_PATH")]
    pub tls_cert_path: Option<String>,

    #[arg(long, env = "PV_TLS_KEY_PATH")]
    pub tls_key_path: Option<String>,

    /// Origin allow-list for the signaling transport; "*" accepts any.
    #[arg(long, value_delimiter = ',', default_value = "*", env = "PV_ALLOWED_ORIGINS")]
    pub allowed_origins: Vec<String>,

    /// Proximity range R in world units.
    #[arg(long, default_value_t = 30.0, env = "PV_PROXIMITY_RANGE")]
    pub proximity_range: f32,

    /// Server-selected Opus sample rate.
    #[arg(long, default_value_t = 48_000, env = "PV_SAMPLE_RATE")]
    pub sample_rate: u32,

    /// Default jitter buffer depth advertised to clients.
    #[arg(long, default_value_t = 80, env = "PV_JITTER_BUFFER_MS")]
    pub jitter_buffer_ms: u32,

    /// Encoder-side FEC ratio hint, 0-20 percent.
    #[arg(long, default_value_t = 10, env = "PV_FEC_PERCENT")]
    pub fec_percent: u32,

    #[arg(long, default_value = "127.0.0.1:9090", env = "PV_METRICS_LISTEN")]
    pub metrics_listen: String,

    /// Dev mode: any participant that authenticates is placed in the world
    /// at the origin, so voice can be exercised without a game adapter.
    #[arg(long, default_value_t = false)]
    pub dev_mode: bool,

    #[arg(long, default_value = "proximity-voice")]
    pub server_name: String,
}

impl Config {
    /// Normalize out-of-range values. Everything here is read once at
    /// startup; nothing re-reads configuration at runtime.
    pub fn sanitize(mut self) -> Self {
        if !VALID_SAMPLE_RATES.contains(&self.sample_rate) {
            warn!(requested = self.sample_rate, "invalid sample rate, using 48000");
            self.sample_rate = 48_000;
        }
        if self.fec_percent > 20 {
            warn!(requested = self.fec_percent, "fec percent clamped to 20");
            self.fec_percent = 20;
        }
        self.jitter_buffer_ms = self.jitter_buffer_ms.clamp(20, 200);
        self
    }
}

/// Coerce a client-requested sample rate onto the valid set.
pub fn coerce_sample_rate(requested: u32, configured: u32) -> u32 {
    if requested == 0 || requested == configured {
        return configured;
    }
    if VALID_SAMPLE_RATES.contains(&requested) {
        requested
    } else {
        warn!(requested, "unsupported sample rate requested, coercing to 48000");
        48_000
    }
}
