use clap::Parser;
use uuid::Uuid;

#[derive(Parser, Debug, Clone)]
#[command(name = "pv-client", about = "Proximity voice client")]
pub struct Config {
    /// Signaling endpoint, e.g. ws://127.0.0.1:24455
    #[arg(long, default_value = "ws://127.0.0.1:24455")]
    pub server: String,

    /// Display name shown to other participants.
    #[arg(long, default_value = "User")]
    pub name: String,

    /// Stable player id; generated when omitted.
    #[arg(long)]
    pub player_id: Option<Uuid>,

    /// Auth token forwarded to the server's provider.
    #[arg(long)]
    pub token: Option<String>,

    /// Requested sample rate; 0 lets the server choose.
    #[arg(long, default_value_t = 0)]
    pub sample_rate: u32,

    /// Jitter buffer depth in milliseconds (20-200).
    #[arg(long, default_value_t = 80)]
    pub jitter_buffer_ms: u64,

    /// Transmit a synthetic tone instead of staying silent. There is no
    /// capture hardware in this binary; the tone exercises the full path.
    #[arg(long, default_value_t = false)]
    pub synthetic_tone: bool,
}
