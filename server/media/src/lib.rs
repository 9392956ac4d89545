pub mod proximity;
pub mod router;
pub mod transport;

pub use proximity::{resolve_recipients, RouteDecision, DEFAULT_PROXIMITY_RANGE};
pub use router::{NoopMetrics, RecipientHandle, RouterConfig, RouterMetrics, VoiceRouter};
pub use transport::{FailureWindow, FrameRx, FrameTx, SendQueue, TransportKind};
