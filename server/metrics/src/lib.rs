pub mod config;
pub mod http;
pub mod routing;
pub mod session;

pub use config::MetricsConfig;
pub use http::MetricsServer;
pub use routing::RoutingMetrics;
pub use session::SessionMetrics;
