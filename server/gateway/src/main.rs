use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

use pv_gateway::auth::DevAuthProvider;
use pv_gateway::config::Config;
use pv_gateway::peerlink::NullPeerConnector;
use pv_gateway::{signaling, state};
use pv_media::RouterMetrics;
use pv_metrics::{MetricsConfig, MetricsServer, RoutingMetrics};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .init();

    let cfg = Config::parse().sanitize();

    let ms = MetricsServer::install(MetricsConfig {
        listen: cfg.metrics_listen.clone(),
        namespace: "pv",
    })?;
    tokio::spawn(async move {
        let _ = ms.serve().await;
    });

    let router_metrics: Arc<dyn RouterMetrics> = Arc::new(RoutingMetrics::new("pv"));
    let gateway = state::bootstrap(
        cfg,
        Arc::new(DevAuthProvider),
        Arc::new(NullPeerConnector),
        router_metrics,
    )
    .await?;

    let listener = signaling::bind_signaling(&gateway).await?;

    tokio::select! {
        r = signaling::run_signaling(gateway.clone(), listener) => r?,
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown");
            gateway.shutdown().await;
            // Give session tasks a moment to flush DISCONNECT_ACKs.
            tokio::time::sleep(std::time::Duration::from_millis(250)).await;
        }
    }

    Ok(())
}
