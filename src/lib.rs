pub mod cache;
pub mod cli;
pub mod gateway;
pub mod headers;
pub mod logging;
pub mod metrics;
pub mod origin;
pub mod settings;

use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use crate::{
    cache::ResponseCache,
    gateway::AppContext,
    origin::{HttpOrigin, OriginFetcher},
    settings::Settings,
};

pub async fn run(settings: Settings) -> Result<()> {
    if let Some(addr) = settings.metrics_listen {
        let path = "/metrics".to_string();
        tokio::spawn(async move {
            tracing::info!(address = %addr, "metrics endpoint starting");
            if let Err(err) = crate::metrics::serve(addr, path).await {
                tracing::error!(error = %err, "metrics endpoint failed");
            }
        });
    }

    let origin: Arc<dyn OriginFetcher> =
        Arc::new(HttpOrigin::new(&settings.origin, settings.max_body_size)?);
    let cache = ResponseCache::new(settings.cache_config(), origin)?;
    info!(
        origin = %settings.origin,
        capacity = settings.cache_total_capacity,
        max_entries = settings.cache_max_entries,
        routes = settings.routes.len(),
        "response cache ready"
    );

    let listener = gateway::bind(settings.listen).await?;
    let app = AppContext::new(cache.clone());
    gateway::serve(listener, app, shutdown_signal()).await?;

    let drained = cache.shutdown();
    info!(drained, "gateway stopped");
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(signal) => signal,
        Err(err) => {
            tracing::error!(error = %err, "failed to install SIGTERM handler");
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %err, "failed to listen for ctrl-c");
            }
            return;
        }
    };

    tokio::select! {
        _ = term.recv() => tracing::info!("received SIGTERM; shutting down"),
        result = tokio::signal::ctrl_c() => {
            if let Err(err) = result {
                tracing::error!(error = %err, "failed to listen for ctrl-c");
            }
            tracing::info!("received interrupt; shutting down");
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for ctrl-c");
    }
}
