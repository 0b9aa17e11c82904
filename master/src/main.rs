mod handlers;
mod state;

use anyhow::Context;
use common::{run_sweep_loop, Core, Settings};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::state::AppState;

const DEFAULT_LOG_FILTER: &str = "timevis_master=debug,common=info,tower_http=info";
const FLUSH_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .init();

    let settings = Settings::from_env();
    let core = Core::from_settings(&settings).context("armando el core")?;

    if let Some(pattern) = &settings.dataset_glob {
        match core.service.scan_datasets(pattern, settings.dataset_type) {
            Ok(found) => info!("scan inicial: {} datasets en {}", found.len(), pattern),
            Err(e) => warn!("scan inicial falló: {}", e),
        }
    }

    // lo que quedó a medias de la corrida anterior vuelve a la cola
    core.service.requeue_unfinished()?;
    let dispatcher = core.service.dispatcher().spawn(Arc::clone(&core.runner));

    // sweeper y flush periódico en segundo plano
    let (stop_tx, stop_rx) = watch::channel(false);
    let sweeper = tokio::spawn(run_sweep_loop(
        Arc::clone(&core.sweeper),
        settings.sweep_interval,
        stop_rx.clone(),
    ));
    let flusher = {
        let registry = Arc::clone(&core.registry);
        let mut stop = stop_rx;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = sleep(FLUSH_INTERVAL) => {}
                    _ = stop.changed() => break,
                }
                if let Err(e) = registry.flush() {
                    warn!("error guardando el registry: {}", e);
                }
            }
        })
    };

    let app = handlers::build_router(AppState::new(Arc::clone(&core.service)));
    let listener = TcpListener::bind(&settings.bind_addr)
        .await
        .with_context(|| format!("bind {}", settings.bind_addr))?;
    info!("master escuchando en {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("apagando: esperando jobs en curso");
    let _ = stop_tx.send(true);
    dispatcher.shutdown().await;
    let _ = sweeper.await;
    let _ = flusher.await;
    core.registry.flush().context("flush final del registry")?;
    info!("master detenido");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("no se pudo escuchar ctrl-c: {}", e);
        std::future::pending::<()>().await;
    }
}
