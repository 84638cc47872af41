use std::env;

use revwatch::Error;
use revwatch::Result;
use revwatch::Settings;
use revwatch::WatchableStore;
use tokio::signal::unix::signal;
use tokio::signal::unix::SignalKind;
use tokio::sync::watch;
use tracing::error;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer;

#[tokio::main(flavor = "multi_thread", worker_threads = 2)]
async fn main() -> Result<()> {
    init_observability();

    // optional override file as the first argument
    let override_path = env::args().nth(1);
    let settings = Settings::load(override_path.as_deref())?;
    info!(?settings, "configuration loaded");

    let (graceful_tx, graceful_rx) = watch::channel(());

    let metrics = if settings.monitoring.prometheus_enabled {
        let port = settings.monitoring.prometheus_port;
        Some(tokio::spawn(revwatch::start_server(port, graceful_rx.clone())))
    } else {
        None
    };

    let store = WatchableStore::new(settings.watch);
    store.start()?;
    info!(
        revision = store.current_revision(),
        "watch engine ready. Waiting for CTRL+C signal..."
    );

    if let Err(e) = graceful_shutdown(graceful_tx).await {
        error!("failed to shutdown: {:?}", e);
    }

    store.engine().shutdown().await?;
    if let Some(metrics) = metrics {
        metrics.await?;
    }

    info!("exiting program");
    Ok(())
}

async fn graceful_shutdown(graceful_tx: watch::Sender<()>) -> Result<()> {
    let mut sigint = signal(SignalKind::interrupt())
        .map_err(|e| Error::Fatal(format!("cannot install SIGINT handler: {e}")))?;
    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| Error::Fatal(format!("cannot install SIGTERM handler: {e}")))?;
    tokio::select! {
        _ = sigint.recv() => {
            info!("SIGINT detected.");
        },
        _ = sigterm.recv() => {
            info!("SIGTERM detected.");
        },
    }

    info!("shutting down..");
    graceful_tx
        .send(())
        .map_err(|e| Error::Fatal(format!("failed to send shutdown signal: {e}")))?;
    Ok(())
}

fn init_observability() {
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")));
    tracing_subscriber::registry().with(fmt_layer).init();
}
