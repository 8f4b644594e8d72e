//! Listen to an event hub and log the blob creation notifications published to it.
use std::sync::Arc;
use std::time::Duration;

use envconfig::Envconfig;
use eyre::Result;
use tokio::task::JoinHandle;
use tracing::{error, info};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use event_receiver::config::Config;
use event_receiver::health::HealthRegistry;
use event_receiver::listener::NotificationListener;
use event_receiver::metrics::{router, serve, setup_metrics_recorder};
use event_receiver::processor::EventProcessor;

fn setup_tracing() {
    let log_layer = tracing_subscriber::fmt::layer().with_filter(
        EnvFilter::builder()
            .with_default_directive(LevelFilter::INFO.into())
            .from_env_lossy(),
    );
    tracing_subscriber::registry().with(log_layer).init();
}

fn start_health_liveness_server(
    config: &Config,
    liveness: HealthRegistry,
) -> Result<JoinHandle<()>> {
    let recorder_handle = setup_metrics_recorder()?;
    let router = router(liveness, Some(recorder_handle));
    let bind = config.bind();

    Ok(tokio::task::spawn(async move {
        if let Err(e) = serve(router, &bind).await {
            error!("failed to serve metrics on {}: {}", bind, e);
        }
    }))
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(terminate) => terminate,
            Err(e) => {
                error!("failed to install SIGTERM handler: {}", e);
                wait_for_ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = terminate.recv() => {},
        }
    }

    #[cfg(not(unix))]
    {
        wait_for_ctrl_c().await;
    }
}

async fn wait_for_ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("failed to listen for ctrl-c: {}", e);
        std::future::pending::<()>().await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_tracing();

    let config = Config::init_from_env()?;

    let liveness = HealthRegistry::new("liveness");
    let consumer_liveness = liveness
        .register("rdkafka".to_string(), Duration::from_secs(30))
        .await;

    if config.export_prometheus {
        start_health_liveness_server(&config, liveness.clone())?;
    }

    let listener = Arc::new(NotificationListener::new());
    let subscription = EventProcessor::start(&config, listener, consumer_liveness)?;

    let run_duration = config.run_duration();
    info!(
        event_hub = subscription.event_hub_name(),
        "processing events for {:?}", run_duration
    );

    let failed = tokio::select! {
        _ = tokio::time::sleep(run_duration) => {
            info!("run duration elapsed");
            false
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
            false
        }
        _ = subscription.closed() => {
            error!(
                event_hub = subscription.event_hub_name(),
                "event processor stopped on a fatal client error"
            );
            true
        }
    };

    subscription.stop().await?;

    if failed {
        return Err(eyre::eyre!("event processor stopped unexpectedly"));
    }
    Ok(())
}
