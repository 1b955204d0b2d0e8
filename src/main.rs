/*!
# Prompt Runner
AI Search Brand Visibility Tracking Pipeline

One process runs the whole pipeline: the submission API and provider
webhook, the provider-selection controller, both dispatcher workers
over the topic queue, and the nightly scheduler.
*/

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio_cron_scheduler::JobScheduler;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use prompt_runner::brightdata::BrightdataClient;
use prompt_runner::database::Database;
use prompt_runner::dataforseo::DataForSeoClient;
use prompt_runner::dispatch::callback::{CallbackDispatcher, CallbackHandler};
use prompt_runner::dispatch::polling::PollingDispatcher;
use prompt_runner::dispatch::run_dispatcher;
use prompt_runner::metrics;
use prompt_runner::notifier::Notifier;
use prompt_runner::queue::Queue;
use prompt_runner::scheduler::NightlyRunner;
use prompt_runner::selector::ProviderSelector;
use prompt_runner::volume::VolumeClient;
use prompt_runner::web::{create_router, AppState};
use prompt_runner::Settings;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,tower_http=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting prompt-runner v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let settings = Settings::load()?;
    settings.validate()?;
    let settings = Arc::new(settings);
    info!("Configuration loaded");

    // Initialize database
    let db = Database::connect(&settings.database_url).await?;
    info!("Database connected");

    let shutdown = CancellationToken::new();

    // Provider-selection controller
    let selector = ProviderSelector::new(&settings);
    selector.spawn(shutdown.clone());
    info!("Provider health probes started");

    // Shared services
    let queue = Queue::new(
        Duration::from_secs(settings.queue_redelivery_delay_secs),
        settings.queue_max_deliveries,
    );
    let notifier = Notifier::new(&settings);
    if !notifier.enabled() {
        warn!("email credentials missing, notifications disabled");
    }
    let volume = VolumeClient::from_settings(&settings);
    let metrics = metrics::global().clone();

    // Dispatcher workers, one per configured provider
    let brightdata = match BrightdataClient::from_settings(&settings) {
        Ok(client) => {
            let dispatcher = Arc::new(PollingDispatcher::new(
                db.clone(),
                notifier.clone(),
                client.clone(),
                volume.clone(),
            ));
            tokio::spawn(run_dispatcher(
                queue.clone(),
                db.clone(),
                notifier.clone(),
                dispatcher,
                shutdown.clone(),
            ));
            info!("Bright Data dispatcher started");
            Some(client)
        }
        Err(e) => {
            warn!(error = %e, "Bright Data not configured, polling dispatcher disabled");
            None
        }
    };

    match DataForSeoClient::from_settings(&settings) {
        Ok(client) => {
            let dispatcher = Arc::new(CallbackDispatcher::new(
                db.clone(),
                notifier.clone(),
                client,
                settings.app_url.clone(),
            ));
            tokio::spawn(run_dispatcher(
                queue.clone(),
                db.clone(),
                notifier.clone(),
                dispatcher,
                shutdown.clone(),
            ));
            info!("DataForSEO dispatcher started");
        }
        Err(e) => {
            warn!(error = %e, "DataForSEO not configured, callback dispatcher disabled");
        }
    }

    // Nightly scheduler
    let runner = NightlyRunner::new(
        db.clone(),
        queue.clone(),
        selector.clone(),
        settings.clone(),
    );
    let mut scheduler = JobScheduler::new()
        .await
        .map_err(|e| anyhow::anyhow!("scheduler init failed: {e}"))?;
    runner.start(&scheduler).await?;
    scheduler
        .start()
        .await
        .map_err(|e| anyhow::anyhow!("scheduler start failed: {e}"))?;

    // HTTP surface
    let state = AppState {
        db: db.clone(),
        settings: settings.clone(),
        selector: selector.clone(),
        queue: queue.clone(),
        notifier: notifier.clone(),
        callback_handler: CallbackHandler::new(db.clone(), notifier.clone(), volume.clone()),
        brightdata,
        metrics,
    };
    let app = create_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], settings.port));
    info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let server_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "failed to listen for shutdown signal");
            }
            info!("shutdown signal received, draining");
            server_shutdown.cancel();
        })
        .await?;

    // Stop consumers and the cron loop before exiting
    shutdown.cancel();
    if let Err(e) = scheduler.shutdown().await {
        warn!(error = %e, "scheduler shutdown failed");
    }

    info!("prompt-runner stopped");
    Ok(())
}
