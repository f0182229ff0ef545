use std::sync::Arc;

use clap::Parser;
use eyre::Result;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use safewatch_watcher::{
    default_table, EventClassifier, HttpSink, NotificationDispatcher, ProviderFeed, SubscriptionError,
    SubscriptionManager, SubscriptionStats, WatcherConfig,
};

#[tokio::main]
async fn main() -> Result<()> {
    let config = WatcherConfig::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    config.validate()?;
    let endpoint = config.feed_endpoint()?;

    tracing::info!(
        endpoint = %endpoint,
        notify_url = %config.notify_url,
        subscriptions = ?config.subscriptions,
        max_in_flight = config.max_in_flight,
        "Starting Safe owner watcher"
    );

    let classifier = Arc::new(EventClassifier::new(Arc::new(default_table().clone())));
    tracing::info!(selectors = classifier.table().len(), "Selector table loaded");

    let sink = HttpSink::new(config.notify_url.clone(), config.endpoint_mode)?;
    let dispatcher = NotificationDispatcher::new(Arc::new(sink), config.dispatcher_config());

    let shutdown = CancellationToken::new();
    let mut subscriptions: JoinSet<(String, Result<SubscriptionStats, SubscriptionError>)> = JoinSet::new();

    for kind in config.subscriptions.kinds() {
        let manager = SubscriptionManager::new(
            kind.name(),
            kind,
            ProviderFeed::new(endpoint.clone()),
            classifier.clone(),
            dispatcher.clone(),
            config.subscription_config(),
            shutdown.child_token(),
        );
        subscriptions.spawn(async move {
            let name = manager.name().to_string();
            (name, manager.run().await)
        });
    }

    tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("Shutdown requested");
        }
        Some(finished) = subscriptions.join_next() => {
            // One subscription ended on its own; stop the rest
            log_subscription_result(finished);
        }
    }

    shutdown.cancel();
    while let Some(finished) = subscriptions.join_next().await {
        log_subscription_result(finished);
    }

    let report = dispatcher.drain(config.shutdown_grace()).await;
    tracing::info!(
        delivered = dispatcher.delivered(),
        failed = dispatcher.failed(),
        aborted = report.aborted,
        "Watcher stopped"
    );

    Ok(())
}

fn log_subscription_result(
    finished: Result<(String, Result<SubscriptionStats, SubscriptionError>), tokio::task::JoinError>,
) {
    match finished {
        Ok((name, Ok(stats))) => tracing::info!(subscription = %name, ?stats, "Subscription finished"),
        Ok((name, Err(e))) => tracing::error!(subscription = %name, error = %e, "Subscription failed"),
        Err(e) => tracing::error!(error = %e, "Subscription task panicked"),
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Could not install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
