use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::watch;

use neural_trade::broker::nats::NatsConnector;
use neural_trade::config::{FetcherSettings, PredictSettings, StageSettings};
use neural_trade::consumer::{ConsumerService, ServiceConfig};
use neural_trade::features::FeatureTransform;
use neural_trade::inference::{DenseModelLoader, InferenceEngine, PredictionTransform};
use neural_trade::model_sync::{ModelSync, SyncConfig, WATCH_POLL_TIMEOUT};
use neural_trade::producer::{KrakenClient, Producer, ProducerConfig};
use neural_trade::scheduler::Scheduler;
use neural_trade::{health, telemetry};

#[derive(Parser)]
#[command(name = "neural-trade", version, about = "Market-data pipeline services over NATS JetStream")]
struct Cli {
    /// Default tracing filter when RUST_LOG is unset.
    #[arg(long, env = "LOG_FILTER", default_value = "info")]
    log_filter: String,

    #[arg(long, env = "METRICS_PORT", default_value_t = 9000)]
    metrics_port: u16,

    #[command(subcommand)]
    role: Role,
}

#[derive(Subcommand)]
enum Role {
    /// Fetch OHLC candles on a schedule and publish them raw.
    Fetcher,
    /// Derive features from raw candles.
    Features,
    /// Run ensemble predictions on feature rows, syncing models from the bucket.
    Predict,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok(); // load .env

    let cli = Cli::parse();
    telemetry::init_tracing(&cli.log_filter);
    telemetry::init_metrics(cli.metrics_port)?;

    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("shutdown signal received");
        let _ = tx.send(true);
    });

    let result = match cli.role {
        Role::Fetcher => run_fetcher(rx).await,
        Role::Features => run_features(rx).await,
        Role::Predict => run_predict(rx).await,
    };
    if let Err(e) = &result {
        tracing::error!(error = %format!("{e:#}"), "service exited with error");
    }
    tracing::info!("main exiting");
    result
}

async fn run_fetcher(shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
    let settings = FetcherSettings::from_env()?;
    let connector = NatsConnector::new(&settings.nats_url);
    let scheduler = Scheduler::new(settings.interval);
    let source = Arc::new(KrakenClient::new(&settings.kraken_url)?);
    let producer = Producer::new(
        ProducerConfig {
            pairs: settings.pairs.clone(),
            raw_subject: settings.raw_subject.clone(),
            source_offset: settings.source_offset,
        },
        source,
        scheduler.clone(),
    );
    producer.start(&connector).await.context("failed to start producer")?;

    let schedule = async {
        scheduler.start(shutdown.clone()).await;
        producer.shutdown().await;
        Ok::<_, anyhow::Error>(())
    };
    tokio::try_join!(schedule, health::serve(settings.port, shutdown.clone()))?;
    Ok(())
}

fn service_config(settings: &StageSettings) -> ServiceConfig {
    ServiceConfig {
        stream: settings.stream_name.clone(),
        consumer: settings.consumer_name.clone(),
        source_filter: settings.source_filter.clone(),
        destination: settings.destination.clone(),
        fetch_timeout: settings.fetch_timeout,
    }
}

async fn run_features(shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
    let settings = StageSettings::features_from_env()?;
    let connector = NatsConnector::new(&settings.nats_url);
    let service = ConsumerService::new(service_config(&settings), Arc::new(FeatureTransform));

    tokio::try_join!(
        service.run(&connector, shutdown.clone()),
        health::serve(settings.port, shutdown.clone()),
    )?;
    Ok(())
}

async fn run_predict(shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
    let settings = PredictSettings::from_env()?;
    let connector = NatsConnector::new(&settings.stage.nats_url);
    let engine = InferenceEngine::new(&settings.model_cache_dir, Arc::new(DenseModelLoader));
    let service = ConsumerService::new(
        service_config(&settings.stage),
        Arc::new(PredictionTransform::new(engine)),
    );
    let sync = ModelSync::new(SyncConfig {
        bucket: settings.model_storage.clone(),
        cache_dir: settings.model_cache_dir.clone(),
        run_watcher: settings.run_model_watcher,
        poll_timeout: WATCH_POLL_TIMEOUT,
    });

    let models = async {
        sync.watch(&connector, shutdown.clone()).await.context("model sync failed")?;
        Ok::<_, anyhow::Error>(())
    };
    tokio::try_join!(
        models,
        service.run(&connector, shutdown.clone()),
        health::serve(settings.stage.port, shutdown.clone()),
    )?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
